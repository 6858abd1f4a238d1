use std::ops::RangeInclusive;

use crate::data::SortedIndex;
use crate::error::{LabelError, LabelResult};
use crate::events::ResolvedEvent;
use crate::parallel::{Molecule, ParallelExecutor};

/// Concurrency counts over a contiguous run of index positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageSlice {
    /// Index position of `counts[0]`.
    pub offset: usize,
    pub counts: Vec<u32>,
}

/// Index positions covered by an event, `[start, end]` inclusive. A missing
/// end runs to the last index timestamp.
fn event_span(index: &SortedIndex, event: &ResolvedEvent) -> LabelResult<RangeInclusive<usize>> {
    let start = index.position_of(event.start).ok_or_else(|| {
        LabelError::data(format!(
            "event start {} is not on the price index",
            event.start.to_rfc3339()
        ))
    })?;
    let end = match event.end {
        Some(end) => index.last_at_or_before(end).ok_or_else(|| {
            LabelError::data(format!("event end {} precedes the index", end.to_rfc3339()))
        })?,
        None => index.len().saturating_sub(1),
    };
    if end < start {
        return Err(LabelError::data(format!(
            "event ending {} before its start {}",
            index.get(end).map(|ts| ts.to_rfc3339()).unwrap_or_default(),
            event.start.to_rfc3339()
        )));
    }
    Ok(start..=end)
}

/// Count, for each position of the molecule's range, how many events of the
/// full set are alive there.
///
/// The range starts at the molecule's first event and ends at the furthest
/// end of any event starting at or before the molecule's last event, so the
/// ranges of consecutive molecules never leave a gap.
pub fn concurrency_for_molecule(
    index: &SortedIndex,
    spans: &[RangeInclusive<usize>],
    molecule: &Molecule,
) -> LabelResult<CoverageSlice> {
    let Some(first) = spans.get(molecule.range.start) else {
        return Ok(CoverageSlice {
            offset: 0,
            counts: Vec::new(),
        });
    };
    let lo = *first.start();
    let hi = spans[..molecule.range.end]
        .iter()
        .map(|span| *span.end())
        .max()
        .unwrap_or(lo)
        .min(index.len().saturating_sub(1));

    // difference array over lo..=hi, one extra slot for the closing edge
    let mut delta = vec![0i64; hi - lo + 2];
    for span in spans {
        let (s, e) = (*span.start(), *span.end());
        if e < lo || s > hi {
            continue;
        }
        delta[s.max(lo) - lo] += 1;
        delta[e.min(hi) - lo + 1] -= 1;
    }
    let mut running = 0i64;
    let counts = delta[..delta.len() - 1]
        .iter()
        .map(|d| {
            running += d;
            running as u32
        })
        .collect();
    Ok(CoverageSlice { offset: lo, counts })
}

/// Dense concurrency count aligned with `index`; positions no event covers
/// hold zero.
pub fn num_co_events(
    index: &SortedIndex,
    events: &[ResolvedEvent],
    executor: &ParallelExecutor,
) -> LabelResult<Vec<u32>> {
    let spans = events
        .iter()
        .map(|event| event_span(index, event))
        .collect::<LabelResult<Vec<_>>>()?;
    let slices = executor.map_molecules(spans.len(), |molecule| {
        Ok(vec![concurrency_for_molecule(index, &spans, molecule)?])
    })?;

    let mut dense = vec![0u32; index.len()];
    for slice in slices {
        let end = slice.offset + slice.counts.len();
        dense[slice.offset..end].copy_from_slice(&slice.counts);
    }
    Ok(dense)
}

/// Average uniqueness per event: `1 / mean(count over [start, end])`.
pub fn average_uniqueness(
    index: &SortedIndex,
    events: &[ResolvedEvent],
    counts: &[u32],
    executor: &ParallelExecutor,
) -> LabelResult<Vec<f64>> {
    if counts.len() != index.len() {
        return Err(LabelError::data(format!(
            "{} concurrency counts for an index of {}",
            counts.len(),
            index.len()
        )));
    }
    executor.map_indexed(events.len(), |molecule| {
        molecule
            .slice(events)
            .iter()
            .map(|event| {
                let span = event_span(index, event)?;
                let window = &counts[span];
                let mean =
                    window.iter().map(|c| f64::from(*c)).sum::<f64>() / window.len() as f64;
                if !mean.is_finite() || mean <= 0.0 {
                    return Err(LabelError::numeric(format!(
                        "mean concurrency {mean} for event starting {}",
                        event.start.to_rfc3339()
                    )));
                }
                Ok(1.0 / mean)
            })
            .collect()
    })
}

/// Uniqueness rescaled so the weights sum to the number of events.
pub fn sample_weights(uniqueness: &[f64]) -> LabelResult<Vec<f64>> {
    if uniqueness.is_empty() {
        return Ok(Vec::new());
    }
    let total: f64 = uniqueness.iter().sum();
    if !total.is_finite() || total <= 0.0 {
        return Err(LabelError::numeric(format!(
            "cannot normalise weights with total uniqueness {total}"
        )));
    }
    let scale = uniqueness.len() as f64 / total;
    Ok(uniqueness.iter().map(|u| u * scale).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::ExitKind;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn day(d: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(d)
    }

    fn index(n: i64) -> SortedIndex {
        SortedIndex::new((0..n).map(day).collect()).unwrap()
    }

    fn event(start: i64, end: Option<i64>) -> ResolvedEvent {
        ResolvedEvent {
            start: day(start),
            end: end.map(day),
            target: 0.01,
            side: None,
            exit: ExitKind::VerticalBarrier,
        }
    }

    fn brute_force(n: usize, spans: &[(usize, usize)]) -> Vec<u32> {
        (0..n)
            .map(|t| spans.iter().filter(|(s, e)| *s <= t && t <= *e).count() as u32)
            .collect()
    }

    #[test]
    fn overlapping_pair_shares_uniqueness() {
        let idx = index(4);
        let events = [event(0, Some(2)), event(1, Some(3))];
        let executor = ParallelExecutor::new(2, 1).unwrap();
        let counts = num_co_events(&idx, &events, &executor).unwrap();
        assert_eq!(counts, vec![1, 2, 2, 1]);
        let uniqueness = average_uniqueness(&idx, &events, &counts, &executor).unwrap();
        for u in uniqueness {
            assert!((u - 0.6).abs() < 1e-12);
        }
    }

    #[test]
    fn long_event_is_counted_between_later_molecules() {
        let idx = index(10);
        let events = [event(0, Some(9)), event(1, Some(2)), event(5, Some(6))];
        let executor = ParallelExecutor::new(3, 1).unwrap();
        let counts = num_co_events(&idx, &events, &executor).unwrap();
        assert_eq!(counts, brute_force(10, &[(0, 9), (1, 2), (5, 6)]));
    }

    #[test]
    fn open_ended_event_runs_to_last_timestamp() {
        let idx = index(5);
        let executor = ParallelExecutor::new(1, 1).unwrap();
        let counts = num_co_events(&idx, &[event(2, None)], &executor).unwrap();
        assert_eq!(counts, vec![0, 0, 1, 1, 1]);
    }

    #[test]
    fn zero_counts_are_a_numeric_domain_error() {
        let idx = index(3);
        let executor = ParallelExecutor::new(1, 1).unwrap();
        let err = average_uniqueness(&idx, &[event(0, Some(1))], &[0, 0, 0], &executor)
            .unwrap_err();
        assert!(matches!(err, LabelError::NumericDomain(_)));
    }

    #[test]
    fn weights_sum_to_event_count() {
        let weights = sample_weights(&[1.0, 0.5, 0.5]).unwrap();
        assert!((weights.iter().sum::<f64>() - 3.0).abs() < 1e-12);
        assert!((weights[0] - 1.5).abs() < 1e-12);
        assert!(sample_weights(&[]).unwrap().is_empty());
    }
}
