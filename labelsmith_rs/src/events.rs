use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::barrier::{apply_pt_sl_on_t1, EventSpec, ExitKind, Side};
use crate::config::{BarrierBoundary, ValidatedConfig};
use crate::data::{PriceSeries, SortedIndex, TimeSeries};
use crate::error::{LabelError, LabelResult};
use crate::parallel::ParallelExecutor;

/// Time limit for each event start: the first bar at (inclusive) or after
/// (exclusive) `start + horizon`. Events whose horizon runs past the last
/// bar stay open-ended.
pub fn add_vertical_barriers(
    index: &SortedIndex,
    event_times: &[DateTime<Utc>],
    horizon: Duration,
    boundary: BarrierBoundary,
) -> Vec<Option<DateTime<Utc>>> {
    event_times
        .iter()
        .map(|&start| {
            let limit = start + horizon;
            let pos = match boundary {
                BarrierBoundary::Inclusive => index.first_at_or_after(limit),
                BarrierBoundary::Exclusive => index.first_after(limit),
            };
            pos.and_then(|pos| index.get(pos))
        })
        .collect()
}

/// Inputs of one scheduling call. Optional columns are aligned with
/// `timestamps`, one entry per candidate event.
#[derive(Debug, Clone, Copy)]
pub struct EventRequest<'a> {
    pub timestamps: &'a [DateTime<Utc>],
    /// Per-event target return; looked up as of each event start.
    pub target: &'a TimeSeries,
    pub vertical_barriers: Option<&'a [Option<DateTime<Utc>>]>,
    pub sides: Option<&'a [Option<Side>]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResolvedEvent {
    pub start: DateTime<Utc>,
    /// First barrier touched; `None` when nothing was touched and no time
    /// limit applies.
    pub end: Option<DateTime<Utc>>,
    pub target: f64,
    /// Only populated when the side is known.
    pub side: Option<Side>,
    pub exit: ExitKind,
}

#[derive(Debug, Default)]
struct Dropped {
    no_target: usize,
    below_min_ret: usize,
    no_side: usize,
}

/// Filter candidate events, attach barriers and resolve each event's first
/// touch on the executor's pool.
pub fn get_events(
    prices: &PriceSeries,
    request: EventRequest<'_>,
    config: &ValidatedConfig,
    executor: &ParallelExecutor,
) -> LabelResult<Vec<ResolvedEvent>> {
    let started = Instant::now();
    check_request(prices, &request)?;
    let side_mode = config.side_mode();
    if side_mode.is_known() && request.sides.is_none() {
        return Err(LabelError::config(
            "side-known labeling requires a side for each event",
        ));
    }

    let mut dropped = Dropped::default();
    let mut specs = Vec::with_capacity(request.timestamps.len());
    for (i, &start) in request.timestamps.iter().enumerate() {
        let target = match request.target.value_as_of(start) {
            Some(value) if value.is_finite() => value,
            _ => {
                dropped.no_target += 1;
                continue;
            }
        };
        if target <= config.min_ret() {
            dropped.below_min_ret += 1;
            continue;
        }
        let side = if side_mode.is_known() {
            match request.sides.and_then(|sides| sides[i]) {
                Some(side) => Some(side),
                None => {
                    dropped.no_side += 1;
                    continue;
                }
            }
        } else {
            None
        };
        let vertical_barrier = request
            .vertical_barriers
            .and_then(|barriers| barriers[i]);
        specs.push(EventSpec {
            start,
            vertical_barrier,
            target,
            side,
        });
    }

    if dropped.no_target + dropped.below_min_ret + dropped.no_side > 0 {
        warn!(
            no_target = dropped.no_target,
            below_min_ret = dropped.below_min_ret,
            no_side = dropped.no_side,
            "dropped candidate events"
        );
    }
    if specs.is_empty() {
        info!(candidates = request.timestamps.len(), "no events survived filtering");
        return Ok(Vec::new());
    }

    let multiples = config.multiples();
    let touches = executor.map_indexed(specs.len(), |molecule| {
        apply_pt_sl_on_t1(prices, &specs, &multiples, molecule)
    })?;

    let resolved: Vec<ResolvedEvent> = specs
        .iter()
        .zip(touches.iter())
        .map(|(spec, touches)| {
            let (end, exit) = touches.resolve();
            ResolvedEvent {
                start: spec.start,
                end,
                target: spec.target,
                side: spec.side,
                exit,
            }
        })
        .collect();

    info!(
        candidates = request.timestamps.len(),
        events = resolved.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "events resolved"
    );
    Ok(resolved)
}

fn check_request(prices: &PriceSeries, request: &EventRequest<'_>) -> LabelResult<()> {
    let n = request.timestamps.len();
    if let Some(barriers) = request.vertical_barriers {
        if barriers.len() != n {
            return Err(LabelError::data(format!(
                "{} vertical barriers for {n} events",
                barriers.len()
            )));
        }
    }
    if let Some(sides) = request.sides {
        if sides.len() != n {
            return Err(LabelError::data(format!("{} sides for {n} events", sides.len())));
        }
    }
    SortedIndex::new(request.timestamps.to_vec())?;

    let index = prices.index();
    for (i, &start) in request.timestamps.iter().enumerate() {
        if !index.contains(start) {
            return Err(LabelError::data(format!(
                "event start {} is not on the price index",
                start.to_rfc3339()
            )));
        }
        let barrier = request
            .vertical_barriers
            .and_then(|barriers| barriers[i]);
        if let Some(barrier) = barrier {
            if !index.contains(barrier) {
                return Err(LabelError::data(format!(
                    "vertical barrier {} is not on the price index",
                    barrier.to_rfc3339()
                )));
            }
            EventSpec {
                start,
                vertical_barrier: Some(barrier),
                target: 0.0,
                side: None,
            }
            .check_barrier_order()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LabelConfig, SideMode};
    use chrono::TimeZone;

    fn day(d: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(d)
    }

    fn index(days: &[i64]) -> SortedIndex {
        SortedIndex::new(days.iter().map(|d| day(*d)).collect()).unwrap()
    }

    #[test]
    fn vertical_barrier_boundary_modes() {
        let idx = index(&[0, 1, 2, 5, 6]);
        let starts = [day(0), day(1), day(5)];
        let inclusive =
            add_vertical_barriers(&idx, &starts, Duration::days(2), BarrierBoundary::Inclusive);
        assert_eq!(inclusive, vec![Some(day(2)), Some(day(5)), None]);
        let exclusive =
            add_vertical_barriers(&idx, &starts, Duration::days(2), BarrierBoundary::Exclusive);
        assert_eq!(exclusive, vec![Some(day(5)), Some(day(5)), None]);
    }

    #[test]
    fn side_known_without_sides_is_a_configuration_error() {
        let prices =
            PriceSeries::from_pairs((0..4).map(|d| (day(d), 100.0 + d as f64))).unwrap();
        let target = TimeSeries::from_pairs(vec![(day(0), 0.01)]).unwrap();
        let config = LabelConfig {
            side: SideMode::Known,
            ..LabelConfig::default()
        }
        .validate()
        .unwrap();
        let executor = ParallelExecutor::new(1, 1).unwrap();
        let request = EventRequest {
            timestamps: &[day(1)],
            target: &target,
            vertical_barriers: None,
            sides: None,
        };
        assert!(matches!(
            get_events(&prices, request, &config, &executor),
            Err(LabelError::Configuration(_))
        ));
    }

    #[test]
    fn barrier_off_the_index_is_a_data_error() {
        let prices =
            PriceSeries::from_pairs((0..4).map(|d| (day(d), 100.0 + d as f64))).unwrap();
        let target = TimeSeries::from_pairs(vec![(day(0), 0.01)]).unwrap();
        let config = LabelConfig::default().validate().unwrap();
        let executor = ParallelExecutor::new(1, 1).unwrap();
        let barriers = [Some(day(2) + Duration::hours(3))];
        let request = EventRequest {
            timestamps: &[day(1)],
            target: &target,
            vertical_barriers: Some(&barriers),
            sides: None,
        };
        assert!(matches!(
            get_events(&prices, request, &config, &executor),
            Err(LabelError::Data(_))
        ));
    }
}
