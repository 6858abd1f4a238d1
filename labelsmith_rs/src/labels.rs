use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::barrier::{ExitKind, Side};
use crate::data::PriceSeries;
use crate::error::{LabelError, LabelResult};
use crate::events::ResolvedEvent;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Label {
    pub event_start: DateTime<Utc>,
    pub event_end: DateTime<Utc>,
    /// Realised return, already multiplied by the side when one is known.
    pub ret: f64,
    /// `{-1, 0, 1}` without a side; `{0, 1}` (take the bet or not) with one.
    pub bin: i8,
    pub side: Option<Side>,
}

/// Label every resolved event. Unresolved events have no exit price and are
/// skipped.
pub fn get_bins(prices: &PriceSeries, events: &[ResolvedEvent]) -> LabelResult<Vec<Label>> {
    events
        .iter()
        .filter_map(|event| event.end.map(|end| (event, end)))
        .map(|(event, end)| {
            let entry = price_at(prices, event.start)?;
            let exit = price_at(prices, end)?;
            let raw = exit / entry - 1.0;
            let (ret, bin) = match event.side {
                Some(side) => {
                    let ret = raw * side.sign();
                    (ret, if ret <= 0.0 { 0 } else { 1 })
                }
                None => (raw, sign_bin(raw)),
            };
            Ok(Label {
                event_start: event.start,
                event_end: end,
                ret,
                bin,
                side: event.side,
            })
        })
        .collect()
}

fn price_at(prices: &PriceSeries, ts: DateTime<Utc>) -> LabelResult<f64> {
    prices.price_at(ts).ok_or_else(|| {
        LabelError::data(format!("no price at event timestamp {}", ts.to_rfc3339()))
    })
}

fn sign_bin(ret: f64) -> i8 {
    if ret > 0.0 {
        1
    } else if ret < 0.0 {
        -1
    } else {
        0
    }
}

/// Repeatedly drop the rarest label class while its share is at or below
/// `min_pct` and more than two classes remain.
pub fn drop_rare_labels(mut labels: Vec<Label>, min_pct: f64) -> Vec<Label> {
    loop {
        let counts = labels.iter().map(|label| label.bin).counts();
        if counts.len() < 3 {
            break;
        }
        let total = labels.len() as f64;
        // ties go to the lowest bin so repeated runs drop the same class
        let Some((&rarest, &count)) = counts
            .iter()
            .min_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(b.0)))
        else {
            break;
        };
        let share = count as f64 / total;
        if share > min_pct {
            break;
        }
        info!(bin = rarest, share, "dropping rare label class");
        labels.retain(|label| label.bin != rarest);
    }
    labels
}

/// Per-run counts reported at the end of labeling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSummary {
    pub events: usize,
    pub profit_take: usize,
    pub stop_loss: usize,
    pub vertical_barrier: usize,
    pub unresolved: usize,
    pub labels: usize,
    pub bin_negative: usize,
    pub bin_zero: usize,
    pub bin_positive: usize,
}

impl LabelSummary {
    pub fn new(events: &[ResolvedEvent], labels: &[Label]) -> Self {
        let mut summary = Self {
            events: events.len(),
            labels: labels.len(),
            ..Self::default()
        };
        for event in events {
            match event.exit {
                ExitKind::ProfitTake => summary.profit_take += 1,
                ExitKind::StopLoss => summary.stop_loss += 1,
                ExitKind::VerticalBarrier => summary.vertical_barrier += 1,
                ExitKind::Unresolved => summary.unresolved += 1,
            }
        }
        for label in labels {
            match label.bin {
                b if b < 0 => summary.bin_negative += 1,
                0 => summary.bin_zero += 1,
                _ => summary.bin_positive += 1,
            }
        }
        summary
    }

    pub fn log(&self) {
        info!(
            events = self.events,
            profit_take = self.profit_take,
            stop_loss = self.stop_loss,
            vertical_barrier = self.vertical_barrier,
            unresolved = self.unresolved,
            labels = self.labels,
            bin_negative = self.bin_negative,
            bin_zero = self.bin_zero,
            bin_positive = self.bin_positive,
            "label summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn day(d: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(d)
    }

    fn resolved(start: i64, end: Option<i64>, side: Option<Side>) -> ResolvedEvent {
        ResolvedEvent {
            start: day(start),
            end: end.map(day),
            target: 0.01,
            side,
            exit: if end.is_some() {
                ExitKind::VerticalBarrier
            } else {
                ExitKind::Unresolved
            },
        }
    }

    fn label(bin: i8) -> Label {
        Label {
            event_start: day(0),
            event_end: day(1),
            ret: bin as f64,
            bin,
            side: None,
        }
    }

    #[test]
    fn meta_labels_use_side_adjusted_return() {
        let prices =
            PriceSeries::from_pairs(vec![(day(0), 100.0), (day(1), 95.0), (day(2), 100.0)])
                .unwrap();
        let events = [
            resolved(0, Some(1), Some(Side::Short)),
            resolved(0, Some(1), Some(Side::Long)),
            resolved(0, Some(2), Some(Side::Long)),
        ];
        let labels = get_bins(&prices, &events).unwrap();
        assert_eq!(labels.iter().map(|l| l.bin).collect::<Vec<_>>(), vec![1, 0, 0]);
        assert!((labels[0].ret - 0.05).abs() < 1e-12);
    }

    #[test]
    fn unresolved_events_are_skipped() {
        let prices = PriceSeries::from_pairs(vec![(day(0), 100.0), (day(1), 101.0)]).unwrap();
        let labels = get_bins(&prices, &[resolved(0, None, None), resolved(0, Some(1), None)])
            .unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].bin, 1);
    }

    #[test]
    fn rare_classes_are_dropped_until_two_remain() {
        let mut labels: Vec<Label> = std::iter::repeat(label(1)).take(10).collect();
        labels.extend(std::iter::repeat(label(-1)).take(8));
        labels.push(label(0));
        let kept = drop_rare_labels(labels.clone(), 0.1);
        assert_eq!(kept.len(), 18);
        assert!(kept.iter().all(|l| l.bin != 0));

        // share above the floor keeps all three classes
        let kept = drop_rare_labels(labels, 0.01);
        assert_eq!(kept.len(), 19);
    }

    #[test]
    fn summary_counts_exits_and_bins() {
        let events = [resolved(0, Some(1), None), resolved(0, None, None)];
        let summary = LabelSummary::new(&events, &[label(-1)]);
        assert_eq!(summary.vertical_barrier, 1);
        assert_eq!(summary.unresolved, 1);
        assert_eq!(summary.bin_negative, 1);
        assert_eq!(summary.labels, 1);
    }
}
