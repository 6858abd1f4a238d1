use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::barrier::Side;
use crate::data::{PriceSeries, TimeSeries};
use crate::error::{LabelError, LabelResult};

/// Which accumulators are allowed to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CusumMode {
    #[default]
    Both,
    PositiveOnly,
    NegativeOnly,
}

impl CusumMode {
    fn allows_up(self) -> bool {
        matches!(self, Self::Both | Self::PositiveOnly)
    }

    fn allows_down(self) -> bool {
        matches!(self, Self::Both | Self::NegativeOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDirection {
    Up,
    Down,
}

impl EventDirection {
    /// Trade side implied by the move that fired the event.
    pub fn side(self) -> Side {
        match self {
            Self::Up => Side::Long,
            Self::Down => Side::Short,
        }
    }
}

/// Running CUSUM accumulators. `s_pos >= 0` and `s_neg <= 0` at all times.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CusumState {
    pub s_pos: f64,
    pub s_neg: f64,
}

impl CusumState {
    /// Fold one price difference into the accumulators.
    ///
    /// With both sides enabled the negative condition is checked first, so a
    /// step where both accumulators cross emits a single `Down` event. With
    /// `reset` a trigger zeroes both accumulators. A missing or NaN threshold
    /// never fires.
    pub fn step(
        self,
        diff: f64,
        threshold: Option<f64>,
        mode: CusumMode,
        reset: bool,
    ) -> (Self, Option<EventDirection>) {
        let next = Self {
            s_pos: (self.s_pos + diff).max(0.0),
            s_neg: (self.s_neg + diff).min(0.0),
        };
        let Some(h) = threshold.filter(|h| !h.is_nan()) else {
            return (next, None);
        };
        let fired = if mode.allows_down() && next.s_neg < -h {
            Some(EventDirection::Down)
        } else if mode.allows_up() && next.s_pos > h {
            Some(EventDirection::Up)
        } else {
            None
        };
        match fired {
            Some(_) if reset => (Self::default(), fired),
            _ => (next, fired),
        }
    }
}

/// Trigger level: one scalar, or a time-varying series aligned to the price
/// index by forward fill.
#[derive(Debug, Clone)]
pub enum Threshold {
    Scalar(f64),
    Series(TimeSeries),
}

impl Threshold {
    fn validate(&self, prices: &PriceSeries) -> LabelResult<()> {
        match self {
            Self::Scalar(h) => {
                if !h.is_finite() || *h <= 0.0 {
                    return Err(LabelError::config(format!(
                        "CUSUM threshold must be finite and > 0 (got {h})"
                    )));
                }
            }
            Self::Series(series) => {
                if let Some(ts) = series
                    .index()
                    .as_slice()
                    .iter()
                    .find(|ts| !prices.index().contains(**ts))
                {
                    return Err(LabelError::config(format!(
                        "threshold series timestamp {} is not on the price index",
                        ts.to_rfc3339()
                    )));
                }
            }
        }
        Ok(())
    }

    fn at(&self, ts: DateTime<Utc>) -> Option<f64> {
        match self {
            Self::Scalar(h) => Some(*h),
            Self::Series(series) => series.value_as_of(ts),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CusumEvent {
    pub timestamp: DateTime<Utc>,
    /// Position on the price index.
    pub position: usize,
    pub direction: EventDirection,
}

/// Symmetric CUSUM filter over price differences.
///
/// Returns events in strictly increasing time order; the first price can
/// never be an event because it has no difference.
pub fn detect_events(
    prices: &PriceSeries,
    threshold: &Threshold,
    mode: CusumMode,
    reset_after_trigger: bool,
) -> LabelResult<Vec<CusumEvent>> {
    threshold.validate(prices)?;

    let mut events = Vec::new();
    let final_state = prices
        .prices()
        .iter()
        .enumerate()
        .tuple_windows()
        .fold(CusumState::default(), |state, ((_, prev), (pos, price))| {
            let ts = prices.timestamp(pos);
            let (state, fired) =
                state.step(price - prev, threshold.at(ts), mode, reset_after_trigger);
            if let Some(direction) = fired {
                events.push(CusumEvent {
                    timestamp: ts,
                    position: pos,
                    direction,
                });
            }
            state
        });

    debug!(
        rows = prices.len(),
        events = events.len(),
        s_pos = final_state.s_pos,
        s_neg = final_state.s_neg,
        "cusum filter complete"
    );
    Ok(events)
}

pub fn event_timestamps(events: &[CusumEvent]) -> Vec<DateTime<Utc>> {
    events.iter().map(|event| event.timestamp).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_crossing_on_one_step_fires_down_once() {
        let state = CusumState {
            s_pos: 5.0,
            s_neg: -5.0,
        };
        let (next, fired) = state.step(0.0, Some(2.0), CusumMode::Both, true);
        assert_eq!(fired, Some(EventDirection::Down));
        assert_eq!(next, CusumState::default());

        let (_, fired) = state.step(0.0, Some(2.0), CusumMode::PositiveOnly, true);
        assert_eq!(fired, Some(EventDirection::Up));
    }

    #[test]
    fn without_reset_accumulators_keep_running() {
        let (next, fired) = CusumState::default().step(3.0, Some(2.0), CusumMode::Both, false);
        assert_eq!(fired, Some(EventDirection::Up));
        assert_eq!(next.s_pos, 3.0);
        assert_eq!(next.s_neg, 0.0);
    }

    #[test]
    fn missing_threshold_never_fires() {
        let (next, fired) = CusumState::default().step(10.0, None, CusumMode::Both, true);
        assert!(fired.is_none());
        assert_eq!(next.s_pos, 10.0);
        let (_, fired) = next.step(1.0, Some(f64::NAN), CusumMode::Both, true);
        assert!(fired.is_none());
    }

    #[test]
    fn threshold_at_exact_level_does_not_fire() {
        let (_, fired) = CusumState::default().step(2.0, Some(2.0), CusumMode::Both, true);
        assert!(fired.is_none());
        let (_, fired) = CusumState::default().step(-2.0, Some(2.0), CusumMode::Both, true);
        assert!(fired.is_none());
    }

    #[test]
    fn direction_maps_to_side() {
        assert_eq!(EventDirection::Up.side(), Side::Long);
        assert_eq!(EventDirection::Down.side(), Side::Short);
    }
}
