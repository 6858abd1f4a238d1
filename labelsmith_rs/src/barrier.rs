use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::PriceSeries;
use crate::error::{LabelError, LabelResult};
use crate::parallel::Molecule;

/// Bet direction of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// Map a signed side column value; zero and NaN carry no side.
    pub fn from_value(value: f64) -> Option<Self> {
        if value > 0.0 {
            Some(Self::Long)
        } else if value < 0.0 {
            Some(Self::Short)
        } else {
            None
        }
    }
}

/// Horizontal barrier widths as multiples of the event target.
/// A multiple of zero disables that barrier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BarrierMultiples {
    pub profit_take: f64,
    pub stop_loss: f64,
}

impl BarrierMultiples {
    pub fn symmetric(width: f64) -> Self {
        Self {
            profit_take: width,
            stop_loss: width,
        }
    }

    pub fn profit_level(&self, target: f64) -> Option<f64> {
        (self.profit_take > 0.0).then(|| self.profit_take * target)
    }

    pub fn stop_level(&self, target: f64) -> Option<f64> {
        (self.stop_loss > 0.0).then(|| -self.stop_loss * target)
    }
}

/// One scheduled event handed to the barrier evaluator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventSpec {
    pub start: DateTime<Utc>,
    /// `None` leaves the path open until the last price.
    pub vertical_barrier: Option<DateTime<Utc>>,
    pub target: f64,
    pub side: Option<Side>,
}

impl EventSpec {
    pub fn check_barrier_order(&self) -> LabelResult<()> {
        match self.vertical_barrier {
            Some(barrier) if barrier < self.start => Err(LabelError::data(format!(
                "vertical barrier {} precedes event start {}",
                barrier.to_rfc3339(),
                self.start.to_rfc3339()
            ))),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    ProfitTake,
    StopLoss,
    VerticalBarrier,
    Unresolved,
}

impl ExitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProfitTake => "profit_take",
            Self::StopLoss => "stop_loss",
            Self::VerticalBarrier => "vertical_barrier",
            Self::Unresolved => "unresolved",
        }
    }
}

/// First-touch timestamps of each barrier for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BarrierTouches {
    pub profit_take: Option<DateTime<Utc>>,
    pub stop_loss: Option<DateTime<Utc>>,
    pub vertical_barrier: Option<DateTime<Utc>>,
}

impl BarrierTouches {
    /// Earliest touched barrier. A horizontal touch on the same bar as the
    /// vertical barrier wins.
    pub fn resolve(&self) -> (Option<DateTime<Utc>>, ExitKind) {
        let candidates = [
            (self.stop_loss, ExitKind::StopLoss),
            (self.profit_take, ExitKind::ProfitTake),
            (self.vertical_barrier, ExitKind::VerticalBarrier),
        ];
        candidates
            .into_iter()
            .filter_map(|(ts, kind)| ts.map(|ts| (ts, kind)))
            .fold(None, |best: Option<(DateTime<Utc>, ExitKind)>, (ts, kind)| match best {
                Some((best_ts, _)) if best_ts <= ts => best,
                _ => Some((ts, kind)),
            })
            .map_or((None, ExitKind::Unresolved), |(ts, kind)| (Some(ts), kind))
    }
}

/// Scan the forward price path of one event for its first horizontal touches.
///
/// The path runs from the event start through the vertical barrier (or the
/// last price when there is none). Returns are `side * (P / P0 - 1)`.
pub fn evaluate_event(
    prices: &PriceSeries,
    event: &EventSpec,
    multiples: &BarrierMultiples,
) -> LabelResult<BarrierTouches> {
    event.check_barrier_order()?;
    let index = prices.index();
    let start_pos = index.position_of(event.start).ok_or_else(|| {
        LabelError::data(format!(
            "event start {} is not on the price index",
            event.start.to_rfc3339()
        ))
    })?;
    let mut touches = BarrierTouches {
        vertical_barrier: event.vertical_barrier,
        ..BarrierTouches::default()
    };
    let path_end = match event.vertical_barrier.or_else(|| index.last()) {
        Some(end) => end,
        None => return Ok(touches),
    };
    let Some(path) = index.range_positions(event.start, path_end) else {
        return Ok(touches);
    };

    let sign = event.side.map_or(1.0, Side::sign);
    let entry = prices.price(start_pos);
    let profit_level = multiples.profit_level(event.target);
    let stop_level = multiples.stop_level(event.target);

    for pos in path {
        let ret = sign * (prices.price(pos) / entry - 1.0);
        if touches.profit_take.is_none() && profit_level.is_some_and(|level| ret > level) {
            touches.profit_take = Some(prices.timestamp(pos));
        }
        if touches.stop_loss.is_none() && stop_level.is_some_and(|level| ret < level) {
            touches.stop_loss = Some(prices.timestamp(pos));
        }
        if touches.profit_take.is_some() && touches.stop_loss.is_some() {
            break;
        }
    }
    Ok(touches)
}

/// Evaluate the events of one molecule, in order.
pub fn apply_pt_sl_on_t1(
    prices: &PriceSeries,
    events: &[EventSpec],
    multiples: &BarrierMultiples,
    molecule: &Molecule,
) -> LabelResult<Vec<BarrierTouches>> {
    molecule
        .slice(events)
        .iter()
        .map(|event| evaluate_event(prices, event, multiples))
        .collect()
}
