use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::barrier::{ExitKind, Side};
use crate::config::{LabelConfig, SideMode, ValidatedConfig};
use crate::cusum::{detect_events, event_timestamps, CusumEvent, Threshold};
use crate::data::{PriceSeries, TimeSeries};
use crate::error::{LabelError, LabelResult};
use crate::events::{add_vertical_barriers, get_events, EventRequest, ResolvedEvent};
use crate::labels::{drop_rare_labels, get_bins, Label, LabelSummary};
use crate::parallel::ParallelExecutor;
use crate::volatility::daily_volatility;
use crate::weights::{average_uniqueness, num_co_events, sample_weights};

/// One row of the labeled training set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LabeledEvent {
    pub event_start: DateTime<Utc>,
    pub event_end: DateTime<Utc>,
    pub exit: ExitKind,
    pub target: f64,
    pub side: Option<Side>,
    pub ret: f64,
    pub bin: i8,
    pub uniqueness: f64,
    pub sample_weight: f64,
}

#[derive(Debug, Clone)]
pub struct LabelingOutput {
    pub volatility: TimeSeries,
    pub cusum_events: Vec<CusumEvent>,
    pub resolved: Vec<ResolvedEvent>,
    pub labels: Vec<Label>,
    /// Dense concurrency count aligned with the price index.
    pub concurrency: Vec<u32>,
    pub rows: Vec<LabeledEvent>,
    pub summary: LabelSummary,
}

/// End-to-end labeling run: volatility, CUSUM sampling, barrier resolution,
/// labels and uniqueness weights.
///
/// The configuration is validated and the worker pool built once, in
/// [`LabelingPipeline::new`]; `run` can then be called on any number of
/// series.
#[derive(Debug)]
pub struct LabelingPipeline {
    config: ValidatedConfig,
    executor: ParallelExecutor,
}

impl LabelingPipeline {
    pub fn new(config: LabelConfig) -> LabelResult<Self> {
        let config = config.validate()?;
        let executor = ParallelExecutor::new(config.workers(), config.batch_multiplier())?;
        Ok(Self { config, executor })
    }

    pub fn config(&self) -> &ValidatedConfig {
        &self.config
    }

    pub fn run(
        &self,
        prices: &PriceSeries,
        sides: Option<&TimeSeries>,
    ) -> LabelResult<LabelingOutput> {
        let started = Instant::now();
        let config = &self.config;

        let volatility = daily_volatility(prices, config.span(), config.vol_lookback())?;
        let threshold = Threshold::Series(volatility.scaled(config.threshold_multiplier()));
        let cusum_events = detect_events(
            prices,
            &threshold,
            config.cusum_mode(),
            config.reset_after_trigger(),
        )?;
        info!(
            rows = prices.len(),
            volatility_points = volatility.len(),
            events = cusum_events.len(),
            "cusum sampling complete"
        );

        let timestamps = event_timestamps(&cusum_events);
        let vertical_barriers = config.vertical_barrier().map(|horizon| {
            add_vertical_barriers(
                prices.index(),
                &timestamps,
                horizon,
                config.barrier_boundary(),
            )
        });
        let event_sides = self.event_sides(&cusum_events, sides)?;
        let resolved = get_events(
            prices,
            EventRequest {
                timestamps: &timestamps,
                target: &volatility,
                vertical_barriers: vertical_barriers.as_deref(),
                sides: event_sides.as_deref(),
            },
            config,
            &self.executor,
        )?;

        let mut labels = get_bins(prices, &resolved)?;
        if let Some(min_pct) = config.min_label_pct() {
            labels = drop_rare_labels(labels, min_pct);
        }

        let concurrency = num_co_events(prices.index(), &resolved, &self.executor)?;
        let uniqueness =
            average_uniqueness(prices.index(), &resolved, &concurrency, &self.executor)?;
        let rows = join_rows(&resolved, &labels, &uniqueness)?;

        let summary = LabelSummary::new(&resolved, &labels);
        summary.log();
        info!(
            rows = rows.len(),
            max_concurrency = concurrency.iter().copied().max().unwrap_or(0),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "labeling run complete"
        );

        Ok(LabelingOutput {
            volatility,
            cusum_events,
            resolved,
            labels,
            concurrency,
            rows,
            summary,
        })
    }

    fn event_sides(
        &self,
        events: &[CusumEvent],
        sides: Option<&TimeSeries>,
    ) -> LabelResult<Option<Vec<Option<Side>>>> {
        match self.config.side_mode() {
            SideMode::Unknown => {
                if sides.is_some() {
                    warn!("side column ignored: side mode is unknown");
                }
                Ok(None)
            }
            SideMode::Known => {
                let sides = sides.ok_or_else(|| {
                    LabelError::config("side mode `known` requires a side column")
                })?;
                Ok(Some(
                    events
                        .iter()
                        .map(|event| sides.value_at(event.timestamp).and_then(Side::from_value))
                        .collect(),
                ))
            }
            SideMode::CusumDirection => Ok(Some(
                events
                    .iter()
                    .map(|event| Some(event.direction.side()))
                    .collect(),
            )),
        }
    }
}

/// Attach uniqueness and normalised weights to each label. Weights are
/// normalised over the labeled rows so they sum to the row count.
fn join_rows(
    resolved: &[ResolvedEvent],
    labels: &[Label],
    uniqueness: &[f64],
) -> LabelResult<Vec<LabeledEvent>> {
    let matched = labels
        .iter()
        .map(|label| {
            let pos = resolved
                .binary_search_by_key(&label.event_start, |event| event.start)
                .map_err(|_| {
                    LabelError::data(format!(
                        "label at {} has no resolved event",
                        label.event_start.to_rfc3339()
                    ))
                })?;
            Ok((label, &resolved[pos], uniqueness[pos]))
        })
        .collect::<LabelResult<Vec<_>>>()?;
    let label_uniqueness: Vec<f64> = matched.iter().map(|(_, _, u)| *u).collect();
    let weights = sample_weights(&label_uniqueness)?;

    Ok(matched
        .into_iter()
        .zip(weights)
        .map(|((label, event, uniqueness), sample_weight)| LabeledEvent {
            event_start: label.event_start,
            event_end: label.event_end,
            exit: event.exit,
            target: event.target,
            side: label.side,
            ret: label.ret,
            bin: label.bin,
            uniqueness,
            sample_weight,
        })
        .collect())
}
