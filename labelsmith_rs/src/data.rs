use std::ops::RangeInclusive;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{LabelError, LabelResult};

/// Column names tried, in order, when the caller does not name the
/// timestamp column explicitly.
pub const TIMESTAMP_COLUMN_CANDIDATES: [&str; 5] =
    ["timestamp", "datetime", "time", "trade_time", "date"];

/// Strictly increasing timestamps with binary-search lookups.
///
/// Built once per series and shared by every lookup site (volatility lag,
/// threshold alignment, barrier path slicing, vertical barriers and
/// concurrency ranges).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SortedIndex {
    timestamps: Vec<DateTime<Utc>>,
}

impl SortedIndex {
    pub fn new(timestamps: Vec<DateTime<Utc>>) -> LabelResult<Self> {
        if let Some(pos) = timestamps.windows(2).position(|pair| pair[0] >= pair[1]) {
            let (prev, next) = (timestamps[pos], timestamps[pos + 1]);
            let kind = if prev == next {
                "duplicate"
            } else {
                "non-monotonic"
            };
            return Err(LabelError::data(format!(
                "{kind} timestamp at row {}: {} follows {}",
                pos + 1,
                next.to_rfc3339(),
                prev.to_rfc3339()
            )));
        }
        Ok(Self { timestamps })
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn as_slice(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn get(&self, pos: usize) -> Option<DateTime<Utc>> {
        self.timestamps.get(pos).copied()
    }

    pub fn first(&self) -> Option<DateTime<Utc>> {
        self.timestamps.first().copied()
    }

    pub fn last(&self) -> Option<DateTime<Utc>> {
        self.timestamps.last().copied()
    }

    /// Exact position of `ts`, if it is part of the index.
    pub fn position_of(&self, ts: DateTime<Utc>) -> Option<usize> {
        self.timestamps.binary_search(&ts).ok()
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.position_of(ts).is_some()
    }

    /// Position of the latest timestamp `<= ts`.
    pub fn last_at_or_before(&self, ts: DateTime<Utc>) -> Option<usize> {
        self.timestamps
            .partition_point(|candidate| *candidate <= ts)
            .checked_sub(1)
    }

    /// Position of the earliest timestamp `>= ts`.
    pub fn first_at_or_after(&self, ts: DateTime<Utc>) -> Option<usize> {
        let pos = self.timestamps.partition_point(|candidate| *candidate < ts);
        (pos < self.timestamps.len()).then_some(pos)
    }

    /// Position of the earliest timestamp `> ts`.
    pub fn first_after(&self, ts: DateTime<Utc>) -> Option<usize> {
        let pos = self.timestamps.partition_point(|candidate| *candidate <= ts);
        (pos < self.timestamps.len()).then_some(pos)
    }

    /// Positions covered by the label-inclusive slice `[start, end]`.
    ///
    /// Returns `None` when no index timestamp falls inside the interval.
    pub fn range_positions(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<RangeInclusive<usize>> {
        let lo = self.first_at_or_after(start)?;
        let hi = self.last_at_or_before(end)?;
        (lo <= hi).then_some(lo..=hi)
    }
}

/// Ordered `(timestamp, price)` observations stored column-wise.
///
/// Invariants: timestamps strictly increasing and every price finite and
/// strictly positive (returns are computed as price ratios).
#[derive(Debug, Clone, Default)]
pub struct PriceSeries {
    index: SortedIndex,
    prices: Vec<f64>,
}

impl PriceSeries {
    pub fn new(timestamps: Vec<DateTime<Utc>>, prices: Vec<f64>) -> LabelResult<Self> {
        if timestamps.len() != prices.len() {
            return Err(LabelError::data(format!(
                "price series has {} timestamps but {} prices",
                timestamps.len(),
                prices.len()
            )));
        }
        if let Some((row, price)) = prices
            .iter()
            .enumerate()
            .find(|(_, price)| !price.is_finite() || **price <= 0.0)
        {
            return Err(LabelError::data(format!(
                "price at row {row} must be finite and positive (got {price})"
            )));
        }
        let index = SortedIndex::new(timestamps)?;
        Ok(Self { index, prices })
    }

    pub fn from_pairs<I>(pairs: I) -> LabelResult<Self>
    where
        I: IntoIterator<Item = (DateTime<Utc>, f64)>,
    {
        let (timestamps, prices): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();
        Self::new(timestamps, prices)
    }

    pub fn index(&self) -> &SortedIndex {
        &self.index
    }

    pub fn prices(&self) -> &[f64] {
        &self.prices
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        self.index.as_slice()
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn timestamp(&self, pos: usize) -> DateTime<Utc> {
        self.index.as_slice()[pos]
    }

    pub fn price(&self, pos: usize) -> f64 {
        self.prices[pos]
    }

    /// Price observed exactly at `ts`.
    pub fn price_at(&self, ts: DateTime<Utc>) -> Option<f64> {
        self.index.position_of(ts).map(|pos| self.prices[pos])
    }

    /// Rows whose UTC date lies inside `window`.
    pub fn between_dates(&self, window: &DateWindow) -> Self {
        let keep = window.positions(self.index.as_slice());
        Self {
            index: SortedIndex {
                timestamps: self.index.as_slice()[keep.clone()].to_vec(),
            },
            prices: self.prices[keep].to_vec(),
        }
    }
}

/// Inclusive UTC date bounds; either side may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateWindow {
    pub fn is_open(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    fn positions(&self, timestamps: &[DateTime<Utc>]) -> std::ops::Range<usize> {
        let lo = self.start.map_or(0, |date| {
            timestamps.partition_point(|ts| ts.date_naive() < date)
        });
        let hi = self.end.map_or(timestamps.len(), |date| {
            timestamps.partition_point(|ts| ts.date_naive() <= date)
        });
        lo..hi.max(lo)
    }
}

/// Ordered `(timestamp, value)` series: volatility estimates, thresholds,
/// per-event targets, side predictions.
#[derive(Debug, Clone, Default)]
pub struct TimeSeries {
    index: SortedIndex,
    values: Vec<f64>,
}

impl TimeSeries {
    pub fn new(timestamps: Vec<DateTime<Utc>>, values: Vec<f64>) -> LabelResult<Self> {
        if timestamps.len() != values.len() {
            return Err(LabelError::data(format!(
                "series has {} timestamps but {} values",
                timestamps.len(),
                values.len()
            )));
        }
        let index = SortedIndex::new(timestamps)?;
        Ok(Self { index, values })
    }

    pub fn from_pairs<I>(pairs: I) -> LabelResult<Self>
    where
        I: IntoIterator<Item = (DateTime<Utc>, f64)>,
    {
        let (timestamps, values): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();
        Self::new(timestamps, values)
    }

    pub fn index(&self) -> &SortedIndex {
        &self.index
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DateTime<Utc>, f64)> + '_ {
        self.index
            .as_slice()
            .iter()
            .copied()
            .zip(self.values.iter().copied())
    }

    /// Value stored exactly at `ts`.
    pub fn value_at(&self, ts: DateTime<Utc>) -> Option<f64> {
        self.index.position_of(ts).map(|pos| self.values[pos])
    }

    /// Forward-filled value: the latest observation at or before `ts`.
    pub fn value_as_of(&self, ts: DateTime<Utc>) -> Option<f64> {
        self.index
            .last_at_or_before(ts)
            .map(|pos| self.values[pos])
    }

    pub fn between_dates(&self, window: &DateWindow) -> Self {
        let keep = window.positions(self.index.as_slice());
        Self {
            index: SortedIndex {
                timestamps: self.index.as_slice()[keep.clone()].to_vec(),
            },
            values: self.values[keep].to_vec(),
        }
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            index: self.index.clone(),
            values: self.values.iter().map(|value| value * factor).collect(),
        }
    }
}

/// Column mapping used when reading an OHLCV-style CSV. Recorded in the run
/// manifest since the same file yields different labels per mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceColumns {
    /// Explicit timestamp column; when `None` the first match from
    /// [`TIMESTAMP_COLUMN_CANDIDATES`] is used.
    pub timestamp: Option<String>,
    pub price: String,
    /// Optional primary-model side column (positive = long, negative = short,
    /// zero/null = no side).
    pub side: Option<String>,
}

impl Default for PriceColumns {
    fn default() -> Self {
        Self {
            timestamp: None,
            price: "close".to_string(),
            side: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedPrices {
    pub prices: PriceSeries,
    pub sides: Option<TimeSeries>,
}

pub fn load_price_csv(path: &Path, columns: &PriceColumns) -> Result<LoadedPrices> {
    let lazy = LazyCsvReader::new(path)
        .has_header(true)
        .finish()
        .with_context(|| format!("Failed to initialize CSV reader for {}", path.display()))?;
    let df = lazy
        .collect()
        .with_context(|| format!("Failed to collect price data from {}", path.display()))?;
    prices_from_frame(&df, columns)
        .with_context(|| format!("Invalid price data in {}", path.display()))
}

pub fn prices_from_frame(frame: &DataFrame, columns: &PriceColumns) -> Result<LoadedPrices> {
    let ts_name = match &columns.timestamp {
        Some(name) => name.clone(),
        None => TIMESTAMP_COLUMN_CANDIDATES
            .iter()
            .find(|name| frame.column(name).is_ok())
            .map(|name| name.to_string())
            .with_context(|| {
                format!(
                    "Missing timestamp column (expected one of: {})",
                    TIMESTAMP_COLUMN_CANDIDATES.join(", ")
                )
            })?,
    };
    let ts_series = frame
        .column(&ts_name)
        .with_context(|| format!("Missing timestamp column '{ts_name}'"))?;
    let timestamps = timestamp_values(ts_series)?;

    let price_series = frame
        .column(&columns.price)
        .with_context(|| format!("Missing price column '{}'", columns.price))?;
    let prices = series_to_f64(price_series)?;

    let sides = match &columns.side {
        Some(name) => {
            let side_series = frame
                .column(name)
                .with_context(|| format!("Missing side column '{name}'"))?;
            let raw = series_to_f64(side_series)?;
            let pairs = timestamps
                .iter()
                .zip(raw)
                .filter(|(_, value)| value.is_finite() && *value != 0.0)
                .map(|(ts, value)| (*ts, value.signum()));
            Some(TimeSeries::from_pairs(pairs)?)
        }
        None => None,
    };

    let prices = PriceSeries::new(timestamps, prices)?;
    Ok(LoadedPrices { prices, sides })
}

fn series_to_f64(series: &Series) -> Result<Vec<f64>> {
    match series.dtype() {
        DataType::Float64 => Ok(series
            .f64()
            .context("Failed to interpret as f64")?
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect()),
        DataType::Float32 => Ok(series
            .f32()
            .context("Failed to interpret as f32")?
            .into_iter()
            .map(|v| v.map(f64::from).unwrap_or(f64::NAN))
            .collect()),
        DataType::Int64 => Ok(series
            .i64()
            .context("Failed to interpret as i64")?
            .into_iter()
            .map(|v| v.map(|x| x as f64).unwrap_or(f64::NAN))
            .collect()),
        DataType::Int32 => Ok(series
            .i32()
            .context("Failed to interpret as i32")?
            .into_iter()
            .map(|v| v.map(f64::from).unwrap_or(f64::NAN))
            .collect()),
        other => Err(anyhow!(
            "Unsupported numeric dtype for {}: {other:?}",
            series.name()
        )),
    }
}

fn timestamp_values(series: &Series) -> Result<Vec<DateTime<Utc>>> {
    let mut out = Vec::with_capacity(series.len());
    match series.dtype() {
        DataType::Datetime(unit, _) => {
            let ca = series
                .datetime()
                .context("Failed to interpret timestamp column as datetime")?;
            for (row, value) in ca.into_iter().enumerate() {
                let raw = value.ok_or_else(|| anyhow!("Timestamp column is null at row {row}"))?;
                let (secs, nsecs) = match unit {
                    TimeUnit::Nanoseconds => (
                        raw.div_euclid(1_000_000_000),
                        raw.rem_euclid(1_000_000_000) as u32,
                    ),
                    TimeUnit::Microseconds => (
                        raw.div_euclid(1_000_000),
                        raw.rem_euclid(1_000_000) as u32 * 1_000,
                    ),
                    TimeUnit::Milliseconds => (
                        raw.div_euclid(1_000),
                        raw.rem_euclid(1_000) as u32 * 1_000_000,
                    ),
                };
                let ts = DateTime::<Utc>::from_timestamp(secs, nsecs)
                    .ok_or_else(|| anyhow!("Timestamp out of range at row {row}"))?;
                out.push(ts);
            }
        }
        _ => {
            // `Series::iter` walks a single chunk
            let series = series.rechunk();
            for (row, value) in series.iter().enumerate() {
                let raw = match value {
                    AnyValue::String(s) => s,
                    AnyValue::StringOwned(ref s) => s.as_str(),
                    AnyValue::Null => return Err(anyhow!("Timestamp column is null at row {row}")),
                    other => {
                        return Err(anyhow!(
                            "Timestamp column must be UTF-8 strings or datetimes (got {:?})",
                            other.dtype()
                        ));
                    }
                };
                out.push(parse_timestamp(raw)?);
            }
        }
    }
    Ok(out)
}

/// Accepts RFC3339 (`2024-01-01T00:00:00Z`), naive date-times
/// (`2024-01-01 09:30:00`, `2024-01-01T09:30:00`, interpreted as UTC) and
/// plain dates (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(naive.and_utc());
        }
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("Failed to parse timestamp '{raw}'"))?;
    Ok(date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow!("Invalid midnight for {date}"))?
        .and_utc())
}
