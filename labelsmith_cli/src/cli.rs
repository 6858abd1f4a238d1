use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};

use labelsmith_rs::cusum::CusumMode;
use labelsmith_rs::{
    BarrierBoundary, DateWindow, JobConfig, LabelConfig, PriceColumns, SideMode,
};

#[derive(Parser, Debug)]
#[command(
    name = "labelsmith",
    about = "Event-driven triple-barrier labeling for price series"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sample events with a CUSUM filter and label them with triple barriers
    #[command(name = "label")]
    Label(LabelArgs),
}

#[derive(Parser, Debug)]
pub struct LabelArgs {
    /// Path to the input CSV file with a timestamp and a price column
    #[arg(long = "csv", value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
    pub csv_path: PathBuf,

    /// Output directory for labels.csv, run_manifest.json and the run log
    #[arg(long = "output-dir", value_hint = clap::ValueHint::DirPath)]
    pub output_dir: PathBuf,

    /// Timestamp column (defaults to the first of timestamp/datetime/time/trade_time/date)
    #[arg(long = "timestamp-column")]
    pub timestamp_column: Option<String>,

    /// Price column
    #[arg(long = "price-column", default_value = "close")]
    pub price_column: String,

    /// Primary-model side column (positive = long, negative = short)
    #[arg(long = "side-column")]
    pub side_column: Option<String>,

    /// EWM span of the volatility estimate
    #[arg(long, default_value_t = 100)]
    pub span: usize,

    /// CUSUM threshold as a multiple of the volatility estimate
    #[arg(long = "threshold-multiplier", default_value_t = 1.0)]
    pub threshold_multiplier: f64,

    /// Profit-taking barrier as a multiple of the event target (0 disables)
    #[arg(long = "profit-take", default_value_t = 1.0)]
    pub profit_take: f64,

    /// Stop-loss barrier as a multiple of the event target (0 disables).
    /// Ignored unless the side is known.
    #[arg(long = "stop-loss", default_value_t = 1.0)]
    pub stop_loss: f64,

    /// Time limit per event, e.g. 20d, 4h, 30m, 90s
    #[arg(long = "vertical-barrier", default_value = "20d")]
    pub vertical_barrier: String,

    /// Leave events open until a horizontal barrier or the end of the data
    #[arg(long = "no-vertical-barrier", default_value_t = false)]
    pub no_vertical_barrier: bool,

    /// Whether the vertical barrier may land exactly on start + horizon
    #[arg(long = "barrier-boundary", value_enum, default_value = "inclusive")]
    pub barrier_boundary: BoundaryValue,

    /// Drop events whose target return is at or below this floor
    #[arg(long = "min-ret", default_value_t = 0.0)]
    pub min_ret: f64,

    /// Number of worker threads (omit to use all logical cores)
    #[arg(long = "workers", alias = "n-jobs")]
    pub workers: Option<usize>,

    /// Molecules per worker
    #[arg(long = "batch-multiplier", default_value_t = 1)]
    pub batch_multiplier: usize,

    /// Which CUSUM accumulators may trigger events
    #[arg(long = "cusum-mode", value_enum, default_value = "both")]
    pub cusum_mode: CusumModeValue,

    /// Keep accumulating after a CUSUM trigger instead of resetting to zero
    #[arg(long = "no-reset", default_value_t = false)]
    pub no_reset: bool,

    /// Side handling: unknown (primary labels), known (side column) or
    /// cusum-direction (meta-labels against the CUSUM move)
    #[arg(long = "side", value_enum, default_value = "unknown")]
    pub side: SideModeValue,

    /// Calendar lookback of the returns behind the volatility estimate
    #[arg(long = "vol-lookback", default_value = "1d")]
    pub vol_lookback: String,

    /// Drop label classes whose share is at or below this fraction
    #[arg(long = "min-label-pct")]
    pub min_label_pct: Option<f64>,

    /// Inclusive start date filter (YYYY-MM-DD)
    #[arg(long = "date-start")]
    pub date_start: Option<String>,

    /// Inclusive end date filter (YYYY-MM-DD)
    #[arg(long = "date-end")]
    pub date_end: Option<String>,

    /// Replace existing labels produced from a different input or config
    #[arg(long = "ack-overwrite", default_value_t = false)]
    pub ack_overwrite: bool,

    /// Disable writing labelsmith.log into the output directory
    #[arg(long = "no-file-log", default_value_t = false)]
    pub no_file_log: bool,
}

impl Cli {
    pub fn parse() -> Self {
        <Cli as Parser>::parse()
    }
}

impl LabelArgs {
    pub fn into_config(self) -> Result<JobConfig> {
        let window = DateWindow {
            start: parse_optional_date(self.date_start.as_deref())?,
            end: parse_optional_date(self.date_end.as_deref())?,
        };
        if let (Some(start), Some(end)) = (window.start, window.end) {
            if start > end {
                return Err(anyhow!("--date-start {start} is after --date-end {end}"));
            }
        }
        let vertical_barrier_secs = if self.no_vertical_barrier {
            None
        } else {
            Some(parse_horizon_secs(&self.vertical_barrier).context("Invalid --vertical-barrier")?)
        };
        let vol_lookback_secs =
            parse_horizon_secs(&self.vol_lookback).context("Invalid --vol-lookback")?;

        let label = LabelConfig {
            span: self.span,
            threshold_multiplier: self.threshold_multiplier,
            profit_take: self.profit_take,
            stop_loss: self.stop_loss,
            vertical_barrier_secs,
            barrier_boundary: self.barrier_boundary.to_mode(),
            min_ret: self.min_ret,
            workers: normalize_workers(self.workers),
            batch_multiplier: self.batch_multiplier,
            cusum_mode: self.cusum_mode.to_mode(),
            reset_after_trigger: !self.no_reset,
            side: self.side.to_mode(),
            vol_lookback_secs,
            min_label_pct: self.min_label_pct,
        };
        // Fail on bad parameters before touching the input file.
        label.validate()?;

        let side = self.side.to_mode();
        if side == SideMode::Known && self.side_column.is_none() {
            return Err(anyhow!("--side known requires --side-column"));
        }

        Ok(JobConfig {
            input_csv: self.csv_path,
            output_dir: self.output_dir,
            columns: PriceColumns {
                timestamp: self.timestamp_column,
                price: self.price_column,
                side: self.side_column,
            },
            window,
            label,
            ack_overwrite: self.ack_overwrite,
        })
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CusumModeValue {
    Both,
    #[value(name = "positive-only")]
    PositiveOnly,
    #[value(name = "negative-only")]
    NegativeOnly,
}

impl CusumModeValue {
    fn to_mode(self) -> CusumMode {
        match self {
            CusumModeValue::Both => CusumMode::Both,
            CusumModeValue::PositiveOnly => CusumMode::PositiveOnly,
            CusumModeValue::NegativeOnly => CusumMode::NegativeOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SideModeValue {
    Unknown,
    Known,
    #[value(name = "cusum-direction")]
    CusumDirection,
}

impl SideModeValue {
    fn to_mode(self) -> SideMode {
        match self {
            SideModeValue::Unknown => SideMode::Unknown,
            SideModeValue::Known => SideMode::Known,
            SideModeValue::CusumDirection => SideMode::CusumDirection,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum BoundaryValue {
    Inclusive,
    Exclusive,
}

impl BoundaryValue {
    fn to_mode(self) -> BarrierBoundary {
        match self {
            BoundaryValue::Inclusive => BarrierBoundary::Inclusive,
            BoundaryValue::Exclusive => BarrierBoundary::Exclusive,
        }
    }
}

fn normalize_workers(value: Option<usize>) -> usize {
    value.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    })
}

/// `<count><unit>` with unit `d`, `h`, `m` or `s`; a bare number is seconds.
fn parse_horizon_secs(raw: &str) -> Result<i64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let count: i64 = digits
        .parse()
        .with_context(|| format!("Expected a duration like 20d or 4h, got '{raw}'"))?;
    let scale = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        other => return Err(anyhow!("Unknown duration unit '{other}' in '{raw}'")),
    };
    count
        .checked_mul(scale)
        .filter(|secs| *secs > 0)
        .ok_or_else(|| anyhow!("Duration '{raw}' must be positive"))
}

fn parse_optional_date(value: Option<&str>) -> Result<Option<NaiveDate>> {
    match value {
        Some(raw) => {
            let parsed = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .with_context(|| format!("Invalid date format for {raw}. Expected YYYY-MM-DD"))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> LabelArgs {
        LabelArgs {
            csv_path: PathBuf::from("dummy.csv"),
            output_dir: PathBuf::from("out"),
            timestamp_column: None,
            price_column: "close".to_string(),
            side_column: None,
            span: 100,
            threshold_multiplier: 1.0,
            profit_take: 1.0,
            stop_loss: 1.0,
            vertical_barrier: "20d".to_string(),
            no_vertical_barrier: false,
            barrier_boundary: BoundaryValue::Inclusive,
            min_ret: 0.0,
            workers: Some(4),
            batch_multiplier: 1,
            cusum_mode: CusumModeValue::Both,
            no_reset: false,
            side: SideModeValue::Unknown,
            vol_lookback: "1d".to_string(),
            min_label_pct: None,
            date_start: None,
            date_end: None,
            ack_overwrite: false,
            no_file_log: false,
        }
    }

    #[test]
    fn defaults_map_onto_label_config() {
        let job = base_args().into_config().expect("valid args");
        assert_eq!(job.label.workers, 4);
        assert_eq!(job.label.vertical_barrier_secs, Some(20 * 86_400));
        assert_eq!(job.label.vol_lookback_secs, 86_400);
        assert!(job.label.reset_after_trigger);
        assert_eq!(job.columns.price, "close");
        assert!(job.window.is_open());
    }

    #[test]
    fn no_vertical_barrier_leaves_events_open() {
        let args = LabelArgs {
            no_vertical_barrier: true,
            vertical_barrier: "not-a-duration".to_string(),
            ..base_args()
        };
        let job = args.into_config().expect("flag overrides the horizon");
        assert_eq!(job.label.vertical_barrier_secs, None);
    }

    #[test]
    fn side_known_requires_side_column() {
        let args = LabelArgs {
            side: SideModeValue::Known,
            ..base_args()
        };
        assert!(args.into_config().is_err());

        let args = LabelArgs {
            side: SideModeValue::Known,
            side_column: Some("signal".to_string()),
            ..base_args()
        };
        let job = args.into_config().expect("side column supplied");
        assert_eq!(job.label.side, SideMode::Known);
    }

    #[test]
    fn invalid_label_parameters_fail_early() {
        let args = LabelArgs {
            span: 0,
            ..base_args()
        };
        assert!(args.into_config().is_err());
    }

    #[test]
    fn reversed_date_window_is_rejected() {
        let args = LabelArgs {
            date_start: Some("2024-03-01".to_string()),
            date_end: Some("2024-02-01".to_string()),
            ..base_args()
        };
        assert!(args.into_config().is_err());
    }

    #[test]
    fn parse_horizon_secs_understands_units() {
        assert_eq!(parse_horizon_secs("20d").unwrap(), 20 * 86_400);
        assert_eq!(parse_horizon_secs("4h").unwrap(), 4 * 3_600);
        assert_eq!(parse_horizon_secs("30m").unwrap(), 1_800);
        assert_eq!(parse_horizon_secs("90s").unwrap(), 90);
        assert_eq!(parse_horizon_secs("45").unwrap(), 45);
        assert!(parse_horizon_secs("0d").is_err());
        assert!(parse_horizon_secs("3w").is_err());
        assert!(parse_horizon_secs("d").is_err());
    }

    #[test]
    fn parse_optional_date_accepts_valid_yyyy_mm_dd() {
        let parsed = parse_optional_date(Some("2024-11-30"))
            .expect("parse should succeed")
            .expect("date should be present");
        let expected = NaiveDate::from_ymd_opt(2024, 11, 30).expect("valid date");
        assert_eq!(parsed, expected);
    }

    #[test]
    fn normalize_workers_prefers_explicit_value() {
        assert_eq!(normalize_workers(Some(2)), 2);
        assert!(
            normalize_workers(None) >= 1,
            "normalize_workers without explicit value should return at least 1"
        );
    }
}
