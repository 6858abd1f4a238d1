use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::LabelConfig;
use crate::data::{DateWindow, PriceColumns};
use crate::labels::LabelSummary;
use crate::pipeline::LabeledEvent;

pub const LABELS_FILE: &str = "labels.csv";
pub const MANIFEST_FILE: &str = "run_manifest.json";

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Columnar view of the labeled rows, in event order.
pub fn labels_frame(rows: &[LabeledEvent]) -> Result<DataFrame> {
    let starts: Vec<String> = rows.iter().map(|row| format_ts(row.event_start)).collect();
    let ends: Vec<String> = rows.iter().map(|row| format_ts(row.event_end)).collect();
    let exits: Vec<&str> = rows.iter().map(|row| row.exit.as_str()).collect();
    let targets: Vec<f64> = rows.iter().map(|row| row.target).collect();
    let sides: Vec<Option<i32>> = rows
        .iter()
        .map(|row| row.side.map(|side| side.sign() as i32))
        .collect();
    let rets: Vec<f64> = rows.iter().map(|row| row.ret).collect();
    let bins: Vec<i32> = rows.iter().map(|row| i32::from(row.bin)).collect();
    let uniqueness: Vec<f64> = rows.iter().map(|row| row.uniqueness).collect();
    let weights: Vec<f64> = rows.iter().map(|row| row.sample_weight).collect();

    DataFrame::new(vec![
        Series::new("event_start", starts),
        Series::new("event_end", ends),
        Series::new("exit", exits),
        Series::new("target", targets),
        Series::new("side", sides),
        Series::new("ret", rets),
        Series::new("bin", bins),
        Series::new("uniqueness", uniqueness),
        Series::new("sample_weight", weights),
    ])
    .context("Failed to assemble labels frame")
}

pub fn write_labels_csv(path: &Path, rows: &[LabeledEvent]) -> Result<()> {
    let mut frame = labels_frame(rows)?;
    let mut file =
        File::create(path).with_context(|| format!("Unable to create {}", path.display()))?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(&mut frame)
        .with_context(|| format!("Failed to write labels to {}", path.display()))?;
    info!(rows = rows.len(), path = %path.display(), "Labels written");
    Ok(())
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("Unable to open {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Provenance record written next to the labels: which input, which
/// parameters, what came out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub tool_version: String,
    pub input_csv: PathBuf,
    pub input_sha256: String,
    #[serde(default)]
    pub window: DateWindow,
    #[serde(default)]
    pub columns: PriceColumns,
    pub config: LabelConfig,
    pub summary: LabelSummary,
    pub created_at: DateTime<Utc>,
}

impl RunManifest {
    pub fn new(
        input_csv: &Path,
        window: DateWindow,
        columns: PriceColumns,
        config: LabelConfig,
        summary: LabelSummary,
    ) -> Result<Self> {
        Ok(Self {
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            input_csv: input_csv.to_path_buf(),
            input_sha256: sha256_file(input_csv)?,
            window,
            columns,
            config,
            summary,
            created_at: Utc::now(),
        })
    }

    /// True when this manifest was produced from the same input bytes, date
    /// window, column mapping and parameters.
    pub fn matches(
        &self,
        input_sha256: &str,
        window: &DateWindow,
        columns: &PriceColumns,
        config: &LabelConfig,
    ) -> bool {
        self.input_sha256 == input_sha256
            && &self.window == window
            && &self.columns == columns
            && &self.config == config
    }
}

pub fn write_manifest(path: &Path, manifest: &RunManifest) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("Unable to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), manifest)
        .with_context(|| format!("Failed to write manifest {}", path.display()))?;
    Ok(())
}

pub fn read_manifest(path: &Path) -> Result<RunManifest> {
    let file = File::open(path).with_context(|| format!("Unable to open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse manifest {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::{ExitKind, Side};
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn row(bin: i8, side: Option<Side>) -> LabeledEvent {
        LabeledEvent {
            event_start: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            event_end: Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap(),
            exit: ExitKind::ProfitTake,
            target: 0.02,
            side,
            ret: 0.03,
            bin,
            uniqueness: 0.5,
            sample_weight: 1.0,
        }
    }

    #[test]
    fn labels_frame_has_one_column_per_field() -> Result<()> {
        let frame = labels_frame(&[row(1, None), row(0, Some(Side::Short))])?;
        assert_eq!(frame.height(), 2);
        assert_eq!(
            frame.get_column_names(),
            vec![
                "event_start",
                "event_end",
                "exit",
                "target",
                "side",
                "ret",
                "bin",
                "uniqueness",
                "sample_weight"
            ]
        );
        assert_eq!(frame.column("side")?.null_count(), 1);
        Ok(())
    }

    #[test]
    fn labels_csv_round_trips_through_polars() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(LABELS_FILE);
        write_labels_csv(&path, &[row(1, Some(Side::Long))])?;
        let text = std::fs::read_to_string(&path)?;
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("event_start,event_end,exit,target,side,ret,bin,uniqueness,sample_weight")
        );
        let first = lines.next().unwrap_or_default();
        assert!(first.starts_with("2024-01-02T00:00:00Z,2024-01-05T00:00:00Z,profit_take,"));
        Ok(())
    }

    #[test]
    fn manifest_records_input_fingerprint() -> Result<()> {
        let dir = tempdir()?;
        let input = dir.path().join("prices.csv");
        std::fs::write(&input, "timestamp,close\n2024-01-01,1.0\n")?;
        let manifest = RunManifest::new(
            &input,
            DateWindow::default(),
            PriceColumns::default(),
            LabelConfig::default(),
            LabelSummary::default(),
        )?;
        let path = dir.path().join(MANIFEST_FILE);
        write_manifest(&path, &manifest)?;

        let loaded = read_manifest(&path)?;
        assert_eq!(loaded.input_sha256.len(), 64);
        let window = DateWindow::default();
        let columns = PriceColumns::default();
        assert!(loaded.matches(
            &sha256_file(&input)?,
            &window,
            &columns,
            &LabelConfig::default()
        ));
        let other = LabelConfig {
            span: 5,
            ..LabelConfig::default()
        };
        assert!(!loaded.matches(&loaded.input_sha256, &window, &columns, &other));
        let narrowed = DateWindow {
            start: chrono::NaiveDate::from_ymd_opt(2024, 6, 1),
            end: None,
        };
        assert!(!loaded.matches(
            &loaded.input_sha256,
            &narrowed,
            &columns,
            &LabelConfig::default()
        ));
        let open_prices = PriceColumns {
            price: "open".to_string(),
            ..PriceColumns::default()
        };
        assert!(!loaded.matches(
            &loaded.input_sha256,
            &window,
            &open_prices,
            &LabelConfig::default()
        ));
        Ok(())
    }

    #[test]
    fn manifest_without_columns_reads_default_mapping() -> Result<()> {
        let dir = tempdir()?;
        let input = dir.path().join("prices.csv");
        std::fs::write(&input, "timestamp,close\n2024-01-01,1.0\n")?;
        let manifest = RunManifest::new(
            &input,
            DateWindow::default(),
            PriceColumns::default(),
            LabelConfig::default(),
            LabelSummary::default(),
        )?;
        let mut value = serde_json::to_value(&manifest)?;
        if let Some(fields) = value.as_object_mut() {
            fields.remove("columns");
        }
        let loaded: RunManifest = serde_json::from_value(value)?;
        assert_eq!(loaded.columns, PriceColumns::default());
        Ok(())
    }
}
