use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use tracing::{info, warn};

use crate::config::LabelConfig;
use crate::data::{load_price_csv, DateWindow, PriceColumns};
use crate::labels::LabelSummary;
use crate::pipeline::LabelingPipeline;
use crate::storage::{
    read_manifest, sha256_file, write_labels_csv, write_manifest, RunManifest, LABELS_FILE,
    MANIFEST_FILE,
};

/// File-level labeling job: CSV in, `labels.csv` + `run_manifest.json` out.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub input_csv: PathBuf,
    pub output_dir: PathBuf,
    pub columns: PriceColumns,
    /// Only rows inside this UTC date window are labeled.
    pub window: DateWindow,
    pub label: LabelConfig,
    /// Allow replacing labels produced from a different input or config.
    pub ack_overwrite: bool,
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub labels_path: PathBuf,
    pub manifest_path: PathBuf,
    pub summary: LabelSummary,
    /// True when existing outputs matched the input and config and were kept.
    pub reused: bool,
}

pub fn run_labeling_job(job: &JobConfig) -> Result<JobOutcome> {
    let started = Instant::now();
    fs::create_dir_all(&job.output_dir)
        .with_context(|| format!("Unable to create {}", job.output_dir.display()))?;
    let labels_path = job.output_dir.join(LABELS_FILE);
    let manifest_path = job.output_dir.join(MANIFEST_FILE);

    let input_hash = sha256_file(&job.input_csv)?;
    if labels_path.exists() && manifest_path.exists() {
        let existing = read_manifest(&manifest_path)?;
        if existing.matches(&input_hash, &job.window, &job.columns, &job.label) {
            info!(
                path = %labels_path.display(),
                "Labels unchanged for this input and config; reusing existing labels.csv"
            );
            return Ok(JobOutcome {
                labels_path,
                manifest_path,
                summary: existing.summary,
                reused: true,
            });
        }
        if !job.ack_overwrite {
            return Err(anyhow!(
                "Existing labels in {} were produced from a different input, column mapping or config.\n\
                 existing sha256: {}\n\
                 new sha256: {}\n\
                 Rerun with --ack-overwrite to replace them, or choose a fresh --output-dir.",
                job.output_dir.display(),
                existing.input_sha256,
                input_hash
            ));
        }
        warn!(
            existing_hash = %existing.input_sha256,
            new_hash = %input_hash,
            path = %labels_path.display(),
            "Existing labels differ; overwriting because ack_overwrite=true"
        );
    }

    let loaded = load_price_csv(&job.input_csv, &job.columns)?;
    let (prices, sides) = if job.window.is_open() {
        (loaded.prices, loaded.sides)
    } else {
        (
            loaded.prices.between_dates(&job.window),
            loaded.sides.map(|sides| sides.between_dates(&job.window)),
        )
    };
    info!(
        rows = prices.len(),
        date_start = ?job.window.start,
        date_end = ?job.window.end,
        path = %job.input_csv.display(),
        "Loaded price series"
    );
    let pipeline = LabelingPipeline::new(job.label.clone())?;
    let output = pipeline.run(&prices, sides.as_ref())?;

    write_labels_csv(&labels_path, &output.rows)?;
    let manifest = RunManifest::new(
        &job.input_csv,
        job.window,
        job.columns.clone(),
        job.label.clone(),
        output.summary.clone(),
    )?;
    write_manifest(&manifest_path, &manifest)?;
    info!(
        rows = output.rows.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        path = %manifest_path.display(),
        "Labeling job complete"
    );

    Ok(JobOutcome {
        labels_path,
        manifest_path,
        summary: output.summary,
        reused: false,
    })
}
