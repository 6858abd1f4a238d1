mod cli;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cli::{Cli, Commands};
use labelsmith_rs::run_labeling_job;
use tracing_appender::non_blocking;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Installs the stdout subscriber plus, when `log_file` is set, a
/// non-blocking file layer. The returned guard owns the file writer's
/// background thread; dropping it flushes `labelsmith.log`.
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);

    let Some(path) = log_file else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .try_init()
            .context("failed to initialize tracing")?;
        return Ok(None);
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let (file_writer, guard) = non_blocking(file);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(file_writer);
    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .context("failed to initialize tracing")?;
    Ok(Some(guard))
}

fn log_invocation(log_file: Option<&PathBuf>) {
    let cwd = std::env::current_dir().ok();
    let argv: Vec<String> = std::env::args_os()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();

    tracing::info!("==================== new labelsmith run ====================");
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        cwd = ?cwd,
        log_file = ?log_file,
        argv = ?argv,
        "labelsmith_cli invoked"
    );
    tracing::info!("command_line={}", argv.join(" "));

    if argv.len() >= 2 {
        tracing::info!(
            "cargo_repro_command=cargo run --release -p labelsmith_cli -- {}",
            argv[1..].join(" ")
        );
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_file = match &cli.command {
        Commands::Label(args) => {
            if args.no_file_log {
                None
            } else {
                Some(args.output_dir.join("labelsmith.log"))
            }
        }
    };

    // held until main returns so queued lines reach the log file, error exits included
    let _log_guard = init_tracing(log_file.as_deref())?;
    log_invocation(log_file.as_ref());

    match cli.command {
        Commands::Label(args) => {
            let job = args.into_config()?;
            let outcome = run_labeling_job(&job)?;
            tracing::info!(
                labels = %outcome.labels_path.display(),
                manifest = %outcome.manifest_path.display(),
                reused = outcome.reused,
                events = outcome.summary.events,
                rows = outcome.summary.labels,
                "labelsmith run finished"
            );
            Ok(())
        }
    }
}
