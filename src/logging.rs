//! Tracing setup for the `hitl` binary.
//!
//! Diagnostics go to stderr so command output on stdout stays clean. When
//! `[logging] file` is configured a daily-rolling copy is written through a
//! non-blocking appender; keep the returned guard alive until exit.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::LoggingSection;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Filter directive used when `RUST_LOG` is unset.
pub fn default_directive(verbose: bool, section: &LoggingSection) -> String {
    if verbose {
        return "debug".to_string();
    }
    section.level.clone().unwrap_or_else(|| "warn".to_string())
}

/// Resolve the configured log file against the project directory.
pub fn log_file_path(section: &LoggingSection, project_dir: &Path) -> Option<PathBuf> {
    section.file.as_ref().map(|file| {
        if file.is_absolute() {
            file.clone()
        } else {
            project_dir.join(file)
        }
    })
}

pub fn init_logging(
    verbose: bool,
    section: &LoggingSection,
    json: bool,
    project_dir: &Path,
) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(verbose, section)))
        .context("Invalid log filter")?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);
    layers.push(if json {
        stderr.json().boxed()
    } else {
        stderr.compact().boxed()
    });

    let mut guard = None;
    if let Some(path) = log_file_path(section, project_dir) {
        let dir = path.parent().unwrap_or(project_dir).to_path_buf();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "hitl.log".to_string());
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
        let (writer, worker) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name));
        let file = fmt::layer().with_writer(writer).with_ansi(false);
        layers.push(if json { file.json().boxed() } else { file.boxed() });
        guard = Some(worker);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to initialize logging")?;
    Ok(guard)
}
