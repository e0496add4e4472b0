//! Log plumbing.
//!
//! Three sinks: stderr for the operator (WARN unless `-v` raises it, or
//! `RUST_LOG` overrides), `workflow.log` with the full controller record at
//! INFO, and `command.log` holding only the runner's per-command events.
//! Both files are truncated at startup; they describe one run.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::filter::{EnvFilter, LevelFilter, filter_fn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, fmt};

pub const WORKFLOW_LOG: &str = "workflow.log";
pub const COMMAND_LOG: &str = "command.log";

/// Target used by the runner for events mirrored into `command.log`.
pub const COMMAND_TARGET: &str = "command";

pub fn init(outdir: &Path, verbose: u8) -> Result<()> {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let workflow = std::fs::File::create(outdir.join(WORKFLOW_LOG))
        .with_context(|| format!("create {WORKFLOW_LOG} in {}", outdir.display()))?;
    let command = std::fs::File::create(outdir.join(COMMAND_LOG))
        .with_context(|| format!("create {COMMAND_LOG} in {}", outdir.display()))?;

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(stderr_filter),
        )
        .with(
            fmt::layer()
                .with_writer(Arc::new(workflow))
                .with_ansi(false)
                .with_filter(LevelFilter::INFO),
        )
        .with(
            fmt::layer()
                .with_writer(Arc::new(command))
                .with_ansi(false)
                .with_filter(filter_fn(|meta| meta.target() == COMMAND_TARGET)),
        )
        .try_init()
        .context("install tracing subscriber")?;
    Ok(())
}
