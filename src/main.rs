//! flow-exec — entry point
//!
//! Exit codes: 0 when every task succeeded, 1 when any task did not,
//! 2 when the pipeline could not be loaded at all.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use flow_exec::config::TaskGraph;
use flow_exec::drawer::Drawer;
use flow_exec::logging;
use flow_exec::scheduler::Scheduler;

#[derive(Debug, Parser)]
#[command(name = "flow-exec")]
#[command(about = "Local DAG task runner for shell-command pipelines", long_about = None)]
struct Cli {
    /// Pipeline configuration file.
    #[arg(short = 'c', long)]
    cfg: PathBuf,

    /// Workspace for state, logs, and drawings.
    #[arg(short = 'o', long, default_value = ".")]
    outdir: PathBuf,

    /// Seconds to wait for enough free resources before giving a task up.
    #[arg(short = 'w', long, default_value = "10", value_name = "SECONDS")]
    wait_timeout: f64,

    /// Draw the running state graph (requires Graphviz `dot` on the PATH).
    #[arg(long)]
    plot: bool,

    /// Continue from the existing snapshot instead of starting fresh.
    #[arg(long)]
    rerun: bool,

    /// With --rerun: re-execute this recorded-successful step. Matches the
    /// exact task name or, as a family prefix, every `NAME_*` task.
    #[arg(long = "skip", value_name = "NAME", action = clap::ArgAction::Append)]
    skip: Vec<String>,

    /// Increase stderr log verbosity (-v, -vv); files always get INFO.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok((success, total)) => {
            std::process::exit(if success == total { 0 } else { 1 });
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(2);
        }
    }
}

fn run(cli: Cli) -> Result<(usize, usize)> {
    std::fs::create_dir_all(&cli.outdir)
        .with_context(|| format!("create outdir {}", cli.outdir.display()))?;
    logging::init(&cli.outdir, cli.verbose)?;

    let graph = TaskGraph::load(&cli.cfg)?;
    let drawer = Drawer::detect(cli.plot);
    let scheduler = Scheduler::new(graph, &cli.outdir, cli.wait_timeout, drawer);

    if cli.rerun {
        scheduler.resume(&cli.skip)
    } else {
        Ok(scheduler.run())
    }
}
