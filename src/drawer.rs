//! Optional state-graph rendering.
//!
//! The drawer is a strategy selected at controller construction: when
//! plotting is requested and the Graphviz `dot` binary is on the PATH, the
//! current state map is rendered to `state.svg` after every transition;
//! otherwise every draw is a no-op. Drawing failures are logged and never
//! fail the run.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tracing::warn;

use crate::state::{TaskState, TaskStatus, UsedTime};

pub const GRAPH_FILE: &str = "state.svg";
pub const GRAPH_BACKUP_FILE: &str = "bak.state.svg";

pub enum Drawer {
    Noop,
    Graphviz { dot: PathBuf },
}

impl Drawer {
    /// Pick the strategy. Requesting a plot without a renderer degrades to
    /// `Noop` with a single startup warning.
    pub fn detect(enabled: bool) -> Drawer {
        if !enabled {
            return Drawer::Noop;
        }
        match which::which("dot") {
            Ok(dot) => Drawer::Graphviz { dot },
            Err(_) => {
                warn!("graphviz `dot` not found, the state graph will not be drawn");
                Drawer::Noop
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Drawer::Graphviz { .. })
    }

    /// Render the state map under `outdir`, rotating the previous image to
    /// its backup name first.
    pub fn draw<'a>(
        &self,
        rows: impl Iterator<Item = (&'a str, &'a TaskState)>,
        outdir: &Path,
    ) {
        let Drawer::Graphviz { dot } = self else {
            return;
        };
        let out = outdir.join(GRAPH_FILE);
        if out.exists()
            && let Err(e) = std::fs::rename(&out, outdir.join(GRAPH_BACKUP_FILE))
        {
            warn!("cannot rotate {}: {e}", out.display());
        }
        let source = dot_source(rows);
        if let Err(e) = render(dot, &source, &out) {
            warn!("state graph not drawn: {e:#}");
        }
    }
}

fn render(dot: &Path, source: &str, out: &Path) -> Result<()> {
    let mut child = Command::new(dot)
        .arg("-Tsvg")
        .arg("-o")
        .arg(out)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("spawn dot")?;
    child
        .stdin
        .take()
        .expect("stdin piped")
        .write_all(source.as_bytes())
        .context("feed dot")?;
    let status = child.wait().context("wait for dot")?;
    if !status.success() {
        anyhow::bail!("dot exited with {status}");
    }
    Ok(())
}

fn fill_color(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Success => "#7FFF00",
        TaskStatus::Failed => "#FFD700",
        TaskStatus::Running => "#9F79EE",
        TaskStatus::Queueing => "#87CEFF",
        TaskStatus::Killed => "red",
        TaskStatus::Outdoor => "#A8A8A8",
    }
}

fn edge_color(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Success => "green",
        TaskStatus::Running => "#836FFF",
        _ => "#4D4D4D",
    }
}

fn quoted(s: &str) -> String {
    format!(
        "\"{}\"",
        s.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
    )
}

/// Build the DOT description: one box per task colored by state, edges from
/// predecessors, a synthetic `Input` source feeding orphans, and a legend of
/// the colors actually observed.
pub fn dot_source<'a>(rows: impl Iterator<Item = (&'a str, &'a TaskState)>) -> String {
    let rows: Vec<(&str, &TaskState)> = rows.collect();
    let mut g = String::from("digraph state {\nrankdir=LR;\n");

    // Observed (status, color) pairs in first-seen order for the legend.
    let mut used: Vec<TaskStatus> = Vec::new();

    for (name, st) in &rows {
        if !used.contains(&st.status) {
            used.push(st.status);
        }
        // The name's subtype prefix and the generated remainder stack as
        // separate label lines, with the time account underneath.
        let mut label_lines: Vec<String> = match name.split_once('_') {
            Some((head, tail)) => vec![head.to_string(), tail.to_string()],
            None => vec![name.to_string()],
        };
        match st.used_time {
            UsedTime::Unknown => {}
            UsedTime::Seconds(s) if s <= 0.0 => {}
            UsedTime::Seconds(s) => label_lines.push(format!("{s}s")),
            tag => label_lines.push(tag.to_string()),
        }
        g.push_str(&format!(
            "{} [shape=box, style=\"rounded, filled\", fillcolor={}, color=mediumseagreen, label={}, tooltip={}];\n",
            quoted(name),
            quoted(fill_color(st.status)),
            quoted(&label_lines.join("\n")),
            quoted(&st.cmd.replace(' ', "\n")),
        ));
    }

    for (name, st) in &rows {
        let sources: Vec<&str> = st
            .depend
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if sources.is_empty() {
            g.push_str(&format!("Input -> {} [color=green];\n", quoted(name)));
        } else {
            let color = edge_color(st.status);
            for src in sources {
                g.push_str(&format!(
                    "{} -> {} [color={}];\n",
                    quoted(src),
                    quoted(name),
                    quoted(color),
                ));
            }
        }
    }

    g.push_str("subgraph cluster_legend {\nlabel=\"Color Legend\";\ncolor=lightgrey;\nstyle=filled;\n");
    for status in &used {
        g.push_str(&format!(
            "{} [shape=note, style=filled, fillcolor={}, color=mediumseagreen];\n",
            quoted(status.as_str()),
            quoted(fill_color(*status)),
        ));
    }
    for pair in used.windows(2) {
        g.push_str(&format!(
            "{} -> {} [style=invis];\n",
            quoted(pair[0].as_str()),
            quoted(pair[1].as_str()),
        ));
    }
    g.push_str("}\n}\n");
    g
}

// ---------- Unit tests ----------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TaskState;

    fn state(status: TaskStatus, used: UsedTime, depend: &str) -> TaskState {
        let mut st = TaskState::new(depend.to_string(), "run step --fast".to_string());
        st.status = status;
        st.used_time = used;
        st
    }

    #[test]
    fn disabled_detection_is_noop() {
        assert!(!Drawer::detect(false).is_enabled());
    }

    #[test]
    fn dot_source_colors_nodes_by_state() {
        let ok = state(TaskStatus::Success, UsedTime::Seconds(2.5), "");
        let bad = state(TaskStatus::Failed, UsedTime::FailedDependencies, "first");
        let src = dot_source([("first", &ok), ("second", &bad)].into_iter());

        assert!(src.contains("rankdir=LR"));
        assert!(src.contains("fillcolor=\"#7FFF00\""), "success green:\n{src}");
        assert!(src.contains("fillcolor=\"#FFD700\""), "failed gold:\n{src}");
        assert!(src.contains("2.5s"), "elapsed suffix:\n{src}");
        assert!(src.contains("FailedDependencies"), "diagnostic tag:\n{src}");
    }

    #[test]
    fn orphans_hang_off_the_input_node() {
        let ok = state(TaskStatus::Success, UsedTime::Unknown, "");
        let src = dot_source([("solo", &ok)].into_iter());
        assert!(src.contains("Input -> \"solo\" [color=green];"));
    }

    #[test]
    fn edges_follow_the_dependent_state() {
        let a = state(TaskStatus::Success, UsedTime::Unknown, "");
        let b = state(TaskStatus::Running, UsedTime::Unknown, "a");
        let src = dot_source([("a", &a), ("b", &b)].into_iter());
        assert!(src.contains("\"a\" -> \"b\" [color=\"#836FFF\"];"), "{src}");
    }

    #[test]
    fn legend_lists_each_observed_color_once() {
        let a = state(TaskStatus::Success, UsedTime::Unknown, "");
        let b = state(TaskStatus::Success, UsedTime::Unknown, "a");
        let src = dot_source([("a", &a), ("b", &b)].into_iter());
        assert_eq!(src.matches("shape=note").count(), 1);
        assert!(src.contains("cluster_legend"));
    }

    #[test]
    fn subtype_name_splits_into_label_lines() {
        let a = state(TaskStatus::Queueing, UsedTime::Unknown, "");
        let src = dot_source([("align_sample1", &a)].into_iter());
        assert!(src.contains("label=\"align\\nsample1\""), "{src}");
    }
}
