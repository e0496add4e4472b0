//! Per-task state records and the on-disk snapshot.
//!
//! The snapshot (`cmd_state.txt`) is the sole durable representation of a
//! run: a tab-separated table rewritten after every transition. Before each
//! write the previous file is renamed to `bak.cmd_state.txt`, so a crash
//! mid-write still leaves one consistent snapshot behind.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use tracing::warn;

pub const SNAPSHOT_FILE: &str = "cmd_state.txt";
pub const SNAPSHOT_BACKUP_FILE: &str = "bak.cmd_state.txt";

const COLUMNS: [&str; 8] = [
    "name",
    "state",
    "used_time",
    "mem",
    "cpu",
    "pid",
    "depend",
    "cmd",
];

/// Where a task currently sits in its lifecycle.
///
/// `Outdoor` is the unstarted set; `Success`, `Failed`, and `Killed` are
/// terminal. A task advances monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Outdoor,
    Queueing,
    Running,
    Success,
    Failed,
    Killed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Outdoor => "outdoor",
            TaskStatus::Queueing => "queueing",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Killed => "killed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Killed
        )
    }
}

impl FromStr for TaskStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "outdoor" => Ok(TaskStatus::Outdoor),
            "queueing" => Ok(TaskStatus::Queueing),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            "killed" => Ok(TaskStatus::Killed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wall-clock account for a task: seconds once it terminated, otherwise a
/// diagnostic tag explaining why no measurement exists.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UsedTime {
    Unknown,
    Seconds(f64),
    /// Admission was denied; the child was never spawned.
    NotEnoughResource,
    /// A predecessor failed; the child was never spawned.
    FailedDependencies,
}

impl fmt::Display for UsedTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsedTime::Unknown => f.write_str("unknown"),
            UsedTime::Seconds(s) => write!(f, "{s}"),
            UsedTime::NotEnoughResource => f.write_str("NotEnoughResource"),
            UsedTime::FailedDependencies => f.write_str("FailedDependencies"),
        }
    }
}

impl FromStr for UsedTime {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "unknown" => Ok(UsedTime::Unknown),
            "NotEnoughResource" => Ok(UsedTime::NotEnoughResource),
            "FailedDependencies" => Ok(UsedTime::FailedDependencies),
            other => other.parse().map(UsedTime::Seconds).map_err(|_| ()),
        }
    }
}

/// Mutable record, one per task; mutated only under the scheduler lock.
/// `depend` and `cmd` are mirrored from the graph for display and resume.
#[derive(Debug, Clone)]
pub struct TaskState {
    pub status: TaskStatus,
    pub used_time: UsedTime,
    /// Peak observed memory, bytes.
    pub mem: Option<u64>,
    /// Peak observed CPU, fractional cores.
    pub cpu: Option<f64>,
    pub pid: Option<u32>,
    /// Predecessors as a comma-separated list.
    pub depend: String,
    pub cmd: String,
}

impl TaskState {
    pub fn new(depend: String, cmd: String) -> Self {
        TaskState {
            status: TaskStatus::Outdoor,
            used_time: UsedTime::Unknown,
            mem: None,
            cpu: None,
            pid: None,
            depend,
            cmd,
        }
    }
}

fn opt_field<T: fmt::Display>(v: &Option<T>) -> String {
    match v {
        Some(v) => v.to_string(),
        None => "unknown".to_string(),
    }
}

fn parse_opt<T: FromStr>(s: &str) -> Option<T> {
    s.parse().ok()
}

/// One parsed snapshot line.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    pub name: String,
    pub status: TaskStatus,
    pub used_time: UsedTime,
    pub mem: Option<u64>,
    pub cpu: Option<f64>,
    pub pid: Option<u32>,
    pub depend: String,
    pub cmd: String,
}

/// Reads and writes the snapshot under a workspace directory.
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        StateStore { dir: dir.into() }
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_BACKUP_FILE)
    }

    /// Persist the full state table. The previous snapshot, if any, becomes
    /// the backup via rename so one consistent file always exists on disk.
    ///
    /// A failed write is reported but must not stop the run; the in-memory
    /// state remains the source of truth. Callers log the error.
    pub fn write<'a>(
        &self,
        rows: impl Iterator<Item = (&'a str, &'a TaskState)>,
    ) -> std::io::Result<()> {
        let path = self.snapshot_path();
        if path.exists() {
            std::fs::rename(&path, self.backup_path())?;
        }

        let mut out = String::new();
        out.push_str(&COLUMNS.join("\t"));
        out.push('\n');
        for (name, st) in rows {
            out.push_str(name);
            out.push('\t');
            out.push_str(st.status.as_str());
            out.push('\t');
            out.push_str(&st.used_time.to_string());
            out.push('\t');
            out.push_str(&opt_field(&st.mem));
            out.push('\t');
            out.push_str(&opt_field(&st.cpu));
            out.push('\t');
            out.push_str(&opt_field(&st.pid));
            out.push('\t');
            out.push_str(&st.depend);
            out.push('\t');
            out.push_str(&st.cmd);
            out.push('\n');
        }
        std::fs::write(&path, out)
    }

    /// Reload the snapshot for resume. Rows that no longer parse are skipped
    /// with a warning rather than aborting the whole resume.
    pub fn read(&self) -> Result<Vec<SnapshotRow>> {
        let path = self.snapshot_path();
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("no snapshot found at {}", path.display()))?;

        let mut rows = Vec::new();
        for line in text.lines().skip(1) {
            if line.is_empty() {
                continue;
            }
            match parse_row(line) {
                Some(row) => rows.push(row),
                None => warn!("ignoring malformed snapshot line: {line}"),
            }
        }
        Ok(rows)
    }
}

fn parse_row(line: &str) -> Option<SnapshotRow> {
    // cmd is the trailing field and may itself contain tabs.
    let mut parts = line.splitn(8, '\t');
    let name = parts.next()?.to_string();
    let status = parts.next()?.parse().ok()?;
    let used_time = parts.next()?.parse().ok()?;
    let mem = parse_opt(parts.next()?);
    let cpu = parse_opt(parts.next()?);
    let pid = parse_opt(parts.next()?);
    let depend = parts.next()?.to_string();
    let cmd = parts.next()?.to_string();
    Some(SnapshotRow {
        name,
        status,
        used_time,
        mem,
        cpu,
        pid,
        depend,
        cmd,
    })
}

// ---------- Unit tests ----------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_states() -> Vec<(String, TaskState)> {
        let mut done = TaskState::new(String::new(), "echo done".to_string());
        done.status = TaskStatus::Success;
        done.used_time = UsedTime::Seconds(1.5);
        done.mem = Some(1024);
        done.cpu = Some(0.25);
        done.pid = Some(4242);

        let mut blocked = TaskState::new("first".to_string(), "echo blocked".to_string());
        blocked.status = TaskStatus::Failed;
        blocked.used_time = UsedTime::FailedDependencies;

        vec![("first".to_string(), done), ("second".to_string(), blocked)]
    }

    #[test]
    fn snapshot_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path());
        let states = sample_states();

        store
            .write(states.iter().map(|(n, s)| (n.as_str(), s)))
            .unwrap();
        let rows = store.read().unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "first");
        assert_eq!(rows[0].status, TaskStatus::Success);
        assert_eq!(rows[0].used_time, UsedTime::Seconds(1.5));
        assert_eq!(rows[0].mem, Some(1024));
        assert_eq!(rows[0].cpu, Some(0.25));
        assert_eq!(rows[0].pid, Some(4242));
        assert_eq!(rows[1].status, TaskStatus::Failed);
        assert_eq!(rows[1].used_time, UsedTime::FailedDependencies);
        assert_eq!(rows[1].mem, None, "unknown maps back to None");
        assert_eq!(rows[1].depend, "first");
    }

    #[test]
    fn rewrite_rotates_previous_snapshot_to_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path());
        let states = sample_states();

        store
            .write(states.iter().map(|(n, s)| (n.as_str(), s)))
            .unwrap();
        let first = std::fs::read_to_string(store.snapshot_path()).unwrap();
        assert!(!store.backup_path().exists());

        store
            .write(states.iter().map(|(n, s)| (n.as_str(), s)))
            .unwrap();
        assert!(store.backup_path().exists());
        assert_eq!(std::fs::read_to_string(store.backup_path()).unwrap(), first);
    }

    #[test]
    fn header_matches_contract() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path());
        store.write(std::iter::empty()).unwrap();
        let text = std::fs::read_to_string(store.snapshot_path()).unwrap();
        assert_eq!(
            text.lines().next().unwrap(),
            "name\tstate\tused_time\tmem\tcpu\tpid\tdepend\tcmd"
        );
    }

    #[test]
    fn tab_inside_cmd_survives() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path());
        let mut st = TaskState::new(String::new(), "printf 'a\tb'".to_string());
        st.status = TaskStatus::Success;
        st.used_time = UsedTime::Seconds(0.1);
        store.write(std::iter::once(("t", &st))).unwrap();
        let rows = store.read().unwrap();
        assert_eq!(rows[0].cmd, "printf 'a\tb'");
    }

    #[test]
    fn used_time_display_parse() {
        for v in [
            UsedTime::Unknown,
            UsedTime::Seconds(12.3456),
            UsedTime::NotEnoughResource,
            UsedTime::FailedDependencies,
        ] {
            assert_eq!(v.to_string().parse::<UsedTime>().unwrap(), v);
        }
    }

    #[test]
    fn missing_snapshot_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path());
        assert!(store.read().is_err());
    }
}
