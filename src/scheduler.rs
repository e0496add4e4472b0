//! The scheduler: topological release of ready tasks, the bounded worker
//! pool, crash-safe state transitions, and resume.
//!
//! All bookkeeping (the `TaskState` map, the ready-queue release rules, the
//! snapshot, the drawer) is serialized by one controller mutex. Command
//! execution happens outside the lock, so the critical section stays small.
//! Workers feed from an MPMC channel; a `None` sentinel, re-pushed by every
//! worker that receives it, tells the whole pool that no further work will
//! arrive.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::warn;

use crate::config::TaskGraph;
use crate::drawer::Drawer;
use crate::procwatch;
use crate::resource;
use crate::runner::TaskRunner;
use crate::state::{StateStore, TaskState, TaskStatus, UsedTime};

/// How long an idle worker sleeps before a housekeeping pass.
const IDLE_SLEEP: Duration = Duration::from_secs(5);

/// Delay before the controller's first full state snapshot.
const WARMUP_SNAPSHOT_DELAY: Duration = Duration::from_secs(2);

/// Resume name filter: an entry matches a task exactly or as the prefix
/// before `_`, so whole families of generated tasks can be named at once.
pub fn matches_skip(name: &str, entry: &str) -> bool {
    name == entry
        || name
            .strip_prefix(entry)
            .is_some_and(|rest| rest.starts_with('_'))
}

/// Bookkeeping guarded by the controller mutex.
struct Board {
    states: HashMap<String, TaskState>,
    /// Tasks ever admitted for execution; the complement is the outdoor set.
    ever_queued: HashSet<String>,
    success: usize,
    failed: usize,
}

struct Shared {
    graph: TaskGraph,
    outdir: PathBuf,
    /// Resource-wait timeout in seconds, from the CLI.
    wait_timeout: f64,
    store: StateStore,
    drawer: Drawer,
    board: Mutex<Board>,
    tx: Sender<Option<String>>,
    rx: Receiver<Option<String>>,
    finalized: AtomicBool,
}

pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(graph: TaskGraph, outdir: impl AsRef<Path>, wait_timeout: f64, drawer: Drawer) -> Self {
        let outdir = outdir.as_ref().to_path_buf();
        let states = graph
            .names()
            .iter()
            .map(|name| {
                let spec = graph.task(name).expect("name comes from the graph");
                (
                    name.clone(),
                    TaskState::new(spec.depend.join(","), spec.cmd.clone()),
                )
            })
            .collect();
        let (tx, rx) = unbounded();
        Scheduler {
            shared: Arc::new(Shared {
                store: StateStore::new(&outdir),
                graph,
                outdir,
                wait_timeout,
                drawer,
                board: Mutex::new(Board {
                    states,
                    ever_queued: HashSet::new(),
                    success: 0,
                    failed: 0,
                }),
                tx,
                rx,
                finalized: AtomicBool::new(false),
            }),
        }
    }

    pub fn task_count(&self) -> usize {
        self.shared.graph.len()
    }

    /// Fresh run: seed the queue with the orphans and drive the graph to
    /// completion. Returns `(success, total)`.
    pub fn run(&self) -> (usize, usize) {
        {
            let mut board = self.shared.board.lock().unwrap();
            let orphans: Vec<String> = self
                .shared
                .graph
                .orphans()
                .iter()
                .map(|s| s.to_string())
                .collect();
            for name in orphans {
                self.shared.enqueue(&mut board, &name);
            }
        }
        self.run_pool()
    }

    /// Resume from the snapshot: tasks recorded `success` (and not named by
    /// `skip`) keep their result; everything else runs again. Dependencies
    /// and commands always come from the freshly parsed graph, so edits
    /// between runs take effect.
    pub fn resume(&self, skip: &[String]) -> Result<(usize, usize)> {
        let skipped: HashSet<&str> = self
            .shared
            .graph
            .names()
            .iter()
            .filter(|name| skip.iter().any(|entry| matches_skip(name, entry)))
            .map(String::as_str)
            .collect();

        {
            let mut board = self.shared.board.lock().unwrap();
            board.ever_queued.clear();

            for row in self.shared.store.read()? {
                if row.status != TaskStatus::Success || skipped.contains(row.name.as_str()) {
                    continue;
                }
                match board.states.get_mut(&row.name) {
                    Some(st) => {
                        st.status = TaskStatus::Success;
                        st.used_time = row.used_time;
                        st.mem = row.mem;
                        st.cpu = row.cpu;
                        st.pid = row.pid;
                        board.ever_queued.insert(row.name);
                    }
                    None => {
                        warn!("{} was skipped for a modified pipeline config", row.name);
                    }
                }
            }

            let remaining: Vec<&str> = self
                .shared
                .graph
                .names()
                .iter()
                .filter(|n| !board.ever_queued.contains(n.as_str()))
                .map(String::as_str)
                .collect();
            if remaining.is_empty() {
                warn!("Nothing to continue run");
            } else {
                warn!("Continue to run: {remaining:?}");
            }

            self.shared.update_queue(&mut board);
            self.shared.redraw(&board);
        }
        Ok(self.run_pool())
    }

    fn run_pool(&self) -> (usize, usize) {
        // The exit protocol must be in place before the first worker can
        // spawn a child: the guard records final state and reaps children on
        // every exit path, the signal handler on SIGTERM/SIGINT.
        let _guard = ExitGuard(Arc::clone(&self.shared));
        let finalize = Arc::clone(&self.shared);
        procwatch::install_termination_handler(Arc::new(move || finalize.finalize()));

        let threads = self.shared.graph.threads().max(1);
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || shared.worker_loop())
                .expect("spawn worker thread");
            workers.push(handle);
        }

        // One early snapshot so the file reflects the starting state.
        std::thread::sleep(WARMUP_SNAPSHOT_DELAY);
        {
            let mut board = self.shared.board.lock().unwrap();
            self.shared.refresh_states(&mut board, false);
            self.shared.persist(&board);
            self.shared.redraw(&board);
        }

        for handle in workers {
            let _ = handle.join();
        }

        let (success, total) = {
            let board = self.shared.board.lock().unwrap();
            (board.success, self.shared.graph.len())
        };
        warn!("Finished all tasks!");
        warn!("Success/Total = {success}/{total}");
        (success, total)
    }
}

/// Runs the final state/kill sequence when the controller leaves
/// `run_pool` for any reason, including panic unwinds.
struct ExitGuard(Arc<Shared>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.finalize();
    }
}

impl Shared {
    /// Admit a task: record it, mark it queueing, hand it to the pool.
    fn enqueue(&self, board: &mut Board, name: &str) {
        board.ever_queued.insert(name.to_string());
        if let Some(st) = board.states.get_mut(name) {
            st.status = TaskStatus::Queueing;
        }
        let _ = self.tx.send(Some(name.to_string()));
    }

    /// Ready-queue discipline, under the lock. Failure propagates to
    /// dependents transitively across successive passes; once nothing is
    /// left waiting, the sentinel tells the pool to wind down.
    fn update_queue(&self, board: &mut Board) {
        let success = terminal_set(board, TaskStatus::Success);
        let failed = terminal_set(board, TaskStatus::Failed);

        let waiting: Vec<String> = self
            .graph
            .names()
            .iter()
            .filter(|n| !board.ever_queued.contains(n.as_str()))
            .cloned()
            .collect();

        if waiting.is_empty() {
            let _ = self.tx.send(None);
            return;
        }

        for name in waiting {
            let deps = self.graph.dependency(&name);
            if deps.iter().any(|d| failed.contains(d.as_str())) {
                board.ever_queued.insert(name.clone());
                if let Some(st) = board.states.get_mut(&name) {
                    st.status = TaskStatus::Failed;
                    st.used_time = UsedTime::FailedDependencies;
                }
                warn!("{name} cannot be started for some failed dependencies!");
            } else if deps.iter().all(|d| success.contains(d.as_str())) {
                self.enqueue(board, &name);
            }
        }
    }

    /// Fold one finished attempt back into the task's record.
    fn merge_attempt(&self, board: &mut Board, name: &str, runner: &TaskRunner, denied: bool) {
        let Some(st) = board.states.get_mut(name) else {
            return;
        };
        if denied {
            st.status = TaskStatus::Failed;
            st.used_time = UsedTime::NotEnoughResource;
            warn!("{name} cannot be started for not enough resource!");
            return;
        }
        match runner.exit_code {
            None => {
                st.status = TaskStatus::Failed;
                st.used_time = UsedTime::Unknown;
                warn!("{name} could not be started!");
            }
            Some(code) => {
                st.status = if code == 0 {
                    TaskStatus::Success
                } else {
                    TaskStatus::Failed
                };
                st.used_time = UsedTime::Seconds(runner.used_time);
                st.mem = Some(runner.max_mem);
                st.cpu = Some(runner.max_cpu);
                st.pid = runner.pid;
            }
        }
    }

    /// Recompute the terminal counters and the non-terminal display states
    /// from the live-process table. With `killed` set (final pass), tasks
    /// whose child is still alive are recorded as killed.
    fn refresh_states(&self, board: &mut Board, killed: bool) {
        let success = terminal_set(board, TaskStatus::Success).len();
        let failed = terminal_set(board, TaskStatus::Failed).len();
        board.success = success;
        board.failed = failed;

        let live = procwatch::live_by_name();
        for name in self.graph.names() {
            let in_flight = board.ever_queued.contains(name.as_str());
            let Some(st) = board.states.get_mut(name.as_str()) else {
                continue;
            };
            if st.status.is_terminal() {
                continue;
            }
            if !in_flight {
                st.status = TaskStatus::Outdoor;
                continue;
            }
            match live.get(name.as_str()) {
                Some(pid) => {
                    st.pid = Some(*pid);
                    st.status = if killed {
                        TaskStatus::Killed
                    } else {
                        TaskStatus::Running
                    };
                }
                None => st.status = TaskStatus::Queueing,
            }
        }
    }

    fn persist(&self, board: &Board) {
        let rows = self
            .graph
            .names()
            .iter()
            .map(|n| (n.as_str(), &board.states[n.as_str()]));
        if let Err(e) = self.store.write(rows) {
            // The in-memory map stays authoritative; the run continues.
            warn!("snapshot not written: {e}");
        }
    }

    fn redraw(&self, board: &Board) {
        let rows = self
            .graph
            .names()
            .iter()
            .map(|n| (n.as_str(), &board.states[n.as_str()]));
        self.drawer.draw(rows, &self.outdir);
    }

    /// One worker of the pool.
    fn worker_loop(&self) {
        loop {
            if self.rx.is_empty() {
                std::thread::sleep(IDLE_SLEEP);
                let mut board = self.board.lock().unwrap();
                self.update_queue(&mut board);
                self.persist(&board);
                self.redraw(&board);
                continue;
            }
            let Ok(msg) = self.rx.recv() else {
                break;
            };
            let Some(name) = msg else {
                // Pass the sentinel on so every sibling terminates too.
                let _ = self.tx.send(None);
                break;
            };

            let spec = self
                .graph
                .task(&name)
                .expect("queued name is a task")
                .clone();
            let mut runner = TaskRunner::new(&spec, &self.outdir);
            let mut denied = false;
            let mut attempts = 0u32;

            while attempts <= spec.retry {
                attempts += 1;
                if spec.check_resource_before_run
                    && !resource::is_enough(spec.cpu, spec.mem, self.wait_timeout)
                {
                    warn!("local resource is not enough for {name}!");
                    denied = true;
                    break;
                }
                if attempts > 1 {
                    warn!("{attempts}th run {name}");
                }
                {
                    let mut board = self.board.lock().unwrap();
                    if let Some(st) = board.states.get_mut(&name) {
                        st.status = TaskStatus::Running;
                    }
                    self.redraw(&board);
                }
                if let Err(e) = runner.run() {
                    warn!("{name} failed to launch: {e:#}");
                    break;
                }
                if runner.exit_code == Some(0) {
                    break;
                }
            }

            let mut board = self.board.lock().unwrap();
            self.merge_attempt(&mut board, &name, &runner, denied);
            self.refresh_states(&mut board, false);
            self.update_queue(&mut board);
            self.persist(&board);
            self.redraw(&board);
        }
    }

    /// Final "update status on exit" pass: record still-running tasks as
    /// killed, persist, redraw, then reap every surviving child. Runs at
    /// most once even when reached from several exit paths.
    fn finalize(&self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut board = self.board.lock().unwrap();
            self.refresh_states(&mut board, true);
            self.persist(&board);
            self.redraw(&board);
        }
        procwatch::kill_all();
    }
}

fn terminal_set(board: &Board, status: TaskStatus) -> HashSet<String> {
    board
        .states
        .iter()
        .filter(|(_, st)| st.status == status)
        .map(|(n, _)| n.clone())
        .collect()
}

// ---------- Unit tests ----------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskGraph;
    use std::fmt::Write as _;

    fn graph(body: &str) -> TaskGraph {
        let mut text = String::from(
            "[mode]\nthreads = 4\nretry = 0\nmonitor_resource = no\nmonitor_time_step = 2\ncheck_resource_before_run = no\n\n",
        );
        text.push_str(body);
        TaskGraph::parse(&text, "test.ini").unwrap()
    }

    fn scheduler(g: TaskGraph, dir: &Path) -> Scheduler {
        Scheduler::new(g, dir, 10.0, Drawer::Noop)
    }

    #[test]
    fn skip_matching_is_exact_or_prefix_before_underscore() {
        assert!(matches_skip("align", "align"));
        assert!(matches_skip("align_sample1", "align"));
        assert!(!matches_skip("alignment", "align"));
        assert!(!matches_skip("align", "align_sample1"));
    }

    #[test]
    fn linear_chain_runs_to_all_success() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out.txt");
        let mut body = String::new();
        writeln!(body, "[a]\ncmd = echo a >> {}\n", out.display()).unwrap();
        writeln!(body, "[b]\ncmd = echo b >> {}\ndepend = a\n", out.display()).unwrap();
        writeln!(body, "[c]\ncmd = echo c >> {}\ndepend = b\n", out.display()).unwrap();

        let s = scheduler(graph(&body), tmp.path());
        let (success, total) = s.run();
        assert_eq!((success, total), (3, 3));

        // Strict predecessor ordering is observable in the shared file.
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "a\nb\nc\n");

        let rows = StateStore::new(tmp.path()).read().unwrap();
        assert!(rows.iter().all(|r| r.status == TaskStatus::Success));
    }

    #[test]
    fn failure_propagates_to_dependents_without_running_them() {
        let tmp = tempfile::tempdir().unwrap();
        let attempts = tmp.path().join("attempts.txt");
        let canary = tmp.path().join("canary.txt");
        let mut body = String::new();
        writeln!(body, "[good]\ncmd = true\n").unwrap();
        writeln!(
            body,
            "[bad]\ncmd = echo try >> {}; exit 1\ndepend = good\nretry = 2\n",
            attempts.display()
        )
        .unwrap();
        writeln!(
            body,
            "[after]\ncmd = touch {}\ndepend = bad\n",
            canary.display()
        )
        .unwrap();

        let s = scheduler(graph(&body), tmp.path());
        let (success, total) = s.run();
        assert_eq!((success, total), (1, 3));

        // retry = 2 means three attempts in total.
        let tries = std::fs::read_to_string(&attempts).unwrap();
        assert_eq!(tries.lines().count(), 3);

        // The dependent never spawned a child.
        assert!(!canary.exists());

        let rows = StateStore::new(tmp.path()).read().unwrap();
        let after = rows.iter().find(|r| r.name == "after").unwrap();
        assert_eq!(after.status, TaskStatus::Failed);
        assert_eq!(after.used_time, UsedTime::FailedDependencies);
        let bad = rows.iter().find(|r| r.name == "bad").unwrap();
        assert_eq!(bad.status, TaskStatus::Failed);
        assert!(matches!(bad.used_time, UsedTime::Seconds(_)));
    }

    #[test]
    fn resource_denial_fails_without_spawning() {
        let tmp = tempfile::tempdir().unwrap();
        let canary = tmp.path().join("canary.txt");
        let body = format!(
            "[greedy]\ncmd = touch {}\ncpu = 1000000000\ncheck_resource_before_run = yes\n",
            canary.display()
        );
        let s = Scheduler::new(graph(&body), tmp.path(), 1.0, Drawer::Noop);
        let (success, _) = s.run();
        assert_eq!(success, 0);
        assert!(!canary.exists());

        let rows = StateStore::new(tmp.path()).read().unwrap();
        assert_eq!(rows[0].status, TaskStatus::Failed);
        assert_eq!(rows[0].used_time, UsedTime::NotEnoughResource);
    }

    #[test]
    fn resume_reruns_only_what_is_not_recorded_successful() {
        let tmp = tempfile::tempdir().unwrap();
        let a_runs = tmp.path().join("a.txt");
        let c_runs = tmp.path().join("c.txt");
        let mut body = String::new();
        writeln!(body, "[a]\ncmd = echo ran >> {}\n", a_runs.display()).unwrap();
        writeln!(
            body,
            "[c]\ncmd = echo ran >> {}\ndepend = a\n",
            c_runs.display()
        )
        .unwrap();

        let first = scheduler(graph(&body), tmp.path());
        assert_eq!(first.run(), (2, 2));

        // Resume skipping `c`: only `c` runs again.
        let second = scheduler(graph(&body), tmp.path());
        let skip = vec!["c".to_string()];
        assert_eq!(second.resume(&skip).unwrap(), (2, 2));

        assert_eq!(std::fs::read_to_string(&a_runs).unwrap().lines().count(), 1);
        assert_eq!(std::fs::read_to_string(&c_runs).unwrap().lines().count(), 2);
    }

    #[test]
    fn resume_without_snapshot_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let s = scheduler(graph("[a]\ncmd = true\n"), tmp.path());
        assert!(s.resume(&[]).is_err());
    }
}
