//! Runs one task's shell command under supervision.
//!
//! The runner launches `sh -c <cmd>` with piped output, registers the child
//! in the live-process table, optionally samples its CPU and memory on a
//! companion thread, and enforces the wall-clock timeout from a watcher
//! thread that SIGKILLs the child on expiry. A failed child is not an error
//! here; failure is reported through the exit code. `run` only errors when
//! the shell itself cannot be spawned.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sysinfo::{ProcessesToUpdate, System};
use tracing::{info, warn};

use crate::config::TaskSpec;
use crate::logging::COMMAND_TARGET;
use crate::procwatch;

/// Poll interval of the timeout watcher.
const WATCH_STEP: Duration = Duration::from_millis(100);

pub struct TaskRunner {
    name: String,
    cmd: String,
    timeout: Duration,
    monitor: bool,
    monitor_step: Duration,
    outdir: PathBuf,
    /// Child pid once spawned.
    pub pid: Option<u32>,
    /// Final exit code; `None` until the child has run.
    pub exit_code: Option<i32>,
    /// Wall-clock seconds from spawn to reap.
    pub used_time: f64,
    /// Peak CPU in fractional cores.
    pub max_cpu: f64,
    /// Peak unique-set-size memory in bytes (RSS where USS is unavailable).
    pub max_mem: u64,
}

impl TaskRunner {
    pub fn new(spec: &TaskSpec, outdir: &Path) -> Self {
        TaskRunner {
            name: spec.name.clone(),
            cmd: spec.cmd.clone(),
            timeout: Duration::from_secs(spec.timeout),
            monitor: spec.monitor_resource,
            monitor_step: Duration::from_secs(spec.monitor_time_step.max(1)),
            outdir: outdir.to_path_buf(),
            pid: None,
            exit_code: None,
            used_time: 0.0,
            max_cpu: 0.0,
            max_mem: 0,
        }
    }

    /// Launch, supervise, and reap the child, then persist the per-attempt
    /// artifacts under `{outdir}/logs/`.
    pub fn run(&mut self) -> Result<()> {
        let start = Instant::now();
        warn!("RunStep: {}", self.name);
        info!(target: COMMAND_TARGET, "RunCmd: {}", self.cmd);

        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn shell for {}", self.name))?;

        let pid = child.id();
        self.pid = Some(pid);
        procwatch::register(pid, &self.name);

        let done = Arc::new(AtomicBool::new(false));

        let sampler = if self.monitor {
            let step = self.monitor_step;
            let done = Arc::clone(&done);
            Some(std::thread::spawn(move || sample_peaks(pid, step, &done)))
        } else {
            None
        };

        // Watcher delivers SIGKILL when the wall clock runs out; the kill
        // surfaces at the waiter as a signal death.
        let watcher = {
            let timeout = self.timeout;
            let name = self.name.clone();
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                loop {
                    std::thread::sleep(WATCH_STEP);
                    if done.load(Ordering::Relaxed) {
                        break;
                    }
                    if start.elapsed() >= timeout {
                        warn!("{name} exceeded {}s, killing pid {pid}", timeout.as_secs());
                        unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
                        break;
                    }
                }
            })
        };

        // Reads both pipes to EOF, then reaps.
        let output = child.wait_with_output().context("wait for child")?;

        done.store(true, Ordering::Relaxed);
        if let Some(handle) = sampler
            && let Ok((cpu, mem)) = handle.join()
        {
            self.max_cpu = cpu;
            self.max_mem = mem;
        }
        let _ = watcher.join();
        procwatch::unregister(pid);

        self.exit_code = Some(exit_code_of(&output.status));
        self.used_time = round4(start.elapsed().as_secs_f64());
        self.write_artifacts(&output.stdout, &output.stderr);
        Ok(())
    }

    /// Persist stdout/stderr and the resource summary. Artifacts only exist
    /// when there is something to record; failures are logged, never fatal.
    fn write_artifacts(&self, stdout: &[u8], stderr: &[u8]) {
        let log_dir = self.outdir.join("logs");
        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            warn!("cannot create {}: {e}", log_dir.display());
            return;
        }
        let pid = self.pid.unwrap_or(0);

        let persist = |suffix: &str, bytes: &[u8]| {
            let path = log_dir.join(format!("{}.{}.{}", self.name, pid, suffix));
            if let Err(e) = std::fs::write(&path, bytes) {
                warn!("cannot write {}: {e}", path.display());
            }
        };
        if !stdout.is_empty() {
            persist("stdout.txt", stdout);
        }
        if !stderr.is_empty() {
            persist("stderr.txt", stderr);
        }
        if self.max_cpu > 0.0 || self.max_mem > 0 {
            let mem_mb = round4(self.max_mem as f64 / 1024.0 / 1024.0);
            persist(
                "resource.txt",
                format!("max_cpu: {}\nmax_mem: {}M\n", self.max_cpu, mem_mb).as_bytes(),
            );
        }
    }
}

fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Sampling companion: track peak CPU (fractional cores) and peak memory
/// (USS, falling back to RSS) until the child disappears or the waiter is
/// done with it.
fn sample_peaks(pid: u32, step: Duration, done: &AtomicBool) -> (f64, u64) {
    let mut sys = System::new();
    let spid = sysinfo::Pid::from_u32(pid);
    let mut max_cpu = 0.0f64;
    let mut max_mem = 0u64;

    loop {
        if done.load(Ordering::Relaxed) {
            break;
        }
        // CPU usage is a delta between refreshes; the first sample reads 0.
        if sys.refresh_processes(ProcessesToUpdate::Some(&[spid]), true) == 0 {
            break;
        }
        let Some(proc_) = sys.process(spid) else {
            break;
        };
        let cpu = f64::from(proc_.cpu_usage()) * 0.01;
        if cpu > max_cpu {
            max_cpu = cpu;
        }
        let mem = unique_set_size(pid).unwrap_or_else(|| proc_.memory());
        if mem > max_mem {
            max_mem = mem;
        }
        std::thread::sleep(step);
    }
    (round4(max_cpu), max_mem)
}

/// Unique set size from the smaps rollup: memory the child alone accounts
/// for, unlike RSS which double-counts shared pages.
#[cfg(target_os = "linux")]
fn unique_set_size(pid: u32) -> Option<u64> {
    let proc_ = procfs::process::Process::new(pid as i32).ok()?;
    let rollup = proc_.smaps_rollup().ok()?;
    let mut uss = 0u64;
    for map in rollup.memory_map_rollup.0.iter() {
        let ext = &map.extension.map;
        uss += ext.get("Private_Clean").copied().unwrap_or(0);
        uss += ext.get("Private_Dirty").copied().unwrap_or(0);
    }
    (uss > 0).then_some(uss)
}

#[cfg(not(target_os = "linux"))]
fn unique_set_size(_pid: u32) -> Option<u64> {
    None
}

// ---------- Unit tests ----------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskSpec;

    fn spec(name: &str, cmd: &str, timeout: u64) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            cmd: cmd.to_string(),
            depend: vec![],
            cpu: 0.0,
            mem: 0,
            retry: 0,
            timeout,
            monitor_resource: false,
            monitor_time_step: 1,
            check_resource_before_run: false,
        }
    }

    #[test]
    fn successful_command_records_zero_exit_and_stdout() {
        let tmp = tempfile::tempdir().unwrap();
        let mut runner = TaskRunner::new(&spec("hello", "echo hi", 60), tmp.path());
        runner.run().unwrap();

        assert_eq!(runner.exit_code, Some(0));
        assert!(runner.used_time > 0.0);
        let pid = runner.pid.unwrap();
        let stdout = tmp.path().join("logs").join(format!("hello.{pid}.stdout.txt"));
        assert_eq!(std::fs::read_to_string(stdout).unwrap(), "hi\n");
    }

    #[test]
    fn failing_command_reports_its_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let mut runner = TaskRunner::new(&spec("boom", "echo oops >&2; exit 3", 60), tmp.path());
        runner.run().unwrap();

        assert_eq!(runner.exit_code, Some(3));
        let pid = runner.pid.unwrap();
        let logs = tmp.path().join("logs");
        assert!(logs.join(format!("boom.{pid}.stderr.txt")).exists());
        // Nothing was written to stdout, so no stdout artifact exists.
        assert!(!logs.join(format!("boom.{pid}.stdout.txt")).exists());
    }

    #[test]
    fn timeout_kills_the_child() {
        let tmp = tempfile::tempdir().unwrap();
        let start = Instant::now();
        let mut runner = TaskRunner::new(&spec("slow", "sleep 30", 1), tmp.path());
        runner.run().unwrap();

        assert!(start.elapsed() < Duration::from_secs(5), "killed promptly");
        let code = runner.exit_code.unwrap();
        assert_ne!(code, 0);
        assert_eq!(code, 128 + libc::SIGKILL);
        // The child was reaped, so the live table no longer names it.
        assert!(!crate::procwatch::live_by_name().contains_key("slow"));
    }

    #[test]
    fn monitored_run_completes_and_unregisters() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = spec("watched", "sleep 1", 30);
        s.monitor_resource = true;
        let mut runner = TaskRunner::new(&s, tmp.path());
        runner.run().unwrap();

        assert_eq!(runner.exit_code, Some(0));
        assert!(!crate::procwatch::live_by_name().contains_key("watched"));
    }

    #[test]
    fn unknown_command_is_a_nonzero_exit_not_an_error() {
        // The shell spawns fine and reports the lookup failure itself.
        let tmp = tempfile::tempdir().unwrap();
        let mut runner =
            TaskRunner::new(&spec("missing", "definitely_not_a_command_xyz", 30), tmp.path());
        runner.run().unwrap();
        assert_ne!(runner.exit_code, Some(0));
    }
}
