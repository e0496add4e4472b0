//! Process-wide table of live child processes and the termination guard.
//!
//! Every spawned child is registered as `pid -> task name` and removed again
//! once it has been reaped, so the table only ever names children that may
//! still be running. It exists solely so the exit path can find and kill
//! survivors; reads may race with reaping, which is acceptable for a
//! best-effort kill (a stale pid draws ESRCH and is skipped).

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use tracing::warn;

static LIVE: LazyLock<Mutex<HashMap<u32, String>>> = LazyLock::new(|| Mutex::new(HashMap::new()));

pub fn register(pid: u32, name: &str) {
    LIVE.lock().unwrap().insert(pid, name.to_string());
}

pub fn unregister(pid: u32) {
    LIVE.lock().unwrap().remove(&pid);
}

/// Reverse view `task name -> pid` of the live children.
pub fn live_by_name() -> HashMap<String, u32> {
    LIVE.lock()
        .unwrap()
        .iter()
        .map(|(pid, name)| (name.clone(), *pid))
        .collect()
}

pub fn is_alive(pid: u32) -> bool {
    // Signal 0 probes for existence without delivering anything.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Force-kill every child still alive. Runs on every exit path: normal
/// return, panic unwind, and termination signals.
pub fn kill_all() {
    let live: Vec<(u32, String)> = {
        let table = LIVE.lock().unwrap();
        table.iter().map(|(p, n)| (*p, n.clone())).collect()
    };
    for (pid, name) in live {
        if !is_alive(pid) {
            continue;
        }
        warn!("Shutting down running tasks {pid}:{name}");
        let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            // ESRCH: already gone between the probe and the kill.
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!("failed to kill {pid}:{name}: {err}");
            }
        }
    }
}

/// Install the SIGTERM/SIGINT handler: record final state via `finalize`,
/// kill surviving children, exit. Installation can only happen once per
/// process; a second scheduler in the same process logs and proceeds
/// without its own handler.
pub fn install_termination_handler(finalize: Arc<dyn Fn() + Send + Sync>) {
    let result = ctrlc::set_handler(move || {
        warn!("termination signal received, shutting down running tasks");
        finalize();
        kill_all();
        std::process::exit(130);
    });
    if let Err(e) = result {
        warn!("signal handler not installed: {e}");
    }
}
