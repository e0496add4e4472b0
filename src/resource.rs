//! Local resource probe gating task admission.
//!
//! A task declaring `cpu`/`mem` needs is started only once the host has that
//! much headroom. Readings are damped: three consecutive fitting samples are
//! required before admission, so a transient dip does not admit a heavy task,
//! except for short-deadline callers which accept a single sample.

use std::time::{Duration, Instant};

use sysinfo::System;
use tracing::debug;

/// Seconds between admission samples.
const POLL_STEP: Duration = Duration::from_secs(3);

/// Consecutive fitting samples required for admission.
const STEADY_SAMPLES: u32 = 3;

/// Deadlines at or below this many seconds admit on the first fitting sample.
const QUICK_DEADLINE_SECS: f64 = 10.0;

/// Idle whole cores: floor(total − total × busy%).
pub fn available_cpu(sys: &System) -> u32 {
    let total = sys.cpus().len() as f64;
    (total - total * f64::from(sys.global_cpu_usage()) * 0.01) as u32
}

/// Free physical memory in bytes.
pub fn available_mem(sys: &System) -> u64 {
    sys.free_memory()
}

/// Admission predicate: can a task needing `cpu` cores and `mem` bytes start
/// now? Polls until admitted or until the cumulative wait reaches `timeout`
/// seconds.
pub fn is_enough(cpu: f64, mem: u64, timeout: f64) -> bool {
    let start = Instant::now();
    let mut sys = System::new();

    // CPU usage is a delta between refreshes; prime the counters so the
    // first real sample is meaningful.
    sys.refresh_cpu_usage();
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);

    let mut fitting = 0u32;
    loop {
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        let free_cpu = available_cpu(&sys);
        let free_mem = available_mem(&sys);
        debug!(cpu, mem, free_cpu, free_mem, "admission sample");

        if cpu <= f64::from(free_cpu) && mem <= free_mem {
            fitting += 1;
            if fitting >= STEADY_SAMPLES {
                return true;
            }
            if timeout <= QUICK_DEADLINE_SECS {
                return true;
            }
        } else {
            fitting = 0;
        }

        if start.elapsed().as_secs_f64() >= timeout {
            return false;
        }
        std::thread::sleep(POLL_STEP);
    }
}
