//! Shared polling helper for the end-to-end scenario tests.
//!
//! None of the kernel's internal state is reachable from outside the
//! `micrort-kernel` crate (every accessor takes a `CpuLockToken`, which is
//! crate-private), so these tests observe scheduling order the only way an
//! external caller can: a shared event log that task bodies push into, and
//! `RC`s read back from the public entry points they call. `sys_start`
//! never returns, so each test runs it on a background thread and polls
//! the log until the expected number of entries shows up (or times out).

use std::time::{Duration, Instant};

pub fn wait_until(mut done: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = Instant::now();
    while !done() {
        if start.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    true
}

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
