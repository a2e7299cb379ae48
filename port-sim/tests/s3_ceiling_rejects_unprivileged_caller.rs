//! A task whose base priority is numerically below a ceiling mutex's
//! ceiling (i.e. more urgent than the mutex permits) must be rejected by
//! `lock` outright — no block, no priority raise on anyone.
mod common;

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use micrort_kernel::mutex::{mutex_lock, Protocol};
use micrort_kernel::task::task_activate;
use micrort_kernel::{IdleTaskConfig, Kernel, Mutex, Task, Timeout};
use micrort_port_sim::{bind_kernel, SimPort};

const NUM_PRIO: usize = 8;
const NUM_BUCKETS: usize = 4;

static EVENTS: StdMutex<Vec<String>> = StdMutex::new(Vec::new());
static M: Mutex<SimPort> = Mutex::new(Protocol::Ceiling(4), false);

unsafe extern "C" fn idle_entry(_arg: usize) -> ! {
    loop {
        std::thread::park();
    }
}

static KERNEL: Kernel<SimPort> = Kernel::new(NUM_PRIO, NUM_BUCKETS, idle_entry);

// Base priority 3 is more urgent (numerically lower) than the ceiling of 4.
static TASK: Task<SimPort> = Task::new(entry, 0, 3);

unsafe extern "C" fn entry(_arg: usize) -> ! {
    let rc = mutex_lock(&KERNEL, &M, Timeout::Infinite);
    EVENTS.lock().unwrap().push(format!("lock_attempt:{rc:?}"));
    loop {
        std::thread::park();
    }
}

#[test]
fn lock_above_ceiling_is_rejected_without_blocking() {
    bind_kernel(&KERNEL);
    std::thread::spawn(|| {
        let mut idle_stack = [0u8; 64];
        KERNEL.sys_start(
            IdleTaskConfig { stack: &mut idle_stack },
            |k| {
                let mut stack = [0u8; 64];
                task_activate(k, &TASK, &mut stack, 0).unwrap();
            },
            || loop {
                std::thread::park();
            },
        );
    });

    assert!(
        common::wait_until(|| !EVENTS.lock().unwrap().is_empty(), Duration::from_secs(5)),
        "timed out waiting for the lock attempt to return"
    );
    let events = EVENTS.lock().unwrap().clone();
    assert_eq!(events, vec!["lock_attempt:IllegalUse".to_string()]);
}
