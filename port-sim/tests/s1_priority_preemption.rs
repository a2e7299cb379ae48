//! A lower-priority task signals a semaphore a higher-priority task is
//! blocked on; the high-priority task must run to completion before the
//! signaling task resumes.
mod common;

use std::sync::Mutex;
use std::time::Duration;

use micrort_kernel::semaphore::{sem_signal, sem_wait};
use micrort_kernel::task::{task_activate, task_suspend};
use micrort_kernel::{IdleTaskConfig, Kernel, Semaphore, Task, Timeout};
use micrort_port_sim::{bind_kernel, SimPort};

const NUM_PRIO: usize = 8;
const NUM_BUCKETS: usize = 4;

static EVENTS: Mutex<Vec<String>> = Mutex::new(Vec::new());
static SEM: Semaphore<SimPort> = Semaphore::new(0, 1);

unsafe extern "C" fn idle_entry(_arg: usize) -> ! {
    loop {
        std::thread::park();
    }
}

static KERNEL: Kernel<SimPort> = Kernel::new(NUM_PRIO, NUM_BUCKETS, idle_entry);

static T_HIGH: Task<SimPort> = Task::new(t_high_entry, 0, 3);
static T_LOW: Task<SimPort> = Task::new(t_low_entry, 0, 5);

unsafe extern "C" fn t_high_entry(_arg: usize) -> ! {
    let rc = sem_wait(&KERNEL, &SEM, Timeout::Infinite);
    EVENTS.lock().unwrap().push(format!("high_woken:{rc:?}"));
    let _ = task_suspend(&KERNEL, &T_HIGH);
    loop {
        std::thread::park();
    }
}

unsafe extern "C" fn t_low_entry(_arg: usize) -> ! {
    let rc = sem_signal(&KERNEL, &SEM);
    EVENTS.lock().unwrap().push(format!("low_after_signal:{rc:?}"));
    loop {
        std::thread::park();
    }
}

#[test]
fn high_priority_task_runs_before_low_priority_task_resumes() {
    bind_kernel(&KERNEL);
    std::thread::spawn(|| {
        let mut idle_stack = [0u8; 64];
        KERNEL.sys_start(
            IdleTaskConfig { stack: &mut idle_stack },
            |k| {
                let mut low_stack = [0u8; 64];
                let mut high_stack = [0u8; 64];
                task_activate(k, &T_LOW, &mut low_stack, 0).unwrap();
                task_activate(k, &T_HIGH, &mut high_stack, 0).unwrap();
            },
            || loop {
                std::thread::park();
            },
        );
    });

    assert!(
        common::wait_until(|| EVENTS.lock().unwrap().len() >= 2, Duration::from_secs(5)),
        "timed out waiting for both tasks to run: {:?}",
        EVENTS.lock().unwrap()
    );
    let events = EVENTS.lock().unwrap().clone();
    assert_eq!(events, vec!["high_woken:Ok".to_string(), "low_after_signal:Ok".to_string()]);
}
