//! Priority inheritance: the lowest-priority task locks a mutex, gets
//! preempted by successively higher-priority tasks, and the last one
//! blocks on the mutex — which must raise the holder above the
//! intermediate task so the holder (not the intermediate task) is the
//! next one to run.
mod common;

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use micrort_kernel::mutex::{mutex_lock, mutex_unlock, Protocol};
use micrort_kernel::task::{task_activate, task_suspend};
use micrort_kernel::{IdleTaskConfig, Kernel, Mutex, Task, Timeout};
use micrort_port_sim::{bind_kernel, SimPort};

const NUM_PRIO: usize = 8;
const NUM_BUCKETS: usize = 4;

static EVENTS: StdMutex<Vec<String>> = StdMutex::new(Vec::new());
static M: Mutex<SimPort> = Mutex::new(Protocol::Inherit, false);

unsafe extern "C" fn idle_entry(_arg: usize) -> ! {
    loop {
        std::thread::park();
    }
}

static KERNEL: Kernel<SimPort> = Kernel::new(NUM_PRIO, NUM_BUCKETS, idle_entry);

// A = 1 (most urgent), B = 2, C = 3 (least urgent of the three).
static TASK_A: Task<SimPort> = Task::new(entry_a, 0, 1);
static TASK_B: Task<SimPort> = Task::new(entry_b, 0, 2);
static TASK_C: Task<SimPort> = Task::new(entry_c, 0, 3);

unsafe extern "C" fn entry_c(_arg: usize) -> ! {
    let rc = mutex_lock(&KERNEL, &M, Timeout::Infinite);
    EVENTS.lock().unwrap().push(format!("c_locked:{rc:?}"));

    let mut b_stack = [0u8; 64];
    task_activate(&KERNEL, &TASK_B, &mut b_stack, 0).unwrap();

    EVENTS.lock().unwrap().push("c_resumed".to_string());
    let rc = mutex_unlock(&KERNEL, &M);
    EVENTS.lock().unwrap().push(format!("c_unlocked:{rc:?}"));
    loop {
        std::thread::park();
    }
}

unsafe extern "C" fn entry_b(_arg: usize) -> ! {
    EVENTS.lock().unwrap().push("b_started".to_string());

    let mut a_stack = [0u8; 64];
    task_activate(&KERNEL, &TASK_A, &mut a_stack, 0).unwrap();

    EVENTS.lock().unwrap().push("b_resumed".to_string());
    loop {
        std::thread::park();
    }
}

unsafe extern "C" fn entry_a(_arg: usize) -> ! {
    EVENTS.lock().unwrap().push("a_started".to_string());
    let rc = mutex_lock(&KERNEL, &M, Timeout::Infinite);
    EVENTS.lock().unwrap().push(format!("a_acquired:{rc:?}"));
    let _ = task_suspend(&KERNEL, &TASK_A);
    loop {
        std::thread::park();
    }
}

#[test]
fn blocked_higher_priority_waiter_raises_holder_above_intermediate_task() {
    bind_kernel(&KERNEL);
    std::thread::spawn(|| {
        let mut idle_stack = [0u8; 64];
        KERNEL.sys_start(
            IdleTaskConfig { stack: &mut idle_stack },
            |k| {
                let mut c_stack = [0u8; 64];
                task_activate(k, &TASK_C, &mut c_stack, 0).unwrap();
            },
            || loop {
                std::thread::park();
            },
        );
    });

    assert!(
        common::wait_until(|| EVENTS.lock().unwrap().len() >= 6, Duration::from_secs(5)),
        "timed out: {:?}",
        EVENTS.lock().unwrap()
    );
    let events = EVENTS.lock().unwrap().clone();
    // Critically, "c_resumed" — not a "b_*" event — is what runs
    // immediately after A blocks on the mutex: that's only possible if C
    // was actually raised above B's priority while it held the mutex.
    assert_eq!(
        events,
        vec![
            "c_locked:Ok".to_string(),
            "b_started".to_string(),
            "a_started".to_string(),
            "c_resumed".to_string(),
            "c_unlocked:Ok".to_string(),
            "a_acquired:Ok".to_string(),
            "b_resumed".to_string(),
        ]
    );
}
