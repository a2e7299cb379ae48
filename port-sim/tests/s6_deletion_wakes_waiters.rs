//! Deleting a semaphore wakes every waiter with `RC::Deleted` in the FIFO
//! order they joined the wait queue, but since the deleter (here kept the
//! most urgent task throughout) doesn't step aside until after the whole
//! wait list has drained, nobody actually *runs* until then — and the
//! order they run in afterward is priority order, not wait-queue order.
mod common;

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use micrort_kernel::semaphore::{sem_delete, sem_wait};
use micrort_kernel::task::{task_activate, task_sleep, task_suspend};
use micrort_kernel::{IdleTaskConfig, Kernel, Semaphore, Task, Timeout};
use micrort_port_sim::{advance_tick, bind_kernel, SimPort};

const NUM_PRIO: usize = 16;
const NUM_BUCKETS: usize = 4;

static EVENTS: StdMutex<Vec<String>> = StdMutex::new(Vec::new());
static SEM: Semaphore<SimPort> = Semaphore::new(0, 4);

unsafe extern "C" fn idle_entry(_arg: usize) -> ! {
    loop {
        std::thread::park();
    }
}

static KERNEL: Kernel<SimPort> = Kernel::new(NUM_PRIO, NUM_BUCKETS, idle_entry);

// The deleter is the most urgent task throughout (priority 1), so
// activating each of these (all less urgent) never preempts it; it
// deliberately sleeps one tick after each activation instead, to give the
// freshly-activated waiter a turn to reach its own `sem_wait` and block.
// Waiters are activated least-urgent first, so the wait queue fills in
// the order d, c, b, a — the reverse of their priority order (a is most
// urgent, d least), so a FIFO/priority mixup would show up directly in
// the order they log their result.
static DELETER: Task<SimPort> = Task::new(deleter_entry, 0, 1);
static WAITER_A: Task<SimPort> = Task::new(waiter_entry_a, 0, 2);
static WAITER_B: Task<SimPort> = Task::new(waiter_entry_b, 0, 3);
static WAITER_C: Task<SimPort> = Task::new(waiter_entry_c, 0, 4);
static WAITER_D: Task<SimPort> = Task::new(waiter_entry_d, 0, 5);

fn wait_and_log(task: &'static Task<SimPort>, name: &str) {
    let rc = sem_wait(&KERNEL, &SEM, Timeout::Infinite);
    EVENTS.lock().unwrap().push(format!("{name}:{rc:?}"));
    let _ = task_suspend(&KERNEL, task);
}

unsafe extern "C" fn waiter_entry_a(_arg: usize) -> ! {
    EVENTS.lock().unwrap().push("a_started".to_string());
    wait_and_log(&WAITER_A, "a");
    loop {
        std::thread::park();
    }
}
unsafe extern "C" fn waiter_entry_b(_arg: usize) -> ! {
    EVENTS.lock().unwrap().push("b_started".to_string());
    wait_and_log(&WAITER_B, "b");
    loop {
        std::thread::park();
    }
}
unsafe extern "C" fn waiter_entry_c(_arg: usize) -> ! {
    EVENTS.lock().unwrap().push("c_started".to_string());
    wait_and_log(&WAITER_C, "c");
    loop {
        std::thread::park();
    }
}
unsafe extern "C" fn waiter_entry_d(_arg: usize) -> ! {
    EVENTS.lock().unwrap().push("d_started".to_string());
    wait_and_log(&WAITER_D, "d");
    loop {
        std::thread::park();
    }
}

unsafe extern "C" fn deleter_entry(_arg: usize) -> ! {
    EVENTS.lock().unwrap().push("deleter_started".to_string());

    let mut d_stack = [0u8; 64];
    task_activate(&KERNEL, &WAITER_D, &mut d_stack, 0).unwrap();
    task_sleep(&KERNEL, Timeout::Ticks(1));

    let mut c_stack = [0u8; 64];
    task_activate(&KERNEL, &WAITER_C, &mut c_stack, 0).unwrap();
    task_sleep(&KERNEL, Timeout::Ticks(1));

    let mut b_stack = [0u8; 64];
    task_activate(&KERNEL, &WAITER_B, &mut b_stack, 0).unwrap();
    task_sleep(&KERNEL, Timeout::Ticks(1));

    let mut a_stack = [0u8; 64];
    task_activate(&KERNEL, &WAITER_A, &mut a_stack, 0).unwrap();
    task_sleep(&KERNEL, Timeout::Ticks(1));

    let rc = sem_delete(&KERNEL, &SEM);
    EVENTS.lock().unwrap().push(format!("deleter_done:{rc:?}"));
    let _ = task_suspend(&KERNEL, &DELETER);
    loop {
        std::thread::park();
    }
}

#[test]
fn deletion_wakes_all_waiters_which_then_run_in_priority_order() {
    bind_kernel(&KERNEL);
    std::thread::spawn(|| {
        let mut idle_stack = [0u8; 64];
        KERNEL.sys_start(
            IdleTaskConfig { stack: &mut idle_stack },
            |k| {
                let mut deleter_stack = [0u8; 64];
                task_activate(k, &DELETER, &mut deleter_stack, 0).unwrap();
            },
            || loop {
                std::thread::park();
            },
        );
    });

    // One tick per activated waiter, to step the deleter's own sleep
    // timeout forward once each waiter has had its turn to block.
    for expected_started in ["d_started", "c_started", "b_started", "a_started"] {
        assert!(
            common::wait_until(
                || EVENTS.lock().unwrap().last().map(String::as_str) == Some(expected_started),
                Duration::from_secs(5)
            ),
            "timed out waiting for {expected_started}: {:?}",
            EVENTS.lock().unwrap()
        );
        advance_tick(&KERNEL);
    }

    assert!(
        common::wait_until(|| EVENTS.lock().unwrap().len() >= 10, Duration::from_secs(5)),
        "timed out: {:?}",
        EVENTS.lock().unwrap()
    );
    let events = EVENTS.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "deleter_started".to_string(),
            "d_started".to_string(),
            "c_started".to_string(),
            "b_started".to_string(),
            "a_started".to_string(),
            "deleter_done:Ok".to_string(),
            "a:Deleted".to_string(),
            "b:Deleted".to_string(),
            "c:Deleted".to_string(),
            "d:Deleted".to_string(),
        ]
    );
}
