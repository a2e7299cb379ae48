//! A capacity-0 queue is a pure rendezvous: a receiver blocked on an empty
//! queue gets handed the value directly out of a matching `send`, which
//! itself never touches storage.
mod common;

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use micrort_kernel::queue::{queue_receive, queue_send};
use micrort_kernel::task::{task_activate, task_suspend};
use micrort_kernel::{IdleTaskConfig, Kernel, Queue, Task, Timeout};
use micrort_port_sim::{bind_kernel, SimPort};

const NUM_PRIO: usize = 8;
const NUM_BUCKETS: usize = 4;

static EVENTS: StdMutex<Vec<String>> = StdMutex::new(Vec::new());
static Q: Queue<SimPort, 0> = Queue::new();

unsafe extern "C" fn idle_entry(_arg: usize) -> ! {
    loop {
        std::thread::park();
    }
}

static KERNEL: Kernel<SimPort> = Kernel::new(NUM_PRIO, NUM_BUCKETS, idle_entry);

// R is more urgent than S: once R blocks on an empty queue it hands off
// to S directly, and once S's send completes it hands back to R.
static RECEIVER: Task<SimPort> = Task::new(receiver_entry, 0, 3);
static SENDER: Task<SimPort> = Task::new(sender_entry, 0, 4);

unsafe extern "C" fn receiver_entry(_arg: usize) -> ! {
    EVENTS.lock().unwrap().push("r_started".to_string());

    let mut s_stack = [0u8; 64];
    task_activate(&KERNEL, &SENDER, &mut s_stack, 0).unwrap();
    EVENTS.lock().unwrap().push("r_after_activate_s".to_string());

    let (rc, value) = queue_receive(&KERNEL, &Q, Timeout::Infinite);
    EVENTS.lock().unwrap().push(format!("r_received:{rc:?},{value}"));
    let _ = task_suspend(&KERNEL, &RECEIVER);
    loop {
        std::thread::park();
    }
}

unsafe extern "C" fn sender_entry(_arg: usize) -> ! {
    EVENTS.lock().unwrap().push("s_started".to_string());
    let rc = queue_send(&KERNEL, &Q, 42, Timeout::Infinite);
    EVENTS.lock().unwrap().push(format!("s_sent:{rc:?}"));
    loop {
        std::thread::park();
    }
}

#[test]
fn send_completes_immediately_into_a_blocked_receiver() {
    bind_kernel(&KERNEL);
    std::thread::spawn(|| {
        let mut idle_stack = [0u8; 64];
        KERNEL.sys_start(
            IdleTaskConfig { stack: &mut idle_stack },
            |k| {
                let mut r_stack = [0u8; 64];
                task_activate(k, &RECEIVER, &mut r_stack, 0).unwrap();
            },
            || loop {
                std::thread::park();
            },
        );
    });

    assert!(
        common::wait_until(|| EVENTS.lock().unwrap().len() >= 5, Duration::from_secs(5)),
        "timed out: {:?}",
        EVENTS.lock().unwrap()
    );
    let events = EVENTS.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "r_started".to_string(),
            "r_after_activate_s".to_string(),
            "s_started".to_string(),
            "r_received:Ok,42".to_string(),
            "s_sent:Ok".to_string(),
        ]
    );
}
