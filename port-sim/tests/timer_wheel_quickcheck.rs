//! Property test for the hierarchical timer wheel (spec §4.7): an
//! arbitrary batch of relative timeouts, started together and advanced
//! tick by tick, must each fire exactly once, exactly on the tick they
//! were due — whether they land directly in a tick bucket or have to be
//! swept out of the generic overflow bucket and re-bucketed first. Same
//! `BTreeSet`-reference-model shape as `micrort_kernel::port`'s priority
//! bitmap quickcheck suite, just checked against wall-clock ticks
//! instead of bit positions.
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use micrort_kernel::timer::{timer_cancel, timer_start};
use micrort_kernel::{Kernel, Timer};
use micrort_port_sim::{advance_tick, SimPort};
use quickcheck_macros::quickcheck;

const NUM_PRIO: usize = 4;
// Deliberately small so most timeouts in the test's range overflow into
// the generic bucket at least once before firing.
const NUM_BUCKETS: usize = 8;
const NUM_TIMERS: usize = 6;
const MAX_TIMEOUT: u32 = 30;

static FIRES: Mutex<Vec<(u32, usize)>> = Mutex::new(Vec::new());
static CUR_TICK: AtomicU32 = AtomicU32::new(0);

unsafe extern "C" fn idle_entry(_arg: usize) -> ! {
    loop {
        std::thread::park();
    }
}

static KERNEL: Kernel<SimPort> = Kernel::new(NUM_PRIO, NUM_BUCKETS, idle_entry);

fn record_fire(user_data: usize) {
    FIRES.lock().unwrap().push((CUR_TICK.load(Ordering::SeqCst), user_data));
}

static T0: Timer<SimPort> = Timer::new(|_k, _t, d| record_fire(d), 0);
static T1: Timer<SimPort> = Timer::new(|_k, _t, d| record_fire(d), 1);
static T2: Timer<SimPort> = Timer::new(|_k, _t, d| record_fire(d), 2);
static T3: Timer<SimPort> = Timer::new(|_k, _t, d| record_fire(d), 3);
static T4: Timer<SimPort> = Timer::new(|_k, _t, d| record_fire(d), 4);
static T5: Timer<SimPort> = Timer::new(|_k, _t, d| record_fire(d), 5);

// No task dispatch involved; `advance_tick`'s rotate-time-slice step
// no-ops with no `current` task, so this drives the wheel directly from
// the test's own thread the same way `s5_timer_wheel_wrap` does.
#[quickcheck]
fn every_timer_fires_exactly_once_at_its_relative_timeout(raw: Vec<u32>) -> bool {
    let timers: [&'static Timer<SimPort>; NUM_TIMERS] = [&T0, &T1, &T2, &T3, &T4, &T5];
    for t in timers.iter() {
        timer_cancel(&KERNEL, t);
    }
    FIRES.lock().unwrap().clear();

    let timeouts: Vec<u32> = raw.iter().take(NUM_TIMERS).map(|v| (v % MAX_TIMEOUT) + 1).collect();
    if timeouts.is_empty() {
        return true;
    }

    let start_tick = CUR_TICK.load(Ordering::SeqCst);
    for (i, &timeout) in timeouts.iter().enumerate() {
        if timer_start(&KERNEL, timers[i], timeout).is_err() {
            return false;
        }
    }

    let max_timeout = *timeouts.iter().max().unwrap();
    for _ in 0..max_timeout {
        CUR_TICK.fetch_add(1, Ordering::SeqCst);
        advance_tick(&KERNEL);
    }

    let fires = FIRES.lock().unwrap().clone();
    if fires.len() != timeouts.len() {
        return false;
    }
    timeouts.iter().enumerate().all(|(i, &timeout)| {
        let recorded = fires.iter().find(|(_, id)| *id == i).map(|(tick, _)| *tick);
        recorded == Some(start_tick + timeout)
    })
}
