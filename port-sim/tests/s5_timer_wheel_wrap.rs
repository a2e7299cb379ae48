//! Hierarchical timer wheel wrap-around: a long-relative timeout (7 ticks,
//! bucket count K = 4) is parked in the generic bucket and must be
//! re-bucketed and still fire on the tick it was due, alongside a timer
//! re-armed mid-flight by another timer's own callback.
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use micrort_kernel::timer::timer_start;
use micrort_kernel::{Kernel, Timer};
use micrort_port_sim::{advance_tick, SimPort};

const NUM_PRIO: usize = 4;
const NUM_BUCKETS: usize = 4;

static FIRES: Mutex<Vec<(u32, usize)>> = Mutex::new(Vec::new());
static CUR_TICK: AtomicU32 = AtomicU32::new(0);

unsafe extern "C" fn idle_entry(_arg: usize) -> ! {
    loop {
        std::thread::park();
    }
}

static KERNEL: Kernel<SimPort> = Kernel::new(NUM_PRIO, NUM_BUCKETS, idle_entry);

static T1: Timer<SimPort> = Timer::new(
    |kernel, _token, _user_data| {
        FIRES.lock().unwrap().push((CUR_TICK.load(Ordering::SeqCst), 1));
        // Re-arm a third timer from inside the callback, the way a
        // periodic timer restarts itself.
        let _ = timer_start(kernel, &T3, 4);
    },
    0,
);
static T2: Timer<SimPort> = Timer::new(
    |_kernel, _token, _user_data| {
        FIRES.lock().unwrap().push((CUR_TICK.load(Ordering::SeqCst), 2));
    },
    0,
);
static T3: Timer<SimPort> = Timer::new(
    |_kernel, _token, _user_data| {
        FIRES.lock().unwrap().push((CUR_TICK.load(Ordering::SeqCst), 3));
    },
    0,
);

#[test]
fn wraparound_rebuckets_a_long_relative_timeout_and_still_fires_it_on_time() {
    timer_start(&KERNEL, &T1, 3).unwrap();
    timer_start(&KERNEL, &T2, 7).unwrap();

    for tick in 1..=7u32 {
        CUR_TICK.store(tick, Ordering::SeqCst);
        advance_tick(&KERNEL);
    }

    let fires = FIRES.lock().unwrap().clone();
    assert_eq!(fires, vec![(3, 1), (7, 2), (7, 3)], "fires: {fires:?}");
}
