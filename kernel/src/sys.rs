//! The kernel aggregate (spec §9 "Global mutable state → explicit kernel
//! context") and the two external entry points (spec §6).
use crate::klock::{self, CpuLockCell, CpuLockToken};
use crate::list::List;
use crate::port::{self, Port};
use crate::task::Task;
use crate::timer::Timer;

/// Upper bound on priority levels, fixed by the target's word width
/// (spec §3: "P equals the machine word bit width"). `Kernel::new`'s
/// `num_priorities` is checked to be in `1..=MAX_PRIO`.
pub const MAX_PRIO: usize = usize::BITS as usize;

/// Upper bound on timer wheel buckets. The spec leaves `K` a build-time
/// constant without naming a bound; this crate caps it so the wheel can
/// live in a fixed-size array instead of requiring an allocator.
/// `Kernel::new`'s `num_tick_buckets` is checked to be a power of two in
/// `2..=MAX_TICK_BUCKETS`.
pub const MAX_TICK_BUCKETS: usize = 64;

/// The process-wide scheduler and timer-wheel state (spec §3 "Ready
/// structure", §4.7 "Timer wheel").
///
/// There is exactly one `Kernel` per `Port` type: the CPU-lock token type
/// is tagged by `P`, so `tokenlock` statically forbids constructing two
/// independent `CpuLockToken<P>` universes, which in turn forbids two
/// live `Kernel<P>`s from ever disagreeing about what "locked" means.
pub struct Kernel<P: Port> {
    pub(crate) num_priorities: usize,
    pub(crate) ready_bitmap: CpuLockCell<P, usize>,
    pub(crate) ready: [List<P, Task<P>>; MAX_PRIO],
    pub(crate) current: CpuLockCell<P, Option<&'static Task<P>>>,
    pub(crate) slice_length: [CpuLockCell<P, u32>; MAX_PRIO],

    pub(crate) num_tick_buckets: usize,
    pub(crate) tick_count: CpuLockCell<P, u32>,
    pub(crate) tick_buckets: [List<P, Timer<P>>; MAX_TICK_BUCKETS],
    pub(crate) generic_bucket: List<P, Timer<P>>,

    pub(crate) idle: Task<P>,

    #[cfg(feature = "deadlock_detection")]
    pub(crate) on_deadlock: Option<crate::mutex::DeadlockCallback<P>>,
}

/// Parameters for the single idle task `sys_start` creates and runs when
/// no other task is runnable.
pub struct IdleTaskConfig<'a> {
    pub stack: &'a mut [u8],
}

impl<P: Port> Kernel<P> {
    /// Build a `Kernel`. `num_priorities` must be in `1..=MAX_PRIO` and
    /// `num_tick_buckets` a power of two in `2..=MAX_TICK_BUCKETS`;
    /// violating either is a configuration bug, not a runtime condition,
    /// so it panics rather than returning `RC`.
    pub const fn new(num_priorities: usize, num_tick_buckets: usize, idle_entry: unsafe extern "C" fn(usize) -> !) -> Self {
        assert!(num_priorities >= 1 && num_priorities <= MAX_PRIO);
        assert!(num_tick_buckets >= 2 && num_tick_buckets <= MAX_TICK_BUCKETS);
        assert!(num_tick_buckets.is_power_of_two());

        Self {
            num_priorities,
            ready_bitmap: CpuLockCell::new(0),
            ready: [const { List::new() }; MAX_PRIO],
            current: CpuLockCell::new(None),
            slice_length: [const { CpuLockCell::new(0) }; MAX_PRIO],
            num_tick_buckets,
            tick_count: CpuLockCell::new(0),
            tick_buckets: [const { List::new() }; MAX_TICK_BUCKETS],
            generic_bucket: List::new(),
            idle: Task::new(idle_entry, 0, (num_priorities - 1) as u8),
            #[cfg(feature = "deadlock_detection")]
            on_deadlock: None,
        }
    }

    /// Install the callback invoked when the mutex deadlock detector
    /// (spec §4.4 "Deadlock detection") finds, or clears, a cycle.
    #[cfg(feature = "deadlock_detection")]
    pub const fn with_deadlock_callback(mut self, cb: crate::mutex::DeadlockCallback<P>) -> Self {
        self.on_deadlock = Some(cb);
        self
    }

    pub(crate) fn tick_mask(&self) -> u32 {
        (self.num_tick_buckets - 1) as u32
    }

    /// Start the kernel: initialize the idle task's stack, make it
    /// runnable, and hand control to it. Never returns.
    ///
    /// `user_init` is invoked once, from the idle task, with interrupts
    /// still disabled; it must create and activate at least one
    /// application task and arm the hardware tick source before
    /// returning. `idle_cb` then runs in a loop with interrupts enabled
    /// whenever no other task is runnable.
    pub fn sys_start(&'static self, idle: IdleTaskConfig<'_>, user_init: impl FnOnce(&'static Self), idle_cb: impl Fn() + 'static) -> ! {
        let mut lock = klock::lock_cpu::<P>();
        crate::task::activate(self, &mut lock, &self.idle, idle.stack, 0).expect("idle task is freshly constructed and dormant");
        self.current.set(&mut lock, Some(&self.idle));

        drop(lock);
        // Safety: called once, before any task has run, with no live
        // stack references into the caller's frame that matter after
        // this point — `sys_start` never returns.
        unsafe { P::int_disable() };
        user_init(self);
        unsafe { P::int_enable() };

        loop {
            idle_cb();
        }
    }

    /// The tick ISR entry point (spec §6). Must be called with
    /// interrupts already disabled, from interrupt context only.
    pub fn tick_int_processing(&'static self) {
        debug_assert!(P::inside_isr());
        debug_assert!(P::is_int_disabled());
        let mut lock = klock::lock_cpu::<P>();
        crate::timer::tick(self, &mut lock);
        crate::task::rotate_time_slice(self, &mut lock);
    }

    /// The task the scheduler has decided should run next, as of the most
    /// recent [`task::reschedule`](crate::task) (spec §9 "the scheduler
    /// updates `current` before requesting a switch"). A [`Port`]
    /// implementation's `context_switch_pend`/`context_switch_now_nosave`
    /// calls this to learn which task to dispatch to, without needing any
    /// of the kernel's internal locking machinery.
    pub fn current_task(&'static self) -> Option<&'static Task<P>> {
        let lock = klock::lock_cpu::<P>();
        self.current.get(&lock)
    }

    /// The architecture-specific state ([`Port::TaskState`]) of the task
    /// [`Kernel::current_task`] names, ready to hand to whatever register
    /// or stack-pointer swap the target CPU needs.
    pub fn current_task_state(&'static self) -> Option<P::TaskState> {
        let lock = klock::lock_cpu::<P>();
        self.current.get(&lock).and_then(|t| t.port_state(&lock))
    }

    /// The kernel's built-in idle task, the one [`sys_start`](Self::sys_start)
    /// creates and activates itself. A [`Port`] can compare this against
    /// [`Kernel::current_task`] to recognize "nothing else is runnable"
    /// without reaching into kernel-private state.
    pub fn idle_task(&'static self) -> &'static Task<P> {
        &self.idle
    }

    pub(crate) fn ffs_ready(&self, token: &CpuLockToken<P>) -> Option<usize> {
        let bits = self.ready_bitmap.get(token);
        if bits == 0 {
            None
        } else {
            Some(port::ffs::<P>(bits) as usize)
        }
    }
}
