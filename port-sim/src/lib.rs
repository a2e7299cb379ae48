//! A hosted [`Port`] for running [`micrort_kernel`] on a desktop OS, for
//! tests and examples.
//!
//! Every task gets a real OS thread, but only one thread is ever actually
//! let run at a time — the same "one logical CPU, many backing threads"
//! idea `r3_port_std`'s UMS layer builds out of raw signals and
//! `longjmp`. This port gets there with a plain condvar-guarded
//! rendezvous instead: simpler, and sufficient for a port that only ever
//! has to satisfy `std`, not drive a real multi-core host scheduler. See
//! `DESIGN.md` for the reasoning behind that trade and the ticks-are-
//! driven-by-`advance_tick` simplification below.

use std::cell::Cell;
use std::sync::{Condvar, Mutex};
use std::thread;

use micrort_kernel::{Kernel, Port};
use once_cell::sync::{Lazy, OnceCell};
use slab::Slab;

/// Marker type implementing [`Port`] for the hosted simulation.
pub struct SimPort;

/// Minimum OS thread stack size we'll hand to [`thread::Builder`]
/// regardless of the caller-supplied buffer; task bodies here run as
/// ordinary Rust functions with normal stack needs; the kernel's `stack`
/// buffer isn't actually used as the thread's stack (see
/// `initialize_task_state`).
const MIN_STACK: usize = 256 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Owner {
    /// Whichever thread isn't a task's backing thread: the one that
    /// calls `sys_start`, `advance_tick`, or `bind_kernel`. Also stands
    /// in for the idle task, which — like on a real board — carries no
    /// state worth preserving across a preemption.
    External,
    Task(usize),
}

struct Sched {
    owner: Owner,
}

static SCHED: Mutex<Sched> = Mutex::new(Sched { owner: Owner::External });
static SCHED_CV: Condvar = Condvar::new();
static SLOTS: Lazy<Mutex<Slab<()>>> = Lazy::new(|| Mutex::new(Slab::new()));
static KERNEL: OnceCell<&'static Kernel<SimPort>> = OnceCell::new();

thread_local! {
    static MY_SLOT: Cell<Option<usize>> = Cell::new(None);
    // Nesting depth of `sr_save_int_dis`/`int_disable` on this thread.
    // Never shared: only the thread that currently owns the CPU (per
    // `SCHED`) is ever running kernel code, so a thread-local counter is
    // exactly as correct as a real disable-interrupts flag would be.
    static DEPTH: Cell<u32> = Cell::new(0);
    static IS_ISR: Cell<bool> = Cell::new(false);
    // Set when this thread is `External` and requested a switch while
    // `DEPTH` was still above one (i.e. some enclosing critical section
    // is still open). Flushed once `DEPTH` actually returns to zero — see
    // `context_switch_pend` and `flush_pending_switch`.
    static PENDING_SWITCH: Cell<bool> = Cell::new(false);
}

/// Bind the application's single kernel instance. [`SimPort`]'s
/// context-switch methods take no arguments — that's the C-ABI shape
/// the trait standardizes on — so this is how the port learns where to
/// ask "who runs next". Call once, before [`Kernel::sys_start`].
pub fn bind_kernel(kernel: &'static Kernel<SimPort>) {
    KERNEL.set(kernel).unwrap_or_else(|_| panic!("bind_kernel called more than once"));
}

fn kernel() -> &'static Kernel<SimPort> {
    *KERNEL.get().expect("bind_kernel must run before the kernel starts")
}

fn self_owner() -> Owner {
    MY_SLOT.with(|c| c.get()).map(Owner::Task).unwrap_or(Owner::External)
}

/// Who the scheduler wants running right now, in our terms.
fn target_owner() -> Owner {
    let k = kernel();
    let task = k.current_task().expect("scheduler always names a current task once started");
    if std::ptr::eq(task, k.idle_task()) {
        Owner::External
    } else {
        let idx = k.current_task_state().expect("an activated task always has port state");
        Owner::Task(idx)
    }
}

/// Hand the CPU to `next`. A real task thread blocks here until it gets
/// the CPU back (this is what makes a blocking kernel call in this port
/// actually suspend the calling thread's progress, so that whatever it
/// reads immediately afterwards — e.g. a task's wait result — reflects
/// the state as of being woken, not as of blocking). `External` has
/// nothing worth resuming — it's the boot thread driving `sys_start`'s
/// `user_init`/`idle_cb`, or a test thread calling `advance_tick` — so it
/// just hands off and keeps going.
fn switch_to(next: Owner) {
    let me = self_owner();
    if next == me {
        return;
    }
    let mut g = SCHED.lock().unwrap();
    g.owner = next;
    SCHED_CV.notify_all();
    if let Owner::Task(_) = me {
        while g.owner != me {
            g = SCHED_CV.wait(g).unwrap();
        }
    }
}

fn park_until_owner(me: Owner) {
    let mut g = SCHED.lock().unwrap();
    while g.owner != me {
        g = SCHED_CV.wait(g).unwrap();
    }
}

/// Perform a switch that was deferred because it was requested while a
/// nested critical section was still open. Only `External` ever defers
/// (see `context_switch_pend`), so this only fires anything on a thread
/// that actually set `PENDING_SWITCH`; for every task thread it's a
/// no-op flag check on every `int_enable`/`sr_restore`.
fn flush_pending_switch() {
    if DEPTH.with(|d| d.get()) == 0 && PENDING_SWITCH.with(|c| c.replace(false)) {
        switch_to(target_owner());
    }
}

fn spawn_task_thread(entry: unsafe extern "C" fn(usize) -> !, stack_len: usize, arg: usize) -> usize {
    let idx = SLOTS.lock().unwrap().insert(());
    thread::Builder::new()
        .name(format!("task-{idx}"))
        .stack_size(stack_len.max(MIN_STACK))
        .spawn(move || {
            MY_SLOT.with(|c| c.set(Some(idx)));
            park_until_owner(Owner::Task(idx));
            // Safety: `entry`/`arg` come straight from `Task::activate`,
            // which guarantees `arg` is the value bound for this
            // activation and that `entry` never returns normally.
            unsafe { entry(arg) }
        })
        .expect("spawn task thread");
    idx
}

unsafe impl Port for SimPort {
    type TaskState = usize;
    type IntState = ();

    unsafe fn int_disable() {
        DEPTH.with(|d| d.set(d.get() + 1));
    }

    unsafe fn int_enable() {
        DEPTH.with(|d| d.set(0));
        flush_pending_switch();
    }

    unsafe fn sr_save_int_dis() -> Self::IntState {
        DEPTH.with(|d| d.set(d.get() + 1));
    }

    unsafe fn sr_restore(_state: Self::IntState) {
        DEPTH.with(|d| {
            let v = d.get();
            debug_assert!(v > 0, "sr_restore without a matching sr_save_int_dis");
            d.set(v - 1);
        });
        flush_pending_switch();
    }

    fn is_int_disabled() -> bool {
        DEPTH.with(|d| d.get() > 0)
    }

    fn inside_isr() -> bool {
        IS_ISR.with(|c| c.get())
    }

    fn initialize_task_state(entry: unsafe extern "C" fn(usize) -> !, stack: &mut [u8], arg: usize) -> Self::TaskState {
        spawn_task_thread(entry, stack.len(), arg)
    }

    unsafe fn context_switch_pend() {
        // A real task's own blocking calls always request this at the
        // outermost (depth-one) critical section, so switching right away
        // is the same moment the caller's own critical section would end —
        // and it must happen here, synchronously, rather than at that
        // later point, because the kernel reads the task's wait result
        // immediately afterwards, still holding the same lock (see
        // DESIGN.md). `External` (the `sys_start`/`user_init` boot thread,
        // or a test driving `advance_tick`) commonly nests a further
        // `lock_cpu` per kernel call inside one outer disabled region, and
        // never itself reads back a wait result, so its switch is safe to
        // defer to whenever that outer region actually ends.
        match self_owner() {
            Owner::Task(_) => switch_to(target_owner()),
            Owner::External => PENDING_SWITCH.with(|c| c.set(true)),
        }
    }

    unsafe fn context_switch_now_nosave() -> ! {
        let next = target_owner();
        {
            let mut g = SCHED.lock().unwrap();
            g.owner = next;
            SCHED_CV.notify_all();
        }
        // This task is `DORMANT` and will never be `current` again; its
        // thread has nothing left to do. Leaked, not joined — see
        // DESIGN.md.
        loop {
            thread::park();
        }
    }
}

/// Deliver one simulated hardware tick. Call this from whatever thread
/// is driving the simulation (typically the same one that called
/// `sys_start` or a dedicated test-clock thread) when no task thread is
/// expected to be mid-kernel-call; this port has no way to interrupt
/// one that is, so it trades true asynchronous preemption for
/// deterministic, test-friendly tick delivery. A bare-metal port has a
/// real timer interrupt and doesn't need this tradeoff.
pub fn advance_tick(kernel: &'static Kernel<SimPort>) {
    IS_ISR.with(|c| c.set(true));
    unsafe {
        SimPort::int_disable();
        kernel.tick_int_processing();
        SimPort::int_enable();
    }
    IS_ISR.with(|c| c.set(false));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_starts_external() {
        assert_eq!(SCHED.lock().unwrap().owner, Owner::External);
    }
}
