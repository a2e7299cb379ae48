//! The task control block and the scheduler/state-machine operations of
//! spec §4.1.
use bitflags::bitflags;

use crate::error::RC;
use crate::klock::{self, CpuLockCell, CpuLockToken};
use crate::list::{Link, List};
use crate::mutex::Mutex;
use crate::port::Port;
use crate::sys::Kernel;
use crate::timer::Timer;

bitflags! {
    /// A task's state bitmask (spec §3 invariants a–d).
    pub struct TaskState: u8 {
        const RUNNABLE = 1 << 0;
        const WAIT      = 1 << 1;
        const SUSPEND   = 1 << 2;
        const DORMANT   = 1 << 3;
    }
}

/// Why a task is currently in [`TaskState::WAIT`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WaitReason {
    None,
    Sleep,
    Sem,
    Event,
    QueueSend,
    QueueReceive,
    MutexCeiling,
    MutexInherit,
    FixedMem,
}

const MAGIC_TASK: u32 = 0x5441_534b; // "TASK"

/// Extra data a blocking object hands to, or reads back from, a
/// specific waiter — the generalized "result slot" of spec §9
/// ("before-complete hand-off"). Event groups stash the wait request
/// (pattern/mode/auto-clear) here and overwrite `actual` on release;
/// queues and the fixed memory pool stash a single data word.
#[derive(Clone, Copy)]
pub(crate) enum WaitPayload {
    None,
    Event {
        pattern: u32,
        mode: crate::event_group::WaitMode,
        clear_on_release: bool,
        actual: u32,
    },
    Word(usize),
}

/// A schedulable thread of control (spec §3 "Task (TCB)").
///
/// Created once, typically in `'static` storage owned by the application;
/// the kernel only ever borrows it through `&'static` references while it
/// is linked into a ready or wait list, per the "back pointers & cycles"
/// design note.
pub struct Task<P: Port> {
    magic: u32,
    pub(crate) link: Link<P, Task<P>>,
    pub(crate) wait_queue: CpuLockCell<P, Option<&'static List<P, Task<P>>>>,
    priority_base: CpuLockCell<P, u8>,
    priority_current: CpuLockCell<P, u8>,
    state: CpuLockCell<P, TaskState>,
    wait_reason: CpuLockCell<P, WaitReason>,
    wait_result: CpuLockCell<P, RC>,
    pub(crate) owned_mutexes: CpuLockCell<P, Option<&'static Mutex<P>>>,
    pub(crate) blocking_mutex: CpuLockCell<P, Option<&'static Mutex<P>>>,
    pub(crate) wait_payload: CpuLockCell<P, WaitPayload>,
    pub(crate) timeout: Timer<P>,
    entry: unsafe extern "C" fn(usize) -> !,
    arg: CpuLockCell<P, usize>,
    port_state: CpuLockCell<P, Option<P::TaskState>>,
    time_slice: CpuLockCell<P, u32>,
    #[cfg(feature = "deadlock_detection")]
    pub(crate) in_detected_deadlock: CpuLockCell<P, bool>,
}

impl<P: Port> Task<P> {
    /// Build a dormant task. `priority` is the task's base priority,
    /// `[0, num_priorities)`; validity against the owning `Kernel`'s
    /// configured priority count is checked by [`activate`].
    pub const fn new(entry: unsafe extern "C" fn(usize) -> !, arg: usize, priority: u8) -> Self {
        Self {
            magic: MAGIC_TASK,
            link: Link::new(),
            wait_queue: CpuLockCell::new(None),
            priority_base: CpuLockCell::new(priority),
            priority_current: CpuLockCell::new(priority),
            state: CpuLockCell::new(TaskState::DORMANT),
            wait_reason: CpuLockCell::new(WaitReason::None),
            wait_result: CpuLockCell::new(RC::Ok),
            owned_mutexes: CpuLockCell::new(None),
            blocking_mutex: CpuLockCell::new(None),
            wait_payload: CpuLockCell::new(WaitPayload::None),
            timeout: Timer::new_internal(task_timeout_callback::<P>),
            entry,
            arg: CpuLockCell::new(arg),
            port_state: CpuLockCell::new(None),
            time_slice: CpuLockCell::new(0),
            #[cfg(feature = "deadlock_detection")]
            in_detected_deadlock: CpuLockCell::new(false),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC_TASK
    }

    pub fn state(&self, token: &CpuLockToken<P>) -> TaskState {
        self.state.get(token)
    }

    pub fn base_priority(&self, token: &CpuLockToken<P>) -> u8 {
        self.priority_base.get(token)
    }

    pub fn priority(&self, token: &CpuLockToken<P>) -> u8 {
        self.priority_current.get(token)
    }

    pub fn wait_reason(&self, token: &CpuLockToken<P>) -> WaitReason {
        self.wait_reason.get(token)
    }

    pub fn wait_result(&self, token: &CpuLockToken<P>) -> RC {
        self.wait_result.get(token)
    }

    pub(crate) fn set_wait_result(&self, token: &mut CpuLockToken<P>, rc: RC) {
        self.wait_result.set(token, rc);
    }

    pub(crate) fn set_wait_reason(&self, token: &mut CpuLockToken<P>, reason: WaitReason) {
        self.wait_reason.set(token, reason);
    }

    pub(crate) fn set_state(&self, token: &mut CpuLockToken<P>, state: TaskState) {
        self.state.set(token, state);
    }

    pub(crate) fn modify_state(&self, token: &mut CpuLockToken<P>, f: impl FnOnce(&mut TaskState)) {
        self.state.modify(token, f);
    }

    pub(crate) fn wait_payload(&self, token: &CpuLockToken<P>) -> WaitPayload {
        self.wait_payload.get(token)
    }

    pub(crate) fn set_wait_payload(&self, token: &mut CpuLockToken<P>, payload: WaitPayload) {
        self.wait_payload.set(token, payload);
    }

    pub(crate) fn port_state(&self, token: &CpuLockToken<P>) -> Option<P::TaskState> {
        self.port_state.get(token)
    }
}

/// The callback bound to every task's embedded timeout timer: fire
/// `complete_wait` with `RC::Timeout`. `user_data` is the task's own
/// address, stashed by [`activate`] the first time the task is linked.
///
/// # Safety
/// Only ever installed on `Task::timeout` and only ever fired by the
/// timer wheel while holding the CPU lock, with `user_data` set by
/// `activate` to the address of the owning `'static Task`.
unsafe fn task_timeout_callback<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, user_data: usize) {
    let task = &*(user_data as *const Task<P>);
    crate::wait::complete_wait(kernel, token, task, RC::Timeout);
}

/// Move `task` into the ready queue at its current priority and set its
/// ready bit. Does not itself reschedule; callers batch `make_ready` with
/// other state changes and call [`reschedule`] once.
pub(crate) fn make_ready<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, task: &'static Task<P>) {
    task.modify_state(token, |s| *s |= TaskState::RUNNABLE);
    let prio = task.priority_current.get(token) as usize;
    kernel.ready[prio].push_back(token, task, |t| &t.link);
    kernel.ready_bitmap.modify(token, |b| *b |= 1 << prio);
    #[cfg(feature = "log")]
    log::trace!("task {:p} ready at priority {}", task, prio);
}

/// Remove `task` from the ready queue and clear its ready bit (clearing
/// the priority's bitmap bit too, if its FIFO is now empty).
pub(crate) fn make_unready<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, task: &'static Task<P>) {
    task.modify_state(token, |s| *s &= !TaskState::RUNNABLE);
    let prio = task.priority_current.get(token) as usize;
    kernel.ready[prio].remove(token, task, |t| &t.link);
    if kernel.ready[prio].is_empty(token) {
        kernel.ready_bitmap.modify(token, |b| *b &= !(1 << prio));
    }
    #[cfg(feature = "log")]
    log::trace!("task {:p} unready from priority {}", task, prio);
}

/// Recompute `next_to_run` and, if it differs from the running task,
/// pend a context switch (spec §4.1 "Scheduling decision", §5).
pub(crate) fn reschedule<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>) {
    let Some(prio) = kernel.ffs_ready(token) else {
        return;
    };
    let next = kernel.ready[prio].front(token);
    if next.map(|t| t as *const Task<P>) != kernel.current.get(token).map(|t| t as *const Task<P>) {
        kernel.current.set(token, next);
        // Safety: called with the CPU lock held, as `reschedule` always is.
        unsafe { P::context_switch_pend() };
    }
}

/// Validate `priority` against the kernel's configured priority count.
pub(crate) fn check_priority<P: Port>(kernel: &Kernel<P>, priority: u8) -> Result<(), RC> {
    if (priority as usize) < kernel.num_priorities {
        Ok(())
    } else {
        Err(RC::WParam)
    }
}

/// `task_activate` (spec §4.1 "Activation"). `task` must be
/// [`TaskState::DORMANT`]; any other state is `WSTATE`. `stack` is
/// (re)initialized from scratch on every activation, matching the spec's
/// "the stack is (re)initialized" wording, so a task may be activated
/// more than once across its lifetime.
pub(crate) fn activate<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, task: &'static Task<P>, stack: &mut [u8], arg: usize) -> Result<(), RC> {
    if task.state(token) != TaskState::DORMANT {
        return Err(RC::WState);
    }
    check_priority(kernel, task.priority_base.get(token))?;
    task.arg.set(token, arg);
    task.priority_current.set(token, task.priority_base.get(token));
    task.set_wait_reason(token, WaitReason::None);
    task.time_slice.set(token, 0);
    let port_state = P::initialize_task_state(task.entry, stack, arg);
    task.port_state.set(token, Some(port_state));
    task.timeout.bind(token, task as *const Task<P> as usize);
    task.set_state(token, TaskState::empty());
    #[cfg(feature = "log")]
    log::debug!("task {:p} activated at priority {}", task, task.priority_base.get(token));
    make_ready(kernel, token, task);
    reschedule(kernel, token);
    Ok(())
}

/// `task_suspend` (spec §4.1 "Suspend/Resume").
pub(crate) fn suspend<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, task: &'static Task<P>) -> Result<(), RC> {
    let state = task.state(token);
    if state.contains(TaskState::DORMANT) || state.contains(TaskState::SUSPEND) {
        return Err(RC::WState);
    }
    if state.contains(TaskState::RUNNABLE) {
        make_unready(kernel, token, task);
    }
    task.modify_state(token, |s| *s |= TaskState::SUSPEND);
    reschedule(kernel, token);
    Ok(())
}

/// `task_resume` (spec §4.1 "Suspend/Resume").
pub(crate) fn resume<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, task: &'static Task<P>) -> Result<(), RC> {
    let state = task.state(token);
    if !state.contains(TaskState::SUSPEND) {
        return Err(RC::WState);
    }
    task.modify_state(token, |s| *s &= !TaskState::SUSPEND);
    if !state.contains(TaskState::WAIT) {
        make_ready(kernel, token, task);
        reschedule(kernel, token);
    }
    Ok(())
}

/// `task_sleep` (spec §4.1 "Sleep"). Must be called on the running task.
pub(crate) fn sleep<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, task: &'static Task<P>, timeout: crate::wait::Timeout) -> RC {
    crate::wait::enter_wait(kernel, token, task, None, WaitReason::Sleep, timeout);
    task.wait_result(token)
}

/// `task_wakeup`: force-complete a `Sleep` wait with `RC::Ok`.
pub(crate) fn wakeup<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, task: &'static Task<P>) -> Result<(), RC> {
    let state = task.state(token);
    if !state.contains(TaskState::WAIT) || task.wait_reason(token) != WaitReason::Sleep {
        return Err(RC::WState);
    }
    crate::wait::complete_wait(kernel, token, task, RC::Ok);
    Ok(())
}

/// `task_release_wait` (spec §4.1, §5 "Cancellation and timeouts").
pub(crate) fn release_wait<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, task: &'static Task<P>) -> Result<(), RC> {
    if !task.state(token).contains(TaskState::WAIT) {
        return Err(RC::WState);
    }
    crate::wait::complete_wait(kernel, token, task, RC::Forced);
    Ok(())
}

/// `task_change_priority` (spec §4.1 "Priority change"). Sets the task's
/// *base* priority and recomputes its effective priority via the §3(e)
/// rule (ceilings/inheritance owned mutexes may keep it elevated).
pub(crate) fn change_priority<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, task: &'static Task<P>, new_base: u8) -> Result<(), RC> {
    check_priority(kernel, new_base)?;
    task.priority_base.set(token, new_base);
    crate::mutex::recompute_effective_priority(kernel, token, task);
    Ok(())
}

/// Set a task's *effective* (current) priority and, if it is currently
/// in the ready queue, move it to the new priority's FIFO. Called by
/// [`crate::mutex::recompute_effective_priority`], never directly by
/// application-facing services.
pub(crate) fn set_priority<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, task: &'static Task<P>, new_prio: u8) {
    if task.priority_current.get(token) == new_prio {
        return;
    }
    let was_ready = task.state(token).contains(TaskState::RUNNABLE);
    if was_ready {
        make_unready(kernel, token, task);
    }
    #[cfg(feature = "log")]
    log::trace!("task {:p} priority {} -> {}", task, task.priority_current.get(token), new_prio);
    task.priority_current.set(token, new_prio);
    if was_ready {
        make_ready(kernel, token, task);
    }
    reschedule(kernel, token);
}

/// `task_exit` (spec §4.1 "Exit"). Unlocks every mutex the task holds
/// (which may itself wake new holders), marks it `DORMANT`, then
/// performs a non-saving context switch that never returns.
///
/// # Safety
/// Must be called on the running task, with the CPU lock held, from a
/// context where the caller's stack will never be referenced again.
pub(crate) unsafe fn exit<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, task: &'static Task<P>) -> ! {
    if task.state(token).contains(TaskState::RUNNABLE) {
        make_unready(kernel, token, task);
    }
    while let Some(mutex) = task.owned_mutexes.get(token) {
        crate::mutex::force_unlock_for_exit(kernel, token, mutex, task);
    }
    task.set_state(token, TaskState::DORMANT);
    #[cfg(feature = "log")]
    log::debug!("task {:p} exited", task);
    reschedule(kernel, token);
    // Safety: CPU lock is held (we never dropped `token`'s guard), and
    // the caller guarantees no further use of its own stack.
    P::context_switch_now_nosave()
}

/// `task_terminate`: force another task through the same exit sequence
/// as [`exit`], without switching away from the caller.
pub(crate) fn terminate<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, task: &'static Task<P>) -> Result<(), RC> {
    let state = task.state(token);
    if state.contains(TaskState::DORMANT) {
        return Err(RC::WState);
    }
    if state.contains(TaskState::WAIT) {
        crate::wait::complete_wait(kernel, token, task, RC::Forced);
    }
    if task.state(token).contains(TaskState::RUNNABLE) {
        make_unready(kernel, token, task);
    }
    while let Some(mutex) = task.owned_mutexes.get(token) {
        crate::mutex::force_unlock_for_exit(kernel, token, mutex, task);
    }
    task.set_state(token, TaskState::DORMANT);
    reschedule(kernel, token);
    Ok(())
}

/// `task_delete`: free-form bookkeeping reset for an already-`DORMANT`
/// task. Storage stays with the caller; this only re-arms the TCB so it
/// can be reused by a future `activate`.
pub(crate) fn delete<P: Port>(token: &mut CpuLockToken<P>, task: &'static Task<P>) -> Result<(), RC> {
    if task.state(token) != TaskState::DORMANT {
        return Err(RC::WState);
    }
    Ok(())
}

/// Round-robin rotation, called once per tick from
/// [`Kernel::tick_int_processing`] (spec §4.1 "Round-robin", §9
/// "Time-slice rotation concurrency").
pub(crate) fn rotate_time_slice<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>) {
    let Some(current) = kernel.current.get(token) else {
        return;
    };
    // The current task may have blocked or been suspended earlier in this
    // same tick (e.g. by a timer callback that ran before this point);
    // never rotate a task that is no longer runnable.
    if !current.state(token).contains(TaskState::RUNNABLE) {
        return;
    }
    let prio = current.priority_current.get(token) as usize;
    let slice_len = kernel.slice_length[prio].get(token);
    if slice_len == 0 {
        return;
    }
    let count = current.time_slice.get(token) + 1;
    if count < slice_len {
        current.time_slice.set(token, count);
        return;
    }
    current.time_slice.set(token, 0);

    // Rotate: move `current` from the front to the back of its FIFO. If
    // the FIFO holds only `current`, the front is unchanged and there is
    // nothing to reschedule.
    kernel.ready[prio].remove(token, current, |t| &t.link);
    kernel.ready[prio].push_back(token, current, |t| &t.link);
    reschedule(kernel, token);
}

/// Public entry points (spec §6, §9 "Public entry points acquire the
/// token; leaf helpers require it"): each of these is the thing an
/// application or another crate actually calls. They acquire the CPU
/// lock themselves and never hand the token back out, so nothing outside
/// this crate ever needs to name [`CpuLockToken`].
///
/// Operations that the spec writes without an explicit task argument
/// (`task_sleep`, `task_exit`) act on [`Kernel::current`]'s task; the
/// rest target an explicit `task` since any task may suspend, resume, or
/// otherwise act on any other task.
pub fn task_activate<P: Port>(kernel: &'static Kernel<P>, task: &'static Task<P>, stack: &mut [u8], arg: usize) -> Result<(), RC> {
    let mut lock = klock::lock_cpu::<P>();
    activate(kernel, &mut lock, task, stack, arg)
}

pub fn task_suspend<P: Port>(kernel: &'static Kernel<P>, task: &'static Task<P>) -> Result<(), RC> {
    let mut lock = klock::lock_cpu::<P>();
    suspend(kernel, &mut lock, task)
}

pub fn task_resume<P: Port>(kernel: &'static Kernel<P>, task: &'static Task<P>) -> Result<(), RC> {
    let mut lock = klock::lock_cpu::<P>();
    resume(kernel, &mut lock, task)
}

/// `task_sleep` (spec §4.1 "Sleep"), acting on the calling task.
pub fn task_sleep<P: Port>(kernel: &'static Kernel<P>, timeout: crate::wait::Timeout) -> RC {
    let mut lock = klock::lock_cpu::<P>();
    let caller = current_or_fatal(kernel, &lock);
    sleep(kernel, &mut lock, caller, timeout)
}

pub fn task_wakeup<P: Port>(kernel: &'static Kernel<P>, task: &'static Task<P>) -> Result<(), RC> {
    let mut lock = klock::lock_cpu::<P>();
    wakeup(kernel, &mut lock, task)
}

pub fn task_release_wait<P: Port>(kernel: &'static Kernel<P>, task: &'static Task<P>) -> Result<(), RC> {
    let mut lock = klock::lock_cpu::<P>();
    release_wait(kernel, &mut lock, task)
}

pub fn task_change_priority<P: Port>(kernel: &'static Kernel<P>, task: &'static Task<P>, new_base: u8) -> Result<(), RC> {
    let mut lock = klock::lock_cpu::<P>();
    change_priority(kernel, &mut lock, task, new_base)
}

/// `task_terminate` (spec §4.1): force `task` through the exit sequence.
pub fn task_terminate<P: Port>(kernel: &'static Kernel<P>, task: &'static Task<P>) -> Result<(), RC> {
    let mut lock = klock::lock_cpu::<P>();
    terminate(kernel, &mut lock, task)
}

pub fn task_delete<P: Port>(_kernel: &'static Kernel<P>, task: &'static Task<P>) -> Result<(), RC> {
    let mut lock = klock::lock_cpu::<P>();
    delete(&mut lock, task)
}

/// `task_exit` (spec §4.1 "Exit"), acting on the calling task. Never
/// returns: the calling task becomes `DORMANT` and control switches away
/// for good.
///
/// # Safety
/// Must be called from the task it exits, with no locals on the caller's
/// stack whose destructors matter — the stack is about to be reused.
pub unsafe fn task_exit<P: Port>(kernel: &'static Kernel<P>) -> ! {
    let mut lock = klock::lock_cpu::<P>();
    let caller = current_or_fatal(kernel, &lock);
    // Safety: forwarded from this function's own contract.
    unsafe { exit(kernel, &mut lock, caller) }
}

pub(crate) fn current_or_fatal<P: Port>(kernel: &'static Kernel<P>, token: &CpuLockToken<P>) -> &'static Task<P> {
    kernel
        .current
        .get(token)
        .unwrap_or_else(|| crate::fatal_error("no running task"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_bits_are_disjoint() {
        assert_eq!(TaskState::RUNNABLE.bits(), 1);
        assert_eq!(TaskState::WAIT.bits(), 2);
        assert_eq!(TaskState::SUSPEND.bits(), 4);
        assert_eq!(TaskState::DORMANT.bits(), 8);
    }
}
