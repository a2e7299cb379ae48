//! The wait/unblock protocol shared by every blocking object (spec §4.2).
use crate::error::RC;
use crate::klock::CpuLockToken;
use crate::list::List;
use crate::port::Port;
use crate::sys::Kernel;
use crate::task::{self, Task, TaskState, WaitReason};
use crate::timer;

/// A caller-specified wait duration (spec §5 "Cancellation and
/// timeouts"). `Ticks(0)` never blocks; `Infinite` never times out.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Timeout {
    Infinite,
    Ticks(u32),
}

impl Timeout {
    pub(crate) fn is_zero(self) -> bool {
        matches!(self, Timeout::Ticks(0))
    }
}

/// `enter_wait` (spec §4.2). `task` must be the running, `RUNNABLE` task.
///
/// A `Timeout::Ticks(0)` wait never actually blocks: the task stays
/// `RUNNABLE` and `task.wait_result()` is set to `RC::Timeout` directly,
/// per spec §4.1 "Sleep" ("Timeout 0 ⇒ TIMEOUT immediately") generalized
/// to every blocking service.
pub(crate) fn enter_wait<P: Port>(
    kernel: &'static Kernel<P>,
    token: &mut CpuLockToken<P>,
    task: &'static Task<P>,
    wait_list: Option<&'static List<P, Task<P>>>,
    reason: WaitReason,
    timeout: Timeout,
) {
    if timeout.is_zero() {
        task.set_wait_result(token, RC::Timeout);
        return;
    }

    task::make_unready(kernel, token, task);
    task.modify_state(token, |s| *s |= TaskState::WAIT);
    task.set_wait_reason(token, reason);

    if let Some(list) = wait_list {
        list.push_back(token, task, |t| &t.link);
        task.wait_queue.set(token, Some(list));
    }

    if let Timeout::Ticks(ticks) = timeout {
        // Safety: `start` is only unsafe in the sense of requiring the
        // CPU lock, which `token` proves.
        timer::start(kernel, token, &task.timeout, ticks).expect("finite, nonzero timeout");
    }

    task::reschedule(kernel, token);
}

/// `complete_wait` (spec §4.2). Unblocks `task`, which must currently be
/// `WAIT`, recording `result_code` as its wait result.
pub(crate) fn complete_wait<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, task: &'static Task<P>, result_code: RC) {
    if let Some(list) = task.wait_queue.get(token) {
        list.remove(token, task, |t| &t.link);
        task.wait_queue.set(token, None);
    }

    // Reason-specific completion hook, invoked before the reason is
    // cleared (spec §4.2; the mutex hook is specified in §4.4).
    match task.wait_reason(token) {
        WaitReason::MutexCeiling | WaitReason::MutexInherit => {
            crate::mutex::on_wait_complete(kernel, token, task);
        }
        _ => {}
    }

    timer::cancel(kernel, token, &task.timeout);
    task.set_wait_result(token, result_code);
    task.modify_state(token, |s| *s &= !TaskState::WAIT);
    task.set_wait_reason(token, WaitReason::None);

    if !task.state(token).contains(TaskState::SUSPEND) {
        task::make_ready(kernel, token, task);
        task::reschedule(kernel, token);
    }
}

/// `first_waiter_complete` (spec §4.2). Pops the head of `list` (if any),
/// lets `before_cb` hand data to it while it is still blocked, then
/// completes its wait with `rc`. Returns whether a waiter was popped.
///
/// `before_cb` is the "before complete" hook of spec §9: producer
/// services (`sem_signal`, `queue_send`, `fmem_release`) use it to hand a
/// value directly to the waiter instead of stashing it in global state.
pub(crate) fn first_waiter_complete<P: Port>(
    kernel: &'static Kernel<P>,
    token: &mut CpuLockToken<P>,
    list: &'static List<P, Task<P>>,
    rc: RC,
    before_cb: impl FnOnce(&mut CpuLockToken<P>, &'static Task<P>),
) -> bool {
    let Some(task) = list.pop_front(token, |t| &t.link) else {
        return false;
    };
    task.wait_queue.set(token, None);
    before_cb(token, task);
    complete_wait(kernel, token, task, rc);
    true
}

/// `wait_list_notify_deleted` (spec §4.2): unblock every waiter on `list`
/// with `RC::Deleted`, in FIFO order.
pub(crate) fn wait_list_notify_deleted<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, list: &'static List<P, Task<P>>) {
    while let Some(task) = list.pop_front(token, |t| &t.link) {
        task.wait_queue.set(token, None);
        complete_wait(kernel, token, task, RC::Deleted);
    }
}
