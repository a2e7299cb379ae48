//! Mutexes with the priority-ceiling and priority-inheritance protocols
//! (spec §4.4).
use crate::error::RC;
use crate::klock::{self, CpuLockCell, CpuLockToken};
use crate::list::List;
use crate::port::Port;
use crate::sys::Kernel;
use crate::task::{self, Task, TaskState, WaitReason};
use crate::wait::{self, Timeout};

const MAGIC_MUTEX: u32 = 0x4d55_5458; // "MUTX"

/// Which of the two protocols a mutex enforces (spec §4.4 "Attributes at
/// creation").
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Protocol {
    /// Raise the holder to `ceiling` the instant it locks, regardless of
    /// who (if anyone) is waiting.
    Ceiling(u8),
    /// Raise the holder to the priority of its highest-priority waiter,
    /// transitively across chains of held mutexes.
    Inherit,
}

/// Invoked when the deadlock detector (feature `deadlock_detection`)
/// finds a cycle (`active = true`) or when a wait that was part of one
/// ends (`active = false`).
pub type DeadlockCallback<P> = fn(task: &'static Task<P>, active: bool);

/// A mutex (spec §3 "Blocking objects: Mutex", §4.4).
pub struct Mutex<P: Port> {
    magic: u32,
    protocol: Protocol,
    allow_recursive: bool,
    holder: CpuLockCell<P, Option<&'static Task<P>>>,
    rec_count: CpuLockCell<P, u32>,
    wait_queue: List<P, Task<P>>,
    pub(crate) next_owned: CpuLockCell<P, Option<&'static Mutex<P>>>,
}

impl<P: Port> Mutex<P> {
    pub const fn new(protocol: Protocol, allow_recursive: bool) -> Self {
        Self {
            magic: MAGIC_MUTEX,
            protocol,
            allow_recursive,
            holder: CpuLockCell::new(None),
            rec_count: CpuLockCell::new(0),
            wait_queue: List::new(),
            next_owned: CpuLockCell::new(None),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC_MUTEX
    }

    pub fn holder(&self, token: &CpuLockToken<P>) -> Option<&'static Task<P>> {
        self.holder.get(token)
    }

    /// The priority contribution this mutex makes to its holder's
    /// effective priority (spec §3(e)): the ceiling for a ceiling mutex,
    /// or the priority of its highest-priority (numerically lowest)
    /// waiter for an inheritance mutex. `None` if an inheritance mutex
    /// currently has no waiters.
    fn priority_contribution(&self, token: &CpuLockToken<P>) -> Option<u8> {
        match self.protocol {
            Protocol::Ceiling(ceiling) => Some(ceiling),
            Protocol::Inherit => {
                let mut best: Option<u8> = None;
                let mut cur = self.wait_queue.front(token);
                while let Some(t) = cur {
                    let p = t.priority(token);
                    if best.map_or(true, |b| p < b) {
                        best = Some(p);
                    }
                    cur = t.link.next(token);
                }
                best
            }
        }
    }

    fn push_waiter(&'static self, token: &mut CpuLockToken<P>, task: &'static Task<P>) {
        self.wait_queue.push_back(token, task, |t| &t.link);
    }
}

/// Recompute a task's effective priority from its base priority and the
/// mutexes it owns (spec §3(e)), applying the result via
/// [`task::set_priority`]. Called whenever a task's base priority
/// changes or its owned-mutex set changes.
pub(crate) fn recompute_effective_priority<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, task: &'static Task<P>) {
    task::set_priority(kernel, token, task, effective_priority_of(token, task));
}

fn effective_priority_of<P: Port>(token: &CpuLockToken<P>, task: &'static Task<P>) -> u8 {
    let mut best = task.base_priority(token);
    let mut cur = task.owned_mutexes.get(token);
    while let Some(mutex) = cur {
        if let Some(p) = mutex.priority_contribution(token) {
            if p < best {
                best = p;
            }
        }
        cur = mutex.next_owned.get(token);
    }
    best
}

/// Transitively raise `start`'s effective priority to at least `priority`
/// and, if `start` is itself blocked on a mutex, follow that mutex to its
/// holder and repeat — the "priority inheritance chain" (spec §4.4
/// "Lock"). Implemented as a loop rather than recursion since the chain
/// length is bounded only by the number of tasks in the system.
fn propagate_priority<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, start: &'static Task<P>, priority: u8) {
    let mut task = start;
    loop {
        if task.priority(token) <= priority {
            // Already at least this urgent; nothing more to propagate.
            return;
        }
        task::set_priority(kernel, token, task, priority);

        if !task.state(token).contains(TaskState::WAIT) {
            return;
        }
        let reason = task.wait_reason(token);
        if reason != WaitReason::MutexInherit && reason != WaitReason::MutexCeiling {
            return;
        }
        let Some(blocking_mutex) = task.blocking_mutex.get(token) else {
            return;
        };
        let Some(next_holder) = blocking_mutex.holder(token) else {
            return;
        };
        task = next_holder;
    }
}

pub(crate) fn lock<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, mutex: &'static Mutex<P>, caller: &'static Task<P>, timeout: Timeout) -> RC {
    if let Protocol::Ceiling(ceiling) = mutex.protocol {
        if caller.base_priority(token) < ceiling {
            return RC::from(crate::error::LockPrecheckError::IllegalUse);
        }
    }

    match mutex.holder(token) {
        None => {
            acquire(kernel, token, mutex, caller);
            RC::Ok
        }
        Some(holder) if core::ptr::eq(holder, caller) => {
            if mutex.allow_recursive {
                mutex.rec_count.modify(token, |c| *c += 1);
                RC::Ok
            } else {
                RC::from(crate::error::LockPrecheckError::IllegalUse)
            }
        }
        Some(holder) => {
            if timeout.is_zero() {
                return RC::Timeout;
            }

            #[cfg(feature = "deadlock_detection")]
            detect_and_report_deadlock(kernel, token, mutex, caller);

            let reason = match mutex.protocol {
                Protocol::Ceiling(_) => WaitReason::MutexCeiling,
                Protocol::Inherit => WaitReason::MutexInherit,
            };
            let caller_priority = caller.priority(token);
            mutex.push_waiter(token, caller);
            caller.wait_queue.set(token, Some(&mutex.wait_queue));
            caller.blocking_mutex.set(token, Some(mutex));
            task::make_unready(kernel, token, caller);
            caller.modify_state(token, |s| *s |= TaskState::WAIT);
            caller.set_wait_reason(token, reason);
            if let Timeout::Ticks(ticks) = timeout {
                crate::timer::start(kernel, token, &caller.timeout, ticks).expect("nonzero finite timeout");
            }

            if mutex.protocol == Protocol::Inherit {
                propagate_priority(kernel, token, holder, caller_priority);
            }

            task::reschedule(kernel, token);
            caller.wait_result(token)
        }
    }
}

fn acquire<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, mutex: &'static Mutex<P>, task: &'static Task<P>) {
    mutex.holder.set(token, Some(task));
    mutex.rec_count.set(token, 1);
    mutex.next_owned.set(token, task.owned_mutexes.get(token));
    task.owned_mutexes.set(token, Some(mutex));
    recompute_effective_priority(kernel, token, task);
}

pub(crate) fn unlock<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, mutex: &'static Mutex<P>, caller: &'static Task<P>) -> RC {
    match mutex.holder(token) {
        Some(holder) if core::ptr::eq(holder, caller) => {}
        _ => return RC::IllegalUse,
    }

    let count = mutex.rec_count.get(token) - 1;
    mutex.rec_count.set(token, count);
    if count > 0 {
        return RC::Ok;
    }

    unlink_owned(token, caller, mutex);
    recompute_effective_priority(kernel, token, caller);
    hand_off_or_release(kernel, token, mutex);
    RC::Ok
}

fn unlink_owned<P: Port>(token: &mut CpuLockToken<P>, holder: &'static Task<P>, mutex: &'static Mutex<P>) {
    let mut cur = holder.owned_mutexes.get(token);
    let mut prev: Option<&'static Mutex<P>> = None;
    while let Some(m) = cur {
        let next = m.next_owned.get(token);
        if core::ptr::eq(m, mutex) {
            match prev {
                Some(p) => p.next_owned.set(token, next),
                None => holder.owned_mutexes.set(token, next),
            }
            m.next_owned.set(token, None);
            return;
        }
        prev = Some(m);
        cur = next;
    }
}

/// Shared tail of `unlock`/`delete`/task-exit: give the mutex to the
/// first waiter (raising its priority per protocol) or mark it free. The
/// completion hook must not re-recompute the *previous* holder's
/// priority (spec §4.4 "Unlock"); callers already did that themselves
/// before calling this.
fn hand_off_or_release<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, mutex: &'static Mutex<P>) {
    if mutex.wait_queue.is_empty(token) {
        mutex.holder.set(token, None);
        mutex.rec_count.set(token, 0);
        return;
    }

    wait::first_waiter_complete(kernel, token, &mutex.wait_queue, RC::Ok, |token, new_holder| {
        new_holder.blocking_mutex.set(token, None);
        mutex.holder.set(token, Some(new_holder));
        mutex.rec_count.set(token, 1);
        mutex.next_owned.set(token, new_holder.owned_mutexes.get(token));
        new_holder.owned_mutexes.set(token, Some(mutex));
        let new_priority = effective_priority_of(token, new_holder);
        task::set_priority(kernel, token, new_holder, new_priority);
    });
}

/// `caller` must not hold it (per the spec's "locked by a task other than
/// caller ⇒ ILLEGAL_USE", which also rules out the caller itself: deleting
/// a mutex you hold is not meaningfully different and this crate treats
/// both as an error, leaving explicit `unlock` then `delete` as the
/// sanctioned sequence).
pub(crate) fn delete<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, mutex: &'static Mutex<P>, caller: &'static Task<P>) -> RC {
    if let Some(holder) = mutex.holder(token) {
        if core::ptr::eq(holder, caller) {
            return RC::IllegalUse;
        }
    }
    wait::wait_list_notify_deleted(kernel, token, &mutex.wait_queue);
    if let Some(holder) = mutex.holder(token) {
        unlink_owned(token, holder, mutex);
        recompute_effective_priority(kernel, token, holder);
    }
    mutex.holder.set(token, None);
    mutex.rec_count.set(token, 0);
    RC::Ok
}

/// Unlock `mutex` on behalf of an exiting/terminating task, without
/// requiring it to be the "running" task (spec §4.4 "Task exit").
pub(crate) fn force_unlock_for_exit<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, mutex: &'static Mutex<P>, holder: &'static Task<P>) {
    unlink_owned(token, holder, mutex);
    mutex.rec_count.set(token, 0);
    hand_off_or_release(kernel, token, mutex);
}

/// The mutex-specific half of [`wait::complete_wait`]'s "reason-specific
/// completion hook": release the back-pointer to the mutex the task was
/// blocked on, and, with `deadlock_detection` enabled, clear the task's
/// participation in a previously-detected cycle.
pub(crate) fn on_wait_complete<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, task: &'static Task<P>) {
    task.blocking_mutex.set(token, None);
    #[cfg(feature = "deadlock_detection")]
    if task.in_detected_deadlock.get(token) {
        task.in_detected_deadlock.set(token, false);
        report_deadlock(kernel, token, task, false);
    }
    #[cfg(not(feature = "deadlock_detection"))]
    let _ = kernel;
}

#[cfg(feature = "deadlock_detection")]
fn report_deadlock<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, task: &'static Task<P>, active: bool) {
    if active {
        task.in_detected_deadlock.set(token, true);
    }
    #[cfg(feature = "log")]
    log::debug!("deadlock {} involving task {:p}", if active { "detected" } else { "cleared" }, task);
    if let Some(cb) = kernel.on_deadlock {
        let _ = token;
        cb(task, active);
    }
}

/// Walk the chain of holders starting from `mutex`'s current holder; if
/// it leads back to `caller`, locking `mutex` would deadlock (spec §4.4
/// "Deadlock detection (optional)"). Every task along the chain is
/// flagged, not just `caller` — mirroring `_link_deadlock_lists` in
/// `original_source/src/core/tn_mutex.c`, which links every task and
/// mutex in the cycle together so the "inactive" callback fires no
/// matter which participant's wait ends first, rather than only the one
/// that triggered detection. Two passes, same as `tn_mutex.c`'s
/// `_check_deadlock_active` followed by `_link_deadlock_lists`: the
/// first confirms the chain actually closes before anything is marked,
/// the second walks it again to do the marking.
#[cfg(feature = "deadlock_detection")]
fn detect_and_report_deadlock<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, mutex: &'static Mutex<P>, caller: &'static Task<P>) {
    if !chain_closes_on(token, mutex, caller) {
        return;
    }

    report_deadlock(kernel, token, caller, true);
    let mut cur_mutex = Some(mutex);
    while let Some(m) = cur_mutex {
        let Some(holder) = m.holder(token) else { break };
        if core::ptr::eq(holder, caller) {
            break;
        }
        report_deadlock(kernel, token, holder, true);
        if !holder.state(token).contains(TaskState::WAIT) {
            break;
        }
        cur_mutex = holder.blocking_mutex.get(token);
    }
}

#[cfg(feature = "deadlock_detection")]
fn chain_closes_on<P: Port>(token: &CpuLockToken<P>, mutex: &'static Mutex<P>, caller: &'static Task<P>) -> bool {
    let mut cur_mutex = Some(mutex);
    while let Some(m) = cur_mutex {
        let Some(holder) = m.holder(token) else { break };
        if core::ptr::eq(holder, caller) {
            return true;
        }
        if !holder.state(token).contains(TaskState::WAIT) {
            break;
        }
        let reason = holder.wait_reason(token);
        if reason != WaitReason::MutexInherit && reason != WaitReason::MutexCeiling {
            break;
        }
        cur_mutex = holder.blocking_mutex.get(token);
    }
    false
}

/// `mutex_lock` (spec §4.4 "Lock"), acting on the calling task. Must not
/// be called from ISR context (mutexes are a task-level-only primitive).
pub fn mutex_lock<P: Port>(kernel: &'static Kernel<P>, mutex: &'static Mutex<P>, timeout: Timeout) -> RC {
    if P::inside_isr() {
        return RC::WContext;
    }
    let mut lock = klock::lock_cpu::<P>();
    let caller = task::current_or_fatal(kernel, &lock);
    self::lock(kernel, &mut lock, mutex, caller, timeout)
}

/// `mutex_unlock` (spec §4.4 "Unlock"), acting on the calling task.
pub fn mutex_unlock<P: Port>(kernel: &'static Kernel<P>, mutex: &'static Mutex<P>) -> RC {
    if P::inside_isr() {
        return RC::WContext;
    }
    let mut lock = klock::lock_cpu::<P>();
    let caller = task::current_or_fatal(kernel, &lock);
    unlock(kernel, &mut lock, mutex, caller)
}

/// `mutex_delete` (spec §4.4 "Delete"), acting on the calling task.
pub fn mutex_delete<P: Port>(kernel: &'static Kernel<P>, mutex: &'static Mutex<P>) -> RC {
    let mut lock = klock::lock_cpu::<P>();
    let caller = task::current_or_fatal(kernel, &lock);
    delete(kernel, &mut lock, mutex, caller)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_equality() {
        assert_eq!(Protocol::Ceiling(3), Protocol::Ceiling(3));
        assert_ne!(Protocol::Ceiling(3), Protocol::Inherit);
    }
}
