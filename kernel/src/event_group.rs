//! Event groups: bitmask wait/release and their use as a fan-in point
//! for other blocking objects (spec §4.5).
use crate::error::RC;
use crate::klock::{self, CpuLockCell, CpuLockToken};
use crate::list::List;
use crate::port::Port;
use crate::sys::Kernel;
use crate::task::{Task, WaitPayload, WaitReason};
use crate::wait::{self, Timeout};

const MAGIC_EVENT_GROUP: u32 = 0x4556_4754; // "EVGT"

/// Whether `wait`'s release condition is a conjunction or disjunction of
/// the requested bits (spec §4.5 "Release condition").
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WaitMode {
    And,
    Or,
}

/// The three ways [`modify`] can change the bit pattern.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ModifyOp {
    Set,
    Clear,
    Toggle,
}

fn condition_holds(bits: u32, pattern: u32, mode: WaitMode) -> bool {
    match mode {
        WaitMode::And => (bits & pattern) == pattern,
        WaitMode::Or => (bits & pattern) != 0,
    }
}

/// An event group (spec §3 "Blocking objects: Event group").
pub struct EventGroup<P: Port> {
    magic: u32,
    bits: CpuLockCell<P, u32>,
    wait_queue: List<P, Task<P>>,
}

impl<P: Port> EventGroup<P> {
    pub const fn new(initial_pattern: u32) -> Self {
        Self {
            magic: MAGIC_EVENT_GROUP,
            bits: CpuLockCell::new(initial_pattern),
            wait_queue: List::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC_EVENT_GROUP
    }

    pub fn pattern(&self, token: &CpuLockToken<P>) -> u32 {
        self.bits.get(token)
    }
}

pub(crate) fn wait<P: Port>(
    kernel: &'static Kernel<P>,
    token: &mut CpuLockToken<P>,
    eg: &'static EventGroup<P>,
    caller: &'static Task<P>,
    pattern: u32,
    mode: WaitMode,
    clear_on_release: bool,
    timeout: Timeout,
) -> RC {
    let bits = eg.bits.get(token);
    if condition_holds(bits, pattern, mode) {
        if clear_on_release {
            eg.bits.set(token, bits & !pattern);
        }
        caller.set_wait_payload(
            token,
            WaitPayload::Event { pattern, mode, clear_on_release, actual: bits },
        );
        return RC::Ok;
    }

    caller.set_wait_payload(
        token,
        WaitPayload::Event { pattern, mode, clear_on_release, actual: 0 },
    );
    wait::enter_wait(kernel, token, caller, Some(&eg.wait_queue), WaitReason::Event, timeout);
    caller.wait_result(token)
}

pub(crate) fn last_result<P: Port>(token: &CpuLockToken<P>, task: &'static Task<P>) -> u32 {
    match task.wait_payload(token) {
        WaitPayload::Event { actual, .. } => actual,
        _ => 0,
    }
}

/// `CLEAR` never releases anyone (clearing bits can only make conditions
/// harder to satisfy); `SET`/`TOGGLE` apply the change then scan the wait
/// list in order, releasing every waiter whose condition now holds.
pub(crate) fn modify<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, eg: &'static EventGroup<P>, op: ModifyOp, pattern: u32) -> RC {
    match op {
        ModifyOp::Clear => {
            eg.bits.modify(token, |b| *b &= !pattern);
            return RC::Ok;
        }
        ModifyOp::Set => eg.bits.modify(token, |b| *b |= pattern),
        ModifyOp::Toggle => eg.bits.modify(token, |b| *b ^= pattern),
    }
    scan_and_release(kernel, token, eg);
    RC::Ok
}

fn scan_and_release<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, eg: &'static EventGroup<P>) {
    eg.wait_queue.for_each_while(
        token,
        |t| &t.link,
        |token, task| {
            if let WaitPayload::Event { pattern, mode, clear_on_release, .. } = task.wait_payload(token) {
                let bits = eg.bits.get(token);
                if condition_holds(bits, pattern, mode) {
                    if clear_on_release {
                        eg.bits.modify(token, |b| *b &= !pattern);
                    }
                    let observed = eg.bits.get(token);
                    task.set_wait_payload(
                        token,
                        WaitPayload::Event { pattern, mode, clear_on_release, actual: observed },
                    );
                    wait::complete_wait(kernel, token, task, RC::Ok);
                }
            }
            true
        },
    );
}

pub(crate) fn delete<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, eg: &'static EventGroup<P>) -> RC {
    wait::wait_list_notify_deleted(kernel, token, &eg.wait_queue);
    RC::Ok
}

/// Drive a connected event-group bit from another blocking object's
/// "has data" predicate (spec §4.5 "Connected event-group link"). Queues
/// and the fixed memory pool call this with `Set`/`Clear` whenever that
/// predicate flips, so a task can wait on several of them through one
/// `event_group::wait` call.
pub(crate) fn link_manage<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, eg: &'static EventGroup<P>, pattern: u32, set: bool) {
    let op = if set { ModifyOp::Set } else { ModifyOp::Clear };
    modify(kernel, token, eg, op, pattern);
}

/// `event_wait` (spec §4.5), acting on the calling task. Must not be
/// called from ISR context. The bits actually observed at release are
/// retrievable afterwards with [`event_last_result`].
pub fn event_wait<P: Port>(kernel: &'static Kernel<P>, eg: &'static EventGroup<P>, pattern: u32, mode: WaitMode, clear_on_release: bool, timeout: Timeout) -> RC {
    if P::inside_isr() {
        return RC::WContext;
    }
    let mut lock = klock::lock_cpu::<P>();
    let caller = crate::task::current_or_fatal(kernel, &lock);
    wait(kernel, &mut lock, eg, caller, pattern, mode, clear_on_release, timeout)
}

/// The bit pattern observed by `task`'s most recent completed
/// [`event_wait`] (spec §4.5 "→ actual_pattern").
pub fn event_last_result<P: Port>(task: &'static Task<P>) -> u32 {
    let lock = klock::lock_cpu::<P>();
    last_result(&lock, task)
}

/// `event_modify`/`event_imodify` (spec §4.5), callable from either
/// context.
pub fn event_modify<P: Port>(kernel: &'static Kernel<P>, eg: &'static EventGroup<P>, op: ModifyOp, pattern: u32) -> RC {
    let mut lock = klock::lock_cpu::<P>();
    modify(kernel, &mut lock, eg, op, pattern)
}

/// `event_delete` (spec §4.5): wake every waiter with `DELETED`.
pub fn event_delete<P: Port>(kernel: &'static Kernel<P>, eg: &'static EventGroup<P>) -> RC {
    let mut lock = klock::lock_cpu::<P>();
    delete(kernel, &mut lock, eg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn and_requires_every_bit() {
        assert!(condition_holds(0b111, 0b011, WaitMode::And));
        assert!(!condition_holds(0b101, 0b011, WaitMode::And));
    }

    #[test]
    fn or_requires_any_bit() {
        assert!(condition_holds(0b100, 0b110, WaitMode::Or));
        assert!(!condition_holds(0b000, 0b110, WaitMode::Or));
    }
}
