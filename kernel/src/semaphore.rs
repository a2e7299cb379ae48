//! Counting semaphores (spec §4.3).
use crate::error::RC;
use crate::klock::{self, CpuLockCell, CpuLockToken};
use crate::list::List;
use crate::port::Port;
use crate::sys::Kernel;
use crate::task::{Task, WaitReason};
use crate::wait::{self, Timeout};

const MAGIC_SEMAPHORE: u32 = 0x5345_4d41; // "SEMA"

/// A counting semaphore (spec §3 "Blocking objects: Semaphore").
pub struct Semaphore<P: Port> {
    magic: u32,
    max_count: u32,
    count: CpuLockCell<P, u32>,
    wait_queue: List<P, Task<P>>,
}

impl<P: Port> Semaphore<P> {
    pub const fn new(start: u32, max_count: u32) -> Self {
        Self {
            magic: MAGIC_SEMAPHORE,
            max_count,
            count: CpuLockCell::new(start),
            wait_queue: List::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC_SEMAPHORE
    }

    pub fn count(&self, token: &CpuLockToken<P>) -> u32 {
        self.count.get(token)
    }
}

pub(crate) fn signal<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, sem: &'static Semaphore<P>) -> RC {
    if wait::first_waiter_complete(kernel, token, &sem.wait_queue, RC::Ok, |_, _| {}) {
        return RC::Ok;
    }
    let count = sem.count.get(token);
    if count < sem.max_count {
        sem.count.set(token, count + 1);
        RC::Ok
    } else {
        RC::Overflow
    }
}

pub(crate) fn wait<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, sem: &'static Semaphore<P>, caller: &'static Task<P>, timeout: Timeout) -> RC {
    let count = sem.count.get(token);
    if count > 0 {
        sem.count.set(token, count - 1);
        return RC::Ok;
    }
    wait::enter_wait(kernel, token, caller, Some(&sem.wait_queue), WaitReason::Sem, timeout);
    caller.wait_result(token)
}

pub(crate) fn wait_polling<P: Port>(token: &mut CpuLockToken<P>, sem: &'static Semaphore<P>) -> RC {
    let count = sem.count.get(token);
    if count > 0 {
        sem.count.set(token, count - 1);
        RC::Ok
    } else {
        RC::Timeout
    }
}

pub(crate) fn delete<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, sem: &'static Semaphore<P>) -> RC {
    wait::wait_list_notify_deleted(kernel, token, &sem.wait_queue);
    RC::Ok
}

/// `sem_signal`/`sem_isignal` (spec §4.3): identical in task and ISR
/// context, so one entry point serves both.
pub fn sem_signal<P: Port>(kernel: &'static Kernel<P>, sem: &'static Semaphore<P>) -> RC {
    let mut lock = klock::lock_cpu::<P>();
    signal(kernel, &mut lock, sem)
}

/// `sem_wait` (spec §4.3), acting on the calling task. Must not be called
/// from ISR context; use [`sem_wait_polling`] there.
pub fn sem_wait<P: Port>(kernel: &'static Kernel<P>, sem: &'static Semaphore<P>, timeout: Timeout) -> RC {
    if P::inside_isr() {
        return RC::WContext;
    }
    let mut lock = klock::lock_cpu::<P>();
    let caller = crate::task::current_or_fatal(kernel, &lock);
    wait(kernel, &mut lock, sem, caller, timeout)
}

/// `sem_wait_polling`/`sem_iwait_polling` (spec §4.3): never blocks
/// regardless of `timeout`, callable from either context.
pub fn sem_wait_polling<P: Port>(sem: &'static Semaphore<P>) -> RC {
    let mut lock = klock::lock_cpu::<P>();
    wait_polling(&mut lock, sem)
}

/// `sem_delete` (spec §4.3): wake every waiter with `DELETED`.
pub fn sem_delete<P: Port>(kernel: &'static Kernel<P>, sem: &'static Semaphore<P>) -> RC {
    let mut lock = klock::lock_cpu::<P>();
    delete(kernel, &mut lock, sem)
}

