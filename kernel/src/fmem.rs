//! Fixed-size block memory pool (spec §4.6 "Fixed memory pool").
//!
//! The kernel object here only tracks which of `N` block slots are free;
//! it hands callers back an opaque `usize` block index rather than a raw
//! pointer into caller-owned storage. This sidesteps the alignment
//! preconditions the original C implementation needs (it threads the
//! free list through the first machine word of each raw block) — there
//! is no raw memory for the kernel to misalign, since the byte storage
//! behind each index is the caller's concern, addressed however the
//! caller's own type makes convenient (e.g. indexing a `[[u8; SIZE]; N]`
//! array the index names).
use crate::error::RC;
use crate::klock::{self, CpuLockCell, CpuLockToken};
use crate::list::List;
use crate::port::Port;
use crate::sys::Kernel;
use crate::task::{Task, WaitPayload, WaitReason};
use crate::wait::{self, Timeout};

const MAGIC_FMEM: u32 = 0x464d_454d; // "FMEM"

/// A pool of `N` fixed-size blocks, identified by index `0..N` (spec §3
/// "Blocking objects: Fixed memory pool"). `N` must be at least 2.
pub struct FixedMemoryPool<P: Port, const N: usize> {
    magic: u32,
    next_free: CpuLockCell<P, [Option<usize>; N]>,
    free_head: CpuLockCell<P, Option<usize>>,
    free_count: CpuLockCell<P, usize>,
    wait_queue: List<P, Task<P>>,
}

impl<P: Port, const N: usize> FixedMemoryPool<P, N> {
    pub const fn new() -> Self {
        assert!(N >= 2);
        let mut next_free = [None; N];
        let mut i = 0;
        while i + 1 < N {
            next_free[i] = Some(i + 1);
            i += 1;
        }
        Self {
            magic: MAGIC_FMEM,
            next_free: CpuLockCell::new(next_free),
            free_head: CpuLockCell::new(Some(0)),
            free_count: CpuLockCell::new(N),
            wait_queue: List::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC_FMEM
    }

    pub fn free_count(&self, token: &CpuLockToken<P>) -> usize {
        self.free_count.get(token)
    }
}

fn pop_free<P: Port, const N: usize>(token: &mut CpuLockToken<P>, pool: &'static FixedMemoryPool<P, N>) -> Option<usize> {
    let head = pool.free_head.get(token)?;
    let next = pool.next_free.get(token)[head];
    pool.free_head.set(token, next);
    pool.free_count.modify(token, |c| *c -= 1);
    Some(head)
}

/// Push `index` back onto the free list. `OVERFLOW` if every block is
/// already free (spec §4.6: "Pushing past block_count is OVERFLOW,
/// indicates double-free").
fn push_free<P: Port, const N: usize>(token: &mut CpuLockToken<P>, pool: &'static FixedMemoryPool<P, N>, index: usize) -> RC {
    let count = pool.free_count.get(token);
    if count >= N {
        return RC::Overflow;
    }
    let head = pool.free_head.get(token);
    pool.next_free.modify(token, |nf| nf[index] = head);
    pool.free_head.set(token, Some(index));
    pool.free_count.set(token, count + 1);
    RC::Ok
}

pub(crate) fn get<P: Port, const N: usize>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, pool: &'static FixedMemoryPool<P, N>, caller: &'static Task<P>, timeout: Timeout) -> (RC, usize) {
    if let Some(idx) = pop_free(token, pool) {
        return (RC::Ok, idx);
    }
    caller.set_wait_payload(token, WaitPayload::Word(0));
    wait::enter_wait(kernel, token, caller, Some(&pool.wait_queue), WaitReason::FixedMem, timeout);
    let rc = caller.wait_result(token);
    let idx = match caller.wait_payload(token) {
        WaitPayload::Word(w) => w,
        _ => 0,
    };
    (rc, idx)
}

pub(crate) fn get_polling<P: Port, const N: usize>(token: &mut CpuLockToken<P>, pool: &'static FixedMemoryPool<P, N>) -> (RC, usize) {
    match pop_free(token, pool) {
        Some(idx) => (RC::Ok, idx),
        None => (RC::Timeout, 0),
    }
}

pub(crate) fn release<P: Port, const N: usize>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, pool: &'static FixedMemoryPool<P, N>, index: usize) -> RC {
    if wait::first_waiter_complete(kernel, token, &pool.wait_queue, RC::Ok, |token, task| {
        task.set_wait_payload(token, WaitPayload::Word(index));
    }) {
        return RC::Ok;
    }
    push_free(token, pool, index)
}

pub(crate) fn delete<P: Port, const N: usize>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, pool: &'static FixedMemoryPool<P, N>) -> RC {
    wait::wait_list_notify_deleted(kernel, token, &pool.wait_queue);
    RC::Ok
}

/// `fmem_get` (spec §4.6), acting on the calling task. Must not be
/// called from ISR context; use [`fmem_get_polling`] there.
pub fn fmem_get<P: Port, const N: usize>(kernel: &'static Kernel<P>, pool: &'static FixedMemoryPool<P, N>, timeout: Timeout) -> (RC, usize) {
    if P::inside_isr() {
        return (RC::WContext, 0);
    }
    let mut lock = klock::lock_cpu::<P>();
    let caller = crate::task::current_or_fatal(kernel, &lock);
    get(kernel, &mut lock, pool, caller, timeout)
}

/// `fmem_get_polling`/`fmem_iget_polling` (spec §4.6): never blocks,
/// callable from either context.
pub fn fmem_get_polling<P: Port, const N: usize>(pool: &'static FixedMemoryPool<P, N>) -> (RC, usize) {
    let mut lock = klock::lock_cpu::<P>();
    get_polling(&mut lock, pool)
}

/// `fmem_release`/`fmem_irelease` (spec §4.6): hand `index` directly to
/// a waiter, or return it to the free list. Callable from either
/// context.
pub fn fmem_release<P: Port, const N: usize>(kernel: &'static Kernel<P>, pool: &'static FixedMemoryPool<P, N>, index: usize) -> RC {
    let mut lock = klock::lock_cpu::<P>();
    release(kernel, &mut lock, pool, index)
}

/// `fmem_delete` (spec §4.6): wake every waiter with `DELETED`.
pub fn fmem_delete<P: Port, const N: usize>(kernel: &'static Kernel<P>, pool: &'static FixedMemoryPool<P, N>) -> RC {
    let mut lock = klock::lock_cpu::<P>();
    delete(kernel, &mut lock, pool)
}
