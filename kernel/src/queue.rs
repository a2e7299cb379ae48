//! Bounded message queue, including the capacity-0 rendezvous case and
//! the connected-event-group hookup (spec §4.6).
use crate::error::RC;
use crate::event_group::EventGroup;
use crate::klock::{self, CpuLockCell, CpuLockToken};
use crate::list::List;
use crate::port::Port;
use crate::sys::Kernel;
use crate::task::{Task, WaitPayload, WaitReason};
use crate::wait::{self, Timeout};

const MAGIC_QUEUE: u32 = 0x4451_5545; // "DQUE"

#[derive(Clone, Copy)]
struct EventGroupLink<P: Port> {
    eg: &'static EventGroup<P>,
    pattern: u32,
}

/// A bounded FIFO of single machine-word messages (spec §3 "Blocking
/// objects: Data queue"). `N` is the queue's capacity; `N == 0` is a
/// legal pure-rendezvous queue. Messages are caller-defined words —
/// typically a pointer cast to `usize` — never interpreted by the
/// queue itself.
pub struct Queue<P: Port, const N: usize> {
    magic: u32,
    storage: CpuLockCell<P, [usize; N]>,
    tail: CpuLockCell<P, usize>,
    head: CpuLockCell<P, usize>,
    filled: CpuLockCell<P, usize>,
    wait_send: List<P, Task<P>>,
    wait_receive: List<P, Task<P>>,
    eventgrp_link: CpuLockCell<P, Option<EventGroupLink<P>>>,
}

impl<P: Port, const N: usize> Queue<P, N> {
    pub const fn new() -> Self {
        Self {
            magic: MAGIC_QUEUE,
            storage: CpuLockCell::new([0; N]),
            tail: CpuLockCell::new(0),
            head: CpuLockCell::new(0),
            filled: CpuLockCell::new(0),
            wait_send: List::new(),
            wait_receive: List::new(),
            eventgrp_link: CpuLockCell::new(None),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC_QUEUE
    }

    pub fn len(&self, token: &CpuLockToken<P>) -> usize {
        self.filled.get(token)
    }

    fn fifo_write(&self, token: &mut CpuLockToken<P>, value: usize) -> bool {
        let filled = self.filled.get(token);
        if filled >= N {
            return false;
        }
        let head = self.head.get(token);
        self.storage.modify(token, |s| s[head] = value);
        self.filled.set(token, filled + 1);
        self.head.set(token, if head + 1 >= N { 0 } else { head + 1 });
        true
    }

    fn fifo_read(&self, token: &mut CpuLockToken<P>) -> Option<usize> {
        let filled = self.filled.get(token);
        if filled == 0 {
            return None;
        }
        let tail = self.tail.get(token);
        let v = self.storage.get(token)[tail];
        self.filled.set(token, filled - 1);
        self.tail.set(token, if tail + 1 >= N { 0 } else { tail + 1 });
        Some(v)
    }
}

fn update_link<P: Port, const N: usize>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, q: &'static Queue<P, N>, set: bool) {
    if let Some(link) = q.eventgrp_link.get(token) {
        crate::event_group::link_manage(kernel, token, link.eg, link.pattern, set);
    }
}

/// Non-blocking attempt to send `value` (spec §4.6 "Send"). Returns
/// whether it was delivered — either straight to a waiting receiver or
/// into the FIFO.
fn try_send<P: Port, const N: usize>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, q: &'static Queue<P, N>, value: usize) -> bool {
    if wait::first_waiter_complete(kernel, token, &q.wait_receive, RC::Ok, |token, task| {
        task.set_wait_payload(token, WaitPayload::Word(value));
    }) {
        return true;
    }
    if q.fifo_write(token, value) {
        update_link(kernel, token, q, true);
        true
    } else {
        false
    }
}

/// Non-blocking attempt to receive (spec §4.6 "Receive"). Returns the
/// message if one was available, either from the FIFO or directly from
/// a rendezvousing sender (`N == 0`).
fn try_receive<P: Port, const N: usize>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, q: &'static Queue<P, N>) -> Option<usize> {
    if let Some(v) = q.fifo_read(token) {
        update_link(kernel, token, q, false);
        wait::first_waiter_complete(kernel, token, &q.wait_send, RC::Ok, |token, task| {
            let val = match task.wait_payload(token) {
                WaitPayload::Word(w) => w,
                _ => 0,
            };
            q.fifo_write(token, val);
            update_link(kernel, token, q, true);
        });
        return Some(v);
    }
    let mut rendezvous_value = 0usize;
    let got = wait::first_waiter_complete(kernel, token, &q.wait_send, RC::Ok, |token, task| {
        rendezvous_value = match task.wait_payload(token) {
            WaitPayload::Word(w) => w,
            _ => 0,
        };
    });
    if got {
        Some(rendezvous_value)
    } else {
        None
    }
}

pub(crate) fn send<P: Port, const N: usize>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, q: &'static Queue<P, N>, caller: &'static Task<P>, value: usize, timeout: Timeout) -> RC {
    if try_send(kernel, token, q, value) {
        return RC::Ok;
    }
    caller.set_wait_payload(token, WaitPayload::Word(value));
    wait::enter_wait(kernel, token, caller, Some(&q.wait_send), WaitReason::QueueSend, timeout);
    caller.wait_result(token)
}

pub(crate) fn send_polling<P: Port, const N: usize>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, q: &'static Queue<P, N>, value: usize) -> RC {
    if try_send(kernel, token, q, value) {
        RC::Ok
    } else {
        RC::Timeout
    }
}

pub(crate) fn receive<P: Port, const N: usize>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, q: &'static Queue<P, N>, caller: &'static Task<P>, timeout: Timeout) -> (RC, usize) {
    if let Some(v) = try_receive(kernel, token, q) {
        return (RC::Ok, v);
    }
    caller.set_wait_payload(token, WaitPayload::Word(0));
    wait::enter_wait(kernel, token, caller, Some(&q.wait_receive), WaitReason::QueueReceive, timeout);
    let rc = caller.wait_result(token);
    let value = match caller.wait_payload(token) {
        WaitPayload::Word(w) => w,
        _ => 0,
    };
    (rc, value)
}

pub(crate) fn receive_polling<P: Port, const N: usize>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, q: &'static Queue<P, N>) -> (RC, usize) {
    match try_receive(kernel, token, q) {
        Some(v) => (RC::Ok, v),
        None => (RC::Timeout, 0),
    }
}

pub(crate) fn delete<P: Port, const N: usize>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, q: &'static Queue<P, N>) -> RC {
    wait::wait_list_notify_deleted(kernel, token, &q.wait_send);
    wait::wait_list_notify_deleted(kernel, token, &q.wait_receive);
    RC::Ok
}

pub(crate) fn eventgrp_connect<P: Port, const N: usize>(token: &mut CpuLockToken<P>, q: &'static Queue<P, N>, eg: &'static EventGroup<P>, pattern: u32) {
    q.eventgrp_link.set(token, Some(EventGroupLink { eg, pattern }));
}

pub(crate) fn eventgrp_disconnect<P: Port, const N: usize>(token: &mut CpuLockToken<P>, q: &'static Queue<P, N>) {
    q.eventgrp_link.set(token, None);
}

/// `queue_send` (spec §4.6 "Send"), acting on the calling task. Must not
/// be called from ISR context; use [`queue_send_polling`] there.
pub fn queue_send<P: Port, const N: usize>(kernel: &'static Kernel<P>, q: &'static Queue<P, N>, value: usize, timeout: Timeout) -> RC {
    if P::inside_isr() {
        return RC::WContext;
    }
    let mut lock = klock::lock_cpu::<P>();
    let caller = crate::task::current_or_fatal(kernel, &lock);
    send(kernel, &mut lock, q, caller, value, timeout)
}

/// `queue_send_polling`/`queue_isend_polling` (spec §4.6): never blocks,
/// callable from either context.
pub fn queue_send_polling<P: Port, const N: usize>(kernel: &'static Kernel<P>, q: &'static Queue<P, N>, value: usize) -> RC {
    let mut lock = klock::lock_cpu::<P>();
    send_polling(kernel, &mut lock, q, value)
}

/// `queue_receive` (spec §4.6 "Receive"), acting on the calling task.
/// Must not be called from ISR context; use [`queue_receive_polling`]
/// there.
pub fn queue_receive<P: Port, const N: usize>(kernel: &'static Kernel<P>, q: &'static Queue<P, N>, timeout: Timeout) -> (RC, usize) {
    if P::inside_isr() {
        return (RC::WContext, 0);
    }
    let mut lock = klock::lock_cpu::<P>();
    let caller = crate::task::current_or_fatal(kernel, &lock);
    receive(kernel, &mut lock, q, caller, timeout)
}

/// `queue_receive_polling`/`queue_ireceive_polling` (spec §4.6): never
/// blocks, callable from either context.
pub fn queue_receive_polling<P: Port, const N: usize>(kernel: &'static Kernel<P>, q: &'static Queue<P, N>) -> (RC, usize) {
    let mut lock = klock::lock_cpu::<P>();
    receive_polling(kernel, &mut lock, q)
}

/// `queue_delete` (spec §4.6): wake every waiter, on either side, with
/// `DELETED`.
pub fn queue_delete<P: Port, const N: usize>(kernel: &'static Kernel<P>, q: &'static Queue<P, N>) -> RC {
    let mut lock = klock::lock_cpu::<P>();
    delete(kernel, &mut lock, q)
}

/// `queue_eventgrp_connect` (spec §4.5 "Connected event-group link").
pub fn queue_eventgrp_connect<P: Port, const N: usize>(q: &'static Queue<P, N>, eg: &'static EventGroup<P>, pattern: u32) {
    let mut lock = klock::lock_cpu::<P>();
    eventgrp_connect(&mut lock, q, eg, pattern)
}

/// `queue_eventgrp_disconnect`.
pub fn queue_eventgrp_disconnect<P: Port, const N: usize>(q: &'static Queue<P, N>) {
    let mut lock = klock::lock_cpu::<P>();
    eventgrp_disconnect(&mut lock, q)
}
