//! The hierarchical timer wheel (spec §4.7).
use crate::klock::{self, CpuLockCell, CpuLockToken};
use crate::list::Link;
use crate::port::Port;
use crate::sys::Kernel;

/// A timeout value that never fires (spec §5 "Cancellation and
/// timeouts").
pub const INFINITE: u32 = u32::MAX;

const MAGIC_TIMER: u32 = 0x544d_5252; // "TMRR"

#[derive(Clone, Copy, PartialEq, Eq)]
enum Location {
    Tick(usize),
    Generic,
}

/// A user callback, invoked in tick-ISR context with the CPU lock held
/// (spec §4.7 "Firing context").
///
/// # Safety
/// Implementations receive a live `CpuLockToken` and may use it to call
/// any ISR-context kernel service; they must not retain `token` beyond
/// the call.
pub type TimerCallback<P> = unsafe fn(&'static Kernel<P>, &mut CpuLockToken<P>, usize);

/// A software timer (spec §3 "Timer"): a user callback plus a user data
/// word, scheduled on the [`Kernel`]'s timer wheel.
///
/// Every [`crate::task::Task`] embeds one of these privately for its own
/// sleep/wait timeouts; application code creates its own `Timer`
/// instances (typically in `'static` storage) for general-purpose
/// one-shot or self-rearming callbacks.
pub struct Timer<P: Port> {
    magic: u32,
    pub(crate) link: Link<P, Timer<P>>,
    active: CpuLockCell<P, bool>,
    location: CpuLockCell<P, Option<Location>>,
    timeout_cur: CpuLockCell<P, u32>,
    callback: TimerCallback<P>,
    user_data: CpuLockCell<P, usize>,
}

impl<P: Port> Timer<P> {
    /// Build an inactive timer with the given callback and user data.
    pub const fn new(callback: TimerCallback<P>, user_data: usize) -> Self {
        Self {
            magic: MAGIC_TIMER,
            link: Link::new(),
            active: CpuLockCell::new(false),
            location: CpuLockCell::new(None),
            timeout_cur: CpuLockCell::new(0),
            callback,
            user_data: CpuLockCell::new(user_data),
        }
    }

    /// Build an inactive timer whose user data is supplied later, via
    /// [`Timer::bind`], once a `'static` address exists to bind to. Used
    /// only for a task's embedded timeout timer.
    pub(crate) const fn new_internal(callback: TimerCallback<P>) -> Self {
        Self::new(callback, 0)
    }

    pub(crate) fn bind(&self, token: &mut CpuLockToken<P>, user_data: usize) {
        self.user_data.set(token, user_data);
    }

    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC_TIMER
    }

    pub fn is_active(&self, token: &CpuLockToken<P>) -> bool {
        self.active.get(token)
    }
}

pub(crate) fn start<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, timer: &'static Timer<P>, timeout: u32) -> Result<(), crate::error::RC> {
    if timeout == 0 || timeout == INFINITE {
        return Err(crate::error::RC::WParam);
    }
    if timer.active.get(token) {
        cancel(kernel, token, timer);
    }
    let mask = kernel.tick_mask();
    let c = kernel.tick_count.get(token);
    let k = kernel.num_tick_buckets as u32;
    if timeout < k {
        let idx = ((c.wrapping_add(timeout)) & mask) as usize;
        timer.timeout_cur.set(token, idx as u32);
        timer.location.set(token, Some(Location::Tick(idx)));
        kernel.tick_buckets[idx].push_back(token, timer, |t| &t.link);
    } else {
        let cur = timeout.wrapping_add(c & mask);
        timer.timeout_cur.set(token, cur);
        timer.location.set(token, Some(Location::Generic));
        kernel.generic_bucket.push_back(token, timer, |t| &t.link);
    }
    timer.active.set(token, true);
    Ok(())
}

pub(crate) fn cancel<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>, timer: &'static Timer<P>) {
    match timer.location.get(token) {
        Some(Location::Tick(idx)) => kernel.tick_buckets[idx].remove(token, timer, |t| &t.link),
        Some(Location::Generic) => kernel.generic_bucket.remove(token, timer, |t| &t.link),
        None => {}
    }
    timer.active.set(token, false);
    timer.location.set(token, None);
    timer.timeout_cur.set(token, 0);
}

pub(crate) fn time_left<P: Port>(kernel: &'static Kernel<P>, token: &CpuLockToken<P>, timer: &'static Timer<P>) -> u32 {
    let Some(loc) = timer.location.get(token) else {
        return 0;
    };
    let mask = kernel.tick_mask();
    let c = kernel.tick_count.get(token);
    match loc {
        Location::Tick(idx) => (idx as u32).wrapping_sub(c & mask).wrapping_add(mask + 1) & mask,
        Location::Generic => timer.timeout_cur.get(token).saturating_sub(c & mask),
    }
}

/// The tick handler (spec §4.7 "Tick handler"), invoked once per hardware
/// tick from [`Kernel::tick_int_processing`].
pub(crate) fn tick<P: Port>(kernel: &'static Kernel<P>, token: &mut CpuLockToken<P>) {
    let c = kernel.tick_count.get(token).wrapping_add(1);
    kernel.tick_count.set(token, c);
    let mask = kernel.tick_mask();
    let k = mask + 1;
    let i = (c & mask) as usize;

    if i == 0 {
        kernel.generic_bucket.for_each_while(token, |t| &t.link, |token, timer| {
            let cur = timer.timeout_cur.get(token);
            let new_val = cur.wrapping_sub(k);
            if new_val < k {
                kernel.generic_bucket.remove(token, timer, |t| &t.link);
                let idx = ((c.wrapping_add(new_val)) & mask) as usize;
                timer.timeout_cur.set(token, idx as u32);
                timer.location.set(token, Some(Location::Tick(idx)));
                kernel.tick_buckets[idx].push_back(token, timer, |t| &t.link);
            } else {
                timer.timeout_cur.set(token, new_val);
            }
            true
        });
    }

    while let Some(timer) = kernel.tick_buckets[i].front(token) {
        cancel(kernel, token, timer);
        #[cfg(feature = "log")]
        log::trace!("timer {:p} fired at tick {}", timer, c);
        // Safety: invoked from tick ISR context with the CPU lock held,
        // exactly the contract `TimerCallback` documents.
        unsafe { (timer.callback)(kernel, token, timer.user_data.get(token)) };
    }
}

/// `timer_start` (spec §4.7 "start"), callable from either context.
/// `timeout` must be in `1..INFINITE`.
pub fn timer_start<P: Port>(kernel: &'static Kernel<P>, timer: &'static Timer<P>, timeout: u32) -> Result<(), crate::error::RC> {
    let mut lock = klock::lock_cpu::<P>();
    start(kernel, &mut lock, timer, timeout)
}

/// `timer_cancel` (spec §4.7 "cancel"). No-op if already inactive.
/// Callable from either context.
pub fn timer_cancel<P: Port>(kernel: &'static Kernel<P>, timer: &'static Timer<P>) {
    let mut lock = klock::lock_cpu::<P>();
    cancel(kernel, &mut lock, timer)
}

/// `timer_time_left` (spec §4.7 "time_left"). Callable from either
/// context.
pub fn timer_time_left<P: Port>(kernel: &'static Kernel<P>, timer: &'static Timer<P>) -> u32 {
    let lock = klock::lock_cpu::<P>();
    time_left(kernel, &lock, timer)
}

#[cfg(test)]
mod tests {
    #[test]
    fn infinite_is_the_max_u32() {
        assert_eq!(super::INFINITE, u32::MAX);
    }
}
