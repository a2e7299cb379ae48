//! The CPU-lock token and the cells it guards.
//!
//! Every kernel data structure mutation happens inside a global
//! interrupt-disabled critical section (spec §5). Rather than trust every
//! call site to remember that, we thread a zero-sized capability token
//! through the internal API: only code that is statically known to hold
//! the token may read or write a [`CpuLockCell`]. This is the same
//! technique the teacher kernel uses (`tokenlock::UnsyncSingletonToken`),
//! just without the "CPU Lock can fail because it's also a public API"
//! wrinkle — here the lock *is* the hardware interrupt-disable, and
//! `Port::sr_save_int_dis`/`sr_restore` already nest correctly, so
//! entering it never fails.
use core::{marker::PhantomData, ops};
use tokenlock::UnsyncTokenLock;

use crate::port::Port;

pub(crate) struct CpuLockTag<P>(PhantomData<P>);

/// The key that "unlocks" [`CpuLockCell`].
pub(crate) type CpuLockToken<P> = tokenlock::UnsyncSingletonToken<CpuLockTag<P>>;
pub(crate) type CpuLockTokenRef<'a, P> = tokenlock::UnsyncSingletonTokenRef<'a, CpuLockTag<P>>;
pub(crate) type CpuLockTokenRefMut<'a, P> = tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag<P>>;

/// The keyhole type for [`UnsyncTokenLock`] that can be "unlocked" by
/// [`CpuLockToken`].
type CpuLockKeyhole<P> = tokenlock::SingletonTokenId<CpuLockTag<P>>;

/// A cell that can only be read or written while the CPU lock is held.
pub(crate) struct CpuLockCell<P, T: ?Sized>(UnsyncTokenLock<T, CpuLockKeyhole<P>>);

impl<P, T> CpuLockCell<P, T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::<P>::INIT, x))
    }
}

impl<P, T> ops::Deref for CpuLockCell<P, T> {
    type Target = UnsyncTokenLock<T, CpuLockKeyhole<P>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<P, T: Copy> CpuLockCell<P, T> {
    #[inline]
    pub(crate) fn get(&self, token: &CpuLockToken<P>) -> T {
        *self.0.read(token)
    }

    #[inline]
    pub(crate) fn set(&self, token: &mut CpuLockToken<P>, value: T) {
        self.0.replace(token, value);
    }

    #[inline]
    pub(crate) fn modify(&self, token: &mut CpuLockToken<P>, f: impl FnOnce(&mut T)) {
        let mut v = self.get(token);
        f(&mut v);
        self.set(token, v);
    }
}

/// RAII guard for a held CPU lock (i.e. global interrupts disabled).
///
/// Dropping the guard restores the interrupt state to whatever it was
/// before the guard was created, via [`Port::sr_restore`], so nested
/// acquisitions (e.g. a kernel service called from within an ISR that
/// itself interrupted another critical section) compose correctly.
pub(crate) struct CpuLockGuard<P: Port> {
    token: CpuLockToken<P>,
    saved: P::IntState,
}

impl<P: Port> CpuLockGuard<P> {
    pub(crate) fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, P> {
        self.token.borrow_mut()
    }
}

impl<P: Port> ops::Deref for CpuLockGuard<P> {
    type Target = CpuLockToken<P>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<P: Port> ops::DerefMut for CpuLockGuard<P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

impl<P: Port> Drop for CpuLockGuard<P> {
    fn drop(&mut self) {
        // Safety: `saved` was produced by the matching `sr_save_int_dis`.
        unsafe { P::sr_restore(self.saved) };
    }
}

/// Disable interrupts (if not already disabled) and obtain a token proving
/// it. Never fails: the underlying primitive nests via save/restore.
#[inline]
pub(crate) fn lock_cpu<P: Port>() -> CpuLockGuard<P> {
    // Safety: `sr_save_int_dis` may be called from any context and nests.
    let saved = unsafe { P::sr_save_int_dis() };
    CpuLockGuard {
        // Safety: interrupts are now disabled and this is the only
        // `CpuLockToken` manufactured for the duration of the disabled
        // region, because every path that disables interrupts goes
        // through this function and pairs with a `CpuLockGuard` drop.
        token: unsafe { CpuLockToken::new_unchecked() },
        saved,
    }
}
