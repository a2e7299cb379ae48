//! A preemptive, priority-based real-time microkernel core for
//! single-core 16/32-bit microcontrollers.
//!
//! The crate is organized the way the kernel itself is: a scheduler and
//! task state machine ([`task`]) built on a shared wait/unblock protocol
//! ([`wait`]), a hierarchical timer wheel ([`timer`]), and the five
//! blocking object kinds built on top of the wait protocol ([`semaphore`],
//! [`mutex`], [`event_group`], [`queue`], [`fmem`]). [`sys`] ties it all
//! together into the [`sys::Kernel`] aggregate and the two entry points
//! application code calls into. [`port`] is the trait a target
//! architecture implements to supply context-switch primitives; nothing
//! above it assumes any particular CPU.
#![cfg_attr(not(feature = "std"), no_std)]

pub mod error;
pub mod event_group;
pub mod fmem;
pub mod mutex;
pub mod port;
pub mod queue;
pub mod semaphore;
pub mod sys;
pub mod task;
pub mod timer;
pub mod wait;

mod klock;
mod list;

/// The `fatal_error` hook of spec §7: invoked whenever a service detects
/// `RC::Internal`, an invariant violation the kernel has no recovery path
/// for. `std` builds panic so test harnesses see the failure; `no_std`
/// builds halt by looping, since a library has no business assuming a
/// reset vector or debugger is present to act on a breakpoint instruction.
#[cold]
pub fn fatal_error(msg: &str) -> ! {
    #[cfg(feature = "log")]
    log::error!("fatal kernel error: {msg}");
    #[cfg(feature = "std")]
    panic!("fatal kernel error: {msg}");
    #[cfg(not(feature = "std"))]
    {
        let _ = msg;
        loop {}
    }
}

pub use error::RC;
pub use event_group::EventGroup;
pub use fmem::FixedMemoryPool;
pub use mutex::Mutex;
pub use port::Port;
pub use queue::Queue;
pub use semaphore::Semaphore;
pub use sys::{IdleTaskConfig, Kernel};
pub use task::Task;
pub use timer::Timer;
pub use wait::Timeout;
