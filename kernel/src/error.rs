//! The unified kernel result code (spec §6 "Error codes", §7).
use core::fmt;

/// The result code returned by (almost) every kernel service.
///
/// Unlike the teacher kernel, which gives each service its own
/// narrowly-scoped error enum, this crate follows the spec's flatter
/// C-kernel taxonomy: one `RC` shared by every operation, with a handful
/// of internal sub-error enums (below) used only to keep precondition
/// checks that can fail for more than one reason readable, which then
/// collapse into `RC` via `From`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum RC {
    /// Success.
    Ok,
    /// A timed or non-blocking wait could not be satisfied in time.
    Timeout,
    /// A semaphore's `max_count` or a memory pool's block count would be
    /// exceeded.
    Overflow,
    /// Called from the wrong execution context (task vs. ISR).
    WContext,
    /// The target object is not in a state that permits this operation.
    WState,
    /// A parameter is out of range or otherwise invalid.
    WParam,
    /// The operation is illegal for the caller (e.g. unlocking a mutex you
    /// don't hold, or a configuration error such as a ceiling violation).
    IllegalUse,
    /// The object ID does not refer to a live object of the expected kind.
    InvalidObj,
    /// The task was unblocked because the object it was waiting on was
    /// deleted.
    Deleted,
    /// The task was unblocked by an explicit `task_release_wait`.
    Forced,
    /// An internal invariant was violated. See [`crate::fatal_error`].
    Internal,
}

impl fmt::Display for RC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for RC {}

macro_rules! define_subcode {
    (
        $( #[$m:meta] )*
        $vis:vis enum $Name:ident { $( $Variant:ident ),* $(,)? }
    ) => {
        $( #[$m] )*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $Name {
            $( $Variant ),*
        }

        impl From<$Name> for RC {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => RC::$Variant ),*
                }
            }
        }
    };
}

define_subcode! {
    /// The outcome of a mutex lock precondition check (spec §4.4), kept
    /// distinct from `RC` only so `lock_mutex` reads as a small match
    /// rather than a pile of early returns.
    pub(crate) enum LockPrecheckError { IllegalUse }
}
