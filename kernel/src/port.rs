//! The architecture-abstraction interface (spec §6).
//!
//! Everything CPU- and board-specific — the context-switch assembly,
//! interrupt vector dispatch, and the hardware tick source — lives
//! outside this crate, behind this trait. A port crate (e.g.
//! `micrort-port-sim` for hosted testing, or a real Cortex-M/RISC-V port)
//! implements `Port` and hands the resulting type to [`crate::Kernel`].

/// Bundles everything the kernel needs from the outside world: the
/// per-task saved-context representation and the low-level CPU
/// primitives. Priority counts and the timer wheel's bucket count are
/// runtime parameters to [`crate::Kernel::new`], not part of this
/// trait.
///
/// # Safety
///
/// Implementors must uphold the contracts documented on each method; the
/// kernel relies on them to keep its critical sections actually critical
/// and its task stacks actually runnable.
pub unsafe trait Port: Sized + 'static {
    /// Per-task architecture state (typically just the saved stack
    /// pointer). Stored inline in the TCB, behind a `CpuLockCell`, hence
    /// `Copy`.
    type TaskState: Send + Sync + Copy + 'static;

    /// The value produced by [`Port::sr_save_int_dis`] and consumed by
    /// [`Port::sr_restore`] to undo exactly that disable.
    type IntState: Copy + Send + Sync + 'static;

    /// Unconditionally disable interrupts.
    ///
    /// # Safety
    /// May only be called from kernel-internal code that will re-enable
    /// interrupts (directly or via [`Port::sr_restore`]) before returning
    /// control to application code.
    unsafe fn int_disable();

    /// Unconditionally enable interrupts.
    ///
    /// # Safety
    /// Must only be called to undo a matching [`Port::int_disable`].
    unsafe fn int_enable();

    /// Save the current interrupt-enable state and disable interrupts,
    /// returning a token that restores exactly the saved state when
    /// passed to [`Port::sr_restore`]. Safe to call while interrupts are
    /// already disabled (nests).
    ///
    /// # Safety
    /// Every call must be paired with exactly one [`Port::sr_restore`] of
    /// the returned value.
    unsafe fn sr_save_int_dis() -> Self::IntState;

    /// Undo a [`Port::sr_save_int_dis`].
    ///
    /// # Safety
    /// `state` must be a value previously returned by
    /// [`Port::sr_save_int_dis`] that has not already been restored.
    unsafe fn sr_restore(state: Self::IntState);

    /// `true` if interrupts are currently disabled.
    fn is_int_disabled() -> bool;

    /// `true` if the calling code is running in interrupt (ISR) context.
    fn inside_isr() -> bool;

    /// Build an initial `TaskState` for a task whose body is `entry`,
    /// which will be resumed with interrupts enabled, `arg` in the ABI
    /// argument position, and a return address that lands in the
    /// kernel's "task exited" trampoline rather than undefined memory.
    ///
    /// `stack` is the entire caller-provided stack buffer; the port picks
    /// the correct end (ascending/descending, full/empty per its ABI) via
    /// [`Port::stack_top`].
    fn initialize_task_state(entry: unsafe extern "C" fn(usize) -> !, stack: &mut [u8], arg: usize) -> Self::TaskState;

    /// Return the ABI-correct "top of stack" pointer for a stack
    /// occupying `stack`, used by [`Port::initialize_task_state`] and
    /// available to ports that need it directly.
    fn stack_top(stack: &mut [u8]) -> *mut u8 {
        // Default: descending, full stack (the common case: ARM, RISC-V).
        // Ports targeting an ascending-stack or empty-stack ABI override
        // `initialize_task_state` directly and need not call this.
        unsafe { stack.as_mut_ptr().add(stack.len()) }
    }

    /// Request a context switch to occur as soon as the current
    /// interrupt-disabled region ends and any nested ISRs unwind. Must
    /// not switch synchronously.
    ///
    /// # Safety
    /// Must be called with the CPU lock held.
    unsafe fn context_switch_pend();

    /// Switch to the next runnable task immediately, without saving the
    /// caller's context. Used for task exit and the first dispatch out of
    /// `sys_start`. Never returns.
    ///
    /// # Safety
    /// Must be called with the CPU lock held and with no live references
    /// into the outgoing task's stack.
    unsafe fn context_switch_now_nosave() -> !;

    /// Optional hardware find-first-set. Returning `None` falls back to
    /// [`usize::trailing_zeros`], which is what most targets want anyway;
    /// override only if the target has a strictly faster primitive (e.g.
    /// a dedicated CLZ/CTZ instruction the compiler doesn't already use).
    #[inline]
    fn find_first_set(bits: usize) -> Option<u32> {
        let _ = bits;
        None
    }
}

/// Count trailing zeros, preferring the port's hardware primitive.
#[inline]
pub(crate) fn ffs<P: Port>(bits: usize) -> u32 {
    if bits == 0 {
        return usize::BITS;
    }
    P::find_first_set(bits).unwrap_or_else(|| bits.trailing_zeros())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use quickcheck_macros::quickcheck;

    /// A modifying operation on the ready bitmap.
    #[derive(Debug)]
    enum Cmd {
        Insert(usize),
        Remove(usize),
    }

    /// Map random bytes to a sequence of priority-bit insertions and
    /// removals, never removing a bit that isn't currently set.
    fn interpret(bytecode: &[u8]) -> impl Iterator<Item = Cmd> + '_ {
        let mut i = 0;
        let mut known_set_bits = Vec::new();
        std::iter::from_fn(move || {
            let instr = bytecode.get(i..i + 5)?;
            i += 5;
            let value = u32::from_le_bytes([instr[1], instr[2], instr[3], instr[4]]) as usize;
            if instr[0] % 2 == 0 || known_set_bits.is_empty() {
                let bit = value % usize::BITS as usize;
                known_set_bits.push(bit);
                Some(Cmd::Insert(bit))
            } else {
                let i = value % known_set_bits.len();
                Some(Cmd::Remove(known_set_bits.swap_remove(i)))
            }
        })
    }

    /// The scheduler always dispatches the lowest-numbered set priority
    /// bit (spec §3 "Ready structure"). `ffs`'s fallback path is exactly
    /// `trailing_zeros`; this checks that against an independent
    /// BTreeSet-backed model of "lowest member" across arbitrary
    /// insert/remove sequences, the way `r3_kernel`'s own priority
    /// bitmap is checked against a `BTreeSet` reference.
    #[quickcheck]
    fn lowest_set_bit_matches_reference_model(bytecode: Vec<u8>) -> bool {
        let mut bits: usize = 0;
        let mut reference: BTreeSet<usize> = BTreeSet::new();

        for cmd in interpret(&bytecode) {
            match cmd {
                Cmd::Insert(bit) => {
                    bits |= 1usize << bit;
                    reference.insert(bit);
                }
                Cmd::Remove(bit) => {
                    bits &= !(1usize << bit);
                    reference.remove(&bit);
                }
            }
            let expected = reference.iter().next().copied();
            let actual = if bits == 0 { None } else { Some(bits.trailing_zeros() as usize) };
            if expected != actual {
                return false;
            }
        }
        true
    }
}
