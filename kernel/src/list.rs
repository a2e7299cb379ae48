//! Intrusive doubly-linked FIFO lists (spec §3 "Wait list", §9 "Back
//! pointers & cycles").
//!
//! Every list element lends itself to the list rather than being owned by
//! it: elements live in caller-provided `'static` storage (a `Task` or a
//! `Timer`), and the list only ever holds `&'static` references, guarded
//! by the CPU-lock token like every other piece of kernel state. This
//! mirrors the teacher kernel's intrusive-list idiom, collapsed down to
//! the two concrete element kinds this crate actually needs instead of
//! the teacher's fully generic accessor-cell machinery.
use crate::klock::{CpuLockCell, CpuLockToken};
use crate::port::Port;

/// One element's forward/back links within a [`List`].
pub(crate) struct Link<P, T: 'static> {
    prev: CpuLockCell<P, Option<&'static T>>,
    next: CpuLockCell<P, Option<&'static T>>,
}

impl<P, T> Link<P, T> {
    pub(crate) const fn new() -> Self {
        Self {
            prev: CpuLockCell::new(None),
            next: CpuLockCell::new(None),
        }
    }
}

impl<P: Port, T> Link<P, T> {
    pub(crate) fn next(&self, token: &CpuLockToken<P>) -> Option<&'static T> {
        self.next.get(token)
    }
}

/// An intrusive FIFO over elements of type `T`, accessed through a
/// projection `link_of` from `&T` to its embedded [`Link`].
///
/// `head`/`tail` are `None` iff the list is empty. There's no separate
/// "is linked" flag on elements; callers distinguish "linked" from
/// "unlinked" by whatever means fits the element (e.g. a task's `WAIT`
/// state bit, a timer's `active` flag), since that's state the caller
/// already has to track for other reasons.
pub(crate) struct List<P, T: 'static> {
    head: CpuLockCell<P, Option<&'static T>>,
    tail: CpuLockCell<P, Option<&'static T>>,
}

impl<P, T> List<P, T> {
    pub(crate) const fn new() -> Self {
        Self {
            head: CpuLockCell::new(None),
            tail: CpuLockCell::new(None),
        }
    }
}

impl<P: Port, T> List<P, T> {
    pub(crate) fn is_empty(&self, token: &CpuLockToken<P>) -> bool {
        self.head.get(token).is_none()
    }

    pub(crate) fn front(&self, token: &CpuLockToken<P>) -> Option<&'static T> {
        self.head.get(token)
    }

    pub(crate) fn push_back(
        &self,
        token: &mut CpuLockToken<P>,
        elem: &'static T,
        link_of: impl Fn(&'static T) -> &'static Link<P, T> + Copy,
    ) {
        let link = link_of(elem);
        link.prev.set(token, self.tail.get(token));
        link.next.set(token, None);
        match self.tail.get(token) {
            Some(old_tail) => link_of(old_tail).next.set(token, Some(elem)),
            None => self.head.set(token, Some(elem)),
        }
        self.tail.set(token, Some(elem));
    }

    pub(crate) fn pop_front(
        &self,
        token: &mut CpuLockToken<P>,
        link_of: impl Fn(&'static T) -> &'static Link<P, T> + Copy,
    ) -> Option<&'static T> {
        let head = self.head.get(token)?;
        self.remove(token, head, link_of);
        Some(head)
    }

    /// Unlink `elem`, which must currently be a member of this list.
    pub(crate) fn remove(
        &self,
        token: &mut CpuLockToken<P>,
        elem: &'static T,
        link_of: impl Fn(&'static T) -> &'static Link<P, T> + Copy,
    ) {
        let link = link_of(elem);
        let prev = link.prev.get(token);
        let next = link.next.get(token);
        match prev {
            Some(p) => link_of(p).next.set(token, next),
            None => self.head.set(token, next),
        }
        match next {
            Some(n) => link_of(n).prev.set(token, prev),
            None => self.tail.set(token, prev),
        }
        link.prev.set(token, None);
        link.next.set(token, None);
    }

    /// Visit every element from head to tail, stopping early if `f`
    /// returns `false`. Safe against `f` unlinking the *current* element
    /// (it captures `next` before calling `f`), but not against `f`
    /// unlinking other not-yet-visited elements from a *different* list.
    pub(crate) fn for_each_while(
        &self,
        token: &mut CpuLockToken<P>,
        link_of: impl Fn(&'static T) -> &'static Link<P, T> + Copy,
        mut f: impl FnMut(&mut CpuLockToken<P>, &'static T) -> bool,
    ) {
        let mut cur = self.head.get(token);
        while let Some(elem) = cur {
            let next = link_of(elem).next.get(token);
            if !f(token, elem) {
                break;
            }
            cur = next;
        }
    }
}
