// arena is a manually managed pool of slots. It does not lean on Rust's ownership to
// reclaim anything: a slot is only ever released by an explicit `free`, and touching a released slot
// is a reportable error rather than something the type system quietly prevents.
//
// Slot 0 is never handed out, so a `Handle` is never "null-like".

use std::fmt::{Debug, Display};

use thiserror::Error;

/// An opaque reference to a slot in an `Arena`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(usize);

impl Handle {
    /// The raw slot index, for diagnostics.
    pub fn index(&self) -> usize {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(index: usize) -> Handle {
        Handle(index)
    }
}

impl Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Ways that using a handle can go wrong. None of these should happen for a correct program, so
/// they indicate a bug in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    /// The handle does not name any slot the arena has ever allocated.
    #[error("tried to use invalid handle {0}")]
    InvalidHandle(Handle),
    /// The slot was allocated, but has since been freed.
    #[error("dereference after free: {0}")]
    UseAfterFree(Handle),
    /// The slot was already freed.
    #[error("double free: {0}")]
    DoubleFree(Handle),
}

#[derive(Debug)]
struct Slot<T> {
    live: bool,
    contents: T,
}

/// What happened to a slot during a `sweep`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// The slot was still live, so the sweep freed it.
    FreedWhileLive,
    /// The slot had already been freed.
    Collected,
}

/// A growable pool of `T`s addressed by `Handle`.
pub struct Arena<T> {
    // slots[0] is the reserved entry, and sweeping empties the whole thing (reserved entry included),
    // so the Option lets us tell a swept slot apart from a never-allocated one.
    slots: Vec<Option<Slot<T>>>,
}

impl<T> Arena<T> {
    /// An empty arena.
    pub fn new() -> Arena<T> {
        Arena { slots: vec![None] }
    }

    /// Store `contents` in a new live slot.
    pub fn alloc(&mut self, contents: T) -> Handle {
        if self.slots.is_empty() {
            self.slots.push(None);
        }
        let index = self.slots.len();
        self.slots.push(Some(Slot {
            live: true,
            contents,
        }));
        Handle(index)
    }

    fn slot(&self, handle: Handle) -> Result<&Slot<T>, HeapError> {
        self.slots
            .get(handle.index())
            .and_then(Option::as_ref)
            .ok_or(HeapError::InvalidHandle(handle))
    }

    fn slot_mut(&mut self, handle: Handle) -> Result<&mut Slot<T>, HeapError> {
        self.slots
            .get_mut(handle.index())
            .and_then(Option::as_mut)
            .ok_or(HeapError::InvalidHandle(handle))
    }

    /// Borrow the contents of a live slot.
    pub fn deref(&self, handle: Handle) -> Result<&T, HeapError> {
        let slot = self.slot(handle)?;
        if slot.live {
            Ok(&slot.contents)
        } else {
            Err(HeapError::UseAfterFree(handle))
        }
    }

    /// Mutably borrow the contents of a live slot.
    pub fn deref_mut(&mut self, handle: Handle) -> Result<&mut T, HeapError> {
        let slot = self.slot_mut(handle)?;
        if slot.live {
            Ok(&mut slot.contents)
        } else {
            Err(HeapError::UseAfterFree(handle))
        }
    }

    /// Mark a slot dead. Its contents stay put until the next `sweep`, but can no longer be reached.
    pub fn free(&mut self, handle: Handle) -> Result<(), HeapError> {
        let slot = self.slot_mut(handle)?;
        if !slot.live {
            return Err(HeapError::DoubleFree(handle));
        }
        slot.live = false;
        Ok(())
    }

    /// Number of live slots.
    pub fn live_count(&self) -> usize {
        self.slots.iter().flatten().filter(|s| s.live).count()
    }

    /// Empty the arena, reporting what state each slot was in. Every handle issued so far becomes
    /// invalid.
    pub fn sweep(&mut self) -> Vec<(Handle, SweepOutcome)> {
        let mut report = Vec::new();
        for (i, slot) in self.slots.drain(..).enumerate() {
            let Some(slot) = slot else { continue };
            let handle = Handle(i);
            let outcome = if slot.live {
                tracing::debug!(%handle, "freed while live");
                SweepOutcome::FreedWhileLive
            } else {
                tracing::debug!(%handle, "collected");
                SweepOutcome::Collected
            };
            report.push((handle, outcome));
        }
        report
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for Arena<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("slots", &self.slots.len())
            .field("live", &self.live_count())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alloc_never_returns_reserved_slot() {
        let mut arena = Arena::new();
        let h = arena.alloc("first");
        assert_ne!(h.index(), 0);
        assert_eq!(arena.deref(h), Ok(&"first"));
        assert_eq!(
            arena.deref(Handle::from_raw(0)),
            Err(HeapError::InvalidHandle(Handle::from_raw(0)))
        );
    }

    #[test]
    fn out_of_range_is_invalid() {
        let mut arena: Arena<i32> = Arena::new();
        arena.alloc(1);
        let bogus = Handle::from_raw(57);
        assert_eq!(arena.deref(bogus), Err(HeapError::InvalidHandle(bogus)));
        assert_eq!(arena.free(bogus), Err(HeapError::InvalidHandle(bogus)));
    }

    #[test]
    fn use_after_free_and_double_free_are_distinct() {
        let mut arena = Arena::new();
        let h = arena.alloc(String::from("x"));
        arena.free(h).unwrap();
        assert_eq!(arena.deref(h), Err(HeapError::UseAfterFree(h)));
        assert_eq!(arena.deref_mut(h).err(), Some(HeapError::UseAfterFree(h)));
        assert_eq!(arena.free(h), Err(HeapError::DoubleFree(h)));
        // The failure is reproducible, not a one-off.
        assert_eq!(arena.free(h), Err(HeapError::DoubleFree(h)));
    }

    #[test]
    fn deref_mut_writes_through() {
        let mut arena = Arena::new();
        let h = arena.alloc(1);
        *arena.deref_mut(h).unwrap() += 41;
        assert_eq!(arena.deref(h), Ok(&42));
    }

    #[test]
    fn sweep_reports_and_clears() {
        let mut arena = Arena::new();
        let a = arena.alloc(1);
        let b = arena.alloc(2);
        arena.free(a).unwrap();
        assert_eq!(arena.live_count(), 1);

        let report = arena.sweep();
        assert_eq!(
            report,
            vec![
                (a, SweepOutcome::Collected),
                (b, SweepOutcome::FreedWhileLive)
            ]
        );
        assert_eq!(arena.live_count(), 0);
        assert_eq!(arena.deref(b), Err(HeapError::InvalidHandle(b)));

        // Still usable afterwards, and still never hands out slot 0.
        let c = arena.alloc(3);
        assert_ne!(c.index(), 0);
        assert_eq!(arena.deref(c), Ok(&3));
    }
}
