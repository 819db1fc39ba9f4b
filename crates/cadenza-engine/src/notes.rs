//! Engine-to-owner notifications: user notes and change masks.
//!
//! Both travel on lock-free intrusive stacks pushed from the engine thread
//! and drained by the owner in `ipc_dispatch`.

use std::ptr;
use std::sync::atomic::AtomicPtr;

use crate::graph::ProcessorId;
use crate::jobs::StackNode;

/// How a note combines with earlier notes on the same channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteFlags {
    /// Replace whatever the channel currently shows.
    Clear,
    /// Append below the channel's current content.
    Append,
}

/// A user-facing message posted by the engine (driver failures, xruns,
/// capture problems). The owner decides how to present it.
#[derive(Debug, Clone)]
pub struct UserNote {
    /// Routing key, e.g. `"pcm-driver"`, `"midi-driver"`, `"capture"`.
    pub channel: String,
    pub flags: NoteFlags,
    pub text: String,
}

impl UserNote {
    pub fn new(channel: impl Into<String>, flags: NoteFlags, text: impl Into<String>) -> Self {
        Self { channel: channel.into(), flags, text: text.into() }
    }
}

pub(crate) struct NoteNode {
    next: AtomicPtr<NoteNode>,
    pub note: UserNote,
}

impl NoteNode {
    pub fn new(note: UserNote) -> Box<Self> {
        Box::new(Self { next: AtomicPtr::new(ptr::null_mut()), note })
    }
}

impl StackNode for NoteNode {
    fn next_ptr(&self) -> &AtomicPtr<NoteNode> {
        &self.next
    }
}

/// Bitmask describing what changed about a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeMask(pub u32);

impl ChangeMask {
    pub const PARAMS: ChangeMask = ChangeMask(1 << 0);
    pub const BUSES: ChangeMask = ChangeMask(1 << 1);
    pub const INSERTION: ChangeMask = ChangeMask(1 << 2);
    pub const REMOVAL: ChangeMask = ChangeMask(1 << 3);

    #[inline]
    pub fn contains(&self, other: ChangeMask) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn union(&self, other: ChangeMask) -> ChangeMask {
        ChangeMask(self.0 | other.0)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

pub(crate) struct ChangeNode {
    next: AtomicPtr<ChangeNode>,
    pub proc: ProcessorId,
    pub mask: ChangeMask,
}

impl ChangeNode {
    pub fn new(proc: ProcessorId, mask: ChangeMask) -> Box<Self> {
        Box::new(Self { next: AtomicPtr::new(ptr::null_mut()), proc, mask })
    }
}

impl StackNode for ChangeNode {
    fn next_ptr(&self) -> &AtomicPtr<ChangeNode> {
        &self.next
    }
}

/// Receives whatever the engine has queued for the owner.
///
/// Passed to `ipc_dispatch`; all methods have no-op defaults so callers can
/// implement only what they present.
pub trait EngineObserver {
    /// A user note was posted.
    fn user_note(&mut self, note: UserNote) {
        let _ = note;
    }

    /// A processor reported changes (folded per processor per dispatch).
    fn processor_changed(&mut self, proc: ProcessorId, mask: ChangeMask) {
        let _ = (proc, mask);
    }
}

/// Observer that discards everything.
impl EngineObserver for () {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_mask_ops() {
        let m = ChangeMask::PARAMS.union(ChangeMask::REMOVAL);
        assert!(m.contains(ChangeMask::PARAMS));
        assert!(m.contains(ChangeMask::REMOVAL));
        assert!(!m.contains(ChangeMask::BUSES));
        assert!(!m.is_empty());
        assert!(ChangeMask::default().is_empty());
    }
}
