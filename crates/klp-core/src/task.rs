//! Per-task patch state
//!
//! Every task the host exposes embeds one [`TaskPatchState`]. The transition
//! engine writes it under the registry lock; the dispatch hook and the
//! task's own safe-point hook read it without locking.

use core::sync::atomic::{AtomicBool, AtomicI8, Ordering};

use crate::state::TargetState;

/// Patch state and pending flag of one task
#[derive(Debug)]
pub struct TaskPatchState {
    patch_state: AtomicI8,
    pending: AtomicBool,
}

impl TaskPatchState {
    pub const fn new() -> Self {
        TaskPatchState {
            patch_state: AtomicI8::new(TargetState::Undefined as i8),
            pending: AtomicBool::new(false),
        }
    }

    /// Current patch state, acquire-ordered against [`set_state`](Self::set_state)
    #[inline]
    pub fn state(&self) -> TargetState {
        TargetState::from(self.patch_state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_state(&self, state: TargetState) {
        self.patch_state.store(state as i8, Ordering::Release);
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_pending(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Clear the pending flag, returning whether it was set
    #[inline]
    pub fn clear_pending(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    /// Copy state and pending flag from `parent` (fork)
    pub fn inherit(&self, parent: &TaskPatchState) {
        self.set_state(parent.state());
        self.pending.store(parent.is_pending(), Ordering::Release);
    }
}

impl Default for TaskPatchState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_undefined() {
        let s = TaskPatchState::new();
        assert_eq!(s.state(), TargetState::Undefined);
        assert!(!s.is_pending());
    }

    #[test]
    fn test_clear_pending_reports_previous() {
        let s = TaskPatchState::new();
        assert!(!s.clear_pending());
        s.set_pending();
        assert!(s.clear_pending());
        assert!(!s.is_pending());
    }

    #[test]
    fn test_inherit() {
        let parent = TaskPatchState::new();
        parent.set_state(TargetState::Unpatched);
        parent.set_pending();

        let child = TaskPatchState::new();
        child.inherit(&parent);
        assert_eq!(child.state(), TargetState::Unpatched);
        assert!(child.is_pending());
    }
}
