//! Identifier types

use core::fmt;

/// Identifier of a schedulable task known to the host
///
/// Idle tasks use their CPU number offset by [`TaskId::IDLE_BASE`] so they
/// never collide with regular task ids.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TaskId(u64);

impl TaskId {
    /// First id reserved for per-CPU idle tasks
    pub const IDLE_BASE: u64 = 1 << 63;

    #[inline]
    pub const fn new(id: u64) -> Self {
        TaskId(id)
    }

    /// Id of the idle task of `cpu`
    #[inline]
    pub const fn idle(cpu: u32) -> Self {
        TaskId(Self::IDLE_BASE | cpu as u64)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_idle(self) -> bool {
        self.0 & Self::IDLE_BASE != 0
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_idle() {
            write!(f, "TaskId(idle/{})", self.0 & !Self::IDLE_BASE)
        } else {
            write!(f, "TaskId({})", self.0)
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_idle() {
            write!(f, "swapper/{}", self.0 & !Self::IDLE_BASE)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Registration timestamp of a patch
///
/// Strictly increasing across registrations, so a patch that was removed
/// and re-registered under the same name gets a different id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PatchId(u64);

impl PatchId {
    #[inline]
    pub const fn new(ts: u64) -> Self {
        PatchId(ts)
    }

    #[inline]
    pub const fn ts(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
