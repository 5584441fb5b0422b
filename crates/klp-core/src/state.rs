//! Patch, task and transition state enums

use core::fmt;

/// Patch state of a task, and the direction of a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum TargetState {
    /// No transition in progress
    Undefined = -1,

    /// Running the code as it was before the transition patch
    Unpatched = 0,

    /// Running the code of the transition patch
    Patched = 1,
}

impl TargetState {
    /// The opposite direction; `Undefined` stays `Undefined`
    #[inline]
    pub const fn inverse(self) -> TargetState {
        match self {
            TargetState::Patched => TargetState::Unpatched,
            TargetState::Unpatched => TargetState::Patched,
            TargetState::Undefined => TargetState::Undefined,
        }
    }

    #[inline]
    pub const fn is_defined(self) -> bool {
        !matches!(self, TargetState::Undefined)
    }

    #[inline]
    pub const fn as_i8(self) -> i8 {
        self as i8
    }
}

impl From<i8> for TargetState {
    fn from(v: i8) -> Self {
        match v {
            0 => TargetState::Unpatched,
            1 => TargetState::Patched,
            _ => TargetState::Undefined,
        }
    }
}

impl From<TargetState> for i8 {
    fn from(state: TargetState) -> i8 {
        state as i8
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetState::Undefined => "undefined",
            TargetState::Unpatched => "unpatching",
            TargetState::Patched => "patching",
        };
        f.write_str(s)
    }
}

/// Phase of the system-wide transition state machine
///
/// ```text
/// Idle -> Initializing -> InProgress -> Complete -> Idle
///                            |   ^
///                            v   |
///                          Reversing
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransitionPhase {
    /// No patch is transitioning
    Idle = 0,

    /// Target chosen and function flags set, tasks not yet asked to move
    Initializing = 1,

    /// Tasks are being migrated
    InProgress = 2,

    /// Direction is being flipped
    Reversing = 3,

    /// Every task reached the target state, finishing up
    Complete = 4,
}

impl TransitionPhase {
    /// Whether a transition patch exists
    #[inline]
    pub const fn is_active(&self) -> bool {
        !matches!(self, TransitionPhase::Idle)
    }
}

impl From<u8> for TransitionPhase {
    fn from(v: u8) -> Self {
        match v {
            1 => TransitionPhase::Initializing,
            2 => TransitionPhase::InProgress,
            3 => TransitionPhase::Reversing,
            4 => TransitionPhase::Complete,
            _ => TransitionPhase::Idle,
        }
    }
}

impl From<TransitionPhase> for u8 {
    fn from(phase: TransitionPhase) -> u8 {
        phase as u8
    }
}

/// Lifecycle of a registered patch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PatchLifecycle {
    /// Being validated and initialized
    Registering = 0,

    /// The transition patch
    InTransition = 1,

    /// Fully applied
    Enabled = 2,

    /// Fully reverted (or abandoned by a forced transition) but not released
    Disabled = 3,

    /// Removed from the registry, all references dropped
    Freed = 4,
}

impl PatchLifecycle {
    #[inline]
    pub const fn is_freed(&self) -> bool {
        matches!(self, PatchLifecycle::Freed)
    }
}

impl From<u8> for PatchLifecycle {
    fn from(v: u8) -> Self {
        match v {
            1 => PatchLifecycle::InTransition,
            2 => PatchLifecycle::Enabled,
            3 => PatchLifecycle::Disabled,
            4 => PatchLifecycle::Freed,
            _ => PatchLifecycle::Registering,
        }
    }
}

impl From<PatchLifecycle> for u8 {
    fn from(l: PatchLifecycle) -> u8 {
        l as u8
    }
}

impl fmt::Display for PatchLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PatchLifecycle::Registering => "registering",
            PatchLifecycle::InTransition => "in-transition",
            PatchLifecycle::Enabled => "enabled",
            PatchLifecycle::Disabled => "disabled",
            PatchLifecycle::Freed => "freed",
        };
        f.write_str(s)
    }
}

/// Scheduling state of a task as reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRunState {
    /// Executing on another CPU right now; its stack cannot be inspected
    Running,

    /// Off-CPU and runnable
    Runnable,

    /// Blocked
    Sleeping,

    /// Exited, waiting to be reaped
    Dead,
}

impl TaskRunState {
    /// Whether the stack of a task in this state may be walked
    #[inline]
    pub const fn is_inspectable(&self) -> bool {
        !matches!(self, TaskRunState::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_inverse() {
        assert_eq!(TargetState::Patched.inverse(), TargetState::Unpatched);
        assert_eq!(TargetState::Unpatched.inverse(), TargetState::Patched);
        assert_eq!(TargetState::Undefined.inverse(), TargetState::Undefined);
    }

    #[test]
    fn test_target_from_i8() {
        for s in [TargetState::Undefined, TargetState::Unpatched, TargetState::Patched] {
            assert_eq!(TargetState::from(i8::from(s)), s);
        }
        assert_eq!(TargetState::from(42), TargetState::Undefined);
    }

    #[test]
    fn test_phase_active() {
        assert!(!TransitionPhase::Idle.is_active());
        assert!(TransitionPhase::Initializing.is_active());
        assert!(TransitionPhase::Reversing.is_active());
        assert_eq!(TransitionPhase::from(200), TransitionPhase::Idle);
    }

    #[test]
    fn test_lifecycle_display() {
        assert_eq!(PatchLifecycle::InTransition.to_string(), "in-transition");
        assert!(PatchLifecycle::from(4).is_freed());
    }

    #[test]
    fn test_running_not_inspectable() {
        assert!(!TaskRunState::Running.is_inspectable());
        assert!(TaskRunState::Sleeping.is_inspectable());
    }
}
