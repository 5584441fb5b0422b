//! System state versioning
//!
//! Patches may declare that they modify some global system state (an id)
//! in a given version. A new patch must be able to take over every state
//! already modified by installed patches.

use crate::model::KlpPatch;

/// A system state modified by a patch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemState {
    pub id: u64,
    pub version: u32,
}

impl SystemState {
    pub const fn new(id: u64, version: u32) -> Self {
        SystemState { id, version }
    }
}

/// State `id` declared in `states`
pub fn get_state(states: &[SystemState], id: u64) -> Option<&SystemState> {
    states.iter().find(|s| s.id == id)
}

fn is_state_compatible(patch: &KlpPatch, old: &SystemState) -> bool {
    match get_state(patch.states(), old.id) {
        // A cumulative patch must handle all already modified states.
        None => !patch.is_replace(),
        Some(state) => state.version >= old.version,
    }
}

/// Whether `patch` may be installed on top of `installed`
pub fn is_patch_compatible(installed: &[KlpPatch], patch: &KlpPatch) -> bool {
    installed
        .iter()
        .flat_map(|old| old.states())
        .all(|old| is_state_compatible(patch, old))
}

/// Latest declaration of every state among `patches`, in install order
pub fn prev_states(patches: &[KlpPatch]) -> Vec<SystemState> {
    let mut out: Vec<SystemState> = Vec::new();
    for state in patches.iter().flat_map(|p| p.states()) {
        match out.iter_mut().find(|s| s.id == state.id) {
            Some(slot) => *slot = *state,
            None => out.push(*state),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{KlpFunc, KlpObject};

    fn patch(name: &str, replace: bool, states: &[SystemState]) -> KlpPatch {
        let base = KlpObject::vmlinux(name, vec![KlpFunc::new("foo", 0x10)]);
        let mut p = KlpPatch::new(base).allow(["mod"]).replace(replace);
        for s in states {
            p = p.state(*s);
        }
        p
    }

    #[test]
    fn test_no_states_always_compatible() {
        let installed = vec![patch("a", false, &[])];
        assert!(is_patch_compatible(&installed, &patch("b", true, &[])));
    }

    #[test]
    fn test_version_must_not_go_back() {
        let installed = vec![patch("a", false, &[SystemState::new(1, 2)])];
        assert!(is_patch_compatible(&installed, &patch("b", false, &[SystemState::new(1, 2)])));
        assert!(is_patch_compatible(&installed, &patch("b", false, &[SystemState::new(1, 3)])));
        assert!(!is_patch_compatible(&installed, &patch("b", false, &[SystemState::new(1, 1)])));
    }

    #[test]
    fn test_replace_must_carry_states() {
        let installed = vec![patch("a", false, &[SystemState::new(7, 1)])];
        assert!(is_patch_compatible(&installed, &patch("b", false, &[])));
        assert!(!is_patch_compatible(&installed, &patch("b", true, &[])));
        assert!(is_patch_compatible(&installed, &patch("b", true, &[SystemState::new(7, 1)])));
    }

    #[test]
    fn test_prev_states_latest_wins() {
        let patches = vec![
            patch("a", false, &[SystemState::new(1, 1), SystemState::new(2, 1)]),
            patch("b", false, &[SystemState::new(1, 3)]),
        ];
        let prev = prev_states(&patches);
        assert_eq!(get_state(&prev, 1), Some(&SystemState::new(1, 3)));
        assert_eq!(get_state(&prev, 2), Some(&SystemState::new(2, 1)));
        assert_eq!(get_state(&prev, 3), None);
    }
}
