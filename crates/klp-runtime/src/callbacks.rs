//! Per-object patch callbacks
//!
//! Callbacks run with the registry lock held. `pre_patch` may refuse the
//! object; `post_unpatch` only runs when the matching `pre_patch` succeeded.

use klp_core::error::{KlpError, KlpResult};

use crate::model::KlpObject;
use crate::states::{get_state, SystemState};

/// Hooks around (un)patching one object
///
/// Every method defaults to doing nothing.
pub trait ObjectCallbacks: Send + Sync {
    /// Before the object's functions are redirected; an error (errno)
    /// aborts the object
    fn pre_patch(&self, _cx: &CallbackContext<'_>) -> Result<(), i32> {
        Ok(())
    }

    /// Once every task runs the patched code
    fn post_patch(&self, _cx: &CallbackContext<'_>) {}

    /// Before the unpatch transition starts
    fn pre_unpatch(&self, _cx: &CallbackContext<'_>) {}

    /// Once every task runs the original code again
    fn post_unpatch(&self, _cx: &CallbackContext<'_>) {}
}

/// System states visible to callbacks of one patch
#[derive(Debug, Clone, Copy)]
pub struct PatchStates<'a> {
    pub patch: &'a str,
    pub states: &'a [SystemState],
    /// Latest states declared by patches installed before this one
    pub prev: &'a [SystemState],
}

/// What a callback gets to see
pub struct CallbackContext<'a> {
    pub object: &'a KlpObject,
    states: &'a PatchStates<'a>,
}

impl<'a> CallbackContext<'a> {
    pub fn patch_name(&self) -> &str {
        self.states.patch
    }

    /// Name of the patched object, `vmlinux` for the base image
    pub fn object_name(&self) -> &str {
        self.object.display_name()
    }

    /// State `id` as declared by the patch being (un)applied
    pub fn get_state(&self, id: u64) -> Option<&SystemState> {
        get_state(self.states.states, id)
    }

    /// State `id` as left by previously installed patches
    pub fn get_prev_state(&self, id: u64) -> Option<&SystemState> {
        get_state(self.states.prev, id)
    }
}

pub(crate) fn pre_patch(obj: &mut KlpObject, states: &PatchStates<'_>) -> KlpResult<()> {
    let ret = match obj.callbacks_ref() {
        Some(cb) => cb.pre_patch(&CallbackContext { object: obj, states }),
        None => Ok(()),
    };
    obj.post_unpatch_enabled = ret.is_ok();
    ret.map_err(KlpError::CallbackRejected)
}

pub(crate) fn post_patch(obj: &KlpObject, states: &PatchStates<'_>) {
    if let Some(cb) = obj.callbacks_ref() {
        cb.post_patch(&CallbackContext { object: obj, states });
    }
}

pub(crate) fn pre_unpatch(obj: &KlpObject, states: &PatchStates<'_>) {
    if let Some(cb) = obj.callbacks_ref() {
        cb.pre_unpatch(&CallbackContext { object: obj, states });
    }
}

pub(crate) fn post_unpatch(obj: &mut KlpObject, states: &PatchStates<'_>) {
    if obj.post_unpatch_enabled {
        if let Some(cb) = obj.callbacks_ref() {
            cb.post_unpatch(&CallbackContext { object: obj, states });
        }
    }
    obj.post_unpatch_enabled = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::KlpFunc;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        refuse: bool,
    }

    impl ObjectCallbacks for Recorder {
        fn pre_patch(&self, cx: &CallbackContext<'_>) -> Result<(), i32> {
            self.calls.lock().unwrap().push(format!("pre_patch {}", cx.object_name()));
            if self.refuse {
                Err(-libc::EPERM)
            } else {
                Ok(())
            }
        }
        fn post_unpatch(&self, cx: &CallbackContext<'_>) {
            let v = cx.get_prev_state(1).map(|s| s.version);
            self.calls.lock().unwrap().push(format!("post_unpatch {:?}", v));
        }
    }

    struct Silent;
    impl ObjectCallbacks for Silent {}

    fn object(cb: Arc<dyn ObjectCallbacks>) -> KlpObject {
        KlpObject::module("p", "mod", vec![KlpFunc::new("foo", 0x10)]).callbacks(cb)
    }

    #[test]
    fn test_post_unpatch_gated_by_pre_patch() {
        let prev = [SystemState::new(1, 4)];
        let states = PatchStates { patch: "p", states: &[], prev: &prev };

        let rec = Arc::new(Recorder::default());
        let mut obj = object(rec.clone());
        pre_patch(&mut obj, &states).unwrap();
        post_unpatch(&mut obj, &states);
        post_unpatch(&mut obj, &states);
        assert_eq!(
            *rec.calls.lock().unwrap(),
            vec!["pre_patch mod".to_string(), "post_unpatch Some(4)".to_string()]
        );
    }

    #[test]
    fn test_refused_pre_patch() {
        let states = PatchStates { patch: "p", states: &[], prev: &[] };
        let rec = Arc::new(Recorder { refuse: true, ..Default::default() });
        let mut obj = object(rec.clone());
        assert_eq!(
            pre_patch(&mut obj, &states),
            Err(KlpError::CallbackRejected(-libc::EPERM))
        );
        post_unpatch(&mut obj, &states);
        assert_eq!(rec.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_default_methods_are_noops() {
        let states = PatchStates { patch: "p", states: &[], prev: &[] };
        let mut obj = object(Arc::new(Silent));
        assert!(pre_patch(&mut obj, &states).is_ok());
        post_patch(&obj, &states);
        pre_unpatch(&obj, &states);
        post_unpatch(&mut obj, &states);
    }
}
