//! Per-patch control surface
//!
//! `enabled` and `force` knobs plus the `transition` status of a patch,
//! addressed by patch name.

use std::sync::atomic::{fence, Ordering};

use klp_core::env::parse_bool;
use klp_core::error::{KlpError, KlpResult};
use klp_core::state::TargetState;
use klp_core::traits::KernelHost;
use klp_core::{kdebug, knotice};

use crate::callbacks;
use crate::core::{Livepatch, Registry};
use crate::states::prev_states;

impl<H: KernelHost> Livepatch<H> {
    /// Request the enabled state of patch `name`
    ///
    /// Writing the opposite of the current state of the transition patch
    /// reverses its transition. Disabling an enabled patch starts its
    /// unpatching transition. A disabled patch can never be enabled again.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> KlpResult<()> {
        let mut reg = self.lock();

        let Some(idx) = reg.find(name) else {
            return match reg.find_retained(name) {
                Some(_) if enabled => Err(KlpError::ReEnableNotAllowed),
                Some(_) => Err(KlpError::InvalidRequest("patch already disabled")),
                None => Err(KlpError::PatchNotFound(name.to_string())),
            };
        };

        if reg.patches[idx].is_enabled() == enabled {
            return Err(KlpError::InvalidRequest("patch already in requested state"));
        }

        if reg.transition == Some(reg.patches[idx].id()) {
            self.reverse_transition(&mut reg);
            Ok(())
        } else if !enabled {
            self.disable_locked(&mut reg, idx)
        } else {
            Err(KlpError::ReEnableNotAllowed)
        }
    }

    /// [`set_enabled`](Self::set_enabled) from a textual boolean
    pub fn store_enabled(&self, name: &str, input: &str) -> KlpResult<()> {
        let enabled = parse_bool(input).ok_or(KlpError::InvalidRequest("invalid boolean"))?;
        self.set_enabled(name, enabled)
    }

    /// Start the unpatching transition of `name`
    pub fn disable_patch(&self, name: &str) -> KlpResult<()> {
        self.set_enabled(name, false)
    }

    pub fn is_enabled(&self, name: &str) -> KlpResult<bool> {
        self.with_patch(name, |p| p.is_enabled())
            .ok_or_else(|| KlpError::PatchNotFound(name.to_string()))
    }

    /// Whether `name` is the transition patch
    pub fn is_transitioning(&self, name: &str) -> KlpResult<bool> {
        let reg = self.lock();
        match reg.find(name) {
            Some(idx) => Ok(reg.transition == Some(reg.patches[idx].id())),
            None if reg.find_retained(name).is_some() => Ok(false),
            None => Err(KlpError::PatchNotFound(name.to_string())),
        }
    }

    /// Force the transition of `name` to complete
    ///
    /// Only valid for the transition patch. Tasks are moved without any
    /// stack check; the patches they may still run are kept forever.
    pub fn force(&self, name: &str) -> KlpResult<()> {
        let mut reg = self.lock();
        let is_transition = reg
            .find(name)
            .is_some_and(|idx| reg.transition == Some(reg.patches[idx].id()));
        if !is_transition {
            return Err(KlpError::InvalidRequest("patch is not in transition"));
        }
        self.force_transition(&mut reg);
        Ok(())
    }

    /// [`force`](Self::force) from a textual boolean; false is a no-op
    pub fn store_force(&self, name: &str, input: &str) -> KlpResult<()> {
        match parse_bool(input) {
            Some(true) => self.force(name),
            Some(false) => Ok(()),
            None => Err(KlpError::InvalidRequest("invalid boolean")),
        }
    }

    fn disable_locked(&self, reg: &mut Registry, idx: usize) -> KlpResult<()> {
        if !reg.patches[idx].is_enabled() {
            return Err(KlpError::InvalidRequest("patch not enabled"));
        }
        if reg.transition.is_some() {
            return Err(KlpError::AlreadyInTransition);
        }
        knotice!("disabling patch '{}'", reg.patches[idx].name());

        self.init_transition(reg, idx, TargetState::Unpatched);

        let prev = prev_states(&reg.patches[..idx]);
        reg.patches[idx].with_objects(&prev, |objs, states| {
            for obj in objs.iter().filter(|o| o.is_patched()) {
                callbacks::pre_unpatch(obj, states);
            }
        });

        // Transition flags before pending flags, so a task switched by
        // update_task_state sees the transition.
        fence(Ordering::SeqCst);

        self.start_transition(reg);
        reg.patches[idx].set_enabled(false);
        kdebug!("'{}': unpatching started", reg.patches[idx].name());
        self.try_complete_locked(reg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::callbacks::{CallbackContext, ObjectCallbacks};
    use crate::config::LivepatchConfig;
    use crate::core::Livepatch;
    use crate::model::{KlpFunc, KlpObject, KlpPatch};
    use crate::sim::SimHost;
    use crate::transition::TransitionStatus;
    use klp_core::error::KlpError;

    #[derive(Default)]
    struct Log(Mutex<Vec<&'static str>>);

    impl ObjectCallbacks for Log {
        fn pre_patch(&self, _cx: &CallbackContext<'_>) -> Result<(), i32> {
            self.0.lock().unwrap().push("pre_patch");
            Ok(())
        }
        fn post_patch(&self, _cx: &CallbackContext<'_>) {
            self.0.lock().unwrap().push("post_patch");
        }
        fn pre_unpatch(&self, _cx: &CallbackContext<'_>) {
            self.0.lock().unwrap().push("pre_unpatch");
        }
        fn post_unpatch(&self, _cx: &CallbackContext<'_>) {
            self.0.lock().unwrap().push("post_unpatch");
        }
    }

    fn setup() -> (Arc<SimHost>, Livepatch<SimHost>) {
        let host = Arc::new(SimHost::new());
        host.add_symbol(None, "foo", 0x1000, 0x40);
        host.add_symbol(None, "foo_v2", 0x8000, 0x40);
        host.load_module("p", true);
        let lp = Livepatch::with_config(Arc::clone(&host), LivepatchConfig::new());
        (host, lp)
    }

    fn patch(log: &Arc<Log>) -> KlpPatch {
        let base = KlpObject::vmlinux("p", vec![KlpFunc::new("foo", 0x8000)]).callbacks(log.clone());
        KlpPatch::new(base).allow(["mod"])
    }

    #[test]
    fn test_enable_disable_cycle_with_callbacks() {
        let (host, lp) = setup();
        let log = Arc::new(Log::default());
        lp.enable_patch(patch(&log)).unwrap();
        assert_eq!(lp.is_enabled("p"), Ok(true));
        assert_eq!(lp.is_transitioning("p"), Ok(false));

        lp.store_enabled("p", "0").unwrap();
        assert_eq!(lp.is_enabled("p"), Err(KlpError::PatchNotFound("p".into())));
        assert_eq!(
            *log.0.lock().unwrap(),
            vec!["pre_patch", "post_patch", "pre_unpatch", "post_unpatch"]
        );
        assert_eq!(host.module_refcount("p"), 0);
    }

    #[test]
    fn test_control_errors() {
        let (host, lp) = setup();
        let log = Arc::new(Log::default());
        assert_eq!(lp.set_enabled("p", false), Err(KlpError::PatchNotFound("p".into())));

        lp.enable_patch(patch(&log)).unwrap();
        assert_eq!(
            lp.set_enabled("p", true),
            Err(KlpError::InvalidRequest("patch already in requested state"))
        );
        assert_eq!(lp.store_enabled("p", "maybe"), Err(KlpError::InvalidRequest("invalid boolean")));
        assert_eq!(lp.force("p"), Err(KlpError::InvalidRequest("patch is not in transition")));
        assert_eq!(lp.store_force("p", "0"), Ok(()));
        assert!(lp.store_force("p", "x").is_err());

        let task = host.spawn_task();
        host.set_stack(&task, vec![0x8000]);
        lp.disable_patch("p").unwrap();
        assert_eq!(lp.is_transitioning("p"), Ok(true));
        assert_eq!(lp.store_force("p", "1"), Ok(()));
        assert_eq!(lp.is_transitioning("p"), Ok(false));
        assert_eq!(lp.try_complete_transition(), TransitionStatus::Idle);
    }
}
