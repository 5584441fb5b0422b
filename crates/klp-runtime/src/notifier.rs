//! Module load/unload notifications
//!
//! When a module comes, every patch allowed to touch it gets its object
//! applied: objects already known are resolved in place, missing ones are
//! requested from the companion module `<patch>__<module>`. When a module
//! goes, the objects patching it are reverted and their addresses dropped.

use std::collections::HashSet;

use klp_core::error::{KlpError, KlpResult};
use klp_core::id::PatchId;
use klp_core::traits::KernelHost;
use klp_core::{kdebug, kinfo, knotice, kwarn};

use crate::callbacks;
use crate::core::{Livepatch, Registry};
use crate::model::companion_name;
use crate::states::prev_states;

impl<H: KernelHost> Livepatch<H> {
    /// `module` is being loaded
    ///
    /// An error should make the loader refuse the module.
    pub fn on_module_coming(&self, module: &str) -> KlpResult<()> {
        let mut reg = self.lock();
        let mut requested: HashSet<PatchId> = HashSet::new();

        loop {
            self.load_known_objects(&mut reg, module)?;
            if !self.config.request_companions {
                return Ok(());
            }

            let next = reg
                .patches
                .iter()
                .filter(|p| p.allows(module) && p.find_object(Some(module)).is_none())
                .find(|p| !requested.contains(&p.id()))
                .map(|p| (p.name().to_string(), p.id()));
            let Some((patch_name, patch_id)) = next else {
                return Ok(());
            };
            requested.insert(patch_id);

            let companion = companion_name(&patch_name, module);
            drop(reg);
            let ret = self.host.request_module(&companion);
            reg = self.lock();

            if let Err(code) = ret {
                kinfo!("Module load failed: {}", companion);
                // The patch may have gone away meanwhile.
                if reg.find(&patch_name).map(|i| reg.patches[i].id()) == Some(patch_id) {
                    return Err(KlpError::ModuleLoad(code));
                }
            }
            // The patch list may have changed while unlocked.
        }
    }

    /// Resolve and apply objects for `module` that exist but are not loaded
    fn load_known_objects(&self, reg: &mut Registry, module: &str) -> KlpResult<()> {
        let tidx = reg.transition_index();
        for i in 0..reg.patches.len() {
            let in_transition = tidx == Some(i);
            let prev = prev_states(&reg.patches[..i]);
            let patch_name = reg.patches[i].name().to_string();

            let ret = reg.patches[i].with_objects(&prev, |objs, states| {
                for obj in objs.iter_mut() {
                    if obj.name() != Some(module) || obj.is_loaded() {
                        continue;
                    }
                    obj.init_loaded(&*self.host, in_transition).map_err(|e| {
                        kwarn!(
                            "failed to initialize patch '{}' for module '{}' ({})",
                            patch_name,
                            module,
                            e.errno()
                        );
                        e
                    })?;

                    knotice!("applying patch '{}' to loading module '{}'", patch_name, module);

                    if let Err(e) = callbacks::pre_patch(obj, states) {
                        kwarn!("pre-patch callback failed for object '{}'", module);
                        obj.free_loaded();
                        return Err(e);
                    }
                    if let Err(e) = obj.patch(&self.stacks, &*self.host) {
                        kwarn!(
                            "failed to apply patch '{}' to module '{}' ({})",
                            patch_name,
                            module,
                            e.errno()
                        );
                        callbacks::post_unpatch(obj, states);
                        obj.free_loaded();
                        return Err(e);
                    }
                    if !in_transition {
                        callbacks::post_patch(obj, states);
                    }
                }
                Ok(())
            });

            if let Err(e) = ret {
                kwarn!(
                    "patch '{}' failed for module '{}', refusing to load module '{}'",
                    patch_name,
                    module,
                    module
                );
                // The loader refuses the module: no going event will follow.
                self.revert_module_objects(reg, module, i + 1);
                return Err(e);
            }
        }
        Ok(())
    }

    /// `module` is going away, or failed to load
    pub fn on_module_going(&self, module: &str) {
        let mut reg = self.lock();
        let limit = reg.patches.len();
        self.revert_module_objects(&mut reg, module, limit);

        // Entries kept by forced transitions point into the module too.
        for patch in reg.retained.iter_mut() {
            let patch_name = patch.name().to_string();
            for obj in patch.objs.iter_mut() {
                if obj.name() == Some(module) && obj.is_loaded() {
                    kdebug!("dropping retained '{}' entries for '{}'", patch_name, module);
                    obj.unpatch(&self.stacks, &*self.host, false);
                    obj.free_loaded();
                }
            }
        }
    }

    /// Revert the loaded objects for `module` in the first `limit` patches
    fn revert_module_objects(&self, reg: &mut Registry, module: &str, limit: usize) {
        let tidx = reg.transition_index();

        for i in 0..limit.min(reg.patches.len()) {
            let in_transition = tidx == Some(i);
            let prev = prev_states(&reg.patches[..i]);
            let patch_name = reg.patches[i].name().to_string();

            reg.patches[i].with_objects(&prev, |objs, states| {
                for obj in objs.iter_mut() {
                    if obj.name() != Some(module) || !obj.is_loaded() {
                        continue;
                    }
                    if !in_transition && obj.is_patched() {
                        callbacks::pre_unpatch(obj, states);
                    }
                    knotice!("reverting patch '{}' on unloading module '{}'", patch_name, module);
                    obj.unpatch(&self.stacks, &*self.host, false);
                    callbacks::post_unpatch(obj, states);
                    obj.free_loaded();
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex, Weak};

    use crate::callbacks::{CallbackContext, ObjectCallbacks};
    use crate::config::LivepatchConfig;
    use crate::core::Livepatch;
    use crate::func_stack::Dispatch;
    use crate::model::{KlpFunc, KlpObject, KlpPatch};
    use crate::sim::SimHost;
    use klp_core::error::KlpError;

    const MOD_FOO: u64 = 0x40_0000;
    const FOO2: u64 = 0x8000;

    fn host() -> Arc<SimHost> {
        let host = Arc::new(SimHost::new());
        host.add_symbol(None, "vfunc", 0x1000, 0x40);
        host.add_symbol(None, "vfunc_v2", 0x7000, 0x40);
        host.add_symbol(None, "foo2", FOO2, 0x40);
        host.add_module_symbol("mod", "foo", MOD_FOO, 0x80);
        host.load_module("p", true);
        host
    }

    fn patch() -> KlpPatch {
        KlpPatch::new(KlpObject::vmlinux("p", vec![KlpFunc::new("vfunc", 0x7000)])).allow(["mod"])
    }

    /// Companion loader that hands the module object to the service
    fn install_loader(host: &Arc<SimHost>, lp: &Arc<Livepatch<SimHost>>, cb: Option<Arc<dyn ObjectCallbacks>>) {
        let weak: Weak<Livepatch<SimHost>> = Arc::downgrade(lp);
        let sim = Arc::downgrade(host);
        host.set_module_loader(move |name: &str| {
            let lp = weak.upgrade().ok_or(-libc::ENOENT)?;
            let sim = sim.upgrade().ok_or(-libc::ENOENT)?;
            if name != "p__mod" {
                return Err(-libc::ENOENT);
            }
            sim.load_module(name, true);
            let mut obj = KlpObject::module("p", "mod", vec![KlpFunc::new("foo", FOO2)]);
            if let Some(cb) = &cb {
                obj = obj.callbacks(Arc::clone(cb));
            }
            lp.add_object(obj).map_err(|e| e.errno())
        });
    }

    #[test]
    fn test_module_coming_requests_companion() {
        let host = host();
        let lp = Arc::new(Livepatch::with_config(Arc::clone(&host), LivepatchConfig::new()));
        install_loader(&host, &lp, None);
        let task = host.spawn_task();

        lp.enable_patch(patch()).unwrap();
        assert_eq!(lp.dispatch(MOD_FOO, &*task), Dispatch::Original);

        host.load_module("mod", false);
        lp.on_module_coming("mod").unwrap();
        assert_eq!(host.requested(), vec!["p__mod".to_string()]);
        assert_eq!(lp.dispatch(MOD_FOO, &*task), Dispatch::Redirect(FOO2));

        lp.on_module_going("mod");
        host.unload_module("mod");
        assert_eq!(lp.dispatch(MOD_FOO, &*task), Dispatch::Original);
        assert!(!host.is_hooked(MOD_FOO));
        let loaded = lp
            .with_patch("p", |p| p.objects().iter().any(|o| o.name() == Some("mod") && o.is_loaded()))
            .unwrap();
        assert!(!loaded);

        // Known object: resolved in place, no new request.
        host.load_module("mod", false);
        lp.on_module_coming("mod").unwrap();
        assert_eq!(host.requested().len(), 1);
        assert_eq!(lp.dispatch(MOD_FOO, &*task), Dispatch::Redirect(FOO2));
    }

    #[test]
    fn test_enable_requests_companions_of_loaded_targets() {
        let host = host();
        host.load_module("mod", false);
        let lp = Arc::new(Livepatch::with_config(Arc::clone(&host), LivepatchConfig::new()));
        install_loader(&host, &lp, None);
        let task = host.spawn_task();

        lp.enable_patch(patch()).unwrap();
        assert_eq!(lp.dispatch(MOD_FOO, &*task), Dispatch::Redirect(FOO2));
        assert_eq!(host.module_refcount("p__mod"), 1);

        lp.disable_patch("p").unwrap();
        assert_eq!(lp.dispatch(MOD_FOO, &*task), Dispatch::Original);
        assert_eq!(host.module_refcount("p__mod"), 0);
        assert_eq!(host.module_refcount("p"), 0);
    }

    #[test]
    fn test_failed_companion_refuses_module() {
        let host = host();
        let lp = Livepatch::with_config(Arc::clone(&host), LivepatchConfig::new());
        lp.enable_patch(patch()).unwrap();

        host.load_module("mod", false);
        assert_eq!(lp.on_module_coming("mod"), Err(KlpError::ModuleLoad(-libc::ENOENT)));
        // Modules the patch does not list are ignored.
        assert_eq!(lp.on_module_coming("other"), Ok(()));
    }

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

    #[test]
    fn test_module_callbacks_order() {
        let host = host();
        let lp = Arc::new(Livepatch::with_config(Arc::clone(&host), LivepatchConfig::new()));
        let log = Arc::new(Log::default());
        install_loader(&host, &lp, Some(log.clone()));

        lp.enable_patch(patch()).unwrap();
        host.load_module("mod", false);
        lp.on_module_coming("mod").unwrap();
        lp.on_module_going("mod");
        assert_eq!(
            *log.0.lock().unwrap(),
            vec!["pre_patch", "post_patch", "pre_unpatch", "post_unpatch"]
        );
    }

    #[test]
    fn test_module_going_during_transition_skips_pre_unpatch() {
        let host = host();
        let lp = Arc::new(Livepatch::with_config(Arc::clone(&host), LivepatchConfig::new()));
        let log = Arc::new(Log::default());
        install_loader(&host, &lp, Some(log.clone()));
        let task = host.spawn_task();
        host.set_stack(&task, vec![0x1004]);

        lp.enable_patch(patch()).unwrap();
        host.load_module("mod", false);
        lp.on_module_coming("mod").unwrap();
        assert_eq!(lp.dispatch(MOD_FOO, &*task), Dispatch::Original);

        lp.on_module_going("mod");
        assert_eq!(*log.0.lock().unwrap(), vec!["pre_patch", "post_unpatch"]);
    }

    struct Refuse;

    impl ObjectCallbacks for Refuse {
        fn pre_patch(&self, _cx: &CallbackContext<'_>) -> Result<(), i32> {
            Err(-libc::EPERM)
        }
    }

    #[test]
    fn test_refused_module_reverts_earlier_patches() {
        let host = host();
        host.add_symbol(None, "foo3", 0x9000, 0x40);
        host.load_module("q", true);
        let lp = Livepatch::with_config(Arc::clone(&host), LivepatchConfig::new());
        let log = Arc::new(Log::default());
        let task = host.spawn_task();

        let p = patch().object(
            KlpObject::module("p", "mod", vec![KlpFunc::new("foo", FOO2)])
                .carrier("p")
                .callbacks(log.clone()),
        );
        lp.enable_patch(p).unwrap();
        let q = KlpPatch::new(KlpObject::vmlinux("q", vec![KlpFunc::new("vfunc", 0x7000)]))
            .allow(["mod"])
            .object(
                KlpObject::module("q", "mod", vec![KlpFunc::new("foo", 0x9000)])
                    .carrier("q")
                    .callbacks(Arc::new(Refuse)),
            );
        lp.enable_patch(q).unwrap();

        host.load_module("mod", false);
        assert_eq!(lp.on_module_coming("mod"), Err(KlpError::CallbackRejected(-libc::EPERM)));

        // Nothing may stay hooked in a module that never loaded.
        assert!(!host.is_hooked(MOD_FOO));
        assert_eq!(lp.dispatch(MOD_FOO, &*task), Dispatch::Original);
        assert_eq!(
            *log.0.lock().unwrap(),
            vec!["pre_patch", "post_patch", "pre_unpatch", "post_unpatch"]
        );
        for name in ["p", "q"] {
            let loaded = lp
                .with_patch(name, |p| p.objects().iter().any(|o| o.name() == Some("mod") && o.is_loaded()))
                .unwrap();
            assert!(!loaded);
        }
    }
}
