//! Patch registry and the live patching service
//!
//! [`Livepatch`] owns the registry of installed patches, the redirection
//! stacks and the transition state. Every mutation is serialized by the
//! registry lock; the dispatch path and task safe points only read atomics
//! and RCU-published data.

use std::sync::atomic::{AtomicI8, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use klp_core::error::{KlpError, KlpResult};
use klp_core::id::PatchId;
use klp_core::state::{PatchLifecycle, TargetState, TransitionPhase};
use klp_core::traits::{KernelHost, Task};
use klp_core::{kdebug, kerror, kinfo, knotice, kwarn};

use crate::callbacks;
use crate::config::LivepatchConfig;
use crate::func_stack::{Dispatch, FuncStacks};
use crate::model::{companion_name, KlpObject, KlpPatch, PatchHandle};
use crate::rcu::RcuDomain;
use crate::shadow::ShadowStore;
use crate::states::{is_patch_compatible, prev_states};

/// Installed patches, guarded by the registry lock
pub(crate) struct Registry {
    /// Enabled and transitioning patches in install order
    pub(crate) patches: Vec<KlpPatch>,
    /// Abandoned by a forced transition; never released
    pub(crate) retained: Vec<KlpPatch>,
    pub(crate) transition: Option<PatchId>,
    pub(crate) signals_cnt: u32,
    next_ts: u64,
}

impl Registry {
    fn new() -> Self {
        Registry {
            patches: Vec::new(),
            retained: Vec::new(),
            transition: None,
            signals_cnt: 0,
            next_ts: 0,
        }
    }

    pub(crate) fn find(&self, name: &str) -> Option<usize> {
        self.patches.iter().position(|p| p.name() == name)
    }

    pub(crate) fn find_retained(&self, name: &str) -> Option<usize> {
        self.retained.iter().position(|p| p.name() == name)
    }

    pub(crate) fn index_of(&self, id: PatchId) -> Option<usize> {
        self.patches.iter().position(|p| p.id() == id)
    }

    pub(crate) fn transition_index(&self) -> Option<usize> {
        self.transition.and_then(|id| self.index_of(id))
    }

    fn next_id(&mut self) -> PatchId {
        self.next_ts += 1;
        PatchId::new(self.next_ts)
    }
}

/// The live patching service
///
/// # Example
///
/// ```rust,ignore
/// use klp_runtime::{Livepatch, KlpFunc, KlpObject, KlpPatch};
///
/// let lp = Livepatch::new(host);
/// let patch = KlpPatch::new(KlpObject::vmlinux("fix", vec![KlpFunc::new("foo", new_foo)]))
///     .allow(["ext4"]);
/// let handle = lp.enable_patch(patch)?;
/// lp.wait_for_transition(100);
/// assert!(handle.is_enabled());
/// ```
pub struct Livepatch<H: KernelHost> {
    pub(crate) host: Arc<H>,
    pub(crate) config: LivepatchConfig,
    pub(crate) rcu: Arc<RcuDomain>,
    pub(crate) stacks: FuncStacks,
    shadow: ShadowStore,
    registry: Mutex<Registry>,
    target: AtomicI8,
    phase: AtomicU8,
}

impl<H: KernelHost> Livepatch<H> {
    /// Service with configuration from the environment
    pub fn new(host: Arc<H>) -> Self {
        Self::with_config(host, LivepatchConfig::from_env())
    }

    pub fn with_config(host: Arc<H>, config: LivepatchConfig) -> Self {
        let config = match config.validate() {
            Ok(()) => config,
            Err(e) => {
                kwarn!("{}, using default shadow hash size", e);
                let defaults = LivepatchConfig::new();
                config.shadow_hash_bits(defaults.shadow_hash_bits)
            }
        };
        kdebug!(
            "livepatch service on host '{}' ({}): {:?}",
            host.name(),
            crate::current_arch::NAME,
            config
        );

        let rcu = Arc::new(RcuDomain::new());
        Livepatch {
            stacks: FuncStacks::new(&rcu),
            shadow: ShadowStore::new(&rcu, config.shadow_hash_bits),
            host,
            config,
            rcu,
            registry: Mutex::new(Registry::new()),
            target: AtomicI8::new(TargetState::Undefined as i8),
            phase: AtomicU8::new(TransitionPhase::Idle as u8),
        }
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    pub fn config(&self) -> &LivepatchConfig {
        &self.config
    }

    pub fn rcu(&self) -> &Arc<RcuDomain> {
        &self.rcu
    }

    pub fn stacks(&self) -> &FuncStacks {
        &self.stacks
    }

    /// Shadow variables attached to existing objects
    pub fn shadow(&self) -> &ShadowStore {
        &self.shadow
    }

    /// Target of the running transition
    #[inline]
    pub fn target_state(&self) -> TargetState {
        TargetState::from(self.target.load(Ordering::Acquire))
    }

    #[inline]
    pub fn transition_phase(&self) -> TransitionPhase {
        TransitionPhase::from(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_target(&self, state: TargetState) {
        self.target.store(state as i8, Ordering::Release);
    }

    pub(crate) fn set_phase(&self, phase: TransitionPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Implementation of `old_addr` that `task` must run
    ///
    /// Called from the function-entry hook; never blocks.
    #[inline]
    pub fn dispatch(&self, old_addr: u64, task: &dyn Task) -> Dispatch {
        self.stacks.dispatch(old_addr, task.patch_state())
    }

    /// Names of registered patches in install order, retained ones last
    pub fn patch_names(&self) -> Vec<String> {
        let reg = self.lock();
        reg.patches
            .iter()
            .chain(reg.retained.iter())
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Handle of a registered patch
    pub fn patch(&self, name: &str) -> Option<PatchHandle> {
        let reg = self.lock();
        reg.find(name)
            .map(|i| reg.patches[i].handle())
            .or_else(|| reg.find_retained(name).map(|i| reg.retained[i].handle()))
    }

    /// Inspect a registered patch under the registry lock
    pub fn with_patch<R>(&self, name: &str, f: impl FnOnce(&KlpPatch) -> R) -> Option<R> {
        let reg = self.lock();
        reg.find(name)
            .map(|i| &reg.patches[i])
            .or_else(|| reg.find_retained(name).map(|i| &reg.retained[i]))
            .map(f)
    }

    /// Register `patch` and start its patching transition
    ///
    /// Returns once the transition has started; it may already be complete.
    /// Companion modules of loaded targets are requested afterwards, with
    /// the registry lock dropped.
    pub fn enable_patch(&self, mut patch: KlpPatch) -> KlpResult<PatchHandle> {
        patch.check(&*self.host)?;

        if !self.host.has_reliable_stacktrace() {
            if self.config.require_reliable_stack {
                kerror!("This architecture doesn't have support for the livepatch consistency model.");
                return Err(KlpError::Unsupported);
            }
            kwarn!("This architecture doesn't have support for the livepatch consistency model.");
            kwarn!("The livepatch transition may never complete.");
        }

        let handle = patch.handle();
        let mut reg = self.lock();

        if reg.find(patch.name()).is_some() || reg.find_retained(patch.name()).is_some() {
            return Err(KlpError::DuplicatePatch(patch.name().to_string()));
        }
        if reg.transition.is_some() {
            return Err(KlpError::AlreadyInTransition);
        }
        if !is_patch_compatible(&reg.patches, &patch) {
            kerror!(
                "Livepatch patch ({}) is not compatible with the already installed livepatches.",
                patch.name()
            );
            return Err(KlpError::IncompatiblePatch(patch.name().to_string()));
        }

        if let Err(e) = self.init_patch(&mut reg, &mut patch) {
            self.release_patch(patch);
            return Err(e);
        }

        let id = patch.id();
        reg.patches.push(patch);
        let idx = reg.patches.len() - 1;

        if let Err(e) = self.enable_locked(&mut reg, idx) {
            if let Some(idx) = reg.index_of(id) {
                let patch = reg.patches.remove(idx);
                self.release_patch(patch);
            }
            return Err(e);
        }

        let companions = match reg.index_of(id) {
            Some(idx) if self.config.request_companions => self.missing_companions(&reg.patches[idx]),
            _ => Vec::new(),
        };
        drop(reg);

        for (object, module) in companions {
            if let Err(code) = self.host.request_module(&module) {
                kinfo!("Module load failed: {}", module);
                kdebug!("companion for '{}' returned {}", object, code);
            }
        }
        Ok(handle)
    }

    fn init_patch(&self, reg: &mut Registry, patch: &mut KlpPatch) -> KlpResult<()> {
        patch.set_id(reg.next_id());
        patch.set_enabled(false);

        for obj in patch.objs.iter_mut() {
            obj.init_early(&*self.host)?;
        }

        if patch.is_replace() {
            patch.add_nops(&reg.patches);
        }

        let name = patch.name().to_string();
        for obj in patch.objs.iter_mut() {
            obj.init(&*self.host, false).map_err(|e| {
                kwarn!(
                    "failed to initialize patch '{}' for object '{}' ({})",
                    name,
                    obj.display_name(),
                    e.errno()
                );
                e
            })?;
        }
        Ok(())
    }

    fn enable_locked(&self, reg: &mut Registry, idx: usize) -> KlpResult<()> {
        knotice!("enabling patch '{}'", reg.patches[idx].name());

        self.init_transition(reg, idx, TargetState::Patched);

        // Transition flags must be visible before any entry is pushed.
        std::sync::atomic::fence(Ordering::SeqCst);

        let prev = prev_states(&reg.patches[..idx]);
        let ret = reg.patches[idx].with_objects(&prev, |objs, states| {
            for obj in objs.iter_mut() {
                if !obj.is_loaded() {
                    continue;
                }
                if let Err(e) = callbacks::pre_patch(obj, states) {
                    kwarn!("pre-patch callback failed for object '{}'", obj.display_name());
                    return Err(e);
                }
                if let Err(e) = obj.patch(&self.stacks, &*self.host) {
                    kwarn!("failed to patch object '{}'", obj.display_name());
                    return Err(e);
                }
            }
            Ok(())
        });

        if let Err(e) = ret {
            kwarn!("failed to enable patch '{}'", reg.patches[idx].name());
            self.cancel_transition(reg);
            return Err(e);
        }

        self.start_transition(reg);
        reg.patches[idx].set_enabled(true);
        self.try_complete_locked(reg);
        Ok(())
    }

    /// Allowed, loaded targets without an object, with their companion
    /// module names
    fn missing_companions(&self, patch: &KlpPatch) -> Vec<(String, String)> {
        patch
            .allowed()
            .iter()
            .filter(|name| patch.find_object(Some(name)).is_none())
            .filter(|name| self.host.find_module(name))
            .map(|name| (name.clone(), companion_name(patch.name(), name)))
            .collect()
    }

    /// Attach a module object delivered by a companion module to its
    /// already enabled patch and apply it
    pub fn add_object(&self, mut obj: KlpObject) -> KlpResult<()> {
        obj.check(&*self.host, true)?;
        let Some(name) = obj.name().map(str::to_string) else {
            return Err(KlpError::InvalidRequest("module object without a name"));
        };

        let mut reg = self.lock();
        let ret = self.add_object_locked(&mut reg, &mut obj, &name);
        if let Err(e) = &ret {
            kwarn!(
                "patch '{}' failed for module '{}', refusing to load module '{}'",
                obj.patch_name(),
                name,
                name
            );
            kdebug!("add_object: {}", e);
        }
        ret
    }

    fn add_object_locked(&self, reg: &mut Registry, obj: &mut KlpObject, name: &str) -> KlpResult<()> {
        let Some(idx) = reg.find(obj.patch_name()) else {
            kerror!(
                "Can't load livepatch ({}) for module when the livepatch ({}) for vmcore is not loaded",
                obj.carrier_name(),
                obj.patch_name()
            );
            return Err(KlpError::PatchNotFound(obj.patch_name().to_string()));
        };

        if !reg.patches[idx].allows(name) {
            kerror!(
                "Livepatch ({}) is not supposed to livepatch the module: {}",
                obj.patch_name(),
                name
            );
            return Err(KlpError::ObjectNotAllowed(name.to_string()));
        }
        if !self.host.find_module(name) {
            kerror!("Livepatched module is not loaded: {}", name);
            return Err(KlpError::TargetModuleNotLoaded(name.to_string()));
        }
        if reg.patches[idx].find_object(Some(name)).is_some() {
            return Err(KlpError::DuplicateObject(name.to_string()));
        }

        obj.init_early(&*self.host)?;
        let in_transition = reg.transition == Some(reg.patches[idx].id());
        if let Err(e) = obj.init(&*self.host, in_transition) {
            kwarn!(
                "failed to initialize patch '{}' for module '{}' ({})",
                obj.patch_name(),
                name,
                e.errno()
            );
            obj.release(&*self.host);
            return Err(e);
        }

        knotice!("applying patch '{}' to loading module '{}'", obj.patch_name(), name);

        let placeholder = KlpObject::module(obj.patch_name(), name, Vec::new());
        reg.patches[idx].objs.push(std::mem::replace(obj, placeholder));
        let j = reg.patches[idx].objs.len() - 1;

        let prev = prev_states(&reg.patches[..idx]);
        let ret = reg.patches[idx].with_objects(&prev, |objs, states| {
            let obj = &mut objs[j];
            if let Err(e) = callbacks::pre_patch(obj, states) {
                kwarn!("pre-patch callback failed for object '{}'", name);
                return Err(e);
            }
            if let Err(e) = obj.patch(&self.stacks, &*self.host) {
                kwarn!("failed to apply patch '{}' to module '{}' ({})", obj.patch_name(), name, e.errno());
                callbacks::post_unpatch(obj, states);
                return Err(e);
            }
            if !in_transition {
                callbacks::post_patch(obj, states);
            }
            Ok(())
        });

        if ret.is_err() {
            let mut failed = reg.patches[idx].objs.remove(j);
            failed.free_loaded();
            failed.release(&*self.host);
            *obj = failed;
        }
        ret
    }

    /// Drop every reference a patch that never finished enabling holds
    fn release_patch(&self, mut patch: KlpPatch) {
        for obj in patch.objs.iter_mut() {
            obj.free_loaded();
            obj.release(&*self.host);
        }
        patch.set_enabled(false);
        patch.set_lifecycle(PatchLifecycle::Freed);
    }

    /// Release a patch removed from the active list, or keep it forever if
    /// a forced transition may have left tasks in its code
    pub(crate) fn free_patch(&self, reg: &mut Registry, mut patch: KlpPatch) {
        patch.set_enabled(false);
        if patch.is_forced() {
            kdebug!("'{}': forced, keeping it", patch.name());
            patch.set_lifecycle(PatchLifecycle::Disabled);
            reg.retained.push(patch);
            return;
        }
        for obj in patch.objs.iter_mut() {
            obj.release(&*self.host);
        }
        kdebug!("'{}': freed", patch.name());
        patch.set_lifecycle(PatchLifecycle::Freed);
    }
}
