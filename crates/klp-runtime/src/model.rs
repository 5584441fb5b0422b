//! Patch, object and function descriptions
//!
//! A [`KlpPatch`] owns its base-image object plus any number of module
//! objects. Each [`KlpObject`] is delivered by a carrier module: the patch
//! module itself for the base image, `<patch>__<object>` for a module.
//!
//! Functions get their addresses resolved when the target object is
//! loaded; the resolved form is a [`FuncRedirect`] shared with the
//! redirection stacks.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use klp_core::constants::{COMPANION_SEP, KSYM_NAME_LEN, MODULE_NAME_LEN, VMLINUX};
use klp_core::error::{KlpError, KlpResult, SymbolError, ValidationError};
use klp_core::id::PatchId;
use klp_core::reloc::RelocationInfo;
use klp_core::state::PatchLifecycle;
use klp_core::traits::{AddrRange, KernelHost, ModuleHost, TraceHost};
use klp_core::{kerror, kwarn};

use crate::callbacks::{ObjectCallbacks, PatchStates};
use crate::func_stack::{FuncRedirect, FuncStacks};
use crate::states::SystemState;
use crate::symbols::{find_object_symbol, write_object_relocations};

/// A function to redirect
#[derive(Debug, Clone)]
pub struct KlpFunc {
    old_name: String,
    new_func: u64,
    old_sympos: u64,
    nop: bool,
    redirect: Option<Arc<FuncRedirect>>,
}

impl KlpFunc {
    /// Redirect `old_name` to the replacement at `new_func`
    pub fn new(old_name: impl Into<String>, new_func: u64) -> Self {
        KlpFunc {
            old_name: old_name.into(),
            new_func,
            old_sympos: 0,
            nop: false,
            redirect: None,
        }
    }

    /// Pick the `pos`-th occurrence of a non-unique name (1-based)
    pub fn sympos(mut self, pos: u64) -> Self {
        self.old_sympos = pos;
        self
    }

    /// Restores the original code of `func` on behalf of a replace patch
    pub(crate) fn nop_for(func: &KlpFunc) -> Self {
        KlpFunc {
            old_name: func.old_name.clone(),
            new_func: 0,
            old_sympos: func.old_sympos,
            nop: true,
            redirect: None,
        }
    }

    pub fn old_name(&self) -> &str {
        &self.old_name
    }

    pub fn old_sympos(&self) -> u64 {
        self.old_sympos
    }

    pub fn is_nop(&self) -> bool {
        self.nop
    }

    /// `<name>,<pos>` with position 0 shown as 1
    pub fn display_name(&self) -> String {
        format!("{},{}", self.old_name, self.old_sympos.max(1))
    }

    pub fn old_addr(&self) -> Option<u64> {
        self.redirect.as_ref().map(|r| r.old_addr())
    }

    /// Replacement address; the old address for a nop
    pub fn new_addr(&self) -> Option<u64> {
        self.redirect.as_ref().map(|r| r.new_addr())
    }

    pub fn redirect(&self) -> Option<&Arc<FuncRedirect>> {
        self.redirect.as_ref()
    }

    pub fn is_patched(&self) -> bool {
        self.redirect.as_ref().is_some_and(|r| r.is_patched())
    }

    pub fn in_transition(&self) -> bool {
        self.redirect.as_ref().is_some_and(|r| r.in_transition())
    }

    pub(crate) fn set_transition(&self, on: bool) {
        if let Some(r) = &self.redirect {
            r.set_transition(on);
        }
    }

    fn check(&self) -> Result<(), ValidationError> {
        if self.old_name.is_empty() {
            return Err(ValidationError::MissingFuncName);
        }
        // Nops get their address once the object is loaded.
        if self.new_func == 0 && !self.nop {
            return Err(ValidationError::MissingNewFunc(self.old_name.clone()));
        }
        if self.old_name.len() >= KSYM_NAME_LEN {
            return Err(ValidationError::FuncNameTooLong);
        }
        Ok(())
    }

    /// Same target function; positions 0 and 1 both mean the first one
    pub(crate) fn same_target(&self, other: &KlpFunc) -> bool {
        self.old_name == other.old_name && self.old_sympos.max(1) == other.old_sympos.max(1)
    }
}

/// The part of a patch that applies to one object
pub struct KlpObject {
    name: Option<String>,
    patch_name: String,
    carrier: String,
    funcs: Vec<KlpFunc>,
    relocs: RelocationInfo,
    callbacks: Option<Arc<dyn ObjectCallbacks>>,
    dynamic: bool,
    patched: bool,
    forced: bool,
    loaded: bool,
    holds_carrier: bool,
    pub(crate) post_unpatch_enabled: bool,
}

impl KlpObject {
    fn with(patch_name: &str, name: Option<String>, carrier: String, funcs: Vec<KlpFunc>) -> Self {
        KlpObject {
            name,
            patch_name: patch_name.to_string(),
            carrier,
            funcs,
            relocs: RelocationInfo::new(),
            callbacks: None,
            dynamic: false,
            patched: false,
            forced: false,
            loaded: false,
            holds_carrier: false,
            post_unpatch_enabled: false,
        }
    }

    /// Base-image object delivered by the patch module `patch_name`
    pub fn vmlinux(patch_name: &str, funcs: Vec<KlpFunc>) -> Self {
        Self::with(patch_name, None, patch_name.to_string(), funcs)
    }

    /// Object for module `name`, delivered by `<patch_name>__<name>`
    pub fn module(patch_name: &str, name: &str, funcs: Vec<KlpFunc>) -> Self {
        let carrier = companion_name(patch_name, name);
        Self::with(patch_name, Some(name.to_string()), carrier, funcs)
    }

    /// Nops-only object created by a replace patch
    pub(crate) fn dynamic(patch_name: &str, name: Option<String>) -> Self {
        let mut obj = Self::with(patch_name, name, String::new(), Vec::new());
        obj.dynamic = true;
        obj
    }

    /// Override the carrier module name
    pub fn carrier(mut self, module: &str) -> Self {
        self.carrier = module.to_string();
        self
    }

    pub fn callbacks(mut self, callbacks: Arc<dyn ObjectCallbacks>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// Livepatch relocations shipped by the carrier
    pub fn relocations(mut self, relocs: RelocationInfo) -> Self {
        self.relocs = relocs;
        self
    }

    /// Target module, `None` for the base image
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(VMLINUX)
    }

    pub fn patch_name(&self) -> &str {
        &self.patch_name
    }

    pub fn carrier_name(&self) -> &str {
        &self.carrier
    }

    pub fn funcs(&self) -> &[KlpFunc] {
        &self.funcs
    }

    pub fn relocation_info(&self) -> &RelocationInfo {
        &self.relocs
    }

    pub(crate) fn callbacks_ref(&self) -> Option<&Arc<dyn ObjectCallbacks>> {
        self.callbacks.as_ref()
    }

    pub fn is_module(&self) -> bool {
        self.name.is_some()
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn is_patched(&self) -> bool {
        self.patched
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }

    /// Addresses resolved against a loaded target
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub(crate) fn mark_forced(&mut self) {
        self.forced = true;
    }

    pub(crate) fn func_named(&self, func: &KlpFunc) -> Option<&KlpFunc> {
        self.funcs.iter().find(|f| f.same_target(func))
    }

    pub(crate) fn push_func(&mut self, func: KlpFunc) {
        self.funcs.push(func);
    }

    pub(crate) fn set_transition(&self, on: bool) {
        for func in &self.funcs {
            func.set_transition(on);
        }
    }

    /// Structural checks before anything is registered
    pub(crate) fn check<H>(&self, host: &H, is_module: bool) -> Result<(), ValidationError>
    where
        H: ModuleHost + ?Sized,
    {
        if !host.is_livepatch_module(&self.carrier) {
            kerror!("module {} is not marked as a livepatch module", self.carrier);
            return Err(ValidationError::NotLivepatchModule(self.carrier.clone()));
        }
        if self.patch_name.is_empty() {
            kerror!("module {} does not have set obj->patch_name", self.carrier);
            return Err(ValidationError::MissingPatchName);
        }
        if self.patch_name.len() >= MODULE_NAME_LEN {
            kerror!("module {} has too long obj->patch_name", self.carrier);
            return Err(ValidationError::PatchNameTooLong);
        }

        let expected = match (is_module, &self.name) {
            (true, None) => {
                kerror!("module {} does not have set obj->name", self.carrier);
                return Err(ValidationError::MissingObjectName);
            }
            (true, Some(name)) if name.len() >= MODULE_NAME_LEN => {
                kerror!("module {} has too long obj->name", self.carrier);
                return Err(ValidationError::ObjectNameTooLong);
            }
            (true, Some(name)) => companion_name(&self.patch_name, name),
            (false, Some(_)) => {
                kerror!("module {} for vmlinux must not have set obj->name", self.carrier);
                return Err(ValidationError::NamedBaseObject);
            }
            (false, None) => self.patch_name.clone(),
        };

        if self.funcs.is_empty() {
            kerror!("module {} does not have set obj->funcs", self.carrier);
            return Err(ValidationError::NoFunctions);
        }
        if expected != self.carrier {
            kerror!(
                "module name {} does not match, expected {}",
                self.carrier,
                expected
            );
            return Err(ValidationError::CarrierMismatch {
                expected,
                found: self.carrier.clone(),
            });
        }
        Ok(())
    }

    /// Pin the carrier module for the lifetime of the object
    pub(crate) fn init_early<H>(&mut self, host: &H) -> KlpResult<()>
    where
        H: ModuleHost + ?Sized,
    {
        if self.dynamic || self.holds_carrier {
            return Ok(());
        }
        if !host.try_module_get(&self.carrier) {
            return Err(KlpError::TargetModuleNotLoaded(self.carrier.clone()));
        }
        self.holds_carrier = true;
        Ok(())
    }

    /// Check the function descriptions and resolve them if the target is
    /// already loaded
    pub(crate) fn init<H>(&mut self, host: &H, in_transition: bool) -> KlpResult<()>
    where
        H: KernelHost + ?Sized,
    {
        self.patched = false;
        self.loaded = false;
        for func in &self.funcs {
            func.check()?;
        }
        if self.target_loaded(host) {
            self.init_loaded(host, in_transition)?;
        }
        Ok(())
    }

    pub(crate) fn target_loaded<H>(&self, host: &H) -> bool
    where
        H: ModuleHost + ?Sized,
    {
        self.name.as_deref().map_or(true, |name| host.find_module(name))
    }

    /// Write relocations and resolve every function against the loaded
    /// target
    pub(crate) fn init_loaded<H>(&mut self, host: &H, in_transition: bool) -> KlpResult<()>
    where
        H: KernelHost + ?Sized,
    {
        let ret = self.resolve(host, in_transition);
        if ret.is_err() {
            self.free_loaded();
        }
        ret
    }

    fn resolve<H>(&mut self, host: &H, in_transition: bool) -> KlpResult<()>
    where
        H: KernelHost + ?Sized,
    {
        let objname = self.name.as_deref();

        if !self.dynamic && !self.relocs.is_empty() {
            host.set_module_text_ro(&self.carrier, false);
            let ret = write_object_relocations(host, objname, &self.carrier, &mut self.relocs);
            if ret.is_ok() {
                host.arch_init_object_loaded(&self.carrier);
            }
            host.set_module_text_ro(&self.carrier, true);
            ret?;
        }

        for func in &mut self.funcs {
            let old_addr = find_object_symbol(host, objname, &func.old_name, func.old_sympos)?;
            let old_size = host.symbol_size(old_addr).ok_or_else(|| {
                kerror!("kallsyms size lookup failed for '{}'", func.old_name);
                SymbolError::SizeLookup { name: func.old_name.clone() }
            })?;

            let (new_addr, new_size) = if func.nop {
                (old_addr, old_size)
            } else {
                let size = host.symbol_size(func.new_func).ok_or_else(|| {
                    kerror!("kallsyms size lookup failed for '{}' replacement", func.old_name);
                    SymbolError::SizeLookup { name: func.old_name.clone() }
                })?;
                (func.new_func, size)
            };

            let redirect = FuncRedirect::new(
                func.old_name.clone(),
                AddrRange::new(old_addr, old_size),
                AddrRange::new(new_addr, new_size),
                func.nop,
            );
            redirect.set_transition(in_transition);
            func.redirect = Some(Arc::new(redirect));
        }

        self.loaded = true;
        Ok(())
    }

    /// Forget resolved addresses once the target goes away
    pub(crate) fn free_loaded(&mut self) {
        for func in &mut self.funcs {
            func.redirect = None;
        }
        self.loaded = false;
    }

    /// Push every function on its redirection stack
    pub(crate) fn patch<T>(&mut self, stacks: &FuncStacks, trace: &T) -> KlpResult<()>
    where
        T: TraceHost + ?Sized,
    {
        if self.patched {
            kwarn!("object '{}' is already patched", self.display_name());
            return Err(KlpError::InvalidRequest("object already patched"));
        }
        for i in 0..self.funcs.len() {
            let Some(redirect) = self.funcs[i].redirect.clone() else {
                continue;
            };
            if let Err(e) = stacks.patch_func(trace, &redirect) {
                self.unpatch(stacks, trace, false);
                return Err(e);
            }
        }
        self.patched = true;
        Ok(())
    }

    /// Pop functions off their stacks, only the nops if `nops_only`
    pub(crate) fn unpatch<T>(&mut self, stacks: &FuncStacks, trace: &T, nops_only: bool)
    where
        T: TraceHost + ?Sized,
    {
        for func in &self.funcs {
            if nops_only && !func.nop {
                continue;
            }
            if let Some(redirect) = &func.redirect {
                stacks.unpatch_func(trace, redirect);
            }
        }
        if self.dynamic || !nops_only {
            self.patched = false;
        }
    }

    /// Leave the functions on their stacks but never dispatch to them again
    pub(crate) fn retire(&mut self) {
        for func in &self.funcs {
            if let Some(r) = &func.redirect {
                r.retire();
                r.set_transition(false);
            }
        }
        self.patched = false;
    }

    /// Drop the nop functions; true if nothing is left
    pub(crate) fn discard_nops(&mut self) -> bool {
        self.funcs.retain(|f| !f.nop);
        self.dynamic || self.funcs.is_empty()
    }

    /// Give back the carrier reference unless the object was forced
    pub(crate) fn release<H>(&mut self, host: &H)
    where
        H: ModuleHost + ?Sized,
    {
        if self.holds_carrier && !self.forced {
            host.module_put(&self.carrier);
        }
        self.holds_carrier = false;
    }
}

impl std::fmt::Debug for KlpObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KlpObject")
            .field("name", &self.display_name())
            .field("carrier", &self.carrier)
            .field("funcs", &self.funcs)
            .field("dynamic", &self.dynamic)
            .field("patched", &self.patched)
            .field("loaded", &self.loaded)
            .field("forced", &self.forced)
            .finish()
    }
}

/// `<patch>__<object>`
pub fn companion_name(patch_name: &str, object: &str) -> String {
    format!("{}{}{}", patch_name, COMPANION_SEP, object)
}

/// Externally visible status of a patch
#[derive(Debug)]
pub(crate) struct PatchStatus {
    name: String,
    id: AtomicU64,
    enabled: AtomicBool,
    transition: AtomicBool,
    forced: AtomicBool,
    lifecycle: AtomicU8,
}

/// Read-only view of a registered patch
///
/// Stays valid after the patch is freed and then reports
/// [`PatchLifecycle::Freed`].
#[derive(Debug, Clone)]
pub struct PatchHandle(Arc<PatchStatus>);

impl PatchHandle {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn id(&self) -> PatchId {
        PatchId::new(self.0.id.load(Ordering::Acquire))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.enabled.load(Ordering::Acquire)
    }

    pub fn in_transition(&self) -> bool {
        self.0.transition.load(Ordering::Acquire)
    }

    pub fn is_forced(&self) -> bool {
        self.0.forced.load(Ordering::Acquire)
    }

    pub fn lifecycle(&self) -> PatchLifecycle {
        PatchLifecycle::from(self.0.lifecycle.load(Ordering::Acquire))
    }
}

/// A live patch: a base-image object plus module objects
pub struct KlpPatch {
    name: String,
    pub(crate) objs: Vec<KlpObject>,
    obj_names: Vec<String>,
    replace: bool,
    pub(crate) states: Vec<SystemState>,
    id: PatchId,
    enabled: bool,
    forced: bool,
    status: Arc<PatchStatus>,
}

impl KlpPatch {
    /// A patch named after its base object's patch name
    pub fn new(base: KlpObject) -> Self {
        let name = base.patch_name.clone();
        let status = Arc::new(PatchStatus {
            name: name.clone(),
            id: AtomicU64::new(0),
            enabled: AtomicBool::new(false),
            transition: AtomicBool::new(false),
            forced: AtomicBool::new(false),
            lifecycle: AtomicU8::new(PatchLifecycle::Registering as u8),
        });
        KlpPatch {
            name,
            objs: vec![base],
            obj_names: Vec::new(),
            replace: false,
            states: Vec::new(),
            id: PatchId::new(0),
            enabled: false,
            forced: false,
            status,
        }
    }

    /// Modules this patch may touch
    pub fn allow<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.obj_names.extend(names.into_iter().map(Into::into));
        self
    }

    /// Atomically replace every installed patch
    pub fn replace(mut self, replace: bool) -> Self {
        self.replace = replace;
        self
    }

    pub fn state(mut self, state: SystemState) -> Self {
        self.states.push(state);
        self
    }

    /// Module object shipped together with the patch
    pub fn object(mut self, obj: KlpObject) -> Self {
        self.objs.push(obj);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> PatchId {
        self.id
    }

    pub fn is_replace(&self) -> bool {
        self.replace
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }

    pub fn states(&self) -> &[SystemState] {
        &self.states
    }

    pub fn objects(&self) -> &[KlpObject] {
        &self.objs
    }

    pub fn allowed(&self) -> &[String] {
        &self.obj_names
    }

    pub fn allows(&self, object: &str) -> bool {
        self.obj_names.iter().any(|n| n == object)
    }

    /// Index of the non-dynamic object for `name` (`None` = base image)
    pub(crate) fn find_object(&self, name: Option<&str>) -> Option<usize> {
        self.objs.iter().position(|o| !o.dynamic && o.name.as_deref() == name)
    }

    pub(crate) fn find_dynamic_object(&self, name: Option<&str>) -> Option<usize> {
        self.objs.iter().position(|o| o.dynamic && o.name.as_deref() == name)
    }

    pub fn handle(&self) -> PatchHandle {
        PatchHandle(Arc::clone(&self.status))
    }

    /// Run `f` over the objects with the states its callbacks may query
    pub(crate) fn with_objects<R, F>(&mut self, prev: &[SystemState], f: F) -> R
    where
        F: FnOnce(&mut Vec<KlpObject>, &PatchStates<'_>) -> R,
    {
        let states = PatchStates {
            patch: &self.name,
            states: &self.states,
            prev,
        };
        f(&mut self.objs, &states)
    }

    pub(crate) fn set_id(&mut self, id: PatchId) {
        self.id = id;
        self.status.id.store(id.ts(), Ordering::Release);
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.status.enabled.store(enabled, Ordering::Release);
    }

    pub(crate) fn set_transition(&self, on: bool) {
        for obj in &self.objs {
            obj.set_transition(on);
        }
        self.status.transition.store(on, Ordering::Release);
    }

    pub(crate) fn mark_forced(&mut self) {
        self.forced = true;
        for obj in &mut self.objs {
            obj.mark_forced();
        }
        self.status.forced.store(true, Ordering::Release);
    }

    pub(crate) fn set_lifecycle(&self, lifecycle: PatchLifecycle) {
        self.status.lifecycle.store(lifecycle as u8, Ordering::Release);
    }

    /// Check every object; module objects must be on the allow-list and
    /// unique
    pub(crate) fn check<H>(&self, host: &H) -> KlpResult<()>
    where
        H: ModuleHost + ?Sized,
    {
        if self.obj_names.is_empty() {
            kerror!("patch '{}' does not list any object", self.name);
            return Err(ValidationError::EmptyAllowList.into());
        }
        for (i, obj) in self.objs.iter().enumerate() {
            obj.check(host, i > 0)?;
            if obj.patch_name != self.name {
                return Err(ValidationError::CarrierMismatch {
                    expected: self.name.clone(),
                    found: obj.patch_name.clone(),
                }
                .into());
            }
            if let Some(name) = obj.name() {
                if !self.allows(name) {
                    kerror!(
                        "Livepatch ({}) is not supposed to livepatch the module: {}",
                        self.name,
                        name
                    );
                    return Err(KlpError::ObjectNotAllowed(name.to_string()));
                }
                if self.objs[..i].iter().any(|o| o.name() == Some(name)) {
                    return Err(KlpError::DuplicateObject(name.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Add nops for every function of `installed` that this patch does not
    /// replace itself
    pub(crate) fn add_nops(&mut self, installed: &[KlpPatch]) {
        for old in installed {
            for old_obj in &old.objs {
                let name = old_obj.name.clone();
                let idx = match self
                    .find_object(name.as_deref())
                    .or_else(|| self.find_dynamic_object(name.as_deref()))
                {
                    Some(idx) => idx,
                    None => {
                        self.objs.push(KlpObject::dynamic(&self.name, name));
                        self.objs.len() - 1
                    }
                };
                for old_func in &old_obj.funcs {
                    if self.objs.iter().any(|o| {
                        o.name.as_deref() == old_obj.name.as_deref()
                            && o.func_named(old_func).is_some()
                    }) {
                        continue;
                    }
                    self.objs[idx].push_func(KlpFunc::nop_for(old_func));
                }
            }
        }
    }
}

impl std::fmt::Debug for KlpPatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KlpPatch")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("enabled", &self.enabled)
            .field("replace", &self.replace)
            .field("forced", &self.forced)
            .field("objs", &self.objs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Modules {
        livepatch: Vec<&'static str>,
        refs: Mutex<Vec<String>>,
    }

    impl ModuleHost for Modules {
        fn find_module(&self, name: &str) -> bool {
            self.livepatch.contains(&name)
        }
        fn is_livepatch_module(&self, name: &str) -> bool {
            self.livepatch.contains(&name)
        }
        fn try_module_get(&self, name: &str) -> bool {
            self.refs.lock().unwrap().push(name.to_string());
            true
        }
        fn module_put(&self, name: &str) {
            let mut refs = self.refs.lock().unwrap();
            if let Some(i) = refs.iter().position(|r| r == name) {
                refs.remove(i);
            }
        }
        fn request_module(&self, _name: &str) -> Result<(), i32> {
            Err(-libc::ENOENT)
        }
    }

    fn modules() -> Modules {
        Modules {
            livepatch: vec!["p", "p__mod"],
            ..Default::default()
        }
    }

    #[test]
    fn test_func_checks() {
        assert_eq!(KlpFunc::new("", 1).check(), Err(ValidationError::MissingFuncName));
        assert_eq!(
            KlpFunc::new("foo", 0).check(),
            Err(ValidationError::MissingNewFunc("foo".into()))
        );
        assert_eq!(
            KlpFunc::new("x".repeat(KSYM_NAME_LEN), 1).check(),
            Err(ValidationError::FuncNameTooLong)
        );
        assert!(KlpFunc::nop_for(&KlpFunc::new("foo", 1)).check().is_ok());
    }

    #[test]
    fn test_same_target_treats_pos_zero_as_one() {
        let a = KlpFunc::new("foo", 1);
        assert!(a.same_target(&KlpFunc::new("foo", 2).sympos(1)));
        assert!(!a.same_target(&KlpFunc::new("foo", 2).sympos(2)));
        assert!(!a.same_target(&KlpFunc::new("bar", 2)));
        assert_eq!(a.display_name(), "foo,1");
    }

    #[test]
    fn test_object_checks() {
        let host = modules();
        let f = || vec![KlpFunc::new("foo", 0x10)];

        assert!(KlpObject::vmlinux("p", f()).check(&host, false).is_ok());
        assert!(KlpObject::module("p", "mod", f()).check(&host, true).is_ok());
        assert_eq!(
            KlpObject::vmlinux("p", vec![]).check(&host, false),
            Err(ValidationError::NoFunctions)
        );
        assert_eq!(
            KlpObject::vmlinux("p", f()).carrier("p__mod").check(&host, false),
            Err(ValidationError::CarrierMismatch {
                expected: "p".into(),
                found: "p__mod".into()
            })
        );
        assert_eq!(
            KlpObject::vmlinux("q", f()).check(&host, false),
            Err(ValidationError::NotLivepatchModule("q".into()))
        );
        assert_eq!(
            KlpObject::module("p", "mod", f()).carrier("p").check(&host, false),
            Err(ValidationError::NamedBaseObject)
        );
    }

    #[test]
    fn test_patch_checks() {
        let host = modules();
        let base = || KlpObject::vmlinux("p", vec![KlpFunc::new("foo", 0x10)]);
        let modobj = || KlpObject::module("p", "mod", vec![KlpFunc::new("bar", 0x20)]);

        assert_eq!(
            KlpPatch::new(base()).check(&host),
            Err(KlpError::Validation(ValidationError::EmptyAllowList))
        );
        assert!(KlpPatch::new(base()).allow(["mod"]).object(modobj()).check(&host).is_ok());
        assert_eq!(
            KlpPatch::new(base()).allow(["other"]).object(modobj()).check(&host),
            Err(KlpError::ObjectNotAllowed("mod".into()))
        );
        assert_eq!(
            KlpPatch::new(base())
                .allow(["mod"])
                .object(modobj())
                .object(modobj())
                .check(&host),
            Err(KlpError::DuplicateObject("mod".into()))
        );
    }

    #[test]
    fn test_carrier_reference_released_unless_forced() {
        let host = modules();
        let mut obj = KlpObject::vmlinux("p", vec![KlpFunc::new("foo", 0x10)]);
        obj.init_early(&host).unwrap();
        obj.init_early(&host).unwrap();
        assert_eq!(host.refs.lock().unwrap().len(), 1);
        obj.release(&host);
        assert!(host.refs.lock().unwrap().is_empty());

        let mut forced = KlpObject::vmlinux("p", vec![KlpFunc::new("foo", 0x10)]);
        forced.init_early(&host).unwrap();
        forced.mark_forced();
        forced.release(&host);
        assert_eq!(host.refs.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_add_nops_skips_replaced_functions() {
        let old = KlpPatch::new(KlpObject::vmlinux(
            "old",
            vec![KlpFunc::new("foo", 0x10), KlpFunc::new("bar", 0x20)],
        ))
        .allow(["mod"])
        .object(KlpObject::module("old", "mod", vec![KlpFunc::new("baz", 0x30)]));

        let mut new = KlpPatch::new(KlpObject::vmlinux("new", vec![KlpFunc::new("foo", 0x40)]))
            .allow(["mod"])
            .replace(true);
        new.add_nops(std::slice::from_ref(&old));

        let base = &new.objects()[0];
        assert_eq!(base.funcs().len(), 2);
        assert!(base.funcs()[1].is_nop());
        assert_eq!(base.funcs()[1].old_name(), "bar");

        let dynamic = &new.objects()[1];
        assert!(dynamic.is_dynamic());
        assert_eq!(dynamic.name(), Some("mod"));
        assert_eq!(dynamic.funcs()[0].old_name(), "baz");
        assert!(dynamic.funcs()[0].is_nop());

        assert!(new.find_object(Some("mod")).is_none());
        assert_eq!(new.find_dynamic_object(Some("mod")), Some(1));
    }

    #[test]
    fn test_handle_tracks_status() {
        let mut patch = KlpPatch::new(KlpObject::vmlinux("p", vec![KlpFunc::new("foo", 0x10)]));
        let handle = patch.handle();
        assert_eq!(handle.name(), "p");
        assert_eq!(handle.lifecycle(), PatchLifecycle::Registering);
        patch.set_id(PatchId::new(3));
        patch.set_enabled(true);
        patch.set_lifecycle(PatchLifecycle::Enabled);
        assert_eq!(handle.id(), PatchId::new(3));
        assert!(handle.is_enabled());
        assert_eq!(handle.lifecycle(), PatchLifecycle::Enabled);
    }
}
