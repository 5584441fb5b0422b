//! In-memory kernel host
//!
//! A deterministic stand-in for the running kernel: a symbol table, a
//! module list with reference counts, a set of hooked function entries and
//! tasks whose stack traces are scripted by the caller. Used by the tests
//! and by `cmd/demo`.
//!
//! Module symbols are only visible while their module is loaded, as with
//! kallsyms.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use klp_core::id::TaskId;
use klp_core::reloc::{KlpSymbol, RelocationSection};
use klp_core::state::TaskRunState;
use klp_core::task::TaskPatchState;
use klp_core::traits::{
    KernelHost, ModuleHost, RelocationApplier, StackInspector, SymbolTable, Task, TaskHost,
    TraceHost,
};
use klp_core::{kdebug, ktrace};

use crate::arch::ftrace_location;
use crate::current_arch;

type ModuleLoader = dyn Fn(&str) -> Result<(), i32> + Send + Sync;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct SimSymbol {
    module: Option<String>,
    name: String,
    addr: u64,
    size: u64,
}

#[derive(Debug, Default)]
struct SimModule {
    loaded: bool,
    livepatch: bool,
    refs: usize,
}

/// A task with a scripted stack
#[derive(Debug)]
pub struct SimTask {
    id: TaskId,
    patch: TaskPatchState,
    run: Mutex<TaskRunState>,
    /// `None` when the unwinder gives up on this task
    stack: Mutex<Option<Vec<u64>>>,
}

impl SimTask {
    fn new(id: TaskId) -> Self {
        SimTask {
            id,
            patch: TaskPatchState::new(),
            run: Mutex::new(TaskRunState::Sleeping),
            stack: Mutex::new(Some(Vec::new())),
        }
    }

    fn trace(&self) -> Option<Vec<u64>> {
        lock(&self.stack).clone()
    }
}

impl Task for SimTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn patch_state(&self) -> &TaskPatchState {
        &self.patch
    }

    fn run_state(&self) -> TaskRunState {
        *lock(&self.run)
    }
}

/// Simulated kernel
pub struct SimHost {
    symbols: Mutex<Vec<SimSymbol>>,
    modules: Mutex<HashMap<String, SimModule>>,
    hooks: Mutex<HashSet<u64>>,
    tasks: Mutex<Vec<Arc<SimTask>>>,
    idle: Mutex<Vec<Arc<SimTask>>>,
    next_task: AtomicU64,
    next_cpu: AtomicU32,
    reliable: AtomicBool,
    notified: Mutex<Vec<TaskId>>,
    requested: Mutex<Vec<String>>,
    relocations: Mutex<Vec<(String, String)>>,
    loader: Mutex<Option<Arc<ModuleLoader>>>,
}

impl SimHost {
    pub fn new() -> Self {
        SimHost {
            symbols: Mutex::new(Vec::new()),
            modules: Mutex::new(HashMap::new()),
            hooks: Mutex::new(HashSet::new()),
            tasks: Mutex::new(Vec::new()),
            idle: Mutex::new(Vec::new()),
            next_task: AtomicU64::new(1),
            next_cpu: AtomicU32::new(0),
            reliable: AtomicBool::new(current_arch::RELIABLE_STACKTRACE),
            notified: Mutex::new(Vec::new()),
            requested: Mutex::new(Vec::new()),
            relocations: Mutex::new(Vec::new()),
            loader: Mutex::new(None),
        }
    }

    // Symbols

    /// Add a symbol of `module` (`None` for the base image)
    pub fn add_symbol(&self, module: Option<&str>, name: &str, addr: u64, size: u64) {
        lock(&self.symbols).push(SimSymbol {
            module: module.map(str::to_string),
            name: name.to_string(),
            addr,
            size,
        });
    }

    pub fn add_module_symbol(&self, module: &str, name: &str, addr: u64, size: u64) {
        self.add_symbol(Some(module), name, addr, size);
    }

    // Modules

    /// Mark `name` loaded; keeps the reference count of a known module
    pub fn load_module(&self, name: &str, livepatch: bool) {
        let mut modules = lock(&self.modules);
        let m = modules.entry(name.to_string()).or_default();
        m.loaded = true;
        m.livepatch = livepatch;
        kdebug!("sim: module '{}' loaded", name);
    }

    pub fn unload_module(&self, name: &str) {
        if let Some(m) = lock(&self.modules).get_mut(name) {
            m.loaded = false;
            kdebug!("sim: module '{}' unloaded", name);
        }
    }

    pub fn module_refcount(&self, name: &str) -> usize {
        lock(&self.modules).get(name).map_or(0, |m| m.refs)
    }

    /// Install the handler run by [`request_module`](ModuleHost::request_module)
    pub fn set_module_loader<F>(&self, loader: F)
    where
        F: Fn(&str) -> Result<(), i32> + Send + Sync + 'static,
    {
        *lock(&self.loader) = Some(Arc::new(loader));
    }

    /// Every module requested so far, in order
    pub fn requested(&self) -> Vec<String> {
        lock(&self.requested).clone()
    }

    /// `(carrier, section)` of every applied relocation section
    pub fn relocations(&self) -> Vec<(String, String)> {
        lock(&self.relocations).clone()
    }

    // Hooks

    /// Whether the entry hook of the function starting at `addr` is set
    pub fn is_hooked(&self, addr: u64) -> bool {
        lock(&self.hooks).contains(&ftrace_location(addr))
    }

    // Tasks

    pub fn spawn_task(&self) -> Arc<SimTask> {
        let id = TaskId::new(self.next_task.fetch_add(1, Ordering::Relaxed));
        let task = Arc::new(SimTask::new(id));
        lock(&self.tasks).push(Arc::clone(&task));
        task
    }

    /// Add `n` per-CPU idle tasks
    pub fn add_idle_tasks(&self, n: u32) {
        let mut idle = lock(&self.idle);
        for _ in 0..n {
            let cpu = self.next_cpu.fetch_add(1, Ordering::Relaxed);
            idle.push(Arc::new(SimTask::new(TaskId::idle(cpu))));
        }
    }

    /// Remove a task from the task list
    pub fn reap_task(&self, task: &Arc<SimTask>) {
        *lock(&task.run) = TaskRunState::Dead;
        lock(&self.tasks).retain(|t| !Arc::ptr_eq(t, task));
    }

    /// Script the return addresses of `task`, innermost first
    pub fn set_stack(&self, task: &Arc<SimTask>, stack: Vec<u64>) {
        *lock(&task.stack) = Some(stack);
    }

    /// Make the unwinder fail on `task`
    pub fn set_unreliable(&self, task: &Arc<SimTask>) {
        *lock(&task.stack) = None;
    }

    pub fn set_run_state(&self, task: &Arc<SimTask>, state: TaskRunState) {
        *lock(&task.run) = state;
    }

    /// Whether the architecture has a reliable unwinder
    pub fn set_reliable(&self, reliable: bool) {
        self.reliable.store(reliable, Ordering::Relaxed);
    }

    /// Tasks nudged so far, in order
    pub fn notified(&self) -> Vec<TaskId> {
        lock(&self.notified).clone()
    }

    fn find_task(&self, id: TaskId) -> Option<Arc<SimTask>> {
        let list = if id.is_idle() { &self.idle } else { &self.tasks };
        lock(list).iter().find(|t| t.id == id).cloned()
    }

    fn module_loaded(&self, name: &str) -> bool {
        lock(&self.modules).get(name).is_some_and(|m| m.loaded)
    }
}

impl Default for SimHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable for SimHost {
    fn for_each_symbol(&self, module: Option<&str>, visit: &mut dyn FnMut(&str, u64) -> bool) {
        if let Some(m) = module {
            if !self.module_loaded(m) {
                return;
            }
        }
        let symbols = lock(&self.symbols).clone();
        for sym in symbols.iter().filter(|s| s.module.as_deref() == module) {
            if visit(&sym.name, sym.addr) {
                break;
            }
        }
    }

    fn symbol_size(&self, addr: u64) -> Option<u64> {
        lock(&self.symbols)
            .iter()
            .find(|s| addr >= s.addr && addr - s.addr < s.size.max(1))
            .map(|s| s.size)
    }
}

impl ModuleHost for SimHost {
    fn find_module(&self, name: &str) -> bool {
        self.module_loaded(name)
    }

    fn is_livepatch_module(&self, name: &str) -> bool {
        lock(&self.modules).get(name).is_some_and(|m| m.livepatch)
    }

    fn try_module_get(&self, name: &str) -> bool {
        match lock(&self.modules).get_mut(name) {
            Some(m) if m.loaded => {
                m.refs += 1;
                true
            }
            _ => false,
        }
    }

    fn module_put(&self, name: &str) {
        if let Some(m) = lock(&self.modules).get_mut(name) {
            m.refs = m.refs.saturating_sub(1);
        }
    }

    fn request_module(&self, name: &str) -> Result<(), i32> {
        lock(&self.requested).push(name.to_string());
        // The loader may call back into the engine and into this host.
        let loader = lock(&self.loader).clone();
        match loader {
            Some(load) => load(name),
            None => Err(-libc::ENOENT),
        }
    }
}

impl RelocationApplier for SimHost {
    fn apply_relocate_add(
        &self,
        carrier: &str,
        section: &RelocationSection,
        symbols: &[KlpSymbol],
    ) -> Result<(), i32> {
        ktrace!("sim: {} relocations in {} with {} symbols", carrier, section.name, symbols.len());
        lock(&self.relocations).push((carrier.to_string(), section.name.clone()));
        Ok(())
    }
}

impl TraceHost for SimHost {
    fn register_hook(&self, ip: u64) -> Result<(), i32> {
        if lock(&self.hooks).insert(ip) {
            Ok(())
        } else {
            Err(-libc::EBUSY)
        }
    }

    fn unregister_hook(&self, ip: u64) -> Result<(), i32> {
        if lock(&self.hooks).remove(&ip) {
            Ok(())
        } else {
            Err(-libc::ENOENT)
        }
    }
}

impl TaskHost for SimHost {
    fn for_each_task(&self, visit: &mut dyn FnMut(&dyn Task)) {
        let tasks = lock(&self.tasks).clone();
        for t in &tasks {
            visit(&**t);
        }
    }

    fn for_each_idle_task(&self, visit: &mut dyn FnMut(&dyn Task)) {
        let idle = lock(&self.idle).clone();
        for t in &idle {
            visit(&**t);
        }
    }

    fn notify_task(&self, task: &dyn Task) {
        lock(&self.notified).push(task.id());
    }
}

impl StackInspector for SimHost {
    fn has_reliable_stacktrace(&self) -> bool {
        self.reliable.load(Ordering::Relaxed)
    }

    fn stack_trace_reliable(&self, task: &dyn Task) -> Option<Vec<u64>> {
        self.find_task(task.id())?.trace()
    }
}

impl KernelHost for SimHost {
    fn name(&self) -> &'static str {
        "sim"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use klp_core::traits::{AddrRange, StackVerdict};

    fn symbols(host: &SimHost, module: Option<&str>) -> Vec<(String, u64)> {
        let mut out = Vec::new();
        host.for_each_symbol(module, &mut |name, addr| {
            out.push((name.to_string(), addr));
            false
        });
        out
    }

    #[test]
    fn test_module_symbols_follow_load_state() {
        let host = SimHost::new();
        host.add_symbol(None, "foo", 0x1000, 0x40);
        host.add_module_symbol("mod", "foo", 0x9000, 0x10);

        assert_eq!(symbols(&host, None), vec![("foo".to_string(), 0x1000)]);
        assert!(symbols(&host, Some("mod")).is_empty());

        host.load_module("mod", false);
        assert_eq!(symbols(&host, Some("mod")), vec![("foo".to_string(), 0x9000)]);
        assert_eq!(host.symbol_size(0x1000), Some(0x40));
        assert_eq!(host.symbol_size(0x903f), None);
        assert_eq!(host.symbol_size(0x900f), Some(0x10));
    }

    #[test]
    fn test_module_refs() {
        let host = SimHost::new();
        assert!(!host.try_module_get("p"));
        host.load_module("p", true);
        assert!(host.is_livepatch_module("p"));
        assert!(host.try_module_get("p"));
        assert_eq!(host.module_refcount("p"), 1);

        // Reloading keeps the count; unloaded modules refuse new refs.
        host.load_module("p", true);
        assert_eq!(host.module_refcount("p"), 1);
        host.unload_module("p");
        assert!(!host.find_module("p"));
        assert!(!host.try_module_get("p"));
        host.module_put("p");
        host.module_put("p");
        assert_eq!(host.module_refcount("p"), 0);
    }

    #[test]
    fn test_request_module_uses_loader() {
        let host = Arc::new(SimHost::new());
        assert_eq!(host.request_module("p__mod"), Err(-libc::ENOENT));

        let weak = Arc::downgrade(&host);
        host.set_module_loader(move |name| {
            let host = weak.upgrade().ok_or(-libc::ENOENT)?;
            host.load_module(name, true);
            Ok(())
        });
        assert_eq!(host.request_module("p__mod"), Ok(()));
        assert!(host.find_module("p__mod"));
        assert_eq!(host.requested(), vec!["p__mod".to_string(), "p__mod".to_string()]);
    }

    #[test]
    fn test_hooks() {
        let host = SimHost::new();
        let ip = ftrace_location(0x1000);
        assert_eq!(host.register_hook(ip), Ok(()));
        assert_eq!(host.register_hook(ip), Err(-libc::EBUSY));
        assert!(host.is_hooked(0x1000));
        assert_eq!(host.unregister_hook(ip), Ok(()));
        assert_eq!(host.unregister_hook(ip), Err(-libc::ENOENT));
    }

    #[test]
    fn test_scripted_stacks() {
        let host = SimHost::new();
        host.add_idle_tasks(2);
        let a = host.spawn_task();
        let b = host.spawn_task();
        let ranges = [AddrRange::new(0x1000, 0x40)];

        assert_eq!(host.classify(&*a, &ranges), StackVerdict::Safe);
        host.set_stack(&a, vec![0x5000, 0x1020]);
        assert_eq!(host.classify(&*a, &ranges), StackVerdict::Busy(0x1020));
        host.set_unreliable(&b);
        assert_eq!(host.classify(&*b, &ranges), StackVerdict::Unreliable);

        let mut idle = Vec::new();
        host.for_each_idle_task(&mut |t| idle.push(t.id()));
        assert_eq!(idle, vec![TaskId::idle(0), TaskId::idle(1)]);

        host.reap_task(&b);
        let mut live = Vec::new();
        host.for_each_task(&mut |t| live.push(t.id()));
        assert_eq!(live, vec![a.id()]);
        assert_eq!(b.run_state(), TaskRunState::Dead);
    }
}
