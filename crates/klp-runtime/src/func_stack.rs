//! Per-function redirection stacks
//!
//! Every patched function address owns a LIFO stack of [`FuncRedirect`]
//! entries, newest first. The function-entry hook calls
//! [`FuncStacks::dispatch`], which picks the implementation the calling
//! task must run without taking any lock.
//!
//! The address -> stack map is published through an [`RcuCell`]. Writers
//! build a new map under a spinlock and publish it in one store, so a
//! reader sees either the stack before or after a push/pop, never a stack
//! with a hole in it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use klp_core::error::{KlpError, KlpResult};
use klp_core::spinlock::SpinLock;
use klp_core::state::TargetState;
use klp_core::task::TaskPatchState;
use klp_core::traits::{AddrRange, TraceHost};
use klp_core::{kdebug, kerror, kwarn};

use crate::arch::ftrace_location;
use crate::rcu::{RcuCell, RcuDomain};

/// A resolved function patch as seen by the dispatch hook
#[derive(Debug)]
pub struct FuncRedirect {
    old_name: String,
    old_addr: u64,
    old_size: u64,
    new_addr: u64,
    new_size: u64,
    nop: bool,
    transition: AtomicBool,
    patched: AtomicBool,
    retired: AtomicBool,
}

impl FuncRedirect {
    pub fn new(
        old_name: impl Into<String>,
        old: AddrRange,
        new: AddrRange,
        nop: bool,
    ) -> Self {
        FuncRedirect {
            old_name: old_name.into(),
            old_addr: old.start,
            old_size: old.end - old.start,
            new_addr: new.start,
            new_size: new.end - new.start,
            nop,
            transition: AtomicBool::new(false),
            patched: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        }
    }

    pub fn old_name(&self) -> &str {
        &self.old_name
    }

    #[inline]
    pub fn old_addr(&self) -> u64 {
        self.old_addr
    }

    #[inline]
    pub fn new_addr(&self) -> u64 {
        self.new_addr
    }

    pub fn old_range(&self) -> AddrRange {
        AddrRange::new(self.old_addr, self.old_size)
    }

    pub fn new_range(&self) -> AddrRange {
        AddrRange::new(self.new_addr, self.new_size)
    }

    #[inline]
    pub fn is_nop(&self) -> bool {
        self.nop
    }

    #[inline]
    pub fn in_transition(&self) -> bool {
        self.transition.load(Ordering::Acquire)
    }

    /// Publish the transition flag before task states or stack changes
    #[inline]
    pub fn set_transition(&self, on: bool) {
        self.transition.store(on, Ordering::Release);
    }

    #[inline]
    pub fn is_patched(&self) -> bool {
        self.patched.load(Ordering::Acquire)
    }

    /// Left on its stack by a forced transition but never dispatched to
    #[inline]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }
}

/// What the dispatch hook should run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The unpatched function body
    Original,
    /// Jump to this replacement
    Redirect(u64),
}

type StackMap = HashMap<u64, Vec<Arc<FuncRedirect>>>;

/// All redirection stacks, keyed by old function address
pub struct FuncStacks {
    rcu: Arc<RcuDomain>,
    map: RcuCell<StackMap>,
    writer: SpinLock<()>,
}

impl FuncStacks {
    pub fn new(rcu: &Arc<RcuDomain>) -> Self {
        FuncStacks {
            rcu: Arc::clone(rcu),
            map: RcuCell::new(rcu, StackMap::new()),
            writer: SpinLock::new(()),
        }
    }

    /// Push `func` on the stack of its old address
    ///
    /// The first entry for an address registers the function-entry hook;
    /// if that fails nothing is pushed.
    pub fn patch_func<T>(&self, trace: &T, func: &Arc<FuncRedirect>) -> KlpResult<()>
    where
        T: TraceHost + ?Sized,
    {
        if func.is_patched() {
            kwarn!("function '{}' is already patched", func.old_name());
            return Err(KlpError::InvalidRequest("function already patched"));
        }

        let _w = self.writer.lock();
        let mut map = self.map.snapshot();
        let stack = map.entry(func.old_addr).or_default();
        if stack.is_empty() {
            trace.register_hook(ftrace_location(func.old_addr)).map_err(|code| {
                kerror!(
                    "failed to register ftrace handler for function '{}' ({})",
                    func.old_name(),
                    code
                );
                KlpError::TraceRegistration(code)
            })?;
        }
        stack.insert(0, Arc::clone(func));
        self.map.replace(map);
        func.patched.store(true, Ordering::Release);
        kdebug!("patched '{}' at {:#x} -> {:#x}", func.old_name(), func.old_addr, func.new_addr);
        Ok(())
    }

    /// Remove `func` from its stack; a no-op if it is not installed
    ///
    /// Removing the last entry unregisters the hook after the empty stack
    /// is published.
    pub fn unpatch_func<T>(&self, trace: &T, func: &Arc<FuncRedirect>)
    where
        T: TraceHost + ?Sized,
    {
        if !func.is_patched() {
            return;
        }

        let _w = self.writer.lock();
        let mut map = self.map.snapshot();
        let mut now_empty = false;
        if let Some(stack) = map.get_mut(&func.old_addr) {
            stack.retain(|f| !Arc::ptr_eq(f, func));
            now_empty = stack.is_empty();
        }
        if now_empty {
            map.remove(&func.old_addr);
        }
        self.map.replace(map);
        func.patched.store(false, Ordering::Release);

        if now_empty {
            if let Err(code) = trace.unregister_hook(ftrace_location(func.old_addr)) {
                kwarn!(
                    "failed to unregister ftrace handler for function '{}' ({})",
                    func.old_name(),
                    code
                );
            }
        }
    }

    /// Pick the implementation of `old_addr` for a task in `state`
    ///
    /// Lock-free. While the top entry is in transition, tasks that have not
    /// switched yet keep running whatever the entry below provides.
    pub fn dispatch(&self, old_addr: u64, state: &TaskPatchState) -> Dispatch {
        let guard = self.rcu.read_lock();
        let map = self.map.read(&guard);
        let Some(stack) = map.get(&old_addr) else {
            return Dispatch::Original;
        };

        let mut live = stack.iter().filter(|f| !f.is_retired());
        let Some(mut func) = live.next() else {
            return Dispatch::Original;
        };

        if func.in_transition() && state.state() == TargetState::Unpatched {
            match live.next() {
                Some(prev) => func = prev,
                None => return Dispatch::Original,
            }
        }

        if func.nop {
            Dispatch::Original
        } else {
            Dispatch::Redirect(func.new_addr)
        }
    }

    /// Newest entry for `old_addr`
    pub fn top(&self, old_addr: u64) -> Option<Arc<FuncRedirect>> {
        let guard = self.rcu.read_lock();
        self.map.read(&guard).get(&old_addr).and_then(|s| s.first().cloned())
    }

    /// Live entry directly below `func` on its stack
    pub fn below(&self, func: &Arc<FuncRedirect>) -> Option<Arc<FuncRedirect>> {
        let guard = self.rcu.read_lock();
        let map = self.map.read(&guard);
        let stack = map.get(&func.old_addr)?;
        let pos = stack.iter().position(|f| Arc::ptr_eq(f, func))?;
        stack[pos + 1..].iter().find(|f| !f.is_retired()).cloned()
    }

    /// Number of entries on the stack of `old_addr`
    pub fn depth(&self, old_addr: u64) -> usize {
        let guard = self.rcu.read_lock();
        self.map.read(&guard).get(&old_addr).map_or(0, Vec::len)
    }

    /// Whether any stack exists for `old_addr`
    pub fn is_hooked(&self, old_addr: u64) -> bool {
        self.depth(old_addr) > 0
    }
}
