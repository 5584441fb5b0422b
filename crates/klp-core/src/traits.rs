//! Kernel host traits
//!
//! These traits define the interface between the platform-agnostic engine
//! and the kernel (or simulation) it patches. A host implements all of
//! them and [`KernelHost`] on a single type.

use crate::id::TaskId;
use crate::reloc::{KlpSymbol, RelocationSection};
use crate::state::TaskRunState;
use crate::task::TaskPatchState;

/// Symbol table lookups (kallsyms)
pub trait SymbolTable: Send + Sync {
    /// Visit every symbol of `module` (`None` for the base image) in table
    /// order. The visitor returns `true` to stop the walk.
    fn for_each_symbol(&self, module: Option<&str>, visit: &mut dyn FnMut(&str, u64) -> bool);

    /// Size of the symbol starting at or containing `addr`
    fn symbol_size(&self, addr: u64) -> Option<u64>;
}

/// Module bookkeeping
pub trait ModuleHost: Send + Sync {
    /// Whether `name` is loaded and not going away
    fn find_module(&self, name: &str) -> bool;

    /// Whether `name` is marked as a livepatch module
    fn is_livepatch_module(&self, name: &str) -> bool;

    /// Take a reference on `name`; false if it is unloading or absent
    fn try_module_get(&self, name: &str) -> bool;

    fn module_put(&self, name: &str);

    /// Synchronously load `name`. Called without the registry lock held;
    /// the loaded module may call back into the engine.
    fn request_module(&self, name: &str) -> Result<(), i32>;
}

/// Relocation application for livepatch sections
pub trait RelocationApplier: Send + Sync {
    /// Apply `section` inside `carrier` with already resolved `symbols`
    fn apply_relocate_add(
        &self,
        carrier: &str,
        section: &RelocationSection,
        symbols: &[KlpSymbol],
    ) -> Result<(), i32>;

    /// Toggle write protection of the carrier's text
    fn set_module_text_ro(&self, _carrier: &str, _ro: bool) {}

    /// Architecture specific fixups once relocations are written
    fn arch_init_object_loaded(&self, _carrier: &str) {}
}

/// Function-entry interception (ftrace)
pub trait TraceHost: Send + Sync {
    /// Start routing calls to `ip` through the dispatch hook
    fn register_hook(&self, ip: u64) -> Result<(), i32>;

    fn unregister_hook(&self, ip: u64) -> Result<(), i32>;
}

/// A schedulable task
pub trait Task: Send + Sync {
    fn id(&self) -> TaskId;

    fn patch_state(&self) -> &TaskPatchState;

    fn run_state(&self) -> TaskRunState;
}

/// Task enumeration
pub trait TaskHost: Send + Sync {
    /// Every live task, idle tasks excluded
    fn for_each_task(&self, visit: &mut dyn FnMut(&dyn Task));

    /// The per-CPU idle tasks
    fn for_each_idle_task(&self, visit: &mut dyn FnMut(&dyn Task));

    /// Nudge a task that keeps blocking the transition: wake kthreads,
    /// send a fake signal to user tasks
    fn notify_task(&self, _task: &dyn Task) {}
}

/// Half-open address range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrRange {
    pub start: u64,
    pub end: u64,
}

impl AddrRange {
    #[inline]
    pub const fn new(start: u64, size: u64) -> Self {
        AddrRange {
            start,
            end: start.saturating_add(size),
        }
    }

    #[inline]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Result of inspecting a task's stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackVerdict {
    /// No frame inside any transitioning function
    Safe,

    /// A frame at this address is inside a transitioning function
    Busy(u64),

    /// The stack could not be walked reliably
    Unreliable,
}

/// Stack walking capability
pub trait StackInspector: Send + Sync {
    /// Whether the architecture can produce reliable stack traces at all
    fn has_reliable_stacktrace(&self) -> bool;

    /// Return addresses of `task`'s stack, or `None` if unreliable
    fn stack_trace_reliable(&self, task: &dyn Task) -> Option<Vec<u64>>;

    /// Check `task`'s stack against the ranges of transitioning functions
    fn classify(&self, task: &dyn Task, ranges: &[AddrRange]) -> StackVerdict {
        let Some(trace) = self.stack_trace_reliable(task) else {
            return StackVerdict::Unreliable;
        };
        trace
            .iter()
            .find(|addr| ranges.iter().any(|r| r.contains(**addr)))
            .map_or(StackVerdict::Safe, |addr| StackVerdict::Busy(*addr))
    }
}

/// Complete kernel host
///
/// Combines all collaborator traits into one.
pub trait KernelHost:
    SymbolTable + ModuleHost + RelocationApplier + TraceHost + TaskHost + StackInspector
{
    /// Host name for logging
    fn name(&self) -> &'static str;
}
