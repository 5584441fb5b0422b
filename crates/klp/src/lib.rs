//! # klp - live kernel function patching
//!
//! Replace functions of a running kernel (or any host implementing the
//! [`KernelHost`] traits) without stopping it.
//!
//! ## Features
//!
//! - **Stacked redirection**: every patched function keeps a stack of
//!   replacements; the newest one wins, removing it restores the previous
//! - **Per-task consistency**: a task switches to the new code only when
//!   none of the affected functions is on its stack
//! - **Reversible transitions**: disabling a patch in transition reverses it
//! - **Atomic replace**: a cumulative patch supersedes every earlier one
//! - **Module aware**: objects for modules are applied when the module
//!   comes and reverted when it goes
//! - **Shadow variables**: extra per-object data for replacement code
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use klp::{KlpFunc, KlpObject, KlpPatch, Livepatch};
//!
//! let lp = Livepatch::new(Arc::new(host));
//! let base = KlpObject::vmlinux("fix", vec![KlpFunc::new("cmdline_show", cmdline_show_v2 as u64)]);
//! let patch = KlpPatch::new(base).allow(["mod"]);
//! lp.enable_patch(patch)?;
//! lp.add_object(KlpObject::module("fix", "mod", vec![KlpFunc::new("foo", foo2 as u64)]))?;
//! lp.wait_for_transition(10);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │           Control surface / module notifier                 │
//! │      set_enabled, force, on_module_coming/going             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Registry + transition engine                │
//! │    patch list, one transition at a time, task switching     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Symbol   │      │  Func     │      │  Shadow   │
//!    │  resolver │      │  stacks   │      │  store    │
//!    └───────────┘      └───────────┘      └───────────┘
//!                              │
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │                     Kernel host                         │
//!    │   kallsyms, modules, ftrace, tasks, stack unwinder      │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use klp_core::{
    AddrRange,
    KernelHost,
    KlpError,
    KlpResult,
    KlpSymbol,
    PatchId,
    PatchLifecycle,
    Relocation,
    RelocationInfo,
    RelocationSection,
    StackVerdict,
    SymbolError,
    TargetState,
    Task,
    TaskId,
    TaskPatchState,
    TaskRunState,
    TransitionPhase,
    ValidationError,
};

// Re-export kprint macros for logging
pub use klp_core::{kprint, kprintln, kerror, kwarn, knotice, kinfo, kdebug, ktrace};
pub use klp_core::kprint::{LogLevel, init as init_logging, set_log_level, set_flush_enabled};

// Re-export env utilities
pub use klp_core::{env_get, env_get_bool, parse_bool};

// Re-export runtime types
pub use klp_runtime::{
    companion_name,
    CallbackContext,
    Dispatch,
    KlpFunc,
    KlpObject,
    KlpPatch,
    Livepatch,
    LivepatchConfig,
    ObjectCallbacks,
    PatchHandle,
    ShadowError,
    ShadowStore,
    SystemState,
    TransitionStatus,
};

#[cfg(feature = "sim")]
pub use klp_runtime::sim::{SimHost, SimTask};

/// Enable `patch` and poll its transition up to `max_polls` times
///
/// Returns the patch handle and the last transition status. A pending
/// status means some tasks are still blocking; the caller may keep
/// polling, reverse or force.
pub fn enable_and_wait<H: KernelHost>(
    lp: &Livepatch<H>,
    patch: KlpPatch,
    max_polls: usize,
) -> KlpResult<(PatchHandle, TransitionStatus)> {
    let handle = lp.enable_patch(patch)?;
    if !handle.in_transition() {
        return Ok((handle, TransitionStatus::Complete));
    }
    let status = lp.wait_for_transition(max_polls);
    Ok((handle, status))
}

/// Disable patch `name` and poll its transition up to `max_polls` times
pub fn disable_and_wait<H: KernelHost>(
    lp: &Livepatch<H>,
    name: &str,
    max_polls: usize,
) -> KlpResult<TransitionStatus> {
    lp.disable_patch(name)?;
    Ok(lp.wait_for_transition(max_polls))
}
