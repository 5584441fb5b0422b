//! # klp-runtime
//!
//! The live patching engine on top of the `klp-core` host traits.
//!
//! This crate provides:
//! - Symbol and relocation resolution for patch objects
//! - Per-function redirection stacks read under RCU by the dispatch hook
//! - The patch registry and the per-task consistency model (transitions)
//! - Object callbacks and system state versioning
//! - Module load/unload handling and the per-patch control surface
//! - Shadow variables
//! - An in-memory host (`sim` feature) for tests and demos
//!
//! [`Livepatch`] is the service object tying these together.

pub mod config;
pub mod arch;
pub mod rcu;
pub mod symbols;
pub mod func_stack;
pub mod states;
pub mod callbacks;
pub mod model;
pub mod core;
pub mod transition;
pub mod control;
pub mod notifier;
pub mod shadow;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

// Re-exports
pub use config::{ConfigError, LivepatchConfig};
pub use rcu::{RcuCell, RcuDomain, RcuReadGuard};
pub use func_stack::{Dispatch, FuncRedirect, FuncStacks};
pub use states::SystemState;
pub use callbacks::{CallbackContext, ObjectCallbacks};
pub use model::{companion_name, KlpFunc, KlpObject, KlpPatch, PatchHandle};
pub use crate::core::Livepatch;
pub use transition::TransitionStatus;
pub use shadow::{ShadowError, ShadowStore};

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        pub use arch::generic as current_arch;
    }
}
