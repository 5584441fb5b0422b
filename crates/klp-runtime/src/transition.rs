//! Transition engine
//!
//! Moves every task from the current patch state to the target state. A
//! task switches at a safe point: either on its own (`update_task_state`,
//! called by the host on kernel exit or in the idle loop) or when the
//! engine finds no frame of a transitioning function on its stack.
//!
//! ```text
//! init_transition -> start_transition -> try_complete* -> complete_transition
//!                          ^                  |
//!                          +-- reverse -------+
//! ```

use std::sync::atomic::{fence, Ordering};
use std::time::Duration;

use klp_core::state::{PatchLifecycle, TargetState, TaskRunState, TransitionPhase};
use klp_core::traits::{AddrRange, KernelHost, StackVerdict, Task};
use klp_core::{kdebug, kinfo, knotice, ktrace, kwarn};

use crate::callbacks;
use crate::core::{Livepatch, Registry};
use crate::states::prev_states;

/// Outcome of one completion attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionStatus {
    /// No transition was running
    Idle,
    /// Some tasks still run code of the old state
    Pending { remaining: usize },
    /// The transition finished with this attempt
    Complete,
}

impl TransitionStatus {
    pub fn is_complete(&self) -> bool {
        !matches!(self, TransitionStatus::Pending { .. })
    }
}

impl<H: KernelHost> Livepatch<H> {
    /// Make `reg.patches[idx]` the transition patch heading for `state`
    pub(crate) fn init_transition(&self, reg: &mut Registry, idx: usize, state: TargetState) {
        if reg.transition.is_some() {
            kwarn!("init_transition with a transition already running");
        }
        self.set_phase(TransitionPhase::Initializing);

        let patch = &reg.patches[idx];
        reg.transition = Some(patch.id());
        self.set_target(state);
        kdebug!("'{}': initializing {} transition", patch.name(), state);

        // Tasks start from the opposite state; new tasks inherit it at fork.
        let initial = state.inverse();
        let mut init_task = |task: &dyn Task| {
            let ps = task.patch_state();
            if ps.state() != TargetState::Undefined {
                kwarn!("task {} has patch state {:?} outside a transition", task.id(), ps.state());
            }
            ps.set_state(initial);
        };
        self.host.for_each_task(&mut init_task);
        self.host.for_each_idle_task(&mut init_task);

        // Task states before the function flags: a task that sees a
        // transitioning function must also see its own initial state.
        fence(Ordering::SeqCst);

        patch.set_transition(true);
        patch.set_lifecycle(PatchLifecycle::InTransition);
    }

    /// Ask every task that is not yet in the target state to switch
    pub(crate) fn start_transition(&self, reg: &mut Registry) {
        let target = self.target_state();
        if let Some(idx) = reg.transition_index() {
            knotice!("'{}': starting {} transition", reg.patches[idx].name(), target);
        }
        self.set_phase(TransitionPhase::InProgress);

        let mut mark = |task: &dyn Task| {
            if task.patch_state().state() != target {
                task.patch_state().set_pending();
            }
        };
        self.host.for_each_task(&mut mark);
        self.host.for_each_idle_task(&mut mark);

        reg.signals_cnt = 0;
    }

    /// Try to switch every pending task; complete the transition if none is
    /// left
    ///
    /// Never blocks on tasks. Blocking tasks are notified every
    /// `signals_interval` unsuccessful attempts.
    pub fn try_complete_transition(&self) -> TransitionStatus {
        let mut reg = self.lock();
        self.try_complete_locked(&mut reg)
    }

    pub(crate) fn try_complete_locked(&self, reg: &mut Registry) -> TransitionStatus {
        let Some(idx) = reg.transition_index() else {
            return TransitionStatus::Idle;
        };
        let id = reg.patches[idx].id();
        let ranges = self.transition_ranges(reg, idx);

        let mut remaining = 0usize;
        let mut visit = |task: &dyn Task| {
            if !self.try_switch_task(task, &ranges) {
                remaining += 1;
            }
        };
        self.host.for_each_task(&mut visit);
        self.host.for_each_idle_task(&mut visit);

        if remaining > 0 {
            let interval = self.config.signals_interval;
            if reg.signals_cnt > 0 && interval > 0 && reg.signals_cnt % interval == 0 {
                self.send_signals();
            }
            reg.signals_cnt += 1;
            return TransitionStatus::Pending { remaining };
        }

        self.complete_transition(reg);

        if let Some(idx) = reg.index_of(id) {
            if !reg.patches[idx].is_enabled() {
                let patch = reg.patches.remove(idx);
                self.free_patch(reg, patch);
            } else if reg.patches[idx].is_replace() {
                let replaced: Vec<_> = reg.patches.drain(..idx).collect();
                for patch in replaced {
                    self.free_patch(reg, patch);
                }
            }
        }
        TransitionStatus::Complete
    }

    /// Poll [`try_complete_transition`](Self::try_complete_transition) up
    /// to `max_polls` times, sleeping `poll_interval` in between
    pub fn wait_for_transition(&self, max_polls: usize) -> TransitionStatus {
        let mut status = self.try_complete_transition();
        for _ in 1..max_polls {
            if status.is_complete() {
                break;
            }
            std::thread::sleep(self.config.poll_interval);
            status = self.try_complete_transition();
        }
        status
    }

    /// Sleep used by [`wait_for_transition`](Self::wait_for_transition)
    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }

    /// Code ranges a task must not be inside of to switch
    ///
    /// Unpatching: the patch's replacement. Patching: whatever the task
    /// runs today, the entry below or the original function.
    fn transition_ranges(&self, reg: &Registry, idx: usize) -> Vec<AddrRange> {
        let target = self.target_state();
        let mut ranges = Vec::new();
        for obj in reg.patches[idx].objects() {
            for func in obj.funcs() {
                let Some(redirect) = func.redirect() else {
                    continue;
                };
                if !redirect.is_patched() {
                    continue;
                }
                let range = if target == TargetState::Unpatched {
                    redirect.new_range()
                } else {
                    match self.stacks.below(redirect) {
                        Some(prev) => prev.new_range(),
                        None => redirect.old_range(),
                    }
                };
                ranges.push(range);
            }
        }
        ranges
    }

    fn try_switch_task(&self, task: &dyn Task, ranges: &[AddrRange]) -> bool {
        let ps = task.patch_state();
        if !ps.is_pending() {
            return true;
        }
        let target = self.target_state();

        match task.run_state() {
            TaskRunState::Dead => {}
            TaskRunState::Running => {
                kdebug!("task {} is running", task.id());
                return false;
            }
            TaskRunState::Runnable | TaskRunState::Sleeping => {
                if !self.host.has_reliable_stacktrace() {
                    return false;
                }
                match self.host.classify(task, ranges) {
                    StackVerdict::Safe => {}
                    StackVerdict::Busy(addr) => {
                        kdebug!("task {} is sleeping on function at {:#x}", task.id(), addr);
                        return false;
                    }
                    StackVerdict::Unreliable => {
                        kdebug!("task {} has an unreliable stack", task.id());
                        return false;
                    }
                }
            }
        }

        ps.set_state(target);
        ps.clear_pending();
        true
    }

    fn send_signals(&self) {
        kinfo!("signaling remaining tasks");
        let mut notify = |task: &dyn Task| {
            if task.patch_state().is_pending() {
                self.host.notify_task(task);
            }
        };
        self.host.for_each_task(&mut notify);
    }

    /// Every task reached the target: finish the transition patch
    fn complete_transition(&self, reg: &mut Registry) {
        let Some(idx) = reg.transition_index() else {
            return;
        };
        self.set_phase(TransitionPhase::Complete);
        let target = self.target_state();
        kdebug!("'{}': completing {} transition", reg.patches[idx].name(), target);

        if reg.patches[idx].is_replace() && target == TargetState::Patched {
            self.unpatch_replaced_patches(reg, idx);
        }

        if target == TargetState::Unpatched {
            let patch = &mut reg.patches[idx];
            let forced = patch.is_forced();
            for obj in patch.objs.iter_mut() {
                if forced {
                    obj.retire();
                } else {
                    obj.unpatch(&self.stacks, &*self.host, false);
                }
            }
            self.rcu.synchronize();
        }

        reg.patches[idx].set_transition(false);

        // No dispatcher may still see a transitioning function once task
        // states are reset below.
        if target == TargetState::Patched {
            self.rcu.synchronize();
        }

        let mut reset = |task: &dyn Task| {
            let ps = task.patch_state();
            if ps.clear_pending() {
                kwarn!("task {} still pending at transition end", task.id());
            }
            ps.set_state(TargetState::Undefined);
        };
        self.host.for_each_task(&mut reset);
        self.host.for_each_idle_task(&mut reset);

        let prev = prev_states(&reg.patches[..idx]);
        reg.patches[idx].with_objects(&prev, |objs, states| {
            for obj in objs.iter_mut() {
                if !obj.is_loaded() {
                    continue;
                }
                match target {
                    TargetState::Patched => callbacks::post_patch(obj, states),
                    TargetState::Unpatched => callbacks::post_unpatch(obj, states),
                    TargetState::Undefined => {}
                }
            }
        });

        let patch = &reg.patches[idx];
        knotice!("'{}': {} complete", patch.name(), target);
        patch.set_lifecycle(if patch.is_enabled() {
            PatchLifecycle::Enabled
        } else {
            PatchLifecycle::Disabled
        });

        self.set_target(TargetState::Undefined);
        reg.transition = None;
        self.set_phase(TransitionPhase::Idle);
    }

    /// A replace patch took over: drop everything installed before it
    fn unpatch_replaced_patches(&self, reg: &mut Registry, idx: usize) {
        let mut keep_nops = false;
        for old in reg.patches[..idx].iter_mut() {
            old.set_enabled(false);
            let forced = old.is_forced();
            keep_nops |= forced;
            for obj in old.objs.iter_mut() {
                if forced {
                    obj.retire();
                } else {
                    obj.unpatch(&self.stacks, &*self.host, false);
                }
            }
        }
        if !keep_nops {
            self.discard_nops(reg, idx);
        }
    }

    /// Nops only bridge the replace transition
    fn discard_nops(&self, reg: &mut Registry, idx: usize) {
        let patch = &mut reg.patches[idx];
        for obj in patch.objs.iter_mut() {
            obj.unpatch(&self.stacks, &*self.host, true);
        }
        patch.objs.retain_mut(|obj| !obj.discard_nops());
    }

    /// Abort a patching transition that never started
    pub(crate) fn cancel_transition(&self, reg: &mut Registry) {
        if self.target_state() != TargetState::Patched {
            kwarn!("cancel_transition outside a patching transition");
            return;
        }
        if let Some(idx) = reg.transition_index() {
            kdebug!("'{}': canceling patching transition, going to unpatch", reg.patches[idx].name());
        }
        self.set_target(TargetState::Unpatched);
        self.complete_transition(reg);
    }

    /// Flip the direction of the running transition
    ///
    /// Tasks already switched become the ones to move back.
    pub(crate) fn reverse_transition(&self, reg: &mut Registry) {
        let Some(idx) = reg.transition_index() else {
            return;
        };
        self.set_phase(TransitionPhase::Reversing);
        let target = self.target_state();
        kdebug!("'{}': reversing transition from {}", reg.patches[idx].name(), target);

        let mut clear = |task: &dyn Task| {
            task.patch_state().clear_pending();
        };
        self.host.for_each_task(&mut clear);
        self.host.for_each_idle_task(&mut clear);

        // Safe-point switches already past the pending check store the old
        // target; they must land before the target flips.
        self.rcu.synchronize();

        let enabled = reg.patches[idx].is_enabled();
        reg.patches[idx].set_enabled(!enabled);
        self.set_target(target.inverse());

        self.start_transition(reg);
    }

    /// Move every task to the target state without checking stacks
    ///
    /// Patches that tasks may still be executing are marked forced and
    /// will never be released.
    pub(crate) fn force_transition(&self, reg: &mut Registry) {
        let Some(idx) = reg.transition_index() else {
            return;
        };
        kwarn!("forcing remaining tasks to the patched state");
        let target = self.target_state();

        let mut force = |task: &dyn Task| {
            let ps = task.patch_state();
            if ps.clear_pending() {
                ps.set_state(target);
            }
        };
        self.host.for_each_task(&mut force);
        self.host.for_each_idle_task(&mut force);

        if target == TargetState::Unpatched {
            reg.patches[idx].mark_forced();
        } else if reg.patches[idx].is_replace() {
            for old in reg.patches[..idx].iter_mut() {
                old.mark_forced();
            }
        }

        self.try_complete_locked(reg);
    }

    /// Safe-point hook: switch the calling task if it is pending
    ///
    /// Runs as an RCU reader so that `synchronize` in the engine waits for
    /// a switch in progress. Must not be called inside another read-side
    /// critical section of the service's domain while the engine may run.
    pub fn update_task_state(&self, task: &dyn Task) {
        let _rcu = self.rcu.read_lock();
        let ps = task.patch_state();
        if ps.clear_pending() {
            let target = self.target_state();
            ktrace!("task {} switching to {}", task.id(), target);
            ps.set_state(target);
        }
    }

    /// A new task inherits its parent's patch state
    pub fn on_task_fork(&self, parent: &dyn Task, child: &dyn Task) {
        child.patch_state().inherit(parent.patch_state());
    }

    /// An exiting task can no longer block the transition
    pub fn on_task_exit(&self, task: &dyn Task) {
        let ps = task.patch_state();
        ps.clear_pending();
        ps.set_state(TargetState::Undefined);
    }
}
