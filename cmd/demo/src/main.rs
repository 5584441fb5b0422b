//! Live patching walkthrough on the simulated host
//!
//! Patch `cmdline_proc_show` of the base image and `foo` of module `mod`
//! (with `foo2`, carried by the companion module `p__mod`) while a task
//! sleeps inside `cmdline_proc_show`.
//!
//! # Environment Variables
//!
//! - `KLP_LOG_LEVEL=debug` - Set log level (off, error, warn, notice, info, debug, trace)
//! - `KLP_FLUSH_EPRINT=1` - Flush log output immediately

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use klp::{
    init_logging, kinfo, CallbackContext, Dispatch, KlpFunc, KlpObject, KlpPatch, KlpResult,
    Livepatch, LivepatchConfig, ObjectCallbacks, SimHost, Task, TransitionStatus,
};

const CMDLINE_SHOW: u64 = 0xffff_8000_0010_0000;
const CMDLINE_SHOW_V2: u64 = 0xffff_a000_0000_1000;
const FOO: u64 = 0xffff_c000_0000_2000;
const FOO2: u64 = 0xffff_a000_0000_2000;

/// Shadow id of the per-object call counter kept by `foo2`
const SHADOW_HITS: u64 = 1;

struct Announce;

impl ObjectCallbacks for Announce {
    fn pre_patch(&self, cx: &CallbackContext<'_>) -> Result<(), i32> {
        println!("  [{}] pre_patch {}", cx.patch_name(), cx.object_name());
        Ok(())
    }

    fn post_patch(&self, cx: &CallbackContext<'_>) {
        println!("  [{}] post_patch {}", cx.patch_name(), cx.object_name());
    }

    fn pre_unpatch(&self, cx: &CallbackContext<'_>) {
        println!("  [{}] pre_unpatch {}", cx.patch_name(), cx.object_name());
    }

    fn post_unpatch(&self, cx: &CallbackContext<'_>) {
        println!("  [{}] post_unpatch {}", cx.patch_name(), cx.object_name());
    }
}

fn host() -> Arc<SimHost> {
    let host = Arc::new(SimHost::new());
    host.add_symbol(None, "cmdline_proc_show", CMDLINE_SHOW, 0x80);
    host.add_symbol(Some("p"), "livepatch_cmdline_proc_show", CMDLINE_SHOW_V2, 0x60);
    host.add_module_symbol("mod", "foo", FOO, 0x100);
    host.add_module_symbol("p__mod", "foo2", FOO2, 0x100);
    host.add_idle_tasks(2);
    host.load_module("p", true);
    host
}

/// Companion loader: loading `p__mod` registers its object with the service
fn install_loader(host: &Arc<SimHost>, lp: &Arc<Livepatch<SimHost>>) {
    let sim: Weak<SimHost> = Arc::downgrade(host);
    let service = Arc::downgrade(lp);
    host.set_module_loader(move |name: &str| {
        let (Some(sim), Some(lp)) = (sim.upgrade(), service.upgrade()) else {
            return Err(-libc::ENOENT);
        };
        if name != "p__mod" {
            return Err(-libc::ENOENT);
        }
        sim.load_module(name, true);
        let obj = KlpObject::module("p", "mod", vec![KlpFunc::new("foo", FOO2)])
            .callbacks(Arc::new(Announce));
        lp.add_object(obj).map_err(|e| e.errno())
    });
}

fn show(lp: &Livepatch<SimHost>, what: &str, addr: u64, task: &dyn Task) {
    match lp.dispatch(addr, task) {
        Dispatch::Original => println!("  task {}: {} -> original", task.id(), what),
        Dispatch::Redirect(to) => println!("  task {}: {} -> {:#x}", task.id(), what, to),
    }
}

fn main() -> KlpResult<()> {
    init_logging();
    println!("=== klp live patching demo ===\n");

    let host = host();
    let config = LivepatchConfig::from_env().poll_interval(Duration::from_millis(10));
    let lp = Arc::new(Livepatch::with_config(Arc::clone(&host), config));
    install_loader(&host, &lp);

    let worker = host.spawn_task();
    let sleeper = host.spawn_task();
    // Return address inside cmdline_proc_show.
    host.set_stack(&sleeper, vec![0xffff_ffff_8100_0000, CMDLINE_SHOW + 0x24]);
    host.load_module("mod", false);

    println!("Enabling patch 'p'");
    let base = KlpObject::vmlinux(
        "p",
        vec![KlpFunc::new("cmdline_proc_show", CMDLINE_SHOW_V2)],
    )
    .callbacks(Arc::new(Announce));
    let patch = KlpPatch::new(base).allow(["mod"]);
    let handle = lp.enable_patch(patch)?;
    println!("  companions requested: {:?}", host.requested());
    println!("  in transition: {}", handle.in_transition());

    show(&lp, "foo", FOO, &*worker);
    show(&lp, "foo", FOO, &*sleeper);

    let status = lp.wait_for_transition(3);
    println!("  after polling: {:?}", status);
    if let TransitionStatus::Pending { remaining } = status {
        kinfo!("{} task(s) still inside patched code", remaining);
        println!("\nSleeper leaves cmdline_proc_show");
        host.set_stack(&sleeper, vec![0xffff_ffff_8100_0000]);
        println!("  now: {:?}", lp.wait_for_transition(3));
    }
    show(&lp, "foo", FOO, &*sleeper);
    show(&lp, "cmdline_proc_show", CMDLINE_SHOW, &*sleeper);

    // What foo2 would do on each call.
    let object = 0xffff_8880_0123_4000u64;
    for _ in 0..3 {
        let hits = lp
            .shadow()
            .get_or_attach_with(object, SHADOW_HITS, || Ok(AtomicU64::new(0)))
            .ok()
            .flatten();
        if let Some(hits) = hits {
            hits.fetch_add(1, Ordering::Relaxed);
        }
    }
    if let Some(hits) = lp.shadow().get::<AtomicU64>(object, SHADOW_HITS) {
        println!("\nShadow counter on {:#x}: {:?}", object, hits);
    }

    println!("\nUnloading 'mod'");
    lp.on_module_going("mod");
    host.unload_module("mod");
    show(&lp, "foo", FOO, &*worker);

    println!("\nDisabling patch 'p'");
    klp::disable_and_wait(&lp, "p", 3)?;
    show(&lp, "cmdline_proc_show", CMDLINE_SHOW, &*worker);
    println!("  shadow variables released: {}", lp.shadow().detach_all(SHADOW_HITS));
    println!("  refs on p: {}, p__mod: {}", host.module_refcount("p"), host.module_refcount("p__mod"));

    println!("\n=== Demo Complete ===");
    Ok(())
}
