// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scenarios driving the emitter, linker, trace monitor and
//! sideline worker together through the public `CodeCache` surface.

mod support;

use std::sync::Arc;
use std::thread;

use fragcache::platform::native::NativePlatform;
use fragcache::platform::{ExitKind, Instr};
use fragcache::{CodeCache, Config, FragmentFlags, Sharing, SidelineWorker, TraceMonitor};

use support::{direct_block, plain_block, TestIsa};

fn cache_with(config: Config) -> (CodeCache, Arc<TestIsa>) {
    let isa = Arc::new(TestIsa::new());
    let cache = CodeCache::new(config, Arc::new(NativePlatform), isa.clone());
    (cache, isa)
}

/// Emit a head fragment, then a higher-tagged fragment with a direct exit
/// back to it, which the linker promotes to a trace head (spec §4.D, "a
/// direct backward branch to a bb").
fn emit_promoted_head(cache: &CodeCache, head_tag: u64, promoter_tag: u64) -> fragcache::FragmentId {
    let head = cache
        .emit(head_tag, Sharing::Shared, &plain_block(), FragmentFlags::empty(), true)
        .unwrap();
    cache
        .emit(
            promoter_tag,
            Sharing::Shared,
            &direct_block(head_tag),
            FragmentFlags::empty(),
            true,
        )
        .unwrap();
    assert!(cache.with_fragment(head, |f| f.flags.contains(FragmentFlags::IS_TRACE_HEAD)).unwrap());
    head
}

/// S1: bb -> bb forward link.
#[test]
fn s1_bb_to_bb_forward_link() {
    let (cache, _isa) = cache_with(Config::default());

    let a = cache
        .emit(0x1000, Sharing::Shared, &direct_block(0x1100), FragmentFlags::empty(), true)
        .unwrap();
    let b = cache
        .emit(0x1100, Sharing::Shared, &direct_block(0x1200), FragmentFlags::empty(), true)
        .unwrap();

    let a_exit = cache.with_fragment(a, |f| f.exits[0]).unwrap();
    let b_exit = cache.with_fragment(b, |f| f.exits[0]).unwrap();

    assert!(cache.with_stub(a_exit, |s| s.is_linked()).unwrap(), "A's exit must be patched direct to B");
    assert!(cache.with_fragment(b, |f| f.incoming.contains(&a_exit)).unwrap());

    let future = cache.lookup(Sharing::Shared, 0x1200).expect("a Future must exist for 0x1200");
    assert!(cache.with_fragment(future, |_| ()).is_none(), "0x1200 has no Real fragment yet");
    assert_eq!(future_incoming(&cache, future), vec![b_exit]);
}

/// S2: backward branch promotes head.
#[test]
fn s2_backward_branch_promotes_head() {
    let (cache, _isa) = cache_with(Config::default());

    let head = cache
        .emit(0x1000, Sharing::Shared, &plain_block(), FragmentFlags::empty(), true)
        .unwrap();
    let a = cache
        .emit(0x2000, Sharing::Shared, &direct_block(0x1000), FragmentFlags::empty(), true)
        .unwrap();

    assert!(cache.with_fragment(head, |f| f.flags.contains(FragmentFlags::IS_TRACE_HEAD)).unwrap());
    assert!(!cache.with_fragment(head, |f| f.flags.contains(FragmentFlags::LINKED_INCOMING)).unwrap());

    let a_exit = cache.with_fragment(a, |f| f.exits[0]).unwrap();
    assert!(!cache.with_stub(a_exit, |s| s.is_linked()).unwrap(), "A's exit to a trace head must not be linked");
}

/// S3: trace build across a threshold.
#[test]
fn s3_trace_build() {
    let (cache, isa) = cache_with(Config {
        trace_head_threshold: 3,
        max_trace_blocks: 2,
        ..Config::default()
    });
    isa.register(0x3000, plain_block());
    isa.register(0x3100, plain_block());

    let h = emit_promoted_head(&cache, 0x3000, 0x3050);
    let s = cache
        .emit(0x3100, Sharing::Shared, &plain_block(), FragmentFlags::empty(), true)
        .unwrap();

    let mut monitor = TraceMonitor::new();
    for _ in 0..2 {
        monitor.on_cache_enter(&cache, h);
        assert!(!monitor.is_building());
    }
    monitor.on_cache_enter(&cache, h);
    assert!(monitor.is_building(), "third entry must start a trace build");

    monitor.on_cache_enter(&cache, s);
    assert!(monitor.is_building(), "extending the trace must not finalize it yet");

    monitor.on_cache_enter(&cache, s);
    assert!(!monitor.is_building(), "hitting max_trace_blocks must finalize");

    let t = cache.lookup(Sharing::Shared, 0x3000).expect("H's tag must resolve to the new trace");
    assert!(cache.with_fragment(t, |f| f.flags.contains(FragmentFlags::IS_TRACE)).unwrap());
    assert!(cache.with_fragment(h, |f| f.flags.contains(FragmentFlags::WAS_DELETED)).unwrap());
}

/// S4: trace abort by deletion.
#[test]
fn s4_trace_abort_by_deletion() {
    let (cache, isa) = cache_with(Config {
        trace_head_threshold: 1,
        ..Config::default()
    });
    isa.register(0x4000, plain_block());

    let h = emit_promoted_head(&cache, 0x4000, 0x4050);
    let s = cache
        .emit(0x4100, Sharing::Shared, &plain_block(), FragmentFlags::empty(), true)
        .unwrap();

    let mut monitor = TraceMonitor::new();
    monitor.on_cache_enter(&cache, h);
    assert!(monitor.is_building());

    cache.delete_fragment(s);
    monitor.on_cache_enter(&cache, s);
    assert!(!monitor.is_building(), "observing WAS_DELETED must abort the trace");
}

/// S5: sideline swap.
#[test]
fn s5_sideline_swap() {
    let (cache, isa) = cache_with(Config::default());
    isa.register(0x5000, plain_block());

    let t = cache
        .emit(0x5000, Sharing::Shared, &plain_block(), FragmentFlags::empty(), true)
        .unwrap();

    let worker = SidelineWorker::new();
    for _ in 0..=cache.config().sideline_hot_threshold {
        worker.sample(t);
    }

    assert!(worker.force_cycle(&cache), "a sample past threshold must win a swap");
    assert!(!cache.with_fragment(t, |f| f.flags.contains(FragmentFlags::WAS_DELETED)).unwrap());

    worker.cleanup_replacement(&cache);
    assert!(cache.with_fragment(t, |f| f.flags.contains(FragmentFlags::WAS_DELETED)).unwrap());
}

/// S6: cross-thread shared link race.
#[test]
fn s6_cross_thread_shared_link_race() {
    let (cache, _isa) = cache_with(Config::default());
    let cache = Arc::new(cache);
    let cache_a = cache.clone();
    let cache_b = cache.clone();

    let t1 = thread::spawn(move || {
        cache_a
            .emit(0x6000, Sharing::Shared, &direct_block(0x6999), FragmentFlags::empty(), true)
            .unwrap()
    });
    let t2 = thread::spawn(move || {
        cache_b
            .emit(0x6010, Sharing::Shared, &direct_block(0x6999), FragmentFlags::empty(), true)
            .unwrap()
    });

    let a = t1.join().unwrap();
    let b = t2.join().unwrap();

    let future = cache.lookup(Sharing::Shared, 0x6999).expect("a Future must hold both edges");
    let incoming = future_incoming(&cache, future);
    let a_exit = cache.with_fragment(a, |f| f.exits[0]).unwrap();
    let b_exit = cache.with_fragment(b, |f| f.exits[0]).unwrap();

    assert_eq!(incoming.len(), 2, "neither edge may be lost nor duplicated");
    assert!(incoming.contains(&a_exit));
    assert!(incoming.contains(&b_exit));
}

/// Testable property 1: link invariant.
#[test]
fn property_link_invariant() {
    let (cache, _isa) = cache_with(Config::default());

    let a = cache
        .emit(0x7000, Sharing::Shared, &direct_block(0x7100), FragmentFlags::empty(), true)
        .unwrap();
    let b = cache
        .emit(0x7100, Sharing::Shared, &plain_block(), FragmentFlags::empty(), true)
        .unwrap();

    let a_exit = cache.with_fragment(a, |f| f.exits[0]).unwrap();
    assert!(cache.with_stub(a_exit, |s| s.is_linked()).unwrap());
    assert!(cache.with_fragment(b, |f| f.incoming.contains(&a_exit)).unwrap());
}

/// Testable property 2: atomic shift.
#[test]
fn property_atomic_shift() {
    let (cache, _isa) = cache_with(Config::default());

    let a = cache
        .emit(0x8000, Sharing::Shared, &direct_block(0x8100), FragmentFlags::empty(), true)
        .unwrap();
    let old = cache
        .emit(0x8100, Sharing::Shared, &plain_block(), FragmentFlags::empty(), true)
        .unwrap();
    let old_incoming = cache.with_fragment(old, |f| f.incoming.clone()).unwrap();

    let new = cache
        .emit_invisible(0x8100, Sharing::Shared, &plain_block(), FragmentFlags::empty())
        .unwrap();
    cache.shift_links_to_new_fragment(old, new);

    assert!(cache.with_fragment(old, |f| f.incoming.is_empty()).unwrap());
    assert_eq!(cache.with_fragment(new, |f| f.incoming.clone()).unwrap(), old_incoming);

    let a_exit = cache.with_fragment(a, |f| f.exits[0]).unwrap();
    assert!(cache.with_stub(a_exit, |s| s.is_linked()).unwrap());
}

/// Testable property 3: delete safety.
#[test]
fn property_delete_safety() {
    let (cache, _isa) = cache_with(Config::default());

    let a = cache
        .emit(0x9100, Sharing::Shared, &direct_block(0x9200), FragmentFlags::empty(), true)
        .unwrap();
    let b = cache
        .emit(0x9200, Sharing::Shared, &plain_block(), FragmentFlags::empty(), true)
        .unwrap();
    let b_incoming_before = cache.with_fragment(b, |f| f.incoming.clone()).unwrap();

    let future = cache.incoming_remove_fragment(b).expect("b's tag must still resolve to b");
    assert_eq!(future_incoming(&cache, future), b_incoming_before);

    // A's own exit/link bookkeeping is untouched by removing B from the
    // graph; A itself is still present.
    assert!(cache.with_fragment(a, |_| ()).is_some());
}

/// Testable property 4: round-trip link/unlink.
#[test]
fn property_round_trip_link_unlink() {
    let (cache, _isa) = cache_with(Config::default());

    let a = cache
        .emit(0xa000, Sharing::Shared, &direct_block(0xa100), FragmentFlags::empty(), true)
        .unwrap();
    let b = cache
        .emit(0xa100, Sharing::Shared, &plain_block(), FragmentFlags::empty(), true)
        .unwrap();

    let a_exit = cache.with_fragment(a, |f| f.exits[0]).unwrap();
    let cti_pc = cache.cti_pc(a_exit).unwrap();
    let linked_bytes = unsafe { std::ptr::read(cti_pc.cast::<usize>()) };

    cache.unlink_incoming(b);
    assert!(!cache.with_stub(a_exit, |s| s.is_linked()).unwrap());
    let unlinked_bytes = unsafe { std::ptr::read(cti_pc.cast::<usize>()) };
    assert_ne!(linked_bytes, unlinked_bytes, "unlink must actually re-patch the cti");

    cache.link_new_fragment(a);
    assert!(cache.with_stub(a_exit, |s| s.is_linked()).unwrap());
    let relinked_bytes = unsafe { std::ptr::read(cti_pc.cast::<usize>()) };
    assert_eq!(linked_bytes, relinked_bytes, "re-linking must restore the original direct patch");
}

/// Testable property 5: trace head marking is transitive-idempotent.
#[test]
fn property_trace_head_marking_idempotent() {
    let (cache, _isa) = cache_with(Config::default());

    let head = cache
        .emit(0x1000, Sharing::Shared, &plain_block(), FragmentFlags::empty(), true)
        .unwrap();
    cache
        .emit(0xb000, Sharing::Shared, &direct_block(0x1000), FragmentFlags::empty(), true)
        .unwrap();
    assert!(cache.with_fragment(head, |f| f.flags.contains(FragmentFlags::IS_TRACE_HEAD)).unwrap());

    // A second backward edge into an already-marked head must not panic
    // or double-unlink; the head stays marked.
    let second = cache
        .emit(0xb010, Sharing::Shared, &direct_block(0x1000), FragmentFlags::empty(), true)
        .unwrap();
    assert!(cache.with_fragment(head, |f| f.flags.contains(FragmentFlags::IS_TRACE_HEAD)).unwrap());

    // A head that is already marked stays unlinkable: the second
    // promoter's own exit must not get patched straight into it, or
    // executions through that edge would bypass the dispatcher and the
    // trace-head counter would never see them.
    let second_exit = cache.with_fragment(second, |f| f.exits[0]).unwrap();
    assert!(!cache.with_stub(second_exit, |s| s.is_linked()).unwrap());
}

/// Testable property 6: stub allocator pairing (see also `stub_alloc`'s own
/// unit tests; this exercises it through `delete_fragment`).
#[test]
fn property_stub_allocator_pairing_via_delete() {
    let (cache, _isa) = cache_with(Config::default());

    let ilist = vec![Instr {
        encoded_len: 4,
        exit: Some(ExitKind::ConditionalBranch { taken: 0xc100 }),
    }];
    let id = cache
        .emit(0xc000, Sharing::Shared, &ilist, FragmentFlags::empty(), false)
        .unwrap();
    assert_eq!(cache.with_fragment(id, |f| f.exits.len()).unwrap(), 2, "cbr + fallthrough");
    cache.delete_fragment(id); // must not panic on a double free of the shared pair
}

/// Testable property 7: sideline liveness.
#[test]
fn property_sideline_liveness() {
    let (cache, isa) = cache_with(Config::default());
    isa.register(0xd000, plain_block());
    let t = cache
        .emit(0xd000, Sharing::Shared, &plain_block(), FragmentFlags::empty(), false)
        .unwrap();

    let worker = SidelineWorker::new();
    for _ in 0..=cache.config().sideline_hot_threshold {
        worker.sample(t);
    }
    assert!(worker.force_cycle(&cache), "hottest-entry selection must yield the over-threshold fragment");
}

/// Testable property 8: sideline safety.
#[test]
fn property_sideline_safety() {
    let (cache, isa) = cache_with(Config::default());
    isa.register(0xe000, plain_block());
    let old = cache
        .emit(0xe000, Sharing::Shared, &plain_block(), FragmentFlags::empty(), false)
        .unwrap();
    let old_incoming = cache.with_fragment(old, |f| f.incoming.clone()).unwrap();

    let worker = SidelineWorker::new();
    for _ in 0..=cache.config().sideline_hot_threshold {
        worker.sample(old);
    }
    assert!(worker.force_cycle(&cache));

    let new = cache.lookup(Sharing::Shared, 0xe000).unwrap();
    assert_eq!(cache.with_fragment(new, |f| f.incoming.clone()).unwrap(), old_incoming);
    assert!(!cache.with_fragment(old, |f| f.flags.contains(FragmentFlags::WAS_DELETED)).unwrap());

    worker.cleanup_replacement(&cache);
    assert!(cache.with_fragment(old, |f| f.flags.contains(FragmentFlags::WAS_DELETED)).unwrap());
}

/// Sideline must not swap a fragment whose tag a trace monitor is
/// currently mid-splice over, and must be free to swap it again once that
/// monitor finalizes (spec §9 Open Question, sideline-vs-trace exclusion).
#[test]
fn property_sideline_excludes_in_progress_trace_build() {
    let (cache, isa) = cache_with(Config {
        trace_head_threshold: 1,
        ..Config::default()
    });
    isa.register(0xf000, plain_block());

    let head = emit_promoted_head(&cache, 0xf000, 0xf050);

    let mut monitor = TraceMonitor::new();
    monitor.on_cache_enter(&cache, head);
    assert!(monitor.is_building(), "first entry at threshold 1 must start a trace build");
    assert!(cache.is_trace_building(0xf000));

    let worker = SidelineWorker::new();
    for _ in 0..=cache.config().sideline_hot_threshold {
        worker.sample(head);
    }
    assert!(
        !worker.force_cycle(&cache),
        "sideline must not swap a fragment whose tag is mid-trace-build"
    );
    assert!(
        !cache
            .with_fragment(head, |f| f.flags.contains(FragmentFlags::WAS_DELETED))
            .unwrap()
    );

    monitor.abort(&cache);
    assert!(!cache.is_trace_building(0xf000));

    for _ in 0..=cache.config().sideline_hot_threshold {
        worker.sample(head);
    }
    assert!(worker.force_cycle(&cache), "sideline may swap once the trace build is no longer in progress");
}

fn future_incoming(cache: &CodeCache, future: fragcache::FragmentId) -> Vec<fragcache::LinkStubId> {
    cache
        .with_slot(future, |slot| slot.incoming().to_vec())
        .unwrap_or_else(|| panic!("{future:?} has no slot in this test"))
}
