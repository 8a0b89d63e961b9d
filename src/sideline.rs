// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The sideline worker (spec §4.F): one background thread that samples a
//! shared hot-trace slot, coordinates a pause/resume rendezvous with the
//! owning mutator thread, and hot-swaps in a replacement fragment. This
//! crate has no optimizing pass of its own (no client-tool hook exists to
//! mangle the ilist, same gap `trace_monitor`'s finalize leaves); a cycle
//! re-emits the decoded ilist unchanged, marked `DO_NOT_SIDELINE`, purely to
//! exercise the swap machinery end to end.
//!
//! The `do-not-delete` exclusion (spec §4.F, "no mutator thread ever frees a
//! fragment the worker is currently dereferencing") is enforced only within
//! this module's own `optimize` step; `CodeCache::delete_fragment` does not
//! itself consult a worker's lock, since a `CodeCache` may be used with no
//! sideline worker attached at all. A caller running both needs to route
//! its own deletions through [`SidelineWorker::do_not_delete`] if it wants
//! the full exclusion spec §4.F describes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::cache::CodeCache;
use crate::fragment::{FragmentFlags, FragmentId, Sharing};

/// Per-fragment hit counters (spec §3, "Sample table"). Counter storage
/// lives in a `sharded_slab` slab so an already-registered fragment's
/// counter can be bumped without taking any lock wider than the one
/// guarding the fragment→slot index (spec §4.F, "the sample slot is written
/// unlocked by mutator threads").
struct SampleTable {
    index: Mutex<HashMap<FragmentId, usize>>,
    counters: sharded_slab::Slab<AtomicU32>,
}

impl SampleTable {
    fn new() -> Self {
        Self {
            index: Mutex::new(HashMap::new()),
            counters: sharded_slab::Slab::new(),
        }
    }

    /// Increment `id`'s counter, registering it on first sight, and return
    /// the new count.
    fn record(&self, id: FragmentId) -> u32 {
        let slot = {
            let mut index = self.index.lock();
            *index
                .entry(id)
                .or_insert_with(|| self.counters.insert(AtomicU32::new(0)).expect("sample slab exhausted"))
        };
        let counter = self.counters.get(slot).expect("sample slot must still be live");
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The entry with the highest count strictly above `threshold`, if any
    /// (spec §4.F step 3, §8 property 7 "Sideline liveness").
    fn hottest(&self, threshold: u32) -> Option<(FragmentId, u32)> {
        let index = self.index.lock();
        index
            .iter()
            .filter_map(|(&id, &slot)| self.counters.get(slot).map(|c| (id, c.load(Ordering::Relaxed))))
            .filter(|&(_, count)| count > threshold)
            .max_by_key(|&(_, count)| count)
    }

    fn clear(&self, id: FragmentId) {
        if let Some(slot) = self.index.lock().remove(&id) {
            self.counters.remove(slot);
        }
    }
}

#[derive(Default)]
struct PauseState {
    /// Thread the worker is waiting to see reach a safe point.
    requested: Option<ThreadId>,
    paused: bool,
    resume: bool,
}

/// Pause/resume rendezvous between the worker and one owning mutator
/// thread (spec §4.F steps 4a-4c, 4g).
struct PauseGate {
    state: Mutex<PauseState>,
    cond: Condvar,
}

impl PauseGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(PauseState::default()),
            cond: Condvar::new(),
        }
    }
}

/// Background thread that profiles and re-optimizes hot traces (spec §4.F).
/// Owns the sample table, the do-not-delete lock, and the per-owner
/// remember list of fragments replaced but not yet freed.
pub struct SidelineWorker {
    samples: SampleTable,
    /// The global `sideline_trace` slot (spec §4.F step 1): `0` means
    /// "none", otherwise `1 + fragment index`, written unlocked by trace
    /// prefix code on every trace entry.
    current_trace: AtomicU64,
    sample_count: AtomicU32,
    do_not_delete: Mutex<()>,
    remember: Mutex<Vec<FragmentId>>,
    pause: PauseGate,
    shutdown: AtomicBool,
}

impl Default for SidelineWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl SidelineWorker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            samples: SampleTable::new(),
            current_trace: AtomicU64::new(0),
            sample_count: AtomicU32::new(0),
            do_not_delete: Mutex::new(()),
            remember: Mutex::new(Vec::new()),
            pause: PauseGate::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Trace prefix code calls this on every trace entry (spec §4.F step 1).
    pub fn set_current_trace(&self, id: Option<FragmentId>) {
        let raw = id.map_or(0, |id| u64::from(id.as_u32()) + 1);
        self.current_trace.store(raw, Ordering::Relaxed);
    }

    /// One iteration of the worker's sampling loop (spec §4.F steps 1-2):
    /// read the current-trace slot and, if set, bump its counter. Returns
    /// whether this sample crossed the `sideline_sample_interval` boundary
    /// that should trigger a pick-hottest pass.
    fn poll_sample(&self, interval: u32) -> bool {
        let raw = self.current_trace.load(Ordering::Relaxed);
        if raw != 0 {
            let id = FragmentId::from_u32(u32::try_from(raw - 1).unwrap_or(u32::MAX));
            self.samples.record(id);
        }
        let count = self.sample_count.fetch_add(1, Ordering::Relaxed) + 1;
        interval > 0 && count.is_multiple_of(interval)
    }

    /// Run one full cycle: sample once, and if the interval boundary is
    /// crossed, pick the hottest entry and attempt to optimize it. Returns
    /// whether a swap happened. Exposed directly (rather than only via
    /// [`Self::spawn`]) so a caller can drive deterministic cycles, e.g. in
    /// tests seeding a sample count (spec §8 property 7).
    pub fn run_cycle(&self, cache: &CodeCache) -> bool {
        let due = self.poll_sample(cache.config().sideline_sample_interval);
        if !due {
            return false;
        }
        cache.stats.sideline_cycles.inc();
        let Some((hot_id, count)) = self.samples.hottest(cache.config().sideline_hot_threshold) else {
            return false;
        };
        trace!(fragment = ?hot_id, count, "sideline picked hottest fragment");
        self.optimize(cache, hot_id)
    }

    /// Force a pick-hottest pass regardless of the sample interval, for
    /// callers (and tests) that have already seeded the sample table past
    /// threshold and don't want to replay `sideline_sample_interval`
    /// individual samples.
    pub fn force_cycle(&self, cache: &CodeCache) -> bool {
        cache.stats.sideline_cycles.inc();
        let Some((hot_id, count)) = self.samples.hottest(cache.config().sideline_hot_threshold) else {
            return false;
        };
        trace!(fragment = ?hot_id, count, "sideline picked hottest fragment");
        self.optimize(cache, hot_id)
    }

    /// Directly bump `id`'s sample counter, for trace prefix code that
    /// already knows which fragment it is running rather than going
    /// through the shared `current_trace` slot.
    pub fn sample(&self, id: FragmentId) -> u32 {
        self.samples.record(id)
    }

    /// Step 4 (spec §4.F): pause the owner if there is a distinguished one,
    /// decode, re-emit, shift links, remember the old fragment, resume.
    fn optimize(&self, cache: &CodeCache, id: FragmentId) -> bool {
        let _do_not_delete = self.do_not_delete.lock();

        let Some((tag, flags, sharing)) = cache.with_fragment(id, |f| (f.tag, f.flags, f.sharing)) else {
            self.samples.clear(id);
            return false;
        };
        if flags.intersects(FragmentFlags::WAS_DELETED | FragmentFlags::DO_NOT_SIDELINE) {
            self.samples.clear(id);
            return false;
        }
        if cache.is_trace_building(tag) {
            // A trace monitor is mid-splice over this exact tag; swapping
            // the fragment out from under it would hand its finalize step
            // a stale `seed_id` lookup (spec §9 Open Question: sideline
            // never optimizes a fragment whose tag is the current
            // trace_tag of any thread).
            trace!(fragment = ?id, "sideline skipped fragment with an in-progress trace build");
            return false;
        }

        if let Sharing::Private(owner) = sharing {
            self.pause_owner(owner);
        }

        // Re-check after any pause wait: the target may have been deleted
        // while the worker released no locks of its own but the owner
        // thread ran to a safe point and tore it down (spec §4.F step 4c,
        // "check whether the target was deleted while waiting").
        let still_live = cache
            .with_fragment(id, |f| !f.flags.contains(FragmentFlags::WAS_DELETED))
            .unwrap_or(false);
        if !still_live {
            self.resume_owner();
            self.samples.clear(id);
            debug!(fragment = ?id, "sideline target deleted while paused, aborting");
            return false;
        }

        let ilist = cache.isa_tables_decode(tag, flags);
        let new_flags = flags | FragmentFlags::DO_NOT_SIDELINE;
        let result = cache.emit_as_replacement(tag, sharing, &ilist, new_flags, id);
        self.resume_owner();

        match result {
            Ok(new_id) => {
                cache.link_new_fragment(new_id);
                self.remember.lock().push(id);
                self.samples.clear(id);
                cache.stats.sideline_swaps.inc();
                debug!(old = ?id, new = ?new_id, "sideline swap complete");
                true
            }
            Err(_) => {
                self.samples.clear(id);
                false
            }
        }
    }

    fn pause_owner(&self, owner: ThreadId) {
        if owner == thread::current().id() {
            // The worker is itself running as the owner (e.g. a
            // synchronous test driving `run_cycle` from the mutator
            // thread) — there is nobody else to rendezvous with.
            return;
        }
        let mut state = self.pause.state.lock();
        state.requested = Some(owner);
        state.paused = false;
        self.pause.cond.notify_all();
        self.pause.cond.wait_while(&mut state, |s| !s.paused && s.requested == Some(owner));
    }

    fn resume_owner(&self) {
        let mut state = self.pause.state.lock();
        state.requested = None;
        state.resume = true;
        self.pause.cond.notify_all();
    }

    /// The owning mutator thread calls this at a dispatcher safe point
    /// (spec §4.F step 4b, "it will notice the request at the next
    /// dispatcher entry"; step 5, `cleanup_replacement`). If the worker is
    /// currently waiting on this thread specifically, rendezvous with it;
    /// either way, drain this thread's remember list.
    pub fn thread_reached_safe_point(&self, cache: &CodeCache) {
        let tid = thread::current().id();
        {
            let mut state = self.pause.state.lock();
            if state.requested == Some(tid) {
                state.paused = true;
                state.resume = false;
                self.pause.cond.notify_all();
                self.pause.cond.wait_while(&mut state, |s| !s.resume);
            }
        }
        self.cleanup_replacement(cache);
    }

    /// `cleanup_replacement` (spec §4.F step 5): free the cache bytes of
    /// every fragment this thread's sideline swaps have shadowed.
    pub fn cleanup_replacement(&self, cache: &CodeCache) {
        let old_fragments = std::mem::take(&mut *self.remember.lock());
        for old in old_fragments {
            cache.delete_fragment(old);
        }
    }

    /// Spawn the worker loop on its own OS thread at whatever priority
    /// `cache`'s [`crate::platform::Platform`] gives a named thread (spec
    /// §5, "one additional OS thread"); polls at a small fixed interval
    /// rather than blocking on a per-sample event, since nothing in this
    /// crate's scope generates one.
    pub fn spawn(self: std::sync::Arc<Self>, cache: std::sync::Arc<CodeCache>) -> JoinHandle<()> {
        let platform = cache.platform.clone();
        platform.spawn_thread(
            "sideline",
            Box::new(move || {
                while !self.shutdown.load(Ordering::Relaxed) {
                    self.run_cycle(&cache);
                    thread::sleep(Duration::from_micros(200));
                }
            }),
        )
    }

    /// Signal the worker loop spawned by [`Self::spawn`] to stop at its
    /// next iteration (spec §4.F, "Bidirectional cancellation: on shutdown
    /// or stop, the worker signals all pending events and exits").
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let mut state = self.pause.state.lock();
        state.requested = None;
        state.resume = true;
        self.pause.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::cache::CodeCache;
    use crate::config::Config;
    use crate::fragment::{FragmentFlags, Sharing};
    use crate::platform::native::NativePlatform;
    use crate::platform::{Ilist, Instr, IsaTables};

    use super::*;

    struct StubIsa;
    impl IsaTables for StubIsa {
        fn decode_fragment(&self, _tag: u64, _flags: FragmentFlags) -> Ilist {
            vec![Instr {
                encoded_len: 4,
                exit: None,
            }]
        }
        fn encode_instr(&self, instr: &Instr, dst: &mut [u8]) -> usize {
            dst[..usize::from(instr.encoded_len)].fill(0x90);
            usize::from(instr.encoded_len)
        }
    }

    fn test_cache() -> CodeCache {
        CodeCache::new(Config::default(), Arc::new(NativePlatform), Arc::new(StubIsa))
    }

    #[test]
    fn sample_table_tracks_per_fragment_counts() {
        let cache = test_cache();
        let ilist = vec![Instr {
            encoded_len: 4,
            exit: None,
        }];
        let a = cache
            .emit(0x1000, Sharing::Shared, &ilist, FragmentFlags::empty(), false)
            .unwrap();
        let b = cache
            .emit(0x2000, Sharing::Shared, &ilist, FragmentFlags::empty(), false)
            .unwrap();

        let worker = SidelineWorker::new();
        worker.sample(a);
        worker.sample(a);
        worker.sample(b);

        assert_eq!(worker.samples.hottest(0), Some((a, 2)));
    }

    #[test]
    fn hottest_past_threshold_triggers_a_swap() {
        let cache = test_cache();
        let ilist = vec![Instr {
            encoded_len: 4,
            exit: None,
        }];
        let id = cache
            .emit(0x1000, Sharing::Shared, &ilist, FragmentFlags::empty(), false)
            .unwrap();

        let worker = SidelineWorker::new();
        for _ in 0..(cache.config().sideline_hot_threshold + 1) {
            worker.sample(id);
        }

        assert!(worker.force_cycle(&cache));
        // Not deleted yet: the old fragment stays valid until
        // `cleanup_replacement` runs at the owner's next safe point (spec
        // §8 property 8, "Sideline safety").
        assert!(!cache.with_fragment(id, |f| f.flags.contains(FragmentFlags::WAS_DELETED)).unwrap());
        assert_eq!(*worker.remember.lock(), vec![id]);

        worker.cleanup_replacement(&cache);
        assert!(cache.with_fragment(id, |f| f.flags.contains(FragmentFlags::WAS_DELETED)).unwrap());
        assert!(worker.remember.lock().is_empty());
    }

    #[test]
    fn below_threshold_does_not_swap() {
        let cache = test_cache();
        let ilist = vec![Instr {
            encoded_len: 4,
            exit: None,
        }];
        let id = cache
            .emit(0x1000, Sharing::Shared, &ilist, FragmentFlags::empty(), false)
            .unwrap();

        let worker = SidelineWorker::new();
        worker.sample(id);

        assert!(!worker.force_cycle(&cache));
        assert!(!cache.with_fragment(id, |f| f.flags.contains(FragmentFlags::WAS_DELETED)).unwrap());
    }

    #[test]
    fn cleanup_replacement_frees_remembered_fragments() {
        let cache = test_cache();
        let ilist = vec![Instr {
            encoded_len: 4,
            exit: None,
        }];
        let id = cache
            .emit(0x1000, Sharing::Shared, &ilist, FragmentFlags::empty(), false)
            .unwrap();

        let worker = SidelineWorker::new();
        worker.remember.lock().push(id);
        worker.cleanup_replacement(&cache);

        assert!(worker.remember.lock().is_empty());
        assert!(cache.with_fragment(id, |f| f.flags.contains(FragmentFlags::WAS_DELETED)).unwrap());
    }

    #[test]
    fn do_not_sideline_flag_is_never_repicked() {
        let cache = test_cache();
        let ilist = vec![Instr {
            encoded_len: 4,
            exit: None,
        }];
        let id = cache
            .emit(
                0x1000,
                Sharing::Shared,
                &ilist,
                FragmentFlags::DO_NOT_SIDELINE,
                false,
            )
            .unwrap();

        let worker = SidelineWorker::new();
        for _ in 0..(cache.config().sideline_hot_threshold + 1) {
            worker.sample(id);
        }
        assert!(!worker.force_cycle(&cache));
    }

    #[test]
    fn via_current_trace_slot() {
        let cache = test_cache();
        let ilist = vec![Instr {
            encoded_len: 4,
            exit: None,
        }];
        let id = cache
            .emit(0x1000, Sharing::Shared, &ilist, FragmentFlags::empty(), false)
            .unwrap();

        let worker = SidelineWorker::new();
        worker.set_current_trace(Some(id));
        let interval = 4u32;
        let mut fired = false;
        for _ in 0..interval {
            fired |= worker.poll_sample(interval);
        }
        assert!(fired);
        assert_eq!(worker.samples.hottest(0), Some((id, 4)));
    }
}
