// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The code cache: fragment/stub storage, tag lookup tables, and the
//! writable-window guard the emitter uses to lay out bytes. Emitter (§4.C),
//! Linker (§4.D), Monitor (§4.E) and Sideline worker (§4.F) are all
//! implemented as `impl CodeCache` blocks in their own files — this module
//! only owns the data and the locks spec §5's lock-ordering table names.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;

use cranelift_entity::PrimaryMap;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};

use crate::config::Config;
use crate::error::CacheError;
use crate::fragment::{Fragment, FragmentFlags, FragmentId, FragmentSlot, Sharing, Tag};
use crate::linkstub::{LinkStub, LinkStubId};
use crate::platform::{IsaTables, Platform};
use crate::stats::Stats;
use crate::stub_alloc::StubAllocator;

pub(crate) struct CodeCacheInner {
    pub fragments: PrimaryMap<FragmentId, FragmentSlot>,
    pub stubs: PrimaryMap<LinkStubId, LinkStub>,
    pub shared_tags: HashMap<Tag, FragmentId>,
    pub private_tags: HashMap<(ThreadId, Tag), FragmentId>,
    /// Trace-head entry counters (spec §3, "Trace head counter"; §4.E
    /// counter policy). Absent means zero.
    pub trace_head_counters: HashMap<FragmentId, u32>,
    bytes: Box<[u8]>,
    cursor: usize,
    /// Byte ranges reclaimed by `delete_fragment`, reused first-fit by a
    /// later `alloc` before the bump cursor advances further.
    free_list: Vec<crate::fragment::CacheSlice>,
}

impl CodeCacheInner {
    pub fn lookup_tag(&self, sharing: Sharing, tag: Tag) -> Option<FragmentId> {
        match sharing {
            Sharing::Shared => self.shared_tags.get(&tag).copied(),
            Sharing::Private(tid) => self.private_tags.get(&(tid, tag)).copied(),
        }
    }

    pub fn insert_tag(&mut self, sharing: Sharing, tag: Tag, id: FragmentId) {
        match sharing {
            Sharing::Shared => {
                self.shared_tags.insert(tag, id);
            }
            Sharing::Private(tid) => {
                self.private_tags.insert((tid, tag), id);
            }
        }
    }

    /// `entry_pc`/`cti_pc` computed against an already-held guard, for
    /// callers (the linker) that hold the fragment-table write lock for the
    /// whole of a link-state transition and so cannot re-acquire it through
    /// [`CodeCache::fragment_entry_pc`]/[`CodeCache::cti_pc`] without
    /// deadlocking.
    pub(crate) fn entry_pc(&self, id: FragmentId) -> Option<usize> {
        self.fragments
            .get(id)
            .and_then(FragmentSlot::as_real)
            .map(|f| self.bytes.as_ptr() as usize + f.entry_pc())
    }

    pub(crate) fn cti_pc(&self, stub_id: LinkStubId) -> Option<*mut u8> {
        let stub = self.stubs.get(stub_id)?;
        let owner = self.fragments.get(stub.owner)?.as_real()?;
        let base = self.bytes.as_ptr() as usize;
        Some((base + owner.entry_pc() + stub.cti_offset) as *mut u8)
    }

    pub(crate) fn base_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }

    pub(crate) fn push_free(&mut self, slice: crate::fragment::CacheSlice) {
        self.free_list.push(slice);
    }
}

/// The code-cache fragment management core: the six components (§4 A–F)
/// all operate through this type. One `CodeCache` corresponds to one DBT
/// process instance.
pub struct CodeCache {
    pub(crate) config: Config,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) isa: Arc<dyn IsaTables>,
    /// Serializes every transition of the linked/unlinked state of any
    /// shared fragment and every mutation of any shared incoming list
    /// (spec §3 Invariant 5, "change-linking lock"). Non-recursive: trace
    /// head marking is split into a pure "find" pass and a separate
    /// "apply" pass (spec §9, "Recursive locks") so nothing needs to
    /// re-enter the linker while already holding this lock.
    pub(crate) change_linking: RwLock<()>,
    /// Serializes trace finalization of shared traces (spec §4.E step 4).
    pub(crate) trace_building: Mutex<()>,
    pub(crate) table: RwLock<CodeCacheInner>,
    pub(crate) stub_alloc: StubAllocator,
    /// Global "no-link" switch (spec §4.D, `is_linkable` policy item 4):
    /// while set, the linker treats every edge as policy-unlinkable without
    /// consulting anything else.
    pub(crate) no_link: AtomicBool,
    /// Tags any thread's [`crate::TraceMonitor`] is currently building a
    /// trace from, reference-counted so two threads racing to build the
    /// same tag don't unmark it out from under each other. Consulted by
    /// the sideline worker so it never optimizes a fragment a trace
    /// monitor is mid-splice over (spec §9 Open Question: "sideline never
    /// optimizes a fragment whose tag is the current trace_tag of any
    /// thread").
    pub(crate) building_tags: Mutex<HashMap<Tag, u32>>,
    pub stats: Stats,
}

/// RAII guard modeling the self-protect `WRITABLE`/`READONLY` toggle
/// (spec §5, "Code cache pages: written only with the cache's writable
/// window open"). Holding this guard holds the fragment-table write lock,
/// so no linker operation (which needs at least a read lock on the same
/// table) can interleave with an in-progress emission — the compile-time
/// borrow-checker guarantee spec §9 asks for, enforced here via the lock's
/// exclusivity rather than a separate type-state (the crate has no way to
/// give two *different* locks a single combined guard without unsafe).
pub struct WritableCache<'a> {
    inner: RwLockWriteGuard<'a, CodeCacheInner>,
    platform: &'a dyn Platform,
    touched: Option<(usize, usize)>,
}

impl<'a> WritableCache<'a> {
    pub(crate) fn new(inner: RwLockWriteGuard<'a, CodeCacheInner>, platform: &'a dyn Platform) -> Self {
        Self {
            inner,
            platform,
            touched: None,
        }
    }

    /// Reserve `len` bytes, first-fit from bytes reclaimed by
    /// `delete_fragment` and otherwise by advancing the bump cursor.
    pub fn alloc(&mut self, len: usize) -> Result<usize, CacheError> {
        if let Some(idx) = self.inner.free_list.iter().position(|slice| slice.len >= len) {
            let slice = self.inner.free_list.remove(idx);
            if slice.len > len {
                self.inner.free_list.push(crate::fragment::CacheSlice {
                    offset: slice.offset + len,
                    len: slice.len - len,
                });
            }
            return Ok(slice.offset);
        }
        let available = self.inner.bytes.len().saturating_sub(self.inner.cursor);
        if len > available {
            return Err(CacheError::CacheFull {
                requested: len,
                available,
            });
        }
        let offset = self.inner.cursor;
        self.inner.cursor += len;
        Ok(offset)
    }

    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) {
        self.inner.bytes[offset..offset + data.len()].copy_from_slice(data);
        self.mark_touched(offset, offset + data.len());
    }

    pub fn base_ptr(&self) -> *const u8 {
        self.inner.bytes.as_ptr()
    }

    pub fn base_mut_ptr(&mut self) -> *mut u8 {
        self.inner.bytes.as_mut_ptr()
    }

    fn mark_touched(&mut self, start: usize, end: usize) {
        self.touched = Some(match self.touched {
            Some((s, e)) => (s.min(start), e.max(end)),
            None => (start, end),
        });
    }

    pub(crate) fn inner_mut(&mut self) -> &mut CodeCacheInner {
        &mut self.inner
    }
}

impl Drop for WritableCache<'_> {
    fn drop(&mut self) {
        if let Some((start, end)) = self.touched {
            // SAFETY: `start`/`end` are offsets we just wrote through
            // `write_bytes`, which are in-bounds of `self.inner.bytes` by
            // construction.
            unsafe {
                let base = self.inner.bytes.as_ptr();
                self.platform.machine_cache_sync(base.add(start), base.add(end));
            }
        }
    }
}

impl CodeCache {
    #[must_use]
    pub fn new(config: Config, platform: Arc<dyn Platform>, isa: Arc<dyn IsaTables>) -> Self {
        let stub_alloc = StubAllocator::with_capacity(
            config.stub_block_size,
            config.max_separate_stub_blocks,
            config.max_separate_stub_pairs,
        );
        let capacity = config.cache_capacity_bytes;
        Self {
            table: RwLock::new(CodeCacheInner {
                fragments: PrimaryMap::new(),
                stubs: PrimaryMap::new(),
                shared_tags: HashMap::new(),
                private_tags: HashMap::new(),
                trace_head_counters: HashMap::new(),
                bytes: vec![0u8; capacity].into_boxed_slice(),
                cursor: 0,
                free_list: Vec::new(),
            }),
            change_linking: RwLock::new(()),
            trace_building: Mutex::new(()),
            stub_alloc,
            no_link: AtomicBool::new(false),
            building_tags: Mutex::new(HashMap::new()),
            stats: Stats::default(),
            config,
            platform,
            isa,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Flip the global no-link switch (spec §4.D, `is_linkable` policy item
    /// 4). Intended for a client tool that needs every fragment routed
    /// through the dispatcher, e.g. for single-stepping.
    pub fn set_no_link(&self, no_link: bool) {
        self.no_link.store(no_link, Ordering::SeqCst);
    }

    pub(crate) fn begin_write(&self) -> WritableCache<'_> {
        WritableCache::new(self.table.write(), self.platform.as_ref())
    }

    pub fn fragment_entry_pc(&self, id: FragmentId) -> Option<usize> {
        self.table.read().entry_pc(id)
    }

    pub fn cti_pc(&self, stub_id: LinkStubId) -> Option<*mut u8> {
        self.table.read().cti_pc(stub_id)
    }

    pub fn tag_of(&self, id: FragmentId) -> Option<Tag> {
        self.table.read().fragments.get(id).map(FragmentSlot::tag)
    }

    pub fn with_fragment<R>(&self, id: FragmentId, f: impl FnOnce(&Fragment) -> R) -> Option<R> {
        let table = self.table.read();
        table.fragments.get(id).and_then(FragmentSlot::as_real).map(f)
    }

    pub fn with_stub<R>(&self, id: LinkStubId, f: impl FnOnce(&LinkStub) -> R) -> Option<R> {
        let table = self.table.read();
        table.stubs.get(id).map(f)
    }

    /// Like [`Self::with_fragment`] but exposes the raw slot, Future or
    /// Real, for callers that need to inspect a Future's pending incoming
    /// list (e.g. the linker recording an edge to a not-yet-translated tag).
    pub fn with_slot<R>(&self, id: FragmentId, f: impl FnOnce(&FragmentSlot) -> R) -> Option<R> {
        let table = self.table.read();
        table.fragments.get(id).map(f)
    }

    pub fn lookup(&self, sharing: Sharing, tag: Tag) -> Option<FragmentId> {
        self.table.read().lookup_tag(sharing, tag)
    }

    /// Increment and return a trace head's entry counter (spec §4.E,
    /// `on_cache_enter`).
    pub fn bump_trace_head_counter(&self, id: FragmentId) -> u32 {
        let mut table = self.table.write();
        let counter = table.trace_head_counters.entry(id).or_insert(0);
        *counter += 1;
        *counter
    }

    #[must_use]
    pub fn trace_head_counter(&self, id: FragmentId) -> u32 {
        self.table.read().trace_head_counters.get(&id).copied().unwrap_or(0)
    }

    /// Mark a trace head's counter with the "a trace was already built from
    /// here" sentinel (spec §4.E step 6).
    pub fn mark_trace_created(&self, id: FragmentId) {
        self.table
            .write()
            .trace_head_counters
            .insert(id, self.config.trace_created_sentinel);
    }

    /// Reset a trace head's counter after its trace is deleted, to prevent
    /// immediate re-promotion (spec §4.E, "Counter policy").
    pub fn reset_trace_head_counter(&self, id: FragmentId) {
        self.table
            .write()
            .trace_head_counters
            .insert(id, self.config.post_delete_counter_reset);
    }

    /// Decode a tag's application bytes via the configured [`IsaTables`]
    /// (spec §4.E, used when seeding and extending a trace).
    #[must_use]
    pub fn isa_tables_decode(&self, tag: Tag, flags: FragmentFlags) -> crate::platform::Ilist {
        self.isa.decode_fragment(tag, flags)
    }

    /// The global trace-building lock (spec §4.E finalization step 4).
    pub fn trace_building_lock(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.trace_building.lock()
    }

    /// Record that a trace monitor has started building from `tag`.
    pub(crate) fn mark_trace_building(&self, tag: Tag) {
        *self.building_tags.lock().entry(tag).or_insert(0) += 1;
    }

    /// Undo [`Self::mark_trace_building`] once that monitor finalizes or
    /// aborts.
    pub(crate) fn unmark_trace_building(&self, tag: Tag) {
        let mut tags = self.building_tags.lock();
        if let Some(count) = tags.get_mut(&tag) {
            *count -= 1;
            if *count == 0 {
                tags.remove(&tag);
            }
        }
    }

    /// Whether any thread currently has a trace under construction from
    /// `tag`. The sideline worker consults this before swapping in a
    /// replacement so it never races a trace monitor mid-splice.
    #[must_use]
    pub fn is_trace_building(&self, tag: Tag) -> bool {
        self.building_tags.lock().contains_key(&tag)
    }
}
