// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The linker (spec §4.D): maintains the incoming/outgoing edge graph. The
//! graph is doubly represented — every direct exit's `LinkStub` names a
//! target *tag*, and every Fragment owns the list of `LinkStubId`s whose
//! target it is. All link-state transitions of a shared fragment are
//! serialized by the change-linking lock; trace-head marking is split into
//! a pure `find_new_trace_heads` pass and a mutating `apply_trace_head_marks`
//! pass (spec §9, "Recursive locks") so nothing here needs to re-enter the
//! lock while already holding it.

use std::sync::atomic::Ordering;

use tracing::{debug, trace};

use crate::cache::CodeCacheInner;
use crate::fragment::{FragmentFlags, FragmentId, FragmentSlot, FutureFragment};
use crate::linkstub::{LinkStub, LinkStubFlags, LinkStubId, StubLocation};
use crate::CodeCache;

/// One candidate edge considered during a `link_new_fragment` pass: `from`
/// is the fragment just emitted, `stub` one of its exits, `to` the
/// currently-registered fragment its target tag resolves to.
struct CandidateEdge {
    from: FragmentId,
    stub: LinkStubId,
    to: FragmentId,
}

impl CodeCache {
    /// `link_new_fragment(f)` (spec §4.D): attach incoming edges held by a
    /// Future under the same tag (done by the emitter before this runs,
    /// since it already holds the table write lock at that point); link
    /// every outgoing edge whose target exists and is linkable; queue
    /// still-missing targets as Futures.
    pub fn link_new_fragment(&self, id: FragmentId) {
        let _ordering = self.change_linking.write();
        let mut table = self.table.write();

        let Some(from) = table.fragments.get(id).and_then(FragmentSlot::as_real) else {
            return;
        };
        let sharing = from.sharing;
        let exits = from.exits.clone();

        let mut candidates = Vec::new();
        for stub_id in exits {
            let Some(target_tag) = table.stubs.get(stub_id).and_then(LinkStub::target_tag) else {
                continue;
            };
            match table.lookup_tag(sharing, target_tag) {
                Some(to) => match table.fragments.get_mut(to) {
                    Some(FragmentSlot::Future(future)) => {
                        future.incoming.push(stub_id);
                    }
                    Some(FragmentSlot::Real(_)) => {
                        candidates.push(CandidateEdge {
                            from: id,
                            stub: stub_id,
                            to,
                        });
                    }
                    None => {}
                },
                None => {
                    let future_id = table.fragments.push(FragmentSlot::Future(FutureFragment {
                        tag: target_tag,
                        sharing,
                        flags: FragmentFlags::empty(),
                        incoming: vec![stub_id],
                    }));
                    table.insert_tag(sharing, target_tag, future_id);
                }
            }
        }

        // is_linkable policy items 1-4 (item 5, trace-head election, is
        // decided by find_new_trace_heads below and overrides the rest).
        candidates.retain(|edge| self.is_linkable(&table, edge.from, edge.stub, edge.to));

        let new_heads = self.find_new_trace_heads(&table, &candidates);
        self.apply_trace_head_marks(&mut table, &new_heads);

        for edge in candidates {
            if new_heads.contains(&edge.to) {
                // Policy item 5: this edge is exactly the one that elected
                // `to` as a trace head; it stays unlinked so every
                // execution of `to` bounces through the dispatcher.
                continue;
            }
            self.link_edge_locked(&mut table, edge.stub, edge.to);
            trace!(from = ?edge.from, to = ?edge.to, "fragment linked");
            self.stats.links_established.inc();
        }
    }

    /// `unlink_incoming(f)` (spec §4.D): flip every edge targeting `f` to
    /// route through its own stub instead of directly into `f`. The
    /// incoming list itself is left intact — it still records which stubs
    /// logically target `f`, only the patched bytes change.
    pub fn unlink_incoming(&self, id: FragmentId) {
        let _ordering = self.change_linking.write();
        let mut table = self.table.write();
        let stubs = table
            .fragments
            .get(id)
            .map(|slot| slot.incoming().to_vec())
            .unwrap_or_default();
        for stub_id in stubs {
            self.unlink_edge_locked(&mut table, stub_id);
        }
        if let Some(FragmentSlot::Real(f)) = table.fragments.get_mut(id) {
            f.flags.remove(FragmentFlags::LINKED_INCOMING);
        }
    }

    /// `unlink_outgoing(f)` (spec §4.D).
    pub fn unlink_outgoing(&self, id: FragmentId) {
        let _ordering = self.change_linking.write();
        let mut table = self.table.write();
        let stubs = table
            .fragments
            .get(id)
            .and_then(FragmentSlot::as_real)
            .map(|f| f.exits.clone())
            .unwrap_or_default();
        for stub_id in stubs {
            self.unlink_edge_locked(&mut table, stub_id);
        }
        if let Some(FragmentSlot::Real(f)) = table.fragments.get_mut(id) {
            f.flags.remove(FragmentFlags::LINKED_OUTGOING);
        }
    }

    /// `shift_links_to_new_fragment(old, new)` (spec §4.D): atomic swap,
    /// used when a trace shadows its head (§4.E step 5) or sideline
    /// replaces a fragment (§4.F step 4e). Every stub that targeted `old`
    /// is re-patched to target `new`, and `old`'s incoming list moves over
    /// whole.
    pub fn shift_links_to_new_fragment(&self, old: FragmentId, new: FragmentId) {
        let _ordering = self.change_linking.write();
        let mut table = self.table.write();
        let incoming = table
            .fragments
            .get(old)
            .map(|slot| slot.incoming().to_vec())
            .unwrap_or_default();

        for stub_id in &incoming {
            self.link_edge_locked_no_record(&mut table, *stub_id, new);
        }
        if let Some(slot) = table.fragments.get_mut(new) {
            *slot.incoming_mut() = incoming;
        }
        self.refresh_incoming_flag(&mut table, new);
        if let Some(FragmentSlot::Real(f)) = table.fragments.get_mut(old) {
            f.incoming.clear();
        }
        debug!(?old, ?new, "links shifted to replacement fragment");
    }

    /// `incoming_remove_fragment(f) -> Future?` (spec §4.D): on deletion,
    /// pull `f` out of every target's incoming list, and transfer `f`'s own
    /// incoming list to a new Future placeholder so edges that still
    /// target `f`'s tag recover gracefully on the next translation.
    pub fn incoming_remove_fragment(&self, id: FragmentId) -> Option<FragmentId> {
        let _ordering = self.change_linking.write();
        let mut table = self.table.write();

        let removed = table.fragments.get(id).and_then(FragmentSlot::as_real)?;
        let exits = removed.exits.clone();
        let tag = removed.tag;
        let sharing = removed.sharing;
        let incoming = removed.incoming.clone();

        for stub_id in exits {
            remove_from_every_incoming(&mut table, stub_id);
        }

        // Only re-register a Future under `tag` if `id` is still the live
        // holder of it — a replacement (e.g. the trace that shadowed this
        // fragment) may already have claimed the tag, in which case that
        // claim must not be clobbered.
        if table.lookup_tag(sharing, tag) != Some(id) {
            return None;
        }
        let future_id = table.fragments.push(FragmentSlot::Future(FutureFragment {
            tag,
            sharing,
            flags: FragmentFlags::empty(),
            incoming,
        }));
        table.insert_tag(sharing, tag, future_id);
        Some(future_id)
    }

    /// Logically delete `id`: detach it from the link graph
    /// ([`Self::incoming_remove_fragment`]), free its exits' separate-stub
    /// allocations, and return its cache bytes to the free list. The
    /// arena slot itself is left behind, flagged `WAS_DELETED`, so any
    /// thread still executing inside it (its cti bytes are unaffected by
    /// this call) can finish and the slot remains available for
    /// translation-recovery lookups (spec §3, "WAS_DELETED").
    ///
    /// This crate performs the byte reclamation synchronously; a caller
    /// that must not free bytes a mutator might still be running needs to
    /// defer the call to its own safe point (spec §9, "Deferred deletion").
    pub fn delete_fragment(&self, id: FragmentId) {
        self.incoming_remove_fragment(id);

        let mut table = self.table.write();
        let Some(FragmentSlot::Real(fragment)) = table.fragments.get_mut(id) else {
            return;
        };
        fragment.flags.insert(FragmentFlags::WAS_DELETED);
        let exits = fragment.exits.clone();
        let slice = fragment.code;

        let mut freed_pairs = std::collections::HashSet::new();
        for stub_id in exits {
            if let Some(stub) = table.stubs.get(stub_id) {
                match stub.stub {
                    Some(StubLocation::Separate { pair: Some(pair), .. }) => {
                        if freed_pairs.insert(pair) {
                            self.stub_alloc.free_pair(pair);
                        }
                    }
                    Some(StubLocation::Separate { pc, pair: None }) => {
                        self.stub_alloc.free(pc);
                    }
                    Some(StubLocation::Inline { .. }) | None => {}
                }
            }
        }
        table.push_free(slice);
        self.stats.fragments_deleted.inc();
    }

    fn is_linkable(&self, table: &CodeCacheInner, from_id: FragmentId, _stub: LinkStubId, to_id: FragmentId) -> bool {
        if self.no_link.load(Ordering::SeqCst) {
            return false;
        }
        let Some(from) = table.fragments.get(from_id).and_then(FragmentSlot::as_real) else {
            return false;
        };
        let Some(to) = table.fragments.get(to_id).and_then(FragmentSlot::as_real) else {
            return false;
        };
        if from.sharing != to.sharing {
            self.stats.cross_sharing_link_rejected.inc();
            return false;
        }
        if from
            .flags
            .intersects(FragmentFlags::HAS_SYSCALL | FragmentFlags::SELFMOD_SANDBOXED)
        {
            return false;
        }
        if to.flags.contains(FragmentFlags::WAS_DELETED) {
            return false;
        }
        // A trace head's incoming edges are deliberately left unlinked so
        // every execution bounces through the dispatcher and can be
        // counted (spec §4.D item 3); a self-loop is exempt since it
        // targets the same fragment that is itself the candidate head.
        if to.flags.contains(FragmentFlags::IS_TRACE_HEAD) && from_id != to_id {
            return false;
        }
        true
    }

    /// Trace-head detection (spec §4.D, "run from `is_linkable`"): a target
    /// becomes a trace head if (a) the source is a trace linking to a
    /// plain bb, or (b) the source is a direct backward branch to a bb.
    /// Pure: returns the set of targets to mark, without mutating
    /// anything, so the change-linking lock never needs to be recursive.
    fn find_new_trace_heads(
        &self,
        table: &CodeCacheInner,
        candidates: &[CandidateEdge],
    ) -> std::collections::HashSet<FragmentId> {
        let mut heads = std::collections::HashSet::new();
        for edge in candidates {
            let Some(from) = table.fragments.get(edge.from).and_then(FragmentSlot::as_real) else {
                continue;
            };
            let Some(to) = table.fragments.get(edge.to).and_then(FragmentSlot::as_real) else {
                continue;
            };
            if to.flags.contains(FragmentFlags::IS_TRACE) || to.flags.contains(FragmentFlags::IS_TRACE_HEAD) {
                continue;
            }
            let source_is_trace = from.flags.contains(FragmentFlags::IS_TRACE);
            let is_backward_branch = from.tag > to.tag;
            if source_is_trace || is_backward_branch {
                heads.insert(edge.to);
            }
        }
        heads
    }

    /// Mark each fragment in `heads` as a trace head and unlink its
    /// incoming edges, all under the write guard the caller already holds
    /// (spec §9, "Recursive locks").
    fn apply_trace_head_marks(&self, table: &mut CodeCacheInner, heads: &std::collections::HashSet<FragmentId>) {
        for &head in heads {
            let incoming = table
                .fragments
                .get(head)
                .map(|slot| slot.incoming().to_vec())
                .unwrap_or_default();
            for stub_id in incoming {
                self.unlink_edge_locked(table, stub_id);
            }
            if let Some(FragmentSlot::Real(f)) = table.fragments.get_mut(head) {
                f.flags.insert(FragmentFlags::IS_TRACE_HEAD);
                f.flags.remove(FragmentFlags::LINKED_INCOMING);
            }
            self.stats.trace_heads_marked.inc();
            debug!(fragment = ?head, "trace head marked");
        }
    }

    /// Patch `stub_id`'s cti to target `to`'s entry point directly, and
    /// record the edge (sets the stub's `LINKED` flag and appends to `to`'s
    /// incoming list).
    fn link_edge_locked(&self, table: &mut CodeCacheInner, stub_id: LinkStubId, to: FragmentId) {
        self.link_edge_locked_no_record(table, stub_id, to);
        if let Some(slot) = table.fragments.get_mut(to) {
            slot.incoming_mut().push(stub_id);
        }
        self.refresh_incoming_flag(table, to);
    }

    /// Like [`Self::link_edge_locked`] but does not touch `to`'s incoming
    /// list — used by `shift_links_to_new_fragment`, which moves the whole
    /// incoming list over as a unit instead of appending one at a time.
    fn link_edge_locked_no_record(&self, table: &mut CodeCacheInner, stub_id: LinkStubId, to: FragmentId) {
        let (Some(cti_pc), Some(target_pc)) = (table.cti_pc(stub_id), table.entry_pc(to)) else {
            return;
        };
        let owner = table.stubs.get(stub_id).map(|s| s.owner);
        // SAFETY: `cti_pc` is derived from a live stub's owning fragment in
        // this cache's backing storage; the caller holds the fragment-table
        // write lock for the duration of this patch.
        unsafe {
            self.platform.patch_branch(cti_pc, target_pc as *const u8, false);
        }
        if let Some(stub) = table.stubs.get_mut(stub_id) {
            stub.flags.insert(LinkStubFlags::LINKED);
        }
        if let Some(owner) = owner {
            self.refresh_outgoing_flag(table, owner);
        }
    }

    /// Set `LINKED_OUTGOING` on `owner` if every one of its exits is
    /// currently patched direct. These flags (spec §3) describe the
    /// resulting link state rather than gating whether a link attempt is
    /// allowed, so they are recomputed here rather than consulted by
    /// [`Self::is_linkable`].
    fn refresh_outgoing_flag(&self, table: &mut CodeCacheInner, owner: FragmentId) {
        let all_linked = table
            .fragments
            .get(owner)
            .and_then(FragmentSlot::as_real)
            .is_some_and(|f| f.exits.iter().all(|&e| table.stubs.get(e).is_some_and(LinkStub::is_linked)));
        if all_linked && let Some(FragmentSlot::Real(f)) = table.fragments.get_mut(owner) {
            f.flags.insert(FragmentFlags::LINKED_OUTGOING);
        }
    }

    /// Set `LINKED_INCOMING` on `id` if every stub in its incoming list is
    /// currently patched direct.
    fn refresh_incoming_flag(&self, table: &mut CodeCacheInner, id: FragmentId) {
        let all_linked = table
            .fragments
            .get(id)
            .is_some_and(|slot| slot.incoming().iter().all(|&e| table.stubs.get(e).is_some_and(LinkStub::is_linked)));
        if all_linked && let Some(FragmentSlot::Real(f)) = table.fragments.get_mut(id) {
            f.flags.insert(FragmentFlags::LINKED_INCOMING);
        }
    }

    fn unlink_edge_locked(&self, table: &mut CodeCacheInner, stub_id: LinkStubId) {
        let Some(stub) = table.stubs.get(stub_id) else {
            return;
        };
        if !stub.is_linked() {
            return;
        }
        let Some(unlinked_target) = self.stub_unlinked_target(table, stub_id) else {
            return;
        };
        let Some(cti_pc) = table.cti_pc(stub_id) else {
            return;
        };
        // SAFETY: as in `link_edge_locked_no_record`.
        unsafe {
            self.platform.patch_branch(cti_pc, unlinked_target, false);
        }
        if let Some(stub) = table.stubs.get_mut(stub_id) {
            stub.flags.remove(LinkStubFlags::LINKED);
        }
        self.stats.links_broken.inc();
    }

    /// Absolute address of `stub_id`'s own out-of-line or inline stub body —
    /// the cti's target whenever the edge is *not* directly linked.
    fn stub_unlinked_target(&self, table: &CodeCacheInner, stub_id: LinkStubId) -> Option<*const u8> {
        let stub = table.stubs.get(stub_id)?;
        match stub.stub? {
            StubLocation::Inline { offset } => {
                // SAFETY: `offset` was computed as an absolute cache offset
                // by the emitter, within this cache's backing allocation.
                Some(unsafe { table.base_ptr().add(offset) })
            }
            StubLocation::Separate { pc, pair } => {
                let base = if pair.is_some() {
                    self.stub_alloc.pairs_ptr()
                } else {
                    self.stub_alloc.singles_ptr()
                };
                // SAFETY: `pc` was returned by the same allocator's
                // `alloc`/`calloc_pair` and is within its backing buffer.
                Some(unsafe { base.add(pc) })
            }
        }
    }
}

fn remove_from_every_incoming(table: &mut CodeCacheInner, stub_id: LinkStubId) {
    for (_, slot) in table.fragments.iter_mut() {
        slot.incoming_mut().retain(|&id| id != stub_id);
    }
}
