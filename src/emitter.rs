// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The emitter (spec §4.C): lays out a decoded ilist into the code cache in
//! three passes and hands the result to the linker. Emission holds the
//! change-linking lock across any step that touches the shared fragment
//! table or a shared incoming list, matching spec §5's lock-ordering table.

use tracing::trace;

use crate::cache::CodeCache;
use crate::error::CacheError;
use crate::fragment::{CacheSlice, ExitIndex, Fragment, FragmentFlags, FragmentId, FragmentSlot, Sharing, Tag};
use crate::linkstub::{LinkStub, LinkStubFlags, LinkStubId, LinkStubKind, StubLocation};
use crate::platform::{ExitKind, Ilist};

/// Distinguishes `emit`, `emit_invisible` and `emit_as_replacement` (spec
/// §4.C public contract) at the point where a freshly laid-out Fragment is
/// published into the tag lookup tables.
enum Publish {
    /// `emit_invisible`: lay out only, never add to the lookup tables.
    Invisible,
    /// `emit`: lay out, add to the lookup tables, link if requested.
    Visible { link: bool },
    /// `emit_as_replacement`: lay out, publish, then atomically shift
    /// `old`'s incoming edges onto the new Fragment.
    Replacement { old: FragmentId },
}

/// One exit's planned stub kind and allocation, fixed during pass 2 and
/// consumed by pass 3.
struct ExitPlan {
    cti_offset: usize,
    kind: LinkStubKind,
    location: StubLocation,
}

impl CodeCache {
    /// `emit(tag, ilist, flags, link) -> Fragment` (spec §4.C).
    pub fn emit(
        &self,
        tag: Tag,
        sharing: Sharing,
        ilist: &Ilist,
        flags: FragmentFlags,
        link: bool,
    ) -> Result<FragmentId, CacheError> {
        self.emit_inner(tag, sharing, ilist, flags, Publish::Visible { link })
    }

    /// `emit_invisible(tag, ilist, flags) -> Fragment` (spec §4.C). Used by
    /// the sideline worker to build a replacement off to the side before
    /// the linker atomically swaps it in.
    pub fn emit_invisible(
        &self,
        tag: Tag,
        sharing: Sharing,
        ilist: &Ilist,
        flags: FragmentFlags,
    ) -> Result<FragmentId, CacheError> {
        self.emit_inner(tag, sharing, ilist, flags, Publish::Invisible)
    }

    /// `emit_as_replacement(tag, ilist, flags, old) -> Fragment` (spec
    /// §4.C): lay out and atomically shift `old`'s incoming edges to the
    /// new Fragment (sideline swap-in, §4.F step 4e; trace shadowing a
    /// head, §4.E step 5).
    pub fn emit_as_replacement(
        &self,
        tag: Tag,
        sharing: Sharing,
        ilist: &Ilist,
        flags: FragmentFlags,
        old: FragmentId,
    ) -> Result<FragmentId, CacheError> {
        self.emit_inner(tag, sharing, ilist, flags, Publish::Replacement { old })
    }

    fn emit_inner(
        &self,
        tag: Tag,
        sharing: Sharing,
        ilist: &Ilist,
        flags: FragmentFlags,
        publish: Publish,
    ) -> Result<FragmentId, CacheError> {
        // Pass 1: size & exit count. `cti_offset` is a prefix sum over
        // encoded instruction lengths; a conditional branch additionally
        // reserves an implicit fallthrough exit right after it.
        let mut body_len = 0usize;
        let mut offsets = Vec::with_capacity(ilist.len());
        let mut raw_exits: Vec<(usize, ExitKind)> = Vec::new();
        for instr in ilist {
            offsets.push(body_len);
            if let Some(kind) = instr.exit {
                raw_exits.push((body_len, kind));
            }
            body_len += usize::from(instr.encoded_len);
        }

        let max_trace_bytes = self
            .config
            .cache_capacity_bytes
            .saturating_mul(usize::from(self.config.max_trace_cache_fraction_pct))
            / 100;
        if flags.contains(FragmentFlags::IS_TRACE) && body_len > max_trace_bytes {
            return Err(CacheError::TraceTooLarge {
                instrs: u32::try_from(ilist.len()).unwrap_or(u32::MAX),
            });
        }

        // Pass 2: LinkStub field assignment, including the cbr-shared-stub
        // pairing policy (spec §4.C design decision: "the cbr+fallthrough
        // pair may share one stub when all conditions hold (configurable)").
        let mut plans: Vec<ExitPlan> = Vec::with_capacity(raw_exits.len());
        let mut i = 0;
        while i < raw_exits.len() {
            let (cti_offset, kind) = raw_exits[i];
            match kind {
                ExitKind::Direct(target_tag) => {
                    let location = self.alloc_stub_location();
                    plans.push(ExitPlan {
                        cti_offset,
                        kind: LinkStubKind::Direct { target_tag },
                        location,
                    });
                    i += 1;
                }
                ExitKind::Indirect => {
                    let location = self.alloc_stub_location();
                    plans.push(ExitPlan {
                        cti_offset,
                        kind: LinkStubKind::Indirect,
                        location,
                    });
                    i += 1;
                }
                ExitKind::ConditionalBranch { taken } => {
                    // The implicit fallthrough target is the next
                    // instruction's tag, which the caller encodes as the
                    // application address immediately after this cti.
                    let fallthrough_tag = tag.wrapping_add(u64::try_from(cti_offset).unwrap_or(0));
                    if self.config.cbr_shared_stub {
                        let (pair, pc0, pc1) = self.stub_alloc.calloc_pair();
                        plans.push(ExitPlan {
                            cti_offset,
                            kind: LinkStubKind::Direct { target_tag: taken },
                            location: StubLocation::Separate {
                                pc: pc0,
                                pair: Some(pair),
                            },
                        });
                        plans.push(ExitPlan {
                            cti_offset,
                            kind: LinkStubKind::CbrFallthrough {
                                target_tag: fallthrough_tag,
                                pair: Some(pair),
                            },
                            location: StubLocation::Separate {
                                pc: pc1,
                                pair: Some(pair),
                            },
                        });
                    } else {
                        let taken_loc = self.alloc_stub_location();
                        plans.push(ExitPlan {
                            cti_offset,
                            kind: LinkStubKind::Direct { target_tag: taken },
                            location: taken_loc,
                        });
                        let fallthrough_loc = self.alloc_stub_location();
                        plans.push(ExitPlan {
                            cti_offset,
                            kind: LinkStubKind::CbrFallthrough {
                                target_tag: fallthrough_tag,
                                pair: None,
                            },
                            location: fallthrough_loc,
                        });
                    }
                    i += 1;
                }
            }
        }

        // Inline stub trampolines (when policy requests them) are laid out
        // after the body, one `stub_block_size` slot per exit using one.
        let stub_block = self.stub_alloc.block_size();
        let mut total_len = body_len;
        let mut inline_slots = vec![None; plans.len()];
        if self.config.inline_stub_bodies {
            for (idx, plan) in plans.iter().enumerate() {
                if matches!(plan.location, StubLocation::Separate { .. }) {
                    continue;
                }
                inline_slots[idx] = Some(total_len);
                total_len += stub_block;
            }
        }

        let mut writable = self.begin_write();
        let offset = writable.alloc(total_len)?;
        let fragment_id = writable.inner_mut().fragments.next_key();

        let mut exits: Vec<LinkStubId> = Vec::with_capacity(plans.len());
        for (idx, plan) in plans.into_iter().enumerate() {
            let location = match inline_slots[idx] {
                Some(rel_offset) => StubLocation::Inline {
                    offset: offset + rel_offset,
                },
                None => plan.location,
            };
            let mut stub_flags = LinkStubFlags::empty();
            if matches!(location, StubLocation::Separate { .. }) {
                stub_flags |= LinkStubFlags::SEPARATE_STUB;
            }
            let stub_id = writable.inner_mut().stubs.push(LinkStub {
                owner: fragment_id,
                kind: plan.kind,
                cti_offset: plan.cti_offset,
                flags: stub_flags,
                stub: Some(location),
            });
            exits.push(stub_id);
        }

        // Pass 3: encode. Each instruction is encoded into its reserved
        // slot; the per-exit stub bodies were reserved above but their
        // contents (the unlinked-ibl trampoline or the direct-exit
        // recovery stub) are ISA-specific and out of this crate's scope —
        // only the cti patch that routes execution to them is ours to do.
        let mut scratch = [0u8; 16];
        for (instr, &rel_offset) in ilist.iter().zip(offsets.iter()) {
            let want = usize::from(instr.encoded_len);
            let written = self.isa.encode_instr(instr, &mut scratch[..want.max(1)]);
            debug_assert!(written <= want, "encoder overran its reserved slot");
            writable.write_bytes(offset + rel_offset, &scratch[..want]);
        }

        trace!(tag, fragment = ?fragment_id, len = total_len, exits = exits.len(), "fragment emitted");

        // Absorb the incoming list of a Future placeholder already
        // registered under this tag, if any (spec §4.D: "attach incoming
        // edges that were held by a Future with the same tag"). The
        // Future's own arena slot is left in place but orphaned once its
        // tag entry is overwritten below.
        let absorbed_incoming = match publish {
            Publish::Invisible => Vec::new(),
            Publish::Visible { .. } | Publish::Replacement { .. } => {
                let inner = writable.inner_mut();
                match inner.lookup_tag(sharing, tag).and_then(|id| inner.fragments.get_mut(id)) {
                    Some(FragmentSlot::Future(future)) => std::mem::take(&mut future.incoming),
                    _ => Vec::new(),
                }
            }
        };

        // Those absorbed stubs were accepted as `incoming` on the strength
        // of targeting this tag, but their cti bytes still point at the
        // Future's stub path — patch them at the new fragment's entry now,
        // the same way `shift_links_to_new_fragment` re-patches a moved
        // incoming list, so Testable Property 1 ("e is linked to the
        // unique Fragment with tag t ... and that Fragment's incoming list
        // contains e") holds as soon as this fragment is published rather
        // than only after some later, unrelated `link_new_fragment` call.
        let new_entry_pc = writable.base_ptr() as usize + offset;
        for &stub_id in &absorbed_incoming {
            let inner = writable.inner_mut();
            if let Some(cti_pc) = inner.cti_pc(stub_id) {
                // SAFETY: `cti_pc` is derived from a live stub's owning
                // fragment in this cache's backing storage; `writable`
                // holds the fragment-table write lock for the duration.
                unsafe {
                    self.platform.patch_branch(cti_pc, new_entry_pc as *const u8, false);
                }
            }
            if let Some(stub) = inner.stubs.get_mut(stub_id) {
                stub.flags.insert(LinkStubFlags::LINKED);
            }
        }

        // A freshly emitted Fragment starts out vacuously linked in both
        // directions: it has no incoming edges yet and every outgoing edge
        // still targets a stub, not a direct patch, so both invariants
        // (spec §3, "linked-incoming ⇔ ...", "linked-outgoing ⇔ ...") hold
        // trivially until the linker below does real work.
        let flags = flags | FragmentFlags::LINKED_INCOMING | FragmentFlags::LINKED_OUTGOING;

        let fragment = Fragment {
            tag,
            sharing,
            flags,
            isa_mode: 0,
            code: CacheSlice {
                offset,
                len: total_len,
            },
            exits,
            incoming: absorbed_incoming,
        };

        let pushed_id = writable.inner_mut().fragments.push(FragmentSlot::Real(fragment));
        debug_assert_eq!(pushed_id, fragment_id, "next_key reservation must match push result");
        self.stats.fragments_emitted.inc();

        match publish {
            Publish::Invisible => {
                drop(writable);
            }
            Publish::Visible { link } => {
                writable.inner_mut().insert_tag(sharing, tag, pushed_id);
                drop(writable);
                if link {
                    self.link_new_fragment(pushed_id);
                }
            }
            Publish::Replacement { old } => {
                writable.inner_mut().insert_tag(sharing, tag, pushed_id);
                drop(writable);
                self.shift_links_to_new_fragment(old, pushed_id);
            }
        }

        Ok(pushed_id)
    }

    /// Allocate an out-of-line stub slot for a single (non-paired) exit,
    /// or a placeholder when inline trampolines are in effect (the real
    /// slot is assigned once the body's total length is known).
    fn alloc_stub_location(&self) -> StubLocation {
        if self.config.inline_stub_bodies {
            StubLocation::Inline { offset: 0 }
        } else {
            StubLocation::Separate {
                pc: self.stub_alloc.alloc(),
                pair: None,
            }
        }
    }
}

/// Which exit of a Fragment a given `LinkStubId` corresponds to (spec §3,
/// `LastExit::Fragment(id, exit_index)`).
#[must_use]
pub fn exit_index_of(fragment: &Fragment, target: LinkStubId) -> Option<ExitIndex> {
    fragment
        .exits
        .iter()
        .position(|&id| id == target)
        .and_then(|i| ExitIndex::try_from(i).ok())
}
