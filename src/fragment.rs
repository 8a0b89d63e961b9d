// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The Fragment data model (spec §3). A `Fragment` is identified by a
//! stable arena index (`FragmentId`) rather than a raw cache pointer,
//! replacing pointer-arithmetic owner recovery with an entity lookup
//! (§4.A).

use std::thread::ThreadId;

use bitflags::bitflags;
use cranelift_entity::entity_impl;

use crate::linkstub::LinkStubId;

/// Sharing-class key a tag is looked up under (spec §3 Invariant 1: "a tag
/// has at most one live Fragment in each sharing class").
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Sharing {
    Shared,
    Private(ThreadId),
}

/// The application instruction address a Fragment or LinkStub is keyed by.
pub type Tag = u64;

/// Index of an exit within a Fragment's `exits` list.
pub type ExitIndex = u32;

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragmentId(u32);
entity_impl!(FragmentId, "fragment");

bitflags! {
    /// Per-Fragment flags (spec §3, "Fragment"). Bits are split into
    /// "stable" attributes set at emission time and "link state" bits the
    /// linker flips under the change-linking lock.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct FragmentFlags: u32 {
        /// Fragment is in the shared (cross-thread) sharing class; unset
        /// means private-per-thread.
        const SHARED              = 1 << 0;
        /// Fragment was built by splicing together multiple basic blocks
        /// (spec: Trace), unset means a plain basic block.
        const IS_TRACE            = 1 << 1;
        /// Fragment has been promoted to a trace head (§4.D).
        const IS_TRACE_HEAD       = 1 << 2;
        /// Fragment belongs to a frozen coarse unit (§3, "Coarse unit").
        const COARSE_GRAIN        = 1 << 3;
        /// Every incoming edge's source cti targets this Fragment's entry.
        const LINKED_INCOMING     = 1 << 4;
        /// Every outgoing edge whose target is linkable is patched direct.
        const LINKED_OUTGOING     = 1 << 5;
        /// Fragment must never be deleted (e.g. currently executing).
        const CANNOT_DELETE       = 1 << 6;
        /// Fragment has been logically deleted; no thread may enter it, but
        /// it may still be referenced for translation recovery.
        const WAS_DELETED         = 1 << 7;
        /// Body writes condition-code/flags state (affects trace splicing).
        const WRITES_FLAGS        = 1 << 8;
        /// Body contains a system call exit.
        const HAS_SYSCALL         = 1 << 9;
        /// Fragment was translated in 32-bit mode.
        const IS_32_BIT           = 1 << 10;
        /// Fragment is sandboxed for self-modifying-code detection.
        const SELFMOD_SANDBOXED   = 1 << 11;
        /// Monitor has permanently ruled this Fragment out as trace material
        /// (e.g. it overflowed the size budget once already).
        const CANNOT_BE_TRACE     = 1 << 12;
        /// Sideline worker must never pick this Fragment (it is itself a
        /// freshly-emitted sideline replacement).
        const DO_NOT_SIDELINE     = 1 << 13;
    }
}

/// The allow-list of flags a [`crate::linker::FutureFragment`] may hand down
/// to the real Fragment that eventually replaces it (spec §9, Open
/// Questions — "FUTURE_FLAGS_ALLOWED" documented as policy rather than
/// inferred from a bitmask). Only sharing-class survives: a Future is
/// created in response to a typed, shared-vs-private link attempt, so its
/// `SHARED` bit is meaningful; every other bit is a property of the
/// translation that produces the real Fragment and must not leak across.
pub const FUTURE_FLAGS_ALLOWED: FragmentFlags = FragmentFlags::SHARED;

/// A contiguous byte range inside the code cache's backing allocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CacheSlice {
    pub offset: usize,
    pub len: usize,
}

/// The unit of translated code (spec §3, "Fragment").
#[derive(Debug)]
pub struct Fragment {
    pub tag: Tag,
    pub sharing: Sharing,
    pub flags: FragmentFlags,
    pub isa_mode: u8,
    pub code: CacheSlice,
    /// One LinkStub per exit, in program order.
    pub exits: Vec<LinkStubId>,
    /// LinkStubs of *other* Fragments whose direct exit targets this one
    /// (spec §3, "Incoming list").
    pub incoming: Vec<LinkStubId>,
}

impl Fragment {
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.flags.contains(FragmentFlags::SHARED)
    }

    #[must_use]
    pub fn is_linked_incoming(&self) -> bool {
        self.flags.contains(FragmentFlags::LINKED_INCOMING)
    }

    #[must_use]
    pub fn is_linked_outgoing(&self) -> bool {
        self.flags.contains(FragmentFlags::LINKED_OUTGOING)
    }

    #[must_use]
    pub fn entry_pc(&self) -> usize {
        self.code.offset
    }
}

/// A placeholder entity for a tag some Fragment wants to link to but which
/// has not been translated yet (spec §3, "Future fragment").
#[derive(Debug)]
pub struct FutureFragment {
    pub tag: Tag,
    pub sharing: Sharing,
    pub flags: FragmentFlags,
    pub incoming: Vec<LinkStubId>,
}

/// What a tag currently resolves to in the fragment table.
#[derive(Debug)]
pub enum FragmentSlot {
    Real(Fragment),
    Future(FutureFragment),
}

impl FragmentSlot {
    #[must_use]
    pub fn incoming(&self) -> &[LinkStubId] {
        match self {
            Self::Real(f) => &f.incoming,
            Self::Future(f) => &f.incoming,
        }
    }

    pub fn incoming_mut(&mut self) -> &mut Vec<LinkStubId> {
        match self {
            Self::Real(f) => &mut f.incoming,
            Self::Future(f) => &mut f.incoming,
        }
    }

    #[must_use]
    pub fn tag(&self) -> Tag {
        match self {
            Self::Real(f) => f.tag,
            Self::Future(f) => f.tag,
        }
    }

    #[must_use]
    pub fn sharing(&self) -> Sharing {
        match self {
            Self::Real(f) => f.sharing,
            Self::Future(f) => f.sharing,
        }
    }

    #[must_use]
    pub fn flags(&self) -> FragmentFlags {
        match self {
            Self::Real(f) => f.flags,
            Self::Future(f) => f.flags,
        }
    }

    #[must_use]
    pub fn as_real(&self) -> Option<&Fragment> {
        match self {
            Self::Real(f) => Some(f),
            Self::Future(_) => None,
        }
    }

    #[must_use]
    pub fn as_real_mut(&mut self) -> Option<&mut Fragment> {
        match self {
            Self::Real(f) => Some(f),
            Self::Future(_) => None,
        }
    }
}
