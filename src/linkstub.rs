// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The LinkStub registry (spec §4.A) and the `LastExit` sentinel variants
//! the dispatcher would use as a `last_exit` token. Spec §9 ("Fake/sentinel
//! stubs") asks for these to become a tagged union instead of fabricated
//! owner-less Fragments; `LastExit` below is exactly that union, and the
//! sentinel `LinkStub`s §4.A describes collapse into its unit variants.

use bitflags::bitflags;
use cranelift_entity::entity_impl;

use crate::error::StubError;
use crate::fragment::{ExitIndex, FragmentId, Tag};

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkStubId(u32);
entity_impl!(LinkStubId, "stub");

/// Identifies a cbr/fallthrough stub pair allocated together from the
/// separate-stub slab (§4.B, "`calloc(n)`... needed to pair a cbr with its
/// fallthrough"). This is the stub allocator's own slab id
/// ([`crate::stub_alloc::StubAllocator`] is backed by `wasmtime_slab`)
/// rather than a second arena in the code cache: giving both exits the
/// *same* `StubPairId` rather than two independent addresses is the
/// resolution to spec §9's open question about cbr-single-stub ownership —
/// "at most one owner per stub slab allocation" is true by construction,
/// since `free_pair` consumes the id once and a second free panics inside
/// the slab (Testable Property 6).
pub type StubPairId = wasmtime_slab::Id;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct LinkStubFlags: u8 {
        /// The owning cti currently targets the destination directly.
        const LINKED         = 1 << 0;
        /// Exit code lives in a separately-allocated out-of-line stub
        /// rather than inline after the Fragment body.
        const SEPARATE_STUB  = 1 << 1;
    }
}

/// Where a direct exit's out-of-line code, if any, lives.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StubLocation {
    /// Stub code was emitted inline right after the Fragment body.
    Inline { offset: usize },
    /// Stub code lives in the separate-stub allocator (§4.B).
    Separate { pc: usize, pair: Option<StubPairId> },
}

/// Per-exit metadata (spec §3, "LinkStub"; §4.A).
#[derive(Debug, Clone)]
pub struct LinkStub {
    pub owner: FragmentId,
    pub kind: LinkStubKind,
    /// Offset of the owning cti within the owning Fragment's code.
    pub cti_offset: usize,
    pub flags: LinkStubFlags,
    pub stub: Option<StubLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStubKind {
    /// A direct exit with a known target tag.
    Direct { target_tag: Tag },
    /// The fallthrough half of a conditional branch; shares a stub
    /// allocation (`pair`) with the cbr's taken-branch exit when policy
    /// allows it, or `None` when each exit has its own independent stub.
    CbrFallthrough { target_tag: Tag, pair: Option<StubPairId> },
    /// An indirect exit (target resolved at runtime via the ibl).
    Indirect,
    /// A fake stub standing in for a link from a frozen coarse unit.
    CoarseProxy { target_tag: Tag },
}

impl LinkStub {
    #[must_use]
    pub fn target_tag(&self) -> Option<Tag> {
        match &self.kind {
            LinkStubKind::Direct { target_tag }
            | LinkStubKind::CbrFallthrough { target_tag, .. }
            | LinkStubKind::CoarseProxy { target_tag } => Some(*target_tag),
            LinkStubKind::Indirect => None,
        }
    }

    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.flags.contains(LinkStubFlags::LINKED)
    }
}

/// Why a thread last left the code cache, handed to the dispatcher so it
/// knows what to do next (spec §9: replaces a fabricated sentinel
/// Fragment per reason with a proper tagged union).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LastExit {
    /// Took an unlinked exit of a real Fragment.
    Fragment(FragmentId, ExitIndex),
    Syscall,
    Asynch,
    SelfMod,
    NativeExec,
    Ibl(IblKind, IsTrace),
    Reset,
    Starting,
    Deleted,
    Client,
    HotPatch,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IblKind {
    Ret,
    Call,
    Jmp,
}

pub type IsTrace = bool;

/// Recover the owning Fragment of a stub, if it has one. Sentinel
/// `LastExit` values carry no Fragment and return `InvalidStub` (spec
/// §4.A, "Fails with `InvalidStub`...").
pub fn owning_fragment(last_exit: LastExit) -> Result<FragmentId, StubError> {
    match last_exit {
        LastExit::Fragment(id, _) => Ok(id),
        _ => Err(StubError::InvalidStub),
    }
}
