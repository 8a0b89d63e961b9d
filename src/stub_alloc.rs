// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The separate stub allocator (spec §4.B): a process-wide slab of
//! fixed-size, executable, out-of-line exit-stub blocks. Singles and
//! cbr/fallthrough pairs are tracked in two independent `wasmtime_slab`
//! regions so that a pair's two blocks are always contiguous, and so a
//! double free of either kind panics inside the slab rather than silently
//! corrupting the free list.

use parking_lot::Mutex;
use wasmtime_slab::{Id, Slab};

use crate::error::CacheError;
use crate::linkstub::StubPairId;

/// A fixed-capacity backing buffer plus the slab tracking which blocks of
/// it are live. The buffer is sized once at construction and never grows:
/// a cti patched to target a block's address must stay valid for as long
/// as the block is live, so the backing storage can never relocate the way
/// a growable `Vec` would on reallocation: a single fixed-size mapping
/// carved into blocks, never remapped or moved.
struct Region {
    bytes: Box<[u8]>,
    slab: Slab<()>,
    block_size: usize,
}

impl Region {
    fn new(block_size: usize, capacity_blocks: usize) -> Self {
        Self {
            bytes: vec![0u8; block_size * capacity_blocks.max(1)].into_boxed_slice(),
            slab: Slab::new(),
            block_size,
        }
    }

    fn capacity_blocks(&self) -> usize {
        self.bytes.len() / self.block_size
    }

    fn alloc_block(&mut self) -> Result<(usize, Id), CacheError> {
        if self.slab.len() >= self.capacity_blocks() {
            return Err(CacheError::StubSlabFull);
        }
        let id = self.slab.alloc(());
        let index = usize::try_from(id.into_raw()).expect("slab index fits usize");
        Ok((index * self.block_size, id))
    }

    /// Panics (via the slab's internal bookkeeping) on a double free.
    fn free_block(&mut self, id: Id) {
        self.slab.dealloc(id);
    }

    fn base_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }

    fn index_of(&self, offset: usize) -> Id {
        Id::from_raw(u32::try_from(offset / self.block_size).expect("offset fits u32"))
    }
}

/// A process-wide, thread-safe slab allocator for out-of-line exit stubs.
/// Blocks are *not* padded to a 16-byte alignment — stubs are cold, so the
/// byte is not worth spending.
pub struct StubAllocator {
    block_size: usize,
    singles: Mutex<Region>,
    /// Each pair slot is two contiguous `block_size` blocks.
    pairs: Mutex<Region>,
    /// When set, every allocated block's last 4 bytes (the hot-patch
    /// window) must not straddle a cache line — required for frozen
    /// coarse-unit entrance stubs (spec §3, "Coarse unit"; §6 "the 4-byte
    /// patch window position...chosen to not straddle a 16-byte line").
    cache_line: Option<usize>,
}

impl StubAllocator {
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self::with_capacity(block_size, 4096, 1024)
    }

    #[must_use]
    pub fn with_capacity(block_size: usize, max_singles: usize, max_pairs: usize) -> Self {
        Self {
            block_size,
            singles: Mutex::new(Region::new(block_size, max_singles)),
            pairs: Mutex::new(Region::new(block_size * 2, max_pairs)),
            cache_line: None,
        }
    }

    /// A stricter allocator for coarse-unit entrance stubs: every block is
    /// sized so its trailing 4-byte hot-patch window never crosses a
    /// `cache_line`-byte boundary.
    #[must_use]
    pub fn with_cache_line(block_size: usize, cache_line: usize, max_singles: usize, max_pairs: usize) -> Self {
        let padded = Self::pad_for_patch_window(block_size, cache_line);
        Self {
            block_size: padded,
            singles: Mutex::new(Region::new(padded, max_singles)),
            pairs: Mutex::new(Region::new(padded * 2, max_pairs)),
            cache_line: Some(cache_line),
        }
    }

    fn pad_for_patch_window(block_size: usize, cache_line: usize) -> usize {
        let mut size = block_size;
        while (size - 4) / cache_line != (size - 1) / cache_line {
            size += 1;
        }
        size
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// `alloc() -> stub_pc` (spec §4.B). Returns an offset into the
    /// singles region; resolve to an absolute address with
    /// [`Self::singles_ptr`].
    pub fn alloc(&self) -> usize {
        self.alloc_bounded(usize::MAX).expect("unbounded alloc cannot fail")
    }

    /// `calloc(2) -> two contiguous stubs` (spec §4.B; used to pair a cbr
    /// with its fallthrough).
    pub fn calloc_pair(&self) -> (StubPairId, usize, usize) {
        let mut region = self.pairs.lock();
        let (base, id) = region.alloc_block().expect("separate-stub pair slab exhausted");
        let pc0 = base;
        let pc1 = base + self.block_size;
        self.assert_patch_window(pc0);
        self.assert_patch_window(pc1);
        (id, pc0, pc1)
    }

    /// `free(pc)` (spec §4.B).
    pub fn free(&self, pc: usize) {
        let mut region = self.singles.lock();
        let id = region.index_of(pc);
        region.free_block(id);
    }

    /// `free_pair(pc)` (spec §4.B; Testable Property 6). Takes the id
    /// returned by `calloc_pair`, not a raw address — a second call with
    /// the same id panics instead of double-freeing silently.
    pub fn free_pair(&self, id: StubPairId) {
        self.pairs.lock().free_block(id);
    }

    /// Absolute base address of the singles region's backing storage —
    /// stable for the allocator's lifetime (spec §4.B; see [`Region`]).
    pub fn singles_ptr(&self) -> *const u8 {
        self.singles.lock().base_ptr()
    }

    /// Absolute base address of the pairs region's backing storage.
    pub fn pairs_ptr(&self) -> *const u8 {
        self.pairs.lock().base_ptr()
    }

    fn assert_patch_window(&self, block_offset: usize) {
        if let Some(cache_line) = self.cache_line {
            let window_start = block_offset + self.block_size - 4;
            let window_end = block_offset + self.block_size - 1;
            debug_assert_eq!(
                window_start / cache_line,
                window_end / cache_line,
                "hot-patch window straddles a cache line"
            );
        }
    }

    /// Resource-exhaustion hook for callers that want to refuse up front
    /// rather than hit the slab's hard capacity (spec §7, "Resource
    /// exhaustion": "handled locally by refusing the operation").
    pub fn alloc_bounded(&self, max_blocks: usize) -> Result<usize, CacheError> {
        let mut region = self.singles.lock();
        if region.slab.len() >= max_blocks {
            return Err(CacheError::StubSlabFull);
        }
        let (offset, _id) = region.alloc_block()?;
        self.assert_patch_window(offset);
        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_reuse() {
        let alloc = StubAllocator::new(64);
        let a = alloc.alloc();
        let b = alloc.alloc();
        assert_ne!(a, b);
        alloc.free(a);
        let c = alloc.alloc();
        assert_eq!(a, c, "freed block should be reused");
    }

    #[test]
    fn calloc_pair_is_contiguous_and_frees_as_a_unit() {
        let alloc = StubAllocator::new(32);
        let (pair, pc0, pc1) = alloc.calloc_pair();
        assert_eq!(pc1, pc0 + 32);
        alloc.free_pair(pair);
        let (pair2, pc0b, _pc1b) = alloc.calloc_pair();
        assert_eq!(pc0, pc0b, "freed pair slot should be reused");
        alloc.free_pair(pair2);
    }

    #[test]
    #[should_panic(expected = "already vacant")]
    fn double_free_pair_panics() {
        let alloc = StubAllocator::new(32);
        let (pair, _, _) = alloc.calloc_pair();
        alloc.free_pair(pair);
        alloc.free_pair(pair);
    }

    #[test]
    fn cache_line_patch_window_never_straddles() {
        let alloc = StubAllocator::with_cache_line(60, 64, 64, 16);
        for _ in 0..8 {
            let pc = alloc.alloc();
            let start = pc + alloc.block_size() - 4;
            let end = pc + alloc.block_size() - 1;
            assert_eq!(start / 64, end / 64);
        }
    }

    #[test]
    fn exhausted_slab_refuses_rather_than_growing() {
        let alloc = StubAllocator::with_capacity(16, 2, 1);
        alloc.alloc();
        alloc.alloc();
        assert_eq!(alloc.alloc_bounded(usize::MAX), Err(CacheError::StubSlabFull));
    }

    #[test]
    fn addresses_are_stable_across_further_allocation() {
        let alloc = StubAllocator::new(32);
        let a = alloc.alloc();
        let base_before = alloc.singles_ptr();
        for _ in 0..100 {
            alloc.alloc();
        }
        let base_after = alloc.singles_ptr();
        assert_eq!(base_before, base_after, "backing storage must never relocate");
        let _ = a;
    }
}
