// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tunables for the fragment cache, linker, trace monitor and sideline
//! worker. No environment variables or CLI flags are read here — callers
//! wire up their own option parsing and hand the crate a `Config`.

/// Every numeric policy named across the core's components, collected in
/// one place so callers have a single knob surface.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of times a trace head must be entered before a trace build
    /// starts (§4.E).
    pub trace_head_threshold: u32,
    /// Sentinel counter value meaning "a trace was already built from this
    /// head" (§3, Trace head counter).
    pub trace_created_sentinel: u32,
    /// Counter value a trace head's entry is reset to after its trace is
    /// deleted, to avoid immediate re-promotion (§4.E, Counter policy).
    pub post_delete_counter_reset: u32,
    /// Hard cap on the number of instructions a trace may accumulate
    /// (§3, Monitor data; §4.E finalize condition).
    pub max_trace_size_instrs: u32,
    /// A trace may not consume more than this fraction of the cache,
    /// expressed as a percentage (1..=100).
    pub max_trace_cache_fraction_pct: u8,
    /// Hard cap on the number of constituent blocks in a trace.
    pub max_trace_blocks: u32,
    /// Size in bytes of one block in the separate-stub slab (§4.B).
    pub stub_block_size: usize,
    /// Upper bound on the number of single (non-paired) separate-stub
    /// blocks. The slab's backing storage is allocated once at this size
    /// so a cti ever patched to point into it stays valid for the life of
    /// the cache — growing the backing buffer would invalidate every
    /// previously patched target (§4.B, "process-wide slab allocator").
    pub max_separate_stub_blocks: usize,
    /// Upper bound on the number of cbr/fallthrough stub *pairs*.
    pub max_separate_stub_pairs: usize,
    /// Sideline worker: re-scan for a hot winner every N samples (§4.F).
    pub sideline_sample_interval: u32,
    /// Sideline worker: minimum sample count before a fragment is eligible
    /// to be chosen as the hottest entry (§4.F, step 3).
    pub sideline_hot_threshold: u32,
    /// Total size in bytes of the code cache's backing allocation.
    pub cache_capacity_bytes: usize,
    /// When a conditional branch's fallthrough exit can share one stub
    /// allocation with the taken-branch exit, do so (§4.C, "The cbr+
    /// fallthrough pair may share one stub when all conditions hold
    /// (configurable)").
    pub cbr_shared_stub: bool,
    /// Emit exit-stub trampolines inline after the fragment body instead of
    /// in the separate-stub allocator (§4.C, "`LINK_SEPARATE_STUB` as
    /// policy dictates").
    pub inline_stub_bodies: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trace_head_threshold: 50,
            trace_created_sentinel: 51,
            post_delete_counter_reset: 0,
            max_trace_size_instrs: 4096,
            max_trace_cache_fraction_pct: 5,
            max_trace_blocks: 32,
            stub_block_size: 64,
            max_separate_stub_blocks: 65536,
            max_separate_stub_pairs: 16384,
            sideline_sample_interval: 1024,
            sideline_hot_threshold: 100,
            cache_capacity_bytes: 64 * 1024 * 1024,
            cbr_shared_stub: true,
            inline_stub_bodies: false,
        }
    }
}
