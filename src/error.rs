// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Error taxonomy (spec §7). Resource exhaustion, races and policy-imposed
//! unlinkability are *not* exceptions from the dispatcher's point of view —
//! they're reported as plain booleans or `Option`s by the functions that can
//! hit them. The types below cover only the cases that are genuinely
//! exceptional for a caller: a stub that has no recoverable owner, and the
//! local-refusal cases the emitter can hit before it ever touches the link
//! graph.

use thiserror::Error;

/// Errors from the LinkStub registry (§4.A).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StubError {
    /// `owning_fragment` was asked for a fake/sentinel stub that has no
    /// recoverable owner.
    #[error("stub has no recoverable owning fragment")]
    InvalidStub,
}

/// Resource-exhaustion errors the emitter and stub allocator can hit
/// locally (§7, "Resource exhaustion").
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The code cache has no room left for a fragment of the requested size.
    #[error("code cache is full, requested {requested} bytes, {available} available")]
    CacheFull {
        /// bytes requested by the emitter
        requested: usize,
        /// bytes actually free
        available: usize,
    },
    /// The separate-stub slab for this block size has no free blocks.
    #[error("separate-stub slab exhausted")]
    StubSlabFull,
    /// A candidate trace grew past `Config::max_trace_size_instrs` or the
    /// cache-fraction cap; the monitor must finalize it as a non-trace.
    #[error("trace exceeded size limit: {instrs} instructions")]
    TraceTooLarge {
        /// instructions accumulated so far
        instrs: u32,
    },
}
