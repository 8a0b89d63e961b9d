// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Counters incremented at the "production hard `return false`" branches
//! spec §7 describes for invariant-violation guards, plus a handful of
//! throughput counters useful for observing the six components. Formatting
//! these for display is out of scope (spec §1) — callers read the atomics
//! directly.

use core::sync::atomic::{AtomicU64, Ordering};

/// A single named counter, incremented with `Ordering::Relaxed` since these
/// are purely observational.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Process-wide counters for the code-cache core.
#[derive(Debug, Default)]
pub struct Stats {
    pub fragments_emitted: Counter,
    pub fragments_deleted: Counter,
    pub links_established: Counter,
    pub links_broken: Counter,
    pub cross_sharing_link_rejected: Counter,
    pub trace_heads_marked: Counter,
    pub traces_built: Counter,
    pub traces_aborted: Counter,
    pub sideline_cycles: Counter,
    pub sideline_swaps: Counter,
}
