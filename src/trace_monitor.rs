// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! One trace monitor per thread (spec §4.E): drives the `search` ⇄
//! `building` state machine that turns a hot trace head into a spliced
//! trace Fragment.

use std::thread;

use tracing::{debug, trace};

use crate::cache::CodeCache;
use crate::fragment::{FragmentFlags, FragmentId, Sharing, Tag};
use crate::platform::Ilist;

enum State {
    Search,
    Building(Building),
}

struct Building {
    trace_tag: Tag,
    sharing: Sharing,
    ilist: Ilist,
    /// The fragment whose outgoing links are currently unlinked so its
    /// exits bounce back into this monitor instead of continuing
    /// execution (spec §4.E, "unlink the seed's outgoing edges").
    last_fragment: FragmentId,
    /// Private copies emitted while extending the trace, torn down at
    /// finalize or abort (spec §4.E step "Delete the temporary private
    /// copy").
    private_copies: Vec<FragmentId>,
    block_count: u32,
    instr_count: u32,
}

/// Per-thread trace construction state (spec §4.E, "One instance per
/// thread").
pub struct TraceMonitor {
    state: State,
}

impl Default for TraceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self { state: State::Search }
    }

    #[must_use]
    pub fn is_building(&self) -> bool {
        matches!(self.state, State::Building(_))
    }

    /// `on_cache_enter(next_fragment)` (spec §4.E).
    pub fn on_cache_enter(&mut self, cache: &CodeCache, next: FragmentId) {
        let Some((tag, flags)) = cache.with_fragment(next, |f| (f.tag, f.flags)) else {
            // The dispatcher routed here via a stale Future or a deleted
            // fragment; either way there is nothing to drive the state
            // machine with.
            self.abort(cache);
            return;
        };

        if flags.contains(FragmentFlags::WAS_DELETED) {
            trace!(fragment = ?next, "trace monitor observed deleted fragment, aborting");
            self.abort(cache);
            return;
        }

        match &self.state {
            State::Search => {
                if !flags.contains(FragmentFlags::IS_TRACE_HEAD) {
                    return;
                }
                let count = cache.bump_trace_head_counter(next);
                if count >= cache.config().trace_head_threshold {
                    self.start_building(cache, next, tag);
                }
            }
            State::Building(_) => {
                self.extend_or_finalize(cache, next, flags);
            }
        }
    }

    /// `on_cache_exit()` (spec §4.E): restore the outgoing-link state of
    /// the in-flight block so normal execution is not perturbed across a
    /// potential trace-abort point.
    pub fn on_cache_exit(&self, cache: &CodeCache) {
        if let State::Building(building) = &self.state {
            cache.link_new_fragment(building.last_fragment);
        }
    }

    /// `abort()` (spec §4.E): throw away the partial trace, restore link
    /// state, delete private copies.
    pub fn abort(&mut self, cache: &CodeCache) {
        let State::Building(building) = std::mem::replace(&mut self.state, State::Search) else {
            return;
        };
        cache.link_new_fragment(building.last_fragment);
        for copy in building.private_copies {
            cache.delete_fragment(copy);
        }
        cache.unmark_trace_building(building.trace_tag);
        cache.stats.traces_aborted.inc();
        debug!(tag = building.trace_tag, "trace aborted");
    }

    fn start_building(&mut self, cache: &CodeCache, seed: FragmentId, tag: Tag) {
        let Some((flags, sharing)) = cache.with_fragment(seed, |f| (f.flags, f.sharing)) else {
            return;
        };
        let ilist = cache.isa_tables_decode(tag, flags);
        cache.unlink_outgoing(seed);
        cache.mark_trace_building(tag);
        let instr_count = u32::try_from(ilist.len()).unwrap_or(u32::MAX);
        self.state = State::Building(Building {
            trace_tag: tag,
            sharing,
            ilist,
            last_fragment: seed,
            private_copies: Vec::new(),
            block_count: 1,
            instr_count,
        });
        trace!(tag, "trace build started");
    }

    fn extend_or_finalize(&mut self, cache: &CodeCache, next: FragmentId, next_flags: FragmentFlags) {
        let State::Building(building) = &self.state else {
            return;
        };

        let estimated_bytes: usize = building.ilist.iter().map(|i| usize::from(i.encoded_len)).sum();
        let max_bytes = cache
            .config()
            .cache_capacity_bytes
            .saturating_mul(usize::from(cache.config().max_trace_cache_fraction_pct))
            / 100;

        let must_finalize = next_flags.contains(FragmentFlags::IS_TRACE)
            || next_flags.contains(FragmentFlags::IS_TRACE_HEAD)
            || next_flags.contains(FragmentFlags::CANNOT_BE_TRACE)
            || building.block_count >= cache.config().max_trace_blocks
            || building.instr_count >= cache.config().max_trace_size_instrs
            || estimated_bytes >= max_bytes;

        if must_finalize {
            self.finalize(cache);
            return;
        }

        let Some((next_tag, sharing)) = cache.with_fragment(next, |f| (f.tag, f.sharing)) else {
            self.abort(cache);
            return;
        };
        let mut copy_ilist = cache.isa_tables_decode(next_tag, next_flags);
        let copy_instr_count = u32::try_from(copy_ilist.len()).unwrap_or(u32::MAX);

        // A self-contained fragment for just this block, so re-mangling its
        // exits while extending the trace cannot disturb the original
        // (spec §4.E, "clone f as private copy").
        let Ok(private_copy) = cache.emit_invisible(
            next_tag,
            Sharing::Private(thread::current().id()),
            &copy_ilist,
            next_flags & !FragmentFlags::SHARED,
        ) else {
            self.abort(cache);
            return;
        };
        cache.unlink_outgoing(private_copy);

        let State::Building(building) = &mut self.state else {
            unreachable!("state checked above")
        };
        let _ = sharing;
        building.ilist.append(&mut copy_ilist);
        building.instr_count += copy_instr_count;
        building.block_count += 1;
        building.last_fragment = private_copy;
        building.private_copies.push(private_copy);
    }

    fn finalize(&mut self, cache: &CodeCache) {
        let State::Building(building) = std::mem::replace(&mut self.state, State::Search) else {
            return;
        };

        // Optional mangle-at-end / indirect-speculation passes (spec §4.E
        // finalization steps 1-2) require a client-tool hook this crate
        // does not model; skipped.

        for copy in &building.private_copies {
            cache.delete_fragment(*copy);
        }

        if matches!(building.sharing, Sharing::Shared) {
            let _trace_building = cache.trace_building_lock();
            if let Some(existing) = cache.lookup(building.sharing, building.trace_tag) {
                let already_built = cache
                    .with_fragment(existing, |f| f.flags.contains(FragmentFlags::IS_TRACE))
                    .unwrap_or(false);
                if already_built {
                    cache.unmark_trace_building(building.trace_tag);
                    cache.stats.traces_aborted.inc();
                    debug!(tag = building.trace_tag, "trace finalize lost the race, discarding");
                    return;
                }
            }
            self.emit_trace(cache, &building);
        } else {
            self.emit_trace(cache, &building);
        }
        cache.unmark_trace_building(building.trace_tag);
    }

    fn emit_trace(&self, cache: &CodeCache, building: &Building) {
        let Some(seed_id) = cache.lookup(building.sharing, building.trace_tag) else {
            return;
        };
        let flags = FragmentFlags::IS_TRACE
            | if matches!(building.sharing, Sharing::Shared) {
                FragmentFlags::SHARED
            } else {
                FragmentFlags::empty()
            };
        let Ok(new_trace) =
            cache.emit_as_replacement(building.trace_tag, building.sharing, &building.ilist, flags, seed_id)
        else {
            cache.stats.traces_aborted.inc();
            return;
        };
        cache.link_new_fragment(new_trace);
        cache.delete_fragment(seed_id);
        cache.mark_trace_created(seed_id);
        cache.stats.traces_built.inc();
        debug!(tag = building.trace_tag, fragment = ?new_trace, "trace finalized");
    }
}
