// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! External collaborators (spec §1, §6). Instruction encode/decode, basic
//! block construction and OS primitives are out of scope for this crate —
//! they're consumed through the traits below. `native` provides a real,
//! testable default so the rest of the crate can be driven end-to-end
//! without a real ISA backend.

use std::thread::JoinHandle;

use crate::fragment::{FragmentFlags, Tag};

/// A single entry in a decoded or to-be-built instruction list. The crate
/// never interprets instruction bytes itself (spec §1 Non-goals); all it
/// needs from an `Instr` is its encoded length and, if it is an exit cti,
/// what kind of exit it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub encoded_len: u8,
    pub exit: Option<ExitKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Unconditional direct branch to a known tag.
    Direct(Tag),
    /// Branch to a runtime-computed target.
    Indirect,
    /// A conditional branch with a known taken-target; the block implicitly
    /// falls through to the next instruction's address when not taken.
    ConditionalBranch { taken: Tag },
}

pub type Ilist = Vec<Instr>;

/// The opaque per-ISA decode/encode capability (spec §1, §6).
pub trait IsaTables: Send + Sync {
    /// Decode the application bytes at `tag` into an ilist.
    fn decode_fragment(&self, tag: Tag, flags: FragmentFlags) -> Ilist;

    /// `encode_instr(instr, pc) -> pc'` (spec §6): encode one instruction
    /// into `dst`, returning the number of bytes written. The emitter
    /// guarantees `dst.len() >= instr.encoded_len as usize`.
    fn encode_instr(&self, instr: &Instr, dst: &mut [u8]) -> usize;
}

/// Basic-block construction from application bytes (spec §1 Non-goals;
/// consumed via `build_basic_block`).
pub trait BlockBuilder: Send + Sync {
    fn build_basic_block(&self, tag: Tag, flags: FragmentFlags) -> Ilist;
}

/// OS-specific primitives the core needs but does not implement itself
/// (spec §1 Non-goals; §6 "Platform primitives").
pub trait Platform: Send + Sync {
    /// Make the freshly-written `[start, end)` cache range observable to
    /// the instruction fetch path (spec §4.C, "calls `machine_cache_sync`").
    fn machine_cache_sync(&self, start: *const u8, end: *const u8);

    /// Atomically patch the branch at `cti_pc` to target `new_target`
    /// (spec §6, "the ISA-specific atomic cti patcher").
    ///
    /// # Safety
    /// `cti_pc` must point at a live, correctly-sized branch instruction
    /// inside a writable mapping of the code cache.
    unsafe fn patch_branch(&self, cti_pc: *mut u8, new_target: *const u8, hot_patchable: bool);

    /// Spawn the sideline worker thread at reduced priority with a private
    /// stack (spec §5, "one additional OS thread").
    fn spawn_thread(&self, name: &str, f: Box<dyn FnOnce() + Send>) -> JoinHandle<()>;
}

pub mod native {
    //! A real, host-backed default: `std::thread` for thread creation and
    //! `std::sync::atomic::fence` standing in for the ISA's instruction
    //! cache sync (cache coherency on the targets this crate is tested on
    //! is maintained by the hardware; this keeps the call site real rather
    //! than a no-op stub).

    use std::ptr;
    use std::sync::atomic::{Ordering, fence};
    use std::thread::JoinHandle;

    use super::Platform;

    #[derive(Debug, Default)]
    pub struct NativePlatform;

    impl Platform for NativePlatform {
        fn machine_cache_sync(&self, _start: *const u8, _end: *const u8) {
            fence(Ordering::SeqCst);
        }

        unsafe fn patch_branch(
            &self,
            cti_pc: *mut u8,
            new_target: *const u8,
            _hot_patchable: bool,
        ) {
            // SAFETY: forwarded from the caller's contract on `Platform::patch_branch`.
            unsafe {
                ptr::write_unaligned(cti_pc.cast::<usize>(), new_target as usize);
            }
            fence(Ordering::SeqCst);
        }

        fn spawn_thread(&self, name: &str, f: Box<dyn FnOnce() + Send>) -> JoinHandle<()> {
            std::thread::Builder::new()
                .name(name.to_string())
                .spawn(f)
                .expect("failed to spawn thread")
        }
    }
}
