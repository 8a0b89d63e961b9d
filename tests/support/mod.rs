// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A test-double ISA: an in-memory "application image" tests register
//! blocks into, decoded back out by [`TestIsa::decode_fragment`] exactly
//! the way a real decoder would read application bytes at a tag.

use std::collections::HashMap;
use std::sync::Mutex;

use fragcache::platform::{Ilist, Instr, IsaTables};
use fragcache::{FragmentFlags, Tag};

#[derive(Default)]
pub struct TestIsa {
    blocks: Mutex<HashMap<Tag, Ilist>>,
}

impl TestIsa {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tag: Tag, ilist: Ilist) {
        self.blocks.lock().unwrap().insert(tag, ilist);
    }
}

impl IsaTables for TestIsa {
    fn decode_fragment(&self, tag: Tag, _flags: FragmentFlags) -> Ilist {
        self.blocks
            .lock()
            .unwrap()
            .get(&tag)
            .cloned()
            .unwrap_or_else(|| panic!("no block registered for tag {tag:#x}"))
    }

    fn encode_instr(&self, instr: &Instr, dst: &mut [u8]) -> usize {
        let len = usize::from(instr.encoded_len);
        dst[..len].fill(0x90);
        len
    }
}

/// One unconditional direct exit to `target`, encoded as a single 4-byte
/// instruction — enough to drive the emitter/linker without a real ISA.
pub fn direct_block(target: Tag) -> Ilist {
    vec![Instr {
        encoded_len: 4,
        exit: Some(fragcache::platform::ExitKind::Direct(target)),
    }]
}

/// A straight-line block with no exit cti at all.
pub fn plain_block() -> Ilist {
    vec![Instr {
        encoded_len: 4,
        exit: None,
    }]
}
