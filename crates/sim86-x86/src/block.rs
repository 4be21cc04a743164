//! `BlockKey` and the decoded-block shape shared by the cached interpreter and recompiler
//! (§3 "Block (cached-interpreter & recompiler)", GLOSSARY "BlockKey").

use crate::decoder::DecodedInstruction;

bitflags::bitflags! {
    /// The subset of CPU mode that changes how the *same bytes* decode, distinct from anything
    /// that only changes how they *execute*. Two CPUs at the same physical address but different
    /// `DecodeMode` must never share a cached block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DecodeMode: u8 {
        const PROTECTED      = 1 << 0;
        const OPERAND_SIZE_32 = 1 << 1;
        const ADDRESS_SIZE_32 = 1 << 2;
        const PAGING_ENABLED  = 1 << 3;
        const VIRTUAL_8086    = 1 << 4;
    }
}

/// Identifies a compiled/decoded straight-line code block: the physical address its first byte
/// was fetched from, the privilege level at decode time (self-modifying-code or ring-sensitive
/// instructions can otherwise alias two different blocks onto the same bytes), and the decode
/// mode bits above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub physical_address: u32,
    pub cpl: u8,
    pub mode: DecodeMode,
}

/// Lifecycle state of a cached/compiled block, mirroring the Bus's code-cache coupling: a write
/// to a `CodeCached` page flips every block covering it from `Valid` to `Flushed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDisposition {
    Valid,
    Flushed,
    /// Currently executing when an invalidation arrived; torn down once control returns to the
    /// dispatch loop (§4.6 "deferred-destroyed").
    Dirty,
}

pub struct Block {
    pub key: BlockKey,
    pub instructions: Vec<DecodedInstruction>,
    pub length_bytes: u32,
    pub disposition: BlockDisposition,
}

impl Block {
    pub fn new(key: BlockKey, instructions: Vec<DecodedInstruction>, length_bytes: u32) -> Self {
        Self {
            key,
            instructions,
            length_bytes,
            disposition: BlockDisposition::Valid,
        }
    }

    pub fn covers_page(&self, page_base: u32) -> bool {
        let page_end = page_base + crate::PAGE_SIZE;
        let block_end = self.physical_address_end();
        self.key.physical_address < page_end && block_end > page_base
    }

    fn physical_address_end(&self) -> u32 {
        self.key.physical_address + self.length_bytes
    }
}
