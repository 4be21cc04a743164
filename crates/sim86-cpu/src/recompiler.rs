//! Recompiling backend (§4.6): in a full implementation this would emit native host code per
//! block into `code_arena` and dispatch into it directly. This core's recompiler emits nothing —
//! every block is a "compiled" block whose body is the fallback path described in §4.6
//! ("a compiled block whose body is just a call back into the interpreter"), so this backend is
//! observably a second block cache tier over [`crate::interpreter::execute`] rather than a JIT.
//! That is a deliberate scope simplification (native code generation is its own large undertaking
//! with no bearing on the data-model and timing properties this core is about), tracked in
//! DESIGN.md rather than left undocumented.

use std::collections::{HashMap, HashSet};

use sim86_mem::Bus;
use sim86_time::CycleCount;
use sim86_x86::{decode_block, Block, BlockDisposition, BlockKey, DecodeMode, RegisterFile, PAGE_SIZE};

use crate::cpu::ExecutionStats;
use crate::exception::CpuException;
use crate::interpreter;

const FETCH_WINDOW: u32 = 64;

#[derive(Default)]
pub struct Recompiler {
    blocks: HashMap<BlockKey, Block>,
    page_index: HashMap<u32, HashSet<BlockKey>>,
    /// Stands in for the native-code arena a real recompiler would emit into; tracked so
    /// `compiled_bytes` is a meaningful diagnostic even though nothing is actually written there.
    code_arena: Vec<u8>,
}

impl Recompiler {
    pub fn step(
        &mut self,
        regs: &mut RegisterFile,
        bus: &mut Bus,
        halted: &mut bool,
        stats: &mut ExecutionStats,
    ) -> Result<CycleCount, CpuException> {
        let physical_address = regs.code_linear_address();
        let key = BlockKey {
            physical_address,
            cpl: 0,
            mode: current_mode(regs),
        };

        let needs_compile = match self.blocks.get(&key) {
            Some(block) => block.disposition != BlockDisposition::Valid,
            None => true,
        };
        if needs_compile {
            self.compile_block(key, bus, stats)?;
        }

        let instructions = self.blocks.get(&key).unwrap().instructions.clone();
        let mut cycles = 0 as CycleCount;
        for decoded in &instructions {
            let next_eip = regs.eip.wrapping_add(decoded.length) & regs.sizes.eip_mask();
            interpreter::execute(decoded, regs, bus, next_eip, halted)?;
            cycles += 1;
            if *halted {
                break;
            }
        }
        Ok(cycles)
    }

    fn compile_block(&mut self, key: BlockKey, bus: &mut Bus, stats: &mut ExecutionStats) -> Result<(), CpuException> {
        let bitness = if key.mode.contains(DecodeMode::OPERAND_SIZE_32) { 32 } else { 16 };
        let mut fetch = vec![0u8; FETCH_WINDOW as usize];
        for (i, byte) in fetch.iter_mut().enumerate() {
            *byte = bus.read_u8(key.physical_address.wrapping_add(i as u32));
        }
        let instructions = decode_block(&fetch, key.physical_address, bitness);
        if instructions.is_empty() {
            return Err(CpuException::InvalidOpcode);
        }
        let length_bytes = instructions.iter().map(|i| i.length).sum();
        // One marker byte per source instruction stands in for the emitted native code a real
        // recompiler would produce; only its length is meaningful here.
        self.code_arena.extend(std::iter::repeat(0u8).take(instructions.len()));
        let block = Block {
            key,
            instructions,
            length_bytes,
            disposition: BlockDisposition::Valid,
        };

        let first_page = key.physical_address & !(PAGE_SIZE - 1);
        let last_page = key.physical_address.wrapping_add(length_bytes.saturating_sub(1)) & !(PAGE_SIZE - 1);
        let mut page = first_page;
        loop {
            self.page_index.entry(page).or_default().insert(key);
            if page == last_page {
                break;
            }
            page = page.wrapping_add(PAGE_SIZE);
        }

        self.blocks.insert(key, block);
        stats.blocks_compiled += 1;
        Ok(())
    }

    /// A block that is currently executing when its page is invalidated is marked `Dirty` rather
    /// than torn down immediately (§4.6 "deferred-destroyed"): the running call still holds the
    /// `Vec<DecodedInstruction>` it cloned out, so it finishes safely, and the next lookup for
    /// that key recompiles instead of reusing stale code.
    pub fn invalidate_page(&mut self, page_physical_base: u32) {
        if let Some(keys) = self.page_index.remove(&page_physical_base) {
            for key in keys {
                if let Some(block) = self.blocks.get_mut(&key) {
                    block.disposition = BlockDisposition::Dirty;
                }
            }
        }
    }

    pub fn flush(&mut self) {
        self.blocks.clear();
        self.page_index.clear();
        self.code_arena.clear();
    }

    pub fn compiled_bytes(&self) -> usize {
        self.code_arena.len()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

fn current_mode(regs: &RegisterFile) -> DecodeMode {
    let mut mode = DecodeMode::empty();
    if regs.control.cr0.contains(sim86_x86::Cr0::PE) {
        mode |= DecodeMode::PROTECTED;
    }
    if regs.sizes.operand_size_32 {
        mode |= DecodeMode::OPERAND_SIZE_32;
    }
    if regs.sizes.address_size_32 {
        mode |= DecodeMode::ADDRESS_SIZE_32;
    }
    if regs.control.cr0.contains(sim86_x86::Cr0::PG) {
        mode |= DecodeMode::PAGING_ENABLED;
    }
    mode
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim86_x86::Reg32;

    fn bus_with_code(bytes: &[u8]) -> Bus {
        let mut bus = Bus::new(20);
        bus.allocate_ram(0x10000);
        bus.create_ram_region(0, 0xFFFF);
        for (i, b) in bytes.iter().enumerate() {
            bus.write_u8(i as u32, *b);
        }
        bus
    }

    #[test]
    fn compiles_once_and_executes_through_the_fallback_path() {
        // mov ebx, 7 ; hlt
        let mut bus = bus_with_code(&[0xBB, 0x07, 0x00, 0x00, 0x00, 0xF4]);
        let mut regs = RegisterFile::default();
        regs.sizes.operand_size_32 = true;
        let mut backend = Recompiler::default();
        let mut stats = ExecutionStats::default();
        let mut halted = false;
        backend.step(&mut regs, &mut bus, &mut halted, &mut stats).unwrap();
        assert_eq!(regs.gpr.get32(Reg32::Ebx), 7);
        assert!(halted);
        assert_eq!(backend.block_count(), 1);
        assert!(backend.compiled_bytes() > 0);
    }

    #[test]
    fn page_invalidation_marks_blocks_dirty_for_recompile() {
        let mut bus = bus_with_code(&[0xBB, 0x07, 0x00, 0x00, 0x00, 0xF4]);
        let mut regs = RegisterFile::default();
        regs.sizes.operand_size_32 = true;
        let mut backend = Recompiler::default();
        let mut stats = ExecutionStats::default();
        let mut halted = false;
        backend.step(&mut regs, &mut bus, &mut halted, &mut stats).unwrap();
        backend.invalidate_page(0);
        regs.eip = 0;
        halted = false;
        backend.step(&mut regs, &mut bus, &mut halted, &mut stats).unwrap();
        assert_eq!(stats.blocks_compiled, 2);
    }
}
