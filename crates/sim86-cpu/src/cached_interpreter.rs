//! Block-caching interpreter (§4.5): decodes a straight-line run of instructions once per
//! `BlockKey`, then replays the already-decoded instructions on every subsequent hit instead of
//! re-running the decoder. A write that lands on a page a cached block was compiled from
//! invalidates every block indexed under that page (`invalidate_page`, wired up to
//! `Bus`'s code-invalidation callback by whoever owns the `Cpu`).

use std::collections::{HashMap, HashSet};

use sim86_mem::Bus;
use sim86_time::CycleCount;
use sim86_x86::{decode_block, Block, BlockDisposition, BlockKey, DecodeMode, RegisterFile, PAGE_SIZE};

use crate::cpu::ExecutionStats;
use crate::exception::CpuException;
use crate::interpreter;

/// How many bytes to fetch per compile attempt. Generous enough to cover the run of instructions
/// between two branches in the scenarios this core targets without repeated re-fetches.
const FETCH_WINDOW: u32 = 64;

#[derive(Default)]
pub struct CachedInterpreter {
    blocks: HashMap<BlockKey, Block>,
    page_index: HashMap<u32, HashSet<BlockKey>>,
    /// Which instruction of which block the next `step()` call resumes at, when the previous call
    /// left off mid-block. Dispatching through the same handler table as the plain interpreter
    /// (§4.5) also means yielding at the same granularity: one instruction per `step()` call, so
    /// `Cpu::execute_slice`'s downcount/pending-interrupt check (§5 "Suspension points") runs
    /// between every instruction instead of only between whole blocks. Cleared whenever control
    /// leaves the expected sequence — a fresh address, a fault, or the block running out.
    cursor: Option<(BlockKey, usize)>,
}

impl CachedInterpreter {
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

        let resumed_index = match self.cursor.take() {
            Some((cursor_key, index)) if cursor_key == key => Some(index),
            _ => None,
        };

        let needs_compile = match self.blocks.get(&key) {
            Some(block) => block.disposition != BlockDisposition::Valid,
            None => true,
        };
        if needs_compile {
            self.compile_block(key, bus, stats)?;
        }
        // A fresh compile always starts at the block's first instruction; a cache hit resumes
        // where the previous call left off, or starts fresh if this address wasn't mid-replay.
        let index = if needs_compile { 0 } else { resumed_index.unwrap_or(0) };

        let block = self.blocks.get(&key).unwrap();
        let decoded = block.instructions[index].clone();
        let block_len = block.instructions.len();
        let next_eip = regs.eip.wrapping_add(decoded.length) & regs.sizes.eip_mask();
        interpreter::execute(&decoded, regs, bus, next_eip, halted)?;

        let next_index = index + 1;
        if !*halted && next_index < block_len {
            self.cursor = Some((key, next_index));
        }
        Ok(1)
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

    /// Marks every block indexed under `page_physical_base` as flushed so the next hit recompiles
    /// it from the (now different) RAM contents. Driven by `Bus`'s code-invalidation callback.
    pub fn invalidate_page(&mut self, page_physical_base: u32) {
        if let Some(keys) = self.page_index.remove(&page_physical_base) {
            for key in keys {
                if let Some(block) = self.blocks.get_mut(&key) {
                    block.disposition = BlockDisposition::Flushed;
                }
            }
        }
    }

    pub fn flush(&mut self) {
        self.blocks.clear();
        self.page_index.clear();
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
    use crate::cpu::ExecutionStats;
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
    fn first_hit_compiles_second_hit_reuses_the_block() {
        // mov eax, 1 ; hlt — one `step()` call now replays exactly one instruction, so it takes
        // two calls to run this two-instruction block to its `hlt`.
        let mut bus = bus_with_code(&[0xB8, 0x01, 0x00, 0x00, 0x00, 0xF4]);
        let mut regs = RegisterFile::default();
        regs.sizes.operand_size_32 = true;
        let mut backend = CachedInterpreter::default();
        let mut stats = ExecutionStats::default();
        let mut halted = false;
        backend.step(&mut regs, &mut bus, &mut halted, &mut stats).unwrap();
        assert_eq!(stats.blocks_compiled, 1);
        assert_eq!(regs.gpr.get32(Reg32::Eax), 1);
        assert!(!halted);
        backend.step(&mut regs, &mut bus, &mut halted, &mut stats).unwrap();
        assert_eq!(stats.blocks_compiled, 1);
        assert!(halted);

        // Reset EIP/halt and run again: same block, no second compile.
        regs.eip = 0;
        halted = false;
        backend.step(&mut regs, &mut bus, &mut halted, &mut stats).unwrap();
        backend.step(&mut regs, &mut bus, &mut halted, &mut stats).unwrap();
        assert_eq!(stats.blocks_compiled, 1);
        assert!(halted);
    }

    #[test]
    fn invalidating_the_page_forces_a_recompile() {
        let mut bus = bus_with_code(&[0xB8, 0x01, 0x00, 0x00, 0x00, 0xF4]);
        let mut regs = RegisterFile::default();
        regs.sizes.operand_size_32 = true;
        let mut backend = CachedInterpreter::default();
        let mut stats = ExecutionStats::default();
        let mut halted = false;
        backend.step(&mut regs, &mut bus, &mut halted, &mut stats).unwrap();
        assert_eq!(backend.block_count(), 1);

        backend.invalidate_page(0);
        regs.eip = 0;
        halted = false;
        backend.step(&mut regs, &mut bus, &mut halted, &mut stats).unwrap();
        assert_eq!(stats.blocks_compiled, 2);
    }

    #[test]
    fn step_yields_after_every_instruction_even_mid_block() {
        // mov eax, 1 ; mov ebx, 2 ; hlt: three instructions, one cached block. Each `step()` call
        // must advance exactly one instruction so a caller can re-check downcount/interrupts
        // between them instead of only between whole blocks.
        let mut bus = bus_with_code(&[0xB8, 0x01, 0x00, 0x00, 0x00, 0xBB, 0x02, 0x00, 0x00, 0x00, 0xF4]);
        let mut regs = RegisterFile::default();
        regs.sizes.operand_size_32 = true;
        let mut backend = CachedInterpreter::default();
        let mut stats = ExecutionStats::default();
        let mut halted = false;

        backend.step(&mut regs, &mut bus, &mut halted, &mut stats).unwrap();
        assert_eq!(regs.gpr.get32(Reg32::Eax), 1);
        assert_eq!(regs.gpr.get32(Reg32::Ebx), 0);
        assert!(!halted);

        backend.step(&mut regs, &mut bus, &mut halted, &mut stats).unwrap();
        assert_eq!(regs.gpr.get32(Reg32::Ebx), 2);
        assert!(!halted);

        backend.step(&mut regs, &mut bus, &mut halted, &mut stats).unwrap();
        assert!(halted);
        // Still just the one compile for the whole three-instruction block.
        assert_eq!(stats.blocks_compiled, 1);
    }
}
