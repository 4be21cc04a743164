//! Register file, segment/descriptor state, BlockKey and the instruction decoder: the x86-specific
//! data model consumed by `sim86-cpu`'s backends.

pub mod block;
pub mod decoder;
pub mod registers;
pub mod segment;

pub use block::{Block, BlockDisposition, BlockKey, DecodeMode};
pub use decoder::{decode_block, decode_one, Code, DecodedInstruction, Mnemonic, OpKind, Register};
pub use registers::{Flags, GeneralRegisters, Reg32, Reg8};
pub use segment::{
    ControlRegisters, Cr0, Cr4, DebugRegisters, DescriptorTableRegister, ExecutionSizes, Segment,
    SegmentDescriptorCache, SegmentRegister, SystemSegment, NUM_SEGMENTS,
};

pub const PAGE_SIZE: u32 = 0x1000;

/// The full architectural register file, per §3's enumeration. `Cpu` (in `sim86-cpu`) embeds
/// this and adds execution-state fields (pending cycles, IRQ/NMI latches) that are not part of
/// the architectural state a save-state needs to round-trip bit-for-bit.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    pub gpr: GeneralRegisters,
    pub eip: u32,
    pub flags: Flags,
    pub segments: [Segment; NUM_SEGMENTS],
    pub control: ControlRegisters,
    pub debug: DebugRegisters,
    pub gdtr: DescriptorTableRegister,
    pub idtr: DescriptorTableRegister,
    pub ldtr: SystemSegment,
    pub tr: SystemSegment,
    pub sizes: ExecutionSizes,
}

impl Default for RegisterFile {
    fn default() -> Self {
        let mut segments = [Segment::default(); NUM_SEGMENTS];
        // Real-mode reset state: CS = 0xF000 with a base quirk handled by the caller (firmware
        // reset vector); every other segment resets to 0.
        for seg in &mut segments {
            seg.load_real_mode(0);
        }
        Self {
            gpr: GeneralRegisters::default(),
            eip: 0,
            flags: Flags::default(),
            segments,
            control: ControlRegisters::default(),
            debug: DebugRegisters::default(),
            gdtr: DescriptorTableRegister::default(),
            idtr: DescriptorTableRegister::default(),
            ldtr: SystemSegment::default(),
            tr: SystemSegment::default(),
            sizes: ExecutionSizes::default(),
        }
    }
}

impl RegisterFile {
    pub fn segment(&self, reg: SegmentRegister) -> &Segment {
        &self.segments[reg as usize]
    }

    pub fn segment_mut(&mut self, reg: SegmentRegister) -> &mut Segment {
        &mut self.segments[reg as usize]
    }

    /// Linear address of `CS:EIP`, masked to the current code segment's EIP width — the value
    /// the decoder fetches from and `BlockKey::physical_address` is derived from when paging is
    /// disabled (linear == physical).
    pub fn code_linear_address(&self) -> u32 {
        let cs = self.segment(SegmentRegister::Cs);
        cs.cache.base.wrapping_add(self.eip & self.sizes.eip_mask())
    }

    /// Reads a general-purpose register or segment selector by the decoder's `Register` value.
    /// Lets the interpreter operate directly on `iced-x86`'s operand registers without its own
    /// translation table.
    pub fn read_reg(&self, reg: Register) -> u32 {
        use Register::*;
        match reg {
            EAX => self.gpr.get32(Reg32::Eax),
            ECX => self.gpr.get32(Reg32::Ecx),
            EDX => self.gpr.get32(Reg32::Edx),
            EBX => self.gpr.get32(Reg32::Ebx),
            ESP => self.gpr.get32(Reg32::Esp),
            EBP => self.gpr.get32(Reg32::Ebp),
            ESI => self.gpr.get32(Reg32::Esi),
            EDI => self.gpr.get32(Reg32::Edi),
            AX => self.gpr.get16(Reg32::Eax) as u32,
            CX => self.gpr.get16(Reg32::Ecx) as u32,
            DX => self.gpr.get16(Reg32::Edx) as u32,
            BX => self.gpr.get16(Reg32::Ebx) as u32,
            SP => self.gpr.get16(Reg32::Esp) as u32,
            BP => self.gpr.get16(Reg32::Ebp) as u32,
            SI => self.gpr.get16(Reg32::Esi) as u32,
            DI => self.gpr.get16(Reg32::Edi) as u32,
            AL => self.gpr.get8(Reg8::Al) as u32,
            CL => self.gpr.get8(Reg8::Cl) as u32,
            DL => self.gpr.get8(Reg8::Dl) as u32,
            BL => self.gpr.get8(Reg8::Bl) as u32,
            AH => self.gpr.get8(Reg8::Ah) as u32,
            CH => self.gpr.get8(Reg8::Ch) as u32,
            DH => self.gpr.get8(Reg8::Dh) as u32,
            BH => self.gpr.get8(Reg8::Bh) as u32,
            ES => self.segment(SegmentRegister::Es).selector as u32,
            CS => self.segment(SegmentRegister::Cs).selector as u32,
            SS => self.segment(SegmentRegister::Ss).selector as u32,
            DS => self.segment(SegmentRegister::Ds).selector as u32,
            FS => self.segment(SegmentRegister::Fs).selector as u32,
            GS => self.segment(SegmentRegister::Gs).selector as u32,
            _ => 0,
        }
    }

    pub fn write_reg(&mut self, reg: Register, value: u32) {
        use Register::*;
        match reg {
            EAX => self.gpr.set32(Reg32::Eax, value),
            ECX => self.gpr.set32(Reg32::Ecx, value),
            EDX => self.gpr.set32(Reg32::Edx, value),
            EBX => self.gpr.set32(Reg32::Ebx, value),
            ESP => self.gpr.set32(Reg32::Esp, value),
            EBP => self.gpr.set32(Reg32::Ebp, value),
            ESI => self.gpr.set32(Reg32::Esi, value),
            EDI => self.gpr.set32(Reg32::Edi, value),
            AX => self.gpr.set16(Reg32::Eax, value as u16),
            CX => self.gpr.set16(Reg32::Ecx, value as u16),
            DX => self.gpr.set16(Reg32::Edx, value as u16),
            BX => self.gpr.set16(Reg32::Ebx, value as u16),
            SP => self.gpr.set16(Reg32::Esp, value as u16),
            BP => self.gpr.set16(Reg32::Ebp, value as u16),
            SI => self.gpr.set16(Reg32::Esi, value as u16),
            DI => self.gpr.set16(Reg32::Edi, value as u16),
            AL => self.gpr.set8(Reg8::Al, value as u8),
            CL => self.gpr.set8(Reg8::Cl, value as u8),
            DL => self.gpr.set8(Reg8::Dl, value as u8),
            BL => self.gpr.set8(Reg8::Bl, value as u8),
            AH => self.gpr.set8(Reg8::Ah, value as u8),
            CH => self.gpr.set8(Reg8::Ch, value as u8),
            DH => self.gpr.set8(Reg8::Dh, value as u8),
            BH => self.gpr.set8(Reg8::Bh, value as u8),
            ES => self.segment_mut(SegmentRegister::Es).selector = value as u16,
            CS => self.segment_mut(SegmentRegister::Cs).selector = value as u16,
            SS => self.segment_mut(SegmentRegister::Ss).selector = value as u16,
            DS => self.segment_mut(SegmentRegister::Ds).selector = value as u16,
            FS => self.segment_mut(SegmentRegister::Fs).selector = value as u16,
            GS => self.segment_mut(SegmentRegister::Gs).selector = value as u16,
            _ => {}
        }
    }
}

/// Bit width of a general-purpose register operand. `iced-x86` already tells us this
/// (`Register::size`); this just keeps the unit the interpreter works in (bits, not bytes)
/// explicit at the call site.
pub fn reg_width_bits(reg: Register) -> u32 {
    reg.size() as u32 * 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_state_is_real_mode_with_cs_base_zero_by_default() {
        let regs = RegisterFile::default();
        assert_eq!(regs.segment(SegmentRegister::Cs).cache.base, 0);
        assert_eq!(regs.code_linear_address(), 0);
    }

    #[test]
    fn code_linear_address_uses_cs_base_plus_masked_eip() {
        let mut regs = RegisterFile::default();
        regs.segment_mut(SegmentRegister::Cs).load_real_mode(0xF000);
        regs.eip = 0xFFF0;
        assert_eq!(regs.code_linear_address(), 0xFFFF0);
    }
}
