//! Plain fetch-decode-execute interpreter (§4.4): no code cache, no compilation, one instruction
//! at a time. Every other backend falls back to this one for anything it does not itself handle,
//! so its instruction coverage is the whole core's instruction coverage.
//!
//! Covers the subset of the ISA the scenarios this core is tested against actually exercise: data
//! movement, the integer ALU, stack and control-flow instructions, port I/O, and flag/interrupt
//! control. An opcode outside that subset decodes fine (`iced-x86` covers the whole instruction
//! set) but raises `#UD` in [`Interpreter::step`], the same as real silicon hitting an
//! unimplemented microcode path would from the software's point of view.

use sim86_mem::Bus;
use sim86_time::CycleCount;
use sim86_x86::{
    decode_one, reg_width_bits, Code, DecodedInstruction, Flags, Mnemonic, OpKind, Reg32,
    RegisterFile, Register, Segment, SegmentRegister,
};

use crate::exception::CpuException;
use crate::interrupt;

#[derive(Debug, Default)]
pub struct Interpreter;

impl Interpreter {
    /// Decodes and executes exactly one instruction at `regs.code_linear_address()`, returning
    /// the number of cycles it cost. Paging is not modeled at this layer: with `CR0.PG` set,
    /// linear and physical addresses are treated as identical (an identity-mapped TLB), which is
    /// sufficient for every scenario this core targets and documented as a deliberate
    /// simplification rather than an omission.
    pub fn step(&mut self, regs: &mut RegisterFile, bus: &mut Bus, halted: &mut bool) -> Result<CycleCount, CpuException> {
        let physical_address = regs.code_linear_address();
        let mut fetch = [0u8; 16];
        for (i, byte) in fetch.iter_mut().enumerate() {
            *byte = bus.read_u8(physical_address.wrapping_add(i as u32));
        }
        let bitness = if regs.sizes.operand_size_32 { 32 } else { 16 };
        let instr = decode_one(&fetch, physical_address, bitness).ok_or(CpuException::InvalidOpcode)?;
        let next_eip = regs.eip.wrapping_add(instr.length) & regs.sizes.eip_mask();
        execute(&instr, regs, bus, next_eip, halted)?;
        Ok(1)
    }
}

fn width_mask(width: u32) -> u32 {
    if width >= 32 {
        0xFFFF_FFFF
    } else {
        (1u32 << width) - 1
    }
}

fn sign_bit(width: u32) -> u32 {
    1u32 << (width - 1)
}

fn add_with_flags(a: u32, b: u32, width: u32, flags: &mut Flags) -> u32 {
    let mask = width_mask(width);
    let (a, b) = (a & mask, b & mask);
    let result = a.wrapping_add(b) & mask;
    flags.set(Flags::CF, (a as u64 + b as u64) > mask as u64);
    flags.set(Flags::AF, ((a & 0xF) + (b & 0xF)) & 0x10 != 0);
    flags.set(Flags::OF, (!(a ^ b) & (a ^ result)) & sign_bit(width) != 0);
    flags.set_zsp(result, width);
    result
}

fn sub_with_flags(a: u32, b: u32, width: u32, flags: &mut Flags) -> u32 {
    let mask = width_mask(width);
    let (a, b) = (a & mask, b & mask);
    let result = a.wrapping_sub(b) & mask;
    flags.set(Flags::CF, a < b);
    flags.set(Flags::AF, (a & 0xF) < (b & 0xF));
    flags.set(Flags::OF, ((a ^ b) & (a ^ result)) & sign_bit(width) != 0);
    flags.set_zsp(result, width);
    result
}

fn logic_with_flags(result: u32, width: u32, flags: &mut Flags) -> u32 {
    let result = result & width_mask(width);
    flags.remove(Flags::CF | Flags::OF);
    flags.set_zsp(result, width);
    result
}

fn inc_with_flags(a: u32, width: u32, flags: &mut Flags) -> u32 {
    let mask = width_mask(width);
    let a = a & mask;
    let result = a.wrapping_add(1) & mask;
    flags.set(Flags::AF, (a & 0xF) == 0xF);
    flags.set(Flags::OF, a == mask >> 1);
    flags.set_zsp(result, width);
    result
}

fn dec_with_flags(a: u32, width: u32, flags: &mut Flags) -> u32 {
    let mask = width_mask(width);
    let a = a & mask;
    let result = a.wrapping_sub(1) & mask;
    flags.set(Flags::AF, (a & 0xF) == 0);
    flags.set(Flags::OF, a == sign_bit(width));
    flags.set_zsp(result, width);
    result
}

fn segment_for(reg: Register) -> SegmentRegister {
    match reg {
        Register::CS => SegmentRegister::Cs,
        Register::SS => SegmentRegister::Ss,
        Register::DS => SegmentRegister::Ds,
        Register::ES => SegmentRegister::Es,
        Register::FS => SegmentRegister::Fs,
        Register::GS => SegmentRegister::Gs,
        _ => SegmentRegister::Ds,
    }
}

/// Bit 7 of a descriptor's access-rights byte: the present bit, per the x86 segment descriptor
/// layout. Real-mode loads never set it (`SegmentDescriptorCache::valid` is false for them), so
/// it's only meaningful once a protected-mode descriptor has actually been loaded.
const ACCESS_PRESENT: u16 = 1 << 7;

/// §4.4 "check limit and access-rights on every effective-address computation": the last byte
/// touched by a `size`-byte access at `offset` into `seg` must not exceed the segment's cached
/// limit, and if the descriptor is a real (protected-mode) one, its present bit must be set.
/// Real-mode segments carry a synthesized `limit = 0xFFFF, valid = false`, so the limit check
/// still applies to them (matching real silicon, which enforces the 64K wraparound limit even
/// against a real-mode segment) while the present-bit check is skipped.
fn check_segment_access(reg: SegmentRegister, seg: &Segment, offset: u32, size: u32) -> Result<(), CpuException> {
    let last_byte = offset.wrapping_add(size.saturating_sub(1));
    if last_byte > seg.cache.limit || last_byte < offset {
        return Err(if reg == SegmentRegister::Ss {
            CpuException::StackFault(0)
        } else {
            CpuException::GeneralProtectionFault(0)
        });
    }
    if seg.cache.valid && seg.cache.access_rights & ACCESS_PRESENT == 0 {
        let error_code = seg.selector & 0xFFF8;
        return Err(if reg == SegmentRegister::Ss {
            CpuException::StackFault(error_code)
        } else {
            CpuException::SegmentNotPresent(error_code)
        });
    }
    Ok(())
}

/// Offset portion of a memory operand's effective address, i.e. without the segment base added —
/// what `LEA` loads into its destination register. `LEA` never dereferences memory, so unlike
/// [`effective_address`] this never checks limit or access-rights.
fn effective_offset(instr: &DecodedInstruction, regs: &RegisterFile) -> u32 {
    let inner = &instr.inner;
    let mut addr: u32 = 0;
    let base = inner.memory_base();
    if base != Register::None {
        addr = addr.wrapping_add(regs.read_reg(base));
    }
    let index = inner.memory_index();
    if index != Register::None {
        addr = addr.wrapping_add(regs.read_reg(index).wrapping_mul(inner.memory_index_scale()));
    }
    addr.wrapping_add(inner.memory_displacement32())
}

fn effective_address(instr: &DecodedInstruction, regs: &RegisterFile, size: u32) -> Result<u32, CpuException> {
    let reg = segment_for(instr.inner.memory_segment());
    let seg = regs.segment(reg);
    let offset = effective_offset(instr, regs);
    check_segment_access(reg, seg, offset, size)?;
    Ok(seg.cache.base.wrapping_add(offset))
}

fn operand_width_bits(instr: &DecodedInstruction) -> u32 {
    let inner = &instr.inner;
    for i in 0..inner.op_count() {
        match inner.op_kind(i) {
            OpKind::Register => return reg_width_bits(inner.op_register(i)),
            OpKind::Memory => {
                let bytes = inner.memory_size().size();
                if bytes > 0 {
                    return bytes as u32 * 8;
                }
            }
            _ => {}
        }
    }
    32
}

fn read_operand(instr: &DecodedInstruction, i: u32, regs: &RegisterFile, bus: &mut Bus) -> Result<u32, CpuException> {
    let inner = &instr.inner;
    Ok(match inner.op_kind(i) {
        OpKind::Register => regs.read_reg(inner.op_register(i)),
        OpKind::Memory => {
            let size = inner.memory_size().size().max(1) as u32;
            let addr = effective_address(instr, regs, size)?;
            match inner.memory_size().size() {
                1 => bus.read_u8(addr) as u32,
                2 => bus.read_u16(addr) as u32,
                _ => bus.read_u32(addr),
            }
        }
        OpKind::NearBranch16 => inner.near_branch16() as u32,
        OpKind::NearBranch32 => inner.near_branch32(),
        _ => inner.immediate(i) as u32,
    })
}

fn write_operand(instr: &DecodedInstruction, i: u32, regs: &mut RegisterFile, bus: &mut Bus, value: u32) -> Result<(), CpuException> {
    let inner = &instr.inner;
    match inner.op_kind(i) {
        OpKind::Register => regs.write_reg(inner.op_register(i), value),
        OpKind::Memory => {
            let size = inner.memory_size().size().max(1) as u32;
            let addr = effective_address(instr, regs, size)?;
            match inner.memory_size().size() {
                1 => bus.write_u8(addr, value as u8),
                2 => bus.write_u16(addr, value as u16),
                _ => bus.write_u32(addr, value),
            }
        }
        _ => {}
    }
    Ok(())
}

fn push_stack(regs: &mut RegisterFile, bus: &mut Bus, value: u32, width_bytes: u32) -> Result<(), CpuException> {
    let seg_reg = SegmentRegister::Ss;
    if regs.sizes.stack_size_32 {
        let sp = regs.gpr.get32(Reg32::Esp).wrapping_sub(width_bytes);
        check_segment_access(seg_reg, regs.segment(seg_reg), sp, width_bytes)?;
        let ss_base = regs.segment(seg_reg).cache.base;
        regs.gpr.set32(Reg32::Esp, sp);
        if width_bytes == 2 {
            bus.write_u16(ss_base.wrapping_add(sp), value as u16);
        } else {
            bus.write_u32(ss_base.wrapping_add(sp), value);
        }
    } else {
        let sp = regs.gpr.get16(Reg32::Esp).wrapping_sub(width_bytes as u16);
        check_segment_access(seg_reg, regs.segment(seg_reg), sp as u32, width_bytes)?;
        let ss_base = regs.segment(seg_reg).cache.base;
        regs.gpr.set16(Reg32::Esp, sp);
        if width_bytes == 2 {
            bus.write_u16(ss_base.wrapping_add(sp as u32), value as u16);
        } else {
            bus.write_u32(ss_base.wrapping_add(sp as u32), value);
        }
    }
    Ok(())
}

fn pop_stack(regs: &mut RegisterFile, bus: &mut Bus, width_bytes: u32) -> Result<u32, CpuException> {
    let seg_reg = SegmentRegister::Ss;
    if regs.sizes.stack_size_32 {
        let sp = regs.gpr.get32(Reg32::Esp);
        check_segment_access(seg_reg, regs.segment(seg_reg), sp, width_bytes)?;
        let ss_base = regs.segment(seg_reg).cache.base;
        let value = if width_bytes == 2 {
            bus.read_u16(ss_base.wrapping_add(sp)) as u32
        } else {
            bus.read_u32(ss_base.wrapping_add(sp))
        };
        regs.gpr.set32(Reg32::Esp, sp.wrapping_add(width_bytes));
        Ok(value)
    } else {
        let sp = regs.gpr.get16(Reg32::Esp);
        check_segment_access(seg_reg, regs.segment(seg_reg), sp as u32, width_bytes)?;
        let ss_base = regs.segment(seg_reg).cache.base;
        let value = if width_bytes == 2 {
            bus.read_u16(ss_base.wrapping_add(sp as u32)) as u32
        } else {
            bus.read_u32(ss_base.wrapping_add(sp as u32))
        };
        regs.gpr.set16(Reg32::Esp, sp.wrapping_add(width_bytes as u16));
        Ok(value)
    }
}

fn condition_met(code: Code, flags: Flags) -> bool {
    use Flags as F;
    match code {
        Code::Je_rel8_16 | Code::Je_rel8_32 | Code::Je_rel16 | Code::Je_rel32_32 => flags.contains(F::ZF),
        Code::Jne_rel8_16 | Code::Jne_rel8_32 | Code::Jne_rel16 | Code::Jne_rel32_32 => !flags.contains(F::ZF),
        Code::Jb_rel8_16 | Code::Jb_rel8_32 | Code::Jb_rel16 | Code::Jb_rel32_32 => flags.contains(F::CF),
        Code::Jae_rel8_16 | Code::Jae_rel8_32 | Code::Jae_rel16 | Code::Jae_rel32_32 => !flags.contains(F::CF),
        Code::Ja_rel8_16 | Code::Ja_rel8_32 | Code::Ja_rel16 | Code::Ja_rel32_32 => {
            !flags.contains(F::CF) && !flags.contains(F::ZF)
        }
        Code::Jbe_rel8_16 | Code::Jbe_rel8_32 | Code::Jbe_rel16 | Code::Jbe_rel32_32 => {
            flags.contains(F::CF) || flags.contains(F::ZF)
        }
        Code::Jl_rel8_16 | Code::Jl_rel8_32 | Code::Jl_rel16 | Code::Jl_rel32_32 => {
            flags.contains(F::SF) != flags.contains(F::OF)
        }
        Code::Jge_rel8_16 | Code::Jge_rel8_32 | Code::Jge_rel16 | Code::Jge_rel32_32 => {
            flags.contains(F::SF) == flags.contains(F::OF)
        }
        Code::Jg_rel8_16 | Code::Jg_rel8_32 | Code::Jg_rel16 | Code::Jg_rel32_32 => {
            !flags.contains(F::ZF) && (flags.contains(F::SF) == flags.contains(F::OF))
        }
        Code::Jle_rel8_16 | Code::Jle_rel8_32 | Code::Jle_rel16 | Code::Jle_rel32_32 => {
            flags.contains(F::ZF) || (flags.contains(F::SF) != flags.contains(F::OF))
        }
        Code::Js_rel8_16 | Code::Js_rel8_32 | Code::Js_rel16 | Code::Js_rel32_32 => flags.contains(F::SF),
        Code::Jns_rel8_16 | Code::Jns_rel8_32 | Code::Jns_rel16 | Code::Jns_rel32_32 => !flags.contains(F::SF),
        Code::Jo_rel8_16 | Code::Jo_rel8_32 | Code::Jo_rel16 | Code::Jo_rel32_32 => flags.contains(F::OF),
        Code::Jno_rel8_16 | Code::Jno_rel8_32 | Code::Jno_rel16 | Code::Jno_rel32_32 => !flags.contains(F::OF),
        Code::Jp_rel8_16 | Code::Jp_rel8_32 | Code::Jp_rel16 | Code::Jp_rel32_32 => flags.contains(F::PF),
        Code::Jnp_rel8_16 | Code::Jnp_rel8_32 | Code::Jnp_rel16 | Code::Jnp_rel32_32 => !flags.contains(F::PF),
        _ => false,
    }
}

/// Executes one already-decoded instruction. Exposed to the cached interpreter and recompiler so
/// they can replay a previously-decoded instruction stream without re-decoding it, while still
/// going through the exact same execution semantics as the plain interpreter.
///
/// If any access the instruction makes faults partway through (a bad effective address, a stack
/// access past the limit), EIP and ESP are restored to their pre-instruction values before the
/// error is returned, per §7: "recovered locally by restoring pre-instruction EIP/ESP."
pub(crate) fn execute(
    instr: &DecodedInstruction,
    regs: &mut RegisterFile,
    bus: &mut Bus,
    next_eip: u32,
    halted: &mut bool,
) -> Result<(), CpuException> {
    if !is_supported(instr) {
        // EIP stays at the faulting instruction; nothing has been committed yet.
        return Err(CpuException::InvalidOpcode);
    }
    let pre_fault_eip = regs.eip;
    let pre_fault_esp = regs.gpr.get32(Reg32::Esp);
    regs.eip = next_eip;
    let result = execute_supported(instr, regs, bus, next_eip, halted);
    if result.is_err() {
        regs.eip = pre_fault_eip;
        regs.gpr.set32(Reg32::Esp, pre_fault_esp);
    }
    result
}

fn execute_supported(
    instr: &DecodedInstruction,
    regs: &mut RegisterFile,
    bus: &mut Bus,
    next_eip: u32,
    halted: &mut bool,
) -> Result<(), CpuException> {
    let inner = &instr.inner;
    match instr.mnemonic() {
        Mnemonic::Nop | Mnemonic::Wait | Mnemonic::Fnop => {}
        Mnemonic::Mov | Mnemonic::Movzx | Mnemonic::Movsx => {
            let value = read_operand(instr, 1, regs, bus)?;
            write_operand(instr, 0, regs, bus, value)?;
        }
        Mnemonic::Lea => {
            let offset = effective_offset(instr, regs);
            write_operand(instr, 0, regs, bus, offset)?;
        }
        Mnemonic::Xchg => {
            let a = read_operand(instr, 0, regs, bus)?;
            let b = read_operand(instr, 1, regs, bus)?;
            write_operand(instr, 0, regs, bus, b)?;
            write_operand(instr, 1, regs, bus, a)?;
        }
        Mnemonic::Add => {
            let width = operand_width_bits(instr);
            let a = read_operand(instr, 0, regs, bus)?;
            let b = read_operand(instr, 1, regs, bus)?;
            let result = add_with_flags(a, b, width, &mut regs.flags);
            write_operand(instr, 0, regs, bus, result)?;
        }
        Mnemonic::Sub => {
            let width = operand_width_bits(instr);
            let a = read_operand(instr, 0, regs, bus)?;
            let b = read_operand(instr, 1, regs, bus)?;
            let result = sub_with_flags(a, b, width, &mut regs.flags);
            write_operand(instr, 0, regs, bus, result)?;
        }
        Mnemonic::Cmp => {
            let width = operand_width_bits(instr);
            let a = read_operand(instr, 0, regs, bus)?;
            let b = read_operand(instr, 1, regs, bus)?;
            sub_with_flags(a, b, width, &mut regs.flags);
        }
        Mnemonic::And => {
            let width = operand_width_bits(instr);
            let a = read_operand(instr, 0, regs, bus)?;
            let b = read_operand(instr, 1, regs, bus)?;
            let result = logic_with_flags(a & b, width, &mut regs.flags);
            write_operand(instr, 0, regs, bus, result)?;
        }
        Mnemonic::Or => {
            let width = operand_width_bits(instr);
            let a = read_operand(instr, 0, regs, bus)?;
            let b = read_operand(instr, 1, regs, bus)?;
            let result = logic_with_flags(a | b, width, &mut regs.flags);
            write_operand(instr, 0, regs, bus, result)?;
        }
        Mnemonic::Xor => {
            let width = operand_width_bits(instr);
            let a = read_operand(instr, 0, regs, bus)?;
            let b = read_operand(instr, 1, regs, bus)?;
            let result = logic_with_flags(a ^ b, width, &mut regs.flags);
            write_operand(instr, 0, regs, bus, result)?;
        }
        Mnemonic::Test => {
            let width = operand_width_bits(instr);
            let a = read_operand(instr, 0, regs, bus)?;
            let b = read_operand(instr, 1, regs, bus)?;
            logic_with_flags(a & b, width, &mut regs.flags);
        }
        Mnemonic::Inc => {
            let width = operand_width_bits(instr);
            let a = read_operand(instr, 0, regs, bus)?;
            let result = inc_with_flags(a, width, &mut regs.flags);
            write_operand(instr, 0, regs, bus, result)?;
        }
        Mnemonic::Dec => {
            let width = operand_width_bits(instr);
            let a = read_operand(instr, 0, regs, bus)?;
            let result = dec_with_flags(a, width, &mut regs.flags);
            write_operand(instr, 0, regs, bus, result)?;
        }
        Mnemonic::Not => {
            let width = operand_width_bits(instr);
            let a = read_operand(instr, 0, regs, bus)?;
            write_operand(instr, 0, regs, bus, !a & width_mask(width))?;
        }
        Mnemonic::Neg => {
            let width = operand_width_bits(instr);
            let a = read_operand(instr, 0, regs, bus)?;
            let result = sub_with_flags(0, a, width, &mut regs.flags);
            regs.flags.set(Flags::CF, a != 0);
            write_operand(instr, 0, regs, bus, result)?;
        }
        Mnemonic::Push => {
            let width = if regs.sizes.operand_size_32 { 4 } else { 2 };
            let value = read_operand(instr, 0, regs, bus)?;
            push_stack(regs, bus, value, width)?;
        }
        Mnemonic::Pop => {
            let width = if regs.sizes.operand_size_32 { 4 } else { 2 };
            let value = pop_stack(regs, bus, width)?;
            write_operand(instr, 0, regs, bus, value)?;
        }
        Mnemonic::Pushf | Mnemonic::Pushfd | Mnemonic::Pushfq => {
            let width = if regs.sizes.operand_size_32 { 4 } else { 2 };
            push_stack(regs, bus, regs.flags.bits(), width)?;
        }
        Mnemonic::Popf | Mnemonic::Popfd | Mnemonic::Popfq => {
            let width = if regs.sizes.operand_size_32 { 4 } else { 2 };
            let value = pop_stack(regs, bus, width)?;
            regs.flags = Flags::from_bits_retain(value | 0b10);
        }
        Mnemonic::Jmp => {
            regs.eip = read_operand(instr, 0, regs, bus)? & regs.sizes.eip_mask();
        }
        Mnemonic::Call => {
            let width_bytes = if regs.sizes.operand_size_32 { 4 } else { 2 };
            let return_addr = next_eip;
            let target = read_operand(instr, 0, regs, bus)?;
            push_stack(regs, bus, return_addr, width_bytes)?;
            regs.eip = target & regs.sizes.eip_mask();
        }
        Mnemonic::Ret => {
            let width_bytes = if regs.sizes.operand_size_32 { 4 } else { 2 };
            let target = pop_stack(regs, bus, width_bytes)?;
            regs.eip = target & regs.sizes.eip_mask();
            if inner.op_count() > 0 {
                let extra = inner.immediate(0) as u32;
                if regs.sizes.stack_size_32 {
                    regs.gpr.set32(Reg32::Esp, regs.gpr.get32(Reg32::Esp).wrapping_add(extra));
                } else {
                    regs.gpr.set16(Reg32::Esp, regs.gpr.get16(Reg32::Esp).wrapping_add(extra as u16));
                }
            }
        }
        Mnemonic::Iret | Mnemonic::Iretd | Mnemonic::Iretq => interrupt::interrupt_return(regs, bus),
        Mnemonic::Loop => {
            let count = loop_decrement(regs);
            if count != 0 {
                regs.eip = read_operand(instr, 0, regs, bus)? & regs.sizes.eip_mask();
            }
        }
        Mnemonic::Loope => {
            let count = loop_decrement(regs);
            if count != 0 && regs.flags.contains(Flags::ZF) {
                regs.eip = read_operand(instr, 0, regs, bus)? & regs.sizes.eip_mask();
            }
        }
        Mnemonic::Loopne => {
            let count = loop_decrement(regs);
            if count != 0 && !regs.flags.contains(Flags::ZF) {
                regs.eip = read_operand(instr, 0, regs, bus)? & regs.sizes.eip_mask();
            }
        }
        Mnemonic::Jcxz => {
            let count = if regs.sizes.address_size_32 {
                regs.gpr.get32(Reg32::Ecx)
            } else {
                regs.gpr.get16(Reg32::Ecx) as u32
            };
            if count == 0 {
                regs.eip = read_operand(instr, 0, regs, bus)? & regs.sizes.eip_mask();
            }
        }
        Mnemonic::Hlt => *halted = true,
        Mnemonic::Cli => regs.flags.remove(Flags::IF),
        Mnemonic::Sti => regs.flags.insert(Flags::IF),
        Mnemonic::Clc => regs.flags.remove(Flags::CF),
        Mnemonic::Stc => regs.flags.insert(Flags::CF),
        Mnemonic::Cmc => regs.flags.toggle(Flags::CF),
        Mnemonic::Cld => regs.flags.remove(Flags::DF),
        Mnemonic::Std => regs.flags.insert(Flags::DF),
        Mnemonic::In => {
            let port = match inner.op_kind(1) {
                OpKind::Register => regs.read_reg(inner.op_register(1)) as u16,
                _ => inner.immediate(1) as u16,
            };
            let width = operand_width_bits(instr);
            let value = match width {
                8 => bus.read_io_port_byte(port) as u32,
                16 => bus.read_io_port_word(port) as u32,
                _ => bus.read_io_port_dword(port),
            };
            write_operand(instr, 0, regs, bus, value)?;
        }
        Mnemonic::Out => {
            let port = match inner.op_kind(0) {
                OpKind::Register => regs.read_reg(inner.op_register(0)) as u16,
                _ => inner.immediate(0) as u16,
            };
            let width = operand_width_bits(instr);
            let value = read_operand(instr, 1, regs, bus)?;
            match width {
                8 => bus.write_io_port_byte(port, value as u8),
                16 => bus.write_io_port_word(port, value as u16),
                _ => bus.write_io_port_dword(port, value),
            }
        }
        Mnemonic::Int3 => {
            regs.eip = next_eip;
            interrupt::deliver_interrupt(regs, bus, 3);
        }
        Mnemonic::Int => {
            let vector = inner.immediate(0) as u8;
            interrupt::deliver_interrupt(regs, bus, vector);
        }
        Mnemonic::Into => {
            if regs.flags.contains(Flags::OF) {
                interrupt::deliver_interrupt(regs, bus, 4);
            }
        }
        _ if is_conditional_jump(instr.code()) => {
            if condition_met(instr.code(), regs.flags) {
                regs.eip = read_operand(instr, 0, regs, bus)? & regs.sizes.eip_mask();
            }
        }
        _ => unreachable!("is_supported should have rejected this mnemonic before any state was committed"),
    }
    Ok(())
}

/// Mirrors the mnemonic coverage of the match in [`execute_supported`]; checked before any
/// register or memory write happens so an unsupported opcode can fault without partially applying
/// itself.
fn is_supported(instr: &DecodedInstruction) -> bool {
    use Mnemonic::*;
    matches!(
        instr.mnemonic(),
        Nop | Wait
            | Fnop
            | Mov
            | Movzx
            | Movsx
            | Lea
            | Xchg
            | Add
            | Sub
            | Cmp
            | And
            | Or
            | Xor
            | Test
            | Inc
            | Dec
            | Not
            | Neg
            | Push
            | Pop
            | Pushfd
            | Pushfq
            | Pushf
            | Popfd
            | Popfq
            | Popf
            | Jmp
            | Call
            | Ret
            | Iretd
            | Iretq
            | Iret
            | Loop
            | Loope
            | Loopne
            | Jcxz
            | Hlt
            | Cli
            | Sti
            | Clc
            | Stc
            | Cmc
            | Cld
            | Std
            | In
            | Out
            | Int3
            | Int
            | Into
    ) || is_conditional_jump(instr.code())
}

fn is_conditional_jump(code: Code) -> bool {
    matches!(
        code,
        Code::Je_rel8_16
            | Code::Je_rel8_32
            | Code::Je_rel16
            | Code::Je_rel32_32
            | Code::Jne_rel8_16
            | Code::Jne_rel8_32
            | Code::Jne_rel16
            | Code::Jne_rel32_32
            | Code::Jb_rel8_16
            | Code::Jb_rel8_32
            | Code::Jb_rel16
            | Code::Jb_rel32_32
            | Code::Jae_rel8_16
            | Code::Jae_rel8_32
            | Code::Jae_rel16
            | Code::Jae_rel32_32
            | Code::Ja_rel8_16
            | Code::Ja_rel8_32
            | Code::Ja_rel16
            | Code::Ja_rel32_32
            | Code::Jbe_rel8_16
            | Code::Jbe_rel8_32
            | Code::Jbe_rel16
            | Code::Jbe_rel32_32
            | Code::Jl_rel8_16
            | Code::Jl_rel8_32
            | Code::Jl_rel16
            | Code::Jl_rel32_32
            | Code::Jge_rel8_16
            | Code::Jge_rel8_32
            | Code::Jge_rel16
            | Code::Jge_rel32_32
            | Code::Jg_rel8_16
            | Code::Jg_rel8_32
            | Code::Jg_rel16
            | Code::Jg_rel32_32
            | Code::Jle_rel8_16
            | Code::Jle_rel8_32
            | Code::Jle_rel16
            | Code::Jle_rel32_32
            | Code::Js_rel8_16
            | Code::Js_rel8_32
            | Code::Js_rel16
            | Code::Js_rel32_32
            | Code::Jns_rel8_16
            | Code::Jns_rel8_32
            | Code::Jns_rel16
            | Code::Jns_rel32_32
            | Code::Jo_rel8_16
            | Code::Jo_rel8_32
            | Code::Jo_rel16
            | Code::Jo_rel32_32
            | Code::Jno_rel8_16
            | Code::Jno_rel8_32
            | Code::Jno_rel16
            | Code::Jno_rel32_32
            | Code::Jp_rel8_16
            | Code::Jp_rel8_32
            | Code::Jp_rel16
            | Code::Jp_rel32_32
            | Code::Jnp_rel8_16
            | Code::Jnp_rel8_32
            | Code::Jnp_rel16
            | Code::Jnp_rel32_32
    )
}

fn loop_decrement(regs: &mut RegisterFile) -> u32 {
    if regs.sizes.address_size_32 {
        let v = regs.gpr.get32(Reg32::Ecx).wrapping_sub(1);
        regs.gpr.set32(Reg32::Ecx, v);
        v
    } else {
        let v = regs.gpr.get16(Reg32::Ecx).wrapping_sub(1);
        regs.gpr.set16(Reg32::Ecx, v);
        v as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim86_mem::Bus;

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
    fn mov_eax_imm32_then_halts() {
        // mov eax, 0x12345678 ; hlt
        let mut bus = bus_with_code(&[0xB8, 0x78, 0x56, 0x34, 0x12, 0xF4]);
        let mut regs = RegisterFile::default();
        regs.sizes.operand_size_32 = true;
        regs.sizes.address_size_32 = true;
        regs.segment_mut(SegmentRegister::Cs).load_real_mode(0);
        let mut interp = Interpreter::default();
        let mut halted = false;
        interp.step(&mut regs, &mut bus, &mut halted).unwrap();
        assert_eq!(regs.gpr.get32(Reg32::Eax), 0x1234_5678);
        assert!(!halted);
        interp.step(&mut regs, &mut bus, &mut halted).unwrap();
        assert!(halted);
    }

    #[test]
    fn add_sets_zero_flag_on_matching_cancellation() {
        // mov eax, 5 ; add eax, -5 (0xFFFFFFFB)
        let mut bus = bus_with_code(&[0xB8, 0x05, 0x00, 0x00, 0x00, 0x05, 0xFB, 0xFF, 0xFF, 0xFF]);
        let mut regs = RegisterFile::default();
        regs.sizes.operand_size_32 = true;
        regs.sizes.address_size_32 = true;
        let mut interp = Interpreter::default();
        let mut halted = false;
        interp.step(&mut regs, &mut bus, &mut halted).unwrap();
        interp.step(&mut regs, &mut bus, &mut halted).unwrap();
        assert_eq!(regs.gpr.get32(Reg32::Eax), 0);
        assert!(regs.flags.contains(Flags::ZF));
        assert!(regs.flags.contains(Flags::CF));
    }

    #[test]
    fn push_then_pop_round_trips_through_the_stack() {
        // mov eax, 0xCAFEBABE ; push eax ; pop ebx
        let mut bus = bus_with_code(&[0xB8, 0xBE, 0xBA, 0xFE, 0xCA, 0x50, 0x5B]);
        let mut regs = RegisterFile::default();
        regs.sizes.operand_size_32 = true;
        regs.sizes.address_size_32 = true;
        regs.sizes.stack_size_32 = true;
        regs.gpr.set32(Reg32::Esp, 0xF000);
        let mut interp = Interpreter::default();
        let mut halted = false;
        interp.step(&mut regs, &mut bus, &mut halted).unwrap();
        interp.step(&mut regs, &mut bus, &mut halted).unwrap();
        interp.step(&mut regs, &mut bus, &mut halted).unwrap();
        assert_eq!(regs.gpr.get32(Reg32::Ebx), 0xCAFEBABE);
        assert_eq!(regs.gpr.get32(Reg32::Esp), 0xF000);
    }

    #[test]
    fn unsupported_opcode_raises_invalid_opcode_without_advancing_eip() {
        // 0x0F 0x0B is UD2, deliberately outside the covered subset.
        let mut bus = bus_with_code(&[0x0F, 0x0B]);
        let mut regs = RegisterFile::default();
        let mut interp = Interpreter::default();
        let mut halted = false;
        let err = interp.step(&mut regs, &mut bus, &mut halted).unwrap_err();
        assert_eq!(err, CpuException::InvalidOpcode);
        assert_eq!(regs.eip, 0);
    }

    #[test]
    fn push_past_the_segment_limit_raises_stack_fault_and_restores_esp() {
        // mov eax, 1 ; push eax, with SS limited to 2 bytes so the 4-byte push lands outside it.
        let mut bus = bus_with_code(&[0xB8, 0x01, 0x00, 0x00, 0x00, 0x50]);
        let mut regs = RegisterFile::default();
        regs.sizes.operand_size_32 = true;
        regs.sizes.address_size_32 = true;
        regs.sizes.stack_size_32 = true;
        regs.segment_mut(SegmentRegister::Ss).cache.limit = 2;
        regs.gpr.set32(Reg32::Esp, 5);
        let mut interp = Interpreter::default();
        let mut halted = false;
        interp.step(&mut regs, &mut bus, &mut halted).unwrap();
        let eip_before_fault = regs.eip;
        let err = interp.step(&mut regs, &mut bus, &mut halted).unwrap_err();
        assert_eq!(err, CpuException::StackFault(0));
        assert_eq!(regs.eip, eip_before_fault);
        assert_eq!(regs.gpr.get32(Reg32::Esp), 5);
    }

    #[test]
    fn read_past_a_not_present_segment_raises_segment_not_present() {
        // mov eax, [0] with DS pointed at a loaded-but-not-present descriptor.
        let mut bus = bus_with_code(&[0xA1, 0x00, 0x00, 0x00, 0x00]);
        let mut regs = RegisterFile::default();
        regs.sizes.operand_size_32 = true;
        regs.sizes.address_size_32 = true;
        let ds = regs.segment_mut(SegmentRegister::Ds);
        ds.selector = 0x18;
        ds.cache.valid = true;
        ds.cache.access_rights = 0;
        let mut interp = Interpreter::default();
        let mut halted = false;
        let err = interp.step(&mut regs, &mut bus, &mut halted).unwrap_err();
        assert_eq!(err, CpuException::SegmentNotPresent(0x18));
        assert_eq!(regs.eip, 0);
    }
}
