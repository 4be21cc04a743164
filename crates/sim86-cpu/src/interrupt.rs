//! Real-mode interrupt/exception delivery (§4.4), shared by the fault path in [`crate::cpu`] and
//! the `INT`/`INTO`/`INT3` instructions in [`crate::interpreter`] so both go through identical
//! IVT-walking logic rather than two copies that could drift.

use sim86_mem::Bus;
use sim86_x86::{Flags, Reg32, RegisterFile, SegmentRegister};

/// Pushes FLAGS, CS, IP, clears IF and TF, then loads CS:IP from the real-mode IVT entry at
/// physical address `vector * 4`. Protected-mode IDT gate delivery is not modeled; every test
/// scenario this core targets runs in (or drops straight back to) real mode.
pub fn deliver_interrupt(regs: &mut RegisterFile, bus: &mut Bus, vector: u8) {
    let ss_base = regs.segment(SegmentRegister::Ss).cache.base;
    let mut sp = regs.gpr.get16(Reg32::Esp);
    let mut push16 = |bus: &mut Bus, value: u16| {
        sp = sp.wrapping_sub(2);
        bus.write_u16(ss_base.wrapping_add(sp as u32), value);
    };
    push16(bus, regs.flags.bits() as u16);
    push16(bus, regs.segment(SegmentRegister::Cs).selector);
    push16(bus, regs.eip as u16);
    regs.gpr.set16(Reg32::Esp, sp);

    regs.flags.remove(Flags::IF | Flags::TF);

    let ivt_entry = bus.read_u32((vector as u32) * 4);
    let new_ip = ivt_entry as u16;
    let new_cs = (ivt_entry >> 16) as u16;
    regs.segment_mut(SegmentRegister::Cs).load_real_mode(new_cs);
    regs.eip = new_ip as u32;
}

/// `IRET`: pops IP, CS, FLAGS in that order, the inverse of [`deliver_interrupt`].
pub fn interrupt_return(regs: &mut RegisterFile, bus: &mut Bus) {
    let ss_base = regs.segment(SegmentRegister::Ss).cache.base;
    let mut sp = regs.gpr.get16(Reg32::Esp);
    let mut pop16 = |bus: &mut Bus| -> u16 {
        let value = bus.read_u16(ss_base.wrapping_add(sp as u32));
        sp = sp.wrapping_add(2);
        value
    };
    let ip = pop16(bus);
    let cs = pop16(bus);
    let flags = pop16(bus);
    regs.gpr.set16(Reg32::Esp, sp);
    regs.eip = ip as u32;
    regs.segment_mut(SegmentRegister::Cs).load_real_mode(cs);
    // Bit 1 stays hardwired; everything else in the low 16 bits comes from the stack.
    regs.flags = Flags::from_bits_retain((flags as u32) | 0b10);
}
