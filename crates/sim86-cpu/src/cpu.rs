//! The CPU shared contract (§4.3): register file ownership, cycle/time bookkeeping, IRQ/NMI
//! latching and backend dispatch. The three backends in [`crate::interpreter`],
//! [`crate::cached_interpreter`] and [`crate::recompiler`] only ever see a `&mut Cpu` plus a
//! `&mut Bus`; none of them own architectural state themselves.

use sim86_mem::Bus;
use sim86_snapshot::{StateLoadError, StateReader, StateWriter};
use sim86_time::{cycle_period_ns, time_to_cycles, CycleCount, SimulationTime};
use sim86_x86::{
    ControlRegisters, Cr0, Cr4, DebugRegisters, DescriptorTableRegister, ExecutionSizes, Flags, GeneralRegisters,
    Reg32, RegisterFile, Segment, SegmentDescriptorCache, SegmentRegister, SystemSegment, NUM_SEGMENTS,
};

use crate::cached_interpreter::CachedInterpreter;
use crate::exception::CpuException;
use crate::interpreter::Interpreter;
use crate::interrupt;
use crate::recompiler::Recompiler;

/// Which execution backend is currently driving `execute_slice` (§4.4-§4.6). Selecting one at
/// runtime is a plain enum dispatch rather than a trait object: every backend needs the same
/// `&mut Cpu, &mut Bus` access and none of them are ever stored polymorphically, so there is no
/// vtable to justify paying for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    Interpreter,
    #[default]
    CachedInterpreter,
    Recompiler,
}

/// Counters surfaced to the host for diagnostics (§4.3 "get_execution_stats"). Reset only
/// explicitly, never implicitly on backend switch, so a host can sample them across a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    pub instructions_executed: u64,
    pub cycles_executed: u64,
    pub blocks_compiled: u64,
    pub blocks_invalidated: u64,
    pub exceptions_raised: u64,
}

/// The shared CPU state every backend operates on. Owns the architectural register file plus the
/// execution-only bookkeeping the architectural state does not need to round-trip through a
/// save-state (IRQ/NMI latches are re-derived from the interrupt controller on load, per the
/// controller's own `Component::save_state`).
pub struct Cpu {
    pub regs: RegisterFile,
    frequency_hz: f64,
    cycle_period: SimulationTime,
    /// Cycles owed to the backend for the slice currently in progress; counts down to zero or
    /// negative (an overrun, carried into the next slice rather than discarded).
    execution_downcount: CycleCount,
    halted: bool,
    irq_line: bool,
    nmi_pending: bool,
    backend: BackendKind,
    stats: ExecutionStats,
    interpreter: Interpreter,
    cached_interpreter: CachedInterpreter,
    recompiler: Recompiler,
    /// Resolves the vector for the asserted IRQ line at acknowledge time (§9 "closures become
    /// `Box<dyn Fn`"). Wired by the owning system to the interrupt controller's acknowledge cycle;
    /// with no controller attached, an asserted `irq_line` only wakes a halted CPU (matching a
    /// real CPU's INTR pin with nothing driving the data bus during the ack cycle).
    irq_ack: Option<Box<dyn FnMut() -> u8>>,
}

impl Cpu {
    pub fn new(frequency_hz: f64) -> Self {
        Self {
            regs: RegisterFile::default(),
            frequency_hz,
            cycle_period: cycle_period_ns(frequency_hz),
            execution_downcount: 0,
            halted: false,
            irq_line: false,
            nmi_pending: false,
            backend: BackendKind::default(),
            stats: ExecutionStats::default(),
            interpreter: Interpreter::default(),
            cached_interpreter: CachedInterpreter::default(),
            recompiler: Recompiler::default(),
            irq_ack: None,
        }
    }

    /// Wires the interrupt-acknowledge callback (§4.3 "set_irq_state" companion): invoked once per
    /// taken IRQ, after `irq_line` and `EFLAGS.IF` are both set, to obtain the vector to deliver.
    pub fn set_irq_ack_callback(&mut self, callback: Box<dyn FnMut() -> u8>) {
        self.irq_ack = Some(callback);
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Switching backends never touches architectural state; the cached interpreter's and
    /// recompiler's block caches simply go unused until selected again (§9 "backends are
    /// interchangeable views over one register file").
    pub fn set_backend(&mut self, backend: BackendKind) {
        self.backend = backend;
    }

    pub fn frequency_hz(&self) -> f64 {
        self.frequency_hz
    }

    pub fn set_frequency_hz(&mut self, frequency_hz: f64) {
        self.frequency_hz = frequency_hz;
        self.cycle_period = cycle_period_ns(frequency_hz);
    }

    pub fn cycle_period(&self) -> SimulationTime {
        self.cycle_period
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn execution_stats(&self) -> ExecutionStats {
        self.stats
    }

    pub fn reset_execution_stats(&mut self) {
        self.stats = ExecutionStats::default();
    }

    /// Power-on/CPU reset (§4.8 `Component::reset`): architectural state returns to real-mode
    /// defaults, pending cycles and the halt latch are cleared, but neither backend's code cache
    /// is flushed here — a reset does not imply the RAM backing those blocks changed.
    pub fn reset(&mut self) {
        self.regs = RegisterFile::default();
        self.regs.eip = 0xFFF0;
        self.regs.segment_mut(SegmentRegister::Cs).load_real_mode(0xF000);
        self.execution_downcount = 0;
        self.halted = false;
        self.irq_line = false;
        self.nmi_pending = false;
    }

    /// Sets the level of the maskable interrupt line (§4.3 "set_irq_state"); the PIC drives this
    /// directly rather than going through a software INTR instruction.
    pub fn set_irq_state(&mut self, asserted: bool) {
        self.irq_line = asserted;
    }

    pub fn irq_state(&self) -> bool {
        self.irq_line
    }

    /// Latches a non-maskable interrupt, edge-triggered: it fires exactly once at the next
    /// instruction boundary regardless of EFLAGS.IF, then clears.
    pub fn signal_nmi(&mut self) {
        self.nmi_pending = true;
    }

    /// Drops every cached/compiled block in both JIT-style backends (§4.3 "flush_code_cache"),
    /// e.g. after a save-state load where the RAM backing those blocks may differ from what
    /// produced them.
    pub fn flush_code_cache(&mut self) {
        self.cached_interpreter.flush();
        self.recompiler.flush();
        self.stats.blocks_invalidated += 1;
    }

    /// Hook for `Bus`'s code-invalidation callback (§3 "mark a page as containing cached code"):
    /// called whenever a write lands on a page either backend has compiled from.
    pub fn invalidate_code_page(&mut self, page_physical_base: u32) {
        self.cached_interpreter.invalidate_page(page_physical_base);
        self.recompiler.invalidate_page(page_physical_base);
    }

    /// Converts a duration in simulated nanoseconds to cycles at this CPU's current frequency and
    /// adds it to the pending execution downcount (§4.3 "set_execution_downcount"); this is how
    /// the scheduler tells the CPU how far it may run before its next timer event is due.
    pub fn add_execution_time(&mut self, ns: SimulationTime) {
        self.execution_downcount += time_to_cycles(ns, self.cycle_period);
    }

    pub fn execution_downcount(&self) -> CycleCount {
        self.execution_downcount
    }

    /// Runs the selected backend until the execution downcount is exhausted or the CPU halts,
    /// whichever comes first. Returns the number of cycles actually consumed. For the Interpreter
    /// and Cached Interpreter backends this may exceed what was owed by at most one instruction's
    /// worth, since an instruction is never partially executed; the Recompiler backend instead
    /// yields only at block exit (§5 "Suspension points"), so its overshoot bound is one block.
    pub fn execute_slice(&mut self, bus: &mut Bus) -> CycleCount {
        let starting_downcount = self.execution_downcount;
        if self.halted {
            // A halted CPU still "spends" the slice; an unmasked IRQ or NMI wakes it below.
            self.service_pending_interrupts(bus);
            if self.halted {
                let spent = self.execution_downcount.max(0);
                self.execution_downcount = 0;
                self.stats.cycles_executed += spent as u64;
                return spent;
            }
        }
        while self.execution_downcount > 0 && !self.halted {
            self.service_pending_interrupts(bus);
            if self.halted {
                break;
            }
            let cycles = match self.backend {
                BackendKind::Interpreter => self.interpreter.step(&mut self.regs, bus, &mut self.halted),
                BackendKind::CachedInterpreter => {
                    self.cached_interpreter
                        .step(&mut self.regs, bus, &mut self.halted, &mut self.stats)
                }
                BackendKind::Recompiler => {
                    self.recompiler.step(&mut self.regs, bus, &mut self.halted, &mut self.stats)
                }
            };
            match cycles {
                Ok(cycles) => {
                    self.execution_downcount -= cycles;
                    self.stats.cycles_executed += cycles as u64;
                    // One cycle is one instruction for every backend (the Recompiler's `cycles`
                    // is the whole replayed block's instruction count, not a per-call constant).
                    self.stats.instructions_executed += cycles as u64;
                }
                Err(exception) => self.deliver_exception(bus, exception),
            }
        }
        starting_downcount - self.execution_downcount
    }

    fn service_pending_interrupts(&mut self, bus: &mut Bus) {
        if self.nmi_pending {
            self.nmi_pending = false;
            self.halted = false;
            self.deliver_interrupt(bus, 2);
            return;
        }
        if self.irq_line && self.regs.flags.contains(Flags::IF) {
            self.halted = false;
            if let Some(ack) = &mut self.irq_ack {
                let vector = ack();
                interrupt::deliver_interrupt(&mut self.regs, bus, vector);
            }
        }
    }

    fn deliver_exception(&mut self, bus: &mut Bus, exception: CpuException) {
        self.stats.exceptions_raised += 1;
        self.deliver_interrupt(bus, exception.vector());
        if exception.has_error_code() {
            let new_sp = self.regs.gpr.get32(Reg32::Esp).wrapping_sub(4);
            self.regs.gpr.set32(Reg32::Esp, new_sp);
            let ss_base = self.regs.segment(SegmentRegister::Ss).cache.base;
            let _ = bus.write_u32(ss_base.wrapping_add(new_sp), exception.error_code());
        }
    }

    /// Real-mode interrupt delivery via the IVT at physical address `vector * 4`. Shared with the
    /// `INT`/`INTO`/`INT3` instructions in [`crate::interpreter`] through [`interrupt::deliver_interrupt`].
    pub fn deliver_interrupt(&mut self, bus: &mut Bus, vector: u8) {
        interrupt::deliver_interrupt(&mut self.regs, bus, vector);
    }

    /// Serializes architectural register state plus the execution latches a save-state needs to
    /// resume identically (§6): halt state and the IRQ/NMI lines. The block caches are not part
    /// of this — they are pure derived state, thrown away on load via `flush_code_cache`.
    pub fn save_state(&self, w: &mut StateWriter) {
        w.write_u32(CPU_SERIALIZATION_ID);
        for i in 0..8 {
            w.write_u32(self.regs.gpr.get32(INDEXED_REGS[i]));
        }
        w.write_u32(self.regs.eip);
        w.write_u32(self.regs.flags.bits());
        for seg in &self.regs.segments {
            w.write_u16(seg.selector);
            w.write_u32(seg.cache.base);
            w.write_u32(seg.cache.limit);
            w.write_u16(seg.cache.access_rights);
            w.write_u8(seg.cache.valid as u8);
        }
        w.write_u32(self.regs.control.cr0.bits());
        w.write_u32(self.regs.control.cr2);
        w.write_u32(self.regs.control.cr3);
        w.write_u32(self.regs.control.cr4.bits());
        for dr in &self.regs.debug.dr {
            w.write_u32(*dr);
        }
        w.write_u32(self.regs.gdtr.base);
        w.write_u16(self.regs.gdtr.limit);
        w.write_u32(self.regs.idtr.base);
        w.write_u16(self.regs.idtr.limit);
        for sys_seg in [&self.regs.ldtr, &self.regs.tr] {
            w.write_u16(sys_seg.selector);
            w.write_u32(sys_seg.cache.base);
            w.write_u32(sys_seg.cache.limit);
            w.write_u16(sys_seg.cache.access_rights);
            w.write_u8(sys_seg.cache.valid as u8);
        }
        w.write_u8(self.regs.sizes.operand_size_32 as u8);
        w.write_u8(self.regs.sizes.address_size_32 as u8);
        w.write_u8(self.regs.sizes.stack_size_32 as u8);
        w.write_u8(self.halted as u8);
        w.write_u8(self.irq_line as u8);
        w.write_u8(self.nmi_pending as u8);
        w.write_i64(self.execution_downcount);
        w.write_f64(self.frequency_hz);
    }

    pub fn load_state(&mut self, r: &mut StateReader) -> Result<(), StateLoadError> {
        let id = r.read_u32()?;
        if id != CPU_SERIALIZATION_ID {
            return Err(StateLoadError::ComponentSetMismatch {
                expected: vec!["cpu".to_string()],
                found: vec![format!("unknown id {id:#x}")],
            });
        }
        let mut gpr = GeneralRegisters::default();
        for i in 0..8 {
            gpr.set32(INDEXED_REGS[i], r.read_u32()?);
        }
        let eip = r.read_u32()?;
        let flags = Flags::from_bits_retain(r.read_u32()?);
        let mut segments = [Segment::default(); NUM_SEGMENTS];
        for seg in &mut segments {
            seg.selector = r.read_u16()?;
            let base = r.read_u32()?;
            let limit = r.read_u32()?;
            let access_rights = r.read_u16()?;
            let valid = r.read_u8()? != 0;
            seg.cache = SegmentDescriptorCache { base, limit, access_rights, valid };
        }
        let control = ControlRegisters {
            cr0: Cr0::from_bits_retain(r.read_u32()?),
            cr2: r.read_u32()?,
            cr3: r.read_u32()?,
            cr4: Cr4::from_bits_retain(r.read_u32()?),
        };
        let mut debug = DebugRegisters::default();
        for dr in &mut debug.dr {
            *dr = r.read_u32()?;
        }
        let gdtr = DescriptorTableRegister { base: r.read_u32()?, limit: r.read_u16()? };
        let idtr = DescriptorTableRegister { base: r.read_u32()?, limit: r.read_u16()? };
        let mut sys_segs = [SystemSegment::default(); 2];
        for sys_seg in &mut sys_segs {
            sys_seg.selector = r.read_u16()?;
            let base = r.read_u32()?;
            let limit = r.read_u32()?;
            let access_rights = r.read_u16()?;
            let valid = r.read_u8()? != 0;
            sys_seg.cache = SegmentDescriptorCache { base, limit, access_rights, valid };
        }
        let sizes = ExecutionSizes {
            operand_size_32: r.read_u8()? != 0,
            address_size_32: r.read_u8()? != 0,
            stack_size_32: r.read_u8()? != 0,
        };
        self.halted = r.read_u8()? != 0;
        self.irq_line = r.read_u8()? != 0;
        self.nmi_pending = r.read_u8()? != 0;
        self.execution_downcount = r.read_i64()?;
        self.frequency_hz = r.read_f64()?;
        self.cycle_period = cycle_period_ns(self.frequency_hz);

        self.regs = RegisterFile {
            gpr,
            eip,
            flags,
            segments,
            control,
            debug,
            gdtr,
            idtr,
            ldtr: sys_segs[0],
            tr: sys_segs[1],
            sizes,
        };
        self.flush_code_cache();
        Ok(())
    }
}

const CPU_SERIALIZATION_ID: u32 = 0x4350_5531; // "CPU1"

const INDEXED_REGS: [Reg32; 8] = [
    Reg32::Eax,
    Reg32::Ecx,
    Reg32::Edx,
    Reg32::Ebx,
    Reg32::Esp,
    Reg32::Ebp,
    Reg32::Esi,
    Reg32::Edi,
];
