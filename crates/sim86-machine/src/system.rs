//! The orchestrator owning a complete simulated machine (§2/§4.8/§6), grounded directly on
//! `pce::System`/`pce::Systems::PCBase`/`pce::Systems::PCAT`: it is the one place that can see the
//! CPU, the bus, every component, and the scheduler at once, and therefore the only place that
//! can assemble or restore a save-state spanning all of them.

use std::cell::{Cell, RefCell};
use std::fs;
use std::path::Path;
use std::rc::Rc;

use sim86_cpu::Cpu;
use sim86_devices::{CmosRtc, Pic8259, Pit8253};
use sim86_mem::Bus;
use sim86_snapshot::{load_bus, save_bus, StateLoadError, StateReader, StateWriter};
use sim86_time::{cycles_to_time, CycleCount, SimulationTime};
use sim86_timers::Scheduler;

use crate::classes::SystemClass;
use crate::error::{IoError, MachineError};
use crate::host::{HostInterface, NullHostInterface, RunState};

const SYSTEM_SERIALIZATION_ID: u32 = 0x5359_5331; // "SYS1"

/// `pce::System::State`: `Initializing` only ever precedes the first `reset`; once a `System` has
/// been reset it alternates between `Running`/`Paused` until dropped, there being no analogue of
/// `Stopped` teardown here since Rust's destructor already runs every component's `Drop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initializing,
    Running,
    Paused,
}

/// A complete simulated PC: a CPU, a physical bus, a cycle-driven scheduler shared with the
/// timer-producing components, and every `Component` in registration order (`pce::System`'s
/// `m_components` array, walked in the same order for `reset`/`save_state`/`load_state`).
pub struct System {
    class: SystemClass,
    cpu: Cpu,
    bus: Bus,
    scheduler: Rc<RefCell<Scheduler>>,
    components: Vec<Box<dyn sim86_cpu::Component>>,
    cmos: Option<CmosRtc>,
    host: Box<dyn HostInterface>,
    state: State,
    simulation_time: SimulationTime,
    /// Pushed to by the PIC's line callback, polled once per `execute_slice` chunk: `Cpu` has no
    /// reference back to the interrupt controller (see DESIGN.md), so the orchestrator is the
    /// one place that forwards "the INTR line changed" into `Cpu::set_irq_state`.
    irq_line: Rc<Cell<bool>>,
    /// Port 0x92's last written value (`PCAT::IOWriteSystemControlPortA`). Port closures only
    /// ever see the byte being transferred, never the owning `Bus`, so the fast-A20 bit is staged
    /// here and applied to `Bus::set_address_mask` between chunks rather than synchronously.
    a20_control: Option<Rc<Cell<u8>>>,
    /// Pages the bus reports as written-through-code, drained into `Cpu::invalidate_code_page`
    /// after each chunk for the same self-referential-borrow reason: the callback lives inside
    /// `Bus`, which is already mutably borrowed by `Cpu::execute_slice` for the duration of the
    /// call that could trigger it.
    invalidated_pages: Rc<RefCell<Vec<u32>>>,
}

impl System {
    /// Builds the system class's fixed component set (`PCAT::AddComponents`/`SetCMOSVariables`),
    /// with `ram_size` and `cpu_frequency_hz` taken from the parsed `[System]` section or the
    /// class's own defaults.
    pub fn new(class: SystemClass, ram_size: u32, cpu_frequency_hz: f64) -> Self {
        let mut bus = Bus::new(class.address_bits());
        bus.allocate_ram(ram_size);
        // Conventional 640 KiB low memory, then everything above 1 MiB as extended memory
        // (`ISAPC::AllocatePhysicalMemory`'s two largest regions); the 0xA0000-0xFFFFF
        // video/BIOS-ROM hole is left unmapped for MMIO/ROM to claim, matching the original
        // reserving it from RAM entirely.
        let low_end = ram_size.min(0x0009_FFFF + 1);
        bus.create_ram_region(0, low_end);
        if ram_size > 0x0010_0000 {
            bus.create_ram_region(0x0010_0000, ram_size);
        }

        let cpu = Cpu::new(cpu_frequency_hz);
        let scheduler = Rc::new(RefCell::new(Scheduler::new()));

        let mut system = Self {
            class,
            cpu,
            bus,
            scheduler,
            components: Vec::new(),
            cmos: None,
            host: Box::new(NullHostInterface),
            state: State::Initializing,
            simulation_time: 0,
            irq_line: Rc::new(Cell::new(false)),
            a20_control: None,
            invalidated_pages: Rc::new(RefCell::new(Vec::new())),
        };
        system.add_builtin_components(cpu_frequency_hz);
        system
    }

    fn add_builtin_components(&mut self, cpu_frequency_hz: f64) {
        let pic = Pic8259::new();
        let pit = Pit8253::new(self.scheduler.clone(), pic.clone(), cpu_frequency_hz);

        self.cpu.set_irq_ack_callback(Box::new({
            let pic = pic.clone();
            move || pic.acknowledge()
        }));
        pic.set_irq_line_callback(Box::new({
            let irq_line = self.irq_line.clone();
            move |asserted| irq_line.set(asserted)
        }));

        self.components.push(Box::new(pic));
        self.components.push(Box::new(pit));
        if self.class.has_cmos() {
            let cmos = CmosRtc::new();
            self.cmos = Some(cmos.clone());
            self.components.push(Box::new(cmos));
        }
    }

    /// Resolves `[System] Type=` against the built-in class registry and constructs the
    /// corresponding machine, applying `RamSize`/`CpuFrequencyHz` overrides from the config file
    /// (§11). No generic, user-declared component sections are accepted yet — the minimal
    /// peripheral set (§4.9) is entirely built-in per system class, so any extra section can only
    /// name a type that already exists, which is rejected with the same "already a built-in"
    /// error `pce::System::CreateComponent` raises (code 11).
    pub fn from_config(config: &sim86_config::SystemConfig) -> Result<Self, MachineError> {
        let class: SystemClass = config
            .system_type()
            .ok_or(MachineError::MissingSystemType)?
            .parse()?;

        let ram_size = match config.system.get("RamSize") {
            Some(value) => value.parse::<u32>().map_err(|e| MachineError::InvalidProperty {
                section: "System".to_string(),
                key: "RamSize".to_string(),
                value: value.to_string(),
                reason: e.to_string(),
            })?,
            None => class.default_ram_size(),
        };
        let cpu_frequency_hz = match config.system.get("CpuFrequencyHz") {
            Some(value) => value.parse::<f64>().map_err(|e| MachineError::InvalidProperty {
                section: "System".to_string(),
                key: "CpuFrequencyHz".to_string(),
                value: value.to_string(),
                reason: e.to_string(),
            })?,
            None => class.default_cpu_frequency_hz(),
        };

        let system = System::new(class, ram_size, cpu_frequency_hz);

        let mut builtin_types = vec!["i8259-pic", "i8253-pit"];
        if class.has_cmos() {
            builtin_types.push("cmos-rtc");
        }
        for section in &config.components {
            match section.component_type() {
                Some(type_name) if builtin_types.contains(&type_name) => {
                    return Err(MachineError::ComponentAlreadyBuiltin {
                        section: section.name.clone(),
                        component_type: type_name.to_string(),
                    });
                }
                Some(type_name) => {
                    return Err(MachineError::UnknownComponentType {
                        section: section.name.clone(),
                        component_type: type_name.to_string(),
                    });
                }
                None => {
                    return Err(MachineError::MissingComponentType { section: section.name.clone() });
                }
            }
        }

        Ok(system)
    }

    pub fn set_host_interface(&mut self, host: Box<dyn HostInterface>) {
        self.host = host;
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }

    pub fn simulation_time(&self) -> SimulationTime {
        self.simulation_time
    }

    /// Loads `path` as an MMIO-backed ROM at `address` (§6 "ROM files"); `expected_size`, if
    /// given, is checked the way `PCBase::AddMMIOROMFromFile` checks its own `expected_size`
    /// parameter.
    pub fn load_rom_file(
        &mut self,
        path: impl AsRef<Path>,
        address: u32,
        expected_size: Option<u32>,
    ) -> Result<(), IoError> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|source| IoError::Read { path: path.to_path_buf(), source })?;
        if let Some(expected) = expected_size {
            if data.len() as u32 != expected {
                return Err(IoError::SizeMismatch { path: path.to_path_buf(), expected, actual: data.len() as u32 });
            }
        }
        self.bus.create_rom_region_from_buffer(&data, address);
        Ok(())
    }

    const IOPORT_SYSTEM_CONTROL_A: u16 = 0x0092;
    const A20_BIT: u32 = 1 << 20;

    /// One-time setup after every component is in its final configuration (`pce::System::Initialize`):
    /// registers MMIO/port handlers, wires the code-invalidation callback, and (AT-class only) the
    /// fast A20 gate (`PCAT::ConnectSystemIOPorts`) plus the CMOS equipment/memory-size bytes
    /// (`PCAT::SetCMOSVariables`) before the first `reset`.
    pub fn initialize(&mut self) -> Result<(), MachineError> {
        for component in &mut self.components {
            component.initialize(&mut self.bus)?;
        }

        let invalidated = self.invalidated_pages.clone();
        self.bus.set_code_invalidation_callback(Box::new(move |page| invalidated.borrow_mut().push(page)));

        if self.class.has_fast_a20_gate() {
            self.wire_a20_gate();
        }
        if self.class.has_cmos() {
            self.set_cmos_memory_size_bytes();
        }
        self.state = State::Paused;
        Ok(())
    }

    /// `PCAT::IOWriteSystemControlPortA`: bit 1 of port 0x92 is the fast A20 gate. Reads return
    /// whatever was last written (no other bit in this port is modeled; `pce`'s
    /// `m_system_control_port_a.raw` is a single byte round-tripped the same way).
    fn wire_a20_gate(&mut self) {
        let control = Rc::new(Cell::new(0u8));
        let owner = self.bus.mint_owner_id();
        let ports = self.bus.ports_mut();

        let read_control = control.clone();
        ports.connect_read_byte(Self::IOPORT_SYSTEM_CONTROL_A, owner, Box::new(move |_| read_control.get()));
        let write_control = control.clone();
        ports.connect_write_byte(Self::IOPORT_SYSTEM_CONTROL_A, owner, Box::new(move |_, value| write_control.set(value)));

        self.a20_control = Some(control);
        // Gate A20 on by default (`PCAT::Reset`'s `IOWriteSystemControlPortA((1 << 1))`).
        self.bus.set_address_mask(self.bus.address_mask() | Self::A20_BIT);
    }

    fn apply_pending_a20_state(&mut self) {
        let Some(control) = &self.a20_control else { return };
        let asserted = control.get() & 0b10 != 0;
        let mask = self.bus.address_mask();
        let currently_on = mask & Self::A20_BIT != 0;
        if asserted != currently_on {
            self.host.set_indicator("a20", asserted);
            let new_mask = if asserted { mask | Self::A20_BIT } else { mask & !Self::A20_BIT };
            self.bus.set_address_mask(new_mask);
        }
    }

    /// `PCAT::SetCMOSVariables`: base/extended memory size in KiB, low byte then high byte, at the
    /// standard AT CMOS offsets.
    fn set_cmos_memory_size_bytes(&self) {
        let Some(cmos) = &self.cmos else { return };
        let base_kb = (0x0009_FFFF + 1) / 1024;
        let extended_kb = self.bus.ram_size().saturating_sub(0x0010_0000) / 1024;
        cmos.write_byte(0x15, base_kb as u8);
        cmos.write_byte(0x16, (base_kb >> 8) as u8);
        cmos.write_byte(0x17, extended_kb as u8);
        cmos.write_byte(0x18, (extended_kb >> 8) as u8);
    }

    /// Power-on/CPU reset (`pce::System::Reset`): the CPU resets first, then every component in
    /// registration order.
    pub fn reset(&mut self) {
        self.cpu.reset();
        for component in &mut self.components {
            component.reset(&mut self.bus);
        }
        self.state = State::Paused;
    }

    pub fn resume(&mut self) {
        self.state = State::Running;
        self.host.on_state_change(RunState::Running);
    }

    pub fn pause(&mut self) {
        self.state = State::Paused;
        self.host.on_state_change(RunState::Paused);
    }

    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }

    /// Advances the simulation by up to `requested_ns` of simulated time, in chunks no larger
    /// than the scheduler's current downcount (`pce::System::ExecuteSlice` plus the
    /// `UpdateCPUDowncount`/`RunEvents` pair it otherwise relies on the CPU backend to call back
    /// into — here made explicit because `sim86_cpu::Cpu` intentionally has no scheduler handle,
    /// see DESIGN.md). Returns the simulated time actually consumed.
    pub fn execute_slice(&mut self, requested_ns: SimulationTime) -> SimulationTime {
        let start = self.simulation_time;
        let mut remaining_ns = requested_ns;
        let cycle_period = self.cpu.cycle_period();

        while remaining_ns > 0 {
            self.cpu.set_irq_state(self.irq_line.get());
            self.apply_pending_a20_state();

            let downcount_cycles = self.scheduler.borrow().downcount();
            let chunk_ns = if downcount_cycles == CycleCount::MAX {
                remaining_ns
            } else {
                remaining_ns.min(cycles_to_time(downcount_cycles, cycle_period).max(cycle_period))
            };

            self.cpu.add_execution_time(chunk_ns);
            let cycles_executed = self.cpu.execute_slice(&mut self.bus);

            for page in self.invalidated_pages.borrow_mut().drain(..) {
                self.cpu.invalidate_code_page(page);
            }
            // Re-applied here too: a port write inside the chunk just executed may have changed
            // the gate, and a caller inspecting `bus().address_mask()` right after this call
            // returns should see it without needing one more (no-op) chunk to flush it.
            self.apply_pending_a20_state();

            if cycles_executed <= 0 {
                break;
            }
            self.scheduler.borrow_mut().run(cycles_executed);

            let elapsed_ns = cycles_to_time(cycles_executed, cycle_period);
            self.simulation_time += elapsed_ns;
            remaining_ns -= elapsed_ns;
        }

        self.simulation_time - start
    }

    /// The full save-state format (§6): header, bus, CPU, then every component's state, in
    /// registration order, each length-prefixed the way `pce::System::SaveComponentStateHelper`
    /// reserves and backfills a size field so a reader can skip a component it does not
    /// recognize.
    pub fn save_state(&self) -> Vec<u8> {
        let mut w = StateWriter::new();
        w.write_u32(SYSTEM_SERIALIZATION_ID);
        w.write_i64(self.simulation_time);

        let mut bus_w = StateWriter::new();
        save_bus(&self.bus, &mut bus_w);
        w.write_section(&bus_w.into_bytes());

        let mut cpu_w = StateWriter::new();
        self.cpu.save_state(&mut cpu_w);
        w.write_section(&cpu_w.into_bytes());

        w.write_u32(self.components.len() as u32);
        for component in &self.components {
            w.write_string(component.name());
            let mut comp_w = StateWriter::new();
            component.save_state(&mut comp_w);
            w.write_section(&comp_w.into_bytes());
        }

        w.into_bytes()
    }

    /// Restores a save-state produced by `save_state` into an already-constructed `System` built
    /// from the *same* config (same class, same RAM size, same component list) — exactly the
    /// precondition `sim86_snapshot::load_bus`'s own docs state for its bus argument.
    pub fn load_state(&mut self, bytes: &[u8]) -> Result<(), StateLoadError> {
        let mut r = StateReader::new(bytes);
        let id = r.read_u32()?;
        if id != SYSTEM_SERIALIZATION_ID {
            return Err(StateLoadError::SignatureMismatch { expected: SYSTEM_SERIALIZATION_ID, found: id });
        }
        self.simulation_time = r.read_i64()?;

        let bus_bytes = r.read_section()?;
        let mut bus_r = StateReader::new(bus_bytes);
        load_bus(&mut bus_r, &mut self.bus)?;

        let cpu_bytes = r.read_section()?;
        let mut cpu_r = StateReader::new(cpu_bytes);
        self.cpu.load_state(&mut cpu_r)?;
        self.cpu.flush_code_cache();

        let num_components = r.read_u32()?;
        if num_components as usize != self.components.len() {
            return Err(StateLoadError::ComponentSetMismatch {
                expected: self.components.iter().map(|c| c.name().to_string()).collect(),
                found: (0..num_components).map(|i| format!("component #{i}")).collect(),
            });
        }
        for component in &mut self.components {
            let saved_name = r.read_string()?;
            let section_bytes = r.read_section()?;
            if saved_name != component.name() {
                return Err(StateLoadError::ComponentSetMismatch {
                    expected: vec![component.name().to_string()],
                    found: vec![saved_name],
                });
            }
            let mut comp_r = StateReader::new(section_bytes);
            component.load_state(&mut comp_r)?;
        }

        Ok(())
    }
}
