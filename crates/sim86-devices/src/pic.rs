//! The i8259 programmable interrupt controller: two cascaded 8-line controllers (master on
//! 0x20/0x21, slave on 0xA0/0xA1, slave IRQ2 feeding the master) presenting the CPU with a single
//! level-triggered INTR line and resolving the vector for whichever line is highest priority when
//! acknowledged.
//!
//! Grounded on `pce/hw/i8259_pic.cpp`: `request_register`/`in_service_register`/`mask_register`
//! priority resolution, the ICW1/OCW2/OCW3 command-port protocol, and the IMR-mirrors-to-data-port
//! behavior are all carried over; only the I/O plumbing (closures over `sim86_mem::IoPortMap`
//! instead of `std::bind` over a `Bus*`) and the CPU hookup (a boxed closure instead of a raw
//! `System*` back-pointer) changed shape.

use std::cell::RefCell;
use std::rc::Rc;

use sim86_mem::Bus;
use sim86_snapshot::{StateLoadError, StateReader, StateWriter};
use sim86_cpu::{Component, ComponentError};

const NUM_PICS: usize = 2;
const NUM_INTERRUPTS_PER_PIC: u8 = 8;
const MASTER_PIC: usize = 0;
const SLAVE_PIC: usize = 1;
const SLAVE_IRQ_ON_MASTER: u8 = 2;

const IOPORT_MASTER_COMMAND: u16 = 0x20;
const IOPORT_MASTER_DATA: u16 = 0x21;
const IOPORT_SLAVE_COMMAND: u16 = 0xA0;
const IOPORT_SLAVE_DATA: u16 = 0xA1;

const COMMAND_MASK: u8 = 0x18;
const COMMAND_ICW1: u8 = 0x10;
const COMMAND_OCW3: u8 = 0x08;

const OCW2_EOI: u8 = 0x20;
const OCW2_EOI_SPECIFIC: u8 = 0x60;

const OCW3_READ_IRR: u8 = 0x02;
const OCW3_READ_ISR: u8 = 0x03;

const ICW4_AUTO_EOI: u8 = 0x02;
const NUM_ICW_VALUES: u8 = 4;

const SERIALIZATION_ID: u32 = 0x5049_4331; // "PIC1"

#[derive(Clone, Copy)]
struct PicState {
    request_register: u8,
    in_service_register: u8,
    mask_register: u8,
    level_triggered: u8,
    vector_offset: u8,
    interrupt_line_status: u8,
    icw_values: [u8; NUM_ICW_VALUES as usize],
    icw_index: u8,
    read_isr: bool,
}

impl Default for PicState {
    /// `icw_index` starts at `NUM_ICW_VALUES` ("not awaiting initialization") rather than 0: a
    /// PIC that has never seen an ICW1 write still treats data-port writes as IMR updates, not as
    /// ICW continuation bytes.
    fn default() -> Self {
        Self {
            request_register: 0,
            in_service_register: 0,
            mask_register: 0,
            level_triggered: 0,
            vector_offset: 0,
            interrupt_line_status: 0,
            icw_values: [0; NUM_ICW_VALUES as usize],
            icw_index: NUM_ICW_VALUES,
            read_isr: false,
        }
    }
}

impl PicState {
    fn highest_priority_request(&self) -> Option<u8> {
        let pending = self.request_register & !self.mask_register & !self.in_service_register;
        if pending == 0 {
            None
        } else {
            Some(pending.trailing_zeros() as u8)
        }
    }

    fn highest_priority_in_service(&self) -> Option<u8> {
        if self.in_service_register == 0 {
            None
        } else {
            Some(self.in_service_register.trailing_zeros() as u8)
        }
    }

    fn has_interrupt_request(&self) -> bool {
        let pending = self.request_register & !self.mask_register & !self.in_service_register;
        let Some(irq) = (if pending == 0 { None } else { Some(pending.trailing_zeros() as u8) }) else {
            return false;
        };
        match self.highest_priority_in_service() {
            Some(in_service_irq) => in_service_irq > irq,
            None => true,
        }
    }

    fn is_auto_eoi(&self) -> bool {
        self.icw_values[3] & ICW4_AUTO_EOI != 0
    }

    fn is_level_triggered(&self, irq: u8) -> bool {
        self.level_triggered & (1 << irq) != 0
    }
}

struct Inner {
    pics: [PicState; NUM_PICS],
    /// Invoked whenever the master PIC's resolved INTR line changes level; wired by the owning
    /// system to `Cpu::set_irq_state`. `None` until `initialize` is driven by an orchestrator that
    /// supplies one via [`Pic8259::set_irq_line_callback`].
    irq_line_callback: Option<Box<dyn FnMut(bool)>>,
    last_intr_state: bool,
}

impl Inner {
    fn update_interrupt_request(&mut self) {
        let slave_requesting = self.pics[SLAVE_PIC].has_interrupt_request();
        self.set_interrupt_state(SLAVE_IRQ_ON_MASTER as u32, slave_requesting);

        let intr = self.pics[MASTER_PIC].has_interrupt_request();
        if intr != self.last_intr_state {
            self.last_intr_state = intr;
            if let Some(cb) = &mut self.irq_line_callback {
                cb(intr);
            }
        }
    }

    fn set_interrupt_state(&mut self, interrupt: u32, active: bool) {
        let pic_index = (interrupt / NUM_INTERRUPTS_PER_PIC as u32) as usize;
        let interrupt_number = (interrupt % NUM_INTERRUPTS_PER_PIC as u32) as u8;
        if pic_index >= NUM_PICS {
            return;
        }
        let pic = &mut self.pics[pic_index];
        let bit = 1u8 << interrupt_number;
        let current = (pic.interrupt_line_status >> interrupt_number) & 1 != 0;
        if current == active {
            return;
        }
        if active {
            pic.interrupt_line_status |= bit;
        } else {
            pic.interrupt_line_status &= !bit;
        }
        if active {
            pic.request_register |= bit;
        } else if pic.is_level_triggered(interrupt_number) {
            pic.request_register &= !bit;
        }
        self.update_interrupt_request();
    }

    /// The acknowledge cycle (§4.3 "irq_ack"): resolves the highest-priority pending line across
    /// both controllers, sets its in-service bit (unless auto-EOI), clears edge-triggered IRR, and
    /// returns the absolute vector. Cascaded slave IRQs are folded through `SLAVE_IRQ_ON_MASTER`.
    fn acknowledge(&mut self) -> u8 {
        let master = &mut self.pics[MASTER_PIC];
        let Some(irq) = master.highest_priority_request() else {
            let vector_offset = master.vector_offset;
            self.update_interrupt_request();
            return vector_offset.wrapping_add(7);
        };
        let mut interrupt_number = master.vector_offset.wrapping_add(irq);
        let bit = 1u8 << irq;
        if !master.is_auto_eoi() {
            master.in_service_register |= bit;
        }
        if !master.is_level_triggered(irq) {
            master.request_register &= !bit;
        }

        if irq == SLAVE_IRQ_ON_MASTER {
            let slave = &mut self.pics[SLAVE_PIC];
            if let Some(slave_irq) = slave.highest_priority_request() {
                interrupt_number = slave.vector_offset.wrapping_add(slave_irq);
                let slave_bit = 1u8 << slave_irq;
                if !slave.is_auto_eoi() {
                    slave.in_service_register |= slave_bit;
                }
                if !slave.is_level_triggered(slave_irq) {
                    slave.request_register &= !slave_bit;
                }
            } else {
                interrupt_number = slave.vector_offset.wrapping_add(7);
            }
        }

        self.update_interrupt_request();
        interrupt_number
    }

    fn command_port_read(&self, pic_index: usize) -> u8 {
        let pic = &self.pics[pic_index];
        if pic.read_isr {
            pic.in_service_register
        } else {
            pic.request_register
        }
    }

    fn command_port_write(&mut self, pic_index: usize, value: u8) {
        let command_type = value & COMMAND_MASK;
        if command_type == COMMAND_ICW1 {
            let pic = &mut self.pics[pic_index];
            pic.icw_values[0] = value;
            pic.icw_index = 1;
            pic.mask_register = 0;
            pic.in_service_register = 0;
            pic.request_register = 0;
        } else if command_type == COMMAND_OCW3 {
            let pic = &mut self.pics[pic_index];
            match value & !COMMAND_MASK {
                OCW3_READ_IRR => pic.read_isr = false,
                OCW3_READ_ISR => pic.read_isr = true,
                _ => {}
            }
        } else {
            // OCW2.
            let ocw2_type = value & 0xE0;
            if ocw2_type & OCW2_EOI != 0 {
                let pic = &mut self.pics[pic_index];
                let interrupt = if ocw2_type & OCW2_EOI_SPECIFIC == OCW2_EOI_SPECIFIC {
                    let specific = value & 0x07;
                    if pic.in_service_register & (1 << specific) == 0 {
                        return;
                    }
                    specific
                } else {
                    match pic.highest_priority_in_service() {
                        Some(irq) => irq,
                        None => return,
                    }
                };
                pic.in_service_register &= !(1 << interrupt);
                self.update_interrupt_request();
            }
        }
    }

    fn data_port_write(&mut self, pic_index: usize, value: u8) {
        let pic = &mut self.pics[pic_index];
        if pic.icw_index != NUM_ICW_VALUES {
            pic.icw_values[pic.icw_index as usize] = value;
            pic.icw_index += 1;

            // Single-mode PICs skip ICW3 (no cascade wiring to describe).
            if pic.icw_values[0] & 0x02 != 0 && pic.icw_index == 2 {
                pic.icw_index += 1;
            }

            let needs_icw4 = pic.icw_values[0] & 0x01 != 0;
            if (!needs_icw4 && pic.icw_index == NUM_ICW_VALUES - 1) || pic.icw_index == NUM_ICW_VALUES {
                pic.icw_index = NUM_ICW_VALUES;
                pic.vector_offset = pic.icw_values[1];
                self.update_interrupt_request();
            }
        } else {
            pic.mask_register = value;
            self.update_interrupt_request();
        }
    }
}

/// A cheap handle to the shared controller state; cloning gives another owner the ability to
/// raise/lower IRQ lines (e.g. [`crate::pit::Pit8253`] driving IRQ0) without sharing mutable
/// access any other way than through the `RefCell`, matching the single-threaded cooperative
/// model the rest of the workspace uses for device wiring (`Rc<dyn MmioHandler>` in `sim86-mem`).
#[derive(Clone)]
pub struct Pic8259 {
    inner: Rc<RefCell<Inner>>,
}

impl Default for Pic8259 {
    fn default() -> Self {
        Self::new()
    }
}

impl Pic8259 {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                pics: [PicState::default(); NUM_PICS],
                irq_line_callback: None,
                last_intr_state: false,
            })),
        }
    }

    /// Wires the master PIC's resolved INTR line to the owning system's CPU, typically
    /// `cpu.set_irq_state`. Call before `reset` so the initial (inactive) state is observed too.
    pub fn set_irq_line_callback(&self, callback: Box<dyn FnMut(bool)>) {
        self.inner.borrow_mut().irq_line_callback = Some(callback);
    }

    /// Raises or lowers one of the 16 cascaded IRQ lines (0-7 master, 8-15 slave). Edge-triggered
    /// lines latch on the low-to-high transition; level-triggered lines track the live level.
    pub fn set_irq_line(&self, irq: u8, asserted: bool) {
        self.inner.borrow_mut().set_interrupt_state(irq as u32, asserted);
    }

    /// Runs the interrupt-acknowledge cycle and returns the vector to deliver. Intended to be
    /// wired into `Cpu::set_irq_ack_callback`.
    pub fn acknowledge(&self) -> u8 {
        self.inner.borrow_mut().acknowledge()
    }

    pub fn interrupt_line_state(&self) -> bool {
        self.inner.borrow().last_intr_state
    }
}

impl Component for Pic8259 {
    fn name(&self) -> &str {
        "i8259-pic"
    }

    fn initialize(&mut self, bus: &mut Bus) -> Result<(), ComponentError> {
        let owner = bus.mint_owner_id();
        let ports = bus.ports_mut();

        let read_inner = self.inner.clone();
        ports.connect_read_byte(
            IOPORT_MASTER_COMMAND,
            owner,
            Box::new(move |_| read_inner.borrow().command_port_read(MASTER_PIC)),
        );
        let read_inner = self.inner.clone();
        ports.connect_read_byte(
            IOPORT_SLAVE_COMMAND,
            owner,
            Box::new(move |_| read_inner.borrow().command_port_read(SLAVE_PIC)),
        );
        let write_inner = self.inner.clone();
        ports.connect_write_byte(
            IOPORT_MASTER_COMMAND,
            owner,
            Box::new(move |_, value| write_inner.borrow_mut().command_port_write(MASTER_PIC, value)),
        );
        let write_inner = self.inner.clone();
        ports.connect_write_byte(
            IOPORT_SLAVE_COMMAND,
            owner,
            Box::new(move |_, value| write_inner.borrow_mut().command_port_write(SLAVE_PIC, value)),
        );

        let read_inner = self.inner.clone();
        ports.connect_read_byte(
            IOPORT_MASTER_DATA,
            owner,
            Box::new(move |_| read_inner.borrow().pics[MASTER_PIC].mask_register),
        );
        let read_inner = self.inner.clone();
        ports.connect_read_byte(
            IOPORT_SLAVE_DATA,
            owner,
            Box::new(move |_| read_inner.borrow().pics[SLAVE_PIC].mask_register),
        );
        let write_inner = self.inner.clone();
        ports.connect_write_byte(
            IOPORT_MASTER_DATA,
            owner,
            Box::new(move |_, value| write_inner.borrow_mut().data_port_write(MASTER_PIC, value)),
        );
        let write_inner = self.inner.clone();
        ports.connect_write_byte(
            IOPORT_SLAVE_DATA,
            owner,
            Box::new(move |_, value| write_inner.borrow_mut().data_port_write(SLAVE_PIC, value)),
        );

        Ok(())
    }

    fn reset(&mut self, _bus: &mut Bus) {
        let mut inner = self.inner.borrow_mut();
        for pic in &mut inner.pics {
            *pic = PicState::default();
        }
        // HLE-BIOS default vector offsets, matching a freshly-POSTed PC before the BIOS
        // re-programs them via ICW2.
        inner.pics[MASTER_PIC].vector_offset = 0x08;
        inner.pics[SLAVE_PIC].vector_offset = 0x70;
        inner.update_interrupt_request();
    }

    fn save_state(&self, w: &mut StateWriter) {
        let inner = self.inner.borrow();
        w.write_u32(SERIALIZATION_ID);
        for pic in &inner.pics {
            w.write_u8(pic.request_register);
            w.write_u8(pic.in_service_register);
            w.write_u8(pic.mask_register);
            w.write_u8(pic.level_triggered);
            w.write_u8(pic.vector_offset);
            w.write_u8(pic.interrupt_line_status);
            w.write_bytes(&pic.icw_values);
            w.write_u8(pic.icw_index);
            w.write_u8(pic.read_isr as u8);
        }
    }

    fn load_state(&mut self, r: &mut StateReader) -> Result<(), StateLoadError> {
        let id = r.read_u32()?;
        if id != SERIALIZATION_ID {
            return Err(StateLoadError::ComponentSetMismatch {
                expected: vec!["i8259-pic".to_string()],
                found: vec![format!("unknown id {id:#x}")],
            });
        }
        let mut inner = self.inner.borrow_mut();
        for pic in &mut inner.pics {
            pic.request_register = r.read_u8()?;
            pic.in_service_register = r.read_u8()?;
            pic.mask_register = r.read_u8()?;
            pic.level_triggered = r.read_u8()?;
            pic.vector_offset = r.read_u8()?;
            pic.interrupt_line_status = r.read_u8()?;
            let bytes = r.read_bytes(NUM_ICW_VALUES as usize)?;
            pic.icw_values.copy_from_slice(bytes);
            pic.icw_index = r.read_u8()?;
            pic.read_isr = r.read_u8()? != 0;
        }
        inner.update_interrupt_request();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn bus() -> Bus {
        let mut bus = Bus::new(20);
        bus.allocate_ram(0x1000);
        bus.create_ram_region(0, 0xFFF);
        bus
    }

    #[test]
    fn reset_programs_the_hle_bios_vector_offsets() {
        let mut pic = Pic8259::new();
        let mut bus = bus();
        pic.initialize(&mut bus).unwrap();
        pic.reset(&mut bus);
        pic.set_irq_line(0, true);
        assert_eq!(pic.acknowledge(), 0x08);
    }

    #[test]
    fn masked_irq_does_not_assert_intr() {
        let mut pic = Pic8259::new();
        let mut bus = bus();
        pic.initialize(&mut bus).unwrap();
        pic.reset(&mut bus);
        bus.write_io_port_byte(IOPORT_MASTER_DATA, 0x01); // mask IRQ0
        pic.set_irq_line(0, true);
        assert!(!pic.interrupt_line_state());
    }

    #[test]
    fn cascaded_slave_irq_resolves_through_master_offset() {
        let mut pic = Pic8259::new();
        let mut bus = bus();
        pic.initialize(&mut bus).unwrap();
        pic.reset(&mut bus);
        pic.set_irq_line(8, true); // slave IRQ0
        assert!(pic.interrupt_line_state());
        assert_eq!(pic.acknowledge(), 0x70);
    }

    #[test]
    fn icw_initialization_sequence_sets_vector_offset() {
        let mut pic = Pic8259::new();
        let mut bus = bus();
        pic.initialize(&mut bus).unwrap();
        bus.write_io_port_byte(IOPORT_MASTER_COMMAND, 0x11); // ICW1, ICW4 present, no cascade skip
        bus.write_io_port_byte(IOPORT_MASTER_DATA, 0x20); // ICW2: vector base 0x20
        bus.write_io_port_byte(IOPORT_MASTER_DATA, 0x04); // ICW3 (ignored, no single-mode bit)
        bus.write_io_port_byte(IOPORT_MASTER_DATA, 0x01); // ICW4
        pic.set_irq_line(1, true);
        assert_eq!(pic.acknowledge(), 0x21);
    }

    #[test]
    fn irq_line_callback_observes_level_transitions() {
        let pic = Pic8259::new();
        let seen = Rc::new(Cell::new(false));
        let sink = seen.clone();
        pic.set_irq_line_callback(Box::new(move |state| sink.set(state)));
        pic.set_irq_line(0, true);
        assert!(seen.get());
        pic.set_irq_line(0, false);
        assert!(!seen.get());
    }
}
