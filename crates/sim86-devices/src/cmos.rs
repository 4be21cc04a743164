//! CMOS RTC/NVRAM: the index/data port pair at 0x70/0x71 gating 128 bytes of battery-backed RAM,
//! with bit 7 of the index byte doubling as the NMI mask per the original IBM PC/AT wiring.
//!
//! `original_source/` does not carry a CMOS implementation (filtered from the retrieval pack), so
//! this follows the well-documented MC146818 register layout directly. Deliberately does not
//! derive register values (seconds/minutes/hours/date) from the host's wall clock: a deterministic
//! simulation substrate cannot let an external clock make two runs of the same scenario diverge,
//! so the clock registers are plain NVRAM bytes like any other index, set by whatever wrote them
//! (a BIOS POST routine, a test fixture, or a loaded save-state) rather than by this device.

use std::cell::RefCell;
use std::rc::Rc;

use sim86_cpu::{Component, ComponentError};
use sim86_mem::Bus;
use sim86_snapshot::{StateLoadError, StateReader, StateWriter};

const IOPORT_INDEX: u16 = 0x70;
const IOPORT_DATA: u16 = 0x71;
const NVRAM_SIZE: usize = 128;
const NMI_MASK_BIT: u8 = 0x80;

const SERIALIZATION_ID: u32 = 0x434D_4F31; // "CMO1"

struct Inner {
    nvram: [u8; NVRAM_SIZE],
    index: u8,
    nmi_masked: bool,
}

impl Inner {
    fn write_index(&mut self, value: u8) {
        self.nmi_masked = value & NMI_MASK_BIT != 0;
        self.index = value & !NMI_MASK_BIT;
    }

    fn read_data(&self) -> u8 {
        self.nvram[self.index as usize % NVRAM_SIZE]
    }

    fn write_data(&mut self, value: u8) {
        self.nvram[self.index as usize % NVRAM_SIZE] = value;
    }
}

/// The real-time clock / non-volatile RAM component.
#[derive(Clone)]
pub struct CmosRtc {
    inner: Rc<RefCell<Inner>>,
}

impl Default for CmosRtc {
    fn default() -> Self {
        Self::new()
    }
}

impl CmosRtc {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                nvram: [0; NVRAM_SIZE],
                index: 0,
                nmi_masked: false,
            })),
        }
    }

    pub fn nmi_masked(&self) -> bool {
        self.inner.borrow().nmi_masked
    }

    pub fn read_byte(&self, register: u8) -> u8 {
        self.inner.borrow().nvram[register as usize % NVRAM_SIZE]
    }

    pub fn write_byte(&self, register: u8, value: u8) {
        self.inner.borrow_mut().nvram[register as usize % NVRAM_SIZE] = value;
    }
}

impl Component for CmosRtc {
    fn name(&self) -> &str {
        "cmos-rtc"
    }

    fn initialize(&mut self, bus: &mut Bus) -> Result<(), ComponentError> {
        let owner = bus.mint_owner_id();
        let ports = bus.ports_mut();

        let write_inner = self.inner.clone();
        ports.connect_write_byte(IOPORT_INDEX, owner, Box::new(move |_, value| write_inner.borrow_mut().write_index(value)));

        let read_inner = self.inner.clone();
        ports.connect_read_byte(IOPORT_DATA, owner, Box::new(move |_| read_inner.borrow().read_data()));
        let write_inner = self.inner.clone();
        ports.connect_write_byte(IOPORT_DATA, owner, Box::new(move |_, value| write_inner.borrow_mut().write_data(value)));

        Ok(())
    }

    fn reset(&mut self, _bus: &mut Bus) {
        let mut inner = self.inner.borrow_mut();
        inner.index = 0;
        inner.nmi_masked = false;
        // NVRAM survives a CPU reset; only the port-protocol state resets.
    }

    fn save_state(&self, w: &mut StateWriter) {
        let inner = self.inner.borrow();
        w.write_u32(SERIALIZATION_ID);
        w.write_u8(inner.index);
        w.write_u8(inner.nmi_masked as u8);
        w.write_bytes(&inner.nvram);
    }

    fn load_state(&mut self, r: &mut StateReader) -> Result<(), StateLoadError> {
        let id = r.read_u32()?;
        if id != SERIALIZATION_ID {
            return Err(StateLoadError::ComponentSetMismatch {
                expected: vec!["cmos-rtc".to_string()],
                found: vec![format!("unknown id {id:#x}")],
            });
        }
        let mut inner = self.inner.borrow_mut();
        inner.index = r.read_u8()?;
        inner.nmi_masked = r.read_u8()? != 0;
        let bytes = r.read_bytes(NVRAM_SIZE)?;
        inner.nvram.copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> Bus {
        let mut bus = Bus::new(20);
        bus.allocate_ram(0x1000);
        bus.create_ram_region(0, 0xFFF);
        bus
    }

    #[test]
    fn index_data_round_trip_through_io_ports() {
        let mut cmos = CmosRtc::new();
        let mut bus = bus();
        cmos.initialize(&mut bus).unwrap();

        bus.write_io_port_byte(IOPORT_INDEX, 0x0E);
        bus.write_io_port_byte(IOPORT_DATA, 0x42);
        bus.write_io_port_byte(IOPORT_INDEX, 0x0E);
        assert_eq!(bus.read_io_port_byte(IOPORT_DATA), 0x42);
    }

    #[test]
    fn high_bit_of_index_sets_nmi_mask_without_affecting_the_selected_register() {
        let mut cmos = CmosRtc::new();
        let mut bus = bus();
        cmos.initialize(&mut bus).unwrap();

        bus.write_io_port_byte(IOPORT_INDEX, 0x80 | 0x0C);
        assert!(cmos.nmi_masked());
        bus.write_io_port_byte(IOPORT_DATA, 0x7F);
        assert_eq!(cmos.read_byte(0x0C), 0x7F);
    }

    #[test]
    fn reset_clears_port_protocol_state_but_preserves_nvram() {
        let mut cmos = CmosRtc::new();
        let mut bus = bus();
        cmos.initialize(&mut bus).unwrap();
        cmos.write_byte(0x10, 0xAB);
        cmos.reset(&mut bus);
        assert_eq!(cmos.read_byte(0x10), 0xAB);
        assert!(!cmos.nmi_masked());
    }
}
