use std::cell::RefCell;
use std::rc::Rc;

use sim86_mem::{complex, Bus, MmioHandlers};

fn ram_bus(address_bits: u32, ram_size: u32) -> Bus {
    let mut bus = Bus::new(address_bits);
    bus.allocate_ram(ram_size);
    bus.create_ram_region(0, ram_size);
    bus
}

/// Testable property: a byte/word/dword/qword write followed by reads at every narrower width
/// observes little-endian decomposition, regardless of whether the page is RAM or MMIO-backed.
#[test]
fn property_little_endian_decomposition_ram() {
    let mut bus = ram_bus(20, 0x10000);
    bus.write_u32(0x40, 0x0102_0304);
    assert_eq!(bus.read_u8(0x40), 0x04);
    assert_eq!(bus.read_u8(0x41), 0x03);
    assert_eq!(bus.read_u8(0x42), 0x02);
    assert_eq!(bus.read_u8(0x43), 0x01);
    assert_eq!(bus.read_u16(0x40), 0x0304);
    assert_eq!(bus.read_u32(0x40), 0x0102_0304);
}

/// Scenario: a device registers only a word handler; byte accesses must decompose through it via
/// the trait-default synthesis, and an unimplemented qword read falls back through dword->word.
#[test]
fn scenario_word_only_handler_byte_and_qword_access() {
    let mut bus = ram_bus(20, 0x10000);
    let backing = Rc::new(RefCell::new(0u16));
    let backing_r = backing.clone();
    let backing_w = backing.clone();
    let handlers = MmioHandlers {
        read_word: Some(Box::new(move |_off| *backing_r.borrow())),
        write_word: Some(Box::new(move |_off, v| *backing_w.borrow_mut() = v)),
        ..Default::default()
    };
    let handler = complex(handlers);
    bus.register_mmio(0x8000, 0x10, handler);

    bus.write_u16(0x8000, 0xBEEF);
    assert_eq!(*backing.borrow(), 0xBEEF);
    assert_eq!(bus.read_u8(0x8000), 0xEF);
    assert_eq!(bus.read_u8(0x8001), 0xBE);
    assert_eq!(bus.read_u32(0x8000), 0x0000_BEEF);
}

/// Scenario: marking a page as cached code, then writing to it through RAM, fires the
/// invalidation callback exactly once and clears the flag so a second write doesn't re-fire.
#[test]
fn scenario_code_cache_invalidation_on_write() {
    let mut bus = ram_bus(20, 0x10000);
    let invalidations = Rc::new(RefCell::new(Vec::new()));
    let sink = invalidations.clone();
    bus.set_code_invalidation_callback(Box::new(move |addr| sink.borrow_mut().push(addr)));

    bus.mark_page_as_code(0x2000);
    bus.write_u8(0x2050, 0x90);
    bus.write_u8(0x2060, 0x90);
    assert_eq!(*invalidations.borrow(), vec![0x2000]);
}

/// Scenario: a read-only RAM region (e.g. shadowed BIOS) drops writes and a write-only MMIO
/// region returns all-ones on read; both are a consequence of `set_pages_ram_state` and the
/// MMIO read/write handler defaults respectively.
#[test]
fn scenario_read_only_ram_drops_writes() {
    let mut bus = ram_bus(20, 0x10000);
    bus.write_u8(0x3000, 0xAA);
    bus.set_page_ram_state(0x3000, true, false);
    bus.write_u8(0x3000, 0xFF);
    assert_eq!(bus.read_u8(0x3000), 0xAA);
}

#[test]
fn rom_region_is_mmio_backed_and_read_only() {
    let mut bus = Bus::new(20);
    let rom_bytes = vec![0xDE, 0xAD, 0xBE, 0xEF];
    bus.create_rom_region_from_buffer(&rom_bytes, 0xF0000);
    assert_eq!(bus.read_u32(0xF0000), 0xEFBE_ADDE);
    bus.write_u32(0xF0000, 0);
    assert_eq!(bus.read_u32(0xF0000), 0xEFBE_ADDE);
}

#[test]
fn io_port_decomposition_matches_memory_decomposition() {
    let mut bus = Bus::new(20);
    let value = Rc::new(RefCell::new(0u8));
    let v1 = value.clone();
    let v2 = value.clone();
    bus.ports_mut()
        .connect_read_byte(0x60, 1, Box::new(move |_| *v1.borrow()));
    bus.ports_mut()
        .connect_write_byte(0x60, 1, Box::new(move |_, val| *v2.borrow_mut() = val));
    bus.write_io_port_byte(0x60, 0x42);
    assert_eq!(bus.read_io_port_byte(0x60), 0x42);
    // No handler at all on an adjacent unmapped port: falls back to all-ones.
    assert_eq!(bus.read_io_port_byte(0x61), 0xFF);
}
