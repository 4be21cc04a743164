//! The six end-to-end scenarios this workspace's testable properties are built around, driven
//! through a complete [`System`] with small synthetic byte patterns standing in for the real
//! `test186`/`test386` binaries (not vendored into this repository).
//!
//! S5 (two periodic scheduler events over a slice) needs no `System` at all and is covered
//! directly against `sim86_timers::Scheduler` by
//! `sim86-timers/tests/scheduler_integration.rs::scenario_s5_two_periodic_events_over_a_slice`.

use std::cell::RefCell;
use std::rc::Rc;

use sim86_machine::{System, SystemClass};
use sim86_mem::MmioHandler;

fn write_bytes(system: &mut System, address: u32, bytes: &[u8]) {
    for (i, b) in bytes.iter().enumerate() {
        system.bus_mut().write_u8(address + i as u32, *b);
    }
}

/// S1: a ROM at the CPU's reset vector writes a known pattern into RAM, then halts. Stands in for
/// loading `test186/add.bin` at `0xF0000` and expecting `res_add.bin`'s bytes in RAM once halted.
#[test]
fn scenario_s1_reset_vector_rom_runs_to_halt_and_writes_ram() {
    let mut system = System::new(SystemClass::IsaPc, 0x20000, 4_772_728.0);

    // mov al, 0x42 ; mov [0x1000], al ; hlt
    let code = [0xB0, 0x42, 0xA2, 0x00, 0x10, 0xF4];
    system.bus_mut().create_rom_region_from_buffer(&code, 0xFFFF0);
    system.initialize().unwrap();
    system.reset();

    for _ in 0..10 {
        if system.cpu().is_halted() {
            break;
        }
        system.execute_slice(10_000);
    }

    assert!(system.cpu().is_halted());
    assert_eq!(system.bus_mut().read_u8(0x1000), 0x42);
}

/// S2: a diagnostic output port (analogous to `test386`'s port `0x0190` POST codes) accumulates
/// every byte written to it while the program runs.
#[test]
fn scenario_s2_diagnostic_port_writes_are_observed_in_order() {
    let mut system = System::new(SystemClass::IbmPcAt, 0x20000, 2_000_000.0);

    let log = Rc::new(RefCell::new(Vec::new()));
    let owner = system.bus_mut().mint_owner_id();
    let sink = log.clone();
    system.bus_mut().ports_mut().connect_write_byte(
        0x0190,
        owner,
        Box::new(move |_port, value| sink.borrow_mut().push(value)),
    );

    // mov al, 0x99 ; mov dx, 0x190 ; out dx, al ; mov al, 0xAA ; out dx, al ; hlt
    let code = [0xB0, 0x99, 0xBA, 0x90, 0x01, 0xEE, 0xB0, 0xAA, 0xEE, 0xF4];
    system.bus_mut().create_rom_region_from_buffer(&code, 0xFFFF0);
    system.initialize().unwrap();
    system.reset();

    for _ in 0..10 {
        if system.cpu().is_halted() {
            break;
        }
        system.execute_slice(10_000);
    }

    assert!(system.cpu().is_halted());
    assert_eq!(*log.borrow(), vec![0x99, 0xAA]);
}

/// S3: a dword written to the bus reads back as its four little-endian bytes.
#[test]
fn scenario_s3_bus_round_trip() {
    let mut system = System::new(SystemClass::IsaPc, 4 * 1024 * 1024, 4_772_728.0);
    system.bus_mut().write_u32(0x1000, 0xDEADBEEF);
    assert_eq!(system.bus_mut().read_u8(0x1000), 0xEF);
    assert_eq!(system.bus_mut().read_u8(0x1001), 0xBE);
    assert_eq!(system.bus_mut().read_u8(0x1002), 0xAD);
    assert_eq!(system.bus_mut().read_u8(0x1003), 0xDE);
}

struct RecordingByteMmio {
    offsets: Rc<RefCell<Vec<u64>>>,
}

impl MmioHandler for RecordingByteMmio {
    fn read_u8(&self, offset: u64) -> u8 {
        self.offsets.borrow_mut().push(offset);
        0
    }
}

/// S4: an 8-bit-only MMIO handler's default width synthesis turns one 32-bit read into four
/// byte-reader calls at offsets 0-3, assembled little-endian.
#[test]
fn scenario_s4_mmio_width_split() {
    let mut system = System::new(SystemClass::IsaPc, 0x20000, 4_772_728.0);
    let offsets = Rc::new(RefCell::new(Vec::new()));
    let handler = Rc::new(RecordingByteMmio { offsets: offsets.clone() });
    system.bus_mut().register_mmio(0xA0000, 0x20000, handler);

    let _ = system.bus_mut().read_u32(0xA0000);

    assert_eq!(*offsets.borrow(), vec![0, 1, 2, 3]);
}

/// S6: a page marked as code gets a block compiled from it; a CPU write to that page is observed
/// (the stale cached block keeps running until the chunk boundary, matching this workspace's
/// deferred invalidation design — see DESIGN.md); the next fetch of that address after the
/// orchestrator drains the invalidation recompiles from the new bytes.
#[test]
fn scenario_s6_self_modifying_code_recompiles_after_invalidation() {
    let mut system = System::new(SystemClass::IsaPc, 0x20000, 4_772_728.0);

    // Far jump from the reset vector into RAM at CS:IP = 1000:0000 (linear 0x10000).
    system.bus_mut().create_rom_region_from_buffer(&[0xEA, 0x00, 0x00, 0x00, 0x10], 0xFFFF0);

    // At 0x10000: mov ax,0x1000 ; mov ds,ax ; mov al,0xF4 ; mov [0x0000],al ; jmp $-12
    // The mov overwrites this very block's first byte (0xB8) with 0xF4 (HLT) and the jmp loops
    // back to the block's own start address.
    let loop_body = [0xB8, 0x00, 0x10, 0x8E, 0xD8, 0xB0, 0xF4, 0xA2, 0x00, 0x00, 0xEB, 0xF4];
    write_bytes(&mut system, 0x10000, &loop_body);

    system.initialize().unwrap();
    system.bus_mut().mark_page_as_code(0x10000);
    system.reset();

    // First chunk: the cached block (compiled before the self-modifying write took effect) keeps
    // replaying until the chunk's downcount is spent; the CPU does not halt yet.
    system.execute_slice(5_000);
    assert!(!system.cpu().is_halted());
    assert_eq!(system.cpu().execution_stats().blocks_compiled, 1);

    // Subsequent chunks drain the invalidation queued by the self-modifying write and, on the
    // first fetch of the same address afterward, recompile from the now-patched bytes (which
    // begin with HLT).
    for _ in 0..10 {
        if system.cpu().is_halted() {
            break;
        }
        system.execute_slice(5_000);
    }

    assert!(system.cpu().is_halted());
    assert_eq!(system.cpu().execution_stats().blocks_compiled, 2);
}

/// The fast A20 gate (AT-class only): port 0x92 bit 1 toggles bit 20 of the bus's address mask,
/// and is asserted by default after `initialize` the way `PCAT::Reset` leaves it.
#[test]
fn fast_a20_gate_defaults_on_and_toggles_with_port_0x92() {
    let mut system = System::new(SystemClass::IbmPcAt, 0x20000, 2_000_000.0);
    system.initialize().unwrap();
    assert_eq!(system.bus().address_mask() & (1 << 20), 1 << 20);

    // mov al, 0x00 ; out 0x92, al ; hlt  (drop A20)
    let code = [0xB0, 0x00, 0xE6, 0x92, 0xF4];
    system.bus_mut().create_rom_region_from_buffer(&code, 0xFFFF0);
    system.reset();
    for _ in 0..10 {
        if system.cpu().is_halted() {
            break;
        }
        system.execute_slice(10_000);
    }

    assert!(system.cpu().is_halted());
    assert_eq!(system.bus().address_mask() & (1 << 20), 0);
}

/// A save/load round trip through `System::save_state`/`load_state` restores RAM contents and
/// CPU halted state into a freshly constructed machine built from the same configuration.
#[test]
fn save_and_load_state_round_trip() {
    let mut system = System::new(SystemClass::IsaPc, 0x20000, 4_772_728.0);
    let code = [0xB0, 0x42, 0xA2, 0x00, 0x10, 0xF4];
    system.bus_mut().create_rom_region_from_buffer(&code, 0xFFFF0);
    system.initialize().unwrap();
    system.reset();
    for _ in 0..10 {
        if system.cpu().is_halted() {
            break;
        }
        system.execute_slice(10_000);
    }
    assert!(system.cpu().is_halted());

    let snapshot = system.save_state();

    let mut restored = System::new(SystemClass::IsaPc, 0x20000, 4_772_728.0);
    restored.bus_mut().create_rom_region_from_buffer(&code, 0xFFFF0);
    restored.initialize().unwrap();
    restored.load_state(&snapshot).unwrap();

    assert!(restored.cpu().is_halted());
    assert_eq!(restored.bus_mut().read_u8(0x1000), 0x42);
}
