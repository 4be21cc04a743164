//! The Bus section of the save-state format (§6 item 2): "serialization id, page count, address
//! mask, RAM size, full RAM bytes." RAM bytes are LZ4-compressed on disk — real RAM images are
//! mostly zero and compress well, matching `aero-snapshot`'s use of `lz4_flex` for the same
//! reason.

use sim86_mem::Bus;

use crate::io::{StateLoadError, StateReader, StateWriter};

pub const BUS_SERIALIZATION_ID: u32 = 1;

pub fn save_bus(bus: &Bus, w: &mut StateWriter) {
    w.write_u32(BUS_SERIALIZATION_ID);
    w.write_u32(bus.page_count());
    w.write_u32(bus.address_mask());
    w.write_u32(bus.ram_size());
    let compressed = lz4_flex::compress_prepend_size(bus.save_ram_snapshot());
    w.write_section(&compressed);
}

/// Restores the RAM arena and address mask into an already-constructed `Bus` whose page table
/// and MMIO handlers were set up identically to the one that was saved (§13: the address mask
/// *is* restored here, unlike the original implementation this core is modeled on).
pub fn load_bus(r: &mut StateReader, bus: &mut Bus) -> Result<(), StateLoadError> {
    let id = r.read_u32()?;
    if id != BUS_SERIALIZATION_ID {
        return Err(StateLoadError::SignatureMismatch {
            expected: BUS_SERIALIZATION_ID,
            found: id,
        });
    }
    let _page_count = r.read_u32()?;
    let address_mask = r.read_u32()?;
    let ram_size = r.read_u32()?;
    let compressed = r.read_section()?;
    let ram_bytes = lz4_flex::decompress_size_prepended(compressed)
        .map_err(|_| StateLoadError::Truncated { context: "bus RAM (lz4)" })?;
    if ram_bytes.len() as u32 != ram_size {
        return Err(StateLoadError::RamSizeMismatch {
            expected: ram_size,
            found: ram_bytes.len() as u32,
        });
    }
    if !bus.restore_ram_snapshot(&ram_bytes) {
        return Err(StateLoadError::RamSizeMismatch {
            expected: bus.ram_size(),
            found: ram_bytes.len() as u32,
        });
    }
    bus.set_address_mask(address_mask);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_ram_and_address_mask_round_trip() {
        let mut bus = Bus::new(20);
        bus.allocate_ram(0x10000);
        bus.create_ram_region(0, 0x10000);
        bus.write_u32(0x100, 0xCAFEBABE);
        bus.set_address_mask(0xFFFFF);

        let mut w = StateWriter::new();
        save_bus(&bus, &mut w);
        let bytes = w.into_bytes();

        let mut bus2 = Bus::new(20);
        bus2.allocate_ram(0x10000);
        bus2.create_ram_region(0, 0x10000);
        let mut r = StateReader::new(&bytes);
        load_bus(&mut r, &mut bus2).unwrap();

        assert_eq!(bus2.read_u32(0x100), 0xCAFEBABE);
        assert_eq!(bus2.address_mask(), 0xFFFFF);
    }

    #[test]
    fn mismatched_ram_size_is_rejected() {
        let mut bus = Bus::new(20);
        bus.allocate_ram(0x10000);
        bus.create_ram_region(0, 0x10000);
        let mut w = StateWriter::new();
        save_bus(&bus, &mut w);
        let bytes = w.into_bytes();

        let mut bus2 = Bus::new(20);
        bus2.allocate_ram(0x20000);
        bus2.create_ram_region(0, 0x20000);
        let mut r = StateReader::new(&bytes);
        assert!(load_bus(&mut r, &mut bus2).is_err());
    }
}
