//! The physical bus: §3 "Physical memory map" / §4.1 "Bus".
//!
//! Address space is partitioned into 4 KiB pages. Each page is unmapped, RAM-only, MMIO, or a
//! hybrid of RAM and MMIO sub-ranges. A page additionally carries a lock-flag set used by the
//! cached interpreter/recompiler to detect writes to code, plus a "fast path" flag that is set
//! iff the page is pure RAM with no locks and no MMIO (the invariant in §3).

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;

use crate::diag::log_warn;
use crate::mmio::MmioHandler;
use crate::ports::{IoPortMap, OwnerId};

pub const PAGE_SIZE: u32 = 0x1000;
pub const PAGE_OFFSET_MASK: u32 = PAGE_SIZE - 1;
pub const PAGE_SHIFT: u32 = 12;

bitflags! {
    /// The "lock" flag set of §3: `{ReadLocked, WriteLocked, CodeCached, Mirror}`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageLock: u8 {
        const READ_LOCKED  = 0b0001;
        const WRITE_LOCKED = 0b0010;
        const CODE_CACHED  = 0b0100;
        const MIRROR       = 0b1000;
    }
}

/// Which lock kind an access should honor: a read only trips `READ_LOCKED`, a write only trips
/// `WRITE_LOCKED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

pub type MmioId = u32;

struct MmioSlot {
    start: u32,
    end: u32, // inclusive
    handler: Rc<dyn MmioHandler>,
}

struct RomRegion {
    data: Rc<RefCell<Vec<u8>>>,
    mmio_id: MmioId,
    base: u32,
    size: u32,
}

#[derive(Default)]
struct Page {
    /// Offset into the RAM arena corresponding to this page's byte 0, if any part of the page is
    /// RAM-backed.
    ram_base: Option<u32>,
    ram_start_offset: u16,
    ram_end_offset: u16,
    /// MMIO handlers overlapping this page, kept sorted descending by start address so the first
    /// covering range always wins ties (§4.1 "Ordering/tie-breaks").
    mmio: Vec<MmioId>,
    mmio_start_offset: u16,
    mmio_end_offset: u16,
    lock: PageLock,
    /// Non-null (in spec terms) iff the page is pure RAM, `ram_start_offset == 0`,
    /// `ram_end_offset == PAGE_SIZE`, no MMIO and no locks.
    fast_path: bool,
}

impl Page {
    fn recompute_fast_path(&mut self) {
        self.fast_path = self.ram_base.is_some()
            && self.ram_start_offset == 0
            && self.ram_end_offset as u32 == PAGE_SIZE
            && self.mmio.is_empty()
            && self.lock.is_empty();
    }

    fn has_mmio_envelope(&self, offset: u32) -> bool {
        !self.mmio.is_empty()
            && offset >= self.mmio_start_offset as u32
            && offset <= self.mmio_end_offset as u32
    }

    fn has_ram_subrange(&self, offset: u32, size: u32) -> bool {
        self.ram_base.is_some()
            && offset >= self.ram_start_offset as u32
            && offset + size <= self.ram_end_offset as u32
    }
}

pub struct Bus {
    address_mask: u32,
    pages: Vec<Page>,
    ram: Vec<u8>,
    ram_size: u32,
    ram_assigned: u32,
    mmio_slots: Vec<Option<MmioSlot>>,
    rom_regions: Vec<RomRegion>,
    ports: IoPortMap,
    code_invalidate_callback: Option<Box<dyn FnMut(u32)>>,
    locked_access_callback: Option<Box<dyn FnMut(u32)>>,
    next_owner_id: OwnerId,
}

impl Bus {
    /// `memory_address_bits` is the CPU's address-bus width (20 for 8086, 24 for 286, 32 for
    /// 386+); the address mask defaults to the maximum representable address, which is also how
    /// the A20 gate is modeled (clearing bit 20 narrows the mask to emulate 8086 wraparound).
    pub fn new(memory_address_bits: u32) -> Self {
        assert!((12..=32).contains(&memory_address_bits));
        let address_mask = if memory_address_bits == 32 {
            u32::MAX
        } else {
            (1u32 << memory_address_bits) - 1
        };
        let num_pages = (address_mask >> PAGE_SHIFT) + 1;
        Self {
            address_mask,
            pages: (0..num_pages).map(|_| Page::default()).collect(),
            ram: Vec::new(),
            ram_size: 0,
            ram_assigned: 0,
            mmio_slots: Vec::new(),
            rom_regions: Vec::new(),
            ports: IoPortMap::new(),
            code_invalidate_callback: None,
            locked_access_callback: None,
            next_owner_id: 1,
        }
    }

    pub fn mint_owner_id(&mut self) -> OwnerId {
        let id = self.next_owner_id;
        self.next_owner_id += 1;
        id
    }

    pub fn address_mask(&self) -> u32 {
        self.address_mask
    }

    pub fn set_address_mask(&mut self, mask: u32) {
        self.address_mask = mask;
    }

    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    pub fn ram_size(&self) -> u32 {
        self.ram_size
    }

    pub fn unassigned_ram_size(&self) -> u32 {
        self.ram_size - self.ram_assigned
    }

    // ---- Memory map construction ----------------------------------------------------------

    pub fn allocate_ram(&mut self, size: u32) {
        self.ram = vec![0u8; size as usize];
        self.ram_size = size;
        self.ram_assigned = 0;
    }

    /// Maps `[start, end)` of the physical address space onto the next unassigned RAM, returning
    /// the number of bytes mapped. `start`/`end` must be page-aligned.
    pub fn create_ram_region(&mut self, start: u32, end: u32) -> u32 {
        assert_eq!(start & PAGE_OFFSET_MASK, 0);
        assert_eq!(end & PAGE_OFFSET_MASK, 0);
        assert!(end > start);
        let size = end - start;
        assert!(size <= self.unassigned_ram_size(), "not enough RAM left");
        let ram_base = self.ram_assigned;
        self.ram_assigned += size;

        let start_page = start >> PAGE_SHIFT;
        let end_page = end >> PAGE_SHIFT;
        for (i, page_no) in (start_page..end_page).enumerate() {
            let page = &mut self.pages[page_no as usize];
            page.ram_base = Some(ram_base + (i as u32) * PAGE_SIZE);
            page.ram_start_offset = 0;
            page.ram_end_offset = PAGE_SIZE as u16;
            page.recompute_fast_path();
        }
        size
    }

    fn alloc_mmio_slot(&mut self, start: u32, size: u32, handler: Rc<dyn MmioHandler>) -> MmioId {
        let end = start + size - 1;
        let slot = MmioSlot {
            start,
            end,
            handler,
        };
        let id = self.mmio_slots.len() as MmioId;
        self.mmio_slots.push(Some(slot));
        id
    }

    /// Registers an MMIO handler over `[start, start+size)`. Mirrors `ConnectMMIO` in §4.1.
    pub fn register_mmio(&mut self, start: u32, size: u32, handler: Rc<dyn MmioHandler>) -> MmioId {
        assert!(size > 0);
        let id = self.alloc_mmio_slot(start, size, handler);
        self.attach_mmio_to_pages(id);
        id
    }

    fn attach_mmio_to_pages(&mut self, id: MmioId) {
        let (start, end) = {
            let slot = self.mmio_slots[id as usize].as_ref().unwrap();
            (slot.start, slot.end)
        };
        let start_page = start >> PAGE_SHIFT;
        let end_page = end >> PAGE_SHIFT;
        for page_no in start_page..=end_page {
            let page_start = page_no << PAGE_SHIFT;
            let lo = start.saturating_sub(page_start).min(PAGE_SIZE - 1) as u16;
            let hi = (end.saturating_sub(page_start)).min(PAGE_SIZE - 1) as u16;
            let page = &mut self.pages[page_no as usize];
            page.mmio.push(id);
            // Keep the list sorted descending by the handler's own start address so the first
            // covering entry always wins ties.
            page.mmio.sort_by(|a, b| {
                let sa = self.mmio_slots[*a as usize].as_ref().unwrap().start;
                let sb = self.mmio_slots[*b as usize].as_ref().unwrap().start;
                sb.cmp(&sa)
            });
            if page.mmio.len() == 1 {
                page.mmio_start_offset = lo;
                page.mmio_end_offset = hi;
            } else {
                page.mmio_start_offset = page.mmio_start_offset.min(lo);
                page.mmio_end_offset = page.mmio_end_offset.max(hi);
            }
            page.recompute_fast_path();
        }
    }

    pub fn unregister_mmio(&mut self, id: MmioId) {
        let (start, end) = match self.mmio_slots.get(id as usize).and_then(|s| s.as_ref()) {
            Some(slot) => (slot.start, slot.end),
            None => return,
        };
        self.mmio_slots[id as usize] = None;
        let start_page = start >> PAGE_SHIFT;
        let end_page = end >> PAGE_SHIFT;
        for page_no in start_page..=end_page {
            let page = &mut self.pages[page_no as usize];
            page.mmio.retain(|h| *h != id);
            if page.mmio.is_empty() {
                page.mmio_start_offset = 0;
                page.mmio_end_offset = 0;
            } else {
                // Recompute the envelope from the remaining handlers.
                let page_start = page_no << PAGE_SHIFT;
                let mut lo = u16::MAX;
                let mut hi = 0u16;
                for h in &page.mmio {
                    let slot = self.mmio_slots[*h as usize].as_ref().unwrap();
                    let l = slot.start.saturating_sub(page_start).min(PAGE_SIZE - 1) as u16;
                    let h_ = slot.end.saturating_sub(page_start).min(PAGE_SIZE - 1) as u16;
                    lo = lo.min(l);
                    hi = hi.max(h_);
                }
                page.mmio_start_offset = lo;
                page.mmio_end_offset = hi;
            }
            page.recompute_fast_path();
        }
    }

    /// Creates an MMIO-backed ROM region from an in-memory buffer, per §6 "ROM files" and the
    /// resolved Open Question in SPEC_FULL.md §13 (ROM is always MMIO-backed, never copied into
    /// the RAM arena).
    pub fn create_rom_region_from_buffer(&mut self, data: &[u8], address: u32) -> MmioId {
        let buffer = Rc::new(RefCell::new(data.to_vec()));
        let size = data.len() as u32;
        let handler = crate::mmio::direct(buffer.clone(), true, false);
        let id = self.register_mmio(address, size, handler);
        self.rom_regions.push(RomRegion {
            data: buffer,
            mmio_id: id,
            base: address,
            size,
        });
        id
    }

    /// Creates an additional MMIO view of an existing ROM/RAM region sharing the same buffer.
    pub fn mirror_region(&mut self, start: u32, size: u32, mirror_start: u32) {
        if let Some(region) = self.rom_regions.iter().find(|r| r.base == start && r.size >= size) {
            let handler = crate::mmio::direct(region.data.clone(), true, false);
            self.register_mmio(mirror_start, size, handler);
            let start_page = mirror_start >> PAGE_SHIFT;
            let end_page = (mirror_start + size - 1) >> PAGE_SHIFT;
            for page_no in start_page..=end_page {
                self.pages[page_no as usize].lock.insert(PageLock::MIRROR);
            }
            return;
        }
        // Mirroring a RAM region: alias the same backing bytes via a new RAM mapping window is not
        // representable without a second arena; instead, mirror by re-pointing pages at the same
        // ram_base as the source range.
        let start_page = start >> PAGE_SHIFT;
        let mirror_page = mirror_start >> PAGE_SHIFT;
        let num_pages = size / PAGE_SIZE;
        for i in 0..num_pages {
            let src = self.pages[(start_page + i) as usize].ram_base;
            let dst = &mut self.pages[(mirror_page + i) as usize];
            dst.ram_base = src;
            dst.ram_start_offset = 0;
            dst.ram_end_offset = PAGE_SIZE as u16;
            dst.lock.insert(PageLock::MIRROR);
            dst.recompute_fast_path();
        }
    }

    pub fn set_page_ram_state(&mut self, page_address: u32, readable: bool, writable: bool) {
        self.set_pages_ram_state(page_address, PAGE_SIZE, readable, writable);
    }

    pub fn set_pages_ram_state(&mut self, start_address: u32, size: u32, readable: bool, writable: bool) {
        let start_page = start_address >> PAGE_SHIFT;
        let end_page = (start_address + size - 1) >> PAGE_SHIFT;
        for page_no in start_page..=end_page {
            let page = &mut self.pages[page_no as usize];
            if page.ram_base.is_none() {
                continue;
            }
            if !readable && !writable {
                page.ram_start_offset = 0;
                page.ram_end_offset = 0;
            } else {
                page.ram_start_offset = 0;
                page.ram_end_offset = PAGE_SIZE as u16;
            }
            if writable {
                page.lock.remove(PageLock::WRITE_LOCKED);
            } else {
                page.lock.insert(PageLock::WRITE_LOCKED);
            }
            if !readable {
                page.lock.insert(PageLock::READ_LOCKED);
            } else {
                page.lock.remove(PageLock::READ_LOCKED);
            }
            page.recompute_fast_path();
        }
    }

    // ---- Code cache coupling ----------------------------------------------------------------

    pub fn set_code_invalidation_callback(&mut self, callback: Box<dyn FnMut(u32)>) {
        self.code_invalidate_callback = Some(callback);
    }

    pub fn clear_code_invalidation_callback(&mut self) {
        self.code_invalidate_callback = None;
    }

    pub fn set_locked_memory_access_callback(&mut self, callback: Box<dyn FnMut(u32)>) {
        self.locked_access_callback = Some(callback);
    }

    pub fn mark_page_as_code(&mut self, address: u32) {
        let page_no = (address & self.address_mask) >> PAGE_SHIFT;
        self.pages[page_no as usize].lock.insert(PageLock::CODE_CACHED);
        self.pages[page_no as usize].recompute_fast_path();
    }

    pub fn unmark_page_as_code(&mut self, address: u32) {
        let page_no = (address & self.address_mask) >> PAGE_SHIFT;
        let page = &mut self.pages[page_no as usize];
        page.lock.remove(PageLock::CODE_CACHED);
        page.recompute_fast_path();
    }

    pub fn clear_page_code_flags(&mut self) {
        for page in &mut self.pages {
            page.lock.remove(PageLock::CODE_CACHED);
            page.recompute_fast_path();
        }
    }

    pub fn is_cachable_page(&self, address: u32) -> bool {
        let page_no = (address & self.address_mask) >> PAGE_SHIFT;
        let page = &self.pages[page_no as usize];
        page.ram_base.is_some() && page.mmio.is_empty()
    }

    pub fn is_writable_page(&self, address: u32) -> bool {
        let page_no = (address & self.address_mask) >> PAGE_SHIFT;
        let page = &self.pages[page_no as usize];
        page.ram_base.is_some() && !page.lock.contains(PageLock::WRITE_LOCKED)
    }

    fn invalidate_if_code(&mut self, page_no: u32) {
        let was_code = self.pages[page_no as usize].lock.contains(PageLock::CODE_CACHED);
        if !was_code {
            return;
        }
        self.pages[page_no as usize].lock.remove(PageLock::CODE_CACHED);
        self.pages[page_no as usize].recompute_fast_path();
        if let Some(cb) = &mut self.code_invalidate_callback {
            cb(page_no << PAGE_SHIFT);
        }
    }

    pub fn get_code_hash(&self, address: u32, length: u32) -> u64 {
        // FNV-1a, adequate for block-cache disambiguation (not a cryptographic requirement).
        let mut hash: u64 = 0xcbf29ce484222325;
        let mut addr = address;
        for _ in 0..length {
            let byte = self.peek_u8(addr);
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
            addr = addr.wrapping_add(1);
        }
        hash
    }

    /// Reads a byte without triggering lock-eviction callbacks or I/O side effects; used for
    /// hashing/disassembly.
    fn peek_u8(&self, address: u32) -> u8 {
        let addr = address & self.address_mask;
        let page_no = addr >> PAGE_SHIFT;
        let offset = addr & PAGE_OFFSET_MASK;
        let page = &self.pages[page_no as usize];
        if let Some(base) = page.ram_base {
            if offset >= page.ram_start_offset as u32 && offset < page.ram_end_offset as u32 {
                return self.ram[(base + offset) as usize];
            }
        }
        if page.has_mmio_envelope(offset) {
            if let Some((start, handler)) = self.find_covering_mmio(page, addr, 1) {
                return handler.read_u8((addr - start) as u64);
            }
        }
        0xFF
    }

    /// Finds the first handler (in the page's descending-by-start order) whose range fully
    /// covers `[addr, addr+size)`, returning its base address alongside a cheap `Rc` clone.
    fn find_covering_mmio(&self, page: &Page, addr: u32, size: u32) -> Option<(u32, Rc<dyn MmioHandler>)> {
        for id in &page.mmio {
            let slot = self.mmio_slots[*id as usize].as_ref().unwrap();
            if addr >= slot.start && addr + size - 1 <= slot.end {
                return Some((slot.start, slot.handler.clone()));
            }
        }
        None
    }

    // ---- Locking (used by cached backends to detect writes to executing pages) -------------

    pub fn lock_memory(&mut self, address: u32, size: u32, access: PageLock) {
        assert!(size > 0);
        let start_page = (address & self.address_mask) >> PAGE_SHIFT;
        let end_page = ((address + size - 1) & self.address_mask) >> PAGE_SHIFT;
        for page_no in start_page..=end_page {
            let page = &mut self.pages[page_no as usize];
            page.lock.insert(access);
            page.recompute_fast_path();
        }
    }

    pub fn unlock_memory(&mut self, address: u32, size: u32, access: PageLock) {
        assert!(size > 0);
        let start_page = (address & self.address_mask) >> PAGE_SHIFT;
        let end_page = ((address + size - 1) & self.address_mask) >> PAGE_SHIFT;
        for page_no in start_page..=end_page {
            let page = &mut self.pages[page_no as usize];
            page.lock.remove(access);
            page.recompute_fast_path();
        }
    }

    // ---- Memory access ----------------------------------------------------------------------

    fn page_straddle(addr: u32, size: u32) -> bool {
        let offset = addr & PAGE_OFFSET_MASK;
        offset + size > PAGE_SIZE
    }

    /// Single-byte access within one page: the common denominator every wider access decomposes
    /// to when it straddles page boundaries or falls outside any fast path.
    fn read_byte_in_page(&mut self, addr: u32) -> u8 {
        let page_no = addr >> PAGE_SHIFT;
        let offset = addr & PAGE_OFFSET_MASK;
        // Fast path.
        {
            let page = &self.pages[page_no as usize];
            if page.fast_path {
                return self.ram[(page.ram_base.unwrap() + offset) as usize];
            }
        }
        // Locks: a read-locked page notifies the registered callback (used by the cached
        // interpreter to evict a block whose backing page is about to be touched) then clears
        // the lock bit for this access.
        if self.pages[page_no as usize].lock.contains(PageLock::READ_LOCKED) {
            if let Some(cb) = &mut self.locked_access_callback {
                cb(page_no << PAGE_SHIFT);
            }
            self.pages[page_no as usize].lock.remove(PageLock::READ_LOCKED);
            self.pages[page_no as usize].recompute_fast_path();
        }
        let page = &self.pages[page_no as usize];
        if page.has_mmio_envelope(offset) {
            if let Some((start, handler)) = self.find_covering_mmio(page, addr, 1) {
                return handler.read_u8((addr - start) as u64);
            }
        }
        if page.has_ram_subrange(offset, 1) {
            return self.ram[(page.ram_base.unwrap() + offset) as usize];
        }
        0xFF
    }

    fn write_byte_in_page(&mut self, addr: u32, value: u8) {
        let page_no = addr >> PAGE_SHIFT;
        let offset = addr & PAGE_OFFSET_MASK;
        {
            let page = &self.pages[page_no as usize];
            if page.fast_path {
                self.ram[(page.ram_base.unwrap() + offset) as usize] = value;
                return;
            }
        }
        if self.pages[page_no as usize].lock.contains(PageLock::WRITE_LOCKED) {
            if let Some(cb) = &mut self.locked_access_callback {
                cb(page_no << PAGE_SHIFT);
            }
            self.pages[page_no as usize].lock.remove(PageLock::WRITE_LOCKED);
            self.pages[page_no as usize].recompute_fast_path();
        }
        let had_mmio = self.pages[page_no as usize].has_mmio_envelope(offset);
        if had_mmio {
            let target = {
                let page = &self.pages[page_no as usize];
                self.find_covering_mmio(page, addr, 1)
            };
            if let Some((start, handler)) = target {
                handler.write_u8(addr.wrapping_sub(start) as u64, value);
                self.invalidate_if_code(page_no);
                return;
            }
        }
        let page = &self.pages[page_no as usize];
        if page.has_ram_subrange(offset, 1) {
            let base = page.ram_base.unwrap();
            self.ram[(base + offset) as usize] = value;
            self.invalidate_if_code(page_no);
        }
        // Otherwise the write is silently dropped (§7 MemoryFault).
    }

    fn read_wide(&mut self, addr: u32, size: u32) -> u64 {
        let addr = addr & self.address_mask;
        if size == 1 {
            return self.read_byte_in_page(addr) as u64;
        }
        if Self::page_straddle(addr, size) {
            let mut bytes = [0u8; 8];
            for i in 0..size {
                bytes[i as usize] = self.read_byte_in_page(addr.wrapping_add(i) & self.address_mask);
            }
            return u64::from_le_bytes(bytes);
        }
        // Try the fast path or a single covering MMIO/RAM range for the whole access.
        let page_no = addr >> PAGE_SHIFT;
        let offset = addr & PAGE_OFFSET_MASK;
        {
            let page = &self.pages[page_no as usize];
            if page.fast_path {
                let base = (page.ram_base.unwrap() + offset) as usize;
                let mut bytes = [0u8; 8];
                bytes[..size as usize].copy_from_slice(&self.ram[base..base + size as usize]);
                return u64::from_le_bytes(bytes);
            }
        }
        if self.pages[page_no as usize].lock.contains(PageLock::READ_LOCKED) {
            if let Some(cb) = &mut self.locked_access_callback {
                cb(page_no << PAGE_SHIFT);
            }
            self.pages[page_no as usize].lock.remove(PageLock::READ_LOCKED);
            self.pages[page_no as usize].recompute_fast_path();
        }
        let page = &self.pages[page_no as usize];
        if page.has_mmio_envelope(offset) {
            if let Some((start, handler)) = self.find_covering_mmio(page, addr, size) {
                let rel = (addr - start) as u64;
                let value = match size {
                    2 => handler.read_u16(rel) as u64,
                    4 => handler.read_u32(rel) as u64,
                    8 => handler.read_u64(rel),
                    _ => unreachable!(),
                };
                return value;
            }
        }
        if page.has_ram_subrange(offset, size) {
            let base = page.ram_base.unwrap();
            let start = (base + offset) as usize;
            let mut bytes = [0u8; 8];
            bytes[..size as usize].copy_from_slice(&self.ram[start..start + size as usize]);
            return u64::from_le_bytes(bytes);
        }
        // No single range covers the whole access: decompose to bytes.
        let mut bytes = [0u8; 8];
        for i in 0..size {
            bytes[i as usize] = self.read_byte_in_page(addr + i);
        }
        u64::from_le_bytes(bytes)
    }

    fn write_wide(&mut self, addr: u32, size: u32, value: u64) {
        let addr = addr & self.address_mask;
        if size == 1 {
            self.write_byte_in_page(addr, value as u8);
            return;
        }
        if Self::page_straddle(addr, size) {
            let bytes = value.to_le_bytes();
            for i in 0..size {
                self.write_byte_in_page(addr.wrapping_add(i) & self.address_mask, bytes[i as usize]);
            }
            return;
        }
        let page_no = addr >> PAGE_SHIFT;
        let offset = addr & PAGE_OFFSET_MASK;
        {
            let page = &self.pages[page_no as usize];
            if page.fast_path {
                let base = (page.ram_base.unwrap() + offset) as usize;
                let bytes = value.to_le_bytes();
                self.ram[base..base + size as usize].copy_from_slice(&bytes[..size as usize]);
                return;
            }
        }
        if self.pages[page_no as usize].lock.contains(PageLock::WRITE_LOCKED) {
            if let Some(cb) = &mut self.locked_access_callback {
                cb(page_no << PAGE_SHIFT);
            }
            self.pages[page_no as usize].lock.remove(PageLock::WRITE_LOCKED);
            self.pages[page_no as usize].recompute_fast_path();
        }
        let had_mmio = self.pages[page_no as usize].has_mmio_envelope(offset);
        if had_mmio {
            let target = {
                let page = &self.pages[page_no as usize];
                self.find_covering_mmio(page, addr, size)
            };
            if let Some((start, handler)) = target {
                let off = (addr - start) as u64;
                match size {
                    2 => handler.write_u16(off, value as u16),
                    4 => handler.write_u32(off, value as u32),
                    8 => handler.write_u64(off, value),
                    _ => unreachable!(),
                }
                self.invalidate_if_code(page_no);
                return;
            }
        }
        let page = &self.pages[page_no as usize];
        if page.has_ram_subrange(offset, size) {
            let base = page.ram_base.unwrap();
            let start = (base + offset) as usize;
            let bytes = value.to_le_bytes();
            self.ram[start..start + size as usize].copy_from_slice(&bytes[..size as usize]);
            self.invalidate_if_code(page_no);
            return;
        }
        // Decompose to bytes.
        let bytes = value.to_le_bytes();
        for i in 0..size {
            self.write_byte_in_page(addr + i, bytes[i as usize]);
        }
    }

    pub fn read_u8(&mut self, address: u32) -> u8 {
        self.read_wide(address, 1) as u8
    }
    pub fn read_u16(&mut self, address: u32) -> u16 {
        self.read_wide(address, 2) as u16
    }
    pub fn read_u32(&mut self, address: u32) -> u32 {
        self.read_wide(address, 4) as u32
    }
    pub fn read_u64(&mut self, address: u32) -> u64 {
        self.read_wide(address, 8)
    }
    pub fn write_u8(&mut self, address: u32, value: u8) {
        self.write_wide(address, 1, value as u64);
    }
    pub fn write_u16(&mut self, address: u32, value: u16) {
        self.write_wide(address, 2, value as u64);
    }
    pub fn write_u32(&mut self, address: u32, value: u32) {
        self.write_wide(address, 4, value as u64);
    }
    pub fn write_u64(&mut self, address: u32, value: u64) {
        self.write_wide(address, 8, value);
    }

    /// Checked variant: fails (`None`/`false`) only when an access straddling a page boundary
    /// touches a page that is entirely unmapped. Non-straddling accesses to unmapped memory still
    /// succeed and observe all-ones/dropped-write per §7 MemoryFault.
    pub fn checked_read_u8(&mut self, address: u32) -> Option<u8> {
        self.checked_read(address, 1).map(|v| v as u8)
    }
    pub fn checked_read_u16(&mut self, address: u32) -> Option<u16> {
        self.checked_read(address, 2).map(|v| v as u16)
    }
    pub fn checked_read_u32(&mut self, address: u32) -> Option<u32> {
        self.checked_read(address, 4).map(|v| v as u32)
    }
    pub fn checked_read_u64(&mut self, address: u32) -> Option<u64> {
        self.checked_read(address, 8)
    }

    fn page_is_unmapped(&self, addr: u32) -> bool {
        let page_no = (addr & self.address_mask) >> PAGE_SHIFT;
        let page = &self.pages[page_no as usize];
        page.ram_base.is_none() && page.mmio.is_empty()
    }

    fn checked_read(&mut self, address: u32, size: u32) -> Option<u64> {
        let addr = address & self.address_mask;
        if Self::page_straddle(addr, size) {
            for i in 0..size {
                if self.page_is_unmapped(addr.wrapping_add(i) & self.address_mask) {
                    return None;
                }
            }
        }
        Some(self.read_wide(address, size))
    }

    pub fn checked_write_u8(&mut self, address: u32, value: u8) -> bool {
        self.checked_write(address, 1, value as u64)
    }
    pub fn checked_write_u16(&mut self, address: u32, value: u16) -> bool {
        self.checked_write(address, 2, value as u64)
    }
    pub fn checked_write_u32(&mut self, address: u32, value: u32) -> bool {
        self.checked_write(address, 4, value as u64)
    }
    pub fn checked_write_u64(&mut self, address: u32, value: u64) -> bool {
        self.checked_write(address, 8, value)
    }

    fn checked_write(&mut self, address: u32, size: u32, value: u64) -> bool {
        let addr = address & self.address_mask;
        if Self::page_straddle(addr, size) {
            for i in 0..size {
                if self.page_is_unmapped(addr.wrapping_add(i) & self.address_mask) {
                    return false;
                }
            }
        }
        self.write_wide(address, size, value);
        true
    }

    pub fn read_block(&mut self, address: u32, destination: &mut [u8]) {
        let mut addr = address;
        for b in destination.iter_mut() {
            *b = self.read_byte_in_page(addr & self.address_mask);
            addr = addr.wrapping_add(1);
        }
    }

    pub fn write_block(&mut self, address: u32, source: &[u8]) {
        let mut addr = address;
        for &b in source {
            self.write_byte_in_page(addr & self.address_mask, b);
            addr = addr.wrapping_add(1);
        }
    }

    // ---- I/O ports ----------------------------------------------------------------------

    pub fn ports_mut(&mut self) -> &mut IoPortMap {
        &mut self.ports
    }

    pub fn read_io_port_byte(&mut self, port: u16) -> u8 {
        self.ports.read_u8(port)
    }
    pub fn read_io_port_word(&mut self, port: u16) -> u16 {
        self.ports.read_u16(port)
    }
    pub fn read_io_port_dword(&mut self, port: u16) -> u32 {
        self.ports.read_u32(port)
    }
    pub fn write_io_port_byte(&mut self, port: u16, value: u8) {
        self.ports.write_u8(port, value);
    }
    pub fn write_io_port_word(&mut self, port: u16, value: u16) {
        self.ports.write_u16(port, value);
    }
    pub fn write_io_port_dword(&mut self, port: u16, value: u32) {
        self.ports.write_u32(port, value);
    }

    // ---- Save state -----------------------------------------------------------------------

    pub fn save_ram_snapshot(&self) -> &[u8] {
        &self.ram
    }

    pub fn restore_ram_snapshot(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() != self.ram.len() {
            log_warn!("incorrect RAM size in save state");
            return false;
        }
        self.ram.copy_from_slice(bytes);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmio::MmioHandlers;

    fn new_ram_bus(bits: u32, ram_size: u32) -> Bus {
        let mut bus = Bus::new(bits);
        bus.allocate_ram(ram_size);
        bus.create_ram_region(0, ram_size);
        bus
    }

    #[test]
    fn s3_bus_round_trip_dword_then_bytes() {
        let mut bus = new_ram_bus(22, 4 * 1024 * 1024);
        bus.write_u32(0x1000, 0xDEAD_BEEF);
        assert_eq!(bus.read_u8(0x1000), 0xEF);
        assert_eq!(bus.read_u8(0x1001), 0xBE);
        assert_eq!(bus.read_u8(0x1002), 0xAD);
        assert_eq!(bus.read_u8(0x1003), 0xDE);
    }

    #[test]
    fn s4_mmio_split_byte_only_handler() {
        let mut bus = new_ram_bus(20, 1024 * 1024);
        let calls = Rc::new(RefCell::new(Vec::new()));
        let calls2 = calls.clone();
        let handlers = MmioHandlers {
            read_byte: Some(Box::new(move |off| {
                calls2.borrow_mut().push(off);
                0x10 + off as u8
            })),
            ..Default::default()
        };
        let handler = crate::mmio::complex(handlers);
        bus.register_mmio(0xA0000, 0x20000, handler);
        let v = bus.read_u32(0xA0000);
        assert_eq!(calls.borrow().as_slice(), &[0, 1, 2, 3]);
        assert_eq!(v, u32::from_le_bytes([0x10, 0x11, 0x12, 0x13]));
    }

    #[test]
    fn fast_path_equals_slow_path() {
        let mut bus = new_ram_bus(20, 1024 * 1024);
        bus.write_u32(0x500, 0x12345678);
        // force slow path by inserting then removing a lock, which doesn't change fast_path
        // recompute ordering issues.
        assert_eq!(bus.read_u32(0x500), 0x12345678);
        assert_eq!(bus.read_u16(0x500), 0x5678);
        assert_eq!(bus.read_u8(0x500), 0x78);
    }

    #[test]
    fn address_mask_invariant() {
        let mut bus = new_ram_bus(20, 1024 * 1024);
        bus.write_u8(0x100, 0xAA);
        // With a 20-bit mask, 0x100 and 0x100 | (1<<20) alias to the same page... but our page
        // table only has 2^(bits-12) pages, so aliasing is implicit by construction: reading
        // through the masked address must equal reading the raw address once masked.
        let masked = 0x100 & bus.address_mask();
        assert_eq!(bus.read_u8(0x100), bus.read_u8(masked));
    }

    #[test]
    fn unmapped_read_returns_all_ones() {
        let mut bus = Bus::new(20);
        assert_eq!(bus.read_u8(0x0), 0xFF);
        assert_eq!(bus.read_u32(0x0), 0xFFFF_FFFF);
    }

    #[test]
    fn checked_read_fails_on_straddled_unmapped_page() {
        let mut bus = new_ram_bus(20, 0x2000);
        // RAM only covers pages 0 and 1 ([0, 0x2000)); a dword straddling into page 2 (entirely
        // unmapped) must fail.
        assert!(bus.checked_read_u32(0x1FFE).is_none());
        // A dword fully inside the mapped range still succeeds.
        assert!(bus.checked_read_u32(0x500).is_some());
    }

    #[test]
    fn code_invalidation_fires_on_write_to_marked_page() {
        let mut bus = new_ram_bus(20, 0x10000);
        let fired = Rc::new(RefCell::new(None));
        let fired2 = fired.clone();
        bus.set_code_invalidation_callback(Box::new(move |addr| {
            *fired2.borrow_mut() = Some(addr);
        }));
        bus.mark_page_as_code(0x3000);
        bus.write_u8(0x3010, 0x90);
        assert_eq!(*fired.borrow(), Some(0x3000));
    }
}
