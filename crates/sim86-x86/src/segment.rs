//! Segment/descriptor state and the system-level register groups (control, debug, GDTR/IDTR/
//! LDTR/TR) of §3's "CPU register file (x86)".

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentRegister {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

pub const NUM_SEGMENTS: usize = 6;

/// The descriptor-cache "shadow" half of a segment register: what the CPU actually uses to
/// compute effective addresses and check limits, independent of whatever selector value was last
/// loaded. Real hardware caches exactly this after every segment load so it never has to walk the
/// GDT/LDT again mid-instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptorCache {
    pub base: u32,
    pub limit: u32,
    pub access_rights: u16,
    /// True once a protected-mode descriptor has actually been loaded; real-mode segment loads
    /// synthesize a cache entry (base = selector << 4, limit = 0xFFFF) but are not "valid
    /// descriptors" in the access-rights sense.
    pub valid: bool,
}

impl Default for SegmentDescriptorCache {
    fn default() -> Self {
        Self {
            base: 0,
            limit: 0xFFFF,
            access_rights: 0,
            valid: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    pub selector: u16,
    pub cache: SegmentDescriptorCache,
}

impl Segment {
    /// Loads a real-mode segment: selector becomes the paragraph number, base = selector << 4.
    pub fn load_real_mode(&mut self, selector: u16) {
        self.selector = selector;
        self.cache = SegmentDescriptorCache {
            base: (selector as u32) << 4,
            limit: 0xFFFF,
            access_rights: 0,
            valid: false,
        };
    }

    pub fn load_protected_mode(&mut self, selector: u16, cache: SegmentDescriptorCache) {
        self.selector = selector;
        self.cache = cache;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr0: u32 {
        const PE = 1 << 0;
        const MP = 1 << 1;
        const EM = 1 << 2;
        const TS = 1 << 3;
        const ET = 1 << 4;
        const NE = 1 << 5;
        const WP = 1 << 16;
        const AM = 1 << 18;
        const NW = 1 << 29;
        const CD = 1 << 30;
        const PG = 1 << 31;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr4: u32 {
        const VME = 1 << 0;
        const PVI = 1 << 1;
        const TSD = 1 << 2;
        const DE  = 1 << 3;
        const PSE = 1 << 4;
        const PAE = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlRegisters {
    pub cr0: Cr0,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: Cr4,
}

impl Default for Cr0 {
    fn default() -> Self {
        Cr0::ET
    }
}

impl Default for Cr4 {
    fn default() -> Self {
        Cr4::empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugRegisters {
    pub dr: [u32; 8],
}

/// GDTR/IDTR: a linear base plus a 16-bit limit (so a table can hold at most `limit+1` bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorTableRegister {
    pub base: u32,
    pub limit: u16,
}

/// LDTR/TR: a selector plus the same descriptor-cache shape a segment register carries, since
/// both name a descriptor the CPU dereferences on every privileged table access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SystemSegment {
    pub selector: u16,
    pub cache: SegmentDescriptorCache,
}

/// Operand/address-size and stack-size state cached per §3: "current operand size, current
/// address size, stack address size, and the mask to apply to EIP." Recomputed whenever CS is
/// reloaded or a 0x66/0x67 prefix changes the in-flight instruction's sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionSizes {
    pub operand_size_32: bool,
    pub address_size_32: bool,
    pub stack_size_32: bool,
}

impl ExecutionSizes {
    pub fn eip_mask(&self) -> u32 {
        if self.operand_size_32 {
            0xFFFF_FFFF
        } else {
            0x0000_FFFF
        }
    }
}

impl Default for ExecutionSizes {
    fn default() -> Self {
        // Real mode / 16-bit default.
        Self {
            operand_size_32: false,
            address_size_32: false,
            stack_size_32: false,
        }
    }
}
