//! The built-in system-class registry (§11): `[System] Type=` selects one of these, which in
//! turn decides the default CPU frequency, which built-in peripherals get auto-instantiated, and
//! any system-class-specific glue ports. Grounded on `pce/systems/isapc.cpp` and
//! `pce/systems/pcat.cpp`, scaled down to the two classes SPEC_FULL.md §11 names — there is no
//! `ali1429`/`ami386`/`pcbochs` equivalent here, since those add VGA/chipset devices this
//! workspace's minimal peripheral set (§4.9) does not implement.

use std::str::FromStr;

use crate::error::MachineError;

/// `pce::Systems::ISAPC` vs `pce::Systems::PCAT`: the XT-class machine has a single 8259 (no
/// cascade partner) and no CMOS/RTC, while the AT-class machine cascades a second 8259 through
/// IRQ2 and adds a battery-backed CMOS clock plus the port-0x92 fast A20 gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemClass {
    IsaPc,
    IbmPcAt,
}

impl SystemClass {
    /// Default CPU clock when the config's `[System]` section has no `CpuFrequencyHz` property —
    /// the original XT ran its 8088 at 4.77 MHz; `PCAT`'s own constructor default is 2 MHz
    /// (`pce/systems/pcat.cpp`'s `cpu_frequency = 2000000.0f` default parameter).
    pub fn default_cpu_frequency_hz(self) -> f64 {
        match self {
            SystemClass::IsaPc => 4_772_728.0,
            SystemClass::IbmPcAt => 2_000_000.0,
        }
    }

    /// Default RAM size when `[System]` has no `RamSize` property (`PCAT`'s constructor default
    /// of `1024 * 1024`).
    pub fn default_ram_size(self) -> u32 {
        1024 * 1024
    }

    /// CPU address-bus width: the XT-class 8086/8088 addresses 20 bits (1 MiB); the AT-class 286
    /// addresses 24 bits (16 MiB), matching the historical parts `pce`'s `CPU_X86::MODEL_286`
    /// constructor selects for `PCAT`.
    pub fn address_bits(self) -> u32 {
        match self {
            SystemClass::IsaPc => 20,
            SystemClass::IbmPcAt => 24,
        }
    }

    pub fn has_cmos(self) -> bool {
        matches!(self, SystemClass::IbmPcAt)
    }

    /// `pce::Systems::PCAT::ConnectSystemIOPorts` wires a fast A20 gate through port 0x92; the
    /// XT-class machine predates that mechanism entirely (A20 did not exist on an 8086/8088, so
    /// `ISAPC` never narrows the address mask).
    pub fn has_fast_a20_gate(self) -> bool {
        matches!(self, SystemClass::IbmPcAt)
    }

    pub fn name(self) -> &'static str {
        match self {
            SystemClass::IsaPc => "isapc",
            SystemClass::IbmPcAt => "ibm-pc-at",
        }
    }
}

impl FromStr for SystemClass {
    type Err = MachineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "isapc" => Ok(SystemClass::IsaPc),
            "ibm-pc-at" => Ok(SystemClass::IbmPcAt),
            other => Err(MachineError::UnknownSystemClass(other.to_string())),
        }
    }
}
