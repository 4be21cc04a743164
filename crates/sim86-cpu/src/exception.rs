//! CPU fault/exception vectoring (§4.4, §7 "CPUException").

use thiserror::Error;

/// A raised x86 exception, carrying whatever the vectoring path needs to push an error code (or
/// not — `#UD`/`#DE` have none). Not propagated as a `std::error::Error` on the hot execution
/// path (that's a fault-cell check at the interpreter's instruction boundary, per §9's
/// "exceptions for control flow -> explicit unwinding" note); `thiserror` is derived anyway so
/// tests and diagnostics can format/compare it like any other error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CpuException {
    #[error("#DE divide error")]
    DivideError,
    #[error("#DF double fault")]
    DoubleFault,
    #[error("#TS invalid TSS (error code {0:#06x})")]
    InvalidTss(u16),
    #[error("#NP segment not present (error code {0:#06x})")]
    SegmentNotPresent(u16),
    #[error("#SS stack fault (error code {0:#06x})")]
    StackFault(u16),
    #[error("#GP general protection fault (error code {0:#06x})")]
    GeneralProtectionFault(u16),
    #[error("#PF page fault at {address:#010x} (error code {error_code:#x})")]
    PageFault { address: u32, error_code: u32 },
    #[error("#UD invalid opcode")]
    InvalidOpcode,
}

bitflags::bitflags! {
    /// `#PF` error-code bits: {P, W/R, U/S}, per §4.4.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultErrorCode: u32 {
        const PRESENT = 1 << 0;
        const WRITE   = 1 << 1;
        const USER    = 1 << 2;
    }
}

impl CpuException {
    /// The real-mode IVT index / protected-mode IDT vector this exception is delivered through.
    pub fn vector(&self) -> u8 {
        match self {
            CpuException::DivideError => 0,
            CpuException::InvalidOpcode => 6,
            CpuException::DoubleFault => 8,
            CpuException::InvalidTss(_) => 10,
            CpuException::SegmentNotPresent(_) => 11,
            CpuException::StackFault(_) => 12,
            CpuException::GeneralProtectionFault(_) => 13,
            CpuException::PageFault { .. } => 14,
        }
    }

    /// Whether this vector pushes a hardware error code onto the stack during delivery.
    pub fn has_error_code(&self) -> bool {
        matches!(
            self,
            CpuException::InvalidTss(_)
                | CpuException::SegmentNotPresent(_)
                | CpuException::StackFault(_)
                | CpuException::GeneralProtectionFault(_)
                | CpuException::PageFault { .. }
        )
    }

    pub fn error_code(&self) -> u32 {
        match *self {
            CpuException::InvalidTss(c)
            | CpuException::SegmentNotPresent(c)
            | CpuException::StackFault(c)
            | CpuException::GeneralProtectionFault(c) => c as u32,
            CpuException::PageFault { error_code, .. } => error_code,
            _ => 0,
        }
    }
}
