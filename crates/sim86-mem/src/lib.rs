//! Physical memory bus, MMIO dispatch and I/O port map for a simulated PC.
//!
//! This crate has no notion of a CPU, a clock, or a device model; it only answers "what's at
//! this physical address / this I/O port". Higher layers (the CPU backends, the device set, the
//! system orchestrator) own a `Bus` and wire devices into it via `register_mmio` and the
//! `IoPortMap` accessors.

mod diag;
mod mmio;
mod ports;

mod bus;

pub use bus::{AccessKind, Bus, MmioId, PageLock, PAGE_SIZE};
pub use mmio::{complex, direct, ComplexMmio, DirectMmio, MmioHandler, MmioHandlers};
pub use ports::{IoPortConnection, IoPortMap, OwnerId, NUM_IOPORTS};
