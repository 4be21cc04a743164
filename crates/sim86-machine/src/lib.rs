//! A complete simulated PC: wires a [`sim86_cpu::Cpu`], a [`sim86_mem::Bus`], a
//! [`sim86_timers::Scheduler`], and the minimal peripheral set in `sim86-devices` into the single
//! [`System`] an embedder drives. Grounded on `pce::System` and the `pce::Systems::{PCBase,ISAPC,PCAT}`
//! hierarchy.

pub mod classes;
pub mod error;
pub mod host;
pub mod system;

pub use classes::SystemClass;
pub use error::{IoError, MachineError};
pub use host::{HostInterface, NullHostInterface, RunState};
pub use system::System;
