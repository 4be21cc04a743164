//! Uniform peripheral lifecycle (§4.8 / §3 "Lifecycle"): `System` owns every `Component` in
//! registration order and drives `initialize` once at construction, `reset` on a CPU or power-on
//! reset, and `save_state`/`load_state` as part of the system-wide save-state format.

use std::collections::HashMap;

use sim86_mem::Bus;
use sim86_snapshot::{StateLoadError, StateReader, StateWriter};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("I/O error initializing component: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

pub trait Component {
    /// A stable name used both as the save-state component id and for config-file section
    /// matching (§6/§11).
    fn name(&self) -> &str;

    /// Registers MMIO/port handlers on `bus` and performs any one-time setup. Called once, after
    /// construction, before the first `reset`.
    fn initialize(&mut self, bus: &mut Bus) -> Result<(), ComponentError>;

    /// Restores architectural power-on-reset state. Does not re-register MMIO/port handlers —
    /// those were already wired by `initialize` and remain valid across resets.
    fn reset(&mut self, bus: &mut Bus);

    fn save_state(&self, w: &mut StateWriter);

    fn load_state(&mut self, r: &mut StateReader) -> Result<(), StateLoadError>;

    /// Applies config-file properties (§11: every non-`Type` key in a component's INI section)
    /// before `initialize`. Most components in this workspace have nothing to configure, so the
    /// default is a no-op rather than an error on unrecognized keys.
    fn configure(&mut self, _properties: &HashMap<String, String>) -> Result<(), ComponentError> {
        Ok(())
    }
}
