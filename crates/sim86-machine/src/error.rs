//! Error types owned by this crate (§7): file I/O around ROM images, and the semantic half of
//! configuration errors that `sim86-config` cannot itself detect because only `System` knows
//! which system classes and component types actually exist.
//!
//! `sim86-config::ConfigError` numbers pure-grammar failures 1-4; `MachineError::Config` below
//! continues that same numbering from 5 upward, mirroring `pce::System::ParseConfig`'s own
//! unbroken error-code sequence (5 unknown system type, 8 unknown component type, 11 component
//! already exists as a built-in, 13 a component property failed to apply).

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("ROM file {path} is {actual} bytes, expected {expected}")]
    SizeMismatch { path: PathBuf, expected: u32, actual: u32 },
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("[System] Type='{0}' is not a known system class (expected 'isapc' or 'ibm-pc-at')")]
    UnknownSystemClass(String),
    #[error("[System] Type= was not specified")]
    MissingSystemType,
    #[error("[{section}] Type='{component_type}' is not a known component type")]
    UnknownComponentType { section: String, component_type: String },
    #[error("[{section}] names a component type ('{component_type}') the selected system class already provides built-in")]
    ComponentAlreadyBuiltin { section: String, component_type: String },
    #[error("[{section}] has no Type= and is not a recognized built-in component identifier")]
    MissingComponentType { section: String },
    #[error("[{section}] property '{key}'='{value}' was rejected: {reason}")]
    InvalidProperty { section: String, key: String, value: String, reason: String },
    #[error(transparent)]
    Component(#[from] sim86_cpu::ComponentError),
    #[error(transparent)]
    Io(#[from] IoError),
}

impl MachineError {
    /// The numbered code this condition corresponds to in `pce::System::ParseConfig`'s scheme
    /// (see module docs); `sim86-config::ConfigError` owns 1-4, this picks up from 5.
    pub fn code(&self) -> u32 {
        match self {
            MachineError::MissingSystemType => 4,
            MachineError::UnknownSystemClass(_) => 5,
            MachineError::UnknownComponentType { .. } => 8,
            MachineError::MissingComponentType { .. } => 12,
            MachineError::ComponentAlreadyBuiltin { .. } => 11,
            MachineError::InvalidProperty { .. } => 13,
            MachineError::Component(_) => 14,
            MachineError::Io(_) => 15,
        }
    }
}
