//! Bridge error types.
//!
//! `RunError` covers everything that can go wrong once an instantiated
//! module has been handed to a bridge: refusing to start, trapping, or
//! exhausting fuel. `BridgeError` covers building the import surface.
//! `Errno` is the WASI error number returned to the guest by host functions.

use std::fmt;

use wasmtime::Trap;

use crate::types::ExitStatus;

/// Failure to start or finish a guest run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    /// The bridge is already running a module.
    #[error("bridge is already running a module")]
    Busy,

    /// `run` was given a slot reserved on a different bridge.
    #[error("run slot was reserved on a different bridge")]
    ForeignSlot,

    /// The entry export is missing or does not have type `() -> ()`.
    #[error("entry point `{name}` unavailable: {reason}")]
    MissingEntry { name: String, reason: String },

    /// The guest trapped.
    #[error("guest trapped: {0}")]
    Trap(String),

    /// The guest called `proc_exit` before its entry point was reached.
    #[error("guest exited with code {0} during instantiation")]
    EarlyExit(i32),

    /// Fuel exhausted during execution.
    #[error("fuel exhausted (instruction limit)")]
    FuelExhausted,

    /// The blocking task running the guest panicked or was aborted.
    #[error("guest task failed: {0}")]
    Panicked(String),
}

impl RunError {
    /// Classify an error raised out of guest code.
    ///
    /// `GuestExit` → `Ok(ExitStatus)`
    /// `Trap::OutOfFuel` → `RunError::FuelExhausted`
    /// Other traps and host errors → `RunError::Trap`
    pub fn classify(err: anyhow::Error) -> Result<ExitStatus, RunError> {
        if let Some(exit) = err.downcast_ref::<GuestExit>() {
            return Ok(ExitStatus::new(exit.0));
        }
        match err.downcast_ref::<Trap>() {
            Some(Trap::OutOfFuel) => Err(RunError::FuelExhausted),
            _ => Err(RunError::Trap(format!("{:#}", err))),
        }
    }

    /// Whether an error raised by wasmtime originated in guest code
    /// (a trap or a `proc_exit`), as opposed to a host-side failure.
    pub fn is_guest_fault(err: &anyhow::Error) -> bool {
        err.downcast_ref::<Trap>().is_some() || err.downcast_ref::<GuestExit>().is_some()
    }
}

/// Failure while building a bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The linker rejected a host function definition (usually a duplicate).
    #[error("failed to register `{module}::{name}`: {source}")]
    Registration {
        module: String,
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Raised by `proc_exit` to unwind the guest with an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("guest exited with code {0}")]
pub struct GuestExit(pub i32);

/// WASI preview1 error numbers used by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    Success = 0,
    Badf = 8,
    Fault = 21,
    Inval = 28,
    Io = 29,
    Nosys = 52,
    Overflow = 61,
    Spipe = 70,
}

impl Errno {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.as_i32())
    }
}
