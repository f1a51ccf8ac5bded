//! `vita-bridge` — host runtime bridge for compiled WASM guests.
//!
//! A bridge is the capability provider a loaded guest runs against. This
//! crate defines:
//!
//! - `Bridge` trait — the contract a loader consumes (`reserve`, `import_surface`, `run`)
//! - `RunSlot` — a reserved run, held until the guest finishes
//! - `ImportSurface` — host functions keyed by `(module, name)`
//! - `InstantiatedModule` — a live instance plus the store that owns it
//! - `RuntimeBridge` — reference bridge with emulated WASI preview1
//! - `RunHandle` / `ExitStatus` — completion of a guest run
//! - `RunError` — start and run failures
//!
//! Bridges are explicit objects: build one at process start and pass it by
//! reference. There is no global instance.

pub mod error;
pub mod types;
pub mod memory;
pub mod host_state;
pub mod surface;
pub mod linker;
pub mod traits;
pub mod runtime;

// Re-export commonly used types at the crate root.
pub use error::{BridgeError, Errno, GuestExit, RunError};
pub use types::{ExitStatus, OutputSink, SharedBuffer};
pub use host_state::HostState;
pub use surface::{HostContext, ImportSurface, InstantiatedModule};
pub use linker::WASI_MODULE;
pub use traits::{Bridge, RunHandle, RunSlot};
pub use runtime::{BridgeConfig, RuntimeBridge, RuntimeBridgeBuilder, DEFAULT_ENTRY};
