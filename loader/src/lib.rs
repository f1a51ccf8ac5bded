//! `vita-loader` — bootstrap loader for a single WebAssembly guest.
//!
//! Takes a binary from a URL, file, buffer or channel and drives it through
//! one attempt:
//!
//! - **Reserve:** claim the bridge's run slot, so a busy bridge refuses
//!   before anything is fetched
//! - **Acquire:** fetch the bytes, with connect and idle timeouts
//! - **Compile:** validate while streaming when the source is served as
//!   `application/wasm`, otherwise buffer first; both paths compile the same
//! - **Instantiate:** link against the bridge's import surface under memory,
//!   table and optional fuel limits
//! - **Run:** hand the instance to the bridge, which invokes its entry point
//!
//! Progress is observable through `AttemptState` and `BootstrapHooks`, and
//! every failure is reported as exactly one `BootstrapError` kind.
//!
//! The primary entry point is [`Loader::bootstrap`].

pub mod error;
pub mod config;
pub mod validation;
pub mod source;
pub mod state;
pub mod cancel;
pub mod attempt;
pub mod loader;

pub use error::{
    BootstrapError, ErrorKind, FormatError, LinkError, ResourceError, TransportError,
};
pub use config::LoaderConfig;
pub use source::{BinarySource, ChunkSender, WASM_CONTENT_TYPE};
pub use state::{AttemptState, BootstrapHooks, NoopHooks};
pub use cancel::CancelHandle;
pub use attempt::{Attempt, Running};
pub use loader::Loader;

pub use vita_bridge::{Bridge, ExitStatus, OutputSink, RunError, RunSlot, RuntimeBridge};
