//! Bootstrap error types.
//!
//! Every stage of an attempt fails with exactly one of the kinds below.
//! Wasmtime's `anyhow::Error` never escapes this crate: it is converted to
//! a typed variant at the stage boundary where it was raised.

use std::time::Duration;

use vita_bridge::RunError;

/// Coarse classification of a bootstrap failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Format,
    Link,
    Resource,
    StartTrap,
    Cancelled,
}

/// Top-level error type for a bootstrap attempt.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// The binary could not be fetched.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The bytes are not a valid WebAssembly module.
    #[error("format error: {0}")]
    Format(#[from] FormatError),

    /// The import surface does not satisfy the module's imports.
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// Engine, compilation or instantiation exceeded a limit.
    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    /// The guest faulted before or while its entry point started.
    #[error("start failure: {0}")]
    StartTrap(#[from] RunError),

    /// The attempt was cancelled before the module was handed to the bridge.
    #[error("bootstrap attempt cancelled")]
    Cancelled,
}

impl BootstrapError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::Format(_) => ErrorKind::Format,
            Self::Link(_) => ErrorKind::Link,
            Self::Resource(_) => ErrorKind::Resource,
            Self::StartTrap(_) => ErrorKind::StartTrap,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Acquisition failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Unparseable URL or unsupported scheme.
    #[error("invalid source URL: {0}")]
    InvalidUrl(String),

    /// Connection or protocol failure.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Non-success HTTP status.
    #[error("HTTP {status} for URL: {url}")]
    HttpStatus { status: u16, url: String },

    /// File or stream I/O failure.
    #[error("IO error: {0}")]
    Io(String),

    /// No bytes arrived within the idle timeout.
    #[error("no data received for {0:?}")]
    IdleTimeout(Duration),

    /// Declared or received size exceeds `max_binary_size`.
    #[error("binary too large: {size} bytes (max: {max})")]
    TooLarge { size: u64, max: u64 },

    /// The received bytes do not hash to the pinned digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// The bytes are not decodable WebAssembly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    /// First four bytes are not `\0asm`.
    #[error("bad magic number: {0:02x?}")]
    BadMagic(Vec<u8>),

    /// Binary version is not 1 (components and future versions are rejected).
    #[error("unsupported binary version {0:#x}")]
    UnsupportedVersion(u32),

    /// Input ended before a complete module.
    #[error("truncated binary ({0} bytes)")]
    Truncated(usize),

    /// Incremental decoding or validation failed.
    #[error("decode error at offset {offset}: {message}")]
    Decode { offset: usize, message: String },

    /// The engine rejected the module during validation.
    #[error("invalid module: {0}")]
    Invalid(String),
}

impl From<wasmparser::BinaryReaderError> for FormatError {
    fn from(e: wasmparser::BinaryReaderError) -> Self {
        Self::Decode {
            offset: e.offset(),
            message: e.message().to_string(),
        }
    }
}

/// The import surface does not match the module.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// The module imports something the surface does not define.
    #[error("missing import `{module}::{name}`")]
    MissingImport { module: String, name: String },

    /// An import exists but its type does not match.
    #[error("incompatible import: {0}")]
    Incompatible(String),

    /// The bridge was built on a different engine than the loader.
    #[error("bridge engine differs from loader engine")]
    EngineMismatch,
}

/// A limit was hit outside of guest code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("engine setup failed: {0}")]
    Engine(String),

    #[error("compilation failed: {0}")]
    Compile(String),

    #[error("instantiation failed: {0}")]
    Instantiate(String),

    #[error("fuel setup failed: {0}")]
    Fuel(String),

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    Task(String),
}
