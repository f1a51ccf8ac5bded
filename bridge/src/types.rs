//! Host-side value types shared by the bridge and its embedders.

use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Exit status of a guest run.
///
/// `0` when the entry point returned normally, otherwise the code the
/// guest passed to `proc_exit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitStatus(i32);

impl ExitStatus {
    pub const SUCCESS: ExitStatus = ExitStatus(0);

    pub fn new(code: i32) -> Self {
        Self(code)
    }

    pub fn code(&self) -> i32 {
        self.0
    }

    pub fn success(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit status {}", self.0)
    }
}

/// Byte buffer shared between the host and a running guest.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Contents decoded as UTF-8, replacing invalid sequences.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    fn append(&self, bytes: &[u8]) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(bytes);
    }
}

/// Destination for a guest output stream (stdout or stderr).
#[derive(Debug, Clone, Default)]
pub enum OutputSink {
    /// Forward to the host process's own stream.
    #[default]
    Inherit,
    /// Append to an in-memory buffer.
    Capture(SharedBuffer),
    /// Drop everything.
    Discard,
}

impl OutputSink {
    /// A capturing sink and the buffer it writes into.
    pub fn capture() -> (Self, SharedBuffer) {
        let buffer = SharedBuffer::new();
        (Self::Capture(buffer.clone()), buffer)
    }

    /// Write `bytes` to this sink. `stderr` selects the host stream for `Inherit`.
    pub fn write(&self, bytes: &[u8], stderr: bool) -> std::io::Result<()> {
        match self {
            Self::Inherit if stderr => {
                let mut err = std::io::stderr().lock();
                err.write_all(bytes)?;
                err.flush()
            }
            Self::Inherit => {
                let mut out = std::io::stdout().lock();
                out.write_all(bytes)?;
                out.flush()
            }
            Self::Capture(buffer) => {
                buffer.append(bytes);
                Ok(())
            }
            Self::Discard => Ok(()),
        }
    }
}
