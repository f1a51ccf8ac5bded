//! Per-run state held in the Wasmtime `Store` by `RuntimeBridge`.
//!
//! `HostState` carries what the WASI functions read or write: the guest's
//! argv and environment (pre-encoded as NUL-terminated strings), its output
//! sinks, and the origin of the monotonic clock.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::types::OutputSink;

/// Guest-visible process state for one run.
#[derive(Debug, Clone)]
pub struct HostState {
    /// `argv` entries, each terminated by NUL.
    pub args: Vec<Vec<u8>>,
    /// `KEY=VALUE` entries, each terminated by NUL.
    pub env: Vec<Vec<u8>>,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
    /// Zero point of `CLOCK_MONOTONIC`.
    pub clock_origin: Instant,
}

impl HostState {
    pub fn new(
        args: &[String],
        env: &[(String, String)],
        stdout: OutputSink,
        stderr: OutputSink,
    ) -> Self {
        Self {
            args: args.iter().map(|a| nul_terminated(a)).collect(),
            env: env
                .iter()
                .map(|(k, v)| nul_terminated(&format!("{}={}", k, v)))
                .collect(),
            stdout,
            stderr,
            clock_origin: Instant::now(),
        }
    }

    /// Nanoseconds since the Unix epoch.
    pub fn realtime_nanos(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }

    /// Nanoseconds since this state was created.
    pub fn monotonic_nanos(&self) -> u64 {
        self.clock_origin.elapsed().as_nanos() as u64
    }

    /// Route a write on `fd` to the matching sink. Returns `None` for
    /// descriptors other than stdout (1) and stderr (2).
    pub fn sink_for(&self, fd: i32) -> Option<(&OutputSink, bool)> {
        match fd {
            1 => Some((&self.stdout, false)),
            2 => Some((&self.stderr, true)),
            _ => None,
        }
    }
}

fn nul_terminated(s: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(s.len() + 1);
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
    bytes
}
