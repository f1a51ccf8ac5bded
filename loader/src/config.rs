//! Loader configuration.

use std::time::Duration;

use wasmtime::{StoreLimits, StoreLimitsBuilder};

/// Bytes per WebAssembly page.
pub const WASM_PAGE_SIZE: u64 = 65536;

/// Configuration for the bootstrap loader.
///
/// Controls acquisition limits, the compile path, and the resource limits
/// applied to the guest's store.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Maximum linear memory pages (1 page = 64 KiB).
    /// Default: 16384 pages = 1 GiB.
    pub max_memory_pages: u32,

    /// Maximum elements in any table.
    pub max_table_elements: u32,

    /// Wasmtime fuel limit. `None` disables metering so event-driven
    /// guests can run indefinitely.
    pub fuel_limit: Option<u64>,

    /// Largest binary accepted from any source.
    pub max_binary_size: u64,

    /// TCP connect timeout for HTTP sources.
    pub connect_timeout: Duration,

    /// Longest wait for the next chunk of the binary.
    pub idle_timeout: Option<Duration>,

    /// Compile while bytes arrive when the source allows it.
    pub streaming: bool,

    /// If set, the acquired bytes must hash to this BLAKE3 digest.
    pub expected_digest: Option<blake3::Hash>,

    /// `User-Agent` header for HTTP sources.
    pub user_agent: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_memory_pages: 16384,  // 1 GiB
            max_table_elements: 100_000,
            fuel_limit: None,
            max_binary_size: 64 * 1024 * 1024,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(30)),
            streaming: true,
            expected_digest: None,
            user_agent: concat!("vita-loader/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl LoaderConfig {
    /// Linear memory cap in bytes.
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_pages as u64 * WASM_PAGE_SIZE
    }

    /// Store limits enforcing this configuration.
    pub fn store_limits(&self) -> StoreLimits {
        StoreLimitsBuilder::new()
            .memory_size(self.max_memory_bytes() as usize)
            .table_elements(self.max_table_elements as _)
            .build()
    }
}
