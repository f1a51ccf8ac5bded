//! Shared test helpers for integration tests.
//!
//! Provides WAT guest fixtures, a one-route HTTP server, a bridge that
//! counts reservations and `run` calls, and hooks that record every
//! attempt event.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wasmtime::Engine;

use vita_bridge::{
    Bridge, HostState, ImportSurface, InstantiatedModule, OutputSink, RunError, RunHandle,
    RunSlot, RuntimeBridge, SharedBuffer,
};
use vita_loader::{AttemptState, BootstrapError, BootstrapHooks, ErrorKind, Loader, LoaderConfig};

// ── Tracing ──

/// Route `tracing` output through the test harness. Set `RUST_LOG` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Guests ──

/// Writes `hello, vita\n` to stdout and returns.
pub const HELLO_WAT: &str = r#"
(module
    (import "wasi_snapshot_preview1" "fd_write"
        (func $fd_write (param i32 i32 i32 i32) (result i32)))
    (memory (export "memory") 1)
    (data (i32.const 16) "hello, vita\n")
    (func (export "_start")
        (i32.store (i32.const 0) (i32.const 16))
        (i32.store (i32.const 4) (i32.const 12))
        (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8))))
)
"#;

/// Exits with code 3 from its entry point.
pub const EXIT_WAT: &str = r#"
(module
    (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
    (func (export "_start") (call $exit (i32.const 3)))
)
"#;

/// Traps from its entry point.
pub const TRAP_WAT: &str = r#"
(module
    (func (export "_start") unreachable)
)
"#;

/// Traps from its start function, before the entry point exists.
pub const START_TRAP_WAT: &str = r#"
(module
    (func $init unreachable)
    (start $init)
    (func (export "_start"))
)
"#;

/// Needs a host function the reference bridge does not provide.
pub const MISSING_IMPORT_WAT: &str = r#"
(module
    (import "env" "render" (func (param i32)))
    (func (export "_start"))
)
"#;

/// Blocks inside the `env.block` host function registered by `blocking_bridge`.
pub const BLOCKING_WAT: &str = r#"
(module
    (import "env" "block" (func $block))
    (func (export "_start") (call $block))
)
"#;

/// Prints from its start function, i.e. during instantiation.
pub const START_PRINT_WAT: &str = r#"
(module
    (import "wasi_snapshot_preview1" "fd_write"
        (func $fd_write (param i32 i32 i32 i32) (result i32)))
    (memory (export "memory") 1)
    (data (i32.const 16) "second guest ran\n")
    (func $init
        (i32.store (i32.const 0) (i32.const 16))
        (i32.store (i32.const 4) (i32.const 17))
        (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8))))
    (start $init)
    (func (export "_start"))
)
"#;

/// Asks for more memory than a tight loader limit allows.
pub const BIG_MEMORY_WAT: &str = r#"
(module
    (memory (export "memory") 64)
    (func (export "_start"))
)
"#;

pub fn wasm(wat: &str) -> Vec<u8> {
    wat::parse_str(wat).expect("fixture must assemble")
}

/// A valid module of at least `size` bytes, padded with a data segment.
pub fn large_module(size: usize) -> Vec<u8> {
    let pages = size / 65536 + 2;
    let wat = format!(
        r#"(module
            (memory {pages})
            (data (i32.const 0) "{payload}")
            (func (export "_start"))
        )"#,
        pages = pages,
        payload = "v".repeat(size),
    );
    wasm(&wat)
}

// ── Loader and bridges ──

pub fn loader() -> Loader {
    loader_with(LoaderConfig::default())
}

pub fn loader_with(config: LoaderConfig) -> Loader {
    init_tracing();
    Loader::new(config).expect("loader")
}

/// Reference bridge wrapped to count how many modules it was handed.
pub struct CountingBridge {
    inner: RuntimeBridge,
    reservations: AtomicUsize,
    runs: AtomicUsize,
}

impl CountingBridge {
    pub fn new(inner: RuntimeBridge) -> Self {
        Self {
            inner,
            reservations: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
        }
    }

    /// Successful `reserve` calls.
    pub fn reservations(&self) -> usize {
        self.reservations.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl Bridge for CountingBridge {
    type State = HostState;

    fn engine(&self) -> &Engine {
        self.inner.engine()
    }

    fn import_surface(&self) -> &ImportSurface<HostState> {
        self.inner.import_surface()
    }

    fn new_state(&self) -> HostState {
        self.inner.new_state()
    }

    fn reserve(&self) -> Result<RunSlot, RunError> {
        let slot = self.inner.reserve()?;
        self.reservations.fetch_add(1, Ordering::SeqCst);
        Ok(slot)
    }

    fn run(&self, slot: RunSlot, module: InstantiatedModule<HostState>) -> Result<RunHandle, RunError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.inner.run(slot, module)
    }
}

/// Counting bridge whose guest stdout is captured.
pub fn bridge(loader: &Loader) -> (CountingBridge, SharedBuffer) {
    let (stdout, buffer) = OutputSink::capture();
    let inner = RuntimeBridge::builder(loader.engine())
        .stdout(stdout)
        .build()
        .expect("bridge");
    (CountingBridge::new(inner), buffer)
}

/// Bridge with an `env.block` host function that sleeps for `hold`.
/// Guest stdout is captured.
pub fn blocking_bridge(loader: &Loader, hold: Duration) -> (CountingBridge, SharedBuffer) {
    let (stdout, buffer) = OutputSink::capture();
    let inner = RuntimeBridge::builder(loader.engine())
        .stdout(stdout)
        .func_wrap("env", "block", move || std::thread::sleep(hold))
        .expect("register env.block")
        .build()
        .expect("bridge");
    (CountingBridge::new(inner), buffer)
}

// ── Hooks ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Transition(AttemptState, AttemptState),
    Bytes(u64),
    Failure(ErrorKind),
}

/// Records every hook call in order.
#[derive(Default)]
pub struct RecordingHooks {
    events: Mutex<Vec<Event>>,
}

impl RecordingHooks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// States entered, in order.
    pub fn states(&self) -> Vec<AttemptState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Transition(_, to) => Some(to),
                _ => None,
            })
            .collect()
    }

    pub fn entered(&self, state: AttemptState) -> usize {
        self.states().iter().filter(|s| **s == state).count()
    }

    fn position(&self, pred: impl Fn(&Event) -> bool) -> Option<usize> {
        self.events().iter().position(pred)
    }

    /// Index of the transition into `state`.
    pub fn transition_index(&self, state: AttemptState) -> Option<usize> {
        self.position(|e| matches!(e, Event::Transition(_, to) if *to == state))
    }

    /// Index of the last bytes-received event.
    pub fn last_bytes_index(&self) -> Option<usize> {
        self.events()
            .iter()
            .rposition(|e| matches!(e, Event::Bytes(_)))
    }
}

impl BootstrapHooks for RecordingHooks {
    fn on_transition(&self, from: AttemptState, to: AttemptState) {
        self.events.lock().unwrap().push(Event::Transition(from, to));
    }

    fn on_bytes_received(&self, total: u64) {
        self.events.lock().unwrap().push(Event::Bytes(total));
    }

    fn on_failure(&self, error: &BootstrapError) {
        self.events.lock().unwrap().push(Event::Failure(error.kind()));
    }
}

// ── HTTP server ──

/// What the test server answers to every request.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub content_type: Option<&'static str>,
    pub body: Vec<u8>,
    pub chunk_size: usize,
    /// Pause after each chunk.
    pub delay: Duration,
}

impl Reply {
    pub fn ok(content_type: Option<&'static str>, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type,
            body,
            chunk_size: 16 * 1024,
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Self::ok(Some("text/plain"), b"not found".to_vec())
        }
    }

    pub fn chunked(mut self, chunk_size: usize, delay: Duration) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.delay = delay;
        self
    }
}

/// Serve `reply` on an ephemeral local port. Returns the URL of `/vita.wasm`.
pub async fn serve(reply: Reply) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let reply = Arc::new(reply);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let reply = reply.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }

                let mut head = format!(
                    "HTTP/1.1 {} X\r\nContent-Length: {}\r\nConnection: close\r\n",
                    reply.status,
                    reply.body.len()
                );
                if let Some(ct) = reply.content_type {
                    head.push_str(&format!("Content-Type: {}\r\n", ct));
                }
                head.push_str("\r\n");
                if socket.write_all(head.as_bytes()).await.is_err() {
                    return;
                }

                for chunk in reply.body.chunks(reply.chunk_size) {
                    if socket.write_all(chunk).await.is_err() {
                        return;
                    }
                    let _ = socket.flush().await;
                    if !reply.delay.is_zero() {
                        tokio::time::sleep(reply.delay).await;
                    }
                }
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{}/vita.wasm", addr)
}

/// A local URL nothing is listening on.
pub async fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}/vita.wasm", addr)
}
