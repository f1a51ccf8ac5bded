//! `RuntimeBridge` — the reference bridge for command-style guests.
//!
//! Built once at process start with `RuntimeBridge::builder` and passed
//! by reference to the loader. It provides the emulated WASI surface plus
//! any host functions the embedding registers, and runs the guest's entry
//! export on Tokio's blocking pool so the event loop stays free.
//!
//! A bridge runs one module at a time. `reserve` while a guest is alive,
//! or while another attempt holds the slot, is refused with
//! `RunError::Busy`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};
use wasmtime::{Engine, IntoFunc};

use crate::error::{BridgeError, RunError};
use crate::host_state::HostState;
use crate::linker::register_wasi;
use crate::surface::{HostContext, ImportSurface, InstantiatedModule};
use crate::traits::{Bridge, RunHandle, RunSlot};
use crate::types::{ExitStatus, OutputSink};

/// Default entry export, as produced by WASI command toolchains.
pub const DEFAULT_ENTRY: &str = "_start";

/// Guest process settings applied to every run.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Name of the exported `() -> ()` function to call.
    pub entry: String,
    /// Guest `argv`, including the program name.
    pub args: Vec<String>,
    /// Guest environment.
    pub env: Vec<(String, String)>,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            entry: DEFAULT_ENTRY.to_string(),
            args: vec!["main.wasm".to_string()],
            env: Vec::new(),
            stdout: OutputSink::Inherit,
            stderr: OutputSink::Inherit,
        }
    }
}

/// Reference host runtime bridge.
pub struct RuntimeBridge {
    engine: Engine,
    surface: Arc<ImportSurface<HostState>>,
    config: Arc<BridgeConfig>,
    busy: Arc<AtomicBool>,
}

impl RuntimeBridge {
    pub fn builder(engine: &Engine) -> RuntimeBridgeBuilder {
        RuntimeBridgeBuilder::new(engine)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Whether a guest is currently running on this bridge.
    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Bridge for RuntimeBridge {
    type State = HostState;

    fn engine(&self) -> &Engine {
        &self.engine
    }

    fn import_surface(&self) -> &ImportSurface<HostState> {
        &self.surface
    }

    fn new_state(&self) -> HostState {
        HostState::new(
            &self.config.args,
            &self.config.env,
            self.config.stdout.clone(),
            self.config.stderr.clone(),
        )
    }

    fn reserve(&self) -> Result<RunSlot, RunError> {
        RunSlot::exclusive(&self.busy).ok_or(RunError::Busy)
    }

    fn run(&self, slot: RunSlot, module: InstantiatedModule<HostState>) -> Result<RunHandle, RunError> {
        if !slot.claims(&self.busy) {
            return Err(RunError::ForeignSlot);
        }

        let (mut store, instance) = module.into_parts();
        let entry = instance
            .get_typed_func::<(), ()>(&mut store, &self.config.entry)
            .map_err(|e| RunError::MissingEntry {
                name: self.config.entry.clone(),
                reason: format!("{:#}", e),
            })?;

        info!(entry = %self.config.entry, "starting guest");
        let task = tokio::task::spawn_blocking(move || {
            let _slot = slot;
            let outcome = match entry.call(&mut store, ()) {
                Ok(()) => Ok(ExitStatus::SUCCESS),
                Err(e) => RunError::classify(e),
            };
            match &outcome {
                Ok(status) => info!(code = status.code(), "guest exited"),
                Err(e) => warn!(error = %e, "guest failed"),
            }
            outcome
        });

        Ok(RunHandle::new(task))
    }
}

/// Builder for `RuntimeBridge`.
pub struct RuntimeBridgeBuilder {
    engine: Engine,
    surface: ImportSurface<HostState>,
    config: BridgeConfig,
    wasi: bool,
}

impl RuntimeBridgeBuilder {
    pub fn new(engine: &Engine) -> Self {
        Self {
            engine: engine.clone(),
            surface: ImportSurface::new(engine),
            config: BridgeConfig::default(),
            wasi: true,
        }
    }

    /// Name of the entry export. Default: `_start`.
    pub fn entry(mut self, name: impl Into<String>) -> Self {
        self.config.entry = name.into();
        self
    }

    /// Replace the guest's argv.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.config.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add one guest environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.push((key.into(), value.into()));
        self
    }

    pub fn stdout(mut self, sink: OutputSink) -> Self {
        self.config.stdout = sink;
        self
    }

    pub fn stderr(mut self, sink: OutputSink) -> Self {
        self.config.stderr = sink;
        self
    }

    /// Leave the WASI functions off the import surface.
    pub fn without_wasi(mut self) -> Self {
        self.wasi = false;
        self
    }

    /// Register an extra host function.
    pub fn func_wrap<Params, Args>(
        mut self,
        module: &str,
        name: &str,
        func: impl IntoFunc<HostContext<HostState>, Params, Args>,
    ) -> Result<Self, BridgeError> {
        self.surface.func_wrap(module, name, func)?;
        Ok(self)
    }

    /// Freeze the import surface and build the bridge.
    pub fn build(mut self) -> Result<RuntimeBridge, BridgeError> {
        if self.wasi {
            register_wasi(&mut self.surface)?;
        }
        debug!(
            imports = self.surface.len(),
            entry = %self.config.entry,
            "runtime bridge ready"
        );
        Ok(RuntimeBridge {
            engine: self.engine,
            surface: Arc::new(self.surface),
            config: Arc::new(self.config),
            busy: Arc::new(AtomicBool::new(false)),
        })
    }
}
