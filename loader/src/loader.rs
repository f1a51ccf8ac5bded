//! Loader — engine setup, compilation and instantiation.
//!
//! The `Loader` owns the Wasmtime engine and the HTTP client shared by all
//! attempts. Bridges must be built on `Loader::engine` so compiled modules
//! can link against their import surface.

use std::sync::Arc;

use tracing::{debug, info};
use wasmtime::{Config, Engine, Module, Store};

use vita_bridge::{Bridge, HostContext, InstantiatedModule, RunError};

use crate::attempt::{Attempt, Running};
use crate::config::LoaderConfig;
use crate::error::{BootstrapError, FormatError, LinkError, ResourceError, TransportError};
use crate::source::BinarySource;

/// Bootstrap loader.
///
/// Cheap to clone; clones share the engine and HTTP client.
#[derive(Clone)]
pub struct Loader {
    engine: Engine,
    config: Arc<LoaderConfig>,
    client: reqwest::Client,
}

impl Loader {
    pub fn new(config: LoaderConfig) -> Result<Self, BootstrapError> {
        let engine = create_engine(&config)?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(TransportError::from)?;
        Ok(Self {
            engine,
            config: Arc::new(config),
            client,
        })
    }

    /// Engine every bridge used with this loader must be built on.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Start a new attempt for `source`. Nothing happens until
    /// `Attempt::bootstrap` is awaited.
    pub fn attempt(&self, source: BinarySource) -> Attempt<'_> {
        Attempt::new(self, source)
    }

    /// Acquire, compile and instantiate `source`, then hand it to `bridge`.
    pub async fn bootstrap<B: Bridge>(
        &self,
        source: BinarySource,
        bridge: &B,
    ) -> Result<Running, BootstrapError> {
        self.attempt(source).bootstrap(bridge).await
    }
}

/// Create a Wasmtime engine for the given configuration.
fn create_engine(config: &LoaderConfig) -> Result<Engine, BootstrapError> {
    let mut wasm_config = Config::new();

    // Fuel metering is only paid for when a limit is configured.
    wasm_config.consume_fuel(config.fuel_limit.is_some());

    Engine::new(&wasm_config).map_err(|e| ResourceError::Engine(format!("{:#}", e)).into())
}

/// Validate and compile a complete binary on the blocking pool.
///
/// Both the streaming and the buffered path end here, so the resulting
/// `Module` is the same whichever way the bytes arrived. Dropping the
/// returned future does not stop a compilation that has started.
pub(crate) async fn compile_module(engine: &Engine, bytes: Vec<u8>) -> Result<Module, BootstrapError> {
    let engine = engine.clone();
    let len = bytes.len();
    let result = tokio::task::spawn_blocking(move || -> Result<Module, BootstrapError> {
        Module::validate(&engine, &bytes).map_err(|e| FormatError::Invalid(format!("{:#}", e)))?;
        Module::from_binary(&engine, &bytes)
            .map_err(|e| ResourceError::Compile(format!("{:#}", e)).into())
    })
    .await
    .map_err(|e| ResourceError::Task(e.to_string()))?;

    if let Ok(module) = &result {
        info!(
            bytes = len,
            imports = module.imports().len(),
            exports = module.exports().len(),
            "module compiled"
        );
    }
    result
}

/// Link `module` against the bridge's import surface and instantiate it.
///
/// Runs the module's start function, if it has one.
pub(crate) fn instantiate<B: Bridge>(
    config: &LoaderConfig,
    bridge: &B,
    module: &Module,
) -> Result<InstantiatedModule<B::State>, BootstrapError> {
    let surface = bridge.import_surface();

    if let Some((module_name, name)) = surface.missing_imports(module).into_iter().next() {
        return Err(LinkError::MissingImport {
            module: module_name,
            name,
        }
        .into());
    }

    let pre = surface
        .linker()
        .instantiate_pre(module)
        .map_err(|e| LinkError::Incompatible(format!("{:#}", e)))?;

    let mut store = Store::new(
        module.engine(),
        HostContext::new(config.store_limits(), bridge.new_state()),
    );
    store.limiter(|ctx| &mut ctx.limits);
    if let Some(fuel) = config.fuel_limit {
        store
            .set_fuel(fuel)
            .map_err(|e| ResourceError::Fuel(format!("{:#}", e)))?;
    }

    let instance = pre.instantiate(&mut store).map_err(classify_instantiation_error)?;
    debug!("module instantiated");
    Ok(InstantiatedModule::new(store, instance))
}

/// Traps and exits raised by a start function are start failures;
/// anything else (limits, allocation) is a resource failure.
fn classify_instantiation_error(err: anyhow::Error) -> BootstrapError {
    if RunError::is_guest_fault(&err) {
        match RunError::classify(err) {
            Ok(status) => RunError::EarlyExit(status.code()).into(),
            Err(run) => run.into(),
        }
    } else {
        ResourceError::Instantiate(format!("{:#}", err)).into()
    }
}
