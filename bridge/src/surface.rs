//! Import surface and instantiated-module types.
//!
//! An `ImportSurface` is the set of host functions a guest can import,
//! keyed by `(module, name)`. It wraps a Wasmtime `Linker` and remembers
//! every name registered on it so a loader can report exactly which
//! import is missing before attempting instantiation.
//!
//! Store data is always a `HostContext<S>`: the resource limits applied by
//! the loader plus the bridge's own per-run state `S`.

use std::collections::BTreeSet;

use wasmtime::{Engine, Instance, IntoFunc, Linker, Module, Store, StoreLimits};

use crate::error::BridgeError;

/// Data held in the Wasmtime `Store` of an instantiated module.
pub struct HostContext<S> {
    /// Memory, table and instance limits enforced by the store limiter.
    pub limits: StoreLimits,
    /// Bridge-defined per-run state.
    pub state: S,
}

impl<S> HostContext<S> {
    pub fn new(limits: StoreLimits, state: S) -> Self {
        Self { limits, state }
    }
}

/// Host functions available to a guest, keyed by `(module, name)`.
pub struct ImportSurface<S: 'static> {
    linker: Linker<HostContext<S>>,
    defined: BTreeSet<(String, String)>,
}

impl<S: 'static> ImportSurface<S> {
    pub fn new(engine: &Engine) -> Self {
        Self {
            linker: Linker::new(engine),
            defined: BTreeSet::new(),
        }
    }

    /// Register a host function under `module::name`.
    pub fn func_wrap<Params, Args>(
        &mut self,
        module: &str,
        name: &str,
        func: impl IntoFunc<HostContext<S>, Params, Args>,
    ) -> Result<&mut Self, BridgeError> {
        self.linker
            .func_wrap(module, name, func)
            .map_err(|source| BridgeError::Registration {
                module: module.to_string(),
                name: name.to_string(),
                source,
            })?;
        self.defined.insert((module.to_string(), name.to_string()));
        Ok(self)
    }

    /// Whether `module::name` has been registered.
    pub fn contains(&self, module: &str, name: &str) -> bool {
        self.defined
            .contains(&(module.to_string(), name.to_string()))
    }

    /// Imports declared by `module` that this surface does not provide,
    /// in declaration order.
    pub fn missing_imports(&self, module: &Module) -> Vec<(String, String)> {
        module
            .imports()
            .filter(|import| !self.contains(import.module(), import.name()))
            .map(|import| (import.module().to_string(), import.name().to_string()))
            .collect()
    }

    /// Number of registered host functions.
    pub fn len(&self) -> usize {
        self.defined.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defined.is_empty()
    }

    /// The engine host functions were registered against.
    pub fn engine(&self) -> &Engine {
        self.linker.engine()
    }

    /// Read-only access to the underlying linker.
    pub fn linker(&self) -> &Linker<HostContext<S>> {
        &self.linker
    }
}

/// A live module instance together with the store that owns its memory.
///
/// Produced by the loader and moved by value into `Bridge::run`. Whoever
/// holds it has exclusive control of the guest's linear memory and stack.
pub struct InstantiatedModule<S: 'static> {
    store: Store<HostContext<S>>,
    instance: Instance,
}

impl<S: 'static> InstantiatedModule<S> {
    pub fn new(store: Store<HostContext<S>>, instance: Instance) -> Self {
        Self { store, instance }
    }

    pub fn into_parts(self) -> (Store<HostContext<S>>, Instance) {
        (self.store, self.instance)
    }
}
