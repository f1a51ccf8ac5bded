//! Bridge trait — the contract a loader consumes.
//!
//! A bridge owns the import surface a compiled guest links against and
//! knows how to start the guest once it has been instantiated. The loader
//! never looks inside: it takes a `RunSlot` with `reserve` before fetching
//! anything, reads `import_surface`, creates per-run state with
//! `new_state`, and hands the slot and the instance to `run`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use wasmtime::Engine;

use crate::error::RunError;
use crate::surface::{ImportSurface, InstantiatedModule};
use crate::types::ExitStatus;

/// Host runtime bridge for a compiled guest.
pub trait Bridge: Send + Sync {
    /// Per-run state stored in the guest's `Store`.
    type State: Send + 'static;

    /// Engine the import surface was built against. Modules must be
    /// compiled with the same engine.
    fn engine(&self) -> &Engine;

    /// The fully populated import surface. Read-only once built.
    fn import_surface(&self) -> &ImportSurface<Self::State>;

    /// Fresh state for a new `Store`.
    fn new_state(&self) -> Self::State;

    /// Claim the right to run one module.
    ///
    /// Called before the module is acquired or instantiated, so a bridge
    /// that cannot take another guest refuses before any guest code (a
    /// start function included) executes. Dropping the slot unused
    /// releases it.
    fn reserve(&self) -> Result<RunSlot, RunError>;

    /// Take ownership of an instantiated module and start its entry point.
    ///
    /// `slot` must come from `reserve` on this bridge and is held until
    /// the guest finishes. Returns an error without running anything if
    /// the module cannot be started. Otherwise execution proceeds in the
    /// background and the returned handle resolves when the guest finishes.
    fn run(
        &self,
        slot: RunSlot,
        module: InstantiatedModule<Self::State>,
    ) -> Result<RunHandle, RunError>;
}

/// A reserved run on a bridge.
///
/// Exclusive slots hold their bridge's busy flag until dropped.
#[derive(Debug)]
pub struct RunSlot {
    flag: Option<Arc<AtomicBool>>,
}

impl RunSlot {
    /// Set `flag`, or `None` if it is already set.
    pub fn exclusive(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                flag: Some(Arc::clone(flag)),
            })
    }

    /// A slot for bridges that run any number of guests at once.
    pub fn unbounded() -> Self {
        Self { flag: None }
    }

    /// Whether this slot holds `flag`.
    pub fn claims(&self, flag: &Arc<AtomicBool>) -> bool {
        self.flag.as_ref().is_some_and(|held| Arc::ptr_eq(held, flag))
    }
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        if let Some(flag) = &self.flag {
            flag.store(false, Ordering::Release);
        }
    }
}

/// Completion handle for a running guest.
///
/// Dropping the handle detaches the guest; it keeps running until it
/// returns on its own.
#[derive(Debug)]
pub struct RunHandle {
    task: JoinHandle<Result<ExitStatus, RunError>>,
}

impl RunHandle {
    pub fn new(task: JoinHandle<Result<ExitStatus, RunError>>) -> Self {
        Self { task }
    }

    /// Wait for the guest to finish.
    pub async fn wait(self) -> Result<ExitStatus, RunError> {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(RunError::Panicked(e.to_string())),
        }
    }
}
