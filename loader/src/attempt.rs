//! Bootstrap attempt — one pass of acquire → compile → instantiate → run.
//!
//! An `Attempt` is consumed by `bootstrap`, so it can never be resumed or
//! retried; retrying means asking the loader for a new attempt. Every
//! stage failure aborts the attempt immediately and nothing is handed to
//! the bridge unless every earlier stage succeeded.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use wasmtime::Engine;

use vita_bridge::{Bridge, ExitStatus, RunError, RunHandle};

use crate::cancel::CancelHandle;
use crate::config::LoaderConfig;
use crate::error::{BootstrapError, LinkError, TransportError};
use crate::loader::{compile_module, instantiate, Loader};
use crate::source::{self, Acquisition, BinarySource};
use crate::state::{AttemptState, BootstrapHooks, NoopHooks};
use crate::validation::{check_header, StreamingValidator};

static NEXT_ATTEMPT_ID: AtomicU64 = AtomicU64::new(1);

/// A single bootstrap attempt.
pub struct Attempt<'l> {
    loader: &'l Loader,
    source: BinarySource,
    tracker: Tracker,
}

impl<'l> Attempt<'l> {
    pub(crate) fn new(loader: &'l Loader, source: BinarySource) -> Self {
        let (state, _) = watch::channel(AttemptState::Idle);
        Self {
            loader,
            source,
            tracker: Tracker {
                id: NEXT_ATTEMPT_ID.fetch_add(1, Ordering::Relaxed),
                hooks: Arc::new(NoopHooks),
                state,
                cancel: CancelHandle::new(),
            },
        }
    }

    /// Process-unique attempt id, also recorded on the tracing span.
    pub fn id(&self) -> u64 {
        self.tracker.id
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn BootstrapHooks>) -> Self {
        self.tracker.hooks = hooks;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.tracker.cancel.clone()
    }

    pub fn state(&self) -> AttemptState {
        *self.tracker.state.borrow()
    }

    /// Watch state changes, including those after `bootstrap` returns.
    pub fn subscribe(&self) -> watch::Receiver<AttemptState> {
        self.tracker.state.subscribe()
    }

    /// Run the attempt against `bridge`.
    ///
    /// Returns once the module has been handed to the bridge. The guest's
    /// own completion is reported by `Running::wait`.
    pub async fn bootstrap<B: Bridge>(self, bridge: &B) -> Result<Running, BootstrapError> {
        let Attempt {
            loader,
            source,
            tracker,
        } = self;
        let span = info_span!("bootstrap", attempt = tracker.id, source = %source);

        async move {
            let started = Instant::now();
            match drive(loader, &tracker, source, bridge).await {
                Ok(handle) => {
                    info!(elapsed_ms = started.elapsed().as_millis() as u64, "guest handed to bridge");
                    Ok(tracker.supervise(handle))
                }
                Err(err) => {
                    tracker.fail(&err);
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// A module that has been handed to its bridge.
#[derive(Debug)]
pub struct Running {
    id: u64,
    state: watch::Receiver<AttemptState>,
    completion: oneshot::Receiver<Result<ExitStatus, BootstrapError>>,
}

impl Running {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// `Running` until the guest finishes, then `Completed` or `Failed`.
    pub fn state(&self) -> AttemptState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AttemptState> {
        self.state.clone()
    }

    /// Wait for the guest to finish.
    ///
    /// Event-driven guests may never finish; dropping `Running` detaches
    /// from the guest without stopping it.
    pub async fn wait(self) -> Result<ExitStatus, BootstrapError> {
        match self.completion.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RunError::Panicked("run supervisor dropped".into()).into()),
        }
    }
}

/// State, hooks and cancellation shared by the stages of one attempt.
struct Tracker {
    id: u64,
    hooks: Arc<dyn BootstrapHooks>,
    state: watch::Sender<AttemptState>,
    cancel: CancelHandle,
}

impl Tracker {
    fn advance(&self, next: AttemptState) {
        let prev = self.state.send_replace(next);
        debug_assert!(prev.can_advance_to(next), "illegal transition {} -> {}", prev, next);
        debug!(from = %prev, to = %next, "attempt state");
        self.hooks.on_transition(prev, next);
    }

    fn fail(&self, err: &BootstrapError) {
        error!(kind = ?err.kind(), error = %err, "bootstrap failed");
        self.advance(AttemptState::Failed);
        self.hooks.on_failure(err);
    }

    fn ensure_live(&self) -> Result<(), BootstrapError> {
        if self.cancel.is_cancelled() {
            return Err(BootstrapError::Cancelled);
        }
        Ok(())
    }

    /// Race `fut` against cancellation.
    async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output, BootstrapError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BootstrapError::Cancelled),
            out = fut => Ok(out),
        }
    }

    /// Follow the guest to completion in the background.
    fn supervise(self, handle: RunHandle) -> Running {
        let id = self.id;
        let state = self.state.subscribe();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(
            async move {
                let outcome = handle.wait().await.map_err(BootstrapError::from);
                match &outcome {
                    Ok(status) => {
                        info!(code = status.code(), "guest completed");
                        self.advance(AttemptState::Completed);
                    }
                    Err(err) => self.fail(err),
                }
                let _ = tx.send(outcome);
            }
            .instrument(Span::current()),
        );

        Running {
            id,
            state,
            completion: rx,
        }
    }
}

async fn drive<B: Bridge>(
    loader: &Loader,
    tracker: &Tracker,
    source: BinarySource,
    bridge: &B,
) -> Result<RunHandle, BootstrapError> {
    if !Engine::same(loader.engine(), bridge.engine()) {
        return Err(LinkError::EngineMismatch.into());
    }
    // Refuse before any guest code exists: a start function must not run
    // on a bridge that will not take the module.
    let slot = bridge.reserve()?;
    let config = loader.config();

    // 1. Acquire
    tracker.advance(AttemptState::Acquiring);
    let mut acquisition = tracker
        .cancellable(source::open(loader.client(), config, source))
        .await??;

    // 2. Compile
    let bytes = if config.streaming && acquisition.streamable {
        receive_streaming(config, tracker, &mut acquisition).await?
    } else {
        if config.streaming && acquisition.in_memory() {
            debug!("binary already in memory, compiling in one pass");
        } else if config.streaming {
            warn!(
                content_type = ?acquisition.content_type,
                "streaming compilation unavailable, buffering binary"
            );
        }
        receive_buffered(config, tracker, &mut acquisition).await?
    };
    let module = tracker
        .cancellable(compile_module(loader.engine(), bytes))
        .await??;
    tracker.ensure_live()?;

    // 3. Instantiate
    tracker.advance(AttemptState::Instantiating);
    let instantiated = instantiate(config, bridge, &module)?;
    tracker.ensure_live()?;

    // 4. Run: ownership of the instance moves to the bridge here.
    let handle = bridge.run(slot, instantiated)?;
    tracker.advance(AttemptState::Running);
    Ok(handle)
}

/// Validate chunks as they arrive. Enters `Compiling` with the first chunk.
async fn receive_streaming(
    config: &LoaderConfig,
    tracker: &Tracker,
    acquisition: &mut Acquisition,
) -> Result<Vec<u8>, BootstrapError> {
    let capacity = acquisition.content_length.unwrap_or(0) as usize;
    let mut validator = StreamingValidator::with_capacity(capacity);
    let mut intake = Intake::new(config);

    while let Some(chunk) = next_chunk(config, tracker, acquisition).await? {
        if chunk.is_empty() {
            continue;
        }
        if intake.received == 0 {
            tracker.advance(AttemptState::Compiling);
        }
        intake.accept(&chunk)?;
        validator.push(&chunk)?;
        tracker.hooks.on_bytes_received(intake.received);
    }

    if intake.received == 0 {
        tracker.advance(AttemptState::Compiling);
    }
    intake.verify()?;
    let functions = validator.functions_validated();
    let bytes = validator.finish()?;
    debug!(functions, "streamed binary validated");
    Ok(bytes)
}

/// Read the whole binary, then enter `Compiling`.
async fn receive_buffered(
    config: &LoaderConfig,
    tracker: &Tracker,
    acquisition: &mut Acquisition,
) -> Result<Vec<u8>, BootstrapError> {
    let capacity = acquisition.content_length.unwrap_or(0) as usize;
    let mut bytes = Vec::with_capacity(capacity);
    let mut intake = Intake::new(config);

    while let Some(chunk) = next_chunk(config, tracker, acquisition).await? {
        intake.accept(&chunk)?;
        bytes.extend_from_slice(&chunk);
        tracker.hooks.on_bytes_received(intake.received);
    }
    intake.verify()?;

    tracker.advance(AttemptState::Compiling);
    check_header(&bytes)?;
    Ok(bytes)
}

async fn next_chunk(
    config: &LoaderConfig,
    tracker: &Tracker,
    acquisition: &mut Acquisition,
) -> Result<Option<Bytes>, BootstrapError> {
    let read = acquisition.next_chunk();
    let chunk = match config.idle_timeout {
        Some(limit) => tracker
            .cancellable(tokio::time::timeout(limit, read))
            .await?
            .map_err(|_| TransportError::IdleTimeout(limit))?,
        None => tracker.cancellable(read).await?,
    };
    Ok(chunk?)
}

/// Size accounting and digest over the acquired bytes.
struct Intake<'c> {
    config: &'c LoaderConfig,
    received: u64,
    hasher: blake3::Hasher,
}

impl<'c> Intake<'c> {
    fn new(config: &'c LoaderConfig) -> Self {
        Self {
            config,
            received: 0,
            hasher: blake3::Hasher::new(),
        }
    }

    fn accept(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
        self.received += chunk.len() as u64;
        if self.received > self.config.max_binary_size {
            return Err(TransportError::TooLarge {
                size: self.received,
                max: self.config.max_binary_size,
            });
        }
        self.hasher.update(chunk);
        debug!(len = chunk.len(), total = self.received, "chunk received");
        Ok(())
    }

    fn verify(&self) -> Result<(), TransportError> {
        let digest = self.hasher.finalize();
        info!(bytes = self.received, blake3 = %digest.to_hex(), "binary acquired");
        match self.config.expected_digest {
            Some(expected) if expected != digest => Err(TransportError::DigestMismatch {
                expected: expected.to_hex().to_string(),
                actual: digest.to_hex().to_string(),
            }),
            _ => Ok(()),
        }
    }
}
