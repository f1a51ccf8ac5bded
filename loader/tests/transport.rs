//! Acquisition failures and cancellation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use vita_loader::{
    AttemptState, BinarySource, BootstrapError, BootstrapHooks, CancelHandle, ErrorKind,
    LoaderConfig, TransportError, WASM_CONTENT_TYPE,
};

use common::*;

#[tokio::test]
async fn test_unreachable_source_never_compiles() {
    let url = unreachable_url().await;
    let loader = loader_with(LoaderConfig {
        connect_timeout: Duration::from_secs(2),
        ..LoaderConfig::default()
    });
    let (bridge, _) = bridge(&loader);
    let hooks = RecordingHooks::new();

    let err = loader
        .attempt(BinarySource::url(&url).unwrap())
        .with_hooks(hooks.clone())
        .bootstrap(&bridge)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(hooks.entered(AttemptState::Compiling), 0);
    assert_eq!(
        hooks.states(),
        vec![AttemptState::Acquiring, AttemptState::Failed]
    );
    assert_eq!(bridge.runs(), 0);
}

#[tokio::test]
async fn test_http_error_status() {
    let url = serve(Reply::status(404)).await;
    let loader = loader();
    let (bridge, _) = bridge(&loader);

    let err = loader
        .bootstrap(BinarySource::url(&url).unwrap(), &bridge)
        .await
        .unwrap_err();
    match err {
        BootstrapError::Transport(TransportError::HttpStatus { status, url: failed }) => {
            assert_eq!(status, 404);
            assert_eq!(failed, url);
        }
        other => panic!("expected HTTP status error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_file() {
    let loader = loader();
    let (bridge, _) = bridge(&loader);
    let err = loader
        .bootstrap(BinarySource::file("/nonexistent/vita.wasm"), &bridge)
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::Transport(TransportError::Io(_))));
}

#[tokio::test]
async fn test_stalled_stream_hits_idle_timeout() {
    let url = serve(
        Reply::ok(Some(WASM_CONTENT_TYPE), large_module(64 * 1024))
            .chunked(1024, Duration::from_secs(10)),
    )
    .await;
    let loader = loader_with(LoaderConfig {
        idle_timeout: Some(Duration::from_millis(200)),
        ..LoaderConfig::default()
    });
    let (bridge, _) = bridge(&loader);

    let err = loader
        .bootstrap(BinarySource::url(&url).unwrap(), &bridge)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BootstrapError::Transport(TransportError::IdleTimeout(_))
    ));
    assert_eq!(bridge.runs(), 0);
}

#[tokio::test]
async fn test_channel_error_aborts_attempt() {
    let (tx, source) = BinarySource::channel(Some(WASM_CONTENT_TYPE), 2);
    let loader = loader();
    let (bridge, _) = bridge(&loader);

    let feed = async move {
        tx.send(Ok(Bytes::from_static(b"\0asm\x01\0\0\0"))).await.unwrap();
        tx.send(Err(TransportError::Io("connection reset".into())))
            .await
            .unwrap();
    };
    let (result, ()) = tokio::join!(loader.bootstrap(source, &bridge), feed);
    assert!(matches!(
        result.unwrap_err(),
        BootstrapError::Transport(TransportError::Io(_))
    ));
    assert_eq!(bridge.runs(), 0);
}

// ── Cancellation ──

#[tokio::test]
async fn test_cancel_mid_stream_never_runs() {
    let (tx, source) = BinarySource::channel(Some(WASM_CONTENT_TYPE), 2);
    let loader = loader();
    let (bridge, _) = bridge(&loader);
    let hooks = RecordingHooks::new();

    let attempt = loader.attempt(source).with_hooks(hooks.clone());
    let cancel = attempt.cancel_handle();
    let mut states = attempt.subscribe();

    let feed = async move {
        let module = wasm(HELLO_WAT);
        tx.send(Ok(Bytes::copy_from_slice(&module[..10]))).await.unwrap();
        states
            .wait_for(|s| *s == AttemptState::Compiling)
            .await
            .unwrap();
        cancel.cancel();
        // Keep the stream open so only cancellation can end the attempt.
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(tx);
    };
    let (result, ()) = tokio::join!(attempt.bootstrap(&bridge), feed);

    assert!(matches!(result.unwrap_err(), BootstrapError::Cancelled));
    assert_eq!(bridge.runs(), 0);
    assert_eq!(hooks.entered(AttemptState::Instantiating), 0);
    assert!(hooks.events().contains(&Event::Failure(ErrorKind::Cancelled)));
}

/// Cancels the attempt the moment it enters `state`.
struct CancelOnEnter {
    state: AttemptState,
    handle: CancelHandle,
}

impl BootstrapHooks for CancelOnEnter {
    fn on_transition(&self, _from: AttemptState, to: AttemptState) {
        if to == self.state {
            self.handle.cancel();
        }
    }
}

#[tokio::test]
async fn test_cancel_while_compiling_never_runs() {
    let loader = loader();
    let (bridge, stdout) = bridge(&loader);

    let attempt = loader.attempt(BinarySource::bytes(wasm(HELLO_WAT)));
    let hooks = Arc::new(CancelOnEnter {
        state: AttemptState::Compiling,
        handle: attempt.cancel_handle(),
    });
    let err = attempt.with_hooks(hooks).bootstrap(&bridge).await.unwrap_err();

    assert!(matches!(err, BootstrapError::Cancelled));
    assert_eq!(bridge.runs(), 0);
    assert_eq!(stdout.to_string_lossy(), "");

    // The bridge slot is free again.
    loader
        .bootstrap(BinarySource::bytes(wasm(HELLO_WAT)), &bridge)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(bridge.runs(), 1);
}

#[tokio::test]
async fn test_cancel_before_start() {
    let loader = loader();
    let (bridge, _) = bridge(&loader);

    let attempt = loader.attempt(BinarySource::bytes(wasm(HELLO_WAT)));
    attempt.cancel_handle().cancel();
    let err = attempt.bootstrap(&bridge).await.unwrap_err();

    assert!(matches!(err, BootstrapError::Cancelled));
    assert_eq!(bridge.runs(), 0);
}

#[tokio::test]
async fn test_cancel_after_handoff_does_not_stop_guest() {
    let loader = loader();
    let (bridge, stdout) = bridge(&loader);

    let attempt = loader.attempt(BinarySource::bytes(wasm(HELLO_WAT)));
    let cancel = attempt.cancel_handle();
    let running = attempt.bootstrap(&bridge).await.unwrap();
    cancel.cancel();

    assert!(running.wait().await.unwrap().success());
    assert_eq!(stdout.to_string_lossy(), "hello, vita\n");
}
