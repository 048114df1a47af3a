//! peerlink-testkit: Conformance scenarios for peerlink transports.
//!
//! Provides a [`ConnectionFactory`] trait and shared end-to-end scenarios
//! that every transport must pass.
//!
//! # Usage
//!
//! Each transport crate implements `ConnectionFactory` and runs the shared
//! scenarios from its `tests/` directory:
//!
//! ```ignore
//! use peerlink_testkit::{ConnectionFactory, TestError};
//!
//! struct MemFactory;
//!
//! impl ConnectionFactory for MemFactory {
//!     type Conn = MemConnection;
//!
//!     async fn pair() -> Result<(Self::Conn, Self::Conn), TestError> {
//!         Ok(MemConnection::pair())
//!     }
//! }
//!
//! #[tokio::test]
//! async fn mem_ping_pong() {
//!     peerlink_testkit::run_ping_pong::<MemFactory>().await;
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use peerlink::{Peer, PeerConfig, PeerError, typed_handler};
use peerlink_core::{Connection, TransportError, code};
use tokio_util::sync::CancellationToken;

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    /// Transport creation failed.
    Setup(String),
    /// A peer operation failed.
    Peer(PeerError),
    /// Transport operation failed.
    Transport(TransportError),
    /// Assertion failed.
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {msg}"),
            TestError::Peer(e) => write!(f, "peer error: {e}"),
            TestError::Transport(e) => write!(f, "transport error: {e}"),
            TestError::Assertion(msg) => write!(f, "assertion failed: {msg}"),
        }
    }
}

impl std::error::Error for TestError {}

impl From<PeerError> for TestError {
    fn from(e: PeerError) -> Self {
        TestError::Peer(e)
    }
}

impl From<TransportError> for TestError {
    fn from(e: TransportError) -> Self {
        TestError::Transport(e)
    }
}

/// Factory for connected transport pairs.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The connection type being tested.
    type Conn: Connection + 'static;

    /// Create a connected pair: frames sent from one side are received by
    /// the other and vice versa.
    fn pair() -> impl Future<Output = Result<(Self::Conn, Self::Conn), TestError>> + Send;
}

fn peers<C: Connection + 'static>(a: C, b: C) -> (Arc<Peer>, Arc<Peer>, CancellationToken) {
    let alice = Arc::new(Peer::attached(a, PeerConfig::default()));
    let bob = Arc::new(Peer::attached(b, PeerConfig::default()));
    let token = CancellationToken::new();
    tokio::spawn(alice.clone().listen(token.clone()));
    tokio::spawn(bob.clone().listen(token.clone()));
    (alice, bob, token)
}

// ============================================================================
// Scenarios
// ============================================================================

/// `"ping"` answers the literal string `"pong"`.
pub async fn run_ping_pong<F: ConnectionFactory>() {
    if let Err(e) = run_ping_pong_inner::<F>().await {
        panic!("run_ping_pong failed: {e}");
    }
}

async fn run_ping_pong_inner<F: ConnectionFactory>() -> Result<(), TestError> {
    let (a, b) = F::pair().await?;
    let (alice, bob, _token) = peers(a, b);

    bob.register("ping", typed_handler(|_ctx, (): ()| async { Ok("pong") }));

    let result = alice.call("ping", &()).await?;
    if result.get() != r#""pong""# {
        return Err(TestError::Assertion(format!(
            "expected \"pong\", got {}",
            result.get()
        )));
    }
    Ok(())
}

/// An echo handler returns arbitrary params byte-equal after round-trip
/// normalization.
pub async fn run_echo_roundtrip<F: ConnectionFactory>() {
    if let Err(e) = run_echo_roundtrip_inner::<F>().await {
        panic!("run_echo_roundtrip failed: {e}");
    }
}

async fn run_echo_roundtrip_inner<F: ConnectionFactory>() -> Result<(), TestError> {
    let (a, b) = F::pair().await?;
    let (alice, bob, _token) = peers(a, b);

    bob.register("echo", |_ctx, params| async move {
        match params {
            Some(raw) => Ok(raw),
            None => Err(peerlink::RpcError::invalid_params("echo requires params")),
        }
    });

    let params = serde_json::json!({"foo": "bar", "value": 42, "nested": [1, null, true]});
    let result = alice.call("echo", &params).await?;
    let echoed: serde_json::Value = serde_json::from_str(result.get())
        .map_err(|e| TestError::Assertion(format!("result is not JSON: {e}")))?;

    if echoed != params {
        return Err(TestError::Assertion(format!(
            "expected {params}, got {echoed}"
        )));
    }
    Ok(())
}

/// Calling a method nobody registered answers `-32601 Method not found`.
pub async fn run_unknown_method<F: ConnectionFactory>() {
    if let Err(e) = run_unknown_method_inner::<F>().await {
        panic!("run_unknown_method failed: {e}");
    }
}

async fn run_unknown_method_inner<F: ConnectionFactory>() -> Result<(), TestError> {
    let (a, b) = F::pair().await?;
    let (alice, _bob, _token) = peers(a, b);

    match alice.call("does.not.exist", &()).await {
        Err(PeerError::Rpc(e)) if e.code == code::METHOD_NOT_FOUND => {
            if e.message != "Method not found" {
                return Err(TestError::Assertion(format!(
                    "unexpected message: {}",
                    e.message
                )));
            }
            Ok(())
        }
        Err(e) => Err(TestError::Assertion(format!(
            "expected -32601, got {e:?}"
        ))),
        Ok(v) => Err(TestError::Assertion(format!(
            "expected error, got result {}",
            v.get()
        ))),
    }
}

/// A notification never elicits a reply, even without a handler.
pub async fn run_notification_silent<F: ConnectionFactory>() {
    if let Err(e) = run_notification_silent_inner::<F>().await {
        panic!("run_notification_silent failed: {e}");
    }
}

async fn run_notification_silent_inner<F: ConnectionFactory>() -> Result<(), TestError> {
    let (probe, b) = F::pair().await?;
    let bob = Arc::new(Peer::attached(b, PeerConfig::default()));
    let token = CancellationToken::new();
    tokio::spawn(bob.clone().listen(token.clone()));

    probe
        .send(br#"{"jsonrpc":"2.0","method":"log","params":["entry"]}"#.to_vec())
        .await?;

    match tokio::time::timeout(Duration::from_millis(200), probe.receive()).await {
        Err(_) => Ok(()),
        Ok(frame) => Err(TestError::Assertion(format!(
            "notification elicited traffic: {frame:?}"
        ))),
    }
}

/// Interleaved concurrent calls all land on the right caller.
pub async fn run_concurrent_calls<F: ConnectionFactory>() {
    if let Err(e) = run_concurrent_calls_inner::<F>().await {
        panic!("run_concurrent_calls failed: {e}");
    }
}

async fn run_concurrent_calls_inner<F: ConnectionFactory>() -> Result<(), TestError> {
    let (a, b) = F::pair().await?;
    let (alice, bob, _token) = peers(a, b);

    bob.register(
        "double",
        typed_handler(|_ctx, n: i64| async move {
            // Stagger completions so responses interleave.
            tokio::time::sleep(Duration::from_millis((n % 4) as u64 * 10)).await;
            Ok(n * 2)
        }),
    );

    let mut tasks = Vec::new();
    for n in 0..8i64 {
        let caller = alice.clone();
        tasks.push(tokio::spawn(async move {
            caller.call("double", &n).await.map(|raw| (n, raw))
        }));
    }

    for task in tasks {
        let (n, raw) = task
            .await
            .map_err(|e| TestError::Setup(format!("caller task panicked: {e}")))??;
        let doubled: i64 = serde_json::from_str(raw.get())
            .map_err(|e| TestError::Assertion(format!("result is not a number: {e}")))?;
        if doubled != n * 2 {
            return Err(TestError::Assertion(format!(
                "double({n}) answered {doubled}"
            )));
        }
    }
    Ok(())
}

/// Both sides call each other at the same time over one connection.
pub async fn run_bidirectional_calls<F: ConnectionFactory>() {
    if let Err(e) = run_bidirectional_calls_inner::<F>().await {
        panic!("run_bidirectional_calls failed: {e}");
    }
}

async fn run_bidirectional_calls_inner<F: ConnectionFactory>() -> Result<(), TestError> {
    let (a, b) = F::pair().await?;
    let (alice, bob, _token) = peers(a, b);

    alice.register("whoami", typed_handler(|_ctx, (): ()| async { Ok("alice") }));
    bob.register("whoami", typed_handler(|_ctx, (): ()| async { Ok("bob") }));

    let from_alice = alice.call("whoami", &());
    let from_bob = bob.call("whoami", &());
    let (heard_by_alice, heard_by_bob) = tokio::join!(from_alice, from_bob);

    if heard_by_alice?.get() != r#""bob""# {
        return Err(TestError::Assertion("alice did not reach bob".into()));
    }
    if heard_by_bob?.get() != r#""alice""# {
        return Err(TestError::Assertion("bob did not reach alice".into()));
    }
    Ok(())
}
