//! Scoped connections: connect, run an operation, always disconnect.
//!
//! [`ConnectionManager::with_connection`] is the sanctioned way to talk to
//! the peer. It creates a fresh [`TransportClient`] per call, waits for the
//! connection with a bounded ceiling, hands the client to the operation and
//! releases the socket on every exit path: success, error, failed connect,
//! panic, or the returned future being dropped.
//!
//! Connections are not pooled. Every call pays a full TCP handshake.

use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use crate::config::{BridgeConfig, PeerAddress};
use crate::error::BridgeError;
use crate::ipc::client::TransportClient;

/// Connection lifecycle as seen by the scope manager.
///
/// Implemented by [`TransportClient`]; abstracted so the release guarantee
/// can be exercised against mock connections.
pub trait ManagedConnection: Clone + Send + Sync {
    fn peer(&self) -> &PeerAddress;

    fn is_connected(&self) -> bool;

    /// Start connecting without waiting.
    fn connect(&self);

    /// Wait for the in-progress connection attempt to settle.
    fn wait_connected(&self) -> impl Future<Output = Result<(), BridgeError>> + Send;

    fn disconnect(&self);
}

impl ManagedConnection for TransportClient {
    fn peer(&self) -> &PeerAddress {
        TransportClient::peer(self)
    }

    fn is_connected(&self) -> bool {
        TransportClient::is_connected(self)
    }

    fn connect(&self) {
        TransportClient::connect(self)
    }

    fn wait_connected(&self) -> impl Future<Output = Result<(), BridgeError>> + Send {
        TransportClient::wait_connected(self)
    }

    fn disconnect(&self) {
        TransportClient::disconnect(self)
    }
}

/// Disconnects its connection when dropped.
struct ReleaseGuard<C: ManagedConnection> {
    client: C,
}

impl<C: ManagedConnection> Drop for ReleaseGuard<C> {
    fn drop(&mut self) {
        self.client.disconnect();
        debug!("Released connection to {}", self.client.peer());
    }
}

/// Run `operation` with `client` connected, then disconnect exactly once.
///
/// # Errors
///
/// `ConnectionFailed` (converted into `E`) if the connection errors or
/// `connect_timeout` elapses first; otherwise whatever `operation` returns.
pub async fn run_scoped<C, F, Fut, T, E>(
    client: C,
    connect_timeout: Duration,
    operation: F,
) -> Result<T, E>
where
    C: ManagedConnection,
    F: FnOnce(C) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<BridgeError>,
{
    let _guard = ReleaseGuard {
        client: client.clone(),
    };

    if !client.is_connected() {
        client.connect();
        match timeout(connect_timeout, client.wait_connected()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(BridgeError::ConnectionFailed {
                    peer: client.peer().clone(),
                    reason: format!("timed out after {:?}", connect_timeout),
                }
                .into())
            }
        }
    }

    operation(client).await
}

/// Hands out scoped connections to one configured peer.
///
/// # Example
///
/// ```ignore
/// use cadbridge::{BridgeConfig, ipc::ConnectionManager};
/// use serde_json::json;
///
/// let manager = ConnectionManager::new(BridgeConfig::load()?);
/// let walls = manager
///     .with_connection(|client| async move {
///         client.send_command("get_elements", json!({"category": "Walls"})).await
///     })
///     .await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConnectionManager {
    config: BridgeConfig,
}

impl ConnectionManager {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Connect a fresh client, run `operation` with it, disconnect.
    pub async fn with_connection<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce(TransportClient) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<BridgeError>,
    {
        let client = TransportClient::new(&self.config);
        run_scoped(client, self.config.connect_timeout, operation).await
    }
}

/// [`ConnectionManager::with_connection`] using [`BridgeConfig::load`].
pub async fn with_connection<F, Fut, T, E>(operation: F) -> Result<T, E>
where
    F: FnOnce(TransportClient) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<BridgeError>,
{
    let config = BridgeConfig::load()?;
    ConnectionManager::new(config).with_connection(operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    const SHORT: Duration = Duration::from_millis(50);

    #[derive(Debug, Clone, Copy)]
    enum Outcome {
        Connects,
        Fails,
        Hangs,
    }

    struct MockState {
        peer: PeerAddress,
        outcome: Outcome,
        connected: AtomicBool,
        connects: AtomicUsize,
        disconnects: AtomicUsize,
    }

    #[derive(Clone)]
    struct MockConnection(Arc<MockState>);

    impl MockConnection {
        fn new(outcome: Outcome) -> Self {
            Self(Arc::new(MockState {
                peer: PeerAddress::new("mock", 1),
                outcome,
                connected: AtomicBool::new(false),
                connects: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
            }))
        }

        fn connects(&self) -> usize {
            self.0.connects.load(Ordering::SeqCst)
        }

        fn disconnects(&self) -> usize {
            self.0.disconnects.load(Ordering::SeqCst)
        }
    }

    impl ManagedConnection for MockConnection {
        fn peer(&self) -> &PeerAddress {
            &self.0.peer
        }

        fn is_connected(&self) -> bool {
            self.0.connected.load(Ordering::SeqCst)
        }

        fn connect(&self) {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
        }

        async fn wait_connected(&self) -> Result<(), BridgeError> {
            match self.0.outcome {
                Outcome::Connects => {
                    self.0.connected.store(true, Ordering::SeqCst);
                    Ok(())
                }
                Outcome::Fails => Err(BridgeError::ConnectionFailed {
                    peer: self.0.peer.clone(),
                    reason: "connection refused".to_string(),
                }),
                Outcome::Hangs => std::future::pending().await,
            }
        }

        fn disconnect(&self) {
            self.0.connected.store(false, Ordering::SeqCst);
            self.0.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_success_returns_result_and_disconnects_once() {
        let conn = MockConnection::new(Outcome::Connects);

        let result: Result<&str, BridgeError> = run_scoped(conn.clone(), SHORT, |c| async move {
            assert!(c.is_connected());
            Ok("pong")
        })
        .await;

        assert_eq!(result.unwrap(), "pong");
        assert_eq!(conn.connects(), 1);
        assert_eq!(conn.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_operation_error_propagates_and_disconnects_once() {
        let conn = MockConnection::new(Outcome::Connects);

        let result: Result<(), BridgeError> = run_scoped(conn.clone(), SHORT, |_| async {
            Err(BridgeError::Remote {
                message: "bad category".to_string(),
                code: None,
                data: None,
            })
        })
        .await;

        assert_eq!(result.unwrap_err().to_string(), "bad category");
        assert_eq!(conn.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_skips_operation_and_disconnects_once() {
        let conn = MockConnection::new(Outcome::Fails);
        let ran = Arc::new(AtomicBool::new(false));
        let ran_in_op = ran.clone();

        let result: Result<(), BridgeError> = run_scoped(conn.clone(), SHORT, |_| async move {
            ran_in_op.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(BridgeError::ConnectionFailed { .. })));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(conn.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_connect_timeout_disconnects_once() {
        let conn = MockConnection::new(Outcome::Hangs);

        let result: Result<(), BridgeError> =
            run_scoped(conn.clone(), SHORT, |_| async { Ok(()) }).await;

        match result {
            Err(BridgeError::ConnectionFailed { reason, .. }) => {
                assert!(reason.contains("timed out"), "{}", reason)
            }
            other => panic!("Expected ConnectionFailed, got {:?}", other),
        }
        assert_eq!(conn.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_already_connected_skips_connect() {
        let conn = MockConnection::new(Outcome::Connects);
        conn.0.connected.store(true, Ordering::SeqCst);

        let result: Result<(), BridgeError> =
            run_scoped(conn.clone(), SHORT, |_| async { Ok(()) }).await;

        assert!(result.is_ok());
        assert_eq!(conn.connects(), 0);
        assert_eq!(conn.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_panicking_operation_still_disconnects() {
        let conn = MockConnection::new(Outcome::Connects);
        let task_conn = conn.clone();

        let joined = tokio::spawn(async move {
            let _: Result<(), BridgeError> =
                run_scoped(task_conn, SHORT, |_| async {
                    if true {
                        panic!("operation blew up");
                    }
                    Ok(())
                })
                .await;
        })
        .await;

        assert!(joined.unwrap_err().is_panic());
        assert_eq!(conn.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_dropped_scope_disconnects() {
        let conn = MockConnection::new(Outcome::Connects);

        let outcome = timeout(
            SHORT,
            run_scoped(conn.clone(), SHORT, |_| async {
                std::future::pending::<Result<(), BridgeError>>().await
            }),
        )
        .await;

        assert!(outcome.is_err());
        assert_eq!(conn.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_anyhow_operation_error() {
        let conn = MockConnection::new(Outcome::Fails);

        let result: anyhow::Result<()> =
            run_scoped(conn.clone(), SHORT, |_| async { Ok(()) }).await;

        let err = result.unwrap_err();
        assert!(err.downcast_ref::<BridgeError>().is_some());
        assert_eq!(conn.disconnects(), 1);
    }
}
