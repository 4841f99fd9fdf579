//! Error types for the bridge.
//!
//! Every failure a caller of [`TransportClient`](crate::ipc::TransportClient)
//! or [`with_connection`](crate::ipc::with_connection) can observe is one
//! variant of [`BridgeError`]. Malformed inbound bytes never show up here;
//! they are logged and the affected request runs into its timeout.

use std::time::Duration;

use thiserror::Error;

use crate::config::PeerAddress;

/// Bridge error taxonomy.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The socket errored or the connect ceiling elapsed before the
    /// connection became ready.
    #[error("Connection to {peer} failed: {reason}")]
    ConnectionFailed {
        /// Peer the connection was aimed at
        peer: PeerAddress,
        /// Human-readable cause
        reason: String,
    },

    /// A command was issued while no connection could be made ready.
    #[error("Not connected to {peer}")]
    NotConnected {
        /// Peer the command was aimed at
        peer: PeerAddress,
    },

    /// No matching response arrived before the request watchdog fired.
    #[error("Command timed out after {secs}s: {command}", secs = .timeout.as_secs_f64())]
    Timeout {
        /// Command name of the request that timed out
        command: String,
        /// Watchdog duration that elapsed
        timeout: Duration,
    },

    /// The peer answered with an `error` envelope.
    ///
    /// Displays the remote message verbatim.
    #[error("{message}")]
    Remote {
        /// Remote error message
        message: String,
        /// Optional error code, when the peer sends one
        code: Option<i64>,
        /// Optional additional data
        data: Option<serde_json::Value>,
    },

    /// Command names must be non-empty.
    #[error("Command name must not be empty")]
    InvalidCommand,

    /// Outbound envelope could not be encoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error while writing to the socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Returns `true` for errors raised before any request reached the peer.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            BridgeError::ConnectionFailed { .. } | BridgeError::NotConnected { .. }
        )
    }
}
