//! Connection and request-correlation layer for the CAD peer.
//!
//! The peer is a long-lived process (a CAD application plugin) listening on
//! a plain TCP port. This module owns that socket and turns it into a
//! request/response channel that many callers can share.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐        TCP socket        ┌─────────────────────┐
//! │  ConnectionManager   │                          │                     │
//! │    with_connection   │  ◄─────────────────────► │   CAD application   │
//! │  ┌────────────────┐  │   JSON-RPC 2.0 + framing │      (plugin)       │
//! │  │TransportClient │  │                          │                     │
//! │  └────────────────┘  │                          └─────────────────────┘
//! └──────────────────────┘
//! ```
//!
//! # Protocol
//!
//! ```text
//! -> {"jsonrpc":"2.0","method":"ping","params":{},"id":"1718000000000123456"}
//! <- {"id":"1718000000000123456","result":"pong"}
//! <- {"id":"1718000000000654321","error":{"message":"bad category"}}
//! ```
//!
//! Messages are framed per [`Framing`]: bare back-to-back JSON by default,
//! which is what the CAD plugin speaks, or Content-Length headers for peers
//! built for them.
//!
//! # Usage
//!
//! ```ignore
//! use cadbridge::ipc::with_connection;
//! use serde_json::json;
//!
//! let result = with_connection(|client| async move {
//!     client.send_command("ping", json!({})).await
//! })
//! .await?;
//! ```

mod client;
mod framing;
mod scope;

pub use client::{ConnectionState, TransportClient};
pub use framing::{encode_message, write_message, FrameDecoder, Framing, MAX_MESSAGE_SIZE};
pub use scope::{run_scoped, with_connection, ConnectionManager, ManagedConnection};
