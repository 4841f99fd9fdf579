//! cadbridge library
//!
//! Request/response bridge between a tool front end and a CAD application
//! reachable only through a raw TCP socket:
//!
//! - `ipc` - transport client, framing and scoped connections
//! - `protocol` - JSON-RPC request/response envelopes
//! - `config` - peer address, timeouts and framing settings
//! - `error` - error taxonomy
//!
//! ```ignore
//! use cadbridge::{BridgeConfig, ipc::ConnectionManager};
//! use serde_json::json;
//!
//! let manager = ConnectionManager::new(BridgeConfig::load()?);
//! let view = manager
//!     .with_connection(|client| async move {
//!         client.send_command("get_current_view_info", json!({})).await
//!     })
//!     .await?;
//! ```

pub mod config;
pub mod error;
pub mod ipc;
pub mod protocol;

pub use config::{BridgeConfig, PeerAddress};
pub use error::BridgeError;
