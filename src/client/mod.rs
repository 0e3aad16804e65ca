// ABOUTME: Client module: configuration, error taxonomy, keep-alive and the direct facade
// ABOUTME: Exports everything a direct-mode caller needs in one place

//! Direct-mode client surface.
//!
//! The heavy lifting lives in the codec, the connection core and the
//! cluster router; this module carries what wraps them for callers:
//!
//! * [`ClientConfig`] - connection options with builder-style defaults
//! * [`Client`] - one-server facade with thin per-verb helpers
//! * [`Error`] / [`Result`] - the crate-wide error taxonomy
//! * [`KeepAliveConfig`] - PING-based connection health accounting
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use resp3::client::{Client, ClientConfig};
//!
//! # async fn example() -> resp3::Result<()> {
//! let client = Client::connect(ClientConfig::new(["127.0.0.1:6379"])).await?;
//! client.set("key", "value").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod direct;
pub mod error;
pub mod keepalive;

pub use config::{ClientConfig, Credentials, Endpoint};
pub use direct::Client;
pub use error::{Error, Result};
pub use keepalive::{KeepAliveConfig, KeepAliveManager, KeepAliveStatus};
