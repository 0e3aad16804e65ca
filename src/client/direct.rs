// ABOUTME: Direct-mode client facade: one connection, thin per-verb helpers
// ABOUTME: Carries the keep-alive manager and the transaction entry point

use crate::client::config::ClientConfig;
use crate::client::error::{Error, Result};
use crate::client::keepalive::{KeepAliveConfig, KeepAliveManager, KeepAliveStatus};
use crate::command::{Command, verbs};
use crate::connection::{Connection, ConnectionState, Protocol};
use crate::frame::Frame;
use crate::transaction::Transaction;
use bytes::Bytes;
use tracing::warn;

/// Client for a single server.
///
/// The command surface is deliberately thin glue over [`Command`] and the
/// connection core: one helper per common verb, with [`Client::call`] as
/// the escape hatch for everything else.
///
/// ```rust,no_run
/// use resp3::client::{Client, ClientConfig};
///
/// #[tokio::main]
/// async fn main() -> resp3::Result<()> {
///     let mut client = Client::connect(ClientConfig::new(["127.0.0.1:6379"])).await?;
///
///     client.set("greeting", "hello").await?;
///     let value = client.get("greeting").await?;
///     assert_eq!(value.as_deref(), Some(&b"hello"[..]));
///
///     client.ping().await?;
///     Ok(())
/// }
/// ```
pub struct Client {
    connection: Connection,
    keep_alive: Option<KeepAliveManager>,
}

impl Client {
    /// Connect to the first reachable configured endpoint.
    pub async fn connect(config: ClientConfig) -> Result<Client> {
        let endpoints = config.parsed_endpoints()?;
        let mut last_failure = None;
        for endpoint in &endpoints {
            match Connection::connect(endpoint, &config).await {
                Ok(connection) => {
                    let keep_alive = config
                        .keepalive
                        .map(|interval| KeepAliveManager::new(KeepAliveConfig::new(interval)));
                    return Ok(Client {
                        connection,
                        keep_alive,
                    });
                }
                Err(cause) => {
                    warn!(%endpoint, %cause, "connect failed; trying next endpoint");
                    last_failure = Some(cause);
                }
            }
        }
        Err(last_failure
            .unwrap_or_else(|| Error::Config("at least one endpoint is required".into())))
    }

    /// The underlying connection, e.g. for [`Transaction::exec`].
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn protocol(&self) -> Protocol {
        self.connection.protocol()
    }

    /// Submit any command and wait for its reply.
    pub async fn call(&self, cmd: &Command) -> Result<Frame> {
        self.connection.call(cmd).await
    }

    /// Connectivity probe; also feeds the keep-alive accounting.
    pub async fn ping(&mut self) -> Result<()> {
        if let Some(keep_alive) = &mut self.keep_alive {
            keep_alive.on_ping_sent();
        }
        match self.connection.call(&Command::new(verbs::PING)).await {
            Ok(_) => {
                if let Some(keep_alive) = &mut self.keep_alive {
                    keep_alive.on_ping_success();
                }
                Ok(())
            }
            Err(cause) => {
                if let Some(keep_alive) = &mut self.keep_alive {
                    keep_alive.on_ping_failure();
                }
                Err(cause)
            }
        }
    }

    pub async fn echo(&self, message: impl Into<Bytes>) -> Result<Bytes> {
        let cmd = Command::new(verbs::ECHO).arg(message);
        let frame = self.connection.call(&cmd).await?;
        Ok(Bytes::copy_from_slice(frame.as_bytes()?))
    }

    /// Fetch a key; `None` when absent, whichever null shape the server
    /// used on the wire.
    pub async fn get(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>> {
        let cmd = Command::new(verbs::GET).arg(key);
        let frame = self.connection.call(&cmd).await?;
        if frame.is_null() {
            return Ok(None);
        }
        match frame.into_inner() {
            Frame::BulkString(Some(data)) => Ok(Some(data)),
            other => Ok(Some(Bytes::copy_from_slice(other.as_bytes()?))),
        }
    }

    pub async fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        let cmd = Command::new(verbs::SET).arg(key).arg(value);
        self.connection.call(&cmd).await.map(|_| ())
    }

    /// Delete a key; true when it existed.
    pub async fn del(&self, key: impl Into<Bytes>) -> Result<bool> {
        let cmd = Command::new(verbs::DEL).arg(key);
        let frame = self.connection.call(&cmd).await?;
        Ok(frame.as_integer()? > 0)
    }

    pub async fn incr(&self, key: impl Into<Bytes>) -> Result<i64> {
        let cmd = Command::new(verbs::INCR).arg(key);
        let frame = self.connection.call(&cmd).await?;
        Ok(frame.as_integer()?)
    }

    /// Start staging an atomic batch; run it with
    /// `txn.exec(client.connection())`.
    pub fn transaction(&self) -> Transaction {
        Transaction::new()
    }

    /// Send a keep-alive ping when one is due.
    ///
    /// Call this periodically from long-running applications; it returns
    /// `Ok(true)` when a ping went out, `Ok(false)` when none was needed.
    pub async fn maintain_keep_alive(&mut self) -> Result<bool> {
        let due = self
            .keep_alive
            .as_ref()
            .is_some_and(KeepAliveManager::should_ping);
        if due {
            self.ping().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// True once keep-alive failures crossed the configured ceiling and
    /// the connection should be re-established.
    pub fn is_keep_alive_failed(&self) -> bool {
        self.keep_alive
            .as_ref()
            .is_some_and(KeepAliveManager::is_connection_failed)
    }

    pub fn keep_alive_status(&self) -> KeepAliveStatus {
        self.keep_alive
            .as_ref()
            .map(KeepAliveManager::status)
            .unwrap_or(KeepAliveStatus {
                running: false,
                consecutive_failures: 0,
                total_pings: 0,
                total_pongs: 0,
            })
    }

    /// Announce intent to close; the transport shuts down once the client
    /// and every connection clone are dropped.
    pub fn close(&self) {
        self.connection.close();
    }
}
