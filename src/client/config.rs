// ABOUTME: Connection and cluster configuration with builder-style defaults
// ABOUTME: Also defines the Endpoint type shared by direct and clustered clients

use crate::client::error::{Error, Result};
use crate::codec::ParserLimits;
use core::fmt;
use std::time::Duration;

/// One `host:port` pair: a discovery seed or a direct target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Endpoint {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`. The port split is on the last colon so IPv6
    /// literal hosts keep their internal colons.
    pub fn parse(s: &str) -> Result<Endpoint> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("endpoint '{s}' is missing a port")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("endpoint '{s}' has an invalid port")))?;
        if host.is_empty() {
            return Err(Error::Config(format!("endpoint '{s}' has an empty host")));
        }
        Ok(Endpoint::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.host, self.port)
    }
}

/// Credentials sent during the handshake; omitted entirely when unset.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// ACL username; the server's `default` user when `None`.
    pub username: Option<String>,
    pub password: String,
}

impl Credentials {
    pub fn password(password: impl Into<String>) -> Credentials {
        Credentials {
            username: None,
            password: password.into(),
        }
    }

    pub fn acl(username: impl Into<String>, password: impl Into<String>) -> Credentials {
        Credentials {
            username: Some(username.into()),
            password: password.into(),
        }
    }
}

/// Connection options for both direct and clustered clients.
///
/// # Example
///
/// ```rust
/// use resp3::client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::new(["127.0.0.1:6379"])
///     .with_client_name("billing-worker")
///     .with_command_timeout(Duration::from_secs(2))
///     .with_keepalive(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Seeds for cluster discovery, or direct targets.
    pub endpoints: Vec<String>,
    pub credentials: Option<Credentials>,
    /// Attempt RESP3 during the handshake, falling back to RESP2 when the
    /// server declines.
    pub prefer_resp3: bool,
    /// When set the caller must supply a TLS-wrapped stream through
    /// `Connection::from_stream`; this crate never negotiates TLS itself.
    pub tls_enabled: bool,
    /// Ceiling on transport establishment plus the whole handshake.
    pub connect_timeout: Duration,
    /// Default per-call wait on a completion handle. Blocking verbs are
    /// exempt; their only timeout is the one the caller passes explicitly.
    pub command_timeout: Duration,
    /// Period for the PING-based keep-alive manager; disabled when `None`.
    pub keepalive: Option<Duration>,
    /// Sent via `CLIENT SETNAME` after the handshake.
    pub client_name: Option<String>,
    /// Logical database selected after the handshake (direct mode only).
    pub database_index: Option<u32>,
    /// Cluster redirection ceiling per call.
    pub max_redirects: u32,
    /// Follow MOVED redirects; when false they surface as server errors.
    pub auto_handle_moved: bool,
    /// Follow ASK redirects; when false they surface as server errors.
    pub auto_handle_ask: bool,
    /// Hard limits enforced by the frame parser.
    pub parser_limits: ParserLimits,
    /// Inbound staging-buffer ceiling; exceeding it before a complete frame
    /// arrives breaks the connection.
    pub read_buffer_limit: usize,
    /// Outbound buffered-writer capacity.
    pub write_buffer_limit: usize,
    /// Submission-queue depth; senders back-pressure when it is full.
    pub submission_queue_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            credentials: None,
            prefer_resp3: true,
            tls_enabled: false,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            keepalive: None,
            client_name: None,
            database_index: None,
            max_redirects: 5,
            auto_handle_moved: true,
            auto_handle_ask: true,
            parser_limits: ParserLimits::default(),
            read_buffer_limit: 16 * 1024,
            write_buffer_limit: 16 * 1024,
            submission_queue_depth: 1024,
        }
    }
}

impl ClientConfig {
    pub fn new<I, S>(endpoints: I) -> ClientConfig
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ClientConfig {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            ..ClientConfig::default()
        }
    }

    /// Parse the configured endpoint strings, failing on the first bad one.
    pub fn parsed_endpoints(&self) -> Result<Vec<Endpoint>> {
        if self.endpoints.is_empty() {
            return Err(Error::Config("at least one endpoint is required".into()));
        }
        self.endpoints.iter().map(|s| Endpoint::parse(s)).collect()
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_prefer_resp3(mut self, prefer: bool) -> Self {
        self.prefer_resp3 = prefer;
        self
    }

    pub fn with_tls_enabled(mut self, enabled: bool) -> Self {
        self.tls_enabled = enabled;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_keepalive(mut self, period: Duration) -> Self {
        self.keepalive = Some(period);
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_database_index(mut self, index: u32) -> Self {
        self.database_index = Some(index);
        self
    }

    pub fn with_max_redirects(mut self, max: u32) -> Self {
        self.max_redirects = max;
        self
    }

    pub fn with_auto_handle_moved(mut self, follow: bool) -> Self {
        self.auto_handle_moved = follow;
        self
    }

    pub fn with_auto_handle_ask(mut self, follow: bool) -> Self {
        self.auto_handle_ask = follow;
        self
    }

    pub fn with_parser_limits(mut self, limits: ParserLimits) -> Self {
        self.parser_limits = limits;
        self
    }

    pub fn with_read_buffer_limit(mut self, limit: usize) -> Self {
        self.read_buffer_limit = limit;
        self
    }

    pub fn with_write_buffer_limit(mut self, limit: usize) -> Self {
        self.write_buffer_limit = limit;
        self
    }

    pub fn with_submission_queue_depth(mut self, depth: usize) -> Self {
        self.submission_queue_depth = depth;
        self
    }
}
