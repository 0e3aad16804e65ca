// ABOUTME: Cluster router: resolves keys to primaries, follows MOVED/ASK redirects
// ABOUTME: Keeps one live connection per endpoint with double-checked establishment

use crate::client::config::{ClientConfig, Endpoint};
use crate::client::error::{Error, Result};
use crate::cluster::slots::{SLOT_COUNT, hash_slot};
use crate::cluster::topology::{SlotMap, parse_cluster_nodes};
use crate::command::{Command, verbs};
use crate::connection::{Connection, ConnectionState, frame_into_result};
use crate::frame::Frame;
use bytes::BytesMut;
use std::collections::HashMap;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A sharded-topology client.
///
/// Routes each call by its key's hash slot, learns the slot→primary map
/// from the `CLUSTER NODES` introspection verb, and transparently follows
/// MOVED/ASK redirections up to the configured ceiling. Cheap to clone.
///
/// Publish/subscribe is not supported in cluster mode; open a
/// [`crate::subscriber::Subscriber`] against a specific node instead.
#[derive(Clone)]
pub struct ClusterClient {
    inner: Arc<ClusterInner>,
}

struct ClusterInner {
    config: ClientConfig,
    seeds: Vec<Endpoint>,
    /// Current topology snapshot. Readers clone the `Arc` under a briefly
    /// held read lock; a refresh swaps the pointer under the write lock, so
    /// in-flight routing decisions keep the snapshot they started with.
    map: RwLock<Option<Arc<SlotMap>>>,
    connections: RwLock<HashMap<Endpoint, Connection>>,
    /// Single process-wide establishment lock: two concurrent first
    /// routings to one endpoint must not each open a socket.
    connect_lock: Mutex<()>,
    refresh_lock: Mutex<()>,
    entropy: RandomState,
    route_counter: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RedirectKind {
    Moved,
    Ask,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Redirect {
    kind: RedirectKind,
    slot: u16,
    endpoint: Endpoint,
}

/// Match an error payload against `<MOVED|ASK> <slot> <host>:<port>`.
fn parse_redirect(text: &str) -> Option<Redirect> {
    let mut parts = text.split_whitespace();
    let kind = match parts.next()? {
        "MOVED" => RedirectKind::Moved,
        "ASK" => RedirectKind::Ask,
        _ => return None,
    };
    let slot = parts.next()?.parse::<u16>().ok().filter(|s| *s < SLOT_COUNT)?;
    let endpoint = Endpoint::parse(parts.next()?).ok()?;
    parts.next().is_none().then_some(Redirect {
        kind,
        slot,
        endpoint,
    })
}

/// The slot shared by every key of the call, `None` for keyless verbs, or
/// `CrossSlot` when the keys disagree.
fn slot_of_keys(cmd: &Command) -> Result<Option<u16>> {
    let mut slot = None;
    for key in cmd.keys() {
        let this = hash_slot(key);
        match slot {
            None => slot = Some(this),
            Some(prev) if prev != this => return Err(Error::CrossSlot),
            Some(_) => {}
        }
    }
    Ok(slot)
}

impl ClusterClient {
    /// Discover the topology through the configured seeds and return a
    /// ready router. Fails with `TopologyUnavailable` when no seed answers.
    pub async fn connect(config: ClientConfig) -> Result<ClusterClient> {
        let seeds = config.parsed_endpoints()?;
        let client = ClusterClient {
            inner: Arc::new(ClusterInner {
                seeds,
                config,
                map: RwLock::new(None),
                connections: RwLock::new(HashMap::new()),
                connect_lock: Mutex::new(()),
                refresh_lock: Mutex::new(()),
                entropy: RandomState::new(),
                route_counter: AtomicU64::new(0),
            }),
        };
        client.refresh_topology().await?;
        Ok(client)
    }

    /// The current topology snapshot, if discovery has succeeded.
    pub fn topology(&self) -> Option<Arc<SlotMap>> {
        self.inner
            .map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Route one call by its keys and return the caller-visible result.
    ///
    /// MOVED retries against the new owner and schedules an asynchronous
    /// topology refresh; ASK retries once with an `ASKING` prefix and
    /// leaves the map alone. One connection failure mid-call triggers a
    /// refresh-and-retry before the failure propagates.
    pub async fn call(&self, cmd: &Command) -> Result<Frame> {
        let slot = slot_of_keys(cmd)?;
        let mut endpoint = self.endpoint_for(slot)?;
        let mut asking = false;
        let mut redirects = 0u32;
        let mut retried_after_failure = false;

        loop {
            let result = match self.connection_to(&endpoint).await {
                Ok(conn) => {
                    if asking {
                        self.call_asking(&conn, cmd).await
                    } else {
                        conn.call_raw(cmd).await
                    }
                }
                Err(cause) => Err(cause),
            };

            match result {
                Ok(frame) => {
                    let redirect = frame
                        .as_bytes()
                        .ok()
                        .and_then(|b| std::str::from_utf8(b).ok())
                        .filter(|_| frame.is_error())
                        .and_then(parse_redirect);
                    let Some(redirect) = redirect else {
                        return frame_into_result(frame);
                    };

                    let follow = match redirect.kind {
                        RedirectKind::Moved => self.inner.config.auto_handle_moved,
                        RedirectKind::Ask => self.inner.config.auto_handle_ask,
                    };
                    if !follow {
                        return frame_into_result(frame);
                    }

                    redirects += 1;
                    if redirects > self.inner.config.max_redirects {
                        warn!(
                            slot = redirect.slot,
                            limit = self.inner.config.max_redirects,
                            "redirection ceiling reached"
                        );
                        return Err(Error::RedirectionLoop(redirects - 1));
                    }

                    debug!(
                        kind = ?redirect.kind,
                        slot = redirect.slot,
                        target = %redirect.endpoint,
                        "following redirect"
                    );
                    asking = redirect.kind == RedirectKind::Ask;
                    endpoint = redirect.endpoint;
                    if redirect.kind == RedirectKind::Moved {
                        // The map is stale; refresh in the background while
                        // this call proceeds against the named owner.
                        self.spawn_refresh();
                    }
                }
                Err(cause) if cause.is_connection_failure() && !retried_after_failure => {
                    retried_after_failure = true;
                    warn!(%endpoint, %cause, "connection failed mid-call; refreshing and retrying once");
                    self.drop_connection(&endpoint);
                    self.refresh_topology().await?;
                    endpoint = self.endpoint_for(slot)?;
                    asking = false;
                }
                Err(cause) => return Err(cause),
            }
        }
    }

    /// Retry at an ASK target: the `ASKING` verb and the command travel as
    /// one contiguous write so nothing interleaves between them, because
    /// the server's ASKING state covers only the immediately following
    /// command.
    async fn call_asking(&self, conn: &Connection, cmd: &Command) -> Result<Frame> {
        let mut payload = BytesMut::new();
        Command::new(verbs::ASKING).encode(&mut payload);
        cmd.encode(&mut payload);

        let mut handles = conn.submit_batch(payload.freeze(), 2).await?;
        let reply_handle = handles.pop().ok_or(Error::ConnectionLost)?;
        let asking_handle = handles.pop().ok_or(Error::ConnectionLost)?;

        let deadline = self.inner.config.command_timeout;
        frame_into_result(asking_handle.wait_timeout(deadline).await?)?;
        if cmd.is_blocking() {
            reply_handle.wait().await
        } else {
            reply_handle.wait_timeout(deadline).await
        }
    }

    /// Resolve the target endpoint: the slot's owner, or a uniformly
    /// random primary for keyless verbs.
    fn endpoint_for(&self, slot: Option<u16>) -> Result<Endpoint> {
        let map = match self.topology() {
            Some(map) => map,
            None => {
                return Err(match slot {
                    Some(slot) => Error::NoNodeForSlot(slot),
                    None => Error::TopologyUnavailable,
                });
            }
        };
        match slot {
            Some(slot) => map
                .primary_for(slot)
                .map(|node| node.endpoint.clone())
                .ok_or(Error::NoNodeForSlot(slot)),
            None => {
                let primaries: Vec<_> = map.primaries().collect();
                if primaries.is_empty() {
                    return Err(Error::TopologyUnavailable);
                }
                let pick = self.random_index(primaries.len());
                Ok(primaries[pick].endpoint.clone())
            }
        }
    }

    fn random_index(&self, len: usize) -> usize {
        let mut hasher = self.inner.entropy.build_hasher();
        hasher.write_u64(self.inner.route_counter.fetch_add(1, Ordering::Relaxed));
        (hasher.finish() as usize) % len
    }

    /// Fetch or lazily create the connection to `endpoint`.
    async fn connection_to(&self, endpoint: &Endpoint) -> Result<Connection> {
        if let Some(conn) = self.live_connection(endpoint) {
            return Ok(conn);
        }

        let _guard = self.inner.connect_lock.lock().await;
        // Double-check: a racing task may have connected while we waited.
        if let Some(conn) = self.live_connection(endpoint) {
            return Ok(conn);
        }
        self.drop_connection(endpoint);

        let conn = Connection::connect(endpoint, &self.inner.config).await?;
        self.inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.clone(), conn.clone());
        Ok(conn)
    }

    fn live_connection(&self, endpoint: &Endpoint) -> Option<Connection> {
        let connections = self
            .inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let conn = connections.get(endpoint)?;
        match conn.state() {
            ConnectionState::Ready | ConnectionState::Handshaking => Some(conn.clone()),
            _ => None,
        }
    }

    fn drop_connection(&self, endpoint: &Endpoint) {
        self.inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(endpoint);
    }

    fn spawn_refresh(&self) {
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(cause) = client.refresh_topology().await {
                warn!(%cause, "background topology refresh failed");
            }
        });
    }

    /// Contact any reachable seed (or already-known primary), parse its
    /// node list and atomically install the new slot map.
    #[tracing::instrument(skip(self))]
    pub async fn refresh_topology(&self) -> Result<()> {
        let _guard = self.inner.refresh_lock.lock().await;

        let mut candidates = self.inner.seeds.clone();
        if let Some(map) = self.topology() {
            for node in map.primaries() {
                if !candidates.contains(&node.endpoint) {
                    candidates.push(node.endpoint.clone());
                }
            }
        }

        for endpoint in &candidates {
            match self.fetch_nodes(endpoint).await {
                Ok(map) => {
                    debug!(
                        source = %endpoint,
                        nodes = map.nodes().len(),
                        covered = map.covered_slots(),
                        "installed new slot map"
                    );
                    *self
                        .inner
                        .map
                        .write()
                        .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(map));
                    return Ok(());
                }
                Err(cause) => {
                    warn!(seed = %endpoint, %cause, "topology discovery failed");
                    self.drop_connection(endpoint);
                }
            }
        }
        Err(Error::TopologyUnavailable)
    }

    async fn fetch_nodes(&self, endpoint: &Endpoint) -> Result<SlotMap> {
        let conn = self.connection_to(endpoint).await?;
        let cmd = Command::new(verbs::CLUSTER).arg(verbs::NODES);
        let reply = conn.call(&cmd).await?;
        let nodes = parse_cluster_nodes(reply.as_str()?)?;
        Ok(SlotMap::build(nodes))
    }
}
