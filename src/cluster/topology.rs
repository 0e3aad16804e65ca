//! Cluster topology model and the parser for the `CLUSTER NODES`
//! introspection reply: one whitespace-delimited line per node, in the
//! order `node_id address flags primary_id ping_sent pong_recv
//! config_epoch link_state slot_spec...`.

use crate::client::config::Endpoint;
use crate::client::error::{Error, Result};
use crate::cluster::slots::SLOT_COUNT;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

/// Status flags from the introspection line. Unrecognised tokens are
/// logged and skipped for forward compatibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeFlags {
    /// The node that produced the reply.
    pub myself: bool,
    /// Agreed failed; never routed to.
    pub fail: bool,
    /// Suspected failed (`fail?` / `pfail`); still routable.
    pub possibly_failed: bool,
    /// Handshake in progress, identity unconfirmed.
    pub handshake: bool,
    /// No known address; never routed to.
    pub noaddr: bool,
}

/// One cluster member as reported by the introspection verb.
///
/// Slot ranges partition `[0, 16384)` without overlap among primaries;
/// replicas carry no ranges and point at their primary instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub id: String,
    pub endpoint: Endpoint,
    pub role: Role,
    /// The primary this replica mirrors; `None` on primaries.
    pub primary_id: Option<String>,
    /// Inclusive owned slot ranges, in reply order.
    pub slots: Vec<(u16, u16)>,
    pub flags: NodeFlags,
}

impl ClusterNode {
    pub fn owns_slot(&self, slot: u16) -> bool {
        self.slots
            .iter()
            .any(|&(start, end)| slot >= start && slot <= end)
    }

    /// True when the router may open a connection to this node.
    pub fn is_routable(&self) -> bool {
        self.role == Role::Primary && !self.flags.fail && !self.flags.noaddr
    }
}

/// Parse a full `CLUSTER NODES` reply.
pub fn parse_cluster_nodes(text: &str) -> Result<Vec<ClusterNode>> {
    let mut nodes = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        nodes.push(parse_node_line(line)?);
    }
    if nodes.is_empty() {
        return Err(Error::InvalidTopology("empty node list".into()));
    }
    Ok(nodes)
}

fn parse_node_line(line: &str) -> Result<ClusterNode> {
    let bad = |what: &str| Error::InvalidTopology(format!("{what} in line '{line}'"));

    let mut fields = line.split_whitespace();
    let id = fields.next().ok_or_else(|| bad("missing node id"))?;
    let address = fields.next().ok_or_else(|| bad("missing address"))?;
    let flag_tokens = fields.next().ok_or_else(|| bad("missing flags"))?;
    let primary_field = fields.next().ok_or_else(|| bad("missing primary id"))?;
    // ping_sent, pong_recv, config_epoch, link_state carry no routing
    // information; only their presence is validated.
    for field in ["ping_sent", "pong_recv", "config_epoch", "link_state"] {
        fields
            .next()
            .ok_or_else(|| bad(&format!("missing {field}")))?;
    }

    // The cluster-bus port suffix (`host:port@cluster_port`) is stripped.
    let address = address.split('@').next().unwrap_or(address);
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| bad("address missing port"))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| bad("address has invalid port"))?;
    // A noaddr node reports `:0`; keep the empty host, it is never routed.
    let endpoint = Endpoint::new(host, port);

    let mut flags = NodeFlags::default();
    let mut role = Role::Primary;
    for token in flag_tokens.split(',') {
        match token {
            "master" => role = Role::Primary,
            "slave" | "replica" => role = Role::Replica,
            "myself" => flags.myself = true,
            "fail" => flags.fail = true,
            "fail?" | "pfail" => flags.possibly_failed = true,
            "handshake" => flags.handshake = true,
            "noaddr" => flags.noaddr = true,
            "noflags" => {}
            other => warn!(flag = other, "unrecognised node flag; skipping"),
        }
    }

    let primary_id = match primary_field {
        "-" => None,
        other => Some(other.to_string()),
    };

    let mut slots = Vec::new();
    for spec in fields {
        // Bracketed specs are in-flight migration markers; ownership has
        // not changed yet, so discovery ignores them.
        if spec.starts_with('[') {
            continue;
        }
        let (start, end) = match spec.split_once('-') {
            Some((start, end)) => (parse_slot(start, line)?, parse_slot(end, line)?),
            None => {
                let slot = parse_slot(spec, line)?;
                (slot, slot)
            }
        };
        if start > end {
            return Err(bad("inverted slot range"));
        }
        slots.push((start, end));
    }

    Ok(ClusterNode {
        id: id.to_string(),
        endpoint,
        role,
        primary_id,
        slots,
        flags,
    })
}

fn parse_slot(text: &str, line: &str) -> Result<u16> {
    text.parse::<u16>()
        .ok()
        .filter(|slot| *slot < SLOT_COUNT)
        .ok_or_else(|| Error::InvalidTopology(format!("invalid slot '{text}' in line '{line}'")))
}

/// Immutable slot-ownership snapshot.
///
/// Built once per topology refresh and swapped in atomically behind an
/// `Arc`: routers resolving keys hold only the snapshot they started with,
/// so they never observe a half-built map.
#[derive(Debug)]
pub struct SlotMap {
    nodes: Vec<ClusterNode>,
    /// One cell per slot holding an index into `nodes`, for the primary
    /// currently owning that slot.
    cells: Box<[Option<u16>]>,
}

impl SlotMap {
    pub fn build(nodes: Vec<ClusterNode>) -> SlotMap {
        let mut cells = vec![None; SLOT_COUNT as usize].into_boxed_slice();
        for (index, node) in nodes.iter().enumerate() {
            if !node.is_routable() {
                continue;
            }
            for &(start, end) in &node.slots {
                for slot in start..=end {
                    cells[slot as usize] = Some(index as u16);
                }
            }
        }
        SlotMap { nodes, cells }
    }

    /// The primary owning `slot`, if any node claimed it.
    pub fn primary_for(&self, slot: u16) -> Option<&ClusterNode> {
        let index = (*self.cells.get(slot as usize)?)?;
        self.nodes.get(index as usize)
    }

    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    pub fn primaries(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.iter().filter(|node| node.is_routable())
    }

    /// Number of slots with a known owner.
    pub fn covered_slots(&self) -> usize {
        self.cells.iter().filter(|cell| cell.is_some()).count()
    }
}
