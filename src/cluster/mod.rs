// ABOUTME: Cluster support: hash slots, topology discovery, and the routing client
// ABOUTME: Exports the slot computation and the ClusterClient entry point

pub mod router;
pub mod slots;
pub mod topology;

pub use router::ClusterClient;
pub use slots::{SLOT_COUNT, crc16, hash_slot};
pub use topology::{ClusterNode, NodeFlags, Role, SlotMap, parse_cluster_nodes};
