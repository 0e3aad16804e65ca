pub mod client;
pub mod cluster;
pub mod codec;
pub mod command;
pub mod connection;
pub mod frame;
pub mod subscriber;
pub mod transaction;

#[cfg(test)]
mod tests;

// Re-export the frame model and codec types for direct access
pub use codec::{CodecError, FrameError, Parser, ParserLimits, encode_command, encode_frame};
pub use frame::{Frame, FrameKind, TypeMismatch};

// Re-export the main client API for easy access
pub use client::{Client, ClientConfig, Credentials, Endpoint, Error, Result};
pub use cluster::{ClusterClient, SLOT_COUNT, hash_slot};
pub use command::Command;
pub use connection::{Connection, ConnectionState, Protocol, ReplyHandle};
pub use subscriber::{MessageStream, PushMessage, Subscriber};
pub use transaction::Transaction;

// Crate overview
//
// Three subsystems do the real work:
//
// - `codec` + `frame`: a streaming, restartable RESP2/RESP3 parser and an
//   allocation-minimising request writer over a polymorphic frame model.
// - `connection`: a three-task pump (writer / reader / correlator) that
//   multiplexes concurrent submissions over one full-duplex transport and
//   resolves completion handles in FIFO order.
// - `cluster`: CRC16 hash-slot routing over a topology learned from the
//   `CLUSTER NODES` introspection verb, following MOVED/ASK redirects.
//
// `transaction` and `subscriber` are small collaborators on top of the
// connection core; `client` holds configuration, errors and the direct
// facade.
