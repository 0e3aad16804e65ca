// Request model and command-name registry.
//
// Verb constants live here, next to the codec that serialises them, rather
// than scattered through the call sites. A `Command` is the unit the
// connection core accepts: verb bytes, ordered argument byte runs, and the
// markers the router and writer need to treat it correctly.

use crate::codec::encode_command;
use bytes::{Bytes, BytesMut};

/// Command names used by the crate itself.
pub mod verbs {
    pub const HELLO: &str = "HELLO";
    pub const AUTH: &str = "AUTH";
    pub const SELECT: &str = "SELECT";
    pub const CLIENT: &str = "CLIENT";
    pub const SETNAME: &str = "SETNAME";
    pub const PING: &str = "PING";
    pub const ECHO: &str = "ECHO";
    pub const GET: &str = "GET";
    pub const SET: &str = "SET";
    pub const DEL: &str = "DEL";
    pub const EXISTS: &str = "EXISTS";
    pub const INCR: &str = "INCR";
    pub const MULTI: &str = "MULTI";
    pub const EXEC: &str = "EXEC";
    pub const ASKING: &str = "ASKING";
    pub const CLUSTER: &str = "CLUSTER";
    pub const NODES: &str = "NODES";
    pub const SUBSCRIBE: &str = "SUBSCRIBE";
    pub const UNSUBSCRIBE: &str = "UNSUBSCRIBE";
    pub const PSUBSCRIBE: &str = "PSUBSCRIBE";
    pub const PUNSUBSCRIBE: &str = "PUNSUBSCRIBE";
    pub const PUBLISH: &str = "PUBLISH";
}

/// Verbs that may legitimately suspend the server reply for an unbounded
/// time: the blocking list pops and ordered-set pops. The connection core
/// serialises them like any other request; the caller's timeout is the only
/// escape.
const BLOCKING_VERBS: &[&str] = &[
    "BLPOP",
    "BRPOP",
    "BRPOPLPUSH",
    "BLMOVE",
    "BLMPOP",
    "BZPOPMIN",
    "BZPOPMAX",
    "BZMPOP",
];

/// Verbs whose arguments carry no keyspace position, so the cluster router
/// sends them to an arbitrary primary.
const KEYLESS_VERBS: &[&str] = &[
    verbs::HELLO,
    verbs::AUTH,
    verbs::SELECT,
    verbs::CLIENT,
    verbs::PING,
    verbs::ECHO,
    verbs::MULTI,
    verbs::EXEC,
    verbs::ASKING,
    verbs::CLUSTER,
    verbs::PUBLISH,
    verbs::SUBSCRIBE,
    verbs::UNSUBSCRIBE,
    verbs::PSUBSCRIBE,
    verbs::PUNSUBSCRIBE,
    "INFO",
    "COMMAND",
    "CONFIG",
    "DBSIZE",
    "FLUSHDB",
    "SCRIPT",
];

pub fn is_blocking_verb(verb: &[u8]) -> bool {
    BLOCKING_VERBS
        .iter()
        .any(|v| v.as_bytes().eq_ignore_ascii_case(verb))
}

fn is_keyless_verb(verb: &[u8]) -> bool {
    KEYLESS_VERBS
        .iter()
        .any(|v| v.as_bytes().eq_ignore_ascii_case(verb))
}

/// One request: a verb, its ordered arguments, and routing markers.
///
/// Built with the fluent methods and consumed by a connection's writer
/// task. The completion handle is attached at submission time, not here.
#[derive(Debug, Clone)]
pub struct Command {
    verb: Bytes,
    args: Vec<Bytes>,
    blocking: bool,
    key_count: usize,
}

impl Command {
    /// Start a command. The blocking marker and the default key position
    /// are derived from the verb; both can be overridden.
    pub fn new(verb: impl Into<Bytes>) -> Command {
        let verb = verb.into();
        let blocking = is_blocking_verb(&verb);
        let key_count = if is_keyless_verb(&verb) { 0 } else { 1 };
        Command {
            verb,
            args: Vec::new(),
            blocking,
            key_count,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<Bytes>) -> Command {
        self.args.push(arg.into());
        self
    }

    /// Mark this command as blocking regardless of its verb.
    pub fn blocking(mut self) -> Command {
        self.blocking = true;
        self
    }

    /// Declare how many leading arguments are keys. Multi-key commands
    /// (`DEL a b c`, `EXISTS x y`) set this so the cluster router can check
    /// slot agreement.
    pub fn key_count(mut self, count: usize) -> Command {
        self.key_count = count;
        self
    }

    pub fn verb(&self) -> &[u8] {
        &self.verb
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// The key arguments the router hashes. Empty for keyless verbs.
    pub fn keys(&self) -> &[Bytes] {
        let count = self.key_count.min(self.args.len());
        &self.args[..count]
    }

    /// Serialise into the canonical request frame.
    pub fn encode(&self, dst: &mut BytesMut) {
        encode_command(dst, &self.verb, &self.args);
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}
