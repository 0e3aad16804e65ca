//! Caller-side transaction batcher.
//!
//! Staged commands are recorded without I/O. On execute the whole batch is
//! emitted as one contiguous write (`MULTI`, every staged command, `EXEC`)
//! so no other submission can interleave on the connection, and the reply
//! to `EXEC` is split into per-command results. Atomicity itself comes from
//! the server executing the batch as one unit.

use crate::client::error::{Error, Result};
use crate::command::{Command, verbs};
use crate::connection::{Connection, frame_into_result};
use crate::frame::{Frame, TypeMismatch};
use bytes::BytesMut;

/// A staging object for an atomic command batch.
///
/// ```rust,no_run
/// use resp3::{Command, Transaction};
/// # async fn example(conn: &resp3::Connection) -> resp3::Result<()> {
/// let mut txn = Transaction::new();
/// txn.stage(Command::new("SET").arg("balance:a").arg("90"));
/// txn.stage(Command::new("SET").arg("balance:b").arg("110"));
/// let results = txn.exec(conn).await?;
/// assert_eq!(results.len(), 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct Transaction {
    staged: Vec<Command>,
}

impl Transaction {
    pub fn new() -> Transaction {
        Transaction::default()
    }

    /// Record one command. No I/O happens until [`Transaction::exec`].
    pub fn stage(&mut self, cmd: Command) -> &mut Transaction {
        self.staged.push(cmd);
        self
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Send the batch and return one result frame per staged command.
    ///
    /// The per-command `QUEUED` placeholders are checked and discarded; a
    /// queue-time rejection surfaces as that command's server error. While
    /// the batch is being emitted the connection's transaction lock is
    /// held, and cancelling this future mid-emission does not stop the
    /// batch: it completes on the wire or the connection breaks.
    pub async fn exec(self, conn: &Connection) -> Result<Vec<Frame>> {
        if self.staged.is_empty() {
            return Ok(Vec::new());
        }

        let count = self.staged.len();
        let mut payload = BytesMut::new();
        Command::new(verbs::MULTI).encode(&mut payload);
        for cmd in &self.staged {
            cmd.encode(&mut payload);
        }
        Command::new(verbs::EXEC).encode(&mut payload);

        let handles = conn.submit_batch(payload.freeze(), count + 2).await?;
        let deadline = conn.command_timeout();
        let mut replies = Vec::with_capacity(count + 2);
        for handle in handles {
            replies.push(handle.wait_timeout(deadline).await?);
        }

        let exec_reply = replies.pop().ok_or(Error::ConnectionLost)?;
        let mut replies = replies.into_iter();
        let multi_reply = replies.next().ok_or(Error::ConnectionLost)?;
        frame_into_result(multi_reply)?;

        // Placeholder replies: +QUEUED per staged command. An error here
        // means the server rejected that command at queue time and will
        // abort the whole batch at EXEC; report the first one directly.
        for placeholder in replies {
            frame_into_result(placeholder)?;
        }

        let exec_reply = frame_into_result(exec_reply)?;
        if exec_reply.is_null() {
            return Err(Error::Server("transaction aborted by the server".into()));
        }
        match exec_reply.into_inner() {
            Frame::Array(Some(results)) if results.len() == count => Ok(results),
            Frame::Array(Some(results)) => Err(Error::Server(format!(
                "EXEC returned {} results for {count} staged commands",
                results.len()
            ))),
            other => Err(Error::TypeMismatch(TypeMismatch {
                requested: "result array",
                actual: other.kind().name(),
            })),
        }
    }
}
