// ABOUTME: Connection core multiplexing concurrent requests over one full-duplex transport
// ABOUTME: Three cooperating tasks (writer, reader, correlator) with FIFO reply correlation

use crate::client::config::{ClientConfig, Endpoint};
use crate::client::error::{Error, Result};
use crate::codec::{FrameError, Parser};
use crate::command::{Command, verbs};
use crate::frame::Frame;
use bytes::{Buf, Bytes, BytesMut};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Wire dialect negotiated during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Resp2,
    Resp3,
}

/// Connection lifecycle.
///
/// ```text
/// New -> Handshaking -> Ready -> Closing -> Closed
///                         \-> Broken (unrecoverable I/O or protocol error)
/// ```
///
/// On `Broken` every pending request fails with `ConnectionLost` and later
/// submissions fail with `ConnectionClosed`. A connection never reconnects
/// itself; that policy belongs to the cluster router or the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Handshaking,
    Ready,
    Closing,
    Closed,
    Broken,
}

type ReplyTx = oneshot::Sender<Result<Frame>>;

/// Single-use completion handle fulfilled by the correlator.
///
/// Dropping the handle abandons the caller's interest but never cancels the
/// wire request; the reply is still consumed and discarded, because the
/// protocol has no per-request cancel.
#[derive(Debug)]
pub struct ReplyHandle(oneshot::Receiver<Result<Frame>>);

impl ReplyHandle {
    /// Wait for the reply without any deadline. Used for blocking verbs,
    /// where the server may legitimately hold the reply for an unbounded
    /// time and the library must not impose a lower bound of its own.
    pub async fn wait(self) -> Result<Frame> {
        self.0.await.map_err(|_| Error::ConnectionLost)?
    }

    /// Wait at most `deadline`. On timeout the handle is dropped and the
    /// eventual reply is discarded by the correlator.
    pub async fn wait_timeout(self, deadline: Duration) -> Result<Frame> {
        match timeout(deadline, self.0).await {
            Ok(reply) => reply.map_err(|_| Error::ConnectionLost)?,
            Err(_) => Err(Error::Timeout),
        }
    }
}

/// One unit of work for the writer task: pre-encoded request bytes plus the
/// completion handles for each expected reply, in order. A transaction
/// batch travels as a single submission so nothing can interleave inside
/// it.
struct Submission {
    payload: Bytes,
    handles: Vec<ReplyTx>,
    locks_transaction: bool,
}

#[derive(Debug)]
struct Shared {
    endpoint: Endpoint,
    state: Mutex<ConnectionState>,
    txn_locked: AtomicBool,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        // Closed is terminal; a late task must not resurrect the connection.
        if *state != ConnectionState::Closed {
            *state = next;
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A live connection to one endpoint.
///
/// Cheap to clone; all clones feed the same submission queue and share the
/// same pump. Replies arrive in submission order on this connection; there
/// is no cross-connection ordering guarantee.
#[derive(Debug, Clone)]
pub struct Connection {
    submit_tx: mpsc::Sender<Submission>,
    shared: Arc<Shared>,
    protocol: Protocol,
    command_timeout: Duration,
}

impl Connection {
    /// Establish a TCP transport, run the handshake and start the pump.
    ///
    /// The connect timeout covers everything up to `Ready`, handshake
    /// included.
    pub async fn connect(endpoint: &Endpoint, config: &ClientConfig) -> Result<Connection> {
        Self::connect_inner(endpoint, config, None, false).await
    }

    /// Like [`Connection::connect`] but wires push frames into `push_tx`
    /// and classifies pub/sub event frames as out-of-band. Used by the
    /// subscriber dispatcher, which owns a connection that never carries
    /// ordinary requests.
    pub(crate) async fn connect_pubsub(
        endpoint: &Endpoint,
        config: &ClientConfig,
        push_tx: mpsc::Sender<Frame>,
    ) -> Result<Connection> {
        Self::connect_inner(endpoint, config, Some(push_tx), true).await
    }

    async fn connect_inner(
        endpoint: &Endpoint,
        config: &ClientConfig,
        push_tx: Option<mpsc::Sender<Frame>>,
        pubsub: bool,
    ) -> Result<Connection> {
        let connect = async {
            let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
            stream.set_nodelay(true)?;
            Self::start(stream, endpoint.clone(), config, push_tx, pubsub).await
        };
        match timeout(config.connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Run the handshake and start the pump over an already-established
    /// transport. TLS is an external collaborator: when `tls-enabled` is
    /// set, wrap the stream with your TLS provider of choice and hand the
    /// wrapped stream in here.
    pub async fn from_stream<S>(
        stream: S,
        endpoint: Endpoint,
        config: &ClientConfig,
    ) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        match timeout(
            config.connect_timeout,
            Self::start(stream, endpoint, config, None, false),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn start<S>(
        stream: S,
        endpoint: Endpoint,
        config: &ClientConfig,
        push_tx: Option<mpsc::Sender<Frame>>,
        pubsub: bool,
    ) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            endpoint,
            state: Mutex::new(ConnectionState::New),
            txn_locked: AtomicBool::new(false),
        });
        let parser = Parser::new(config.parser_limits.clone());

        shared.set_state(ConnectionState::Handshaking);
        let mut handshake = Handshake {
            stream,
            buffer: BytesMut::with_capacity(4 * 1024),
            parser: parser.clone(),
        };
        let protocol = handshake.run(config).await?;
        let stream = handshake.stream;
        // Bytes that arrived behind the last handshake reply belong to the
        // reader's staging buffer, not the floor.
        let staging = handshake.buffer;
        debug!(endpoint = %shared.endpoint, ?protocol, "handshake complete");

        let (read_half, write_half) = tokio::io::split(stream);
        let (submit_tx, submit_rx) = mpsc::channel(config.submission_queue_depth.max(1));
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let closed = Arc::new(Notify::new());

        tokio::spawn(run_writer(
            BufWriter::with_capacity(config.write_buffer_limit, write_half),
            submit_rx,
            pending_tx,
            Arc::clone(&shared),
            Arc::clone(&closed),
        ));
        tokio::spawn(run_reader(
            read_half,
            staging,
            frame_tx,
            parser,
            config.read_buffer_limit,
            Arc::clone(&shared),
        ));
        tokio::spawn(run_correlator(
            frame_rx,
            pending_rx,
            push_tx,
            pubsub,
            closed,
            Arc::clone(&shared),
        ));

        shared.set_state(ConnectionState::Ready);
        Ok(Connection {
            submit_tx,
            shared,
            protocol,
            command_timeout: config.command_timeout,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// True while a transaction batch is being emitted on this connection.
    pub fn is_transaction_locked(&self) -> bool {
        self.shared.txn_locked.load(Ordering::Acquire)
    }

    pub(crate) fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Queue one request and return its completion handle.
    ///
    /// Suspends only when the submission queue is at capacity.
    pub async fn submit(&self, cmd: &Command) -> Result<ReplyHandle> {
        let (tx, rx) = oneshot::channel();
        let submission = Submission {
            payload: cmd.encode_to_bytes(),
            handles: vec![tx],
            locks_transaction: false,
        };
        self.submit_tx
            .send(submission)
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        Ok(ReplyHandle(rx))
    }

    /// Queue a pre-encoded contiguous batch expecting one reply per handle.
    /// Used by the transaction batcher; nothing else on this connection can
    /// interleave inside the payload.
    pub(crate) async fn submit_batch(
        &self,
        payload: Bytes,
        replies: usize,
    ) -> Result<Vec<ReplyHandle>> {
        let mut txs = Vec::with_capacity(replies);
        let mut handles = Vec::with_capacity(replies);
        for _ in 0..replies {
            let (tx, rx) = oneshot::channel();
            txs.push(tx);
            handles.push(ReplyHandle(rx));
        }
        let submission = Submission {
            payload,
            handles: txs,
            locks_transaction: true,
        };
        self.submit_tx
            .send(submission)
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        Ok(handles)
    }

    /// Submit and wait, returning the reply frame as-is (server error
    /// frames included). The cluster router uses this to inspect redirect
    /// errors before they become caller-visible.
    pub(crate) async fn call_raw(&self, cmd: &Command) -> Result<Frame> {
        let handle = self.submit(cmd).await?;
        if cmd.is_blocking() {
            handle.wait().await
        } else {
            handle.wait_timeout(self.command_timeout).await
        }
    }

    /// Submit and wait. Server error frames become [`Error::Server`]; the
    /// default command timeout applies except for blocking verbs.
    pub async fn call(&self, cmd: &Command) -> Result<Frame> {
        frame_into_result(self.call_raw(cmd).await?)
    }

    /// Announce intent to close. The transport actually closes once every
    /// clone of this connection has been dropped and the writer drains.
    pub fn close(&self) {
        self.shared.set_state(ConnectionState::Closing);
    }
}

/// Convert a reply frame into the caller-visible result: error frames
/// carry the server's text verbatim, everything else passes through.
pub(crate) fn frame_into_result(frame: Frame) -> Result<Frame> {
    if frame.is_error() {
        let text = frame.as_bytes().unwrap_or_default();
        Err(Error::Server(String::from_utf8_lossy(text).into_owned()))
    } else {
        Ok(frame)
    }
}

// ---------------------------------------------------------------------------
// Pump tasks
// ---------------------------------------------------------------------------

/// Drains the submission queue, hands the completion handles to the
/// correlator, then writes and flushes the request bytes.
///
/// The handle handoff happens strictly before the flush: reply order on the
/// wire therefore matches handle order in the correlator's queue, which is
/// the whole FIFO correlation invariant.
async fn run_writer<W>(
    mut stream: BufWriter<WriteHalf<W>>,
    mut submit_rx: mpsc::Receiver<Submission>,
    pending_tx: mpsc::UnboundedSender<ReplyTx>,
    shared: Arc<Shared>,
    closed: Arc<Notify>,
) where
    W: AsyncWrite + Send + 'static,
{
    while let Some(submission) = submit_rx.recv().await {
        if submission.locks_transaction {
            shared.txn_locked.store(true, Ordering::Release);
        }

        let mut orphaned = false;
        for handle in submission.handles {
            if pending_tx.send(handle).is_err() {
                orphaned = true;
                break;
            }
        }
        if orphaned {
            // Correlator is gone; nothing can fulfil replies any more.
            shared.set_state(ConnectionState::Broken);
            let _ = stream.shutdown().await;
            return;
        }

        let result = async {
            stream.write_all(&submission.payload).await?;
            stream.flush().await
        }
        .await;

        if submission.locks_transaction {
            shared.txn_locked.store(false, Ordering::Release);
        }

        if let Err(cause) = result {
            warn!(endpoint = %shared.endpoint, %cause, "write failed; breaking connection");
            shared.set_state(ConnectionState::Broken);
            closed.notify_one();
            let _ = stream.shutdown().await;
            return;
        }
    }

    // Every connection clone dropped: drain politely and let the reader
    // observe EOF from the peer in its own time.
    shared.set_state(ConnectionState::Closing);
    let _ = stream.shutdown().await;
}

/// Reads transport bytes into the staging buffer and peels off every
/// complete frame. Packetisation is invisible past this point.
async fn run_reader<R>(
    mut stream: ReadHalf<R>,
    mut buffer: BytesMut,
    frame_tx: mpsc::Sender<Frame>,
    parser: Parser,
    buffer_limit: usize,
    shared: Arc<Shared>,
) where
    R: AsyncRead + Send + 'static,
{
    loop {
        loop {
            let mut cursor = Cursor::new(&buffer[..]);
            match parser.parse(&mut cursor) {
                Ok(frame) => {
                    let consumed = cursor.position() as usize;
                    buffer.advance(consumed);
                    if frame_tx.send(frame).await.is_err() {
                        return;
                    }
                }
                Err(FrameError::Incomplete) => break,
                Err(FrameError::Malformed(cause)) => {
                    warn!(endpoint = %shared.endpoint, %cause, "malformed frame; breaking connection");
                    shared.set_state(ConnectionState::Broken);
                    return;
                }
            }
        }

        // A partial frame may not outgrow the staging ceiling; a runaway
        // reply is treated as protocol corruption.
        if !buffer.is_empty() && buffer.len() >= buffer_limit {
            warn!(
                endpoint = %shared.endpoint,
                limit = buffer_limit,
                buffered = buffer.len(),
                "staging buffer ceiling reached before a complete frame; breaking connection"
            );
            shared.set_state(ConnectionState::Broken);
            return;
        }

        match stream.read_buf(&mut buffer).await {
            Ok(0) => {
                if buffer.is_empty() {
                    shared.set_state(ConnectionState::Closed);
                } else {
                    warn!(endpoint = %shared.endpoint, "peer closed mid-frame");
                    shared.set_state(ConnectionState::Broken);
                }
                return;
            }
            Ok(_) => {}
            Err(cause) => {
                warn!(endpoint = %shared.endpoint, %cause, "read failed; breaking connection");
                shared.set_state(ConnectionState::Broken);
                return;
            }
        }
    }
}

/// Matches incoming frames to pending completion handles in FIFO order and
/// diverts out-of-band frames to the push channel.
async fn run_correlator(
    mut frame_rx: mpsc::Receiver<Frame>,
    mut pending_rx: mpsc::UnboundedReceiver<ReplyTx>,
    push_tx: Option<mpsc::Sender<Frame>>,
    pubsub: bool,
    closed: Arc<Notify>,
    shared: Arc<Shared>,
) {
    loop {
        tokio::select! {
            maybe_frame = frame_rx.recv() => {
                let Some(frame) = maybe_frame else { break };

                if is_out_of_band(&frame, pubsub) {
                    match &push_tx {
                        Some(tx) => {
                            if tx.send(frame).await.is_err() {
                                debug!("push consumer gone; dropping out-of-band frame");
                            }
                        }
                        None => {
                            warn!(endpoint = %shared.endpoint, "unsolicited push frame dropped");
                        }
                    }
                    continue;
                }

                // The handle was enqueued before the request bytes were
                // flushed, so a reply can never beat its handle here.
                match pending_rx.try_recv() {
                    Ok(handle) => {
                        // A failed send means the caller stopped waiting;
                        // the reply is consumed and discarded either way.
                        let _ = handle.send(Ok(frame));
                    }
                    Err(_) => {
                        warn!(endpoint = %shared.endpoint, "reply without a pending request; breaking connection");
                        shared.set_state(ConnectionState::Broken);
                        break;
                    }
                }
            }
            _ = closed.notified() => break,
        }
    }

    // Fail every request still in flight.
    pending_rx.close();
    while let Ok(handle) = pending_rx.try_recv() {
        let _ = handle.send(Err(Error::ConnectionLost));
    }
}

const SUBSCRIBE_ACK_EVENTS: &[&[u8]] = &[
    b"subscribe",
    b"unsubscribe",
    b"psubscribe",
    b"punsubscribe",
];

const MESSAGE_EVENTS: &[&[u8]] = &[b"message", b"pmessage"];

/// Decide whether a frame bypasses reply correlation.
///
/// On an ordinary connection only push-kind frames are out-of-band. On a
/// subscriber connection the classification follows the event name instead:
/// message deliveries go to the dispatcher even when RESP2 spells them as
/// plain arrays, while subscribe/unsubscribe acknowledgements are control
/// replies for the correlator even when RESP3 spells them as pushes.
fn is_out_of_band(frame: &Frame, pubsub: bool) -> bool {
    if !pubsub {
        return frame.is_push();
    }
    let event = match frame.inner() {
        Frame::Push(items) => items.first(),
        Frame::Array(Some(items)) => items.first(),
        _ => None,
    };
    let Some(event) = event.and_then(|f| f.as_bytes().ok()) else {
        return frame.is_push();
    };
    if SUBSCRIBE_ACK_EVENTS
        .iter()
        .any(|ack| ack.eq_ignore_ascii_case(event))
    {
        return false;
    }
    frame.is_push()
        || MESSAGE_EVENTS
            .iter()
            .any(|msg| msg.eq_ignore_ascii_case(event))
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Sequential request/reply exchange on the raw stream before the pump
/// exists. Advertising `Ready` only after every step keeps half-configured
/// connections invisible to callers.
struct Handshake<S> {
    stream: S,
    buffer: BytesMut,
    parser: Parser,
}

impl<S> Handshake<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[tracing::instrument(skip_all)]
    async fn run(&mut self, config: &ClientConfig) -> Result<Protocol> {
        let mut protocol = Protocol::Resp2;
        let mut authenticated = false;

        if config.prefer_resp3 {
            let mut hello = Command::new(verbs::HELLO).arg("3");
            if let Some(creds) = &config.credentials {
                hello = hello
                    .arg("AUTH")
                    .arg(creds.username.clone().unwrap_or_else(|| "default".into()))
                    .arg(creds.password.clone());
            }
            let reply = self.exchange(&hello).await?;
            if reply.is_error() {
                let text = String::from_utf8_lossy(reply.as_bytes().unwrap_or_default())
                    .into_owned();
                debug!(%text, "server declined RESP3; continuing in RESP2");
            } else {
                protocol = Protocol::Resp3;
                authenticated = true;
            }
        }

        if !authenticated {
            if let Some(creds) = &config.credentials {
                let mut auth = Command::new(verbs::AUTH);
                if let Some(username) = &creds.username {
                    auth = auth.arg(username.clone());
                }
                auth = auth.arg(creds.password.clone());
                frame_into_result(self.exchange(&auth).await?)?;
            }
        }

        if let Some(index) = config.database_index {
            let select = Command::new(verbs::SELECT).arg(index.to_string());
            frame_into_result(self.exchange(&select).await?)?;
        }

        if let Some(name) = &config.client_name {
            let setname = Command::new(verbs::CLIENT)
                .arg(verbs::SETNAME)
                .arg(name.clone());
            frame_into_result(self.exchange(&setname).await?)?;
        }

        Ok(protocol)
    }

    async fn exchange(&mut self, cmd: &Command) -> Result<Frame> {
        let mut out = BytesMut::new();
        cmd.encode(&mut out);
        self.stream.write_all(&out).await?;
        self.stream.flush().await?;
        self.read_frame().await
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            let mut cursor = Cursor::new(&self.buffer[..]);
            match self.parser.parse(&mut cursor) {
                Ok(frame) => {
                    let consumed = cursor.position() as usize;
                    self.buffer.advance(consumed);
                    return Ok(frame);
                }
                Err(FrameError::Incomplete) => {}
                Err(FrameError::Malformed(cause)) => return Err(Error::Protocol(cause)),
            }
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                return Err(Error::ConnectionLost);
            }
        }
    }
}
