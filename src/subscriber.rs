//! Publish/subscribe consumption on a dedicated connection.
//!
//! Once a socket enters subscribe mode, ordinary replies and push frames
//! interleave freely, which would break FIFO reply correlation. The
//! subscriber therefore owns a connection that never carries ordinary
//! requests: its correlator handles only subscribe/unsubscribe
//! acknowledgements while every message frame is dispatched here onto
//! consumer-registered sinks.

use crate::client::config::{ClientConfig, Endpoint};
use crate::client::error::Result;
use crate::command::{Command, verbs};
use crate::connection::Connection;
use crate::frame::Frame;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One delivered pub/sub message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub channel: Bytes,
    pub payload: Bytes,
    /// The matching pattern for pattern subscriptions, `None` for direct
    /// channel subscriptions.
    pub pattern: Option<Bytes>,
}

/// A lazy, potentially infinite sequence of messages for one channel or
/// pattern. Ends when the consumer unsubscribes or the connection dies;
/// re-subscribing yields a fresh stream.
#[derive(Debug)]
pub struct MessageStream {
    rx: mpsc::Receiver<PushMessage>,
}

impl MessageStream {
    /// The next message, or `None` once the sink has been closed.
    pub async fn next(&mut self) -> Option<PushMessage> {
        self.rx.recv().await
    }
}

#[derive(Default)]
struct Sinks {
    channels: HashMap<Bytes, mpsc::Sender<PushMessage>>,
    patterns: HashMap<Bytes, mpsc::Sender<PushMessage>>,
}

/// Client for push consumption, bound to one endpoint.
///
/// Not available through the cluster router: cluster mode does not carry
/// subscriptions, so a subscriber always targets a specific node.
pub struct Subscriber {
    connection: Connection,
    sinks: Arc<Mutex<Sinks>>,
}

impl Subscriber {
    /// Open the dedicated connection and start the dispatch task.
    pub async fn connect(endpoint: &Endpoint, config: &ClientConfig) -> Result<Subscriber> {
        let (push_tx, push_rx) = mpsc::channel(64);
        let connection = Connection::connect_pubsub(endpoint, config, push_tx).await?;
        let sinks: Arc<Mutex<Sinks>> = Arc::new(Mutex::new(Sinks::default()));
        tokio::spawn(dispatch(push_rx, Arc::clone(&sinks)));
        Ok(Subscriber { connection, sinks })
    }

    /// Subscribe to a channel and return its message stream.
    ///
    /// Subscribing again to the same channel replaces the previous sink,
    /// closing the older stream.
    pub async fn subscribe(&self, channel: impl Into<Bytes>) -> Result<MessageStream> {
        let channel = channel.into();
        let (tx, rx) = mpsc::channel(64);
        self.lock_sinks().channels.insert(channel.clone(), tx);

        let cmd = Command::new(verbs::SUBSCRIBE).arg(channel.clone());
        if let Err(cause) = self.connection.call(&cmd).await {
            self.lock_sinks().channels.remove(&channel);
            return Err(cause);
        }
        Ok(MessageStream { rx })
    }

    /// Subscribe to a glob-style pattern.
    pub async fn psubscribe(&self, pattern: impl Into<Bytes>) -> Result<MessageStream> {
        let pattern = pattern.into();
        let (tx, rx) = mpsc::channel(64);
        self.lock_sinks().patterns.insert(pattern.clone(), tx);

        let cmd = Command::new(verbs::PSUBSCRIBE).arg(pattern.clone());
        if let Err(cause) = self.connection.call(&cmd).await {
            self.lock_sinks().patterns.remove(&pattern);
            return Err(cause);
        }
        Ok(MessageStream { rx })
    }

    /// Unsubscribe from a channel, closing its stream.
    ///
    /// The sink is removed before the server acknowledges, so no further
    /// messages are delivered once this call starts.
    pub async fn unsubscribe(&self, channel: impl Into<Bytes>) -> Result<()> {
        let channel = channel.into();
        self.lock_sinks().channels.remove(&channel);
        let cmd = Command::new(verbs::UNSUBSCRIBE).arg(channel);
        self.connection.call(&cmd).await.map(|_| ())
    }

    /// Unsubscribe from a pattern, closing its stream.
    pub async fn punsubscribe(&self, pattern: impl Into<Bytes>) -> Result<()> {
        let pattern = pattern.into();
        self.lock_sinks().patterns.remove(&pattern);
        let cmd = Command::new(verbs::PUNSUBSCRIBE).arg(pattern);
        self.connection.call(&cmd).await.map(|_| ())
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    fn lock_sinks(&self) -> std::sync::MutexGuard<'_, Sinks> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Forward each incoming event frame to its registered sink.
async fn dispatch(mut push_rx: mpsc::Receiver<Frame>, sinks: Arc<Mutex<Sinks>>) {
    while let Some(frame) = push_rx.recv().await {
        let Some(message) = parse_message(&frame) else {
            debug!(%frame, "ignoring non-message event frame");
            continue;
        };

        // Clone the sender out of the lock; the send awaits.
        let sink = {
            let sinks = sinks.lock().unwrap_or_else(PoisonError::into_inner);
            match &message.pattern {
                Some(pattern) => sinks.patterns.get(pattern).cloned(),
                None => sinks.channels.get(&message.channel).cloned(),
            }
        };

        match sink {
            Some(sink) => {
                if sink.send(message).await.is_err() {
                    debug!("consumer dropped its stream; message discarded");
                }
            }
            None => {
                warn!(
                    channel = %String::from_utf8_lossy(&message.channel),
                    "message for unregistered channel dropped"
                );
            }
        }
    }
}

/// Decode `[kind, channel_or_pattern, ...payload]` event frames. Both the
/// RESP3 push spelling and the RESP2 array spelling arrive here.
fn parse_message(frame: &Frame) -> Option<PushMessage> {
    let items = frame.as_elements().ok()?;
    let event = items.first()?.as_bytes().ok()?;

    if event.eq_ignore_ascii_case(b"message") && items.len() == 3 {
        Some(PushMessage {
            channel: owned_bytes(&items[1])?,
            payload: owned_bytes(&items[2])?,
            pattern: None,
        })
    } else if event.eq_ignore_ascii_case(b"pmessage") && items.len() == 4 {
        Some(PushMessage {
            pattern: Some(owned_bytes(&items[1])?),
            channel: owned_bytes(&items[2])?,
            payload: owned_bytes(&items[3])?,
        })
    } else {
        None
    }
}

fn owned_bytes(frame: &Frame) -> Option<Bytes> {
    match frame.inner() {
        Frame::BulkString(Some(data)) => Some(data.clone()),
        Frame::SimpleString(data) => Some(data.clone()),
        _ => None,
    }
}
