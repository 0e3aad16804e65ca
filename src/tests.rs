//! Integration tests exercising the pump, the batcher, the router and the
//! subscriber against scripted in-process servers speaking RESP over
//! loopback sockets.

use crate::client::{Client, ClientConfig, Credentials, Error};
use crate::cluster::{ClusterClient, hash_slot};
use crate::codec::{FrameError, Parser, encode_frame};
use crate::command::Command;
use crate::connection::{Connection, Protocol};
use crate::frame::Frame;
use crate::subscriber::Subscriber;
use crate::transaction::Transaction;
use bytes::{Buf, Bytes, BytesMut};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

// ---------------------------------------------------------------------------
// Scripted server harness
// ---------------------------------------------------------------------------

/// What a scripted server does with one received command.
struct Script {
    delay: Option<Duration>,
    replies: Vec<Frame>,
    hang_up: bool,
}

impl Script {
    fn reply(frame: Frame) -> Script {
        Script {
            delay: None,
            replies: vec![frame],
            hang_up: false,
        }
    }

    fn replies(frames: Vec<Frame>) -> Script {
        Script {
            delay: None,
            replies: frames,
            hang_up: false,
        }
    }

    fn delayed(frame: Frame, delay: Duration) -> Script {
        Script {
            delay: Some(delay),
            replies: vec![frame],
            hang_up: false,
        }
    }

    fn hang_up() -> Script {
        Script {
            delay: None,
            replies: Vec::new(),
            hang_up: true,
        }
    }
}

type Handler = Box<dyn FnMut(Vec<Bytes>) -> Script + Send>;

async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Accept connections forever, running one handler instance per connection.
fn serve<F>(listener: TcpListener, factory: F)
where
    F: Fn() -> Handler + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let mut handler = factory();
            tokio::spawn(async move {
                let parser = Parser::default();
                let mut buffer = BytesMut::new();
                loop {
                    let frame = loop {
                        let mut cursor = Cursor::new(&buffer[..]);
                        match parser.parse(&mut cursor) {
                            Ok(frame) => {
                                let consumed = cursor.position() as usize;
                                buffer.advance(consumed);
                                break frame;
                            }
                            Err(FrameError::Incomplete) => {
                                match socket.read_buf(&mut buffer).await {
                                    Ok(0) | Err(_) => return,
                                    Ok(_) => {}
                                }
                            }
                            Err(_) => return,
                        }
                    };

                    let script = handler(argv(&frame));
                    if let Some(delay) = script.delay {
                        tokio::time::sleep(delay).await;
                    }
                    let mut out = BytesMut::new();
                    for reply in &script.replies {
                        encode_frame(&mut out, reply);
                    }
                    if !out.is_empty() && socket.write_all(&out).await.is_err() {
                        return;
                    }
                    if script.hang_up {
                        return;
                    }
                }
            });
        }
    });
}

fn argv(frame: &Frame) -> Vec<Bytes> {
    match frame {
        Frame::Array(Some(items)) => items
            .iter()
            .filter_map(|item| match item {
                Frame::BulkString(Some(data)) => Some(data.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn verb_is(args: &[Bytes], verb: &str) -> bool {
    args.first()
        .is_some_and(|v| v.eq_ignore_ascii_case(verb.as_bytes()))
}

/// Replies every handler needs: decline RESP3, answer PING.
fn common_reply(args: &[Bytes]) -> Option<Script> {
    if verb_is(args, "HELLO") {
        return Some(Script::reply(Frame::error(
            &b"ERR unknown command 'HELLO'"[..],
        )));
    }
    if verb_is(args, "PING") {
        return Some(Script::reply(Frame::simple("PONG")));
    }
    None
}

fn nodes_reply(id: &str, addr: SocketAddr, slots: &str) -> Frame {
    Frame::bulk(format!(
        "{id} 127.0.0.1:{}@0 myself,master - 0 0 1 connected {slots}\n",
        addr.port()
    ))
}

fn test_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig::new([addr.to_string()])
        .with_connect_timeout(Duration::from_secs(5))
        .with_command_timeout(Duration::from_secs(5))
}

// ---------------------------------------------------------------------------
// Codec properties that need whole-stream fixtures
// ---------------------------------------------------------------------------

#[test]
fn parser_segmentation_invariance() {
    let frames = vec![
        Frame::simple("OK"),
        Frame::bulk("hello"),
        Frame::Integer(-42),
        Frame::array(vec![Frame::bulk("GET"), Frame::bulk("k")]),
        Frame::Map(vec![(Frame::bulk("f"), Frame::Double(1.5))]),
        Frame::Null,
        Frame::Push(vec![Frame::bulk("message"), Frame::bulk("c"), Frame::bulk("p")]),
    ];
    let mut stream = BytesMut::new();
    for frame in &frames {
        encode_frame(&mut stream, frame);
    }

    let parser = Parser::default();
    for chunk_size in [1, 2, 3, 5, 7, 16, 64, stream.len()] {
        let mut buffer = BytesMut::new();
        let mut decoded = Vec::new();
        for chunk in stream.chunks(chunk_size) {
            buffer.extend_from_slice(chunk);
            loop {
                let mut cursor = Cursor::new(&buffer[..]);
                match parser.parse(&mut cursor) {
                    Ok(frame) => {
                        let consumed = cursor.position() as usize;
                        buffer.advance(consumed);
                        decoded.push(frame);
                    }
                    Err(FrameError::Incomplete) => break,
                    Err(other) => panic!("chunk size {chunk_size}: {other:?}"),
                }
            }
        }
        assert!(buffer.is_empty(), "chunk size {chunk_size} left residue");
        assert_eq!(decoded, frames, "chunk size {chunk_size}");
    }
}

// ---------------------------------------------------------------------------
// Connection core
// ---------------------------------------------------------------------------

fn echo_handler() -> Handler {
    Box::new(|args: Vec<Bytes>| {
        if let Some(script) = common_reply(&args) {
            return script;
        }
        if verb_is(&args, "ECHO") {
            return Script::reply(Frame::BulkString(Some(args[1].clone())));
        }
        Script::reply(Frame::error(&b"ERR unknown command"[..]))
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_submissions_correlate_in_fifo_order() {
    let (listener, addr) = bind().await;
    serve(listener, echo_handler);

    let endpoint = crate::Endpoint::parse(&addr.to_string()).unwrap();
    let conn = Connection::connect(&endpoint, &test_config(addr)).await.unwrap();

    let mut workers = Vec::new();
    for index in 0..32u32 {
        let conn = conn.clone();
        workers.push(tokio::spawn(async move {
            let cmd = Command::new("ECHO").arg(index.to_string());
            let reply = conn.call(&cmd).await.unwrap();
            assert_eq!(reply.as_str().unwrap(), index.to_string());
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }
}

#[tokio::test]
async fn timed_out_reply_is_discarded_and_correlation_survives() {
    let (listener, addr) = bind().await;
    serve(listener, || {
        Box::new(|args: Vec<Bytes>| {
            if let Some(script) = common_reply(&args) {
                return script;
            }
            if verb_is(&args, "ECHO") {
                let payload = args[1].clone();
                if payload.as_ref() == b"slow" {
                    return Script::delayed(
                        Frame::BulkString(Some(payload)),
                        Duration::from_millis(150),
                    );
                }
                return Script::reply(Frame::BulkString(Some(payload)));
            }
            Script::reply(Frame::error(&b"ERR unknown command"[..]))
        })
    });

    let endpoint = crate::Endpoint::parse(&addr.to_string()).unwrap();
    let config = test_config(addr).with_command_timeout(Duration::from_millis(40));
    let conn = Connection::connect(&endpoint, &config).await.unwrap();

    let slow = conn.call(&Command::new("ECHO").arg("slow")).await;
    assert!(matches!(slow, Err(Error::Timeout)));

    // The late reply resolves (and is discarded through) the abandoned
    // handle; the next call still receives its own reply. Waited without a
    // deadline because the server is still sleeping on the first request.
    let handle = conn.submit(&Command::new("ECHO").arg("fast")).await.unwrap();
    let fast = handle.wait().await.unwrap();
    assert_eq!(fast.as_str().unwrap(), "fast");
}

#[tokio::test]
async fn pending_requests_fail_when_the_peer_hangs_up() {
    let (listener, addr) = bind().await;
    serve(listener, || {
        Box::new(|args: Vec<Bytes>| {
            if let Some(script) = common_reply(&args) {
                return script;
            }
            Script::hang_up()
        })
    });

    let endpoint = crate::Endpoint::parse(&addr.to_string()).unwrap();
    let conn = Connection::connect(&endpoint, &test_config(addr)).await.unwrap();

    let result = conn.call(&Command::new("GET").arg("k")).await;
    assert!(matches!(result, Err(Error::ConnectionLost)));

    // Later submissions are refused as well.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let result = conn.call(&Command::new("GET").arg("k")).await;
    assert!(result.err().is_some_and(|e| e.is_connection_failure()));
}

#[tokio::test]
async fn malformed_reply_breaks_the_connection() {
    let (listener, addr) = bind().await;
    // Raw socket server: handshake declined, then garbage bytes.
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 1024];
        // HELLO
        let _ = socket.read(&mut buf).await;
        socket.write_all(b"-ERR unknown command 'HELLO'\r\n").await.unwrap();
        // First real command gets a marker that is not part of the protocol.
        let _ = socket.read(&mut buf).await;
        socket.write_all(b"@not-a-frame\r\n").await.unwrap();
        socket.flush().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let endpoint = crate::Endpoint::parse(&addr.to_string()).unwrap();
    let conn = Connection::connect(&endpoint, &test_config(addr)).await.unwrap();

    let result = conn.call(&Command::new("GET").arg("k")).await;
    assert!(matches!(result, Err(Error::ConnectionLost)));
}

#[tokio::test]
async fn runaway_reply_trips_the_staging_ceiling() {
    let (listener, addr) = bind().await;
    serve(listener, || {
        Box::new(|args: Vec<Bytes>| {
            if let Some(script) = common_reply(&args) {
                return script;
            }
            // One bulk reply far beyond the configured staging ceiling.
            Script::reply(Frame::bulk(vec![b'x'; 64 * 1024]))
        })
    });

    let endpoint = crate::Endpoint::parse(&addr.to_string()).unwrap();
    let config = test_config(addr).with_read_buffer_limit(4 * 1024);
    let conn = Connection::connect(&endpoint, &config).await.unwrap();

    let result = conn.call(&Command::new("GET").arg("big")).await;
    assert!(matches!(result, Err(Error::ConnectionLost)));
}

#[tokio::test]
async fn blocking_verbs_are_exempt_from_the_default_timeout() {
    let (listener, addr) = bind().await;
    serve(listener, || {
        Box::new(|args: Vec<Bytes>| {
            if let Some(script) = common_reply(&args) {
                return script;
            }
            if verb_is(&args, "BLPOP") {
                return Script::delayed(
                    Frame::array(vec![Frame::bulk("q"), Frame::bulk("job")]),
                    Duration::from_millis(120),
                );
            }
            Script::reply(Frame::error(&b"ERR unknown command"[..]))
        })
    });

    let endpoint = crate::Endpoint::parse(&addr.to_string()).unwrap();
    // Far below the server's delay; a non-blocking call would time out.
    let config = test_config(addr).with_command_timeout(Duration::from_millis(30));
    let conn = Connection::connect(&endpoint, &config).await.unwrap();

    let cmd = Command::new("BLPOP").arg("q").arg("0");
    let reply = conn.call(&cmd).await.unwrap();
    assert_eq!(reply.as_elements().unwrap().len(), 2);
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handshake_negotiates_resp3_when_offered() {
    let (listener, addr) = bind().await;
    serve(listener, || {
        Box::new(|args: Vec<Bytes>| {
            if verb_is(&args, "HELLO") {
                return Script::reply(Frame::Map(vec![
                    (Frame::bulk("server"), Frame::bulk("valkey")),
                    (Frame::bulk("proto"), Frame::Integer(3)),
                ]));
            }
            Script::reply(Frame::simple("OK"))
        })
    });

    let endpoint = crate::Endpoint::parse(&addr.to_string()).unwrap();
    let conn = Connection::connect(&endpoint, &test_config(addr)).await.unwrap();
    assert_eq!(conn.protocol(), Protocol::Resp3);
}

#[tokio::test]
async fn handshake_falls_back_to_resp2_and_configures_the_session() {
    let (listener, addr) = bind().await;
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    serve(listener, move || {
        let log = Arc::clone(&log);
        Box::new(move |args: Vec<Bytes>| {
            let words: Vec<String> = args
                .iter()
                .map(|a| String::from_utf8_lossy(a).into_owned())
                .collect();
            log.lock().unwrap().push(words.join(" "));
            if verb_is(&args, "HELLO") {
                return Script::reply(Frame::error(&b"ERR unknown command 'HELLO'"[..]));
            }
            Script::reply(Frame::simple("OK"))
        })
    });

    let endpoint = crate::Endpoint::parse(&addr.to_string()).unwrap();
    let config = test_config(addr)
        .with_prefer_resp3(true)
        .with_credentials(Credentials::acl("app", "sekrit"))
        .with_database_index(2)
        .with_client_name("integration-test");
    let conn = Connection::connect(&endpoint, &config).await.unwrap();
    assert_eq!(conn.protocol(), Protocol::Resp2);

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0], "HELLO 3 AUTH app sekrit");
    assert_eq!(seen[1], "AUTH app sekrit");
    assert_eq!(seen[2], "SELECT 2");
    assert_eq!(seen[3], "CLIENT SETNAME integration-test");
}

// ---------------------------------------------------------------------------
// Direct client and transactions
// ---------------------------------------------------------------------------

fn store_handler() -> Handler {
    let mut store: std::collections::HashMap<Bytes, Bytes> = std::collections::HashMap::new();
    let mut staged: Option<Vec<Vec<Bytes>>> = None;
    Box::new(move |args: Vec<Bytes>| {
        if let Some(script) = common_reply(&args) {
            return script;
        }
        if verb_is(&args, "MULTI") {
            staged = Some(Vec::new());
            return Script::reply(Frame::simple("OK"));
        }
        if verb_is(&args, "EXEC") {
            let commands = staged.take().unwrap_or_default();
            let mut results = Vec::new();
            for command in commands {
                results.push(apply(&mut store, &command));
            }
            return Script::reply(Frame::array(results));
        }
        if staged.is_some() {
            staged.as_mut().unwrap().push(args);
            return Script::reply(Frame::simple("QUEUED"));
        }
        Script::reply(apply(&mut store, &args))
    })
}

fn apply(store: &mut std::collections::HashMap<Bytes, Bytes>, args: &[Bytes]) -> Frame {
    if verb_is(args, "SET") {
        store.insert(args[1].clone(), args[2].clone());
        return Frame::simple("OK");
    }
    if verb_is(args, "GET") {
        return match store.get(&args[1]) {
            Some(value) => Frame::BulkString(Some(value.clone())),
            None => Frame::BulkString(None),
        };
    }
    if verb_is(args, "DEL") {
        let existed = store.remove(&args[1]).is_some();
        return Frame::Integer(existed as i64);
    }
    if verb_is(args, "INCR") {
        let next = store
            .get(&args[1])
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
            + 1;
        store.insert(args[1].clone(), Bytes::from(next.to_string()));
        return Frame::Integer(next);
    }
    Frame::error(&b"ERR unknown command"[..])
}

#[tokio::test]
async fn direct_client_round_trip() {
    let (listener, addr) = bind().await;
    serve(listener, store_handler);

    let client = Client::connect(test_config(addr)).await.unwrap();
    assert_eq!(client.get("missing").await.unwrap(), None);

    client.set("greeting", "hello").await.unwrap();
    assert_eq!(
        client.get("greeting").await.unwrap().as_deref(),
        Some(&b"hello"[..])
    );

    assert_eq!(client.incr("counter").await.unwrap(), 1);
    assert_eq!(client.incr("counter").await.unwrap(), 2);
    assert!(client.del("greeting").await.unwrap());
    assert!(!client.del("greeting").await.unwrap());
}

#[tokio::test]
async fn server_errors_leave_the_connection_healthy() {
    let (listener, addr) = bind().await;
    serve(listener, store_handler);

    let client = Client::connect(test_config(addr)).await.unwrap();
    let result = client.call(&Command::new("NOSUCH")).await;
    assert!(matches!(result, Err(Error::Server(text)) if text.starts_with("ERR")));

    // Same connection keeps working.
    client.set("k", "v").await.unwrap();
    assert_eq!(client.get("k").await.unwrap().as_deref(), Some(&b"v"[..]));
}

#[tokio::test]
async fn transaction_splits_the_exec_reply() {
    let (listener, addr) = bind().await;
    serve(listener, store_handler);

    let client = Client::connect(test_config(addr)).await.unwrap();

    let mut txn = client.transaction();
    txn.stage(Command::new("SET").arg("a").arg("1"));
    txn.stage(Command::new("INCR").arg("a"));
    txn.stage(Command::new("GET").arg("a"));
    let results = txn.exec(client.connection()).await.unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results[0], Frame::simple("OK"));
    assert_eq!(results[1], Frame::Integer(2));
    assert_eq!(results[2], Frame::bulk("2"));
    assert!(!client.connection().is_transaction_locked());
}

#[tokio::test]
async fn empty_transaction_is_a_no_op() {
    let (listener, addr) = bind().await;
    serve(listener, store_handler);

    let client = Client::connect(test_config(addr)).await.unwrap();
    let results = Transaction::new().exec(client.connection()).await.unwrap();
    assert!(results.is_empty());
}

// ---------------------------------------------------------------------------
// Cluster router
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn moved_redirect_is_followed_and_topology_catches_up() {
    let (listener_a, addr_a) = bind().await;
    let (listener_b, addr_b) = bind().await;

    let a_gets = Arc::new(AtomicU32::new(0));
    let b_gets = Arc::new(AtomicU32::new(0));
    let migrated = Arc::new(AtomicBool::new(false));

    {
        let a_gets = Arc::clone(&a_gets);
        let migrated = Arc::clone(&migrated);
        serve(listener_a, move || {
            let a_gets = Arc::clone(&a_gets);
            let migrated = Arc::clone(&migrated);
            Box::new(move |args: Vec<Bytes>| {
                if let Some(script) = common_reply(&args) {
                    return script;
                }
                if verb_is(&args, "CLUSTER") {
                    // After the migration node A reports B as the owner.
                    return Script::reply(if migrated.load(Ordering::Acquire) {
                        nodes_reply("node-b", addr_b, "0-16383")
                    } else {
                        nodes_reply("node-a", addr_a, "0-16383")
                    });
                }
                if verb_is(&args, "GET") {
                    a_gets.fetch_add(1, Ordering::AcqRel);
                    migrated.store(true, Ordering::Release);
                    return Script::reply(Frame::error(Bytes::from(format!(
                        "MOVED 3999 127.0.0.1:{}",
                        addr_b.port()
                    ))));
                }
                Script::reply(Frame::error(&b"ERR unknown command"[..]))
            })
        });
    }
    {
        let b_gets = Arc::clone(&b_gets);
        serve(listener_b, move || {
            let b_gets = Arc::clone(&b_gets);
            Box::new(move |args: Vec<Bytes>| {
                if let Some(script) = common_reply(&args) {
                    return script;
                }
                if verb_is(&args, "CLUSTER") {
                    return Script::reply(nodes_reply("node-b", addr_b, "0-16383"));
                }
                if verb_is(&args, "GET") {
                    b_gets.fetch_add(1, Ordering::AcqRel);
                    return Script::reply(Frame::simple("OK"));
                }
                Script::reply(Frame::error(&b"ERR unknown command"[..]))
            })
        });
    }

    let cluster = ClusterClient::connect(test_config(addr_a)).await.unwrap();

    // First call: routed to A, redirected, answered by B.
    let reply = cluster.call(&Command::new("GET").arg("k")).await.unwrap();
    assert_eq!(reply, Frame::simple("OK"));
    assert_eq!(a_gets.load(Ordering::Acquire), 1);
    assert_eq!(b_gets.load(Ordering::Acquire), 1);

    // The refresh (already scheduled in the background) lands the new map.
    cluster.refresh_topology().await.unwrap();
    let map = cluster.topology().unwrap();
    let owner = map.primary_for(hash_slot(b"k")).unwrap();
    assert_eq!(owner.endpoint.port, addr_b.port());

    // Second call goes straight to the new owner.
    let reply = cluster.call(&Command::new("GET").arg("k")).await.unwrap();
    assert_eq!(reply, Frame::simple("OK"));
    assert_eq!(a_gets.load(Ordering::Acquire), 1);
    assert_eq!(b_gets.load(Ordering::Acquire), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn redirect_ceiling_yields_redirection_loop() {
    let (listener, addr) = bind().await;
    let gets = Arc::new(AtomicU32::new(0));
    {
        let gets = Arc::clone(&gets);
        serve(listener, move || {
            let gets = Arc::clone(&gets);
            Box::new(move |args: Vec<Bytes>| {
                if let Some(script) = common_reply(&args) {
                    return script;
                }
                if verb_is(&args, "CLUSTER") {
                    return Script::reply(nodes_reply("node-a", addr, "0-16383"));
                }
                if verb_is(&args, "GET") {
                    gets.fetch_add(1, Ordering::AcqRel);
                    return Script::reply(Frame::error(Bytes::from(format!(
                        "MOVED 3999 127.0.0.1:{}",
                        addr.port()
                    ))));
                }
                Script::reply(Frame::error(&b"ERR unknown command"[..]))
            })
        });
    }

    let config = test_config(addr).with_max_redirects(3);
    let cluster = ClusterClient::connect(config).await.unwrap();

    let result = cluster.call(&Command::new("GET").arg("k")).await;
    assert!(matches!(result, Err(Error::RedirectionLoop(3))));
    // Exactly max-redirects retries after the initial attempt.
    assert_eq!(gets.load(Ordering::Acquire), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn ask_redirect_prefixes_asking_and_skips_refresh() {
    let (listener_a, addr_a) = bind().await;
    let (listener_b, addr_b) = bind().await;

    let a_cluster_calls = Arc::new(AtomicU32::new(0));
    let b_verbs: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let a_cluster_calls = Arc::clone(&a_cluster_calls);
        serve(listener_a, move || {
            let a_cluster_calls = Arc::clone(&a_cluster_calls);
            Box::new(move |args: Vec<Bytes>| {
                if let Some(script) = common_reply(&args) {
                    return script;
                }
                if verb_is(&args, "CLUSTER") {
                    a_cluster_calls.fetch_add(1, Ordering::AcqRel);
                    return Script::reply(nodes_reply("node-a", addr_a, "0-16383"));
                }
                if verb_is(&args, "GET") {
                    return Script::reply(Frame::error(Bytes::from(format!(
                        "ASK 3999 127.0.0.1:{}",
                        addr_b.port()
                    ))));
                }
                Script::reply(Frame::error(&b"ERR unknown command"[..]))
            })
        });
    }
    {
        let b_verbs = Arc::clone(&b_verbs);
        serve(listener_b, move || {
            let b_verbs = Arc::clone(&b_verbs);
            Box::new(move |args: Vec<Bytes>| {
                if let Some(script) = common_reply(&args) {
                    return script;
                }
                let verb = String::from_utf8_lossy(&args[0]).to_uppercase();
                b_verbs.lock().unwrap().push(verb.clone());
                match verb.as_str() {
                    "ASKING" => Script::reply(Frame::simple("OK")),
                    "GET" => Script::reply(Frame::bulk("migrating-value")),
                    _ => Script::reply(Frame::error(&b"ERR unknown command"[..])),
                }
            })
        });
    }

    let cluster = ClusterClient::connect(test_config(addr_a)).await.unwrap();
    let discovery_calls = a_cluster_calls.load(Ordering::Acquire);

    let reply = cluster.call(&Command::new("GET").arg("k")).await.unwrap();
    assert_eq!(reply, Frame::bulk("migrating-value"));

    // The ASKING prefix reached B immediately before the retried command.
    assert_eq!(&*b_verbs.lock().unwrap(), &["ASKING", "GET"]);

    // ASK must not trigger a topology refresh.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(a_cluster_calls.load(Ordering::Acquire), discovery_calls);
}

#[tokio::test]
async fn surfacing_redirects_when_auto_handling_is_disabled() {
    let (listener, addr) = bind().await;
    serve(listener, move || {
        Box::new(move |args: Vec<Bytes>| {
            if let Some(script) = common_reply(&args) {
                return script;
            }
            if verb_is(&args, "CLUSTER") {
                return Script::reply(nodes_reply("node-a", addr, "0-16383"));
            }
            Script::reply(Frame::error(&b"MOVED 3999 10.0.0.2:6379"[..]))
        })
    });

    let config = test_config(addr).with_auto_handle_moved(false);
    let cluster = ClusterClient::connect(config).await.unwrap();
    let result = cluster.call(&Command::new("GET").arg("k")).await;
    assert!(matches!(result, Err(Error::Server(text)) if text.starts_with("MOVED")));
}

#[tokio::test]
async fn uncovered_slot_is_reported() {
    let (listener, addr) = bind().await;
    serve(listener, move || {
        Box::new(move |args: Vec<Bytes>| {
            if let Some(script) = common_reply(&args) {
                return script;
            }
            if verb_is(&args, "CLUSTER") {
                // Only a sliver of the slot space is owned.
                return Script::reply(nodes_reply("node-a", addr, "0-100"));
            }
            Script::reply(Frame::simple("OK"))
        })
    });

    let cluster = ClusterClient::connect(test_config(addr)).await.unwrap();
    // "foo" hashes to 12182, far outside the owned range.
    let result = cluster.call(&Command::new("GET").arg("foo")).await;
    assert!(matches!(result, Err(Error::NoNodeForSlot(12182))));
}

#[tokio::test]
async fn keyless_commands_reach_some_primary() {
    let (listener, addr) = bind().await;
    serve(listener, move || {
        Box::new(move |args: Vec<Bytes>| {
            if verb_is(&args, "CLUSTER") {
                return Script::reply(nodes_reply("node-a", addr, "0-16383"));
            }
            common_reply(&args)
                .unwrap_or_else(|| Script::reply(Frame::error(&b"ERR unknown command"[..])))
        })
    });

    let cluster = ClusterClient::connect(test_config(addr)).await.unwrap();
    let reply = cluster.call(&Command::new("PING")).await.unwrap();
    assert_eq!(reply, Frame::simple("PONG"));
}

#[tokio::test]
async fn unreachable_seeds_yield_topology_unavailable() {
    // Bind-then-drop leaves a port nothing is listening on.
    let (listener, addr) = bind().await;
    drop(listener);

    let config = test_config(addr).with_connect_timeout(Duration::from_millis(200));
    let result = ClusterClient::connect(config).await;
    assert!(matches!(result, Err(Error::TopologyUnavailable)));
}

#[tokio::test(flavor = "multi_thread")]
async fn topology_swaps_are_atomic_under_concurrent_readers() {
    let (listener, addr) = bind().await;
    let flip = Arc::new(AtomicBool::new(false));
    {
        let flip = Arc::clone(&flip);
        serve(listener, move || {
            let flip = Arc::clone(&flip);
            Box::new(move |args: Vec<Bytes>| {
                if let Some(script) = common_reply(&args) {
                    return script;
                }
                if verb_is(&args, "CLUSTER") {
                    // Alternate between two single-node layouts.
                    let layout = if flip.fetch_xor(true, Ordering::AcqRel) {
                        nodes_reply("node-odd", addr, "0-16383")
                    } else {
                        nodes_reply("node-even", addr, "0-16383")
                    };
                    return Script::reply(layout);
                }
                Script::reply(Frame::simple("OK"))
            })
        });
    }

    let cluster = ClusterClient::connect(test_config(addr)).await.unwrap();

    let reader = {
        let cluster = cluster.clone();
        tokio::spawn(async move {
            for _ in 0..500 {
                let map = cluster.topology().unwrap();
                for slot in [0u16, 8191, 16383] {
                    let owner = map.primary_for(slot).unwrap();
                    // The owner must come from the same snapshot's node list.
                    assert!(map.nodes().iter().any(|node| node.id == owner.id));
                }
                tokio::task::yield_now().await;
            }
        })
    };

    for _ in 0..20 {
        cluster.refresh_topology().await.unwrap();
    }
    reader.await.unwrap();
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscriber_streams_messages_per_channel() {
    let (listener, addr) = bind().await;
    serve(listener, || {
        Box::new(|args: Vec<Bytes>| {
            if let Some(script) = common_reply(&args) {
                return script;
            }
            if verb_is(&args, "SUBSCRIBE") {
                let channel = args[1].clone();
                // RESP2 spelling: the ack and both deliveries are arrays.
                return Script::replies(vec![
                    Frame::array(vec![
                        Frame::bulk("subscribe"),
                        Frame::BulkString(Some(channel.clone())),
                        Frame::Integer(1),
                    ]),
                    Frame::array(vec![
                        Frame::bulk("message"),
                        Frame::BulkString(Some(channel.clone())),
                        Frame::bulk("first"),
                    ]),
                    Frame::array(vec![
                        Frame::bulk("message"),
                        Frame::BulkString(Some(channel)),
                        Frame::bulk("second"),
                    ]),
                ]);
            }
            if verb_is(&args, "UNSUBSCRIBE") {
                return Script::reply(Frame::array(vec![
                    Frame::bulk("unsubscribe"),
                    Frame::BulkString(Some(args[1].clone())),
                    Frame::Integer(0),
                ]));
            }
            Script::reply(Frame::error(&b"ERR unknown command"[..]))
        })
    });

    let endpoint = crate::Endpoint::parse(&addr.to_string()).unwrap();
    let subscriber = Subscriber::connect(&endpoint, &test_config(addr)).await.unwrap();

    let mut stream = subscriber.subscribe("news").await.unwrap();
    let first = stream.next().await.unwrap();
    assert_eq!(first.channel.as_ref(), b"news");
    assert_eq!(first.payload.as_ref(), b"first");
    assert_eq!(first.pattern, None);
    let second = stream.next().await.unwrap();
    assert_eq!(second.payload.as_ref(), b"second");

    // Unsubscribing closes the sink, which ends the stream.
    subscriber.unsubscribe("news").await.unwrap();
    assert_eq!(stream.next().await, None);
}
