//! Listeners and shared server context.
//!
//! Each listener runs a configurable number of accept loops; an accepted
//! socket is pinned to the connection task created for it, attached to
//! the manager's roster, and given the personality of its port.

use crate::binary::{BinaryHandler, BinaryShared};
use crate::config::Config;
use crate::conn::{self, total_clients, ConnCore};
use crate::error::ServerError;
use crate::http::HttpHandler;
use crate::metrics::Metrics;
use crate::pool::WorkerPool;
use crate::worker::{Node, Roster};
use seekdb_core::DatabasePool;
use seekdb_protocol::CodecType;
use serde_json::json;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};

/// Two-phase shutdown signal: `asap` stops accepting and lets in-flight
/// handlers finish, `now` forces teardown. Values are the epoch seconds
/// the phase was requested at.
pub struct ShutdownSignal {
    asap: AtomicI64,
    now: AtomicI64,
    pub notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            asap: AtomicI64::new(0),
            now: AtomicI64::new(0),
            notify: Notify::new(),
        }
    }

    fn timestamp() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(1)
    }

    pub fn request_asap(&self) {
        let _ = self
            .asap
            .compare_exchange(0, Self::timestamp(), Ordering::AcqRel, Ordering::Acquire);
        self.notify.notify_waiters();
    }

    pub fn request_now(&self) {
        self.request_asap();
        let _ = self
            .now
            .compare_exchange(0, Self::timestamp(), Ordering::AcqRel, Ordering::Acquire);
        self.notify.notify_waiters();
    }

    pub fn asap(&self) -> i64 {
        self.asap.load(Ordering::Acquire)
    }

    pub fn now(&self) -> i64 {
        self.now.load(Ordering::Acquire)
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything handlers need: the database pool, the worker pool, metrics,
/// limits, and the shutdown signal.
pub struct ServerContext {
    pub config: Config,
    pub db_pool: Arc<DatabasePool>,
    pub workers: WorkerPool,
    pub metrics: Metrics,
    pub shutdown: Arc<ShutdownSignal>,
    started: Instant,
}

impl ServerContext {
    pub fn new(config: Config) -> Result<Arc<Self>, ServerError> {
        let metrics = Metrics::new()
            .map_err(|e| ServerError::Config(format!("metrics registry: {e}")))?;
        let workers = WorkerPool::new(
            "seekdb-worker",
            config.limits.worker_threads,
            config.limits.worker_queue_size,
        );
        Ok(Arc::new(Self {
            config,
            db_pool: Arc::new(DatabasePool::new()),
            workers,
            metrics,
            shutdown: Arc::new(ShutdownSignal::new()),
            started: Instant::now(),
        }))
    }

    /// Manager-level invariant broken or the pool refused work: bring the
    /// process down through the shutdown signal.
    pub fn fatal(&self) {
        tracing::error!("fatal server condition, forcing shutdown");
        self.shutdown.request_now();
    }

    pub fn shutdown_asap(&self) {
        self.shutdown.request_asap();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.asap() != 0
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Status document served by `_stats?server=true`.
    pub fn server_status(&self) -> serde_json::Value {
        json!({
            "name": "seekdb",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": self.uptime_secs(),
            "total_clients": total_clients(),
            "http_clients": crate::http::http_clients(),
            "binary_clients": crate::binary::binary_clients(),
            "worker_backlog": self.workers.backlog(),
            "db_checkouts": self.db_pool.total_checkouts(),
            "endpoints": self.db_pool.endpoints(),
        })
    }
}

/// Which personality a listener hands its sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Http,
    Binary,
}

/// A bound listening port feeding connections into a roster.
pub struct Listener {
    kind: ListenerKind,
    socket: Arc<TcpListener>,
    conns: Roster,
    stop: watch::Sender<bool>,
}

impl Listener {
    /// Binds the port and returns the listener; accept loops start with
    /// [`start`](Self::start).
    pub async fn bind(
        kind: ListenerKind,
        addr: std::net::SocketAddr,
        conns: Roster,
    ) -> Result<Self, ServerError> {
        let socket = TcpListener::bind(addr).await?;
        tracing::info!(
            "{} listener on {}",
            match kind {
                ListenerKind::Http => "http",
                ListenerKind::Binary => "binary",
            },
            socket.local_addr()?
        );
        let (stop, _) = watch::channel(false);
        Ok(Self {
            kind,
            socket: Arc::new(socket),
            conns,
            stop,
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawns the accept loops.
    pub fn start(&self, ctx: Arc<ServerContext>) {
        for _ in 0..self.ctx_loops(&ctx) {
            let ctx = ctx.clone();
            let socket = self.socket.clone();
            let conns = self.conns.clone();
            let stop = self.stop.subscribe();
            let kind = self.kind;
            tokio::spawn(accept_loop(ctx, socket, conns, stop, kind));
        }
    }

    fn ctx_loops(&self, ctx: &ServerContext) -> usize {
        ctx.config.network.loops.max(1)
    }

    /// Stops the accept loops; existing connections are unaffected.
    pub fn stop_accepting(&self) {
        let _ = self.stop.send(true);
    }
}

impl Node for Listener {
    fn shutdown(&self, asap: i64, now: i64) {
        if asap != 0 || now != 0 {
            self.stop_accepting();
        }
    }
}

async fn accept_loop(
    ctx: Arc<ServerContext>,
    socket: Arc<TcpListener>,
    conns: Roster,
    mut stop: watch::Receiver<bool>,
    kind: ListenerKind,
) {
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            accepted = socket.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if total_clients() >= ctx.config.network.max_connections as i64 {
                            tracing::warn!("connection limit reached, rejecting {}", peer);
                            continue;
                        }
                        accept_one(&ctx, &conns, stream, peer, kind);
                    }
                    Err(e) => {
                        tracing::error!("accept error: {}", e);
                    }
                }
            }
        }
    }
}

pub(crate) fn accept_one(
    ctx: &Arc<ServerContext>,
    conns: &Roster,
    stream: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
    kind: ListenerKind,
) {
    ctx.metrics.connections_total.inc();
    let queue_size = ctx.config.limits.write_queue_size;

    match kind {
        ListenerKind::Http => {
            let core = ConnCore::new(peer, queue_size, CodecType::None);
            let attachment = conns.attach(core.clone());
            let handler = HttpHandler::new(core.clone(), ctx.clone());
            conn::spawn(stream, core, handler, attachment, "http");
            tracing::debug!(
                "[{}] new http client ({} total)",
                peer,
                total_clients()
            );
        }
        ListenerKind::Binary => {
            let codec = ctx.config.storage.file_codec();
            let core = ConnCore::new(peer, queue_size, codec);
            let attachment = conns.attach(core.clone());
            let shared = BinaryShared::new(core.clone(), ctx.clone(), attachment.clone());
            let handler = BinaryHandler::new(shared);
            conn::spawn(stream, core, handler, attachment, "binary");
            tracing::debug!(
                "[{}] new binary client ({} total)",
                peer,
                total_clients()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use seekdb_protocol::{
        encode_message, Decoded, MessageDecoder, RemoteMessageType, RemoteReplyType,
        ReplicationReplyType, FILE_FOLLOWS, SWITCH_TO_REPL,
    };
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.network.loops = 1;
        config.limits.worker_threads = 2;
        config.storage.compression = "none".to_string();
        config
    }

    async fn start(kind: ListenerKind) -> (Arc<ServerContext>, std::net::SocketAddr) {
        start_with(kind, test_config()).await
    }

    async fn start_with(
        kind: ListenerKind,
        config: Config,
    ) -> (Arc<ServerContext>, std::net::SocketAddr) {
        let ctx = ServerContext::new(config).unwrap();
        let conns = Roster::new();
        let listener = Listener::bind(kind, "127.0.0.1:0".parse().unwrap(), conns)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        listener.start(ctx.clone());
        // Keep the listener alive for the duration of the test.
        std::mem::forget(listener);
        (ctx, addr)
    }

    /// Reads whatever the server sends within the timeout window.
    fn read_available(stream: &mut TcpStream) -> Vec<u8> {
        stream
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(_) => break,
            }
        }
        out
    }

    fn http_text(stream: &mut TcpStream, request: &str) -> String {
        stream.write_all(request.as_bytes()).unwrap();
        stream.flush().unwrap();
        String::from_utf8_lossy(&read_available(stream)).into_owned()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_http_options() {
        let (_ctx, addr) = start(ListenerKind::Http).await;
        let mut stream = TcpStream::connect(addr).unwrap();
        let response = http_text(&mut stream, "OPTIONS / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.contains("Allow: GET,HEAD,POST,PUT,PATCH,OPTIONS\r\n"));
        assert!(response.contains("Content-Length: 0\r\n"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_http_100_continue_flow() {
        let (_ctx, addr) = start(ListenerKind::Http).await;
        let mut stream = TcpStream::connect(addr).unwrap();

        stream
            .write_all(
                b"POST /idx/_upload HTTP/1.1\r\nHost: x\r\n\
                  Expect: 100-continue\r\nContent-Length: 5\r\n\r\n",
            )
            .unwrap();
        let first = read_available(&mut stream);
        let first = String::from_utf8_lossy(&first);
        assert!(first.starts_with("HTTP/1.1 100 Continue\r\n\r\n"), "{first}");
        // The 100 must arrive before any body byte is sent.
        assert!(!first.contains("200"));

        stream.write_all(b"hello").unwrap();
        let second = read_available(&mut stream);
        let second = String::from_utf8_lossy(&second);
        assert!(second.starts_with("HTTP/1.1 200 OK\r\n"), "{second}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_http_over_limit_body_refused() {
        let (_ctx, addr) = start(ListenerKind::Http).await;
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .write_all(
                b"POST /idx/_upload HTTP/1.1\r\nHost: x\r\n\
                  Content-Length: 300000000\r\n\r\n",
            )
            .unwrap();
        let response = read_available(&mut stream);
        let response = String::from_utf8_lossy(&response);
        assert!(
            response.starts_with("HTTP/1.1 413 Request Entity Too Large\r\n"),
            "{response}"
        );
        // The server closes without reading the body.
        let mut probe = [0u8; 1];
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(stream.read(&mut probe).unwrap_or(0), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_http_index_then_fetch() {
        let (_ctx, addr) = start(ListenerKind::Http).await;
        let mut stream = TcpStream::connect(addr).unwrap();

        let body = r#"{"color":"red"}"#;
        let put = format!(
            "PUT /idx/1 HTTP/1.1\r\nHost: x\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let response = http_text(&mut stream, &put);
        assert!(response.starts_with("HTTP/1.1 201 Created\r\n"), "{response}");

        let response = http_text(
            &mut stream,
            "GET /idx/1 HTTP/1.1\r\nHost: x\r\nAccept: application/json\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.contains("\"color\""));
        assert!(response.contains("red"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_http_body_spills_to_temp_file() {
        // Tiny in-memory threshold: a modest body must spill to a temp
        // file and still index correctly from the readback.
        let mut config = test_config();
        config.limits.max_body_mem = 16;
        let (_ctx, addr) = start_with(ListenerKind::Http, config).await;
        let mut stream = TcpStream::connect(addr).unwrap();

        let body = format!(r#"{{"text":"{}"}}"#, "x".repeat(200));
        let put = format!(
            "PUT /idx/big HTTP/1.1\r\nHost: x\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let response = http_text(&mut stream, &put);
        assert!(response.starts_with("HTTP/1.1 201 Created\r\n"), "{response}");

        let response = http_text(&mut stream, "GET /idx/big HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(response.contains(&"x".repeat(200)), "{response}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_http_not_acceptable() {
        let (_ctx, addr) = start(ListenerKind::Http).await;
        let mut stream = TcpStream::connect(addr).unwrap();

        let body = r#"{"a":1}"#;
        let put = format!(
            "PUT /idx/1 HTTP/1.1\r\nHost: x\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        http_text(&mut stream, &put);

        let response = http_text(
            &mut stream,
            "GET /idx/1 HTTP/1.1\r\nHost: x\r\nAccept: text/html\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 406 Not Acceptable\r\n"), "{response}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_http_search_chunked_with_matched_count() {
        let (_ctx, addr) = start(ListenerKind::Http).await;
        let mut stream = TcpStream::connect(addr).unwrap();

        for (id, color) in [("1", "red"), ("2", "red"), ("3", "blue")] {
            let body = format!(r#"{{"color":"{color}"}}"#);
            let put = format!(
                "PUT /idx/{id} HTTP/1.1\r\nHost: x\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            let response = http_text(&mut stream, &put);
            assert!(response.contains("201"), "{response}");
        }

        let response = http_text(
            &mut stream,
            "GET /idx/_search?q=color:red HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.contains("X-Matched-count: 2\r\n"));
        assert!(response.contains("Transfer-Encoding: chunked\r\n"));
        assert!(response.ends_with("0\r\n\r\n"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_http_delete_and_head() {
        let (_ctx, addr) = start(ListenerKind::Http).await;
        let mut stream = TcpStream::connect(addr).unwrap();

        let body = r#"{"a":1}"#;
        let put = format!(
            "PUT /idx/1 HTTP/1.1\r\nHost: x\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        http_text(&mut stream, &put);

        let response = http_text(&mut stream, "HEAD /idx/1 HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");

        let response = http_text(&mut stream, "DELETE /idx/1 HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");

        let response = http_text(&mut stream, "HEAD /idx/1 HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{response}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_http_method_command_matrix_rejections() {
        let (_ctx, addr) = start(ListenerKind::Http).await;
        let mut stream = TcpStream::connect(addr).unwrap();

        // PUT on _search is a 400 per the routing matrix.
        let response = http_text(
            &mut stream,
            "PUT /idx/_search HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");

        // GET on _upload likewise.
        let response = http_text(&mut stream, "GET /idx/_upload HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
    }

    fn decode_frames(bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut decoder = MessageDecoder::new();
        decoder.extend(bytes);
        let mut frames = Vec::new();
        loop {
            match decoder.next() {
                Ok(Decoded::Message { message, .. }) => {
                    frames.push((message.msg_type, message.payload.to_vec()))
                }
                _ => break,
            }
        }
        frames
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_binary_hello_greeting() {
        let (_ctx, addr) = start(ListenerKind::Binary).await;
        let mut stream = TcpStream::connect(addr).unwrap();

        stream
            .write_all(&encode_message(RemoteMessageType::Hello as u8, b""))
            .unwrap();
        let reply = read_available(&mut stream);
        let frames = decode_frames(&reply);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, RemoteReplyType::Greeting as u8);
        assert!(String::from_utf8_lossy(&frames[0].1).contains("seekdb"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_binary_add_then_query() {
        let (_ctx, addr) = start(ListenerKind::Binary).await;
        let mut stream = TcpStream::connect(addr).unwrap();

        let envelope =
            br#"{"endpoint":"idx","id":"1","body":{"color":"red"},"commit":true}"#;
        stream
            .write_all(&encode_message(
                RemoteMessageType::AddDocument as u8,
                envelope,
            ))
            .unwrap();
        let reply = read_available(&mut stream);
        let frames = decode_frames(&reply);
        assert_eq!(frames[0].0, RemoteReplyType::Done as u8);

        let query = br#"{"endpoint":"idx","query":["color:red"]}"#;
        stream
            .write_all(&encode_message(RemoteMessageType::Query as u8, query))
            .unwrap();
        let reply = read_available(&mut stream);
        let frames = decode_frames(&reply);
        assert_eq!(frames[0].0, RemoteReplyType::Results as u8);
        let text = String::from_utf8_lossy(&frames[0].1).into_owned();
        assert!(text.contains("\"matched\":1"), "{text}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_binary_file_follows_add_document() {
        let (_ctx, addr) = start(ListenerKind::Binary).await;
        let mut stream = TcpStream::connect(addr).unwrap();

        // Announce a file carrying the AddDocument envelope, then stream
        // it with the none codec.
        let envelope =
            br#"{"endpoint":"idx","id":"9","body":{"kind":"filed"},"commit":true}"#;
        let mut wire = vec![FILE_FOLLOWS, RemoteMessageType::AddDocument as u8];
        wire.push(0x01);
        wire.extend_from_slice(&seekdb_protocol::encode_length(envelope.len() as u64));
        wire.extend_from_slice(envelope);
        wire.push(0x00);
        stream.write_all(&wire).unwrap();

        let reply = read_available(&mut stream);
        let frames = decode_frames(&reply);
        assert_eq!(frames.first().map(|f| f.0), Some(RemoteReplyType::Done as u8));

        // The document is queryable afterwards.
        let query = br#"{"endpoint":"idx","query":["kind:filed"]}"#;
        stream
            .write_all(&encode_message(RemoteMessageType::Query as u8, query))
            .unwrap();
        let reply = read_available(&mut stream);
        let frames = decode_frames(&reply);
        assert!(String::from_utf8_lossy(&frames[0].1).contains("\"matched\":1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_binary_switch_to_replication() {
        let (ctx, addr) = start(ListenerKind::Binary).await;

        // Seed the endpoint the changeset request will snapshot.
        let db = ctx
            .db_pool
            .checkout(&["idx".to_string()], seekdb_core::DB_WRITABLE | seekdb_core::DB_SPAWN)
            .unwrap();
        let doc =
            seekdb_core::Document::from_body("1", seekdb_core::JSON_TYPE, br#"{"x":1}"#).unwrap();
        db.writable().unwrap().index(doc, true).unwrap();
        drop(db);

        let mut stream = TcpStream::connect(addr).unwrap();
        let payload = br#"{"endpoint":"idx"}"#;
        stream
            .write_all(&encode_message(SWITCH_TO_REPL, payload))
            .unwrap();

        let reply = read_available(&mut stream);
        // The synthesized GetChangesets runs in ReplicationServer state:
        // the server answers with a FILE_FOLLOWS snapshot stream and an
        // end-of-changesets frame.
        assert_eq!(reply.first(), Some(&FILE_FOLLOWS));
        assert_eq!(reply.get(1), Some(&(ReplicationReplyType::SnapshotFile as u8)));
        assert_eq!(reply.get(2), Some(&0x01));
        let end_frame = encode_message(ReplicationReplyType::EndOfChangesets as u8, b"");
        assert!(reply
            .windows(end_frame.len())
            .any(|window| window == &end_frame[..]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_client_crate_remote_and_replication() {
        use seekdb_client::{Client, ConnectionConfig};

        let (_ctx, addr) = start(ListenerKind::Binary).await;
        let client = Client::connect(ConnectionConfig::new(addr)).await.unwrap();

        let greeting = client.hello().await.unwrap();
        assert_eq!(greeting["name"], "seekdb");

        client
            .add_document("idx", "1", serde_json::json!({"color": "red"}), true)
            .await
            .unwrap();
        client
            .add_document("idx", "2", serde_json::json!({"color": "blue"}), true)
            .await
            .unwrap();

        let reply = client.query("idx", &["color:red"]).await.unwrap();
        assert_eq!(reply.matched, 1);
        assert_eq!(reply.documents[0]["_id"], "1");

        let doc = client.get_document("idx", "2").await.unwrap();
        assert_eq!(doc["color"], "blue");

        let metadata = client.get_metadata("idx").await.unwrap();
        assert_eq!(metadata["stats"]["doc_count"], 2);

        // A second connection pulls the endpoint through replication.
        let repl = Client::connect(ConnectionConfig::new(addr)).await.unwrap();
        let documents = repl.replicate("idx").await.unwrap();
        assert_eq!(documents.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_binary_protocol_violation_drops_connection() {
        let (_ctx, addr) = start(ListenerKind::Binary).await;
        let mut stream = TcpStream::connect(addr).unwrap();

        // A varint length that overflows 64 bits is a protocol violation:
        // the connection drops without a reply.
        let mut wire = vec![RemoteMessageType::Hello as u8];
        wire.extend_from_slice(&[0xff; 11]);
        stream.write_all(&wire).unwrap();

        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut probe = [0u8; 16];
        assert_eq!(stream.read(&mut probe).unwrap_or(0), 0);
    }
}
