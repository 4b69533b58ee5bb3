//! Binary personality.
//!
//! Speaks the typed `<type><len:varint><payload>` protocol on the binary
//! port. The framing layer intercepts `SWITCH_TO_REPL` (flipping the
//! connection into the replication sub-protocol with a synthetic
//! `GetChangesets`) and `FILE_FOLLOWS` (receiving a codec file stream
//! into a connection-owned temp file, re-enqueued under the announced
//! message type).
//!
//! Decoded messages queue under the runner mutex; at most one worker
//! thread at a time runs a connection's messages, dispatching by
//! sub-protocol state. When the queue drains the runner releases the
//! connection and re-tries the detach if one is pending.

use crate::conn::{ConnCore, ReadAction, StreamHandler};
use crate::error::ServerError;
use crate::server::ServerContext;
use crate::worker::Attachment;
use bytes::Bytes;
use parking_lot::Mutex;
use seekdb_core::{Document, QueryField, DB_SPAWN, DB_WRITABLE, JSON_TYPE};
use seekdb_protocol::{
    encode_message, Decoded, Message, MessageDecoder, RemoteMessageType, RemoteReplyType,
    ReplicationMessageType, ReplicationReplyType,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::io::Write as _;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tempfile::{NamedTempFile, TempDir};

static BINARY_CLIENTS: AtomicI64 = AtomicI64::new(0);

/// Connected binary clients.
pub fn binary_clients() -> i64 {
    BINARY_CLIENTS.load(Ordering::Acquire)
}

/// Sub-protocol the runner dispatches by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoState {
    RemoteServer,
    ReplicationServer,
    ReplicationClient,
}

struct Runner {
    running: bool,
    messages: VecDeque<Message>,
}

/// State shared between the connection loop and runner threads.
pub struct BinaryShared {
    core: Arc<ConnCore>,
    ctx: Arc<ServerContext>,
    state: Mutex<ProtoState>,
    runner: Mutex<Runner>,
    temp_dir: Mutex<Option<TempDir>>,
    temp_files: Mutex<Vec<NamedTempFile>>,
    attachment: Attachment,
}

impl BinaryShared {
    pub fn new(core: Arc<ConnCore>, ctx: Arc<ServerContext>, attachment: Attachment) -> Arc<Self> {
        Arc::new(Self {
            core,
            ctx,
            state: Mutex::new(ProtoState::RemoteServer),
            runner: Mutex::new(Runner {
                running: false,
                messages: VecDeque::new(),
            }),
            temp_dir: Mutex::new(None),
            temp_files: Mutex::new(Vec::new()),
            attachment,
        })
    }

    pub fn state(&self) -> ProtoState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ProtoState) {
        *self.state.lock() = state;
    }

    /// No runner, no queued messages, nothing waiting on the wire.
    pub fn is_idle(&self) -> bool {
        if self.core.has_pending_writes() {
            return false;
        }
        let runner = self.runner.lock();
        !runner.running && runner.messages.is_empty()
    }

    /// Queues a message and claims a runner if none is active.
    pub fn enqueue(self: &Arc<Self>, message: Message) {
        if self.core.is_closed() {
            return;
        }
        let start = {
            let mut runner = self.runner.lock();
            runner.messages.push_back(message);
            if runner.running {
                false
            } else {
                runner.running = true;
                true
            }
        };
        if start {
            let shared = self.clone();
            if !self.ctx.workers.spawn(move || shared.run()) {
                self.runner.lock().running = false;
                tracing::error!("[{}] worker pool refused runner", self.core.peer());
                self.ctx.fatal();
                self.core.request_destroy();
            }
        }
    }

    /// Runner body: dequeues and dispatches until the queue drains. A
    /// handler failure releases the runner, detaches the connection, and
    /// tears it down.
    fn run(self: Arc<Self>) {
        loop {
            let message = {
                let mut runner = self.runner.lock();
                match runner.messages.pop_front() {
                    Some(message) => message,
                    None => {
                        runner.running = false;
                        break;
                    }
                }
            };
            if self.core.is_closed() {
                self.runner.lock().running = false;
                break;
            }

            let state = self.state();
            let result = match state {
                ProtoState::RemoteServer => self.remote_server(&message),
                ProtoState::ReplicationServer => self.replication_server(&message),
                ProtoState::ReplicationClient => self.replication_client(&message),
            };

            if let Err(e) = result {
                self.runner.lock().running = false;
                tracing::debug!(
                    "[{}] {:?} handler failed: {}",
                    self.core.peer(),
                    state,
                    e
                );
                self.ctx
                    .metrics
                    .errors_total
                    .with_label_values(&["binary"])
                    .inc();
                self.attachment.detach();
                self.core.request_destroy();
                return;
            }
        }

        if self.ctx.is_shutting_down() && self.is_idle() {
            self.attachment.detach();
            return;
        }
        self.redetach();
    }

    /// Retries a pending detach; used when a previous detach raced a
    /// still-running handler.
    fn redetach(&self) {
        if self.core.is_closed() && self.is_idle() {
            self.attachment.detach();
        }
    }

    fn send_message(&self, msg_type: u8, payload: &[u8]) -> Result<(), ServerError> {
        let frame = encode_message(msg_type, payload);
        let replication = self.state() != ProtoState::RemoteServer;
        let sent = frame.len() as f64;
        if !self.core.write_blocking(frame.freeze()) {
            return Err(ServerError::ShuttingDown);
        }
        if replication {
            self.ctx.metrics.replication_sent_bytes.inc_by(sent);
        } else {
            self.ctx.metrics.remote_sent_bytes.inc_by(sent);
        }
        Ok(())
    }

    /// Announces and streams a file: `FILE_FOLLOWS`, the re-enqueue type,
    /// then the codec stream.
    fn send_file(&self, msg_type: u8, file: &mut std::fs::File) -> Result<(), ServerError> {
        if !self
            .core
            .write_blocking(Bytes::copy_from_slice(&[seekdb_protocol::FILE_FOLLOWS, msg_type]))
        {
            return Err(ServerError::ShuttingDown);
        }
        if !self.core.send_file(file) {
            return Err(ServerError::ShuttingDown);
        }
        Ok(())
    }

    fn record_received(&self, message: &Message, replication: bool) {
        let received = message.payload.len() as f64 + 2.0;
        if replication {
            self.ctx
                .metrics
                .binary_messages_total
                .with_label_values(&["replication"])
                .inc();
            self.ctx.metrics.replication_received_bytes.inc_by(received);
        } else {
            self.ctx
                .metrics
                .binary_messages_total
                .with_label_values(&["remote"])
                .inc();
            self.ctx.metrics.remote_received_bytes.inc_by(received);
        }
    }

    /// A payload is either the inline JSON envelope or, after
    /// `FILE_FOLLOWS`, the path of the received temp file holding it.
    fn envelope_bytes(&self, payload: &[u8]) -> Result<Vec<u8>, ServerError> {
        if payload.first() == Some(&b'{') {
            return Ok(payload.to_vec());
        }
        let path = String::from_utf8_lossy(payload);
        Ok(std::fs::read(path.as_ref())?)
    }

    // ── Remote protocol ─────────────────────────────────────────────────

    fn remote_server(&self, message: &Message) -> Result<(), ServerError> {
        self.record_received(message, false);
        let msg_type = RemoteMessageType::from_u8(message.msg_type)?;
        tracing::trace!("[{}] remote message {:?}", self.core.peer(), msg_type);

        match msg_type {
            RemoteMessageType::Hello => {
                let greeting = json!({
                    "name": "seekdb",
                    "version": env!("CARGO_PKG_VERSION"),
                });
                self.send_message(
                    RemoteReplyType::Greeting as u8,
                    &serde_json::to_vec(&greeting).unwrap_or_default(),
                )
            }
            RemoteMessageType::Keepalive => self.send_message(RemoteReplyType::Done as u8, b""),
            RemoteMessageType::Query => {
                let params: QueryEnvelope = parse_payload(&message.payload)?;
                let db = self
                    .ctx
                    .db_pool
                    .checkout(&[params.endpoint.clone()], DB_SPAWN)?;
                let e = params.into_query_field();
                let result = db.search(&e);
                let documents: Vec<serde_json::Value> =
                    result.documents.iter().map(|d| d.as_value()).collect();
                let reply = json!({ "matched": result.matched, "documents": documents });
                self.send_message(
                    RemoteReplyType::Results as u8,
                    &serde_json::to_vec(&reply).unwrap_or_default(),
                )
            }
            RemoteMessageType::GetDocument => {
                let params: DocRef = parse_payload(&message.payload)?;
                let db = self.ctx.db_pool.checkout(&[params.endpoint], DB_SPAWN)?;
                match db.get(&params.id) {
                    Some(doc) => self.send_message(
                        RemoteReplyType::Document as u8,
                        &serde_json::to_vec(&doc.as_value()).unwrap_or_default(),
                    ),
                    None => self.send_failure(&format!("document not found: {}", params.id)),
                }
            }
            RemoteMessageType::AddDocument => {
                let bytes = self.envelope_bytes(&message.payload)?;
                let envelope: DocEnvelope = parse_payload(&bytes)?;
                let db = self
                    .ctx
                    .db_pool
                    .checkout(&[envelope.endpoint.clone()], DB_WRITABLE | DB_SPAWN)?;
                let body = serde_json::to_vec(&envelope.body).unwrap_or_default();
                let content_type = envelope.content_type.as_deref().unwrap_or(JSON_TYPE);
                let doc = Document::from_body(&envelope.id, content_type, &body)?;
                db.writable()?.index(doc, envelope.commit)?;
                self.send_message(RemoteReplyType::Done as u8, b"")
            }
            RemoteMessageType::DeleteDocument => {
                let params: DocRef = parse_payload(&message.payload)?;
                let db = self
                    .ctx
                    .db_pool
                    .checkout(&[params.endpoint], DB_WRITABLE | DB_SPAWN)?;
                db.writable()?.delete(&params.id, params.commit)?;
                self.send_message(RemoteReplyType::Done as u8, b"")
            }
            RemoteMessageType::Commit => {
                let params: EndpointRef = parse_payload(&message.payload)?;
                let db = self
                    .ctx
                    .db_pool
                    .checkout(&[params.endpoint], DB_WRITABLE | DB_SPAWN)?;
                db.writable()?.commit();
                self.send_message(RemoteReplyType::Done as u8, b"")
            }
            RemoteMessageType::GetMetadata => {
                let params: EndpointRef = parse_payload(&message.payload)?;
                let db = self.ctx.db_pool.checkout(&[params.endpoint], DB_SPAWN)?;
                let reply = json!({ "schema": db.schema(), "stats": db.stats() });
                self.send_message(
                    RemoteReplyType::Metadata as u8,
                    &serde_json::to_vec(&reply).unwrap_or_default(),
                )
            }
        }
    }

    fn send_failure(&self, error: &str) -> Result<(), ServerError> {
        self.send_message(
            RemoteReplyType::Failure as u8,
            &serde_json::to_vec(&json!({ "error": error })).unwrap_or_default(),
        )
    }

    // ── Replication protocol ────────────────────────────────────────────

    fn replication_server(&self, message: &Message) -> Result<(), ServerError> {
        self.record_received(message, true);
        let msg_type = ReplicationMessageType::from_u8(message.msg_type)?;
        match msg_type {
            ReplicationMessageType::GetChangesets => {
                let params: ChangesetRequest = if message.payload.is_empty() {
                    ChangesetRequest::default()
                } else {
                    parse_payload(&message.payload)?
                };
                tracing::debug!(
                    "[{}] snapshotting {} from revision {}",
                    self.core.peer(),
                    params.endpoint,
                    params.from_revision
                );
                let db = self
                    .ctx
                    .db_pool
                    .checkout(&[params.endpoint.clone()], DB_SPAWN)?;

                // Snapshot the endpoint as JSON lines: a header record,
                // then one document per line.
                let mut file =
                    NamedTempFile::new_in(self.ctx.config.storage.temp_dir())?;
                let header = json!({ "endpoint": params.endpoint });
                writeln!(file, "{header}")?;
                let all = db.search(&QueryField {
                    limit: u32::MAX,
                    ..QueryField::default()
                });
                for doc in &all.documents {
                    writeln!(file, "{}", doc.as_value())?;
                }
                file.flush()?;

                self.send_file(
                    ReplicationReplyType::SnapshotFile as u8,
                    file.as_file_mut(),
                )?;
                self.send_message(ReplicationReplyType::EndOfChangesets as u8, b"")
            }
        }
    }

    fn replication_client(&self, message: &Message) -> Result<(), ServerError> {
        self.record_received(message, true);
        let msg_type = ReplicationReplyType::from_u8(message.msg_type)?;
        match msg_type {
            ReplicationReplyType::Changeset => {
                let changeset: Changeset = parse_payload(&message.payload)?;
                self.apply_documents(&changeset.endpoint, &changeset.documents)
            }
            ReplicationReplyType::SnapshotFile => {
                let bytes = self.envelope_bytes(&message.payload)?;
                let text = String::from_utf8_lossy(&bytes);
                let mut lines = text.lines();
                let header: EndpointRef = match lines.next() {
                    Some(line) => parse_payload(line.as_bytes())?,
                    None => return Ok(()),
                };
                let documents: Vec<serde_json::Value> = lines
                    .filter(|line| !line.trim().is_empty())
                    .filter_map(|line| serde_json::from_str(line).ok())
                    .collect();
                self.apply_documents(&header.endpoint, &documents)
            }
            ReplicationReplyType::EndOfChangesets => {
                tracing::debug!("[{}] replication complete", self.core.peer());
                self.core.close();
                Ok(())
            }
            ReplicationReplyType::Fail => Err(ServerError::Protocol(
                seekdb_protocol::ProtocolError::CorruptBlock("replication failed".to_string()),
            )),
        }
    }

    fn apply_documents(
        &self,
        endpoint: &str,
        documents: &[serde_json::Value],
    ) -> Result<(), ServerError> {
        let db = self
            .ctx
            .db_pool
            .checkout(&[endpoint.to_string()], DB_WRITABLE | DB_SPAWN)?;
        for value in documents {
            let id = value
                .get(seekdb_core::RESERVED_ID)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if id.is_empty() {
                continue;
            }
            let body = serde_json::to_vec(value).unwrap_or_default();
            let doc = Document::from_body(&id, JSON_TYPE, &body)?;
            db.writable()?.index(doc, false)?;
        }
        db.writable()?.commit();
        Ok(())
    }
}

fn parse_payload<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, ServerError> {
    serde_json::from_slice(payload)
        .map_err(|e| ServerError::Engine(seekdb_core::EngineError::Serialization(e.to_string())))
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EndpointRef {
    endpoint: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChangesetRequest {
    #[serde(default)]
    endpoint: String,
    #[serde(default)]
    from_revision: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct DocRef {
    endpoint: String,
    id: String,
    #[serde(default)]
    commit: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct DocEnvelope {
    endpoint: String,
    id: String,
    #[serde(default)]
    content_type: Option<String>,
    body: serde_json::Value,
    #[serde(default)]
    commit: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Changeset {
    endpoint: String,
    documents: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueryEnvelope {
    endpoint: String,
    #[serde(default)]
    query: Vec<String>,
    #[serde(default)]
    offset: u32,
    #[serde(default)]
    limit: Option<u32>,
    #[serde(default)]
    sort: Vec<String>,
}

impl QueryEnvelope {
    fn into_query_field(self) -> QueryField {
        let mut e = QueryField::default();
        e.query = self.query;
        e.offset = self.offset;
        if let Some(limit) = self.limit {
            e.limit = limit;
        }
        e.sort = self.sort;
        e
    }
}

/// One received file in flight.
struct IncomingFile {
    message_type: u8,
    temp: NamedTempFile,
}

/// The binary wire personality for one connection.
pub struct BinaryHandler {
    shared: Arc<BinaryShared>,
    decoder: MessageDecoder,
    incoming: Option<IncomingFile>,
}

impl BinaryHandler {
    pub fn new(shared: Arc<BinaryShared>) -> Self {
        BINARY_CLIENTS.fetch_add(1, Ordering::AcqRel);
        shared.ctx.metrics.binary_connections.inc();
        Self {
            shared,
            decoder: MessageDecoder::new(),
            incoming: None,
        }
    }

    fn begin_file(&mut self, message_type: u8) -> Result<(), ServerError> {
        let dir = {
            let mut guard = self.shared.temp_dir.lock();
            if guard.is_none() {
                *guard = Some(
                    tempfile::Builder::new()
                        .prefix("seekdb.")
                        .tempdir_in(self.shared.ctx.config.storage.temp_dir())?,
                );
            }
            guard
                .as_ref()
                .map(|dir| dir.path().to_path_buf())
                .unwrap_or_else(std::env::temp_dir)
        };
        let temp = tempfile::Builder::new()
            .prefix("incoming.")
            .tempfile_in(dir)?;
        tracing::debug!(
            "[{}] receiving file into {}",
            self.shared.core.peer(),
            temp.path().display()
        );
        self.incoming = Some(IncomingFile { message_type, temp });
        Ok(())
    }
}

impl StreamHandler for BinaryHandler {
    fn on_read(&mut self, data: &[u8]) -> ReadAction {
        self.decoder.extend(data);
        loop {
            match self.decoder.next() {
                Ok(Decoded::NeedMore) => return ReadAction::Continue,
                Ok(Decoded::Message { message, switched }) => {
                    if switched {
                        self.shared.set_state(ProtoState::ReplicationServer);
                        tracing::debug!(
                            "[{}] switched to replication protocol",
                            self.shared.core.peer()
                        );
                    }
                    self.shared.enqueue(message);
                }
                Ok(Decoded::FileFollows { message_type, rest }) => {
                    match self.begin_file(message_type) {
                        Ok(()) => return ReadAction::BeginFile { rest },
                        Err(e) => {
                            tracing::error!(
                                "[{}] cannot receive file: {}",
                                self.shared.core.peer(),
                                e
                            );
                            return ReadAction::Close;
                        }
                    }
                }
                Err(e) => {
                    // Protocol violation: drop without reply.
                    tracing::debug!("[{}] {}", self.shared.core.peer(), e);
                    return ReadAction::Close;
                }
            }
        }
    }

    fn on_read_file(&mut self, data: &[u8]) {
        if let Some(incoming) = self.incoming.as_mut() {
            if let Err(e) = incoming.temp.write_all(data) {
                tracing::error!("[{}] file write failed: {}", self.shared.core.peer(), e);
            }
        }
    }

    fn on_read_file_done(&mut self) -> bool {
        let mut incoming = match self.incoming.take() {
            Some(incoming) => incoming,
            None => return false,
        };
        if incoming.temp.flush().is_err() {
            return false;
        }
        let path = incoming.temp.path().to_path_buf();
        let message_type = incoming.message_type;
        // The file must outlive the handler that will read it; it is
        // deleted with the connection.
        self.shared.temp_files.lock().push(incoming.temp);
        self.shared.enqueue(Message {
            msg_type: message_type,
            payload: Bytes::from(path.display().to_string()),
        });
        true
    }
}

impl Drop for BinaryHandler {
    fn drop(&mut self) {
        let left = BINARY_CLIENTS.fetch_sub(1, Ordering::AcqRel) - 1;
        debug_assert!(left >= 0);
        self.shared.ctx.metrics.binary_connections.dec();
    }
}
