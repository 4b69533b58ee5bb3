//! HTTP personality.
//!
//! Assembles HTTP/1.1 requests from buffered-mode bytes (httparse does
//! the request-line and header parsing), enforces the body limits,
//! answers `Expect: 100-continue`, and dispatches complete requests to
//! the worker pool with reading paused. The response writer builds wire
//! bytes from a mode mask, framing chunked transfers as
//! `hexlen CRLF body CRLF` with a final `0 CRLF CRLF`.

use crate::conn::{ConnCore, ReadAction, StreamHandler};
use crate::error::ServerError;
use crate::server::ServerContext;
use bytes::{Buf, BytesMut};
use seekdb_core::query::{self, QueryField};
use seekdb_core::{Document, DB_SPAWN, DB_WRITABLE, JSON_TYPE, MSGPACK_TYPE};
use serde_json::json;
use std::io::Write as _;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;

const MAX_HEADERS: usize = 64;

/// Headers larger than this without parsing to completion are refused.
const MAX_HEADER_BYTES: usize = 64 * 1024;

static HTTP_CLIENTS: AtomicI64 = AtomicI64::new(0);

/// Connected HTTP clients.
pub fn http_clients() -> i64 {
    HTTP_CLIENTS.load(Ordering::Acquire)
}

// ── Response writer ─────────────────────────────────────────────────────

/// Which pieces of a response to emit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseMode(u32);

impl ResponseMode {
    pub const STATUS: u32 = 1 << 0;
    pub const HEADER: u32 = 1 << 1;
    pub const CONTENT_TYPE: u32 = 1 << 2;
    pub const ALLOW: u32 = 1 << 3;
    pub const MATCHED_COUNT: u32 = 1 << 4;
    pub const CHUNKED: u32 = 1 << 5;
    pub const BODY: u32 = 1 << 6;
    pub const EXPECTED_100: u32 = 1 << 7;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn status(mut self) -> Self {
        self.0 |= Self::STATUS;
        self
    }

    pub fn header(mut self) -> Self {
        self.0 |= Self::HEADER;
        self
    }

    pub fn content_type(mut self) -> Self {
        self.0 |= Self::CONTENT_TYPE;
        self
    }

    pub fn allow(mut self) -> Self {
        self.0 |= Self::ALLOW;
        self
    }

    pub fn matched_count(mut self) -> Self {
        self.0 |= Self::MATCHED_COUNT;
        self
    }

    pub fn chunked(mut self) -> Self {
        self.0 |= Self::CHUNKED;
        self
    }

    pub fn body(mut self) -> Self {
        self.0 |= Self::BODY;
        self
    }

    pub fn expected_100(mut self) -> Self {
        self.0 |= Self::EXPECTED_100;
        self
    }

    pub fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

/// Reason phrase for the status codes this server emits.
pub fn status_text(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        404 => "Not Found",
        406 => "Not Acceptable",
        413 => "Request Entity Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        _ => "",
    }
}

/// Builds response bytes from a mode mask.
pub fn http_response(
    status: u16,
    mode: ResponseMode,
    matched_count: usize,
    body: &[u8],
    content_type: &str,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + body.len());

    if mode.has(ResponseMode::STATUS) {
        let _ = write!(out, "HTTP/1.1 {} {}\r\n", status, status_text(status));
        if !mode.has(ResponseMode::HEADER) {
            out.extend_from_slice(b"\r\n");
        }
    }

    if mode.has(ResponseMode::HEADER) {
        if mode.has(ResponseMode::CONTENT_TYPE) {
            let _ = write!(out, "Content-Type: {content_type}\r\n");
        }
        if mode.has(ResponseMode::ALLOW) {
            out.extend_from_slice(b"Allow: GET,HEAD,POST,PUT,PATCH,OPTIONS\r\n");
        }
        if mode.has(ResponseMode::MATCHED_COUNT) {
            let _ = write!(out, "X-Matched-count: {matched_count}\r\n");
        }
        if mode.has(ResponseMode::CHUNKED) {
            out.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        } else {
            let _ = write!(out, "Content-Length: {}\r\n", body.len());
        }
        out.extend_from_slice(b"\r\n");
    }

    if mode.has(ResponseMode::BODY) {
        if mode.has(ResponseMode::CHUNKED) {
            let _ = write!(out, "{:x}\r\n", body.len());
            out.extend_from_slice(body);
            out.extend_from_slice(b"\r\n");
        } else {
            out.extend_from_slice(body);
        }
    }

    out
}

// ── Request assembly ────────────────────────────────────────────────────

/// A fully assembled request, moved into the worker job that handles it.
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub host: String,
    pub content_type: String,
    /// `(q, media-type)` pairs in descending q order.
    pub accept: Vec<(f64, String)>,
    pub expect_100: bool,
    pub body: BodyStore,
    pub body_size: u64,
}

impl HttpRequest {
    /// The whole body, reading it back from the spill file if needed.
    pub fn body_bytes(&self) -> std::io::Result<Vec<u8>> {
        match &self.body {
            BodyStore::Mem(mem) => Ok(mem.to_vec()),
            BodyStore::Spilled(file) => std::fs::read(file.path()),
        }
    }
}

/// Where an assembled body lives.
pub enum BodyStore {
    Mem(BytesMut),
    /// Bodies past the in-memory threshold; the file unlinks itself with
    /// the request.
    Spilled(NamedTempFile),
}

enum BodyFraming {
    Length { remaining: u64 },
    Chunked(ChunkState),
}

enum ChunkState {
    Size,
    Data { remaining: u64 },
    DataCrlf,
    Trailers,
}

enum Phase {
    Headers,
    Body {
        framing: BodyFraming,
        req: Box<HttpRequest>,
    },
    Dispatched,
}

enum Step {
    NeedMore,
    Fatal,
    /// A response was already written and the connection closed.
    Refused,
    Ready {
        req: Box<HttpRequest>,
        framing: Option<BodyFraming>,
    },
    /// The body completed; the caller owns the request and dispatches it.
    BodyDone,
}

/// The HTTP wire personality for one connection.
pub struct HttpHandler {
    core: Arc<ConnCore>,
    ctx: Arc<ServerContext>,
    buf: BytesMut,
    phase: Phase,
}

impl HttpHandler {
    pub fn new(core: Arc<ConnCore>, ctx: Arc<ServerContext>) -> Self {
        HTTP_CLIENTS.fetch_add(1, Ordering::AcqRel);
        ctx.metrics.http_connections.inc();
        Self {
            core,
            ctx,
            buf: BytesMut::new(),
            phase: Phase::Headers,
        }
    }

    fn respond(&self, status: u16, mode: ResponseMode) {
        let _ = self
            .core
            .write(http_response(status, mode, 0, b"", JSON_TYPE));
    }

    fn process(&mut self) -> ReadAction {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Headers) {
                Phase::Headers => match self.parse_headers() {
                    Step::NeedMore => {
                        self.phase = Phase::Headers;
                        return ReadAction::Continue;
                    }
                    Step::Fatal => return ReadAction::Close,
                    Step::Refused => {
                        self.phase = Phase::Headers;
                        return ReadAction::Continue;
                    }
                    Step::Ready { req, framing } => match framing {
                        Some(framing) => {
                            self.phase = Phase::Body { framing, req };
                        }
                        None => {
                            if !self.dispatch(req) {
                                return ReadAction::Close;
                            }
                            self.phase = Phase::Dispatched;
                            return ReadAction::Continue;
                        }
                    },
                    Step::BodyDone => unreachable!("headers step cannot finish a body"),
                },
                Phase::Body { mut framing, req } => {
                    let mut req = req;
                    match self.consume_body(&mut framing, &mut req) {
                        Step::NeedMore => {
                            self.phase = Phase::Body { framing, req };
                            return ReadAction::Continue;
                        }
                        Step::Fatal => return ReadAction::Close,
                        Step::Refused => {
                            self.phase = Phase::Headers;
                            return ReadAction::Continue;
                        }
                        Step::BodyDone => {
                            if !self.dispatch(req) {
                                return ReadAction::Close;
                            }
                            self.phase = Phase::Dispatched;
                            return ReadAction::Continue;
                        }
                        Step::Ready { .. } => unreachable!("body step cannot produce headers"),
                    }
                }
                Phase::Dispatched => {
                    // A handler owns the connection; leave any pipelined
                    // bytes buffered until the resume kick.
                    self.phase = Phase::Dispatched;
                    return ReadAction::Continue;
                }
            }
        }
    }

    fn parse_headers(&mut self) -> Step {
        if self.buf.is_empty() {
            return Step::NeedMore;
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        let status = match parsed.parse(&self.buf) {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!("[{}] unparsable request: {}", self.core.peer(), e);
                return Step::Fatal;
            }
        };
        let header_len = match status {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => {
                if self.buf.len() > MAX_HEADER_BYTES {
                    tracing::debug!("[{}] header block too large", self.core.peer());
                    return Step::Fatal;
                }
                return Step::NeedMore;
            }
        };

        let method = parsed.method.unwrap_or("").to_string();
        let path = parsed.path.unwrap_or("").to_string();

        let mut host = String::new();
        let mut content_type = String::new();
        let mut content_length: Option<u64> = None;
        let mut accept = Vec::new();
        let mut expect_100 = false;
        let mut chunked = false;
        for header in parsed.headers.iter() {
            let value = String::from_utf8_lossy(header.value);
            if header.name.eq_ignore_ascii_case("host") {
                host = value.trim().to_string();
            } else if header.name.eq_ignore_ascii_case("expect") {
                expect_100 = value.trim().eq_ignore_ascii_case("100-continue");
            } else if header.name.eq_ignore_ascii_case("content-type") {
                content_type = value.trim().to_ascii_lowercase();
            } else if header.name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().ok();
            } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
                chunked = value.to_ascii_lowercase().contains("chunked");
            } else if header.name.eq_ignore_ascii_case("accept") {
                accept = parse_accept(&value);
            }
        }
        self.buf.advance(header_len);

        // Declared length past the hard limit: refuse before reading any
        // body byte, whether or not the client asked for 100-continue.
        let max_body = self.ctx.config.limits.max_body_size;
        if content_length.is_some_and(|len| len > max_body) {
            self.respond(413, ResponseMode::new().status().header().body());
            self.core.close();
            return Step::Refused;
        }
        if expect_100 {
            self.respond(100, ResponseMode::new().status().expected_100());
        }

        let req = Box::new(HttpRequest {
            method,
            path,
            host,
            content_type,
            accept,
            expect_100,
            body: BodyStore::Mem(BytesMut::new()),
            body_size: 0,
        });

        let framing = if chunked {
            Some(BodyFraming::Chunked(ChunkState::Size))
        } else {
            match content_length {
                Some(len) if len > 0 => Some(BodyFraming::Length { remaining: len }),
                _ => None,
            }
        };
        Step::Ready { req, framing }
    }

    fn consume_body(&mut self, framing: &mut BodyFraming, req: &mut HttpRequest) -> Step {
        loop {
            match framing {
                BodyFraming::Length { remaining } => {
                    if *remaining == 0 {
                        return Step::BodyDone;
                    }
                    if self.buf.is_empty() {
                        return Step::NeedMore;
                    }
                    let take = (*remaining).min(self.buf.len() as u64) as usize;
                    let chunk = self.buf.split_to(take);
                    match self.append_body(req, &chunk) {
                        Ok(()) => {}
                        Err(step) => return step,
                    }
                    *remaining -= take as u64;
                }
                BodyFraming::Chunked(state) => match state {
                    ChunkState::Size => {
                        let line_end = match find_crlf(&self.buf) {
                            Some(pos) => pos,
                            None => return Step::NeedMore,
                        };
                        let line = self.buf.split_to(line_end + 2);
                        let size_text = String::from_utf8_lossy(&line[..line_end]);
                        let size_text = size_text.split(';').next().unwrap_or("").trim();
                        let size = match u64::from_str_radix(size_text, 16) {
                            Ok(size) => size,
                            Err(_) => {
                                tracing::debug!("[{}] bad chunk size", self.core.peer());
                                return Step::Fatal;
                            }
                        };
                        *state = if size == 0 {
                            ChunkState::Trailers
                        } else {
                            ChunkState::Data { remaining: size }
                        };
                    }
                    ChunkState::Data { remaining } => {
                        if self.buf.is_empty() {
                            return Step::NeedMore;
                        }
                        let take = (*remaining).min(self.buf.len() as u64) as usize;
                        let chunk = self.buf.split_to(take);
                        match self.append_body(req, &chunk) {
                            Ok(()) => {}
                            Err(step) => return step,
                        }
                        *remaining -= take as u64;
                        if *remaining == 0 {
                            *state = ChunkState::DataCrlf;
                        }
                    }
                    ChunkState::DataCrlf => {
                        if self.buf.len() < 2 {
                            return Step::NeedMore;
                        }
                        let crlf = self.buf.split_to(2);
                        if &crlf[..] != b"\r\n" {
                            return Step::Fatal;
                        }
                        *state = ChunkState::Size;
                    }
                    ChunkState::Trailers => {
                        let line_end = match find_crlf(&self.buf) {
                            Some(pos) => pos,
                            None => return Step::NeedMore,
                        };
                        let _ = self.buf.split_to(line_end + 2);
                        if line_end == 0 {
                            return Step::BodyDone;
                        }
                    }
                },
            }
        }
    }

    fn append_body(&self, req: &mut HttpRequest, chunk: &[u8]) -> Result<(), Step> {
        let limits = &self.ctx.config.limits;
        req.body_size += chunk.len() as u64;

        if req.body_size > limits.max_body_size {
            self.respond(413, ResponseMode::new().status().header().body());
            self.core.close();
            return Err(Step::Refused);
        }

        if matches!(req.body, BodyStore::Mem(_)) && req.body_size > limits.max_body_mem {
            if limits.reject_spilled_bodies {
                self.respond(413, ResponseMode::new().status().header().body());
                self.core.close();
                return Err(Step::Refused);
            }
            let mut file = match NamedTempFile::new_in(self.ctx.config.storage.temp_dir()) {
                Ok(file) => file,
                Err(e) => {
                    tracing::error!("[{}] cannot spill body: {}", self.core.peer(), e);
                    return Err(Step::Fatal);
                }
            };
            if let BodyStore::Mem(mem) = &req.body {
                if file.write_all(mem).is_err() {
                    return Err(Step::Fatal);
                }
            }
            req.body = BodyStore::Spilled(file);
        }

        match &mut req.body {
            BodyStore::Mem(mem) => mem.extend_from_slice(chunk),
            BodyStore::Spilled(file) => {
                if file.write_all(chunk).is_err() {
                    tracing::error!("[{}] body spill write failed", self.core.peer());
                    return Err(Step::Fatal);
                }
            }
        }
        Ok(())
    }

    /// Hands the request to the worker pool with reading paused. Returns
    /// false on a pool refusal, which escalates to the manager.
    fn dispatch(&mut self, req: Box<HttpRequest>) -> bool {
        self.core.pause_read();
        let core = self.core.clone();
        let ctx = self.ctx.clone();
        if !self.ctx.workers.spawn(move || run_request(ctx, core, *req)) {
            tracing::error!("[{}] worker pool refused request", self.core.peer());
            self.ctx.fatal();
            return false;
        }
        true
    }
}

impl StreamHandler for HttpHandler {
    fn on_read(&mut self, data: &[u8]) -> ReadAction {
        if data.is_empty() {
            // Resume kick after a completed response: the previous
            // request's handler is done, pipelined bytes may follow.
            if matches!(self.phase, Phase::Dispatched) {
                self.phase = Phase::Headers;
            }
        } else {
            self.buf.extend_from_slice(data);
        }
        self.process()
    }

    fn on_read_file(&mut self, _data: &[u8]) {
        tracing::error!("[{}] unexpected file stream on HTTP port", self.core.peer());
    }

    fn on_read_file_done(&mut self) -> bool {
        false
    }
}

impl Drop for HttpHandler {
    fn drop(&mut self) {
        let left = HTTP_CLIENTS.fetch_sub(1, Ordering::AcqRel) - 1;
        debug_assert!(left >= 0);
        self.ctx.metrics.http_connections.dec();
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}

/// Parses an Accept header into `(q, media-type)` pairs, highest q first.
pub fn parse_accept(value: &str) -> Vec<(f64, String)> {
    let mut accept = Vec::new();
    for part in value.split(',') {
        let mut pieces = part.split(';');
        let media = match pieces.next() {
            Some(media) => media.trim().to_ascii_lowercase(),
            None => continue,
        };
        if media.is_empty() {
            continue;
        }
        let mut q = 1.0f64;
        for param in pieces {
            if let Some(qvalue) = param.trim().strip_prefix("q=") {
                q = qvalue.parse().unwrap_or(1.0);
            }
        }
        accept.push((q, media));
    }
    accept.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    accept
}

/// Percent-decodes a URL component, treating `+` as space.
pub fn urldecode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3);
                match hex.and_then(|h| u8::from_str_radix(&String::from_utf8_lossy(h), 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ── Routing ─────────────────────────────────────────────────────────────

/// The command drawn from the final path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Search,
    Facets,
    Stats,
    Schema,
    Upload,
    Metrics,
    Quit,
    Id(String),
    BadQuery,
}

/// A parsed request target: `[@node][namespace/]path/command[?query]`.
#[derive(Debug)]
pub struct Target {
    pub node: Option<String>,
    pub endpoints: Vec<String>,
    pub command: Command,
    pub query: Vec<(String, String)>,
}

/// Splits the request path into endpoint, command, and query pairs.
pub fn parse_target(path: &str) -> Target {
    let (path_part, query_part) = match path.split_once('?') {
        Some((path_part, query_part)) => (path_part, query_part),
        None => (path, ""),
    };

    let query: Vec<(String, String)> = query_part
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (urldecode(key), urldecode(value)),
            None => (urldecode(pair), String::new()),
        })
        .collect();

    let mut segments: Vec<String> = path_part
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(urldecode)
        .collect();

    let node = if segments.first().is_some_and(|s| s.starts_with('@')) {
        Some(segments.remove(0)[1..].to_string())
    } else {
        None
    };

    let command_text = match segments.pop() {
        Some(command) => command,
        None => {
            return Target {
                node,
                endpoints: Vec::new(),
                command: Command::BadQuery,
                query,
            }
        }
    };
    let index_path = segments.join("/");

    let command = match command_text.as_str() {
        "_search" => Command::Search,
        "_facets" => Command::Facets,
        "_stats" => Command::Stats,
        "_schema" => Command::Schema,
        "_upload" => Command::Upload,
        "_metrics" if index_path.is_empty() => Command::Metrics,
        "quit" if index_path.is_empty() => Command::Quit,
        _ if index_path.is_empty() => Command::BadQuery,
        _ => Command::Id(command_text),
    };

    let endpoints = if index_path.is_empty() {
        Vec::new()
    } else {
        vec![index_path]
    };

    Target {
        node,
        endpoints,
        command,
        query,
    }
}

fn parse_bool(value: &str) -> bool {
    value.starts_with('t') || value.starts_with('T') || value == "1"
}

/// Builds the query-field set for a command from the raw query pairs.
pub fn build_query_field(command: &Command, pairs: &[(String, String)]) -> QueryField {
    let mut e = match command {
        Command::Id(id) if query::is_range(id) => QueryField::id_range(),
        Command::Id(_) => QueryField::unique_doc(),
        _ => QueryField::default(),
    };

    for (key, value) in pairs {
        match key.as_str() {
            "pretty" => e.pretty = parse_bool(value),
            "commit" => e.commit = parse_bool(value),
            _ => {}
        }
    }

    let searchish = matches!(command, Command::Search | Command::Facets)
        || matches!(command, Command::Id(id) if query::is_range(id));
    if searchish {
        for (key, value) in pairs {
            match key.as_str() {
                "offset" => e.offset = value.parse().unwrap_or(e.offset),
                "limit" => e.limit = value.parse().unwrap_or(e.limit),
                "check_at_least" => e.check_at_least = value.parse().unwrap_or(0),
                "collapse" => e.collapse = Some(value.clone()),
                "collapse_max" => e.collapse_max = value.parse().unwrap_or(1),
                "spelling" => e.spelling = parse_bool(value),
                "synonyms" => e.synonyms = parse_bool(value),
                "query" | "q" => e.query.push(value.clone()),
                "partial" => e.partial.push(value.clone()),
                "terms" => e.terms.push(value.clone()),
                "sort" => e.sort.push(value.clone()),
                "facets" => e.facets.push(value.clone()),
                "language" => e.language.push(value.clone()),
                "fuzzy" => e.fuzzy.enabled = parse_bool(value),
                "nearest" => e.nearest.enabled = parse_bool(value),
                _ => {}
            }
        }
        if e.fuzzy.enabled {
            for (key, value) in pairs {
                match key.as_str() {
                    "fuzzy.n_rset" => e.fuzzy.n_rset = value.parse().unwrap_or(5),
                    "fuzzy.n_eset" => e.fuzzy.n_eset = value.parse().unwrap_or(0),
                    "fuzzy.n_term" => e.fuzzy.n_term = value.parse().unwrap_or(0),
                    "fuzzy.field" => e.fuzzy.field.push(value.clone()),
                    "fuzzy.type" => e.fuzzy.types.push(value.clone()),
                    _ => {}
                }
            }
        }
        if e.nearest.enabled {
            for (key, value) in pairs {
                match key.as_str() {
                    "nearest.n_rset" => e.nearest.n_rset = value.parse().unwrap_or(5),
                    "nearest.n_eset" => e.nearest.n_eset = value.parse().unwrap_or(0),
                    "nearest.n_term" => e.nearest.n_term = value.parse().unwrap_or(0),
                    "nearest.field" => e.nearest.field.push(value.clone()),
                    "nearest.type" => e.nearest.types.push(value.clone()),
                    _ => {}
                }
            }
        }
    } else if matches!(command, Command::Stats) {
        for (key, value) in pairs {
            match key.as_str() {
                "server" => e.server = parse_bool(value),
                "database" => e.database = parse_bool(value),
                "document" => e.document = value.clone(),
                "stats" => e.stats = value.clone(),
                _ => {}
            }
        }
    }

    e
}

// ── Worker-side request handling ────────────────────────────────────────

struct Turn {
    ctx: Arc<ServerContext>,
    core: Arc<ConnCore>,
    req: HttpRequest,
    wrote: bool,
}

/// Runs one request on a worker thread and re-arms reading afterwards.
fn run_request(ctx: Arc<ServerContext>, core: Arc<ConnCore>, req: HttpRequest) {
    let mut turn = Turn {
        ctx,
        core,
        req,
        wrote: false,
    };

    if let Err(e) = turn.route() {
        tracing::debug!("[{}] request failed: {}", turn.core.peer(), e);
        turn.ctx
            .metrics
            .errors_total
            .with_label_values(&["http"])
            .inc();
        if turn.wrote {
            // Bytes already on the wire; the response cannot be fixed up.
            turn.core.request_destroy();
        } else {
            let body = error_body(&e);
            turn.write_response(
                e.http_status(),
                ResponseMode::new().status().header().content_type().body(),
                0,
                &body,
                JSON_TYPE,
            );
        }
    }

    if !turn.core.is_closed() {
        turn.core.resume_read();
    }
}

fn error_body(e: &ServerError) -> Vec<u8> {
    let mut body = serde_json::to_vec(&json!({ "error": e.to_string() })).unwrap_or_default();
    body.extend_from_slice(b"\n\n");
    body
}

impl Turn {
    fn write_response(
        &mut self,
        status: u16,
        mode: ResponseMode,
        matched: usize,
        body: &[u8],
        content_type: &str,
    ) -> bool {
        self.wrote = true;
        self.core
            .write_blocking(http_response(status, mode, matched, body, content_type).into())
    }

    fn simple(&mut self, status: u16, value: serde_json::Value, pretty: bool) -> bool {
        let mut body = if pretty {
            serde_json::to_vec_pretty(&value).unwrap_or_default()
        } else {
            serde_json::to_vec(&value).unwrap_or_default()
        };
        body.extend_from_slice(b"\n\n");
        self.write_response(
            status,
            ResponseMode::new().status().header().content_type().body(),
            0,
            &body,
            JSON_TYPE,
        )
    }

    fn route(&mut self) -> Result<(), ServerError> {
        let method = self.req.method.clone();

        if method == "OPTIONS" {
            self.write_response(
                200,
                ResponseMode::new().status().header().allow(),
                0,
                b"",
                JSON_TYPE,
            );
            return Ok(());
        }

        let target = parse_target(&self.req.path);
        let label = match &target.command {
            Command::Id(_) => "id",
            Command::Search => "_search",
            Command::Facets => "_facets",
            Command::Stats => "_stats",
            Command::Schema => "_schema",
            Command::Upload => "_upload",
            Command::Metrics => "_metrics",
            Command::Quit => "quit",
            Command::BadQuery => "bad",
        };
        self.ctx
            .metrics
            .http_requests_total
            .with_label_values(&[label])
            .inc();

        let e = build_query_field(&target.command, &target.query);

        match (method.as_str(), &target.command) {
            (_, Command::Quit) => {
                self.simple(200, json!({ "quit": true }), e.pretty);
                self.ctx.shutdown_asap();
                Ok(())
            }
            ("GET", Command::Metrics) => {
                let text = self.ctx.metrics.render();
                self.write_response(
                    200,
                    ResponseMode::new().status().header().content_type().body(),
                    0,
                    text.as_bytes(),
                    "text/plain; version=0.0.4",
                );
                Ok(())
            }
            ("GET" | "POST", Command::Search) => self.search_view(&target, e, false, false),
            ("GET" | "POST", Command::Facets) => self.search_view(&target, e, true, false),
            ("GET" | "POST", Command::Schema) => self.search_view(&target, e, false, true),
            ("GET" | "POST", Command::Stats) => self.stats_view(&target, e),
            ("POST", Command::Upload) => self.upload_view(&target, e),
            ("GET" | "POST", Command::Id(id)) => {
                let id = id.clone();
                let mut e = e;
                e.query.push(format!("{}:{}", seekdb_core::RESERVED_ID, id));
                self.search_view(&target, e, false, false)
            }
            ("PUT", Command::Id(id)) => self.index_document_view(&target, e, &id.clone()),
            ("PATCH", Command::Id(id)) => self.update_document_view(&target, e, &id.clone()),
            ("DELETE", Command::Id(id)) => self.delete_document_view(&target, e, &id.clone()),
            ("HEAD", Command::Id(id)) => self.document_info_view(&target, e, &id.clone()),
            ("GET" | "POST" | "PUT" | "PATCH" | "DELETE" | "HEAD", _) => {
                self.bad_request_view(&target, e)
            }
            _ => {
                self.write_response(
                    501,
                    ResponseMode::new().status().header().body(),
                    0,
                    b"",
                    JSON_TYPE,
                );
                Ok(())
            }
        }
    }

    fn bad_request_view(&mut self, target: &Target, e: QueryField) -> Result<(), ServerError> {
        let message = match (&target.command, target.endpoints.is_empty()) {
            (Command::BadQuery, _) => "bad query",
            (_, true) => "unknown endpoint",
            _ => "bad query",
        };
        self.simple(400, json!({ "error": message }), e.pretty);
        Ok(())
    }

    fn search_view(
        &mut self,
        target: &Target,
        e: QueryField,
        facets: bool,
        schema: bool,
    ) -> Result<(), ServerError> {
        let db = self.ctx.db_pool.checkout(&target.endpoints, DB_SPAWN)?;

        if schema {
            let value = db.schema();
            self.simple(200, value, e.pretty);
            return Ok(());
        }

        if facets {
            let value = db.facets(&e);
            self.simple(200, value, e.pretty);
            return Ok(());
        }

        let result = db.search(&e);

        if result.documents.is_empty() {
            let (status, message) = if e.unique_doc {
                (404, "no document found")
            } else {
                (200, "no match found")
            };
            let mut body =
                serde_json::to_vec(&json!({ "message": message })).unwrap_or_default();
            body.extend_from_slice(b"\n\n");
            self.write_response(
                status,
                ResponseMode::new()
                    .status()
                    .header()
                    .content_type()
                    .matched_count()
                    .body(),
                result.matched,
                &body,
                JSON_TYPE,
            );
            return Ok(());
        }

        let single = e.unique_doc && result.documents.len() == 1;
        if single {
            let doc = &result.documents[0];
            match negotiate(&self.req.accept, doc) {
                Some((body, content_type)) => {
                    let body = finish_body(body, &content_type, e.pretty, doc)?;
                    self.write_response(
                        200,
                        ResponseMode::new().status().header().content_type().body(),
                        0,
                        &body,
                        &content_type,
                    );
                }
                None => {
                    let mut body = serde_json::to_vec(&json!({
                        "error": format!(
                            "response type {} not provided in the accept header",
                            doc.content_type
                        )
                    }))
                    .unwrap_or_default();
                    body.extend_from_slice(b"\n\n");
                    self.write_response(
                        406,
                        ResponseMode::new().status().header().content_type().body(),
                        0,
                        &body,
                        JSON_TYPE,
                    );
                }
            }
            return Ok(());
        }

        // Multi-result: stream documents as one chunked response.
        self.write_response(
            200,
            ResponseMode::new()
                .status()
                .header()
                .content_type()
                .chunked()
                .matched_count(),
            result.matched,
            b"",
            JSON_TYPE,
        );
        for doc in &result.documents {
            let body = match doc.to_json(e.pretty) {
                Ok(body) => body,
                Err(_) => continue,
            };
            if !self.write_response(
                200,
                ResponseMode::new().body().chunked(),
                0,
                &body,
                JSON_TYPE,
            ) {
                break;
            }
        }
        self.write_response(
            0,
            ResponseMode::new().body(),
            0,
            b"0\r\n\r\n",
            JSON_TYPE,
        );
        Ok(())
    }

    fn document_info_view(
        &mut self,
        target: &Target,
        e: QueryField,
        id: &str,
    ) -> Result<(), ServerError> {
        let db = self.ctx.db_pool.checkout(&target.endpoints, DB_SPAWN)?;
        match db.get(id) {
            Some(doc) => self.simple(200, json!({ "_id": doc.id }), e.pretty),
            None => self.simple(404, json!({ "message": "document not found" }), e.pretty),
        };
        Ok(())
    }

    fn index_document_view(
        &mut self,
        target: &Target,
        e: QueryField,
        id: &str,
    ) -> Result<(), ServerError> {
        let db = self
            .ctx
            .db_pool
            .checkout(&target.endpoints, DB_WRITABLE | DB_SPAWN)?;
        let content_type = if self.req.content_type.is_empty() {
            JSON_TYPE
        } else {
            &self.req.content_type
        };
        let body = self.req.body_bytes()?;
        let doc = Document::from_body(id, content_type, &body)?;
        let created = db.get(id).is_none();
        db.writable()?.index(doc, e.commit)?;
        let status = if created { 201 } else { 200 };
        self.simple(
            status,
            json!({ "index": { "_id": id, "commit": e.commit } }),
            e.pretty,
        );
        Ok(())
    }

    fn update_document_view(
        &mut self,
        target: &Target,
        e: QueryField,
        id: &str,
    ) -> Result<(), ServerError> {
        let db = self
            .ctx
            .db_pool
            .checkout(&target.endpoints, DB_WRITABLE | DB_SPAWN)?;
        let body = self.req.body_bytes()?;
        let patch = Document::from_body(id, JSON_TYPE, &body)?;
        db.writable()?.patch(id, &patch, e.commit)?;
        self.simple(
            200,
            json!({ "update": { "_id": id, "commit": e.commit } }),
            e.pretty,
        );
        Ok(())
    }

    fn delete_document_view(
        &mut self,
        target: &Target,
        e: QueryField,
        id: &str,
    ) -> Result<(), ServerError> {
        let db = self
            .ctx
            .db_pool
            .checkout(&target.endpoints, DB_WRITABLE | DB_SPAWN)?;
        db.writable()?.delete(id, e.commit)?;
        self.simple(
            200,
            json!({ "delete": { "_id": id, "commit": e.commit } }),
            e.pretty,
        );
        Ok(())
    }

    fn upload_view(&mut self, target: &Target, e: QueryField) -> Result<(), ServerError> {
        let _db = self.ctx.db_pool.checkout(&target.endpoints, DB_SPAWN)?;
        tracing::debug!(
            "[{}] uploaded {} bytes",
            self.core.peer(),
            self.req.body_size
        );
        self.simple(200, json!({ "received": self.req.body_size }), e.pretty);
        Ok(())
    }

    fn stats_view(&mut self, target: &Target, e: QueryField) -> Result<(), ServerError> {
        let mut value = serde_json::Map::new();

        if e.server {
            value.insert("server".to_string(), self.ctx.server_status());
        }
        if e.database {
            let db = self.ctx.db_pool.checkout(&target.endpoints, DB_SPAWN)?;
            value.insert("database".to_string(), db.stats());
        }
        if !e.document.is_empty() {
            let db = self.ctx.db_pool.checkout(&target.endpoints, DB_SPAWN)?;
            let found = db.get(&e.document).is_some();
            value.insert(
                "document".to_string(),
                json!({ "_id": e.document, "found": found }),
            );
        }
        if !e.stats.is_empty() {
            value.insert(
                "stats".to_string(),
                json!({ "period": e.stats, "uptime_secs": self.ctx.uptime_secs() }),
            );
        }
        if value.is_empty() {
            let db = self.ctx.db_pool.checkout(&target.endpoints, DB_SPAWN)?;
            value.insert("database".to_string(), db.stats());
        }

        self.simple(200, serde_json::Value::Object(value), e.pretty);
        Ok(())
    }
}

/// Picks the response representation for a document from the q-ordered
/// accept set. Returns `None` when nothing matches (a 406).
pub fn negotiate(
    accept: &[(f64, String)],
    doc: &Document,
) -> Option<(Vec<u8>, String)> {
    let default = [(1.0, String::from("*/*"))];
    let accept: &[(f64, String)] = if accept.is_empty() { &default } else { accept };

    for (_, media) in accept {
        let wildcard = media == "*/*";
        if doc.is_map() {
            // Map documents serialize to whichever of json/msgpack the
            // client ranked first; a wildcard means json.
            if wildcard || media == JSON_TYPE {
                return Some((Vec::new(), JSON_TYPE.to_string()));
            }
            if media == MSGPACK_TYPE {
                return Some((doc.to_msgpack().ok()?, MSGPACK_TYPE.to_string()));
            }
        } else if wildcard || *media == doc.content_type {
            return Some((doc.blob().map(|b| b.to_vec())?, doc.content_type.clone()));
        }
    }
    None
}

/// Serializes the negotiated body; JSON bodies are rendered here so
/// `pretty` can apply.
fn finish_body(
    body: Vec<u8>,
    content_type: &str,
    pretty: bool,
    doc: &Document,
) -> Result<Vec<u8>, ServerError> {
    if content_type == JSON_TYPE && body.is_empty() {
        Ok(doc.to_json(pretty).map_err(ServerError::Engine)?)
    } else {
        Ok(body)
    }
}
