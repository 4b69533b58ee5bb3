//! Per-connection engine.
//!
//! Each accepted socket gets one [`ConnCore`] (the handle worker threads
//! write through) and one driver task multiplexing three things: draining
//! the bounded write queue to the socket FIFO with partial-write advance,
//! reading socket bytes through the stream-mode machine, and async
//! wake-ups from writer threads. Writers publish into the queue first and
//! signal second, so no enqueued byte is ever stranded.
//!
//! The read side interprets bytes according to the connection's stream
//! mode: *ReadBuf* hands them to the personality, *ReadFileType* consumes
//! a codec tag, *ReadFile* walks `{<len:varint> <block>}*` feeding the
//! decompressor until the zero-length terminator.

use crate::buffer::Buffer;
use crate::queue::BoundedQueue;
use crate::worker::{Attachment, Node};
use bytes::{Bytes, BytesMut};
use seekdb_protocol::codec::{decompressor, CodecType, Decompress};
use seekdb_protocol::decode_length;
use std::io::{Seek, SeekFrom};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;

/// Socket read buffer size.
pub const BUF_SIZE: usize = 4096;

/// Default write queue capacity.
pub const WRITE_QUEUE_SIZE: usize = 10;

static TOTAL_CLIENTS: AtomicI64 = AtomicI64::new(0);

/// Connected clients across both ports.
pub fn total_clients() -> i64 {
    TOTAL_CLIENTS.load(Ordering::Acquire)
}

/// Read-side interpretation of incoming bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamMode {
    ReadBuf,
    ReadFileType,
    ReadFile,
}

/// What the personality wants after consuming buffered bytes.
pub enum ReadAction {
    /// All bytes consumed; keep reading.
    Continue,
    /// Switch to file mode; `rest` holds bytes that arrived after the
    /// announcement and belong to the file stream.
    BeginFile { rest: Bytes },
    /// Protocol violation or personality-requested teardown.
    Close,
}

/// Outcome of draining buffered file-stream bytes.
enum FileProgress {
    /// Consumed all available bytes; need more from the socket.
    NeedMore,
    /// Protocol violation or handler-requested teardown.
    Fatal,
    /// Zero-length terminator reached; file stream complete.
    Done,
}

/// A wire personality bound to one connection.
pub trait StreamHandler: Send + 'static {
    /// Buffered-mode bytes. An empty slice is a resume kick: no new
    /// socket bytes, but previously buffered input may now be
    /// processable.
    fn on_read(&mut self, data: &[u8]) -> ReadAction;

    /// A decoded run of file-stream bytes.
    fn on_read_file(&mut self, data: &[u8]);

    /// The file stream terminator arrived. Returns false to tear the
    /// connection down.
    fn on_read_file_done(&mut self) -> bool;
}

/// Shared per-connection state: the write queue and the flags the loop,
/// the personality, and worker threads coordinate through.
pub struct ConnCore {
    peer: SocketAddr,
    write_queue: BoundedQueue<Buffer>,
    wake: Notify,
    closed: AtomicBool,
    destroyed: AtomicBool,
    force_destroy: AtomicBool,
    read_paused: AtomicBool,
    resume_kick: AtomicBool,
    file_codec: CodecType,
}

impl ConnCore {
    pub fn new(peer: SocketAddr, queue_size: usize, file_codec: CodecType) -> Arc<Self> {
        Arc::new(Self {
            peer,
            write_queue: BoundedQueue::blocking(queue_size),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            force_destroy: AtomicBool::new(false),
            read_paused: AtomicBool::new(false),
            resume_kick: AtomicBool::new(false),
            file_codec,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Enqueues bytes for the socket. Returns false when the queue is
    /// finished or at capacity. Safe from any thread; the owning loop is
    /// woken through the async signal after the buffer is published.
    pub fn write(&self, bytes: impl Into<Bytes>) -> bool {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return !self.write_queue.is_finished();
        }
        if !self.write_queue.try_push(Buffer::new(0, bytes)) {
            return false;
        }
        self.wake.notify_one();
        true
    }

    /// Like [`write`](Self::write) but waits for queue space instead of
    /// failing at capacity. Only for worker threads; the loop task must
    /// never block on its own queue.
    pub(crate) fn write_blocking(&self, bytes: Bytes) -> bool {
        if bytes.is_empty() {
            return !self.write_queue.is_finished();
        }
        if !self.write_queue.push(Buffer::new(0, bytes)) {
            return false;
        }
        self.wake.notify_one();
        true
    }

    /// Streams a file through the connection's codec as a typed block
    /// stream. Returns true iff the file's declared length was consumed.
    /// Blocks for queue space, so worker threads only.
    pub fn send_file(&self, file: &mut std::fs::File) -> bool {
        let size = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(_) => return false,
        };
        if file.seek(SeekFrom::Start(0)).is_err() {
            return false;
        }
        let mut comp = seekdb_protocol::compressor(self.file_codec);
        let mut write = |bytes: &[u8]| self.write_blocking(Bytes::copy_from_slice(bytes));
        match comp.compress(file, &mut write) {
            Ok(consumed) => consumed == size,
            Err(_) => false,
        }
    }

    /// The codec used for outgoing file streams.
    pub fn file_codec(&self) -> CodecType {
        self.file_codec
    }

    /// Marks the connection closed: reads stop, queued bytes still flush,
    /// teardown follows once the queue drains.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::trace!("[{}] closed", self.peer);
        }
        self.wake.notify_one();
    }

    /// Forces teardown: the queue is finished (pending writes fail), the
    /// loop exits on its next turn.
    pub fn request_destroy(&self) {
        self.closed.store(true, Ordering::Release);
        self.force_destroy.store(true, Ordering::Release);
        self.write_queue.finish();
        self.wake.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Whether the connection still has bytes queued for the wire.
    pub fn has_pending_writes(&self) -> bool {
        !self.write_queue.is_empty()
    }

    /// Stops delivering socket bytes to the personality (used while a
    /// handler owns the request).
    pub fn pause_read(&self) {
        self.read_paused.store(true, Ordering::Release);
    }

    /// Re-arms reading and kicks the personality so input buffered before
    /// the pause gets processed.
    pub fn resume_read(&self) {
        self.read_paused.store(false, Ordering::Release);
        self.resume_kick.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    fn read_paused(&self) -> bool {
        self.read_paused.load(Ordering::Acquire)
    }

    fn take_resume_kick(&self) -> bool {
        self.resume_kick.swap(false, Ordering::AcqRel)
    }
}

impl Node for ConnCore {
    fn shutdown(&self, asap: i64, now: i64) {
        if now != 0 {
            self.request_destroy();
        } else if asap != 0 {
            self.close();
        }
    }
}

/// Spawns the driver task for an accepted socket.
pub fn spawn<H: StreamHandler>(
    stream: TcpStream,
    core: Arc<ConnCore>,
    handler: H,
    attachment: Attachment,
    kind: &'static str,
) {
    let (reader, writer) = stream.into_split();
    let driver = ConnDriver {
        core,
        handler,
        reader,
        head: WriteHead {
            writer,
            current: None,
        },
        mode: StreamMode::ReadBuf,
        decomp: None,
        file_buf: BytesMut::new(),
        block_remaining: None,
        attachment,
        kind,
    };
    TOTAL_CLIENTS.fetch_add(1, Ordering::AcqRel);
    tokio::spawn(driver.run());
}

/// Socket write half plus the buffer currently being drained. The head
/// buffer is popped out of the queue and held here until fully written.
struct WriteHead {
    writer: OwnedWriteHalf,
    current: Option<Buffer>,
}

impl WriteHead {
    async fn flush(&mut self) -> std::io::Result<usize> {
        let buf = match self.current.as_mut() {
            Some(buf) => buf,
            None => return Ok(1),
        };
        let n = self.writer.write(buf.unwritten()).await?;
        buf.advance(n);
        if buf.remaining() == 0 {
            self.current = None;
        }
        Ok(n)
    }
}

enum Event {
    Wrote(std::io::Result<usize>),
    Read(std::io::Result<usize>),
    Woke,
}

struct ConnDriver<H: StreamHandler> {
    core: Arc<ConnCore>,
    handler: H,
    reader: OwnedReadHalf,
    head: WriteHead,
    mode: StreamMode,
    decomp: Option<Box<dyn Decompress>>,
    file_buf: BytesMut,
    block_remaining: Option<u64>,
    attachment: Attachment,
    kind: &'static str,
}

impl<H: StreamHandler> ConnDriver<H> {
    async fn run(mut self) {
        let mut rbuf = [0u8; BUF_SIZE];
        loop {
            if self.core.force_destroy.load(Ordering::Acquire) {
                break;
            }
            if self.head.current.is_none() {
                self.head.current = self.core.write_queue.try_pop();
            }
            // Pending close: all enqueued bytes are on the wire, tear down.
            if self.head.current.is_none()
                && self.core.is_closed()
                && self.core.write_queue.is_empty()
            {
                break;
            }

            let can_read = !self.core.is_closed() && !self.core.read_paused();
            if can_read && self.mode == StreamMode::ReadBuf && self.core.take_resume_kick() {
                if !self.feed(Bytes::new()) {
                    break;
                }
                continue;
            }

            let has_current = self.head.current.is_some();
            let event = tokio::select! {
                biased;
                res = self.head.flush(), if has_current => Event::Wrote(res),
                res = self.reader.read(&mut rbuf), if can_read => Event::Read(res),
                _ = self.core.wake.notified() => Event::Woke,
            };

            match event {
                Event::Wrote(Ok(0)) => {
                    tracing::trace!("[{}] peer closed during write", self.core.peer);
                    break;
                }
                Event::Wrote(Ok(_)) => {}
                Event::Wrote(Err(ref e)) if retriable(e) => {}
                Event::Wrote(Err(e)) => {
                    tracing::debug!("[{}] write error: {}", self.core.peer, e);
                    break;
                }
                Event::Read(Ok(0)) => {
                    tracing::trace!("[{}] received EOF", self.core.peer);
                    break;
                }
                Event::Read(Ok(n)) => {
                    if !self.feed(Bytes::copy_from_slice(&rbuf[..n])) {
                        break;
                    }
                }
                Event::Read(Err(ref e)) if retriable(e) => {}
                Event::Read(Err(e)) => {
                    tracing::debug!("[{}] read error: {}", self.core.peer, e);
                    break;
                }
                Event::Woke => {}
            }
        }
        self.destroy();
    }

    /// Runs incoming bytes through the stream-mode machine. Modes may
    /// switch several times within one call; processing suspends only
    /// when the byte run is exhausted or a varint needs more input.
    /// Returns false to tear the connection down.
    fn feed(&mut self, data: Bytes) -> bool {
        let mut data = data;
        loop {
            match self.mode {
                StreamMode::ReadBuf => match self.handler.on_read(&data) {
                    ReadAction::Continue => return true,
                    ReadAction::Close => return false,
                    ReadAction::BeginFile { rest } => {
                        self.mode = StreamMode::ReadFileType;
                        data = rest;
                    }
                },
                StreamMode::ReadFileType => {
                    if data.is_empty() {
                        return true;
                    }
                    let tag = data[0];
                    data = data.slice(1..);
                    let codec = match CodecType::from_byte(tag) {
                        Ok(codec) => codec,
                        Err(e) => {
                            tracing::debug!("[{}] {}", self.core.peer, e);
                            return false;
                        }
                    };
                    self.decomp = Some(decompressor(codec));
                    self.file_buf.clear();
                    self.block_remaining = None;
                    self.mode = StreamMode::ReadFile;
                }
                StreamMode::ReadFile => {
                    self.file_buf.extend_from_slice(&data);
                    data = Bytes::new();
                    match self.drain_file_bytes() {
                        FileProgress::NeedMore => return true,
                        FileProgress::Fatal => return false,
                        FileProgress::Done => {
                            // Bytes after the terminator belong to
                            // buffered mode again.
                            self.mode = StreamMode::ReadBuf;
                            self.decomp = None;
                            data = self.file_buf.split().freeze();
                        }
                    }
                }
            }
        }
    }

    fn drain_file_bytes(&mut self) -> FileProgress {
        loop {
            match self.block_remaining {
                None => {
                    let decoded = match decode_length(&self.file_buf) {
                        Ok(decoded) => decoded,
                        Err(e) => {
                            tracing::debug!("[{}] bad block length: {}", self.core.peer, e);
                            return FileProgress::Fatal;
                        }
                    };
                    let (len, consumed) = match decoded {
                        Some(decoded) => decoded,
                        // Varint split across reads: keep the bytes seen.
                        None => return FileProgress::NeedMore,
                    };
                    let _ = self.file_buf.split_to(consumed);
                    if len == 0 {
                        if let Some(decomp) = self.decomp.as_mut() {
                            decomp.clear();
                        }
                        if !self.handler.on_read_file_done() {
                            return FileProgress::Fatal;
                        }
                        return FileProgress::Done;
                    }
                    self.block_remaining = Some(len);
                }
                Some(remaining) => {
                    if self.file_buf.is_empty() {
                        return FileProgress::NeedMore;
                    }
                    let take = remaining.min(self.file_buf.len() as u64) as usize;
                    let chunk = self.file_buf.split_to(take);
                    if let Some(decomp) = self.decomp.as_mut() {
                        decomp.append(&chunk);
                    }
                    let left = remaining - take as u64;
                    if left == 0 {
                        if let Some(decomp) = self.decomp.as_mut() {
                            let handler = &mut self.handler;
                            if let Err(e) = decomp.flush(&mut |bytes| handler.on_read_file(bytes))
                            {
                                tracing::debug!("[{}] decompress failed: {}", self.core.peer, e);
                                return FileProgress::Fatal;
                            }
                        }
                        self.block_remaining = None;
                    } else {
                        self.block_remaining = Some(left);
                    }
                }
            }
        }
    }

    fn destroy(&mut self) {
        if self.core.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.core.closed.store(true, Ordering::Release);
        self.core.write_queue.finish();
        while self.core.write_queue.try_pop().is_some() {}
        let total = TOTAL_CLIENTS.fetch_sub(1, Ordering::AcqRel) - 1;
        debug_assert!(total >= 0);
        self.attachment.detach();
        tracing::trace!(
            "[{}] {} connection destroyed ({} clients left)",
            self.core.peer,
            self.kind,
            total
        );
    }
}

impl<H: StreamHandler> Drop for ConnDriver<H> {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn retriable(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::Write as _;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Personality that records everything it sees and flips to file
    /// mode when the buffer starts with 0xF0.
    struct Recorder {
        reads: Arc<Mutex<Vec<Vec<u8>>>>,
        file_bytes: Arc<Mutex<Vec<u8>>>,
        files_done: Arc<Mutex<usize>>,
    }

    impl StreamHandler for Recorder {
        fn on_read(&mut self, data: &[u8]) -> ReadAction {
            if data.first() == Some(&0xF0) {
                return ReadAction::BeginFile {
                    rest: Bytes::copy_from_slice(&data[1..]),
                };
            }
            if !data.is_empty() {
                self.reads.lock().push(data.to_vec());
            }
            ReadAction::Continue
        }

        fn on_read_file(&mut self, data: &[u8]) {
            self.file_bytes.lock().extend_from_slice(data);
        }

        fn on_read_file_done(&mut self) -> bool {
            *self.files_done.lock() += 1;
            true
        }
    }

    struct Fixture {
        core: Arc<ConnCore>,
        reads: Arc<Mutex<Vec<Vec<u8>>>>,
        file_bytes: Arc<Mutex<Vec<u8>>>,
        files_done: Arc<Mutex<usize>>,
        client: std::net::TcpStream,
    }

    async fn fixture() -> Fixture {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        let core = ConnCore::new(peer, WRITE_QUEUE_SIZE, CodecType::None);
        let reads = Arc::new(Mutex::new(Vec::new()));
        let file_bytes = Arc::new(Mutex::new(Vec::new()));
        let files_done = Arc::new(Mutex::new(0));
        let handler = Recorder {
            reads: reads.clone(),
            file_bytes: file_bytes.clone(),
            files_done: files_done.clone(),
        };
        spawn(stream, core.clone(), handler, Attachment::detached(), "test");

        Fixture {
            core,
            reads,
            file_bytes,
            files_done,
            client,
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_reaches_socket_in_order() {
        use std::io::Read as _;
        let mut fx = fixture().await;

        assert!(fx.core.write(&b"hello "[..]));
        assert!(fx.core.write(&b"world"[..]));
        fx.core.close();

        let mut received = Vec::new();
        fx.client.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"hello world");
        wait_until(|| fx.core.is_destroyed()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writers_all_flush() {
        use std::io::Read as _;
        let fx = fixture().await;
        let core = fx.core.clone();

        let writers: Vec<_> = (0..5)
            .map(|i| {
                let core = core.clone();
                std::thread::spawn(move || {
                    // try_push may hit capacity; retry like a real caller.
                    let payload = Bytes::from(vec![b'a' + i as u8; 64]);
                    while !core.write(payload.clone()) {
                        std::thread::yield_now();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        core.close();

        let mut client = fx.client;
        let mut received = Vec::new();
        std::io::Read::read_to_end(&mut client, &mut received).unwrap();
        assert_eq!(received.len(), 5 * 64);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_peer_eof_destroys() {
        let fx = fixture().await;
        drop(fx.client);
        wait_until(|| fx.core.is_destroyed()).await;
        // Write after destroy fails: the queue is finished.
        assert!(!fx.core.write(&b"late"[..]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_buffered_mode_reaches_handler() {
        let mut fx = fixture().await;
        fx.client.write_all(b"some request bytes").unwrap();
        fx.client.flush().unwrap();
        wait_until(|| !fx.reads.lock().is_empty()).await;
        assert_eq!(fx.reads.lock()[0], b"some request bytes");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_file_stream_none_codec() {
        let mut fx = fixture().await;
        // 0xF0 flips the recorder into file mode; then a none-codec
        // stream carrying "ABCDE" in one block.
        fx.client.write_all(b"\xF0\x01\x05ABCDE\x00").unwrap();
        fx.client.flush().unwrap();

        wait_until(|| *fx.files_done.lock() == 1).await;
        assert_eq!(&*fx.file_bytes.lock(), b"ABCDE");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_file_stream_split_varint_and_tail() {
        let mut fx = fixture().await;
        // Two blocks of 200 bytes; each length varint is two bytes
        // (0xC8 0x01), so 7-byte writes land mid-varint. Trailing
        // "tail" bytes return to buffered mode.
        let block = vec![0x5A; 200];
        let mut wire = vec![0xF0, 0x01];
        for _ in 0..2 {
            wire.extend_from_slice(&seekdb_protocol::encode_length(200));
            wire.extend_from_slice(&block);
        }
        wire.push(0x00);
        wire.extend_from_slice(b"tail");

        // Dribble the stream in awkward chunks.
        for chunk in wire.chunks(7) {
            fx.client.write_all(chunk).unwrap();
            fx.client.flush().unwrap();
        }

        wait_until(|| *fx.files_done.lock() == 1).await;
        assert_eq!(fx.file_bytes.lock().len(), 400);
        wait_until(|| !fx.reads.lock().is_empty()).await;
        assert_eq!(fx.reads.lock()[0], b"tail");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bad_codec_byte_is_fatal() {
        let mut fx = fixture().await;
        fx.client.write_all(b"\xF0\x09").unwrap();
        fx.client.flush().unwrap();
        wait_until(|| fx.core.is_destroyed()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_now_forces_destroy() {
        let fx = fixture().await;
        assert!(fx.core.write(&b"never flushed, maybe"[..]));
        fx.core.shutdown(0, 1);
        wait_until(|| fx.core.is_destroyed()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_file_emits_typed_stream() {
        use std::io::Read as _;
        let fx = fixture().await;
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"ABCDE").unwrap();

        let core = fx.core.clone();
        let sender =
            tokio::task::spawn_blocking(move || core.send_file(&mut file));
        assert!(sender.await.unwrap());
        fx.core.close();

        let mut client = fx.client;
        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"\x01\x05ABCDE\x00");
    }
}
