//! Connection management.

use crate::error::ClientError;
use bytes::BytesMut;
use seekdb_protocol::codec::{decompressor, CodecType};
use seekdb_protocol::{decode_length, encode_message, Decoded, Message, MessageDecoder};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Socket read buffer size.
const READ_BUF_SIZE: usize = 8 * 1024;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server binary-port address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// One item received from the server.
#[derive(Debug)]
pub enum ClientEvent {
    /// A framed message.
    Message(Message),
    /// A complete received file, already de-framed and decompressed.
    File { message_type: u8, bytes: Vec<u8> },
}

struct Io {
    stream: TcpStream,
    decoder: MessageDecoder,
    rbuf: [u8; READ_BUF_SIZE],
}

/// A connection to a seekdb binary port.
pub struct Connection {
    config: ConnectionConfig,
    io: Mutex<Io>,
}

impl Connection {
    /// Connects with the configured timeout.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(config.addr))
            .await
            .map_err(|_| ClientError::Timeout)??;
        stream.set_nodelay(true)?;
        tracing::debug!("connected to {}", config.addr);
        Ok(Self {
            config,
            io: Mutex::new(Io {
                stream,
                decoder: MessageDecoder::new(),
                rbuf: [0u8; READ_BUF_SIZE],
            }),
        })
    }

    /// Sends one framed message.
    pub async fn send(&self, msg_type: u8, payload: &[u8]) -> Result<(), ClientError> {
        let frame = encode_message(msg_type, payload);
        let mut io = self.io.lock().await;
        io.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Sends a raw control byte sequence (e.g. the replication switch).
    pub async fn send_raw(&self, bytes: &[u8]) -> Result<(), ClientError> {
        let mut io = self.io.lock().await;
        io.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Receives the next message or file, honoring the request timeout.
    pub async fn recv(&self) -> Result<ClientEvent, ClientError> {
        tokio::time::timeout(self.config.request_timeout, self.recv_inner())
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    async fn recv_inner(&self) -> Result<ClientEvent, ClientError> {
        let mut io = self.io.lock().await;
        loop {
            match io.decoder.next()? {
                Decoded::Message { message, .. } => return Ok(ClientEvent::Message(message)),
                Decoded::FileFollows { message_type, rest } => {
                    let bytes = Self::read_file_stream(&mut io, &rest).await?;
                    return Ok(ClientEvent::File {
                        message_type,
                        bytes,
                    });
                }
                Decoded::NeedMore => {
                    let n = {
                        let Io { stream, rbuf, .. } = &mut *io;
                        stream.read(rbuf).await?
                    };
                    if n == 0 {
                        return Err(ClientError::Closed);
                    }
                    let chunk = io.rbuf[..n].to_vec();
                    io.decoder.extend(&chunk);
                }
            }
        }
    }

    /// Walks a `<codec>{<len><block>}*<0>` stream off the socket,
    /// returning the reassembled bytes.
    async fn read_file_stream(io: &mut Io, rest: &[u8]) -> Result<Vec<u8>, ClientError> {
        let mut pending = BytesMut::from(rest);

        // Codec tag first.
        while pending.is_empty() {
            let Io { stream, rbuf, .. } = &mut *io;
            let n = stream.read(rbuf).await?;
            if n == 0 {
                return Err(ClientError::Closed);
            }
            pending.extend_from_slice(&rbuf[..n]);
        }
        let codec = CodecType::from_byte(pending[0])?;
        let _ = pending.split_to(1);
        let mut decomp = decompressor(codec);

        let mut out = Vec::new();
        let mut block_remaining: Option<u64> = None;
        loop {
            match block_remaining {
                None => match decode_length(&pending)? {
                    Some((0, consumed)) => {
                        let _ = pending.split_to(consumed);
                        // Leftover bytes belong to the message stream.
                        io.decoder.extend(&pending);
                        return Ok(out);
                    }
                    Some((len, consumed)) => {
                        let _ = pending.split_to(consumed);
                        block_remaining = Some(len);
                    }
                    None => {
                        let Io { stream, rbuf, .. } = &mut *io;
                        let n = stream.read(rbuf).await?;
                        if n == 0 {
                            return Err(ClientError::Closed);
                        }
                        pending.extend_from_slice(&rbuf[..n]);
                    }
                },
                Some(remaining) => {
                    if pending.is_empty() {
                        let Io { stream, rbuf, .. } = &mut *io;
                        let n = stream.read(rbuf).await?;
                        if n == 0 {
                            return Err(ClientError::Closed);
                        }
                        pending.extend_from_slice(&rbuf[..n]);
                        continue;
                    }
                    let take = remaining.min(pending.len() as u64) as usize;
                    let chunk = pending.split_to(take);
                    decomp.append(&chunk);
                    let left = remaining - take as u64;
                    if left == 0 {
                        decomp
                            .flush(&mut |bytes: &[u8]| out.extend_from_slice(bytes))
                            .map_err(ClientError::Protocol)?;
                        block_remaining = None;
                    } else {
                        block_remaining = Some(left);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ConnectionConfig::new("127.0.0.1:8881".parse().unwrap())
            .with_connect_timeout(Duration::from_secs(1))
            .with_request_timeout(Duration::from_secs(2));
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert_eq!(config.request_timeout, Duration::from_secs(2));
    }
}
