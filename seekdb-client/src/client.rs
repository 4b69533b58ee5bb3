//! Request/reply client over the remote protocol.

use crate::connection::{ClientEvent, Connection, ConnectionConfig};
use crate::error::ClientError;
use seekdb_protocol::{
    RemoteMessageType, RemoteReplyType, ReplicationReplyType, SWITCH_TO_REPL,
};
use serde_json::{json, Value};

/// Result of a [`Client::query`].
#[derive(Debug)]
pub struct QueryReply {
    pub matched: u64,
    pub documents: Vec<Value>,
}

/// High-level client for the seekdb binary port.
pub struct Client {
    conn: Connection,
}

impl Client {
    /// Connects and returns a ready client.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        let conn = Connection::connect(config).await?;
        Ok(Self { conn })
    }

    async fn request(&self, msg_type: RemoteMessageType, payload: &Value) -> Result<(u8, Value), ClientError> {
        let bytes = serde_json::to_vec(payload)?;
        self.conn.send(msg_type as u8, &bytes).await?;
        match self.conn.recv().await? {
            ClientEvent::Message(message) => {
                if message.msg_type == RemoteReplyType::Failure as u8 {
                    let detail: Value =
                        serde_json::from_slice(&message.payload).unwrap_or(Value::Null);
                    let error = detail
                        .get("error")
                        .and_then(|e| e.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    return Err(ClientError::Server(error));
                }
                let value = if message.payload.is_empty() {
                    Value::Null
                } else {
                    serde_json::from_slice(&message.payload)?
                };
                Ok((message.msg_type, value))
            }
            ClientEvent::File { .. } => Err(ClientError::UnexpectedReply(0xFD)),
        }
    }

    fn expect(reply: (u8, Value), wanted: RemoteReplyType) -> Result<Value, ClientError> {
        if reply.0 == wanted as u8 {
            Ok(reply.1)
        } else {
            Err(ClientError::UnexpectedReply(reply.0))
        }
    }

    /// Exchanges greetings; returns the server identification.
    pub async fn hello(&self) -> Result<Value, ClientError> {
        let reply = self.request(RemoteMessageType::Hello, &json!({})).await?;
        Self::expect(reply, RemoteReplyType::Greeting)
    }

    /// Indexes a document.
    pub async fn add_document(
        &self,
        endpoint: &str,
        id: &str,
        body: Value,
        commit: bool,
    ) -> Result<(), ClientError> {
        let payload = json!({
            "endpoint": endpoint,
            "id": id,
            "body": body,
            "commit": commit,
        });
        let reply = self.request(RemoteMessageType::AddDocument, &payload).await?;
        Self::expect(reply, RemoteReplyType::Done).map(|_| ())
    }

    /// Runs a query.
    pub async fn query(
        &self,
        endpoint: &str,
        query: &[&str],
    ) -> Result<QueryReply, ClientError> {
        let payload = json!({ "endpoint": endpoint, "query": query });
        let reply = self.request(RemoteMessageType::Query, &payload).await?;
        let value = Self::expect(reply, RemoteReplyType::Results)?;
        Ok(QueryReply {
            matched: value.get("matched").and_then(|m| m.as_u64()).unwrap_or(0),
            documents: value
                .get("documents")
                .and_then(|d| d.as_array())
                .cloned()
                .unwrap_or_default(),
        })
    }

    /// Fetches one document by id.
    pub async fn get_document(&self, endpoint: &str, id: &str) -> Result<Value, ClientError> {
        let payload = json!({ "endpoint": endpoint, "id": id });
        let reply = self.request(RemoteMessageType::GetDocument, &payload).await?;
        Self::expect(reply, RemoteReplyType::Document)
    }

    /// Deletes one document.
    pub async fn delete_document(
        &self,
        endpoint: &str,
        id: &str,
        commit: bool,
    ) -> Result<(), ClientError> {
        let payload = json!({ "endpoint": endpoint, "id": id, "commit": commit });
        let reply = self
            .request(RemoteMessageType::DeleteDocument, &payload)
            .await?;
        Self::expect(reply, RemoteReplyType::Done).map(|_| ())
    }

    /// Commits pending changes on an endpoint.
    pub async fn commit(&self, endpoint: &str) -> Result<(), ClientError> {
        let payload = json!({ "endpoint": endpoint });
        let reply = self.request(RemoteMessageType::Commit, &payload).await?;
        Self::expect(reply, RemoteReplyType::Done).map(|_| ())
    }

    /// Fetches schema and stats for an endpoint.
    pub async fn get_metadata(&self, endpoint: &str) -> Result<Value, ClientError> {
        let payload = json!({ "endpoint": endpoint });
        let reply = self.request(RemoteMessageType::GetMetadata, &payload).await?;
        Self::expect(reply, RemoteReplyType::Metadata)
    }

    /// Switches the connection to the replication sub-protocol and pulls
    /// the endpoint's snapshot. Returns the replicated documents.
    pub async fn replicate(&self, endpoint: &str) -> Result<Vec<Value>, ClientError> {
        let payload = serde_json::to_vec(&json!({ "endpoint": endpoint }))?;
        let frame = seekdb_protocol::encode_message(SWITCH_TO_REPL, &payload);
        self.conn.send_raw(&frame).await?;

        let mut documents = Vec::new();
        loop {
            match self.conn.recv().await? {
                ClientEvent::File {
                    message_type,
                    bytes,
                } => {
                    if message_type != ReplicationReplyType::SnapshotFile as u8 {
                        return Err(ClientError::UnexpectedReply(message_type));
                    }
                    let text = String::from_utf8_lossy(&bytes);
                    // First line is the snapshot header, then one
                    // document per line.
                    for line in text.lines().skip(1) {
                        if let Ok(value) = serde_json::from_str::<Value>(line) {
                            documents.push(value);
                        }
                    }
                }
                ClientEvent::Message(message) => {
                    let msg_type = ReplicationReplyType::from_u8(message.msg_type)?;
                    match msg_type {
                        ReplicationReplyType::EndOfChangesets => return Ok(documents),
                        ReplicationReplyType::Changeset => {
                            let value: Value = serde_json::from_slice(&message.payload)?;
                            if let Some(array) =
                                value.get("documents").and_then(|d| d.as_array())
                            {
                                documents.extend(array.iter().cloned());
                            }
                        }
                        ReplicationReplyType::SnapshotFile => {}
                        ReplicationReplyType::Fail => {
                            return Err(ClientError::Server("replication failed".to_string()))
                        }
                    }
                }
            }
        }
    }
}
