//! Document model.

use crate::error::EngineError;
use crate::{JSON_TYPE, MSGPACK_TYPE};
use serde_json::{Map, Value};

/// Stored document contents: either a structured map, which can be
/// re-serialized to whatever the client negotiated, or an opaque blob kept
/// with the content type it arrived under.
#[derive(Debug, Clone, PartialEq)]
pub enum DocData {
    Map(Map<String, Value>),
    Blob(Vec<u8>),
}

/// An indexed document.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub content_type: String,
    pub data: DocData,
}

impl Document {
    /// Builds a document from raw body bytes. JSON and msgpack bodies that
    /// decode to a map become [`DocData::Map`]; everything else is stored
    /// as a blob under its declared content type.
    pub fn from_body(
        id: impl Into<String>,
        content_type: &str,
        body: &[u8],
    ) -> Result<Self, EngineError> {
        let id = id.into();
        let ct = content_type
            .split(';')
            .next()
            .unwrap_or(content_type)
            .trim()
            .to_ascii_lowercase();
        let data = match ct.as_str() {
            JSON_TYPE => match serde_json::from_slice::<Value>(body) {
                Ok(Value::Object(map)) => DocData::Map(map),
                Ok(_) => return Err(EngineError::InvalidDocument("JSON body is not a map".into())),
                Err(e) => return Err(EngineError::InvalidDocument(e.to_string())),
            },
            MSGPACK_TYPE => match rmp_serde::from_slice::<Value>(body) {
                Ok(Value::Object(map)) => DocData::Map(map),
                _ => DocData::Blob(body.to_vec()),
            },
            _ => DocData::Blob(body.to_vec()),
        };
        Ok(Self {
            id,
            content_type: ct,
            data,
        })
    }

    /// Whether the stored data is a structured map.
    pub fn is_map(&self) -> bool {
        matches!(self.data, DocData::Map(_))
    }

    /// Map view of the document including its reserved id field.
    pub fn as_value(&self) -> Value {
        match &self.data {
            DocData::Map(map) => {
                let mut map = map.clone();
                map.insert(crate::RESERVED_ID.into(), Value::String(self.id.clone()));
                Value::Object(map)
            }
            DocData::Blob(_) => Value::Null,
        }
    }

    /// Serializes a map document as JSON.
    pub fn to_json(&self, pretty: bool) -> Result<Vec<u8>, EngineError> {
        let value = self.as_value();
        let mut out = if pretty {
            serde_json::to_vec_pretty(&value)?
        } else {
            serde_json::to_vec(&value)?
        };
        out.extend_from_slice(b"\n\n");
        Ok(out)
    }

    /// Serializes a map document as msgpack.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, EngineError> {
        Ok(rmp_serde::to_vec_named(&self.as_value())?)
    }

    /// The stored blob for non-map documents.
    pub fn blob(&self) -> Option<&[u8]> {
        match &self.data {
            DocData::Blob(blob) => Some(blob),
            DocData::Map(_) => None,
        }
    }
}
