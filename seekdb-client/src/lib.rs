//! # seekdb-client
//!
//! Client for the seekdb binary port: typed message send/receive, file
//! reception through a codec session, and a request/reply wrapper over
//! the remote protocol.

pub mod client;
pub mod connection;
pub mod error;

pub use client::{Client, QueryReply};
pub use connection::{ClientEvent, Connection, ConnectionConfig};
pub use error::ClientError;
