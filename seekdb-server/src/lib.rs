//! # seekdb-server
//!
//! The I/O core of seekdb: per-connection engine, HTTP and binary wire
//! personalities, bounded write queues, the worker pool request handlers
//! run on, and the manager that ties listeners and connections into one
//! lifecycle tree with two-phase shutdown.

pub mod binary;
pub mod buffer;
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod server;
pub mod worker;

pub use buffer::Buffer;
pub use config::{Config, Limits};
pub use conn::{total_clients, ConnCore, StreamHandler, BUF_SIZE, WRITE_QUEUE_SIZE};
pub use error::ServerError;
pub use manager::Manager;
pub use metrics::Metrics;
pub use pool::WorkerPool;
pub use queue::{BoundedQueue, Pop};
pub use server::{Listener, ListenerKind, ServerContext, ShutdownSignal};
pub use worker::{Attachment, Node, Roster};
