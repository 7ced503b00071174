//! Message-passing RPC between the host side and the storage worker.
//!
//! The worker ([`host::WorkerHost`]) runs on a dedicated thread, owns the
//! database connection and serves requests FIFO. The host side
//! ([`client::WorkerClient`]) tags each request with a unique id and matches
//! asynchronous responses back to their callers.

pub mod client;
pub mod host;
pub mod protocol;

pub use client::WorkerClient;
pub use host::{spawn_worker, Backing, WorkerHost};
pub use protocol::{RequestId, WorkerAction, WorkerRequest, WorkerResponse};
