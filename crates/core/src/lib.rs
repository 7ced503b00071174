//! Meldestelle sync core library.
//!
//! Client-side delta synchronization: a cursor-based coordinator pulls new
//! entities from a remote endpoint and upserts them into a local SQLite
//! store, either in-process or through a storage worker reached over a
//! message-passing RPC protocol.

pub mod adapters;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod models;
pub mod remote;
pub mod repository;
pub mod rpc;
pub mod storage;
pub mod sync_engine;

// Re-exports for convenience.
pub use adapters::PingEventRepository;
pub use config::AppConfig;
pub use coordinator::SyncCoordinator;
pub use errors::CoreError;
pub use models::{CursorToken, PingEvent, SyncReport, Syncable};
pub use remote::{Endpoint, HttpRemote, RemoteSource};
pub use repository::LocalRepository;
pub use storage::{StorageDriver, StorageHandle};
pub use sync_engine::SyncEngine;
