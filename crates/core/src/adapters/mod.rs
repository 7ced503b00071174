//! Entity adapters: one [`LocalRepository`](crate::repository::LocalRepository)
//! implementation per synchronizable table.

pub mod ping;

pub use ping::PingEventRepository;
