//! Plotari storage crate - conversation persistence and the two-tier
//! conversation cache.
//!
//! The durable tier is any [`ConversationStore`]; the SQLite implementation
//! keeps one JSON document per conversation keyed by (user, session).

pub mod cache;
pub mod db;
pub mod error;
pub mod migrations;
pub mod store;

pub use cache::{CacheEntry, CacheStats, ConversationCache, Persistence, Tier};
pub use db::Database;
pub use error::CacheError;
pub use store::{ConversationStore, MemoryConversationStore, SqliteConversationStore};
