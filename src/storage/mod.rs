//! Durable storage backing the overflow queue.

pub mod sqlite;

pub use sqlite::SqliteQueueStore;
