pub mod config;
pub mod embedding;
pub mod storage;
pub mod worker;

use std::path::PathBuf;

pub use config::EmbeddingClientConfig;
pub use embedding::{EmbeddingClient, EmbeddingClientBuilder, EmbeddingOutcome, PendingEmbedding};
pub use worker::{EmbedError, QueueError};

/// Per-user data directory holding run dirs and overflow queues.
pub fn default_data_dir() -> PathBuf {
    match directories::ProjectDirs::from("com", "semantic-embed", "semantic-embed") {
        Some(dirs) => dirs.data_dir().to_path_buf(),
        None => std::env::temp_dir().join("semantic-embed"),
    }
}
