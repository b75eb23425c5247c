mod util;

use std::path::PathBuf;
use std::time::Duration;

use semantic_embed_client::EmbeddingClientConfig;
use semantic_embed_client::config::project_hash;
use serial_test::serial;
use util::EnvGuard;

#[test]
#[serial]
fn from_env_reads_prefixed_variables() {
    let run = tempfile::tempdir().unwrap();
    let _run_dir = EnvGuard::set("SEMANTIC_EMBED_RUN_DIR", run.path().to_string_lossy());
    let _timeout = EnvGuard::set("SEMANTIC_EMBED_TIMEOUT_SECS", "30");
    let _health = EnvGuard::set("SEMANTIC_EMBED_HEALTH_TIMEOUT_MS", "750");
    let _persistent = EnvGuard::set("SEMANTIC_EMBED_PERSISTENT", "true");
    let _retries = EnvGuard::set("SEMANTIC_EMBED_MAX_RETRIES", "4");

    let cfg = EmbeddingClientConfig::from_env("/srv/project");
    assert_eq!(cfg.run_dir, run.path());
    assert_eq!(cfg.socket_path, run.path().join("sockets/embeddings.sock"));
    assert_eq!(cfg.request_timeout, Duration::from_secs(30));
    assert_eq!(cfg.timeouts.initial, Duration::from_secs(60));
    assert_eq!(cfg.search_timeout, Duration::from_secs(15));
    assert_eq!(cfg.supervisor.health_timeout, Duration::from_millis(750));
    assert!(cfg.connection.persistent);
    assert_eq!(cfg.retry.max_attempts, 4);
}

#[test]
#[serial]
fn from_env_defaults_are_project_scoped() {
    let cfg_a = EmbeddingClientConfig::from_env("/srv/a");
    let cfg_b = EmbeddingClientConfig::from_env("/srv/b");
    assert_ne!(cfg_a.socket_path, cfg_b.socket_path);
    assert!(cfg_a.run_dir.ends_with(project_hash(&PathBuf::from("/srv/a"))));
    assert!(cfg_a.queue_db.is_some());
}

#[test]
#[serial]
fn explicit_socket_override_wins() {
    let _socket = EnvGuard::set("SEMANTIC_EMBED_SOCKET", "/tmp/custom-embed.sock");
    let _queue = EnvGuard::set("SEMANTIC_EMBED_QUEUE_DB", "none");
    let cfg = EmbeddingClientConfig::from_env("/srv/project");
    assert_eq!(cfg.socket_path, PathBuf::from("/tmp/custom-embed.sock"));
    assert!(cfg.queue_db.is_none());
}
