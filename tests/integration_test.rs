// Integration tests for configuration, logging and storage wiring.
// These check that a config file drives the session the way hosts use it.

use std::sync::Arc;

use parley_lib::{ChatConfig, ChatSession, ConfigService, MemoryConnector, MessageStore};
use tempfile::TempDir;

#[test]
fn test_logging_init_is_idempotent() {
    parley_lib::init_logging("debug");
    parley_lib::init_logging("trace");
    log::info!("logger still usable");
}

#[test]
fn test_config_file_overrides_defaults() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[server]
scheme = "wss"
host = "relay.example.org"
port = 9443

[delivery]
timeout_ms = 2500
"#,
    )
    .unwrap();

    let service = ConfigService::with_path(&path).unwrap();
    let config = service.get();
    assert_eq!(
        config.websocket_url("alice").unwrap().as_str(),
        "wss://relay.example.org:9443/ws/alice"
    );
    assert_eq!(
        config.http_base_url().unwrap().as_str(),
        "https://relay.example.org:9443/"
    );
    assert_eq!(config.delivery.timeout_ms, 2500);
    // Untouched sections keep their defaults.
    assert_eq!(config.reconnect.max_retries, 3);
}

#[test]
fn test_saved_config_reloads() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("nested").join("config.toml");

    let mut service = ConfigService::with_path(&path)?;
    let mut config = service.get();
    config.server.host = "chat.internal".to_string();
    config.storage.data_dir = tmp.path().join("data");
    service.update(config.clone())?;

    let reloaded = ConfigService::load(&path)?;
    assert_eq!(reloaded, config);
    Ok(())
}

#[test]
fn test_invalid_config_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[server]\nscheme = \"ftp\"\n").unwrap();
    tokio_test::assert_err!(ConfigService::with_path(&path));

    std::fs::write(&path, "[reconnect]\nbase_delay_ms = 0\n").unwrap();
    tokio_test::assert_err!(ConfigService::with_path(&path));

    std::fs::write(&path, "[server]\nscheme = \"ws\"\n").unwrap();
    tokio_test::assert_ok!(ConfigService::with_path(&path));
}

#[tokio::test(start_paused = true)]
async fn test_session_uses_configured_url_and_data_dir() {
    let tmp = TempDir::new().unwrap();
    let mut config = ChatConfig::default();
    config.server.port = 9000;
    config.storage.data_dir = tmp.path().join("data");

    let store = MessageStore::open_shared(&config.storage.data_dir).unwrap();
    let (connector, mut accepted) = MemoryConnector::new();
    let session = ChatSession::start("alice", &config, store, Arc::new(connector))
        .await
        .unwrap()
        .with_directory(None);

    let peer = accepted.recv().await.unwrap();
    assert_eq!(peer.url, "ws://localhost:9000/ws/alice");
    assert!(config.storage.data_dir.join("messages").is_dir());
    assert!(config.storage.data_dir.join("users").is_dir());
    assert_eq!(session.local_id(), "alice");
    session.shutdown().await;
}
