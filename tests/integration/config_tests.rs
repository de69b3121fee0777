//! Integration tests for configuration loading

use std::path::PathBuf;
use std::time::Duration;

use clipmirror::config::{Config, StoreBackend};
use clipmirror::content::{BlobKeys, WireFormat};
use tempfile::TempDir;

#[test]
fn test_load_full_config_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
local_id = "office"
remote_id = "home"
log_level = "debug"

[sync]
quiet_period_ms = 750
poll_interval_ms = 100
wire_format = "envelope"
blob_keys = "per_transfer"
scratch_dir = "/var/tmp/clipmirror"

[relay]
url = "wss://relay.example.net/clipmirror"
request_timeout_ms = 0

[relay.reconnect]
initial_delay_ms = 250
max_delay_ms = 4000
max_attempts = 3

[store]
backend = "directory"
directory = "/srv/clipmirror"
"#,
    )
    .unwrap();

    let config = Config::load_config(Some(&path)).unwrap();
    config.validate().unwrap();

    assert_eq!(config.local_id, "office");
    assert_eq!(config.remote_id, "home");
    assert_eq!(config.quiet_period(), Duration::from_millis(750));
    assert_eq!(config.poll_interval(), Duration::from_millis(100));
    assert_eq!(config.sync.wire_format, WireFormat::Envelope);
    assert_eq!(config.sync.blob_keys, BlobKeys::PerTransfer);
    assert_eq!(config.scratch_dir(), PathBuf::from("/var/tmp/clipmirror"));
    assert_eq!(config.request_timeout(), None);
    assert_eq!(config.relay.reconnect.max_attempts, 3);
    assert_eq!(config.store.backend, StoreBackend::Directory);
    assert_eq!(config.store.directory, PathBuf::from("/srv/clipmirror"));
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    assert!(Config::load_config(Some(&dir.path().join("absent.toml"))).is_err());
}

#[test]
fn test_out_of_range_quiet_period_is_rejected_on_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[sync]\nquiet_period_ms = 10\n").unwrap();

    assert!(Config::load_from_path(&path).is_err());
}

#[test]
fn test_saved_config_loads_back() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("saved.toml");

    let mut config = Config::default();
    config.local_id = "left".to_string();
    config.remote_id = "right".to_string();
    config.sync.scratch_dir = dir.path().join("scratch");
    config.store.directory = dir.path().join("store");
    config.save_to(&path).unwrap();

    assert_eq!(Config::load_from_path(&path).unwrap(), config);
}

#[test]
fn test_example_config_parses() {
    let config = Config::from_toml(&Config::generate_example()).unwrap();
    assert_eq!(config.quiet_period(), Duration::from_millis(500));
    // Identities are left for the user to fill in
    assert!(config.validate().is_err());
}
