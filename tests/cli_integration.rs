//! Command line parsing and command handling

use std::path::Path;
use std::time::Duration;

use clap::Parser;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use clipmirror::cli::{Cli, CliHandler, Commands, ConfigAction};
use clipmirror::config::Config;
use clipmirror::transport::{MessageChannel, RelayClient, RelayClientConfig, RelayServer};

fn write_config(dir: &Path, relay_url: &str) -> std::path::PathBuf {
    let path = dir.join("config.toml");
    let contents = format!(
        r#"
local_id = "desk"
remote_id = "laptop"

[sync]
scratch_dir = '{}'

[relay]
url = "{}"
request_timeout_ms = 5000
"#,
        dir.join("scratch").display(),
        relay_url
    );
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_parse_send_text() {
    let cli = Cli::try_parse_from(["clipmirror", "send-text", "hello there"]).unwrap();
    match cli.command {
        Commands::SendText { text } => assert_eq!(text, "hello there"),
        _ => panic!("expected send-text command"),
    }
}

#[test]
fn test_parse_config_init_force() {
    let cli = Cli::try_parse_from(["clipmirror", "config", "init", "--force"]).unwrap();
    assert!(matches!(
        cli.command,
        Commands::Config {
            action: ConfigAction::Init { force: true }
        }
    ));
}

#[test]
fn test_unknown_command_is_rejected() {
    assert!(Cli::try_parse_from(["clipmirror", "history"]).is_err());
}

#[tokio::test]
async fn test_config_commands_on_written_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(dir.path(), "ws://127.0.0.1:8484/clipmirror");
    let mut handler = CliHandler::new(Some(path.clone()));

    handler
        .handle_command(Commands::Config {
            action: ConfigAction::Validate,
        })
        .await
        .unwrap();
    handler
        .handle_command(Commands::Config {
            action: ConfigAction::Show,
        })
        .await
        .unwrap();

    let config = Config::load_from_path(&path).unwrap();
    assert_eq!(config.local_id, "desk");
    assert_eq!(config.remote_id, "laptop");
    assert_eq!(config.request_timeout(), Some(Duration::from_secs(5)));
}

#[tokio::test]
async fn test_config_init_then_validate_fails_without_peer() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("config.toml");
    let mut handler = CliHandler::new(Some(path.clone()));

    handler
        .handle_command(Commands::Config {
            action: ConfigAction::Init { force: false },
        })
        .await
        .unwrap();
    assert!(path.exists());
    assert!(Config::load_from_path(&path).is_ok());

    let result = handler
        .handle_command(Commands::Config {
            action: ConfigAction::Validate,
        })
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_send_text_reaches_peer() {
    let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/clipmirror", server.local_addr().unwrap());
    tokio::spawn(server.run());

    let peer = RelayClient::connect(RelayClientConfig::new(url.as_str(), "laptop"))
        .await
        .unwrap();

    let dir = TempDir::new().unwrap();
    let path = write_config(dir.path(), &url);
    let mut handler = CliHandler::new(Some(path));
    handler
        .handle_command(Commands::SendText {
            text: "from the shell".to_string(),
        })
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), peer.receive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.as_deref(), Some("from the shell"));
}

#[tokio::test]
async fn test_send_text_without_relay_fails() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let dir = TempDir::new().unwrap();
    let path = write_config(dir.path(), &format!("ws://{}/clipmirror", addr));
    let mut handler = CliHandler::new(Some(path));

    let result = handler
        .handle_command(Commands::SendText {
            text: "nobody home".to_string(),
        })
        .await;
    assert!(result.is_err());
}
