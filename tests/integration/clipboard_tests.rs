//! Integration tests for the desktop clipboard
//!
//! These need a real display and are only built with the
//! `integration-tests` feature.

#![cfg(feature = "integration-tests")]

use std::time::Duration;

use clipmirror::clipboard::{read_content, write_content, ClipboardPort, SystemClipboard};
use clipmirror::content::ClipboardContent;
use tokio::time::timeout;

fn provider() -> SystemClipboard {
    SystemClipboard::new(Duration::from_millis(50)).unwrap()
}

#[tokio::test]
async fn test_clipboard_text_roundtrip() {
    let clipboard = provider();

    clipboard.set_text("Integration test text").await.unwrap();
    assert!(clipboard.has_text().await.unwrap());
    assert_eq!(clipboard.get_text().await.unwrap(), "Integration test text");
}

#[tokio::test]
async fn test_clipboard_content_roundtrip() {
    let clipboard = provider();
    let content = ClipboardContent::text("typed content");

    write_content(&clipboard, &content).await.unwrap();
    assert_eq!(read_content(&clipboard).await.unwrap(), Some(content));
}

#[tokio::test]
async fn test_clipboard_watch_sees_change() {
    let clipboard = provider();
    let mut watcher = clipboard.watch().await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    clipboard
        .set_text(&format!("watched {}", uuid::Uuid::new_v4()))
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(2), watcher.receiver.recv())
        .await
        .expect("no change event within 2s");
    assert!(event.is_some());
}
