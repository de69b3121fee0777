//! Two endpoints mirroring each other over an in-process hub and store

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use clipmirror::clipboard::ClipboardSnapshot;
use clipmirror::store::{ContentStore, MemoryStore};
use clipmirror::sync::{EngineState, ErrorKind, Operation};
use clipmirror::transport::{MemoryHub, MessageChannel};

use common::{sample_bmp, wait_until, Endpoint};

struct Pair {
    store: MemoryStore,
    a: Endpoint,
    b: Endpoint,
    _scratch: TempDir,
}

async fn pair() -> Pair {
    let hub = MemoryHub::new();
    let store = MemoryStore::new();
    let scratch = TempDir::new().unwrap();

    let a = Endpoint::start(
        "a",
        "b",
        Arc::new(hub.endpoint("a").unwrap()),
        Arc::new(store.clone()),
        &scratch.path().join("a"),
    )
    .await;
    let b = Endpoint::start(
        "b",
        "a",
        Arc::new(hub.endpoint("b").unwrap()),
        Arc::new(store.clone()),
        &scratch.path().join("b"),
    )
    .await;

    Pair {
        store,
        a,
        b,
        _scratch: scratch,
    }
}

#[tokio::test]
async fn test_text_reaches_peer_without_bouncing_back() {
    let p = pair().await;
    let (a, b) = (&p.a, &p.b);

    a.clipboard.copy(ClipboardSnapshot::text("hello"));
    wait_until(|| b.clipboard.snapshot() == ClipboardSnapshot::text("hello")).await;

    // B's write notified B's watcher; nothing may go back within the quiet period
    tokio::time::sleep(Duration::from_millis(600)).await;

    let a_status = a.engine.status();
    let b_status = b.engine.status();
    assert_eq!(a_status.published, 1);
    assert_eq!(a_status.applied, 0);
    assert_eq!(b_status.applied, 1);
    assert_eq!(b_status.published, 0);
    assert!(b_status.dropped >= 1);
    assert_eq!(b.clipboard.write_count(), 1);
}

#[tokio::test]
async fn test_genuine_change_after_quiet_period_is_published() {
    let p = pair().await;
    let (a, b) = (&p.a, &p.b);

    a.clipboard.copy(ClipboardSnapshot::text("ping"));
    wait_until(|| b.engine.status().applied == 1).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    b.clipboard.copy(ClipboardSnapshot::text("pong"));
    wait_until(|| a.clipboard.snapshot() == ClipboardSnapshot::text("pong")).await;
    assert_eq!(b.engine.status().published, 1);
}

#[tokio::test]
async fn test_file_set_reaches_peer_in_order() {
    let p = pair().await;
    let (store, a, b) = (&p.store, &p.a, &p.b);

    let source = TempDir::new().unwrap();
    let first = source.path().join("a.txt");
    let second = source.path().join("b.txt");
    std::fs::write(&first, b"alpha").unwrap();
    std::fs::write(&second, b"bravo").unwrap();

    a.clipboard
        .copy(ClipboardSnapshot::files(vec![first.clone(), second.clone()]));
    wait_until(|| b.clipboard.snapshot().files.is_some()).await;

    assert_eq!(
        store.keys().await,
        vec!["a.txt".to_string(), "b.txt".to_string()]
    );
    assert_eq!(store.get("a.txt").await.unwrap(), b"alpha");
    assert_eq!(store.get("b.txt").await.unwrap(), b"bravo");

    let files: Vec<PathBuf> = b.clipboard.snapshot().files.unwrap();
    let names: Vec<String> = files
        .iter()
        .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["a.txt", "b.txt"]);
    assert_eq!(std::fs::read(&files[0]).unwrap(), b"alpha");
    assert_eq!(std::fs::read(&files[1]).unwrap(), b"bravo");
}

#[tokio::test]
async fn test_image_reaches_peer_unchanged() {
    let p = pair().await;
    let (store, a, b) = (&p.store, &p.a, &p.b);
    let bmp = sample_bmp();

    a.clipboard.copy(ClipboardSnapshot::image(bmp.clone()));
    wait_until(|| b.clipboard.snapshot().image.is_some()).await;

    assert_eq!(b.clipboard.snapshot().image.unwrap(), bmp);
    assert_eq!(store.keys().await, vec!["image-a.bmp".to_string()]);
}

#[tokio::test]
async fn test_text_wins_over_image() {
    let p = pair().await;
    let (store, a, b) = (&p.store, &p.a, &p.b);

    a.clipboard
        .copy(ClipboardSnapshot::text("caption").with_image(sample_bmp()));
    wait_until(|| b.engine.status().applied == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(b.clipboard.snapshot(), ClipboardSnapshot::text("caption"));
    assert_eq!(a.engine.status().published, 1);
    assert_eq!(b.engine.status().applied, 1);
    assert!(store.keys().await.is_empty());
}

async fn receiver_only() -> (MemoryHub, MemoryStore, Endpoint, TempDir) {
    let hub = MemoryHub::new();
    let store = MemoryStore::new();
    let scratch = TempDir::new().unwrap();
    let b = Endpoint::start(
        "b",
        "a",
        Arc::new(hub.endpoint("b").unwrap()),
        Arc::new(store.clone()),
        scratch.path(),
    )
    .await;
    (hub, store, b, scratch)
}

#[tokio::test]
async fn test_image_fetch_failure_leaves_clipboard_unchanged() {
    let (hub, store, b, _scratch) = receiver_only().await;
    b.clipboard.copy(ClipboardSnapshot::text("before"));
    store.put("image-a.bmp", sample_bmp()).await.unwrap();
    store.set_unavailable(true);

    let a = hub.endpoint("a").unwrap();
    a.send("b", "%$IMAGE").await.unwrap();
    wait_until(|| b.engine.status().failed == 1).await;

    let status = b.engine.status();
    assert_eq!(status.state, EngineState::Idle);
    let last = status.last_error.unwrap();
    assert_eq!(last.operation, Operation::Apply);
    assert_eq!(last.kind, ErrorKind::Storage);
    assert_eq!(b.clipboard.snapshot(), ClipboardSnapshot::text("before"));
    assert_eq!(b.clipboard.write_count(), 0);
}

#[tokio::test]
async fn test_missing_image_blob_is_encoding_failure() {
    let (hub, _store, b, _scratch) = receiver_only().await;

    let a = hub.endpoint("a").unwrap();
    a.send("b", "%$IMAGE").await.unwrap();
    wait_until(|| b.engine.status().failed == 1).await;

    assert_eq!(
        b.engine.status().last_error.map(|e| e.kind),
        Some(ErrorKind::Encoding)
    );
    assert_eq!(b.clipboard.snapshot(), ClipboardSnapshot::default());
}

#[tokio::test]
async fn test_engine_survives_failures() {
    let (hub, store, b, _scratch) = receiver_only().await;
    let a = hub.endpoint("a").unwrap();

    a.send("b", "%$FILE$gone.txt$").await.unwrap();
    a.send("b", "still alive").await.unwrap();
    wait_until(|| b.engine.status().applied == 1).await;

    assert_eq!(b.engine.status().failed, 1);
    assert_eq!(b.clipboard.snapshot(), ClipboardSnapshot::text("still alive"));
    assert!(store.keys().await.is_empty());
}

#[tokio::test]
async fn test_engine_stops_when_channel_closes() {
    let (hub, _store, b, _scratch) = receiver_only().await;
    hub.close("b");
    wait_until(|| !b.engine.is_running()).await;
}
