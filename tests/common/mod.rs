//! Helpers shared by the integration tests

#![allow(dead_code)]

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clipmirror::clipboard::MemoryClipboard;
use clipmirror::store::ContentStore;
use clipmirror::sync::{EngineSettings, SyncEngine};
use clipmirror::transport::MessageChannel;
use tokio::task::JoinHandle;

/// One running endpoint
pub struct Endpoint {
    pub engine: SyncEngine,
    pub clipboard: Arc<MemoryClipboard>,
    task: JoinHandle<()>,
}

impl Endpoint {
    /// Start an engine and wait until it watches its clipboard
    pub async fn start(
        local: &str,
        remote: &str,
        channel: Arc<dyn MessageChannel>,
        store: Arc<dyn ContentStore>,
        scratch: &Path,
    ) -> Self {
        let clipboard = Arc::new(MemoryClipboard::new());
        let mut settings = EngineSettings::new(local, remote);
        settings.scratch_dir = scratch.to_path_buf();

        let engine = SyncEngine::new(settings, clipboard.clone(), channel, store);
        let runner = engine.clone();
        let task = tokio::spawn(async move {
            runner.run().await.unwrap();
        });

        wait_until(|| engine.is_running()).await;
        Self {
            engine,
            clipboard,
            task,
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A small valid BMP
pub fn sample_bmp() -> Vec<u8> {
    let image = image::RgbaImage::from_fn(4, 3, |x, y| {
        image::Rgba([(x * 60) as u8, (y * 80) as u8, 128, 255])
    });
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(image)
        .write_to(&mut out, image::ImageFormat::Bmp)
        .unwrap();
    out.into_inner()
}
