//! In-process message channel
//!
//! A [`MemoryHub`] holds one FIFO mailbox per endpoint id. Mailboxes are
//! created on first use, so messages sent before the receiver attaches are
//! kept until it does.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::debug;

use super::{MessageChannel, Result, TransportError};

#[derive(Default)]
struct Mailbox {
    queue: Mutex<VecDeque<String>>,
    notify: Notify,
    closed: AtomicBool,
    attached: AtomicBool,
}

impl Mailbox {
    fn push(&self, payload: String) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        self.queue
            .lock()
            .map_err(|_| TransportError::Connection {
                message: "mailbox poisoned".to_string(),
            })?
            .push_back(payload);
        self.notify.notify_one();
        Ok(())
    }

    fn pop(&self) -> Option<String> {
        self.queue.lock().ok().and_then(|mut queue| queue.pop_front())
    }

    fn len(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }
}

/// Shared set of mailboxes; clones refer to the same hub
#[derive(Clone, Default)]
pub struct MemoryHub {
    mailboxes: Arc<Mutex<HashMap<String, Arc<Mailbox>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn mailbox(&self, endpoint: &str) -> Arc<Mailbox> {
        let mut mailboxes = match self.mailboxes.lock() {
            Ok(mailboxes) => mailboxes,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(mailboxes.entry(endpoint.to_string()).or_default())
    }

    /// Attach as `endpoint`; only one channel per endpoint may receive
    pub fn endpoint(&self, endpoint: &str) -> Result<MemoryChannel> {
        let mailbox = self.mailbox(endpoint);
        if mailbox.attached.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Connection {
                message: format!("endpoint {} is already attached", endpoint),
            });
        }
        Ok(MemoryChannel {
            hub: self.clone(),
            endpoint: endpoint.to_string(),
            mailbox,
        })
    }

    /// Number of messages waiting for `endpoint`
    pub fn pending(&self, endpoint: &str) -> usize {
        self.mailbox(endpoint).len()
    }

    /// Remove and return the oldest message waiting for `endpoint`
    pub fn take(&self, endpoint: &str) -> Option<String> {
        self.mailbox(endpoint).pop()
    }

    /// Close the mailbox of `endpoint`; its receiver drains then gets `None`
    pub fn close(&self, endpoint: &str) {
        let mailbox = self.mailbox(endpoint);
        mailbox.closed.store(true, Ordering::SeqCst);
        mailbox.notify.notify_waiters();
        mailbox.notify.notify_one();
    }
}

/// One endpoint's view of a [`MemoryHub`]
pub struct MemoryChannel {
    hub: MemoryHub,
    endpoint: String,
    mailbox: Arc<Mailbox>,
}

impl MemoryChannel {
    /// Endpoint id this channel receives for
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn send(&self, destination: &str, payload: &str) -> Result<()> {
        debug!("{} -> {}: {} bytes", self.endpoint, destination, payload.len());
        self.hub.mailbox(destination).push(payload.to_string())
    }

    async fn receive(&self) -> Result<Option<String>> {
        loop {
            let notified = self.mailbox.notify.notified();
            if let Some(payload) = self.mailbox.pop() {
                return Ok(Some(payload));
            }
            if self.mailbox.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_delivery() {
        let hub = MemoryHub::new();
        let a = hub.endpoint("a").unwrap();
        let b = hub.endpoint("b").unwrap();

        a.send("b", "one").await.unwrap();
        a.send("b", "two").await.unwrap();

        assert_eq!(b.receive().await.unwrap().as_deref(), Some("one"));
        assert_eq!(b.receive().await.unwrap().as_deref(), Some("two"));
        assert_eq!(hub.pending("b"), 0);
    }

    #[tokio::test]
    async fn test_queued_before_attach() {
        let hub = MemoryHub::new();
        let a = hub.endpoint("a").unwrap();
        a.send("late", "hello").await.unwrap();
        assert_eq!(hub.pending("late"), 1);

        let late = hub.endpoint("late").unwrap();
        assert_eq!(late.receive().await.unwrap().as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_receive_waits_for_send() {
        let hub = MemoryHub::new();
        let b = hub.endpoint("b").unwrap();
        let sender = hub.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let a = sender.endpoint("a").unwrap();
            a.send("b", "later").await.unwrap();
        });

        let received = tokio::time::timeout(Duration::from_secs(2), b.receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.as_deref(), Some("later"));
    }

    #[tokio::test]
    async fn test_double_attach_rejected() {
        let hub = MemoryHub::new();
        let _a = hub.endpoint("a").unwrap();
        assert!(hub.endpoint("a").is_err());
    }

    #[tokio::test]
    async fn test_close_ends_receive() {
        let hub = MemoryHub::new();
        let b = hub.endpoint("b").unwrap();
        hub.close("b");
        assert!(b.receive().await.unwrap().is_none());
        assert!(matches!(
            hub.endpoint("a").unwrap().send("b", "x").await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
