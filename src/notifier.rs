//! Wake-up channel between producers (enqueue, publish, outbox write)
//! and pollers. A send never blocks; a receiver coalesces
//! bursts — this is exactly `tokio::sync::watch`'s single-slot semantics,
//! modelled behind a small trait so the async worker and workflow engine
//! don't depend on a concrete channel type.

use async_trait::async_trait;
use tokio::sync::watch;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Never blocks.
    fn notify(&self);

    /// Waits until the next `notify()` after this call, or returns early
    /// if one already happened and hasn't been observed.
    async fn wait(&self);
}

/// In-process buffered signal channel of size 1.
pub struct ChannelNotifier {
    tx: watch::Sender<u64>,
    rx: watch::Receiver<u64>,
}

impl ChannelNotifier {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(0);
        Self { tx, rx }
    }
}

impl Default for ChannelNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    fn notify(&self) {
        self.tx.send_modify(|v| *v = v.wrapping_add(1));
    }

    async fn wait(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.changed().await;
    }
}

/// No-op notifier: `wait()` never resolves on its own, so callers fall
/// back entirely to their poll ticker.
#[derive(Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    fn notify(&self) {}

    async fn wait(&self) {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    async fn channel_notifier_wakes_a_waiter() {
        let n = ChannelNotifier::new();
        let waited = tokio::spawn({
            let rx = n.rx.clone();
            async move {
                let mut rx = rx;
                rx.changed().await.unwrap();
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        n.notify();
        tokio::time::timeout(std::time::Duration::from_secs(1), waited)
            .await
            .expect("did not wake in time")
            .unwrap();
    }

    #[test]
    async fn channel_notifier_coalesces_bursts() {
        let n = ChannelNotifier::new();
        let mut rx = n.rx.clone();
        n.notify();
        n.notify();
        n.notify();
        // a single `changed()` observes the coalesced burst
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 3);
    }
}
