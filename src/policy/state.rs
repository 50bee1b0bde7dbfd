//! Shared holder of the current policy snapshot.

use std::sync::Arc;

use tokio::sync::watch;

use super::snapshot::PolicySnapshot;

/// The current [`PolicySnapshot`], published through a watch channel.
///
/// Writers replace the whole snapshot; readers either take the latest value
/// or subscribe to be woken on every change.
#[derive(Clone)]
pub struct PolicyState {
    tx: Arc<watch::Sender<Arc<PolicySnapshot>>>,
}

impl PolicyState {
    /// Create a state holding `initial`.
    pub fn new(initial: PolicySnapshot) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx: Arc::new(tx) }
    }

    /// The latest snapshot.
    pub fn current(&self) -> Arc<PolicySnapshot> {
        self.tx.borrow().clone()
    }

    /// Subscribe to snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<PolicySnapshot>> {
        self.tx.subscribe()
    }

    /// Derive and publish the next snapshot from the current one.
    ///
    /// Concurrent updates are serialized by the channel, so no update is lost.
    /// Returns the snapshot that was published.
    pub fn update<F>(&self, f: F) -> Arc<PolicySnapshot>
    where
        F: FnOnce(&PolicySnapshot) -> PolicySnapshot,
    {
        let mut published = None;
        self.tx.send_modify(|current| {
            let next = Arc::new(f(current));
            published = Some(next.clone());
            *current = next;
        });
        published.unwrap_or_else(|| self.current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::UsbMode;

    #[test]
    fn test_update_bumps_and_publishes() {
        let state = PolicyState::new(PolicySnapshot::default());
        let rx = state.subscribe();

        let published = state.update(|current| PolicySnapshot {
            version: current.version + 1,
            usb_mode: UsbMode::Block,
            ..current.clone()
        });

        assert_eq!(published.version, 1);
        assert_eq!(state.current().usb_mode, UsbMode::Block);
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_subscriber_wakes_on_update_from_another_task() {
        let state = PolicyState::new(PolicySnapshot::default());
        let mut rx = state.subscribe();

        let writer = state.clone();
        tokio::spawn(async move {
            writer.update(|_| PolicySnapshot {
                version: 7,
                ..Default::default()
            });
        });

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().version, 7);
    }
}
