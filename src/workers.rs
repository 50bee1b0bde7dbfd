//! Background task group with a shared shutdown signal.
//!
//! Every controller owns one of these. Tasks watch the `bool` channel and
//! return when it flips to `true`; [`Workers::stop`] then joins each task
//! under a timeout and aborts stragglers.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A set of spawned tasks that stop together.
pub struct Workers {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Default for Workers {
    fn default() -> Self {
        Self::new()
    }
}

impl Workers {
    /// Create an empty group.
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// A receiver for this group's shutdown signal.
    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn a named task into the group.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!("Starting task '{}'", name);
        self.handles.push((name, tokio::spawn(task)));
    }

    /// Number of tasks in the group.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the group has no tasks.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal shutdown and join every task, waiting at most `timeout` for each.
    pub async fn stop(self, timeout: Duration) {
        if self.is_empty() {
            return;
        }
        debug!("Stopping {} task(s)", self.len());
        self.shutdown_tx.send_replace(true);

        for (name, mut handle) in self.handles {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => debug!("Task '{}' stopped", name),
                Ok(Err(e)) => warn!("Task '{}' ended abnormally: {}", name, e),
                Err(_) => {
                    warn!("Task '{}' did not stop within {:?}; aborting", name, timeout);
                    handle.abort();
                }
            }
        }
    }
}

/// Wait until `shutdown_rx` reports `true`. Also returns if the sender is
/// dropped.
pub async fn shutdown_signalled(shutdown_rx: &mut watch::Receiver<bool>) {
    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}
