//! Cooperative cancellation for the node's two tasks.
//!
//! A `watch` channel carries the stop signal; each loop checks it at its safe
//! point. Task handles are kept so [`ShutdownToken::join_all`] can wait for both
//! loops to confirm exit.

use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct ShutdownToken {
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            stop_tx,
            stop_rx,
            task_handles: Mutex::new(Vec::new()),
        }
    }

    /// A receiver for one background loop to hold.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.stop_rx.clone()
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    pub fn add_task(&self, handle: JoinHandle<()>) {
        self.task_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Idempotent.
    pub fn signal_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Resolves once the stop signal has been sent.
    pub async fn stopped(&self) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Await every registered task, draining the handle list. Join errors are ignored.
    pub async fn join_all(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .task_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}
