use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::{mpsc, watch};

/// Coordinates the one-shot transition from running to stopped. Any task
/// may trigger shutdown; only the first trigger wins and records the cause.
/// The driver actor drains the trigger feed and performs the teardown.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<ShutdownState>,
}

struct ShutdownState {
    running: watch::Sender<bool>,
    feed: mpsc::UnboundedSender<Option<String>>,
    feed_receiver: Mutex<Option<mpsc::UnboundedReceiver<Option<String>>>>,
    cause: OnceLock<String>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (running, _) = watch::channel(true);
        let (feed, feed_receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ShutdownState {
                running,
                feed,
                feed_receiver: Mutex::new(Some(feed_receiver)),
                cause: OnceLock::new(),
            }),
        }
    }

    /// Flips the running flag and feeds the shutdown request to the driver.
    /// Returns whether this call was the first trigger; later calls are
    /// no-ops.
    pub fn trigger(&self, error: Option<String>) -> bool {
        let first = self.inner.running.send_if_modified(|running| {
            if *running {
                *running = false;
                true
            } else {
                false
            }
        });
        if first {
            if let Some(error) = &error {
                let _ = self.inner.cause.set(error.clone());
            }
            let _ = self.inner.feed.send(error);
        }
        first
    }

    pub fn is_running(&self) -> bool {
        *self.inner.running.borrow()
    }

    pub fn watch_running(&self) -> watch::Receiver<bool> {
        self.inner.running.subscribe()
    }

    /// The error that triggered shutdown, if shutdown was triggered by one.
    pub fn cause(&self) -> Option<String> {
        self.inner.cause.get().cloned()
    }

    pub(crate) fn take_feed(&self) -> Option<mpsc::UnboundedReceiver<Option<String>>> {
        match self.inner.feed_receiver.lock() {
            Ok(mut receiver) => receiver.take(),
            Err(e) => e.into_inner().take(),
        }
    }
}
