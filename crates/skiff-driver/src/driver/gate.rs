use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{DriverError, DriverResult};
use crate::job::JobContext;

/// Mediates access to the lazily-constructed execution context. Callers
/// wait until the context is published or the driver stops, whichever comes
/// first. Publication happens exactly once.
pub struct ContextGate {
    context: watch::Sender<Option<Arc<JobContext>>>,
    running: watch::Receiver<bool>,
}

impl ContextGate {
    pub fn new(running: watch::Receiver<bool>) -> Self {
        let (context, _) = watch::channel(None);
        Self { context, running }
    }

    pub fn publish(&self, context: Arc<JobContext>) -> DriverResult<()> {
        let mut context = Some(context);
        let published = self.context.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = context.take();
                true
            } else {
                false
            }
        });
        if published {
            Ok(())
        } else {
            Err(DriverError::InternalError(
                "the execution context is already published".to_string(),
            ))
        }
    }

    pub fn try_get(&self) -> Option<Arc<JobContext>> {
        self.context.borrow().clone()
    }

    /// Waits for the execution context. A published context is returned
    /// even after the driver stops; a waiter that is still blocked when the
    /// driver stops fails with [`DriverError::NotRunning`].
    pub async fn wait_ready(&self) -> DriverResult<Arc<JobContext>> {
        let mut context = self.context.subscribe();
        let mut running = self.running.clone();
        loop {
            if let Some(context) = context.borrow_and_update().clone() {
                return Ok(context);
            }
            if !*running.borrow_and_update() {
                return Err(DriverError::NotRunning);
            }
            tokio::select! {
                changed = context.changed() => {
                    changed.map_err(|_| DriverError::NotRunning)?;
                }
                changed = running.changed() => {
                    changed.map_err(|_| DriverError::NotRunning)?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::{mpsc, watch};

    use super::*;
    use crate::engine::LocalEngine;

    fn context() -> Arc<JobContext> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(JobContext::new(
            Arc::new(LocalEngine::new(tx)),
            std::env::temp_dir(),
        ))
    }

    #[tokio::test]
    async fn test_publish_wakes_waiters() {
        let (running, running_rx) = watch::channel(true);
        let gate = Arc::new(ContextGate::new(running_rx));
        assert!(gate.try_get().is_none());

        let waiter = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.wait_ready().await }
        });
        gate.publish(context()).unwrap();
        assert!(waiter.await.unwrap().is_ok());
        assert!(gate.try_get().is_some());
        drop(running);
    }

    #[tokio::test]
    async fn test_publish_twice_fails() {
        let (_running, running_rx) = watch::channel(true);
        let gate = ContextGate::new(running_rx);
        gate.publish(context()).unwrap();
        assert!(gate.publish(context()).is_err());
    }

    #[tokio::test]
    async fn test_stop_fails_waiters() {
        let (running, running_rx) = watch::channel(true);
        let gate = Arc::new(ContextGate::new(running_rx));

        let waiter = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.wait_ready().await }
        });
        running.send(false).unwrap();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(DriverError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_published_context_outlives_stop() {
        let (running, running_rx) = watch::channel(true);
        let gate = ContextGate::new(running_rx);
        gate.publish(context()).unwrap();
        running.send(false).unwrap();
        assert!(gate.wait_ready().await.is_ok());
    }
}
