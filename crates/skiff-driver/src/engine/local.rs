use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use log::debug;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;

use crate::engine::{
    Engine, EngineBuilder, EngineEvent, EngineJobStatus, EngineSession, SubTask, TaskMetrics,
};
use crate::error::{DriverError, DriverResult};
use crate::id::{CacheId, EngineJobId, StageId, TaskId};

/// An in-process engine that runs submissions as tokio tasks and
/// synthesizes the event feed. Each submission becomes one engine job with
/// a single stage and a single task.
pub struct LocalEngine {
    state: Mutex<LocalEngineState>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

#[derive(Default)]
struct LocalEngineState {
    next_id: u64,
    jobs: HashMap<EngineJobId, Vec<StageId>>,
    cached: HashSet<CacheId>,
    tasks: Vec<Arc<LocalSubTask>>,
}

impl LocalEngine {
    pub fn new(events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            state: Mutex::new(LocalEngineState::default()),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, LocalEngineState> {
        match self.state.lock() {
            Ok(x) => x,
            Err(e) => e.into_inner(),
        }
    }

    /// Runs one unit of work as an engine job and returns its handle.
    pub fn submit<F>(&self, work: F) -> Arc<LocalSubTask>
    where
        F: Future<Output = DriverResult<()>> + Send + 'static,
    {
        let (engine_job_id, stage_id, task_id, subtask) = {
            let mut state = self.state();
            let engine_job_id = EngineJobId::from(state.next_id);
            let stage_id = StageId::from(state.next_id + 1);
            let task_id = TaskId::from(state.next_id + 2);
            state.next_id += 3;
            state.jobs.insert(engine_job_id, vec![stage_id]);
            let subtask = Arc::new(LocalSubTask::new(engine_job_id));
            state.tasks.push(Arc::clone(&subtask));
            (engine_job_id, stage_id, task_id, subtask)
        };
        let _ = self.events.send(EngineEvent::JobStarted {
            engine_job_id,
            stage_ids: vec![stage_id],
        });
        let events = self.events.clone();
        let task = Arc::clone(&subtask);
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = tokio::select! {
                _ = task.canceled.notified() => Err("the task was canceled".to_string()),
                result = work => result.map_err(|e| e.to_string()),
            };
            let _ = events.send(EngineEvent::TaskEnded {
                stage_id,
                task_id,
                succeeded: outcome.is_ok(),
                speculative: false,
                metrics: TaskMetrics {
                    run_time_ms: started.elapsed().as_millis() as u64,
                    ..Default::default()
                },
            });
            let _ = events.send(EngineEvent::JobEnded { engine_job_id });
            task.finish(outcome);
        });
        subtask
    }

    /// Registers a cached resource and returns its ID. The resource stays
    /// cached until it is explicitly released.
    pub fn cache_resource(&self) -> CacheId {
        let mut state = self.state();
        let cache_id = CacheId::from(state.next_id);
        state.next_id += 1;
        state.cached.insert(cache_id);
        cache_id
    }

    pub fn is_cached(&self, cache_id: CacheId) -> bool {
        self.state().cached.contains(&cache_id)
    }
}

#[async_trait]
impl Engine for LocalEngine {
    async fn job_status(
        &self,
        engine_job_id: EngineJobId,
    ) -> DriverResult<Option<EngineJobStatus>> {
        Ok(self
            .state()
            .jobs
            .get(&engine_job_id)
            .map(|stage_ids| EngineJobStatus {
                stage_ids: stage_ids.clone(),
            }))
    }

    async fn release_cached(&self, cache_id: CacheId) -> DriverResult<()> {
        if !self.state().cached.remove(&cache_id) {
            debug!("cached resource {cache_id} is already released");
        }
        Ok(())
    }

    async fn stop(&self) -> DriverResult<()> {
        let tasks = std::mem::take(&mut self.state().tasks);
        for task in tasks {
            task.cancel();
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct LocalSubTask {
    engine_job_id: EngineJobId,
    canceled: Notify,
    state: watch::Sender<Option<Result<(), String>>>,
}

impl LocalSubTask {
    fn new(engine_job_id: EngineJobId) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            engine_job_id,
            canceled: Notify::new(),
            state,
        }
    }

    fn finish(&self, outcome: Result<(), String>) {
        let _ = self.state.send(Some(outcome));
    }
}

#[async_trait]
impl SubTask for LocalSubTask {
    fn engine_job_ids(&self) -> Vec<EngineJobId> {
        vec![self.engine_job_id]
    }

    async fn wait(&self) -> DriverResult<()> {
        let mut state = self.state.subscribe();
        let outcome = state
            .wait_for(|x| x.is_some())
            .await
            .map_err(|_| DriverError::InternalError("the engine task was dropped".to_string()))?
            .clone();
        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(DriverError::InternalError(e)),
            None => Err(DriverError::InternalError(
                "the engine task has no outcome".to_string(),
            )),
        }
    }

    fn cancel(&self) {
        self.canceled.notify_one();
    }
}

pub struct LocalEngineBuilder;

#[async_trait]
impl EngineBuilder for LocalEngineBuilder {
    async fn build(&self, _scratch_dir: &Path) -> DriverResult<EngineSession> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(EngineSession {
            engine: Arc::new(LocalEngine::new(tx)),
            events: rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_submit_reports_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = LocalEngine::new(tx);
        let task = engine.submit(async { Ok(()) });
        task.wait().await.unwrap();

        let Some(EngineEvent::JobStarted { engine_job_id, stage_ids }) = rx.recv().await else {
            panic!("expected a job start event");
        };
        assert_eq!(stage_ids.len(), 1);
        let Some(EngineEvent::TaskEnded { succeeded, speculative, .. }) = rx.recv().await else {
            panic!("expected a task end event");
        };
        assert!(succeeded);
        assert!(!speculative);
        let Some(EngineEvent::JobEnded { engine_job_id: ended }) = rx.recv().await else {
            panic!("expected a job end event");
        };
        assert_eq!(ended, engine_job_id);

        let status = engine.job_status(engine_job_id).await.unwrap().unwrap();
        assert_eq!(status.stage_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_fails_the_task() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = LocalEngine::new(tx);
        let task = engine.submit(std::future::pending());
        task.cancel();
        assert!(task.wait().await.is_err());

        let _ = rx.recv().await;
        let Some(EngineEvent::TaskEnded { succeeded, .. }) = rx.recv().await else {
            panic!("expected a task end event");
        };
        assert!(!succeeded);
    }

    #[tokio::test]
    async fn test_release_cached_is_idempotent() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = LocalEngine::new(tx);
        let cache_id = engine.cache_resource();
        assert!(engine.is_cached(cache_id));
        engine.release_cached(cache_id).await.unwrap();
        assert!(!engine.is_cached(cache_id));
        // Releasing again is not an error.
        engine.release_cached(cache_id).await.unwrap();
    }
}
