use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::DriverResult;
use crate::id::{CacheId, EngineJobId, StageId, TaskId};

mod local;

pub use local::{LocalEngine, LocalEngineBuilder, LocalSubTask};

/// The driver-side handle to the compute engine. The engine itself is an
/// external collaborator; the driver only needs status lookup, cache
/// release, and teardown. Job implementations downcast through [`Engine::as_any`]
/// to reach engine-specific APIs.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Returns the status of an engine job, or [None] if the engine does not
    /// know the job.
    async fn job_status(&self, engine_job_id: EngineJobId)
        -> DriverResult<Option<EngineJobStatus>>;

    /// Releases one cached resource. Releasing eagerly bounds engine memory
    /// without waiting for the engine's own garbage collection.
    async fn release_cached(&self, cache_id: CacheId) -> DriverResult<()>;

    async fn stop(&self) -> DriverResult<()>;

    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone)]
pub struct EngineJobStatus {
    pub stage_ids: Vec<StageId>,
}

/// An asynchronous handle to one unit of engine-side work spawned by a
/// logical job.
#[async_trait]
pub trait SubTask: Send + Sync {
    /// The engine job IDs backing this handle.
    fn engine_job_ids(&self) -> Vec<EngineJobId>;

    /// Resolves when the engine-side work finishes, with its outcome.
    async fn wait(&self) -> DriverResult<()>;

    /// Requests cancellation. Best-effort and non-blocking.
    fn cancel(&self);
}

/// An event from the engine's feed. Events are delivered on an unspecified
/// task with no ordering guarantee across engine jobs.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    JobStarted {
        engine_job_id: EngineJobId,
        stage_ids: Vec<StageId>,
    },
    JobEnded {
        engine_job_id: EngineJobId,
    },
    TaskEnded {
        stage_id: StageId,
        task_id: TaskId,
        succeeded: bool,
        speculative: bool,
        metrics: TaskMetrics,
    },
}

/// Per-task metrics reported by the engine. The driver forwards these
/// opaquely to the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskMetrics {
    pub run_time_ms: u64,
    pub cpu_time_ms: u64,
    pub result_size_bytes: u64,
    pub memory_bytes_spilled: u64,
    pub disk_bytes_spilled: u64,
    pub input_bytes_read: u64,
    pub output_bytes_written: u64,
}

pub struct EngineSession {
    pub engine: Arc<dyn Engine>,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
}

/// Constructs the engine session after process startup. Construction may
/// fail or take arbitrarily long; the driver queues work in the meantime.
#[async_trait]
pub trait EngineBuilder: Send + Sync {
    async fn build(&self, scratch_dir: &Path) -> DriverResult<EngineSession>;
}
