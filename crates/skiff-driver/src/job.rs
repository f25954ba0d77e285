use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use skiff_server::actor::ActorHandle;

use crate::counter::CounterSet;
use crate::driver::{DriverActor, DriverEvent};
use crate::engine::{Engine, SubTask};
use crate::error::{DriverError, DriverResult};
use crate::id::{CacheId, EngineJobId, JobId};

/// One unit of work submitted by the client. Implementations run against
/// the shared execution context and may register engine-side work with the
/// monitor to have its completion tracked and its metrics forwarded.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, context: Arc<JobContext>, monitor: &JobMonitor) -> DriverResult<Vec<u8>>;
}

/// Decodes opaque job payloads received over the wire into [`Job`] values.
/// The codec is supplied at driver construction since the job vocabulary
/// belongs to the embedding application.
pub trait JobCodec: Send + Sync {
    fn decode_job(&self, data: &[u8]) -> DriverResult<Box<dyn Job>>;
}

/// The shared execution context. Constructed once the engine is up and
/// read by all jobs concurrently.
pub struct JobContext {
    engine: Arc<dyn Engine>,
    scratch_dir: PathBuf,
}

impl JobContext {
    pub fn new(engine: Arc<dyn Engine>, scratch_dir: PathBuf) -> Self {
        Self {
            engine,
            scratch_dir,
        }
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// A process-local directory for job scratch files. The driver removes
    /// it on shutdown.
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }
}

/// The registration callback handed to a running job. The first registered
/// sub-task fixes the engine job ID reported to the client.
pub struct JobMonitor {
    inner: MonitorInner,
}

enum MonitorInner {
    Job {
        job_id: JobId,
        handle: ActorHandle<DriverActor>,
        state: Mutex<MonitorState>,
    },
    /// Synchronous jobs run inline on the RPC handler and cannot be
    /// monitored.
    Sync,
}

#[derive(Default)]
struct MonitorState {
    subtasks: Vec<Arc<dyn SubTask>>,
    counters: Option<Arc<CounterSet>>,
    engine_job_id: Option<EngineJobId>,
}

impl JobMonitor {
    pub(crate) fn for_job(job_id: JobId, handle: ActorHandle<DriverActor>) -> Self {
        Self {
            inner: MonitorInner::Job {
                job_id,
                handle,
                state: Mutex::new(MonitorState::default()),
            },
        }
    }

    pub(crate) fn sync() -> Self {
        Self {
            inner: MonitorInner::Sync,
        }
    }

    /// Registers engine-side work spawned by the job, along with the
    /// counters it updates and any cached resources to release when the job
    /// reaches a terminal state.
    pub async fn register(
        &self,
        subtask: Arc<dyn SubTask>,
        counters: Option<Arc<CounterSet>>,
        cached_resources: Vec<CacheId>,
    ) -> DriverResult<()> {
        let MonitorInner::Job {
            job_id,
            handle,
            state,
        } = &self.inner
        else {
            return Err(DriverError::InvalidArgument(
                "job monitoring is not available for synchronous jobs".to_string(),
            ));
        };
        let engine_job_id = {
            let mut state = Self::lock(state);
            state.subtasks.push(Arc::clone(&subtask));
            if state.engine_job_id.is_none() {
                state.engine_job_id = subtask.engine_job_ids().first().copied();
            }
            if counters.is_some() {
                state.counters = counters;
            }
            state.engine_job_id
        };
        handle
            .send(DriverEvent::SubTaskRegistered {
                job_id: job_id.clone(),
                subtask,
                engine_job_id,
                cached_resources,
            })
            .await?;
        Ok(())
    }

    pub(crate) fn subtasks(&self) -> Vec<Arc<dyn SubTask>> {
        match &self.inner {
            MonitorInner::Job { state, .. } => Self::lock(state).subtasks.clone(),
            MonitorInner::Sync => vec![],
        }
    }

    pub(crate) fn engine_job_id(&self) -> Option<EngineJobId> {
        match &self.inner {
            MonitorInner::Job { state, .. } => Self::lock(state).engine_job_id,
            MonitorInner::Sync => None,
        }
    }

    pub(crate) fn counters(&self) -> Option<Arc<CounterSet>> {
        match &self.inner {
            MonitorInner::Job { state, .. } => Self::lock(state).counters.clone(),
            MonitorInner::Sync => None,
        }
    }

    fn lock(state: &Mutex<MonitorState>) -> MutexGuard<'_, MonitorState> {
        match state.lock() {
            Ok(x) => x,
            Err(e) => e.into_inner(),
        }
    }
}
