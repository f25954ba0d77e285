use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::engine::SubTask;
use crate::error::DriverResult;
use crate::id::{CacheId, EngineJobId, JobId};
use crate::job::Job;

/// The registry of live jobs plus the queue of jobs submitted before the
/// execution context was published. Mutated only by the driver actor.
pub struct DriverState {
    jobs: HashMap<JobId, ActiveJob>,
    queue: VecDeque<JobId>,
}

impl DriverState {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    /// Registers a job. Returns the replaced entry when the client reuses a
    /// live job ID, which it has promised not to do.
    pub fn add_job(&mut self, job_id: JobId, job: ActiveJob) -> Option<ActiveJob> {
        self.jobs.insert(job_id, job)
    }

    pub fn get_job_mut(&mut self, job_id: &JobId) -> Option<&mut ActiveJob> {
        self.jobs.get_mut(job_id)
    }

    pub fn remove_job(&mut self, job_id: &JobId) -> Option<ActiveJob> {
        self.jobs.remove(job_id)
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs.keys().cloned().collect()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn enqueue(&mut self, job_id: JobId) {
        self.queue.push_back(job_id);
    }

    pub fn pop_queued(&mut self) -> Option<JobId> {
        self.queue.pop_front()
    }

    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    /// Resolves the logical job that spawned the given engine job by
    /// scanning registered sub-task handles. This only finds monitored
    /// work; the scan is linear in live jobs times their sub-tasks, which
    /// stays small for the expected fan-out.
    pub fn find_job_by_engine_job(&self, engine_job_id: EngineJobId) -> Option<&JobId> {
        self.jobs
            .iter()
            .find(|(_, job)| {
                job.subtasks
                    .iter()
                    .any(|subtask| subtask.engine_job_ids().contains(&engine_job_id))
            })
            .map(|(job_id, _)| job_id)
    }
}

/// The live state of one submitted job, owned by the registry from
/// submission until the job reaches a terminal state.
pub struct ActiveJob {
    /// The decoded job, consumed when the job is dispatched.
    pub job: Option<Box<dyn Job>>,
    pub state: JobState,
    /// Sub-task handles in registration order.
    pub subtasks: Vec<Arc<dyn SubTask>>,
    /// The engine job ID fixed by the first sub-task registration.
    pub engine_job_id: Option<EngineJobId>,
    /// Cached resources to release when the job finishes.
    pub cached_resources: Vec<CacheId>,
    /// Counts engine-confirmed completion events for the job.
    pub completed_events: watch::Sender<u64>,
    /// Cancels the runner task.
    pub cancel: Option<oneshot::Sender<()>>,
    /// The runner task handle. The task result records a job failure.
    pub runner: Option<JoinHandle<DriverResult<()>>>,
}

impl ActiveJob {
    pub fn new(job: Box<dyn Job>) -> Self {
        let (completed_events, _) = watch::channel(0);
        Self {
            job: Some(job),
            state: JobState::Queued,
            subtasks: vec![],
            engine_job_id: None,
            cached_resources: vec![],
            completed_events,
            cancel: None,
            runner: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for the execution context to be published.
    Queued,
    /// Dispatched to a runner task.
    Started,
    /// The job body is running against the execution context.
    Running,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "QUEUED"),
            JobState::Started => write!(f, "STARTED"),
            JobState::Running => write!(f, "RUNNING"),
        }
    }
}
