use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::engine::{Engine, EngineEvent, SubTask, TaskMetrics};
use crate::id::{CacheId, EngineJobId, JobId, StageId, TaskId};
use crate::job::Job;

/// The closed set of messages driving the driver actor. Every inbound RPC,
/// engine event, runner transition, timer probe, and shutdown trigger is
/// expressed as one of these variants.
pub enum DriverEvent {
    ServerReady {
        /// The local port that the driver server listens on.
        port: u16,
        signal: oneshot::Sender<()>,
    },
    ContextReady {
        engine: Arc<dyn Engine>,
        events: mpsc::UnboundedReceiver<EngineEvent>,
    },
    StartupFailed {
        error: String,
    },
    SubmitJob {
        job_id: JobId,
        job: Box<dyn Job>,
    },
    CancelJob {
        job_id: JobId,
    },
    EndSession,
    /// A running job registered engine-side work with its monitor.
    SubTaskRegistered {
        job_id: JobId,
        subtask: Arc<dyn SubTask>,
        engine_job_id: Option<EngineJobId>,
        cached_resources: Vec<CacheId>,
    },
    /// The runner started executing the job body.
    JobRunning {
        job_id: JobId,
    },
    /// The runner observed a terminal state for the job.
    JobEnded {
        job_id: JobId,
        outcome: JobOutcome,
    },
    EngineJobStarted {
        engine_job_id: EngineJobId,
        stage_ids: Vec<StageId>,
    },
    EngineJobEnded {
        engine_job_id: EngineJobId,
    },
    EngineTaskEnded {
        stage_id: StageId,
        task_id: TaskId,
        succeeded: bool,
        speculative: bool,
        metrics: TaskMetrics,
    },
    ProbeIdleSession,
    Shutdown {
        error: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed { error: String },
    Canceled,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Completed => write!(f, "COMPLETED"),
            JobOutcome::Failed { error } => write!(f, "FAILED ({error})"),
            JobOutcome::Canceled => write!(f, "CANCELED"),
        }
    }
}
