use std::sync::Arc;

use log::{debug, error, warn};
use skiff_server::actor::ActorHandle;
use tokio::sync::{oneshot, watch};

use crate::driver::actor::DriverActor;
use crate::driver::event::{DriverEvent, JobOutcome};
use crate::driver::protocol::ClientProtocol;
use crate::error::{DriverError, DriverResult};
use crate::id::JobId;
use crate::job::{Job, JobContext, JobMonitor};

/// Drives one job from dispatch to a terminal state on its own task.
/// Lifecycle notices go straight to the client; state transitions are
/// reported to the driver actor, which owns the registry.
pub(crate) struct JobRunner {
    handle: ActorHandle<DriverActor>,
    job_id: JobId,
    job: Box<dyn Job>,
    context: Arc<JobContext>,
    monitor: JobMonitor,
    protocol: Arc<dyn ClientProtocol>,
    /// Counts completion events observed by the tracker for this job.
    completed_events: watch::Receiver<u64>,
    /// Fired by the actor on cancellation or shutdown.
    cancel: oneshot::Receiver<()>,
}

impl JobRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handle: ActorHandle<DriverActor>,
        job_id: JobId,
        job: Box<dyn Job>,
        context: Arc<JobContext>,
        monitor: JobMonitor,
        protocol: Arc<dyn ClientProtocol>,
        completed_events: watch::Receiver<u64>,
        cancel: oneshot::Receiver<()>,
    ) -> Self {
        Self {
            handle,
            job_id,
            job,
            context,
            monitor,
            protocol,
            completed_events,
            cancel,
        }
    }

    /// Runs the job to a terminal state. A job failure is returned after it
    /// has been reported, so the stored join handle records it.
    pub async fn run(self) -> DriverResult<()> {
        let Self {
            handle,
            job_id,
            job,
            context,
            monitor,
            protocol,
            completed_events,
            mut cancel,
        } = self;

        if let Err(e) = protocol.job_started(&job_id).await {
            warn!("failed to notify the client that job {job_id} started: {e}");
        }
        let _ = handle
            .send(DriverEvent::JobRunning {
                job_id: job_id.clone(),
            })
            .await;

        let outcome = tokio::select! {
            outcome = Self::execute(&job_id, job, context, &monitor, completed_events) => outcome,
            _ = &mut cancel => {
                debug!("job {job_id} was canceled");
                let _ = handle
                    .send(DriverEvent::JobEnded {
                        job_id,
                        outcome: JobOutcome::Canceled,
                    })
                    .await;
                return Ok(());
            }
        };

        let counters = monitor.counters().map(|counters| counters.snapshot());
        match outcome {
            Ok(result) => {
                if let Err(e) = protocol
                    .job_result(&job_id, Some(result), None, counters)
                    .await
                {
                    warn!("failed to send job {job_id} result to the client: {e}");
                }
                let _ = handle
                    .send(DriverEvent::JobEnded {
                        job_id,
                        outcome: JobOutcome::Completed,
                    })
                    .await;
                Ok(())
            }
            Err(e) => {
                error!("failed to run job {job_id}: {e}");
                if let Err(send_error) = protocol
                    .job_result(&job_id, None, Some(e.to_string()), counters)
                    .await
                {
                    warn!("failed to send job {job_id} failure to the client: {send_error}");
                }
                let _ = handle
                    .send(DriverEvent::JobEnded {
                        job_id,
                        outcome: JobOutcome::Failed {
                            error: e.to_string(),
                        },
                    })
                    .await;
                Err(e)
            }
        }
    }

    async fn execute(
        job_id: &JobId,
        job: Box<dyn Job>,
        context: Arc<JobContext>,
        monitor: &JobMonitor,
        mut completed_events: watch::Receiver<u64>,
    ) -> DriverResult<Vec<u8>> {
        let result = job.run(Arc::clone(&context), monitor).await?;

        // A job with no engine-side work has no job-start or job-end events;
        // awaiting the handles here is the only way to observe completion.
        let subtasks = monitor.subtasks();
        let mut completed = 0;
        for subtask in &subtasks {
            subtask.wait().await?;
            completed += 1;
            debug!(
                "job {job_id}: {completed} of {} engine jobs finished",
                subtasks.len()
            );
        }

        // A fast job can finish before the engine has delivered the trailing
        // job-end and task-end events, and task metrics would be lost if the
        // result were reported now. Wait until one completion event per
        // sub-task has been observed. An engine job that reports no stages
        // at all never delivers such events, so only stage-bearing jobs wait.
        if let Some(engine_job_id) = monitor.engine_job_id() {
            let status = context.engine().job_status(engine_job_id).await?;
            let has_stages = status.is_some_and(|status| !status.stage_ids.is_empty());
            if has_stages {
                let expected = subtasks.len() as u64;
                completed_events
                    .wait_for(|&count| count >= expected)
                    .await
                    .map_err(|_| DriverError::NotRunning)?;
            }
        }

        Ok(result)
    }
}
