use std::mem;
use std::sync::Arc;

use log::{debug, error, info, warn};
use skiff_server::actor::{ActorAction, ActorContext};
use tokio::sync::{mpsc, oneshot};

use crate::driver::actor::DriverActor;
use crate::driver::event::{DriverEvent, JobOutcome};
use crate::driver::runner::JobRunner;
use crate::driver::state::{ActiveJob, JobState};
use crate::driver::tracker::StageOwner;
use crate::engine::{Engine, EngineEvent, SubTask, TaskMetrics};
use crate::id::{CacheId, EngineJobId, JobId, StageId, TaskId};
use crate::job::{Job, JobContext, JobMonitor};

impl DriverActor {
    pub(super) fn handle_server_ready(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        port: u16,
        signal: oneshot::Sender<()>,
    ) -> ActorAction {
        let server = mem::take(&mut self.server);
        self.server = match server.ready(signal, port) {
            Ok(x) => x,
            Err(e) => return ActorAction::fail(e),
        };
        info!("the driver server is ready on port {port}");
        ActorAction::Continue
    }

    pub(super) fn handle_context_ready(
        &mut self,
        ctx: &mut ActorContext<Self>,
        engine: Arc<dyn Engine>,
        events: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> ActorAction {
        if !self.options().shutdown.is_running() {
            // Shutdown won the race against engine construction.
            ctx.spawn(async move {
                let _ = engine.stop().await;
            });
            return ActorAction::Continue;
        }
        let context = Arc::new(JobContext::new(
            engine,
            self.options().scratch_dir.clone(),
        ));
        if let Err(e) = self.options().gate.publish(Arc::clone(&context)) {
            return ActorAction::fail(e);
        }
        info!("the execution context is ready");
        self.tracker.reset_completion_clock();

        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            let mut events = events;
            while let Some(event) = events.recv().await {
                let message = match event {
                    EngineEvent::JobStarted {
                        engine_job_id,
                        stage_ids,
                    } => DriverEvent::EngineJobStarted {
                        engine_job_id,
                        stage_ids,
                    },
                    EngineEvent::JobEnded { engine_job_id } => {
                        DriverEvent::EngineJobEnded { engine_job_id }
                    }
                    EngineEvent::TaskEnded {
                        stage_id,
                        task_id,
                        succeeded,
                        speculative,
                        metrics,
                    } => DriverEvent::EngineTaskEnded {
                        stage_id,
                        task_id,
                        succeeded,
                        speculative,
                        metrics,
                    },
                };
                if handle.send(message).await.is_err() {
                    break;
                }
            }
        });

        if let Some(interval) = self.options().session_idle_timeout {
            let handle = ctx.handle().clone();
            ctx.spawn(async move {
                tokio::time::sleep(interval).await;
                loop {
                    if handle.send(DriverEvent::ProbeIdleSession).await.is_err() {
                        break;
                    }
                    tokio::time::sleep(interval / 10).await;
                }
            });
        }

        // Dispatch jobs queued while the context was under construction,
        // in their arrival order.
        while let Some(job_id) = self.state.pop_queued() {
            self.dispatch_job(ctx, job_id, Arc::clone(&context));
        }
        ActorAction::Continue
    }

    pub(super) fn handle_startup_failed(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        error: String,
    ) -> ActorAction {
        error!("{error}");
        self.options().shutdown.trigger(Some(error));
        ActorAction::Continue
    }

    pub(super) fn handle_submit_job(
        &mut self,
        ctx: &mut ActorContext<Self>,
        job_id: JobId,
        job: Box<dyn Job>,
    ) -> ActorAction {
        if !self.options().shutdown.is_running() {
            return ActorAction::warn(format!(
                "ignoring job {job_id} because the driver is stopping"
            ));
        }
        if self
            .state
            .add_job(job_id.clone(), ActiveJob::new(job))
            .is_some()
        {
            warn!("job {job_id} replaced a live job with the same ID");
        }
        let context = self.options().gate.try_get();
        match context {
            Some(context) => self.dispatch_job(ctx, job_id, context),
            None => {
                info!("the execution context is not up yet; queueing job {job_id}");
                self.state.enqueue(job_id);
            }
        }
        ActorAction::Continue
    }

    fn dispatch_job(
        &mut self,
        ctx: &mut ActorContext<Self>,
        job_id: JobId,
        context: Arc<JobContext>,
    ) {
        let protocol = Arc::clone(&self.options().protocol);
        let Some(active) = self.state.get_job_mut(&job_id) else {
            warn!("job {job_id} not found for dispatch");
            return;
        };
        let Some(job) = active.job.take() else {
            warn!("job {job_id} was already dispatched");
            return;
        };
        let (cancel_tx, cancel_rx) = oneshot::channel();
        active.cancel = Some(cancel_tx);
        active.state = JobState::Started;
        let monitor = JobMonitor::for_job(job_id.clone(), ctx.handle().clone());
        let runner = JobRunner::new(
            ctx.handle().clone(),
            job_id,
            job,
            context,
            monitor,
            protocol,
            active.completed_events.subscribe(),
            cancel_rx,
        );
        active.runner = Some(ctx.spawn(runner.run()));
    }

    pub(super) fn handle_job_running(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        job_id: JobId,
    ) -> ActorAction {
        if let Some(job) = self.state.get_job_mut(&job_id) {
            job.state = JobState::Running;
        }
        ActorAction::Continue
    }

    pub(super) fn handle_cancel_job(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        job_id: JobId,
    ) -> ActorAction {
        let canceled = match self.state.get_job_mut(&job_id) {
            Some(job) => {
                debug!("canceling job {job_id} in state {}", job.state);
                let mut canceled = !job.subtasks.is_empty();
                for subtask in &job.subtasks {
                    subtask.cancel();
                }
                if let Some(cancel) = job.cancel.take() {
                    canceled |= cancel.send(()).is_ok();
                }
                canceled
            }
            None => false,
        };
        if !canceled {
            info!("requested to cancel an already finished job: {job_id}");
        }
        ActorAction::Continue
    }

    pub(super) fn handle_sub_task_registered(
        &mut self,
        ctx: &mut ActorContext<Self>,
        job_id: JobId,
        subtask: Arc<dyn SubTask>,
        engine_job_id: Option<EngineJobId>,
        cached_resources: Vec<CacheId>,
    ) -> ActorAction {
        let first_submission = {
            let Some(job) = self.state.get_job_mut(&job_id) else {
                return ActorAction::warn(format!(
                    "ignoring a sub-task registered for unknown job {job_id}"
                ));
            };
            job.subtasks.push(subtask);
            job.cached_resources.extend(cached_resources);
            if job.engine_job_id.is_none() && engine_job_id.is_some() {
                job.engine_job_id = engine_job_id;
                true
            } else {
                false
            }
        };
        if first_submission {
            if let Some(engine_job_id) = engine_job_id {
                let protocol = Arc::clone(&self.options().protocol);
                ctx.spawn(async move {
                    if let Err(e) = protocol.job_submitted(&job_id, engine_job_id).await {
                        warn!("failed to notify the client that job {job_id} was submitted: {e}");
                    }
                });
            }
        }
        ActorAction::Continue
    }

    pub(super) fn handle_job_ended(
        &mut self,
        ctx: &mut ActorContext<Self>,
        job_id: JobId,
        outcome: JobOutcome,
    ) -> ActorAction {
        let Some(job) = self.state.remove_job(&job_id) else {
            // The job was already dropped, typically during shutdown.
            debug!("job {job_id} ended after it was removed from the registry");
            return ActorAction::Continue;
        };
        info!("job {job_id} finished: {outcome}");
        self.tracker.remove_job(&job_id);
        self.release_cached_resources(ctx, &job);
        ActorAction::Continue
    }

    fn release_cached_resources(&self, ctx: &mut ActorContext<Self>, job: &ActiveJob) {
        if job.cached_resources.is_empty() {
            return;
        }
        let Some(context) = self.options().gate.try_get() else {
            return;
        };
        for &cache_id in &job.cached_resources {
            let engine = Arc::clone(context.engine());
            ctx.spawn(async move {
                if let Err(e) = engine.release_cached(cache_id).await {
                    warn!("failed to release cached resource {cache_id}: {e}");
                }
            });
        }
    }

    pub(super) fn handle_engine_job_started(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        engine_job_id: EngineJobId,
        stage_ids: Vec<StageId>,
    ) -> ActorAction {
        let job_id = self.state.find_job_by_engine_job(engine_job_id).cloned();
        self.tracker
            .record_job_start(engine_job_id, &stage_ids, job_id);
        ActorAction::Continue
    }

    pub(super) fn handle_engine_job_ended(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        engine_job_id: EngineJobId,
    ) -> ActorAction {
        self.tracker.record_job_end(engine_job_id);
        if let Some(job_id) = self.state.find_job_by_engine_job(engine_job_id).cloned() {
            if let Some(job) = self.state.get_job_mut(&job_id) {
                job.completed_events.send_modify(|count| *count += 1);
            }
        }
        ActorAction::Continue
    }

    pub(super) fn handle_engine_task_ended(
        &mut self,
        ctx: &mut ActorContext<Self>,
        stage_id: StageId,
        task_id: TaskId,
        succeeded: bool,
        speculative: bool,
        metrics: TaskMetrics,
    ) -> ActorAction {
        // Failed and speculative task attempts carry no metrics worth
        // forwarding.
        if !succeeded || speculative {
            return ActorAction::Continue;
        }
        match self.tracker.resolve_stage(stage_id) {
            Some(StageOwner {
                engine_job_id,
                job_id: Some(job_id),
            }) => {
                let protocol = Arc::clone(&self.options().protocol);
                let job_id = job_id.clone();
                let engine_job_id = *engine_job_id;
                ctx.spawn(async move {
                    if let Err(e) = protocol
                        .task_metrics(&job_id, engine_job_id, stage_id, task_id, &metrics)
                        .await
                    {
                        warn!("failed to forward metrics for task {task_id}: {e}");
                    }
                });
            }
            _ => {
                debug!("dropping metrics for unmapped task {task_id} in stage {stage_id}");
            }
        }
        ActorAction::Continue
    }

    pub(super) fn handle_probe_idle_session(
        &mut self,
        _ctx: &mut ActorContext<Self>,
    ) -> ActorAction {
        let Some(timeout) = self.options().session_idle_timeout else {
            return ActorAction::Continue;
        };
        if self.tracker.has_live_stages() {
            debug!(
                "{} stages are still running; skipping the idle check",
                self.tracker.live_stage_count()
            );
            return ActorAction::Continue;
        }
        if self.tracker.idle_expired(timeout) {
            info!("the session has been idle for more than {timeout:?}; shutting down");
            self.options().shutdown.trigger(None);
        }
        ActorAction::Continue
    }

    pub(super) fn handle_end_session(&mut self, _ctx: &mut ActorContext<Self>) -> ActorAction {
        debug!("shutting down due to an end-session request");
        self.options().shutdown.trigger(None);
        ActorAction::Continue
    }

    pub(super) fn handle_shutdown(
        &mut self,
        ctx: &mut ActorContext<Self>,
        error: Option<String>,
    ) -> ActorAction {
        match &error {
            None => info!("shutting down the driver"),
            Some(e) => error!("shutting down the driver due to an error: {e}"),
        }
        // Cancel and drop every live job. Cancellation sends no message;
        // queued jobs are discarded without ever starting.
        if self.state.job_count() > 0 {
            info!("canceling {} live jobs", self.state.job_count());
        }
        for job_id in self.state.job_ids() {
            if let Some(mut job) = self.state.remove_job(&job_id) {
                for subtask in &job.subtasks {
                    subtask.cancel();
                }
                if let Some(cancel) = job.cancel.take() {
                    let _ = cancel.send(());
                }
                if let Some(runner) = job.runner.take() {
                    runner.abort();
                }
                self.release_cached_resources(ctx, &job);
            }
        }
        self.state.clear_queue();
        self.tracker.clear();
        self.pending_error = error;
        ActorAction::Stop
    }
}
