use std::mem;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use skiff_server::actor::{Actor, ActorAction, ActorContext};

use crate::driver::event::DriverEvent;
use crate::driver::options::DriverOptions;
use crate::driver::state::DriverState;
use crate::driver::tracker::EventTracker;
use crate::engine::EngineSession;
use crate::rpc::ServerMonitor;

/// The coordinator that owns the job registry and the stage tracker. All
/// registry mutation flows through this actor's mailbox, whether it comes
/// from RPC handlers, job runners, the engine event feed, or timers.
pub struct DriverActor {
    options: DriverOptions,
    pub(super) state: DriverState,
    pub(super) tracker: EventTracker,
    pub(super) server: ServerMonitor,
    pub(super) pending_error: Option<String>,
}

#[async_trait]
impl Actor for DriverActor {
    type Message = DriverEvent;
    type Options = DriverOptions;

    fn new(options: DriverOptions) -> Self {
        Self {
            options,
            state: DriverState::new(),
            tracker: EventTracker::new(),
            server: ServerMonitor::new(),
            pending_error: None,
        }
    }

    async fn start(&mut self, ctx: &mut ActorContext<Self>) {
        // Shutdown may be triggered from any task; the coordinator feed
        // turns the first trigger into a mailbox message.
        if let Some(mut feed) = self.options.shutdown.take_feed() {
            let handle = ctx.handle().clone();
            ctx.spawn(async move {
                while let Some(error) = feed.recv().await {
                    if handle.send(DriverEvent::Shutdown { error }).await.is_err() {
                        break;
                    }
                }
            });
        }

        // The engine can take arbitrarily long to come up, or fail to;
        // jobs queue until the context is published.
        let builder = Arc::clone(&self.options.engine_builder);
        let scratch_dir = self.options.scratch_dir.clone();
        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            match builder.build(&scratch_dir).await {
                Ok(EngineSession { engine, events }) => {
                    let _ = handle
                        .send(DriverEvent::ContextReady { engine, events })
                        .await;
                }
                Err(e) => {
                    let _ = handle
                        .send(DriverEvent::StartupFailed {
                            error: format!("failed to build the execution engine: {e}"),
                        })
                        .await;
                }
            }
        });

        self.start_server(ctx).await;
    }

    fn receive(&mut self, ctx: &mut ActorContext<Self>, message: DriverEvent) -> ActorAction {
        match message {
            DriverEvent::ServerReady { port, signal } => {
                self.handle_server_ready(ctx, port, signal)
            }
            DriverEvent::ContextReady { engine, events } => {
                self.handle_context_ready(ctx, engine, events)
            }
            DriverEvent::StartupFailed { error } => self.handle_startup_failed(ctx, error),
            DriverEvent::SubmitJob { job_id, job } => self.handle_submit_job(ctx, job_id, job),
            DriverEvent::CancelJob { job_id } => self.handle_cancel_job(ctx, job_id),
            DriverEvent::EndSession => self.handle_end_session(ctx),
            DriverEvent::SubTaskRegistered {
                job_id,
                subtask,
                engine_job_id,
                cached_resources,
            } => self.handle_sub_task_registered(ctx, job_id, subtask, engine_job_id, cached_resources),
            DriverEvent::JobRunning { job_id } => self.handle_job_running(ctx, job_id),
            DriverEvent::JobEnded { job_id, outcome } => {
                self.handle_job_ended(ctx, job_id, outcome)
            }
            DriverEvent::EngineJobStarted {
                engine_job_id,
                stage_ids,
            } => self.handle_engine_job_started(ctx, engine_job_id, stage_ids),
            DriverEvent::EngineJobEnded { engine_job_id } => {
                self.handle_engine_job_ended(ctx, engine_job_id)
            }
            DriverEvent::EngineTaskEnded {
                stage_id,
                task_id,
                succeeded,
                speculative,
                metrics,
            } => self.handle_engine_task_ended(ctx, stage_id, task_id, succeeded, speculative, metrics),
            DriverEvent::ProbeIdleSession => self.handle_probe_idle_session(ctx),
            DriverEvent::Shutdown { error } => self.handle_shutdown(ctx, error),
        }
    }

    async fn stop(mut self, _ctx: &mut ActorContext<Self>) {
        // Error delivery is the one outbound call the teardown waits for;
        // the protocol bounds it with the configured RPC timeout.
        if let Some(message) = self.pending_error.take() {
            if let Err(e) = self.options.protocol.error_message(&message).await {
                warn!("failed to deliver the shutdown error to the client: {e}");
            }
        }
        if let Some(context) = self.options.gate.try_get() {
            if let Err(e) = context.engine().stop().await {
                warn!("failed to stop the execution engine: {e}");
            }
        }
        let server = mem::take(&mut self.server);
        server.stop().await;
        debug!("the driver has stopped");
    }
}

impl DriverActor {
    pub(super) fn options(&self) -> &DriverOptions {
        &self.options
    }
}
