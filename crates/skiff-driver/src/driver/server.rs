use std::sync::Arc;

use log::debug;
use skiff_server::actor::ActorHandle;
use tonic::{Request, Response, Status};

use crate::driver::actor::DriverActor;
use crate::driver::gate::ContextGate;
use crate::driver::gen::driver_service_server::DriverService;
use crate::driver::gen::{
    CancelJobRequest, CancelJobResponse, EndSessionRequest, EndSessionResponse, RunJobSyncRequest,
    RunJobSyncResponse, SubmitJobRequest, SubmitJobResponse,
};
use crate::driver::DriverEvent;
use crate::error::DriverError;
use crate::id::JobId;
use crate::job::{JobCodec, JobMonitor};

/// The inbound half of the protocol: the gRPC service through which the
/// controlling client drives this process.
pub struct DriverGrpcService {
    handle: ActorHandle<DriverActor>,
    gate: Arc<ContextGate>,
    codec: Arc<dyn JobCodec>,
}

impl DriverGrpcService {
    pub fn new(
        handle: ActorHandle<DriverActor>,
        gate: Arc<ContextGate>,
        codec: Arc<dyn JobCodec>,
    ) -> Self {
        Self {
            handle,
            gate,
            codec,
        }
    }
}

#[tonic::async_trait]
impl DriverService for DriverGrpcService {
    async fn submit_job(
        &self,
        request: Request<SubmitJobRequest>,
    ) -> Result<Response<SubmitJobResponse>, Status> {
        let SubmitJobRequest { job_id, job } = request.into_inner();
        debug!("received job request {job_id}");
        let job = self
            .codec
            .decode_job(&job)
            .map_err(|e| Status::invalid_argument(format!("failed to decode the job: {e}")))?;
        let event = DriverEvent::SubmitJob {
            job_id: JobId::from(job_id),
            job,
        };
        self.handle.send(event).await.map_err(DriverError::from)?;
        Ok(Response::new(SubmitJobResponse {}))
    }

    async fn run_job_sync(
        &self,
        request: Request<RunJobSyncRequest>,
    ) -> Result<Response<RunJobSyncResponse>, Status> {
        let RunJobSyncRequest { job } = request.into_inner();
        // The context may not be up yet; this call is supposed to be
        // synchronous, so wait for it on the handler task.
        let context = self.gate.wait_ready().await.map_err(Status::from)?;
        let job = self
            .codec
            .decode_job(&job)
            .map_err(|e| Status::invalid_argument(format!("failed to decode the job: {e}")))?;
        let monitor = JobMonitor::sync();
        let result = job.run(context, &monitor).await.map_err(Status::from)?;
        Ok(Response::new(RunJobSyncResponse { result }))
    }

    async fn cancel_job(
        &self,
        request: Request<CancelJobRequest>,
    ) -> Result<Response<CancelJobResponse>, Status> {
        let CancelJobRequest { job_id } = request.into_inner();
        debug!("received a cancel request for job {job_id}");
        let event = DriverEvent::CancelJob {
            job_id: JobId::from(job_id),
        };
        self.handle.send(event).await.map_err(DriverError::from)?;
        Ok(Response::new(CancelJobResponse {}))
    }

    async fn end_session(
        &self,
        request: Request<EndSessionRequest>,
    ) -> Result<Response<EndSessionResponse>, Status> {
        let EndSessionRequest {} = request.into_inner();
        self.handle
            .send(DriverEvent::EndSession)
            .await
            .map_err(DriverError::from)?;
        Ok(Response::new(EndSessionResponse {}))
    }
}
