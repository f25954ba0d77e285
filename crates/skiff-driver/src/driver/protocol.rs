use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tonic::transport::Channel;
use tonic::{Code, Request, Status};

use crate::counter::CounterSnapshot;
use crate::driver::auth::{AuthInterceptor, CLIENT_ID_HEADER, SECRET_HEADER};
use crate::driver::gen;
use crate::driver::gen::client_service_client::ClientServiceClient;
use crate::driver::shutdown::ShutdownCoordinator;
use crate::engine::TaskMetrics;
use crate::error::{DriverError, DriverResult};
use crate::id::{EngineJobId, JobId, StageId, TaskId};
use crate::rpc::{ClientHandle, ClientOptions};

/// The outbound half of the protocol: notifications the driver sends to
/// the controlling client. Calls are awaited under the configured timeout;
/// failures are reported to the caller and never retried here, since the
/// client owns its own retry policy.
#[async_trait]
pub trait ClientProtocol: Send + Sync {
    async fn job_started(&self, job_id: &JobId) -> DriverResult<()>;

    async fn job_submitted(&self, job_id: &JobId, engine_job_id: EngineJobId) -> DriverResult<()>;

    async fn task_metrics(
        &self,
        job_id: &JobId,
        engine_job_id: EngineJobId,
        stage_id: StageId,
        task_id: TaskId,
        metrics: &TaskMetrics,
    ) -> DriverResult<()>;

    async fn job_result(
        &self,
        job_id: &JobId,
        result: Option<Vec<u8>>,
        error: Option<String>,
        counters: Option<CounterSnapshot>,
    ) -> DriverResult<()>;

    async fn error_message(&self, message: &str) -> DriverResult<()>;
}

pub struct GrpcClientProtocol {
    client: ClientHandle<ClientServiceClient<Channel>>,
    auth: AuthInterceptor,
    timeout: Duration,
    shutdown: ShutdownCoordinator,
}

impl GrpcClientProtocol {
    pub fn new(
        options: ClientOptions,
        client_id: &str,
        secret: &str,
        timeout: Duration,
        shutdown: ShutdownCoordinator,
    ) -> DriverResult<Self> {
        Ok(Self {
            client: ClientHandle::new(options),
            auth: AuthInterceptor::new(client_id, secret)?,
            timeout,
            shutdown,
        })
    }

    async fn client(&self) -> DriverResult<ClientServiceClient<Channel>> {
        match self.client.get().await {
            Ok(client) => Ok(client),
            Err(e @ DriverError::TonicTransportError(_)) => {
                self.connection_lost();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn connection_lost(&self) {
        if self.shutdown.trigger(None) {
            warn!("shutting down the driver because the connection to the client was lost");
        }
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        request
            .metadata_mut()
            .insert(CLIENT_ID_HEADER, self.auth.client_id().clone());
        request
            .metadata_mut()
            .insert(SECRET_HEADER, self.auth.secret().clone());
        request
    }

    async fn wait<T>(
        &self,
        call: impl Future<Output = Result<T, Status>> + Send,
    ) -> DriverResult<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(status)) => {
                if status.code() == Code::Unavailable {
                    self.connection_lost();
                }
                Err(status.into())
            }
            Err(_) => Err(DriverError::InternalError(format!(
                "RPC call timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

#[async_trait]
impl ClientProtocol for GrpcClientProtocol {
    async fn job_started(&self, job_id: &JobId) -> DriverResult<()> {
        let mut client = self.client().await?;
        let request = self.request(gen::JobStartedNotice {
            job_id: job_id.to_string(),
        });
        self.wait(client.notify_job_started(request)).await?;
        Ok(())
    }

    async fn job_submitted(&self, job_id: &JobId, engine_job_id: EngineJobId) -> DriverResult<()> {
        debug!("sending job ({job_id}/{engine_job_id}) submitted to the client");
        let mut client = self.client().await?;
        let request = self.request(gen::JobSubmittedNotice {
            job_id: job_id.to_string(),
            engine_job_id: engine_job_id.into(),
        });
        self.wait(client.notify_job_submitted(request)).await?;
        Ok(())
    }

    async fn task_metrics(
        &self,
        job_id: &JobId,
        engine_job_id: EngineJobId,
        stage_id: StageId,
        task_id: TaskId,
        metrics: &TaskMetrics,
    ) -> DriverResult<()> {
        debug!("sending task ({job_id}/{engine_job_id}/{stage_id}/{task_id}) metrics to the client");
        let mut client = self.client().await?;
        let request = self.request(gen::TaskMetricsNotice {
            job_id: job_id.to_string(),
            engine_job_id: engine_job_id.into(),
            stage_id: stage_id.into(),
            task_id: task_id.into(),
            metrics: Some(metrics.into()),
        });
        self.wait(client.notify_task_metrics(request)).await?;
        Ok(())
    }

    async fn job_result(
        &self,
        job_id: &JobId,
        result: Option<Vec<u8>>,
        error: Option<String>,
        counters: Option<CounterSnapshot>,
    ) -> DriverResult<()> {
        debug!("sending job {job_id} result to the client");
        let mut client = self.client().await?;
        let request = self.request(gen::JobResultNotice {
            job_id: job_id.to_string(),
            result,
            error,
            counters: counters.map(Into::into),
        });
        self.wait(client.notify_job_result(request)).await?;
        Ok(())
    }

    async fn error_message(&self, message: &str) -> DriverResult<()> {
        debug!("sending error to the client: {message}");
        let mut client = self.client().await?;
        let request = self.request(gen::ErrorNotice {
            message: message.to_string(),
        });
        self.wait(client.notify_error(request)).await?;
        Ok(())
    }
}

impl From<&TaskMetrics> for gen::TaskMetrics {
    fn from(metrics: &TaskMetrics) -> Self {
        Self {
            run_time_ms: metrics.run_time_ms,
            cpu_time_ms: metrics.cpu_time_ms,
            result_size_bytes: metrics.result_size_bytes,
            memory_bytes_spilled: metrics.memory_bytes_spilled,
            disk_bytes_spilled: metrics.disk_bytes_spilled,
            input_bytes_read: metrics.input_bytes_read,
            output_bytes_written: metrics.output_bytes_written,
        }
    }
}

impl From<CounterSnapshot> for gen::CounterSnapshot {
    fn from(snapshot: CounterSnapshot) -> Self {
        Self {
            counters: snapshot
                .counters
                .into_iter()
                .map(|counter| gen::CounterValue {
                    group: counter.group,
                    name: counter.name,
                    value: counter.value,
                })
                .collect(),
        }
    }
}
