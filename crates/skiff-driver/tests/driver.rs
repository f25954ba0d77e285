use std::any::Any;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use skiff_common::config::{AppConfig, DriverConfig};
use skiff_driver::counter::{CounterSet, CounterSnapshot};
use skiff_driver::driver::gen::driver_service_server::DriverService;
use skiff_driver::driver::gen::{RunJobSyncRequest, SubmitJobRequest};
use skiff_driver::driver::{
    ClientProtocol, ContextGate, DriverActor, DriverEvent, DriverGrpcService, DriverOptions,
    ShutdownCoordinator,
};
use skiff_driver::engine::{
    Engine, EngineBuilder, EngineJobStatus, EngineSession, SubTask, TaskMetrics,
};
use skiff_driver::error::{DriverError, DriverResult};
use skiff_driver::job::{Job, JobCodec, JobContext, JobMonitor};
use skiff_driver::{CacheId, EngineJobId, JobId, StageId, TaskId};
use skiff_server::actor::{ActorHandle, ActorSystem};
use tokio::sync::{mpsc, Notify};
use tonic::Request;

#[derive(Debug, Clone, PartialEq)]
enum Notice {
    Started(String),
    Submitted(String, u64),
    Metrics(String, u64, u64, u64),
    Result {
        job_id: String,
        result: Option<Vec<u8>>,
        error: Option<String>,
        counters: Option<CounterSnapshot>,
    },
    Error(String),
}

#[derive(Default)]
struct RecordingProtocol {
    notices: Mutex<Vec<Notice>>,
    changed: Notify,
}

impl RecordingProtocol {
    fn push(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
        self.changed.notify_waiters();
    }

    fn snapshot(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }

    async fn wait_until(&self, predicate: impl Fn(&[Notice]) -> bool) {
        loop {
            let notified = self.changed.notified();
            if predicate(&self.notices.lock().unwrap()) {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ClientProtocol for RecordingProtocol {
    async fn job_started(&self, job_id: &JobId) -> DriverResult<()> {
        self.push(Notice::Started(job_id.to_string()));
        Ok(())
    }

    async fn job_submitted(&self, job_id: &JobId, engine_job_id: EngineJobId) -> DriverResult<()> {
        self.push(Notice::Submitted(job_id.to_string(), engine_job_id.into()));
        Ok(())
    }

    async fn task_metrics(
        &self,
        job_id: &JobId,
        engine_job_id: EngineJobId,
        stage_id: StageId,
        task_id: TaskId,
        _metrics: &TaskMetrics,
    ) -> DriverResult<()> {
        self.push(Notice::Metrics(
            job_id.to_string(),
            engine_job_id.into(),
            stage_id.into(),
            task_id.into(),
        ));
        Ok(())
    }

    async fn job_result(
        &self,
        job_id: &JobId,
        result: Option<Vec<u8>>,
        error: Option<String>,
        counters: Option<CounterSnapshot>,
    ) -> DriverResult<()> {
        self.push(Notice::Result {
            job_id: job_id.to_string(),
            result,
            error,
            counters,
        });
        Ok(())
    }

    async fn error_message(&self, message: &str) -> DriverResult<()> {
        self.push(Notice::Error(message.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct MockEngine {
    stages: Mutex<HashMap<u64, Vec<u64>>>,
    released: Mutex<Vec<CacheId>>,
    stops: AtomicUsize,
}

impl MockEngine {
    fn set_stages(&self, engine_job_id: u64, stage_ids: Vec<u64>) {
        self.stages.lock().unwrap().insert(engine_job_id, stage_ids);
    }

    fn released(&self) -> Vec<CacheId> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn job_status(
        &self,
        engine_job_id: EngineJobId,
    ) -> DriverResult<Option<EngineJobStatus>> {
        Ok(self
            .stages
            .lock()
            .unwrap()
            .get(&engine_job_id.into())
            .map(|stage_ids| EngineJobStatus {
                stage_ids: stage_ids.iter().map(|&id| StageId::from(id)).collect(),
            }))
    }

    async fn release_cached(&self, cache_id: CacheId) -> DriverResult<()> {
        self.released.lock().unwrap().push(cache_id);
        Ok(())
    }

    async fn stop(&self) -> DriverResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct MockEngineBuilder {
    engine: Arc<MockEngine>,
    /// When set, engine construction blocks until notified, which keeps
    /// the execution context unpublished.
    ready: Option<Arc<Notify>>,
}

#[async_trait]
impl EngineBuilder for MockEngineBuilder {
    async fn build(&self, _scratch_dir: &Path) -> DriverResult<EngineSession> {
        if let Some(ready) = &self.ready {
            ready.notified().await;
        }
        let (_tx, events) = mpsc::unbounded_channel();
        Ok(EngineSession {
            engine: Arc::clone(&self.engine) as Arc<dyn Engine>,
            events,
        })
    }
}

struct FailingEngineBuilder;

#[async_trait]
impl EngineBuilder for FailingEngineBuilder {
    async fn build(&self, _scratch_dir: &Path) -> DriverResult<EngineSession> {
        Err(DriverError::InternalError("engine exploded".to_string()))
    }
}

/// Decodes any payload into a job that returns the payload unchanged.
struct EchoCodec;

impl JobCodec for EchoCodec {
    fn decode_job(&self, data: &[u8]) -> DriverResult<Box<dyn Job>> {
        Ok(Box::new(PlainJob {
            result: data.to_vec(),
        }))
    }
}

struct PlainJob {
    result: Vec<u8>,
}

#[async_trait]
impl Job for PlainJob {
    async fn run(&self, _context: Arc<JobContext>, _monitor: &JobMonitor) -> DriverResult<Vec<u8>> {
        Ok(self.result.clone())
    }
}

struct ImmediateSubTask {
    ids: Vec<EngineJobId>,
}

#[async_trait]
impl SubTask for ImmediateSubTask {
    fn engine_job_ids(&self) -> Vec<EngineJobId> {
        self.ids.clone()
    }

    async fn wait(&self) -> DriverResult<()> {
        Ok(())
    }

    fn cancel(&self) {}
}

/// Registers one immediate sub-task per engine job ID, then succeeds or
/// fails as configured.
struct MonitoredJob {
    engine_job_ids: Vec<u64>,
    cached: Vec<u64>,
    fail: bool,
}

#[async_trait]
impl Job for MonitoredJob {
    async fn run(&self, _context: Arc<JobContext>, monitor: &JobMonitor) -> DriverResult<Vec<u8>> {
        let counters = Arc::new(CounterSet::new());
        let registrations = counters.counter("test", "registrations");
        for (index, &engine_job_id) in self.engine_job_ids.iter().enumerate() {
            let cached = if index == 0 {
                self.cached.iter().map(|&id| CacheId::from(id)).collect()
            } else {
                vec![]
            };
            monitor
                .register(
                    Arc::new(ImmediateSubTask {
                        ids: vec![EngineJobId::from(engine_job_id)],
                    }),
                    Some(Arc::clone(&counters)),
                    cached,
                )
                .await?;
            registrations.add(1);
        }
        if self.fail {
            return Err(DriverError::InternalError("boom".to_string()));
        }
        Ok(b"ok".to_vec())
    }
}

/// Runs until canceled.
struct BlockedJob;

#[async_trait]
impl Job for BlockedJob {
    async fn run(&self, _context: Arc<JobContext>, _monitor: &JobMonitor) -> DriverResult<Vec<u8>> {
        std::future::pending().await
    }
}

/// A job that tries to register a sub-task, for exercising the
/// synchronous path where registration is rejected.
struct RegisteringJob;

#[async_trait]
impl Job for RegisteringJob {
    async fn run(&self, _context: Arc<JobContext>, monitor: &JobMonitor) -> DriverResult<Vec<u8>> {
        monitor
            .register(Arc::new(ImmediateSubTask { ids: vec![] }), None, vec![])
            .await?;
        Ok(vec![])
    }
}

struct RegisteringCodec;

impl JobCodec for RegisteringCodec {
    fn decode_job(&self, _data: &[u8]) -> DriverResult<Box<dyn Job>> {
        Ok(Box::new(RegisteringJob))
    }
}

struct TestDriver {
    system: ActorSystem,
    handle: ActorHandle<DriverActor>,
    protocol: Arc<RecordingProtocol>,
    engine: Arc<MockEngine>,
    gate: Arc<ContextGate>,
    shutdown: ShutdownCoordinator,
}

impl TestDriver {
    /// Spawns a driver whose engine comes up immediately, or, when `ready`
    /// is given, only after it is notified.
    fn spawn(idle_secs: u64, ready: Option<Arc<Notify>>) -> Self {
        let engine = Arc::new(MockEngine::default());
        let builder = Arc::new(MockEngineBuilder {
            engine: Arc::clone(&engine),
            ready,
        });
        Self::spawn_with_builder(idle_secs, builder, engine)
    }

    fn spawn_with_builder(
        idle_secs: u64,
        engine_builder: Arc<dyn EngineBuilder>,
        engine: Arc<MockEngine>,
    ) -> Self {
        let config = AppConfig {
            driver: DriverConfig {
                client_id: "client-1".to_string(),
                secret: "secret".to_string(),
                listen_host: "127.0.0.1".to_string(),
                listen_port: 0,
                callback_host: "127.0.0.1".to_string(),
                callback_port: 0,
                rpc_timeout_ms: 1000,
                rpc_thread_count: 2,
                session_idle_timeout_secs: idle_secs,
            },
        };
        let shutdown = ShutdownCoordinator::new();
        let gate = Arc::new(ContextGate::new(shutdown.watch_running()));
        let protocol = Arc::new(RecordingProtocol::default());
        let options = DriverOptions::new(
            &config,
            std::env::temp_dir(),
            Arc::clone(&gate),
            engine_builder,
            Arc::new(EchoCodec),
            Arc::clone(&protocol) as Arc<dyn ClientProtocol>,
            shutdown.clone(),
        );
        let mut system = ActorSystem::new();
        let handle = system.spawn::<DriverActor>(options);
        Self {
            system,
            handle,
            protocol,
            engine,
            gate,
            shutdown,
        }
    }

    async fn submit(&self, job_id: &str, job: impl Job + 'static) {
        self.handle
            .send(DriverEvent::SubmitJob {
                job_id: JobId::from(job_id),
                job: Box::new(job),
            })
            .await
            .unwrap();
    }

    async fn wait_for(&self, predicate: impl Fn(&[Notice]) -> bool) {
        tokio::time::timeout(Duration::from_secs(10), self.protocol.wait_until(predicate))
            .await
            .expect("timed out waiting for protocol notices");
    }
}

fn started_ids(notices: &[Notice]) -> Vec<String> {
    notices
        .iter()
        .filter_map(|notice| match notice {
            Notice::Started(job_id) => Some(job_id.clone()),
            _ => None,
        })
        .collect()
}

fn result_count(notices: &[Notice]) -> usize {
    notices
        .iter()
        .filter(|notice| matches!(notice, Notice::Result { .. }))
        .count()
}

#[tokio::test]
async fn test_jobs_queued_before_context_dispatch_in_order() {
    let ready = Arc::new(Notify::new());
    let driver = TestDriver::spawn(0, Some(Arc::clone(&ready)));

    for job_id in ["j1", "j2", "j3"] {
        driver
            .submit(job_id, PlainJob {
                result: job_id.as_bytes().to_vec(),
            })
            .await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(driver.protocol.snapshot().is_empty());

    ready.notify_one();
    driver
        .wait_for(|notices| started_ids(notices).len() == 3 && result_count(notices) == 3)
        .await;

    let notices = driver.protocol.snapshot();
    assert_eq!(started_ids(&notices), vec!["j1", "j2", "j3"]);
    assert!(!notices
        .iter()
        .any(|notice| matches!(notice, Notice::Submitted(_, _))));
}

#[tokio::test]
async fn test_job_without_subtasks_completes_without_engine_events() {
    let driver = TestDriver::spawn(0, None);
    driver
        .submit("j1", PlainJob {
            result: b"out".to_vec(),
        })
        .await;
    driver.wait_for(|notices| result_count(notices) == 1).await;

    let notices = driver.protocol.snapshot();
    assert_eq!(started_ids(&notices), vec!["j1"]);
    assert!(!notices
        .iter()
        .any(|notice| matches!(notice, Notice::Submitted(_, _))));
    let Some(Notice::Result {
        job_id,
        result,
        error,
        counters,
    }) = notices
        .iter()
        .find(|notice| matches!(notice, Notice::Result { .. }))
    else {
        panic!("expected a result notice");
    };
    assert_eq!(job_id, "j1");
    assert_eq!(result.as_deref(), Some(b"out".as_slice()));
    assert!(error.is_none());
    assert!(counters.is_none());
}

#[tokio::test]
async fn test_job_with_subtasks_waits_for_completion_events() {
    let driver = TestDriver::spawn(0, None);
    driver.engine.set_stages(7, vec![70]);
    driver.engine.set_stages(8, vec![80]);

    driver
        .submit("j2", MonitoredJob {
            engine_job_ids: vec![7, 8],
            cached: vec![],
            fail: false,
        })
        .await;

    // The first registration fixes the reported engine job ID.
    driver
        .wait_for(|notices| {
            notices
                .iter()
                .any(|notice| matches!(notice, Notice::Submitted(_, _)))
        })
        .await;
    let notices = driver.protocol.snapshot();
    let submitted: Vec<_> = notices
        .iter()
        .filter(|notice| matches!(notice, Notice::Submitted(_, _)))
        .collect();
    assert_eq!(submitted, vec![&Notice::Submitted("j2".to_string(), 7)]);

    // The job must stay open until one completion event per sub-task has
    // been observed.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(result_count(&driver.protocol.snapshot()), 0);

    driver
        .handle
        .send(DriverEvent::EngineJobEnded {
            engine_job_id: EngineJobId::from(7),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(result_count(&driver.protocol.snapshot()), 0);

    driver
        .handle
        .send(DriverEvent::EngineJobEnded {
            engine_job_id: EngineJobId::from(8),
        })
        .await
        .unwrap();
    driver.wait_for(|notices| result_count(notices) == 1).await;

    let notices = driver.protocol.snapshot();
    let Some(Notice::Result { error, counters, .. }) = notices
        .iter()
        .find(|notice| matches!(notice, Notice::Result { .. }))
    else {
        panic!("expected a result notice");
    };
    assert!(error.is_none());
    let counters = counters.as_ref().expect("expected a counter snapshot");
    assert_eq!(counters.counters[0].value, 2);
}

#[tokio::test]
async fn test_task_metrics_forwarded_for_mapped_stages_only() {
    let driver = TestDriver::spawn(0, None);
    driver.engine.set_stages(7, vec![70]);

    driver
        .submit("j3", MonitoredJob {
            engine_job_ids: vec![7],
            cached: vec![],
            fail: false,
        })
        .await;
    driver
        .wait_for(|notices| {
            notices
                .iter()
                .any(|notice| matches!(notice, Notice::Submitted(_, _)))
        })
        .await;

    driver
        .handle
        .send(DriverEvent::EngineJobStarted {
            engine_job_id: EngineJobId::from(7),
            stage_ids: vec![StageId::from(70)],
        })
        .await
        .unwrap();
    // A successful task in a mapped stage is forwarded.
    driver
        .handle
        .send(DriverEvent::EngineTaskEnded {
            stage_id: StageId::from(70),
            task_id: TaskId::from(700),
            succeeded: true,
            speculative: false,
            metrics: TaskMetrics::default(),
        })
        .await
        .unwrap();
    // Speculative, failed, and unmapped tasks are dropped.
    driver
        .handle
        .send(DriverEvent::EngineTaskEnded {
            stage_id: StageId::from(70),
            task_id: TaskId::from(701),
            succeeded: true,
            speculative: true,
            metrics: TaskMetrics::default(),
        })
        .await
        .unwrap();
    driver
        .handle
        .send(DriverEvent::EngineTaskEnded {
            stage_id: StageId::from(70),
            task_id: TaskId::from(702),
            succeeded: false,
            speculative: false,
            metrics: TaskMetrics::default(),
        })
        .await
        .unwrap();
    driver
        .handle
        .send(DriverEvent::EngineTaskEnded {
            stage_id: StageId::from(999),
            task_id: TaskId::from(703),
            succeeded: true,
            speculative: false,
            metrics: TaskMetrics::default(),
        })
        .await
        .unwrap();
    driver
        .handle
        .send(DriverEvent::EngineJobEnded {
            engine_job_id: EngineJobId::from(7),
        })
        .await
        .unwrap();

    driver.wait_for(|notices| result_count(notices) == 1).await;
    let metrics: Vec<_> = driver
        .protocol
        .snapshot()
        .into_iter()
        .filter(|notice| matches!(notice, Notice::Metrics(_, _, _, _)))
        .collect();
    assert_eq!(
        metrics,
        vec![Notice::Metrics("j3".to_string(), 7, 70, 700)]
    );
}

#[tokio::test]
async fn test_failed_job_reports_error_and_releases_cache() {
    let driver = TestDriver::spawn(0, None);
    driver
        .submit("j4", MonitoredJob {
            engine_job_ids: vec![9],
            cached: vec![42],
            fail: true,
        })
        .await;

    driver.wait_for(|notices| result_count(notices) == 1).await;
    let notices = driver.protocol.snapshot();
    let Some(Notice::Result {
        result,
        error,
        counters,
        ..
    }) = notices
        .iter()
        .find(|notice| matches!(notice, Notice::Result { .. }))
    else {
        panic!("expected a result notice");
    };
    assert!(result.is_none());
    assert!(error.as_deref().unwrap_or_default().contains("boom"));
    assert!(counters.is_some());

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if driver.engine.released().contains(&CacheId::from(42)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for the cached resource release");

    // One job failing must not affect later jobs.
    driver
        .submit("j5", PlainJob {
            result: b"ok".to_vec(),
        })
        .await;
    driver.wait_for(|notices| result_count(notices) == 2).await;
}

#[tokio::test]
async fn test_cancel_unknown_job_is_noop() {
    let driver = TestDriver::spawn(0, None);
    driver
        .handle
        .send(DriverEvent::CancelJob {
            job_id: JobId::from("unknown"),
        })
        .await
        .unwrap();

    // The driver keeps serving jobs and sends nothing for the unknown ID.
    driver
        .submit("j6", PlainJob {
            result: b"ok".to_vec(),
        })
        .await;
    driver.wait_for(|notices| result_count(notices) == 1).await;
    assert!(!driver
        .protocol
        .snapshot()
        .iter()
        .any(|notice| matches!(notice, Notice::Error(_))));
}

#[tokio::test]
async fn test_cancel_running_job_sends_no_result() {
    let driver = TestDriver::spawn(0, None);
    driver.submit("j7", BlockedJob).await;
    driver
        .wait_for(|notices| !started_ids(notices).is_empty())
        .await;

    driver
        .handle
        .send(DriverEvent::CancelJob {
            job_id: JobId::from("j7"),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(result_count(&driver.protocol.snapshot()), 0);

    // The registry slot is free again; the driver is still healthy.
    driver
        .submit("j8", PlainJob {
            result: b"ok".to_vec(),
        })
        .await;
    driver.wait_for(|notices| result_count(notices) == 1).await;
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_triggers_shutdown_without_error() {
    let mut driver = TestDriver::spawn(60, None);
    driver.gate.wait_ready().await.unwrap();

    driver.handle.clone().wait_for_stop().await;
    driver.system.join().await;

    assert!(!driver.shutdown.is_running());
    assert!(driver.shutdown.cause().is_none());
    assert_eq!(driver.engine.stops.load(Ordering::SeqCst), 1);
    assert!(!driver
        .protocol
        .snapshot()
        .iter()
        .any(|notice| matches!(notice, Notice::Error(_))));
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_defers_to_live_stages() {
    let driver = TestDriver::spawn(60, None);
    driver.gate.wait_ready().await.unwrap();

    driver
        .handle
        .send(DriverEvent::EngineJobStarted {
            engine_job_id: EngineJobId::from(1),
            stage_ids: vec![StageId::from(10)],
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Stages are live, so no amount of elapsed time may shut the
    // driver down.
    tokio::time::advance(Duration::from_secs(300)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(driver.shutdown.is_running());

    // Once the mapping empties, the idle clock starts from the job end.
    driver
        .handle
        .send(DriverEvent::EngineJobEnded {
            engine_job_id: EngineJobId::from(1),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(driver.shutdown.is_running());

    driver.handle.clone().wait_for_stop().await;
    assert!(!driver.shutdown.is_running());
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let mut driver = TestDriver::spawn(0, None);
    driver.gate.wait_ready().await.unwrap();

    driver.handle.send(DriverEvent::EndSession).await.unwrap();
    driver.handle.send(DriverEvent::EndSession).await.unwrap();
    driver.shutdown.trigger(None);

    driver.handle.clone().wait_for_stop().await;
    driver.system.join().await;

    assert!(!driver.shutdown.is_running());
    assert_eq!(driver.engine.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_shutdown_cancels_live_jobs_without_messages() {
    let mut driver = TestDriver::spawn(0, None);
    driver.gate.wait_ready().await.unwrap();
    driver.submit("j9", BlockedJob).await;
    driver
        .wait_for(|notices| !started_ids(notices).is_empty())
        .await;

    driver.handle.send(DriverEvent::EndSession).await.unwrap();
    driver.handle.clone().wait_for_stop().await;
    driver.system.join().await;

    assert_eq!(result_count(&driver.protocol.snapshot()), 0);
}

#[tokio::test]
async fn test_startup_failure_reports_error_to_client() {
    let mut driver = TestDriver::spawn_with_builder(
        0,
        Arc::new(FailingEngineBuilder),
        Arc::new(MockEngine::default()),
    );
    driver.handle.clone().wait_for_stop().await;
    driver.system.join().await;

    assert!(driver
        .shutdown
        .cause()
        .unwrap_or_default()
        .contains("engine exploded"));
    assert!(driver
        .protocol
        .snapshot()
        .iter()
        .any(|notice| matches!(notice, Notice::Error(message) if message.contains("engine exploded"))));
}

#[tokio::test]
async fn test_submit_job_through_the_grpc_service() {
    let driver = TestDriver::spawn(0, None);
    let service = DriverGrpcService::new(
        driver.handle.clone(),
        Arc::clone(&driver.gate),
        Arc::new(EchoCodec),
    );
    service
        .submit_job(Request::new(SubmitJobRequest {
            job_id: "j10".to_string(),
            job: b"payload".to_vec(),
        }))
        .await
        .unwrap();
    driver.wait_for(|notices| result_count(notices) == 1).await;

    let notices = driver.protocol.snapshot();
    assert_eq!(started_ids(&notices), vec!["j10"]);
    let Some(Notice::Result { result, .. }) = notices
        .iter()
        .find(|notice| matches!(notice, Notice::Result { .. }))
    else {
        panic!("expected a result notice");
    };
    assert_eq!(result.as_deref(), Some(b"payload".as_slice()));
}

#[tokio::test]
async fn test_sync_job_waits_for_context_and_fails_when_stopped() {
    let driver = TestDriver::spawn(0, Some(Arc::new(Notify::new())));
    let service = DriverGrpcService::new(
        driver.handle.clone(),
        Arc::clone(&driver.gate),
        Arc::new(EchoCodec),
    );

    let call = tokio::spawn(async move {
        service
            .run_job_sync(Request::new(RunJobSyncRequest {
                job: b"ping".to_vec(),
            }))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!call.is_finished());

    // The driver stops before the context is ever published; the blocked
    // call must fail rather than hang.
    driver.shutdown.trigger(None);
    let status = call.await.unwrap().unwrap_err();
    assert_eq!(status.code(), tonic::Code::FailedPrecondition);
}

#[tokio::test]
async fn test_sync_job_runs_inline_and_rejects_monitoring() {
    let driver = TestDriver::spawn(0, None);
    driver.gate.wait_ready().await.unwrap();

    let service = DriverGrpcService::new(
        driver.handle.clone(),
        Arc::clone(&driver.gate),
        Arc::new(EchoCodec),
    );
    let response = service
        .run_job_sync(Request::new(RunJobSyncRequest {
            job: b"ping".to_vec(),
        }))
        .await
        .unwrap();
    assert_eq!(response.into_inner().result, b"ping".to_vec());

    // A synchronous job that tries to register a sub-task fails fast.
    let service = DriverGrpcService::new(
        driver.handle.clone(),
        Arc::clone(&driver.gate),
        Arc::new(RegisteringCodec),
    );
    let status = service
        .run_job_sync(Request::new(RunJobSyncRequest { job: vec![] }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
}
