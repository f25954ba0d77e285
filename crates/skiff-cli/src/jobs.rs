//! Built-in jobs for local smoke runs. Payloads are JSON descriptions
//! decoded into jobs that run against the local engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use skiff_driver::counter::CounterSet;
use skiff_driver::engine::LocalEngine;
use skiff_driver::error::{DriverError, DriverResult};
use skiff_driver::job::{Job, JobCodec, JobContext, JobMonitor};

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
enum DemoJobSpec {
    /// Returns the payload unchanged.
    Echo { payload: String },
    /// Runs one engine-side task that sleeps for the given duration.
    Sleep { millis: u64 },
}

pub struct DemoJobCodec;

impl JobCodec for DemoJobCodec {
    fn decode_job(&self, data: &[u8]) -> DriverResult<Box<dyn Job>> {
        let spec: DemoJobSpec = serde_json::from_slice(data)
            .map_err(|e| DriverError::InvalidArgument(format!("invalid demo job payload: {e}")))?;
        Ok(match spec {
            DemoJobSpec::Echo { payload } => Box::new(EchoJob { payload }),
            DemoJobSpec::Sleep { millis } => Box::new(SleepJob { millis }),
        })
    }
}

struct EchoJob {
    payload: String,
}

#[async_trait]
impl Job for EchoJob {
    async fn run(&self, _context: Arc<JobContext>, _monitor: &JobMonitor) -> DriverResult<Vec<u8>> {
        Ok(self.payload.clone().into_bytes())
    }
}

struct SleepJob {
    millis: u64,
}

#[async_trait]
impl Job for SleepJob {
    async fn run(&self, context: Arc<JobContext>, monitor: &JobMonitor) -> DriverResult<Vec<u8>> {
        let engine = context
            .engine()
            .as_any()
            .downcast_ref::<LocalEngine>()
            .ok_or_else(|| {
                DriverError::InvalidArgument("the sleep job requires the local engine".to_string())
            })?;
        let counters = Arc::new(CounterSet::new());
        counters.counter("sleep", "tasks").add(1);
        let millis = self.millis;
        let subtask = engine.submit(async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(())
        });
        monitor.register(subtask, Some(counters), vec![]).await?;
        Ok(b"done".to_vec())
    }
}
