use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::id::{EngineJobId, JobId, StageId};

/// Correlates the engine's stage identifiers with logical jobs and tracks
/// session idleness. The table is built lazily from engine job-start
/// events, so a task event that arrives before its job-start event is
/// unmappable and its metrics are dropped.
pub struct EventTracker {
    stage_owners: HashMap<StageId, StageOwner>,
    last_completion: Instant,
}

#[derive(Debug, Clone)]
pub struct StageOwner {
    pub engine_job_id: EngineJobId,
    /// The logical job resolved when the engine job started, if any.
    pub job_id: Option<JobId>,
}

impl EventTracker {
    pub fn new() -> Self {
        Self {
            stage_owners: HashMap::new(),
            last_completion: Instant::now(),
        }
    }

    /// Restarts the idle clock, as if a completion had just been observed.
    pub fn reset_completion_clock(&mut self) {
        self.last_completion = Instant::now();
    }

    pub fn record_job_start(
        &mut self,
        engine_job_id: EngineJobId,
        stage_ids: &[StageId],
        job_id: Option<JobId>,
    ) {
        for stage_id in stage_ids {
            self.stage_owners.insert(
                *stage_id,
                StageOwner {
                    engine_job_id,
                    job_id: job_id.clone(),
                },
            );
        }
    }

    /// Removes all stage entries of the finished engine job and restarts
    /// the idle clock.
    pub fn record_job_end(&mut self, engine_job_id: EngineJobId) {
        self.stage_owners
            .retain(|_, owner| owner.engine_job_id != engine_job_id);
        self.last_completion = Instant::now();
    }

    pub fn resolve_stage(&self, stage_id: StageId) -> Option<&StageOwner> {
        self.stage_owners.get(&stage_id)
    }

    /// Drops stage entries owned by a finished logical job so they cannot
    /// outlive it.
    pub fn remove_job(&mut self, job_id: &JobId) {
        self.stage_owners
            .retain(|_, owner| owner.job_id.as_ref() != Some(job_id));
    }

    pub fn clear(&mut self) {
        self.stage_owners.clear();
    }

    pub fn has_live_stages(&self) -> bool {
        !self.stage_owners.is_empty()
    }

    pub fn live_stage_count(&self) -> usize {
        self.stage_owners.len()
    }

    pub fn idle_expired(&self, timeout: Duration) -> bool {
        self.last_completion.elapsed() >= timeout
    }
}
