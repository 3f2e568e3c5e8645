use std::sync::Arc;

use chrono::{DateTime, Utc};
use conveyor_core::JobsConfig;
use tracing::{error, warn};

use crate::{
    error::Result,
    events::EventSink,
    pool::WorkerPool,
    store::{known_tenants, JobStore, StatusUpdate},
    types::{JobEvent, JobEventType},
};

pub const HEARTBEAT_TIMEOUT_REASON: &str = "heartbeat timeout";

/// Fails RUNNING jobs whose worker stopped proving it is alive.
pub struct HeartbeatMonitor {
    store: Arc<dyn JobStore>,
    pool: Arc<WorkerPool>,
    events: Arc<dyn EventSink>,
    config: Arc<JobsConfig>,
}

impl HeartbeatMonitor {
    pub fn new(
        store: Arc<dyn JobStore>,
        pool: Arc<WorkerPool>,
        events: Arc<dyn EventSink>,
        config: Arc<JobsConfig>,
    ) -> Self {
        Self {
            store,
            pool,
            events,
            config,
        }
    }

    /// Mark every RUNNING job with a heartbeat older than
    /// `heartbeat_interval × stale_slot_count` as FAILED. Returns how many were
    /// reaped.
    ///
    /// A reaped job still executing in this process is also told to stop so
    /// its slot comes back; whatever it returns afterwards is discarded.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after())
            .unwrap_or_else(|_| chrono::Duration::weeks(52));
        let threshold = now - stale_after;
        let mut reaped = 0;
        for tenant in known_tenants(self.store.as_ref(), &self.config.tenants)? {
            let stale = match self.store.find_stale_running(&tenant, threshold) {
                Ok(stale) => stale,
                Err(e) => {
                    error!(%tenant, "stale job lookup failed: {e}");
                    continue;
                }
            };
            for job in stale {
                let update = StatusUpdate::Fail {
                    at: now,
                    reason: HEARTBEAT_TIMEOUT_REASON.to_string(),
                };
                match self.store.update_status(&job.id, &update) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        error!(job_id = %job.id, %tenant, "could not fail stale job: {e}");
                        continue;
                    }
                }
                warn!(
                    job_id = %job.id,
                    %tenant,
                    last_heartbeat = ?job.last_heartbeat,
                    "job missed its heartbeats, marked failed"
                );
                self.events.publish(JobEvent::new(&job, JobEventType::Failed, now));
                self.pool.signal_cancel(&job.id, self.config.cancel_grace_period());
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}
