use std::sync::Arc;

use chrono::{DateTime, Utc};
use conveyor_core::JobsConfig;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::{
    error::Result,
    store::{known_tenants, JobStore, StatusUpdate},
};

/// Promotes PENDING jobs to QUEUED once their trigger date has passed.
pub struct TriggerActivator {
    store: Arc<dyn JobStore>,
    config: Arc<JobsConfig>,
    wake: Arc<Notify>,
}

impl TriggerActivator {
    pub fn new(store: Arc<dyn JobStore>, config: Arc<JobsConfig>, wake: Arc<Notify>) -> Self {
        Self { store, config, wake }
    }

    /// Returns the number of jobs activated; wakes the dispatcher if any.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut activated = 0;
        for tenant in known_tenants(self.store.as_ref(), &self.config.tenants)? {
            let due = match self.store.find_due_pending(&tenant, now) {
                Ok(due) => due,
                Err(e) => {
                    error!(%tenant, "due job lookup failed: {e}");
                    continue;
                }
            };
            for job in due {
                match self.store.update_status(&job.id, &StatusUpdate::Activate { at: now }) {
                    Ok(true) => {
                        debug!(job_id = %job.id, %tenant, "job activated");
                        activated += 1;
                    }
                    Ok(false) => {}
                    Err(e) => error!(job_id = %job.id, %tenant, "job activation failed: {e}"),
                }
            }
        }
        if activated > 0 {
            info!(activated, "triggered jobs queued");
            self.wake.notify_one();
        }
        Ok(activated)
    }
}
