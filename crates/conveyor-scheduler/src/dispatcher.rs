use std::sync::Arc;

use conveyor_core::JobsConfig;
use dashmap::DashSet;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    error::{Result, SchedulerError},
    pool::WorkerPool,
    store::{known_tenants, JobStore, StatusUpdate},
    types::now,
};

/// Moves QUEUED jobs into the worker pool while tenants have free slots.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    pool: Arc<WorkerPool>,
    config: Arc<JobsConfig>,
    maintenance: Arc<DashSet<String>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        pool: Arc<WorkerPool>,
        config: Arc<JobsConfig>,
        maintenance: Arc<DashSet<String>>,
    ) -> Self {
        Self {
            store,
            pool,
            config,
            maintenance,
        }
    }

    /// One dispatch pass over every known tenant. Returns the number of jobs
    /// started. A failing tenant is logged and does not stop the others.
    pub fn tick(&self) -> Result<usize> {
        let mut started = 0;
        for tenant in known_tenants(self.store.as_ref(), &self.config.tenants)? {
            if self.maintenance.contains(&tenant) {
                debug!(%tenant, "tenant in maintenance — not dispatching");
                continue;
            }
            match self.dispatch_tenant(&tenant) {
                Ok(n) => started += n,
                Err(SchedulerError::ShuttingDown) => return Err(SchedulerError::ShuttingDown),
                Err(e) => error!(%tenant, code = e.code(), "dispatch failed: {e}"),
            }
        }
        Ok(started)
    }

    /// Claim and submit jobs of one tenant until its slots are full or its
    /// queue is empty.
    #[instrument(level = "debug", skip(self))]
    pub fn dispatch_tenant(&self, tenant: &str) -> Result<usize> {
        let capacity = self.config.pool_size_for(tenant);
        let occupied = self.store.count_running_or_to_be_run(tenant)?;
        let mut free = capacity.saturating_sub(occupied);
        let mut started = 0;

        while free > 0 {
            let Some(job) = self.store.claim_highest_priority_queued(tenant)? else {
                break;
            };
            let id = job.id.clone();
            match self.pool.submit(job) {
                Ok(outcome) if outcome.occupies_slot() => {
                    free -= 1;
                    started += 1;
                }
                Ok(outcome) => debug!(job_id = %id, ?outcome, "claimed job not started"),
                Err(SchedulerError::PoolSaturated { .. }) => {
                    self.requeue(&id)?;
                    break;
                }
                Err(e) => {
                    self.requeue(&id)?;
                    return Err(e);
                }
            }
        }

        if started > 0 {
            info!(%tenant, started, "jobs dispatched");
        }
        Ok(started)
    }

    fn requeue(&self, id: &str) -> Result<()> {
        if !self.store.update_status(id, &StatusUpdate::Requeue { at: now() })? {
            warn!(job_id = %id, "claimed job changed state before it could be requeued");
        }
        Ok(())
    }
}
