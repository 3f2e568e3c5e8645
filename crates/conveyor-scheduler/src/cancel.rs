use std::sync::Arc;

use conveyor_core::JobsConfig;
use tracing::{debug, error, info};

use crate::{
    error::{Result, SchedulerError},
    events::EventSink,
    pool::WorkerPool,
    store::{known_tenants, JobStore, StatusUpdate},
    types::{now, JobEvent, JobEventType, JobRecord, JobStatus},
};

/// Turns stop requests into state changes.
///
/// Jobs that have not started are aborted on the spot. Running jobs get a
/// cooperative signal through their context; the pool interrupts them if they
/// ignore it for longer than the grace period. The persisted
/// `cancel_requested` flag lets [`sweep`](Self::sweep) pick up requests made
/// through another process sharing the store.
pub struct CancellationController {
    store: Arc<dyn JobStore>,
    pool: Arc<WorkerPool>,
    events: Arc<dyn EventSink>,
    config: Arc<JobsConfig>,
}

impl CancellationController {
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

    /// Request that job `id` stop and return its record as it stands
    /// afterwards. Cancelling a terminal job is a no-op.
    pub fn request_cancel(&self, id: &str) -> Result<JobRecord> {
        let job = self
            .store
            .request_cancel(id)?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;
        self.apply(&job)?;
        Ok(self.store.get(id)?.unwrap_or(job))
    }

    /// Act on every outstanding stop request. Returns how many jobs were
    /// aborted or signalled.
    pub fn sweep(&self) -> Result<usize> {
        let mut handled = 0;
        for tenant in known_tenants(self.store.as_ref(), &self.config.tenants)? {
            let requested = match self.store.find_cancel_requested(&tenant) {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(%tenant, "stop request lookup failed: {e}");
                    continue;
                }
            };
            for job in requested {
                match self.apply(&job) {
                    Ok(true) => handled += 1,
                    Ok(false) => {}
                    Err(e) => error!(job_id = %job.id, %tenant, "stop request failed: {e}"),
                }
            }
        }
        Ok(handled)
    }

    fn apply(&self, job: &JobRecord) -> Result<bool> {
        if job.status.is_terminal() {
            debug!(job_id = %job.id, status = %job.status, "job already finished, nothing to stop");
            return Ok(false);
        }
        if job.status == JobStatus::Running {
            return Ok(self.signal(job));
        }

        let at = now();
        if self.store.update_status(&job.id, &StatusUpdate::Withdraw { at })? {
            info!(job_id = %job.id, tenant = %job.tenant, "job aborted before start");
            self.events.publish(JobEvent::new(job, JobEventType::Aborted, at));
            return Ok(true);
        }
        // Lost the race with the dispatcher: the job may be running now.
        match self.store.get(&job.id)? {
            Some(current) if current.status == JobStatus::Running => Ok(self.signal(&current)),
            _ => Ok(false),
        }
    }

    fn signal(&self, job: &JobRecord) -> bool {
        let signalled = self
            .pool
            .signal_cancel(&job.id, self.config.cancel_grace_period());
        if !signalled {
            debug!(job_id = %job.id, "job not running in this process; stop request recorded");
        }
        signalled
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::Notify;

    use super::*;
    use crate::events::ChannelEventSink;
    use crate::registry::WorkRegistry;
    use crate::store::SqliteJobStore;
    use crate::types::NewJob;

    fn controller() -> (
        Arc<dyn JobStore>,
        CancellationController,
        tokio::sync::mpsc::Receiver<JobEvent>,
    ) {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open_in_memory().unwrap());
        let (sink, received) = ChannelEventSink::channel(8);
        let events: Arc<dyn EventSink> = Arc::new(sink);
        let config = Arc::new(JobsConfig::default());
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&store),
            Arc::new(WorkRegistry::new()),
            Arc::clone(&events),
            Arc::clone(&config),
            Arc::new(Notify::new()),
        ));
        let controller = CancellationController::new(Arc::clone(&store), pool, events, config);
        (store, controller, received)
    }

    #[tokio::test]
    async fn queued_job_is_aborted_without_start() {
        let (store, controller, mut received) = controller();
        let job = JobRecord::from_new(NewJob::new("acme", "noop"), now());
        store.insert(&job).unwrap();

        let after = controller.request_cancel(&job.id).unwrap();
        assert_eq!(after.status, JobStatus::Aborted);
        assert!(after.cancel_requested);
        assert_eq!(after.start_date, None);
        assert_eq!(received.recv().await.unwrap().event_type, JobEventType::Aborted);
    }

    #[tokio::test]
    async fn unknown_id_is_reported() {
        let (_store, controller, _received) = controller();
        assert!(matches!(
            controller.request_cancel("missing"),
            Err(SchedulerError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn terminal_job_is_left_alone() {
        let (store, controller, _received) = controller();
        let job = JobRecord::from_new(NewJob::new("acme", "noop"), now());
        store.insert(&job).unwrap();
        store.claim_highest_priority_queued("acme").unwrap();
        store
            .update_status(
                &job.id,
                &StatusUpdate::Fail {
                    at: now(),
                    reason: "boom".into(),
                },
            )
            .unwrap();

        let after = controller.request_cancel(&job.id).unwrap();
        assert_eq!(after.status, JobStatus::Failed);
        assert!(!after.cancel_requested);
    }

    #[tokio::test]
    async fn sweep_signals_nothing_for_remote_running_job() {
        let (store, controller, _received) = controller();
        let job = JobRecord::from_new(NewJob::new("acme", "noop"), now());
        store.insert(&job).unwrap();
        store.claim_highest_priority_queued("acme").unwrap();
        store.update_status(&job.id, &StatusUpdate::Start { at: now() }).unwrap();

        let after = controller.request_cancel(&job.id).unwrap();
        assert_eq!(after.status, JobStatus::Running);
        assert!(after.cancel_requested);
        assert_eq!(controller.sweep().unwrap(), 0);
    }
}
