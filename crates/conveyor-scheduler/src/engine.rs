use std::sync::Arc;

use conveyor_core::JobsConfig;
use dashmap::DashSet;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument};

use crate::{
    cancel::CancellationController,
    dispatcher::Dispatcher,
    error::{Result, SchedulerError},
    events::EventSink,
    heartbeat::HeartbeatMonitor,
    pool::WorkerPool,
    registry::WorkRegistry,
    store::JobStore,
    trigger::TriggerActivator,
    types::{now, JobRecord, JobStatus, NewJob},
};

/// Owns one of each scheduling component and drives their loops.
///
/// Submission and control methods are synchronous and safe to call from any
/// task while [`run`](Self::run) is active. Several schedulers (one per
/// process, or several in one test) may share the same store.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    config: Arc<JobsConfig>,
    pool: Arc<WorkerPool>,
    dispatcher: Dispatcher,
    heartbeat: HeartbeatMonitor,
    trigger: TriggerActivator,
    cancel: CancellationController,
    maintenance: Arc<DashSet<String>>,
    /// Wakes the dispatch loop before its next tick.
    wake: Arc<Notify>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: WorkRegistry,
        events: Arc<dyn EventSink>,
        config: JobsConfig,
    ) -> Self {
        let config = Arc::new(config);
        let wake = Arc::new(Notify::new());
        let maintenance: Arc<DashSet<String>> =
            Arc::new(config.maintenance_tenants.iter().cloned().collect());
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&store),
            Arc::new(registry),
            Arc::clone(&events),
            Arc::clone(&config),
            Arc::clone(&wake),
        ));

        Self {
            dispatcher: Dispatcher::new(
                Arc::clone(&store),
                Arc::clone(&pool),
                Arc::clone(&config),
                Arc::clone(&maintenance),
            ),
            heartbeat: HeartbeatMonitor::new(
                Arc::clone(&store),
                Arc::clone(&pool),
                Arc::clone(&events),
                Arc::clone(&config),
            ),
            trigger: TriggerActivator::new(
                Arc::clone(&store),
                Arc::clone(&config),
                Arc::clone(&wake),
            ),
            cancel: CancellationController::new(
                Arc::clone(&store),
                Arc::clone(&pool),
                events,
                Arc::clone(&config),
            ),
            store,
            config,
            pool,
            maintenance,
            wake,
        }
    }

    /// Persist a new job and return its id.
    ///
    /// The job starts PENDING when it carries a trigger date, QUEUED otherwise.
    #[instrument(skip(self, job), fields(tenant = %job.tenant, job_type = %job.job_type))]
    pub fn submit(&self, job: NewJob) -> Result<String> {
        if job.tenant.trim().is_empty() {
            return Err(SchedulerError::InvalidJob("tenant must not be empty".into()));
        }
        if job.job_type.trim().is_empty() {
            return Err(SchedulerError::InvalidJob("job type must not be empty".into()));
        }
        let record = JobRecord::from_new(job, now());
        self.store.insert(&record)?;
        info!(
            job_id = %record.id,
            status = %record.status,
            priority = record.priority,
            "job submitted"
        );
        if record.status == JobStatus::Queued {
            self.wake.notify_one();
        }
        Ok(record.id)
    }

    /// Request that a job stop; see [`CancellationController::request_cancel`].
    pub fn cancel(&self, id: &str) -> Result<JobRecord> {
        self.cancel.request_cancel(id)
    }

    pub fn query(&self, id: &str) -> Result<JobRecord> {
        self.store
            .get(id)?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
    }

    /// Jobs of `tenant` in `status`, highest priority first.
    pub fn query_by_status(&self, tenant: &str, status: JobStatus) -> Result<Vec<JobRecord>> {
        self.store.find_by_status(tenant, status)
    }

    /// Pause (or resume) dispatching for `tenant`. Running jobs are not
    /// affected.
    pub fn set_maintenance(&self, tenant: &str, enabled: bool) {
        if enabled {
            self.maintenance.insert(tenant.to_string());
        } else {
            self.maintenance.remove(tenant);
            self.wake.notify_one();
        }
        info!(%tenant, enabled, "tenant maintenance mode changed");
    }

    pub fn is_in_maintenance(&self, tenant: &str) -> bool {
        self.maintenance.contains(tenant)
    }

    /// One dispatch pass; returns the number of jobs started.
    pub fn dispatch_now(&self) -> Result<usize> {
        self.dispatcher.tick()
    }

    /// One heartbeat sweep; returns the number of jobs failed.
    pub fn reap_stale(&self) -> Result<usize> {
        self.heartbeat.sweep(now())
    }

    /// One trigger sweep; returns the number of jobs queued.
    pub fn activate_due(&self) -> Result<usize> {
        self.trigger.sweep(now())
    }

    /// One pass over persisted stop requests.
    pub fn sweep_cancellations(&self) -> Result<usize> {
        self.cancel.sweep()
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Jobs executing in this process.
    pub fn running_here(&self) -> usize {
        self.pool.running_count()
    }

    /// Drive every loop until `shutdown` flips to `true`, then drain the pool.
    ///
    /// Dispatch runs on its interval and whenever a job is submitted, a
    /// trigger fires or a slot frees up.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            pool_size = self.config.pool_size,
            heartbeat_ms = self.config.heartbeat_interval_ms,
            "scheduler started"
        );

        let mut dispatch = tokio::time::interval(self.config.dispatch_interval());
        let mut trigger = tokio::time::interval(self.config.trigger_interval());
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        for interval in [&mut dispatch, &mut trigger, &mut heartbeat] {
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = dispatch.tick() => {
                    if let Err(e) = self.sweep_cancellations() {
                        error!("cancellation sweep error: {e}");
                    }
                    self.dispatch_logged();
                }
                _ = self.wake.notified() => self.dispatch_logged(),
                _ = trigger.tick() => {
                    if let Err(e) = self.activate_due() {
                        error!("trigger sweep error: {e}");
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.reap_stale() {
                        error!("heartbeat sweep error: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler shutting down");
                        break;
                    }
                }
            }
        }

        self.pool.shutdown(self.config.cancel_grace_period()).await;
        info!("scheduler stopped");
    }

    fn dispatch_logged(&self) {
        if let Err(e) = self.dispatcher.tick() {
            error!(code = e.code(), "dispatch tick error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TracingEventSink;
    use crate::store::SqliteJobStore;

    fn scheduler() -> Scheduler {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open_in_memory().unwrap());
        Scheduler::new(
            store,
            WorkRegistry::new(),
            Arc::new(TracingEventSink),
            JobsConfig::default(),
        )
    }

    #[test]
    fn submit_validates_and_persists() {
        let scheduler = scheduler();
        assert!(matches!(
            scheduler.submit(NewJob::new("", "noop")),
            Err(SchedulerError::InvalidJob(_))
        ));
        assert!(matches!(
            scheduler.submit(NewJob::new("acme", " ")),
            Err(SchedulerError::InvalidJob(_))
        ));

        let id = scheduler.submit(NewJob::new("acme", "noop").with_priority(7)).unwrap();
        let job = scheduler.query(&id).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.priority, 7);
        assert_eq!(scheduler.query_by_status("acme", JobStatus::Queued).unwrap().len(), 1);
    }

    #[test]
    fn query_unknown_id_fails() {
        let err = scheduler().query("nope").unwrap_err();
        assert_eq!(err.code(), "JOB_NOT_FOUND");
    }

    #[test]
    fn maintenance_toggles() {
        let scheduler = scheduler();
        scheduler.set_maintenance("acme", true);
        assert!(scheduler.is_in_maintenance("acme"));
        scheduler.set_maintenance("acme", false);
        assert!(!scheduler.is_in_maintenance("acme"));
    }

    #[tokio::test]
    async fn saturated_pool_puts_claimed_job_back_in_queue() {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open_in_memory().unwrap());
        let mut registry = WorkRegistry::new();
        // Ignores its stop signal, so the local slot outlives the store record.
        registry.register_fn("stuck", |_params, _ctx| async {
            tokio::time::sleep(std::time::Duration::from_secs(3_600)).await;
            Ok(serde_json::Value::Null)
        });
        let config = JobsConfig {
            pool_size: 1,
            heartbeat_interval_ms: 1,
            stale_slot_count: 1,
            cancel_grace_period_ms: 3_600_000,
            ..JobsConfig::default()
        };
        let scheduler = Scheduler::new(store, registry, Arc::new(TracingEventSink), config);

        let stuck = scheduler.submit(NewJob::new("acme", "stuck")).unwrap();
        assert_eq!(scheduler.dispatch_now().unwrap(), 1);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(scheduler.reap_stale().unwrap(), 1);
        assert_eq!(scheduler.query(&stuck).unwrap().status, JobStatus::Failed);
        assert_eq!(scheduler.running_here(), 1);

        // The store shows a free slot but the local semaphore is still held.
        let waiting = scheduler.submit(NewJob::new("acme", "stuck").with_priority(5)).unwrap();
        assert_eq!(scheduler.dispatch_now().unwrap(), 0);
        let job = scheduler.query(&waiting).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.start_date, None);
        assert_eq!(scheduler.running_here(), 1);
    }
}
