use std::any::Any;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use conveyor_core::JobsConfig;
use dashmap::DashMap;
use tokio::sync::{Notify, Semaphore};
use tokio::task::{AbortHandle, JoinError};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    context::JobContext,
    error::{error_detail, Result, SchedulerError, WorkError},
    events::EventSink,
    registry::WorkRegistry,
    store::{JobStore, StatusUpdate},
    types::{now, JobEvent, JobEventType, JobRecord},
};

pub const EXPIRATION_REASON: &str = "Expiration date reached";

/// What [`WorkerPool::submit`] did with a claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Running in a slot.
    Started,
    /// Failed before start: expiration date reached.
    Expired,
    /// Aborted before start: a stop had been requested.
    Withdrawn,
    /// Failed before start: no work registered for its type.
    Rejected,
    /// Failed before start: its workspace could not be created.
    NoWorkspace,
    /// Another component moved the job out of TO_BE_RUN first.
    Skipped,
}

impl Submission {
    /// Whether the job now holds an execution slot.
    pub fn occupies_slot(self) -> bool {
        self == Submission::Started
    }
}

struct RunningJob {
    token: CancellationToken,
    abort: AbortHandle,
}

/// Bounded, per-tenant set of execution slots.
///
/// Each started job runs its work on its own Tokio task, supervised by a
/// second task that records the terminal state, emits the event and releases
/// the slot.
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    registry: Arc<WorkRegistry>,
    events: Arc<dyn EventSink>,
    config: Arc<JobsConfig>,
    slots: DashMap<String, Arc<Semaphore>>,
    running: Arc<DashMap<String, RunningJob>>,
    tracker: TaskTracker,
    /// Signalled whenever a slot is released.
    released: Arc<Notify>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<WorkRegistry>,
        events: Arc<dyn EventSink>,
        config: Arc<JobsConfig>,
        released: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            config,
            slots: DashMap::new(),
            running: Arc::new(DashMap::new()),
            tracker: TaskTracker::new(),
            released,
        }
    }

    /// Take over a job the caller has just claimed (status TO_BE_RUN).
    ///
    /// Expired, withdrawn and unknown-type jobs are finalized immediately and
    /// never take a slot. Returns `PoolSaturated` when the tenant has no free
    /// slot; the job is left TO_BE_RUN for the caller to requeue.
    pub fn submit(&self, job: JobRecord) -> Result<Submission> {
        if self.tracker.is_closed() {
            return Err(SchedulerError::ShuttingDown);
        }
        let at = now();

        if job.cancel_requested {
            if self.store.update_status(&job.id, &StatusUpdate::Withdraw { at })? {
                info!(job_id = %job.id, "stop requested before start — job aborted");
                self.events.publish(JobEvent::new(&job, JobEventType::Aborted, at));
            }
            return Ok(Submission::Withdrawn);
        }
        if job.is_expired(at) {
            return self.fail_unstarted(&job, EXPIRATION_REASON.to_string(), Submission::Expired);
        }
        let Some(work) = self.registry.get(&job.job_type) else {
            let reason = format!(
                "No work implementation registered for job type '{}'",
                job.job_type
            );
            return self.fail_unstarted(&job, reason, Submission::Rejected);
        };

        let permit = self
            .slots_for(&job.tenant)
            .try_acquire_owned()
            .map_err(|_| SchedulerError::PoolSaturated {
                tenant: job.tenant.clone(),
            })?;

        let workspace = if work.needs_workspace() {
            let dir = self.config.workspace_for(&job.id);
            if let Err(e) = std::fs::create_dir_all(&dir) {
                drop(permit);
                let reason = format!("Unable to create job workspace {}: {e}", dir.display());
                return self.fail_unstarted(&job, reason, Submission::NoWorkspace);
            }
            Some(dir)
        } else {
            None
        };

        if !self.store.update_status(&job.id, &StatusUpdate::Start { at })? {
            debug!(job_id = %job.id, "job left TO_BE_RUN before start");
            if let Some(dir) = &workspace {
                remove_workspace(&job.id, dir);
            }
            return Ok(Submission::Skipped);
        }
        info!(job_id = %job.id, tenant = %job.tenant, job_type = %job.job_type, "job started");
        self.events.publish(JobEvent::new(&job, JobEventType::Running, at));

        let token = CancellationToken::new();
        let mut ctx = JobContext::new(
            &job.id,
            &job.tenant,
            at,
            Arc::clone(&self.store),
            token.clone(),
        );
        if let Some(dir) = &workspace {
            ctx = ctx.with_workspace(dir);
        }
        let parameters = job.parameters.clone();
        let handle = tokio::spawn(async move { work.run(&parameters, ctx).await });
        self.running.insert(
            job.id.clone(),
            RunningJob {
                token,
                abort: handle.abort_handle(),
            },
        );

        let store = Arc::clone(&self.store);
        let events = Arc::clone(&self.events);
        let running = Arc::clone(&self.running);
        let released = Arc::clone(&self.released);
        self.tracker.spawn(async move {
            let outcome = handle.await;
            if let Some(dir) = &workspace {
                remove_workspace(&job.id, dir);
            }
            finalize(store.as_ref(), events.as_ref(), &job, outcome);
            running.remove(&job.id);
            drop(permit);
            released.notify_one();
        });
        Ok(Submission::Started)
    }

    /// Ask a job running in this pool to stop.
    ///
    /// Cancels its token at once; if the job is still running after `grace`,
    /// its task is aborted. Abort only takes effect at the work's next
    /// `.await`. Returns `false` when the job is not running here.
    pub fn signal_cancel(&self, job_id: &str, grace: Duration) -> bool {
        let Some(entry) = self.running.get(job_id) else {
            return false;
        };
        if entry.token.is_cancelled() {
            return true;
        }
        entry.token.cancel();
        drop(entry);
        debug!(%job_id, "stop signalled to running job");

        let running = Arc::clone(&self.running);
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(entry) = running.get(&job_id) {
                warn!(
                    %job_id,
                    grace_ms = grace.as_millis() as u64,
                    "job ignored stop request — interrupting its task"
                );
                entry.abort.abort();
            }
        });
        true
    }

    pub fn is_running_here(&self, job_id: &str) -> bool {
        self.running.contains_key(job_id)
    }

    /// Number of jobs currently executing in this pool, all tenants.
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Free local slots for `tenant`.
    pub fn available_slots(&self, tenant: &str) -> usize {
        self.slots_for(tenant).available_permits()
    }

    /// Stop accepting jobs and wait up to `grace` for running ones; then
    /// cancel and interrupt the rest and wait up to `grace` again.
    pub async fn shutdown(&self, grace: Duration) {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            info!("worker pool drained");
            return;
        }
        warn!(
            remaining = self.running.len(),
            "jobs still running after grace period — interrupting"
        );
        for entry in self.running.iter() {
            entry.token.cancel();
            entry.abort.abort();
        }
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            error!(
                remaining = self.running.len(),
                "jobs did not stop; they will be reaped on heartbeat timeout"
            );
        }
    }

    fn slots_for(&self, tenant: &str) -> Arc<Semaphore> {
        let entry = self
            .slots
            .entry(tenant.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.pool_size_for(tenant))));
        Arc::clone(&entry)
    }

    fn fail_unstarted(
        &self,
        job: &JobRecord,
        reason: String,
        outcome: Submission,
    ) -> Result<Submission> {
        let at = now();
        warn!(job_id = %job.id, tenant = %job.tenant, %reason, "job failed before start");
        if self.store.update_status(&job.id, &StatusUpdate::Fail { at, reason })? {
            self.events.publish(JobEvent::new(job, JobEventType::Failed, at));
        }
        Ok(outcome)
    }
}

/// Record the terminal state of a started job, then emit its event.
fn finalize(
    store: &dyn JobStore,
    events: &dyn EventSink,
    job: &JobRecord,
    outcome: std::result::Result<std::result::Result<serde_json::Value, WorkError>, JoinError>,
) {
    let at = now();
    let (update, event_type) = match outcome {
        Ok(Ok(result)) => (StatusUpdate::Succeed { at, result }, JobEventType::Succeeded),
        Ok(Err(WorkError::Cancelled)) => (StatusUpdate::Abort { at }, JobEventType::Aborted),
        Ok(Err(e)) => (
            StatusUpdate::Fail {
                at,
                reason: error_detail(&e),
            },
            JobEventType::Failed,
        ),
        Err(e) if e.is_cancelled() => (StatusUpdate::Abort { at }, JobEventType::Aborted),
        Err(e) => (
            StatusUpdate::Fail {
                at,
                reason: panic_detail(e.into_panic()),
            },
            JobEventType::Failed,
        ),
    };

    match store.update_status(&job.id, &update) {
        Ok(true) => {
            info!(job_id = %job.id, status = %update.target(), "job finished");
            events.publish(JobEvent::new(job, event_type, at));
        }
        Ok(false) => warn!(
            job_id = %job.id,
            status = %update.target(),
            "job no longer running — outcome discarded"
        ),
        Err(e) => error!(job_id = %job.id, error = %e, "failed to record job outcome"),
    }
}

fn remove_workspace(job_id: &str, dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => debug!(%job_id, "job workspace removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(%job_id, dir = %dir.display(), "job workspace not removed: {e}"),
    }
}

fn panic_detail(payload: Box<dyn Any + Send>) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("work panicked: {message}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelEventSink;
    use crate::store::SqliteJobStore;
    use crate::types::{JobStatus, NewJob};

    struct Fixture {
        store: Arc<dyn JobStore>,
        pool: WorkerPool,
        events: tokio::sync::mpsc::Receiver<JobEvent>,
    }

    fn fixture(pool_size: usize, registry: WorkRegistry) -> Fixture {
        let config = JobsConfig {
            pool_size,
            ..JobsConfig::default()
        };
        fixture_with(config, registry)
    }

    fn fixture_with(config: JobsConfig, registry: WorkRegistry) -> Fixture {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open_in_memory().unwrap());
        let (sink, events) = ChannelEventSink::channel(64);
        let pool = WorkerPool::new(
            Arc::clone(&store),
            Arc::new(registry),
            Arc::new(sink),
            Arc::new(config),
            Arc::new(Notify::new()),
        );
        Fixture { store, pool, events }
    }

    fn claim(store: &dyn JobStore, job: NewJob) -> JobRecord {
        let tenant = job.tenant.clone();
        store.insert(&JobRecord::from_new(job, now())).unwrap();
        store.claim_highest_priority_queued(&tenant).unwrap().unwrap()
    }

    #[tokio::test]
    async fn expired_job_fails_without_slot() {
        let mut registry = WorkRegistry::new();
        registry.register_fn("noop", |_p, _c| async { Ok(serde_json::Value::Null) });
        let mut fx = fixture(1, registry);

        let job = claim(fx.store.as_ref(), NewJob::new("acme", "noop").expires_at(now()));
        assert_eq!(fx.pool.submit(job.clone()).unwrap(), Submission::Expired);
        assert_eq!(fx.pool.available_slots("acme"), 1);

        let stored = fx.store.get(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_detail.as_deref(), Some(EXPIRATION_REASON));
        assert_eq!(stored.start_date, None);
        assert_eq!(fx.events.recv().await.unwrap().event_type, JobEventType::Failed);
    }

    #[tokio::test]
    async fn unknown_type_is_rejected() {
        let fx = fixture(1, WorkRegistry::new());
        let job = claim(fx.store.as_ref(), NewJob::new("acme", "does-not-exist"));
        assert_eq!(fx.pool.submit(job.clone()).unwrap(), Submission::Rejected);
        let stored = fx.store.get(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error_detail.unwrap().contains("does-not-exist"));
    }

    #[tokio::test]
    async fn saturated_pool_refuses_and_releases_after_completion() {
        let gate = Arc::new(Notify::new());
        let mut registry = WorkRegistry::new();
        let g = Arc::clone(&gate);
        registry.register_fn("gated", move |_p, _c| {
            let g = Arc::clone(&g);
            async move {
                g.notified().await;
                Ok(serde_json::json!("done"))
            }
        });
        let mut fx = fixture(1, registry);

        let first = claim(fx.store.as_ref(), NewJob::new("acme", "gated"));
        let second = claim(fx.store.as_ref(), NewJob::new("acme", "gated"));
        assert_eq!(fx.pool.submit(first.clone()).unwrap(), Submission::Started);
        assert!(matches!(
            fx.pool.submit(second),
            Err(SchedulerError::PoolSaturated { .. })
        ));

        assert_eq!(fx.events.recv().await.unwrap().event_type, JobEventType::Running);
        gate.notify_one();
        let done = fx.events.recv().await.unwrap();
        assert_eq!(done.event_type, JobEventType::Succeeded);
        assert_eq!(done.job_id, first.id);

        let stored = fx.store.get(&first.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(stored.result, Some(serde_json::json!("done")));
        assert_eq!(stored.percent_completed, 100);
        assert!(stored.stop_date.is_some());
    }

    #[tokio::test]
    async fn errors_and_panics_become_failures() {
        let mut registry = WorkRegistry::new();
        registry
            .register_fn("fails", |_p, _c| async {
                Err(WorkError::with_source(
                    "could not read input",
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
                ))
            })
            .register_fn("panics", |_p, _c| async {
                if true {
                    panic!("index out of range");
                }
                Ok(serde_json::Value::Null)
            });
        let mut fx = fixture(2, registry);

        let fails = claim(fx.store.as_ref(), NewJob::new("acme", "fails"));
        let panics = claim(fx.store.as_ref(), NewJob::new("acme", "panics"));
        fx.pool.submit(fails.clone()).unwrap();
        fx.pool.submit(panics.clone()).unwrap();

        let mut failed = 0;
        while failed < 2 {
            if fx.events.recv().await.unwrap().event_type == JobEventType::Failed {
                failed += 1;
            }
        }
        let detail = fx.store.get(&fails.id).unwrap().unwrap().error_detail.unwrap();
        assert_eq!(detail, "could not read input\ncaused by: no such file");
        let detail = fx.store.get(&panics.id).unwrap().unwrap().error_detail.unwrap();
        assert_eq!(detail, "work panicked: index out of range");
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_job_is_interrupted_after_grace() {
        let mut registry = WorkRegistry::new();
        registry.register_fn("stubborn", |_p, _c| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(serde_json::Value::Null)
        });
        let mut fx = fixture(1, registry);

        let job = claim(fx.store.as_ref(), NewJob::new("acme", "stubborn"));
        fx.pool.submit(job.clone()).unwrap();
        assert_eq!(fx.events.recv().await.unwrap().event_type, JobEventType::Running);

        assert!(fx.pool.signal_cancel(&job.id, Duration::from_secs(5)));
        assert_eq!(fx.events.recv().await.unwrap().event_type, JobEventType::Aborted);
        assert_eq!(fx.store.get(&job.id).unwrap().unwrap().status, JobStatus::Aborted);
        assert!(!fx.pool.is_running_here(&job.id));
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() {
        let fx = fixture(1, WorkRegistry::new());
        fx.pool.shutdown(Duration::from_millis(10)).await;
        let job = claim(fx.store.as_ref(), NewJob::new("acme", "noop"));
        assert!(matches!(fx.pool.submit(job), Err(SchedulerError::ShuttingDown)));
    }

    /// Writes a file into its workspace and returns the directory.
    struct ScratchWork;

    #[async_trait::async_trait]
    impl crate::registry::Work for ScratchWork {
        async fn run(
            &self,
            _parameters: &crate::types::JobParameters,
            ctx: JobContext,
        ) -> std::result::Result<serde_json::Value, WorkError> {
            let dir = ctx
                .workspace()
                .ok_or_else(|| WorkError::failed("no workspace"))?;
            std::fs::write(dir.join("out.txt"), ctx.job_id())
                .map_err(|e| WorkError::failed(e.to_string()))?;
            let written = std::fs::read_to_string(dir.join("out.txt"))
                .map_err(|e| WorkError::failed(e.to_string()))?;
            Ok(serde_json::json!({ "dir": dir.display().to_string(), "written": written }))
        }

        fn needs_workspace(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn workspace_lives_only_as_long_as_the_job() {
        let root = tempfile::tempdir().unwrap();
        let mut registry = WorkRegistry::new();
        registry
            .register("scratch", ScratchWork)
            .register_fn("plain", |_p, ctx| async move {
                Ok(serde_json::json!(ctx.workspace().is_none()))
            });
        let config = JobsConfig {
            workspace_root: root.path().display().to_string(),
            ..JobsConfig::default()
        };
        let mut fx = fixture_with(config, registry);

        let job = claim(fx.store.as_ref(), NewJob::new("acme", "scratch"));
        assert_eq!(fx.pool.submit(job.clone()).unwrap(), Submission::Started);
        assert_eq!(fx.events.recv().await.unwrap().event_type, JobEventType::Running);
        assert_eq!(fx.events.recv().await.unwrap().event_type, JobEventType::Succeeded);

        let stored = fx.store.get(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        let result = stored.result.unwrap();
        assert_eq!(result["written"], serde_json::json!(job.id));
        let dir = root.path().join(&job.id);
        assert_eq!(result["dir"], serde_json::json!(dir.display().to_string()));
        assert!(!dir.exists());

        let plain = claim(fx.store.as_ref(), NewJob::new("acme", "plain"));
        assert_eq!(fx.pool.submit(plain.clone()).unwrap(), Submission::Started);
        assert_eq!(fx.events.recv().await.unwrap().event_type, JobEventType::Running);
        assert_eq!(fx.events.recv().await.unwrap().event_type, JobEventType::Succeeded);
        let stored = fx.store.get(&plain.id).unwrap().unwrap();
        assert_eq!(stored.result, Some(serde_json::json!(true)));
        assert!(!root.path().join(&plain.id).exists());
    }

    #[tokio::test]
    async fn unusable_workspace_root_fails_job_before_start() {
        let root = tempfile::tempdir().unwrap();
        // A regular file where the workspace root directory should be.
        let blocked = root.path().join("blocked");
        std::fs::write(&blocked, b"").unwrap();
        let mut registry = WorkRegistry::new();
        registry.register("scratch", ScratchWork);
        let config = JobsConfig {
            pool_size: 1,
            workspace_root: blocked.display().to_string(),
            ..JobsConfig::default()
        };
        let mut fx = fixture_with(config, registry);

        let job = claim(fx.store.as_ref(), NewJob::new("acme", "scratch"));
        assert_eq!(fx.pool.submit(job.clone()).unwrap(), Submission::NoWorkspace);
        assert_eq!(fx.pool.available_slots("acme"), 1);

        let stored = fx.store.get(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.start_date, None);
        assert!(stored.error_detail.unwrap().contains("Unable to create job workspace"));
        assert_eq!(fx.events.recv().await.unwrap().event_type, JobEventType::Failed);
    }
}
