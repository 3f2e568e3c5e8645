use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Result, WorkError},
    store::JobStore,
    types::{estimate_completion, now},
};

/// Handle given to a running work implementation.
///
/// Cheap to clone; clones share the cancellation token and progress state,
/// so work may hand copies to its own sub-tasks.
#[derive(Clone)]
pub struct JobContext {
    job_id: Arc<str>,
    tenant: Arc<str>,
    start: DateTime<Utc>,
    store: Arc<dyn JobStore>,
    token: CancellationToken,
    percent: Arc<AtomicU8>,
    workspace: Option<Arc<Path>>,
}

impl JobContext {
    pub(crate) fn new(
        job_id: &str,
        tenant: &str,
        start: DateTime<Utc>,
        store: Arc<dyn JobStore>,
        token: CancellationToken,
    ) -> Self {
        Self {
            job_id: Arc::from(job_id),
            tenant: Arc::from(tenant),
            start,
            store,
            token,
            percent: Arc::new(AtomicU8::new(0)),
            workspace: None,
        }
    }

    pub(crate) fn with_workspace(mut self, dir: &Path) -> Self {
        self.workspace = Some(Arc::from(dir));
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Private directory of this job, present when its work asked for one
    /// through [`Work::needs_workspace`](crate::registry::Work::needs_workspace).
    /// Removed once the job ends.
    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }

    /// Record progress (clamped to 100) and refresh the heartbeat.
    ///
    /// Values below the last reported percentage are ignored, so progress
    /// never moves backwards. The estimated completion is recomputed on each
    /// advance.
    pub fn report_progress(&self, percent: u8) -> Result<()> {
        let percent = percent.min(100);
        let at = now();
        let previous = self.percent.fetch_max(percent, Ordering::AcqRel);
        if percent <= previous {
            self.store.heartbeat(&self.job_id, at)?;
            return Ok(());
        }
        let estimate = estimate_completion(self.start, at, percent);
        self.store.record_progress(&self.job_id, percent, estimate, at)?;
        Ok(())
    }

    /// Prove the worker is still alive.
    pub fn heartbeat(&self) -> Result<()> {
        self.store.heartbeat(&self.job_id, now())?;
        Ok(())
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Err(WorkError::Cancelled)` once a stop was requested, for use with `?`
    /// between units of work.
    pub fn checkpoint(&self) -> std::result::Result<(), WorkError> {
        if self.is_cancel_requested() {
            Err(WorkError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when a stop is requested, for `tokio::select!` in work that
    /// waits on I/O.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Last percentage reported through this context.
    pub fn percent_completed(&self) -> u8 {
        self.percent.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("tenant", &self.tenant)
            .field("start", &self.start)
            .field("workspace", &self.workspace)
            .field("cancel_requested", &self.token.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SqliteJobStore, StatusUpdate};
    use crate::types::{JobRecord, JobStatus, NewJob};

    fn running_job() -> (Arc<dyn JobStore>, JobRecord) {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open_in_memory().unwrap());
        let job = JobRecord::from_new(NewJob::new("acme", "noop"), now());
        store.insert(&job).unwrap();
        store.claim_highest_priority_queued("acme").unwrap();
        store.update_status(&job.id, &StatusUpdate::Start { at: now() }).unwrap();
        (store, job)
    }

    #[test]
    fn progress_is_monotonic_and_persisted() {
        let (store, job) = running_job();
        let ctx = JobContext::new(
            &job.id,
            &job.tenant,
            now(),
            store.clone(),
            CancellationToken::new(),
        );

        ctx.report_progress(30).unwrap();
        ctx.report_progress(10).unwrap();
        ctx.report_progress(250).unwrap();

        assert_eq!(ctx.percent_completed(), 100);
        let stored = store.get(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.percent_completed, 100);
        assert!(stored.estimated_completion.is_some());
    }

    #[test]
    fn checkpoint_follows_token() {
        let (store, job) = running_job();
        let token = CancellationToken::new();
        let ctx = JobContext::new(&job.id, &job.tenant, now(), store, token.clone());

        assert!(ctx.checkpoint().is_ok());
        token.cancel();
        assert!(ctx.is_cancel_requested());
        assert!(matches!(ctx.checkpoint(), Err(WorkError::Cancelled)));
    }

    #[test]
    fn workspace_is_opt_in() {
        let (store, job) = running_job();
        let token = CancellationToken::new();
        let ctx = JobContext::new(&job.id, &job.tenant, now(), store, token);
        assert_eq!(ctx.workspace(), None);

        let dir = std::env::temp_dir().join(&job.id);
        let ctx = ctx.with_workspace(&dir);
        assert_eq!(ctx.workspace(), Some(dir.as_path()));
        assert_eq!(ctx.clone().workspace(), Some(dir.as_path()));
    }
}
