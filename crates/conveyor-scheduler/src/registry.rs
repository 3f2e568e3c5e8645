use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::{context::JobContext, error::WorkError, types::JobParameters};

/// Executable logic behind a job type.
///
/// Long-running implementations are expected to call
/// [`JobContext::heartbeat`] (or [`JobContext::report_progress`]) well within
/// the configured heartbeat interval, and to poll
/// [`JobContext::is_cancel_requested`] between units of work.
#[async_trait]
pub trait Work: Send + Sync {
    async fn run(
        &self,
        parameters: &JobParameters,
        ctx: JobContext,
    ) -> Result<serde_json::Value, WorkError>;

    /// Whether each job gets a private directory, exposed as
    /// [`JobContext::workspace`]. A job whose directory cannot be created
    /// fails without starting.
    fn needs_workspace(&self) -> bool {
        false
    }
}

/// Adapter so plain async closures can be registered as [`Work`].
pub struct FnWork<F>(F);

#[async_trait]
impl<F, Fut> Work for FnWork<F>
where
    F: Fn(JobParameters, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, WorkError>> + Send + 'static,
{
    async fn run(
        &self,
        parameters: &JobParameters,
        ctx: JobContext,
    ) -> Result<serde_json::Value, WorkError> {
        (self.0)(parameters.clone(), ctx).await
    }
}

/// Maps a job's `job_type` to its [`Work`], populated once at startup.
#[derive(Default, Clone)]
pub struct WorkRegistry {
    works: HashMap<String, Arc<dyn Work>>,
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `work` under `job_type`, replacing any previous binding.
    pub fn register(
        &mut self,
        job_type: impl Into<String>,
        work: impl Work + 'static,
    ) -> &mut Self {
        let job_type = job_type.into();
        info!(%job_type, "work implementation registered");
        self.works.insert(job_type, Arc::new(work));
        self
    }

    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(JobParameters, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, WorkError>> + Send + 'static,
    {
        self.register(job_type, FnWork(f))
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn Work>> {
        self.works.get(job_type).cloned()
    }

    /// Registered job types, sorted for deterministic output.
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.works.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_job_type() {
        let mut registry = WorkRegistry::new();
        registry
            .register_fn("echo", |params, _ctx| async move {
                Ok(params.raw("value").cloned().unwrap_or_default())
            })
            .register_fn("noop", |_params, _ctx| async { Ok(serde_json::Value::Null) });

        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.job_types(), vec!["echo", "noop"]);
    }
}
