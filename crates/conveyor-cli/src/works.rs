//! Work types shipped with the `conveyor` binary.

use std::time::Duration;

use async_trait::async_trait;
use conveyor_scheduler::{JobContext, JobParameters, Work, WorkError, WorkRegistry};
use serde_json::json;

/// Sleeps `count` times for `period_ms`, reporting progress after each step.
pub struct SleepWork;

#[async_trait]
impl Work for SleepWork {
    async fn run(
        &self,
        parameters: &JobParameters,
        ctx: JobContext,
    ) -> Result<serde_json::Value, WorkError> {
        let period_ms: u64 = parameters.get("period_ms")?.unwrap_or(1_000);
        let count: u32 = parameters.get("count")?.unwrap_or(10);
        if count == 0 {
            return Err(WorkError::InvalidParameter {
                name: "count".into(),
                reason: "must be at least 1".into(),
            });
        }

        for step in 1..=count {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(period_ms)) => {}
                _ = ctx.cancelled() => return Err(WorkError::Cancelled),
            }
            let percent = (u64::from(step) * 100 / u64::from(count)) as u8;
            ctx.report_progress(percent)?;
        }
        Ok(json!({ "slept_ms": period_ms * u64::from(count) }))
    }
}

/// Always fails with the `message` parameter.
pub struct FailWork;

#[async_trait]
impl Work for FailWork {
    async fn run(
        &self,
        parameters: &JobParameters,
        _ctx: JobContext,
    ) -> Result<serde_json::Value, WorkError> {
        let message: String = parameters
            .get("message")?
            .unwrap_or_else(|| "job failed on request".to_string());
        Err(WorkError::failed(message))
    }
}

pub fn builtin_registry() -> WorkRegistry {
    let mut registry = WorkRegistry::new();
    registry.register("sleep", SleepWork).register("fail", FailWork);
    registry
}
