use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::types::{JobEvent, JobEventType};

/// Receiver of job lifecycle notifications.
///
/// `publish` is called after the matching state has been written to the
/// store and must not block: implementations hand the event off and return.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: JobEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: JobEvent) {
        match event.event_type {
            JobEventType::Failed => warn!(
                job_id = %event.job_id,
                tenant = %event.tenant,
                job_type = %event.job_type,
                "job failed"
            ),
            other => info!(
                job_id = %event.job_id,
                tenant = %event.tenant,
                job_type = %event.job_type,
                event = ?other,
                "job event"
            ),
        }
    }
}

/// Forwards events to an mpsc channel.
///
/// Uses `try_send` so a slow consumer never stalls a worker; events that do
/// not fit are dropped with a warning.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::Sender<JobEvent>,
}

impl ChannelEventSink {
    pub fn new(tx: mpsc::Sender<JobEvent>) -> Self {
        Self { tx }
    }

    /// Convenience constructor returning the sink and its receiver.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<JobEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

impl EventSink for ChannelEventSink {
    fn publish(&self, event: JobEvent) {
        let job_id = event.job_id.clone();
        if self.tx.try_send(event).is_err() {
            warn!(%job_id, "event channel full or closed — job event dropped");
        }
    }
}

/// Publishes every event to each inner sink in order.
#[derive(Default)]
pub struct FanoutEventSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: std::sync::Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutEventSink {
    fn publish(&self, event: JobEvent) {
        for sink in &self.sinks {
            sink.publish(event.clone());
        }
    }
}
