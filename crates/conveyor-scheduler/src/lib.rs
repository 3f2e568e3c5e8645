//! `conveyor-scheduler` — multi-tenant job scheduling and execution with
//! SQLite persistence.
//!
//! # Overview
//!
//! Jobs are persisted to a SQLite `jobs` table through the [`JobStore`] trait.
//! A [`Scheduler`] owns the components that move them through their states:
//!
//! | Component                  | Role                                                   |
//! |----------------------------|--------------------------------------------------------|
//! | [`Dispatcher`]             | Claims QUEUED jobs by priority while slots are free    |
//! | [`WorkerPool`]             | Runs [`Work`] on per-tenant slots, records the outcome |
//! | [`HeartbeatMonitor`]       | Fails RUNNING jobs that stopped heartbeating           |
//! | [`TriggerActivator`]       | Queues PENDING jobs once their trigger date passes     |
//! | [`CancellationController`] | Aborts queued jobs, signals running ones               |
//!
//! # Lifecycle
//!
//! ```text
//! PENDING ─▶ QUEUED ─▶ TO_BE_RUN ─▶ RUNNING ─▶ SUCCEEDED | FAILED | ABORTED
//! ```
//!
//! Every transition is a conditional write; terminal records never change.
//! Lifecycle events go to an [`EventSink`] after the matching write.

pub mod cancel;
pub mod context;
pub mod db;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod pool;
pub mod registry;
pub mod store;
pub mod trigger;
pub mod types;

pub use cancel::CancellationController;
pub use context::JobContext;
pub use dispatcher::Dispatcher;
pub use engine::Scheduler;
pub use error::{Result, SchedulerError, WorkError};
pub use events::{ChannelEventSink, EventSink, FanoutEventSink, TracingEventSink};
pub use heartbeat::HeartbeatMonitor;
pub use pool::{Submission, WorkerPool};
pub use registry::{Work, WorkRegistry};
pub use store::{JobStore, SqliteJobStore, StatusUpdate};
pub use trigger::TriggerActivator;
pub use types::{JobEvent, JobEventType, JobParameters, JobRecord, JobStatus, NewJob};
