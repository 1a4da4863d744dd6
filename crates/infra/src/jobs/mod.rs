//! Persistent job queue with an ordered, single-writer result dispatcher.
//!
//! ## Design
//!
//! - Jobs move `Pending -> Processing -> Completed | Failed`, with retryable
//!   failures going back to `Pending` until `max_retries` is spent
//! - Claims are atomic; a job is executed by at most one worker at a time
//! - A job's one or two analysis tasks run concurrently on the same extracted text
//! - Exactly one dispatcher writes to the delivery sink, oldest job first
//! - A record is only deleted after its messages were accepted (at-least-once)
//!
//! ## Components
//!
//! - `JobStore`: durable queue (`SqliteJobStore`) or in-memory (`InMemoryJobStore`)
//! - `TaskExecutor`: fan-out/fan-in of a job's tasks
//! - `WorkerPool`: W slots claiming and executing jobs
//! - `ResultDispatcher`: drains terminal jobs to the `DeliverySink`
//! - `RetentionSweeper`: removes old terminal records
//! - `Pipeline`: startup recovery and shutdown hooks

pub mod dispatcher;
pub mod executor;
pub mod pipeline;
pub mod pool;
pub mod retention;
pub mod sink;
pub mod sqlite;
pub mod store;
pub mod types;

pub use dispatcher::{DispatchReport, DispatcherStats, ResultDispatcher};
pub use executor::{ExecutionOutcome, TaskExecutor};
pub use pipeline::{Intake, Pipeline, PipelineHandle, PipelineReport};
pub use pool::{PoolStats, ShutdownReport, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
pub use retention::RetentionSweeper;
pub use sink::{DeliverySink, LogSink, MessageKind, OutboundMessage, SinkDeliveryError, WebhookSink};
pub use sqlite::SqliteJobStore;
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError, ORPHAN_ERROR};
pub use types::{
    BackoffStrategy, DeadLetterEntry, FailureOutcome, Job, JobId, JobPayload, JobStatus,
    ReclaimReport, ReplyTarget, RetryPolicy, SlotOutcome, TaskSlot,
};
