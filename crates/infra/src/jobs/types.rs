//! Core job types, the status state machine and the retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docrelay_analysis::TaskConfig;
use docrelay_core::{CoreError, TaskLabel};

pub use docrelay_core::JobId;

/// Maximum number of analysis tasks a single job may carry.
pub const MAX_TASKS_PER_JOB: usize = 2;

/// Job lifecycle status.
///
/// ```text
/// Pending --claim--> Processing --success--> Completed
///    ^                   |
///    +---retryable-------+---exhausted/terminal--> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by exactly one worker
    Processing,
    /// Results recorded, awaiting delivery
    Completed,
    /// Retries exhausted or non-retryable error
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Pending)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(CoreError::validation(format!("unknown job status '{other}'"))),
        }
    }
}

/// A transition that the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Where results for a job must be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTarget {
    /// Destination channel/room on the delivery sink.
    pub channel: String,
    /// Message the results should thread under, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
}

impl ReplyTarget {
    pub fn channel(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            in_reply_to: None,
        }
    }

    pub fn in_reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.in_reply_to = Some(message_id.into());
        self
    }
}

/// Everything a worker and the dispatcher need to handle a job.
///
/// The document content itself is never stored here; `source` is a reference
/// resolved by the content source at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub source: String,
    pub filename: String,
    pub reply_to: ReplyTarget,
    /// One or two tasks; index 0 is the primary, index 1 the secondary.
    pub tasks: Vec<TaskConfig>,
}

impl JobPayload {
    pub fn new(
        source: impl Into<String>,
        filename: impl Into<String>,
        reply_to: ReplyTarget,
        primary: TaskConfig,
    ) -> Self {
        Self {
            source: source.into(),
            filename: filename.into(),
            reply_to,
            tasks: vec![primary],
        }
    }

    pub fn with_secondary(mut self, secondary: TaskConfig) -> Self {
        self.tasks.truncate(1);
        self.tasks.push(secondary);
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.source.trim().is_empty() {
            return Err(CoreError::validation("source must not be empty"));
        }
        if self.reply_to.channel.trim().is_empty() {
            return Err(CoreError::validation("reply_to.channel must not be empty"));
        }
        if self.tasks.is_empty() || self.tasks.len() > MAX_TASKS_PER_JOB {
            return Err(CoreError::validation(format!(
                "a job needs 1 to {MAX_TASKS_PER_JOB} tasks, got {}",
                self.tasks.len()
            )));
        }
        if let Some(task) = self.tasks.iter().find(|t| t.provider.trim().is_empty()) {
            return Err(CoreError::validation(format!(
                "task provider must not be empty (prompt: {:.20})",
                task.prompt
            )));
        }
        if let Some((label, _)) = self.labelled_tasks().find(|(_, t)| t.timeout_secs == Some(0)) {
            return Err(CoreError::validation(format!(
                "{label} task timeout_secs must be at least 1"
            )));
        }
        Ok(())
    }

    /// Tasks paired with their slot label, in delivery order.
    pub fn labelled_tasks(&self) -> impl Iterator<Item = (TaskLabel, &TaskConfig)> {
        self.tasks
            .iter()
            .enumerate()
            .filter_map(|(i, t)| TaskLabel::for_index(i).map(|label| (label, t)))
    }
}

/// Result of one analysis task: a value or a failure description, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SlotOutcome {
    Success { text: String },
    Failure { error: String },
}

/// One task slot of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSlot {
    pub label: TaskLabel,
    pub outcome: SlotOutcome,
}

impl TaskSlot {
    pub fn success(label: TaskLabel, text: impl Into<String>) -> Self {
        Self {
            label,
            outcome: SlotOutcome::Success { text: text.into() },
        }
    }

    pub fn failure(label: TaskLabel, error: impl Into<String>) -> Self {
        Self {
            label,
            outcome: SlotOutcome::Failure {
                error: error.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SlotOutcome::Success { .. })
    }
}

/// Backoff strategy for requeued jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(retry-1)
    #[default]
    Exponential,
    /// Linear backoff: base * retry
    Linear,
}

/// Retry policy applied by a store when a job fails retryably.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries granted to newly enqueued jobs (0 = fail on first error)
    pub max_retries: u32,
    /// Base delay before a requeued job becomes claimable again
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Requeued jobs are claimable again immediately.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before retry number `retry` (1-indexed) becomes claimable.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        if retry == 0 || self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1).min(31));
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry),
        };
        delay.min(self.max_delay)
    }
}

/// What `fail_retryable` did with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back in `Pending` with the new retry count.
    Requeued {
        retry_count: u32,
        available_at: DateTime<Utc>,
    },
    /// Retries exhausted; the job is terminal `Failed`.
    Exhausted,
}

/// A unit of work tracked through its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Store-assigned insertion order, used to break `created_at` ties
    pub seq: u64,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    /// First claim of the job; kept across retries
    pub started_at: Option<DateTime<Utc>>,
    /// Entry into `Completed` or `Failed`
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time a `Pending` job may be claimed (retry backoff)
    pub available_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub result: Option<Vec<TaskSlot>>,
    pub error: Option<String>,
    /// Number of outbound messages already confirmed by the sink
    pub delivered_slots: u32,
}

impl Job {
    pub fn new(payload: JobPayload, max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            seq: 0,
            payload,
            status: JobStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            available_at: now,
            retry_count: 0,
            max_retries,
            result: None,
            error: None,
            delivered_slots: 0,
        }
    }

    /// Claimable at `now`?
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.available_at <= now
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(to) {
            return Err(InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// `Pending -> Processing`.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Processing)?;
        self.started_at.get_or_insert(now);
        Ok(())
    }

    /// `Processing -> Completed`.
    pub fn mark_completed(
        &mut self,
        result: Vec<TaskSlot>,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Completed)?;
        self.completed_at = Some(now.max(self.started_at.unwrap_or(now)));
        self.result = Some(result);
        self.error = None;
        Ok(())
    }

    /// `Processing -> Pending` while retries remain, otherwise `Processing -> Failed`.
    pub fn mark_failed_retryable(
        &mut self,
        error: impl Into<String>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, InvalidTransition> {
        if self.status != JobStatus::Processing {
            return Err(InvalidTransition {
                from: self.status,
                to: JobStatus::Pending,
            });
        }

        if self.retry_count < self.max_retries {
            self.transition(JobStatus::Pending)?;
            self.retry_count += 1;
            let delay = policy.delay_for_attempt(self.retry_count);
            self.available_at =
                now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            self.error = Some(error.into());
            Ok(FailureOutcome::Requeued {
                retry_count: self.retry_count,
                available_at: self.available_at,
            })
        } else {
            self.mark_failed_terminal(error, now)?;
            Ok(FailureOutcome::Exhausted)
        }
    }

    /// `Processing -> Failed`.
    pub fn mark_failed_terminal(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Failed)?;
        self.completed_at = Some(now.max(self.started_at.unwrap_or(now)));
        self.error = Some(error.into());
        Ok(())
    }

    /// Slots not yet confirmed by the sink, paired with their position.
    pub fn undelivered_slots(&self) -> impl Iterator<Item = (usize, &TaskSlot)> {
        self.result
            .iter()
            .flatten()
            .enumerate()
            .skip(self.delivered_slots as usize)
    }
}

/// Entry in the dead-letter archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(job: Job, reason: String, now: DateTime<Utc>) -> Self {
        Self {
            job,
            dead_lettered_at: now,
            reason,
        }
    }
}

/// Outcome of the startup recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub requeued: Vec<JobId>,
    pub failed: Vec<JobId>,
}

impl ReclaimReport {
    pub fn total(&self) -> usize {
        self.requeued.len() + self.failed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> JobPayload {
        JobPayload::new(
            "reports/a.txt",
            "a.txt",
            ReplyTarget::channel("!room"),
            TaskConfig::new("openai", "summarise"),
        )
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy =
            RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn fixed_and_linear_backoff() {
        let fixed = RetryPolicy::fixed(3, Duration::from_millis(500));
        assert_eq!(fixed.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(fixed.delay_for_attempt(3), Duration::from_millis(500));

        let linear = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(100),
            ..RetryPolicy::default()
        };
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn immediate_policy_has_no_delay() {
        let policy = RetryPolicy::immediate(2);
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::ZERO);
    }

    #[test]
    fn state_machine_edges() {
        use JobStatus::*;
        let all = [Pending, Processing, Completed, Failed];
        let allowed = [
            (Pending, Processing),
            (Processing, Completed),
            (Processing, Pending),
            (Processing, Failed),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn payload_validation() {
        assert!(payload().validate().is_ok());

        let dual = payload().with_secondary(TaskConfig::new("ollama", "triage"));
        assert!(dual.validate().is_ok());
        let labels: Vec<_> = dual.labelled_tasks().map(|(l, _)| l).collect();
        assert_eq!(labels, vec![TaskLabel::Primary, TaskLabel::Secondary]);

        let mut none = payload();
        none.tasks.clear();
        assert!(none.validate().is_err());

        let mut three = dual.clone();
        three.tasks.push(TaskConfig::new("x", "y"));
        assert!(three.validate().is_err());

        let mut no_channel = payload();
        no_channel.reply_to.channel = " ".into();
        assert!(no_channel.validate().is_err());
    }

    #[test]
    fn zero_task_timeout_is_rejected() {
        let mut zero: JobPayload = serde_json::from_value(serde_json::json!({
            "source": "a.txt",
            "filename": "a.txt",
            "reply_to": { "channel": "!room" },
            "tasks": [
                { "provider": "openai", "prompt": "summary" },
                { "provider": "openai", "prompt": "triage", "timeout_secs": 0 }
            ]
        }))
        .unwrap();
        let err = zero.validate().unwrap_err();
        assert!(err.to_string().contains("secondary task timeout_secs"));

        zero.tasks[1].timeout_secs = Some(1);
        assert!(zero.validate().is_ok());
    }

    #[test]
    fn job_lifecycle_to_completed() {
        let now = Utc::now();
        let mut job = Job::new(payload(), 3, now);
        assert!(job.is_ready(now));

        job.mark_processing(now).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.started_at, Some(now));

        job.mark_completed(vec![TaskSlot::success(TaskLabel::Primary, "ok")], now)
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.unwrap() >= job.started_at.unwrap());
        assert_eq!(job.undelivered_slots().count(), 1);

        let err = job.mark_completed(vec![], now).unwrap_err();
        assert_eq!(err.from, JobStatus::Completed);
    }

    #[test]
    fn retryable_failure_requeues_then_exhausts() {
        let now = Utc::now();
        let policy = RetryPolicy::immediate(1);
        let mut job = Job::new(payload(), 1, now);

        job.mark_processing(now).unwrap();
        let outcome = job.mark_failed_retryable("boom", &policy, now).unwrap();
        assert!(matches!(outcome, FailureOutcome::Requeued { retry_count: 1, .. }));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert_eq!(job.started_at, Some(now));

        job.mark_processing(now).unwrap();
        let outcome = job.mark_failed_retryable("boom again", &policy, now).unwrap();
        assert_eq!(outcome, FailureOutcome::Exhausted);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 1);
    }

    #[test]
    fn backoff_delays_readiness() {
        let now = Utc::now();
        let policy = RetryPolicy::fixed(3, Duration::from_secs(60));
        let mut job = Job::new(payload(), 3, now);

        job.mark_processing(now).unwrap();
        job.mark_failed_retryable("later", &policy, now).unwrap();
        assert!(!job.is_ready(now));
        assert!(job.is_ready(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn failing_a_pending_job_is_rejected() {
        let now = Utc::now();
        let mut job = Job::new(payload(), 3, now);
        assert!(job.mark_failed_retryable("x", &RetryPolicy::default(), now).is_err());
        assert!(job.mark_failed_terminal("x", now).is_err());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: a job failing on every attempt is claimed exactly
            /// max_retries + 1 times and ends `Failed` with retry_count == max_retries.
            #[test]
            fn always_failing_job_is_bounded(max_retries in 0u32..8) {
                let now = Utc::now();
                let policy = RetryPolicy::immediate(max_retries);
                let mut job = Job::new(payload(), max_retries, now);

                let mut claims = 0;
                while job.is_ready(now) {
                    job.mark_processing(now).unwrap();
                    claims += 1;
                    job.mark_failed_retryable("fail", &policy, now).unwrap();
                    prop_assert!(job.retry_count <= max_retries);
                }

                prop_assert_eq!(claims, max_retries + 1);
                prop_assert_eq!(job.status, JobStatus::Failed);
                prop_assert_eq!(job.retry_count, max_retries);
            }
        }
    }
}
