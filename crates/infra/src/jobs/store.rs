//! Job storage abstraction and the in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::types::{
    DeadLetterEntry, FailureOutcome, InvalidTransition, Job, JobId, JobPayload, JobStatus,
    ReclaimReport, RetryPolicy, TaskSlot,
};

/// Error recorded on jobs found `Processing` at startup.
pub const ORPHAN_ERROR: &str = "worker interrupted before the job finished";

/// Persistent queue of jobs.
///
/// Every state change is a conditional update: it only applies when the job is
/// in the expected status, so two callers can never both win the same edge.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Admit a job if fewer than [`JobStore::capacity`] jobs are stored.
    async fn try_enqueue(&self, payload: JobPayload) -> Result<JobId, JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Atomically move the oldest ready `Pending` job to `Processing`.
    async fn claim_next(&self) -> Result<Option<Job>, JobStoreError>;

    /// `Processing -> Completed`, recording the task slots.
    async fn complete(&self, id: JobId, result: Vec<TaskSlot>) -> Result<(), JobStoreError>;

    /// `Processing -> Pending` with `retry_count + 1`, or `Failed` once retries are exhausted.
    async fn fail_retryable(&self, id: JobId, error: &str)
    -> Result<FailureOutcome, JobStoreError>;

    /// `Processing -> Failed` regardless of remaining retries.
    async fn fail_terminal(&self, id: JobId, error: &str) -> Result<(), JobStoreError>;

    /// Jobs in `status`, oldest first.
    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Raise the delivered-message watermark of a terminal job.
    async fn record_delivery(&self, id: JobId, delivered: u32) -> Result<(), JobStoreError>;

    /// Permanently delete a terminal job.
    async fn remove(&self, id: JobId) -> Result<(), JobStoreError>;

    /// Move a `Failed` job into the dead-letter archive.
    async fn dead_letter(&self, id: JobId, reason: &str) -> Result<(), JobStoreError>;

    /// Most recent dead-letter entries first.
    async fn list_dead_letters(&self, limit: usize)
    -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    /// Delete terminal jobs and dead letters older than `age`. Returns the number removed.
    async fn cleanup_older_than(&self, age: Duration) -> Result<usize, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;

    /// Maximum number of stored jobs (all statuses).
    fn capacity(&self) -> usize;

    /// Notified whenever records are deleted.
    fn capacity_freed(&self) -> &Notify;

    /// Admit a job, waiting up to `wait` for capacity to free up.
    async fn enqueue(&self, payload: JobPayload, wait: Duration) -> Result<JobId, JobStoreError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let freed = self.capacity_freed().notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            match self.try_enqueue(payload.clone()).await {
                Err(JobStoreError::Capacity { limit }) => {
                    if tokio::time::timeout_at(deadline, freed).await.is_err() {
                        tracing::warn!(
                            limit,
                            wait_ms = wait.as_millis() as u64,
                            "job store full; enqueue rejected"
                        );
                        return Err(JobStoreError::Capacity { limit });
                    }
                }
                other => return other,
            }
        }
    }

    /// Startup recovery: every `Processing` job is treated as a retryable failure.
    async fn reclaim_orphans(&self) -> Result<ReclaimReport, JobStoreError> {
        let mut report = ReclaimReport::default();
        for job in self.list_by_status(JobStatus::Processing, usize::MAX).await? {
            match self.fail_retryable(job.id, ORPHAN_ERROR).await? {
                FailureOutcome::Requeued { .. } => report.requeued.push(job.id),
                FailureOutcome::Exhausted => report.failed.push(job.id),
            }
        }
        if report.total() > 0 {
            tracing::warn!(
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                "reclaimed orphaned jobs"
            );
        }
        Ok(report)
    }

    /// Terminal successes awaiting delivery, oldest first.
    async fn drain_completed(&self) -> Result<Vec<Job>, JobStoreError> {
        self.list_by_status(JobStatus::Completed, usize::MAX).await
    }

    /// Terminal failures awaiting the dead-letter notice, oldest first.
    async fn drain_failed(&self) -> Result<Vec<Job>, JobStoreError> {
        self.list_by_status(JobStatus::Failed, usize::MAX).await
    }
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job store is at capacity ({limit} jobs)")]
    Capacity { limit: usize },
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("invalid job payload: {0}")]
    InvalidPayload(String),
    #[error("intake is closed")]
    Closed,
    #[error("storage error: {0}")]
    Persistence(String),
}

impl JobStoreError {
    pub(crate) fn transition(id: JobId, err: InvalidTransition) -> Self {
        JobStoreError::InvalidTransition {
            id,
            from: err.from,
            to: err.to,
        }
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

impl JobStats {
    /// Records counted against capacity.
    pub fn stored(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// Jobs keyed by insertion sequence, i.e. creation order.
    jobs: BTreeMap<u64, Job>,
    index: HashMap<JobId, u64>,
    dead_letters: Vec<DeadLetterEntry>,
    next_seq: u64,
    last_created_at: Option<DateTime<Utc>>,
}

impl Inner {
    fn job_mut(&mut self, id: JobId) -> Result<&mut Job, JobStoreError> {
        let seq = self.index.get(&id).ok_or(JobStoreError::NotFound(id))?;
        self.jobs.get_mut(seq).ok_or(JobStoreError::NotFound(id))
    }

    fn take(&mut self, id: JobId) -> Option<Job> {
        let seq = self.index.remove(&id)?;
        self.jobs.remove(&seq)
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
    capacity: usize,
    policy: RetryPolicy,
    freed: Notify,
}

impl InMemoryJobStore {
    pub fn new(capacity: usize, policy: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
            policy,
            freed: Notify::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, JobStoreError> {
        self.inner
            .lock()
            .map_err(|_| JobStoreError::Persistence("job store lock poisoned".to_string()))
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new(100, RetryPolicy::default())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn try_enqueue(&self, payload: JobPayload) -> Result<JobId, JobStoreError> {
        payload
            .validate()
            .map_err(|e| JobStoreError::InvalidPayload(e.to_string()))?;

        let mut inner = self.lock()?;
        if inner.jobs.len() >= self.capacity {
            return Err(JobStoreError::Capacity {
                limit: self.capacity,
            });
        }

        // Creation timestamps never go backwards, even if the wall clock does.
        let now = inner.last_created_at.map_or(Utc::now(), |last| last.max(Utc::now()));
        inner.last_created_at = Some(now);

        let mut job = Job::new(payload, self.policy.max_retries, now);
        inner.next_seq += 1;
        job.seq = inner.next_seq;
        let id = job.id;
        inner.index.insert(id, job.seq);
        inner.jobs.insert(job.seq, job);

        tracing::debug!(job_id = %id, "job enqueued");
        Ok(id)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let inner = self.lock()?;
        Ok(inner
            .index
            .get(&id)
            .and_then(|seq| inner.jobs.get(seq))
            .cloned())
    }

    async fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        let now = Utc::now();
        let mut inner = self.lock()?;

        let Some(job) = inner.jobs.values_mut().find(|j| j.is_ready(now)) else {
            return Ok(None);
        };
        let id = job.id;
        job.mark_processing(now)
            .map_err(|e| JobStoreError::transition(id, e))?;
        Ok(Some(job.clone()))
    }

    async fn complete(&self, id: JobId, result: Vec<TaskSlot>) -> Result<(), JobStoreError> {
        let mut inner = self.lock()?;
        let job = inner.job_mut(id)?;
        job.mark_completed(result, Utc::now())
            .map_err(|e| JobStoreError::transition(id, e))
    }

    async fn fail_retryable(
        &self,
        id: JobId,
        error: &str,
    ) -> Result<FailureOutcome, JobStoreError> {
        let mut inner = self.lock()?;
        let job = inner.job_mut(id)?;
        job.mark_failed_retryable(error, &self.policy, Utc::now())
            .map_err(|e| JobStoreError::transition(id, e))
    }

    async fn fail_terminal(&self, id: JobId, error: &str) -> Result<(), JobStoreError> {
        let mut inner = self.lock()?;
        let job = inner.job_mut(id)?;
        job.mark_failed_terminal(error, Utc::now())
            .map_err(|e| JobStoreError::transition(id, e))
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.lock()?;
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn record_delivery(&self, id: JobId, delivered: u32) -> Result<(), JobStoreError> {
        let mut inner = self.lock()?;
        let job = inner.job_mut(id)?;
        if !job.status.is_terminal() {
            return Err(JobStoreError::InvalidTransition {
                id,
                from: job.status,
                to: JobStatus::Completed,
            });
        }
        job.delivered_slots = job.delivered_slots.max(delivered);
        Ok(())
    }

    async fn remove(&self, id: JobId) -> Result<(), JobStoreError> {
        {
            let mut inner = self.lock()?;
            let status = inner.job_mut(id)?.status;
            if !status.is_terminal() {
                return Err(JobStoreError::InvalidTransition {
                    id,
                    from: status,
                    to: JobStatus::Completed,
                });
            }
            inner.take(id);
        }
        self.freed.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, id: JobId, reason: &str) -> Result<(), JobStoreError> {
        {
            let mut inner = self.lock()?;
            let status = inner.job_mut(id)?.status;
            if status != JobStatus::Failed {
                return Err(JobStoreError::InvalidTransition {
                    id,
                    from: status,
                    to: JobStatus::Failed,
                });
            }
            let job = inner.take(id).ok_or(JobStoreError::NotFound(id))?;
            inner
                .dead_letters
                .push(DeadLetterEntry::new(job, reason.to_string(), Utc::now()));
        }
        self.freed.notify_waiters();
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let inner = self.lock()?;
        Ok(inner.dead_letters.iter().rev().take(limit).cloned().collect())
    }

    async fn cleanup_older_than(&self, age: Duration) -> Result<usize, JobStoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let removed = {
            let mut inner = self.lock()?;
            let expired: Vec<JobId> = inner
                .jobs
                .values()
                .filter(|j| j.status.is_terminal() && j.completed_at.is_some_and(|t| t < cutoff))
                .map(|j| j.id)
                .collect();
            for id in &expired {
                inner.take(*id);
            }

            let before = inner.dead_letters.len();
            inner.dead_letters.retain(|d| d.dead_lettered_at >= cutoff);
            expired.len() + (before - inner.dead_letters.len())
        };

        if removed > 0 {
            self.freed.notify_waiters();
        }
        Ok(removed)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let inner = self.lock()?;
        let mut stats = JobStats {
            dead_lettered: inner.dead_letters.len(),
            ..JobStats::default()
        };
        for job in inner.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn capacity_freed(&self) -> &Notify {
        &self.freed
    }
}
