//! Durable job store persisted in SQLite.
//!
//! Jobs live in a single `jobs` table; dead letters in `dead_letters`. Every
//! state change is a conditional `UPDATE`/`DELETE` guarded on the expected
//! status, so a row can only take each edge of the state machine once even with
//! several pools pointed at the same file.
//!
//! Timestamps are stored as fixed-width RFC3339 strings (microsecond precision,
//! `Z` suffix) so that text comparison orders them chronologically.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tokio::sync::Notify;

use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{
    DeadLetterEntry, FailureOutcome, InvalidTransition, Job, JobId, JobPayload, JobStatus,
    RetryPolicy, TaskSlot,
};

impl sqlx::Type<sqlx::Sqlite> for JobStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <&str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for JobStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<'r, sqlx::Sqlite>>::decode(value)?;
        JobStatus::from_str(s).map_err(|e| e.to_string().into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for JobStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        let s = self.as_str();
        <&str as sqlx::Encode<'q, sqlx::Sqlite>>::encode_by_ref(&s, buf)
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        seq             INTEGER PRIMARY KEY AUTOINCREMENT,
        id              TEXT NOT NULL UNIQUE,
        payload         TEXT NOT NULL,
        status          TEXT NOT NULL,
        created_at      TEXT NOT NULL,
        started_at      TEXT NULL,
        completed_at    TEXT NULL,
        available_at    TEXT NOT NULL,
        retry_count     INTEGER NOT NULL DEFAULT 0,
        max_retries     INTEGER NOT NULL,
        result          TEXT NULL,
        error           TEXT NULL,
        delivered_slots INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status, available_at)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs (created_at, seq)",
    r#"
    CREATE TABLE IF NOT EXISTS dead_letters (
        id               TEXT PRIMARY KEY,
        job              TEXT NOT NULL,
        reason           TEXT NOT NULL,
        dead_lettered_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_dead_letters_at ON dead_letters (dead_lettered_at)",
];

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, JobStoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| JobStoreError::Persistence(format!("bad timestamp '{raw}': {e}")))
}

fn storage(op: &'static str) -> impl FnOnce(sqlx::Error) -> JobStoreError {
    move |e| JobStoreError::Persistence(format!("{op}: {e}"))
}

fn encoding(e: serde_json::Error) -> JobStoreError {
    JobStoreError::Persistence(format!("json: {e}"))
}

fn row_to_job(row: &SqliteRow) -> Result<Job, JobStoreError> {
    let get_str = |col: &str| -> Result<String, JobStoreError> {
        row.try_get::<String, _>(col).map_err(storage("decode job row"))
    };
    let get_opt = |col: &str| -> Result<Option<String>, JobStoreError> {
        row.try_get::<Option<String>, _>(col).map_err(storage("decode job row"))
    };
    let get_int = |col: &str| -> Result<i64, JobStoreError> {
        row.try_get::<i64, _>(col).map_err(storage("decode job row"))
    };

    let id = JobId::from_str(&get_str("id")?)
        .map_err(|e| JobStoreError::Persistence(e.to_string()))?;
    let payload: JobPayload = serde_json::from_str(&get_str("payload")?).map_err(encoding)?;
    let status: JobStatus = row.try_get("status").map_err(storage("decode job row"))?;
    let result = get_opt("result")?
        .map(|raw| serde_json::from_str::<Vec<TaskSlot>>(&raw))
        .transpose()
        .map_err(encoding)?;

    Ok(Job {
        id,
        seq: get_int("seq")? as u64,
        payload,
        status,
        created_at: parse_ts(&get_str("created_at")?)?,
        started_at: get_opt("started_at")?.as_deref().map(parse_ts).transpose()?,
        completed_at: get_opt("completed_at")?.as_deref().map(parse_ts).transpose()?,
        available_at: parse_ts(&get_str("available_at")?)?,
        retry_count: get_int("retry_count")? as u32,
        max_retries: get_int("max_retries")? as u32,
        result,
        error: get_opt("error")?,
        delivered_slots: get_int("delivered_slots")? as u32,
    })
}

/// SQLite-backed job store.
///
/// Share one instance via `Arc`: the capacity notifier only wakes waiters on
/// the same instance.
#[derive(Debug)]
pub struct SqliteJobStore {
    pool: SqlitePool,
    capacity: usize,
    policy: RetryPolicy,
    freed: Notify,
}

impl SqliteJobStore {
    /// Open (creating if needed) the database at `url` and ensure the schema exists.
    pub async fn connect(
        url: &str,
        capacity: usize,
        policy: RetryPolicy,
    ) -> Result<Self, JobStoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(storage("parse database url"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        // Each connection to `:memory:` is its own database, so keep exactly one alive.
        let in_memory = url.contains(":memory:");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(storage("open job database"))?;

        let store = Self::from_pool(pool, capacity, policy);
        store.migrate().await?;
        tracing::info!(url, capacity, "job store ready");
        Ok(store)
    }

    /// Private in-memory database, mostly for tests.
    pub async fn in_memory(capacity: usize, policy: RetryPolicy) -> Result<Self, JobStoreError> {
        Self::connect("sqlite::memory:", capacity, policy).await
    }

    pub fn from_pool(pool: SqlitePool, capacity: usize, policy: RetryPolicy) -> Self {
        Self {
            pool,
            capacity,
            policy,
            freed: Notify::new(),
        }
    }

    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage("create job tables"))?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Work out why a conditional statement touched no row.
    async fn rejection(&self, id: JobId, to: JobStatus) -> JobStoreError {
        match self.get(id).await {
            Ok(Some(job)) => JobStoreError::InvalidTransition {
                id,
                from: job.status,
                to,
            },
            Ok(None) => JobStoreError::NotFound(id),
            Err(e) => e,
        }
    }

    /// Load a job, apply a state-machine edge in memory and write it back,
    /// guarded on the status and retry count that were read.
    async fn apply<T: Send>(
        &self,
        id: JobId,
        to: JobStatus,
        edge: impl FnOnce(&mut Job) -> Result<T, InvalidTransition> + Send,
    ) -> Result<T, JobStoreError> {
        let mut job = self.get(id).await?.ok_or(JobStoreError::NotFound(id))?;
        let (expected_status, expected_retries) = (job.status, job.retry_count);

        let outcome = edge(&mut job).map_err(|e| JobStoreError::transition(id, e))?;

        let result = job
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(encoding)?;

        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?1,
                started_at = ?2,
                completed_at = ?3,
                available_at = ?4,
                retry_count = ?5,
                result = ?6,
                error = ?7
            WHERE id = ?8 AND status = ?9 AND retry_count = ?10
            "#,
        )
        .bind(job.status)
        .bind(job.started_at.as_ref().map(fmt_ts))
        .bind(job.completed_at.as_ref().map(fmt_ts))
        .bind(fmt_ts(&job.available_at))
        .bind(job.retry_count as i64)
        .bind(result)
        .bind(&job.error)
        .bind(id.to_string())
        .bind(expected_status)
        .bind(expected_retries as i64)
        .execute(&self.pool)
        .await
        .map_err(storage("update job"))?;

        if updated.rows_affected() == 0 {
            return Err(self.rejection(id, to).await);
        }
        Ok(outcome)
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[tracing::instrument(skip(self, payload), err)]
    async fn try_enqueue(&self, payload: JobPayload) -> Result<JobId, JobStoreError> {
        payload
            .validate()
            .map_err(|e| JobStoreError::InvalidPayload(e.to_string()))?;

        let id = JobId::new();
        let body = serde_json::to_string(&payload).map_err(encoding)?;
        let now = fmt_ts(&Utc::now());

        // Capacity check and insert are one statement. `created_at` never goes
        // backwards relative to rows already stored.
        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs
                (id, payload, status, created_at, available_at, retry_count, max_retries)
            SELECT ?1, ?2, 'pending', ts, ts, 0, ?4
            FROM (SELECT MAX(?3, COALESCE((SELECT MAX(created_at) FROM jobs), ?3)) AS ts)
            WHERE (SELECT COUNT(*) FROM jobs) < ?5
            "#,
        )
        .bind(id.to_string())
        .bind(body)
        .bind(now)
        .bind(self.policy.max_retries as i64)
        .bind(self.capacity as i64)
        .execute(&self.pool)
        .await
        .map_err(storage("insert job"))?;

        if inserted.rows_affected() == 0 {
            return Err(JobStoreError::Capacity {
                limit: self.capacity,
            });
        }

        tracing::debug!(job_id = %id, "job enqueued");
        Ok(id)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("load job"))?;

        row.as_ref().map(row_to_job).transpose()
    }

    #[tracing::instrument(skip(self), err)]
    async fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        let now = fmt_ts(&Utc::now());

        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'processing',
                started_at = COALESCE(started_at, ?1)
            WHERE seq = (
                SELECT seq FROM jobs
                WHERE status = 'pending' AND available_at <= ?1
                ORDER BY created_at, seq
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage("claim job"))?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn complete(&self, id: JobId, result: Vec<TaskSlot>) -> Result<(), JobStoreError> {
        let now = Utc::now();
        self.apply(id, JobStatus::Completed, move |job| job.mark_completed(result, now))
            .await
    }

    async fn fail_retryable(
        &self,
        id: JobId,
        error: &str,
    ) -> Result<FailureOutcome, JobStoreError> {
        let now = Utc::now();
        let policy = &self.policy;
        self.apply(id, JobStatus::Pending, move |job| {
            job.mark_failed_retryable(error, policy, now)
        })
        .await
    }

    async fn fail_terminal(&self, id: JobId, error: &str) -> Result<(), JobStoreError> {
        let now = Utc::now();
        self.apply(id, JobStatus::Failed, move |job| job.mark_failed_terminal(error, now))
            .await
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status = ?1 ORDER BY created_at, seq LIMIT ?2",
        )
        .bind(status)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(storage("list jobs"))?;

        rows.iter().map(row_to_job).collect()
    }

    async fn record_delivery(&self, id: JobId, delivered: u32) -> Result<(), JobStoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET delivered_slots = MAX(delivered_slots, ?2)
            WHERE id = ?1 AND status IN ('completed', 'failed')
            "#,
        )
        .bind(id.to_string())
        .bind(delivered as i64)
        .execute(&self.pool)
        .await
        .map_err(storage("record delivery"))?;

        if updated.rows_affected() == 0 {
            return Err(self.rejection(id, JobStatus::Completed).await);
        }
        Ok(())
    }

    async fn remove(&self, id: JobId) -> Result<(), JobStoreError> {
        let deleted =
            sqlx::query("DELETE FROM jobs WHERE id = ?1 AND status IN ('completed', 'failed')")
                .bind(id.to_string())
                .execute(&self.pool)
                .await
                .map_err(storage("remove job"))?;

        if deleted.rows_affected() == 0 {
            return Err(self.rejection(id, JobStatus::Completed).await);
        }
        self.freed.notify_waiters();
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    async fn dead_letter(&self, id: JobId, reason: &str) -> Result<(), JobStoreError> {
        let mut tx = self.pool.begin().await.map_err(storage("begin"))?;

        let row = sqlx::query("DELETE FROM jobs WHERE id = ?1 AND status = 'failed' RETURNING *")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage("dead-letter job"))?;

        let Some(row) = row else {
            drop(tx);
            return Err(self.rejection(id, JobStatus::Failed).await);
        };
        let job = row_to_job(&row)?;
        let entry = DeadLetterEntry::new(job, reason.to_string(), Utc::now());

        sqlx::query(
            "INSERT INTO dead_letters (id, job, reason, dead_lettered_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(id.to_string())
        .bind(serde_json::to_string(&entry.job).map_err(encoding)?)
        .bind(&entry.reason)
        .bind(fmt_ts(&entry.dead_lettered_at))
        .execute(&mut *tx)
        .await
        .map_err(storage("archive dead letter"))?;

        tx.commit().await.map_err(storage("commit"))?;
        self.freed.notify_waiters();
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT job, reason, dead_lettered_at FROM dead_letters
            ORDER BY dead_lettered_at DESC, rowid DESC
            LIMIT ?1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(storage("list dead letters"))?;

        rows.iter()
            .map(|row| {
                let job: String = row.try_get("job").map_err(storage("decode dead letter"))?;
                let at: String = row
                    .try_get("dead_lettered_at")
                    .map_err(storage("decode dead letter"))?;
                Ok(DeadLetterEntry {
                    job: serde_json::from_str(&job).map_err(encoding)?,
                    reason: row.try_get("reason").map_err(storage("decode dead letter"))?,
                    dead_lettered_at: parse_ts(&at)?,
                })
            })
            .collect()
    }

    #[tracing::instrument(skip(self), err)]
    async fn cleanup_older_than(&self, age: Duration) -> Result<usize, JobStoreError> {
        let age = chrono::Duration::from_std(age)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let cutoff = fmt_ts(&(Utc::now() - age));

        let jobs = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed') AND completed_at < ?1
            "#,
        )
        .bind(&cutoff)
        .execute(&self.pool)
        .await
        .map_err(storage("clean up jobs"))?
        .rows_affected();

        let letters = sqlx::query("DELETE FROM dead_letters WHERE dead_lettered_at < ?1")
            .bind(&cutoff)
            .execute(&self.pool)
            .await
            .map_err(storage("clean up dead letters"))?
            .rows_affected();

        let removed = (jobs + letters) as usize;
        if removed > 0 {
            self.freed.notify_waiters();
        }
        Ok(removed)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(storage("job stats"))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: JobStatus = row.try_get("status").map_err(storage("job stats"))?;
            let n = row.try_get::<i64, _>("n").map_err(storage("job stats"))? as usize;
            match status {
                JobStatus::Pending => stats.pending = n,
                JobStatus::Processing => stats.processing = n,
                JobStatus::Completed => stats.completed = n,
                JobStatus::Failed => stats.failed = n,
            }
        }

        stats.dead_lettered = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await
            .map_err(storage("job stats"))? as usize;

        Ok(stats)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn capacity_freed(&self) -> &Notify {
        &self.freed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::SubsecRound;
    use docrelay_analysis::TaskConfig;
    use docrelay_core::TaskLabel;

    use super::*;
    use crate::jobs::types::ReplyTarget;

    fn payload(name: &str) -> JobPayload {
        JobPayload::new(
            format!("{name}.txt"),
            format!("{name}.txt"),
            ReplyTarget::channel("!room").in_reply_to("$evt"),
            TaskConfig::new("openai", "summarise"),
        )
        .with_secondary(TaskConfig::new("ollama", "triage").with_max_input_chars(100))
    }

    async fn store(capacity: usize, max_retries: u32) -> SqliteJobStore {
        SqliteJobStore::in_memory(capacity, RetryPolicy::immediate(max_retries))
            .await
            .unwrap()
    }

    #[test]
    fn timestamps_sort_as_text() {
        let a = Utc::now();
        let b = a + chrono::Duration::microseconds(1);
        let c = a + chrono::Duration::days(400);
        let (ta, tb, tc) = (fmt_ts(&a), fmt_ts(&b), fmt_ts(&c));
        assert_eq!(ta.len(), tc.len());
        assert!(ta < tb && tb < tc);
        assert_eq!(parse_ts(&ta).unwrap(), a.trunc_subsecs(6));
    }

    #[tokio::test]
    async fn payload_round_trips_through_storage() {
        let store = store(10, 3).await;
        let id = store.try_enqueue(payload("a")).await.unwrap();

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.payload, payload("a"));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.max_retries, 3);
        assert!(job.started_at.is_none());
    }

    #[tokio::test]
    async fn claim_is_fifo_and_exclusive() {
        let store = Arc::new(store(100, 3).await);
        let mut ids = Vec::new();
        for i in 0..20 {
            ids.push(store.try_enqueue(payload(&format!("j{i}"))).await.unwrap());
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = store.claim_next().await.unwrap() {
                    claimed.push(job);
                }
                claimed
            }));
        }

        let mut claimed = Vec::new();
        for handle in handles {
            claimed.extend(handle.await.unwrap());
        }
        claimed.sort_by_key(|j| j.seq);
        let claimed_ids: Vec<_> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(claimed_ids, ids);
        assert!(claimed.iter().all(|j| j.status == JobStatus::Processing));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn claims_on_a_pooled_file_database_are_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("contended.db").display());
        let store = Arc::new(
            SqliteJobStore::connect(&url, 500, RetryPolicy::immediate(3))
                .await
                .unwrap(),
        );
        for i in 0..200 {
            store.try_enqueue(payload(&format!("j{i}"))).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = store.claim_next().await.unwrap() {
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: std::collections::HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), 200);
        assert_eq!(unique.len(), 200);
        assert_eq!(store.stats().await.unwrap().processing, 200);
        store.close().await;
    }

    #[tokio::test]
    async fn capacity_counts_every_stored_job() {
        let store = store(2, 0).await;
        let a = store.try_enqueue(payload("a")).await.unwrap();
        store.try_enqueue(payload("b")).await.unwrap();
        assert_eq!(
            store.try_enqueue(payload("c")).await,
            Err(JobStoreError::Capacity { limit: 2 })
        );

        store.claim_next().await.unwrap();
        store.fail_terminal(a, "nope").await.unwrap();
        assert!(store.try_enqueue(payload("c")).await.is_err());

        store.dead_letter(a, "nope").await.unwrap();
        assert!(store.try_enqueue(payload("c")).await.is_ok());
    }

    #[tokio::test]
    async fn complete_records_slots_once() {
        let store = store(10, 3).await;
        let id = store.try_enqueue(payload("a")).await.unwrap();
        store.claim_next().await.unwrap();

        let slots = vec![
            TaskSlot::success(TaskLabel::Primary, "summary"),
            TaskSlot::failure(TaskLabel::Secondary, "timed out after 120s"),
        ];
        store.complete(id, slots.clone()).await.unwrap();

        let err = store.complete(id, slots.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            JobStoreError::InvalidTransition { from: JobStatus::Completed, .. }
        ));

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.result, Some(slots));
        assert!(job.completed_at.unwrap() >= job.started_at.unwrap());
        assert_eq!(store.drain_completed().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retries_keep_started_at_and_error() {
        let store = store(10, 1).await;
        let id = store.try_enqueue(payload("a")).await.unwrap();

        let first = store.claim_next().await.unwrap().unwrap();
        let outcome = store.fail_retryable(id, "provider down").await.unwrap();
        assert!(matches!(outcome, FailureOutcome::Requeued { retry_count: 1, .. }));

        let again = store.get(id).await.unwrap().unwrap();
        assert_eq!(again.status, JobStatus::Pending);
        assert_eq!(again.error.as_deref(), Some("provider down"));

        let second = store.claim_next().await.unwrap().unwrap();
        assert_eq!(second.started_at, first.started_at);
        assert_eq!(
            store.fail_retryable(id, "still down").await.unwrap(),
            FailureOutcome::Exhausted
        );

        let failed = store.get(id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(store.drain_failed().await.unwrap()[0].id, id);
    }

    #[tokio::test]
    async fn backoff_hides_job_until_available() {
        let store = SqliteJobStore::in_memory(10, RetryPolicy::fixed(3, Duration::from_secs(60)))
            .await
            .unwrap();
        let id = store.try_enqueue(payload("a")).await.unwrap();
        store.claim_next().await.unwrap();
        store.fail_retryable(id, "later").await.unwrap();

        assert!(store.claim_next().await.unwrap().is_none());
        assert_eq!(store.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn dead_letter_archive_round_trip() {
        let store = store(10, 0).await;
        let id = store.try_enqueue(payload("a")).await.unwrap();
        store.claim_next().await.unwrap();
        store.fail_retryable(id, "broken pdf").await.unwrap();

        assert!(store.remove(JobId::new()).await.is_err());
        store.dead_letter(id, "broken pdf").await.unwrap();
        assert!(matches!(
            store.dead_letter(id, "again").await,
            Err(JobStoreError::NotFound(_))
        ));

        let letters = store.list_dead_letters(5).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].job.id, id);
        assert_eq!(letters[0].job.error.as_deref(), Some("broken pdf"));

        let stats = store.stats().await.unwrap();
        assert_eq!(stats, JobStats { dead_lettered: 1, ..JobStats::default() });
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_terminal_records() {
        let store = store(10, 0).await;
        let done = store.try_enqueue(payload("done")).await.unwrap();
        store.try_enqueue(payload("waiting")).await.unwrap();
        store.claim_next().await.unwrap();
        store
            .complete(done, vec![TaskSlot::success(TaskLabel::Primary, "ok")])
            .await
            .unwrap();

        assert_eq!(store.cleanup_older_than(Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.cleanup_older_than(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(store.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn jobs_survive_reopening_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("jobs.db").display());

        let id = {
            let store = SqliteJobStore::connect(&url, 10, RetryPolicy::immediate(2))
                .await
                .unwrap();
            let id = store.try_enqueue(payload("a")).await.unwrap();
            store.claim_next().await.unwrap().unwrap();
            store.close().await;
            id
        };

        // Simulated crash: the job was left `Processing`.
        let store = SqliteJobStore::connect(&url, 10, RetryPolicy::immediate(2))
            .await
            .unwrap();
        let report = store.reclaim_orphans().await.unwrap();
        assert_eq!(report.requeued, vec![id]);

        let job = store.claim_next().await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.retry_count, 1);
    }
}
