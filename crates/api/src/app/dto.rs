use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docrelay_analysis::TaskConfig;
use docrelay_core::TaskLabel;
use docrelay_infra::jobs::{DeadLetterEntry, Job, JobPayload, JobStatus, ReplyTarget, TaskSlot};

use crate::settings::DefaultPrompts;

/// Default and maximum page size of `GET /dead-letters`.
pub const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;
pub const MAX_DEAD_LETTER_LIMIT: usize = 500;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub source: String,
    /// Display name used in outbound messages; defaults to the last path
    /// segment of `source`.
    pub filename: Option<String>,
    pub reply_to: ReplyTarget,
    pub tasks: Vec<TaskRequest>,
}

/// A task as submitted; `prompt` may be left to the configured default.
#[derive(Debug, Deserialize)]
pub struct TaskRequest {
    pub provider: String,
    pub prompt: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub max_input_chars: Option<usize>,
    pub timeout_secs: Option<u64>,
}

impl TaskRequest {
    fn resolve(
        self,
        label: Option<TaskLabel>,
        defaults: &DefaultPrompts,
    ) -> Result<TaskConfig, String> {
        let prompt = match (self.prompt, label) {
            (Some(prompt), _) => prompt,
            (None, Some(label)) => defaults
                .for_label(label)
                .ok_or_else(|| format!("{label} task has no prompt and no default is configured"))?
                .to_string(),
            // Surplus tasks are rejected by the intake's task-count check.
            (None, None) => String::new(),
        };
        Ok(TaskConfig {
            provider: self.provider,
            prompt,
            model: self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            max_input_chars: self.max_input_chars,
            timeout_secs: self.timeout_secs,
        })
    }
}

impl SubmitJobRequest {
    /// Fill defaults; task count and contents are validated by the intake.
    pub fn into_payload(self, defaults: &DefaultPrompts) -> Result<JobPayload, String> {
        let filename = self.filename.unwrap_or_else(|| {
            self.source
                .rsplit(['/', '\\'])
                .next()
                .unwrap_or(&self.source)
                .to_string()
        });
        let tasks = self
            .tasks
            .into_iter()
            .enumerate()
            .map(|(index, task)| task.resolve(TaskLabel::for_index(index), defaults))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(JobPayload {
            source: self.source,
            filename,
            reply_to: self.reply_to,
            tasks,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

impl DeadLetterQuery {
    pub fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
            .clamp(1, MAX_DEAD_LETTER_LIMIT)
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub id: String,
}

/// Job snapshot without the task prompts.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: String,
    pub status: JobStatus,
    pub filename: String,
    pub tasks: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<TaskSlot>>,
    pub delivered_slots: u32,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id.to_string(),
            status: job.status,
            filename: job.payload.filename,
            tasks: job.payload.tasks.len(),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            error: job.error,
            result: job.result,
            delivered_slots: job.delivered_slots,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeadLetterView {
    pub job: JobView,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl From<DeadLetterEntry> for DeadLetterView {
    fn from(entry: DeadLetterEntry) -> Self {
        Self {
            job: entry.job.into(),
            dead_lettered_at: entry.dead_lettered_at,
            reason: entry.reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(prompt: Option<&str>) -> TaskRequest {
        TaskRequest {
            provider: "*".to_string(),
            prompt: prompt.map(str::to_string),
            model: None,
            temperature: None,
            max_tokens: None,
            max_input_chars: None,
            timeout_secs: Some(30),
        }
    }

    fn request(source: &str, filename: Option<&str>) -> SubmitJobRequest {
        SubmitJobRequest {
            source: source.to_string(),
            filename: filename.map(str::to_string),
            reply_to: ReplyTarget::channel("!room"),
            tasks: vec![task(Some("summarise"))],
        }
    }

    fn filename(req: SubmitJobRequest) -> String {
        req.into_payload(&DefaultPrompts::default()).unwrap().filename
    }

    #[test]
    fn filename_defaults_to_last_path_segment() {
        assert_eq!(filename(request("inbox/2024/report.pdf", None)), "report.pdf");
        assert_eq!(filename(request("notes.txt", None)), "notes.txt");
        assert_eq!(filename(request("inbox/a.pdf", Some("Quarterly.pdf"))), "Quarterly.pdf");
    }

    #[test]
    fn missing_prompts_use_the_default_for_their_position() {
        let defaults = DefaultPrompts {
            primary: None,
            secondary: Some("List the action items.".into()),
        };
        let mut req = request("memo.txt", None);
        req.tasks.push(task(None));

        let payload = req.into_payload(&defaults).unwrap();
        assert_eq!(payload.tasks[0].prompt, "summarise");
        assert_eq!(payload.tasks[1].prompt, "List the action items.");
        assert_eq!(payload.tasks[1].timeout_secs, Some(30));

        let mut req = request("memo.txt", None);
        req.tasks[0].prompt = None;
        let err = req.into_payload(&defaults).unwrap_err();
        assert_eq!(err, "primary task has no prompt and no default is configured");
    }

    #[test]
    fn dead_letter_limit_is_clamped() {
        assert_eq!(DeadLetterQuery::default().limit(), DEFAULT_DEAD_LETTER_LIMIT);
        assert_eq!(DeadLetterQuery { limit: Some(0) }.limit(), 1);
        assert_eq!(DeadLetterQuery { limit: Some(10_000) }.limit(), MAX_DEAD_LETTER_LIMIT);
    }
}
