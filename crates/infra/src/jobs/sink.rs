//! Outbound delivery: the messages the dispatcher produces and where they go.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use docrelay_core::TaskLabel;

use super::types::{Job, JobId, ReplyTarget, SlotOutcome, TaskSlot};

/// HTTP request timeout for a single webhook delivery.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// What an outbound message reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// A task slot that produced a value.
    SlotResult,
    /// A task slot that failed while the job as a whole completed.
    SlotFailure,
    /// The job itself failed and is being dead-lettered.
    DeadLetter,
}

/// One message for the delivery sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    pub job_id: JobId,
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<TaskLabel>,
    pub reply_to: ReplyTarget,
    pub body: String,
}

impl OutboundMessage {
    /// Message for one task slot of a completed job.
    pub fn for_slot(job: &Job, slot: &TaskSlot) -> Self {
        let filename = &job.payload.filename;
        let title = slot.label.title();
        let (kind, body) = match &slot.outcome {
            SlotOutcome::Success { text } => (
                MessageKind::SlotResult,
                format!("**{title} analysis of `{filename}`**\n\n{text}"),
            ),
            SlotOutcome::Failure { error } => (
                MessageKind::SlotFailure,
                format!("⚠️ {title} analysis of `{filename}` failed: {error}"),
            ),
        };

        Self {
            job_id: job.id,
            kind,
            label: Some(slot.label),
            reply_to: job.payload.reply_to.clone(),
            body,
        }
    }

    /// Notice that a job failed terminally.
    pub fn dead_letter(job: &Job) -> Self {
        let error = job.error.as_deref().unwrap_or("unknown error");
        Self {
            job_id: job.id,
            kind: MessageKind::DeadLetter,
            label: None,
            reply_to: job.payload.reply_to.clone(),
            body: format!("❌ Failed to process `{}`: {error}", job.payload.filename),
        }
    }
}

/// Error type for delivery failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkDeliveryError {
    /// The request never produced a response (network, DNS, timeout, etc.).
    #[error("delivery request failed: {0}")]
    Transport(String),

    /// The destination answered with a non-2xx status code.
    #[error("destination returned HTTP {0}")]
    HttpStatus(u16),

    /// The destination refused the message for a non-HTTP reason.
    #[error("destination rejected the message: {0}")]
    Rejected(String),
}

/// Where results are delivered.
///
/// `send` takes `&mut self`: exactly one dispatcher owns the sink, so the
/// sink is never written from two places at once.
#[async_trait]
pub trait DeliverySink: Send + 'static {
    async fn send(&mut self, message: &OutboundMessage) -> Result<(), SinkDeliveryError>;
}

/// POSTs each message as JSON to a fixed URL.
///
/// No in-process retry: a failed delivery is left to the next dispatch cycle.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Result<Self, SinkDeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                SinkDeliveryError::Transport(format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl DeliverySink for WebhookSink {
    async fn send(&mut self, message: &OutboundMessage) -> Result<(), SinkDeliveryError> {
        let response = self
            .client
            .post(&self.url)
            .json(message)
            .send()
            .await
            .map_err(|e| SinkDeliveryError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SinkDeliveryError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Writes every message to the log; used when no webhook is configured.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

#[async_trait]
impl DeliverySink for LogSink {
    async fn send(&mut self, message: &OutboundMessage) -> Result<(), SinkDeliveryError> {
        tracing::info!(
            job_id = %message.job_id,
            kind = ?message.kind,
            channel = %message.reply_to.channel,
            in_reply_to = message.reply_to.in_reply_to.as_deref(),
            body = %message.body,
            "outbound message"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use docrelay_analysis::TaskConfig;

    use super::*;
    use crate::jobs::types::JobPayload;

    fn job() -> Job {
        let payload = JobPayload::new(
            "uploads/42",
            "contract.pdf",
            ReplyTarget::channel("!legal").in_reply_to("$upload"),
            TaskConfig::new("openai", "summarise"),
        );
        let mut job = Job::new(payload, 3, Utc::now());
        job.error = Some("source unavailable: timeout".into());
        job
    }

    #[test]
    fn slot_messages_name_label_and_file() {
        let job = job();
        let ok =
            OutboundMessage::for_slot(&job, &TaskSlot::success(TaskLabel::Primary, "All good."));
        assert_eq!(ok.kind, MessageKind::SlotResult);
        assert_eq!(ok.body, "**Primary analysis of `contract.pdf`**\n\nAll good.");
        assert_eq!(ok.reply_to.in_reply_to.as_deref(), Some("$upload"));

        let failed = OutboundMessage::for_slot(
            &job,
            &TaskSlot::failure(TaskLabel::Secondary, "timed out after 120s"),
        );
        assert_eq!(failed.kind, MessageKind::SlotFailure);
        assert_eq!(
            failed.body,
            "⚠️ Secondary analysis of `contract.pdf` failed: timed out after 120s"
        );
    }

    #[test]
    fn dead_letter_message_carries_error() {
        let msg = OutboundMessage::dead_letter(&job());
        assert_eq!(msg.kind, MessageKind::DeadLetter);
        assert_eq!(msg.label, None);
        assert_eq!(
            msg.body,
            "❌ Failed to process `contract.pdf`: source unavailable: timeout"
        );
    }

    #[test]
    fn message_json_shape() {
        let job = job();
        let msg = OutboundMessage::for_slot(&job, &TaskSlot::success(TaskLabel::Primary, "x"));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "slot_result");
        assert_eq!(json["label"], "primary");
        assert_eq!(json["reply_to"]["channel"], "!legal");
        assert_eq!(json["job_id"], job.id.to_string());
    }

    #[test]
    fn error_display() {
        assert_eq!(
            SinkDeliveryError::HttpStatus(502).to_string(),
            "destination returned HTTP 502"
        );
    }

    #[tokio::test]
    async fn webhook_to_closed_port_is_transport_error() {
        let mut sink = WebhookSink::new("http://127.0.0.1:9/hook").unwrap();
        let msg = OutboundMessage::dead_letter(&job());
        assert!(matches!(
            sink.send(&msg).await,
            Err(SinkDeliveryError::Transport(_))
        ));
    }
}
