//! Runs the analysis tasks of one job: extract once, fan out, collect slots.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, warn};

use docrelay_analysis::{ContentSource, ProviderRegistry, TaskConfig, TaskError};
use docrelay_core::TaskLabel;

use super::types::{Job, TaskSlot};

/// Result of executing a job's tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Every task finished (successfully or not); one slot per task, in label order.
    Completed(Vec<TaskSlot>),
    /// The job could not run at all (e.g. extraction failed).
    JobFailed { error: String, retryable: bool },
}

/// Fan-out/fan-in executor.
///
/// The source document is extracted once and shared by every task. Tasks run
/// concurrently on their own tokio tasks; a task that errors, times out or
/// panics only fills its own slot with a failure.
#[derive(Clone)]
pub struct TaskExecutor {
    source: Arc<dyn ContentSource>,
    providers: ProviderRegistry,
    default_timeout: Duration,
}

impl TaskExecutor {
    pub fn new(source: Arc<dyn ContentSource>, providers: ProviderRegistry) -> Self {
        Self {
            source,
            providers,
            default_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub async fn execute(&self, job: &Job) -> ExecutionOutcome {
        let text: Arc<str> = match self.source.extract(&job.payload.source).await {
            Ok(text) => text.into(),
            Err(e) => {
                warn!(
                    job_id = %job.id,
                    source = %job.payload.source,
                    error = %e,
                    "extraction failed"
                );
                return ExecutionOutcome::JobFailed {
                    error: e.to_string(),
                    retryable: e.is_retryable(),
                };
            }
        };

        // Dropping the handles (e.g. on shutdown abort) cancels the tasks too.
        let handles: Vec<(TaskLabel, AbortOnDropHandle<TaskSlot>)> = job
            .payload
            .labelled_tasks()
            .map(|(label, config)| {
                let task = self.spawn_task(job, label, config.clone(), text.clone());
                (label, AbortOnDropHandle::new(task))
            })
            .collect();

        let mut slots = Vec::with_capacity(handles.len());
        for (label, handle) in handles {
            let slot = match handle.await {
                Ok(slot) => slot,
                Err(e) => {
                    warn!(job_id = %job.id, %label, error = %e, "analysis task aborted");
                    TaskSlot::failure(label, format!("analysis task crashed: {e}"))
                }
            };
            slots.push(slot);
        }

        ExecutionOutcome::Completed(slots)
    }

    fn spawn_task(
        &self,
        job: &Job,
        label: TaskLabel,
        config: TaskConfig,
        text: Arc<str>,
    ) -> tokio::task::JoinHandle<TaskSlot> {
        let job_id = job.id;
        let providers = self.providers.clone();
        let timeout = config.timeout_or(self.default_timeout);

        tokio::spawn(async move {
            let started = Instant::now();
            let result = match providers.resolve(&config.provider) {
                Ok(provider) => {
                    match tokio::time::timeout(timeout, provider.analyze(&text, &config)).await {
                        Ok(result) => result,
                        Err(_) => Err(TaskError::Timeout(timeout)),
                    }
                }
                Err(e) => Err(e),
            };

            let elapsed_ms = started.elapsed().as_millis() as u64;
            match result {
                Ok(output) => {
                    debug!(
                        %job_id,
                        %label,
                        provider = %config.provider,
                        elapsed_ms,
                        "task succeeded"
                    );
                    TaskSlot::success(label, output)
                }
                Err(e) => {
                    warn!(
                        %job_id,
                        %label,
                        provider = %config.provider,
                        elapsed_ms,
                        error = %e,
                        "task failed"
                    );
                    TaskSlot::failure(label, e.to_string())
                }
            }
        })
    }
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("providers", &self.providers)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;

    use docrelay_analysis::{AnalysisProvider, ExtractionError};

    use super::*;
    use crate::jobs::types::{JobPayload, ReplyTarget, SlotOutcome};

    struct StaticSource(Result<String, ExtractionError>);

    #[async_trait]
    impl ContentSource for StaticSource {
        async fn extract(&self, _source: &str) -> Result<String, ExtractionError> {
            self.0.clone()
        }
    }

    /// Echoes the prompt and input length after an optional delay.
    struct Echo {
        delay: Duration,
    }

    #[async_trait]
    impl AnalysisProvider for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn analyze(&self, text: &str, config: &TaskConfig) -> Result<String, TaskError> {
            tokio::time::sleep(self.delay).await;
            Ok(format!("{}:{}", config.prompt, text.len()))
        }
    }

    struct Broken;

    #[async_trait]
    impl AnalysisProvider for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn analyze(&self, _text: &str, _config: &TaskConfig) -> Result<String, TaskError> {
            Err(TaskError::Failed("model overloaded".into()))
        }
    }

    struct Panics;

    #[async_trait]
    impl AnalysisProvider for Panics {
        fn name(&self) -> &str {
            "panics"
        }

        async fn analyze(&self, _text: &str, _config: &TaskConfig) -> Result<String, TaskError> {
            panic!("provider bug")
        }
    }

    fn executor(source: StaticSource) -> TaskExecutor {
        let providers = ProviderRegistry::new()
            .with("fast", Arc::new(Echo { delay: Duration::ZERO }))
            .with("slow", Arc::new(Echo { delay: Duration::from_secs(5) }))
            .with("broken", Arc::new(Broken))
            .with("panics", Arc::new(Panics));
        TaskExecutor::new(Arc::new(source), providers).with_default_timeout(Duration::from_secs(1))
    }

    fn job(primary: &str, secondary: Option<&str>) -> Job {
        let mut payload = JobPayload::new(
            "doc.txt",
            "doc.txt",
            ReplyTarget::channel("!room"),
            TaskConfig::new(primary, "summary"),
        );
        if let Some(secondary) = secondary {
            payload = payload.with_secondary(TaskConfig::new(secondary, "triage"));
        }
        Job::new(payload, 3, Utc::now())
    }

    #[tokio::test]
    async fn dual_tasks_both_succeed() {
        let exec = executor(StaticSource(Ok("hello".into())));
        let outcome = exec.execute(&job("fast", Some("fast"))).await;

        assert_eq!(
            outcome,
            ExecutionOutcome::Completed(vec![
                TaskSlot::success(TaskLabel::Primary, "summary:5"),
                TaskSlot::success(TaskLabel::Secondary, "triage:5"),
            ])
        );
    }

    #[tokio::test]
    async fn timeout_fills_only_its_slot() {
        let exec = executor(StaticSource(Ok("hello".into())));
        let ExecutionOutcome::Completed(slots) = exec.execute(&job("fast", Some("slow"))).await
        else {
            panic!("expected completion");
        };

        assert!(slots[0].is_success());
        assert_eq!(
            slots[1].outcome,
            SlotOutcome::Failure {
                error: "timed out after 1s".into()
            }
        );
    }

    #[tokio::test]
    async fn provider_error_and_unknown_provider_are_slot_failures() {
        let exec = executor(StaticSource(Ok("hello".into())));
        let ExecutionOutcome::Completed(slots) = exec.execute(&job("broken", Some("nobody"))).await
        else {
            panic!("expected completion");
        };

        assert_eq!(slots.len(), 2);
        assert!(slots.iter().all(|s| !s.is_success()));
        assert_eq!(slots[0].label, TaskLabel::Primary);
        assert_eq!(slots[1].label, TaskLabel::Secondary);
    }

    #[tokio::test]
    async fn panicking_task_does_not_affect_sibling() {
        let exec = executor(StaticSource(Ok("hello".into())));
        let ExecutionOutcome::Completed(slots) = exec.execute(&job("panics", Some("fast"))).await
        else {
            panic!("expected completion");
        };

        assert!(!slots[0].is_success());
        assert_eq!(slots[1], TaskSlot::success(TaskLabel::Secondary, "triage:5"));
    }

    #[tokio::test]
    async fn extraction_failure_is_job_level() {
        let exec = executor(StaticSource(Err(ExtractionError::Unavailable("disk".into()))));
        assert_eq!(
            exec.execute(&job("fast", None)).await,
            ExecutionOutcome::JobFailed {
                error: "source unavailable: disk".into(),
                retryable: true
            }
        );

        let exec = executor(StaticSource(Err(ExtractionError::Empty)));
        assert!(matches!(
            exec.execute(&job("fast", None)).await,
            ExecutionOutcome::JobFailed { retryable: false, .. }
        ));
    }
}
