use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

/// Failure to turn a job's source reference into text.
///
/// This is a job-level failure: no analysis task runs when extraction fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    /// Source could not be read right now (I/O, network, missing download).
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// Source reference is not acceptable (e.g. escapes the document root).
    #[error("invalid source reference: {0}")]
    InvalidReference(String),

    /// Content was read but is not extractable text.
    #[error("unsupported content: {0}")]
    Unsupported(String),

    /// Content was read but yielded no text.
    #[error("no text could be extracted from the document")]
    Empty,
}

impl ExtractionError {
    /// Whether retrying the job could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExtractionError::Unavailable(_))
    }
}

/// Produces the textual content for a job's source reference.
#[async_trait]
pub trait ContentSource: Send + Sync + 'static {
    async fn extract(&self, source: &str) -> Result<String, ExtractionError>;
}

/// Reads UTF-8 text documents from a directory tree.
#[derive(Debug, Clone)]
pub struct FsContentSource {
    root: PathBuf,
}

impl FsContentSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `source` below the root; only plain relative paths are accepted.
    fn resolve(&self, source: &str) -> Result<PathBuf, ExtractionError> {
        let rel = Path::new(source);
        if source.trim().is_empty() {
            return Err(ExtractionError::InvalidReference("empty path".to_string()));
        }
        if !rel.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir)) {
            return Err(ExtractionError::InvalidReference(format!(
                "'{source}' must be a relative path inside the document root"
            )));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ContentSource for FsContentSource {
    async fn extract(&self, source: &str) -> Result<String, ExtractionError> {
        let path = self.resolve(source)?;

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ExtractionError::Unavailable(format!("{}: {e}", path.display())))?;

        let text = String::from_utf8(bytes)
            .map_err(|_| ExtractionError::Unsupported(format!("{source} is not UTF-8 text")))?;

        let text = text.trim();
        if text.is_empty() {
            return Err(ExtractionError::Empty);
        }

        tracing::debug!(source, chars = text.chars().count(), "extracted document text");
        Ok(text.to_string())
    }
}
