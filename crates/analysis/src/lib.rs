//! `docrelay-analysis`
//!
//! **Responsibility:** boundaries to the collaborators a job depends on.
//!
//! - A [`ContentSource`] turns a payload reference into text, or fails with an
//!   [`ExtractionError`] that the job queue treats as a job-level failure.
//! - An [`AnalysisProvider`] turns text plus a [`TaskConfig`] into a result, or
//!   fails with a [`TaskError`] that stays local to one task slot.
//!
//! Nothing in this crate knows about job state or persistence.

pub mod openai;
pub mod provider;
pub mod registry;
pub mod source;

pub use openai::OpenAiCompatProvider;
pub use provider::{AnalysisProvider, TaskConfig, TaskError};
pub use registry::ProviderRegistry;
pub use source::{ContentSource, ExtractionError, FsContentSource};
