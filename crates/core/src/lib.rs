//! `docrelay-core`: shared building blocks.
//!
//! This crate holds identifiers and small value types used by every other
//! crate in the workspace. It performs no I/O.

pub mod error;
pub mod id;
pub mod label;

pub use error::CoreError;
pub use id::JobId;
pub use label::TaskLabel;
