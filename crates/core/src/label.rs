//! Task slot labels.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Position of an analysis task within a job.
///
/// A job carries one or two tasks; the first is always `Primary` and the
/// second `Secondary`. Ordering follows delivery order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskLabel {
    Primary,
    Secondary,
}

impl TaskLabel {
    /// Labels in delivery order.
    pub const ALL: [TaskLabel; 2] = [TaskLabel::Primary, TaskLabel::Secondary];

    /// Label for the task at `index` in a job's task list.
    pub fn for_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskLabel::Primary => "primary",
            TaskLabel::Secondary => "secondary",
        }
    }

    /// Capitalised form used in human-facing messages.
    pub fn title(&self) -> &'static str {
        match self {
            TaskLabel::Primary => "Primary",
            TaskLabel::Secondary => "Secondary",
        }
    }
}

impl core::fmt::Display for TaskLabel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskLabel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(TaskLabel::Primary),
            "secondary" => Ok(TaskLabel::Secondary),
            other => Err(CoreError::validation(format!("unknown task label '{other}'"))),
        }
    }
}
