//! Handler results.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Status of a completed stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    PartialSuccess,
    Fail,
    Retry,
    Skipped,
}

impl StageStatus {
    /// `true` for statuses that satisfy a goal gate.
    pub fn is_ok(self) -> bool {
        matches!(self, StageStatus::Success | StageStatus::PartialSuccess)
    }
}

/// Lowercase form used in edge conditions (`outcome=success`).
impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Success => "success",
            StageStatus::PartialSuccess => "partial_success",
            StageStatus::Fail => "fail",
            StageStatus::Retry => "retry",
            StageStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// The structured result a handler returns for one node invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub status: StageStatus,
    pub preferred_label: Option<String>,
    pub suggested_next_ids: Vec<String>,
    pub notes: String,
    pub failure_reason: Option<String>,
    pub context_updates: HashMap<String, Value>,
}

impl Outcome {
    pub fn success(notes: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Success,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            notes: notes.into(),
            failure_reason: None,
            context_updates: HashMap::new(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            status: StageStatus::Fail,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            notes: reason.clone(),
            failure_reason: Some(reason),
            context_updates: HashMap::new(),
        }
    }

    pub fn skipped(notes: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Skipped,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            notes: notes.into(),
            failure_reason: None,
            context_updates: HashMap::new(),
        }
    }

    pub fn with_label(status: StageStatus, label: impl Into<String>) -> Self {
        Self {
            status,
            preferred_label: Some(label.into()),
            suggested_next_ids: Vec::new(),
            notes: String::new(),
            failure_reason: None,
            context_updates: HashMap::new(),
        }
    }

    pub fn with_update(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context_updates.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&StageStatus::PartialSuccess).unwrap(),
            "\"partial_success\""
        );
        let back: StageStatus = serde_json::from_str("\"skipped\"").unwrap();
        assert_eq!(back, StageStatus::Skipped);
    }

    #[test]
    fn status_display_lowercase() {
        assert_eq!(StageStatus::Success.to_string(), "success");
        assert_eq!(StageStatus::Fail.to_string(), "fail");
        assert_eq!(StageStatus::PartialSuccess.to_string(), "partial_success");
    }

    #[test]
    fn gate_satisfaction() {
        assert!(StageStatus::Success.is_ok());
        assert!(StageStatus::PartialSuccess.is_ok());
        assert!(!StageStatus::Fail.is_ok());
        assert!(!StageStatus::Retry.is_ok());
        assert!(!StageStatus::Skipped.is_ok());
    }

    #[test]
    fn success_constructor() {
        let o = Outcome::success("done");
        assert_eq!(o.status, StageStatus::Success);
        assert_eq!(o.notes, "done");
        assert!(o.failure_reason.is_none());
        assert!(o.context_updates.is_empty());
    }

    #[test]
    fn fail_constructor_mirrors_reason_into_notes() {
        let o = Outcome::fail("exit code 2");
        assert_eq!(o.status, StageStatus::Fail);
        assert_eq!(o.failure_reason.as_deref(), Some("exit code 2"));
        assert_eq!(o.notes, "exit code 2");
    }

    #[test]
    fn with_update_builder() {
        let o = Outcome::success("ok").with_update("k", Value::Int(1));
        assert_eq!(o.context_updates.get("k"), Some(&Value::Int(1)));
    }
}
