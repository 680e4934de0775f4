//! Unified error type for all Trellis subsystems.

/// Errors produced anywhere in the Trellis stack.
#[derive(Debug, thiserror::Error)]
pub enum TrellisError {
    #[error("DOT parse error at line {line}, col {col}: {message}")]
    Parse {
        line: usize,
        col: usize,
        message: String,
        snippet: Option<String>,
    },

    #[error("pipeline validation failed: {0}")]
    Validation(String),

    #[error("handler '{handler}' failed on node '{node}': {message}")]
    Handler {
        handler: String,
        node: String,
        message: String,
    },

    #[error("no handler registered for node '{node}' (type '{handler_type}')")]
    MissingHandler { node: String, handler_type: String },

    #[error("node '{node}' has no matching outgoing edge")]
    NoOutgoingEdge { node: String },

    #[error("goal gate unmet: node '{node}' did not reach success")]
    GoalGateUnmet { node: String },

    #[error("retries exhausted for node '{node}' after {attempts} attempts")]
    RetriesExhausted { node: String, attempts: u32 },

    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("pipeline cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl TrellisError {
    /// `true` when the error is a terminal engine failure rather than a
    /// recoverable per-node condition.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TrellisError::Parse { .. }
                | TrellisError::Validation(_)
                | TrellisError::MissingHandler { .. }
                | TrellisError::NoOutgoingEdge { .. }
                | TrellisError::GoalGateUnmet { .. }
                | TrellisError::Cancelled
        )
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, TrellisError>;
