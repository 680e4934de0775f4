//! Built-in node handlers beyond start/exit/conditional.

pub mod codergen;
pub mod human;
pub mod manager;
pub mod parallel;
pub mod tool;

pub use codergen::{CodergenBackend, CodergenHandler, SimulatedBackend};
pub use human::WaitHumanHandler;
pub use manager::ManagerLoopHandler;
pub use parallel::{FanInHandler, ParallelHandler};
pub use tool::ToolHandler;

use std::path::Path;

use trellis_core::{Outcome, Result};

/// Write the per-stage `status.json` document.
pub(crate) async fn write_status(stage_dir: &Path, outcome: &Outcome) -> Result<()> {
    let doc = serde_json::json!({
        "outcome": outcome.status.to_string(),
        "preferred_next_label": outcome.preferred_label,
        "suggested_next_ids": outcome.suggested_next_ids,
        "notes": outcome.notes,
        "failure_reason": outcome.failure_reason,
    });
    tokio::fs::write(
        stage_dir.join("status.json"),
        serde_json::to_string_pretty(&doc)?,
    )
    .await?;
    Ok(())
}

/// Truncate to at most `limit` characters, on a character boundary.
pub(crate) fn truncate_chars(s: &str, limit: usize) -> String {
    if s.chars().count() <= limit {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(limit).collect();
        out.push_str("...(truncated)");
        out
    }
}
