//! Rolling execution snapshot for resume.
//!
//! The engine overwrites a single `checkpoint.json` after every step. Writes
//! go to a temp file first and are moved into place with a rename, so a crash
//! mid-write never leaves a torn document. Unknown fields are ignored on
//! load, keeping the format forward-compatible.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::value::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub graph_name: String,
    pub run_id: String,
    /// The node the engine will execute next.
    pub current_node_id: String,
    pub context_snapshot: HashMap<String, Value>,
    pub retry_counts: HashMap<String, u32>,
    pub visited: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    /// Serialize to JSON and atomically replace the file at `path`.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        tracing::debug!(path = %path.display(), node = %self.current_node_id, "checkpoint saved");
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&json)?)
    }

    /// `Ok(None)` when no checkpoint file exists yet.
    pub async fn load_if_exists(path: &Path) -> Result<Option<Self>> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(None);
        }
        Ok(Some(Self::load(path).await?))
    }
}
