//! Thread-safe key-value store shared across pipeline stages.

use std::collections::HashMap;
use std::sync::Arc;

use crate::value::Value;

/// Pipeline-wide state passed between stages.
///
/// Cloning a `Context` yields another handle to the **same** inner state;
/// use [`clone_isolated`](Context::clone_isolated) for a deep copy when a
/// parallel branch must not see its siblings' writes. Reads and writes go
/// through a reader-writer lock; writes are short, snapshots copy.
#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<tokio::sync::RwLock<ContextInner>>,
}

#[derive(Debug, Clone, Default)]
struct ContextInner {
    values: HashMap<String, Value>,
    logs: Vec<String>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a key.
    pub async fn set(&self, key: impl Into<String>, value: Value) {
        self.inner.write().await.values.insert(key.into(), value);
    }

    /// Read a value by key (cloned).
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().await.values.get(key).cloned()
    }

    /// Stringified value for a key, or `default` when absent.
    pub async fn get_string(&self, key: &str, default: &str) -> String {
        self.inner
            .read()
            .await
            .values
            .get(key)
            .map(|v| v.to_string())
            .unwrap_or_else(|| default.to_string())
    }

    /// Append a free-form log entry.
    pub async fn append_log(&self, entry: impl Into<String>) {
        self.inner.write().await.logs.push(entry.into());
    }

    pub async fn logs(&self) -> Vec<String> {
        self.inner.read().await.logs.clone()
    }

    /// Consistent copy of the current values map.
    pub async fn snapshot(&self) -> HashMap<String, Value> {
        self.inner.read().await.values.clone()
    }

    /// Replace the values map wholesale, e.g. when resuming from a checkpoint.
    pub async fn restore(&self, snapshot: HashMap<String, Value>) {
        self.inner.write().await.values = snapshot;
    }

    /// Merge `updates` into the context; keys absent from `updates` survive.
    pub async fn apply_updates(&self, updates: HashMap<String, Value>) {
        self.inner.write().await.values.extend(updates);
    }

    /// Deep copy fully independent of the original.
    pub async fn clone_isolated(&self) -> Context {
        let guard = self.inner.read().await;
        Context {
            inner: Arc::new(tokio::sync::RwLock::new(guard.clone())),
        }
    }
}
