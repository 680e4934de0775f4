//! LLM task handler (`box` shape).
//!
//! Delegates the actual completion to an injected [`CodergenBackend`];
//! concrete backends (API clients, CLI wrappers) live outside this crate.
//! With no backend installed the handler runs in simulation mode and returns
//! a deterministic stub, which is what the test suite uses.

use std::sync::Arc;

use async_trait::async_trait;
use trellis_core::{Context, Outcome, Result, Value};

use crate::graph::{Graph, Node};
use crate::handler::{NodeHandler, RunHooks};
use crate::handlers::{truncate_chars, write_status};

/// Contract for the LLM call behind a codergen node. The prompt arrives
/// with `$goal` / `$context.<k>` already expanded by the engine.
#[async_trait]
pub trait CodergenBackend: Send + Sync {
    async fn run(&self, node: &Node, prompt: &str, context: &Context) -> Result<String>;
}

/// Deterministic stub backend.
pub struct SimulatedBackend;

#[async_trait]
impl CodergenBackend for SimulatedBackend {
    async fn run(&self, node: &Node, _prompt: &str, _context: &Context) -> Result<String> {
        Ok(format!("[simulated] response for stage: {}", node.id))
    }
}

const MAX_CONTEXT_SNIPPET: usize = 200;

pub struct CodergenHandler {
    backend: Arc<dyn CodergenBackend>,
}

impl CodergenHandler {
    pub fn new(backend: Arc<dyn CodergenBackend>) -> Self {
        Self { backend }
    }

    /// Simulation mode, used when no real backend is wired in.
    pub fn simulated() -> Self {
        Self::new(Arc::new(SimulatedBackend))
    }
}

#[async_trait]
impl NodeHandler for CodergenHandler {
    fn handler_type(&self) -> &str {
        "codergen"
    }

    async fn execute(
        &self,
        node: &Node,
        context: &Context,
        _graph: &Graph,
        hooks: &RunHooks,
    ) -> Result<Outcome> {
        let prompt = node
            .prompt
            .clone()
            .unwrap_or_else(|| node.label.clone());

        let stage_dir = hooks.stage_dir(&node.id).await?;
        tokio::fs::write(stage_dir.join("prompt.md"), &prompt).await?;

        tracing::info!(node = %node.id, label = %node.label, "running codergen stage");

        let call = self.backend.run(node, &prompt, context);
        let result = match node.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(r) => r,
                Err(_) => {
                    let outcome = Outcome::fail("timeout");
                    write_status(&stage_dir, &outcome).await?;
                    return Ok(outcome);
                }
            },
            None => call.await,
        };

        let response = match result {
            Ok(text) => text,
            Err(e) => {
                let outcome = Outcome::fail(e.to_string());
                write_status(&stage_dir, &outcome).await?;
                return Ok(outcome);
            }
        };

        tokio::fs::write(stage_dir.join("response.md"), &response).await?;

        let outcome = Outcome::success(response.clone())
            .with_update("last_stage", Value::String(node.id.clone()))
            .with_update(
                "last_response",
                Value::String(truncate_chars(&response, MAX_CONTEXT_SNIPPET)),
            );
        write_status(&stage_dir, &outcome).await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::{StageStatus, TrellisError};

    use crate::testutil::{make_node, minimal_graph, test_hooks};

    #[tokio::test]
    async fn simulation_mode_is_deterministic() {
        let handler = CodergenHandler::simulated();
        let graph = minimal_graph();
        let (hooks, _dir) = test_hooks();
        let mut node = make_node("plan", "box");
        node.prompt = Some("Plan the work".into());

        let first = handler
            .execute(&node, &Context::new(), &graph, &hooks)
            .await
            .unwrap();
        let second = handler
            .execute(&node, &Context::new(), &graph, &hooks)
            .await
            .unwrap();

        assert_eq!(first.status, StageStatus::Success);
        assert_eq!(first.notes, "[simulated] response for stage: plan");
        assert_eq!(first.notes, second.notes);
        assert_eq!(
            first.context_updates.get("last_stage"),
            Some(&Value::String("plan".into()))
        );
    }

    #[tokio::test]
    async fn writes_prompt_response_and_status() {
        let handler = CodergenHandler::simulated();
        let graph = minimal_graph();
        let (hooks, dir) = test_hooks();
        let mut node = make_node("plan", "box");
        node.prompt = Some("Plan the work".into());

        handler
            .execute(&node, &Context::new(), &graph, &hooks)
            .await
            .unwrap();

        let stage = dir.path().join("plan");
        assert_eq!(
            std::fs::read_to_string(stage.join("prompt.md")).unwrap(),
            "Plan the work"
        );
        assert!(std::fs::read_to_string(stage.join("response.md"))
            .unwrap()
            .contains("plan"));
        let status: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(stage.join("status.json")).unwrap())
                .unwrap();
        assert_eq!(status["outcome"], "success");
    }

    #[tokio::test]
    async fn backend_error_becomes_fail_outcome() {
        struct BrokenBackend;

        #[async_trait]
        impl CodergenBackend for BrokenBackend {
            async fn run(&self, _n: &Node, _p: &str, _c: &Context) -> Result<String> {
                Err(TrellisError::Other("model unavailable".into()))
            }
        }

        let handler = CodergenHandler::new(Arc::new(BrokenBackend));
        let graph = minimal_graph();
        let (hooks, _dir) = test_hooks();
        let mut node = make_node("plan", "box");
        node.prompt = Some("p".into());

        let outcome = handler
            .execute(&node, &Context::new(), &graph, &hooks)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);
        assert_eq!(outcome.failure_reason.as_deref(), Some("model unavailable"));
    }

    #[tokio::test]
    async fn slow_backend_times_out_as_fail() {
        struct SlowBackend;

        #[async_trait]
        impl CodergenBackend for SlowBackend {
            async fn run(&self, _n: &Node, _p: &str, _c: &Context) -> Result<String> {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                Ok("too late".into())
            }
        }

        let handler = CodergenHandler::new(Arc::new(SlowBackend));
        let graph = minimal_graph();
        let (hooks, _dir) = test_hooks();
        let mut node = make_node("plan", "box");
        node.prompt = Some("p".into());
        node.timeout = Some(std::time::Duration::from_millis(20));

        let outcome = handler
            .execute(&node, &Context::new(), &graph, &hooks)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);
        assert_eq!(outcome.notes, "timeout");
    }

    #[tokio::test]
    async fn label_is_prompt_fallback() {
        let handler = CodergenHandler::simulated();
        let graph = minimal_graph();
        let (hooks, dir) = test_hooks();
        let mut node = make_node("step", "box");
        node.label = "Summarize findings".into();

        handler
            .execute(&node, &Context::new(), &graph, &hooks)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("step/prompt.md")).unwrap(),
            "Summarize findings"
        );
    }
}
