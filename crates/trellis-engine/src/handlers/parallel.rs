//! Parallel fan-out (`component` shape) and fan-in (`tripleoctagon` shape).
//!
//! The fan-out form is the simplified one: each outgoing edge names a branch
//! whose immediate node handler runs on an isolated context clone. Branch
//! results are merged back according to the join and error policies, and a
//! JSON summary lands under `parallel.results` for the fan-in node.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use trellis_core::{Context, Outcome, Result, StageStatus, Value};

use crate::events::EventKind;
use crate::graph::{Graph, Node};
use crate::handler::{NodeHandler, RunHooks};
use crate::handlers::write_status;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BranchResult {
    branch: String,
    status: StageStatus,
    notes: String,
}

pub struct ParallelHandler;

#[async_trait]
impl NodeHandler for ParallelHandler {
    fn handler_type(&self) -> &str {
        "parallel"
    }

    async fn execute(
        &self,
        node: &Node,
        context: &Context,
        graph: &Graph,
        hooks: &RunHooks,
    ) -> Result<Outcome> {
        let stage_dir = hooks.stage_dir(&node.id).await?;

        let branches = graph.outgoing_edges(&node.id);
        if branches.is_empty() {
            let outcome = Outcome::fail("no outgoing edges for parallel node");
            write_status(&stage_dir, &outcome).await?;
            return Ok(outcome);
        }

        let join_policy = node.attr_str("join_policy").unwrap_or("wait_all").to_string();
        let error_policy = node.attr_str("error_policy").unwrap_or("continue").to_string();

        hooks.emit(EventKind::ParallelStarted {
            node_id: node.id.clone(),
            branch_count: branches.len(),
        });
        tracing::info!(node = %node.id, branches = branches.len(), %join_policy, %error_policy, "parallel fan-out");

        let branch_runs = branches.iter().map(|edge| {
            let target = edge.to.clone();
            let node_id = node.id.clone();
            async move {
                hooks.emit(EventKind::ParallelBranchStarted {
                    node_id: node_id.clone(),
                    branch: target.clone(),
                });
                let outcome = run_branch(&target, context, graph, hooks).await;
                hooks.emit(EventKind::ParallelBranchCompleted {
                    node_id,
                    branch: target.clone(),
                    status: outcome.status,
                });
                (target, outcome)
            }
        });
        let raw: Vec<(String, Outcome)> = futures::future::join_all(branch_runs).await;

        // Error policy: `ignore` downgrades failures to skips before the
        // join policy looks at anything.
        let mapped: Vec<(String, Outcome)> = raw
            .into_iter()
            .map(|(branch, mut outcome)| {
                if error_policy == "ignore" && outcome.status == StageStatus::Fail {
                    outcome.status = StageStatus::Skipped;
                }
                (branch, outcome)
            })
            .collect();

        let success_count = mapped
            .iter()
            .filter(|(_, o)| o.status == StageStatus::Success)
            .count();
        let failures: Vec<&(String, Outcome)> = mapped
            .iter()
            .filter(|(_, o)| o.status == StageStatus::Fail)
            .collect();

        let satisfied = match join_policy.as_str() {
            "first_success" => success_count > 0,
            _ => failures.is_empty(),
        };

        let results: Vec<BranchResult> = mapped
            .iter()
            .map(|(branch, o)| BranchResult {
                branch: branch.clone(),
                status: o.status,
                notes: o.notes.clone(),
            })
            .collect();
        tokio::fs::write(
            stage_dir.join("parallel_results.json"),
            serde_json::to_string_pretty(&results)?,
        )
        .await?;

        hooks.emit(EventKind::ParallelCompleted {
            node_id: node.id.clone(),
            succeeded: success_count,
            failed: failures.len(),
        });

        let mut outcome = if error_policy == "fail_fast" && !failures.is_empty() {
            Outcome::fail(format!(
                "branch '{}' failed: {}",
                failures[0].0,
                failures[0]
                    .1
                    .failure_reason
                    .as_deref()
                    .unwrap_or("unknown failure")
            ))
        } else if satisfied {
            Outcome::success(format!(
                "parallel execution: {success_count}/{} branches succeeded",
                mapped.len()
            ))
        } else {
            Outcome::fail(format!(
                "parallel join '{join_policy}' unsatisfied: {success_count}/{} branches succeeded",
                mapped.len()
            ))
        };

        // Successful branches contribute their context updates to the join.
        for (_, branch_outcome) in &mapped {
            if branch_outcome.status.is_ok() {
                outcome
                    .context_updates
                    .extend(branch_outcome.context_updates.clone());
            }
        }
        outcome.context_updates.insert(
            "parallel.results".into(),
            Value::String(serde_json::to_string(&results)?),
        );
        outcome
            .context_updates
            .insert("parallel.branch_count".into(), Value::Int(mapped.len() as i64));
        outcome
            .context_updates
            .insert("parallel.success_count".into(), Value::Int(success_count as i64));

        write_status(&stage_dir, &outcome).await?;
        Ok(outcome)
    }
}

/// Execute one branch's immediate node handler on an isolated context.
async fn run_branch(target: &str, context: &Context, graph: &Graph, hooks: &RunHooks) -> Outcome {
    let Some(branch_node) = graph.node(target) else {
        return Outcome::fail(format!("branch target '{target}' not found"));
    };
    let handler_type = hooks.registry.resolve_type(branch_node);
    let Some(handler) = hooks.registry.get(&handler_type) else {
        return Outcome::fail(format!("no handler registered for type '{handler_type}'"));
    };
    let branch_context = context.clone_isolated().await;
    match handler
        .execute(branch_node, &branch_context, graph, hooks)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => Outcome::fail(e.to_string()),
    }
}

/// Synchronization point closing a fan-out region. Consolidates the
/// `parallel.results` summary when one is present and picks the first
/// successful branch as the representative result.
pub struct FanInHandler;

#[async_trait]
impl NodeHandler for FanInHandler {
    fn handler_type(&self) -> &str {
        "fan_in"
    }

    async fn execute(
        &self,
        node: &Node,
        context: &Context,
        _graph: &Graph,
        hooks: &RunHooks,
    ) -> Result<Outcome> {
        let stage_dir = hooks.stage_dir(&node.id).await?;

        let results: Vec<BranchResult> = match context.get("parallel.results").await {
            Some(Value::String(json)) => serde_json::from_str(&json).unwrap_or_default(),
            _ => Vec::new(),
        };

        let mut outcome = Outcome::success("fan-in merge completed");
        if !results.is_empty() {
            let selected = results
                .iter()
                .find(|r| r.status == StageStatus::Success)
                .unwrap_or(&results[0]);
            outcome
                .context_updates
                .insert("fan_in.selected".into(), Value::String(selected.branch.clone()));
            outcome.context_updates.insert(
                "fan_in.candidate_count".into(),
                Value::Int(results.len() as i64),
            );
            outcome.notes = format!("selected '{}' from {} candidates", selected.branch, results.len());
        }

        tracing::info!(node = %node.id, candidates = results.len(), "fan-in merge");
        write_status(&stage_dir, &outcome).await?;
        Ok(outcome)
    }
}
