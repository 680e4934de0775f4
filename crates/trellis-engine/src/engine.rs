//! The execution engine: walk, retry, gate, checkpoint, emit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use trellis_core::{Checkpoint, Context, Outcome, Result, StageStatus, TrellisError, Value};

use crate::edge_selection::select_edge;
use crate::events::{EventEmitter, EventKind};
use crate::expand::expand_prompt;
use crate::graph::{Graph, Node};
use crate::handler::{CancelFlag, HandlerRegistry, RunHooks};
use crate::retry::RetryPolicy;
use crate::validation::validate_or_raise;

// ---------------------------------------------------------------------------
// Configuration and result types
// ---------------------------------------------------------------------------

pub struct EngineConfig {
    pub logs_root: PathBuf,
    /// Continue from the newest run directory's rolling checkpoint.
    pub resume: bool,
    pub retry: RetryPolicy,
}

impl EngineConfig {
    pub fn new(logs_root: impl Into<PathBuf>) -> Self {
        Self {
            logs_root: logs_root.into(),
            resume: false,
            retry: RetryPolicy::default(),
        }
    }

    pub fn resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// What a completed run produced. Failures surface as `Err` from
/// [`Engine::run`]; holding a `PipelineResult` means the pipeline succeeded.
#[derive(Debug)]
pub struct PipelineResult {
    pub visited: Vec<String>,
    pub node_outcomes: HashMap<String, Outcome>,
    pub retry_counts: HashMap<String, u32>,
    pub final_context: HashMap<String, Value>,
    pub run_dir: PathBuf,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    registry: Arc<HandlerRegistry>,
    emitter: EventEmitter,
    cancel: CancelFlag,
}

impl Engine {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            emitter: EventEmitter::new(),
            cancel: CancelFlag::default(),
        }
    }

    pub fn with_default_registry() -> Self {
        Self::new(crate::handler::default_registry())
    }

    /// The emitter observers subscribe to; events for every run of this
    /// engine flow through it.
    pub fn events(&self) -> &EventEmitter {
        &self.emitter
    }

    /// Handle for cooperative cancellation from another task.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run the pipeline to a terminal state.
    pub async fn run(
        &self,
        graph: &Graph,
        context: Context,
        config: &EngineConfig,
    ) -> Result<PipelineResult> {
        validate_or_raise(graph)?;

        let started = Instant::now();

        // Locate or create the run directory, restoring checkpointed state
        // when resuming.
        let mut visited: Vec<String> = Vec::new();
        let mut node_outcomes: HashMap<String, Outcome> = HashMap::new();
        let mut retry_counts: HashMap<String, u32> = HashMap::new();
        let mut current: String;

        let resumed = if config.resume {
            find_resumable_run(&config.logs_root).await
        } else {
            None
        };
        let run_dir = match resumed {
            Some((dir, cp)) => {
                tracing::info!(run = %cp.run_id, node = %cp.current_node_id, "resuming from checkpoint");
                context.restore(cp.context_snapshot).await;
                retry_counts = cp.retry_counts;
                visited = cp.visited;
                current = cp.current_node_id;
                dir
            }
            _ => {
                let dir = create_run_dir(&config.logs_root).await?;
                current = graph
                    .start_node()
                    .map(|n| n.id.clone())
                    .ok_or_else(|| TrellisError::Validation("no start node found".into()))?;
                context
                    .set("graph.goal", Value::String(graph.goal.clone()))
                    .await;
                write_manifest(graph, &dir).await?;
                dir
            }
        };
        let run_id = run_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "run".to_string());

        let hooks = RunHooks {
            run_id: run_id.clone(),
            run_dir: run_dir.clone(),
            cancel: self.cancel.clone(),
            events: self.emitter.clone(),
            registry: self.registry.clone(),
        };

        self.emitter.emit(
            &run_id,
            EventKind::PipelineStarted {
                graph_name: graph.name.clone(),
                node_count: graph.node_count(),
            },
        );

        let checkpoint_path = run_dir.join("checkpoint.json");
        // Tracks the gate that most recently forced a retry jump, so the
        // same gate failing twice in a row aborts instead of looping.
        let mut last_failed_gate: Option<String> = None;

        loop {
            if self.cancel.is_cancelled() {
                self.save_checkpoint(graph, &run_id, &checkpoint_path, &current, &context, &retry_counts, &visited)
                    .await?;
                self.emitter.emit(
                    &run_id,
                    EventKind::PipelineFailed {
                        reason: "cancelled".into(),
                    },
                );
                return Err(TrellisError::Cancelled);
            }

            let node = match graph.node(&current) {
                Some(n) => n,
                None => {
                    let reason = format!("node '{current}' not found");
                    self.emitter
                        .emit(&run_id, EventKind::PipelineFailed { reason: reason.clone() });
                    return Err(TrellisError::Other(reason));
                }
            };
            let handler_type = self.registry.resolve_type(node);
            let Some(handler) = self.registry.get(&handler_type) else {
                self.emitter.emit(
                    &run_id,
                    EventKind::PipelineFailed {
                        reason: format!("no handler for type '{handler_type}'"),
                    },
                );
                return Err(TrellisError::MissingHandler {
                    node: node.id.clone(),
                    handler_type,
                });
            };

            self.emitter.emit(
                &run_id,
                EventKind::StageStarted {
                    node_id: node.id.clone(),
                    handler_type: handler_type.clone(),
                },
            );

            let max_retries = effective_max_retries(node, graph);
            let outcome = loop {
                // Variable expansion happens per invocation so retries see
                // fresh context values.
                let invocation = expanded_node(node, graph, &context).await;
                let outcome = match handler
                    .execute(&invocation, &context, graph, &hooks)
                    .await
                {
                    Ok(o) => o,
                    // Handlers never fail the engine; errors become FAIL
                    // outcomes with the message in notes.
                    Err(e) => Outcome::fail(e.to_string()),
                };

                if matches!(outcome.status, StageStatus::Fail | StageStatus::Retry) {
                    let used = retry_counts.get(&node.id).copied().unwrap_or(0);
                    if used < max_retries && !self.cancel.is_cancelled() {
                        let attempt = used + 1;
                        retry_counts.insert(node.id.clone(), attempt);
                        let delay = config.retry.delay_for_attempt(attempt);
                        self.emitter.emit(
                            &run_id,
                            EventKind::StageRetrying {
                                node_id: node.id.clone(),
                                attempt,
                                delay_ms: delay.as_millis() as u64,
                            },
                        );
                        tracing::info!(node = %node.id, attempt, delay_ms = delay.as_millis() as u64, "retrying stage");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    if outcome.status == StageStatus::Retry && node.allow_partial {
                        let mut partial = outcome;
                        partial.status = StageStatus::PartialSuccess;
                        partial.notes = "retries exhausted, partial accepted".into();
                        break partial;
                    }
                }
                break outcome;
            };

            visited.push(node.id.clone());
            node_outcomes.insert(node.id.clone(), outcome.clone());

            // Context updates land before the stage event fires.
            context.apply_updates(outcome.context_updates.clone()).await;
            context
                .set("outcome", Value::String(outcome.status.to_string()))
                .await;
            if let Some(label) = &outcome.preferred_label {
                context
                    .set("preferred_label", Value::String(label.clone()))
                    .await;
            }
            context
                .append_log(format!("stage {}: {}", node.id, outcome.status))
                .await;

            if outcome.status == StageStatus::Fail {
                self.emitter.emit(
                    &run_id,
                    EventKind::StageFailed {
                        node_id: node.id.clone(),
                        reason: outcome
                            .failure_reason
                            .clone()
                            .unwrap_or_else(|| "unknown failure".into()),
                    },
                );
            } else {
                self.emitter.emit(
                    &run_id,
                    EventKind::StageCompleted {
                        node_id: node.id.clone(),
                        status: outcome.status,
                    },
                );
            }

            if node.is_exit() {
                match unmet_gate(graph, &visited, &node_outcomes) {
                    Some(gate) => {
                        if last_failed_gate.as_deref() == Some(gate.id.as_str()) {
                            // Second consecutive failure of the same gate.
                            self.emitter.emit(
                                &run_id,
                                EventKind::PipelineFailed {
                                    reason: "goal_gate_unmet".into(),
                                },
                            );
                            return Err(TrellisError::GoalGateUnmet {
                                node: gate.id.clone(),
                            });
                        }
                        let target = resolve_retry_target(gate, graph)
                            .filter(|t| graph.node(t).is_some());
                        let Some(target) = target else {
                            self.emitter.emit(
                                &run_id,
                                EventKind::PipelineFailed {
                                    reason: "goal_gate_unmet".into(),
                                },
                            );
                            return Err(TrellisError::GoalGateUnmet {
                                node: gate.id.clone(),
                            });
                        };
                        tracing::warn!(gate = %gate.id, retry_target = %target, "goal gate unmet, routing to retry target");
                        last_failed_gate = Some(gate.id.clone());
                        current = target;
                        self.save_checkpoint(graph, &run_id, &checkpoint_path, &current, &context, &retry_counts, &visited)
                            .await?;
                        continue;
                    }
                    None => {
                        self.save_checkpoint(graph, &run_id, &checkpoint_path, &current, &context, &retry_counts, &visited)
                            .await?;
                        self.emitter.emit(
                            &run_id,
                            EventKind::PipelineCompleted {
                                visited: visited.clone(),
                                duration_ms: started.elapsed().as_millis() as u64,
                            },
                        );
                        break;
                    }
                }
            }

            // Select the next edge against outcome and context.
            let snapshot = context.snapshot().await;
            let resolve = |key: &str| -> String {
                match key {
                    "outcome" => outcome.status.to_string(),
                    "preferred_label" => outcome.preferred_label.clone().unwrap_or_default(),
                    _ => {
                        let bare = key.strip_prefix("context.").unwrap_or(key);
                        snapshot
                            .get(key)
                            .or_else(|| snapshot.get(bare))
                            .map(|v| v.to_string())
                            .unwrap_or_default()
                    }
                }
            };
            match select_edge(graph, &node.id, &outcome, &resolve) {
                Some(edge) => {
                    current = edge.to.clone();
                    self.save_checkpoint(graph, &run_id, &checkpoint_path, &current, &context, &retry_counts, &visited)
                        .await?;
                }
                None => {
                    self.emitter.emit(
                        &run_id,
                        EventKind::PipelineFailed {
                            reason: "no_outgoing_edge".into(),
                        },
                    );
                    return Err(TrellisError::NoOutgoingEdge {
                        node: node.id.clone(),
                    });
                }
            }
        }

        Ok(PipelineResult {
            visited,
            node_outcomes,
            retry_counts,
            final_context: context.snapshot().await,
            run_dir,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn save_checkpoint(
        &self,
        graph: &Graph,
        run_id: &str,
        path: &Path,
        current: &str,
        context: &Context,
        retry_counts: &HashMap<String, u32>,
        visited: &[String],
    ) -> Result<()> {
        let checkpoint = Checkpoint {
            graph_name: graph.name.clone(),
            run_id: run_id.to_string(),
            current_node_id: current.to_string(),
            context_snapshot: context.snapshot().await,
            retry_counts: retry_counts.clone(),
            visited: visited.to_vec(),
            timestamp: Utc::now(),
        };
        checkpoint.save(path).await?;
        self.emitter.emit(
            run_id,
            EventKind::CheckpointSaved {
                node_id: current.to_string(),
            },
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Node retries, falling back to the graph-level `default_max_retry` when
/// the node does not set its own.
fn effective_max_retries(node: &Node, graph: &Graph) -> u32 {
    if node.max_retries > 0 {
        return node.max_retries;
    }
    graph
        .attrs
        .get("default_max_retry")
        .and_then(Value::as_int)
        .map(|n| n.clamp(0, crate::graph::MAX_RETRIES_CAP) as u32)
        .unwrap_or(0)
}

/// Clone of the node with `$goal` / `$context.<k>` expanded in its prompt.
async fn expanded_node(node: &Node, graph: &Graph, context: &Context) -> Node {
    let mut invocation = node.clone();
    if let Some(prompt) = &node.prompt {
        let snapshot = context.snapshot().await;
        invocation.prompt = Some(expand_prompt(prompt, &graph.goal, &snapshot));
    }
    invocation
}

/// First visited goal-gated node whose last outcome did not satisfy the
/// gate, in visit order.
fn unmet_gate<'a>(
    graph: &'a Graph,
    visited: &[String],
    node_outcomes: &HashMap<String, Outcome>,
) -> Option<&'a Node> {
    let mut seen = std::collections::HashSet::new();
    for id in visited {
        if !seen.insert(id.as_str()) {
            continue;
        }
        let Some(node) = graph.node(id) else { continue };
        if !node.goal_gate {
            continue;
        }
        if let Some(outcome) = node_outcomes.get(id) {
            if !outcome.status.is_ok() {
                return Some(node);
            }
        }
    }
    None
}

/// 4-level retry target fallback: node retry_target, node fallback, graph
/// retry_target, graph fallback.
fn resolve_retry_target(node: &Node, graph: &Graph) -> Option<String> {
    node.retry_target
        .clone()
        .or_else(|| node.fallback_retry_target.clone())
        .or_else(|| graph.graph_attr_str("retry_target").map(str::to_string))
        .or_else(|| {
            graph
                .graph_attr_str("fallback_retry_target")
                .map(str::to_string)
        })
}

async fn create_run_dir(logs_root: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(logs_root).await?;
    let base = format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S"));
    let mut dir = logs_root.join(&base);
    let mut n = 1;
    while tokio::fs::try_exists(&dir).await? {
        dir = logs_root.join(format!("{base}-{n}"));
        n += 1;
    }
    tokio::fs::create_dir_all(&dir).await?;
    Ok(dir)
}

/// Newest run directory under `logs_root` that holds a loadable checkpoint.
async fn find_resumable_run(logs_root: &Path) -> Option<(PathBuf, Checkpoint)> {
    let entries = std::fs::read_dir(logs_root).ok()?;
    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("run_") && e.path().is_dir())
        .map(|e| e.path())
        .collect();
    candidates.sort();
    for dir in candidates.into_iter().rev() {
        if let Ok(Some(cp)) = Checkpoint::load_if_exists(&dir.join("checkpoint.json")).await {
            return Some((dir, cp));
        }
    }
    None
}

async fn write_manifest(graph: &Graph, run_dir: &Path) -> Result<()> {
    let run_id = run_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let manifest = serde_json::json!({
        "graph_name": graph.name,
        "goal": graph.goal,
        "run_id": run_id,
        "start_time": Utc::now().to_rfc3339(),
    });
    tokio::fs::write(
        run_dir.join("manifest.json"),
        serde_json::to_string_pretty(&manifest)?,
    )
    .await?;
    Ok(())
}
