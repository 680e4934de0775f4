//! Manager loop handler (`house` shape).
//!
//! Observe/steer/wait supervision of a child pipeline: spawns the child
//! process for the graph's `stack.child_dotfile`, polls the child's rolling
//! checkpoint every `manager.poll_interval`, ingests `stack.child.*`
//! telemetry, and stops on child exit, a satisfied `manager.stop_condition`,
//! or after `manager.max_cycles`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use trellis_core::{Checkpoint, Context, Outcome, Result, Value};

use crate::condition::{evaluate_condition, parse_condition};
use crate::graph::{Graph, Node};
use crate::handler::{NodeHandler, RunHooks};
use crate::handlers::write_status;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(45);
const DEFAULT_MAX_CYCLES: i64 = 1000;

pub struct ManagerLoopHandler;

#[async_trait]
impl NodeHandler for ManagerLoopHandler {
    fn handler_type(&self) -> &str {
        "manager_loop"
    }

    async fn execute(
        &self,
        node: &Node,
        context: &Context,
        graph: &Graph,
        hooks: &RunHooks,
    ) -> Result<Outcome> {
        let stage_dir = hooks.stage_dir(&node.id).await?;

        let Some(child_dotfile) = graph.graph_attr_str("stack.child_dotfile") else {
            let outcome = Outcome::fail("no stack.child_dotfile in graph attributes");
            write_status(&stage_dir, &outcome).await?;
            return Ok(outcome);
        };

        let poll_interval = node
            .attr_duration("manager.poll_interval")
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        let max_cycles = node
            .attr_int("manager.max_cycles")
            .unwrap_or(DEFAULT_MAX_CYCLES)
            .max(1);
        let stop_condition = node
            .attr_str("manager.stop_condition")
            .unwrap_or("")
            .to_string();

        let child_logs = stage_dir.join("child_logs");
        tokio::fs::create_dir_all(&child_logs).await?;

        // Child program defaults to this binary; tests override it with a
        // plain shell command.
        let mut argv: Vec<String> = match node.attr_str("manager.child_command") {
            Some(cmd) => cmd.split_whitespace().map(String::from).collect(),
            None => match std::env::current_exe() {
                Ok(exe) => vec![exe.to_string_lossy().into_owned()],
                Err(e) => {
                    let outcome = Outcome::fail(format!("cannot locate child binary: {e}"));
                    write_status(&stage_dir, &outcome).await?;
                    return Ok(outcome);
                }
            },
        };
        argv.push(child_dotfile.to_string());
        argv.push("--logs-root".to_string());
        argv.push(child_logs.to_string_lossy().into_owned());

        tracing::info!(node = %node.id, child = %argv.join(" "), "starting child pipeline");
        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::null());
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                let outcome = Outcome::fail(format!("failed to start child pipeline: {e}"));
                write_status(&stage_dir, &outcome).await?;
                return Ok(outcome);
            }
        };

        let mut telemetry: HashMap<String, Value> = HashMap::new();
        let snapshot = context.snapshot().await;

        for cycle in 1..=max_cycles {
            if hooks.cancel.is_cancelled() {
                kill_child(&mut child).await;
                let mut outcome = Outcome::fail("cancelled");
                outcome.context_updates = telemetry;
                write_status(&stage_dir, &outcome).await?;
                return Ok(outcome);
            }

            // Observe: child exit wins over everything else.
            if let Ok(Some(status)) = child.try_wait() {
                let mut outcome = if status.success() {
                    Outcome::success("child pipeline completed")
                } else {
                    Outcome::fail(format!("child pipeline failed: {status}"))
                };
                telemetry.insert(
                    "stack.child.outcome".into(),
                    Value::String(if status.success() { "success" } else { "failure" }.into()),
                );
                outcome.context_updates = telemetry;
                write_status(&stage_dir, &outcome).await?;
                return Ok(outcome);
            }

            ingest_child_telemetry(&child_logs, &mut telemetry).await;
            tracing::debug!(node = %node.id, cycle, "manager observed child");

            if !stop_condition.is_empty() {
                let resolve = |key: &str| -> String {
                    telemetry
                        .get(key)
                        .or_else(|| snapshot.get(key))
                        .map(|v| v.to_string())
                        .unwrap_or_default()
                };
                let satisfied = parse_condition(&stop_condition)
                    .map(|expr| evaluate_condition(&expr, &resolve))
                    .unwrap_or(false);
                if satisfied {
                    kill_child(&mut child).await;
                    let mut outcome = Outcome::success("stop condition satisfied");
                    outcome.context_updates = telemetry;
                    write_status(&stage_dir, &outcome).await?;
                    return Ok(outcome);
                }
            }

            // Wait before the next observation cycle.
            tokio::time::sleep(poll_interval).await;
        }

        kill_child(&mut child).await;
        let mut outcome = Outcome::fail(format!("max cycles ({max_cycles}) exceeded"));
        outcome.context_updates = telemetry;
        write_status(&stage_dir, &outcome).await?;
        Ok(outcome)
    }
}

async fn kill_child(child: &mut tokio::process::Child) {
    if child.start_kill().is_ok() {
        let _ = child.wait().await;
    }
}

/// Read the newest run's rolling checkpoint under the child's logs root and
/// surface its progress as `stack.child.*` keys.
async fn ingest_child_telemetry(child_logs: &Path, telemetry: &mut HashMap<String, Value>) {
    let Some(run_dir) = newest_run_dir(child_logs) else {
        return;
    };
    let checkpoint_path = run_dir.join("checkpoint.json");
    if let Ok(Some(cp)) = Checkpoint::load_if_exists(&checkpoint_path).await {
        telemetry.insert(
            "stack.child.current_node".into(),
            Value::String(cp.current_node_id),
        );
        telemetry.insert(
            "stack.child.completed".into(),
            Value::Int(cp.visited.len() as i64),
        );
    }
}

fn newest_run_dir(logs_root: &Path) -> Option<std::path::PathBuf> {
    let entries = std::fs::read_dir(logs_root).ok()?;
    entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name().to_string_lossy().starts_with("run_")
                && e.path().is_dir()
        })
        .max_by_key(|e| e.file_name())
        .map(|e| e.path())
}
