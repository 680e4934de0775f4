//! Shell tool handler (`parallelogram` shape).
//!
//! Runs `command` (plus optional `args`) through `sh -c`, captures
//! stdout/stderr into the stage directory, and maps exit code 0 to SUCCESS.
//! No sandboxing: tools run with the engine's own privileges.

use std::time::Duration;

use async_trait::async_trait;
use trellis_core::{Context, Outcome, Result, Value};

use crate::graph::{Graph, Node};
use crate::handler::{NodeHandler, RunHooks};
use crate::handlers::{truncate_chars, write_status};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_NOTES: usize = 4096;

pub struct ToolHandler;

#[async_trait]
impl NodeHandler for ToolHandler {
    fn handler_type(&self) -> &str {
        "tool"
    }

    async fn execute(
        &self,
        node: &Node,
        context: &Context,
        _graph: &Graph,
        hooks: &RunHooks,
    ) -> Result<Outcome> {
        let stage_dir = hooks.stage_dir(&node.id).await?;

        let Some(base) = node
            .attr_str("command")
            .map(str::to_string)
            .or_else(|| node.prompt.clone())
        else {
            let outcome = Outcome::fail("no command specified for tool node");
            write_status(&stage_dir, &outcome).await?;
            return Ok(outcome);
        };
        let command = match node.attr_str("args") {
            Some(args) => format!("{base} {args}"),
            None => base,
        };

        tokio::fs::write(stage_dir.join("command.txt"), &command).await?;
        tracing::info!(node = %node.id, command = %command, "running tool command");

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&command);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        // Working directory: node attr first, then the pipeline-wide key.
        if let Some(cwd) = node.attr_str("cwd") {
            cmd.current_dir(cwd);
        } else if let Some(Value::String(dir)) = context.get("workdir").await {
            cmd.current_dir(dir);
        }

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                let outcome = Outcome::fail(format!("failed to spawn command: {e}"));
                write_status(&stage_dir, &outcome).await?;
                return Ok(outcome);
            }
        };

        let limit = node.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                let outcome = Outcome::fail(format!("command execution failed: {e}"));
                write_status(&stage_dir, &outcome).await?;
                return Ok(outcome);
            }
            Err(_) => {
                let mut outcome = Outcome::fail(format!(
                    "command timed out after {}ms",
                    limit.as_millis()
                ));
                outcome.notes = "timeout".to_string();
                write_status(&stage_dir, &outcome).await?;
                return Ok(outcome);
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        tokio::fs::write(stage_dir.join("stdout.txt"), &stdout).await?;
        tokio::fs::write(stage_dir.join("stderr.txt"), &stderr).await?;

        tracing::info!(node = %node.id, exit_code, "tool command completed");

        let mut outcome = if output.status.success() {
            Outcome::success(truncate_chars(stdout.trim_end(), MAX_NOTES))
        } else {
            let mut o = Outcome::fail(format!("command exited with code {exit_code}"));
            o.notes = truncate_chars(stderr.trim_end(), MAX_NOTES);
            o
        };

        outcome
            .context_updates
            .insert("last_tool_exit_code".into(), Value::Int(exit_code as i64));
        if output.status.success() {
            if let Some(store_key) = node.attr_str("store") {
                outcome
                    .context_updates
                    .insert(store_key.to_string(), Value::String(stdout.trim_end().to_string()));
            }
        }

        write_status(&stage_dir, &outcome).await?;
        Ok(outcome)
    }
}
