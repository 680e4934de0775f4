//! Human gate handler (`hexagon` shape).
//!
//! Builds a question whose choices come from the node's outgoing edge
//! labels, hands it to the injected [`Interviewer`], and routes by setting
//! `preferred_label` to the chosen edge label. A `&` prefix in a label marks
//! the accelerator key (`"&Yes"` → key `Y`, shown as `Yes`).

use std::sync::Arc;

use async_trait::async_trait;
use trellis_core::{Context, Outcome, Result, Value};

use crate::events::EventKind;
use crate::graph::{Graph, Node};
use crate::handler::{NodeHandler, RunHooks};
use crate::handlers::write_status;
use crate::interviewer::{Answer, Choice, Interviewer, Question};

pub struct WaitHumanHandler {
    interviewer: Arc<dyn Interviewer>,
}

impl WaitHumanHandler {
    pub fn new(interviewer: Arc<dyn Interviewer>) -> Self {
        Self { interviewer }
    }
}

/// Split an accelerator marker off a label: `"&Yes"` → (`Y`, `"Yes"`).
fn parse_accelerator(label: &str) -> (Option<char>, String) {
    match label.strip_prefix('&') {
        Some(rest) => {
            let key = rest.chars().next().map(|c| c.to_ascii_uppercase());
            (key, rest.to_string())
        }
        None => (None, label.to_string()),
    }
}

fn find_choice<'a>(answer: &Answer, choices: &'a [Choice]) -> Option<&'a Choice> {
    let wanted = answer.choice.trim();
    choices
        .iter()
        .find(|c| c.label.eq_ignore_ascii_case(wanted) || c.display.eq_ignore_ascii_case(wanted))
        .or_else(|| {
            let key = wanted.chars().next().map(|c| c.to_ascii_uppercase())?;
            if wanted.chars().count() == 1 {
                choices.iter().find(|c| c.key == Some(key))
            } else {
                None
            }
        })
}

#[async_trait]
impl NodeHandler for WaitHumanHandler {
    fn handler_type(&self) -> &str {
        "wait.human"
    }

    async fn execute(
        &self,
        node: &Node,
        _context: &Context,
        graph: &Graph,
        hooks: &RunHooks,
    ) -> Result<Outcome> {
        let stage_dir = hooks.stage_dir(&node.id).await?;

        let edges = graph.outgoing_edges(&node.id);
        if edges.is_empty() {
            let outcome = Outcome::fail("no outgoing edges for human gate");
            write_status(&stage_dir, &outcome).await?;
            return Ok(outcome);
        }

        let choices: Vec<Choice> = edges
            .iter()
            .map(|e| {
                let label = e.label.clone().unwrap_or_else(|| e.to.clone());
                let (key, display) = parse_accelerator(&label);
                Choice {
                    key,
                    display,
                    label,
                    target: e.to.clone(),
                }
            })
            .collect();

        let question = Question {
            heading: node.label.clone(),
            prompt: node.prompt.clone().unwrap_or_else(|| node.label.clone()),
            choices,
            timeout: node.timeout,
        };

        let question_doc = serde_json::json!({
            "heading": question.heading,
            "prompt": question.prompt,
            "choices": question.choices.iter().map(|c| serde_json::json!({
                "key": c.key.map(String::from),
                "label": c.display,
                "to": c.target,
            })).collect::<Vec<_>>(),
        });
        tokio::fs::write(
            stage_dir.join("question.json"),
            serde_json::to_string_pretty(&question_doc)?,
        )
        .await?;

        hooks.emit(EventKind::InterviewStarted {
            node_id: node.id.clone(),
        });

        let asked = self.interviewer.ask(&question);
        let answer = match question.timeout {
            Some(limit) => match tokio::time::timeout(limit, asked).await {
                Ok(result) => result?,
                Err(_) => {
                    hooks.emit(EventKind::InterviewTimeout {
                        node_id: node.id.clone(),
                    });
                    let outcome = Outcome::skipped("timeout");
                    write_status(&stage_dir, &outcome).await?;
                    return Ok(outcome);
                }
            },
            None => asked.await?,
        };

        let chosen = find_choice(&answer, &question.choices)
            .unwrap_or(&question.choices[0])
            .clone();

        tokio::fs::write(
            stage_dir.join("answer.json"),
            serde_json::to_string_pretty(&serde_json::json!({
                "label": chosen.display,
                "to": chosen.target,
            }))?,
        )
        .await?;

        hooks.emit(EventKind::InterviewCompleted {
            node_id: node.id.clone(),
            choice: chosen.display.clone(),
        });

        let mut outcome = Outcome::success("human responded");
        outcome.preferred_label = Some(chosen.label.clone());
        outcome
            .context_updates
            .insert("human.selected".into(), Value::String(chosen.display.clone()));
        write_status(&stage_dir, &outcome).await?;
        Ok(outcome)
    }
}
