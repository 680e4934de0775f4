//! Human-in-the-loop contract and the built-in interviewers.
//!
//! Concrete front-ends (TUI, web, IDE) live outside this crate; what ships
//! here is the trait plus the console, auto-approve, and scripted
//! implementations.

use async_trait::async_trait;
use trellis_core::{Result, TrellisError};

/// One selectable answer, derived from an outgoing edge.
#[derive(Debug, Clone)]
pub struct Choice {
    /// Accelerator key parsed from a `&`-prefixed label (`"&Yes"` → `Y`).
    pub key: Option<char>,
    /// Label with the accelerator marker removed.
    pub display: String,
    /// The raw edge label, used for routing.
    pub label: String,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct Question {
    /// The node's label, shown as a heading.
    pub heading: String,
    pub prompt: String,
    pub choices: Vec<Choice>,
    pub timeout: Option<std::time::Duration>,
}

#[derive(Debug, Clone)]
pub struct Answer {
    /// The raw label of the chosen edge.
    pub choice: String,
    pub custom_text: Option<String>,
}

#[async_trait]
pub trait Interviewer: Send + Sync {
    async fn ask(&self, question: &Question) -> Result<Answer>;
}

// ---------------------------------------------------------------------------
// AutoApproveInterviewer
// ---------------------------------------------------------------------------

/// Picks the first choice without blocking. Used for unattended runs.
pub struct AutoApproveInterviewer;

#[async_trait]
impl Interviewer for AutoApproveInterviewer {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        let choice = question
            .choices
            .first()
            .map(|c| c.label.clone())
            .unwrap_or_default();
        Ok(Answer {
            choice,
            custom_text: None,
        })
    }
}

// ---------------------------------------------------------------------------
// ConsoleInterviewer
// ---------------------------------------------------------------------------

/// Reads an answer from stdin. Accepts a choice number, an accelerator key,
/// or free text.
pub struct ConsoleInterviewer;

#[async_trait]
impl Interviewer for ConsoleInterviewer {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        println!("\n{}", question.heading);
        if !question.prompt.is_empty() {
            println!("{}", question.prompt);
        }
        for (i, choice) in question.choices.iter().enumerate() {
            match choice.key {
                Some(k) => println!("  [{}] ({k}) {}", i + 1, choice.display),
                None => println!("  [{}] {}", i + 1, choice.display),
            }
        }

        let mut input = String::new();
        std::io::stdin()
            .read_line(&mut input)
            .map_err(TrellisError::Io)?;
        let trimmed = input.trim();

        if let Ok(idx) = trimmed.parse::<usize>() {
            if idx > 0 && idx <= question.choices.len() {
                return Ok(Answer {
                    choice: question.choices[idx - 1].label.clone(),
                    custom_text: None,
                });
            }
        }
        if trimmed.len() == 1 {
            let key = trimmed.chars().next().unwrap().to_ascii_uppercase();
            if let Some(choice) = question.choices.iter().find(|c| c.key == Some(key)) {
                return Ok(Answer {
                    choice: choice.label.clone(),
                    custom_text: None,
                });
            }
        }
        Ok(Answer {
            choice: trimmed.to_string(),
            custom_text: Some(trimmed.to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// ScriptedInterviewer
// ---------------------------------------------------------------------------

/// Plays back canned answers and records every question, for tests.
pub struct ScriptedInterviewer {
    answers: std::sync::Mutex<Vec<Answer>>,
    questions: std::sync::Mutex<Vec<Question>>,
}

impl ScriptedInterviewer {
    pub fn new(mut answers: Vec<Answer>) -> Self {
        answers.reverse();
        Self {
            answers: std::sync::Mutex::new(answers),
            questions: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn questions(&self) -> Vec<Question> {
        self.questions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Interviewer for ScriptedInterviewer {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        self.questions.lock().unwrap().push(question.clone());
        let answer = self.answers.lock().unwrap().pop().unwrap_or_else(|| Answer {
            choice: question
                .choices
                .first()
                .map(|c| c.label.clone())
                .unwrap_or_default(),
            custom_text: None,
        });
        Ok(answer)
    }
}
