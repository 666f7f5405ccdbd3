//! Answering run questions from the terminal

use std::io::Write;

use anyhow::bail;
use qaflow_common::{AnswerOutcome, AnswerRequest, InputType, Question, RunState};
use qaflow_engine::{Orchestrator, RunSnapshot};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::watch;
use tracing::{info, warn};

/// Line-oriented operator console
pub struct Console<R, W> {
    input: R,
    output: W,
}

impl<R, W> Console<R, W>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    /// `None` at end of input
    async fn read_line(&mut self, prompt: &str) -> anyhow::Result<Option<String>> {
        write!(self.output, "{}: ", prompt)?;
        self.output.flush()?;
        let mut line = String::new();
        if self.input.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    fn show(&mut self, question: &Question) -> anyhow::Result<()> {
        writeln!(self.output)?;
        writeln!(self.output, "{}", question.prompt)?;
        if let Some(context) = &question.context {
            self.show_context(context)?;
        }
        if !question.options.is_empty() {
            writeln!(self.output, "Options: {}", question.options.join(", "))?;
        }
        Ok(())
    }

    fn show_context(&mut self, context: &Value) -> anyhow::Result<()> {
        if let Some(reason) = context.get("reason").and_then(Value::as_str) {
            writeln!(self.output, "Previous attempt failed: {}", reason)?;
        }
        if let Some(total) = context.get("total_pages").and_then(Value::as_u64) {
            writeln!(self.output, "Discovered {} page(s)", total)?;
        }
        if let Some(features) = context.get("by_feature").and_then(Value::as_object) {
            for (feature, count) in features {
                writeln!(self.output, "  {:<16} {}", feature, count)?;
            }
        }
        Ok(())
    }

    /// Collect an answer payload; `None` when input ends
    async fn ask(&mut self, question: &Question) -> anyhow::Result<Option<String>> {
        self.show(question)?;
        match question.input_type {
            InputType::Credentials => {
                let Some(username) = self.read_line("Username").await? else {
                    return Ok(None);
                };
                let Some(password) = self.read_line("Password").await? else {
                    return Ok(None);
                };
                Ok(Some(
                    json!({ "username": username, "password": password }).to_string(),
                ))
            }
            _ => self.read_line("Answer").await,
        }
    }

    fn note(&mut self, text: &str) -> anyhow::Result<()> {
        writeln!(self.output, "{}", text)?;
        Ok(())
    }
}

/// Drive a run to a terminal state, answering questions from the console
///
/// A `true` on `interrupt` (or end of input) cancels the run.
pub async fn drive<R, W>(
    orchestrator: &Orchestrator,
    run_id: &str,
    console: &mut Console<R, W>,
    interrupt: &mut watch::Receiver<bool>,
) -> anyhow::Result<RunSnapshot>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    loop {
        let snapshot = tokio::select! {
            snapshot = orchestrator.wait_settled(run_id) => snapshot?,
            _ = interrupt.wait_for(|stop| *stop) => return cancel(orchestrator, run_id).await,
        };
        if snapshot.state.is_terminal() {
            return Ok(snapshot);
        }
        let Some(question) = snapshot.question else {
            bail!("run {} is suspended in {} without a question", run_id, snapshot.state);
        };

        let payload = tokio::select! {
            payload = console.ask(&question) => payload?,
            _ = interrupt.wait_for(|stop| *stop) => None,
        };
        let Some(payload) = payload else {
            return cancel(orchestrator, run_id).await;
        };

        let outcome = orchestrator.submit_answer(AnswerRequest {
            run_id: run_id.to_string(),
            question_id: question.id.clone(),
            payload,
        })?;
        match outcome {
            AnswerOutcome::Accepted { next_state } => {
                info!(question = %question.id, next = %next_state, "Answer accepted");
            }
            AnswerOutcome::Rejected { reason } => {
                console.note(&format!("Answer rejected: {}", reason))?;
            }
        }
    }
}

async fn cancel(orchestrator: &Orchestrator, run_id: &str) -> anyhow::Result<RunSnapshot> {
    warn!("Cancelling run {}", run_id);
    let snapshot = orchestrator.cancel(run_id)?;
    if snapshot.state == RunState::Failed {
        return Ok(snapshot);
    }
    Ok(orchestrator.wait_settled(run_id).await?)
}
