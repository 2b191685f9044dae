//! Approval channels.
//!
//! A channel delivers a [`DecisionRequest`] to whoever decides and answers
//! through the accompanying [`DecisionHandle`]. The facilitator owns the
//! deadline, so `submit` only has to hand the request over; it must not wait
//! for the answer.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{DecisionHandle, DecisionRequest};
use crate::core::{EngineError, Result};

/// Delivers decision requests to an approver.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    /// Channel name, used in logs.
    fn name(&self) -> &str;

    /// Hand `request` to the approver. Answers go through `responder`.
    async fn submit(&self, request: DecisionRequest, responder: DecisionHandle) -> Result<()>;
}

/// A canned answer for [`ScriptedApproval`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedAnswer {
    /// Approve the recommended approach
    Recommended,
    /// Approve the approach at this rank
    SelectIndex(usize),
    /// Approve the approach with this id
    Select(String),
    /// Reject with a reason
    Reject(String),
    /// Never answer
    Silent,
}

/// Answers every request immediately from a script.
///
/// Used for unattended runs (`--auto-approve`, `--select`) and tests. A
/// scripted selection outside the offered set fails the submission, since
/// nobody is around to pick again.
#[derive(Debug)]
pub struct ScriptedApproval {
    default: ScriptedAnswer,
    per_gap: HashMap<String, ScriptedAnswer>,
    approver: String,
    seen: Mutex<Vec<DecisionRequest>>,
}

impl ScriptedApproval {
    /// Answer every gap the same way.
    pub fn new(default: ScriptedAnswer) -> Self {
        Self {
            default,
            per_gap: HashMap::new(),
            approver: "scripted".to_string(),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Override the answer for one gap.
    pub fn answer(mut self, gap_id: impl Into<String>, answer: ScriptedAnswer) -> Self {
        self.per_gap.insert(gap_id.into(), answer);
        self
    }

    /// Name recorded as the approver.
    pub fn with_approver(mut self, approver: impl Into<String>) -> Self {
        self.approver = approver.into();
        self
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<DecisionRequest> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl ApprovalChannel for ScriptedApproval {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit(&self, request: DecisionRequest, responder: DecisionHandle) -> Result<()> {
        let answer = self.per_gap.get(&request.gap_id).unwrap_or(&self.default).clone();
        self.seen.lock().push(request.clone());

        match answer {
            ScriptedAnswer::Recommended => responder.select(&request.recommendation, &self.approver),
            ScriptedAnswer::SelectIndex(index) => {
                let id = request.approaches.get(index).map_or_else(
                    || format!("#{index}"),
                    |approach| approach.id.clone(),
                );
                responder.select(&id, &self.approver)
            }
            ScriptedAnswer::Select(id) => responder.select(&id, &self.approver),
            ScriptedAnswer::Reject(reason) => responder.reject(&self.approver, reason),
            ScriptedAnswer::Silent => Ok(()),
        }
    }
}

/// A request together with the handle that answers it.
#[derive(Debug, Clone)]
pub struct ApprovalTicket {
    pub request: DecisionRequest,
    pub handle: DecisionHandle,
}

/// Forwards requests to an in-process consumer over an unbounded queue.
#[derive(Debug, Clone)]
pub struct QueueApproval {
    sender: mpsc::UnboundedSender<ApprovalTicket>,
}

impl QueueApproval {
    /// Create the channel and the receiving end for the approver.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ApprovalTicket>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl ApprovalChannel for QueueApproval {
    fn name(&self) -> &str {
        "queue"
    }

    async fn submit(&self, request: DecisionRequest, responder: DecisionHandle) -> Result<()> {
        self.sender.send(ApprovalTicket { request, handle: responder }).map_err(|_| {
            EngineError::ApprovalChannel {
                channel: "queue".to_string(),
                reason: "approver queue closed".to_string(),
            }
        })
    }
}

/// Asks on the terminal.
///
/// Prompts are serialised so concurrent pipelines do not interleave.
#[derive(Debug, Default)]
pub struct ConsoleApproval {
    prompt_lock: std::sync::Arc<tokio::sync::Mutex<()>>,
}

impl ConsoleApproval {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalChannel for ConsoleApproval {
    fn name(&self) -> &str {
        "console"
    }

    async fn submit(&self, request: DecisionRequest, responder: DecisionHandle) -> Result<()> {
        let lock = std::sync::Arc::clone(&self.prompt_lock);
        let approver = std::env::var("USER").unwrap_or_else(|_| "console".to_string());

        tokio::spawn(async move {
            let _guard = lock.lock().await;
            let prompted = tokio::task::spawn_blocking(move || {
                converse(&request, &responder, &approver, prompt_stdin);
            })
            .await;
            if let Err(e) = prompted {
                tracing::warn!(error = %e, "Approval prompt task failed");
            }
        });

        Ok(())
    }
}

/// Prompt until the decision is answered, skipped, or closed elsewhere.
///
/// An unknown id or rank asks again; the deadline still applies.
fn converse<F>(request: &DecisionRequest, responder: &DecisionHandle, approver: &str, mut ask: F)
where
    F: FnMut(&str) -> io::Result<String>,
{
    let mut prompt = render_request(request);
    loop {
        if responder.state().is_terminal() {
            return;
        }

        let line = match ask(&prompt) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read approval from stdin");
                return;
            }
        };

        let result = match parse_answer(&line, request) {
            ConsoleAnswer::Select(id) => responder.select(&id, approver),
            ConsoleAnswer::Reject(reason) => responder.reject(approver, reason),
            ConsoleAnswer::Skip => return,
        };
        match result {
            Ok(()) => return,
            Err(e) if e.is_recoverable() => {
                eprintln!("{e}");
                prompt = format!("Choose 1-{}, an approach id, or 'r <reason>': ", request.approaches.len());
            }
            Err(e) => {
                eprintln!("{e}");
                return;
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ConsoleAnswer {
    Select(String),
    Reject(String),
    Skip,
}

fn prompt_stdin(prompt: &str) -> io::Result<String> {
    let mut stdout = io::stdout();
    write!(stdout, "{prompt}")?;
    stdout.flush()?;

    let mut input = String::new();
    io::stdin().lock().read_line(&mut input)?;
    Ok(input)
}

/// Parse `N` (rank, 1-based), an approach id, `r [reason]`, or empty.
fn parse_answer(line: &str, request: &DecisionRequest) -> ConsoleAnswer {
    let line = line.trim();
    if line.is_empty() {
        return ConsoleAnswer::Skip;
    }
    if line == "r" || line.starts_with("r ") {
        let reason = line[1..].trim();
        let reason = if reason.is_empty() { "rejected at console" } else { reason };
        return ConsoleAnswer::Reject(reason.to_string());
    }
    if let Ok(rank) = line.parse::<usize>() {
        if let Some(approach) = rank.checked_sub(1).and_then(|i| request.approaches.get(i)) {
            return ConsoleAnswer::Select(approach.id.clone());
        }
    }
    ConsoleAnswer::Select(line.to_string())
}

/// Human-readable rendering of a decision request.
pub fn render_request(request: &DecisionRequest) -> String {
    let mut out = format!("\nDecision needed for gap '{}'\n", request.gap_id);
    if !request.gap_description.is_empty() {
        out.push_str(&format!("  {}\n", request.gap_description));
    }
    out.push('\n');

    for (i, approach) in request.approaches.iter().enumerate() {
        let marker = if approach.id == request.recommendation { "*" } else { " " };
        out.push_str(&format!(
            "{marker} {}. {:<28} benefit {:.2}  risk {:.2}  ratio {:.2}\n",
            i + 1,
            approach.id,
            approach.benefit,
            approach.risk,
            approach.ratio()
        ));
        out.push_str(&format!("     {}\n", approach.summary));
    }

    out.push_str(&format!("\nRecommended: {}\n", request.rationale));
    out.push_str(&format!("Deadline: {}\n", request.deadline.to_rfc3339()));
    out.push_str("Choose [number or id], 'r <reason>' to reject, Enter to skip: ");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{GapAnalyzer, Objective};
    use crate::approach::ApproachGenerator;
    use crate::decision::{DecisionFacilitator, DecisionState};

    fn request() -> DecisionRequest {
        let gap = GapAnalyzer::new().analyze(&[], &[Objective::new("auth", 0.8)]).unwrap().remove(0);
        let set = ApproachGenerator::default().generate(&gap).unwrap();
        DecisionFacilitator::default().propose(&gap, &set).unwrap().request().clone()
    }

    #[test]
    fn test_parse_answer() {
        let request = request();
        assert_eq!(parse_answer("\n", &request), ConsoleAnswer::Skip);
        assert_eq!(
            parse_answer("2", &request),
            ConsoleAnswer::Select(request.approaches[1].id.clone())
        );
        assert_eq!(parse_answer("auth-hybrid\n", &request), ConsoleAnswer::Select("auth-hybrid".into()));
        assert_eq!(parse_answer("r too costly", &request), ConsoleAnswer::Reject("too costly".into()));
        assert_eq!(parse_answer("r", &request), ConsoleAnswer::Reject("rejected at console".into()));
        assert_eq!(parse_answer("99", &request), ConsoleAnswer::Select("99".into()));
    }

    #[test]
    fn test_render_marks_recommendation() {
        let request = request();
        let text = render_request(&request);
        assert!(text.contains("Decision needed for gap 'auth'"));
        assert!(text.contains(&format!("* 1. {}", request.recommendation)));
    }

    #[tokio::test]
    async fn test_scripted_per_gap_answers() {
        let gap = GapAnalyzer::new().analyze(&[], &[Objective::new("auth", 0.8)]).unwrap().remove(0);
        let set = ApproachGenerator::default().generate(&gap).unwrap();
        let facilitator = DecisionFacilitator::default();
        let pending = facilitator.propose(&gap, &set).unwrap();
        let handle = pending.handle();
        handle.open();

        let channel = ScriptedApproval::new(ScriptedAnswer::Silent)
            .answer("auth", ScriptedAnswer::Reject("no budget".into()))
            .with_approver("carol");
        channel.submit(pending.request().clone(), handle.clone()).await.unwrap();

        assert_eq!(handle.state(), DecisionState::Rejected);
        assert_eq!(channel.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_invalid_selection_leaves_decision_open() {
        let gap = GapAnalyzer::new().analyze(&[], &[Objective::new("auth", 0.8)]).unwrap().remove(0);
        let set = ApproachGenerator::default().generate(&gap).unwrap();
        let facilitator = DecisionFacilitator::default();
        let pending = facilitator.propose(&gap, &set).unwrap();
        let handle = pending.handle();
        handle.open();

        let channel = ScriptedApproval::new(ScriptedAnswer::Select("ghost".into()));
        let err = channel.submit(pending.request().clone(), handle.clone()).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidSelection { .. }));
        assert_eq!(handle.state(), DecisionState::AwaitingApproval);
    }

    #[tokio::test]
    async fn test_scripted_invalid_selection_fails_without_waiting() {
        let gap = GapAnalyzer::new().analyze(&[], &[Objective::new("auth", 0.8)]).unwrap().remove(0);
        let set = ApproachGenerator::default().generate(&gap).unwrap();
        let facilitator = DecisionFacilitator::default();
        let pending = facilitator.propose(&gap, &set).unwrap();
        let handle = pending.handle();

        let channel = ScriptedApproval::new(ScriptedAnswer::Select("ghost".into()));
        let err = facilitator.resolve(pending, &channel).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidSelection { .. }));
        assert_eq!(handle.state(), DecisionState::Rejected);
        assert!(facilitator.pending_gaps().is_empty());
    }

    #[test]
    fn test_console_asks_again_after_invalid_entry() {
        let gap = GapAnalyzer::new().analyze(&[], &[Objective::new("auth", 0.8)]).unwrap().remove(0);
        let set = ApproachGenerator::default().generate(&gap).unwrap();
        let facilitator = DecisionFacilitator::default();
        let pending = facilitator.propose(&gap, &set).unwrap();
        let handle = pending.handle();
        handle.open();

        let mut lines = vec!["ghost\n", "9\n", "2\n"].into_iter();
        let mut prompts = Vec::new();
        converse(pending.request(), &handle, "dana", |prompt| {
            prompts.push(prompt.to_string());
            Ok(lines.next().unwrap_or_default().to_string())
        });

        assert_eq!(prompts.len(), 3);
        assert!(prompts[0].contains("Decision needed for gap 'auth'"));
        assert!(prompts[1].starts_with("Choose 1-"));
        assert_eq!(handle.state(), DecisionState::Approved);
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn test_console_skip_leaves_decision_open() {
        let gap = GapAnalyzer::new().analyze(&[], &[Objective::new("auth", 0.8)]).unwrap().remove(0);
        let set = ApproachGenerator::default().generate(&gap).unwrap();
        let facilitator = DecisionFacilitator::default();
        let pending = facilitator.propose(&gap, &set).unwrap();
        let handle = pending.handle();
        handle.open();

        let mut asked = 0;
        converse(pending.request(), &handle, "dana", |_| {
            asked += 1;
            Ok(String::new())
        });
        assert_eq!(asked, 1);
        assert_eq!(handle.state(), DecisionState::AwaitingApproval);
    }

    #[tokio::test]
    async fn test_queue_closed_is_an_error() {
        let gap = GapAnalyzer::new().analyze(&[], &[Objective::new("auth", 0.8)]).unwrap().remove(0);
        let set = ApproachGenerator::default().generate(&gap).unwrap();
        let facilitator = DecisionFacilitator::default();
        let pending = facilitator.propose(&gap, &set).unwrap();

        let (channel, receiver) = QueueApproval::new();
        drop(receiver);

        let err = facilitator.resolve(pending, &channel).await.unwrap_err();
        assert!(matches!(err, EngineError::ApprovalChannel { .. }));
        assert!(facilitator.pending_gaps().is_empty());
    }
}
