//! Decision facilitation.
//!
//! Packages a gap's approaches and the recommendation into a
//! [`DecisionRequest`], hands it to an [`ApprovalChannel`] and waits for an
//! external actor to answer. This is the only point in the pipeline that
//! waits on a human.
//!
//! ```text
//! Proposed -> AwaitingApproval -> Approved | Rejected | TimedOut
//! ```
//!
//! Waiting parks the task on a oneshot receiver raced against the deadline;
//! it never polls. Answers arrive through a cloneable [`DecisionHandle`].
//! The handle and the deadline race for the same resolution slot, so exactly
//! one of them settles a decision.

mod channel;

pub use channel::{
    render_request, ApprovalChannel, ApprovalTicket, ConsoleApproval, QueueApproval,
    ScriptedAnswer, ScriptedApproval,
};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::analysis::Gap;
use crate::approach::{Approach, ApproachSet};
use crate::core::{DecisionConfig, EngineError, Result};

/// Where a decision is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionState {
    Proposed,
    AwaitingApproval,
    Approved,
    Rejected,
    TimedOut,
}

impl DecisionState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::TimedOut)
    }
}

impl fmt::Display for DecisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Proposed => "proposed",
            Self::AwaitingApproval => "awaiting-approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::TimedOut => "timed-out",
        };
        f.write_str(s)
    }
}

/// Payload sent to the approval channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    /// Decision identifier
    pub decision_id: String,

    /// Gap under decision
    pub gap_id: String,

    /// Gap description, for the approver's benefit
    pub gap_description: String,

    /// Considered approaches, best first
    pub approaches: Vec<Approach>,

    /// Recommended approach id
    pub recommendation: String,

    /// Why the recommendation was made
    pub rationale: String,

    /// When the request times out
    pub deadline: DateTime<Utc>,

    /// Earlier decision this one replaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
}

impl DecisionRequest {
    /// Find a considered approach by id.
    pub fn approach(&self, id: &str) -> Option<&Approach> {
        self.approaches.iter().find(|a| a.id == id)
    }
}

/// How a decision was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DecisionOutcome {
    Approved { approach_id: String },
    Rejected { reason: String },
    TimedOut,
}

/// Immutable record of a resolved decision.
///
/// Built only by the facilitator, which guarantees an approved decision
/// names an approach from its own considered set. A changed mind produces a
/// new record that `supersedes` this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    id: String,
    gap_id: String,
    considered: Vec<Approach>,
    recommendation: String,
    outcome: DecisionOutcome,
    rationale: String,
    approver: Option<String>,
    decided_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    supersedes: Option<String>,
}

impl Decision {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn gap_id(&self) -> &str {
        &self.gap_id
    }

    /// Every approach that was on the table.
    pub fn considered(&self) -> &[Approach] {
        &self.considered
    }

    /// The approach recommended to the approver.
    pub fn recommendation(&self) -> &str {
        &self.recommendation
    }

    pub fn outcome(&self) -> &DecisionOutcome {
        &self.outcome
    }

    /// Terminal state this decision ended in.
    pub fn state(&self) -> DecisionState {
        match self.outcome {
            DecisionOutcome::Approved { .. } => DecisionState::Approved,
            DecisionOutcome::Rejected { .. } => DecisionState::Rejected,
            DecisionOutcome::TimedOut => DecisionState::TimedOut,
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self.outcome, DecisionOutcome::Approved { .. })
    }

    /// The chosen approach, when approved.
    pub fn chosen(&self) -> Option<&Approach> {
        match &self.outcome {
            DecisionOutcome::Approved { approach_id } => {
                self.considered.iter().find(|a| &a.id == approach_id)
            }
            _ => None,
        }
    }

    pub fn rationale(&self) -> &str {
        &self.rationale
    }

    pub fn approver(&self) -> Option<&str> {
        self.approver.as_deref()
    }

    pub fn decided_at(&self) -> DateTime<Utc> {
        self.decided_at
    }

    pub fn supersedes(&self) -> Option<&str> {
        self.supersedes.as_deref()
    }
}

/// Answer delivered through a handle.
#[derive(Debug)]
enum Verdict {
    Select { approach_id: String, approver: String, rationale: Option<String> },
    Reject { approver: Option<String>, reason: String },
}

#[derive(Debug)]
struct Slot {
    state: DecisionState,
    sender: Option<oneshot::Sender<Verdict>>,
}

#[derive(Debug)]
struct DecisionCell {
    request: DecisionRequest,
    slot: Mutex<Slot>,
}

/// Cloneable handle through which an external actor answers a decision.
#[derive(Debug, Clone)]
pub struct DecisionHandle {
    cell: Arc<DecisionCell>,
}

impl DecisionHandle {
    /// The request being decided.
    pub fn request(&self) -> &DecisionRequest {
        &self.cell.request
    }

    /// Current state.
    pub fn state(&self) -> DecisionState {
        self.cell.slot.lock().state
    }

    /// Approve one of the considered approaches.
    ///
    /// Selecting an approach outside the considered set fails with
    /// [`EngineError::InvalidSelection`] and leaves the decision waiting.
    pub fn select(&self, approach_id: &str, approver: impl Into<String>) -> Result<()> {
        self.select_with_rationale(approach_id, approver, None)
    }

    /// Approve an approach and record why.
    pub fn select_with_rationale(
        &self,
        approach_id: &str,
        approver: impl Into<String>,
        rationale: Option<String>,
    ) -> Result<()> {
        if self.cell.request.approach(approach_id).is_none() {
            return Err(EngineError::InvalidSelection {
                decision: self.cell.request.decision_id.clone(),
                approach: approach_id.to_string(),
            });
        }

        let verdict =
            Verdict::Select { approach_id: approach_id.to_string(), approver: approver.into(), rationale };
        self.settle(verdict, DecisionState::Approved)
    }

    /// Decline every approach.
    pub fn reject(&self, approver: impl Into<String>, reason: impl Into<String>) -> Result<()> {
        let verdict = Verdict::Reject { approver: Some(approver.into()), reason: reason.into() };
        self.settle(verdict, DecisionState::Rejected)
    }

    /// Cancel the decision, forcing `Rejected`.
    ///
    /// A no-op once resolved; returns whether this call settled it.
    pub fn cancel(&self) -> bool {
        let verdict = Verdict::Reject { approver: None, reason: "cancelled".to_string() };
        let settled = self.settle(verdict, DecisionState::Rejected).is_ok();
        if settled {
            tracing::info!(decision = %self.cell.request.decision_id, "Decision cancelled");
        }
        settled
    }

    fn settle(&self, verdict: Verdict, next: DecisionState) -> Result<()> {
        let mut slot = self.cell.slot.lock();
        let sender = match slot.state {
            DecisionState::Proposed | DecisionState::AwaitingApproval => slot.sender.take(),
            _ => None,
        };
        let Some(sender) = sender else {
            return Err(EngineError::DecisionClosed(self.cell.request.decision_id.clone()));
        };

        slot.state = next;
        // The waiting side may have been dropped; the state change still stands.
        let _ = sender.send(verdict);
        Ok(())
    }

    fn open(&self) {
        let mut slot = self.cell.slot.lock();
        if slot.state == DecisionState::Proposed {
            slot.state = DecisionState::AwaitingApproval;
        }
    }

    /// Claim the slot for the deadline. False when an answer got there first.
    fn expire(&self) -> bool {
        let mut slot = self.cell.slot.lock();
        if slot.sender.take().is_some() {
            slot.state = DecisionState::TimedOut;
            true
        } else {
            false
        }
    }
}

type Registry = Arc<Mutex<HashMap<String, DecisionHandle>>>;

/// Keeps a gap registered as pending until dropped.
#[derive(Debug)]
struct GapClaim {
    registry: Registry,
    gap_id: String,
}

impl Drop for GapClaim {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.gap_id);
    }
}

/// A proposed decision that has not been resolved yet.
#[derive(Debug)]
pub struct PendingDecision {
    handle: DecisionHandle,
    receiver: oneshot::Receiver<Verdict>,
    timeout: Duration,
    _claim: GapClaim,
}

impl PendingDecision {
    /// Handle for answering this decision.
    pub fn handle(&self) -> DecisionHandle {
        self.handle.clone()
    }

    /// The request payload.
    pub fn request(&self) -> &DecisionRequest {
        self.handle.request()
    }

    pub fn state(&self) -> DecisionState {
        self.handle.state()
    }
}

/// Drives decisions from proposal to a terminal state.
#[derive(Debug, Default)]
pub struct DecisionFacilitator {
    config: DecisionConfig,
    pending: Registry,
}

impl DecisionFacilitator {
    /// Create a facilitator.
    pub fn new(config: DecisionConfig) -> Self {
        Self { config, pending: Registry::default() }
    }

    /// Build a decision request for `gap` from its ranked approaches.
    ///
    /// Fails with [`EngineError::GapBusy`] while another decision for the
    /// same gap is pending.
    pub fn propose(&self, gap: &Gap, approaches: &ApproachSet) -> Result<PendingDecision> {
        self.propose_with(gap, approaches, self.config.approval_timeout(), None)
    }

    /// Propose a decision that replaces an earlier one.
    pub fn propose_revision(
        &self,
        gap: &Gap,
        approaches: &ApproachSet,
        previous: &Decision,
    ) -> Result<PendingDecision> {
        self.propose_with(gap, approaches, self.config.approval_timeout(), Some(previous.id.clone()))
    }

    /// Propose with an explicit approval deadline.
    pub fn propose_with(
        &self,
        gap: &Gap,
        approaches: &ApproachSet,
        timeout: Duration,
        supersedes: Option<String>,
    ) -> Result<PendingDecision> {
        let recommended = approaches.recommended().ok_or_else(|| EngineError::ApproachGeneration {
            gap: gap.objective_id.clone(),
            reason: "no approaches to decide between".to_string(),
        })?;

        let rationale = format!(
            "{} has the best benefit-to-risk ratio ({:.2}): benefit {:.2}, risk {:.2}, covers {}",
            recommended.id,
            recommended.ratio(),
            recommended.benefit,
            recommended.risk,
            recommended.covers.join(", ")
        );
        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let request = DecisionRequest {
            decision_id: uuid::Uuid::new_v4().to_string(),
            gap_id: gap.objective_id.clone(),
            gap_description: gap.description.clone(),
            recommendation: recommended.id.clone(),
            approaches: approaches.approaches.clone(),
            rationale,
            deadline,
            supersedes,
        };

        let (sender, receiver) = oneshot::channel();
        let handle = DecisionHandle {
            cell: Arc::new(DecisionCell {
                request,
                slot: Mutex::new(Slot { state: DecisionState::Proposed, sender: Some(sender) }),
            }),
        };

        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&gap.objective_id) {
                return Err(EngineError::GapBusy(gap.objective_id.clone()));
            }
            pending.insert(gap.objective_id.clone(), handle.clone());
        }

        tracing::info!(
            gap = %gap.objective_id,
            decision = %handle.request().decision_id,
            recommendation = %handle.request().recommendation,
            "Decision proposed"
        );

        Ok(PendingDecision {
            handle,
            receiver,
            timeout,
            _claim: GapClaim { registry: Arc::clone(&self.pending), gap_id: gap.objective_id.clone() },
        })
    }

    /// Submit the request to `channel` and wait for an answer or the deadline.
    pub async fn resolve(
        &self,
        pending: PendingDecision,
        channel: &dyn ApprovalChannel,
    ) -> Result<Decision> {
        let PendingDecision { handle, mut receiver, timeout, _claim } = pending;
        handle.open();

        let decision_id = handle.request().decision_id.clone();
        tracing::info!(decision = %decision_id, channel = channel.name(), "Awaiting approval");

        if let Err(e) = channel.submit(handle.request().clone(), handle.clone()).await {
            handle.cancel();
            return Err(e);
        }

        let verdict = tokio::select! {
            verdict = &mut receiver => verdict.ok(),
            () = tokio::time::sleep(timeout) => None,
        };

        let verdict = match verdict {
            Some(verdict) => Some(verdict),
            None if handle.expire() => None,
            // An answer won the race against the deadline.
            None => receiver.try_recv().ok(),
        };

        let decision = build_decision(handle.request(), verdict)?;
        tracing::info!(
            decision = %decision.id,
            gap = %decision.gap_id,
            state = %decision.state(),
            "Decision resolved"
        );
        Ok(decision)
    }

    /// Cancel the pending decision for `gap_id`, if any.
    ///
    /// Idempotent: returns false when nothing was pending.
    pub fn cancel(&self, gap_id: &str) -> bool {
        let handle = self.pending.lock().get(gap_id).cloned();
        handle.is_some_and(|handle| handle.cancel())
    }

    /// Handle for the pending decision on `gap_id`.
    pub fn handle(&self, gap_id: &str) -> Option<DecisionHandle> {
        self.pending.lock().get(gap_id).cloned()
    }

    /// Gaps with a decision in flight, sorted.
    pub fn pending_gaps(&self) -> Vec<String> {
        let mut gaps: Vec<String> = self.pending.lock().keys().cloned().collect();
        gaps.sort();
        gaps
    }
}

fn build_decision(request: &DecisionRequest, verdict: Option<Verdict>) -> Result<Decision> {
    let (outcome, rationale, approver) = match verdict {
        Some(Verdict::Select { approach_id, approver, rationale }) => {
            if request.approach(&approach_id).is_none() {
                return Err(EngineError::InvalidSelection {
                    decision: request.decision_id.clone(),
                    approach: approach_id,
                });
            }
            let rationale = rationale.unwrap_or_else(|| {
                if approach_id == request.recommendation {
                    request.rationale.clone()
                } else {
                    format!("Approver chose {approach_id} over recommended {}", request.recommendation)
                }
            });
            (DecisionOutcome::Approved { approach_id }, rationale, Some(approver))
        }
        Some(Verdict::Reject { approver, reason }) => {
            (DecisionOutcome::Rejected { reason: reason.clone() }, reason, approver)
        }
        None => (
            DecisionOutcome::TimedOut,
            format!("No answer before {}", request.deadline.to_rfc3339()),
            None,
        ),
    };

    Ok(Decision {
        id: request.decision_id.clone(),
        gap_id: request.gap_id.clone(),
        considered: request.approaches.clone(),
        recommendation: request.recommendation.clone(),
        outcome,
        rationale,
        approver,
        decided_at: Utc::now(),
        supersedes: request.supersedes.clone(),
    })
}
