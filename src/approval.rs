//! Human-in-the-loop approval gate
//!
//! A decision arrives as a fresh request on the suspended thread; the gate
//! validates it against the reloaded checkpoint. Decisions against an
//! absent or already-decided proposal are terminal validation errors, so
//! a replayed approval can never fire a second order.

use tracing::info;

use crate::error::OrchestrationError;
use crate::models::{ConversationState, Decision, ProposalStatus};
use crate::Result;

pub struct ApprovalGate;

impl ApprovalGate {
    /// Applies the decision to the thread's active proposal and returns
    /// the status it moved to.
    pub fn apply(state: &mut ConversationState, decision: Decision) -> Result<ProposalStatus> {
        let Some(proposal) = &state.active_proposal else {
            return Err(OrchestrationError::Validation(
                "no trade proposal is awaiting a decision on this thread".to_string(),
            ));
        };
        if proposal.status != ProposalStatus::Proposed {
            return Err(OrchestrationError::Validation(format!(
                "proposal {} was already decided ({})",
                proposal.proposal_id, proposal.status
            )));
        }

        let to = match decision {
            Decision::Approve => ProposalStatus::Approved,
            Decision::Reject => ProposalStatus::Rejected,
        };
        state.transition_proposal(to)?;
        info!(
            thread_id = %state.thread_id,
            decision = %decision,
            "approval decision applied"
        );
        Ok(to)
    }
}
