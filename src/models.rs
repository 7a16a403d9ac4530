//! Core data models for the trading agent orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::OrchestrationError;
use crate::Result;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Completed,
    Failed,
    BudgetExceeded,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AgentStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Proposed,
    Approved,
    Rejected,
    Executing,
    Succeeded,
    Failed,
}

impl ProposalStatus {
    /// One-directional transition table; no status may regress.
    pub fn can_transition(&self, to: ProposalStatus) -> bool {
        use ProposalStatus::*;
        matches!(
            (self, to),
            (Proposed, Approved)
                | (Proposed, Rejected)
                | (Approved, Executing)
                | (Executing, Succeeded)
                | (Executing, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProposalStatus::Rejected | ProposalStatus::Succeeded | ProposalStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

//
// ================= Chat Request =================
//

/// One inbound message on a conversation thread. `decision` is present
/// only when the user is answering an outstanding trade proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub user_id: i64,
    pub thread_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
}

//
// ================= Conversation State =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            at: Utc::now(),
        }
    }
}

/// Instrument reference resolved by the router; cleared when a new query
/// targets something else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstrumentContext {
    pub name: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_context: Option<serde_json::Value>,
}

/// Summarized outcome of one specialist run, kept in completion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_id: String,
    pub payload: String,
    pub status: AgentStatus,
    pub completed_at: DateTime<Utc>,
}

/// Durable per-thread state. The coordinator is the only writer; it
/// persists a snapshot after every stage transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub thread_id: String,
    pub user_id: i64,
    pub history: Vec<Turn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument_context: Option<InstrumentContext>,
    #[serde(default)]
    pub agent_results: Vec<AgentResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_proposal: Option<TradingProposal>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(thread_id: impl Into<String>, user_id: i64) -> Self {
        let now = Utc::now();
        Self {
            thread_id: thread_id.into(),
            user_id,
            history: Vec::new(),
            instrument_context: None,
            agent_results: Vec::new(),
            active_proposal: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// History is append-only; there is intentionally no removal API.
    pub fn append_turn(&mut self, role: TurnRole, content: impl Into<String>) {
        self.history.push(Turn::new(role, content));
    }

    /// Record one terminal specialist result, evicting the oldest entries
    /// beyond `limit`. Order is completion order, not launch order.
    pub fn push_agent_result(&mut self, result: AgentResult, limit: usize) {
        self.agent_results.push(result);
        if self.agent_results.len() > limit {
            let excess = self.agent_results.len() - limit;
            self.agent_results.drain(..excess);
        }
    }

    pub fn latest_agent_result(&self) -> Option<&AgentResult> {
        self.agent_results.last()
    }

    /// Install a new proposal. At most one non-terminal proposal may exist
    /// per thread.
    pub fn set_active_proposal(&mut self, proposal: TradingProposal) -> Result<()> {
        if let Some(existing) = &self.active_proposal {
            if !existing.status.is_terminal() {
                return Err(OrchestrationError::Validation(format!(
                    "thread {} already has an outstanding proposal ({})",
                    self.thread_id, existing.status
                )));
            }
        }
        self.active_proposal = Some(proposal);
        Ok(())
    }

    /// Advance the active proposal through its one-directional lifecycle.
    pub fn transition_proposal(&mut self, to: ProposalStatus) -> Result<()> {
        let proposal = self.active_proposal.as_mut().ok_or_else(|| {
            OrchestrationError::Validation(format!(
                "thread {} has no active proposal",
                self.thread_id
            ))
        })?;
        if !proposal.status.can_transition(to) {
            return Err(OrchestrationError::InvalidTransition {
                from: proposal.status.to_string(),
                to: to.to_string(),
            });
        }
        // decided_at records the human decision, not later execution moves.
        if proposal.status == ProposalStatus::Proposed {
            proposal.decided_at = Some(Utc::now());
        }
        proposal.status = to;
        Ok(())
    }

    /// Bump the version ahead of a checkpoint write. Stale resumes are
    /// detected against this counter.
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

//
// ================= Dispatch =================
//

/// Transient description of one delegated specialist run; lives only for
/// the duration of a dispatch wave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub agent_id: String,
    pub sub_query: String,
    pub tool_budget: u32,
    pub status: AgentStatus,
}

impl AgentTask {
    pub fn new(agent_id: impl Into<String>, sub_query: impl Into<String>, tool_budget: u32) -> Self {
        Self {
            agent_id: agent_id.into(),
            sub_query: sub_query.into(),
            tool_budget,
            status: AgentStatus::Running,
        }
    }
}

/// One tool call made by a specialist; transient, summarized into the
/// reasoning context afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
}

//
// ================= Trading Proposal =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingProposal {
    pub proposal_id: Uuid,
    pub instrument_code: String,
    pub side: OrderSide,
    pub order_kind: OrderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
}

impl TradingProposal {
    pub fn new(
        instrument_code: impl Into<String>,
        side: OrderSide,
        order_kind: OrderKind,
        price: Option<f64>,
        quantity: u32,
    ) -> Self {
        Self {
            proposal_id: Uuid::new_v4(),
            instrument_code: instrument_code.into(),
            side,
            order_kind,
            price,
            quantity,
            rationale: None,
            status: ProposalStatus::Proposed,
            created_at: Utc::now(),
            decided_at: None,
        }
    }

    /// Structural checks applied before a proposal is surfaced for
    /// approval.
    pub fn validate(&self) -> Result<()> {
        if self.quantity == 0 {
            return Err(OrchestrationError::Validation(
                "order quantity must be positive".to_string(),
            ));
        }
        if self.instrument_code.len() != 6
            || !self.instrument_code.chars().all(|c| c.is_ascii_digit())
        {
            return Err(OrchestrationError::Validation(format!(
                "instrument code must be 6 digits, got '{}'",
                self.instrument_code
            )));
        }
        match (self.order_kind, self.price) {
            (OrderKind::Limit, None) => Err(OrchestrationError::Validation(
                "limit order requires a price".to_string(),
            )),
            (OrderKind::Market, Some(_)) => Err(OrchestrationError::Validation(
                "market order must not carry a price".to_string(),
            )),
            (OrderKind::Limit, Some(p)) if p <= 0.0 => Err(OrchestrationError::Validation(
                "limit price must be positive".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

//
// ================= Tool I/O =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInput {
    pub tool_name: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub data: serde_json::Value,
    pub error: Option<String>,
}

//
// ================= Display =================
//

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Running => "running",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::BudgetExceeded => "budget_exceeded",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProposalStatus::Proposed => "proposed",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Executing => "executing",
            ProposalStatus::Succeeded => "succeeded",
            ProposalStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderKind::Market => "market",
            OrderKind::Limit => "limit",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal() -> TradingProposal {
        TradingProposal::new("005930", OrderSide::Buy, OrderKind::Market, None, 10)
    }

    #[test]
    fn proposal_transitions_are_one_directional() {
        use ProposalStatus::*;
        assert!(Proposed.can_transition(Approved));
        assert!(Proposed.can_transition(Rejected));
        assert!(Approved.can_transition(Executing));
        assert!(Executing.can_transition(Succeeded));
        assert!(Executing.can_transition(Failed));

        // No regressions or skips.
        assert!(!Approved.can_transition(Proposed));
        assert!(!Rejected.can_transition(Approved));
        assert!(!Proposed.can_transition(Executing));
        assert!(!Succeeded.can_transition(Failed));
        assert!(!Failed.can_transition(Proposed));
    }

    #[test]
    fn at_most_one_outstanding_proposal() {
        let mut state = ConversationState::new("t-1", 7);
        state.set_active_proposal(proposal()).unwrap();

        let err = state.set_active_proposal(proposal()).unwrap_err();
        assert!(err.to_string().contains("outstanding proposal"));

        // Terminal proposals free the slot.
        state.transition_proposal(ProposalStatus::Rejected).unwrap();
        assert!(state.set_active_proposal(proposal()).is_ok());
    }

    #[test]
    fn transition_on_missing_proposal_is_rejected() {
        let mut state = ConversationState::new("t-2", 7);
        let err = state
            .transition_proposal(ProposalStatus::Approved)
            .unwrap_err();
        assert!(err.to_string().contains("no active proposal"));
    }

    #[test]
    fn agent_results_trim_keeps_most_recent_in_completion_order() {
        let mut state = ConversationState::new("t-3", 7);
        for i in 0..12 {
            state.push_agent_result(
                AgentResult {
                    agent_id: format!("agent-{}", i),
                    payload: format!("payload {}", i),
                    status: AgentStatus::Completed,
                    completed_at: Utc::now(),
                },
                10,
            );
        }
        assert_eq!(state.agent_results.len(), 10);
        assert_eq!(state.agent_results[0].agent_id, "agent-2");
        assert_eq!(state.latest_agent_result().unwrap().agent_id, "agent-11");
    }

    #[test]
    fn version_increments_on_touch() {
        let mut state = ConversationState::new("t-4", 7);
        assert_eq!(state.version, 0);
        state.touch();
        state.touch();
        assert_eq!(state.version, 2);
    }

    #[test]
    fn proposal_validation() {
        assert!(proposal().validate().is_ok());

        let zero_qty = TradingProposal::new("005930", OrderSide::Buy, OrderKind::Market, None, 0);
        assert!(zero_qty.validate().is_err());

        let bad_code = TradingProposal::new("SMSNG", OrderSide::Buy, OrderKind::Market, None, 1);
        assert!(bad_code.validate().is_err());

        let limit_without_price =
            TradingProposal::new("005930", OrderSide::Sell, OrderKind::Limit, None, 1);
        assert!(limit_without_price.validate().is_err());

        let market_with_price =
            TradingProposal::new("005930", OrderSide::Sell, OrderKind::Market, Some(70000.0), 1);
        assert!(market_with_price.validate().is_err());

        let limit_ok =
            TradingProposal::new("005930", OrderSide::Sell, OrderKind::Limit, Some(70000.0), 1);
        assert!(limit_ok.validate().is_ok());
    }
}
