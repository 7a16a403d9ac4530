//! Conversation coordinator
//!
//! INPUT → SCOPE → ROUTE → DISPATCH → PROPOSE → (suspend) → DECIDE → EXECUTE
//!
//! One coordinator instance is the only writer for any thread it serves; a
//! checkpoint is persisted after every stage transition so a thread can be
//! resumed by a fresh process at the exact point it was suspended. Every
//! request ends in exactly one final event on its stream, including every
//! failure path.

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::approval::ApprovalGate;
use crate::broker::{Brokerage, CredentialStore};
use crate::catalog::InstrumentCatalog;
use crate::classifier::ScopeClassifier;
use crate::config::OrchestratorConfig;
use crate::dispatch::Dispatcher;
use crate::error::OrchestrationError;
use crate::events::EventEmitter;
use crate::execution::OrderExecutor;
use crate::graph::GraphClient;
use crate::llm::{ChatMessage, LanguageModel};
use crate::memory::{agent_results_digest, transcript, ContextWindow};
use crate::models::{
    AgentStatus, ChatRequest, ConversationState, Decision, OrderKind, OrderSide, ProposalStatus,
    TradingProposal, TurnRole,
};
use crate::planner::{ProposalExtractor, RouteDecision, Router};
use crate::specialist::{SpecialistContext, SpecialistRunner};
use crate::state::CheckpointStore;
use crate::tools::ToolRegistry;
use crate::Result;

const COMPOSER_PROMPT: &str = r#"You are the answer composer of a stock analysis team.
Write the reply to the user grounded ONLY in the conversation and the
specialist findings provided. Answer in the user's language, keep reported
figures exactly as given, and say plainly when a specialist could not
deliver. This channel provides analysis, not licensed investment advice."#;

/// Drives one conversation thread through the full pipeline.
pub struct Coordinator {
    model: Arc<dyn LanguageModel>,
    router: Router,
    dispatcher: Dispatcher,
    extractor: ProposalExtractor,
    executor: OrderExecutor,
    checkpoints: Arc<dyn CheckpointStore>,
    agent_result_limit: usize,
}

impl Coordinator {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        registry: Arc<ToolRegistry>,
        catalog: Arc<InstrumentCatalog>,
        checkpoints: Arc<dyn CheckpointStore>,
        brokerage: Arc<dyn Brokerage>,
        credentials: Arc<dyn CredentialStore>,
        graph: Arc<dyn GraphClient>,
        config: &OrchestratorConfig,
    ) -> Self {
        let runner = Arc::new(SpecialistRunner::new(
            model.clone(),
            registry,
            config.tool_timeout,
        ));
        Self {
            router: Router::new(model.clone(), catalog, graph, config),
            dispatcher: Dispatcher::new(runner, config.wave_deadline),
            extractor: ProposalExtractor::new(model.clone()),
            executor: OrderExecutor::new(brokerage, credentials),
            model,
            checkpoints,
            agent_result_limit: config.agent_result_limit,
        }
    }

    /// Handle one request end to end. Infallible from the caller's view:
    /// every outcome, including infrastructure failure, is reported through
    /// the emitter as the single final event.
    pub async fn handle(&self, request: ChatRequest, emitter: EventEmitter) {
        let thread_id = request.thread_id.clone();
        info!(
            thread_id = %thread_id,
            user_id = request.user_id,
            decision = ?request.decision,
            "request received"
        );

        if let Err(e) = self.process(request, &emitter).await {
            error!(thread_id = %thread_id, error = %e, "request processing failed");
            emitter
                .finalize_error("요청 처리 중 오류가 발생했습니다.", e.to_string())
                .await;
        }
    }

    async fn process(&self, request: ChatRequest, emitter: &EventEmitter) -> Result<()> {
        let mut state = self.load_or_create(&request).await?;
        state.append_turn(TurnRole::User, &request.message);

        // === DECIDE ===
        if let Some(decision) = request.decision {
            return self.handle_decision(&mut state, decision, emitter).await;
        }

        // === SCOPE ===
        if let Some(guide) = ScopeClassifier::classify(&request.message).guide_message() {
            debug!(thread_id = %state.thread_id, "out-of-scope request, replying with guide");
            state.append_turn(TurnRole::Assistant, guide);
            self.persist(&mut state).await?;
            emitter.delta(guide).await;
            emitter
                .finalize(guide, self.final_context(&state), None, None)
                .await;
            return Ok(());
        }

        // === ROUTE ===
        emitter.progress_start("router").await;
        let plan = self.router.route(&state, &request.message).await?;
        emitter.progress_end("router").await;
        state.instrument_context = plan.instrument;
        self.persist(&mut state).await?;

        let tasks = match plan.decision {
            RouteDecision::Direct => {
                let message = self.stream_answer(&state, &request.message, emitter).await?;
                state.append_turn(TurnRole::Assistant, &message);
                self.persist(&mut state).await?;
                emitter
                    .finalize(message, self.final_context(&state), None, None)
                    .await;
                return Ok(());
            }
            RouteDecision::Delegate(tasks) => tasks,
        };

        // === DISPATCH ===
        let ctx = SpecialistContext {
            user_id: state.user_id,
            instrument: state.instrument_context.clone(),
        };
        let results = self.dispatcher.run_wave(tasks, &ctx, emitter).await;
        for result in results {
            state.push_agent_result(result, self.agent_result_limit);
        }
        self.persist(&mut state).await?;

        // === PROPOSE ===
        if let Some(proposal) = self.try_extract_proposal(&state, &request.message).await? {
            let message = proposal_message(&proposal);
            state.set_active_proposal(proposal.clone())?;
            state.append_turn(TurnRole::Assistant, &message);
            self.persist(&mut state).await?;
            info!(
                thread_id = %state.thread_id,
                proposal_id = %proposal.proposal_id,
                "trade proposal issued, awaiting decision"
            );
            emitter
                .finalize(message, self.final_context(&state), Some(proposal), None)
                .await;
            return Ok(());
        }

        // === COMPOSE ===
        let message = self.stream_answer(&state, &request.message, emitter).await?;
        state.append_turn(TurnRole::Assistant, &message);
        self.persist(&mut state).await?;
        emitter
            .finalize(message, self.final_context(&state), None, None)
            .await;
        Ok(())
    }

    async fn load_or_create(&self, request: &ChatRequest) -> Result<ConversationState> {
        match self.checkpoints.load(&request.thread_id).await? {
            Some(state) => {
                if state.user_id != request.user_id {
                    return Err(OrchestrationError::Validation(format!(
                        "thread {} belongs to another user",
                        request.thread_id
                    )));
                }
                debug!(
                    thread_id = %state.thread_id,
                    version = state.version,
                    "checkpoint resumed"
                );
                Ok(state)
            }
            None => {
                debug!(thread_id = %request.thread_id, "starting new thread");
                Ok(ConversationState::new(
                    request.thread_id.clone(),
                    request.user_id,
                ))
            }
        }
    }

    async fn persist(&self, state: &mut ConversationState) -> Result<()> {
        state.touch();
        self.checkpoints.save(state).await
    }

    /// Resolve a human decision on the outstanding proposal; an approval
    /// continues straight into order execution.
    async fn handle_decision(
        &self,
        state: &mut ConversationState,
        decision: Decision,
        emitter: &EventEmitter,
    ) -> Result<()> {
        let status = match ApprovalGate::apply(state, decision) {
            Ok(status) => status,
            Err(e) => {
                warn!(thread_id = %state.thread_id, error = %e, "decision rejected");
                let message = "지금 결정 대기 중인 주문 제안이 없습니다.";
                state.append_turn(TurnRole::Assistant, message);
                self.persist(state).await?;
                emitter
                    .finalize(message, Value::Null, None, Some(e.to_string()))
                    .await;
                return Ok(());
            }
        };

        if status == ProposalStatus::Rejected {
            let message = "주문 제안을 거절로 처리했습니다. 다른 종목이 궁금하시면 말씀해 주세요.";
            state.append_turn(TurnRole::Assistant, message);
            self.persist(state).await?;
            emitter
                .finalize(
                    message,
                    self.final_context(state),
                    state.active_proposal.clone(),
                    None,
                )
                .await;
            return Ok(());
        }

        // === EXECUTE ===
        self.persist(state).await?;
        emitter.progress_start("execution").await;
        state.transition_proposal(ProposalStatus::Executing)?;
        self.persist(state).await?;

        // Snapshot decouples the order call from the state borrow.
        let proposal = state.active_proposal.clone().ok_or_else(|| {
            OrchestrationError::Validation(format!(
                "thread {} lost its proposal mid-execution",
                state.thread_id
            ))
        })?;

        match self.executor.execute(state.user_id, &proposal).await {
            Ok(outcome) => {
                state.transition_proposal(ProposalStatus::Succeeded)?;
                let message = match &outcome.receipt.order_no {
                    Some(order_no) => format!("주문이 접수되었습니다 (주문번호 {}).", order_no),
                    None => "주문이 접수되었습니다.".to_string(),
                };
                state.append_turn(TurnRole::Assistant, &message);
                self.persist(state).await?;

                let context = json!({
                    "thread_id": state.thread_id,
                    "order": {
                        "order_no": outcome.receipt.order_no,
                        "broker_message": outcome.receipt.message,
                        "refreshed_credentials": outcome.refreshed_credentials,
                    },
                });
                emitter.progress_end("execution").await;
                emitter
                    .finalize(message, context, state.active_proposal.clone(), None)
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!(
                    thread_id = %state.thread_id,
                    proposal_id = %proposal.proposal_id,
                    error = %e,
                    "order execution failed"
                );
                state.transition_proposal(ProposalStatus::Failed)?;
                let message = "주문 접수에 실패했습니다. 제안은 종료 처리되었습니다.";
                state.append_turn(TurnRole::Assistant, message);
                self.persist(state).await?;
                emitter.progress_end("execution").await;
                emitter
                    .finalize(
                        message,
                        self.final_context(state),
                        state.active_proposal.clone(),
                        Some(e.to_string()),
                    )
                    .await;
                Ok(())
            }
        }
    }

    /// Proposal extraction runs only when the freshest specialist result is
    /// a usable strategy verdict and no proposal is already outstanding.
    async fn try_extract_proposal(
        &self,
        state: &ConversationState,
        message: &str,
    ) -> Result<Option<TradingProposal>> {
        let Some(latest) = state.latest_agent_result() else {
            return Ok(None);
        };
        if latest.agent_id != "strategy" || latest.status == AgentStatus::Failed {
            return Ok(None);
        }
        if let Some(existing) = &state.active_proposal {
            if !existing.status.is_terminal() {
                debug!(
                    thread_id = %state.thread_id,
                    proposal_id = %existing.proposal_id,
                    "proposal already outstanding, skipping extraction"
                );
                return Ok(None);
            }
        }

        self.extractor
            .extract(message, &latest.payload, state.instrument_context.as_ref())
            .await
    }

    /// Compose the final answer, forwarding fragments as delta events while
    /// the model streams.
    async fn stream_answer(
        &self,
        state: &ConversationState,
        message: &str,
        emitter: &EventEmitter,
    ) -> Result<String> {
        emitter.progress_start("composer").await;
        let context = composer_context(state, message);

        let (tx, mut rx) = mpsc::channel::<String>(32);
        let forwarder = {
            let emitter = emitter.clone();
            tokio::spawn(async move {
                while let Some(fragment) = rx.recv().await {
                    emitter.delta(fragment).await;
                }
            })
        };

        let outcome = self
            .model
            .stream_text(COMPOSER_PROMPT, &[ChatMessage::user(context)], tx)
            .await;
        let _ = forwarder.await;
        emitter.progress_end("composer").await;
        outcome
    }

    fn final_context(&self, state: &ConversationState) -> Value {
        json!({
            "thread_id": state.thread_id,
            "instrument": state.instrument_context,
            "agent_results": state.agent_results,
        })
    }
}

fn composer_context(state: &ConversationState, message: &str) -> String {
    let mut sections = vec![transcript(state, ContextWindow::default())];
    if let Some(instrument) = &state.instrument_context {
        sections.push(format!(
            "Instrument: {} ({})",
            instrument.name, instrument.code
        ));
        if let Some(graph) = &instrument.graph_context {
            sections.push(format!("Knowledge graph context:\n{}", graph));
        }
    }
    let digest = agent_results_digest(state, 5);
    if !digest.is_empty() {
        sections.push(format!("Specialist findings:\n{}", digest));
    }
    sections.push(format!("New request: {}", message));
    sections.join("\n\n")
}

/// Deterministic suspension message; no model call sits between a finished
/// wave and the proposal going out.
fn proposal_message(proposal: &TradingProposal) -> String {
    let side = match proposal.side {
        OrderSide::Buy => "매수",
        OrderSide::Sell => "매도",
    };
    let pricing = match (proposal.order_kind, proposal.price) {
        (OrderKind::Limit, Some(price)) => format!("{:.0}원 지정가", price),
        _ => "시장가".to_string(),
    };

    let mut message = format!(
        "{} {}주를 {} {}하는 주문을 제안합니다.",
        proposal.instrument_code, proposal.quantity, pricing, side
    );
    if let Some(rationale) = &proposal.rationale {
        message.push_str(&format!(" 근거: {}", rationale));
    }
    message.push_str(" 승인(approve) 또는 거절(reject)로 답해 주세요.");
    message
}
