//! Specialist roster and bounded tool loop
//!
//! Five fixed specialists cover complementary angles of one instrument.
//! A runner drives each delegated task through alternating reasoning and
//! tool rounds; the round counter is capped and exhaustion degrades to a
//! partial answer instead of an error.

use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::EventEmitter;
use crate::llm::{ChatMessage, LanguageModel, ToolCallRequest};
use crate::models::{
    AgentResult, AgentStatus, AgentTask, InstrumentContext, ToolInput, ToolInvocation,
};
use crate::tools::ToolRegistry;

//
// ================= Roster =================
//

#[derive(Debug, Clone, Copy)]
pub struct SpecialistSpec {
    pub id: &'static str,
    pub focus: &'static str,
    pub toolset: &'static [&'static str],
}

/// The fixed roster. Only `strategy` output can seed a trading proposal;
/// that authorization lives in the planner, not here.
pub const SPECIALISTS: &[SpecialistSpec] = &[
    SpecialistSpec {
        id: "market",
        focus: "news flow and market sentiment",
        toolset: &["search_news"],
    },
    SpecialistSpec {
        id: "fundamental",
        focus: "financial statements and valuation",
        toolset: &["financial_statements"],
    },
    SpecialistSpec {
        id: "technical",
        focus: "price action and technical indicators",
        toolset: &["market_price"],
    },
    SpecialistSpec {
        id: "strategy",
        focus: "a concrete, actionable trading recommendation",
        toolset: &["account_balance", "market_price", "search_news", "graph_query"],
    },
    SpecialistSpec {
        id: "graph",
        focus: "relationships in the company knowledge graph",
        toolset: &["graph_query"],
    },
];

pub fn find_specialist(id: &str) -> Option<&'static SpecialistSpec> {
    SPECIALISTS.iter().find(|spec| spec.id == id)
}

impl SpecialistSpec {
    pub fn system_prompt(&self) -> String {
        format!(
            "You are the '{}' specialist of a stock analysis team. \
             Your focus: {}. Available tools: {}. \
             Use tools to ground every claim, then answer the sub-question \
             concisely in the user's language. When tool results are missing \
             or partial, say so and answer with what you have.",
            self.id,
            self.focus,
            self.toolset.join(", ")
        )
    }

    fn toolset_owned(&self) -> Vec<String> {
        self.toolset.iter().map(|s| s.to_string()).collect()
    }
}

//
// ================= Runner =================
//

/// Per-request context the runner injects into every tool call so tools
/// can act for the right user without the model supplying identity.
#[derive(Debug, Clone)]
pub struct SpecialistContext {
    pub user_id: i64,
    pub instrument: Option<InstrumentContext>,
}

pub struct SpecialistRunner {
    model: Arc<dyn LanguageModel>,
    registry: Arc<ToolRegistry>,
    tool_timeout: Duration,
}

impl SpecialistRunner {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        registry: Arc<ToolRegistry>,
        tool_timeout: Duration,
    ) -> Self {
        Self {
            model,
            registry,
            tool_timeout,
        }
    }

    /// Runs one delegated task to an `AgentResult`. Every failure mode is
    /// folded into the result status so sibling tasks never observe it.
    pub async fn run(
        &self,
        spec: &SpecialistSpec,
        task: &AgentTask,
        ctx: &SpecialistContext,
        emitter: &EventEmitter,
    ) -> AgentResult {
        let step = format!("specialist:{}", spec.id);
        emitter.progress_start(&step).await;
        let result = self.run_inner(spec, task, ctx).await;
        emitter.progress_end(&step).await;

        info!(
            agent_id = %result.agent_id,
            status = %result.status,
            "specialist finished"
        );
        result
    }

    async fn run_inner(
        &self,
        spec: &SpecialistSpec,
        task: &AgentTask,
        ctx: &SpecialistContext,
    ) -> AgentResult {
        let system = spec.system_prompt();
        let decls = self.registry.decls(&spec.toolset_owned());
        let mut messages = vec![ChatMessage::user(task_prompt(task, ctx))];
        let mut gathered: Vec<ToolInvocation> = Vec::new();

        for round in 0..task.tool_budget {
            let turn = match self.model.complete(&system, &messages, &decls).await {
                Ok(turn) => turn,
                Err(e) => return failed(spec.id, e.to_string()),
            };

            if !turn.has_tool_calls() {
                let payload = turn
                    .text
                    .unwrap_or_else(|| "no answer produced".to_string());
                return completed(spec.id, payload);
            }

            let requested: Vec<String> =
                turn.tool_calls.iter().map(|c| c.name.clone()).collect();
            debug!(
                agent_id = spec.id,
                round,
                tools = ?requested,
                "tool round"
            );
            messages.push(ChatMessage::assistant(format!(
                "Calling tools: {}",
                requested.join(", ")
            )));

            // One round's calls run concurrently and are barriered here
            // before the next reasoning turn.
            let invocations = join_all(
                turn.tool_calls
                    .iter()
                    .map(|call| self.invoke(call, ctx)),
            )
            .await;

            if let Some(bad) = invocations
                .iter()
                .find(|inv| !inv.recoverable && inv.error().is_some())
            {
                let cause = bad.record.error.clone().unwrap_or_default();
                return failed(
                    spec.id,
                    format!("tool '{}' rejected input: {}", bad.record.tool_name, cause),
                );
            }

            let feedback = render_feedback(&invocations);
            messages.push(ChatMessage::user(feedback));
            gathered.extend(invocations.into_iter().map(|i| i.record));
        }

        // Budget exhausted: one synthesis turn with tools withheld, then a
        // mechanical digest if even that fails.
        warn!(
            agent_id = spec.id,
            budget = task.tool_budget,
            "tool round budget exhausted, synthesizing partial answer"
        );
        messages.push(ChatMessage::user(
            "Tool budget is exhausted. Answer now using only the results above."
                .to_string(),
        ));
        let payload = match self.model.complete(&system, &messages, &[]).await {
            Ok(turn) => turn.text.unwrap_or_else(|| digest_of(&gathered)),
            Err(_) => digest_of(&gathered),
        };

        AgentResult {
            agent_id: spec.id.to_string(),
            payload,
            status: AgentStatus::BudgetExceeded,
            completed_at: Utc::now(),
        }
    }

    async fn invoke(&self, call: &ToolCallRequest, ctx: &SpecialistContext) -> Invocation {
        let parameters = inject_context(&call.arguments, ctx);
        let input = ToolInput {
            tool_name: call.name.clone(),
            parameters: parameters.clone(),
        };

        let started = Instant::now();
        let outcome = self.registry.execute(&input, self.tool_timeout).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => Invocation {
                record: ToolInvocation {
                    tool_name: call.name.clone(),
                    input: parameters,
                    result: Some(output.data),
                    error: output.error,
                    latency_ms,
                },
                recoverable: true,
            },
            Err(e) => {
                let recoverable = e.is_recoverable_for_specialist();
                if recoverable {
                    warn!(tool = %call.name, error = %e, "tool failed, feeding back");
                }
                Invocation {
                    record: ToolInvocation {
                        tool_name: call.name.clone(),
                        input: parameters,
                        result: None,
                        error: Some(e.to_string()),
                        latency_ms,
                    },
                    recoverable,
                }
            }
        }
    }
}

struct Invocation {
    record: ToolInvocation,
    recoverable: bool,
}

impl Invocation {
    fn error(&self) -> Option<&String> {
        self.record.error.as_ref()
    }

    fn result(&self) -> Option<&Value> {
        self.record.result.as_ref()
    }
}

/// The sub-question plus whatever instrument and subgraph context the
/// router resolved for this request.
fn task_prompt(task: &AgentTask, ctx: &SpecialistContext) -> String {
    let mut sections = vec![task.sub_query.clone()];
    if let Some(instrument) = &ctx.instrument {
        sections.push(format!(
            "Instrument: {} ({})",
            instrument.name, instrument.code
        ));
        if let Some(graph) = &instrument.graph_context {
            sections.push(format!("Knowledge graph context:\n{}", graph));
        }
    }
    sections.join("\n")
}

/// Merges the request context into the model-supplied arguments without
/// overriding anything the model set explicitly.
fn inject_context(arguments: &Value, ctx: &SpecialistContext) -> Value {
    let mut map = match arguments {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    map.entry("user_id".to_string())
        .or_insert_with(|| json!(ctx.user_id));
    if let Some(instrument) = &ctx.instrument {
        map.entry("code".to_string())
            .or_insert_with(|| json!(instrument.code));
    }
    Value::Object(map)
}

fn render_feedback(invocations: &[Invocation]) -> String {
    let mut lines = vec!["Tool results:".to_string()];
    for invocation in invocations {
        match (invocation.result(), invocation.error()) {
            (Some(data), _) => lines.push(format!(
                "[{}] {}",
                invocation.record.tool_name, data
            )),
            (None, Some(error)) => lines.push(format!(
                "[{}] failed: {}",
                invocation.record.tool_name, error
            )),
            (None, None) => lines.push(format!(
                "[{}] returned nothing",
                invocation.record.tool_name
            )),
        }
    }
    lines.join("\n")
}

fn digest_of(gathered: &[ToolInvocation]) -> String {
    if gathered.is_empty() {
        return "Tool budget exhausted before any usable result was gathered.".to_string();
    }
    let mut lines = vec!["Partial findings (tool budget exhausted):".to_string()];
    for record in gathered {
        match (&record.result, &record.error) {
            (Some(data), _) => lines.push(format!("- {}: {}", record.tool_name, data)),
            (None, Some(error)) => {
                lines.push(format!("- {}: unavailable ({})", record.tool_name, error))
            }
            (None, None) => lines.push(format!("- {}: no data", record.tool_name)),
        }
    }
    lines.join("\n")
}

fn completed(agent_id: &str, payload: String) -> AgentResult {
    AgentResult {
        agent_id: agent_id.to_string(),
        payload,
        status: AgentStatus::Completed,
        completed_at: Utc::now(),
    }
}

fn failed(agent_id: &str, payload: String) -> AgentResult {
    AgentResult {
        agent_id: agent_id.to_string(),
        payload,
        status: AgentStatus::Failed,
        completed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ScriptedModel, ScriptedTurn};
    use crate::tools::{StaticTool, ToolRegistry};

    fn context() -> SpecialistContext {
        SpecialistContext {
            user_id: 7,
            instrument: Some(InstrumentContext {
                name: "삼성전자".to_string(),
                code: "005930".to_string(),
                graph_context: None,
            }),
        }
    }

    fn registry_with(tool: Arc<StaticTool>) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(tool);
        Arc::new(registry)
    }

    #[test]
    fn roster_has_expected_shape() {
        assert_eq!(SPECIALISTS.len(), 5);
        assert!(find_specialist("strategy").is_some());
        assert!(find_specialist("astrology").is_none());
        for spec in SPECIALISTS {
            assert!(spec.system_prompt().contains(spec.id));
            assert!(!spec.toolset.is_empty());
        }
    }

    #[tokio::test]
    async fn answers_directly_without_tools() {
        let model = Arc::new(ScriptedModel::sequential(vec![ScriptedTurn::text(
            "거래량이 평균을 상회합니다",
        )]));
        let runner = SpecialistRunner::new(
            model,
            Arc::new(ToolRegistry::new()),
            Duration::from_secs(1),
        );
        let (emitter, mut rx) = EventEmitter::channel(16);
        let task = AgentTask::new("technical", "분석해줘", 5);
        let spec = find_specialist("technical").unwrap();

        let result = runner.run(spec, &task, &context(), &emitter).await;
        assert_eq!(result.status, AgentStatus::Completed);
        assert!(result.payload.contains("거래량"));

        // progress start and end frame the run
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let json = serde_json::to_string(&first).unwrap();
        assert!(json.contains("specialist:technical"));
        assert!(serde_json::to_string(&second).unwrap().contains("\"end\""));
    }

    #[tokio::test]
    async fn tool_round_then_answer_with_injected_context() {
        let tool = Arc::new(StaticTool::new("market_price", json!({"stck_prpr": "71000"})));
        let model = Arc::new(ScriptedModel::sequential(vec![
            ScriptedTurn::calls(vec![ToolCallRequest {
                name: "market_price".to_string(),
                arguments: json!({}),
            }]),
            ScriptedTurn::text("현재가는 71,000원입니다"),
        ]));
        let runner = SpecialistRunner::new(
            model,
            registry_with(tool.clone()),
            Duration::from_secs(1),
        );
        let (emitter, _rx) = EventEmitter::channel(16);
        let task = AgentTask::new("technical", "현재가 알려줘", 5);
        let spec = find_specialist("technical").unwrap();

        let result = runner.run(spec, &task, &context(), &emitter).await;
        assert_eq!(result.status, AgentStatus::Completed);

        let seen = tool.seen_parameters().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["user_id"], 7);
        assert_eq!(seen[0]["code"], "005930");
    }

    #[tokio::test]
    async fn recoverable_tool_failure_feeds_back_and_run_completes() {
        let tool = Arc::new(
            StaticTool::new("search_news", json!([{"title": "실적 호조"}])).failing_first(1),
        );
        let model = Arc::new(ScriptedModel::sequential(vec![
            ScriptedTurn::calls(vec![ToolCallRequest {
                name: "search_news".to_string(),
                arguments: json!({"query": "삼성전자"}),
            }]),
            ScriptedTurn::calls(vec![ToolCallRequest {
                name: "search_news".to_string(),
                arguments: json!({"query": "삼성전자 실적"}),
            }]),
            ScriptedTurn::text("뉴스 흐름은 긍정적입니다"),
        ]));
        let runner = SpecialistRunner::new(
            model,
            registry_with(tool.clone()),
            Duration::from_secs(1),
        );
        let (emitter, _rx) = EventEmitter::channel(16);
        let task = AgentTask::new("market", "뉴스 분석", 5);
        let spec = find_specialist("market").unwrap();

        let result = runner.run(spec, &task, &context(), &emitter).await;
        assert_eq!(result.status, AgentStatus::Completed);
        assert_eq!(tool.calls(), 2);
    }

    #[tokio::test]
    async fn budget_exhaustion_synthesizes_partial_answer() {
        let tool = Arc::new(StaticTool::new("market_price", json!({"stck_prpr": "71000"})));
        let looping_call = || {
            ScriptedTurn::calls(vec![ToolCallRequest {
                name: "market_price".to_string(),
                arguments: json!({}),
            }])
        };
        let model = Arc::new(ScriptedModel::sequential(vec![
            looping_call(),
            looping_call(),
            ScriptedTurn::text("수집된 시세 기준 부분 분석입니다"),
        ]));
        let runner = SpecialistRunner::new(
            model.clone(),
            registry_with(tool),
            Duration::from_secs(1),
        );
        let (emitter, _rx) = EventEmitter::channel(16);
        let task = AgentTask::new("technical", "시세 분석", 2);
        let spec = find_specialist("technical").unwrap();

        let result = runner.run(spec, &task, &context(), &emitter).await;
        assert_eq!(result.status, AgentStatus::BudgetExceeded);
        assert!(result.payload.contains("부분 분석"));
        // two tool rounds plus one synthesis turn
        assert_eq!(model.completions(), 3);
    }

    #[tokio::test]
    async fn model_failure_marks_task_failed() {
        let model = Arc::new(ScriptedModel::sequential(vec![ScriptedTurn::fail(
            "upstream 500",
        )]));
        let runner = SpecialistRunner::new(
            model,
            Arc::new(ToolRegistry::new()),
            Duration::from_secs(1),
        );
        let (emitter, _rx) = EventEmitter::channel(16);
        let task = AgentTask::new("market", "뉴스 분석", 5);
        let spec = find_specialist("market").unwrap();

        let result = runner.run(spec, &task, &context(), &emitter).await;
        assert_eq!(result.status, AgentStatus::Failed);
        assert!(result.payload.contains("upstream 500"));
    }

    #[tokio::test]
    async fn malformed_input_rejection_fails_the_task() {
        // 6-digit validation happens inside the real tools; a scripted
        // stand-in cannot produce InvalidToolInput.
        use crate::broker::{InMemoryCredentialStore, MockBrokerage};
        use crate::tools::MarketPriceTool;

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(MarketPriceTool::new(
            Arc::new(MockBrokerage::new()),
            Arc::new(InMemoryCredentialStore::new()),
        )));
        let model = Arc::new(ScriptedModel::sequential(vec![ScriptedTurn::calls(vec![
            ToolCallRequest {
                name: "market_price".to_string(),
                arguments: json!({"code": "not-a-code"}),
            },
        ])]));
        let runner = SpecialistRunner::new(model, Arc::new(registry), Duration::from_secs(1));
        let (emitter, _rx) = EventEmitter::channel(16);
        let task = AgentTask::new("technical", "시세", 5);
        let spec = find_specialist("technical").unwrap();

        let result = runner.run(spec, &task, &context(), &emitter).await;
        assert_eq!(result.status, AgentStatus::Failed);
        assert!(result.payload.contains("rejected input"));
    }

    #[test]
    fn task_prompt_carries_instrument_and_graph_context() {
        let mut ctx = context();
        ctx.instrument.as_mut().unwrap().graph_context =
            Some(json!([{"row": ["삼성전자", "SUPPLIES", "Apple"]}]));
        let task = AgentTask::new("graph", "협력사 관계 분석", 3);

        let prompt = task_prompt(&task, &ctx);
        assert!(prompt.starts_with("협력사 관계 분석"));
        assert!(prompt.contains("005930"));
        assert!(prompt.contains("SUPPLIES"));

        // no instrument: the prompt is just the sub-question
        let bare = SpecialistContext {
            user_id: 7,
            instrument: None,
        };
        assert_eq!(task_prompt(&task, &bare), "협력사 관계 분석");
    }

    #[test]
    fn context_injection_preserves_explicit_arguments() {
        let ctx = context();
        let injected = inject_context(&json!({"code": "035420"}), &ctx);
        assert_eq!(injected["code"], "035420");
        assert_eq!(injected["user_id"], 7);

        let defaulted = inject_context(&Value::Null, &ctx);
        assert_eq!(defaulted["code"], "005930");
    }
}
