//! Routing and delegation planning
//!
//! One structured model call decides whether a request gets a direct
//! answer or a wave of specialists, and which instrument the thread is
//! about. Everything the model returns is validated in code: unknown
//! specialist ids are dropped, the subset is capped, and an unparseable
//! reply degrades to a direct answer rather than failing the request.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod trade;

pub use trade::ProposalExtractor;

use crate::catalog::InstrumentCatalog;
use crate::config::OrchestratorConfig;
use crate::graph::GraphClient;
use crate::llm::{parse_structured, ChatMessage, LanguageModel};
use crate::memory::{agent_results_digest, transcript, ContextWindow};
use crate::models::{AgentTask, ConversationState, InstrumentContext};
use crate::specialist::{find_specialist, SPECIALISTS};
use crate::Result;

#[derive(Debug)]
pub enum RouteDecision {
    /// Answer from the model directly, no delegation.
    Direct,
    /// Launch one dispatch wave with these tasks.
    Delegate(Vec<AgentTask>),
}

/// Routing outcome: the decision plus the instrument the thread is about
/// after this turn (which may be carried over from earlier turns).
#[derive(Debug)]
pub struct RoutePlan {
    pub decision: RouteDecision,
    pub instrument: Option<InstrumentContext>,
}

#[derive(Debug, Deserialize)]
struct RouterReply {
    #[serde(default)]
    instrument: Option<String>,
    #[serde(default)]
    agents: Vec<AgentRequest>,
}

#[derive(Debug, Deserialize)]
struct AgentRequest {
    id: String,
    #[serde(default)]
    sub_query: Option<String>,
}

pub struct Router {
    model: Arc<dyn LanguageModel>,
    catalog: Arc<InstrumentCatalog>,
    graph: Arc<dyn GraphClient>,
    max_delegated: usize,
    tool_budget: u32,
}

impl Router {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        catalog: Arc<InstrumentCatalog>,
        graph: Arc<dyn GraphClient>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            model,
            catalog,
            graph,
            max_delegated: config.max_delegated_agents,
            tool_budget: config.tool_round_budget,
        }
    }

    pub async fn route(&self, state: &ConversationState, message: &str) -> Result<RoutePlan> {
        let system = self.system_prompt();
        let context = self.request_context(state, message);
        let turn = self
            .model
            .complete(&system, &[ChatMessage::user(context)], &[])
            .await?;

        let raw = turn.text.unwrap_or_default();
        let reply: RouterReply = match parse_structured(&raw) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "router reply unparseable, answering directly");
                return Ok(RoutePlan {
                    decision: RouteDecision::Direct,
                    instrument: state.instrument_context.clone(),
                });
            }
        };

        let mut instrument = self.resolve_instrument(state, reply.instrument.as_deref());
        if let Some(inst) = instrument.as_mut() {
            if inst.graph_context.is_none() {
                self.enrich_from_graph(inst).await;
            }
        }
        let tasks = self.validate_delegation(reply.agents, message);
        let decision = if tasks.is_empty() {
            RouteDecision::Direct
        } else {
            info!(
                agents = ?tasks.iter().map(|t| t.agent_id.as_str()).collect::<Vec<_>>(),
                "delegating"
            );
            RouteDecision::Delegate(tasks)
        };

        Ok(RoutePlan {
            decision,
            instrument,
        })
    }

    /// New resolution replaces the thread instrument; an absent mention
    /// keeps whatever the thread already had. A mention that fails to
    /// resolve clears the thread instrument: the request is about some
    /// other company and carrying the old code forward would misdirect
    /// every tool call of the wave.
    fn resolve_instrument(
        &self,
        state: &ConversationState,
        mention: Option<&str>,
    ) -> Option<InstrumentContext> {
        let Some(mention) = mention.map(str::trim).filter(|m| !m.is_empty()) else {
            return state.instrument_context.clone();
        };

        match self.catalog.resolve(mention) {
            Some(resolved) => {
                debug!(
                    mention,
                    code = %resolved.code,
                    score = resolved.score,
                    "instrument resolved"
                );
                // same company again: keep the enriched context we have
                if let Some(existing) = &state.instrument_context {
                    if existing.code == resolved.code {
                        return Some(existing.clone());
                    }
                }
                Some(InstrumentContext {
                    name: resolved.name,
                    code: resolved.code,
                    graph_context: None,
                })
            }
            None => {
                warn!(mention, "instrument mention did not resolve, clearing thread instrument");
                None
            }
        }
    }

    /// Best-effort subgraph fetch for a freshly resolved instrument. A
    /// failing or empty graph never fails the route; the context simply
    /// stays without graph data.
    async fn enrich_from_graph(&self, instrument: &mut InstrumentContext) {
        let cypher = format!(
            "MATCH (c:Company {{code: '{}'}})-[r]-(n) RETURN c.name, type(r), n.name",
            instrument.code
        );
        match self.graph.query(&cypher).await {
            Ok(rows) => {
                let empty = rows.is_null()
                    || rows.as_array().map(|a| a.is_empty()).unwrap_or(false);
                if !empty {
                    instrument.graph_context = Some(rows);
                }
            }
            Err(e) => {
                warn!(code = %instrument.code, error = %e, "graph enrichment failed, continuing without");
            }
        }
    }

    fn validate_delegation(&self, agents: Vec<AgentRequest>, message: &str) -> Vec<AgentTask> {
        let mut tasks: Vec<AgentTask> = Vec::new();
        for request in agents {
            if find_specialist(&request.id).is_none() {
                warn!(agent_id = %request.id, "dropping unknown specialist from delegation");
                continue;
            }
            if tasks.iter().any(|t| t.agent_id == request.id) {
                continue;
            }
            if tasks.len() == self.max_delegated {
                warn!(
                    limit = self.max_delegated,
                    dropped = %request.id,
                    "delegation capped"
                );
                break;
            }
            let sub_query = request
                .sub_query
                .filter(|q| !q.trim().is_empty())
                .unwrap_or_else(|| message.to_string());
            tasks.push(AgentTask::new(request.id, sub_query, self.tool_budget));
        }
        tasks
    }

    fn system_prompt(&self) -> String {
        let roster = SPECIALISTS
            .iter()
            .map(|spec| format!("- {}: {}", spec.id, spec.focus))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            r#"You route stock questions to a team of specialists.

Specialists:
{}

Decide which specialists (0 to {}) this request needs. Questions that ask
for a buy/sell recommendation should include 'strategy' alongside the
analytical specialists. Simple conversational messages need none.

Return ONLY valid JSON, no explanation:
{{
  "instrument": "<company name or 6-digit code mentioned, or null>",
  "agents": [{{"id": "<specialist id>", "sub_query": "<focused question>"}}]
}}"#,
            roster, self.max_delegated
        )
    }

    fn request_context(&self, state: &ConversationState, message: &str) -> String {
        let mut sections = Vec::new();
        let history = transcript(state, ContextWindow::default());
        if !history.is_empty() {
            sections.push(format!("Conversation so far:\n{}", history));
        }
        if let Some(instrument) = &state.instrument_context {
            sections.push(format!(
                "Thread instrument: {} ({})",
                instrument.name, instrument.code
            ));
        }
        let digest = agent_results_digest(state, 5);
        if !digest.is_empty() {
            sections.push(format!("Earlier specialist findings:\n{}", digest));
        }
        sections.push(format!("New request: {}", message));
        sections.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::StaticGraphClient;
    use crate::llm::{ScriptedModel, ScriptedTurn};
    use serde_json::json;

    fn router(model: Arc<ScriptedModel>) -> Router {
        router_with_graph(model, Arc::new(StaticGraphClient::new(json!([]))))
    }

    fn router_with_graph(model: Arc<ScriptedModel>, graph: Arc<dyn GraphClient>) -> Router {
        Router::new(
            model,
            Arc::new(InstrumentCatalog::load_or_fallback(None)),
            graph,
            &OrchestratorConfig::default(),
        )
    }

    fn state() -> ConversationState {
        ConversationState::new("thread-1", 7)
    }

    #[tokio::test]
    async fn parses_validates_and_caps_delegation() {
        let reply = r#"{
            "instrument": "삼성전자",
            "agents": [
                {"id": "market", "sub_query": "뉴스 흐름"},
                {"id": "astrology", "sub_query": "별자리"},
                {"id": "market", "sub_query": "중복"},
                {"id": "technical", "sub_query": "추세"},
                {"id": "fundamental", "sub_query": "재무"},
                {"id": "graph", "sub_query": "관계"}
            ]
        }"#;
        let model = Arc::new(ScriptedModel::sequential(vec![ScriptedTurn::text(reply)]));

        let plan = router(model).route(&state(), "삼성전자 분석해줘").await.unwrap();
        let RouteDecision::Delegate(tasks) = plan.decision else {
            panic!("expected delegation");
        };
        // unknown id dropped, duplicate collapsed, capped at 3
        assert_eq!(
            tasks.iter().map(|t| t.agent_id.as_str()).collect::<Vec<_>>(),
            vec!["market", "technical", "fundamental"]
        );
        assert_eq!(tasks[0].sub_query, "뉴스 흐름");
        assert_eq!(tasks[0].tool_budget, 5);

        let instrument = plan.instrument.unwrap();
        assert_eq!(instrument.code, "005930");
    }

    #[tokio::test]
    async fn unparseable_reply_degrades_to_direct() {
        let model = Arc::new(ScriptedModel::sequential(vec![ScriptedTurn::text(
            "그냥 제 생각에는...",
        )]));
        let plan = router(model).route(&state(), "안녕").await.unwrap();
        assert!(matches!(plan.decision, RouteDecision::Direct));
        assert!(plan.instrument.is_none());
    }

    #[tokio::test]
    async fn empty_agent_list_is_direct() {
        let model = Arc::new(ScriptedModel::sequential(vec![ScriptedTurn::text(
            r#"{"instrument": null, "agents": []}"#,
        )]));
        let plan = router(model).route(&state(), "고마워").await.unwrap();
        assert!(matches!(plan.decision, RouteDecision::Direct));
    }

    #[tokio::test]
    async fn unresolvable_mention_clears_thread_instrument() {
        let model = Arc::new(ScriptedModel::sequential(vec![ScriptedTurn::text(
            r#"{"instrument": "정체불명회사", "agents": []}"#,
        )]));
        let mut carried = state();
        carried.instrument_context = Some(InstrumentContext {
            name: "NAVER".to_string(),
            code: "035420".to_string(),
            graph_context: None,
        });

        // the new request names a different company we cannot resolve;
        // keeping NAVER would point every tool at the wrong code
        let plan = router(model)
            .route(&carried, "정체불명회사 어때?")
            .await
            .unwrap();
        assert!(plan.instrument.is_none());
    }

    #[tokio::test]
    async fn absent_mention_carries_thread_instrument() {
        let model = Arc::new(ScriptedModel::sequential(vec![ScriptedTurn::text(
            r#"{"instrument": null, "agents": []}"#,
        )]));
        let mut carried = state();
        carried.instrument_context = Some(InstrumentContext {
            name: "NAVER".to_string(),
            code: "035420".to_string(),
            graph_context: None,
        });

        let plan = router(model).route(&carried, "이거 어때?").await.unwrap();
        assert_eq!(plan.instrument.unwrap().code, "035420");
    }

    #[tokio::test]
    async fn resolved_instrument_is_enriched_from_graph() {
        let payload = json!([{"row": ["삼성전자", "SUPPLIES", "Apple"]}]);
        let graph = Arc::new(StaticGraphClient::new(payload.clone()));
        let model = Arc::new(ScriptedModel::sequential(vec![ScriptedTurn::text(
            r#"{"instrument": "삼성전자", "agents": [{"id": "graph", "sub_query": "관계"}]}"#,
        )]));

        let plan = router_with_graph(model, graph.clone())
            .route(&state(), "삼성전자 관계도 보여줘")
            .await
            .unwrap();

        let instrument = plan.instrument.unwrap();
        assert_eq!(instrument.code, "005930");
        assert_eq!(instrument.graph_context, Some(payload));

        let seen = graph.seen_statements().await;
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("005930"));
        assert!(seen[0].ends_with("LIMIT 30"));
    }

    #[tokio::test]
    async fn graph_failure_leaves_instrument_without_subgraph() {
        struct DownGraph;

        #[async_trait::async_trait]
        impl GraphClient for DownGraph {
            async fn query(&self, _cypher: &str) -> Result<serde_json::Value> {
                Err(crate::error::OrchestrationError::ToolFailure {
                    tool: "graph_query".to_string(),
                    message: "connection refused".to_string(),
                })
            }
        }

        let model = Arc::new(ScriptedModel::sequential(vec![ScriptedTurn::text(
            r#"{"instrument": "삼성전자", "agents": []}"#,
        )]));

        let plan = router_with_graph(model, Arc::new(DownGraph))
            .route(&state(), "삼성전자 어때?")
            .await
            .unwrap();

        let instrument = plan.instrument.unwrap();
        assert_eq!(instrument.code, "005930");
        assert!(instrument.graph_context.is_none());
    }

    #[tokio::test]
    async fn repeated_mention_keeps_enriched_context() {
        let graph = Arc::new(StaticGraphClient::new(json!([{"row": ["x"]}])));
        let model = Arc::new(ScriptedModel::sequential(vec![ScriptedTurn::text(
            r#"{"instrument": "삼성전자", "agents": []}"#,
        )]));
        let mut carried = state();
        carried.instrument_context = Some(InstrumentContext {
            name: "삼성전자".to_string(),
            code: "005930".to_string(),
            graph_context: Some(json!([{"row": ["cached"]}])),
        });

        let plan = router_with_graph(model, graph.clone())
            .route(&carried, "삼성전자 다시 볼까")
            .await
            .unwrap();

        let instrument = plan.instrument.unwrap();
        assert_eq!(instrument.graph_context, Some(json!([{"row": ["cached"]}])));
        // already enriched, no second round trip
        assert!(graph.seen_statements().await.is_empty());
    }

    #[tokio::test]
    async fn fuzzy_mention_resolves_through_catalog() {
        let model = Arc::new(ScriptedModel::sequential(vec![ScriptedTurn::text(
            r#"{"instrument": "샘성전자", "agents": [{"id": "technical"}]}"#,
        )]));
        let plan = router(model).route(&state(), "샘성전자 어때").await.unwrap();
        assert_eq!(plan.instrument.unwrap().code, "005930");

        // missing sub_query falls back to the raw message
        let RouteDecision::Delegate(tasks) = plan.decision else {
            panic!("expected delegation");
        };
        assert_eq!(tasks[0].sub_query, "샘성전자 어때");
    }
}
