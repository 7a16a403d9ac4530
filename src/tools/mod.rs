//! Tool registry and specialist tool implementations
//!
//! Tools are the only capability surface specialists have. Each tool
//! declares a JSON schema for the model, validates its own input, and maps
//! collaborator failures into `ToolFailure` so a specialist can keep
//! reasoning after a bad call. Only malformed caller input surfaces as
//! `InvalidToolInput`.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::broker::{ensure_token, BrokerCredentials, Brokerage, CredentialStore};
use crate::config::OrchestratorConfig;
use crate::error::OrchestrationError;
use crate::graph::GraphClient;
use crate::llm::ToolDecl;
use crate::models::{ToolInput, ToolOutput};
use crate::Result;

//
// ================= Trait and registry =================
//

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON schema for the parameters object, advertised to the model.
    fn schema(&self) -> Value;
    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput>;
}

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Declarations for a named subset, in roster order. Unknown names are
    /// skipped with a warning rather than failing the whole wave.
    pub fn decls(&self, names: &[String]) -> Vec<ToolDecl> {
        names
            .iter()
            .filter_map(|name| match self.tools.get(name) {
                Some(tool) => Some(ToolDecl {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.schema(),
                }),
                None => {
                    warn!(tool = %name, "unknown tool in specialist toolset");
                    None
                }
            })
            .collect()
    }

    /// Executes one call under the per-call timeout. Elapsing the timeout
    /// is a recoverable `ToolFailure`, not a task abort.
    pub async fn execute(&self, input: &ToolInput, timeout: Duration) -> Result<ToolOutput> {
        let tool = self
            .get(&input.tool_name)
            .ok_or_else(|| OrchestrationError::ToolNotFound(input.tool_name.clone()))?;

        debug!(tool = %input.tool_name, "executing tool");
        match tokio::time::timeout(timeout, tool.execute(input)).await {
            Ok(result) => result,
            Err(_) => Err(OrchestrationError::ToolFailure {
                tool: input.tool_name.clone(),
                message: format!("timed out after {}s", timeout.as_secs()),
            }),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Wires every production tool against the shared collaborators.
pub fn build_registry(
    config: &OrchestratorConfig,
    brokerage: Arc<dyn Brokerage>,
    credentials: Arc<dyn CredentialStore>,
    graph: Arc<dyn GraphClient>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(NewsSearchTool::new(config)));
    registry.register(Arc::new(MarketPriceTool::new(
        brokerage.clone(),
        credentials.clone(),
    )));
    registry.register(Arc::new(FinancialStatementsTool::new(
        brokerage.clone(),
        credentials.clone(),
    )));
    registry.register(Arc::new(AccountBalanceTool::new(brokerage, credentials)));
    registry.register(Arc::new(GraphQueryTool::new(graph)));
    registry
}

//
// ================= Shared helpers =================
//

/// Collaborator failures become recoverable tool failures; caller-side
/// input errors pass through untouched.
fn degrade(tool: &'static str, err: OrchestrationError) -> OrchestrationError {
    match err {
        caller @ OrchestrationError::InvalidToolInput(_) => caller,
        already @ OrchestrationError::ToolFailure { .. } => already,
        other => OrchestrationError::ToolFailure {
            tool: tool.to_string(),
            message: other.to_string(),
        },
    }
}

fn required_str<'a>(parameters: &'a Value, key: &str, tool: &str) -> Result<&'a str> {
    parameters
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            OrchestrationError::InvalidToolInput(format!("{} requires a '{}' string", tool, key))
        })
}

/// Instrument code as injected by the runner from the resolved context.
/// Absence is environmental (nothing resolved for this request), so the
/// specialist gets a failure it can reason past.
fn instrument_code<'a>(parameters: &'a Value, tool: &'static str) -> Result<&'a str> {
    let code = parameters
        .get("code")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| OrchestrationError::ToolFailure {
            tool: tool.to_string(),
            message: "no instrument code resolved for this request".to_string(),
        })?;
    if code.len() != 6 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(OrchestrationError::InvalidToolInput(format!(
            "{} expects a 6-digit instrument code, got '{}'",
            tool, code
        )));
    }
    Ok(code)
}

/// Loads the requesting user's brokerage record and makes sure it carries
/// an access token. Missing records degrade instead of aborting the
/// specialist.
async fn broker_session(
    tool: &'static str,
    brokerage: &dyn Brokerage,
    credentials: &dyn CredentialStore,
    parameters: &Value,
) -> Result<BrokerCredentials> {
    let user_id = parameters
        .get("user_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| OrchestrationError::ToolFailure {
            tool: tool.to_string(),
            message: "no user context supplied".to_string(),
        })?;

    let mut creds = credentials
        .fetch(user_id)
        .await
        .map_err(|e| degrade(tool, e))?
        .ok_or_else(|| OrchestrationError::ToolFailure {
            tool: tool.to_string(),
            message: "no brokerage account registered for this user".to_string(),
        })?;

    ensure_token(brokerage, credentials, &mut creds)
        .await
        .map_err(|e| degrade(tool, e))?;
    Ok(creds)
}

fn ok_output(data: Value) -> ToolOutput {
    ToolOutput {
        success: true,
        data,
        error: None,
    }
}

//
// ================= News search =================
//

pub struct NewsSearchTool {
    client: Client,
    search_url: String,
    api_key: Option<String>,
}

impl NewsSearchTool {
    pub fn new(config: &OrchestratorConfig) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(15))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            client,
            search_url: config.news_search_url.clone(),
            api_key: config.news_api_key.clone(),
        }
    }

    fn compact(body: Value) -> Value {
        // Search providers nest hits differently; keep only what the model
        // needs to read.
        let hits = body
            .get("results")
            .or_else(|| body.get("web").and_then(|w| w.get("results")))
            .or_else(|| body.get("items"))
            .and_then(Value::as_array);
        match hits {
            Some(rows) => Value::Array(
                rows.iter()
                    .take(5)
                    .map(|row| {
                        json!({
                            "title": row.get("title").cloned().unwrap_or(Value::Null),
                            "url": row.get("url").cloned().unwrap_or(Value::Null),
                            "description": row.get("description").cloned().unwrap_or(Value::Null),
                        })
                    })
                    .collect(),
            ),
            None => body,
        }
    }
}

#[async_trait]
impl Tool for NewsSearchTool {
    fn name(&self) -> &'static str {
        "search_news"
    }

    fn description(&self) -> &'static str {
        "Search recent news articles for a company or market topic"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search phrase, e.g. a company name plus a topic"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let query = required_str(&input.parameters, "query", self.name())?;

        let mut request = self
            .client
            .get(&self.search_url)
            .query(&[("q", query), ("count", "5")])
            .header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("X-Subscription-Token", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| OrchestrationError::ToolFailure {
                tool: self.name().to_string(),
                message: format!("search request failed: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(OrchestrationError::ToolFailure {
                tool: self.name().to_string(),
                message: format!("search endpoint returned {}", status),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| OrchestrationError::ToolFailure {
                tool: self.name().to_string(),
                message: format!("search response parse failed: {}", e),
            })?;
        Ok(ok_output(Self::compact(body)))
    }
}

//
// ================= Market price =================
//

pub struct MarketPriceTool {
    brokerage: Arc<dyn Brokerage>,
    credentials: Arc<dyn CredentialStore>,
}

impl MarketPriceTool {
    pub fn new(brokerage: Arc<dyn Brokerage>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            brokerage,
            credentials,
        }
    }
}

#[async_trait]
impl Tool for MarketPriceTool {
    fn name(&self) -> &'static str {
        "market_price"
    }

    fn description(&self) -> &'static str {
        "Current quote for an instrument: last price, change, volume"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "6-digit instrument code; omit to use the resolved instrument"
                }
            }
        })
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let code = instrument_code(&input.parameters, self.name())?;
        let creds = broker_session(
            self.name(),
            self.brokerage.as_ref(),
            self.credentials.as_ref(),
            &input.parameters,
        )
        .await?;

        let quote = self
            .brokerage
            .current_price(&creds, code)
            .await
            .map_err(|e| degrade(self.name(), e))?;
        Ok(ok_output(quote))
    }
}

//
// ================= Financial statements =================
//

pub struct FinancialStatementsTool {
    brokerage: Arc<dyn Brokerage>,
    credentials: Arc<dyn CredentialStore>,
}

impl FinancialStatementsTool {
    pub fn new(brokerage: Arc<dyn Brokerage>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            brokerage,
            credentials,
        }
    }
}

#[async_trait]
impl Tool for FinancialStatementsTool {
    fn name(&self) -> &'static str {
        "financial_statements"
    }

    fn description(&self) -> &'static str {
        "Financial ratios by fiscal period: growth, profitability, leverage"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "6-digit instrument code; omit to use the resolved instrument"
                }
            }
        })
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let code = instrument_code(&input.parameters, self.name())?;
        let creds = broker_session(
            self.name(),
            self.brokerage.as_ref(),
            self.credentials.as_ref(),
            &input.parameters,
        )
        .await?;

        let ratios = self
            .brokerage
            .financial_ratios(&creds, code)
            .await
            .map_err(|e| degrade(self.name(), e))?;
        Ok(ok_output(ratios))
    }
}

//
// ================= Account balance =================
//

pub struct AccountBalanceTool {
    brokerage: Arc<dyn Brokerage>,
    credentials: Arc<dyn CredentialStore>,
}

impl AccountBalanceTool {
    pub fn new(brokerage: Arc<dyn Brokerage>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            brokerage,
            credentials,
        }
    }
}

#[async_trait]
impl Tool for AccountBalanceTool {
    fn name(&self) -> &'static str {
        "account_balance"
    }

    fn description(&self) -> &'static str {
        "Requesting user's account: available cash and total evaluation"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let creds = broker_session(
            self.name(),
            self.brokerage.as_ref(),
            self.credentials.as_ref(),
            &input.parameters,
        )
        .await?;

        let balance = self
            .brokerage
            .balance(&creds)
            .await
            .map_err(|e| degrade(self.name(), e))?;
        Ok(ok_output(balance))
    }
}

//
// ================= Graph query =================
//

pub struct GraphQueryTool {
    graph: Arc<dyn GraphClient>,
}

impl GraphQueryTool {
    pub fn new(graph: Arc<dyn GraphClient>) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl Tool for GraphQueryTool {
    fn name(&self) -> &'static str {
        "graph_query"
    }

    fn description(&self) -> &'static str {
        "Read-only Cypher over the company knowledge graph (MATCH ... RETURN ...)"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "cypher": {
                    "type": "string",
                    "description": "Cypher starting with MATCH and containing RETURN; mutations are rejected"
                }
            },
            "required": ["cypher"]
        })
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let cypher = required_str(&input.parameters, "cypher", self.name())?;
        // The client applies the read-only guard; a rejected statement is a
        // caller-side error and propagates as such.
        let rows = self.graph.query(cypher).await?;
        Ok(ok_output(rows))
    }
}

//
// ================= Scripted double =================
//

/// Configurable in-process tool for tests and the offline demo: canned
/// payload, optional leading failures, optional latency.
pub struct StaticTool {
    name: &'static str,
    payload: Value,
    fail_first: AtomicUsize,
    delay: Option<Duration>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Value>>,
}

impl StaticTool {
    pub fn new(name: &'static str, payload: Value) -> Self {
        Self {
            name,
            payload,
            fail_first: AtomicUsize::new(0),
            delay: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Fail the first `n` calls with a recoverable error, then succeed.
    pub fn failing_first(self, n: usize) -> Self {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn seen_parameters(&self) -> Vec<Value> {
        self.seen.lock().await.clone()
    }
}

#[async_trait]
impl Tool for StaticTool {
    fn name(&self) -> &'static str {
        self.name
    }

    fn description(&self) -> &'static str {
        "Scripted tool returning a fixed payload"
    }

    fn schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().await.push(input.parameters.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(OrchestrationError::ToolFailure {
                tool: self.name.to_string(),
                message: "scripted failure".to_string(),
            });
        }
        Ok(ok_output(self.payload.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryCredentialStore, MockBrokerage};
    use crate::graph::StaticGraphClient;
    use chrono::Utc;

    fn input(tool: &str, parameters: Value) -> ToolInput {
        ToolInput {
            tool_name: tool.to_string(),
            parameters,
        }
    }

    async fn store_with_user(user_id: i64) -> Arc<InMemoryCredentialStore> {
        let store = Arc::new(InMemoryCredentialStore::new());
        store
            .insert(BrokerCredentials {
                user_id,
                app_key: "key".to_string(),
                app_secret: "secret".to_string(),
                account_no: "12345678-01".to_string(),
                access_token: Some("token".to_string()),
                token_issued_at: Some(Utc::now()),
            })
            .await;
        store
    }

    #[tokio::test]
    async fn registry_resolves_decls_and_skips_unknown_names() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StaticTool::new("market_price", json!({"p": 1}))));

        let decls = registry.decls(&["market_price".to_string(), "no_such_tool".to_string()]);
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].name, "market_price");
        assert!(registry.get("no_such_tool").is_none());
    }

    #[tokio::test]
    async fn registry_rejects_unknown_tool_calls() {
        let registry = ToolRegistry::new();
        let err = registry
            .execute(&input("ghost", json!({})), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn slow_tool_times_out_as_recoverable_failure() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(
            StaticTool::new("slow", json!({})).with_delay(Duration::from_millis(200)),
        ));

        let err = registry
            .execute(&input("slow", json!({})), Duration::from_millis(20))
            .await
            .unwrap_err();
        match &err {
            OrchestrationError::ToolFailure { tool, message } => {
                assert_eq!(tool, "slow");
                assert!(message.contains("timed out"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(err.is_recoverable_for_specialist());
    }

    #[tokio::test]
    async fn market_price_without_code_degrades() {
        let tool = MarketPriceTool::new(Arc::new(MockBrokerage::new()), store_with_user(7).await);
        let err = tool
            .execute(&input("market_price", json!({"user_id": 7})))
            .await
            .unwrap_err();
        assert!(err.is_recoverable_for_specialist());
        assert!(err.to_string().contains("no instrument code"));
    }

    #[tokio::test]
    async fn market_price_rejects_malformed_code() {
        let tool = MarketPriceTool::new(Arc::new(MockBrokerage::new()), store_with_user(7).await);
        let err = tool
            .execute(&input(
                "market_price",
                json!({"user_id": 7, "code": "samsung"}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidToolInput(_)));
        assert!(!err.is_recoverable_for_specialist());
    }

    #[tokio::test]
    async fn market_price_returns_quote_for_resolved_code() {
        let tool = MarketPriceTool::new(Arc::new(MockBrokerage::new()), store_with_user(7).await);
        let output = tool
            .execute(&input(
                "market_price",
                json!({"user_id": 7, "code": "005930"}),
            ))
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.data["stck_prpr"], "71000");
    }

    #[tokio::test]
    async fn balance_without_registered_account_degrades() {
        let tool = AccountBalanceTool::new(
            Arc::new(MockBrokerage::new()),
            Arc::new(InMemoryCredentialStore::new()),
        );
        let err = tool
            .execute(&input("account_balance", json!({"user_id": 42})))
            .await
            .unwrap_err();
        assert!(err.is_recoverable_for_specialist());
        assert!(err.to_string().contains("no brokerage account registered"));
    }

    #[tokio::test]
    async fn graph_tool_passes_statement_through_guard() {
        let graph = Arc::new(StaticGraphClient::new(json!([{"row": ["삼성전자"]}])));
        let tool = GraphQueryTool::new(graph.clone());

        let output = tool
            .execute(&input(
                "graph_query",
                json!({"cypher": "MATCH (c:Company) RETURN c.name"}),
            ))
            .await
            .unwrap();
        assert!(output.success);

        let seen = graph.seen_statements().await;
        assert_eq!(seen.len(), 1);
        assert!(seen[0].ends_with("LIMIT 30"));

        let err = tool
            .execute(&input(
                "graph_query",
                json!({"cypher": "MERGE (c:Company {name: 'x'}) RETURN c"}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidToolInput(_)));
    }

    #[tokio::test]
    async fn news_search_requires_query() {
        let tool = NewsSearchTool::new(&OrchestratorConfig::default());
        let err = tool
            .execute(&input("search_news", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidToolInput(_)));
    }

    #[test]
    fn news_compaction_keeps_title_url_description() {
        let body = json!({
            "results": [
                {"title": "t1", "url": "u1", "description": "d1", "extra": "x"},
                {"title": "t2", "url": "u2", "description": "d2"}
            ]
        });
        let compact = NewsSearchTool::compact(body);
        let rows = compact.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["title"], "t1");
        assert!(rows[0].get("extra").is_none());
    }

    #[tokio::test]
    async fn static_tool_scripted_failures_then_success() {
        let tool = StaticTool::new("flaky", json!({"ok": true})).failing_first(1);

        let first = tool.execute(&input("flaky", json!({}))).await;
        assert!(first.is_err());
        let second = tool.execute(&input("flaky", json!({}))).await.unwrap();
        assert!(second.success);
        assert_eq!(tool.calls(), 2);
    }
}
