//! Knowledge-graph collaborator
//!
//! Read-only Cypher over the graph database's HTTP transaction endpoint.
//! The write guard runs in this layer before dispatch; the collaborator is
//! never trusted to reject mutations on our behalf.

use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::OrchestratorConfig;
use crate::error::OrchestrationError;
use crate::Result;

/// Keywords that make a statement mutating (or able to smuggle mutation).
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "CREATE", "MERGE", "DELETE", "DETACH", "SET ", "REMOVE", "DROP", "CALL", "LOAD",
];

/// Default row cap appended to statements that carry no LIMIT.
const DEFAULT_LIMIT: u32 = 30;

/// Trait for read-only graph queries
#[async_trait::async_trait]
pub trait GraphClient: Send + Sync {
    async fn query(&self, cypher: &str) -> Result<Value>;
}

/// Validate and normalize one Cypher statement: must start with MATCH,
/// must RETURN, must not mutate; a LIMIT is injected when absent.
pub fn sanitize_cypher(cypher: &str) -> Result<String> {
    let trimmed = cypher.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Err(OrchestrationError::InvalidToolInput(
            "empty graph query".to_string(),
        ));
    }

    let upper = trimmed.to_uppercase();
    if !upper.starts_with("MATCH") {
        return Err(OrchestrationError::InvalidToolInput(
            "graph query must start with MATCH".to_string(),
        ));
    }
    if !upper.contains("RETURN") {
        return Err(OrchestrationError::InvalidToolInput(
            "graph query must contain RETURN".to_string(),
        ));
    }
    for keyword in FORBIDDEN_KEYWORDS {
        if upper.contains(keyword) {
            return Err(OrchestrationError::InvalidToolInput(format!(
                "write-style graph queries are not allowed ({})",
                keyword.trim()
            )));
        }
    }

    if upper.contains("LIMIT") {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{} LIMIT {}", trimmed, DEFAULT_LIMIT))
    }
}

/// HTTP client for the graph database's transaction API.
pub struct Neo4jHttpClient {
    client: Client,
    base_url: String,
    database: String,
    user: String,
    password: String,
}

impl Neo4jHttpClient {
    pub fn new(config: &OrchestratorConfig) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: config.graph_base_url.trim_end_matches('/').to_string(),
            database: config.graph_database.clone(),
            user: config.graph_user.clone(),
            password: config.graph_password.clone(),
        }
    }
}

#[async_trait::async_trait]
impl GraphClient for Neo4jHttpClient {
    async fn query(&self, cypher: &str) -> Result<Value> {
        let statement = sanitize_cypher(cypher)?;
        let url = format!("{}/db/{}/tx/commit", self.base_url, self.database);
        debug!(statement = %statement, "graph query");

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&json!({
                "statements": [{
                    "statement": statement,
                    "resultDataContents": ["row"]
                }]
            }))
            .send()
            .await
            .map_err(|e| OrchestrationError::ToolFailure {
                tool: "graph_query".to_string(),
                message: format!("graph request failed: {}", e),
            })?;

        let status = response.status();
        let body: Value = response.json().await.map_err(|e| {
            OrchestrationError::ToolFailure {
                tool: "graph_query".to_string(),
                message: format!("invalid graph response: {}", e),
            }
        })?;

        if !status.is_success() {
            return Err(OrchestrationError::ToolFailure {
                tool: "graph_query".to_string(),
                message: format!("graph endpoint returned {}: {}", status, body),
            });
        }

        let errors = body
            .get("errors")
            .and_then(Value::as_array)
            .map(|a| a.len())
            .unwrap_or(0);
        if errors > 0 {
            return Err(OrchestrationError::ToolFailure {
                tool: "graph_query".to_string(),
                message: format!("graph query rejected: {}", body["errors"]),
            });
        }

        Ok(body.get("results").cloned().unwrap_or(Value::Null))
    }
}

/// Canned-response graph client for tests and the offline demo. Records
/// every statement it receives.
pub struct StaticGraphClient {
    payload: Value,
    seen: Mutex<Vec<String>>,
}

impl StaticGraphClient {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub async fn seen_statements(&self) -> Vec<String> {
        self.seen.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl GraphClient for StaticGraphClient {
    async fn query(&self, cypher: &str) -> Result<Value> {
        let statement = sanitize_cypher(cypher)?;
        self.seen.lock().await.push(statement);
        Ok(self.payload.clone())
    }
}
