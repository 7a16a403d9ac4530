//! Process configuration
//!
//! Every knob is read once at startup and injected into the component
//! graph; nothing in the library reads the environment after construction.

use std::env;
use std::time::Duration;

/// Default substrings the brokerage uses to signal an expired access token.
/// Overridable via `TOKEN_EXPIRY_INDICATORS` (comma-separated).
pub const DEFAULT_EXPIRY_INDICATORS: &[&str] = &["기간이 만료된 token", "유효하지 않은 token"];

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    // Model collaborator
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub gemini_base_url: String,

    // Durable state (None -> in-memory stores)
    pub database_url: Option<String>,

    // Brokerage collaborator
    pub broker_base_url: String,
    pub broker_app_key: String,
    pub broker_app_secret: String,
    pub token_expiry_indicators: Vec<String>,

    // Knowledge graph collaborator
    pub graph_base_url: String,
    pub graph_user: String,
    pub graph_password: String,
    pub graph_database: String,

    // News search collaborator
    pub news_search_url: String,
    pub news_api_key: Option<String>,

    // Orchestration bounds
    pub max_delegated_agents: usize,
    pub tool_round_budget: u32,
    pub agent_result_limit: usize,
    pub wave_deadline: Duration,
    pub tool_timeout: Duration,

    // Reference catalog (None -> built-in fallback listing)
    pub catalog_path: Option<String>,

    // HTTP surface
    pub port: u16,
}

impl OrchestratorConfig {
    /// Assemble configuration from the process environment.
    ///
    /// Call `dotenv::dotenv().ok()` in the binary before this if a `.env`
    /// file should be honored.
    pub fn from_env() -> Self {
        let token_expiry_indicators = env::var("TOKEN_EXPIRY_INDICATORS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .filter(|list| !list.is_empty())
            .unwrap_or_else(|| {
                DEFAULT_EXPIRY_INDICATORS
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            });

        Self {
            gemini_api_key: env::var("GEMINI_API_KEY").unwrap_or_default(),
            gemini_model: env::var("GEMINI_MODEL")
                .unwrap_or_else(|_| "gemini-2.0-flash".to_string()),
            gemini_base_url: env::var("GEMINI_BASE_URL").unwrap_or_else(|_| {
                "https://generativelanguage.googleapis.com/v1beta".to_string()
            }),
            database_url: env::var("DATABASE_URL")
                .or_else(|_| env::var("POSTGRES_URL"))
                .ok(),
            broker_base_url: env::var("BROKER_BASE_URL")
                .unwrap_or_else(|_| "https://openapivts.koreainvestment.com:29443".to_string()),
            broker_app_key: env::var("BROKER_APP_KEY").unwrap_or_default(),
            broker_app_secret: env::var("BROKER_APP_SECRET").unwrap_or_default(),
            token_expiry_indicators,
            graph_base_url: env::var("GRAPH_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:7474".to_string()),
            graph_user: env::var("GRAPH_USER").unwrap_or_else(|_| "neo4j".to_string()),
            graph_password: env::var("GRAPH_PASSWORD").unwrap_or_default(),
            graph_database: env::var("GRAPH_DATABASE").unwrap_or_else(|_| "neo4j".to_string()),
            news_search_url: env::var("NEWS_SEARCH_URL")
                .unwrap_or_else(|_| "https://api.search.brave.com/res/v1/news/search".to_string()),
            news_api_key: env::var("NEWS_API_KEY").ok(),
            max_delegated_agents: parse_env("MAX_DELEGATED_AGENTS", 3),
            tool_round_budget: parse_env("TOOL_ROUND_BUDGET", 5),
            agent_result_limit: parse_env("AGENT_RESULT_LIMIT", 10),
            wave_deadline: Duration::from_secs(parse_env("WAVE_DEADLINE_SECS", 120)),
            tool_timeout: Duration::from_secs(parse_env("TOOL_TIMEOUT_SECS", 30)),
            catalog_path: env::var("CATALOG_PATH").ok(),
            port: parse_env("PORT", 8080),
        }
    }

    /// True when a broker failure message carries one of the recognized
    /// expired-token indicators.
    pub fn is_expiry_indicator(&self, message: &str) -> bool {
        self.token_expiry_indicators
            .iter()
            .any(|needle| message.contains(needle.as_str()))
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: String::new(),
            gemini_model: "gemini-2.0-flash".to_string(),
            gemini_base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            database_url: None,
            broker_base_url: "https://openapivts.koreainvestment.com:29443".to_string(),
            broker_app_key: String::new(),
            broker_app_secret: String::new(),
            token_expiry_indicators: DEFAULT_EXPIRY_INDICATORS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            graph_base_url: "http://localhost:7474".to_string(),
            graph_user: "neo4j".to_string(),
            graph_password: String::new(),
            graph_database: "neo4j".to_string(),
            news_search_url: "https://api.search.brave.com/res/v1/news/search".to_string(),
            news_api_key: None,
            max_delegated_agents: 3,
            tool_round_budget: 5,
            agent_result_limit: 10,
            wave_deadline: Duration::from_secs(120),
            tool_timeout: Duration::from_secs(30),
            catalog_path: None,
            port: 8080,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_indicators_match_broker_phrases() {
        let config = OrchestratorConfig::default();
        assert!(config.is_expiry_indicator("기간이 만료된 token입니다"));
        assert!(config.is_expiry_indicator("유효하지 않은 token 입니다"));
        assert!(!config.is_expiry_indicator("주문이 정상 처리되었습니다"));
    }

    #[test]
    fn custom_indicator_list_replaces_defaults() {
        let config = OrchestratorConfig {
            token_expiry_indicators: vec!["token expired".to_string()],
            ..OrchestratorConfig::default()
        };
        assert!(config.is_expiry_indicator("broker says: token expired"));
        assert!(!config.is_expiry_indicator("기간이 만료된 token"));
    }
}
