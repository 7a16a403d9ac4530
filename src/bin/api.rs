use std::sync::Arc;
use tracing::info;

use trading_agent_orchestrator::agent::Coordinator;
use trading_agent_orchestrator::api::start_server;
use trading_agent_orchestrator::broker::{
    CredentialStore, HttpBrokerage, InMemoryCredentialStore, PostgresCredentialStore,
};
use trading_agent_orchestrator::catalog::InstrumentCatalog;
use trading_agent_orchestrator::config::OrchestratorConfig;
use trading_agent_orchestrator::gemini::GeminiClient;
use trading_agent_orchestrator::graph::{GraphClient, Neo4jHttpClient};
use trading_agent_orchestrator::state::{
    CheckpointStore, InMemoryCheckpointStore, PostgresCheckpointStore,
};
use trading_agent_orchestrator::tools::build_registry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    dotenv::dotenv().ok();
    let config = OrchestratorConfig::from_env();

    info!("🚀 Stock Analysis Orchestrator - API Server");
    info!("📍 Port: {}", config.port);

    // Collaborators
    let model = Arc::new(GeminiClient::new(&config));
    let brokerage = Arc::new(HttpBrokerage::new(&config));
    let graph: Arc<dyn GraphClient> = Arc::new(Neo4jHttpClient::new(&config));

    // Durable state; without DATABASE_URL threads live only in-process.
    let (checkpoints, credentials): (Arc<dyn CheckpointStore>, Arc<dyn CredentialStore>) =
        match &config.database_url {
            Some(url) => (
                Arc::new(PostgresCheckpointStore::connect_lazy(url)?),
                Arc::new(PostgresCredentialStore::connect_lazy(url)?),
            ),
            None => {
                info!("⚠️  DATABASE_URL not set, using in-memory stores");
                (
                    Arc::new(InMemoryCheckpointStore::new()),
                    Arc::new(InMemoryCredentialStore::new()),
                )
            }
        };

    let registry = Arc::new(build_registry(
        &config,
        brokerage.clone(),
        credentials.clone(),
        graph.clone(),
    ));
    info!("🔧 Tools: {}", registry.tool_names().join(", "));
    let catalog = Arc::new(InstrumentCatalog::load_or_fallback(
        config.catalog_path.as_deref(),
    ));

    let coordinator = Arc::new(Coordinator::new(
        model,
        registry,
        catalog,
        checkpoints,
        brokerage,
        credentials,
        graph,
        &config,
    ));

    info!("✅ Coordinator initialized");
    info!("📡 Starting API server...");

    start_server(coordinator, config.port).await?;

    Ok(())
}
