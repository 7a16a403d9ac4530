//! Offline walkthrough: scripted model, mock brokerage, in-memory stores.
//!
//! Runs the full pipeline twice against one checkpoint store: an analysis
//! request that suspends with a trade proposal, then an approval handled
//! by a fresh coordinator, standing in for a process restart.

use std::sync::Arc;
use tracing::info;

use trading_agent_orchestrator::agent::Coordinator;
use trading_agent_orchestrator::broker::{
    BrokerCredentials, InMemoryCredentialStore, MockBrokerage,
};
use trading_agent_orchestrator::catalog::InstrumentCatalog;
use trading_agent_orchestrator::config::OrchestratorConfig;
use trading_agent_orchestrator::events::{EventEmitter, DONE_MARKER};
use trading_agent_orchestrator::graph::{GraphClient, StaticGraphClient};
use trading_agent_orchestrator::llm::{ScriptedModel, ScriptedTurn, ToolCallRequest};
use trading_agent_orchestrator::models::{ChatRequest, Decision};
use trading_agent_orchestrator::state::{CheckpointStore, InMemoryCheckpointStore};
use trading_agent_orchestrator::tools::build_registry;

async fn scripted_model() -> Arc<ScriptedModel> {
    let model = ScriptedModel::keyed();
    model
        .insert(
            "route stock questions",
            vec![ScriptedTurn::text(
                r#"{"instrument": "삼성전자", "agents": [{"id": "market", "sub_query": "최근 뉴스 분위기"}, {"id": "strategy", "sub_query": "매수 적정성 평가"}]}"#,
            )],
        )
        .await;
    model
        .insert(
            "'market' specialist",
            vec![ScriptedTurn::text(
                "최근 공시와 뉴스 흐름은 반도체 업황 회복 기대가 우세합니다.",
            )],
        )
        .await;
    model
        .insert(
            "'strategy' specialist",
            vec![
                ScriptedTurn::calls(vec![ToolCallRequest {
                    name: "market_price".to_string(),
                    arguments: serde_json::json!({}),
                }]),
                ScriptedTurn::text(
                    "현재가 71,000원 기준 단기 모멘텀이 양호해 시장가 10주 매수를 권합니다.",
                ),
            ],
        )
        .await;
    model
        .insert(
            "executable stock order",
            vec![ScriptedTurn::text(
                r#"{"action": "order", "instrument_code": "005930", "side": "buy", "order_kind": "market", "quantity": 10, "rationale": "반도체 업황 회복과 단기 모멘텀"}"#,
            )],
        )
        .await;
    Arc::new(model)
}

fn build_coordinator(
    model: Arc<ScriptedModel>,
    checkpoints: Arc<InMemoryCheckpointStore>,
    brokerage: Arc<MockBrokerage>,
    credentials: Arc<InMemoryCredentialStore>,
    config: &OrchestratorConfig,
) -> Coordinator {
    let graph: Arc<dyn GraphClient> = Arc::new(StaticGraphClient::new(serde_json::json!([])));
    let registry = Arc::new(build_registry(
        config,
        brokerage.clone(),
        credentials.clone(),
        graph.clone(),
    ));
    let catalog = Arc::new(InstrumentCatalog::load_or_fallback(None));
    Coordinator::new(
        model,
        registry,
        catalog,
        checkpoints,
        brokerage,
        credentials,
        graph,
        config,
    )
}

async fn run_and_print(coordinator: &Coordinator, request: ChatRequest) {
    let (emitter, mut rx) = EventEmitter::channel(64);

    let printer = async {
        while let Some(event) = rx.recv().await {
            let line = serde_json::to_string(&event)
                .unwrap_or_else(|_| "<unserializable event>".to_string());
            println!("  {}", line);
        }
        println!("  {}", DONE_MARKER);
    };

    tokio::join!(coordinator.handle(request, emitter), printer);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    info!("Stock analysis orchestrator, offline walkthrough");

    let config = OrchestratorConfig::default();
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let brokerage = Arc::new(MockBrokerage::new());
    let credentials = Arc::new(InMemoryCredentialStore::new());
    credentials
        .insert(BrokerCredentials {
            user_id: 7,
            app_key: "demo-app-key".to_string(),
            app_secret: "demo-app-secret".to_string(),
            account_no: "12345678-01".to_string(),
            access_token: None,
            token_issued_at: None,
        })
        .await;

    let coordinator = build_coordinator(
        scripted_model().await,
        checkpoints.clone(),
        brokerage.clone(),
        credentials.clone(),
        &config,
    );

    println!("\n=== 1. ANALYSIS REQUEST ===");
    println!("user: 삼성전자 사도 될까? 괜찮으면 10주 사줘\n");
    run_and_print(
        &coordinator,
        ChatRequest {
            user_id: 7,
            thread_id: "demo-thread".to_string(),
            message: "삼성전자 사도 될까? 괜찮으면 10주 사줘".to_string(),
            decision: None,
        },
    )
    .await;

    let suspended = checkpoints
        .load("demo-thread")
        .await?
        .expect("thread was checkpointed");
    let proposal = suspended
        .active_proposal
        .as_ref()
        .expect("analysis ended in a proposal");
    println!(
        "\nthread suspended at version {}: proposal {} ({} x{}, {})",
        suspended.version, proposal.proposal_id, proposal.instrument_code, proposal.quantity, proposal.status
    );

    // A fresh coordinator on the same stores: the approval survives the
    // process boundary through the checkpoint alone.
    println!("\n=== 2. RESTART + APPROVAL ===");
    println!("user: 승인합니다\n");
    let restarted = build_coordinator(
        Arc::new(ScriptedModel::keyed()),
        checkpoints.clone(),
        brokerage.clone(),
        credentials.clone(),
        &config,
    );
    run_and_print(
        &restarted,
        ChatRequest {
            user_id: 7,
            thread_id: "demo-thread".to_string(),
            message: "승인합니다".to_string(),
            decision: Some(Decision::Approve),
        },
    )
    .await;

    println!("\n=== FINAL THREAD STATE ===");
    let settled = checkpoints
        .load("demo-thread")
        .await?
        .expect("thread was checkpointed");
    let proposal = settled
        .active_proposal
        .as_ref()
        .expect("proposal survived the restart");
    println!("proposal status : {}", proposal.status);
    println!("turns recorded  : {}", settled.history.len());
    println!("orders placed   : {}", brokerage.place_calls());
    println!("tokens issued   : {}", brokerage.tokens_issued());

    Ok(())
}
