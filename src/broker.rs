//! Brokerage collaborator and credential storage
//!
//! KIS-flavored REST client behind a trait seam, plus the per-user
//! credential records the order path needs. Expired-token detection matches
//! configured indicator substrings; the decision to refresh lives in the
//! order executor, not here.

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::OrchestrationError;
use crate::models::{OrderKind, OrderSide, TradingProposal};
use crate::Result;

//
// ================= Types =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerCredentials {
    pub user_id: i64,
    pub app_key: String,
    pub app_secret: String,
    /// Format `XXXXXXXX-XX`: account number and product code.
    pub account_no: String,
    pub access_token: Option<String>,
    pub token_issued_at: Option<DateTime<Utc>>,
}

impl BrokerCredentials {
    fn account_parts(&self) -> Result<(&str, &str)> {
        self.account_no.split_once('-').ok_or_else(|| {
            OrchestrationError::OrderFailure(format!(
                "malformed account number '{}'",
                self.account_no
            ))
        })
    }

    fn bearer(&self) -> Result<&str> {
        self.access_token.as_deref().ok_or_else(|| {
            OrchestrationError::CredentialExpired("no access token issued".to_string())
        })
    }
}

#[derive(Debug, Clone)]
pub struct OrderTicket {
    pub instrument_code: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub price: Option<f64>,
    pub quantity: u32,
}

impl OrderTicket {
    pub fn from_proposal(proposal: &TradingProposal) -> Self {
        Self {
            instrument_code: proposal.instrument_code.clone(),
            side: proposal.side,
            kind: proposal.order_kind,
            price: proposal.price,
            quantity: proposal.quantity,
        }
    }

    /// Brokerage order division: market `01`, limit `00`.
    fn division(&self) -> &'static str {
        match self.kind {
            OrderKind::Market => "01",
            OrderKind::Limit => "00",
        }
    }

    /// Unit price field; market orders send `0`.
    fn unit_price(&self) -> String {
        match (self.kind, self.price) {
            (OrderKind::Limit, Some(price)) => format!("{:.0}", price),
            _ => "0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_no: Option<String>,
    pub message: String,
}

/// Short stable fingerprint for logging tokens without exposing them.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..6])
}

//
// ================= Brokerage trait =================
//

#[async_trait::async_trait]
pub trait Brokerage: Send + Sync {
    async fn issue_token(&self, app_key: &str, app_secret: &str) -> Result<String>;
    async fn balance(&self, creds: &BrokerCredentials) -> Result<Value>;
    async fn current_price(&self, creds: &BrokerCredentials, code: &str) -> Result<Value>;
    async fn financial_ratios(&self, creds: &BrokerCredentials, code: &str) -> Result<Value>;
    /// Places one order. An expired-credential indication surfaces as
    /// `CredentialExpired`; every other rejection as `OrderFailure`.
    async fn place_order(
        &self,
        creds: &BrokerCredentials,
        ticket: &OrderTicket,
    ) -> Result<OrderReceipt>;
}

/// Issues and persists a fresh access token, updating `creds` in place.
pub async fn refresh_token(
    brokerage: &dyn Brokerage,
    store: &dyn CredentialStore,
    creds: &mut BrokerCredentials,
) -> Result<()> {
    let token = brokerage
        .issue_token(&creds.app_key, &creds.app_secret)
        .await?;
    store.store_token(creds.user_id, &token).await?;
    creds.access_token = Some(token);
    creds.token_issued_at = Some(Utc::now());
    Ok(())
}

/// Issues a token only when the record has none.
pub async fn ensure_token(
    brokerage: &dyn Brokerage,
    store: &dyn CredentialStore,
    creds: &mut BrokerCredentials,
) -> Result<()> {
    if creds.access_token.is_none() {
        refresh_token(brokerage, store, creds).await?;
    }
    Ok(())
}

//
// ================= HTTP implementation =================
//

pub struct HttpBrokerage {
    client: Client,
    base_url: String,
    expiry_indicators: Vec<String>,
}

impl HttpBrokerage {
    pub fn new(config: &OrchestratorConfig) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: config.broker_base_url.trim_end_matches('/').to_string(),
            expiry_indicators: config.token_expiry_indicators.clone(),
        }
    }

    fn is_expired_message(&self, message: &str) -> bool {
        self.expiry_indicators
            .iter()
            .any(|needle| message.contains(needle.as_str()))
    }

    /// Sandbox hosts take `V`-prefixed transaction ids, production `T`.
    fn tr_prefix(&self) -> &'static str {
        if self.base_url.contains("vts") {
            "V"
        } else {
            "T"
        }
    }

    fn order_tr_id(&self, side: OrderSide) -> String {
        match side {
            OrderSide::Buy => format!("{}TTC0802U", self.tr_prefix()),
            OrderSide::Sell => format!("{}TTC0801U", self.tr_prefix()),
        }
    }

    async fn get_json(
        &self,
        path: &str,
        creds: &BrokerCredentials,
        tr_id: &str,
        query: &[(&str, &str)],
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .header("authorization", format!("Bearer {}", creds.bearer()?))
            .header("appkey", &creds.app_key)
            .header("appsecret", &creds.app_secret)
            .header("tr_id", tr_id)
            .send()
            .await
            .map_err(|e| OrchestrationError::ToolFailure {
                tool: "brokerage".to_string(),
                message: format!("request failed for {}: {}", path, e),
            })?;

        let status = response.status();
        let body: Value = response.json().await.map_err(|e| {
            OrchestrationError::ToolFailure {
                tool: "brokerage".to_string(),
                message: format!("invalid JSON from {}: {}", path, e),
            }
        })?;

        if !status.is_success() {
            return Err(OrchestrationError::ToolFailure {
                tool: "brokerage".to_string(),
                message: format!("{} returned {}: {}", path, status, body),
            });
        }
        Ok(body)
    }

    /// Brokerage responses carry `rt_cd`/`msg1` even with HTTP 200; an
    /// expiry phrase in `msg1` counts as an expired credential.
    fn check_business_status(&self, body: &Value) -> Result<()> {
        let rt_cd = body.get("rt_cd").and_then(Value::as_str).unwrap_or("0");
        if rt_cd == "0" {
            return Ok(());
        }
        let message = body
            .get("msg1")
            .and_then(Value::as_str)
            .unwrap_or("brokerage rejected the request")
            .trim()
            .to_string();
        if self.is_expired_message(&message) {
            Err(OrchestrationError::CredentialExpired(message))
        } else {
            Err(OrchestrationError::ToolFailure {
                tool: "brokerage".to_string(),
                message,
            })
        }
    }
}

#[async_trait::async_trait]
impl Brokerage for HttpBrokerage {
    async fn issue_token(&self, app_key: &str, app_secret: &str) -> Result<String> {
        let url = format!("{}/oauth2/tokenP", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "grant_type": "client_credentials",
                "appkey": app_key,
                "appsecret": app_secret,
            }))
            .send()
            .await
            .map_err(|e| {
                OrchestrationError::OrderFailure(format!("token issuance failed: {}", e))
            })?;

        let body: Value = response.json().await.map_err(|e| {
            OrchestrationError::OrderFailure(format!("token response parse failed: {}", e))
        })?;

        let token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                OrchestrationError::OrderFailure(format!("no access_token in response: {}", body))
            })?
            .to_string();

        info!(fingerprint = %token_fingerprint(&token), "brokerage access token issued");
        Ok(token)
    }

    async fn balance(&self, creds: &BrokerCredentials) -> Result<Value> {
        let (cano, product) = creds.account_parts()?;
        let tr_id = format!("{}TTC8434R", self.tr_prefix());
        let body = self
            .get_json(
                "/uapi/domestic-stock/v1/trading/inquire-balance",
                creds,
                &tr_id,
                &[
                    ("CANO", cano),
                    ("ACNT_PRDT_CD", product),
                    ("AFHR_FLPR_YN", "N"),
                    ("OFL_YN", ""),
                    ("INQR_DVSN", "02"),
                    ("UNPR_DVSN", "01"),
                    ("FUND_STTL_ICLD_YN", "N"),
                    ("FNCG_AMT_AUTO_RDPT_YN", "N"),
                    ("PRCS_DVSN", "01"),
                    ("CTX_AREA_FK100", ""),
                    ("CTX_AREA_NK100", ""),
                ],
            )
            .await?;
        self.check_business_status(&body)?;

        let summary = body
            .get("output2")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .cloned()
            .unwrap_or(Value::Null);
        Ok(json!({
            "cash": summary.get("dnca_tot_amt").cloned().unwrap_or(Value::Null),
            "total_eval": summary.get("tot_evlu_amt").cloned().unwrap_or(Value::Null),
        }))
    }

    async fn current_price(&self, creds: &BrokerCredentials, code: &str) -> Result<Value> {
        let body = self
            .get_json(
                "/uapi/domestic-stock/v1/quotations/inquire-price",
                creds,
                "FHKST01010100",
                &[
                    ("fid_cond_mrkt_div_code", "J"),
                    ("fid_input_iscd", code),
                ],
            )
            .await?;
        self.check_business_status(&body)?;
        Ok(body.get("output").cloned().unwrap_or(Value::Null))
    }

    async fn financial_ratios(&self, creds: &BrokerCredentials, code: &str) -> Result<Value> {
        let body = self
            .get_json(
                "/uapi/domestic-stock/v1/finance/financial-ratio",
                creds,
                "FHKST66430300",
                &[
                    ("FID_DIV_CLS_CODE", "0"),
                    ("fid_cond_mrkt_div_code", "J"),
                    ("fid_input_iscd", code),
                ],
            )
            .await?;
        self.check_business_status(&body)?;
        Ok(body.get("output").cloned().unwrap_or(Value::Null))
    }

    async fn place_order(
        &self,
        creds: &BrokerCredentials,
        ticket: &OrderTicket,
    ) -> Result<OrderReceipt> {
        let (cano, product) = creds.account_parts()?;
        let payload = json!({
            "CANO": cano,
            "ACNT_PRDT_CD": product,
            "PDNO": ticket.instrument_code,
            "ORD_DVSN": ticket.division(),
            "ORD_QTY": ticket.quantity.to_string(),
            "ORD_UNPR": ticket.unit_price(),
        });

        let url = format!("{}/uapi/domestic-stock/v1/trading/order-cash", self.base_url);
        debug!(
            code = %ticket.instrument_code,
            side = %ticket.side,
            quantity = ticket.quantity,
            "placing order"
        );

        let response = self
            .client
            .post(&url)
            .header("authorization", format!("Bearer {}", creds.bearer()?))
            .header("appkey", &creds.app_key)
            .header("appsecret", &creds.app_secret)
            .header("tr_id", self.order_tr_id(ticket.side))
            .json(&payload)
            .send()
            .await
            .map_err(|e| OrchestrationError::OrderFailure(format!("order request failed: {}", e)))?;

        let body: Value = response.json().await.map_err(|e| {
            OrchestrationError::OrderFailure(format!("order response parse failed: {}", e))
        })?;

        let rt_cd = body.get("rt_cd").and_then(Value::as_str).unwrap_or("");
        let message = body
            .get("msg1")
            .and_then(Value::as_str)
            .unwrap_or("no broker message")
            .trim()
            .to_string();

        if rt_cd == "0" {
            let order_no = body
                .get("output")
                .and_then(|o| o.get("ODNO"))
                .and_then(Value::as_str)
                .map(String::from);
            Ok(OrderReceipt { order_no, message })
        } else if self.is_expired_message(&message) {
            Err(OrchestrationError::CredentialExpired(message))
        } else {
            Err(OrchestrationError::OrderFailure(message))
        }
    }
}

//
// ================= Credential store =================
//

#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    async fn fetch(&self, user_id: i64) -> Result<Option<BrokerCredentials>>;
    async fn store_token(&self, user_id: i64, access_token: &str) -> Result<()>;
}

pub struct InMemoryCredentialStore {
    records: Arc<RwLock<HashMap<i64, BrokerCredentials>>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn insert(&self, creds: BrokerCredentials) {
        let mut records = self.records.write().await;
        records.insert(creds.user_id, creds);
    }
}

impl Default for InMemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn fetch(&self, user_id: i64) -> Result<Option<BrokerCredentials>> {
        let records = self.records.read().await;
        Ok(records.get(&user_id).cloned())
    }

    async fn store_token(&self, user_id: i64, access_token: &str) -> Result<()> {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&user_id) {
            record.access_token = Some(access_token.to_string());
            record.token_issued_at = Some(Utc::now());
        }
        Ok(())
    }
}

pub struct PostgresCredentialStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresCredentialStore {
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| {
                OrchestrationError::Database(format!("credential pool init failed: {}", e))
            })?;
        Ok(Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS broker_credentials (
                      user_id BIGINT PRIMARY KEY,
                      app_key TEXT NOT NULL,
                      app_secret TEXT NOT NULL,
                      account_no TEXT NOT NULL,
                      access_token TEXT,
                      token_issued_at TIMESTAMPTZ
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;
                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestrationError::Database(format!(
                    "Failed to initialize credential schema: {}",
                    e
                ))
            })?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl CredentialStore for PostgresCredentialStore {
    async fn fetch(&self, user_id: i64) -> Result<Option<BrokerCredentials>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            SELECT user_id, app_key, app_secret, account_no, access_token, token_issued_at
            FROM broker_credentials WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| OrchestrationError::Database(format!("credential fetch failed: {}", e)))?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(BrokerCredentials {
            user_id: row.try_get("user_id").unwrap_or(user_id),
            app_key: row.try_get("app_key").unwrap_or_default(),
            app_secret: row.try_get("app_secret").unwrap_or_default(),
            account_no: row.try_get("account_no").unwrap_or_default(),
            access_token: row.try_get("access_token").ok(),
            token_issued_at: row.try_get("token_issued_at").ok(),
        }))
    }

    async fn store_token(&self, user_id: i64, access_token: &str) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            UPDATE broker_credentials
            SET access_token = $2, token_issued_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(access_token)
        .execute(&self.pool)
        .await
        .map_err(|e| OrchestrationError::Database(format!("token store failed: {}", e)))?;

        debug!(
            user_id,
            fingerprint = %token_fingerprint(access_token),
            "access token persisted"
        );
        Ok(())
    }
}

//
// ================= Mock brokerage =================
//

/// Scripted outcome for one `place_order` call.
#[derive(Debug, Clone)]
pub enum MockOrderOutcome {
    Accept(String),
    Expired(String),
    Reject(String),
}

/// Test/demo brokerage with scripted order outcomes and call counters.
pub struct MockBrokerage {
    order_outcomes: Mutex<VecDeque<MockOrderOutcome>>,
    place_calls: AtomicUsize,
    tokens_issued: AtomicUsize,
    balance_payload: Value,
    price_payload: Value,
}

impl MockBrokerage {
    pub fn new() -> Self {
        Self {
            order_outcomes: Mutex::new(VecDeque::new()),
            place_calls: AtomicUsize::new(0),
            tokens_issued: AtomicUsize::new(0),
            balance_payload: json!({"cash": "1000000", "total_eval": "1500000"}),
            price_payload: json!({"stck_prpr": "71000"}),
        }
    }

    pub fn with_order_outcomes(mut self, outcomes: Vec<MockOrderOutcome>) -> Self {
        self.order_outcomes.get_mut().extend(outcomes);
        self
    }

    pub fn place_calls(&self) -> usize {
        self.place_calls.load(Ordering::SeqCst)
    }

    pub fn tokens_issued(&self) -> usize {
        self.tokens_issued.load(Ordering::SeqCst)
    }
}

impl Default for MockBrokerage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Brokerage for MockBrokerage {
    async fn issue_token(&self, _app_key: &str, _app_secret: &str) -> Result<String> {
        let n = self.tokens_issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("mock-token-{}", n))
    }

    async fn balance(&self, creds: &BrokerCredentials) -> Result<Value> {
        creds.bearer()?;
        Ok(self.balance_payload.clone())
    }

    async fn current_price(&self, creds: &BrokerCredentials, _code: &str) -> Result<Value> {
        creds.bearer()?;
        Ok(self.price_payload.clone())
    }

    async fn financial_ratios(&self, creds: &BrokerCredentials, _code: &str) -> Result<Value> {
        creds.bearer()?;
        Ok(json!([{"stac_yymm": "202412", "roe_val": "8.51", "eps": "4950"}]))
    }

    async fn place_order(
        &self,
        creds: &BrokerCredentials,
        _ticket: &OrderTicket,
    ) -> Result<OrderReceipt> {
        creds.bearer()?;
        self.place_calls.fetch_add(1, Ordering::SeqCst);

        let outcome = {
            let mut queue = self.order_outcomes.lock().await;
            queue.pop_front()
        };
        match outcome {
            None => Ok(OrderReceipt {
                order_no: Some("0000117057".to_string()),
                message: "주문이 정상 처리되었습니다".to_string(),
            }),
            Some(MockOrderOutcome::Accept(message)) => Ok(OrderReceipt {
                order_no: Some("0000117057".to_string()),
                message,
            }),
            Some(MockOrderOutcome::Expired(message)) => {
                warn!("mock brokerage: expired token response");
                Err(OrchestrationError::CredentialExpired(message))
            }
            Some(MockOrderOutcome::Reject(message)) => {
                Err(OrchestrationError::OrderFailure(message))
            }
        }
    }
}
