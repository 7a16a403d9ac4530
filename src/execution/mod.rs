//! Order execution engine
//!
//! Deterministic endpoint of the trade workflow; the model is not
//! consulted here. One approved proposal becomes at most one order
//! placement, plus at most one credential refresh and a single retry when
//! the brokerage signals an expired token.

use std::sync::Arc;
use tracing::{info, warn};

use crate::broker::{
    ensure_token, refresh_token, Brokerage, CredentialStore, OrderReceipt, OrderTicket,
};
use crate::error::OrchestrationError;
use crate::models::TradingProposal;
use crate::Result;

#[derive(Debug)]
pub struct ExecutionOutcome {
    pub receipt: OrderReceipt,
    /// True when the order went through only after a token refresh.
    pub refreshed_credentials: bool,
}

pub struct OrderExecutor {
    brokerage: Arc<dyn Brokerage>,
    credentials: Arc<dyn CredentialStore>,
}

impl OrderExecutor {
    pub fn new(brokerage: Arc<dyn Brokerage>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            brokerage,
            credentials,
        }
    }

    /// Places the approved order for `user_id`.
    ///
    /// An expired-credential signal triggers exactly one refresh and one
    /// retry; a second signal, or any other rejection, fails the order.
    pub async fn execute(
        &self,
        user_id: i64,
        proposal: &TradingProposal,
    ) -> Result<ExecutionOutcome> {
        let mut creds = self
            .credentials
            .fetch(user_id)
            .await?
            .ok_or_else(|| {
                OrchestrationError::OrderFailure(
                    "no brokerage account registered for this user".to_string(),
                )
            })?;
        ensure_token(self.brokerage.as_ref(), self.credentials.as_ref(), &mut creds).await?;

        let ticket = OrderTicket::from_proposal(proposal);
        info!(
            user_id,
            code = %ticket.instrument_code,
            side = %ticket.side,
            quantity = ticket.quantity,
            "placing approved order"
        );

        match self.brokerage.place_order(&creds, &ticket).await {
            Ok(receipt) => Ok(ExecutionOutcome {
                receipt,
                refreshed_credentials: false,
            }),
            Err(OrchestrationError::CredentialExpired(cause)) => {
                warn!(
                    user_id,
                    cause = %cause,
                    "brokerage reported expired credentials, refreshing and retrying once"
                );
                refresh_token(self.brokerage.as_ref(), self.credentials.as_ref(), &mut creds)
                    .await?;

                match self.brokerage.place_order(&creds, &ticket).await {
                    Ok(receipt) => Ok(ExecutionOutcome {
                        receipt,
                        refreshed_credentials: true,
                    }),
                    Err(OrchestrationError::CredentialExpired(second)) => {
                        Err(OrchestrationError::OrderFailure(format!(
                            "credentials still rejected after refresh: {}",
                            second
                        )))
                    }
                    Err(other) => Err(other),
                }
            }
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerCredentials, InMemoryCredentialStore, MockBrokerage, MockOrderOutcome};
    use crate::models::{OrderKind, OrderSide};
    use chrono::Utc;

    fn proposal() -> TradingProposal {
        TradingProposal::new("005930", OrderSide::Buy, OrderKind::Market, None, 10)
    }

    async fn store_with_token(token: Option<&str>) -> Arc<InMemoryCredentialStore> {
        let store = Arc::new(InMemoryCredentialStore::new());
        store
            .insert(BrokerCredentials {
                user_id: 7,
                app_key: "key".to_string(),
                app_secret: "secret".to_string(),
                account_no: "12345678-01".to_string(),
                access_token: token.map(String::from),
                token_issued_at: token.map(|_| Utc::now()),
            })
            .await;
        store
    }

    #[tokio::test]
    async fn order_succeeds_first_try() {
        let brokerage = Arc::new(MockBrokerage::new());
        let executor = OrderExecutor::new(brokerage.clone(), store_with_token(Some("t")).await);

        let outcome = executor.execute(7, &proposal()).await.unwrap();
        assert!(outcome.receipt.order_no.is_some());
        assert!(!outcome.refreshed_credentials);
        assert_eq!(brokerage.place_calls(), 1);
        assert_eq!(brokerage.tokens_issued(), 0);
    }

    #[tokio::test]
    async fn missing_token_is_issued_before_the_order() {
        let brokerage = Arc::new(MockBrokerage::new());
        let store = store_with_token(None).await;
        let executor = OrderExecutor::new(brokerage.clone(), store.clone());

        let outcome = executor.execute(7, &proposal()).await.unwrap();
        assert!(!outcome.refreshed_credentials);
        assert_eq!(brokerage.tokens_issued(), 1);

        let stored = store.fetch(7).await.unwrap().unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("mock-token-1"));
    }

    #[tokio::test]
    async fn expired_token_refreshes_and_retries_once() {
        let brokerage = Arc::new(MockBrokerage::new().with_order_outcomes(vec![
            MockOrderOutcome::Expired("기간이 만료된 token".to_string()),
            MockOrderOutcome::Accept("주문 완료".to_string()),
        ]));
        let store = store_with_token(Some("stale")).await;
        let executor = OrderExecutor::new(brokerage.clone(), store.clone());

        let outcome = executor.execute(7, &proposal()).await.unwrap();
        assert!(outcome.refreshed_credentials);
        assert_eq!(outcome.receipt.message, "주문 완료");
        assert_eq!(brokerage.place_calls(), 2);
        assert_eq!(brokerage.tokens_issued(), 1);

        // the refreshed token was persisted for later requests
        let stored = store.fetch(7).await.unwrap().unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("mock-token-1"));
    }

    #[tokio::test]
    async fn second_expiry_fails_without_third_attempt() {
        let brokerage = Arc::new(MockBrokerage::new().with_order_outcomes(vec![
            MockOrderOutcome::Expired("기간이 만료된 token".to_string()),
            MockOrderOutcome::Expired("유효하지 않은 token".to_string()),
        ]));
        let executor = OrderExecutor::new(brokerage.clone(), store_with_token(Some("t")).await);

        let err = executor.execute(7, &proposal()).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::OrderFailure(_)));
        assert!(err.to_string().contains("after refresh"));
        assert_eq!(brokerage.place_calls(), 2);
        assert_eq!(brokerage.tokens_issued(), 1);
    }

    #[tokio::test]
    async fn business_rejection_does_not_refresh() {
        let brokerage = Arc::new(MockBrokerage::new().with_order_outcomes(vec![
            MockOrderOutcome::Reject("주문가능금액을 초과했습니다".to_string()),
        ]));
        let executor = OrderExecutor::new(brokerage.clone(), store_with_token(Some("t")).await);

        let err = executor.execute(7, &proposal()).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::OrderFailure(_)));
        assert_eq!(brokerage.place_calls(), 1);
        assert_eq!(brokerage.tokens_issued(), 0);
    }

    #[tokio::test]
    async fn unregistered_user_cannot_order() {
        let brokerage = Arc::new(MockBrokerage::new());
        let executor = OrderExecutor::new(
            brokerage.clone(),
            Arc::new(InMemoryCredentialStore::new()),
        );

        let err = executor.execute(99, &proposal()).await.unwrap_err();
        assert!(err.to_string().contains("no brokerage account registered"));
        assert_eq!(brokerage.place_calls(), 0);
    }
}
