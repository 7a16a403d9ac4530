//! Proposal extraction from strategy output
//!
//! A dedicated JSON-only model call turns the strategy specialist's latest
//! payload plus the user's request into an order, or into an explicit
//! `no_action`. Anything that fails extraction or validation yields no
//! proposal; the coordinator then answers normally.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::llm::{parse_structured, ChatMessage, LanguageModel};
use crate::models::{InstrumentContext, OrderKind, OrderSide, TradingProposal};
use crate::Result;

#[derive(Debug, Deserialize)]
struct ExtractionReply {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    instrument_code: Option<String>,
    #[serde(default)]
    side: Option<String>,
    #[serde(default)]
    order_kind: Option<String>,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    quantity: Option<u32>,
    #[serde(default)]
    rationale: Option<String>,
}

pub struct ProposalExtractor {
    model: Arc<dyn LanguageModel>,
}

impl ProposalExtractor {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Returns a validated proposal, or `None` when the strategy output
    /// and request do not amount to an executable order.
    pub async fn extract(
        &self,
        user_message: &str,
        strategy_payload: &str,
        instrument: Option<&InstrumentContext>,
    ) -> Result<Option<TradingProposal>> {
        let system = self.system_prompt(instrument);
        let content = format!(
            "Strategy specialist's latest analysis:\n{}\n\nUser's request:\n{}",
            strategy_payload, user_message
        );
        let turn = self
            .model
            .complete(&system, &[ChatMessage::user(content)], &[])
            .await?;

        let raw = turn.text.unwrap_or_default();
        let reply: ExtractionReply = match parse_structured(&raw) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "proposal extraction unparseable, no proposal");
                return Ok(None);
            }
        };

        Ok(self.assemble(reply, strategy_payload, instrument))
    }

    fn assemble(
        &self,
        reply: ExtractionReply,
        strategy_payload: &str,
        instrument: Option<&InstrumentContext>,
    ) -> Option<TradingProposal> {
        if reply.action.as_deref() == Some("no_action") {
            info!("strategy output carries no executable order");
            return None;
        }

        let code = reply
            .instrument_code
            .filter(|c| c.len() == 6 && c.bytes().all(|b| b.is_ascii_digit()))
            .or_else(|| instrument.map(|i| i.code.clone()))?;
        let side = match reply.side.as_deref() {
            Some("buy") | Some("매수") => OrderSide::Buy,
            Some("sell") | Some("매도") => OrderSide::Sell,
            other => {
                warn!(side = ?other, "unusable order side, no proposal");
                return None;
            }
        };
        let kind = match reply.order_kind.as_deref() {
            Some("limit") => OrderKind::Limit,
            Some("market") => OrderKind::Market,
            // Unstated kind follows the price: a priced order is a limit order.
            None => {
                if reply.price.is_some() {
                    OrderKind::Limit
                } else {
                    OrderKind::Market
                }
            }
            other => {
                warn!(order_kind = ?other, "unusable order kind, no proposal");
                return None;
            }
        };
        let quantity = match reply.quantity {
            Some(q) if q > 0 => q,
            _ => {
                warn!("missing or zero quantity, no proposal");
                return None;
            }
        };
        let price = match kind {
            OrderKind::Limit => reply.price,
            OrderKind::Market => None,
        };

        let mut proposal = TradingProposal::new(code, side, kind, price, quantity);
        proposal.rationale = reply
            .rationale
            .filter(|r| !r.trim().is_empty())
            .or_else(|| Some(snippet(strategy_payload, 200)));

        match proposal.validate() {
            Ok(()) => Some(proposal),
            Err(e) => {
                warn!(error = %e, "extracted proposal failed validation");
                None
            }
        }
    }

    fn system_prompt(&self, instrument: Option<&InstrumentContext>) -> String {
        let hint = instrument
            .map(|i| format!("The thread is about {} (code {}).", i.name, i.code))
            .unwrap_or_else(|| "No instrument is resolved for this thread.".to_string());

        format!(
            r#"You extract an executable stock order from a strategy analysis.
{}

If the user is asking to place the recommended trade, return the order.
If they are not, or the analysis recommends holding, return no_action.

Return ONLY valid JSON, no explanation:
{{
  "action": "order" | "no_action",
  "instrument_code": "<6-digit code>",
  "side": "buy" | "sell",
  "order_kind": "market" | "limit",
  "price": <number, only for limit orders>,
  "quantity": <positive integer>,
  "rationale": "<one-sentence reason>"
}}"#,
            hint
        )
    }
}

fn snippet(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ScriptedModel, ScriptedTurn};
    use crate::models::ProposalStatus;

    fn instrument() -> InstrumentContext {
        InstrumentContext {
            name: "삼성전자".to_string(),
            code: "005930".to_string(),
            graph_context: None,
        }
    }

    async fn extract(reply: &str) -> Option<TradingProposal> {
        let model = Arc::new(ScriptedModel::sequential(vec![ScriptedTurn::text(reply)]));
        ProposalExtractor::new(model)
            .extract("추천대로 사줘", "매수 추천: 주가 상승 여력", Some(&instrument()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn extracts_market_buy_with_fallback_rationale() {
        let proposal = extract(
            r#"{"action": "order", "side": "buy", "order_kind": "market", "quantity": 10}"#,
        )
        .await
        .unwrap();

        assert_eq!(proposal.instrument_code, "005930");
        assert_eq!(proposal.side, OrderSide::Buy);
        assert_eq!(proposal.order_kind, OrderKind::Market);
        assert_eq!(proposal.quantity, 10);
        assert!(proposal.price.is_none());
        assert_eq!(proposal.status, ProposalStatus::Proposed);
        assert!(proposal.rationale.unwrap().contains("매수 추천"));
    }

    #[tokio::test]
    async fn fenced_reply_with_limit_price_parses() {
        let proposal = extract(
            "```json\n{\"action\": \"order\", \"instrument_code\": \"035420\", \"side\": \"sell\", \"price\": 210000, \"quantity\": 3}\n```",
        )
        .await
        .unwrap();

        assert_eq!(proposal.instrument_code, "035420");
        // price present and kind unstated -> limit
        assert_eq!(proposal.order_kind, OrderKind::Limit);
        assert_eq!(proposal.price, Some(210000.0));
    }

    #[tokio::test]
    async fn no_action_yields_no_proposal() {
        assert!(extract(r#"{"action": "no_action"}"#).await.is_none());
    }

    #[tokio::test]
    async fn missing_quantity_yields_no_proposal() {
        assert!(
            extract(r#"{"action": "order", "side": "buy", "order_kind": "market"}"#)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn unparseable_reply_yields_no_proposal() {
        assert!(extract("지금은 매수 타이밍이 아닙니다").await.is_none());
    }

    #[tokio::test]
    async fn missing_code_without_thread_instrument_yields_none() {
        let model = Arc::new(ScriptedModel::sequential(vec![ScriptedTurn::text(
            r#"{"action": "order", "side": "buy", "order_kind": "market", "quantity": 5}"#,
        )]));
        let result = ProposalExtractor::new(model)
            .extract("사줘", "매수 추천", None)
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
