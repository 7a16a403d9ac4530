//! Request scope guard
//!
//! Two request families are recognized up front and answered with fixed
//! guide messages instead of being routed: portfolio management and
//! backtesting. Everything else proceeds to routing.

const PORTFOLIO_KEYWORDS: &[&str] = &[
    "포트폴리오", "자산배분", "리밸런싱", "비중 조절",
    "portfolio", "rebalance", "rebalancing", "asset allocation",
];

const BACKTEST_KEYWORDS: &[&str] = &[
    "백테스트", "백테스팅", "과거 수익률 검증", "전략 검증",
    "backtest", "backtesting",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestScope {
    /// Handled by the orchestration pipeline.
    Advisory,
    /// Out of scope; answered with a portfolio guide message.
    PortfolioGuide,
    /// Out of scope; answered with a backtest guide message.
    BacktestGuide,
}

impl RequestScope {
    /// Fixed reply for out-of-scope families; None for advisory requests.
    pub fn guide_message(&self) -> Option<&'static str> {
        match self {
            RequestScope::Advisory => None,
            RequestScope::PortfolioGuide => Some(
                "포트폴리오 구성과 리밸런싱은 별도의 포트폴리오 서비스에서 제공됩니다. \
                 이 채널에서는 개별 종목 분석과 매매 제안만 도와드릴 수 있어요.",
            ),
            RequestScope::BacktestGuide => Some(
                "전략 백테스트는 백테스팅 서비스에서 실행해 주세요. \
                 이 채널에서는 종목 분석 결과를 바탕으로 한 매매 제안까지만 다룹니다.",
            ),
        }
    }
}

/// Scope classifier
pub struct ScopeClassifier;

impl ScopeClassifier {
    /// Classify one user message. Backtest keywords take precedence since
    /// backtest requests often mention portfolios too.
    pub fn classify(message: &str) -> RequestScope {
        let lowered = message.to_lowercase();

        if BACKTEST_KEYWORDS.iter().any(|kw| lowered.contains(*kw)) {
            return RequestScope::BacktestGuide;
        }
        if PORTFOLIO_KEYWORDS.iter().any(|kw| lowered.contains(*kw)) {
            return RequestScope::PortfolioGuide;
        }
        RequestScope::Advisory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_requests_are_advisory() {
        let cases = [
            "삼성전자 분석해줘",
            "SK하이닉스 최근 뉴스 어때?",
            "what is the outlook for NAVER?",
        ];
        for c in cases {
            assert_eq!(ScopeClassifier::classify(c), RequestScope::Advisory);
        }
    }

    #[test]
    fn portfolio_requests_get_guide() {
        let scope = ScopeClassifier::classify("내 포트폴리오 리밸런싱 해줘");
        assert_eq!(scope, RequestScope::PortfolioGuide);
        assert!(scope.guide_message().is_some());
    }

    #[test]
    fn backtest_beats_portfolio_when_both_present() {
        let scope = ScopeClassifier::classify("이 포트폴리오 전략을 백테스트 해줘");
        assert_eq!(scope, RequestScope::BacktestGuide);
    }

    #[test]
    fn advisory_has_no_guide_message() {
        assert!(RequestScope::Advisory.guide_message().is_none());
    }
}
