// =============================================================================
// DecisionStage — BatchDecision and DebateDecision (§4.9)
// =============================================================================
//
// Both variants build a prompt, bind it to a `StructuredLlm<T>` under a
// per-phase timeout with an all-`wait` (or all-neutral) fallback, and run the
// result through the shared post-processing pipeline (§4.9.3) before writing
// `State.batch_decision`. DebateDecision additionally populates
// `State.debate_decision`. The two variants are separate `Stage`
// implementations sharing the name `"decision"` — the scheduler picks one per
// bot at construction time from `ConfigCenter::debate().enabled`, matching
// the specification's "two variants" framing rather than branching inside a
// single stage.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use crate::llm::{invoke_or_fallback, ChatMessage, HttpStructuredLlm, LlmProvider, StructuredLlm};
use crate::pipeline::{Stage, StageOutcome};
use crate::state::{
    AnalystOutput, BatchDecisionResult, DebateDecisionResult, DecisionAction, PortfolioDecision, RiskLimits, Side,
    State, TraderSuggestion,
};

// =============================================================================
// Shared prompt context
// =============================================================================

fn account_and_position_text(state: &State) -> String {
    let mut text = String::new();
    if let Some(perf) = &state.performance {
        text.push_str(&perf.to_prompt_text());
        text.push('\n');
    }
    text.push_str(&format!("Free balance: {:.2} USDT\n", state.account.free_balance("USDT")));

    if state.positions.is_empty() {
        text.push_str("No open positions.\n");
    } else {
        for pos in &state.positions {
            let pnl = state.market_data.get(&pos.symbol).map(|d| pos.unrealized_pnl_pct(d.current_price));
            text.push_str(&format!(
                "Position {} side={:?} entry={:.4} leverage={:.1}x pnl={}\n",
                pos.symbol,
                pos.side,
                pos.entry_price,
                pos.leverage,
                pnl.map(|p| format!("{p:.2}%")).unwrap_or_else(|| "unknown".to_string())
            ));
        }
    }

    if !state.alerts.is_empty() {
        text.push_str("Alerts from the previous cycle (avoid repeating these mistakes):\n");
        for alert in &state.alerts {
            text.push_str(&format!("- {alert}\n"));
        }
    }

    text
}

fn candidate_symbols_text(state: &State) -> String {
    let mut text = String::from("Candidate symbols:\n");
    for symbol in &state.symbols {
        if let Some(data) = state.market_data.get(symbol) {
            text.push_str(&format!(
                "- {symbol}: quant_score={:.1} funding_rate={:.4}% current_price={:.4}\n",
                data.quant_score.unwrap_or(0.0),
                data.funding_rate,
                data.current_price
            ));
        }
    }
    text
}

fn risk_constraints_text(risk_limits: &RiskLimits) -> String {
    format!(
        "Risk constraints: max_single_allocation_pct={:.1} max_total_allocation_pct={:.1} \
         max_leverage={:.1} min_risk_reward_ratio={:.2} max_funding_rate_pct={:.3}\n",
        risk_limits.max_single_allocation_pct,
        risk_limits.max_total_allocation_pct,
        risk_limits.max_leverage,
        risk_limits.min_risk_reward_ratio,
        risk_limits.max_funding_rate_pct,
    )
}

fn all_wait(symbols: &[String], reason: &str) -> BatchDecisionResult {
    BatchDecisionResult {
        decisions: symbols
            .iter()
            .map(|s| PortfolioDecision {
                symbol: s.clone(),
                action: DecisionAction::Wait,
                allocation_pct: 0.0,
                leverage: 1.0,
                stop_loss: None,
                take_profit: None,
                confidence: 0,
                reasoning: reason.to_string(),
                priority: 100,
            })
            .collect(),
        total_allocation_pct: 0.0,
        cash_reserve_pct: 100.0,
        strategy_rationale: reason.to_string(),
    }
}

// =============================================================================
// Post-processing (§4.9.3) — shared by both variants
// =============================================================================

/// Applies forced-close injection, the symbol whitelist, per-symbol and
/// total allocation caps, and recomputes totals. Does not clear
/// `State.alerts` — the caller does that once it has consumed this result.
pub fn normalize_decisions(result: BatchDecisionResult, state: &State, risk_limits: &RiskLimits) -> BatchDecisionResult {
    let mut forced = Vec::new();
    let mut forced_symbols = HashSet::new();

    for pos in &state.positions {
        let Some(data) = state.market_data.get(&pos.symbol) else {
            continue;
        };
        if data.current_price <= 0.0 {
            continue;
        }
        let pnl_pct = pos.unrealized_pnl_pct(data.current_price);
        if pnl_pct <= -3.0 {
            let action = match pos.side {
                Side::Buy => DecisionAction::CloseLong,
                Side::Sell => DecisionAction::CloseShort,
            };
            forced.push(PortfolioDecision {
                symbol: pos.symbol.clone(),
                action,
                allocation_pct: 0.0,
                leverage: pos.leverage,
                stop_loss: None,
                take_profit: None,
                confidence: 100,
                reasoning: format!("forced close: unrealized pnl {pnl_pct:.2}% breached the -3% threshold"),
                priority: 0,
            });
            forced_symbols.insert(pos.symbol.clone());
        }
    }

    let mut decisions: Vec<PortfolioDecision> = result.decisions.into_iter().filter(|d| !forced_symbols.contains(&d.symbol)).collect();

    // Whitelist: drop hallucinated symbols. Forced closes are exempt — they
    // close real risk regardless of whether FilterStage kept the symbol in
    // this cycle's universe.
    decisions.retain(|d| state.symbols.contains(&d.symbol));

    let mut combined = forced;
    combined.append(&mut decisions);

    for d in combined.iter_mut() {
        if d.action.is_actionable() {
            d.allocation_pct = d.allocation_pct.clamp(0.0, risk_limits.max_single_allocation_pct);
        }
    }

    let total: f64 = combined.iter().filter(|d| d.action.is_actionable()).map(|d| d.allocation_pct).sum();
    if total > risk_limits.max_total_allocation_pct && total > 0.0 {
        let scale = risk_limits.max_total_allocation_pct / total;
        for d in combined.iter_mut() {
            if d.action.is_actionable() {
                d.allocation_pct *= scale;
            }
        }
    }

    let total_allocation_pct: f64 = combined.iter().filter(|d| d.action.is_actionable()).map(|d| d.allocation_pct).sum();

    BatchDecisionResult {
        decisions: combined,
        total_allocation_pct,
        cash_reserve_pct: 100.0 - total_allocation_pct,
        strategy_rationale: result.strategy_rationale,
    }
}

// =============================================================================
// 4.9.1 BatchDecision
// =============================================================================

pub struct BatchDecision {
    llm: Arc<dyn StructuredLlm<BatchDecisionResult>>,
    timeout: Duration,
}

impl BatchDecision {
    pub fn new(llm: Arc<dyn StructuredLlm<BatchDecisionResult>>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    pub async fn run(&self, state: &State, risk_limits: &RiskLimits) -> BatchDecisionResult {
        let mut prompt = account_and_position_text(state);
        prompt.push_str(&candidate_symbols_text(state));
        prompt.push_str(&risk_constraints_text(risk_limits));
        prompt.push_str("Respond with a BatchDecisionResult JSON: one decision per candidate symbol worth acting on.");

        let messages = [
            ChatMessage::system("You are a disciplined perpetual-futures portfolio manager. Protect capital first."),
            ChatMessage::user(prompt),
        ];

        let symbols = state.symbols.clone();
        let raw = invoke_or_fallback(self.llm.as_ref(), &messages, self.timeout, move || {
            all_wait(&symbols, "LLM call failed or timed out; holding all positions")
        })
        .await;

        normalize_decisions(raw, state, risk_limits)
    }
}

// =============================================================================
// 4.9.2 DebateDecision
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
struct Opinion {
    opinion: String,
}

pub struct DebateDecision {
    analyst_llm: Arc<dyn StructuredLlm<Vec<AnalystOutput>>>,
    opinion_llm: Arc<dyn StructuredLlm<Opinion>>,
    suggestion_llm: Arc<dyn StructuredLlm<TraderSuggestion>>,
    risk_llm: Arc<dyn StructuredLlm<BatchDecisionResult>>,
    timeout_per_phase: Duration,
    max_rounds: u32,
}

impl DebateDecision {
    pub fn new(
        analyst_llm: Arc<dyn StructuredLlm<Vec<AnalystOutput>>>,
        opinion_llm: Arc<dyn StructuredLlm<Opinion>>,
        suggestion_llm: Arc<dyn StructuredLlm<TraderSuggestion>>,
        risk_llm: Arc<dyn StructuredLlm<BatchDecisionResult>>,
        timeout_per_phase: Duration,
        max_rounds: u32,
    ) -> Self {
        Self {
            analyst_llm,
            opinion_llm,
            suggestion_llm,
            risk_llm,
            timeout_per_phase,
            max_rounds: max_rounds.max(1),
        }
    }

    async fn run_analyst(&self, state: &State) -> Vec<AnalystOutput> {
        let messages = [
            ChatMessage::system("You are a market analyst. Assess trend direction for each candidate symbol."),
            ChatMessage::user(candidate_symbols_text(state)),
        ];
        let symbols = state.symbols.clone();
        invoke_or_fallback(self.analyst_llm.as_ref(), &messages, self.timeout_per_phase, move || {
            symbols
                .iter()
                .map(|s| AnalystOutput {
                    symbol: s.clone(),
                    trend: "neutral".to_string(),
                    key_levels: Vec::new(),
                    summary: "analyst fallback: no data".to_string(),
                })
                .collect()
        })
        .await
    }

    async fn round_opinion(&self, role: &str, symbol: &str, round: u32, opponent_opinion: &str) -> String {
        let prompt = format!(
            "Symbol: {symbol}. Debate round {round}. You are the {role} trader. \
             Opponent's last opinion: \"{opponent_opinion}\". Respond with your own short opinion."
        );
        let messages = [ChatMessage::system(format!("You are the {role} trader in a structured debate.")), ChatMessage::user(prompt)];
        invoke_or_fallback(self.opinion_llm.as_ref(), &messages, self.timeout_per_phase, || Opinion {
            opinion: format!("{role} fallback: no strong view this round"),
        })
        .await
        .opinion
    }

    async fn final_suggestion(&self, role: &str, symbol: &str, bull_opinion: &str, bear_opinion: &str) -> TraderSuggestion {
        let prompt = format!(
            "Symbol: {symbol}. Final round. You are the {role} trader. Bull's last opinion: \"{bull_opinion}\". \
             Bear's last opinion: \"{bear_opinion}\". Emit your trade suggestion."
        );
        let messages = [ChatMessage::system(format!("You are the {role} trader concluding the debate.")), ChatMessage::user(prompt)];
        invoke_or_fallback(self.suggestion_llm.as_ref(), &messages, self.timeout_per_phase, || TraderSuggestion {
            symbol: symbol.to_string(),
            action: "wait".to_string(),
            confidence: 0,
            allocation_pct: 0.0,
            stop_loss_pct: 0.0,
            take_profit_pct: 0.0,
            reasoning: format!("{role} fallback: no suggestion"),
        })
        .await
    }

    async fn run_risk_manager(&self, state: &State, risk_limits: &RiskLimits, bull: &[TraderSuggestion], bear: &[TraderSuggestion]) -> BatchDecisionResult {
        let mut prompt = account_and_position_text(state);
        prompt.push_str(&candidate_symbols_text(state));
        prompt.push_str(&risk_constraints_text(risk_limits));
        prompt.push_str("Bull suggestions:\n");
        for s in bull {
            prompt.push_str(&format!("- {} {} conf={} alloc={:.1}%: {}\n", s.symbol, s.action, s.confidence, s.allocation_pct, s.reasoning));
        }
        prompt.push_str("Bear suggestions:\n");
        for s in bear {
            prompt.push_str(&format!("- {} {} conf={} alloc={:.1}%: {}\n", s.symbol, s.action, s.confidence, s.allocation_pct, s.reasoning));
        }
        prompt.push_str("Resolve the debate into a single BatchDecisionResult.");

        let messages = [
            ChatMessage::system("You are the risk manager. Resolve the bull/bear debate into final decisions, protecting capital first."),
            ChatMessage::user(prompt),
        ];
        let symbols = state.symbols.clone();
        invoke_or_fallback(self.risk_llm.as_ref(), &messages, self.timeout_per_phase, move || {
            all_wait(&symbols, "risk manager call failed or timed out; holding all positions")
        })
        .await
    }

    pub async fn run(&self, state: &State, risk_limits: &RiskLimits) -> DebateDecisionResult {
        let analyst_outputs = self.run_analyst(state).await;

        let mut bull_suggestions = Vec::with_capacity(state.symbols.len());
        let mut bear_suggestions = Vec::with_capacity(state.symbols.len());
        let mut debate_rounds = Vec::new();

        for symbol in &state.symbols {
            let mut bull_opinion = String::new();
            let mut bear_opinion = String::new();

            for round in 1..=self.max_rounds {
                if round == self.max_rounds {
                    let (bull_sugg, bear_sugg) = tokio::join!(
                        self.final_suggestion("bull", symbol, &bull_opinion, &bear_opinion),
                        self.final_suggestion("bear", symbol, &bull_opinion, &bear_opinion),
                    );
                    bull_suggestions.push(bull_sugg);
                    bear_suggestions.push(bear_sugg);
                } else {
                    let (next_bull, next_bear) = tokio::join!(
                        self.round_opinion("bull", symbol, round, &bear_opinion),
                        self.round_opinion("bear", symbol, round, &bull_opinion),
                    );
                    debate_rounds.push(format!("{symbol} round {round} bull: {next_bull}"));
                    debate_rounds.push(format!("{symbol} round {round} bear: {next_bear}"));
                    bull_opinion = next_bull;
                    bear_opinion = next_bear;
                }
            }
        }

        let risk_result = self.run_risk_manager(state, risk_limits, &bull_suggestions, &bear_suggestions).await;
        let final_decision = normalize_decisions(risk_result, state, risk_limits);

        DebateDecisionResult {
            analyst_outputs,
            bull_suggestions,
            bear_suggestions,
            debate_rounds,
            debate_summary: format!(
                "{} symbols debated over {} round(s); risk manager produced {} decision(s)",
                state.symbols.len(),
                self.max_rounds,
                final_decision.decisions.len()
            ),
            final_decision,
            completed_at: Utc::now(),
        }
    }
}

// =============================================================================
// Construction — hides `Opinion` (private to this module) behind one call so
// the scheduler only ever deals with an `LlmProvider` (§6, §9).
// =============================================================================

pub fn build_batch_decision(provider: LlmProvider, timeout_seconds: u64) -> BatchDecision {
    let llm: Arc<dyn StructuredLlm<BatchDecisionResult>> = Arc::new(HttpStructuredLlm::new(provider));
    BatchDecision::new(llm, Duration::from_secs(timeout_seconds))
}

pub fn build_debate_decision(provider: LlmProvider, timeout_per_phase_seconds: u64, max_rounds: u32) -> DebateDecision {
    let analyst_llm: Arc<dyn StructuredLlm<Vec<AnalystOutput>>> = Arc::new(HttpStructuredLlm::new(provider.clone()));
    let opinion_llm: Arc<dyn StructuredLlm<Opinion>> = Arc::new(HttpStructuredLlm::new(provider.clone()));
    let suggestion_llm: Arc<dyn StructuredLlm<TraderSuggestion>> = Arc::new(HttpStructuredLlm::new(provider.clone()));
    let risk_llm: Arc<dyn StructuredLlm<BatchDecisionResult>> = Arc::new(HttpStructuredLlm::new(provider));
    DebateDecision::new(analyst_llm, opinion_llm, suggestion_llm, risk_llm, Duration::from_secs(timeout_per_phase_seconds), max_rounds)
}

// =============================================================================
// Pipeline stages
// =============================================================================

pub struct BatchDecisionStage {
    decision: BatchDecision,
    risk_limits: RiskLimits,
}

impl BatchDecisionStage {
    pub fn new(decision: BatchDecision, risk_limits: RiskLimits) -> Self {
        Self { decision, risk_limits }
    }
}

#[async_trait]
impl Stage for BatchDecisionStage {
    fn name(&self) -> &'static str {
        "decision"
    }

    fn requires(&self) -> &'static [&'static str] {
        &["filtered_symbols"]
    }

    async fn run(&self, state: &mut State) -> anyhow::Result<StageOutcome> {
        let result = self.decision.run(state, &self.risk_limits).await;
        info!(bot_id = state.bot_id, decisions = result.decisions.len(), "batch decision produced");
        state.batch_decision = Some(result);
        state.alerts.clear();
        Ok(StageOutcome::Continue)
    }
}

pub struct DebateDecisionStage {
    decision: DebateDecision,
    risk_limits: RiskLimits,
}

impl DebateDecisionStage {
    pub fn new(decision: DebateDecision, risk_limits: RiskLimits) -> Self {
        Self { decision, risk_limits }
    }
}

#[async_trait]
impl Stage for DebateDecisionStage {
    fn name(&self) -> &'static str {
        "decision"
    }

    fn requires(&self) -> &'static [&'static str] {
        &["filtered_symbols"]
    }

    async fn run(&self, state: &mut State) -> anyhow::Result<StageOutcome> {
        let result = self.decision.run(state, &self.risk_limits).await;
        info!(bot_id = state.bot_id, decisions = result.final_decision.decisions.len(), "debate decision produced");
        state.batch_decision = Some(result.final_decision.clone());
        state.debate_decision = Some(result);
        state.alerts.clear();
        Ok(StageOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{OrderType, Position, PositionStatus, SymbolMarketData};

    fn position(symbol: &str, side: Side, entry: f64) -> Position {
        Position {
            id: "p1".to_string(),
            symbol: symbol.to_string(),
            side,
            position_type: OrderType::Market,
            status: PositionStatus::Open,
            entry_price: entry,
            current_average: entry,
            amount: 1.0,
            leverage: 1.0,
            stop_loss_price: None,
            take_profit_price: None,
        }
    }

    fn decision(symbol: &str, action: DecisionAction, allocation_pct: f64) -> PortfolioDecision {
        PortfolioDecision {
            symbol: symbol.to_string(),
            action,
            allocation_pct,
            leverage: 3.0,
            stop_loss: None,
            take_profit: None,
            confidence: 80,
            reasoning: "test".to_string(),
            priority: 50,
        }
    }

    // S1 — forced close takes priority over a conflicting AI decision.
    #[test]
    fn forced_close_overrides_conflicting_open() {
        let mut state = State::new(1, "test".to_string(), 1000.0, Vec::new());
        state.symbols = vec!["BTCUSDT".to_string()];
        state.positions = vec![position("BTCUSDT", Side::Buy, 100.0)];
        state.market_data.insert(
            "BTCUSDT".to_string(),
            SymbolMarketData {
                current_price: 96.0,
                ..Default::default()
            },
        );

        let raw = BatchDecisionResult {
            decisions: vec![decision("BTCUSDT", DecisionAction::OpenLong, 30.0)],
            total_allocation_pct: 30.0,
            cash_reserve_pct: 70.0,
            strategy_rationale: "llm said open".to_string(),
        };

        let result = normalize_decisions(raw, &state, &RiskLimits::default());

        assert_eq!(result.decisions.len(), 1);
        assert_eq!(result.decisions[0].action, DecisionAction::CloseLong);
        assert_eq!(result.decisions[0].priority, 0);
        assert_eq!(result.decisions[0].confidence, 100);
    }

    // S2 — allocation normalization.
    #[test]
    fn allocation_caps_apply_per_symbol_then_total() {
        let mut state = State::new(1, "test".to_string(), 1000.0, Vec::new());
        state.symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];

        let mut limits = RiskLimits::default();
        limits.max_total_allocation_pct = 80.0;
        limits.max_single_allocation_pct = 40.0;

        let raw = BatchDecisionResult {
            decisions: vec![decision("BTCUSDT", DecisionAction::OpenLong, 50.0), decision("ETHUSDT", DecisionAction::OpenLong, 50.0)],
            total_allocation_pct: 100.0,
            cash_reserve_pct: 0.0,
            strategy_rationale: "llm".to_string(),
        };

        let result = normalize_decisions(raw, &state, &limits);

        let btc = result.decisions.iter().find(|d| d.symbol == "BTCUSDT").unwrap();
        let eth = result.decisions.iter().find(|d| d.symbol == "ETHUSDT").unwrap();
        assert!((btc.allocation_pct - 40.0).abs() < 1e-9);
        assert!((eth.allocation_pct - 40.0).abs() < 1e-9);
        assert!((result.total_allocation_pct - 80.0).abs() < 1e-9);
        assert!((result.cash_reserve_pct - 20.0).abs() < 1e-9);
    }

    #[test]
    fn whitelist_drops_hallucinated_symbols() {
        let mut state = State::new(1, "test".to_string(), 1000.0, Vec::new());
        state.symbols = vec!["BTCUSDT".to_string()];

        let raw = BatchDecisionResult {
            decisions: vec![decision("DOGEUSDT", DecisionAction::OpenLong, 10.0)],
            total_allocation_pct: 10.0,
            cash_reserve_pct: 90.0,
            strategy_rationale: "llm".to_string(),
        };

        let result = normalize_decisions(raw, &state, &RiskLimits::default());
        assert!(result.decisions.is_empty());
    }

    struct AlwaysErrors;

    #[async_trait]
    impl StructuredLlm<BatchDecisionResult> for AlwaysErrors {
        async fn invoke(&self, _messages: &[ChatMessage], _timeout: Duration) -> anyhow::Result<BatchDecisionResult> {
            anyhow::bail!("provider down")
        }
    }

    #[tokio::test]
    async fn batch_decision_falls_back_to_all_wait_on_llm_failure() {
        let decision = BatchDecision::new(Arc::new(AlwaysErrors), Duration::from_secs(1));
        let mut state = State::new(1, "test".to_string(), 1000.0, Vec::new());
        state.symbols = vec!["BTCUSDT".to_string()];

        let result = decision.run(&state, &RiskLimits::default()).await;

        assert_eq!(result.decisions.len(), 1);
        assert_eq!(result.decisions[0].action, DecisionAction::Wait);
    }
}
