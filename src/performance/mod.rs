// =============================================================================
// PerformanceCalc (§4.14)
// =============================================================================
//
// Rolling-window metrics over a bot's closed trade history. Pure function of
// a `TradeHistory` slice — no I/O — so `BacktestEngine`'s MockPerformanceService
// can share this exact implementation (§4.15).
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::state::{TradeHistory, TradeStatus};

pub const DEFAULT_WINDOW: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PerformanceReport {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate_pct: f64,
    pub avg_return_pct: f64,
    pub total_return_usd: f64,
    pub sharpe: f64,
    pub max_drawdown: f64,
    pub profit_factor: f64,
    pub avg_win_pct: f64,
    pub avg_loss_pct: f64,
}

/// Compute a `PerformanceReport` over the most recent `window` closed trades
/// in `trades` (trades is assumed ordered oldest-first; only the tail
/// `window` entries are considered).
pub fn calculate(trades: &[TradeHistory], window: usize) -> PerformanceReport {
    let closed: Vec<&TradeHistory> = trades.iter().filter(|t| t.status == TradeStatus::Closed).collect();
    let start = closed.len().saturating_sub(window);
    let sample = &closed[start..];

    if sample.is_empty() {
        return PerformanceReport::default();
    }

    let total_trades = sample.len();
    let winning: Vec<&&TradeHistory> = sample.iter().filter(|t| t.pnl_usd > 0.0).collect();
    let losing: Vec<&&TradeHistory> = sample.iter().filter(|t| t.pnl_usd < 0.0).collect();
    let winning_trades = winning.len();
    let losing_trades = losing.len();

    let win_rate_pct = winning_trades as f64 / total_trades as f64 * 100.0;

    let returns_pct: Vec<f64> = sample.iter().map(|t| t.pnl_percent).collect();
    let avg_return_pct = returns_pct.iter().sum::<f64>() / total_trades as f64;
    let total_return_usd = sample.iter().map(|t| t.pnl_usd).sum();

    let sharpe = sharpe_ratio(&returns_pct);
    let max_drawdown = max_drawdown_fraction(&returns_pct);

    let gross_wins: f64 = winning.iter().map(|t| t.pnl_usd).sum();
    let gross_losses: f64 = losing.iter().map(|t| t.pnl_usd).sum::<f64>().abs();
    let profit_factor = if gross_losses > 0.0 { gross_wins / gross_losses } else { 0.0 };

    let avg_win_pct = if winning_trades > 0 {
        winning.iter().map(|t| t.pnl_percent).sum::<f64>() / winning_trades as f64
    } else {
        0.0
    };
    let avg_loss_pct = if losing_trades > 0 {
        losing.iter().map(|t| t.pnl_percent).sum::<f64>() / losing_trades as f64
    } else {
        0.0
    };

    PerformanceReport {
        total_trades,
        winning_trades,
        losing_trades,
        win_rate_pct,
        avg_return_pct,
        total_return_usd,
        sharpe,
        max_drawdown,
        profit_factor,
        avg_win_pct,
        avg_loss_pct,
    }
}

fn sharpe_ratio(returns_pct: &[f64]) -> f64 {
    let n = returns_pct.len();
    if n < 2 {
        return 0.0;
    }
    let mean = returns_pct.iter().sum::<f64>() / n as f64;
    let variance = returns_pct.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
    let stddev = variance.sqrt();
    if stddev == 0.0 {
        return 0.0;
    }
    mean / stddev
}

/// Max drawdown as a fraction (0.15 = 15%), computed on an equity curve built
/// by compounding the percentage returns starting from 1.0.
fn max_drawdown_fraction(returns_pct: &[f64]) -> f64 {
    if returns_pct.is_empty() {
        return 0.0;
    }

    let mut equity = 1.0;
    let mut peak = 1.0;
    let mut max_dd: f64 = 0.0;

    for r in returns_pct {
        equity *= 1.0 + r / 100.0;
        if equity > peak {
            peak = equity;
        }
        let drawdown = if peak > 0.0 { (peak - equity) / peak } else { 0.0 };
        if drawdown > max_dd {
            max_dd = drawdown;
        }
    }

    max_dd
}

impl PerformanceReport {
    /// Formats the report for injection into a decision prompt (§4.14,
    /// supplemented feature).
    pub fn to_prompt_text(&self) -> String {
        if self.total_trades == 0 {
            return "No closed trades yet; no performance history available.".to_string();
        }
        format!(
            "Performance (last {} trades): win rate {:.1}%, avg return {:.2}%, total PnL ${:.2}, \
             Sharpe {:.2}, max drawdown {:.1}%, profit factor {:.2}, avg win {:.2}%, avg loss {:.2}%.",
            self.total_trades,
            self.win_rate_pct,
            self.avg_return_pct,
            self.total_return_usd,
            self.sharpe,
            self.max_drawdown * 100.0,
            self.profit_factor,
            self.avg_win_pct,
            self.avg_loss_pct,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TradeSide;
    use chrono::Utc;

    fn closed_trade(pnl_usd: f64, pnl_percent: f64) -> TradeHistory {
        TradeHistory {
            id: 1,
            bot_id: 1,
            symbol: "BTCUSDT".to_string(),
            side: TradeSide::Long,
            action: "close_long".to_string(),
            entry_price: 100.0,
            exit_price: Some(100.0 + pnl_percent),
            amount: 1.0,
            leverage: 1.0,
            pnl_usd,
            pnl_percent,
            fee_paid: 0.0,
            status: TradeStatus::Closed,
            opened_at: Utc::now(),
            closed_at: Some(Utc::now()),
            cycle_id: "c1".to_string(),
            order_id: None,
        }
    }

    #[test]
    fn empty_history_yields_default_report() {
        let report = calculate(&[], DEFAULT_WINDOW);
        assert_eq!(report.total_trades, 0);
        assert_eq!(report.sharpe, 0.0);
    }

    #[test]
    fn win_rate_and_profit_factor() {
        let trades = vec![closed_trade(10.0, 5.0), closed_trade(-5.0, -2.5), closed_trade(20.0, 8.0)];
        let report = calculate(&trades, DEFAULT_WINDOW);
        assert_eq!(report.total_trades, 3);
        assert_eq!(report.winning_trades, 2);
        assert_eq!(report.losing_trades, 1);
        assert!((report.win_rate_pct - 66.666_666).abs() < 0.01);
        assert!((report.profit_factor - 6.0).abs() < 0.01);
    }

    #[test]
    fn single_trade_sharpe_is_zero() {
        let trades = vec![closed_trade(10.0, 5.0)];
        let report = calculate(&trades, DEFAULT_WINDOW);
        assert_eq!(report.sharpe, 0.0);
    }

    #[test]
    fn window_limits_to_most_recent_trades() {
        let mut trades = Vec::new();
        for _ in 0..100 {
            trades.push(closed_trade(1.0, 1.0));
        }
        let report = calculate(&trades, 10);
        assert_eq!(report.total_trades, 10);
    }

    #[test]
    fn drawdown_reflects_losing_streak() {
        let trades = vec![closed_trade(10.0, 10.0), closed_trade(-20.0, -20.0), closed_trade(-10.0, -10.0)];
        let report = calculate(&trades, DEFAULT_WINDOW);
        assert!(report.max_drawdown > 0.2);
    }

    #[test]
    fn open_trades_are_excluded() {
        let mut open = closed_trade(100.0, 50.0);
        open.status = TradeStatus::Open;
        let trades = vec![open];
        let report = calculate(&trades, DEFAULT_WINDOW);
        assert_eq!(report.total_trades, 0);
    }
}
