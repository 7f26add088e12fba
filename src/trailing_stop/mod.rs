// =============================================================================
// TrailingStop (§4.11)
// =============================================================================
//
// Per-position ratcheting stop. Keyed by position id so state survives across
// cycles until the position closes from any source (exchange-side SL/TP
// fill, a decision-driven close, or a forced close). Grounded on the
// teacher's `position_engine.rs` trailing-stop field (`trailing_stop`,
// `highest_price`) generalized into its own owning module per §3 ("each bot
// owns ... TrailingStop").
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::warn;

use crate::state::{Position, RiskLimits, Side};

#[derive(Debug, Clone, Copy)]
struct TrailingState {
    peak_pnl_pct: f64,
    trailing_sl_price: Option<f64>,
    activated: bool,
}

impl Default for TrailingState {
    fn default() -> Self {
        Self {
            peak_pnl_pct: f64::MIN,
            trailing_sl_price: None,
            activated: false,
        }
    }
}

pub struct TrailingStop {
    state: RwLock<HashMap<String, TrailingState>>,
}

impl Default for TrailingStop {
    fn default() -> Self {
        Self::new()
    }
}

impl TrailingStop {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(HashMap::new()),
        }
    }

    /// Clears all tracking state for `position_id` (position closed, from
    /// any source).
    pub fn clear(&self, position_id: &str) {
        self.state.write().remove(position_id);
    }

    /// Evaluate one position against the current price. Returns `true` when
    /// the position should be closed by the trailing stop. Skips (logs WARN,
    /// never fabricates a decision) when `current_price` is unavailable —
    /// callers should not invoke this without a live price.
    pub fn evaluate(&self, position: &Position, current_price: Option<f64>, limits: &RiskLimits) -> bool {
        let Some(current_price) = current_price else {
            warn!(symbol = %position.symbol, "trailing stop: missing current price, skipping evaluation");
            return false;
        };

        if !limits.trailing_stop_enabled {
            return false;
        }

        let pnl_pct = position.unrealized_pnl_pct(current_price);
        let mut state_map = self.state.write();
        let entry = state_map.entry(position.id.clone()).or_default();

        if pnl_pct > entry.peak_pnl_pct {
            entry.peak_pnl_pct = pnl_pct;
        }

        if !entry.activated {
            if entry.peak_pnl_pct >= limits.trailing_stop_trigger_pct {
                entry.activated = true;
            } else {
                return false;
            }
        }

        let distance = limits.trailing_stop_distance_pct / 100.0;
        let lock = limits.trailing_stop_lock_profit_pct / 100.0;

        match position.side {
            Side::Buy => {
                let candidate = current_price * (1.0 - distance);
                let floor = position.entry_price * (1.0 + lock);
                let candidate = candidate.max(floor);
                let sl = match entry.trailing_sl_price {
                    Some(existing) => existing.max(candidate),
                    None => candidate,
                };
                entry.trailing_sl_price = Some(sl);
                current_price <= sl
            }
            Side::Sell => {
                let candidate = current_price * (1.0 + distance);
                let cap = position.entry_price * (1.0 - lock);
                let candidate = candidate.min(cap);
                let sl = match entry.trailing_sl_price {
                    Some(existing) => existing.min(candidate),
                    None => candidate,
                };
                entry.trailing_sl_price = Some(sl);
                current_price >= sl
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{OrderType, PositionStatus};

    fn long_position(entry_price: f64) -> Position {
        Position {
            id: "p1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            position_type: OrderType::Market,
            status: PositionStatus::Open,
            entry_price,
            current_average: entry_price,
            amount: 1.0,
            leverage: 1.0,
            stop_loss_price: None,
            take_profit_price: None,
        }
    }

    fn short_position(entry_price: f64) -> Position {
        let mut p = long_position(entry_price);
        p.side = Side::Sell;
        p
    }

    #[test]
    fn missing_price_never_triggers() {
        let trailing = TrailingStop::new();
        let position = long_position(100.0);
        let limits = RiskLimits::default();
        assert!(!trailing.evaluate(&position, None, &limits));
    }

    #[test]
    fn long_does_not_activate_below_trigger() {
        let trailing = TrailingStop::new();
        let position = long_position(100.0);
        let limits = RiskLimits::default();
        assert!(!trailing.evaluate(&position, Some(100.5), &limits));
    }

    #[test]
    fn long_activates_and_ratchets_up_only() {
        let trailing = TrailingStop::new();
        let position = long_position(100.0);
        let limits = RiskLimits::default();

        assert!(!trailing.evaluate(&position, Some(102.0), &limits));
        assert!(!trailing.evaluate(&position, Some(105.0), &limits));
        assert!(!trailing.evaluate(&position, Some(103.0), &limits));
    }

    #[test]
    fn long_triggers_close_when_price_drops_through_sl() {
        let trailing = TrailingStop::new();
        let position = long_position(100.0);
        let limits = RiskLimits::default();

        trailing.evaluate(&position, Some(110.0), &limits);
        let triggered = trailing.evaluate(&position, Some(108.0), &limits);
        assert!(triggered);
    }

    #[test]
    fn short_mirrors_long_behavior() {
        let trailing = TrailingStop::new();
        let position = short_position(100.0);
        let limits = RiskLimits::default();

        assert!(!trailing.evaluate(&position, Some(98.0), &limits));
        let triggered = trailing.evaluate(&position, Some(99.5), &limits);
        assert!(triggered);
    }

    #[test]
    fn clear_drops_tracked_state() {
        let trailing = TrailingStop::new();
        let position = long_position(100.0);
        let limits = RiskLimits::default();
        trailing.evaluate(&position, Some(110.0), &limits);
        trailing.clear(&position.id);
        assert!(!trailing.evaluate(&position, Some(103.0), &limits));
    }

    #[test]
    fn disabled_never_triggers() {
        let trailing = TrailingStop::new();
        let position = long_position(100.0);
        let mut limits = RiskLimits::default();
        limits.trailing_stop_enabled = false;
        trailing.evaluate(&position, Some(110.0), &limits);
        assert!(!trailing.evaluate(&position, Some(50.0), &limits));
    }
}
