// =============================================================================
// Fee calculator (§B supplemented feature)
// =============================================================================
//
// Commission from exchange fee tiers. Shared by `ExecutionStage` and
// `BacktestEngine`'s `MockTrader` so live and simulated trading debit the
// same number for the same notional.
// =============================================================================

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub maker_rate: f64,
    pub taker_rate: f64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        // Binance USDT-margined futures default (non-VIP) tier.
        Self {
            maker_rate: 0.0002,
            taker_rate: 0.0005,
        }
    }
}

impl FeeSchedule {
    pub fn commission(&self, notional: f64, is_maker: bool) -> f64 {
        let rate = if is_maker { self.maker_rate } else { self.taker_rate };
        notional.abs() * rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taker_commission_on_notional() {
        let schedule = FeeSchedule::default();
        let fee = schedule.commission(1000.0, false);
        assert!((fee - 0.5).abs() < 1e-9);
    }

    #[test]
    fn maker_rate_is_cheaper_than_taker() {
        let schedule = FeeSchedule::default();
        assert!(schedule.commission(1000.0, true) < schedule.commission(1000.0, false));
    }
}
