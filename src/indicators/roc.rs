// Percentage price change over a look-back window: ROC = (close - close_n) /
// close_n * 100. Positive means upward momentum over the window, negative
// downward. `compute_indicator_bundle` takes the last value of this series as
// the bundle's momentum reading.
pub fn calculate_roc(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() <= period {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period);
    for i in period..closes.len() {
        let prev = closes[i - period];
        if prev == 0.0 {
            result.push(0.0);
        } else {
            result.push(((closes[i] - prev) / prev) * 100.0);
        }
    }
    result
}
