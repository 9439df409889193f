// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
// The only indicator the engine computes itself. ATR is the volatility scale
// behind the advisor-SL minimum-distance rule and default SL generation.
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is then the smoothed average of TR using Wilder's method:
//   ATR_0   = SMA of first `period` TR values
//   ATR_t   = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::types::Kline;

/// Standard ATR look-back used by the SL validation rules.
pub const ATR_PERIOD: usize = 14;

/// Compute the most recent ATR value from a slice of klines (oldest first)
/// using Wilder's smoothing method.
///
/// Returns `None` when `period` is zero, there are fewer than `period + 1`
/// klines, or any intermediate value is non-finite.
pub fn calculate_atr(klines: &[Kline], period: usize) -> Option<f64> {
    if period == 0 || klines.len() < period + 1 {
        return None;
    }

    let mut tr_values: Vec<f64> = Vec::with_capacity(klines.len() - 1);
    for i in 1..klines.len() {
        let high = klines[i].high;
        let low = klines[i].low;
        let prev_close = klines[i - 1].close;

        let hl = high - low;
        let hc = (high - prev_close).abs();
        let lc = (low - prev_close).abs();

        tr_values.push(hl.max(hc).max(lc));
    }

    if tr_values.len() < period {
        return None;
    }

    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return None;
    }

    let period_f = period as f64;
    let mut atr = seed;
    for &tr in &tr_values[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            return None;
        }
    }

    atr.is_finite().then_some(atr)
}

/// ATR as a percentage of the latest close. Used to derive default SL
/// distances that are comparable across symbols with different price scales.
pub fn calculate_atr_pct(klines: &[Kline], period: usize) -> Option<f64> {
    let atr = calculate_atr(klines, period)?;
    let last_close = klines.last()?.close;
    if last_close == 0.0 {
        return None;
    }
    Some((atr / last_close) * 100.0)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn kline(open: f64, high: f64, low: f64, close: f64) -> Kline {
        Kline::new(0, open, high, low, close, 100.0, 0)
    }

    #[test]
    fn atr_period_zero() {
        let klines = vec![kline(100.0, 105.0, 95.0, 102.0); 20];
        assert!(calculate_atr(&klines, 0).is_none());
    }

    #[test]
    fn atr_insufficient_data() {
        let klines = vec![kline(100.0, 105.0, 95.0, 102.0); 10];
        assert!(calculate_atr(&klines, 14).is_none());
    }

    #[test]
    fn atr_constant_range_converges() {
        // Every bar has the same 10-unit range; ATR should sit near 10.
        let mut klines = Vec::new();
        for i in 0..30 {
            let base = 100.0 + i as f64 * 0.1;
            klines.push(kline(base, base + 5.0, base - 5.0, base));
        }
        let atr = calculate_atr(&klines, 14).unwrap();
        assert!((atr - 10.0).abs() < 1.0, "expected ATR near 10.0, got {atr}");
    }

    #[test]
    fn atr_true_range_uses_prev_close() {
        // Gap scenario: |H - prevClose| > H - L
        let klines = vec![
            kline(100.0, 105.0, 95.0, 95.0),
            kline(110.0, 115.0, 108.0, 112.0),
            kline(112.0, 118.0, 110.0, 115.0),
            kline(115.0, 120.0, 113.0, 118.0),
        ];
        let atr = calculate_atr(&klines, 3).unwrap();
        assert!(atr > 7.0, "ATR should reflect the gap, got {atr}");
    }

    #[test]
    fn atr_pct_scales_by_close() {
        let klines: Vec<Kline> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64;
                kline(base, base + 3.0, base - 3.0, base + 1.0)
            })
            .collect();
        let pct = calculate_atr_pct(&klines, 14).unwrap();
        assert!(pct > 0.0 && pct.is_finite());
    }

    #[test]
    fn atr_nan_returns_none() {
        let klines = vec![
            kline(100.0, 105.0, 95.0, 100.0),
            kline(100.0, f64::NAN, 95.0, 100.0),
            kline(100.0, 105.0, 95.0, 100.0),
            kline(100.0, 105.0, 95.0, 100.0),
        ];
        assert!(calculate_atr(&klines, 3).is_none());
    }
}
