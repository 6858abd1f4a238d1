use chrono::Duration;

use crate::data::{PriceSeries, TimeSeries};
use crate::error::{LabelError, LabelResult};

/// Exponentially weighted standard deviation with `alpha = 2 / (span + 1)`.
///
/// Uses finite-history (adjusted) weights `w_i = (1 - alpha)^(t - i)` and the
/// unbiased correction `(Σw)² / ((Σw)² - Σw²)`. The first observation has no
/// dispersion and comes back as NaN; non-finite inputs are skipped while the
/// existing weights keep decaying.
pub fn ewm_std(values: &[f64], span: usize) -> Vec<f64> {
    if span == 0 {
        return vec![f64::NAN; values.len()];
    }
    let alpha = 2.0 / (span as f64 + 1.0);
    let decay = 1.0 - alpha;

    let mut result = Vec::with_capacity(values.len());
    let mut mean = f64::NAN;
    let mut cov = 0.0;
    let mut old_wt = 1.0;
    let mut sum_wt = 0.0;
    let mut sum_wt2 = 0.0;
    let mut seen = 0usize;

    for &x in values {
        if x.is_finite() {
            if seen == 0 {
                mean = x;
                cov = 0.0;
                sum_wt = 1.0;
                sum_wt2 = 1.0;
                old_wt = 1.0;
            } else {
                sum_wt *= decay;
                sum_wt2 *= decay * decay;
                old_wt *= decay;

                let prev_mean = mean;
                let total = old_wt + 1.0;
                mean = (old_wt * prev_mean + x) / total;
                cov = (old_wt * (cov + (prev_mean - mean).powi(2)) + (x - mean).powi(2)) / total;

                sum_wt += 1.0;
                sum_wt2 += 1.0;
                old_wt += 1.0;
            }
            seen += 1;
        } else if seen > 0 {
            sum_wt *= decay;
            sum_wt2 *= decay * decay;
            old_wt *= decay;
        }

        let value = if seen < 2 {
            f64::NAN
        } else {
            let numerator = sum_wt * sum_wt;
            let denominator = numerator - sum_wt2;
            if denominator > 0.0 {
                (cov * numerator / denominator).max(0.0).sqrt()
            } else {
                f64::NAN
            }
        };
        result.push(value);
    }
    result
}

/// Returns over a calendar lookback: `r_t = P(t) / P(t') - 1` where `t'` is
/// the latest index timestamp at or before `t - lookback`. Timestamps without
/// such a `t'` are left out of the output.
pub fn lagged_returns(prices: &PriceSeries, lookback: Duration) -> LabelResult<TimeSeries> {
    if lookback <= Duration::zero() {
        return Err(LabelError::config(format!(
            "volatility lookback must be positive (got {lookback})"
        )));
    }
    let index = prices.index();
    let mut timestamps = Vec::new();
    let mut returns = Vec::new();
    for (pos, (&ts, &price)) in prices
        .timestamps()
        .iter()
        .zip(prices.prices().iter())
        .enumerate()
    {
        let Some(lagged) = index.last_at_or_before(ts - lookback) else {
            continue;
        };
        debug_assert!(lagged < pos);
        timestamps.push(ts);
        returns.push(price / prices.price(lagged) - 1.0);
    }
    TimeSeries::new(timestamps, returns)
}

/// Adaptive volatility estimate: EWM standard deviation (`span`) of returns
/// measured over `lookback`.
///
/// The output index is the subset of the price index with a valid lagged
/// observation. Its first point is NaN; every later point is finite.
pub fn daily_volatility(
    prices: &PriceSeries,
    span: usize,
    lookback: Duration,
) -> LabelResult<TimeSeries> {
    if span == 0 {
        return Err(LabelError::config("volatility span must be > 0"));
    }
    let returns = lagged_returns(prices, lookback)?;
    let std = ewm_std(returns.values(), span);
    TimeSeries::new(returns.index().as_slice().to_vec(), std)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, 0, 0, 0).unwrap()
    }

    fn brute_force_std(values: &[f64], span: usize) -> f64 {
        let alpha = 2.0 / (span as f64 + 1.0);
        let n = values.len();
        let weights: Vec<f64> = (0..n)
            .map(|i| (1.0 - alpha).powi((n - 1 - i) as i32))
            .collect();
        let sum_w: f64 = weights.iter().sum();
        let sum_w2: f64 = weights.iter().map(|w| w * w).sum();
        let mean = weights.iter().zip(values).map(|(w, x)| w * x).sum::<f64>() / sum_w;
        let biased = weights
            .iter()
            .zip(values)
            .map(|(w, x)| w * (x - mean).powi(2))
            .sum::<f64>()
            / sum_w;
        (biased * sum_w * sum_w / (sum_w * sum_w - sum_w2)).sqrt()
    }

    #[test]
    fn two_points_have_half_squared_difference_variance() {
        for span in [1, 5, 100] {
            let std = ewm_std(&[0.01, 0.03], span);
            assert!(std[0].is_nan());
            assert!((std[1] - 0.02 / 2f64.sqrt()).abs() < 1e-12);
        }
    }

    #[test]
    fn online_update_matches_direct_weighting() {
        let values = [0.01, -0.02, 0.015, 0.0, 0.03, -0.01];
        let std = ewm_std(&values, 3);
        for n in 2..=values.len() {
            let expected = brute_force_std(&values[..n], 3);
            assert!(
                (std[n - 1] - expected).abs() < 1e-12,
                "mismatch at {n}: {} vs {expected}",
                std[n - 1]
            );
        }
    }

    #[test]
    fn lagged_returns_skip_rows_without_history() {
        let prices = PriceSeries::from_pairs(vec![
            (day(1), 100.0),
            (day(1) + Duration::hours(12), 101.0),
            (day(2), 102.0),
            (day(3), 99.0),
        ])
        .unwrap();
        let returns = lagged_returns(&prices, Duration::days(1)).unwrap();
        assert_eq!(returns.index().as_slice(), &[day(2), day(3)]);
        assert!((returns.values()[0] - 0.02).abs() < 1e-12);
        // day 3 looks back to day 2 exactly
        assert!((returns.values()[1] - (99.0 / 102.0 - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn daily_volatility_first_point_is_nan_then_finite() {
        let prices = PriceSeries::from_pairs(
            [100.0, 101.0, 99.5, 102.0, 103.0, 101.0]
                .into_iter()
                .enumerate()
                .map(|(i, p)| (day(i as u32 + 1), p)),
        )
        .unwrap();
        let vol = daily_volatility(&prices, 3, Duration::days(1)).unwrap();
        assert_eq!(vol.len(), 5);
        assert!(vol.values()[0].is_nan());
        assert!(vol.values()[1..].iter().all(|v| v.is_finite() && *v >= 0.0));
    }

    #[test]
    fn zero_span_is_a_configuration_error() {
        let prices = PriceSeries::from_pairs(vec![(day(1), 1.0)]).unwrap();
        assert!(matches!(
            daily_volatility(&prices, 0, Duration::days(1)),
            Err(LabelError::Configuration(_))
        ));
    }

    #[test]
    fn empty_prices_give_empty_volatility() {
        let vol = daily_volatility(&PriceSeries::default(), 10, Duration::days(1)).unwrap();
        assert!(vol.is_empty());
    }
}
