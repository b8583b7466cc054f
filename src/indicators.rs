//! Technical indicators
//!
//! Pure numeric functions consumed by the regime detector, exit engine and
//! entry scanner. All series-returning functions yield `Vec<Option<f64>>`
//! aligned to the input, with `None` during the warmup window.

/// Calculate Simple Moving Average
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());

    if period == 0 {
        result.resize(values.len(), None);
        return result;
    }

    for i in 0..values.len() {
        if i + 1 < period {
            result.push(None);
        } else {
            let sum: f64 = values[i + 1 - period..=i].iter().sum();
            result.push(Some(sum / period as f64));
        }
    }

    result
}

/// Calculate Exponential Moving Average with alpha = 2 / (period + 1),
/// seeded with the SMA of the first `period` values.
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());

    if values.is_empty() || period == 0 {
        result.resize(values.len(), None);
        return result;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    smoothed(values, period, multiplier, &mut result);
    result
}

/// Wilder's smoothing with alpha = 1 / period, seeded with the SMA.
/// Used by ATR, RSI and ADX.
pub fn wilder(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());

    if values.is_empty() || period == 0 {
        result.resize(values.len(), None);
        return result;
    }

    smoothed(values, period, 1.0 / period as f64, &mut result);
    result
}

fn smoothed(values: &[f64], period: usize, alpha: f64, result: &mut Vec<Option<f64>>) {
    let mut current: Option<f64> = None;

    for (i, &value) in values.iter().enumerate() {
        if i + 1 < period {
            result.push(None);
        } else if i + 1 == period {
            let sum: f64 = values[0..period].iter().sum();
            current = Some(sum / period as f64);
            result.push(current);
        } else if let Some(prev) = current {
            let next = (value - prev) * alpha + prev;
            current = Some(next);
            result.push(current);
        }
    }
}

/// Calculate True Range
pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    let mut tr = Vec::with_capacity(high.len());

    for i in 0..high.len() {
        let tr_value = if i == 0 {
            high[i] - low[i]
        } else {
            let hl = high[i] - low[i];
            let hc = (high[i] - close[i - 1]).abs();
            let lc = (low[i] - close[i - 1]).abs();
            hl.max(hc).max(lc)
        };
        tr.push(tr_value);
    }

    tr
}

/// Calculate Average True Range (Wilder-smoothed)
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    let tr = true_range(high, low, close);
    wilder(&tr, period)
}

/// Latest ATR value, if enough history is available
pub fn latest_atr(candles_high: &[f64], candles_low: &[f64], candles_close: &[f64], period: usize) -> Option<f64> {
    atr(candles_high, candles_low, candles_close, period)
        .last()
        .and_then(|&x| x)
}

/// ATR-based protective stop below an entry price.
///
/// Falls back to a fixed percentage of the entry when ATR is unavailable or
/// degenerate, so a position never starts life without a stop.
pub fn atr_stop(entry_price: f64, atr_value: Option<f64>, multiple: f64, fallback_pct: f64) -> f64 {
    match atr_value {
        Some(a) if a > 0.0 => entry_price - multiple * a,
        _ => entry_price * (1.0 - fallback_pct / 100.0),
    }
}

/// Calculate RSI (Relative Strength Index) with Wilder-smoothed averages
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut gains = Vec::with_capacity(values.len());
    let mut losses = Vec::with_capacity(values.len());

    if values.is_empty() {
        return Vec::new();
    }

    gains.push(0.0);
    losses.push(0.0);

    for i in 1..values.len() {
        let change = values[i] - values[i - 1];
        gains.push(if change > 0.0 { change } else { 0.0 });
        losses.push(if change < 0.0 { -change } else { 0.0 });
    }

    let avg_gains = wilder(&gains, period);
    let avg_losses = wilder(&losses, period);

    let mut rsi_values = Vec::with_capacity(values.len());

    for i in 0..values.len() {
        if let (Some(avg_gain), Some(avg_loss)) = (avg_gains[i], avg_losses[i]) {
            if avg_loss == 0.0 {
                rsi_values.push(Some(100.0));
            } else {
                let rs = avg_gain / avg_loss;
                rsi_values.push(Some(100.0 - (100.0 / (1.0 + rs))));
            }
        } else {
            rsi_values.push(None);
        }
    }

    rsi_values
}

/// Calculate MACD line, signal line and histogram
pub fn macd(
    values: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>) {
    let fast = ema(values, fast_period);
    let slow = ema(values, slow_period);

    let mut macd_line = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        match (fast[i], slow[i]) {
            (Some(f), Some(s)) => macd_line.push(Some(f - s)),
            _ => macd_line.push(None),
        }
    }

    // Signal EMA runs over the defined portion of the MACD line only
    let first_defined = macd_line.iter().position(|v| v.is_some());
    let mut signal = vec![None; values.len()];
    if let Some(start) = first_defined {
        let defined: Vec<f64> = macd_line[start..].iter().map(|v| v.unwrap_or(0.0)).collect();
        let signal_tail = ema(&defined, signal_period);
        for (offset, value) in signal_tail.into_iter().enumerate() {
            signal[start + offset] = value;
        }
    }

    let mut histogram = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        match (macd_line[i], signal[i]) {
            (Some(m), Some(s)) => histogram.push(Some(m - s)),
            _ => histogram.push(None),
        }
    }

    (macd_line, signal, histogram)
}

/// Calculate Directional Movement components (+DI, -DI), Wilder-smoothed
pub fn dmi(high: &[f64], low: &[f64], close: &[f64], period: usize) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    let mut plus_dm = vec![0.0; high.len()];
    let mut minus_dm = vec![0.0; high.len()];

    for i in 1..high.len() {
        let up_move = high[i] - high[i - 1];
        let down_move = low[i - 1] - low[i];

        if up_move > down_move && up_move > 0.0 {
            plus_dm[i] = up_move;
        }
        if down_move > up_move && down_move > 0.0 {
            minus_dm[i] = down_move;
        }
    }

    let smoothed_plus = wilder(&plus_dm, period);
    let smoothed_minus = wilder(&minus_dm, period);
    let atr_values = atr(high, low, close, period);

    let mut plus_di = Vec::with_capacity(high.len());
    let mut minus_di = Vec::with_capacity(high.len());

    for i in 0..high.len() {
        match (smoothed_plus[i], smoothed_minus[i], atr_values[i]) {
            (Some(p), Some(m), Some(a)) if a > 0.0 => {
                plus_di.push(Some(p / a * 100.0));
                minus_di.push(Some(m / a * 100.0));
            }
            _ => {
                plus_di.push(None);
                minus_di.push(None);
            }
        }
    }

    (plus_di, minus_di)
}

/// Calculate Average Directional Index (ADX)
pub fn adx(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    let (plus_di, minus_di) = dmi(high, low, close, period);

    let mut dx = Vec::with_capacity(high.len());
    for i in 0..high.len() {
        if let (Some(pdi), Some(mdi)) = (plus_di[i], minus_di[i]) {
            let sum = pdi + mdi;
            if sum > 0.0 {
                dx.push(((pdi - mdi).abs() / sum) * 100.0);
            } else {
                dx.push(0.0);
            }
        } else {
            dx.push(0.0);
        }
    }

    wilder(&dx, period)
}

/// Calculate Bollinger Bands: (upper, middle, lower)
pub fn bollinger_bands(
    values: &[f64],
    period: usize,
    num_std: f64,
) -> (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>) {
    let middle = sma(values, period);
    let mut upper = Vec::with_capacity(values.len());
    let mut lower = Vec::with_capacity(values.len());

    for i in 0..values.len() {
        if let Some(mid) = middle[i] {
            if i + 1 >= period {
                let window = &values[i + 1 - period..=i];
                let variance: f64 = window
                    .iter()
                    .map(|&x| {
                        let diff = x - mid;
                        diff * diff
                    })
                    .sum::<f64>()
                    / period as f64;
                let std_dev = variance.sqrt();

                upper.push(Some(mid + num_std * std_dev));
                lower.push(Some(mid - num_std * std_dev));
            } else {
                upper.push(None);
                lower.push(None);
            }
        } else {
            upper.push(None);
            lower.push(None);
        }
    }

    (upper, middle, lower)
}

/// Rolling average volume over the trailing `period` bars (last value)
pub fn avg_volume(volumes: &[f64], period: usize) -> Option<f64> {
    if volumes.is_empty() || period == 0 {
        return None;
    }
    let window = if volumes.len() > period {
        &volumes[volumes.len() - period..]
    } else {
        volumes
    };
    Some(window.iter().sum::<f64>() / window.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sma() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let result = sma(&values, 3);

        assert_eq!(result[0], None);
        assert_eq!(result[1], None);
        assert_eq!(result[2], Some(2.0));
        assert_eq!(result[3], Some(3.0));
        assert_eq!(result[4], Some(4.0));
    }

    #[test]
    fn test_sma_zero_period() {
        let values = vec![1.0, 2.0];
        let result = sma(&values, 0);
        assert_eq!(result, vec![None, None]);
    }

    #[test]
    fn test_ema_seeds_with_sma() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let result = ema(&values, 3);

        assert_eq!(result[0], None);
        assert_eq!(result[1], None);
        assert_eq!(result[2], Some(2.0));
        // alpha = 0.5: ema[3] = (4 - 2) * 0.5 + 2 = 3
        assert_eq!(result[3], Some(3.0));
        assert_eq!(result[4], Some(4.0));
    }

    #[test]
    fn test_wilder_smoothing_is_slower_than_ema() {
        let values: Vec<f64> = (0..30).map(|i| i as f64).collect();
        let e = ema(&values, 14).last().unwrap().unwrap();
        let w = wilder(&values, 14).last().unwrap().unwrap();
        // Wilder alpha (1/14) reacts slower than EMA alpha (2/15)
        assert!(w < e);
    }

    #[test]
    fn test_true_range_uses_prior_close() {
        let high = vec![10.0, 12.0];
        let low = vec![9.0, 11.5];
        let close = vec![9.5, 11.8];
        let tr = true_range(&high, &low, &close);

        assert_relative_eq!(tr[0], 1.0);
        // max(12-11.5, |12-9.5|, |11.5-9.5|) = 2.5
        assert_relative_eq!(tr[1], 2.5);
    }

    #[test]
    fn test_atr_warmup_and_positivity() {
        let high = vec![12.0, 13.0, 14.0, 15.0, 16.0, 15.5, 16.5, 17.0, 16.0, 17.5];
        let low = vec![10.0, 11.0, 12.0, 13.0, 14.0, 14.0, 15.0, 15.5, 14.5, 16.0];
        let close = vec![11.0, 12.0, 13.0, 14.0, 15.0, 15.0, 16.0, 16.5, 15.5, 17.0];

        let result = atr(&high, &low, &close, 5);
        assert_eq!(result[3], None);
        assert!(result[4].is_some());
        assert!(result[4].unwrap() > 0.0);
    }

    #[test]
    fn test_atr_stop_with_and_without_atr() {
        assert_relative_eq!(atr_stop(100.0, Some(4.0), 2.75, 8.0), 89.0);
        // No ATR: 8% fallback
        assert_relative_eq!(atr_stop(100.0, None, 2.75, 8.0), 92.0);
        // Degenerate ATR also falls back
        assert_relative_eq!(atr_stop(100.0, Some(0.0), 2.75, 8.0), 92.0);
    }

    #[test]
    fn test_rsi_direction() {
        let up_values: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let rsi_up = rsi(&up_values, 14);
        assert!(rsi_up.last().unwrap().unwrap() > 50.0);

        let down_values: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        let rsi_down = rsi(&down_values, 14);
        assert!(rsi_down.last().unwrap().unwrap() < 50.0);
    }

    #[test]
    fn test_macd_has_values_after_warmup() {
        let values: Vec<f64> = (0..50)
            .map(|i| 100.0 + (i as f64 * 0.5) + (i % 3) as f64)
            .collect();
        let (macd_line, signal, histogram) = macd(&values, 12, 26, 9);

        assert!(macd_line[40].is_some());
        assert!(signal[40].is_some());
        assert!(histogram[40].is_some());
        // Histogram is the spread between line and signal
        assert_relative_eq!(
            histogram[40].unwrap(),
            macd_line[40].unwrap() - signal[40].unwrap()
        );
    }

    #[test]
    fn test_adx_bounded() {
        let high: Vec<f64> = (0..40).map(|i| 101.0 + i as f64 * 0.8).collect();
        let low: Vec<f64> = (0..40).map(|i| 99.0 + i as f64 * 0.8).collect();
        let close: Vec<f64> = (0..40).map(|i| 100.0 + i as f64 * 0.8).collect();

        let result = adx(&high, &low, &close, 14);
        let last = result.last().unwrap().unwrap();
        assert!((0.0..=100.0).contains(&last));
        // A persistent one-way trend should read as strong
        assert!(last > 25.0);
    }

    #[test]
    fn test_bollinger_bands_ordering() {
        let values = vec![20.0, 21.0, 22.0, 21.5, 20.5, 21.0, 22.5, 23.0, 22.0, 21.5];
        let (upper, middle, lower) = bollinger_bands(&values, 5, 2.0);

        assert!(upper[4].is_some());
        assert!(upper[4].unwrap() > middle[4].unwrap());
        assert!(middle[4].unwrap() > lower[4].unwrap());
    }

    #[test]
    fn test_avg_volume_short_history() {
        let volumes = vec![100.0, 200.0];
        assert_relative_eq!(avg_volume(&volumes, 50).unwrap(), 150.0);
        assert_eq!(avg_volume(&[], 50), None);
    }
}
