//! The operator vocabulary available to both factor dialects.
//!
//! Per-symbol operators walk each symbol's date-ascending slice; the
//! cross-sectional `rank` walks each date. NaN marks a missing observation
//! and never participates in window statistics.

use factor_core::FactorError;

use crate::frame::Series;

fn is_valid(v: f64) -> bool {
    !v.is_nan()
}

/// Rolling aggregate over the trailing `window` values of one slice; `agg`
/// sees only the valid (non-NaN) observations of each window.
fn rolling_valid(
    input: &[f64],
    out: &mut [f64],
    window: usize,
    min_periods: usize,
    agg: impl Fn(&[f64]) -> f64,
) {
    let mut buf = Vec::with_capacity(window);
    for i in 0..input.len() {
        let start = (i + 1).saturating_sub(window);
        buf.clear();
        buf.extend(input[start..=i].iter().copied().filter(|v| is_valid(*v)));
        out[i] = if buf.len() >= min_periods.max(1) {
            agg(&buf)
        } else {
            f64::NAN
        };
    }
}

fn per_symbol2(
    a: &Series,
    b: &Series,
    f: impl Fn(&[f64], &[f64], &mut [f64]),
) -> Result<Series, FactorError> {
    if a.len() != b.len() {
        return Err(FactorError::computation(
            "series operands are not aligned to the same frame",
        ));
    }
    let mut out = vec![f64::NAN; a.len()];
    for &(start, end) in a.index().symbol_runs() {
        f(
            &a.values()[start..end],
            &b.values()[start..end],
            &mut out[start..end],
        );
    }
    Ok(Series::new(a.index().clone(), out))
}

fn sample_std(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return f64::NAN;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
    var.sqrt()
}

fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len() as f64;
    if xs.len() < 2 {
        return f64::NAN;
    }
    let mx = xs.iter().sum::<f64>() / n;
    let my = ys.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut vx = 0.0;
    let mut vy = 0.0;
    for (&x, &y) in xs.iter().zip(ys) {
        cov += (x - mx) * (y - my);
        vx += (x - mx).powi(2);
        vy += (y - my).powi(2);
    }
    if vx == 0.0 || vy == 0.0 {
        return f64::NAN;
    }
    cov / (vx.sqrt() * vy.sqrt())
}

// ---------------------------------------------------------------------------
// Element-wise
// ---------------------------------------------------------------------------

pub fn abs(s: &Series) -> Series {
    s.map(f64::abs)
}

/// Natural log; non-positive inputs are missing.
pub fn log(s: &Series) -> Series {
    s.map(|v| if v > 0.0 { v.ln() } else { f64::NAN })
}

pub fn power(s: &Series, exponent: f64) -> Series {
    s.map(|v| v.powf(exponent))
}

pub fn min2(a: &Series, b: &Series) -> Result<Series, FactorError> {
    a.zip_map(b, |x, y| if x.is_nan() || y.is_nan() { f64::NAN } else { x.min(y) })
}

pub fn max2(a: &Series, b: &Series) -> Result<Series, FactorError> {
    a.zip_map(b, |x, y| if x.is_nan() || y.is_nan() { f64::NAN } else { x.max(y) })
}

/// Select `t` where `cond` is truthy (non-zero), else `f`.
pub fn if_then_else(cond: &Series, t: &Series, f: &Series) -> Result<Series, FactorError> {
    if cond.len() != t.len() || cond.len() != f.len() {
        return Err(FactorError::computation(
            "series operands are not aligned to the same frame",
        ));
    }
    let values = cond
        .values()
        .iter()
        .zip(t.values())
        .zip(f.values())
        .map(|((&c, &tv), &fv)| if c != 0.0 { tv } else { fv })
        .collect();
    Ok(Series::new(cond.index().clone(), values))
}

// ---------------------------------------------------------------------------
// Cross-sectional
// ---------------------------------------------------------------------------

/// Per-date dense rank with average tie-breaks, renormalized to
/// `[-0.5, 0.5]`. NaN inputs are excluded from the ranking and output 0.
pub fn rank(s: &Series) -> Series {
    s.per_date(|vals, out| {
        for v in out.iter_mut() {
            *v = 0.0;
        }
        let mut idx: Vec<usize> = (0..vals.len()).filter(|&i| is_valid(vals[i])).collect();
        let n = idx.len();
        if n < 2 {
            return;
        }
        idx.sort_by(|&a, &b| vals[a].partial_cmp(&vals[b]).expect("values are non-NaN"));

        let mut ranks = vec![0.0; n];
        let mut i = 0;
        while i < n {
            let mut j = i;
            while j + 1 < n && vals[idx[j + 1]] == vals[idx[i]] {
                j += 1;
            }
            let avg = (i + j) as f64 / 2.0 + 1.0;
            for r in ranks.iter_mut().take(j + 1).skip(i) {
                *r = avg;
            }
            i = j + 1;
        }
        for (k, &row) in idx.iter().enumerate() {
            out[row] = (ranks[k] - 1.0) / (n as f64 - 1.0) - 0.5;
        }
    })
}

// ---------------------------------------------------------------------------
// Per-symbol time series
// ---------------------------------------------------------------------------

/// Value `n` periods ago; the first `n` observations are missing.
pub fn delay(s: &Series, n: usize) -> Series {
    s.per_symbol(|input, out| {
        for i in 0..input.len() {
            out[i] = if i >= n { input[i - n] } else { f64::NAN };
        }
    })
}

/// `REF` is `DELAY` under its traditional name.
pub fn reference(s: &Series, n: usize) -> Series {
    delay(s, n)
}

/// Simple one-period return; day zero outputs 0.
pub fn returns(s: &Series) -> Series {
    s.per_symbol(|input, out| {
        for i in 0..input.len() {
            out[i] = if i == 0 {
                0.0
            } else {
                input[i] / input[i - 1] - 1.0
            };
        }
    })
}

pub fn rolling_sum(s: &Series, window: usize) -> Series {
    s.per_symbol(|input, out| {
        rolling_valid(input, out, window, 1, |w| w.iter().sum());
    })
}

/// Rolling sample standard deviation, `min_periods = max(2, window / 4)`.
pub fn stddev(s: &Series, window: usize) -> Series {
    let min_periods = 2.max(window / 4);
    s.per_symbol(move |input, out| {
        rolling_valid(input, out, window, min_periods, sample_std);
    })
}

pub fn ts_mean(s: &Series, window: usize) -> Series {
    s.per_symbol(|input, out| {
        rolling_valid(input, out, window, 1, |w| {
            w.iter().sum::<f64>() / w.len() as f64
        });
    })
}

pub fn ts_min(s: &Series, window: usize) -> Series {
    s.per_symbol(|input, out| {
        rolling_valid(input, out, window, 1, |w| {
            w.iter().copied().fold(f64::INFINITY, f64::min)
        });
    })
}

pub fn ts_max(s: &Series, window: usize) -> Series {
    s.per_symbol(|input, out| {
        rolling_valid(input, out, window, 1, |w| {
            w.iter().copied().fold(f64::NEG_INFINITY, f64::max)
        });
    })
}

/// Rank of the current value among the trailing window, normalized to
/// `[0, 1]` with average tie-breaks.
pub fn ts_rank(s: &Series, window: usize) -> Series {
    s.per_symbol(|input, out| {
        for i in 0..input.len() {
            let current = input[i];
            if !is_valid(current) {
                out[i] = f64::NAN;
                continue;
            }
            let start = (i + 1).saturating_sub(window);
            let mut less = 0usize;
            let mut equal = 0usize;
            let mut count = 0usize;
            for &v in &input[start..=i] {
                if !is_valid(v) {
                    continue;
                }
                count += 1;
                if v < current {
                    less += 1;
                } else if v == current {
                    equal += 1;
                }
            }
            out[i] = if count < 2 {
                f64::NAN
            } else {
                let avg_rank = less as f64 + (equal as f64 + 1.0) / 2.0;
                (avg_rank - 1.0) / (count as f64 - 1.0)
            };
        }
    })
}

/// Simple moving average (alias of `ts_mean` under its chart name).
pub fn ma(s: &Series, window: usize) -> Series {
    ts_mean(s, window)
}

/// Exponential moving average with span-style smoothing
/// `alpha = 2 / (window + 1)`, seeded at the first valid observation.
pub fn ema(s: &Series, window: usize) -> Series {
    let alpha = 2.0 / (window as f64 + 1.0);
    s.per_symbol(move |input, out| {
        let mut state = f64::NAN;
        for i in 0..input.len() {
            let x = input[i];
            if is_valid(x) {
                state = if state.is_nan() {
                    x
                } else {
                    alpha * x + (1.0 - alpha) * state
                };
            }
            out[i] = state;
        }
    })
}

/// Linearly weighted moving average, latest observation heaviest; requires
/// a full window of valid values.
pub fn wma(s: &Series, window: usize) -> Series {
    let denom = (window * (window + 1) / 2) as f64;
    s.per_symbol(move |input, out| {
        for i in 0..input.len() {
            if i + 1 < window {
                out[i] = f64::NAN;
                continue;
            }
            let win = &input[i + 1 - window..=i];
            if win.iter().any(|v| !is_valid(*v)) {
                out[i] = f64::NAN;
                continue;
            }
            out[i] = win
                .iter()
                .enumerate()
                .map(|(k, &v)| (k as f64 + 1.0) * v)
                .sum::<f64>()
                / denom;
        }
    })
}

/// Wilder-style smoothed moving average:
/// `y[t] = (m·x[t] + (window - m)·y[t-1]) / window`.
pub fn sma(s: &Series, window: usize, m: usize) -> Series {
    let w = window as f64;
    let m = m as f64;
    s.per_symbol(move |input, out| {
        let mut state = f64::NAN;
        for i in 0..input.len() {
            let x = input[i];
            if is_valid(x) {
                state = if state.is_nan() {
                    x
                } else {
                    (m * x + (w - m) * state) / w
                };
            }
            out[i] = state;
        }
    })
}

pub fn diff(s: &Series, n: usize) -> Series {
    s.per_symbol(move |input, out| {
        for i in 0..input.len() {
            out[i] = if i >= n {
                input[i] - input[i - n]
            } else {
                f64::NAN
            };
        }
    })
}

/// 1 on the bar where `a` crosses above `b`, else 0.
pub fn cross(a: &Series, b: &Series) -> Result<Series, FactorError> {
    per_symbol2(a, b, |xa, xb, out| {
        for i in 0..xa.len() {
            out[i] = if i > 0 && xa[i - 1] <= xb[i - 1] && xa[i] > xb[i] {
                1.0
            } else {
                0.0
            };
        }
    })
}

/// Signal de-bounce: emit 1 on a truthy input, then suppress further
/// signals for the next `n` bars.
pub fn filter_signal(s: &Series, n: usize) -> Series {
    s.per_symbol(move |input, out| {
        let mut last_fire: Option<usize> = None;
        for i in 0..input.len() {
            let active = is_valid(input[i]) && input[i] != 0.0;
            if active && last_fire.map_or(true, |f| i - f > n) {
                out[i] = 1.0;
                last_fire = Some(i);
            } else {
                out[i] = 0.0;
            }
        }
    })
}

/// Rolling Pearson correlation; requires a full window of valid pairs.
pub fn correlation(a: &Series, b: &Series, window: usize) -> Result<Series, FactorError> {
    per_symbol2(a, b, |xa, xb, out| {
        let mut xs = Vec::with_capacity(window);
        let mut ys = Vec::with_capacity(window);
        for i in 0..xa.len() {
            if i + 1 < window {
                out[i] = f64::NAN;
                continue;
            }
            xs.clear();
            ys.clear();
            for k in i + 1 - window..=i {
                if is_valid(xa[k]) && is_valid(xb[k]) {
                    xs.push(xa[k]);
                    ys.push(xb[k]);
                }
            }
            out[i] = if xs.len() < window {
                f64::NAN
            } else {
                pearson(&xs, &ys)
            };
        }
    })
}

// ---------------------------------------------------------------------------
// Technical bundles
// ---------------------------------------------------------------------------

/// MACD histogram: `2·(DIF - DEA)` with `DIF = EMA(short) - EMA(long)`,
/// `DEA = EMA(DIF, mid)`.
pub fn macd(close: &Series, short: usize, long: usize, mid: usize) -> Result<Series, FactorError> {
    let dif = ema(close, short).zip_map(&ema(close, long), |a, b| a - b)?;
    let dea = ema(&dif, mid);
    dif.zip_map(&dea, |a, b| 2.0 * (a - b))
}

/// KDJ `J` line over the classic 9/3/3 stochastics.
pub fn kdj(close: &Series, high: &Series, low: &Series, n: usize) -> Result<Series, FactorError> {
    let lowest = ts_min(low, n);
    let highest = ts_max(high, n);
    let range = highest.zip_map(&lowest, |h, l| h - l)?;
    let rsv = close
        .zip_map(&lowest, |c, l| c - l)?
        .zip_map(&range, |num, den| if den == 0.0 { f64::NAN } else { num / den * 100.0 })?;
    let k = sma(&rsv, 3, 1);
    let d = sma(&k, 3, 1);
    k.zip_map(&d, |kv, dv| 3.0 * kv - 2.0 * dv)
}

/// Wilder RSI over one-period price changes.
pub fn rsi(close: &Series, window: usize) -> Result<Series, FactorError> {
    let change = diff(close, 1);
    let gains = change.map(|v| if v > 0.0 { v } else if v.is_nan() { f64::NAN } else { 0.0 });
    let magnitude = abs(&change);
    sma(&gains, window, 1).zip_map(&sma(&magnitude, window, 1), |g, m| {
        if m == 0.0 {
            f64::NAN
        } else {
            g / m * 100.0
        }
    })
}

/// Bollinger %B: position of the close inside the `±2σ` band.
pub fn boll(close: &Series, window: usize) -> Result<Series, FactorError> {
    let mid = ma(close, window);
    let sd = stddev(close, window);
    let lower = mid.zip_map(&sd, |m, s| m - 2.0 * s)?;
    let width = sd.map(|s| 4.0 * s);
    close
        .zip_map(&lower, |c, l| c - l)?
        .zip_map(&width, |num, den| if den == 0.0 { f64::NAN } else { num / den })
}

/// Commodity channel index over the typical price.
pub fn cci(
    close: &Series,
    high: &Series,
    low: &Series,
    window: usize,
) -> Result<Series, FactorError> {
    let tp = high
        .zip_map(low, |h, l| h + l)?
        .zip_map(close, |hl, c| (hl + c) / 3.0)?;
    Ok(tp.per_symbol(move |input, out| {
        for i in 0..input.len() {
            if i + 1 < window {
                out[i] = f64::NAN;
                continue;
            }
            let win = &input[i + 1 - window..=i];
            if win.iter().any(|v| !is_valid(*v)) {
                out[i] = f64::NAN;
                continue;
            }
            let mean = win.iter().sum::<f64>() / window as f64;
            let mean_dev = win.iter().map(|v| (v - mean).abs()).sum::<f64>() / window as f64;
            out[i] = if mean_dev == 0.0 {
                f64::NAN
            } else {
                (input[i] - mean) / (0.015 * mean_dev)
            };
        }
    }))
}

/// Average true range with Wilder smoothing.
pub fn atr(
    close: &Series,
    high: &Series,
    low: &Series,
    window: usize,
) -> Result<Series, FactorError> {
    let prev_close = delay(close, 1);
    let hl = high.zip_map(low, |h, l| h - l)?;
    let hc = high.zip_map(&prev_close, |h, pc| (h - pc).abs())?;
    let lc = low.zip_map(&prev_close, |l, pc| (l - pc).abs())?;
    let tr = hl
        .zip_map(&hc, |a, b| if b.is_nan() { a } else { a.max(b) })?
        .zip_map(&lc, |a, b| if b.is_nan() { a } else { a.max(b) })?;
    Ok(sma(&tr, window, 1))
}
