//! Information-coefficient statistics: per-date IC/Rank-IC series, summary
//! moments, decay over lagged holding windows, and autocorrelation.

use std::collections::HashMap;

use chrono::NaiveDate;
use statrs::statistics::Statistics;

use crate::table::AlignedRow;

pub fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len();
    if n < 2 || n != ys.len() {
        return f64::NAN;
    }
    let mx = xs.mean();
    let my = ys.mean();
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

/// Average ranks with tie-averaging, 1-based.
fn average_ranks(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).expect("finite values"));
    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let avg = (i + j) as f64 / 2.0 + 1.0;
        for k in i..=j {
            ranks[order[k]] = avg;
        }
        i = j + 1;
    }
    ranks
}

pub fn spearman(xs: &[f64], ys: &[f64]) -> f64 {
    if xs.len() < 2 || xs.len() != ys.len() {
        return f64::NAN;
    }
    pearson(&average_ranks(xs), &average_ranks(ys))
}

/// Date-indexed IC (or Rank-IC) series.
#[derive(Debug, Clone, Default)]
pub struct IcSeries {
    pub dates: Vec<NaiveDate>,
    pub values: Vec<f64>,
}

/// Per-date cross-sectional correlation between factor values and forward
/// returns. A date enters the series when it has at least two surviving
/// pairs; a degenerate cross-section (zero variance) scores 0.
pub fn ic_series(rows: &[AlignedRow], rank: bool) -> IcSeries {
    let mut series = IcSeries::default();
    let mut start = 0;
    while start < rows.len() {
        let date = rows[start].date;
        let mut end = start + 1;
        while end < rows.len() && rows[end].date == date {
            end += 1;
        }
        let day = &rows[start..end];
        if day.len() >= 2 {
            let factors: Vec<f64> = day.iter().map(|r| r.factor).collect();
            let returns: Vec<f64> = day.iter().map(|r| r.forward_return).collect();
            let ic = if rank {
                spearman(&factors, &returns)
            } else {
                pearson(&factors, &returns)
            };
            series.dates.push(date);
            series.values.push(if ic.is_finite() { ic } else { 0.0 });
        }
        start = end;
    }
    series
}

/// Distribution summary of an IC series.
#[derive(Debug, Clone, Default)]
pub struct IcSummary {
    pub mean: f64,
    pub std: f64,
    pub ir: f64,
    pub positive_ratio: f64,
    pub skewness: f64,
    pub kurtosis: f64,
    pub min: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub max: f64,
}

pub fn ic_summary(values: &[f64]) -> IcSummary {
    if values.is_empty() {
        return IcSummary::default();
    }
    let n = values.len() as f64;
    let mean = values.mean();
    let std = if values.len() > 1 { values.std_dev() } else { 0.0 };
    let ir = if std > 0.0 { mean / std } else { 0.0 };
    let positive_ratio = values.iter().filter(|&&v| v > 0.0).count() as f64 / n;

    // Moment-based skewness and excess kurtosis.
    let (skewness, kurtosis) = if std > 0.0 {
        let m2 = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let m3 = values.iter().map(|v| (v - mean).powi(3)).sum::<f64>() / n;
        let m4 = values.iter().map(|v| (v - mean).powi(4)).sum::<f64>() / n;
        (m3 / m2.powf(1.5), m4 / m2.powi(2) - 3.0)
    } else {
        (0.0, 0.0)
    };

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("ic values are finite"));
    let quantile = |q: f64| -> f64 {
        let pos = q * (sorted.len() as f64 - 1.0);
        let lo = pos.floor() as usize;
        let hi = pos.ceil() as usize;
        if lo == hi {
            sorted[lo]
        } else {
            sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
        }
    };

    IcSummary {
        mean,
        std,
        ir,
        positive_ratio,
        skewness,
        kurtosis,
        min: sorted[0],
        p25: quantile(0.25),
        p50: quantile(0.5),
        p75: quantile(0.75),
        max: sorted[sorted.len() - 1],
    }
}

/// IC decay: for each lag `l in 1..=max_lag`, the mean cross-sectional
/// correlation between the factor at date `t` and the forward return
/// observed `l * cycle` trading dates later.
pub fn ic_decay(rows: &[AlignedRow], cycle: usize, max_lag: usize, rank: bool) -> Vec<f64> {
    let mut dates: Vec<NaiveDate> = rows.iter().map(|r| r.date).collect();
    dates.sort();
    dates.dedup();
    let date_index: HashMap<NaiveDate, usize> =
        dates.iter().enumerate().map(|(i, &d)| (d, i)).collect();

    // Per symbol: date index → (factor, forward_return).
    let mut per_symbol: HashMap<&str, HashMap<usize, (f64, f64)>> = HashMap::new();
    for row in rows {
        per_symbol
            .entry(row.symbol.as_str())
            .or_default()
            .insert(date_index[&row.date], (row.factor, row.forward_return));
    }

    let mut decay = Vec::with_capacity(max_lag);
    for lag in 1..=max_lag {
        let offset = lag * cycle;
        let mut day_ics = Vec::new();
        for t in 0..dates.len().saturating_sub(offset) {
            let mut factors = Vec::new();
            let mut returns = Vec::new();
            for table in per_symbol.values() {
                if let (Some(&(factor, _)), Some(&(_, future_return))) =
                    (table.get(&t), table.get(&(t + offset)))
                {
                    factors.push(factor);
                    returns.push(future_return);
                }
            }
            if factors.len() >= 2 {
                let ic = if rank {
                    spearman(&factors, &returns)
                } else {
                    pearson(&factors, &returns)
                };
                if ic.is_finite() {
                    day_ics.push(ic);
                }
            }
        }
        decay.push(if day_ics.is_empty() {
            0.0
        } else {
            day_ics.iter().sum::<f64>() / day_ics.len() as f64
        });
    }
    decay
}

/// Sample autocorrelation at lags `1..=max_lag`.
pub fn autocorrelation(values: &[f64], max_lag: usize) -> Vec<f64> {
    let n = values.len();
    if n < 2 {
        return vec![0.0; max_lag];
    }
    let mean = values.mean();
    let denom: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (1..=max_lag)
        .map(|lag| {
            if lag >= n || denom == 0.0 {
                return 0.0;
            }
            let num: f64 = (lag..n)
                .map(|t| (values[t] - mean) * (values[t - lag] - mean))
                .sum();
            num / denom
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::tests::d;

    fn row(date: &str, symbol: &str, factor: f64, ret: f64) -> AlignedRow {
        AlignedRow {
            date: d(date),
            symbol: symbol.to_string(),
            factor,
            forward_return: ret,
        }
    }

    #[test]
    fn pearson_of_perfectly_aligned_data_is_one() {
        assert!((pearson(&[1.0, 2.0, 3.0], &[10.0, 20.0, 30.0]) - 1.0).abs() < 1e-12);
        assert!((pearson(&[1.0, 2.0, 3.0], &[30.0, 20.0, 10.0]) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn spearman_ignores_monotone_distortion() {
        // y = x^3 is monotone in x: rank correlation 1, linear correlation < 1.
        let xs = [1.0, 2.0, 3.0, 4.0, 5.0];
        let ys: Vec<f64> = xs.iter().map(|x: &f64| x.powi(3)).collect();
        assert!((spearman(&xs, &ys) - 1.0).abs() < 1e-12);
        assert!(pearson(&xs, &ys) < 1.0);
    }

    #[test]
    fn ic_series_requires_two_pairs_per_date() {
        let rows = vec![
            row("20240102", "A", 0.10, 0.09),
            row("20240102", "B", 0.00, 0.0),
            row("20240102", "C", -0.03, -0.03),
            row("20240103", "A", 0.10, 0.09),
        ];
        let series = ic_series(&rows, false);
        assert_eq!(series.dates.len(), 1);
        // Monotone factor → return relationship: IC = +1.
        assert!((series.values[0] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn degenerate_cross_section_scores_zero() {
        let rows = vec![
            row("20240102", "A", 0.0, 0.01),
            row("20240102", "B", 0.0, 0.02),
        ];
        let series = ic_series(&rows, false);
        assert_eq!(series.values, vec![0.0]);
    }

    #[test]
    fn summary_of_constant_series() {
        let summary = ic_summary(&[0.5, 0.5, 0.5]);
        assert_eq!(summary.mean, 0.5);
        assert_eq!(summary.std, 0.0);
        assert_eq!(summary.ir, 0.0);
        assert_eq!(summary.positive_ratio, 1.0);
    }

    #[test]
    fn summary_percentiles_interpolate() {
        let summary = ic_summary(&[0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(summary.min, 0.0);
        assert_eq!(summary.p50, 2.0);
        assert_eq!(summary.p25, 1.0);
        assert_eq!(summary.max, 4.0);
    }

    #[test]
    fn autocorrelation_of_alternating_series_is_negative_at_lag_one() {
        let values = [1.0, -1.0, 1.0, -1.0, 1.0, -1.0];
        let acf = autocorrelation(&values, 2);
        assert!(acf[0] < -0.5);
        assert!(acf[1] > 0.5);
    }

    #[test]
    fn decay_lengths_match_max_lag() {
        let rows = vec![
            row("20240102", "A", 1.0, 0.01),
            row("20240102", "B", 2.0, 0.02),
            row("20240103", "A", 1.0, 0.01),
            row("20240103", "B", 2.0, 0.02),
        ];
        let decay = ic_decay(&rows, 1, 5, false);
        assert_eq!(decay.len(), 5);
        // Lag 1 pairs factor(t) with return(t+1) and stays perfectly aligned.
        assert!((decay[0] - 1.0).abs() < 1e-9);
        // Lags beyond the window fall back to zero.
        assert_eq!(decay[4], 0.0);
    }
}
