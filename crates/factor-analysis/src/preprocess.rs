//! Cross-sectional cleaning applied per date to the raw factor column:
//! outlier trimming followed by z-score standardization.

use factor_core::ExtremeValueMethod;

use crate::table::FactorObservation;

/// Scale factor turning a median absolute deviation into a robust sigma
/// estimate for normal data.
const MAD_SIGMA: f64 = 1.4826;

/// Run `f` over each same-date run. Rows must be date-sorted.
fn for_each_date(rows: &mut [FactorObservation], mut f: impl FnMut(&mut [FactorObservation])) {
    let mut start = 0;
    while start < rows.len() {
        let date = rows[start].date;
        let mut end = start + 1;
        while end < rows.len() && rows[end].date == date {
            end += 1;
        }
        f(&mut rows[start..end]);
        start = end;
    }
}

fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    if n == 0 {
        return (f64::NAN, f64::NAN);
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    if n < 2 {
        return (mean, 0.0);
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
    (mean, var.sqrt())
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Clip per-date outliers in place. NaN observations are untouched.
pub fn trim_outliers(rows: &mut [FactorObservation], method: ExtremeValueMethod) {
    for_each_date(rows, |day| {
        let valid: Vec<f64> = day.iter().map(|r| r.value).filter(|v| v.is_finite()).collect();
        if valid.is_empty() {
            return;
        }

        let (lower, upper) = match method {
            ExtremeValueMethod::Std => {
                let (mean, std) = mean_and_std(&valid);
                (mean - 3.0 * std, mean + 3.0 * std)
            }
            ExtremeValueMethod::Median => {
                let mut sorted = valid.clone();
                sorted.sort_by(|a, b| a.partial_cmp(b).expect("finite values"));
                let m = median(&sorted);
                let mut deviations: Vec<f64> = sorted.iter().map(|v| (v - m).abs()).collect();
                deviations.sort_by(|a, b| a.partial_cmp(b).expect("finite values"));
                let mad = median(&deviations);
                (m - 3.0 * MAD_SIGMA * mad, m + 3.0 * MAD_SIGMA * mad)
            }
        };

        for row in day.iter_mut() {
            if row.value.is_finite() {
                row.value = row.value.clamp(lower, upper);
            }
        }
    });
}

/// Per-date z-score with the post-trim mean and std. On a date whose std is
/// zero, or with no finite observations at all, every row (NaN included)
/// becomes 0 so a degenerate factor still produces a single flat group
/// downstream. On ordinary dates NaN observations stay NaN.
pub fn zscore(rows: &mut [FactorObservation]) {
    for_each_date(rows, |day| {
        let valid: Vec<f64> = day.iter().map(|r| r.value).filter(|v| v.is_finite()).collect();
        let (mean, std) = mean_and_std(&valid);

        if !(std > 0.0) {
            for row in day.iter_mut() {
                row.value = 0.0;
            }
            return;
        }

        for row in day.iter_mut() {
            if row.value.is_finite() {
                row.value = (row.value - mean) / std;
            }
        }
    });
}
