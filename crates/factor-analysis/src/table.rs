use std::collections::HashMap;

use chrono::NaiveDate;
use factor_core::{FactorPoint, MarketPoint};

/// One `(date, symbol, value)` observation of a factor series with a parsed
/// date, the unit the preprocessing and grouping stages work on.
#[derive(Debug, Clone, PartialEq)]
pub struct FactorObservation {
    pub date: NaiveDate,
    pub symbol: String,
    pub value: f64,
}

/// One row of the merged factor/market table after forward-return
/// attribution. Only rows with a finite factor and a finite forward return
/// survive.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedRow {
    pub date: NaiveDate,
    pub symbol: String,
    pub factor: f64,
    pub forward_return: f64,
}

/// Parse store-shaped factor points (`YYYYMMDD` dates) into observations,
/// dropping rows whose date fails to parse. Output is sorted
/// `(date, symbol)`.
pub fn observations_from_points(points: Vec<FactorPoint>) -> Vec<FactorObservation> {
    let mut rows: Vec<FactorObservation> = points
        .into_iter()
        .filter_map(|p| {
            let date = NaiveDate::parse_from_str(&p.date, "%Y%m%d").ok()?;
            Some(FactorObservation {
                date,
                symbol: p.symbol,
                value: p.value,
            })
        })
        .collect();
    rows.sort_by(|a, b| (a.date, a.symbol.as_str()).cmp(&(b.date, b.symbol.as_str())));
    rows
}

/// Merge market closes with the cleaned factor and attach `cycle`-day
/// forward returns: `close[t+cycle] / close[t] - 1` per symbol over
/// date-sorted rows. Rows without a valid forward window, a finite factor,
/// or a finite return are dropped. Output is sorted `(date, symbol)`.
pub fn align(
    market: &[MarketPoint],
    factor: &[FactorObservation],
    cycle: usize,
) -> Vec<AlignedRow> {
    // Per-symbol close curves, date ascending.
    let mut closes: HashMap<&str, Vec<(NaiveDate, f64)>> = HashMap::new();
    for point in market {
        let Ok(date) = NaiveDate::parse_from_str(&point.date, "%Y%m%d") else {
            continue;
        };
        closes
            .entry(point.symbol.as_str())
            .or_default()
            .push((date, point.close));
    }

    let mut forward: HashMap<(NaiveDate, &str), f64> = HashMap::new();
    for (symbol, curve) in closes.iter_mut() {
        curve.sort_by_key(|(date, _)| *date);
        for t in 0..curve.len().saturating_sub(cycle) {
            let (date, close) = curve[t];
            let (_, future_close) = curve[t + cycle];
            if close.is_finite() && close != 0.0 && future_close.is_finite() {
                forward.insert((date, *symbol), future_close / close - 1.0);
            }
        }
    }

    let mut rows: Vec<AlignedRow> = factor
        .iter()
        .filter(|obs| obs.value.is_finite())
        .filter_map(|obs| {
            let forward_return = *forward.get(&(obs.date, obs.symbol.as_str()))?;
            Some(AlignedRow {
                date: obs.date,
                symbol: obs.symbol.clone(),
                factor: obs.value,
                forward_return,
            })
        })
        .collect();
    rows.sort_by(|a, b| (a.date, a.symbol.as_str()).cmp(&(b.date, b.symbol.as_str())));
    rows
}
