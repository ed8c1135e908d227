//! Assembly of the per-task artifact bundle: chart payloads, the metric
//! table, the best-group summary, and the latest-date snapshot.

use std::collections::HashMap;

use factor_core::{
    now_iso, ChartData, GroupPerformanceRow, MetricRow, OneGroupData, Params, ResultBundle,
    SeriesItem, TopFactorRow,
};
use statrs::distribution::{Continuous, Normal};

use crate::grouping::GroupedRow;
use crate::ic::{autocorrelation, ic_decay, ic_series, ic_summary, IcSeries, IcSummary};
use crate::performance::{cumulative_curve, group_metrics, rebalance_series};
use crate::table::{AlignedRow, FactorObservation};

/// Lag horizon of the decay and autocorrelation artifacts.
const MAX_LAG: usize = 10;
/// Bin count of the IC density histogram.
const DENSITY_BINS: usize = 20;
/// Size of the latest-date snapshot.
const TOP_N: usize = 20;

fn finite(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

pub struct BundleInput<'a> {
    pub task_id: &'a str,
    pub factor_name: &'a str,
    pub params: &'a Params,
    /// Cleaned factor observations, date-sorted.
    pub cleaned_factor: &'a [FactorObservation],
    /// Merged table after forward-return attribution, date-sorted.
    pub aligned: &'a [AlignedRow],
    /// Grouped rows from the grouping stage.
    pub grouped: &'a [GroupedRow],
    /// Display names for snapshot enrichment.
    pub symbol_names: &'a HashMap<String, String>,
}

/// Build the full result bundle. Empty inputs produce a bundle whose arrays
/// are all empty; the bundle is still written so the task can finish
/// successfully.
pub fn build_bundle(input: BundleInput<'_>) -> ResultBundle {
    let cycle = input.params.adjustment_cycle as usize;
    let group_number = input.params.group_number;

    let ic = ic_series(input.aligned, false);
    let rank_ic = ic_series(input.aligned, true);
    let ic_stats = ic_summary(&ic.values);
    let rank_ic_stats = ic_summary(&rank_ic.values);

    let reb = rebalance_series(input.grouped, group_number, cycle);
    let date_labels: Vec<String> = reb.dates.iter().map(|d| d.format("%Y-%m-%d").to_string()).collect();

    // Per-group cumulative and excess curves plus the metric table.
    let mut return_series = Vec::with_capacity(reb.groups.len() + 1);
    let mut excess_series = Vec::with_capacity(reb.groups.len());
    let mut group_rows: Vec<GroupPerformanceRow> = Vec::with_capacity(reb.groups.len());
    for group in &reb.groups {
        let name = format!("group {}", group.group);
        let curve: Vec<f64> = cumulative_curve(&group.returns).into_iter().map(finite).collect();
        return_series.push(SeriesItem::numbers(name.clone(), curve));

        let excess: Vec<f64> = group
            .returns
            .iter()
            .zip(&reb.benchmark)
            .map(|(r, b)| r - b)
            .collect();
        let excess_curve: Vec<f64> = cumulative_curve(&excess).into_iter().map(finite).collect();
        excess_series.push(SeriesItem::numbers(name.clone(), excess_curve));

        group_rows.push(group_metrics(
            name,
            &reb.dates,
            &group.returns,
            &reb.benchmark,
            &group.members,
            cycle,
        ));
    }
    let benchmark_curve: Vec<f64> = cumulative_curve(&reb.benchmark).into_iter().map(finite).collect();
    return_series.push(SeriesItem::numbers("benchmark", benchmark_curve));

    let return_chart = ChartData::new(
        format!("{} cumulative returns by group", input.factor_name),
        vec![SeriesItem::labels("date", date_labels.clone())],
        return_series,
    );
    let excess_chart = ChartData::new(
        format!("{} excess returns by group", input.factor_name),
        vec![SeriesItem::labels("date", date_labels.clone())],
        excess_series,
    );
    // Group 1 is the theoretically best side after direction handling.
    let simple_curve = reb
        .groups
        .first()
        .map(|g| cumulative_curve(&g.returns).into_iter().map(finite).collect())
        .unwrap_or_default();
    let simple_return_chart = ChartData::new(
        format!("{} best group return", input.factor_name),
        vec![SeriesItem::labels("date", date_labels)],
        vec![SeriesItem::numbers("group 1", simple_curve)],
    );

    let one_group_data = group_rows
        .first()
        .map(|row| OneGroupData {
            return_ratio: finite(row.cumulative_return),
            annualized_ratio: finite(row.annualized_return),
            sharpe_ratio: finite(row.sharpe_ratio),
            maximum_drawdown: finite(row.maximum_drawdown),
        })
        .unwrap_or_default();

    let factor_data_analysis = metric_table(&ic_stats, &rank_ic_stats);

    let ic_decay_values = ic_decay(input.aligned, cycle, MAX_LAG, false);
    let rank_ic_decay_values = ic_decay(input.aligned, cycle, MAX_LAG, true);

    ResultBundle {
        task_id: input.task_id.to_string(),
        group_return_analysis: group_rows,
        return_chart,
        simple_return_chart,
        excess_chart,
        ic_sequence_chart: sequence_chart("IC sequence", "IC", &ic),
        ic_density_chart: density_chart("IC distribution", &ic.values),
        ic_decay_chart: lag_chart("IC decay", "IC", &ic_decay_values),
        ic_self_correlation_chart: lag_chart(
            "IC autocorrelation",
            "ACF",
            &autocorrelation(&ic.values, MAX_LAG),
        ),
        rank_ic_sequence_chart: sequence_chart("Rank IC sequence", "Rank IC", &rank_ic),
        rank_ic_density_chart: density_chart("Rank IC distribution", &rank_ic.values),
        rank_ic_decay_chart: lag_chart("Rank IC decay", "Rank IC", &rank_ic_decay_values),
        rank_ic_self_correlation_chart: lag_chart(
            "Rank IC autocorrelation",
            "ACF",
            &autocorrelation(&rank_ic.values, MAX_LAG),
        ),
        factor_data_analysis,
        one_group_data,
        last_date_top_factor: top_snapshot(input.cleaned_factor, input.symbol_names),
        created_at: now_iso(),
    }
}

fn metric_table(ic: &IcSummary, rank_ic: &IcSummary) -> Vec<MetricRow> {
    let mut rows = Vec::with_capacity(12);
    let mut push = |metric: &str, value: f64| {
        rows.push(MetricRow {
            metric: metric.to_string(),
            value: finite(value),
        });
    };
    push("IC_mean", ic.mean);
    push("IC_std", ic.std);
    push("IC_IR", ic.ir);
    push("IC_positive_ratio", ic.positive_ratio);
    push("IC_skewness", ic.skewness);
    push("IC_kurtosis", ic.kurtosis);
    push("Rank_IC_mean", rank_ic.mean);
    push("Rank_IC_std", rank_ic.std);
    push("Rank_IC_IR", rank_ic.ir);
    push("Rank_IC_positive_ratio", rank_ic.positive_ratio);
    push("Rank_IC_skewness", rank_ic.skewness);
    push("Rank_IC_kurtosis", rank_ic.kurtosis);
    rows
}

fn sequence_chart(title: &str, series_name: &str, series: &IcSeries) -> ChartData {
    ChartData::new(
        title,
        vec![SeriesItem::labels(
            "date",
            series.dates.iter().map(|d| d.format("%Y-%m-%d").to_string()).collect(),
        )],
        vec![SeriesItem::numbers(
            series_name,
            series.values.iter().copied().map(finite).collect(),
        )],
    )
}

fn lag_chart(title: &str, series_name: &str, values: &[f64]) -> ChartData {
    ChartData::new(
        title,
        vec![SeriesItem::labels(
            "lag",
            (1..=values.len()).map(|l| l.to_string()).collect(),
        )],
        vec![SeriesItem::numbers(
            series_name,
            values.iter().copied().map(finite).collect(),
        )],
    )
}

/// Histogram of the IC values with a fitted normal overlay when the series
/// has spread.
fn density_chart(title: &str, values: &[f64]) -> ChartData {
    if values.is_empty() {
        return ChartData::empty(title);
    }
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let width = if max > min {
        (max - min) / DENSITY_BINS as f64
    } else {
        1.0
    };

    let mut counts = vec![0.0; DENSITY_BINS];
    for &v in values {
        let bin = (((v - min) / width) as usize).min(DENSITY_BINS - 1);
        counts[bin] += 1.0;
    }
    let centers: Vec<f64> = (0..DENSITY_BINS)
        .map(|i| min + (i as f64 + 0.5) * width)
        .collect();

    let mut y = vec![SeriesItem::numbers("count", counts)];

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std = if values.len() > 1 {
        (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    } else {
        0.0
    };
    if std > 0.0 {
        if let Ok(normal) = Normal::new(mean, std) {
            let curve: Vec<f64> = centers.iter().map(|&c| normal.pdf(c) * n * width).collect();
            y.push(SeriesItem::numbers("normal", curve));
        }
    }

    ChartData::new(title, vec![SeriesItem::numbers("ic", centers)], y)
}

/// Top symbols by factor value on the most recent date, enriched with
/// display names.
fn top_snapshot(
    cleaned: &[FactorObservation],
    names: &HashMap<String, String>,
) -> Vec<TopFactorRow> {
    let Some(last_date) = cleaned.iter().map(|r| r.date).max() else {
        return Vec::new();
    };
    let mut rows: Vec<&FactorObservation> = cleaned
        .iter()
        .filter(|r| r.date == last_date && r.value.is_finite())
        .collect();
    rows.sort_by(|a, b| b.value.partial_cmp(&a.value).expect("finite values"));
    rows.truncate(TOP_N);
    rows.into_iter()
        .map(|r| TopFactorRow {
            symbol: r.symbol.clone(),
            name: names.get(&r.symbol).cloned(),
            value: r.value,
            date: last_date.format("%Y%m%d").to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::assign_groups;
    use crate::preprocess::zscore;
    use crate::table::tests::{d, synthetic_market};
    use crate::table::{align, observations_from_points};
    use factor_core::{
        ExtremeValueMethod, FactorDirection, FactorPoint, Params,
    };

    fn params(groups: u32) -> Params {
        Params {
            start_date: "2024-01-02".to_string(),
            end_date: "2024-01-05".to_string(),
            adjustment_cycle: 1,
            stock_pool: "000985".to_string(),
            factor_direction: FactorDirection::Positive,
            group_number: groups,
            include_st: true,
            extreme_value_processing: ExtremeValueMethod::Median,
        }
    }

    /// The close/open-1 factor over the synthetic three-symbol universe:
    /// A rising, B flat, C falling.
    fn close_over_open_points() -> Vec<FactorPoint> {
        synthetic_market()
            .iter()
            .map(|p| FactorPoint {
                date: p.date.clone(),
                symbol: p.symbol.clone(),
                value: p.close / p.open - 1.0,
            })
            .collect()
    }

    #[test]
    fn end_to_end_bundle_on_the_synthetic_universe() {
        let market = synthetic_market();
        let factor = observations_from_points(close_over_open_points());
        let aligned = align(&market, &factor, 1);
        let p = params(2);
        let (grouped, _) = assign_groups(&aligned, 2, FactorDirection::Positive);

        let bundle = build_bundle(BundleInput {
            task_id: "t1",
            factor_name: "close_over_open",
            params: &p,
            cleaned_factor: &factor,
            aligned: &aligned,
            grouped: &grouped,
            symbol_names: &HashMap::new(),
        });

        assert_eq!(bundle.task_id, "t1");
        assert_eq!(bundle.group_return_analysis.len(), 2);
        // 0102-0104 have forward windows; A>B>C in both factor and forward
        // return on each, so the Pearson IC is near one and the Rank IC is
        // exactly one.
        assert_eq!(bundle.ic_sequence_chart.y[0].data.len(), 3);
        let first_ic = match &bundle.ic_sequence_chart.y[0].data[0] {
            factor_core::ChartValue::Number(v) => *v,
            other => panic!("expected a number, got {other:?}"),
        };
        assert!(first_ic > 0.99);
        let first_rank_ic = match &bundle.rank_ic_sequence_chart.y[0].data[0] {
            factor_core::ChartValue::Number(v) => *v,
            other => panic!("expected a number, got {other:?}"),
        };
        assert!((first_rank_ic - 1.0).abs() < 1e-9);
        // Group 2 holds the rising symbol; its first return is positive.
        let row = &bundle.group_return_analysis[1];
        assert!(row.cumulative_return > 0.0);
        assert_eq!(bundle.factor_data_analysis[0].metric, "IC_mean");
        assert!(bundle.factor_data_analysis[0].value > 0.99);
    }

    #[test]
    fn empty_inputs_yield_empty_bundle() {
        let p = params(2);
        let bundle = build_bundle(BundleInput {
            task_id: "t2",
            factor_name: "f",
            params: &p,
            cleaned_factor: &[],
            aligned: &[],
            grouped: &[],
            symbol_names: &HashMap::new(),
        });
        assert!(bundle.ic_sequence_chart.y[0].data.is_empty());
        assert!(bundle.last_date_top_factor.is_empty());
        assert_eq!(bundle.one_group_data.return_ratio, 0.0);
        assert!(bundle.ic_density_chart.x.is_empty());
    }

    #[test]
    fn all_nan_factor_degrades_to_flat_group_one() {
        let market = synthetic_market();
        let mut factor: Vec<FactorObservation> = synthetic_market()
            .iter()
            .map(|point| FactorObservation {
                date: d(&point.date),
                symbol: point.symbol.clone(),
                value: f64::NAN,
            })
            .collect();
        factor.sort_by(|a, b| (a.date, a.symbol.clone()).cmp(&(b.date, b.symbol.clone())));
        zscore(&mut factor);
        assert!(factor.iter().all(|r| r.value == 0.0));

        let aligned = align(&market, &factor, 1);
        let p = params(3);
        let (grouped, _) = assign_groups(&aligned, 3, FactorDirection::Positive);
        assert!(grouped.iter().all(|g| g.group == 1));

        let bundle = build_bundle(BundleInput {
            task_id: "t3",
            factor_name: "nan_factor",
            params: &p,
            cleaned_factor: &factor,
            aligned: &aligned,
            grouped: &grouped,
            symbol_names: &HashMap::new(),
        });
        // Degenerate cross-sections score IC 0 on every date.
        assert!(bundle
            .factor_data_analysis
            .iter()
            .all(|row| row.value == 0.0));
    }

    #[test]
    fn top_snapshot_sorts_and_names() {
        let factor = vec![
            FactorObservation {
                date: d("20240105"),
                symbol: "A".to_string(),
                value: 1.0,
            },
            FactorObservation {
                date: d("20240105"),
                symbol: "B".to_string(),
                value: 2.0,
            },
        ];
        let names: HashMap<String, String> =
            [("B".to_string(), "Bravo Corp".to_string())].into_iter().collect();
        let rows = top_snapshot(&factor, &names);
        assert_eq!(rows[0].symbol, "B");
        assert_eq!(rows[0].name.as_deref(), Some("Bravo Corp"));
        assert_eq!(rows[1].symbol, "A");
    }
}
