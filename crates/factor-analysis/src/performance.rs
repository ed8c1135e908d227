//! Per-group performance on the rebalance-date grid: return series,
//! cumulative curves, and the annualized metric table.

use std::collections::{BTreeSet, HashSet};

use chrono::{Datelike, NaiveDate};
use factor_core::GroupPerformanceRow;
use statrs::statistics::Statistics;

use crate::grouping::GroupedRow;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Return series of one group sampled on rebalance dates.
#[derive(Debug, Clone)]
pub struct GroupSeries {
    pub group: u32,
    pub returns: Vec<f64>,
    pub members: Vec<HashSet<String>>,
}

/// Rebalance-date grid plus per-group and benchmark series.
#[derive(Debug, Clone, Default)]
pub struct RebalancedSeries {
    pub dates: Vec<NaiveDate>,
    pub groups: Vec<GroupSeries>,
    pub benchmark: Vec<f64>,
}

/// Sample the grouped table on every `cycle`-th trading date. Each group's
/// return on a rebalance date is the equal-weighted mean forward return of
/// its members; a group with no members that date contributes 0.
pub fn rebalance_series(rows: &[GroupedRow], group_number: u32, cycle: usize) -> RebalancedSeries {
    let all_dates: BTreeSet<NaiveDate> = rows.iter().map(|r| r.date).collect();
    let dates: Vec<NaiveDate> = all_dates
        .into_iter()
        .enumerate()
        .filter(|(i, _)| i % cycle.max(1) == 0)
        .map(|(_, d)| d)
        .collect();

    let mut groups: Vec<GroupSeries> = (1..=group_number)
        .map(|group| GroupSeries {
            group,
            returns: Vec::with_capacity(dates.len()),
            members: Vec::with_capacity(dates.len()),
        })
        .collect();
    let mut benchmark = Vec::with_capacity(dates.len());

    for &date in &dates {
        let day: Vec<&GroupedRow> = rows.iter().filter(|r| r.date == date).collect();
        let day_mean = if day.is_empty() {
            0.0
        } else {
            day.iter().map(|r| r.forward_return).sum::<f64>() / day.len() as f64
        };
        benchmark.push(day_mean);

        for series in groups.iter_mut() {
            let members: Vec<&GroupedRow> =
                day.iter().copied().filter(|r| r.group == series.group).collect();
            if members.is_empty() {
                series.returns.push(0.0);
                series.members.push(HashSet::new());
            } else {
                let mean =
                    members.iter().map(|r| r.forward_return).sum::<f64>() / members.len() as f64;
                series.returns.push(mean);
                series
                    .members
                    .push(members.iter().map(|r| r.symbol.clone()).collect());
            }
        }
    }

    RebalancedSeries {
        dates,
        groups,
        benchmark,
    }
}

/// Cumulative compounded return curve: `prod(1 + r) - 1` per step.
pub fn cumulative_curve(returns: &[f64]) -> Vec<f64> {
    let mut wealth = 1.0;
    returns
        .iter()
        .map(|r| {
            wealth *= 1.0 + r;
            wealth - 1.0
        })
        .collect()
}

/// Maximum peak-to-trough drawdown of a compounded wealth curve.
pub fn max_drawdown(returns: &[f64]) -> f64 {
    let mut wealth = 1.0;
    let mut peak = 1.0;
    let mut max_dd = 0.0;
    for r in returns {
        wealth *= 1.0 + r;
        if wealth > peak {
            peak = wealth;
        }
        let drawdown = (peak - wealth) / peak;
        if drawdown > max_dd {
            max_dd = drawdown;
        }
    }
    max_dd
}

fn annualized_return(returns: &[f64], periods_per_year: f64) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let total: f64 = returns.iter().map(|r| 1.0 + r).product();
    if total <= 0.0 {
        return -1.0;
    }
    total.powf(periods_per_year / returns.len() as f64) - 1.0
}

fn annualized_volatility(returns: &[f64], periods_per_year: f64) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    returns.std_dev() * periods_per_year.sqrt()
}

/// Fraction of calendar months whose compounded return is positive.
fn monthly_win_rate(dates: &[NaiveDate], returns: &[f64]) -> f64 {
    if dates.is_empty() {
        return 0.0;
    }
    let mut months: Vec<((i32, u32), f64)> = Vec::new();
    for (&date, &r) in dates.iter().zip(returns) {
        let key = (date.year(), date.month());
        if months.last().map(|(k, _)| *k) == Some(key) {
            if let Some((_, compounded)) = months.last_mut() {
                *compounded = (1.0 + *compounded) * (1.0 + r) - 1.0;
            }
        } else {
            months.push((key, r));
        }
    }
    let wins = months.iter().filter(|(_, r)| *r > 0.0).count();
    wins as f64 / months.len() as f64
}

/// Mean fraction of membership replaced between consecutive rebalances.
fn turnover(members: &[HashSet<String>]) -> f64 {
    let mut rates = Vec::new();
    for pair in members.windows(2) {
        let (previous, current) = (&pair[0], &pair[1]);
        if current.is_empty() {
            continue;
        }
        let kept = current.intersection(previous).count();
        rates.push(1.0 - kept as f64 / current.len() as f64);
    }
    if rates.is_empty() {
        0.0
    } else {
        rates.iter().sum::<f64>() / rates.len() as f64
    }
}

/// Full metric row for one group against the benchmark.
pub fn group_metrics(
    group_name: String,
    dates: &[NaiveDate],
    returns: &[f64],
    benchmark: &[f64],
    members: &[HashSet<String>],
    cycle: usize,
) -> GroupPerformanceRow {
    let periods_per_year = TRADING_DAYS_PER_YEAR / cycle.max(1) as f64;
    let excess: Vec<f64> = returns
        .iter()
        .zip(benchmark)
        .map(|(r, b)| r - b)
        .collect();

    let annualized = annualized_return(returns, periods_per_year);
    let volatility = annualized_volatility(returns, periods_per_year);
    let sharpe = if volatility > 0.0 && !returns.is_empty() {
        returns.mean() * periods_per_year / volatility
    } else {
        0.0
    };

    let tracking_error = annualized_volatility(&excess, periods_per_year);
    let information_ratio = if tracking_error > 0.0 && !excess.is_empty() {
        excess.as_slice().mean() * periods_per_year / tracking_error
    } else {
        0.0
    };

    let cumulative = cumulative_curve(returns);

    GroupPerformanceRow {
        group_name,
        cumulative_return: cumulative.last().copied().unwrap_or(0.0),
        annualized_return: annualized,
        excess_annualized_return: annualized_return(&excess, periods_per_year),
        annualized_volatility: volatility,
        excess_annualized_volatility: tracking_error,
        maximum_drawdown: max_drawdown(returns),
        excess_maximum_drawdown: max_drawdown(&excess),
        sharpe_ratio: sharpe,
        information_ratio,
        monthly_win_rate: monthly_win_rate(dates, returns),
        excess_monthly_win_rate: monthly_win_rate(dates, &excess),
        turnover: turnover(members),
        tracking_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::tests::d;

    fn grouped(date: &str, symbol: &str, group: u32, ret: f64) -> GroupedRow {
        GroupedRow {
            date: d(date),
            symbol: symbol.to_string(),
            factor: 0.0,
            forward_return: ret,
            group,
        }
    }

    #[test]
    fn rebalance_grid_steps_by_cycle() {
        let rows: Vec<GroupedRow> = ["20240102", "20240103", "20240104", "20240105", "20240108"]
            .iter()
            .map(|date| grouped(date, "A", 1, 0.01))
            .collect();
        let series = rebalance_series(&rows, 2, 2);
        assert_eq!(series.dates, vec![d("20240102"), d("20240104"), d("20240108")]);
    }

    #[test]
    fn benchmark_is_cross_sectional_mean() {
        let rows = vec![
            grouped("20240102", "A", 2, 0.10),
            grouped("20240102", "B", 1, 0.00),
            grouped("20240102", "C", 1, -0.04),
        ];
        let series = rebalance_series(&rows, 2, 1);
        assert!((series.benchmark[0] - 0.02).abs() < 1e-12);
        // Group 1 mean over B and C.
        assert!((series.groups[0].returns[0] + 0.02).abs() < 1e-12);
        // Group 2 is just A.
        assert!((series.groups[1].returns[0] - 0.10).abs() < 1e-12);
    }

    #[test]
    fn empty_groups_contribute_zero() {
        let rows = vec![grouped("20240102", "A", 1, 0.05)];
        let series = rebalance_series(&rows, 3, 1);
        assert_eq!(series.groups[1].returns, vec![0.0]);
        assert_eq!(series.groups[2].returns, vec![0.0]);
    }

    #[test]
    fn cumulative_curve_compounds() {
        let curve = cumulative_curve(&[0.1, 0.1]);
        assert!((curve[1] - 0.21).abs() < 1e-12);
    }

    #[test]
    fn drawdown_catches_the_trough() {
        // Up 10%, down 20%, recover: trough is 20% below the peak.
        let dd = max_drawdown(&[0.1, -0.2, 0.05]);
        assert!((dd - 0.2).abs() < 1e-12);
    }

    #[test]
    fn drawdown_of_monotone_rise_is_zero() {
        assert_eq!(max_drawdown(&[0.01, 0.02, 0.03]), 0.0);
    }

    #[test]
    fn turnover_counts_membership_churn() {
        let members = vec![
            ["A", "B"].iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
            ["A", "C"].iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
        ];
        assert!((turnover(&members) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn monthly_win_rate_groups_by_month() {
        let dates = vec![d("20240102"), d("20240103"), d("20240201")];
        // January compounds positive, February negative.
        let returns = [0.05, 0.01, -0.02];
        assert!((monthly_win_rate(&dates, &returns) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn metrics_on_empty_series_are_zero() {
        let row = group_metrics("group 1".to_string(), &[], &[], &[], &[], 1);
        assert_eq!(row.cumulative_return, 0.0);
        assert_eq!(row.sharpe_ratio, 0.0);
        assert_eq!(row.maximum_drawdown, 0.0);
    }

    #[test]
    fn flat_benchmark_gives_zero_information_ratio() {
        let dates = vec![d("20240102"), d("20240103")];
        let members = vec![HashSet::new(), HashSet::new()];
        let row = group_metrics(
            "group 1".to_string(),
            &dates,
            &[0.01, 0.01],
            &[0.01, 0.01],
            &members,
            1,
        );
        assert_eq!(row.information_ratio, 0.0);
        assert_eq!(row.tracking_error, 0.0);
    }
}
