//! N-quantile grouping per date with forward-return attribution and the
//! equal-weighted benchmark.

use chrono::NaiveDate;
use factor_core::FactorDirection;

use crate::table::AlignedRow;

/// One surviving row with its assigned quantile group, `1..=group_number`.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedRow {
    pub date: NaiveDate,
    pub symbol: String,
    pub factor: f64,
    pub forward_return: f64,
    pub group: u32,
}

/// Partition each date's surviving symbols into `group_number` buckets of
/// approximately equal count by ascending factor value. Ranking is stable
/// (rows arrive symbol-sorted) and a run of tied values always takes the
/// group of its first member, so ties go to the lower group. With a
/// negative factor direction the labels are inverted so group 1 stays the
/// theoretically best side.
///
/// Also returns the per-date benchmark: the equal-weighted mean forward
/// return across all surviving symbols of the date.
pub fn assign_groups(
    rows: &[AlignedRow],
    group_number: u32,
    direction: FactorDirection,
) -> (Vec<GroupedRow>, Vec<(NaiveDate, f64)>) {
    let mut grouped = Vec::with_capacity(rows.len());
    let mut benchmark = Vec::new();

    let mut start = 0;
    while start < rows.len() {
        let date = rows[start].date;
        let mut end = start + 1;
        while end < rows.len() && rows[end].date == date {
            end += 1;
        }
        let day = &rows[start..end];

        let mean_return = day.iter().map(|r| r.forward_return).sum::<f64>() / day.len() as f64;
        benchmark.push((date, mean_return));

        // Stable ascending sort by factor value.
        let mut order: Vec<usize> = (0..day.len()).collect();
        order.sort_by(|&a, &b| {
            day[a]
                .factor
                .partial_cmp(&day[b].factor)
                .expect("aligned rows have finite factors")
        });

        let n = day.len();
        let mut groups = vec![0u32; n];
        let mut run_start = 0;
        while run_start < n {
            let mut run_end = run_start + 1;
            while run_end < n && day[order[run_end]].factor == day[order[run_start]].factor {
                run_end += 1;
            }
            // Whole tie-run takes the floor-partition group of its first slot.
            let group = (run_start * group_number as usize / n) as u32 + 1;
            for k in run_start..run_end {
                groups[order[k]] = group;
            }
            run_start = run_end;
        }

        for (offset, row) in day.iter().enumerate() {
            let mut group = groups[offset];
            if direction == FactorDirection::Negative {
                group = group_number + 1 - group;
            }
            grouped.push(GroupedRow {
                date: row.date,
                symbol: row.symbol.clone(),
                factor: row.factor,
                forward_return: row.forward_return,
                group,
            });
        }

        start = end;
    }

    (grouped, benchmark)
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
    fn three_symbols_two_groups_split_one_two() {
        // Ascending factor order: C < B < A.
        let rows = vec![
            row("20240102", "A", 0.10, 0.09),
            row("20240102", "B", 0.00, 0.0),
            row("20240102", "C", -0.03, -0.03),
        ];
        let (grouped, benchmark) = assign_groups(&rows, 2, FactorDirection::Positive);
        let by_symbol: std::collections::HashMap<&str, u32> =
            grouped.iter().map(|g| (g.symbol.as_str(), g.group)).collect();
        assert_eq!(by_symbol["A"], 2);
        assert_eq!(by_symbol["B"], 1);
        assert_eq!(by_symbol["C"], 1);
        assert_eq!(benchmark.len(), 1);
        assert!((benchmark[0].1 - (0.09 - 0.03) / 3.0).abs() < 1e-12);
    }

    #[test]
    fn label_count_matches_group_number_with_enough_symbols() {
        let rows: Vec<AlignedRow> = (0..20)
            .map(|i| row("20240102", &format!("S{i:02}"), i as f64, 0.0))
            .collect();
        let (grouped, _) = assign_groups(&rows, 5, FactorDirection::Positive);
        let labels: std::collections::HashSet<u32> = grouped.iter().map(|g| g.group).collect();
        assert_eq!(labels.len(), 5);
        // Equal counts: 4 per group.
        for g in 1..=5 {
            assert_eq!(grouped.iter().filter(|r| r.group == g).count(), 4);
        }
    }

    #[test]
    fn all_ties_collapse_into_group_one() {
        let rows: Vec<AlignedRow> = (0..6)
            .map(|i| row("20240102", &format!("S{i}"), 0.0, 0.01))
            .collect();
        let (grouped, _) = assign_groups(&rows, 3, FactorDirection::Positive);
        assert!(grouped.iter().all(|g| g.group == 1));
    }

    #[test]
    fn ties_at_a_boundary_go_down() {
        // Four rows, two groups; the two middle rows are tied with the
        // lowest value, so the tie-run starts at slot 0 and all three stay
        // in group 1.
        let rows = vec![
            row("20240102", "A", 1.0, 0.0),
            row("20240102", "B", 1.0, 0.0),
            row("20240102", "C", 1.0, 0.0),
            row("20240102", "D", 2.0, 0.0),
        ];
        let (grouped, _) = assign_groups(&rows, 2, FactorDirection::Positive);
        let by_symbol: std::collections::HashMap<&str, u32> =
            grouped.iter().map(|g| (g.symbol.as_str(), g.group)).collect();
        assert_eq!(by_symbol["A"], 1);
        assert_eq!(by_symbol["B"], 1);
        assert_eq!(by_symbol["C"], 1);
        assert_eq!(by_symbol["D"], 2);
    }

    #[test]
    fn negative_direction_inverts_labels() {
        let rows = vec![
            row("20240102", "A", 0.10, 0.0),
            row("20240102", "B", 0.00, 0.0),
            row("20240102", "C", -0.03, 0.0),
        ];
        let (grouped, _) = assign_groups(&rows, 2, FactorDirection::Negative);
        let by_symbol: std::collections::HashMap<&str, u32> =
            grouped.iter().map(|g| (g.symbol.as_str(), g.group)).collect();
        assert_eq!(by_symbol["A"], 1);
        assert_eq!(by_symbol["B"], 2);
        assert_eq!(by_symbol["C"], 2);
    }

    #[test]
    fn dates_are_grouped_independently() {
        let rows = vec![
            row("20240102", "A", 1.0, 0.0),
            row("20240102", "B", 2.0, 0.0),
            row("20240103", "A", 2.0, 0.0),
            row("20240103", "B", 1.0, 0.0),
        ];
        let (grouped, benchmark) = assign_groups(&rows, 2, FactorDirection::Positive);
        assert_eq!(benchmark.len(), 2);
        let first_day_a = grouped.iter().find(|g| g.date == d("20240102") && g.symbol == "A").unwrap();
        let second_day_a = grouped.iter().find(|g| g.date == d("20240103") && g.symbol == "A").unwrap();
        assert_eq!(first_day_a.group, 1);
        assert_eq!(second_day_a.group, 2);
    }
}
