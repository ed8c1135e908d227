use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::NaiveDate;
use factor_core::{FactorError, FactorPoint};

/// Shared row index of an aligned `(date, symbol)` frame.
///
/// Rows are sorted by `(symbol, date)` so per-symbol time-series operators
/// work on contiguous date-ascending slices; `date_rows` gives the
/// cross-sectional view for per-date operators.
#[derive(Debug)]
pub struct FrameIndex {
    symbols: Vec<String>,
    keys: Vec<(u32, NaiveDate)>,
    symbol_runs: Vec<(usize, usize)>,
    date_rows: Vec<(NaiveDate, Vec<u32>)>,
}

impl FrameIndex {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Contiguous `[start, end)` row ranges, one per symbol, date-ascending
    /// inside each range.
    pub fn symbol_runs(&self) -> &[(usize, usize)] {
        &self.symbol_runs
    }

    /// Row indices per date, date-ascending.
    pub fn date_rows(&self) -> &[(NaiveDate, Vec<u32>)] {
        &self.date_rows
    }

    pub fn key(&self, row: usize) -> (&str, NaiveDate) {
        let (sym, date) = self.keys[row];
        (&self.symbols[sym as usize], date)
    }
}

/// One `(date, symbol) → f64` column bound to a shared [`FrameIndex`].
#[derive(Debug, Clone)]
pub struct Series {
    index: Arc<FrameIndex>,
    values: Arc<Vec<f64>>,
}

impl Series {
    pub fn new(index: Arc<FrameIndex>, values: Vec<f64>) -> Self {
        debug_assert_eq!(index.len(), values.len());
        Series {
            index,
            values: Arc::new(values),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn index(&self) -> &Arc<FrameIndex> {
        &self.index
    }

    /// Materialize as `(date, symbol, value)` rows with compact `YYYYMMDD`
    /// dates, the shape the store persists.
    pub fn to_points(&self) -> Vec<FactorPoint> {
        (0..self.len())
            .map(|row| {
                let (symbol, date) = self.index.key(row);
                FactorPoint {
                    date: date.format("%Y%m%d").to_string(),
                    symbol: symbol.to_string(),
                    value: self.values[row],
                }
            })
            .collect()
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Series {
        Series::new(self.index.clone(), self.values.iter().map(|&v| f(v)).collect())
    }

    pub fn zip_map(&self, other: &Series, f: impl Fn(f64, f64) -> f64) -> Result<Series, FactorError> {
        if self.len() != other.len() {
            return Err(FactorError::computation(
                "series operands are not aligned to the same frame",
            ));
        }
        let values = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(&a, &b)| f(a, b))
            .collect();
        Ok(Series::new(self.index.clone(), values))
    }

    /// Apply a per-symbol transform: `f` receives the date-ascending input
    /// slice of one symbol and writes the output slice in place.
    pub fn per_symbol(&self, f: impl Fn(&[f64], &mut [f64])) -> Series {
        let mut out = vec![f64::NAN; self.len()];
        for &(start, end) in self.index.symbol_runs() {
            f(&self.values[start..end], &mut out[start..end]);
        }
        Series::new(self.index.clone(), out)
    }

    /// Apply a per-date cross-sectional transform: `f` receives the values
    /// of one date and writes the same-length output.
    pub fn per_date(&self, f: impl Fn(&[f64], &mut [f64])) -> Series {
        let mut out = vec![f64::NAN; self.len()];
        let mut buf = Vec::new();
        let mut res = Vec::new();
        for (_, rows) in self.index.date_rows() {
            buf.clear();
            buf.extend(rows.iter().map(|&r| self.values[r as usize]));
            res.clear();
            res.resize(buf.len(), f64::NAN);
            f(&buf, &mut res);
            for (&row, &v) in rows.iter().zip(res.iter()) {
                out[row as usize] = v;
            }
        }
        Series::new(self.index.clone(), out)
    }
}

/// An aligned table of named columns over one `(date, symbol)` index; the
/// evaluation substrate of the expression engine.
#[derive(Debug)]
pub struct Frame {
    index: Arc<FrameIndex>,
    columns: HashMap<String, Arc<Vec<f64>>>,
}

impl Frame {
    pub fn builder(columns: Vec<String>) -> FrameBuilder {
        FrameBuilder {
            columns,
            dates: Vec::new(),
            symbols: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn index(&self) -> &Arc<FrameIndex> {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Option<Series> {
        self.columns.get(name).map(|values| Series {
            index: self.index.clone(),
            values: values.clone(),
        })
    }

    pub fn constant(&self, value: f64) -> Series {
        Series::new(self.index.clone(), vec![value; self.len()])
    }
}

/// Row-at-a-time builder; rows may arrive in any order and are sorted into
/// the canonical `(symbol, date)` layout on `build`.
pub struct FrameBuilder {
    columns: Vec<String>,
    dates: Vec<NaiveDate>,
    symbols: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl FrameBuilder {
    pub fn push(&mut self, date: NaiveDate, symbol: &str, values: &[f64]) {
        debug_assert_eq!(values.len(), self.columns.len());
        self.dates.push(date);
        self.symbols.push(symbol.to_string());
        self.rows.push(values.to_vec());
    }

    pub fn build(self) -> Frame {
        let n = self.dates.len();

        let mut symbol_names: Vec<String> = self.symbols.clone();
        symbol_names.sort();
        symbol_names.dedup();
        let symbol_ids: HashMap<&str, u32> = symbol_names
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), i as u32))
            .collect();

        let mut perm: Vec<usize> = (0..n).collect();
        perm.sort_by_key(|&i| (symbol_ids[self.symbols[i].as_str()], self.dates[i]));

        let keys: Vec<(u32, NaiveDate)> = perm
            .iter()
            .map(|&i| (symbol_ids[self.symbols[i].as_str()], self.dates[i]))
            .collect();

        let mut symbol_runs = Vec::new();
        let mut run_start = 0;
        for row in 1..=n {
            if row == n || keys[row].0 != keys[run_start].0 {
                symbol_runs.push((run_start, row));
                run_start = row;
            }
        }

        let mut by_date: BTreeMap<NaiveDate, Vec<u32>> = BTreeMap::new();
        for (row, &(_, date)) in keys.iter().enumerate() {
            by_date.entry(date).or_default().push(row as u32);
        }
        let date_rows: Vec<(NaiveDate, Vec<u32>)> = by_date.into_iter().collect();

        let index = Arc::new(FrameIndex {
            symbols: symbol_names,
            keys,
            symbol_runs,
            date_rows,
        });

        let columns = self
            .columns
            .iter()
            .enumerate()
            .map(|(col, name)| {
                let values: Vec<f64> = perm.iter().map(|&i| self.rows[i][col]).collect();
                (name.clone(), Arc::new(values))
            })
            .collect();

        Frame { index, columns }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y%m%d").unwrap()
    }

    pub(crate) fn sample_frame() -> Frame {
        let mut b = Frame::builder(vec!["close".to_string(), "open".to_string()]);
        // Deliberately unsorted input.
        b.push(d("20240103"), "B", &[20.0, 20.0]);
        b.push(d("20240102"), "A", &[10.0, 9.0]);
        b.push(d("20240103"), "A", &[11.0, 10.0]);
        b.push(d("20240102"), "B", &[20.0, 20.0]);
        b.build()
    }

    #[test]
    fn builds_sorted_runs_and_date_groups() {
        let frame = sample_frame();
        let index = frame.index();
        assert_eq!(index.len(), 4);
        assert_eq!(index.symbol_runs().len(), 2);
        assert_eq!(index.date_rows().len(), 2);

        // First run is symbol A, date ascending.
        let (start, end) = index.symbol_runs()[0];
        assert_eq!(end - start, 2);
        assert_eq!(index.key(start), ("A", d("20240102")));
        assert_eq!(index.key(start + 1), ("A", d("20240103")));
    }

    #[test]
    fn column_values_follow_the_permutation() {
        let frame = sample_frame();
        let close = frame.column("close").unwrap();
        // Rows: (A, 0102)=10, (A, 0103)=11, (B, 0102)=20, (B, 0103)=20.
        assert_eq!(close.values(), &[10.0, 11.0, 20.0, 20.0]);
    }

    #[test]
    fn to_points_round_trips_keys() {
        let frame = sample_frame();
        let points = frame.column("open").unwrap().to_points();
        assert_eq!(points.len(), 4);
        assert_eq!(points[0].date, "20240102");
        assert_eq!(points[0].symbol, "A");
        assert_eq!(points[0].value, 9.0);
    }
}
