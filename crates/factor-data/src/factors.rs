use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use factor_core::{BaseFactorPoint, FactorDefinition, FactorError, FactorPoint, MarketPoint};
use factor_expr::{Frame, Series};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use mongodb::bson::doc;
use mongodb::options::FindOptions;

use crate::market::{chunk_date_range, estimate_batch_size, MarketDataReader, MarketQuery};
use crate::store::DocumentStore;

/// Market columns always loaded for on-demand factor computation.
const MARKET_COLUMNS: [&str; 6] = ["open", "high", "low", "close", "volume", "amount"];
/// Columns resolved from the base-factor table when the code references them.
const BASE_COLUMNS: [&str; 2] = ["turnover", "market_cap"];

/// Resolves a factor series: persisted-collection fast path when
/// `factor_<factor_name>_<user_id>` exists, on-demand evaluation otherwise.
#[derive(Clone)]
pub struct FactorSeriesLoader {
    store: Arc<DocumentStore>,
    market: MarketDataReader,
}

impl FactorSeriesLoader {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        let market = MarketDataReader::new(store.clone());
        FactorSeriesLoader { store, market }
    }

    pub fn market(&self) -> &MarketDataReader {
        &self.market
    }

    /// Chunked read of named base-factor columns over `[start, end]`.
    pub async fn load_base_factors(
        &self,
        start: &str,
        end: &str,
        names: &[String],
    ) -> Result<Vec<BaseFactorPoint>, FactorError> {
        let chunks = chunk_date_range(start, end)?;
        let batch_size = estimate_batch_size(Some(names));

        let mut projection = doc! { "date": 1, "symbol": 1, "_id": 0 };
        for name in names {
            projection.insert(name.as_str(), 1);
        }

        let fetches = chunks.into_iter().map(|(chunk_start, chunk_end)| {
            let filter = doc! { "date": { "$gte": chunk_start, "$lte": chunk_end } };
            let options = FindOptions::builder()
                .projection(projection.clone())
                .batch_size(batch_size)
                .build();
            let coll = self.store.collection::<BaseFactorPoint>("factor_base");
            async move {
                let cursor = coll.find(filter, options).await?;
                cursor.try_collect::<Vec<BaseFactorPoint>>().await
            }
        });

        let mut rows = Vec::new();
        let mut results = stream::iter(fetches).buffer_unordered(8);
        while let Some(chunk_rows) = results.next().await {
            rows.extend(chunk_rows?);
        }
        Ok(rows)
    }

    /// Load (or compute) the custom-factor series for `[start, end]`, both
    /// `YYYYMMDD`.
    pub async fn load_custom_factor(
        &self,
        definition: &FactorDefinition,
        start: &str,
        end: &str,
    ) -> Result<Vec<FactorPoint>, FactorError> {
        let collection_name = definition.series_collection();
        if self.store.collection_exists(&collection_name).await? {
            tracing::debug!(collection = %collection_name, "reading persisted factor series");
            let filter = doc! { "date": { "$gte": start, "$lte": end } };
            let cursor = self
                .store
                .collection::<FactorPoint>(&collection_name)
                .find(filter, None)
                .await?;
            let rows: Vec<FactorPoint> = cursor.try_collect().await?;
            if rows.is_empty() {
                tracing::warn!(
                    collection = %collection_name,
                    "persisted factor series has no rows in the requested range"
                );
            }
            return Ok(rows);
        }

        let series = self.compute_factor(definition, start, end).await?;
        Ok(series.to_points())
    }

    async fn compute_factor(
        &self,
        definition: &FactorDefinition,
        start: &str,
        end: &str,
    ) -> Result<Series, FactorError> {
        let symbols = self
            .market
            .resolve_universe(&definition.params.stock_pool, definition.params.include_st)
            .await?;
        if symbols.is_empty() {
            return Err(FactorError::DataAvailability(format!(
                "no symbols match pool {} (include_st: {})",
                definition.params.stock_pool, definition.params.include_st
            )));
        }

        let mut query = MarketQuery::range(start, end);
        query.pool = definition.params.stock_pool.clone();
        query.include_st = definition.params.include_st;
        query.symbols = Some(symbols);
        query.fields = Some(MARKET_COLUMNS.iter().map(|c| c.to_string()).collect());
        let market_rows = self.market.load_market(&query).await?;
        if market_rows.is_empty() {
            return Err(FactorError::DataAvailability(format!(
                "no market data between {start} and {end}"
            )));
        }

        // Base-factor columns are only worth a second read when the code
        // actually references them.
        let code = definition.code.to_ascii_lowercase();
        let extra: Vec<String> = BASE_COLUMNS
            .iter()
            .filter(|c| code.contains(*c))
            .map(|c| c.to_string())
            .collect();
        let base_rows = if extra.is_empty() {
            Vec::new()
        } else {
            self.load_base_factors(start, end, &extra).await?
        };

        let frame = build_frame(&market_rows, &base_rows, &extra);
        factor_expr::evaluate(&frame, &definition.code, definition.code_type)
    }
}

/// Merge market and base-factor rows into one aligned frame keyed
/// `(date, symbol)`. Rows with unparseable dates are skipped.
pub fn build_frame(
    market_rows: &[MarketPoint],
    base_rows: &[BaseFactorPoint],
    extra_columns: &[String],
) -> Frame {
    let base_lookup: HashMap<(&str, &str), &BaseFactorPoint> = base_rows
        .iter()
        .map(|row| ((row.date.as_str(), row.symbol.as_str()), row))
        .collect();

    let mut columns: Vec<String> = MARKET_COLUMNS.iter().map(|c| c.to_string()).collect();
    columns.extend(extra_columns.iter().cloned());
    let mut builder = Frame::builder(columns);

    let mut values = Vec::with_capacity(MARKET_COLUMNS.len() + extra_columns.len());
    for row in market_rows {
        let Ok(date) = NaiveDate::parse_from_str(&row.date, "%Y%m%d") else {
            tracing::warn!(date = %row.date, symbol = %row.symbol, "skipping row with bad date");
            continue;
        };
        values.clear();
        values.extend([row.open, row.high, row.low, row.close, row.volume, row.amount]);
        for column in extra_columns {
            values.push(
                base_lookup
                    .get(&(row.date.as_str(), row.symbol.as_str()))
                    .map(|base| base.value(column))
                    .unwrap_or(f64::NAN),
            );
        }
        builder.push(date, &row.symbol, &values);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market_point(date: &str, symbol: &str, close: f64) -> MarketPoint {
        MarketPoint {
            date: date.to_string(),
            symbol: symbol.to_string(),
            name: None,
            open: close * 0.99,
            high: close * 1.01,
            low: close * 0.98,
            close,
            pre_close: f64::NAN,
            volume: 1_000.0,
            amount: 1_000.0 * close,
            limit_up: f64::NAN,
            limit_down: f64::NAN,
            index_component: None,
        }
    }

    #[test]
    fn frame_carries_market_columns() {
        let rows = vec![
            market_point("20240102", "A", 10.0),
            market_point("20240102", "B", 20.0),
        ];
        let frame = build_frame(&rows, &[], &[]);
        assert_eq!(frame.len(), 2);
        assert!(frame.has_column("close"));
        assert!(frame.has_column("volume"));
        assert!(!frame.has_column("turnover"));
    }

    #[test]
    fn base_columns_join_on_date_and_symbol() {
        use mongodb::bson::Bson;

        let rows = vec![market_point("20240102", "A", 10.0)];
        let base = vec![BaseFactorPoint {
            date: "20240102".to_string(),
            symbol: "A".to_string(),
            columns: [("turnover".to_string(), Bson::Double(0.5))]
                .into_iter()
                .collect(),
        }];
        let frame = build_frame(&rows, &base, &["turnover".to_string()]);
        let turnover = frame.column("turnover").unwrap();
        assert_eq!(turnover.values(), &[0.5]);
    }

    #[test]
    fn missing_base_rows_become_nan() {
        let rows = vec![market_point("20240102", "A", 10.0)];
        let frame = build_frame(&rows, &[], &["market_cap".to_string()]);
        assert!(frame.column("market_cap").unwrap().values()[0].is_nan());
    }

    #[test]
    fn bad_dates_are_skipped() {
        let rows = vec![
            market_point("2024-01-02", "A", 10.0),
            market_point("20240102", "B", 20.0),
        ];
        let frame = build_frame(&rows, &[], &[]);
        assert_eq!(frame.len(), 1);
    }
}
