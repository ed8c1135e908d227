use std::sync::Arc;

use chrono::{Days, NaiveDate};
use factor_core::{FactorError, MarketPoint};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use mongodb::bson::{doc, Document};
use mongodb::options::FindOptions;

use crate::store::DocumentStore;

/// Approximate chunk length of the range split.
const CHUNK_DAYS: u64 = 90;
/// Upper bound on concurrently running chunk reads.
const MAX_PARALLEL_CHUNKS: usize = 8;
/// Target bytes per transferred cursor batch.
const TARGET_BATCH_BYTES: usize = 10 * 1024 * 1024;

/// Parameters of one market read.
#[derive(Debug, Clone)]
pub struct MarketQuery {
    /// `YYYYMMDD`.
    pub start_date: String,
    /// `YYYYMMDD`.
    pub end_date: String,
    /// Index universe code; `000985` applies no index filter.
    pub pool: String,
    pub include_st: bool,
    pub symbols: Option<Vec<String>>,
    pub fields: Option<Vec<String>>,
}

impl MarketQuery {
    pub fn range(start_date: &str, end_date: &str) -> Self {
        MarketQuery {
            start_date: start_date.to_string(),
            end_date: end_date.to_string(),
            pool: "000985".to_string(),
            include_st: true,
            symbols: None,
            fields: None,
        }
    }
}

/// Index-component mask for a pool code; `None` means no filter.
pub fn pool_index_component(pool: &str) -> Option<&'static str> {
    match pool {
        "000300" => Some("100"),
        "000905" => Some("010"),
        "000852" => Some("001"),
        _ => None,
    }
}

/// Split `[start, end]` into contiguous, non-overlapping windows of about
/// three months whose union covers the whole range. A single-day range is a
/// single chunk.
pub fn chunk_date_range(start: &str, end: &str) -> Result<Vec<(String, String)>, FactorError> {
    let start_date = parse_compact(start)?;
    let end_date = parse_compact(end)?;
    if start_date > end_date {
        return Err(FactorError::Validation(format!(
            "start date {start} is after end date {end}"
        )));
    }
    if start_date == end_date {
        return Ok(vec![(start.to_string(), end.to_string())]);
    }

    let mut chunks = Vec::new();
    let mut chunk_start = start_date;
    while chunk_start <= end_date {
        let chunk_end = (chunk_start + Days::new(CHUNK_DAYS - 1)).min(end_date);
        chunks.push((
            chunk_start.format("%Y%m%d").to_string(),
            chunk_end.format("%Y%m%d").to_string(),
        ));
        if chunk_end >= end_date {
            break;
        }
        chunk_start = chunk_end + Days::new(1);
    }
    Ok(chunks)
}

/// Cursor batch size targeting ~10 MiB per batch, clamped to
/// `[2_000, 10_000]` rows. Row size is estimated at 20 bytes per requested
/// field, or 200 bytes when no projection is given.
pub fn estimate_batch_size(fields: Option<&[String]>) -> u32 {
    let row_bytes = fields.map(|f| f.len() * 20).unwrap_or(200).max(1);
    (TARGET_BATCH_BYTES / row_bytes).clamp(2_000, 10_000) as u32
}

fn parse_compact(date: &str) -> Result<NaiveDate, FactorError> {
    NaiveDate::parse_from_str(date, "%Y%m%d")
        .map_err(|_| FactorError::Validation(format!("invalid date {date:?}, expected YYYYMMDD")))
}

/// Range-chunked, bounded-parallel reader over the market collections.
#[derive(Clone)]
pub struct MarketDataReader {
    store: Arc<DocumentStore>,
}

impl MarketDataReader {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        MarketDataReader { store }
    }

    /// Build the per-chunk filter document shared by market reads and
    /// universe resolution.
    pub fn market_filter(query: &MarketQuery, chunk: &(String, String)) -> Document {
        let mut filter = Document::new();
        let (chunk_start, chunk_end) = chunk;
        if chunk_start == chunk_end {
            filter.insert("date", chunk_start.clone());
        } else {
            filter.insert(
                "date",
                doc! { "$gte": chunk_start.clone(), "$lte": chunk_end.clone() },
            );
        }
        if let Some(mask) = pool_index_component(&query.pool) {
            filter.insert("index_component", mask);
        }
        if !query.include_st {
            filter.insert("name", doc! { "$not": { "$regex": "ST" } });
        }
        if let Some(symbols) = &query.symbols {
            filter.insert("symbol", doc! { "$in": symbols.clone() });
        }
        filter
    }

    fn projection(fields: Option<&[String]>) -> Option<Document> {
        fields.map(|fields| {
            let mut projection = Document::new();
            for field in fields {
                projection.insert(field.as_str(), 1);
            }
            projection.insert("date", 1);
            projection.insert("symbol", 1);
            projection.insert("_id", 0);
            projection
        })
    }

    /// Load daily K-line rows for the query range. Chunks are read on a
    /// bounded pool and concatenated in completion order; no global ordering
    /// is guaranteed.
    pub async fn load_market(&self, query: &MarketQuery) -> Result<Vec<MarketPoint>, FactorError> {
        self.load_collection("stock_market", query, None).await
    }

    /// Load futures rows; `future_market` rows are restricted to the
    /// continuous contracts via `symbol == underlying_symbol + "88"`.
    pub async fn load_futures(&self, query: &MarketQuery) -> Result<Vec<MarketPoint>, FactorError> {
        let continuous = doc! {
            "$expr": { "$eq": ["$symbol", { "$concat": ["$underlying_symbol", "88"] }] }
        };
        self.load_collection("future_market", query, Some(continuous))
            .await
    }

    async fn load_collection(
        &self,
        collection: &str,
        query: &MarketQuery,
        extra_filter: Option<Document>,
    ) -> Result<Vec<MarketPoint>, FactorError> {
        let chunks = chunk_date_range(&query.start_date, &query.end_date)?;
        let batch_size = estimate_batch_size(query.fields.as_deref());
        let projection = Self::projection(query.fields.as_deref());

        let fetches = chunks.into_iter().map(|chunk| {
            let mut filter = Self::market_filter(query, &chunk);
            if let Some(extra) = &extra_filter {
                filter.extend(extra.clone());
            }
            let options = FindOptions::builder()
                .projection(projection.clone())
                .batch_size(batch_size)
                .build();
            let coll = self.store.collection::<MarketPoint>(collection);
            async move {
                let cursor = coll.find(filter, options).await?;
                cursor.try_collect::<Vec<MarketPoint>>().await
            }
        });

        let mut rows = Vec::new();
        let mut results = stream::iter(fetches).buffer_unordered(MAX_PARALLEL_CHUNKS);
        while let Some(chunk_rows) = results.next().await {
            rows.extend(chunk_rows?);
        }

        if rows.is_empty() {
            tracing::warn!(
                collection,
                start = %query.start_date,
                end = %query.end_date,
                pool = %query.pool,
                "no market rows matched the query"
            );
        }
        Ok(rows)
    }

    /// Distinct symbols matching the pool/ST filters over the whole table.
    pub async fn resolve_universe(
        &self,
        pool: &str,
        include_st: bool,
    ) -> Result<Vec<String>, FactorError> {
        let mut filter = Document::new();
        if let Some(mask) = pool_index_component(pool) {
            filter.insert("index_component", mask);
        }
        if !include_st {
            filter.insert("name", doc! { "$not": { "$regex": "ST" } });
        }
        let values = self
            .store
            .collection::<Document>("stock_market")
            .distinct("symbol", filter, None)
            .await?;
        Ok(values
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }

    /// Display names for a set of symbols, for snapshot enrichment.
    pub async fn symbol_names(
        &self,
        symbols: &[String],
    ) -> Result<std::collections::HashMap<String, String>, FactorError> {
        let filter = doc! { "symbol": { "$in": symbols } };
        let options = FindOptions::builder()
            .projection(doc! { "symbol": 1, "name": 1, "_id": 0 })
            .build();
        let cursor = self
            .store
            .collection::<Document>("stock_market")
            .find(filter, options)
            .await?;
        let rows: Vec<Document> = cursor.try_collect().await?;
        let mut names = std::collections::HashMap::new();
        for row in rows {
            if let (Ok(symbol), Ok(name)) = (row.get_str("symbol"), row.get_str("name")) {
                names.insert(symbol.to_string(), name.to_string());
            }
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_day_is_one_chunk() {
        let chunks = chunk_date_range("20240102", "20240102").unwrap();
        assert_eq!(chunks, vec![("20240102".to_string(), "20240102".to_string())]);
    }

    #[test]
    fn chunks_are_adjacent_and_cover_the_range() {
        let chunks = chunk_date_range("20230101", "20231231").unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(chunks.first().unwrap().0, "20230101");
        assert_eq!(chunks.last().unwrap().1, "20231231");
        for pair in chunks.windows(2) {
            let prev_end = parse_compact(&pair[0].1).unwrap();
            let next_start = parse_compact(&pair[1].0).unwrap();
            assert_eq!(prev_end + Days::new(1), next_start);
        }
    }

    #[test]
    fn last_chunk_truncates_at_end() {
        let chunks = chunk_date_range("20240101", "20240501").unwrap();
        let (last_start, last_end) = chunks.last().unwrap();
        assert!(parse_compact(last_start).unwrap() <= parse_compact(last_end).unwrap());
        assert_eq!(last_end, "20240501");
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert!(chunk_date_range("20240102", "20240101").is_err());
    }

    #[test]
    fn batch_size_clamps() {
        // Unspecified fields: 200-byte rows → 10 MiB / 200 > 10_000.
        assert_eq!(estimate_batch_size(None), 10_000);
        // Many fields push the estimate below the floor.
        let many: Vec<String> = (0..4000).map(|i| format!("f{i}")).collect();
        assert_eq!(estimate_batch_size(Some(&many)), 2_000);
        // Mid-range: 300 fields * 20 bytes = 6 KiB → ~1748 rows → clamped up.
        let mid: Vec<String> = (0..300).map(|i| format!("f{i}")).collect();
        assert_eq!(estimate_batch_size(Some(&mid)), 2_000);
    }

    #[test]
    fn pool_masks_match_the_codes() {
        assert_eq!(pool_index_component("000300"), Some("100"));
        assert_eq!(pool_index_component("000905"), Some("010"));
        assert_eq!(pool_index_component("000852"), Some("001"));
        assert_eq!(pool_index_component("000985"), None);
    }

    #[test]
    fn filter_applies_pool_and_st_rules() {
        let mut query = MarketQuery::range("20240101", "20240131");
        query.pool = "000300".to_string();
        query.include_st = false;
        let filter = MarketDataReader::market_filter(
            &query,
            &("20240101".to_string(), "20240131".to_string()),
        );
        assert_eq!(filter.get_str("index_component").unwrap(), "100");
        assert!(filter.get_document("name").is_ok());
        assert!(filter.get_document("date").is_ok());
    }

    #[test]
    fn all_shares_pool_has_no_index_filter() {
        let query = MarketQuery::range("20240101", "20240101");
        let filter = MarketDataReader::market_filter(
            &query,
            &("20240101".to_string(), "20240101".to_string()),
        );
        assert!(filter.get("index_component").is_none());
        // Single-day chunk uses an exact date match.
        assert_eq!(filter.get_str("date").unwrap(), "20240101");
    }
}
