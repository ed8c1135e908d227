use std::collections::HashMap;

use mongodb::bson::oid::ObjectId;
use mongodb::bson::Bson;
use serde::{Deserialize, Serialize};

use crate::chart::ChartData;
use crate::params::Params;

fn f64_nan() -> f64 {
    f64::NAN
}

/// Current UTC time in the ISO-8601 shape the collections store.
pub fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeType {
    Formula,
    Program,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactorStatus {
    Idle,
    Running,
    Succeeded,
    Failed,
}

impl Default for FactorStatus {
    fn default() -> Self {
        FactorStatus::Idle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Succeeded,
    Failed,
}

/// A user-owned factor definition.
///
/// `(user_id, factor_name)` is unique; `current_task_id` tracks the most
/// recent evaluation task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorDefinition {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub user_id: String,
    /// Display name.
    pub name: String,
    /// Machine name, unique per user; also names the persisted series
    /// collection `factor_<factor_name>_<user_id>`.
    pub factor_name: String,
    pub code: String,
    pub code_type: CodeType,
    pub params: Params,
    #[serde(default)]
    pub status: FactorStatus,
    #[serde(default)]
    pub current_task_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl FactorDefinition {
    pub fn factor_id(&self) -> String {
        self.id.map(|id| id.to_hex()).unwrap_or_default()
    }

    /// Name of the persisted custom-factor collection for this definition.
    pub fn series_collection(&self) -> String {
        format!("factor_{}_{}", self.factor_name, self.user_id)
    }
}

/// One evaluation run of a factor over a frozen parameter set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub task_id: String,
    pub factor_id: String,
    pub user_id: String,
    pub factor_name: String,
    pub params: Params,
    pub status: TaskStatus,
    /// Stage marker, 0..=9 monotone non-decreasing until terminal; -1 means
    /// failed.
    pub process_status: i32,
    pub created_at: String,
    pub updated_at: String,
    pub start_time: String,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub last_log_message: Option<String>,
    #[serde(default)]
    pub last_log_time: Option<String>,
    #[serde(default)]
    pub last_log_level: Option<String>,
    #[serde(default)]
    pub current_stage: Option<String>,
}

/// Execution stages of an evaluation task, written to `process_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Started,
    LoadMarket,
    LoadFactor,
    Preprocess,
    ForwardReturns,
    Grouping,
    Statistics,
    Persist,
    Finalized,
}

impl Stage {
    pub fn as_i32(&self) -> i32 {
        match self {
            Stage::Started => 1,
            Stage::LoadMarket => 2,
            Stage::LoadFactor => 3,
            Stage::Preprocess => 4,
            Stage::ForwardReturns => 5,
            Stage::Grouping => 6,
            Stage::Statistics => 7,
            Stage::Persist => 8,
            Stage::Finalized => 9,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Started => "started",
            Stage::LoadMarket => "market_data",
            Stage::LoadFactor => "factor_data",
            Stage::Preprocess => "preprocess",
            Stage::ForwardReturns => "forward_returns",
            Stage::Grouping => "grouping",
            Stage::Statistics => "statistics",
            Stage::Persist => "persist",
            Stage::Finalized => "finished",
        }
    }
}

/// One daily K-line row. Keyed `(date, symbol)` with `date` as `YYYYMMDD`.
///
/// Numeric fields default to NaN when a projection leaves them out, so
/// missing columns flow through the NaN-dropping pipeline instead of
/// masquerading as zeros.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketPoint {
    pub date: String,
    pub symbol: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "f64_nan")]
    pub open: f64,
    #[serde(default = "f64_nan")]
    pub high: f64,
    #[serde(default = "f64_nan")]
    pub low: f64,
    #[serde(default = "f64_nan")]
    pub close: f64,
    #[serde(default = "f64_nan")]
    pub pre_close: f64,
    #[serde(default = "f64_nan")]
    pub volume: f64,
    #[serde(default = "f64_nan")]
    pub amount: f64,
    #[serde(default = "f64_nan")]
    pub limit_up: f64,
    #[serde(default = "f64_nan")]
    pub limit_down: f64,
    /// Index membership mask: "100" = HS300, "010" = CS500, "001" = CS1000.
    #[serde(default)]
    pub index_component: Option<String>,
}

/// One base-factor row: `(date, symbol)` plus whatever auxiliary columns the
/// ingestion wrote (turnover, market_cap, amount, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseFactorPoint {
    pub date: String,
    pub symbol: String,
    #[serde(flatten)]
    pub columns: HashMap<String, Bson>,
}

impl BaseFactorPoint {
    /// Numeric view of a column; NaN when absent or non-numeric.
    pub fn value(&self, column: &str) -> f64 {
        match self.columns.get(column) {
            Some(Bson::Double(v)) => *v,
            Some(Bson::Int32(v)) => *v as f64,
            Some(Bson::Int64(v)) => *v as f64,
            _ => f64::NAN,
        }
    }
}

/// One `(date, symbol, value)` row of a factor series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorPoint {
    pub date: String,
    pub symbol: String,
    #[serde(default = "f64_nan")]
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }

    /// Severities that force an immediate flush of every task's buffer.
    pub fn is_urgent(&self) -> bool {
        matches!(self, LogLevel::Warning | LogLevel::Error | LogLevel::Critical)
    }
}

/// Append-only stage-log row. The Mongo `_id` doubles as the monotonic
/// storage ordinal used for incremental tail reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub log_id: String,
    pub task_id: String,
    pub factor_id: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: String,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, String>>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Summary metrics of the conventionally-best group, used by the factor
/// list for server-side ordering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OneGroupData {
    pub return_ratio: f64,
    pub annualized_ratio: f64,
    pub sharpe_ratio: f64,
    pub maximum_drawdown: f64,
}

/// One named metric of the factor-level statistics table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRow {
    pub metric: String,
    pub value: f64,
}

/// Per-group performance row of the group-return analysis table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupPerformanceRow {
    pub group_name: String,
    pub cumulative_return: f64,
    pub annualized_return: f64,
    pub excess_annualized_return: f64,
    pub annualized_volatility: f64,
    pub excess_annualized_volatility: f64,
    pub maximum_drawdown: f64,
    pub excess_maximum_drawdown: f64,
    pub sharpe_ratio: f64,
    pub information_ratio: f64,
    pub monthly_win_rate: f64,
    pub excess_monthly_win_rate: f64,
    pub turnover: f64,
    pub tracking_error: f64,
}

/// One row of the latest-date top-factor snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopFactorRow {
    pub symbol: String,
    #[serde(default)]
    pub name: Option<String>,
    pub value: f64,
    pub date: String,
}

/// The full artifact bundle of one successful task. Written exactly once,
/// keyed by `task_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultBundle {
    pub task_id: String,
    pub group_return_analysis: Vec<GroupPerformanceRow>,
    pub return_chart: ChartData,
    pub simple_return_chart: ChartData,
    pub excess_chart: ChartData,
    pub ic_sequence_chart: ChartData,
    pub ic_density_chart: ChartData,
    pub ic_decay_chart: ChartData,
    pub ic_self_correlation_chart: ChartData,
    pub rank_ic_sequence_chart: ChartData,
    pub rank_ic_density_chart: ChartData,
    pub rank_ic_decay_chart: ChartData,
    pub rank_ic_self_correlation_chart: ChartData,
    pub factor_data_analysis: Vec<MetricRow>,
    pub one_group_data: OneGroupData,
    pub last_date_top_factor: Vec<TopFactorRow>,
    pub created_at: String,
}
