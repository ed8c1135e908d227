use chrono::NaiveDate;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::FactorError;

pub const VALID_ADJUSTMENT_CYCLES: [u32; 6] = [1, 3, 5, 10, 20, 30];
pub const VALID_STOCK_POOLS: [&str; 4] = ["000300", "000905", "000852", "000985"];

/// Whether larger factor values are expected to predict larger forward
/// returns (`positive`) or smaller ones (`negative`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactorDirection {
    Positive,
    Negative,
}

impl FactorDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactorDirection::Positive => "positive",
            FactorDirection::Negative => "negative",
        }
    }
}

impl Serialize for FactorDirection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

// Older factor documents stored the direction as a boolean (true = positive),
// so the deserializer accepts both spellings.
impl<'de> Deserialize<'de> for FactorDirection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DirectionVisitor;

        impl<'de> Visitor<'de> for DirectionVisitor {
            type Value = FactorDirection;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("\"positive\", \"negative\", or a boolean")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
                Ok(if v {
                    FactorDirection::Positive
                } else {
                    FactorDirection::Negative
                })
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                match v {
                    "positive" => Ok(FactorDirection::Positive),
                    "negative" => Ok(FactorDirection::Negative),
                    other => Err(E::invalid_value(de::Unexpected::Str(other), &self)),
                }
            }
        }

        deserializer.deserialize_any(DirectionVisitor)
    }
}

/// Cross-sectional outlier trimming method applied before standardization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtremeValueMethod {
    /// Clip outside `mean ± 3·std`.
    Std,
    /// Clip outside `median ± 3·1.4826·MAD`.
    Median,
}

impl ExtremeValueMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtremeValueMethod::Std => "std",
            ExtremeValueMethod::Median => "median",
        }
    }
}

impl Serialize for ExtremeValueMethod {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

// The surface accepts the Chinese synonyms alongside the canonical names.
impl<'de> Deserialize<'de> for ExtremeValueMethod {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MethodVisitor;

        impl<'de> Visitor<'de> for MethodVisitor {
            type Value = ExtremeValueMethod;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("\"std\", \"median\", \"标准差\", or \"中位数\"")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                match v {
                    "std" | "标准差" => Ok(ExtremeValueMethod::Std),
                    "median" | "中位数" => Ok(ExtremeValueMethod::Median),
                    other => Err(E::invalid_value(de::Unexpected::Str(other), &self)),
                }
            }
        }

        deserializer.deserialize_str(MethodVisitor)
    }
}

/// Evaluation parameters attached to every factor and frozen onto every task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Params {
    /// Start of the evaluation window, `YYYY-MM-DD`.
    pub start_date: String,
    /// End of the evaluation window, `YYYY-MM-DD`.
    pub end_date: String,
    /// Rebalancing cycle in trading days.
    pub adjustment_cycle: u32,
    /// Index universe code; `000985` means all A-shares, no index filter.
    pub stock_pool: String,
    pub factor_direction: FactorDirection,
    /// Number of quantile groups, 2..=20.
    pub group_number: u32,
    pub include_st: bool,
    pub extreme_value_processing: ExtremeValueMethod,
}

impl Params {
    /// Check every enum/range constraint. Called at job admission; a factor
    /// with bad params never produces a task record.
    pub fn validate(&self) -> Result<(), FactorError> {
        let start = parse_date(&self.start_date)?;
        let end = parse_date(&self.end_date)?;
        if start > end {
            return Err(FactorError::Validation(format!(
                "start_date {} is after end_date {}",
                self.start_date, self.end_date
            )));
        }

        if !VALID_ADJUSTMENT_CYCLES.contains(&self.adjustment_cycle) {
            return Err(FactorError::Validation(format!(
                "unsupported adjustment_cycle {}, expected one of {:?}",
                self.adjustment_cycle, VALID_ADJUSTMENT_CYCLES
            )));
        }

        if !VALID_STOCK_POOLS.contains(&self.stock_pool.as_str()) {
            return Err(FactorError::Validation(format!(
                "unsupported stock_pool {}, expected one of {:?}",
                self.stock_pool, VALID_STOCK_POOLS
            )));
        }

        if !(2..=20).contains(&self.group_number) {
            return Err(FactorError::Validation(format!(
                "group_number must be between 2 and 20, got {}",
                self.group_number
            )));
        }

        Ok(())
    }

    /// Start date as the compact `YYYYMMDD` form used by the market tables.
    pub fn start_date_compact(&self) -> String {
        self.start_date.replace('-', "")
    }

    /// End date as the compact `YYYYMMDD` form used by the market tables.
    pub fn end_date_compact(&self) -> String {
        self.end_date.replace('-', "")
    }
}

fn parse_date(value: &str) -> Result<NaiveDate, FactorError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| FactorError::Validation(format!("invalid date {value:?}, expected YYYY-MM-DD")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Params {
        Params {
            start_date: "2024-01-02".to_string(),
            end_date: "2024-01-05".to_string(),
            adjustment_cycle: 1,
            stock_pool: "000985".to_string(),
            factor_direction: FactorDirection::Positive,
            group_number: 2,
            include_st: true,
            extreme_value_processing: ExtremeValueMethod::Median,
        }
    }

    #[test]
    fn accepts_valid_params() {
        assert!(params().validate().is_ok());
    }

    #[test]
    fn rejects_unsupported_cycle() {
        let mut p = params();
        p.adjustment_cycle = 7;
        assert!(matches!(p.validate(), Err(FactorError::Validation(_))));
    }

    #[test]
    fn rejects_unknown_pool() {
        let mut p = params();
        p.stock_pool = "000001".to_string();
        assert!(p.validate().is_err());
    }

    #[test]
    fn rejects_inverted_dates() {
        let mut p = params();
        p.start_date = "2024-02-01".to_string();
        assert!(p.validate().is_err());
    }

    #[test]
    fn rejects_group_number_out_of_range() {
        let mut p = params();
        p.group_number = 1;
        assert!(p.validate().is_err());
        p.group_number = 21;
        assert!(p.validate().is_err());
    }

    #[test]
    fn extreme_method_accepts_synonyms() {
        let m: ExtremeValueMethod = serde_json::from_str("\"标准差\"").unwrap();
        assert_eq!(m, ExtremeValueMethod::Std);
        let m: ExtremeValueMethod = serde_json::from_str("\"中位数\"").unwrap();
        assert_eq!(m, ExtremeValueMethod::Median);
    }

    #[test]
    fn direction_accepts_legacy_bool() {
        let d: FactorDirection = serde_json::from_str("true").unwrap();
        assert_eq!(d, FactorDirection::Positive);
        let d: FactorDirection = serde_json::from_str("\"negative\"").unwrap();
        assert_eq!(d, FactorDirection::Negative);
    }

    #[test]
    fn compact_dates_strip_dashes() {
        assert_eq!(params().start_date_compact(), "20240102");
        assert_eq!(params().end_date_compact(), "20240105");
    }
}
