use serde::{Deserialize, Serialize};

/// A single chart data point: numeric for value axes, textual for
/// category/date axes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChartValue {
    Number(f64),
    Label(String),
}

impl From<f64> for ChartValue {
    fn from(v: f64) -> Self {
        ChartValue::Number(v)
    }
}

impl From<String> for ChartValue {
    fn from(v: String) -> Self {
        ChartValue::Label(v)
    }
}

/// One named data series of a chart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesItem {
    pub name: String,
    pub data: Vec<ChartValue>,
}

impl SeriesItem {
    pub fn numbers(name: impl Into<String>, data: Vec<f64>) -> Self {
        SeriesItem {
            name: name.into(),
            data: data.into_iter().map(ChartValue::Number).collect(),
        }
    }

    pub fn labels(name: impl Into<String>, data: Vec<String>) -> Self {
        SeriesItem {
            name: name.into(),
            data: data.into_iter().map(ChartValue::Label).collect(),
        }
    }
}

/// Chart payload in the exact shape consumed by the query surface:
/// `{title, x: [{name, data}], y: [{name, data}]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartData {
    pub title: String,
    pub x: Vec<SeriesItem>,
    pub y: Vec<SeriesItem>,
}

impl ChartData {
    pub fn new(title: impl Into<String>, x: Vec<SeriesItem>, y: Vec<SeriesItem>) -> Self {
        ChartData {
            title: title.into(),
            x,
            y,
        }
    }

    /// A chart with empty axes; used when the evaluation window produced no
    /// observations but the bundle must still be written.
    pub fn empty(title: impl Into<String>) -> Self {
        ChartData {
            title: title.into(),
            x: Vec::new(),
            y: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chart_values_serialize_untagged() {
        let chart = ChartData::new(
            "ic",
            vec![SeriesItem::labels("date", vec!["20240102".to_string()])],
            vec![SeriesItem::numbers("ic", vec![0.5])],
        );
        let json = serde_json::to_value(&chart).unwrap();
        assert_eq!(json["x"][0]["data"][0], "20240102");
        assert_eq!(json["y"][0]["data"][0], 0.5);
    }
}
