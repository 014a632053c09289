//! Where a day's time series lives inside a payload, and what its fields are called.
//!
//! Accounts and endpoint versions disagree on the payload layout. Each known
//! layout is one [`ExtractionStrategy`]; the flattener tries them in order and
//! uses the first one that yields at least one point. Supporting a new layout means
//! adding a strategy to the list.

use log::debug;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionStrategy {
    /// A list of series, `[{key, xy: [{x, y}]}]`, one series per metric.
    LineSeries { path: Vec<String> },
    /// A list of records, `[{<time_key>: .., <metric>: .., ..}]`, one record per instant.
    RecordList { path: Vec<String>, time_key: String },
}

/// One instant of a day before timestamps are resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPoint {
    pub label: String,
    pub metrics: Vec<(String, Option<f64>)>,
}

impl RawPoint {
    fn new(label: String) -> Self {
        Self {
            label,
            metrics: Vec::new(),
        }
    }

    fn set(&mut self, column: String, value: Option<f64>) {
        match self.metrics.iter_mut().find(|(name, _)| *name == column) {
            Some(slot) => slot.1 = value,
            None => self.metrics.push((column, value)),
        }
    }
}

impl ExtractionStrategy {
    /// Strategy for series under a dotted path such as `data.lines`.
    pub fn line_series(path: &str) -> Self {
        ExtractionStrategy::LineSeries {
            path: split_path(path),
        }
    }

    pub fn record_list(path: &str, time_key: &str) -> Self {
        ExtractionStrategy::RecordList {
            path: split_path(path),
            time_key: time_key.to_string(),
        }
    }

    fn path(&self) -> &[String] {
        match self {
            ExtractionStrategy::LineSeries { path } => path,
            ExtractionStrategy::RecordList { path, .. } => path,
        }
    }

    /// The non-empty list this strategy reads from, if the payload has one.
    pub fn locate<'a>(&self, payload: &'a Value) -> Option<&'a Vec<Value>> {
        let mut node = payload;
        for key in self.path() {
            node = node.get(key.as_str())?;
        }
        node.as_array().filter(|list| !list.is_empty())
    }

    /// Reads the points of `list` in source order.
    pub fn extract(&self, list: &[Value], metrics: &MetricMap) -> Vec<RawPoint> {
        match self {
            ExtractionStrategy::LineSeries { .. } => extract_lines(list, metrics),
            ExtractionStrategy::RecordList { time_key, .. } => {
                extract_records(list, time_key, metrics)
            }
        }
    }
}

impl fmt::Display for ExtractionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionStrategy::LineSeries { path } => write!(f, "lines@{}", path.join(".")),
            ExtractionStrategy::RecordList { path, time_key } => {
                write!(f, "records@{}[{}]", path.join("."), time_key)
            }
        }
    }
}

/// Layouts seen so far, most common first.
pub fn default_strategies() -> Vec<ExtractionStrategy> {
    vec![
        ExtractionStrategy::line_series("data.lines"),
        ExtractionStrategy::record_list("data.pacs", "date"),
        ExtractionStrategy::record_list("data.list", "time"),
    ]
}

fn split_path(path: &str) -> Vec<String> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Pivots per-metric series into per-instant points.
///
/// The n-th occurrence of a label in one series lines up with the n-th
/// occurrence of that label in every other series, so repeated labels stay
/// separate points.
fn extract_lines(lines: &[Value], metrics: &MetricMap) -> Vec<RawPoint> {
    let mut points: Vec<RawPoint> = Vec::new();
    let mut slots: HashMap<(String, usize), usize> = HashMap::new();

    for line in lines {
        let key = line.get("key").and_then(Value::as_str).unwrap_or("line");
        let Some(column) = metrics.column_for(key) else {
            debug!("Ignoring unrecognized series '{}'", key);
            continue;
        };
        let Some(xy) = line.get("xy").and_then(Value::as_array) else {
            continue;
        };

        let mut seen: HashMap<String, usize> = HashMap::new();
        for point in xy {
            let Some(label) = point.get("x").and_then(label_of) else {
                continue;
            };
            let occurrence = seen.entry(label.clone()).or_insert(0);
            let slot_key = (label.clone(), *occurrence);
            *occurrence += 1;

            let index = *slots.entry(slot_key).or_insert_with(|| {
                points.push(RawPoint::new(label));
                points.len() - 1
            });
            points[index].set(column.clone(), point.get("y").and_then(numeric));
        }
    }
    points
}

fn extract_records(records: &[Value], time_key: &str, metrics: &MetricMap) -> Vec<RawPoint> {
    let mut points = Vec::with_capacity(records.len());
    let mut missing_time = 0usize;
    for record in records {
        let Some(fields) = record.as_object() else {
            continue;
        };
        let Some(label) = fields.get(time_key).and_then(label_of) else {
            missing_time += 1;
            continue;
        };
        let mut point = RawPoint::new(label);
        for (key, value) in fields {
            if key == time_key {
                continue;
            }
            if let Some(column) = metrics.column_for(key) {
                point.set(column, numeric(value));
            }
        }
        points.push(point);
    }
    if missing_time > 0 {
        log::warn!(
            "{} record(s) without a '{}' field were skipped",
            missing_time,
            time_key
        );
    }
    points
}

fn label_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// JSON numbers and numeric strings; anything else is a missing value.
pub fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Maps portal field names to dataset column names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricMap {
    names: Vec<(String, String)>,
    passthrough: bool,
}

impl Default for MetricMap {
    fn default() -> Self {
        Self::empty()
            .with("PCurve_Power_PV", "pv")
            .with("PCurve_Power_Load", "load")
            .with("PCurve_Power_Battery", "battery")
            .with("PCurve_Power_Meter", "meter")
            .with("PCurve_Power_SOC", "soc")
            .with("pac", "pv")
    }
}

impl MetricMap {
    pub fn empty() -> Self {
        Self {
            names: Vec::new(),
            passthrough: false,
        }
    }

    /// Adds (or replaces) the column name for portal field `source`.
    pub fn with(mut self, source: &str, column: &str) -> Self {
        self.names.retain(|(s, _)| s != source);
        self.names.push((source.to_string(), column.to_string()));
        self
    }

    /// Keep unrecognized fields under their portal name instead of ignoring them.
    pub fn passthrough_unknown(mut self, passthrough: bool) -> Self {
        self.passthrough = passthrough;
        self
    }

    pub fn column_for(&self, source: &str) -> Option<String> {
        self.names
            .iter()
            .find(|(s, _)| s == source)
            .map(|(_, column)| column.clone())
            .or_else(|| self.passthrough.then(|| source.to_string()))
    }
}
