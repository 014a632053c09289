//! Turns one day's raw payload into uniform rows.

use crate::config::TzOffset;
use crate::merge::strategy::{default_strategies, numeric, ExtractionStrategy, MetricMap};
use crate::portal::envelope::envelope_code;
use bon::Builder;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use log::debug;
use serde_json::Value;

/// Provenance tag of rows flattened from the v2 power chart endpoint.
pub const SOURCE_TAG: &str = "sems:v2:GetPlantPowerChart";

const TIME_FORMATS: [&str; 2] = ["%H:%M", "%H:%M:%S"];
const DATETIME_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

#[derive(Debug, Clone, PartialEq)]
pub struct FlatRow {
    /// UTC instant of the point, `None` when the portal's time label was unreadable.
    pub timestamp: Option<NaiveDateTime>,
    /// Wall-clock time as the portal showed it.
    pub time_local: Option<NaiveDateTime>,
    /// Metric columns this point carries, in source order.
    pub metrics: Vec<(String, Option<f64>)>,
    pub day: NaiveDate,
    pub source: String,
}

impl FlatRow {
    pub fn metric(&self, column: &str) -> Option<f64> {
        self.metrics
            .iter()
            .find(|(name, _)| name == column)
            .and_then(|(_, value)| *value)
    }
}

/// A per-day summary figure (`generateData`), e.g. the day's total yield.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyAggregate {
    pub day: NaiveDate,
    pub key: String,
    pub value: f64,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlatDay {
    pub day: NaiveDate,
    pub rows: Vec<FlatRow>,
    pub aggregates: Vec<DailyAggregate>,
    /// The strategy that found the series, if any did.
    pub strategy: Option<String>,
}

impl FlatDay {
    fn empty(day: NaiveDate) -> Self {
        Self {
            day,
            rows: Vec::new(),
            aggregates: Vec::new(),
            strategy: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, Builder)]
pub struct Flattener {
    pub tz_offset: TzOffset,
    #[builder(default = default_strategies())]
    pub strategies: Vec<ExtractionStrategy>,
    #[builder(default)]
    pub metrics: MetricMap,
    #[builder(into, default = SOURCE_TAG.to_string())]
    pub source_tag: String,
}

impl Flattener {
    pub fn new(tz_offset: TzOffset) -> Self {
        Self::builder().tz_offset(tz_offset).build()
    }

    /// Flattens `payload` for `day`.
    ///
    /// Never fails: a payload that reports an error, or in which no strategy
    /// finds a series, yields an empty [`FlatDay`].
    pub fn flatten(&self, payload: &Value, day: NaiveDate) -> FlatDay {
        if reports_error(payload) {
            debug!("Payload for {} reports an error, nothing to flatten", day);
            return FlatDay::empty(day);
        }

        let mut flat = FlatDay::empty(day);
        flat.aggregates = self.aggregates(payload, day);

        let Some((strategy, points)) = self.strategies.iter().find_map(|strategy| {
            let points = strategy.extract(strategy.locate(payload)?, &self.metrics);
            if points.is_empty() {
                debug!("{}: {} matched but held no points", day, strategy);
                return None;
            }
            Some((strategy, points))
        }) else {
            debug!("No known series layout in payload for {}", day);
            return flat;
        };

        flat.rows = points
            .into_iter()
            .map(|point| {
                let time_local = parse_time_label(&point.label, day);
                FlatRow {
                    timestamp: time_local.and_then(|local| self.to_utc(local)),
                    time_local,
                    metrics: point.metrics,
                    day,
                    source: self.source_tag.clone(),
                }
            })
            .collect();
        // Pivoted series on different time grids come out grouped by series.
        // The sort is stable, so repeated labels keep their occurrence order.
        if matches!(strategy, ExtractionStrategy::LineSeries { .. })
            && flat.rows.iter().all(|row| row.time_local.is_some())
        {
            flat.rows.sort_by_key(|row| row.time_local);
        }
        debug!("{}: {} row(s) via {}", day, flat.rows.len(), strategy);
        flat.strategy = Some(strategy.to_string());
        flat
    }

    fn to_utc(&self, local: NaiveDateTime) -> Option<NaiveDateTime> {
        self.tz_offset
            .fixed()
            .from_local_datetime(&local)
            .single()
            .map(|dt| dt.naive_utc())
    }

    fn aggregates(&self, payload: &Value, day: NaiveDate) -> Vec<DailyAggregate> {
        let Some(items) = payload.pointer("/data/generateData").and_then(Value::as_array) else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| {
                let key = item.get("key").and_then(Value::as_str)?;
                let value = item.get("value").and_then(numeric)?;
                Some(DailyAggregate {
                    day,
                    key: key.to_string(),
                    value,
                    source: self.source_tag.clone(),
                })
            })
            .collect()
    }
}

fn reports_error(payload: &Value) -> bool {
    if !payload.is_object() {
        return true;
    }
    let has_error = payload
        .get("hasError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    has_error || envelope_code(payload).is_some_and(|code| code != "0")
}

/// Reads a portal time label as a local date-time on `day`.
///
/// Bare times (`10:05`) are placed on `day`; full date-times keep their own date.
pub fn parse_time_label(label: &str, day: NaiveDate) -> Option<NaiveDateTime> {
    let label = label.trim();
    TIME_FORMATS
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(label, format).ok())
        .map(|time| day.and_time(time))
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(label, format).ok())
        })
}
