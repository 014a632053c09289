//! Run configuration for an export.
//!
//! A [`RunConfig`] is built once (with its builder or from the `SEMS_*`
//! environment variables) and then handed to the components that need it.
//! Nothing in the crate reads the environment after that point.

use crate::export::retry::RetryPolicy;
use bon::Builder;
use chrono::{FixedOffset, NaiveDate, Offset, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_API_BASE: &str = "https://eu.semsportal.com/api/";
pub const DEFAULT_OUTPUT_DIR: &str = "json_export";
pub const DEFAULT_TZ_OFFSET: &str = "+08:00";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid date '{value}' for {key}, expected YYYY-MM-DD or 'latest'")]
    InvalidDate {
        key: &'static str,
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("Invalid timezone offset '{0}', expected +HH:MM")]
    InvalidOffset(String),

    #[error("Invalid number '{value}' for {key}")]
    InvalidNumber { key: &'static str, value: String },

    #[error("Start date {start} is after end date {end}")]
    StartAfterEnd { start: NaiveDate, end: NaiveDate },

    #[error("Failed to load environment file '{0}'")]
    EnvFile(PathBuf, #[source] dotenvy::Error),
}

/// Fixed UTC offset the portal reports local times in, e.g. `+08:00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TzOffset(FixedOffset);

impl TzOffset {
    pub fn utc() -> Self {
        Self(Utc.fix())
    }

    pub fn from_seconds(seconds: i32) -> Option<Self> {
        FixedOffset::east_opt(seconds).map(Self)
    }

    pub fn fixed(&self) -> FixedOffset {
        self.0
    }

    /// Today's date as seen on the wall clock at this offset.
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.0).date_naive()
    }
}

impl FromStr for TzOffset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc") {
            return Ok(Self::utc());
        }
        let invalid = || ConfigError::InvalidOffset(s.to_string());

        let (sign, rest) = match trimmed.as_bytes().first() {
            Some(b'+') => (1, &trimmed[1..]),
            Some(b'-') => (-1, &trimmed[1..]),
            _ => return Err(invalid()),
        };
        // ASCII digits and ':' only, so the byte split below stays on char boundaries.
        if !rest.bytes().all(|b| b.is_ascii_digit() || b == b':') {
            return Err(invalid());
        }
        let (hours, minutes) = match rest.split_once(':') {
            Some((h, m)) => (h, m),
            None if rest.len() == 4 => rest.split_at(2),
            None if rest.len() <= 2 => (rest, "0"),
            None => return Err(invalid()),
        };
        let hours: i32 = hours.parse().map_err(|_| invalid())?;
        let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
        if hours > 14 || minutes >= 60 {
            return Err(invalid());
        }
        Self::from_seconds(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
    }
}

impl fmt::Display for TzOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seconds = self.0.local_minus_utc();
        let sign = if seconds < 0 { '-' } else { '+' };
        let seconds = seconds.abs();
        write!(f, "{}{:02}:{:02}", sign, seconds / 3600, (seconds % 3600) / 60)
    }
}

/// Last day of an export, either fixed or resolved when the run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndDate {
    Date(NaiveDate),
    /// Today in the run's timezone, fixed once at run start.
    Latest,
}

impl EndDate {
    pub fn resolve(&self, today: NaiveDate) -> NaiveDate {
        match self {
            EndDate::Date(date) => *date,
            EndDate::Latest => today,
        }
    }
}

impl FromStr for EndDate {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if ["latest", "today", "now"]
            .iter()
            .any(|alias| s.eq_ignore_ascii_case(alias))
        {
            return Ok(EndDate::Latest);
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d").map(EndDate::Date)
    }
}

/// Inclusive range of calendar days with both ends known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl ResolvedRange {
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |day| *day <= end)
    }

    pub fn len(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        (self.end - self.start).num_days() as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// Portal account credentials. The password never shows up in `Debug` output.
#[derive(Clone)]
pub struct Credentials {
    pub account: String,
    pub password: String,
}

impl Credentials {
    pub fn new(account: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("account", &self.account)
            .field("password", &"***")
            .finish()
    }
}

/// Everything one export run needs. Immutable once built.
///
/// # Examples
///
/// ```
/// use sems_export::{Credentials, EndDate, RunConfig, TzOffset};
/// use chrono::NaiveDate;
///
/// let config = RunConfig::builder()
///     .credentials(Credentials::new("me@example.com", "secret"))
///     .station_id("6f3c0b9e-0000-0000-0000-000000000000")
///     .start(NaiveDate::from_ymd_opt(2025, 9, 1).unwrap())
///     .end(EndDate::Latest)
///     .tz_offset("+08:00".parse::<TzOffset>().unwrap())
///     .build();
/// assert_eq!(config.output_dir.to_str(), Some("json_export"));
/// ```
#[derive(Debug, Clone, Builder)]
pub struct RunConfig {
    pub credentials: Credentials,
    #[builder(into)]
    pub station_id: String,
    /// First day to export. Defaults to the resolved end date.
    pub start: Option<NaiveDate>,
    #[builder(default = EndDate::Latest)]
    pub end: EndDate,
    pub tz_offset: TzOffset,
    #[builder(into, default = PathBuf::from(DEFAULT_OUTPUT_DIR))]
    pub output_dir: PathBuf,
    #[builder(into, default = DEFAULT_API_BASE.to_string())]
    pub api_base: String,
    #[builder(into, default = "en".to_string())]
    pub language: String,
    #[builder(into, default)]
    pub client_version: String,
    /// Pause between two days, to stay friendly with the portal.
    #[builder(default = Duration::from_secs(1))]
    pub request_interval: Duration,
    #[builder(default)]
    pub retry: RetryPolicy,
}

impl RunConfig {
    /// Fixes the date range against `today`.
    pub fn resolve_range(&self, today: NaiveDate) -> Result<ResolvedRange, ConfigError> {
        let end = self.end.resolve(today);
        let start = self.start.unwrap_or(end);
        if start > end {
            return Err(ConfigError::StartAfterEnd { start, end });
        }
        Ok(ResolvedRange { start, end })
    }

    /// Reads the configuration from the process environment.
    ///
    /// Call [`load_env_file`] first to pick up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which maps a `SEMS_*` key to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let account = required("SEMS_ACCOUNT")?;
        let password = required("SEMS_PASSWORD")?;
        let station_id = required("SEMS_STATION_ID")?;

        let start = get("SEMS_START")
            .map(|value| {
                NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|source| {
                    ConfigError::InvalidDate {
                        key: "SEMS_START",
                        value,
                        source,
                    }
                })
            })
            .transpose()?;
        let end = match get("SEMS_END") {
            Some(value) => value.parse().map_err(|source| ConfigError::InvalidDate {
                key: "SEMS_END",
                value,
                source,
            })?,
            None => EndDate::Latest,
        };
        let tz_offset: TzOffset = get("SEMS_TZ_OFFSET")
            .as_deref()
            .unwrap_or(DEFAULT_TZ_OFFSET)
            .parse()?;

        let request_interval = match get("SEMS_SLEEP_SECONDS") {
            Some(value) => match value.trim().parse::<f64>() {
                Ok(secs) if secs.is_finite() && secs >= 0.0 => Duration::from_secs_f64(secs),
                _ => {
                    return Err(ConfigError::InvalidNumber {
                        key: "SEMS_SLEEP_SECONDS",
                        value,
                    })
                }
            },
            None => Duration::from_secs(1),
        };
        let mut retry = RetryPolicy::default();
        if let Some(value) = get("SEMS_MAX_RETRIES") {
            let retries: u32 = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidNumber {
                    key: "SEMS_MAX_RETRIES",
                    value,
                })?;
            retry.max_attempts = retries + 1;
        }

        Ok(RunConfig::builder()
            .credentials(Credentials::new(account, password))
            .station_id(station_id)
            .maybe_start(start)
            .end(end)
            .tz_offset(tz_offset)
            .output_dir(get("SEMS_OUT").unwrap_or_else(|| DEFAULT_OUTPUT_DIR.to_string()))
            .api_base(get("SEMS_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()))
            .language(get("SEMS_LANGUAGE").unwrap_or_else(|| "en".to_string()))
            .client_version(get("SEMS_CLIENT_VERSION").unwrap_or_default())
            .request_interval(request_interval)
            .retry(retry)
            .build())
    }
}

/// Loads `KEY=value` pairs into the environment without overriding existing variables.
///
/// With an explicit `path` the file must exist. Otherwise `SEMS_ENV_FILE` is
/// consulted, then a `.env` in the working directory (or a parent), which may be absent.
pub fn load_env_file(path: Option<&Path>) -> Result<Option<PathBuf>, ConfigError> {
    let explicit = path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os("SEMS_ENV_FILE").map(PathBuf::from));
    match explicit {
        Some(path) => {
            dotenvy::from_path(&path).map_err(|e| ConfigError::EnvFile(path.clone(), e))?;
            Ok(Some(path))
        }
        None => Ok(dotenvy::dotenv().ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn parses_offsets() {
        let cases = [
            ("+08:00", 8 * 3600),
            ("-05:30", -(5 * 3600 + 30 * 60)),
            ("+0100", 3600),
            ("+02", 7200),
            ("Z", 0),
        ];
        for (input, seconds) in cases {
            let offset: TzOffset = input.parse().unwrap();
            assert_eq!(offset.fixed().local_minus_utc(), seconds, "{input}");
        }
        assert!("08:00".parse::<TzOffset>().is_err());
        assert!("+25:00".parse::<TzOffset>().is_err());
        for bad in ["+\u{20ac}a", "+-5:00", "-+05:00", "+05:-30", "+0a00"] {
            assert!(
                matches!(bad.parse::<TzOffset>(), Err(ConfigError::InvalidOffset(_))),
                "{bad}"
            );
        }
        assert_eq!("-05:30".parse::<TzOffset>().unwrap().to_string(), "-05:30");
    }

    #[test]
    fn end_aliases_resolve_to_latest() {
        for alias in ["latest", "Today", "NOW"] {
            assert_eq!(alias.parse::<EndDate>().unwrap(), EndDate::Latest);
        }
        assert_eq!(
            "2025-09-03".parse::<EndDate>().unwrap(),
            EndDate::Date(date(2025, 9, 3))
        );
    }

    #[test]
    fn missing_required_values_are_fatal() {
        let err = RunConfig::from_lookup(lookup(&[("SEMS_ACCOUNT", "a")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SEMS_PASSWORD")));
    }

    #[test]
    fn reads_environment_with_defaults() {
        let config = RunConfig::from_lookup(lookup(&[
            ("SEMS_ACCOUNT", "me@example.com"),
            ("SEMS_PASSWORD", "pw"),
            ("SEMS_STATION_ID", "station-1"),
            ("SEMS_START", "2025-09-01"),
            ("SEMS_MAX_RETRIES", "4"),
            ("SEMS_SLEEP_SECONDS", "0.5"),
        ]))
        .unwrap();

        assert_eq!(config.start, Some(date(2025, 9, 1)));
        assert_eq!(config.end, EndDate::Latest);
        assert_eq!(config.tz_offset.to_string(), DEFAULT_TZ_OFFSET);
        assert_eq!(config.output_dir, PathBuf::from(DEFAULT_OUTPUT_DIR));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.request_interval, Duration::from_millis(500));
        assert!(!format!("{:?}", config).contains("pw\""));
    }

    #[test]
    fn rejects_reversed_range() {
        let config = RunConfig::builder()
            .credentials(Credentials::new("a", "b"))
            .station_id("s")
            .start(date(2025, 9, 5))
            .end(EndDate::Date(date(2025, 9, 1)))
            .tz_offset(TzOffset::utc())
            .build();
        assert!(matches!(
            config.resolve_range(date(2025, 10, 1)),
            Err(ConfigError::StartAfterEnd { .. })
        ));
    }

    #[test]
    fn latest_resolves_against_the_given_day() {
        let config = RunConfig::builder()
            .credentials(Credentials::new("a", "b"))
            .station_id("s")
            .start(date(2025, 9, 28))
            .tz_offset(TzOffset::utc())
            .build();
        let range = config.resolve_range(date(2025, 10, 2)).unwrap();
        assert_eq!(range.len(), 5);
        assert_eq!(range.days().last(), Some(date(2025, 10, 2)));

        let single = RunConfig::builder()
            .credentials(Credentials::new("a", "b"))
            .station_id("s")
            .tz_offset(TzOffset::utc())
            .build()
            .resolve_range(date(2025, 10, 2))
            .unwrap();
        assert_eq!(single.days().collect::<Vec<_>>(), vec![date(2025, 10, 2)]);
    }
}
