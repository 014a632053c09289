//! The export loop: one raw artifact per calendar day of the run.

use crate::config::{ConfigError, ResolvedRange, RunConfig};
use crate::export::artifact::write_artifact;
use crate::export::retry::with_retry;
use crate::merge::flatten::Flattener;
use crate::portal::client::{DayRequest, Portal, SemsClient};
use crate::portal::error::{FailureCause, PortalError};
use crate::portal::session::SessionManager;
use crate::utils::ensure_dir_exists;
use chrono::NaiveDate;
use log::{error, info, warn};
use std::error::Error as StdError;
use std::path::PathBuf;
use thiserror::Error;

const ABORTED: &str = "run aborted";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to create output directory '{0}'")]
    OutputDirCreation(PathBuf, #[source] std::io::Error),

    #[error("Failed to set up the portal client")]
    Portal(#[from] PortalError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DaySuccess {
    pub day: NaiveDate,
    pub path: PathBuf,
    pub attempts: u32,
    /// Rows the payload flattens to. Zero means the portal had nothing for the day.
    pub points: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DayFailure {
    pub day: NaiveDate,
    /// `None` when the day failed locally or was never attempted.
    pub cause: Option<FailureCause>,
    pub attempts: u32,
    pub message: String,
}

/// Outcome of a run, covering every day of the resolved range.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub range: ResolvedRange,
    pub succeeded: Vec<DaySuccess>,
    pub failed: Vec<DayFailure>,
    /// Set when the run stopped early, e.g. on rejected credentials.
    pub aborted: Option<String>,
}

impl RunReport {
    fn new(range: ResolvedRange) -> Self {
        Self {
            range,
            succeeded: Vec::new(),
            failed: Vec::new(),
            aborted: None,
        }
    }

    pub fn days_succeeded(&self) -> usize {
        self.succeeded.len()
    }

    pub fn days_failed(&self) -> usize {
        self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.aborted.is_none()
    }
}

/// Drives the day-by-day export against a [`Portal`].
pub struct Exporter<P: Portal> {
    config: RunConfig,
    portal: P,
    sessions: SessionManager,
    flattener: Flattener,
}

impl Exporter<SemsClient> {
    /// An exporter talking to the real portal.
    pub fn connect(config: RunConfig) -> Result<Self, ExportError> {
        let portal = SemsClient::new(&config)?;
        Ok(Self::new(config, portal))
    }
}

impl<P: Portal> Exporter<P> {
    pub fn new(config: RunConfig, portal: P) -> Self {
        Self {
            sessions: SessionManager::new(config.credentials.clone()),
            flattener: Flattener::new(config.tz_offset),
            config,
            portal,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Exports every day up to today in the configured timezone.
    pub async fn run(&mut self) -> Result<RunReport, ExportError> {
        let today = self.config.tz_offset.today();
        self.run_as_of(today).await
    }

    /// Exports the configured range with `latest` meaning `today`.
    ///
    /// Only configuration and output directory problems are errors. Day-level
    /// failures end up in the report.
    pub async fn run_as_of(&mut self, today: NaiveDate) -> Result<RunReport, ExportError> {
        let range = self.config.resolve_range(today)?;
        let output_dir = self.config.output_dir.clone();
        ensure_dir_exists(&output_dir)
            .await
            .map_err(|e| ExportError::OutputDirCreation(output_dir.clone(), e))?;
        info!(
            "Exporting {} day(s) of station {} from {} to {} into {}",
            range.len(),
            self.config.station_id,
            range.start,
            range.end,
            output_dir.display()
        );

        let mut report = RunReport::new(range);
        let days: Vec<NaiveDate> = range.days().collect();
        for (index, day) in days.iter().copied().enumerate() {
            if index > 0 && !self.config.request_interval.is_zero() {
                tokio::time::sleep(self.config.request_interval).await;
            }
            match self.export_day(day).await {
                Ok(success) => report.succeeded.push(success),
                Err(failure) => {
                    let abort = failure.cause == Some(FailureCause::AuthRejected);
                    report.failed.push(failure);
                    if abort {
                        error!("Credentials rejected, skipping the remaining days");
                        report.failed.extend(days[index + 1..].iter().map(|day| DayFailure {
                            day: *day,
                            cause: None,
                            attempts: 0,
                            message: ABORTED.to_string(),
                        }));
                        report.aborted = Some("credentials rejected".to_string());
                        break;
                    }
                }
            }
        }

        info!(
            "Export finished: {} succeeded, {} failed",
            report.days_succeeded(),
            report.days_failed()
        );
        Ok(report)
    }

    async fn export_day(&mut self, day: NaiveDate) -> Result<DaySuccess, DayFailure> {
        let request = DayRequest {
            station_id: self.config.station_id.clone(),
            date: day,
            tz_offset: self.config.tz_offset,
        };
        let portal = &self.portal;
        let retried = with_retry(&self.config.retry, &mut self.sessions, portal, |session| {
            let request = &request;
            async move { portal.fetch_day(&session, request).await }
        })
        .await
        .map_err(|failure| {
            warn!("{}: failed ({}): {}", day, failure.cause(), failure);
            DayFailure {
                day,
                cause: Some(failure.cause()),
                attempts: failure.attempts,
                message: failure.to_string(),
            }
        })?;

        let path = write_artifact(&self.config.output_dir, day, &retried.value)
            .await
            .map_err(|e| {
                let message = describe(&e);
                warn!("{}: {}", day, message);
                DayFailure {
                    day,
                    cause: None,
                    attempts: retried.attempts,
                    message,
                }
            })?;

        let points = self.flattener.flatten(&retried.value, day).rows.len();
        if points == 0 {
            warn!("{}: saved {} but it holds no curve points", day, path.display());
        } else {
            info!("{}: saved {} ({} points)", day, path.display(), points);
        }
        Ok(DaySuccess {
            day,
            path,
            attempts: retried.attempts,
            points,
        })
    }
}

fn describe(error: &dyn StdError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credentials, EndDate, TzOffset};
    use crate::export::artifact::artifact_name;
    use crate::export::retry::RetryPolicy;
    use crate::portal::testing::{chart_payload, expired, ScriptedPortal};
    use serde_json::json;
    use std::path::Path;
    use std::time::Duration;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 9, d).unwrap()
    }

    fn config(dir: &Path, start: NaiveDate, end: EndDate) -> RunConfig {
        RunConfig::builder()
            .credentials(Credentials::new("me@example.com", "pw"))
            .station_id("station-1")
            .start(start)
            .end(end)
            .tz_offset(TzOffset::utc())
            .output_dir(dir.join("json_export"))
            .request_interval(Duration::ZERO)
            .retry(RetryPolicy {
                base_delay: Duration::from_secs(1),
                ..RetryPolicy::default()
            })
            .build()
    }

    fn payload_for(request: &DayRequest) -> serde_json::Value {
        let value = request.date.format("%d").to_string().parse::<f64>().unwrap();
        chart_payload(&[("PCurve_Power_PV", &[("12:00", value), ("12:05", value)])])
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_every_day_and_continues_past_failures() {
        let dir = tempfile::tempdir().unwrap();
        let portal = ScriptedPortal::new(|request, previous| {
            if request.date == date(2) {
                Err(PortalError::Rejected {
                    code: "1".to_string(),
                    message: "no data".to_string(),
                })
            } else if request.date == date(3) && previous == 0 {
                Err(expired())
            } else {
                Ok(payload_for(request))
            }
        });
        let mut exporter = Exporter::new(
            config(dir.path(), date(1), EndDate::Date(date(4))),
            portal,
        );

        let report = exporter.run_as_of(date(20)).await.unwrap();
        assert_eq!(report.days_succeeded(), 3);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].day, date(2));
        assert_eq!(report.failed[0].cause, Some(FailureCause::PortalRejectedData));
        assert_eq!(report.succeeded[1].attempts, 2);
        assert_eq!(report.succeeded[0].points, 2);

        assert_eq!(
            exporter.portal.fetched_days(),
            vec![date(1), date(2), date(3), date(3), date(4)]
        );
        let out = dir.path().join("json_export");
        assert!(out.join(artifact_name(date(1))).is_file());
        assert!(!out.join(artifact_name(date(2))).exists());
        assert!(out.join(artifact_name(date(4))).is_file());
    }

    #[tokio::test(start_paused = true)]
    async fn reruns_produce_identical_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let run = |dir: &Path| {
            Exporter::new(
                config(dir, date(1), EndDate::Date(date(2))),
                ScriptedPortal::new(|request, _| Ok(payload_for(request))),
            )
        };

        let first = run(dir.path()).run_as_of(date(20)).await.unwrap();
        let before: Vec<Vec<u8>> = first
            .succeeded
            .iter()
            .map(|s| std::fs::read(&s.path).unwrap())
            .collect();
        let second = run(dir.path()).run_as_of(date(20)).await.unwrap();
        let after: Vec<Vec<u8>> = second
            .succeeded
            .iter()
            .map(|s| std::fs::read(&s.path).unwrap())
            .collect();
        assert_eq!(before, after);
        assert_eq!(
            std::fs::read_dir(dir.path().join("json_export")).unwrap().count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn latest_stops_at_the_resolved_day() {
        let dir = tempfile::tempdir().unwrap();
        let mut exporter = Exporter::new(
            config(dir.path(), date(8), EndDate::Latest),
            ScriptedPortal::new(|request, _| Ok(payload_for(request))),
        );

        let report = exporter.run_as_of(date(10)).await.unwrap();
        assert_eq!(report.range.end, date(10));
        assert!(report.is_complete());
        assert_eq!(
            exporter.portal.fetched_days(),
            vec![date(8), date(9), date(10)]
        );
        assert!(!dir
            .path()
            .join("json_export")
            .join(artifact_name(date(11)))
            .exists());
        // One session serves the whole run.
        assert_eq!(exporter.portal.logins(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_credentials_abort_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut exporter = Exporter::new(
            config(dir.path(), date(1), EndDate::Date(date(3))),
            ScriptedPortal::rejecting_logins(),
        );

        let report = exporter.run_as_of(date(20)).await.unwrap();
        assert!(report.aborted.is_some());
        assert_eq!(report.days_succeeded(), 0);
        assert_eq!(report.days_failed(), 3);
        assert_eq!(report.failed[0].cause, Some(FailureCause::AuthRejected));
        assert!(report.failed[1..]
            .iter()
            .all(|f| f.message == ABORTED && f.attempts == 0));
        assert!(exporter.portal.fetched_days().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_days_are_still_saved() {
        let dir = tempfile::tempdir().unwrap();
        let mut exporter = Exporter::new(
            config(dir.path(), date(1), EndDate::Date(date(1))),
            ScriptedPortal::new(|_, _| {
                Ok(json!({ "hasError": false, "code": 0, "data": { "lines": [] } }))
            }),
        );

        let report = exporter.run_as_of(date(20)).await.unwrap();
        assert_eq!(report.succeeded[0].points, 0);
        assert!(report.succeeded[0].path.is_file());
    }

    #[tokio::test]
    async fn reversed_range_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut exporter = Exporter::new(
            config(dir.path(), date(5), EndDate::Date(date(1))),
            ScriptedPortal::new(|request, _| Ok(payload_for(request))),
        );
        let err = exporter.run_as_of(date(20)).await.unwrap_err();
        assert!(matches!(
            err,
            ExportError::Config(ConfigError::StartAfterEnd { .. })
        ));
    }
}
