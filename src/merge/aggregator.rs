//! Merges a directory of day artifacts into one Parquet table.

use crate::export::artifact::{parse_artifact_name, ARTIFACT_PREFIX};
use crate::merge::flatten::{DailyAggregate, FlatRow, Flattener};
use crate::utils::temp_file_beside;
use bon::Builder;
use chrono::{NaiveDate, NaiveDateTime};
use log::{info, warn};
use polars::prelude::*;
use serde_json::Value;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::{fs, task};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Source directory '{0}' cannot be read")]
    SourceUnreadable(PathBuf, #[source] io::Error),

    #[error("No files matching '{prefix}YYYY-MM-DD.json' in '{dir}'")]
    NoInputFiles { dir: PathBuf, prefix: String },

    #[error("No data rows extracted from {files} file(s) in '{dir}'")]
    NoRows { dir: PathBuf, files: usize },

    #[error("Failed to build the merged table")]
    Frame(#[from] PolarsError),

    #[error("I/O error writing parquet file '{0}'")]
    ParquetWriteIo(PathBuf, #[source] io::Error),

    #[error("Encoding error writing parquet file '{0}'")]
    ParquetWritePolars(PathBuf, #[source] PolarsError),

    #[error("Background task failed to complete")]
    TaskJoin(#[from] task::JoinError),
}

/// A file that was skipped, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeWarning {
    pub path: PathBuf,
    pub reason: String,
}

/// All rows of a merge, with the union of their metric columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedDataset {
    pub rows: Vec<FlatRow>,
    /// Metric columns in order of first appearance.
    pub metric_columns: Vec<String>,
    pub aggregates: Vec<DailyAggregate>,
}

impl MergedDataset {
    /// Appends one day's rows, widening the schema as needed.
    pub fn extend(&mut self, rows: Vec<FlatRow>) {
        for row in &rows {
            for (name, _) in &row.metrics {
                if !self.metric_columns.contains(name) {
                    self.metric_columns.push(name.clone());
                }
            }
        }
        self.rows.extend(rows);
    }

    pub fn column_names(&self) -> Vec<String> {
        let mut names = vec!["timestamp".to_string(), "time_local".to_string()];
        names.extend(self.metric_columns.iter().cloned());
        names.push("day".to_string());
        names.push("source".to_string());
        names
    }

    /// The rows as a table; a metric a row lacks is null.
    pub fn to_frame(&self) -> PolarsResult<DataFrame> {
        let timestamps: Vec<Option<NaiveDateTime>> = self.rows.iter().map(|r| r.timestamp).collect();
        let local_times: Vec<Option<NaiveDateTime>> =
            self.rows.iter().map(|r| r.time_local).collect();
        let days: Vec<NaiveDate> = self.rows.iter().map(|r| r.day).collect();
        let sources: Vec<&str> = self.rows.iter().map(|r| r.source.as_str()).collect();

        let mut columns: Vec<Column> = Vec::with_capacity(self.metric_columns.len() + 4);
        columns.push(Series::new("timestamp".into(), timestamps).into());
        columns.push(Series::new("time_local".into(), local_times).into());
        for name in &self.metric_columns {
            let values: Vec<Option<f64>> = self.rows.iter().map(|r| r.metric(name)).collect();
            columns.push(Series::new(name.as_str().into(), values).into());
        }
        columns.push(Series::new("day".into(), days).into());
        columns.push(Series::new("source".into(), sources).into());
        DataFrame::new(columns)
    }

    pub fn aggregates_frame(&self) -> PolarsResult<DataFrame> {
        let days: Vec<NaiveDate> = self.aggregates.iter().map(|a| a.day).collect();
        let keys: Vec<&str> = self.aggregates.iter().map(|a| a.key.as_str()).collect();
        let values: Vec<f64> = self.aggregates.iter().map(|a| a.value).collect();
        let sources: Vec<&str> = self.aggregates.iter().map(|a| a.source.as_str()).collect();
        DataFrame::new(vec![
            Series::new("day".into(), days).into(),
            Series::new("key".into(), keys).into(),
            Series::new("value".into(), values).into(),
            Series::new("source".into(), sources).into(),
        ])
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    pub files_scanned: usize,
    pub files_merged: usize,
    /// Days whose artifact was readable but carried no series.
    pub empty_days: Vec<NaiveDate>,
    pub warnings: Vec<MergeWarning>,
    pub rows_written: usize,
    /// Rows dropped because an earlier day already had their exact timestamp.
    pub duplicates_dropped: usize,
    pub columns: Vec<String>,
    pub aggregates_written: Option<usize>,
}

#[derive(Debug, Clone, Builder)]
pub struct Merger {
    flattener: Flattener,
    #[builder(into, default = ARTIFACT_PREFIX.to_string())]
    prefix: String,
    /// Where to write the per-day aggregates table, if wanted.
    #[builder(into)]
    aggregates_output: Option<PathBuf>,
}

impl Merger {
    /// Merges every artifact in `source_dir` into the Parquet file at `output`.
    pub async fn merge(&self, source_dir: &Path, output: &Path) -> Result<MergeReport, MergeError> {
        let artifacts = list_artifacts(source_dir, &self.prefix).await?;
        if artifacts.is_empty() {
            return Err(MergeError::NoInputFiles {
                dir: source_dir.to_path_buf(),
                prefix: self.prefix.clone(),
            });
        }
        info!(
            "Loading {} file(s) from {}",
            artifacts.len(),
            source_dir.display()
        );

        let (dataset, mut report) = self.load(&artifacts).await;
        if dataset.rows.is_empty() {
            return Err(MergeError::NoRows {
                dir: source_dir.to_path_buf(),
                files: artifacts.len(),
            });
        }

        write_parquet(dataset.to_frame()?, output).await?;
        report.rows_written = dataset.rows.len();
        report.columns = dataset.column_names();
        info!(
            "Wrote {} row(s) to {}",
            report.rows_written,
            output.display()
        );

        if let Some(path) = &self.aggregates_output {
            write_parquet(dataset.aggregates_frame()?, path).await?;
            report.aggregates_written = Some(dataset.aggregates.len());
            info!(
                "Wrote {} daily aggregate(s) to {}",
                dataset.aggregates.len(),
                path.display()
            );
        }
        Ok(report)
    }

    /// Reads and flattens `artifacts` in order. Unreadable files become warnings.
    pub async fn load(&self, artifacts: &[(NaiveDate, PathBuf)]) -> (MergedDataset, MergeReport) {
        let mut dataset = MergedDataset::default();
        let mut report = MergeReport {
            files_scanned: artifacts.len(),
            ..MergeReport::default()
        };
        let mut earlier_timestamps: HashSet<NaiveDateTime> = HashSet::new();

        for (day, path) in artifacts {
            let payload = match read_payload(path).await {
                Ok(payload) => payload,
                Err(reason) => {
                    warn!("Skipping {}: {}", path.display(), reason);
                    report.warnings.push(MergeWarning {
                        path: path.clone(),
                        reason,
                    });
                    continue;
                }
            };
            report.files_merged += 1;

            let flat = self.flattener.flatten(&payload, *day);
            dataset.aggregates.extend(flat.aggregates);
            if flat.rows.is_empty() {
                info!("No rows for {} ({}), skipping day", day, path.display());
                report.empty_days.push(*day);
                continue;
            }

            let day_timestamps: HashSet<NaiveDateTime> =
                flat.rows.iter().filter_map(|r| r.timestamp).collect();
            let before = flat.rows.len();
            let rows: Vec<FlatRow> = flat
                .rows
                .into_iter()
                .filter(|row| {
                    row.timestamp
                        .map_or(true, |ts| !earlier_timestamps.contains(&ts))
                })
                .collect();
            if rows.len() < before {
                warn!(
                    "{}: dropped {} row(s) already covered by an earlier day",
                    day,
                    before - rows.len()
                );
                report.duplicates_dropped += before - rows.len();
            }
            earlier_timestamps.extend(day_timestamps);
            dataset.extend(rows);
        }
        (dataset, report)
    }
}

/// Artifacts in `dir` sorted by their embedded date.
pub async fn list_artifacts(
    dir: &Path,
    prefix: &str,
) -> Result<Vec<(NaiveDate, PathBuf)>, MergeError> {
    let unreadable = |e| MergeError::SourceUnreadable(dir.to_path_buf(), e);
    let mut entries = fs::read_dir(dir).await.map_err(unreadable)?;
    let mut artifacts = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(unreadable)? {
        let name = entry.file_name();
        let Some(day) = name.to_str().and_then(|n| parse_artifact_name(n, prefix)) else {
            continue;
        };
        artifacts.push((day, entry.path()));
    }
    artifacts.sort();
    Ok(artifacts)
}

async fn read_payload(path: &Path) -> Result<Value, String> {
    let bytes = fs::read(path)
        .await
        .map_err(|e| format!("cannot read file: {}", e))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("invalid JSON: {}", e))
}

/// Writes `df` to `path` through a temp file in the same directory.
async fn write_parquet(mut df: DataFrame, path: &Path) -> Result<(), MergeError> {
    let path_buf = path.to_path_buf();
    task::spawn_blocking(move || {
        let mut temp = temp_file_beside(&path_buf)
            .map_err(|e| MergeError::ParquetWriteIo(path_buf.clone(), e))?;
        ParquetWriter::new(&mut temp)
            .with_compression(ParquetCompression::Snappy)
            .finish(&mut df)
            .map_err(|e| MergeError::ParquetWritePolars(path_buf.clone(), e))?;
        temp.persist(&path_buf)
            .map_err(|e| MergeError::ParquetWriteIo(path_buf.clone(), e.error))?;
        Ok::<(), MergeError>(())
    })
    .await??;
    Ok(())
}
