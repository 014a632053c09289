//! Naming and persistence of the per-day JSON artifacts.

use crate::utils::write_atomic;
use chrono::NaiveDate;
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::task;

pub const ARTIFACT_PREFIX: &str = "raw_v2_";
pub const ARTIFACT_EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Failed to serialize payload for {0}")]
    Serialize(NaiveDate, #[source] serde_json::Error),

    #[error("Failed to write artifact '{0}'")]
    Write(PathBuf, #[source] std::io::Error),

    #[error("Background write task failed")]
    TaskJoin(#[from] task::JoinError),
}

/// `raw_v2_YYYY-MM-DD.json`
pub fn artifact_name(day: NaiveDate) -> String {
    format!(
        "{}{}.{}",
        ARTIFACT_PREFIX,
        day.format("%Y-%m-%d"),
        ARTIFACT_EXTENSION
    )
}

/// The day embedded in an artifact file name, if `name` is one.
pub fn parse_artifact_name(name: &str, prefix: &str) -> Option<NaiveDate> {
    let date = name
        .strip_prefix(prefix)?
        .strip_suffix(ARTIFACT_EXTENSION)?
        .strip_suffix('.')?;
    if date.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Persists one day's payload under `dir`, replacing any earlier artifact of that day.
///
/// The payload is serialized before anything touches the disk, and the file
/// only appears once fully written.
pub async fn write_artifact(
    dir: &Path,
    day: NaiveDate,
    payload: &Value,
) -> Result<PathBuf, ArtifactError> {
    let bytes = serde_json::to_vec_pretty(payload).map_err(|e| ArtifactError::Serialize(day, e))?;
    let path = dir.join(artifact_name(day));
    let target = path.clone();
    task::spawn_blocking(move || write_atomic(&target, &bytes))
        .await?
        .map_err(|e| ArtifactError::Write(path.clone(), e))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 9, 1).unwrap()
    }

    #[test]
    fn names_round_trip_and_reject_lookalikes() {
        assert_eq!(artifact_name(day()), "raw_v2_2025-09-01.json");
        assert_eq!(
            parse_artifact_name("raw_v2_2025-09-01.json", ARTIFACT_PREFIX),
            Some(day())
        );
        for name in [
            "raw_v2_2025-09-01_try1.txt",
            "raw_v2_2025-09-01.json.tmp",
            "raw_v2_2025-9-1.json",
            "raw_v2_2025-02-30.json",
            "auth_v2_status.txt",
            "plant_power_v2.parquet",
        ] {
            assert_eq!(parse_artifact_name(name, ARTIFACT_PREFIX), None, "{name}");
        }
    }

    #[tokio::test]
    async fn rewrites_are_byte_identical() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let payload = json!({ "hasError": false, "code": 0, "data": { "lines": [] } });

        let path = write_artifact(dir.path(), day(), &payload).await?;
        let first = std::fs::read(&path)?;
        write_artifact(dir.path(), day(), &payload).await?;
        assert_eq!(std::fs::read(&path)?, first);

        let reread: Value = serde_json::from_slice(&first)?;
        assert_eq!(reread, payload);
        Ok(())
    }
}
