//! Export raw SEMS portal power charts one day at a time, and merge the saved
//! days into a single Parquet table.

pub mod config;
mod error;
pub mod export;
pub mod merge;
pub mod portal;
mod utils;

pub use config::{
    load_env_file, ConfigError, Credentials, EndDate, ResolvedRange, RunConfig, TzOffset,
};
pub use error::SemsError;

pub use export::artifact::{artifact_name, parse_artifact_name, ArtifactError, ARTIFACT_PREFIX};
pub use export::exporter::{DayFailure, DaySuccess, ExportError, Exporter, RunReport};
pub use export::retry::{with_retry, Retried, RetryFailure, RetryPolicy};

pub use merge::aggregator::{
    list_artifacts, MergeError, MergeReport, MergeWarning, MergedDataset, Merger,
};
pub use merge::flatten::{parse_time_label, DailyAggregate, FlatDay, FlatRow, Flattener, SOURCE_TAG};
pub use merge::strategy::{default_strategies, ExtractionStrategy, MetricMap};

pub use portal::client::{DayRequest, Portal, SemsClient};
pub use portal::error::{FailureCause, PortalError};
pub use portal::session::{Session, SessionManager};
