use crate::config::ConfigError;
use crate::export::exporter::ExportError;
use crate::merge::aggregator::MergeError;
use crate::portal::error::PortalError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SemsError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Portal(#[from] PortalError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Merge(#[from] MergeError),
}
