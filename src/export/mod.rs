pub mod artifact;
pub mod exporter;
pub mod retry;
