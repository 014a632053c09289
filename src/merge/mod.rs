pub mod aggregator;
pub mod flatten;
pub mod strategy;
