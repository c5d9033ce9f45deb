pub mod config_manager;
pub mod correlation;
pub mod dataset;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod profiling;
