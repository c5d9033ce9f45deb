pub mod config_load;
pub mod dataset_load;
pub mod observability;
pub mod profiler;
pub mod span_manager;
pub mod start_server;
