pub mod observability;
pub mod profiler;
pub mod stop_server;
