use crate::app::config::SpanprofConfig;
use crate::core::correlation::span::SpanManager;
use crate::core::models::movie::Movie;
use crate::core::profiling::profiler::ProfilerSlot;
use actix_web::dev::ServerHandle;
use opentelemetry_sdk::trace::SdkTracerProvider;
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use tokio::task::JoinHandle;

#[derive(Default)]
pub struct StartupContext {
    /// Loaded and validated config
    pub config: OnceLock<SpanprofConfig>,
    /// Present only if an otlp sink is configured
    pub observability: OnceLock<SdkTracerProvider>,

    // Shared things and data providers
    /// Empty when profiling is disabled or could not start
    pub profiler: ProfilerSlot,
    /// Periodic flamegraph writer, aborted on shutdown
    pub profile_reporter: Mutex<Option<JoinHandle<()>>>,
    pub movies: OnceLock<Arc<Vec<Movie>>>,
    pub spans: OnceLock<Arc<SpanManager>>,

    /// The web server
    pub server: OnceLock<ServerHandle>,
}
