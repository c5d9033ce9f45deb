pub mod cors;
pub mod movies;
pub mod profile;

use crate::app::workload::Workloads;
use crate::core::correlation::span::SpanManager;
use crate::core::models::movie::Movie;
use crate::core::profiling::profiler::ProfilerSlot;
use actix_web::web;
use std::sync::Arc;

/// Everything request handlers share, built once at startup
pub struct AppState {
    pub spans: Arc<SpanManager>,
    pub movies: Arc<Vec<Movie>>,
    pub workloads: Arc<Workloads>,
    pub profiler: ProfilerSlot,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/movies", web::get().to(movies::movies))
        .route(
            "/debug/pprof/flamegraph",
            web::get().to(profile::flamegraph),
        );
}
