use crate::app::handlers::AppState;
use crate::core::correlation::context::TaskContext;
use crate::core::correlation::fanout::fan_out;
use crate::core::correlation::labels::{ExecutionUnit, WithExecutionUnit};
use crate::core::correlation::propagation::InboundHeaders;
use crate::core::dataset;
use actix_web::http::header::ContentType;
use actix_web::{HttpRequest, HttpResponse, web};
use serde::Deserialize;
use tracing::{debug, warn};

pub const OP_MOVIES: &str = "/movies";

#[derive(Debug, Default, Deserialize)]
pub struct MoviesQuery {
    pub q: Option<String>,
}

/// Sorted and filtered movie list. Every request is its own trace root
/// (or continues the inbound one) and fans out to the configured
/// workloads while the list is prepared. The response waits for the
/// branches, up to the join timeout
pub async fn movies(
    req: HttpRequest,
    query: web::Query<MoviesQuery>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let unit = ExecutionUnit::new();
    let carrier = state
        .spans
        .root_carrier(&InboundHeaders(req.headers()), OP_MOVIES);

    let task_unit = unit.clone();
    async move {
        let mut root = state.spans.open(&task_unit, carrier.clone());
        let ctx = TaskContext::new(state.spans.clone(), task_unit, carrier);

        let branches = state.workloads.branches();
        let joined = fan_out(&ctx, branches, Some(state.workloads.join_timeout()));

        let listed = async {
            let movies = dataset::sort_and_filter(&state.movies, query.q.as_deref());
            serde_json::to_vec(&movies)
        };

        let (report, body) = tokio::join!(joined, listed);

        if !report.is_complete() {
            root.mark_degraded(format!(
                "{} of {} branches still running at join timeout",
                report.outstanding.len(),
                report.scheduled
            ));
        }

        let response = match body {
            Ok(body) => HttpResponse::Ok()
                .content_type(ContentType::json())
                .body(body),
            Err(e) => {
                warn!("encode into json failed: {}", e);
                root.record_error(&e);
                HttpResponse::InternalServerError().finish()
            }
        };

        debug!(
            trace_id = %ctx.carrier().trace_id(),
            branches = report.scheduled,
            failed = report.failures().count(),
            "Movies request done"
        );

        root.end();
        response
    }
    .with_unit(unit)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::WorkloadConfig;
    use crate::app::workload::Workloads;
    use crate::app::workload::fibonacci::{OP_FIBONACCI, OP_FIBONACCI_WITH_TRACE};
    use crate::core::correlation::fanout::TAG_SERVICE;
    use crate::core::correlation::span::SpanOutcome;
    use crate::core::correlation::span::testing::{MemorySink, manager};
    use crate::core::models::movie::Movie;
    use crate::core::profiling::binder::SamplerBinder;
    use actix_web::{App, test};
    use arc_swap::ArcSwapOption;
    use std::sync::Arc;
    use std::time::Duration;

    fn state(workload: WorkloadConfig) -> (web::Data<AppState>, Arc<MemorySink>) {
        let (spans, sink) = manager(Arc::new(SamplerBinder::new()));
        let movies = vec![
            Movie {
                title: "Alien".into(),
                vote_average: 8.5,
                release_date: "1979-05-25".into(),
            },
            Movie {
                title: "Aliens".into(),
                vote_average: 8.4,
                release_date: "1986-07-18".into(),
            },
            Movie {
                title: "Heat".into(),
                vote_average: 8.3,
                release_date: "1995-12-15".into(),
            },
        ];

        let state = AppState {
            spans,
            movies: Arc::new(movies),
            workloads: Arc::new(Workloads::from_config(&workload).unwrap()),
            profiler: Arc::new(ArcSwapOption::empty()),
        };

        (web::Data::new(state), sink)
    }

    fn small_workload() -> WorkloadConfig {
        WorkloadConfig {
            fibonacci_n: 32,
            ..Default::default()
        }
    }

    #[actix_web::test]
    async fn test_movies_filters_and_traces() {
        let (state, sink) = state(small_workload());
        let app = test::init_service(
            App::new()
                .app_data(state)
                .configure(crate::app::handlers::configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/movies?q=alien").to_request();
        let movies: Vec<Movie> = test::call_and_read_body_json(&app, req).await;

        let titles: Vec<_> = movies.iter().map(|m| m.title.as_str()).collect();
        assert_eq!(titles, vec!["Aliens", "Alien"]);

        let root = &sink.find(OP_MOVIES)[0];
        let branch = &sink.find(OP_FIBONACCI)[0];

        assert!(root.parent_span_id().is_none());
        assert_eq!(root.outcome, SpanOutcome::Ok);
        assert_eq!(branch.parent_span_id(), Some(root.carrier.span_id()));
        assert_eq!(branch.carrier.tag(TAG_SERVICE), Some("svc-1"));
        assert_eq!(sink.find(OP_FIBONACCI_WITH_TRACE).len(), 2);
        assert!(sink
            .records()
            .iter()
            .all(|r| r.carrier.trace_id() == root.carrier.trace_id()));
    }

    #[actix_web::test]
    async fn test_sequence_restarts_per_request_and_context_is_continued() {
        let (state, sink) = state(small_workload());
        let app = test::init_service(
            App::new()
                .app_data(state)
                .configure(crate::app::handlers::configure),
        )
        .await;

        for _ in 0..2 {
            let req = test::TestRequest::get()
                .uri("/movies")
                .insert_header((
                    "traceparent",
                    "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
                ))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert!(resp.status().is_success());
        }

        let roots = sink.find(OP_MOVIES);
        assert_eq!(roots.len(), 2);
        assert!(roots.iter().all(|r| r.carrier.trace_id().to_string()
            == "4bf92f3577b34da6a3ce929d0e0e4736"));

        let names: Vec<_> = sink
            .find(OP_FIBONACCI)
            .iter()
            .map(|r| r.carrier.tag(TAG_SERVICE).unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["svc-1", "svc-1"]);
    }

    #[actix_web::test]
    async fn test_slow_branch_degrades_root_but_answers() {
        let (state, sink) = state(WorkloadConfig {
            fibonacci_n: 36,
            join_timeout: Duration::from_millis(1),
            ..Default::default()
        });
        let app = test::init_service(
            App::new()
                .app_data(state)
                .configure(crate::app::handlers::configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/movies").to_request();
        let movies: Vec<Movie> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(movies.len(), 3);

        let root = &sink.find(OP_MOVIES)[0];
        assert!(matches!(root.outcome, SpanOutcome::Degraded(_)));
    }
}
