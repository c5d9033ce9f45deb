use crate::app::handlers::AppState;
use crate::core::profiling::profiler::{LabelFilter, write_flamegraph};
use actix_web::{HttpResponse, web};
use tracing::warn;

/// Flamegraph of the current sampling window, optionally narrowed to
/// one trace and/or span
pub async fn flamegraph(
    filter: web::Query<LabelFilter>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let Some(profiler) = state.profiler.load_full() else {
        return HttpResponse::ServiceUnavailable().body("profiler is not running");
    };

    let filter = filter.into_inner();
    let rendered = web::block(move || {
        let report = profiler.report(&filter)?;
        if report.data.is_empty() {
            return Ok(None);
        }

        let mut svg = Vec::new();
        write_flamegraph(&report, profiler.tags(), &mut svg)?;
        Ok::<_, anyhow::Error>(Some(svg))
    })
    .await;

    match rendered {
        Ok(Ok(Some(svg))) => HttpResponse::Ok().content_type("image/svg+xml").body(svg),
        Ok(Ok(None)) => HttpResponse::NotFound().body("no samples recorded for filter"),
        Ok(Err(e)) => {
            warn!("Failed rendering flamegraph: {:#}", e);
            HttpResponse::InternalServerError().finish()
        }
        Err(e) => {
            warn!("Flamegraph worker failed: {}", e);
            HttpResponse::InternalServerError().finish()
        }
    }
}
