use crate::app::handlers::{self, AppState};
use crate::app::lifecycle::context::StartupContext;
use crate::app::workload::Workloads;
use crate::core::pipeline::AsyncTask;
use actix_web::middleware::{Compress, from_fn};
use actix_web::{App, HttpServer, web};
use anyhow::{Context, Error, anyhow};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct StartServerTask;

#[async_trait]
impl AsyncTask<StartupContext, Error> for StartServerTask {
    #[instrument(skip_all, name = "start_server_task")]
    async fn run(&self, ctx: &StartupContext) -> Result<(), Error> {
        let config = ctx
            .config
            .get()
            .ok_or_else(|| anyhow!("Server pipeline context missing config!"))?;

        let state = web::Data::new(AppState {
            spans: ctx
                .spans
                .get()
                .ok_or_else(|| anyhow!("Span manager not built"))?
                .clone(),
            movies: ctx
                .movies
                .get()
                .ok_or_else(|| anyhow!("Movies not loaded"))?
                .clone(),
            workloads: Arc::new(Workloads::from_config(&config.workload)?),
            profiler: ctx.profiler.clone(),
        });

        let mut server = HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .wrap(from_fn(handlers::cors::allow_all))
                .wrap(Compress::default())
                .configure(handlers::configure)
        })
        // shutdown is driven by the shutdown pipeline
        .disable_signals();

        if let Some(workers) = config.server.workers {
            server = server.workers(workers);
        }

        let server = server
            .bind((config.server.host.as_str(), config.server.port))
            .with_context(|| {
                format!(
                    "failed to bind {}:{}",
                    config.server.host, config.server.port
                )
            })?
            .run();

        ctx.server
            .set(server.handle())
            .map_err(|_| anyhow!("Could not set server"))?;

        actix_web::rt::spawn(async move {
            if let Err(e) = server.await {
                warn!("Http server stopped with error: {}", e);
            }
        });

        info!(
            host = %config.server.host,
            port = config.server.port,
            "Started http server, ready for requests"
        );

        Ok(())
    }
}
