use crate::app::lifecycle::context::StartupContext;
use crate::core::pipeline::AsyncTask;
use crate::core::observability;
use crate::core::profiling::profiler::{ProfileTags, Profiler, spawn_reporter};
use anyhow::{Context, Error, anyhow};
use async_trait::async_trait;
use tracing::{info, instrument, warn};

pub struct StartProfilerTask;

#[async_trait]
impl AsyncTask<StartupContext, Error> for StartProfilerTask {
    #[instrument(skip_all, name = "start_profiler_task")]
    async fn run(&self, ctx: &StartupContext) -> Result<(), Error> {
        let cfg = ctx
            .config
            .get()
            .ok_or_else(|| anyhow!("Config not loaded before profiler start"))?;
        let config = &cfg.profiler;

        if !config.enabled {
            info!("Profiling disabled, spans will carry no profile labels");
            return Ok(());
        }

        // tracing must keep working without a profiler
        let tags = ProfileTags::new(
            observability::service_name(),
            cfg.logging.env(),
            observability::runtime_id(),
        );

        let profiler = match Profiler::start(config, tags) {
            Ok(profiler) => profiler,
            Err(e) => {
                warn!("Profiler unavailable, continuing without labels: {:#}", e);
                return Ok(());
            }
        };

        ctx.profiler.store(Some(profiler));

        if let Some(dir) = &config.output_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create profile dir {}", dir.display()))?;

            let reporter = spawn_reporter(ctx.profiler.clone(), config.report_interval, dir.clone());
            *ctx.profile_reporter.lock() = Some(reporter);

            info!(
                dir = %dir.display(),
                interval = ?config.report_interval,
                "Writing periodic flamegraphs"
            );
        }

        Ok(())
    }
}
