use crate::app::lifecycle::context::StartupContext;
use crate::app::lifecycle::shutdown::tasks::observability::ObservabilityShutdownTask;
use crate::app::lifecycle::shutdown::tasks::profiler::ProfilerShutdownTask;
use crate::app::lifecycle::shutdown::tasks::stop_server::StopServerTask;
use crate::app::span::InstrumentedPipeline;
use crate::core::pipeline::{Pipeline, PipelineBuilder};
use anyhow::anyhow;
use tracing::info_span;

/// Builds the shutdown pipeline, which takes the resulting `StartupContext`
/// which is responsible for attaching anything which may need shutdown
pub fn build_shutdown_pipeline() -> Result<Pipeline<StartupContext, anyhow::Error>, anyhow::Error>
{
    let shutdown_pipeline = PipelineBuilder::new()
        .with_async(Box::new(StopServerTask))
        .with_blocking(Box::new(ProfilerShutdownTask))
        .with_blocking(Box::new(ObservabilityShutdownTask))
        .build()
        .ok_or_else(|| anyhow!("Shutdown pipeline should have tasks!"))?;

    let observed_pipeline =
        InstrumentedPipeline::new(shutdown_pipeline, || info_span!("shutdown_pipeline"));

    PipelineBuilder::new()
        .with_async(Box::new(observed_pipeline))
        .build()
        .ok_or_else(|| anyhow!("Shutdown pipeline should have tasks!"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_of_nothing_started_succeeds() {
        let ctx = StartupContext::default();
        let pipeline = build_shutdown_pipeline().unwrap();

        pipeline.run(&ctx).await.unwrap();
    }
}
