use crate::app::lifecycle::context::StartupContext;
use crate::app::lifecycle::startup::tasks::config_load::ConfigLoadTask;
use crate::app::lifecycle::startup::tasks::dataset_load::DatasetLoadTask;
use crate::app::lifecycle::startup::tasks::observability::ConfigureObservabilityTask;
use crate::app::lifecycle::startup::tasks::profiler::StartProfilerTask;
use crate::app::lifecycle::startup::tasks::span_manager::SpanManagerTask;
use crate::app::lifecycle::startup::tasks::start_server::StartServerTask;
use crate::core::config_manager::ConfigManager;
use crate::core::pipeline::{Pipeline, PipelineBuilder};
use anyhow::anyhow;
use std::path::PathBuf;

pub fn build_start_pipeline(
    cfg_path: PathBuf,
) -> Result<Pipeline<StartupContext, anyhow::Error>, anyhow::Error> {
    let cfg_manager = ConfigManager::new(cfg_path);

    PipelineBuilder::new()
        .with_blocking(Box::new(ConfigLoadTask::new(cfg_manager)))
        .with_blocking(Box::new(ConfigureObservabilityTask))
        .with_async(Box::new(StartProfilerTask))
        .with_blocking(Box::new(DatasetLoadTask))
        .with_blocking(Box::new(SpanManagerTask))
        .with_async(Box::new(StartServerTask))
        .build()
        .ok_or_else(|| anyhow!("Startup pipeline should have tasks!"))
}
