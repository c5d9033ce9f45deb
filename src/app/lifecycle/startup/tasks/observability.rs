use crate::app::lifecycle::context::StartupContext;
use crate::core::observability;
use crate::core::pipeline::BlockingTask;
use anyhow::{Error, anyhow};
use tracing::info;

pub struct ConfigureObservabilityTask;

impl BlockingTask<StartupContext, Error> for ConfigureObservabilityTask {
    fn run(&self, context: &StartupContext) -> Result<(), Error> {
        let config = context
            .config
            .get()
            .ok_or_else(|| anyhow!("Config not loaded before observability initialization"))?;

        // a provider is returned if otel export is configured
        // but observability may still have valid logging etc
        if let Some(provider) = observability::init(&config.logging)? {
            context
                .observability
                .set(provider)
                .map_err(|_| anyhow!("Observability context already initialized"))?
        }

        info!(
            version = env!("CARGO_PKG_VERSION"),
            otlp = context.observability.get().is_some(),
            "Observability configured"
        );

        Ok(())
    }
}
