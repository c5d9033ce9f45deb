use crate::app::lifecycle::context::StartupContext;
use crate::core::observability;
use crate::core::pipeline::BlockingTask;
use anyhow::Error;
use tracing::{info, instrument};

pub struct ObservabilityShutdownTask;

impl BlockingTask<StartupContext, Error> for ObservabilityShutdownTask {
    #[instrument(skip_all, name = "observability_shutdown_task")]
    fn run(&self, context: &StartupContext) -> Result<(), Error> {
        if let Some(provider) = context.observability.get() {
            // flushes the batch exporter
            observability::shutdown(provider)?;

            info!("Shut down observability");
        }

        Ok(())
    }
}
