use crate::app::lifecycle::context::StartupContext;
use crate::core::pipeline::BlockingTask;
use crate::core::profiling::profiler::write_report_file;
use anyhow::Error;
use tracing::{info, instrument, warn};

/// Stops sampling and writes whatever the last window holds
pub struct ProfilerShutdownTask;

impl BlockingTask<StartupContext, Error> for ProfilerShutdownTask {
    #[instrument(skip_all, name = "profiler_shutdown_task")]
    fn run(&self, context: &StartupContext) -> Result<(), Error> {
        if let Some(reporter) = context.profile_reporter.lock().take() {
            reporter.abort();
        }

        let Some(profiler) = context.profiler.swap(None) else {
            return Ok(());
        };

        let output_dir = context
            .config
            .get()
            .and_then(|c| c.profiler.output_dir.clone());

        match (profiler.stop(), output_dir) {
            (Some(Ok(report)), Some(dir)) => {
                match write_report_file(&report, profiler.tags(), &dir, "profile-final")? {
                    Some(path) => info!(path = %path.display(), "Wrote final profile"),
                    None => info!("Final profile window had no samples"),
                }
            }
            (Some(Err(e)), _) => warn!("Failed building final profile: {:#}", e),
            _ => {}
        }

        info!("Profiler stopped");

        Ok(())
    }
}
