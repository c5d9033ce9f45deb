use crate::app::lifecycle::context::StartupContext;
use crate::core::pipeline::AsyncTask;
use anyhow::Error;
use async_trait::async_trait;
use tracing::{info, instrument};

pub(crate) struct StopServerTask;

#[async_trait]
impl AsyncTask<StartupContext, Error> for StopServerTask {
    #[instrument(skip_all, name = "server_shutdown_task")]
    async fn run(&self, context: &StartupContext) -> Result<(), Error> {
        match context.server.get() {
            Some(server) => {
                info!("Closing listener gracefully..");
                server.stop(true).await;
                info!("Listener closed");
            }
            None => {
                info!("Skipping listener shutdown, was never started");
            }
        }

        Ok(())
    }
}
