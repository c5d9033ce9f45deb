use crate::app::lifecycle::context::StartupContext;
use crate::core::dataset;
use crate::core::pipeline::BlockingTask;
use anyhow::{Error, anyhow};
use std::sync::Arc;
use tracing::{info, instrument};

pub struct DatasetLoadTask;

impl BlockingTask<StartupContext, Error> for DatasetLoadTask {
    #[instrument(skip_all, name = "dataset_load_task")]
    fn run(&self, ctx: &StartupContext) -> Result<(), Error> {
        let path = &ctx
            .config
            .get()
            .ok_or_else(|| anyhow!("Config not loaded before dataset"))?
            .dataset
            .path;

        let movies = dataset::load(path)?;
        info!(count = movies.len(), path = %path.display(), "Loaded movies");

        ctx.movies
            .set(Arc::new(movies))
            .map_err(|_| anyhow!("Movies already loaded"))
    }
}
