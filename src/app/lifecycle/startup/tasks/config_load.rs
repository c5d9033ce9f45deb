use crate::app::lifecycle::context::StartupContext;
use crate::core::config_manager::ConfigManager;
use crate::core::pipeline::BlockingTask;
use anyhow::{Error, anyhow};

pub(crate) struct ConfigLoadTask {
    manager: ConfigManager,
}

impl ConfigLoadTask {
    pub fn new(manager: ConfigManager) -> Self {
        Self { manager }
    }
}

impl BlockingTask<StartupContext, Error> for ConfigLoadTask {
    fn run(&self, ctx: &StartupContext) -> Result<(), Error> {
        self.manager.start()?;

        // logging is not up yet
        println!("Config loaded from {}", self.manager.path().display());

        ctx.config
            .set(self.manager.snapshot()?)
            .map_err(|_| anyhow!("Config already loaded"))
    }
}
