use crate::app::config::SpanprofConfig;
use anyhow::{Error, anyhow};
use parking_lot::{RwLock, RwLockReadGuard};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct ConfigManager {
    path: PathBuf,
    cfg: Arc<RwLock<SpanprofConfig>>,
    started: AtomicBool,
}

/// Loads the local cfg file and hands out read access to it
impl ConfigManager {
    fn reload(&self) -> Result<(), Error> {
        let cfg = SpanprofConfig::load(&self.path)?;
        *self.cfg.write() = cfg;

        Ok(())
    }

    pub fn new(cfg_path: PathBuf) -> ConfigManager {
        ConfigManager {
            path: cfg_path,
            cfg: Arc::new(RwLock::new(SpanprofConfig::default())),
            started: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Loads initial config
    pub fn start(&self) -> Result<(), Error> {
        self.reload()?;
        self.started.store(true, Ordering::Release);

        Ok(())
    }

    /// Get an immutable read for the current config
    pub fn get(&self) -> Result<RwLockReadGuard<'_, SpanprofConfig>, Error> {
        if !self.started.load(Ordering::Acquire) {
            return Err(anyhow!("ConfigManager not started yet but fetching config"));
        }

        Ok(self.cfg.read())
    }

    /// An owned copy of the current config
    pub fn snapshot(&self) -> Result<SpanprofConfig, Error> {
        Ok(self.get()?.clone())
    }
}
