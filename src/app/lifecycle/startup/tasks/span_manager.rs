use crate::app::lifecycle::context::StartupContext;
use crate::core::correlation::carrier::TraceSettings;
use crate::core::correlation::labels::{LabelBinder, NoopBinder};
use crate::core::correlation::span::SpanManager;
use crate::core::observability::export::OtelSpanSink;
use crate::core::pipeline::BlockingTask;
use crate::core::profiling::binder::SamplerBinder;
use anyhow::{Error, anyhow};
use std::sync::Arc;
use tracing::{info, warn};

/// Builds the span manager, binding labels for the profiler only if one
/// actually started. Must run after observability so the otel sink picks
/// up the configured tracer provider
pub struct SpanManagerTask;

impl BlockingTask<StartupContext, Error> for SpanManagerTask {
    fn run(&self, ctx: &StartupContext) -> Result<(), Error> {
        let config = ctx
            .config
            .get()
            .ok_or_else(|| anyhow!("Config not loaded before span manager"))?;

        let binder: Arc<dyn LabelBinder> = if ctx.profiler.load().is_some() {
            Arc::new(SamplerBinder::new())
        } else {
            if config.profiler.enabled {
                warn!("No profiler running, span labels will not be bound");
            }
            Arc::new(NoopBinder)
        };

        let settings = TraceSettings {
            service_prefix: config.workload.service_prefix.clone(),
            sample_rate: config.logging.span_sample_rate,
        };

        let spans = SpanManager::new(binder, Arc::new(OtelSpanSink::new()), settings);
        info!(binder = spans.binder_name(), "Span manager ready");

        ctx.spans
            .set(Arc::new(spans))
            .map_err(|_| anyhow!("Span manager already built"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::SpanprofConfig;

    #[test]
    fn test_noop_binder_without_profiler() {
        let ctx = StartupContext::default();
        assert!(SpanManagerTask.run(&ctx).is_err());

        let mut config = SpanprofConfig::default();
        config.workload.service_prefix = "demo".to_string();
        config.logging.span_sample_rate = 0.5;
        ctx.config.set(config).unwrap();

        SpanManagerTask.run(&ctx).unwrap();

        let spans = ctx.spans.get().unwrap();
        assert_eq!(spans.binder_name(), "noop");
        assert_eq!(spans.settings().service_prefix, "demo");
        assert_eq!(spans.settings().sample_rate, 0.5);

        assert!(SpanManagerTask.run(&ctx).is_err());
    }
}
