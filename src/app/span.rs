use crate::core::pipeline::{AsyncTask, Pipeline};
use anyhow::Error;
use async_trait::async_trait;
use std::time::Instant;
use tracing::{Instrument, Span, debug};

/// Runs a whole pipeline as one task under the span produced by
/// `span_provider`, so lifecycle stages nest under a single span
pub struct InstrumentedPipeline<T: Send + Sync> {
    pipeline: Pipeline<T, Error>,
    span_provider: Box<dyn Fn() -> Span + Send + Sync>,
}

impl<T: Send + Sync> InstrumentedPipeline<T> {
    pub fn new<F>(pipeline: Pipeline<T, Error>, span_provider: F) -> Self
    where
        F: Fn() -> Span + Sync + Send + 'static,
    {
        InstrumentedPipeline {
            pipeline,
            span_provider: Box::new(span_provider),
        }
    }
}

#[async_trait]
impl<T: Send + Sync> AsyncTask<T, Error> for InstrumentedPipeline<T> {
    async fn run(&self, context: &T) -> Result<(), Error> {
        let span = (self.span_provider)();
        let started = Instant::now();

        let result = self.pipeline.run(context).instrument(span).await;

        debug!(
            stages = self.pipeline.len(),
            elapsed = ?started.elapsed(),
            ok = result.is_ok(),
            "Instrumented pipeline finished"
        );

        result
    }
}
