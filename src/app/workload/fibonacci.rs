use crate::core::correlation::context::TaskContext;
use anyhow::{Context, Error};
use tracing::info;

pub const OP_FIBONACCI: &str = "fibonacci";
pub const OP_FIBONACCI_WITH_TRACE: &str = "fibonacci_with_trace";

/// Naive recursive fibonacci. Every value divisible by 31 or 37 is
/// computed under its own child span so the profile shows a few
/// distinct span ids inside one branch
pub fn fibonacci(ctx: &TaskContext, n: u32) -> u64 {
    if n <= 2 {
        return 1;
    }

    if n % 31 == 0 || n % 37 == 0 {
        return fibonacci_with_trace(ctx, n - 1) + fibonacci_with_trace(ctx, n - 2);
    }

    fibonacci(ctx, n - 1) + fibonacci(ctx, n - 2)
}

fn fibonacci_with_trace(ctx: &TaskContext, n: u32) -> u64 {
    if n <= 2 {
        return 1;
    }

    let (mut span, ctx) = ctx.child_span(OP_FIBONACCI_WITH_TRACE, Vec::new());
    let value = fibonacci(&ctx, n - 1) + fibonacci(&ctx, n - 2);
    span.end();

    value
}

/// Run on the blocking pool with the branch unit entered, so the cpu
/// samples of that thread carry the branch labels
pub async fn run(ctx: TaskContext, n: u32) -> Result<u64, Error> {
    let value = tokio::task::spawn_blocking(move || {
        let _entered = ctx.unit().enter();
        fibonacci(&ctx, n)
    })
    .await
    .context("fibonacci worker did not finish")?;

    info!(n, value, "fibonacci({}) = {}", n, value);

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::correlation::carrier::Carrier;
    use crate::core::correlation::labels::ExecutionUnit;
    use crate::core::correlation::span::testing::{MemorySink, manager};
    use crate::core::profiling::binder::SamplerBinder;
    use std::sync::Arc;

    fn context() -> (TaskContext, Arc<MemorySink>) {
        let (spans, sink) = manager(Arc::new(SamplerBinder::new()));
        let carrier = Carrier::root(OP_FIBONACCI, Vec::new(), spans.settings());

        (TaskContext::new(spans, ExecutionUnit::new(), carrier), sink)
    }

    #[test]
    fn test_values() {
        let (ctx, sink) = context();

        assert_eq!(fibonacci(&ctx, 1), 1);
        assert_eq!(fibonacci(&ctx, 2), 1);
        assert_eq!(fibonacci(&ctx, 10), 55);
        assert_eq!(fibonacci(&ctx, 30), 832_040);
        assert!(sink.records().is_empty());
    }

    #[test]
    fn test_traced_values_open_child_spans() {
        let (ctx, sink) = context();

        // fib(32) recurses into n = 31 once, which traces 30 and 29
        assert_eq!(fibonacci(&ctx, 32), 2_178_309);

        let traced = sink.find(OP_FIBONACCI_WITH_TRACE);
        assert_eq!(traced.len(), 2);
        assert!(traced
            .iter()
            .all(|r| r.parent_span_id() == Some(ctx.carrier().span_id())));
        assert!(ctx.unit().labels().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_on_blocking_pool() {
        let (ctx, sink) = context();

        assert_eq!(run(ctx, 31).await.unwrap(), 1_346_269);
        assert_eq!(sink.find(OP_FIBONACCI_WITH_TRACE).len(), 2);
    }
}
