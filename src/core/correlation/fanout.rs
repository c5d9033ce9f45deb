use crate::core::correlation::carrier::SpanId;
use crate::core::correlation::context::TaskContext;
use crate::core::correlation::labels::WithExecutionUnit;
use anyhow::Error;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

pub const TAG_SERVICE: &str = "service";
pub const TAG_BRANCH: &str = "branch";

type BranchFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;

/// One unit of work to run concurrently under its own span
pub struct Branch {
    operation_name: String,
    work: Box<dyn FnOnce(TaskContext) -> BranchFuture + Send>,
}

impl Branch {
    pub fn new<F, Fut>(operation_name: impl Into<String>, work: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        Branch {
            operation_name: operation_name.into(),
            work: Box::new(move |ctx| Box::pin(work(ctx))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BranchOutcome {
    /// Sequence name the branch ran as, e.g. `spanprof-2`
    pub name: String,
    pub operation_name: String,
    pub span_id: SpanId,
    pub result: Result<(), String>,
}

/// Result of a join. Branches listed in `outstanding` were still running
/// when the deadline passed, they keep running and close their own spans
#[derive(Debug, Default)]
pub struct JoinReport {
    pub scheduled: usize,
    pub finished: Vec<BranchOutcome>,
    pub outstanding: Vec<String>,
}

impl JoinReport {
    pub fn is_complete(&self) -> bool {
        self.outstanding.is_empty()
    }

    pub fn failures(&self) -> impl Iterator<Item = &BranchOutcome> {
        self.finished.iter().filter(|b| b.result.is_err())
    }
}

struct Scheduled {
    name: String,
    operation_name: String,
    span_id: SpanId,
}

/// Run `branches` concurrently under the span of `parent` and wait for
/// all of them, or until `deadline` passes.
///
/// Every branch gets a carrier derived here, before anything is spawned,
/// tagged with the next sequence name of the request, and a forked
/// execution unit, so siblings never share a span id or labels. A branch
/// opens its span on start and closes it when its work returns, failed
/// or not. Failures and panics stay inside their branch and never cancel
/// or delay siblings.
///
/// The parent span must stay open until this returns; on an incomplete
/// join it is up to the caller to mark it degraded.
pub async fn fan_out(
    parent: &TaskContext,
    branches: Vec<Branch>,
    deadline: Option<Duration>,
) -> JoinReport {
    let mut scheduled = Vec::with_capacity(branches.len());
    let mut pending = FuturesUnordered::new();

    for branch in branches {
        let sequence = parent.carrier().sequence();
        let seq = sequence.next();
        let name = sequence.name_of(seq);

        let carrier = parent.carrier().derive(
            &branch.operation_name,
            [
                (TAG_SERVICE.to_string(), name.clone()),
                (TAG_BRANCH.to_string(), seq.to_string()),
            ],
        );
        let span_id = carrier.span_id();

        let ctx = parent.fork(carrier.clone());
        let unit = ctx.unit().clone();
        let work = branch.work;

        let task = async move {
            let mut span = ctx.spans().open(ctx.unit(), carrier);
            let result = work(ctx).await;

            if let Err(e) = &result {
                span.record_error(format!("{:#}", e));
            }
            span.end();

            result
        }
        .with_unit(unit);

        let idx = scheduled.len();
        let handle = tokio::spawn(task);
        pending.push(async move { (idx, handle.await) });

        scheduled.push(Scheduled {
            name,
            operation_name: branch.operation_name,
            span_id,
        });
    }

    let mut report = JoinReport {
        scheduled: scheduled.len(),
        ..Default::default()
    };
    let mut done = vec![false; scheduled.len()];
    let deadline_at = deadline.map(|d| tokio::time::Instant::now() + d);

    loop {
        let next = match deadline_at {
            Some(at) => match tokio::time::timeout_at(at, pending.next()).await {
                Ok(next) => next,
                Err(_) => break,
            },
            None => pending.next().await,
        };

        let Some((idx, joined)) = next else {
            break;
        };

        done[idx] = true;
        let branch = &scheduled[idx];

        let result = match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(e) if e.is_panic() => Err("branch panicked".to_string()),
            Err(e) => Err(format!("branch did not complete: {}", e)),
        };

        match &result {
            Ok(()) => debug!(
                branch = %branch.name,
                operation = %branch.operation_name,
                "Fan-out branch done"
            ),
            Err(reason) => warn!(
                branch = %branch.name,
                operation = %branch.operation_name,
                "Fan-out branch failed: {}",
                reason
            ),
        }

        report.finished.push(BranchOutcome {
            name: branch.name.clone(),
            operation_name: branch.operation_name.clone(),
            span_id: branch.span_id,
            result,
        });
    }

    report.outstanding = scheduled
        .iter()
        .zip(&done)
        .filter(|(_, done)| !**done)
        .map(|(branch, _)| branch.name.clone())
        .collect();

    if !report.is_complete() {
        warn!(
            outstanding = ?report.outstanding,
            "Fan-out join deadline passed with branches still running"
        );
    }

    report
}
