use async_trait::async_trait;
use std::fmt::Display;
use tracing::trace;

/// A synchronous stage of a ['Pipeline']
pub trait BlockingTask<T, E>: Send + Sync {
    fn run(&self, context: &T) -> Result<(), E>;
}

/// An async stage of a ['Pipeline']
#[async_trait]
pub trait AsyncTask<T: Send + Sync, E>: Send + Sync {
    async fn run(&self, context: &T) -> Result<(), E>;
}

enum Stage<T, E> {
    Blocking(Box<dyn BlockingTask<T, E>>),
    Async(Box<dyn AsyncTask<T, E>>),
}

/// Ordered list of tasks run against a shared context. The first
/// failing task aborts the run and its error is returned
pub struct Pipeline<T, E> {
    stages: Vec<Stage<T, E>>,
}

impl<T: Send + Sync, E: Display> Pipeline<T, E> {
    pub async fn run(&self, context: &T) -> Result<(), E> {
        for (idx, stage) in self.stages.iter().enumerate() {
            let result = match stage {
                Stage::Blocking(task) => task.run(context),
                Stage::Async(task) => task.run(context).await,
            };

            if let Err(e) = result {
                trace!(stage = idx, "Pipeline aborted: {}", e);
                return Err(e);
            }
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

pub struct PipelineBuilder<T, E> {
    stages: Vec<Stage<T, E>>,
}

impl<T: Send + Sync, E: Display> Default for PipelineBuilder<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync, E: Display> PipelineBuilder<T, E> {
    pub fn new() -> Self {
        PipelineBuilder { stages: Vec::new() }
    }

    pub fn with_blocking(mut self, task: Box<dyn BlockingTask<T, E>>) -> Self {
        self.stages.push(Stage::Blocking(task));
        self
    }

    pub fn with_async(mut self, task: Box<dyn AsyncTask<T, E>>) -> Self {
        self.stages.push(Stage::Async(task));
        self
    }

    /// None if no tasks were added
    pub fn build(self) -> Option<Pipeline<T, E>> {
        if self.stages.is_empty() {
            return None;
        }

        Some(Pipeline {
            stages: self.stages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Error, bail};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Trail {
        steps: Mutex<Vec<&'static str>>,
    }

    struct Push(&'static str);

    impl BlockingTask<Trail, Error> for Push {
        fn run(&self, context: &Trail) -> Result<(), Error> {
            context.steps.lock().push(self.0);
            Ok(())
        }
    }

    struct AsyncPush(&'static str);

    #[async_trait]
    impl AsyncTask<Trail, Error> for AsyncPush {
        async fn run(&self, context: &Trail) -> Result<(), Error> {
            tokio::task::yield_now().await;
            context.steps.lock().push(self.0);
            Ok(())
        }
    }

    struct Fail;

    impl BlockingTask<Trail, Error> for Fail {
        fn run(&self, _: &Trail) -> Result<(), Error> {
            bail!("stage failed")
        }
    }

    #[test]
    fn test_empty_builder_builds_nothing() {
        assert!(PipelineBuilder::<Trail, Error>::new().build().is_none());
    }

    #[tokio::test]
    async fn test_runs_in_order() {
        let pipeline = PipelineBuilder::new()
            .with_blocking(Box::new(Push("a")))
            .with_async(Box::new(AsyncPush("b")))
            .with_blocking(Box::new(Push("c")))
            .build()
            .unwrap();

        let trail = Trail::default();
        pipeline.run(&trail).await.unwrap();

        assert_eq!(pipeline.len(), 3);
        assert_eq!(*trail.steps.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_first_error_aborts() {
        let pipeline = PipelineBuilder::new()
            .with_blocking(Box::new(Push("a")))
            .with_blocking(Box::new(Fail))
            .with_async(Box::new(AsyncPush("never")))
            .build()
            .unwrap();

        let trail = Trail::default();
        let err = pipeline.run(&trail).await.unwrap_err();

        assert_eq!(err.to_string(), "stage failed");
        assert_eq!(*trail.steps.lock(), vec!["a"]);
    }
}
