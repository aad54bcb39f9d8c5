//! Background executor.
//!
//! Runs one stage per request against the compute module it owns and answers
//! every request with exactly one [`StageResult`]. The module and dataset are
//! created on the first `init` request and live as long as the executor.

use crate::compute::{
    AggregateMethod, AggregateTask, ComputeError, ComputeModule, Dataset, ModuleLoader,
};
use crate::model::{Stage, StageRequest, StageResult, StageValue};
use tokio::sync::mpsc;

pub const UNKNOWN_COMMAND: &str = "Unknown command";

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("{0:?} requested before the module was initialized")]
    NotInitialized(Stage),
    #[error("executor is unusable after a failed initialization: {0}")]
    Unusable(String),
    #[error(transparent)]
    Compute(#[from] ComputeError),
}

/// Module and dataset, built together on `init`.
struct ExecutorContext<M: ComputeModule> {
    // Owned for the executor's lifetime; stages only touch the dataset.
    #[allow(dead_code)]
    module: M,
    dataset: M::Dataset,
}

enum ExecutorState<M: ComputeModule> {
    Unloaded,
    Ready(ExecutorContext<M>),
    Poisoned(String),
}

pub struct Executor<L: ModuleLoader> {
    loader: L,
    state: ExecutorState<L::Module>,
}

impl<L: ModuleLoader> Executor<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            state: ExecutorState::Unloaded,
        }
    }

    /// Run a single request and produce its result.
    pub async fn handle(&mut self, request: StageRequest) -> StageResult {
        let stage = match request {
            StageRequest::Run(stage) => stage,
            StageRequest::Unrecognized(tag) => {
                tracing::warn!(%tag, "unknown worker command");
                return StageResult::failure(StageRequest::Unrecognized(tag), UNKNOWN_COMMAND);
            }
        };

        match self.run_stage(stage).await {
            Ok(value) => StageResult::success(stage, value),
            Err(e) => {
                let description = format!("{:#}", anyhow::Error::new(e));
                tracing::warn!(stage = stage.tag(), error = %description, "stage failed");
                StageResult::failure(stage, description)
            }
        }
    }

    /// Serve requests until the request channel closes or nobody listens for results.
    pub async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<StageRequest>,
        results: mpsc::UnboundedSender<StageResult>,
    ) {
        while let Some(request) = requests.recv().await {
            let result = self.handle(request).await;
            if results.send(result).is_err() {
                break;
            }
        }
        tracing::debug!("worker loop finished");
    }

    async fn run_stage(&mut self, stage: Stage) -> Result<Option<StageValue>, ExecutorError> {
        let value = match stage {
            Stage::Initialize => {
                self.initialize().await?;
                return Ok(None);
            }
            Stage::Fetch => StageValue::Rows(self.context(stage)?.dataset.fetch().await?),
            Stage::AggregatePrimary => {
                let task = AggregateTask::new(AggregateMethod::MaxSum);
                StageValue::Aggregate(self.context(stage)?.dataset.aggregate(&task).await?)
            }
            Stage::AggregateSecondary => {
                // Synchronous on the module side; still answered through the channel.
                let task = AggregateTask::new(AggregateMethod::MinSum);
                StageValue::Aggregate(self.context(stage)?.dataset.aggregate_blocking(&task)?)
            }
        };
        Ok(Some(value))
    }

    fn context(&mut self, stage: Stage) -> Result<&mut ExecutorContext<L::Module>, ExecutorError> {
        match &mut self.state {
            ExecutorState::Ready(ctx) => Ok(ctx),
            ExecutorState::Unloaded => Err(ExecutorError::NotInitialized(stage)),
            ExecutorState::Poisoned(cause) => Err(ExecutorError::Unusable(cause.clone())),
        }
    }

    async fn initialize(&mut self) -> Result<(), ExecutorError> {
        match &self.state {
            ExecutorState::Ready(_) => {
                tracing::debug!("module already loaded");
                return Ok(());
            }
            ExecutorState::Poisoned(cause) => return Err(ExecutorError::Unusable(cause.clone())),
            ExecutorState::Unloaded => {}
        }

        match self.load_context().await {
            Ok(ctx) => {
                tracing::info!("compute module loaded");
                self.state = ExecutorState::Ready(ctx);
                Ok(())
            }
            Err(e) => {
                self.state = ExecutorState::Poisoned(e.to_string());
                Err(e.into())
            }
        }
    }

    async fn load_context(&mut self) -> Result<ExecutorContext<L::Module>, ComputeError> {
        let mut module = self.loader.load().await?;
        module.activate()?;
        let dataset = module.create_dataset()?;
        Ok(ExecutorContext { module, dataset })
    }
}

/// Controller-side endpoint of a spawned executor.
pub struct WorkerHandle {
    requests: mpsc::UnboundedSender<StageRequest>,
    results: mpsc::UnboundedReceiver<StageResult>,
    task: Option<tokio::task::JoinHandle<()>>,
}

/// Spawn an executor on its own task.
pub fn spawn<L: ModuleLoader>(loader: L) -> WorkerHandle {
    let (req_tx, req_rx) = mpsc::unbounded_channel::<StageRequest>();
    let (res_tx, res_rx) = mpsc::unbounded_channel::<StageResult>();
    let executor = Executor::new(loader);
    let task = tokio::spawn(executor.run(req_rx, res_tx));
    WorkerHandle {
        requests: req_tx,
        results: res_rx,
        task: Some(task),
    }
}

impl WorkerHandle {
    /// Returns false if the worker is gone.
    pub fn send(&self, request: StageRequest) -> bool {
        self.requests.send(request).is_ok()
    }

    pub async fn recv(&mut self) -> Option<StageResult> {
        self.results.recv().await
    }

    /// Stop the worker without waiting for outstanding results.
    ///
    /// Consumes the handle, so a worker is terminated at most once. Returns
    /// after the worker task (and the module it owns) has been dropped, and
    /// reports false if that task had panicked.
    pub async fn terminate(mut self) -> bool {
        self.results.close();
        let mut clean = true;
        if let Some(task) = self.task.take() {
            task.abort();
            match task.await {
                Err(e) if e.is_panic() => {
                    tracing::error!(error = %e, "worker panicked");
                    clean = false;
                }
                _ => {}
            }
        }
        tracing::debug!(clean, "worker terminated");
        clean
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
