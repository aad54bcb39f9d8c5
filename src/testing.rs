//! Scripted compute module used by worker and controller tests.

use crate::compute::{
    AggregateMethod, AggregateTask, ComputeError, ComputeModule, Dataset, ModuleLoader,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) struct Script {
    pub load: Result<(), String>,
    pub activate: Result<(), String>,
    pub rows: Result<u64, String>,
    pub max_sum: Result<i64, String>,
    pub min_sum: Result<i64, String>,
    pub fetch_delay: Duration,
    pub panic_on_fetch: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            load: Ok(()),
            activate: Ok(()),
            rows: Ok(250),
            max_sum: Ok(1000),
            min_sum: Ok(500),
            fetch_delay: Duration::ZERO,
            panic_on_fetch: false,
        }
    }
}

/// Counters shared between a test and the worker it spawned.
#[derive(Debug, Default)]
pub(crate) struct Tally {
    pub loads: AtomicUsize,
    pub datasets: AtomicUsize,
    pub dropped: AtomicUsize,
}

impl Tally {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn datasets(&self) -> usize {
        self.datasets.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }
}

pub(crate) struct ScriptedLoader {
    script: Script,
    tally: Arc<Tally>,
}

impl ScriptedLoader {
    pub fn new(script: Script) -> (Self, Arc<Tally>) {
        let tally = Arc::new(Tally::default());
        (
            Self {
                script,
                tally: tally.clone(),
            },
            tally,
        )
    }
}

#[async_trait]
impl ModuleLoader for ScriptedLoader {
    type Module = ScriptedModule;

    async fn load(&mut self) -> Result<ScriptedModule, ComputeError> {
        self.tally.loads.fetch_add(1, Ordering::SeqCst);
        self.script.load.clone().map_err(ComputeError::Load)?;
        Ok(ScriptedModule {
            script: self.script.clone(),
            tally: self.tally.clone(),
        })
    }
}

pub(crate) struct ScriptedModule {
    script: Script,
    tally: Arc<Tally>,
}

impl Drop for ScriptedModule {
    fn drop(&mut self) {
        self.tally.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

impl ComputeModule for ScriptedModule {
    type Dataset = ScriptedDataset;

    fn activate(&mut self) -> Result<(), ComputeError> {
        self.script.activate.clone().map_err(ComputeError::Activation)
    }

    fn create_dataset(&self) -> Result<ScriptedDataset, ComputeError> {
        self.tally.datasets.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedDataset {
            script: self.script.clone(),
        })
    }
}

pub(crate) struct ScriptedDataset {
    script: Script,
}

impl ScriptedDataset {
    fn pick(&self, task: &AggregateTask) -> Result<i64, ComputeError> {
        let r = match task.method {
            AggregateMethod::MaxSum => &self.script.max_sum,
            AggregateMethod::MinSum => &self.script.min_sum,
        };
        r.clone().map_err(ComputeError::Format)
    }
}

#[async_trait]
impl Dataset for ScriptedDataset {
    async fn fetch(&mut self) -> Result<u64, ComputeError> {
        if self.script.panic_on_fetch {
            panic!("scripted fetch panic");
        }
        if !self.script.fetch_delay.is_zero() {
            tokio::time::sleep(self.script.fetch_delay).await;
        }
        self.script.rows.clone().map_err(ComputeError::Format)
    }

    async fn aggregate(&self, task: &AggregateTask) -> Result<i64, ComputeError> {
        self.pick(task)
    }

    fn aggregate_blocking(&self, task: &AggregateTask) -> Result<i64, ComputeError> {
        self.pick(task)
    }
}
