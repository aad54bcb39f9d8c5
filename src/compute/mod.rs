//! Capability interface the worker uses to reach the computational module.
//!
//! The worker only sees these traits; dataset layout and aggregation math live
//! behind them. `table` provides the implementation the binary ships with.

mod table;

pub use table::{TableDataset, TableLoader, TableModule};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("module load failed: {0}")]
    Load(String),
    #[error("module activation failed: {0}")]
    Activation(String),
    #[error("data was not received")]
    Request(#[source] reqwest::Error),
    #[error("cannot read data file {path}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot decode RecordBatch")]
    RecordBatch(#[source] arrow::error::ArrowError),
    #[error("cannot decode JSON table")]
    Decode(#[source] serde_json::Error),
    #[error("data has a wrong format: {0}")]
    Format(String),
    #[error("dataset has not been fetched yet")]
    NotFetched,
    #[error("aggregate overflowed")]
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateMethod {
    /// Take the largest value of each row, then sum the rows.
    MaxSum,
    /// Take the smallest value of each row, then sum the rows.
    MinSum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateTask {
    pub method: AggregateMethod,
}

impl AggregateTask {
    pub fn new(method: AggregateMethod) -> Self {
        Self { method }
    }
}

/// Produces the computational module inside the worker.
#[async_trait]
pub trait ModuleLoader: Send + 'static {
    type Module: ComputeModule;

    async fn load(&mut self) -> Result<Self::Module, ComputeError>;
}

pub trait ComputeModule: Send + 'static {
    type Dataset: Dataset;

    /// Module-specific setup that must run once before any dataset exists.
    fn activate(&mut self) -> Result<(), ComputeError>;

    fn create_dataset(&self) -> Result<Self::Dataset, ComputeError>;
}

#[async_trait]
pub trait Dataset: Send + Sync + 'static {
    /// Pull rows into the dataset and return how many were loaded.
    async fn fetch(&mut self) -> Result<u64, ComputeError>;

    async fn aggregate(&self, task: &AggregateTask) -> Result<i64, ComputeError>;

    fn aggregate_blocking(&self, task: &AggregateTask) -> Result<i64, ComputeError>;
}
