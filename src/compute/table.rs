//! Columnar integer table served from a built-in sample, a local file or an HTTP endpoint.
//!
//! Payloads are Arrow IPC streams (the data endpoint answers with
//! `application/octet-stream`) or, for hand-written tables, JSON of the form
//! `{"columns":[{"name":"a","values":[1,2]}]}`.

use super::{AggregateMethod, AggregateTask, ComputeError, ComputeModule, Dataset, ModuleLoader};
use crate::model::{DataSource, RunConfig};
use arrow::array::{Array, Int32Array, Int64Array};
use arrow::ipc::reader::StreamReader;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const ACCEPT_TABLE: &str = "application/octet-stream, application/json;q=0.9";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableFormat {
    ArrowIpc,
    Json,
}

impl TableFormat {
    fn from_content_type(content_type: Option<&str>) -> Self {
        match content_type {
            Some(ct) if ct.contains("json") => TableFormat::Json,
            _ => TableFormat::ArrowIpc,
        }
    }

    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => TableFormat::Json,
            _ => TableFormat::ArrowIpc,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TablePayload {
    columns: Vec<Column>,
}

#[derive(Debug, Clone, Deserialize)]
struct Column {
    name: String,
    values: Vec<i64>,
}

/// Validated row-aligned columns.
#[derive(Debug, Clone)]
struct Table {
    columns: Vec<Vec<i64>>,
    rows: usize,
}

impl Table {
    fn from_columns(columns: Vec<Column>) -> Result<Self, ComputeError> {
        let Some(first) = columns.first() else {
            return Err(ComputeError::Format("table has no columns".into()));
        };
        let rows = first.values.len();
        if let Some(bad) = columns.iter().find(|c| c.values.len() != rows) {
            return Err(ComputeError::Format(format!(
                "column {} has {} values, expected {}",
                bad.name,
                bad.values.len(),
                rows
            )));
        }
        Ok(Self {
            columns: columns.into_iter().map(|c| c.values).collect(),
            rows,
        })
    }

    fn from_batch(batch: &RecordBatch) -> Result<Self, ComputeError> {
        let schema = batch.schema();
        let mut columns = Vec::with_capacity(batch.num_columns());
        for (field, array) in schema.fields().iter().zip(batch.columns()) {
            if array.null_count() > 0 {
                return Err(ComputeError::Format(format!(
                    "column {} has null values",
                    field.name()
                )));
            }
            let values: Vec<i64> =
                if let Some(ints) = array.as_any().downcast_ref::<Int32Array>() {
                    ints.values().iter().map(|&v| i64::from(v)).collect()
                } else if let Some(ints) = array.as_any().downcast_ref::<Int64Array>() {
                    ints.values().to_vec()
                } else {
                    return Err(ComputeError::Format(format!(
                        "column {} is {}, expected Int32 or Int64",
                        field.name(),
                        array.data_type()
                    )));
                };
            columns.push(Column {
                name: field.name().clone(),
                values,
            });
        }
        Self::from_columns(columns)
    }

    fn builtin() -> Self {
        Self {
            columns: vec![vec![10, 20, 30], vec![30, 20, 10]],
            rows: 3,
        }
    }

    fn aggregate(&self, method: AggregateMethod) -> Result<i64, ComputeError> {
        let mut total: i64 = 0;
        for row in 0..self.rows {
            let cells = self.columns.iter().map(|c| c[row]);
            let picked = match method {
                AggregateMethod::MaxSum => cells.max(),
                AggregateMethod::MinSum => cells.min(),
            };
            // Columns are non-empty by construction.
            let picked = picked.unwrap_or_default();
            total = total.checked_add(picked).ok_or(ComputeError::Overflow)?;
        }
        Ok(total)
    }
}

fn decode(bytes: &[u8], format: TableFormat) -> Result<Table, ComputeError> {
    match format {
        TableFormat::ArrowIpc => decode_ipc(bytes),
        TableFormat::Json => decode_json(bytes),
    }
}

/// Only the first record batch of the stream is read.
fn decode_ipc(bytes: &[u8]) -> Result<Table, ComputeError> {
    let mut reader = StreamReader::try_new(bytes, None).map_err(ComputeError::RecordBatch)?;
    match reader.next() {
        Some(batch) => Table::from_batch(&batch.map_err(ComputeError::RecordBatch)?),
        None => Err(ComputeError::Format("stream has no record batch".into())),
    }
}

fn decode_json(bytes: &[u8]) -> Result<Table, ComputeError> {
    let payload: TablePayload = serde_json::from_slice(bytes).map_err(ComputeError::Decode)?;
    Table::from_columns(payload.columns)
}

/// Loads a [`TableModule`] for the configured data source.
#[derive(Debug, Clone)]
pub struct TableLoader {
    source: DataSource,
    fetch_timeout: Duration,
    user_agent: String,
}

impl TableLoader {
    pub fn new(cfg: &RunConfig) -> Self {
        Self {
            source: cfg.source.clone(),
            fetch_timeout: cfg.fetch_timeout,
            user_agent: cfg.user_agent.clone(),
        }
    }
}

#[async_trait]
impl ModuleLoader for TableLoader {
    type Module = TableModule;

    async fn load(&mut self) -> Result<TableModule, ComputeError> {
        if let DataSource::File(path) = &self.source {
            tokio::fs::metadata(path)
                .await
                .map_err(|e| ComputeError::Load(format!("{}: {e}", path.display())))?;
        }
        Ok(TableModule {
            source: self.source.clone(),
            fetch_timeout: self.fetch_timeout,
            user_agent: self.user_agent.clone(),
            http: None,
        })
    }
}

pub struct TableModule {
    source: DataSource,
    fetch_timeout: Duration,
    user_agent: String,
    http: Option<reqwest::Client>,
}

impl ComputeModule for TableModule {
    type Dataset = TableDataset;

    fn activate(&mut self) -> Result<(), ComputeError> {
        if matches!(self.source, DataSource::Url(_)) && self.http.is_none() {
            let client = reqwest::Client::builder()
                .user_agent(self.user_agent.clone())
                .timeout(self.fetch_timeout)
                .build()
                .map_err(|e| ComputeError::Activation(format!("build http client: {e}")))?;
            self.http = Some(client);
        }
        Ok(())
    }

    fn create_dataset(&self) -> Result<TableDataset, ComputeError> {
        let source = match &self.source {
            DataSource::Builtin => Source::Builtin,
            DataSource::File(path) => Source::File(path.clone()),
            DataSource::Url(url) => {
                let http = self
                    .http
                    .clone()
                    .ok_or_else(|| ComputeError::Activation("module was not activated".into()))?;
                let url = reqwest::Url::parse(url)
                    .map_err(|e| ComputeError::Format(format!("invalid url {url}: {e}")))?;
                Source::Http { http, url }
            }
        };
        Ok(TableDataset {
            source,
            table: None,
        })
    }
}

enum Source {
    Builtin,
    File(std::path::PathBuf),
    Http { http: reqwest::Client, url: reqwest::Url },
}

pub struct TableDataset {
    source: Source,
    table: Option<Table>,
}

impl TableDataset {
    fn table(&self) -> Result<&Table, ComputeError> {
        self.table.as_ref().ok_or(ComputeError::NotFetched)
    }
}

#[async_trait]
impl Dataset for TableDataset {
    async fn fetch(&mut self) -> Result<u64, ComputeError> {
        let table = match &self.source {
            Source::Builtin => Table::builtin(),
            Source::File(path) => {
                let bytes = tokio::fs::read(path).await.map_err(|source| ComputeError::Io {
                    path: path.clone(),
                    source,
                })?;
                decode(&bytes, TableFormat::from_path(path))?
            }
            Source::Http { http, url } => {
                let resp = http
                    .get(url.clone())
                    .header(reqwest::header::ACCEPT, ACCEPT_TABLE)
                    .send()
                    .await
                    .map_err(ComputeError::Request)?
                    .error_for_status()
                    .map_err(ComputeError::Request)?;
                let format = TableFormat::from_content_type(
                    resp.headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok()),
                );
                let bytes = resp.bytes().await.map_err(ComputeError::Request)?;
                decode(&bytes, format)?
            }
        };
        let rows = table.rows as u64;
        tracing::debug!(rows, columns = table.columns.len(), "table fetched");
        self.table = Some(table);
        Ok(rows)
    }

    async fn aggregate(&self, task: &AggregateTask) -> Result<i64, ComputeError> {
        self.table()?.aggregate(task.method)
    }

    fn aggregate_blocking(&self, task: &AggregateTask) -> Result<i64, ComputeError> {
        self.table()?.aggregate(task.method)
    }
}
