use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub source: DataSource,
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    pub zero_policy: ZeroResultPolicy,
    pub user_agent: String,
}

/// Where the table module pulls its rows from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSource {
    Builtin,
    File(std::path::PathBuf),
    Url(String),
}

impl FromStr for DataSource {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("builtin") {
            Ok(DataSource::Builtin)
        } else if s.starts_with("http://") || s.starts_with("https://") {
            Ok(DataSource::Url(s.to_string()))
        } else {
            Ok(DataSource::File(s.into()))
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::Builtin => f.write_str("builtin"),
            DataSource::File(p) => write!(f, "{}", p.display()),
            DataSource::Url(u) => f.write_str(u),
        }
    }
}

/// Whether a zero row count or zero aggregate counts as a successful stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZeroResultPolicy {
    #[default]
    Reject,
    Accept,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Initialize,
    Fetch,
    AggregatePrimary,
    AggregateSecondary,
}

impl Stage {
    /// Fixed execution order of the pipeline.
    pub const SEQUENCE: [Stage; 4] = [
        Stage::Initialize,
        Stage::Fetch,
        Stage::AggregatePrimary,
        Stage::AggregateSecondary,
    ];

    /// Tag used on the worker channel.
    pub fn tag(self) -> &'static str {
        match self {
            Stage::Initialize => "init",
            Stage::Fetch => "fetch",
            Stage::AggregatePrimary => "aggregate1",
            Stage::AggregateSecondary => "aggregate2",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Stage> {
        Stage::SEQUENCE.into_iter().find(|s| s.tag() == tag)
    }

    pub fn index(self) -> usize {
        match self {
            Stage::Initialize => 0,
            Stage::Fetch => 1,
            Stage::AggregatePrimary => 2,
            Stage::AggregateSecondary => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::Initialize => "Load module",
            Stage::Fetch => "Fetch data",
            Stage::AggregatePrimary => "Aggregate (max-sum)",
            Stage::AggregateSecondary => "Aggregate (min-sum)",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Request sent from the controller to the worker.
///
/// Travels as the bare tag string; tags that name no stage are kept verbatim
/// so the worker can echo them back in its failure result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StageRequest {
    Run(Stage),
    Unrecognized(String),
}

impl StageRequest {
    pub fn tag(&self) -> &str {
        match self {
            StageRequest::Run(stage) => stage.tag(),
            StageRequest::Unrecognized(tag) => tag,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            StageRequest::Run(stage) => Some(*stage),
            StageRequest::Unrecognized(_) => None,
        }
    }
}

impl From<Stage> for StageRequest {
    fn from(stage: Stage) -> Self {
        StageRequest::Run(stage)
    }
}

impl From<&str> for StageRequest {
    fn from(tag: &str) -> Self {
        match Stage::from_tag(tag) {
            Some(stage) => StageRequest::Run(stage),
            None => StageRequest::Unrecognized(tag.to_string()),
        }
    }
}

impl From<String> for StageRequest {
    fn from(tag: String) -> Self {
        match Stage::from_tag(&tag) {
            Some(stage) => StageRequest::Run(stage),
            None => StageRequest::Unrecognized(tag),
        }
    }
}

impl From<StageRequest> for String {
    fn from(req: StageRequest) -> Self {
        match req {
            StageRequest::Run(stage) => stage.tag().to_string(),
            StageRequest::Unrecognized(tag) => tag,
        }
    }
}

/// Value produced by a successful stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageValue {
    Rows(u64),
    Aggregate(i64),
}

impl StageValue {
    pub fn is_zero(self) -> bool {
        match self {
            StageValue::Rows(n) => n == 0,
            StageValue::Aggregate(v) => v == 0,
        }
    }
}

impl fmt::Display for StageValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageValue::Rows(n) => write!(f, "{n} rows"),
            StageValue::Aggregate(v) => write!(f, "{v}"),
        }
    }
}

/// Worker answer to exactly one [`StageRequest`].
///
/// On the wire this is `{ "op": tag, "res": value }` on success and
/// `{ "op": tag, "error": description }` on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireResult", try_from = "WireResult")]
pub struct StageResult {
    pub op: StageRequest,
    pub outcome: Result<Option<StageValue>, String>,
}

impl StageResult {
    pub fn success(op: impl Into<StageRequest>, value: Option<StageValue>) -> Self {
        Self {
            op: op.into(),
            outcome: Ok(value),
        }
    }

    pub fn failure(op: impl Into<StageRequest>, error: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            outcome: Err(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireResult {
    op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    res: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<StageResult> for WireResult {
    fn from(r: StageResult) -> Self {
        let op = String::from(r.op);
        match r.outcome {
            Ok(value) => WireResult {
                op,
                res: value.map(|v| match v {
                    StageValue::Rows(n) => serde_json::Value::from(n),
                    StageValue::Aggregate(a) => serde_json::Value::from(a),
                }),
                error: None,
            },
            Err(e) => WireResult {
                op,
                res: None,
                error: Some(e),
            },
        }
    }
}

impl TryFrom<WireResult> for StageResult {
    type Error = String;

    fn try_from(w: WireResult) -> Result<Self, Self::Error> {
        let op = StageRequest::from(w.op);
        if let Some(error) = w.error {
            return Ok(StageResult::failure(op, error));
        }
        let value = match (op.stage(), w.res) {
            (_, None) => None,
            (Some(Stage::Fetch), Some(v)) => Some(StageValue::Rows(
                v.as_u64()
                    .ok_or_else(|| format!("row count is not a non-negative integer: {v}"))?,
            )),
            (Some(Stage::AggregatePrimary | Stage::AggregateSecondary), Some(v)) => {
                Some(StageValue::Aggregate(
                    v.as_i64()
                        .ok_or_else(|| format!("aggregate is not an integer: {v}"))?,
                ))
            }
            (_, Some(v)) => return Err(format!("unexpected result value for {}: {v}", op.tag())),
        };
        Ok(StageResult::success(op, value))
    }
}

/// One line of the progress log shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    #[serde(default)]
    pub timestamp_utc: String,
    #[serde(default)]
    pub stage: Option<Stage>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<StageValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineOutcome {
    Completed,
    Failed { stage: Option<Stage> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    #[serde(default)]
    pub started_utc: String,
    pub source: String,
    pub outcome: PipelineOutcome,
    pub entries: Vec<ProgressEntry>,
}

impl PipelineReport {
    pub fn is_completed(&self) -> bool {
        self.outcome == PipelineOutcome::Completed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    StageStarted {
        stage: Stage,
    },
    Progress(ProgressEntry),
    Info(String),
    Finished {
        // Boxed so the progress variants stay small.
        report: Box<PipelineReport>,
    },
}

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}
