//! Shared types for buildscope
//!
//! This crate contains the deployment and build log data structures used
//! across the buildscope crates.

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;

// ============================================================================
// Deployment Types
// ============================================================================

/// Lifecycle state of a deployment
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReadyState {
    Queued,
    Initializing,
    Building,
    Ready,
    Error,
    Canceled,
    Deleted,
    Unknown(String),
}

impl ReadyState {
    /// States after which no further build logs will be produced
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Ready | Self::Error | Self::Canceled | Self::Deleted
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Queued => "QUEUED",
            Self::Initializing => "INITIALIZING",
            Self::Building => "BUILDING",
            Self::Ready => "READY",
            Self::Error => "ERROR",
            Self::Canceled => "CANCELED",
            Self::Deleted => "DELETED",
            Self::Unknown(s) => s,
        }
    }
}

impl From<String> for ReadyState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "QUEUED" => Self::Queued,
            "INITIALIZING" => Self::Initializing,
            "BUILDING" => Self::Building,
            "READY" => Self::Ready,
            "ERROR" => Self::Error,
            "CANCELED" => Self::Canceled,
            "DELETED" => Self::Deleted,
            _ => Self::Unknown(s),
        }
    }
}

impl From<ReadyState> for String {
    fn from(state: ReadyState) -> Self {
        match state {
            ReadyState::Unknown(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for ReadyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deployment as reported by the status endpoint.
///
/// Only the fields the log pipeline observes are kept; anything else in the
/// payload is ignored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub ready_state: ReadyState,
    /// Creation time (epoch ms)
    pub created_at: i64,
    /// Build start time (epoch ms)
    #[serde(default)]
    pub building_at: Option<i64>,
    /// Time the deployment became ready (epoch ms)
    #[serde(default)]
    pub ready: Option<i64>,
}

impl Deployment {
    pub fn new(id: impl Into<String>, ready_state: ReadyState, created_at: i64) -> Self {
        Self {
            id: id.into(),
            url: None,
            name: None,
            ready_state,
            created_at,
            building_at: None,
            ready: None,
        }
    }

    /// Whether the deployment is done producing logs
    pub fn is_finished(&self) -> bool {
        self.ready_state.is_terminal()
    }

    /// Id and creation time; a change in either means a different deployment
    pub fn identity(&self) -> (&str, i64) {
        (&self.id, self.created_at)
    }
}

/// Convert an epoch-milliseconds timestamp into a UTC datetime
pub fn epoch_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

// ============================================================================
// Build Log Types
// ============================================================================

/// Named build phases announced by delimiter records
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BuildStep {
    Building,
    FetchingSourceCode,
    PopulatingBuildCache,
    PreparingBuildEnv,
    RestoringBuildCache,
    UploadingBuildOutputs,
    Other(String),
}

impl BuildStep {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Building => "BUILDING",
            Self::FetchingSourceCode => "FETCHING_SOURCE_CODE",
            Self::PopulatingBuildCache => "POPULATING_BUILD_CACHE",
            Self::PreparingBuildEnv => "PREPARING_BUILD_ENV",
            Self::RestoringBuildCache => "RESTORING_BUILD_CACHE",
            Self::UploadingBuildOutputs => "UPLOADING_BUILD_OUTPUTS",
            Self::Other(s) => s,
        }
    }

    /// Human readable label
    pub fn label(&self) -> &str {
        match self {
            Self::Building => "Building",
            Self::FetchingSourceCode => "Fetching source code",
            Self::PopulatingBuildCache => "Populating build cache",
            Self::PreparingBuildEnv => "Preparing build environment",
            Self::RestoringBuildCache => "Restoring build cache",
            Self::UploadingBuildOutputs => "Uploading build outputs",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for BuildStep {
    fn from(s: String) -> Self {
        match s.as_str() {
            "BUILDING" => Self::Building,
            "FETCHING_SOURCE_CODE" => Self::FetchingSourceCode,
            "POPULATING_BUILD_CACHE" => Self::PopulatingBuildCache,
            "PREPARING_BUILD_ENV" => Self::PreparingBuildEnv,
            "RESTORING_BUILD_CACHE" => Self::RestoringBuildCache,
            "UPLOADING_BUILD_OUTPUTS" => Self::UploadingBuildOutputs,
            _ => Self::Other(s),
        }
    }
}

impl From<BuildStep> for String {
    fn from(step: BuildStep) -> Self {
        match step {
            BuildStep::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

/// Severity assigned to a build log line
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Warning,
    Error,
}

impl LogLevel {
    /// Short display string (3 chars)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "WRN",
            Self::Error => "ERR",
        }
    }
}

/// Entrypoint metadata attached to output records
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildLogInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub entrypoint: Option<String>,
}

/// Build-step marker attached to delimiter records
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelimiterLogInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub step: Option<BuildStep>,
}

/// Payload of a log record, discriminated by its `type` field.
///
/// Output records always carry text; delimiters never do.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogBody {
    Stdout {
        #[serde(default)]
        text: String,
        #[serde(default, deserialize_with = "lenient")]
        info: Option<BuildLogInfo>,
    },
    Stderr {
        #[serde(default)]
        text: String,
        #[serde(default, deserialize_with = "lenient")]
        info: Option<BuildLogInfo>,
    },
    Delimiter {
        #[serde(default, deserialize_with = "lenient")]
        info: Option<DelimiterLogInfo>,
    },
    #[serde(other)]
    Other,
}

/// Metadata that fails to parse is dropped instead of the whole record
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

impl LogBody {
    /// Plain stdout body
    pub fn stdout(text: impl Into<String>) -> Self {
        Self::Stdout {
            text: text.into(),
            info: None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Stdout { text, .. } | Self::Stderr { text, .. } => Some(text),
            Self::Delimiter { .. } | Self::Other => None,
        }
    }

    pub fn is_delimiter(&self) -> bool {
        matches!(self, Self::Delimiter { .. })
    }
}

/// A record as received from the deployment events feed.
///
/// Records without `created` are keepalives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLogRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    /// Server-provided severity, only trusted when explicitly asked to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
    #[serde(flatten)]
    pub body: LogBody,
}

impl RawLogRecord {
    /// Create a stdout record with the given id and creation time
    pub fn stdout(id: impl Into<String>, created: i64, text: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            created: Some(created),
            date: None,
            deployment_id: None,
            serial: None,
            level: None,
            body: LogBody::stdout(text),
        }
    }
}

/// A classified build log line
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildLog {
    pub id: String,
    pub created: i64,
    pub date: Option<i64>,
    pub deployment_id: Option<String>,
    pub serial: Option<String>,
    pub level: Option<LogLevel>,
    #[serde(flatten)]
    pub body: LogBody,
}

/// Shared handle to a build log line
pub type ArcBuildLog = Arc<BuildLog>;

impl BuildLog {
    /// Original text including any ANSI escape codes
    pub fn text(&self) -> Option<&str> {
        self.body.text()
    }

    pub fn is_delimiter(&self) -> bool {
        self.body.is_delimiter()
    }

    /// Overwrite this line with the notice shown once the store hits its bound
    pub fn make_truncation_notice(&mut self, bound: usize) {
        let notice = format!(
            "Warning: You're seeing the last {} lines of logs. Any lines before that were automatically truncated.",
            group_thousands(bound)
        );
        self.level = Some(LogLevel::Warning);
        match &mut self.body {
            LogBody::Stdout { text, .. } | LogBody::Stderr { text, .. } => *text = notice,
            body => *body = LogBody::stdout(notice),
        }
    }
}

fn group_thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// A named build phase derived from the log sequence
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessedStep {
    pub name: BuildStep,
    /// Epoch ms
    pub started_at: i64,
    /// Epoch ms, `None` while the step is still running
    pub finished_at: Option<i64>,
    pub logs: Vec<ArcBuildLog>,
}

// ============================================================================
// Query Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Backward,
    #[default]
    Forward,
}

/// Query string for the deployment events endpoint
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogsQuery {
    pub builds: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    pub direction: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow: Option<u8>,
}

impl LogsQuery {
    /// Build-log query starting at `since`, following live output if asked
    pub fn for_deployment(since: Option<i64>, follow: bool) -> Self {
        Self {
            builds: 1,
            since,
            direction: Direction::Forward,
            follow: follow.then_some(1),
        }
    }

    pub fn is_follow(&self) -> bool {
        self.follow == Some(1)
    }
}
