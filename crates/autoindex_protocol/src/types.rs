//! Canonical domain types shared by the matcher, the scheduler and the executor.
//!
//! Enums follow one convention: `as_str()` gives the storage form, `Display`
//! prints it, and `FromStr` parses it back (case-insensitive).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::defaults::DEFAULT_INDEX_OUTFILE;

pub type RepositoryId = i64;
pub type PolicyId = i64;
pub type IndexId = i64;

// ============================================================================
// Configuration policies
// ============================================================================

/// Kind of git object a policy pattern selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitObjectType {
    /// A literal commit
    Commit,
    /// Tags matching a glob
    Tag,
    /// Branches matching a glob (`HEAD` selects the default branch)
    Tree,
}

impl GitObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GitObjectType::Commit => "commit",
            GitObjectType::Tag => "tag",
            GitObjectType::Tree => "tree",
        }
    }
}

impl fmt::Display for GitObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for GitObjectType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "commit" => Ok(GitObjectType::Commit),
            "tag" => Ok(GitObjectType::Tag),
            "tree" | "branch" => Ok(GitObjectType::Tree),
            _ => Err(format!("Invalid git object type: '{}'", s)),
        }
    }
}

/// Declarative rule selecting commits of repositories for retention and/or indexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationPolicy {
    pub id: PolicyId,
    pub name: String,
    /// System-owned policies cannot be edited or deleted by users.
    #[serde(default)]
    pub protected: bool,
    /// Single-repository scope. Mutually exclusive with `repository_patterns`.
    #[serde(default)]
    pub repository_id: Option<RepositoryId>,
    /// Repository-name glob scope. Mutually exclusive with `repository_id`.
    #[serde(default)]
    pub repository_patterns: Option<Vec<String>>,
    pub object_type: GitObjectType,
    pub pattern: String,

    #[serde(default)]
    pub retention_enabled: bool,
    #[serde(default)]
    pub retention_duration_hours: Option<i64>,
    #[serde(default)]
    pub retain_intermediate_commits: bool,

    #[serde(default)]
    pub indexing_enabled: bool,
    #[serde(default)]
    pub index_commit_max_age_hours: Option<i64>,
    #[serde(default)]
    pub index_intermediate_commits: bool,
}

/// Hours out of chrono's range clamp to the nearest bound; the matcher rejects
/// ages it cannot subtract.
fn saturating_hours(hours: i64) -> Duration {
    Duration::try_hours(hours).unwrap_or(if hours < 0 { Duration::MIN } else { Duration::MAX })
}

impl ConfigurationPolicy {
    /// Max age of retained uploads; `None` means no age limit.
    pub fn retention_max_age(&self) -> Option<Duration> {
        self.retention_duration_hours.map(saturating_hours)
    }

    /// Max age of a commit eligible for auto-indexing; `None` means no age limit.
    pub fn index_max_age(&self) -> Option<Duration> {
        self.index_commit_max_age_hours.map(saturating_hours)
    }

    /// A policy with neither scope field set applies to every repository.
    pub fn is_global(&self) -> bool {
        self.repository_id.is_none() && self.repository_patterns.is_none()
    }

    /// True when at least one facet is switched on.
    pub fn has_effect(&self) -> bool {
        self.retention_enabled || self.indexing_enabled
    }

    pub fn scope(&self) -> PolicyScope<'_> {
        match (&self.repository_id, &self.repository_patterns) {
            (Some(id), None) => PolicyScope::Repository(*id),
            (None, Some(patterns)) => PolicyScope::Patterns(patterns),
            (None, None) => PolicyScope::Global,
            (Some(_), Some(_)) => PolicyScope::Conflicting,
        }
    }
}

/// Resolved view of a policy's repository scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyScope<'a> {
    Repository(RepositoryId),
    Patterns(&'a [String]),
    Global,
    /// Both scope fields set; rejected at write time.
    Conflicting,
}

// ============================================================================
// Index jobs
// ============================================================================

/// A command run inside the sandbox before the indexer itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandStep {
    /// Directory relative to the repository root
    #[serde(default)]
    pub root: String,
    /// Image the step runs in; empty means the job's indexer image
    #[serde(default)]
    pub image: String,
    pub commands: Vec<String>,
}

/// Concrete description of one indexing job at a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexJobSpec {
    /// Indexer image or tool identifier
    pub indexer: String,
    #[serde(default)]
    pub steps: Vec<CommandStep>,
    #[serde(default)]
    pub indexer_args: Vec<String>,
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub outfile: String,
    #[serde(default)]
    pub local_steps: Vec<String>,
    #[serde(default)]
    pub requested_env_vars: Vec<String>,
}

impl IndexJobSpec {
    /// Flatten the job into the ordered list of steps the executor runs:
    /// pre-index steps, local steps, then the indexer invocation.
    pub fn execution_steps(&self) -> Vec<CommandStep> {
        let mut steps = self.steps.clone();
        if !self.local_steps.is_empty() {
            steps.push(CommandStep {
                root: self.root.clone(),
                image: String::new(),
                commands: self.local_steps.clone(),
            });
        }
        if !self.indexer_args.is_empty() {
            steps.push(CommandStep {
                root: self.root.clone(),
                image: self.indexer.clone(),
                commands: vec![self.indexer_args.join(" ")],
            });
        }
        steps
    }

    /// Workspace-relative path of the file the indexer writes. Jobs without
    /// an indexer invocation produce nothing.
    pub fn artifact_path(&self) -> Option<String> {
        if self.indexer_args.is_empty() {
            return None;
        }
        let outfile = self.outfile.trim().trim_start_matches('/');
        let outfile = if outfile.is_empty() {
            DEFAULT_INDEX_OUTFILE
        } else {
            outfile
        };
        let root = self.root.trim_matches('/');
        Some(if root.is_empty() {
            outfile.to_string()
        } else {
            format!("{}/{}", root, outfile)
        })
    }
}

/// The configuration document stored per repository or passed as an override.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfiguration {
    #[serde(default)]
    pub index_jobs: Vec<IndexJobSpec>,
}

impl IndexConfiguration {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// How strongly the inference engine believes in a hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintConfidence {
    LanguageSupport,
    ProjectStructureSupported,
    Speculative,
}

/// Lower-confidence suggestion that a repository could be indexed with a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexJobHint {
    pub indexer: String,
    #[serde(default)]
    pub root: String,
    pub confidence: HintConfidence,
}

// ============================================================================
// Index records
// ============================================================================

/// Lifecycle state of an index record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    #[default]
    Queued,
    Processing,
    Completed,
    Errored,
    Cancelled,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexState::Queued => "queued",
            IndexState::Processing => "processing",
            IndexState::Completed => "completed",
            IndexState::Errored => "errored",
            IndexState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IndexState::Completed | IndexState::Errored | IndexState::Cancelled
        )
    }
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IndexState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(IndexState::Queued),
            "processing" => Ok(IndexState::Processing),
            "completed" => Ok(IndexState::Completed),
            "errored" => Ok(IndexState::Errored),
            "cancelled" => Ok(IndexState::Cancelled),
            _ => Err(format!("Invalid index state: '{}'", s)),
        }
    }
}

/// Structured reason attached to failed or cancelled records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Sandbox provisioning, workspace fetch or other host-side trouble
    Infrastructure,
    /// A command step exited non-zero
    CommandFailed,
    /// The job exceeded its wall-clock budget
    Timeout,
    /// The claiming worker stopped heartbeating
    HeartbeatLost,
    Cancelled,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Infrastructure => "infrastructure",
            FailureCategory::CommandFailed => "command_failed",
            FailureCategory::Timeout => "timeout",
            FailureCategory::HeartbeatLost => "heartbeat_lost",
            FailureCategory::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FailureCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "infrastructure" => Ok(FailureCategory::Infrastructure),
            "command_failed" => Ok(FailureCategory::CommandFailed),
            "timeout" => Ok(FailureCategory::Timeout),
            "heartbeat_lost" => Ok(FailureCategory::HeartbeatLost),
            "cancelled" => Ok(FailureCategory::Cancelled),
            _ => Err(format!("Invalid failure category: '{}'", s)),
        }
    }
}

/// What caused an index record to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// Explicit "queue now" request
    Manual,
    /// Scheduled from a policy match
    Policy,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Policy => "policy",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual" => Ok(Trigger::Manual),
            "policy" => Ok(Trigger::Policy),
            _ => Err(format!("Invalid trigger: '{}'", s)),
        }
    }
}

/// Persisted indexing attempt for a repository at a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub id: IndexId,
    pub repository_id: RepositoryId,
    pub repository_name: String,
    pub commit: String,
    /// Coalescing key: source plus a hash of the job spec, or caller-supplied text
    pub configuration: String,
    pub job: IndexJobSpec,
    pub trigger: Trigger,
    pub policy_id: Option<PolicyId>,
    pub state: IndexState,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub retry_count: i32,
    pub failure_message: Option<String>,
    pub failure_category: Option<FailureCategory>,
    pub execution_log: Option<String>,
    pub cancel_requested: bool,
}

/// The last `max_bytes` of `text`, cut on a char boundary.
pub fn log_tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
