use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

/// Opaque identifier handed out by the registry when a job is registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Principal identity as supplied by the session provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory-safe form of the id, e.g. `alice_example_com-<16 hex>`.
    ///
    /// The readable part folds `@`, `.` and anything else outside
    /// `[A-Za-z0-9_-]` to `_`, which alone would let `a.b@x.io` and
    /// `a_b@x.io` share a directory. The suffix is taken from a name-based
    /// (v5) uuid of the exact id, so distinct owners get distinct scopes and
    /// the mapping is stable across restarts.
    pub fn scope_name(&self) -> String {
        let readable: String = self
            .0
            .chars()
            .map(|c| match c {
                c if c.is_ascii_alphanumeric() || c == '-' || c == '_' => c,
                _ => '_',
            })
            .collect();
        let digest = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, self.0.as_bytes())
            .simple()
            .to_string();
        format!("{readable}-{}", &digest[..16])
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Scrape,
    AutoPost,
    Simulate,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Scrape, JobKind::AutoPost, JobKind::Simulate];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Scrape => "scrape",
            JobKind::AutoPost => "auto-post",
            JobKind::Simulate => "simulate",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownJobKind(pub String);

impl fmt::Display for UnknownJobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown job kind: {}", self.0)
    }
}

impl std::error::Error for UnknownJobKind {}

impl FromStr for JobKind {
    type Err = UnknownJobKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scrape" => Ok(JobKind::Scrape),
            "auto-post" | "auto_post" | "autopost" => Ok(JobKind::AutoPost),
            "simulate" => Ok(JobKind::Simulate),
            other => Err(UnknownJobKind(other.to_string())),
        }
    }
}

/// Listing row for a running job; never carries the owner or the process.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub kind: JobKind,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationResult {
    Terminated,
    NotFound,
    Forbidden,
}

/// How a job left the registry. Only ever reported in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    ExitedNormally,
    ExitedWithError { exit_code: Option<i32> },
    KilledByOwner,
    SweptStale,
}
