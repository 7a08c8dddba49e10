//! Records consumed and produced by the run engine
//!
//! Tests, submissions and files are owned by the storage collaborator; the engine
//! only reads them. A `Run` is the single record the engine writes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Retcode stored when no process ran for the deciding stage
pub const NO_PROCESS_RETCODE: i32 = -1;

/// Deserialize an optional string, treating `""` as absent
fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

fn default_true() -> bool {
    true
}

/// Role a file plays inside a test
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FileRole {
    Script,
    Solution,
    Input,
    Generic,
    /// Files attached to a submission rather than a test
    Submission,
}

impl FileRole {
    /// Key a file must carry to be found when its role has no configured path
    pub fn lookup_key(&self) -> &'static str {
        match self {
            FileRole::Script => "script",
            FileRole::Solution => "solution",
            FileRole::Input => "input",
            FileRole::Generic => "generic",
            FileRole::Submission => "submission",
        }
    }
}

/// How the script tester turns a finished grading script into a score
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    /// Last non-empty output line is the score
    #[default]
    Output,
    /// Exit code 0 earns full score, anything else zero
    Retcode,
}

/// A stored blob plus its placement metadata
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct File {
    pub id: String,
    /// Symbolic key; absent means the file is only placed by an explicit path
    #[serde(default, deserialize_with = "empty_as_none")]
    pub key: Option<String>,
    /// Destination filename
    pub name: String,
    /// Storage location (local path or `s3://key`)
    pub path: String,
    #[serde(default)]
    pub owner: String,
}

impl File {
    pub fn is_archive(&self) -> bool {
        self.name.to_ascii_lowercase().ends_with(".zip")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TestFile {
    pub file: String,
    pub role: FileRole,
}

/// Grading specification owned by an assignment
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Test {
    pub id: String,
    pub assignment: String,
    pub name: String,
    pub maxscore: f64,
    pub builder: String,
    pub tester: String,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub path_script: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub path_solution: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub prefix_input: Option<String>,
    #[serde(default)]
    pub files: Vec<TestFile>,
    /// Name of a registered reporter notified after each run
    #[serde(default, deserialize_with = "empty_as_none")]
    pub reporter: Option<String>,
    #[serde(default)]
    pub allow_extra_credit: bool,
    #[serde(default)]
    pub score_source: ScoreSource,
    #[serde(default = "default_true")]
    pub require_solution: bool,
    #[serde(default)]
    pub owner: String,
}

impl Test {
    /// Configured destination path for a role, if any
    pub fn role_path(&self, role: FileRole) -> Option<&str> {
        match role {
            FileRole::Script => self.path_script.as_deref(),
            FileRole::Solution => self.path_solution.as_deref(),
            _ => None,
        }
    }

    /// Clamp a raw score into the range this test allows
    pub fn bound_score(&self, score: f64) -> f64 {
        if !score.is_finite() || score < 0.0 {
            return 0.0;
        }
        if self.allow_extra_credit {
            score
        } else {
            score.min(self.maxscore)
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Submission {
    pub id: String,
    pub assignment: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub owner: String,
}

/// Run status taxonomy; terminal strings are part of the external contract
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "complete-error")]
    CompleteError,
    #[serde(rename = "complete-error-builder_build")]
    CompleteErrorBuilderBuild,
    #[serde(rename = "complete-exception-run")]
    CompleteExceptionRun,
    #[serde(rename = "complete-exception-builder")]
    CompleteExceptionBuilder,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Complete => "complete",
            RunStatus::CompleteError => "complete-error",
            RunStatus::CompleteErrorBuilderBuild => "complete-error-builder_build",
            RunStatus::CompleteExceptionRun => "complete-exception-run",
            RunStatus::CompleteExceptionBuilder => "complete-exception-builder",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    /// Statuses in which the tester ran and the score is meaningful
    pub fn carries_score(&self) -> bool {
        matches!(self, RunStatus::Complete | RunStatus::CompleteError)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Request to execute one test against one submission
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RunRequest {
    /// Caller-chosen run id, so the caller can look the run up later
    #[serde(default)]
    pub id: Option<Uuid>,
    pub test: String,
    pub submission: String,
    #[serde(default)]
    pub owner: String,
}

/// Terminal fields produced by the engine
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub retcode: i32,
    pub output: String,
    pub score: f64,
}

impl RunOutcome {
    pub fn new(status: RunStatus, retcode: i32, output: impl Into<String>, score: f64) -> Self {
        Self {
            status,
            retcode,
            output: output.into(),
            score,
        }
    }

    /// Orchestration failure: no score, no process result
    pub fn exception(status: RunStatus, message: impl Into<String>) -> Self {
        Self::new(status, NO_PROCESS_RETCODE, message, 0.0)
    }
}

/// One execution of a (test, submission) pair
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Run {
    pub id: Uuid,
    pub test: String,
    pub submission: String,
    pub owner: String,
    pub status: RunStatus,
    pub retcode: i32,
    pub output: String,
    pub score: f64,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(request: &RunRequest) -> Self {
        Self {
            id: request.id.unwrap_or_else(Uuid::new_v4),
            test: request.test.clone(),
            submission: request.submission.clone(),
            owner: request.owner.clone(),
            status: RunStatus::Pending,
            retcode: NO_PROCESS_RETCODE,
            output: String::new(),
            score: 0.0,
            created: Utc::now(),
            completed: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move `pending -> running`; returns false if the run already left `pending`
    pub fn start(&mut self) -> bool {
        if self.status != RunStatus::Pending {
            return false;
        }
        self.status = RunStatus::Running;
        true
    }

    /// Record the terminal outcome. A terminal run is never changed again.
    pub fn finish(&mut self, outcome: RunOutcome, output_limit: usize) -> bool {
        if self.is_complete() || !outcome.status.is_terminal() {
            return false;
        }
        self.status = outcome.status;
        self.retcode = outcome.retcode;
        self.output = truncate_output(outcome.output, output_limit);
        self.score = if outcome.status.carries_score() {
            outcome.score
        } else {
            0.0
        };
        self.completed = Some(Utc::now());
        true
    }
}

/// Cut `output` to at most `limit` bytes on a char boundary
pub fn truncate_output(mut output: String, limit: usize) -> String {
    if output.len() <= limit {
        return output;
    }
    let mut cut = limit;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    output.truncate(cut);
    output.push_str("\n[output truncated]");
    output
}
