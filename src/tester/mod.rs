//! Test stage
//!
//! Testers run after a successful build and turn program behaviour into a
//! score. Like builders they form a closed set selected by identifier.
//!
//! A tester returns `Err` only when it could not test at all (missing script,
//! broken reference solution). A submission that crashes, hangs or prints
//! the wrong answer is reported through `TestOutcome`.

mod io;
mod script;

use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::TestError;
use crate::models::Test;
use crate::sandbox::ExecLimits;
use crate::stager::StagedManifest;

pub use io::compare_output;

#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    /// Whether every program the tester ran completed normally
    pub ok: bool,
    pub retcode: i32,
    pub output: String,
    pub score: f64,
}

/// How the io tester turns matching inputs into a score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IoScoring {
    /// `maxscore * matched / total`
    #[default]
    Proportional,
    /// Full score only when every input matches
    AllOrNothing,
}

impl IoScoring {
    pub fn score(&self, maxscore: f64, matched: usize, total: usize) -> f64 {
        if total == 0 {
            return 0.0;
        }
        match self {
            IoScoring::Proportional => maxscore * matched as f64 / total as f64,
            IoScoring::AllOrNothing if matched == total => maxscore,
            IoScoring::AllOrNothing => 0.0,
        }
    }
}

pub struct TestContext<'a> {
    pub test: &'a Test,
    pub manifest: &'a StagedManifest,
    /// Applied to every program the tester runs, grader and submission alike
    pub limits: &'a ExecLimits,
    pub scoring: IoScoring,
    pub cancel: CancellationToken,
}

impl TestContext<'_> {
    pub fn workdir(&self) -> &Path {
        self.manifest.root()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TesterKind {
    Script,
    Io,
}

impl TesterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TesterKind::Script => "script",
            TesterKind::Io => "io",
        }
    }

    pub async fn test(
        &self,
        ctx: &TestContext<'_>,
        submission_entry: Option<&Path>,
    ) -> Result<TestOutcome, TestError> {
        match self {
            TesterKind::Script => script::test(ctx, submission_entry).await,
            TesterKind::Io => io::test(ctx, submission_entry).await,
        }
    }
}

impl FromStr for TesterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "script" => Ok(TesterKind::Script),
            "io" => Ok(TesterKind::Io),
            other => Err(format!("Unknown tester '{}'", other)),
        }
    }
}

impl fmt::Display for TesterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Staged files arrive as plain data; programs need the exec bit
fn make_executable(path: &Path) -> std::io::Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}
