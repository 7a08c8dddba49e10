//! Build stage
//!
//! Builders are selected by the identifier stored on the test. The set is
//! closed: an identifier that does not parse is rejected before anything runs.

mod make;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use tokio_util::sync::CancellationToken;

use crate::error::BuildError;
use crate::models::NO_PROCESS_RETCODE;
use crate::sandbox::ExecLimits;

/// Result of a build that ran (or was skipped)
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutcome {
    pub ok: bool,
    pub retcode: i32,
    pub output: String,
}

impl BuildOutcome {
    pub fn skipped() -> Self {
        Self {
            ok: true,
            retcode: NO_PROCESS_RETCODE,
            output: String::new(),
        }
    }
}

/// Everything a builder may touch
#[derive(Debug, Clone)]
pub struct BuildContext<'a> {
    pub workdir: &'a Path,
    pub limits: &'a ExecLimits,
    pub make_program: &'a str,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderKind {
    Null,
    Make,
}

impl BuilderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuilderKind::Null => "null",
            BuilderKind::Make => "make",
        }
    }

    pub async fn build(&self, ctx: &BuildContext<'_>) -> Result<BuildOutcome, BuildError> {
        match self {
            BuilderKind::Null => Ok(BuildOutcome::skipped()),
            BuilderKind::Make => make::build(ctx).await,
        }
    }
}

impl FromStr for BuilderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "null" => Ok(BuilderKind::Null),
            "make" => Ok(BuilderKind::Make),
            other => Err(format!("Unknown builder '{}'", other)),
        }
    }
}

impl fmt::Display for BuilderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_is_closed() {
        assert_eq!("null".parse::<BuilderKind>().unwrap(), BuilderKind::Null);
        assert_eq!("make".parse::<BuilderKind>().unwrap(), BuilderKind::Make);
        assert!("cmake".parse::<BuilderKind>().is_err());
        assert!("".parse::<BuilderKind>().is_err());
    }

    #[tokio::test]
    async fn test_null_builder_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let limits = ExecLimits::default();
        let ctx = BuildContext {
            workdir: dir.path(),
            limits: &limits,
            make_program: "/nonexistent/make",
            cancel: CancellationToken::new(),
        };
        let outcome = BuilderKind::Null.build(&ctx).await.unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.retcode, NO_PROCESS_RETCODE);
    }
}
