use std::path::Path;

use tracing::debug;

use super::{make_executable, TestContext, TestOutcome};
use crate::error::TestError;
use crate::models::{FileRole, ScoreSource};
use crate::sandbox::{execute, ExecSpec};

/// Run the grading script as `<script> [<submission entry>]`
pub(super) async fn test(
    ctx: &TestContext<'_>,
    submission_entry: Option<&Path>,
) -> Result<TestOutcome, TestError> {
    let script = ctx
        .manifest
        .locate(ctx.test, FileRole::Script)
        .ok_or_else(|| TestError::MissingArtifact("grading script".into()))?;
    make_executable(&script)?;

    let mut spec = ExecSpec::new(script.to_string_lossy(), ctx.workdir())
        .with_limits(ctx.limits.clone())
        .with_cancel(ctx.cancel.clone());
    if let Some(entry) = submission_entry {
        spec = spec.with_args([entry.to_string_lossy().into_owned()]);
    }

    debug!("Running grading script {:?}", script);
    let result = execute(&spec).await?;

    if !result.is_success() {
        return Ok(TestOutcome {
            ok: false,
            retcode: result.retcode,
            output: result.output,
            score: 0.0,
        });
    }

    let raw = match ctx.test.score_source {
        ScoreSource::Retcode => Some(ctx.test.maxscore),
        ScoreSource::Output => parse_score(&result.output),
    };

    Ok(match raw {
        Some(score) => TestOutcome {
            ok: true,
            retcode: result.retcode,
            output: result.output,
            score: ctx.test.bound_score(score),
        },
        None => TestOutcome {
            ok: false,
            retcode: result.retcode,
            output: format!("{}\n[grading script printed no score]", result.output),
            score: 0.0,
        },
    })
}

/// The score is the last non-empty line of output
fn parse_score(output: &str) -> Option<f64> {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::test as run_script;
    use crate::models::{File, Test};
    use crate::sandbox::ExecLimits;
    use crate::stager::{self, StagedManifest};
    use crate::storage::BlobStore;
    use crate::tester::IoScoring;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_parse_score() {
        assert_eq!(parse_score("running...\n7.5\n\n"), Some(7.5));
        assert_eq!(parse_score("  10  "), Some(10.0));
        assert_eq!(parse_score("score: 10"), None);
        assert_eq!(parse_score(""), None);
    }

    async fn stage_script(work: &Path, blobs: &Path, body: &str) -> (Test, StagedManifest) {
        let test: Test = serde_json::from_str(
            r#"{"id": "t", "assignment": "a", "name": "n", "maxscore": 10,
                "builder": "null", "tester": "script"}"#,
        )
        .unwrap();
        let blob = blobs.join("grade.sh");
        std::fs::write(&blob, body).unwrap();
        let script = File {
            id: "f".into(),
            key: Some("script".into()),
            name: "grade.sh".into(),
            path: blob.to_string_lossy().into_owned(),
            owner: "u".into(),
        };
        let manifest = stager::stage(
            work,
            &test,
            &[(script, FileRole::Script)],
            &[],
            &BlobStore::local(),
        )
        .await
        .unwrap();
        (test, manifest)
    }

    fn ctx<'a>(test: &'a Test, manifest: &'a StagedManifest, limits: &'a ExecLimits) -> TestContext<'a> {
        TestContext {
            test,
            manifest,
            limits,
            scoring: IoScoring::Proportional,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_score_is_bounded() {
        let work = tempfile::tempdir().unwrap();
        let blobs = tempfile::tempdir().unwrap();
        let (test, manifest) = stage_script(work.path(), blobs.path(), "#!/bin/sh\necho 42\n").await;
        let limits = ExecLimits::default();

        let outcome = test_script(&ctx(&test, &manifest, &limits)).await;
        assert!(outcome.ok);
        assert_eq!(outcome.score, 10.0);
    }

    #[tokio::test]
    async fn test_retcode_score_source() {
        let work = tempfile::tempdir().unwrap();
        let blobs = tempfile::tempdir().unwrap();
        let (mut test, manifest) =
            stage_script(work.path(), blobs.path(), "#!/bin/sh\necho fine\n").await;
        test.score_source = ScoreSource::Retcode;
        let limits = ExecLimits::default();

        let outcome = test_script(&ctx(&test, &manifest, &limits)).await;
        assert!(outcome.ok);
        assert_eq!(outcome.score, 10.0);
    }

    #[tokio::test]
    async fn test_failing_script_scores_zero() {
        let work = tempfile::tempdir().unwrap();
        let blobs = tempfile::tempdir().unwrap();
        let (test, manifest) =
            stage_script(work.path(), blobs.path(), "#!/bin/sh\necho 10\nexit 4\n").await;
        let limits = ExecLimits::default();

        let outcome = test_script(&ctx(&test, &manifest, &limits)).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.retcode, 4);
        assert_eq!(outcome.score, 0.0);
    }

    #[tokio::test]
    async fn test_missing_script_is_an_error() {
        let work = tempfile::tempdir().unwrap();
        let test: Test = serde_json::from_str(
            r#"{"id": "t", "assignment": "a", "name": "n", "maxscore": 10,
                "builder": "null", "tester": "script", "path_script": "grade.sh"}"#,
        )
        .unwrap();
        let manifest = StagedManifest::new(work.path());
        let limits = ExecLimits::default();

        let err = run_script(&ctx(&test, &manifest, &limits), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TestError::MissingArtifact(_)));
    }

    async fn test_script(ctx: &TestContext<'_>) -> TestOutcome {
        run_script(ctx, None).await.unwrap()
    }
}
