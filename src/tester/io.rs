use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{make_executable, TestContext, TestOutcome};
use crate::error::TestError;
use crate::models::{FileRole, NO_PROCESS_RETCODE};
use crate::sandbox::{execute, ExecOutcome, ExecSpec};

/// Compare two outputs, ignoring trailing whitespace on each line and
/// trailing blank lines
pub fn compare_output(actual: &str, expected: &str) -> bool {
    let normalize = |s: &str| -> Vec<String> {
        let mut lines: Vec<String> = s.lines().map(|line| line.trim_end().to_string()).collect();
        while lines.last().map(|s| s.is_empty()).unwrap_or(false) {
            lines.pop();
        }
        lines
    };

    normalize(actual) == normalize(expected)
}

fn case_name(input: Option<&Path>) -> String {
    input
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "<no input>".into())
}

async fn run_program(
    ctx: &TestContext<'_>,
    program: &Path,
    stdin: &[u8],
) -> Result<ExecOutcome, crate::error::ExecError> {
    let spec = ExecSpec::new(program.to_string_lossy(), ctx.workdir())
        .with_limits(ctx.limits.clone())
        .with_stdin(stdin.to_vec())
        .with_cancel(ctx.cancel.clone());
    execute(&spec).await
}

/// Feed every input to the solution and the submission and compare outputs.
///
/// Without any staged input the programs run once on empty stdin.
pub(super) async fn test(
    ctx: &TestContext<'_>,
    submission_entry: Option<&Path>,
) -> Result<TestOutcome, TestError> {
    let test = ctx.test;
    let solution = ctx.manifest.locate(test, FileRole::Solution);
    if solution.is_none() && test.require_solution {
        return Err(TestError::MissingArtifact("reference solution".into()));
    }

    let Some(submission) = submission_entry else {
        return Ok(TestOutcome {
            ok: true,
            retcode: NO_PROCESS_RETCODE,
            output: "No submission files were provided; nothing was tested".into(),
            score: 0.0,
        });
    };

    if let Some(solution) = &solution {
        make_executable(solution)?;
    }
    make_executable(submission)?;

    let inputs = ctx.manifest.inputs(test);
    let cases: Vec<Option<PathBuf>> = if inputs.is_empty() {
        vec![None]
    } else {
        inputs.into_iter().map(Some).collect()
    };

    let total = cases.len();
    let mut matched = 0;
    let mut first_failure: Option<i32> = None;
    let mut report = String::new();
    let mut detail = String::new();

    for input in &cases {
        let name = case_name(input.as_deref());
        let stdin = match input {
            Some(path) => tokio::fs::read(path).await?,
            None => Vec::new(),
        };

        let expected = match &solution {
            Some(solution) => {
                let reference = run_program(ctx, solution, &stdin).await?;
                if !reference.is_success() {
                    return Err(TestError::ReferenceFailed {
                        input: name,
                        retcode: reference.retcode,
                    });
                }
                Some(reference.output)
            }
            None => None,
        };

        // A submission that cannot even start is the submission's failure
        let (passed, retcode, output) = match run_program(ctx, submission, &stdin).await {
            Ok(result) if result.is_success() => {
                let passed = expected
                    .as_deref()
                    .map(|expected| compare_output(&result.output, expected))
                    .unwrap_or(true);
                (passed, result.retcode, result.output)
            }
            Ok(result) => (false, result.retcode, result.output),
            Err(e) => (false, NO_PROCESS_RETCODE, e.to_string()),
        };

        if retcode != 0 && first_failure.is_none() {
            first_failure = Some(retcode);
            let _ = writeln!(detail, "--- {} (retcode {}) ---\n{}", name, retcode, output);
        }
        if passed {
            matched += 1;
        }
        let verdict = match (passed, retcode) {
            (true, _) => "pass".to_string(),
            (false, 0) => "wrong output".to_string(),
            (false, code) => format!("failed (retcode {})", code),
        };
        let _ = writeln!(report, "{}: {}", name, verdict);
        debug!("io case {}: {}", name, verdict);
    }

    let _ = writeln!(report, "{}/{} inputs matched", matched, total);
    if !detail.is_empty() {
        report.push_str(&detail);
    }

    Ok(TestOutcome {
        ok: first_failure.is_none(),
        retcode: first_failure.unwrap_or(0),
        output: report,
        score: test.bound_score(ctx.scoring.score(test.maxscore, matched, total)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::test as run_io;
    use crate::models::{File, Test};
    use crate::sandbox::ExecLimits;
    use crate::stager::{self, StagedManifest};
    use crate::storage::BlobStore;
    use crate::tester::IoScoring;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_compare_output_exact_match() {
        assert!(compare_output("hello\nworld\n", "hello\nworld\n"));
    }

    #[test]
    fn test_compare_output_trailing_whitespace() {
        assert!(compare_output("hello  \nworld\n", "hello\nworld\n"));
    }

    #[test]
    fn test_compare_output_trailing_newlines() {
        assert!(compare_output("hello\nworld\n\n\n", "hello\nworld"));
    }

    #[test]
    fn test_compare_output_different() {
        assert!(!compare_output("hello\nworld\n", "hello\nearth\n"));
        assert!(!compare_output("  hello\n", "hello\n"));
    }

    struct Fixture {
        work: tempfile::TempDir,
        blobs: tempfile::TempDir,
        files: Vec<(File, FileRole)>,
        submissions: Vec<File>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                work: tempfile::tempdir().unwrap(),
                blobs: tempfile::tempdir().unwrap(),
                files: Vec::new(),
                submissions: Vec::new(),
            }
        }

        fn blob(&self, id: &str, key: Option<&str>, name: &str, body: &str) -> File {
            let path = self.blobs.path().join(id);
            std::fs::write(&path, body).unwrap();
            File {
                id: id.into(),
                key: key.map(Into::into),
                name: name.into(),
                path: path.to_string_lossy().into_owned(),
                owner: "u".into(),
            }
        }

        fn add(&mut self, id: &str, key: Option<&str>, name: &str, body: &str, role: FileRole) {
            let file = self.blob(id, key, name, body);
            self.files.push((file, role));
        }

        fn submit(&mut self, name: &str, body: &str) {
            let file = self.blob(&format!("sub-{}", name), None, name, body);
            self.submissions.push(file);
        }

        async fn stage(&self, test: &Test) -> StagedManifest {
            stager::stage(
                self.work.path(),
                test,
                &self.files,
                &self.submissions,
                &BlobStore::local(),
            )
            .await
            .unwrap()
        }
    }

    fn io_test() -> Test {
        serde_json::from_str(
            r#"{"id": "t", "assignment": "a", "name": "n", "maxscore": 10,
                "builder": "null", "tester": "io"}"#,
        )
        .unwrap()
    }

    const DOUBLER: &str = "#!/bin/sh\nread n\necho $((n * 2))\n";
    const TRIPLER: &str = "#!/bin/sh\nread n\necho $((n * 3))\n";

    async fn run(test: &Test, manifest: &StagedManifest, scoring: IoScoring) -> Result<TestOutcome, TestError> {
        let limits = ExecLimits::default();
        let ctx = TestContext {
            test,
            manifest,
            limits: &limits,
            scoring,
            cancel: CancellationToken::new(),
        };
        let entry = manifest.submission_entry();
        run_io(&ctx, entry.as_deref()).await
    }

    fn with_inputs(fx: &mut Fixture) {
        fx.add("sol", Some("solution"), "solution.sh", DOUBLER, FileRole::Solution);
        fx.add("in1", Some("input"), "1.in", "2\n", FileRole::Input);
        fx.add("in2", Some("input"), "2.in", "0\n", FileRole::Input);
    }

    #[tokio::test]
    async fn test_matching_submission_gets_full_score() {
        let mut fx = Fixture::new();
        with_inputs(&mut fx);
        fx.submit("main.sh", DOUBLER);
        let test = io_test();
        let manifest = fx.stage(&test).await;

        let outcome = run(&test, &manifest, IoScoring::Proportional).await.unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.retcode, 0);
        assert_eq!(outcome.score, 10.0);
        assert!(outcome.output.contains("2/2 inputs matched"));
    }

    #[tokio::test]
    async fn test_partial_credit_per_policy() {
        let mut fx = Fixture::new();
        with_inputs(&mut fx);
        // Agrees with the solution only on input 0
        fx.submit("main.sh", TRIPLER);
        let test = io_test();
        let manifest = fx.stage(&test).await;

        let outcome = run(&test, &manifest, IoScoring::Proportional).await.unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.score, 5.0);

        let outcome = run(&test, &manifest, IoScoring::AllOrNothing).await.unwrap();
        assert_eq!(outcome.score, 0.0);
    }

    #[tokio::test]
    async fn test_crashing_submission_is_not_ok() {
        let mut fx = Fixture::new();
        with_inputs(&mut fx);
        fx.submit("main.sh", "#!/bin/sh\necho boom 1>&2\nexit 3\n");
        let test = io_test();
        let manifest = fx.stage(&test).await;

        let outcome = run(&test, &manifest, IoScoring::Proportional).await.unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.retcode, 3);
        assert_eq!(outcome.score, 0.0);
        assert!(outcome.output.contains("boom"));
    }

    #[tokio::test]
    async fn test_hidden_solution_is_missing_artifact() {
        let mut fx = Fixture::new();
        fx.add("sol", None, "solution.sh", DOUBLER, FileRole::Solution);
        fx.submit("main.sh", DOUBLER);
        let test = io_test();
        let manifest = fx.stage(&test).await;

        let err = run(&test, &manifest, IoScoring::Proportional).await.unwrap_err();
        assert!(matches!(err, TestError::MissingArtifact(_)));
    }

    #[tokio::test]
    async fn test_no_submission_scores_zero() {
        let mut fx = Fixture::new();
        with_inputs(&mut fx);
        let test = io_test();
        let manifest = fx.stage(&test).await;

        let outcome = run(&test, &manifest, IoScoring::Proportional).await.unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.retcode, NO_PROCESS_RETCODE);
        assert_eq!(outcome.score, 0.0);
    }

    #[tokio::test]
    async fn test_optional_solution_checks_exit_status() {
        let mut fx = Fixture::new();
        fx.submit("main.sh", "#!/bin/sh\necho anything\n");
        let mut test = io_test();
        test.require_solution = false;
        let manifest = fx.stage(&test).await;

        let outcome = run(&test, &manifest, IoScoring::Proportional).await.unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.score, 10.0);
    }

    #[tokio::test]
    async fn test_broken_solution_is_an_error() {
        let mut fx = Fixture::new();
        fx.add("sol", Some("solution"), "solution.sh", "#!/bin/sh\nexit 1\n", FileRole::Solution);
        fx.submit("main.sh", DOUBLER);
        let test = io_test();
        let manifest = fx.stage(&test).await;

        let err = run(&test, &manifest, IoScoring::Proportional).await.unwrap_err();
        assert!(matches!(err, TestError::ReferenceFailed { .. }));
    }
}
