//! Run state machine
//!
//! `pending -> running -> terminal`. Each stage failure maps to one terminal
//! status:
//! - records missing, staging failed, tester could not run: `complete-exception-run`
//! - builder unknown or unable to run: `complete-exception-builder`
//! - build ran and failed: `complete-error-builder_build`
//! - tester ran: `complete` or `complete-error`, as the tester decides
//!
//! The engine loads its own copies of the test, submission and file records
//! when the run starts, so later edits to those records cannot affect it.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::builder::{BuildContext, BuilderKind};
use crate::config::GraderConfig;
use crate::models::{File, FileRole, Run, RunOutcome, RunStatus, Submission, Test};
use crate::reporter::ReporterRegistry;
use crate::stager;
use crate::storage::{BlobStore, Store};
use crate::tester::{TestContext, TesterKind};

pub struct RunEngine {
    store: Arc<dyn Store>,
    blobs: BlobStore,
    config: Arc<GraderConfig>,
    reporters: ReporterRegistry,
}

/// Records a run works from, loaded once at start
struct Snapshot {
    test: Test,
    test_files: Vec<(File, FileRole)>,
    submission_files: Vec<File>,
}

impl RunEngine {
    pub fn new(
        store: Arc<dyn Store>,
        blobs: BlobStore,
        config: Arc<GraderConfig>,
        reporters: ReporterRegistry,
    ) -> Self {
        Self {
            store,
            blobs,
            config,
            reporters,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &GraderConfig {
        &self.config
    }

    /// Drive `run` to a terminal status, persist it and notify its reporter.
    ///
    /// Never fails: every error is folded into the returned run's status.
    pub async fn execute(&self, mut run: Run, cancel: CancellationToken) -> Run {
        run.start();
        info!(run_id = %run.id, test = %run.test, submission = %run.submission, "Run started");

        let (mut outcome, test) = self.drive(&run, &cancel).await;
        if cancel.is_cancelled() {
            outcome = RunOutcome::exception(RunStatus::CompleteExceptionRun, "Run cancelled");
        }
        self.complete(&mut run, outcome).await;

        if let Some(test) = test {
            self.report(&run, &test).await;
        }
        run
    }

    /// Record a terminal outcome and persist the run
    pub async fn complete(&self, run: &mut Run, outcome: RunOutcome) {
        if !run.finish(outcome, self.config.output_limit_bytes) {
            return;
        }
        info!(
            run_id = %run.id,
            status = %run.status,
            retcode = run.retcode,
            score = run.score,
            "Run finished"
        );
        if let Err(e) = self.store.save_run(run).await {
            error!("Failed to persist run {}: {}", run.id, e);
        }
    }

    async fn report(&self, run: &Run, test: &Test) {
        let Some(name) = test.reporter.as_deref() else {
            return;
        };
        let comment = format!("{}: {}", test.name, run.status);
        if let Err(e) = self
            .reporters
            .file_report(name, &run.owner, run.score, &comment)
            .await
        {
            warn!("Reporter '{}' failed for run {}: {}", name, run.id, e);
        }
    }

    async fn load(&self, run: &Run) -> Result<Snapshot, String> {
        let test = self
            .store
            .get_test(&run.test)
            .await
            .map_err(|e| format!("Failed to load test: {}", e))?;
        let submission: Submission = self
            .store
            .get_submission(&run.submission)
            .await
            .map_err(|e| format!("Failed to load submission: {}", e))?;

        if test.assignment != submission.assignment {
            return Err(format!(
                "Test '{}' and submission '{}' belong to different assignments",
                test.id, submission.id
            ));
        }

        let mut test_files = Vec::with_capacity(test.files.len());
        for entry in &test.files {
            let file = self
                .store
                .get_file(&entry.file)
                .await
                .map_err(|e| format!("Failed to load test file: {}", e))?;
            test_files.push((file, entry.role));
        }

        let mut submission_files = Vec::with_capacity(submission.files.len());
        for id in &submission.files {
            let file = self
                .store
                .get_file(id)
                .await
                .map_err(|e| format!("Failed to load submission file: {}", e))?;
            submission_files.push(file);
        }

        Ok(Snapshot {
            test,
            test_files,
            submission_files,
        })
    }

    async fn drive(&self, run: &Run, cancel: &CancellationToken) -> (RunOutcome, Option<Test>) {
        let exception = |status, message: String| RunOutcome::exception(status, message);

        let snapshot = match self.load(run).await {
            Ok(snapshot) => snapshot,
            Err(message) => return (exception(RunStatus::CompleteExceptionRun, message), None),
        };
        let test = &snapshot.test;

        // Resolve plugins before anything touches the filesystem
        let builder = match test.builder.parse::<BuilderKind>() {
            Ok(builder) => builder,
            Err(message) => {
                return (
                    exception(RunStatus::CompleteExceptionBuilder, message),
                    Some(snapshot.test),
                )
            }
        };
        let tester = match test.tester.parse::<TesterKind>() {
            Ok(tester) => tester,
            Err(message) => {
                return (
                    exception(RunStatus::CompleteExceptionRun, message),
                    Some(snapshot.test),
                )
            }
        };

        let outcome = self
            .run_stages(run, &snapshot, builder, tester, cancel)
            .await;
        (outcome, Some(snapshot.test))
    }

    async fn run_stages(
        &self,
        run: &Run,
        snapshot: &Snapshot,
        builder: BuilderKind,
        tester: TesterKind,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let test = &snapshot.test;

        // Removed when dropped, on every path out of this function
        let workdir = match std::fs::create_dir_all(&self.config.work_root).and_then(|_| {
            tempfile::Builder::new()
                .prefix(&format!("run-{}-", run.id))
                .tempdir_in(&self.config.work_root)
        }) {
            Ok(dir) => dir,
            Err(e) => {
                return RunOutcome::exception(
                    RunStatus::CompleteExceptionRun,
                    format!("Failed to create working directory: {}", e),
                )
            }
        };
        debug!("Run {} working in {:?}", run.id, workdir.path());

        let manifest = match stager::stage(
            workdir.path(),
            test,
            &snapshot.test_files,
            &snapshot.submission_files,
            &self.blobs,
        )
        .await
        {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Staging failed for run {}: {}", run.id, e);
                return RunOutcome::exception(
                    RunStatus::CompleteExceptionRun,
                    format!("Staging failed: {}", e),
                );
            }
        };

        let build_ctx = BuildContext {
            workdir: workdir.path(),
            limits: &self.config.build,
            make_program: &self.config.make_program,
            cancel: cancel.clone(),
        };
        match builder.build(&build_ctx).await {
            Ok(build) if build.ok => {}
            Ok(build) => {
                return RunOutcome::new(
                    RunStatus::CompleteErrorBuilderBuild,
                    build.retcode,
                    build.output,
                    0.0,
                )
            }
            Err(e) => {
                warn!("Builder '{}' unavailable for run {}: {}", builder, run.id, e);
                return RunOutcome::exception(RunStatus::CompleteExceptionBuilder, e.to_string());
            }
        }

        if cancel.is_cancelled() {
            return RunOutcome::exception(RunStatus::CompleteExceptionRun, "Run cancelled");
        }

        let test_ctx = TestContext {
            test,
            manifest: &manifest,
            limits: &self.config.test,
            scoring: self.config.io.scoring,
            cancel: cancel.clone(),
        };
        let entry = manifest.submission_entry();
        match tester.test(&test_ctx, entry.as_deref()).await {
            Ok(result) => {
                let status = if result.ok {
                    RunStatus::Complete
                } else {
                    RunStatus::CompleteError
                };
                RunOutcome::new(status, result.retcode, result.output, result.score)
            }
            Err(e) => {
                warn!("Tester '{}' could not run for run {}: {}", tester, run.id, e);
                RunOutcome::exception(RunStatus::CompleteExceptionRun, e.to_string())
            }
        }
    }
}
