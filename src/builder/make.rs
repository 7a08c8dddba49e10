use tracing::{debug, info};

use super::{BuildContext, BuildOutcome};
use crate::error::BuildError;
use crate::sandbox::{execute, ExecSpec};

/// Run the build tool in the workdir; a failing build is an outcome, not an error
pub(super) async fn build(ctx: &BuildContext<'_>) -> Result<BuildOutcome, BuildError> {
    let spec = ExecSpec::new(ctx.make_program, ctx.workdir)
        .with_limits(ctx.limits.clone())
        .with_cancel(ctx.cancel.clone());

    debug!("Running {} in {:?}", ctx.make_program, ctx.workdir);
    let result = execute(&spec).await?;

    if !result.is_success() {
        info!(
            "Build failed with retcode {} (timed_out={})",
            result.retcode, result.timed_out
        );
    }

    Ok(BuildOutcome {
        ok: result.is_success(),
        retcode: result.retcode,
        output: result.output,
    })
}
