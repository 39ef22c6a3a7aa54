//! Task-oriented step execution

use crate::context::UnitContext;
use crate::{Error, Result};
use jobline_core::{ArtifactRole, BatchStatus, StepKind, StepScope};
use tracing::{info, warn};

/// Run the unit's batchlet.
///
/// A stop requested while `process` is in flight calls `stop` on the
/// batchlet once and moves the unit to STOPPING; `process` is still awaited
/// and its return value becomes the exit status.
pub async fn run_batchlet<C: UnitContext>(ctx: &C) -> Result<()> {
    let step = ctx.step();
    let StepKind::Batchlet { batchlet: name } = &step.kind else {
        return Err(Error::Execution(format!("step {} is not a batchlet step", step.id)));
    };

    let batchlet = ctx.job_context().factory().batchlet(name, &step.properties)?;
    let cancel = ctx.cancel_token().clone();

    let process = batchlet.process(ctx);
    tokio::pin!(process);

    let outcome = tokio::select! {
        biased;
        outcome = &mut process => outcome,
        _ = cancel.cancelled() => {
            info!(step = %step.id, batchlet = %name, "Stop requested, signalling batchlet");
            ctx.cell().set_batch_status(BatchStatus::Stopping);
            if let Err(e) = batchlet.stop().await {
                warn!(step = %step.id, batchlet = %name, error = %e, "Batchlet stop failed");
            }
            process.await
        }
    };

    let exit_status = outcome.map_err(|e| Error::collaborator(ArtifactRole::Batchlet, name, "process", e))?;
    if let Some(exit_status) = exit_status {
        ctx.set_exit_status(&exit_status);
    }
    Ok(())
}
