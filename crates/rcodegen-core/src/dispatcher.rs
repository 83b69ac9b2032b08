//! Routes a step to its executor by shape, in priority order: parallel,
//! merge, vote, tool. `Step::kind()` already enforces that a validated
//! step has exactly one of these set; dispatch falls back to
//! `UNKNOWN_STEP` for a step that reached execution unvalidated.

use std::sync::Arc;

use crate::bundle::Step;
use crate::cancel::CancellationToken;
use crate::context::Context;
use crate::envelope::{Envelope, Metrics};
use crate::error::CoreError;
use crate::executor_tool::ToolRegistry;
use crate::workspace::Workspace;
use crate::{executor_merge, executor_parallel, executor_tool, executor_vote};

pub async fn dispatch(
    step: &Step,
    ctx: &Arc<Context>,
    ws: &Arc<Workspace>,
    tools: &Arc<ToolRegistry>,
    cancel: &CancellationToken,
) -> Envelope {
    if step.parallel.is_some() {
        return executor_parallel::execute(step, Arc::clone(ctx), Arc::clone(ws), Arc::clone(tools), cancel.clone())
            .await;
    }
    if step.merge.is_some() {
        return executor_merge::execute(step, ctx.as_ref(), ws.as_ref()).await;
    }
    if step.vote.is_some() {
        return executor_vote::execute(step, ctx.as_ref(), ws.as_ref()).await;
    }
    if step.tool.is_some() {
        return executor_tool::execute(step, ctx.as_ref(), ws.as_ref(), tools.as_ref(), cancel).await;
    }

    Envelope::from_error(
        &CoreError::UnknownStep(format!("{} matches no known shape", step.name)),
        Metrics::default(),
    )
}
