//! The parallel executor: fans children out onto concurrent tasks, joins
//! all of them (no fail-fast among siblings), and aggregates cost/tokens
//! exactly.

use std::sync::Arc;

use tokio::task::JoinSet;

use crate::bundle::Step;
use crate::cancel::CancellationToken;
use crate::context::Context;
use crate::dispatcher::dispatch;
use crate::envelope::{Envelope, Metrics};
use crate::error::CoreError;
use crate::executor_tool::ToolRegistry;
use crate::workspace::Workspace;

pub async fn execute(
    step: &Step,
    ctx: Arc<Context>,
    ws: Arc<Workspace>,
    tools: Arc<ToolRegistry>,
    cancel: CancellationToken,
) -> Envelope {
    let children = step.parallel.clone().unwrap_or_default();
    if children.is_empty() {
        return Envelope::success(None, Metrics::default());
    }

    let mut joins: JoinSet<(String, Envelope)> = JoinSet::new();
    for child in children {
        let ctx = Arc::clone(&ctx);
        let ws = Arc::clone(&ws);
        let tools = Arc::clone(&tools);
        let cancel = cancel.clone();
        joins.spawn(async move {
            let envelope = dispatch(&child, &ctx, &ws, &tools, &cancel).await;
            (child.name.clone(), envelope)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = joins.join_next().await {
        match joined {
            Ok((name, envelope)) => results.push((name, envelope)),
            Err(e) => results.push((
                "<panicked>".to_string(),
                Envelope::from_error(
                    &CoreError::ExecFailed(format!("child task panicked: {e}")),
                    Metrics::default(),
                ),
            )),
        }
    }

    // Record each child's envelope under its own name BEFORE the parent
    // envelope is formed, so later top-level steps can reference
    // individual children.
    for (name, envelope) in &results {
        ctx.record_result(name, envelope.clone()).await;
    }

    let mut aggregate = Metrics::default();
    let mut failing: Vec<String> = Vec::new();
    for (name, envelope) in &results {
        aggregate = aggregate.add(&envelope.metrics);
        if envelope.status.is_failure() {
            let message = envelope
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default();
            failing.push(format!("{name}: {message}"));
        }
    }

    if failing.is_empty() {
        Envelope::success(None, aggregate)
    } else {
        Envelope::from_error(
            &CoreError::PartialFailure(failing.len(), results.len(), failing.join("; ")),
            aggregate,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Step;
    use crate::tool::EchoTool;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn leaf(name: &str, tool: &str, task: &str) -> Step {
        Step {
            name: name.to_string(),
            tool: Some(tool.to_string()),
            task: Some(task.to_string()),
            model: None,
            session_resume: None,
            extra_args: None,
            if_condition: None,
            parallel: None,
            merge: None,
            vote: None,
        }
    }

    fn parallel_step(children: Vec<Step>) -> Step {
        Step {
            name: "fan".to_string(),
            tool: None,
            task: None,
            model: None,
            session_resume: None,
            extra_args: None,
            if_condition: None,
            parallel: Some(children),
            merge: None,
            vote: None,
        }
    }

    #[tokio::test]
    async fn zero_children_succeeds_with_zero_cost() {
        let tmp = tempdir().unwrap();
        let ws = Arc::new(Workspace::new(tmp.path()).unwrap());
        let ctx = Arc::new(Context::new(HashMap::new()));
        let tools: Arc<ToolRegistry> = Arc::new(HashMap::new());
        let step = parallel_step(vec![]);
        let env = execute(&step, ctx, ws, tools, CancellationToken::new()).await;
        assert!(env.status.is_success());
        assert_eq!(env.metrics.cost_usd, 0.0);
    }

    #[tokio::test]
    async fn children_recorded_individually_and_cost_summed() {
        let tmp = tempdir().unwrap();
        let ws = Arc::new(Workspace::new(tmp.path()).unwrap());
        let ctx = Arc::new(Context::new(HashMap::new()));
        let mut reg: ToolRegistry = HashMap::new();
        reg.insert("echo".to_string(), Arc::new(EchoTool));
        let tools = Arc::new(reg);

        let step = parallel_step(vec![leaf("l", "echo", "1"), leaf("r", "echo", "2")]);
        let env = execute(&step, Arc::clone(&ctx), ws, tools, CancellationToken::new()).await;

        assert!(env.status.is_success());
        assert!(ctx.get_result("l").await.is_some());
        assert!(ctx.get_result("r").await.is_some());
    }

    #[tokio::test]
    async fn parallel_cost_aggregation_sums_exactly() {
        use crate::tool::CostTool;

        let tmp = tempdir().unwrap();
        let ws = Arc::new(Workspace::new(tmp.path()).unwrap());
        let ctx = Arc::new(Context::new(HashMap::new()));
        let mut reg: ToolRegistry = HashMap::new();
        reg.insert("cost_tool".to_string(), Arc::new(CostTool));
        let tools = Arc::new(reg);

        let step = parallel_step(vec![
            leaf("a", "cost_tool", "1"),
            leaf("b", "cost_tool", "2"),
            leaf("c", "cost_tool", "3"),
        ]);
        let env = execute(&step, ctx, ws, tools, CancellationToken::new()).await;

        assert!(env.status.is_success());
        assert_eq!(env.metrics.cost_usd, 0.75);
        assert_eq!(env.metrics.input_tokens, 300);
    }

    #[tokio::test]
    async fn partial_failure_names_every_failing_child() {
        let tmp = tempdir().unwrap();
        let ws = Arc::new(Workspace::new(tmp.path()).unwrap());
        let ctx = Arc::new(Context::new(HashMap::new()));
        let mut reg: ToolRegistry = HashMap::new();
        reg.insert("echo".to_string(), Arc::new(EchoTool));
        let tools = Arc::new(reg);

        // A step with an unregistered tool always fails.
        let step = parallel_step(vec![
            leaf("ok", "echo", "1"),
            leaf("bad", "missing-tool", "2"),
        ]);
        let env = execute(&step, ctx, ws, tools, CancellationToken::new()).await;
        assert!(env.status.is_failure());
        assert!(env.error.unwrap().message.contains("bad"));
    }
}
