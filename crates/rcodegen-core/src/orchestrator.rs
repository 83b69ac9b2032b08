//! Drives the top-level step list of a bundle: evaluates `if` conditions,
//! dispatches each step, records envelopes into Context, enforces the
//! failure policy, and composes the run-level envelope. Owns the
//! Workspace and FileLock for the run.

use std::sync::Arc;

use tracing::instrument;

use crate::bundle::{Bundle, StepKind};
use crate::cancel::CancellationToken;
use crate::condition;
use crate::context::Context;
use crate::dispatcher::dispatch;
use crate::envelope::{Envelope, Metrics};
use crate::error::CoreError;
use crate::events::{Event, EventSink};
use crate::executor_tool::ToolRegistry;
use crate::lock::{self, LockHandle};
use crate::options::{FailurePolicy, RunOptions};
use crate::workspace::Workspace;

pub struct Orchestrator {
    tools: Arc<ToolRegistry>,
    events: Arc<dyn EventSink>,
}

impl Orchestrator {
    pub fn new(tools: ToolRegistry, events: Arc<dyn EventSink>) -> Self {
        Self {
            tools: Arc::new(tools),
            events,
        }
    }

    /// Run every top-level step of `bundle` in order. Creates a fresh
    /// Workspace and Context for this run, acquires the cross-process
    /// lock identified by `lock_identifier` (e.g. the working tree's
    /// basename), and releases it on every exit path including early
    /// returns for resource errors.
    #[instrument(skip(self, bundle, inputs, cancel), fields(bundle = %bundle.name))]
    pub async fn run(
        &self,
        bundle: &Bundle,
        inputs: std::collections::HashMap<String, String>,
        options: &RunOptions,
        lock_identifier: &str,
        cancel: CancellationToken,
    ) -> Envelope {
        let ws = match Workspace::new(&options.workspace_base) {
            Ok(ws) => Arc::new(ws),
            Err(e) => return Envelope::from_error(&e, Metrics::default()),
        };

        let lock = match lock::acquire(&options.home, lock_identifier, options.lock_enabled, &cancel).await {
            Ok(lock) => lock,
            Err(e) => return Envelope::from_error(&e, Metrics::default()),
        };

        let envelope = self.run_locked(bundle, inputs, options, &ws, &cancel).await;
        drop_lock(lock);
        envelope
    }

    async fn run_locked(
        &self,
        bundle: &Bundle,
        inputs: std::collections::HashMap<String, String>,
        options: &RunOptions,
        ws: &Arc<Workspace>,
        cancel: &CancellationToken,
    ) -> Envelope {
        let ctx = Arc::new(Context::new(inputs.clone()));
        let policy = bundle
            .failure_policy
            .as_deref()
            .map(FailurePolicy::from_bundle_field)
            .unwrap_or(options.failure_policy);

        self.events
            .emit(Event::RunStarted {
                bundle_name: bundle.name.clone(),
                job_id: ws.job_id.clone(),
                inputs,
            })
            .await;

        let mut failed = false;
        for step in &bundle.steps {
            if cancel.is_cancelled() {
                ctx.record_result(&step.name, Envelope::from_error(&CoreError::Cancelled, Metrics::default()))
                    .await;
                failed = true;
                break;
            }

            let condition_text = step.if_condition.as_deref().unwrap_or("");
            if !condition::evaluate(condition_text, &ctx).await {
                ctx.record_result(&step.name, Envelope::skipped()).await;
                self.events
                    .emit(Event::StepSkipped { step_name: step.name.clone() })
                    .await;
                continue;
            }

            self.events
                .emit(Event::StepStarted {
                    step_name: step.name.clone(),
                    kind: step.kind(),
                    tool: step.tool.clone(),
                    model: step.model.clone(),
                })
                .await;

            let envelope = dispatch(step, &ctx, ws, &self.tools, cancel).await;
            let is_failure = envelope.status.is_failure();
            ctx.record_result(&step.name, envelope.clone()).await;
            self.events
                .emit(Event::StepFinished { step_name: step.name.clone(), envelope })
                .await;

            if is_failure {
                failed = true;
                if policy == FailurePolicy::FailFast {
                    break;
                }
            }
        }

        let run_envelope = self.compose_run_envelope(&ctx, failed).await;
        self.events
            .emit(Event::RunFinished { envelope: run_envelope.clone() })
            .await;
        run_envelope
    }

    async fn compose_run_envelope(&self, ctx: &Context, failed: bool) -> Envelope {
        let mut aggregate = Metrics::default();
        let mut total = 0usize;
        let mut failing_names = Vec::new();
        for (name, envelope) in ctx.all_results().await {
            aggregate = aggregate.add(&envelope.metrics);
            total += 1;
            if envelope.status.is_failure() {
                failing_names.push(name);
            }
        }

        if failed {
            Envelope::from_error(
                &CoreError::PartialFailure(failing_names.len(), total, failing_names.join(", ")),
                aggregate,
            )
        } else {
            Envelope::success(None, aggregate)
        }
    }
}

/// Releases the lock explicitly (rather than relying solely on scope
/// exit) so the release happens before any subsequent work in the
/// caller, matching spec.md §4.10 step 4's "deferred, runs even on
/// errors" requirement.
fn drop_lock(mut lock: LockHandle) {
    lock.release();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{MergeSpec, Step, VoteSpec, VoteStrategy};
    use crate::tool::EchoTool;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn tool_step(name: &str, task: &str) -> Step {
        Step {
            name: name.to_string(),
            tool: Some("echo".to_string()),
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

    fn registry() -> ToolRegistry {
        let mut m: ToolRegistry = HashMap::new();
        m.insert("echo".to_string(), Arc::new(EchoTool));
        m
    }

    fn run_options() -> (tempfile::TempDir, RunOptions) {
        let tmp = tempdir().unwrap();
        let options = RunOptions::new(tmp.path().to_path_buf(), tmp.path().to_path_buf());
        (tmp, options)
    }

    #[tokio::test]
    async fn sequential_two_step_run_succeeds_with_threaded_variable() {
        let (_tmp, options) = run_options();
        let orchestrator = Orchestrator::new(registry(), Arc::new(crate::events::TracingEventSink));
        let bundle = Bundle {
            name: "s1".to_string(),
            steps: vec![tool_step("a", "hello"), tool_step("b", "prev: ${steps.a.stdout}")],
            failure_policy: None,
            source_path: Default::default(),
        };

        let envelope = orchestrator
            .run(&bundle, HashMap::new(), &options, "repo", CancellationToken::new())
            .await;
        assert!(envelope.status.is_success(), "{:?}", envelope.error);
    }

    #[tokio::test]
    async fn conditional_skip_records_skipped_envelope() {
        let (_tmp, options) = run_options();
        let orchestrator = Orchestrator::new(registry(), Arc::new(crate::events::TracingEventSink));
        let mut guarded = tool_step("guarded", "x");
        guarded.if_condition = Some("${steps.probe.status} == 'failure'".to_string());
        let bundle = Bundle {
            name: "s2".to_string(),
            steps: vec![tool_step("probe", "ok"), guarded],
            failure_policy: None,
            source_path: Default::default(),
        };

        let envelope = orchestrator
            .run(&bundle, HashMap::new(), &options, "repo", CancellationToken::new())
            .await;
        assert!(envelope.status.is_success());
    }

    #[tokio::test]
    async fn fail_fast_stops_after_first_failing_step() {
        let (_tmp, options) = run_options();
        let orchestrator = Orchestrator::new(registry(), Arc::new(crate::events::TracingEventSink));
        let mut bad = tool_step("bad", "x");
        bad.tool = Some("missing-tool".to_string());
        let bundle = Bundle {
            name: "ff".to_string(),
            steps: vec![bad, tool_step("never", "y")],
            failure_policy: None,
            source_path: Default::default(),
        };

        let envelope = orchestrator
            .run(&bundle, HashMap::new(), &options, "repo", CancellationToken::new())
            .await;
        assert!(envelope.status.is_failure());
        assert!(envelope.error.unwrap().message.contains("bad"));
    }

    #[tokio::test]
    async fn continue_on_error_runs_merge_and_vote_after_a_failure() {
        let (_tmp, options) = run_options();
        let orchestrator = Orchestrator::new(registry(), Arc::new(crate::events::TracingEventSink));

        let a = tool_step("a", "one");
        let mut b = tool_step("b", "two");
        b.tool = Some("missing-tool".to_string());

        let merge = Step {
            name: "m".to_string(),
            tool: None,
            task: None,
            model: None,
            session_resume: None,
            extra_args: None,
            if_condition: None,
            parallel: None,
            merge: Some(MergeSpec {
                inputs: vec!["${steps.a.output_ref}".to_string()],
            }),
            vote: None,
        };
        let vote = Step {
            name: "v".to_string(),
            tool: None,
            task: None,
            model: None,
            session_resume: None,
            extra_args: None,
            if_condition: None,
            parallel: None,
            merge: None,
            vote: Some(VoteSpec {
                inputs: vec!["${steps.a}".to_string(), "${steps.b}".to_string()],
                strategy: VoteStrategy::Unanimous,
            }),
        };

        let bundle = Bundle {
            name: "s4".to_string(),
            steps: vec![a, b, merge, vote],
            failure_policy: Some("continue-on-error".to_string()),
            source_path: Default::default(),
        };

        let envelope = orchestrator
            .run(&bundle, HashMap::new(), &options, "repo", CancellationToken::new())
            .await;
        assert!(envelope.status.is_failure());
    }
}
