//! The vote executor: tallies success/failure across N referenced steps
//! and emits an approved/rejected decision.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::json;

use crate::bundle::{Step, VoteStrategy};
use crate::context::Context;
use crate::envelope::{Envelope, Metrics};
use crate::error::CoreError;
use crate::workspace::Workspace;

fn step_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\$\{steps\.([A-Za-z0-9_-]+)(?:\.[a-zA-Z_]+)?\}$").unwrap())
}

/// Extract the step name from a `${steps.NAME}` or `${steps.NAME.field}`
/// reference. Falls back to the raw text if it doesn't match the
/// reference grammar (the bundle loader already rejects this at load
/// time, so this path is unreached for a validated bundle).
fn referenced_step_name(input: &str) -> String {
    step_name_re()
        .captures(input)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| input.to_string())
}

pub async fn execute(step: &Step, ctx: &Context, ws: &Workspace) -> Envelope {
    let Some(spec) = &step.vote else {
        return Envelope::from_error(
            &CoreError::UnknownStep(step.name.clone()),
            Metrics::default(),
        );
    };

    let mut success = 0u64;
    let mut failure = 0u64;
    for input in &spec.inputs {
        let name = referenced_step_name(input);
        match ctx.get_result(&name).await {
            Some(envelope) if envelope.status.is_success() => success += 1,
            _ => failure += 1,
        }
    }

    let decision = match spec.strategy {
        VoteStrategy::Majority => {
            if success > failure {
                "approved"
            } else {
                "rejected"
            }
        }
        VoteStrategy::Unanimous => {
            if failure == 0 && success > 0 {
                "approved"
            } else {
                "rejected"
            }
        }
    };

    let artifact = json!({
        "votes": { "success": success, "failure": failure },
        "decision": decision,
    });

    let envelope = Envelope::success(None, Metrics::default())
        .with_result("decision", decision)
        .with_result("success", success.to_string())
        .with_result("failure", failure.to_string());

    match ws.write_output(&step.sanitized_name(), &artifact) {
        Ok(path) => envelope.with_output_ref(path.to_string_lossy().to_string()),
        Err(e) => Envelope::from_error(&e, Metrics::default()),
    }
}
