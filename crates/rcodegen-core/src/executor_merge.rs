//! The merge executor: concatenates N referenced artifacts' stdout
//! captures into one.

use std::fs;

use serde_json::json;

use crate::bundle::Step;
use crate::context::Context;
use crate::envelope::{Envelope, Metrics};
use crate::error::CoreError;
use crate::resolver::resolve;
use crate::workspace::Workspace;

const SEPARATOR: &str = "\n\n---\n\n";

/// Resolve an input reference to its artifact path, then read that
/// artifact's `stdout` field. Returns `Err(path)` for any failure so the
/// caller can name the offending path in `READ_ERROR`.
fn read_stdout_field(path: &str) -> Result<String, String> {
    let contents = fs::read_to_string(path).map_err(|_| path.to_string())?;
    let artifact: serde_json::Value = serde_json::from_str(&contents).map_err(|_| path.to_string())?;
    artifact
        .get("stdout")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| path.to_string())
}

pub async fn execute(step: &Step, ctx: &Context, ws: &Workspace) -> Envelope {
    let Some(spec) = &step.merge else {
        return Envelope::from_error(
            &CoreError::UnknownStep(step.name.clone()),
            Metrics::default(),
        );
    };

    let mut contents = Vec::with_capacity(spec.inputs.len());
    let mut missing = Vec::new();
    for input in &spec.inputs {
        let path = resolve(input, ctx).await;
        match read_stdout_field(&path) {
            Ok(text) => contents.push(text),
            Err(path) => missing.push(path),
        }
    }

    if !missing.is_empty() {
        return Envelope::from_error(&CoreError::ReadError(missing), Metrics::default());
    }

    let merged = contents.join(SEPARATOR);
    let artifact = json!({ "stdout": merged, "stderr": "" });
    match ws.write_output(&step.sanitized_name(), &artifact) {
        Ok(path) => Envelope::success(Some(path.to_string_lossy().to_string()), Metrics::default()),
        Err(e) => Envelope::from_error(&e, Metrics::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::MergeSpec;
    use crate::envelope::Envelope as Env;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn merge_step(inputs: Vec<String>) -> Step {
        Step {
            name: "m".to_string(),
            tool: None,
            task: None,
            model: None,
            session_resume: None,
            extra_args: None,
            if_condition: None,
            parallel: None,
            merge: Some(MergeSpec { inputs }),
            vote: None,
        }
    }

    #[tokio::test]
    async fn concatenates_with_separator() {
        let tmp = tempdir().unwrap();
        let ws = Workspace::new(tmp.path()).unwrap();
        let ctx = Context::new(HashMap::new());

        let a_env = Env::success(
            Some(ws.write_output("a", &json!({"stdout": "AAA", "stderr": ""})).unwrap().to_string_lossy().to_string()),
            Metrics::default(),
        );
        let b_env = Env::success(
            Some(ws.write_output("b", &json!({"stdout": "BBB", "stderr": ""})).unwrap().to_string_lossy().to_string()),
            Metrics::default(),
        );
        ctx.record_result("a", a_env).await;
        ctx.record_result("b", b_env).await;

        let step = merge_step(vec!["${steps.a.output_ref}".to_string(), "${steps.b.output_ref}".to_string()]);
        let env = execute(&step, &ctx, &ws).await;
        assert!(env.status.is_success());
        let contents = fs::read_to_string(env.output_ref.unwrap()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["stdout"], "AAA\n\n---\n\nBBB");
    }

    #[tokio::test]
    async fn missing_input_fails_with_read_error_naming_it() {
        let tmp = tempdir().unwrap();
        let ws = Workspace::new(tmp.path()).unwrap();
        let ctx = Context::new(HashMap::new());

        let step = merge_step(vec!["/nonexistent/path/whatever.json".to_string()]);
        let env = execute(&step, &ctx, &ws).await;
        assert!(env.status.is_failure());
        let err = env.error.unwrap();
        assert_eq!(err.code, "READ_ERROR");
        assert!(err.message.contains("whatever.json"));
    }
}
