//! Expands `${inputs.X}` / `${steps.NAME.field}` references inside
//! strings.
//!
//! Reads happen outside any `Context` lock: the resolver snapshots the
//! needed context entries under a read lock, releases it, then performs
//! any file I/O (reading `stdout`/`stderr` artifacts).

use std::fs;
use std::sync::OnceLock;

use regex::Regex;

use crate::context::Context;
use crate::envelope::Envelope;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{[^}]+\}").unwrap())
}

/// Resolve every `${...}` reference in `text` against `ctx`. Unresolved
/// references (missing input, missing step, unknown field suffix) are
/// left in the original text verbatim — this is not an error.
pub async fn resolve(text: &str, ctx: &Context) -> String {
    // Collect match spans first (non-overlapping scan), then replace
    // right-to-left so earlier byte offsets stay valid.
    let matches: Vec<(usize, usize, String)> = placeholder_re()
        .find_iter(text)
        .map(|m| (m.start(), m.end(), m.as_str().to_string()))
        .collect();

    let mut out = text.to_string();
    for (start, end, raw) in matches.into_iter().rev() {
        let inner = &raw[2..raw.len() - 1]; // strip `${` and `}`
        let replacement = resolve_one(inner, ctx).await.unwrap_or_else(|| raw.clone());
        out.replace_range(start..end, &replacement);
    }
    out
}

async fn resolve_one(inner: &str, ctx: &Context) -> Option<String> {
    if let Some(key) = inner.strip_prefix("inputs.") {
        return ctx.inputs.get(key).cloned();
    }

    let rest = inner.strip_prefix("steps.")?;
    let mut parts = rest.splitn(2, '.');
    let step_name = parts.next()?;
    let field = parts.next();

    // Snapshot the envelope under the read lock, then release it before
    // any file I/O below.
    let envelope = ctx.get_result(step_name).await?;

    match field {
        None => None, // `${steps.NAME}` alone is not a valid field reference.
        Some("output_ref") => envelope.output_ref.clone(),
        Some("status") => Some(envelope.status.to_string()),
        Some(f) if f.starts_with("result.") => {
            let key = &f["result.".len()..];
            envelope.result.get(key).cloned()
        }
        Some("stdout") => read_artifact_field(&envelope, "stdout"),
        Some("stderr") => read_artifact_field(&envelope, "stderr"),
        Some(_unknown) => None,
    }
}

/// Read `field` (`"stdout"` or `"stderr"`) from the envelope's artifact
/// JSON. If that field's content is newline-delimited JSON events ending
/// in `{"type":"result","result":"..."}`, return the extracted `result`
/// string instead of the raw captured text.
fn read_artifact_field(envelope: &Envelope, field: &str) -> Option<String> {
    let path = envelope.output_ref.as_ref()?;
    let contents = fs::read_to_string(path).ok()?;
    let artifact: serde_json::Value = serde_json::from_str(&contents).ok()?;
    let raw = artifact.get(field)?.as_str()?.to_string();
    Some(extract_streamed_result(&raw).unwrap_or(raw))
}

/// If `raw` is newline-delimited JSON events whose last well-formed
/// event is `{"type":"result","result":"..."}`, return that `result`
/// string.
fn extract_streamed_result(raw: &str) -> Option<String> {
    let mut last_result: Option<String> = None;
    let mut saw_any_json_line = false;
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
            saw_any_json_line = true;
            if value.get("type").and_then(|v| v.as_str()) == Some("result") {
                last_result = value
                    .get("result")
                    .and_then(|v| v.as_str())
                    .map(String::from);
            }
        }
    }
    if saw_any_json_line { last_result } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, Metrics};
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[tokio::test]
    async fn resolves_input_reference() {
        let mut inputs = HashMap::new();
        inputs.insert("X".to_string(), "42".to_string());
        let ctx = Context::new(inputs);
        assert_eq!(resolve("value: ${inputs.X}", &ctx).await, "value: 42");
    }

    #[tokio::test]
    async fn missing_input_left_verbatim() {
        let ctx = Context::new(HashMap::new());
        assert_eq!(
            resolve("value: ${inputs.MISSING}", &ctx).await,
            "value: ${inputs.MISSING}"
        );
    }

    #[tokio::test]
    async fn resolves_step_status() {
        let ctx = Context::new(HashMap::new());
        ctx.record_result("a", Envelope::success(None, Metrics::default()))
            .await;
        assert_eq!(
            resolve("${steps.a.status}", &ctx).await,
            "success".to_string()
        );
    }

    #[tokio::test]
    async fn resolves_step_result_field() {
        let ctx = Context::new(HashMap::new());
        let env = Envelope::success(None, Metrics::default()).with_result("decision", "approved");
        ctx.record_result("v", env).await;
        assert_eq!(resolve("${steps.v.result.decision}", &ctx).await, "approved");
    }

    #[tokio::test]
    async fn resolves_stdout_from_artifact() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("a.json");
        std::fs::write(&path, r#"{"stdout":"hello","stderr":""}"#).unwrap();

        let ctx = Context::new(HashMap::new());
        let env = Envelope::success(Some(path.to_string_lossy().to_string()), Metrics::default());
        ctx.record_result("a", env).await;

        assert_eq!(resolve("prev: ${steps.a.stdout}", &ctx).await, "prev: hello");
    }

    #[tokio::test]
    async fn extracts_streamed_result_from_ndjson_stdout() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("a.json");
        let stdout = "{\"type\":\"progress\"}\n{\"type\":\"result\",\"result\":\"final answer\"}\n";
        std::fs::write(&path, serde_json::json!({"stdout": stdout, "stderr": ""}).to_string())
            .unwrap();

        let ctx = Context::new(HashMap::new());
        let env = Envelope::success(Some(path.to_string_lossy().to_string()), Metrics::default());
        ctx.record_result("a", env).await;

        assert_eq!(resolve("${steps.a.stdout}", &ctx).await, "final answer");
    }

    #[tokio::test]
    async fn unknown_field_suffix_left_verbatim() {
        let ctx = Context::new(HashMap::new());
        ctx.record_result("a", Envelope::success(None, Metrics::default()))
            .await;
        assert_eq!(
            resolve("${steps.a.bogus}", &ctx).await,
            "${steps.a.bogus}".to_string()
        );
    }

    #[tokio::test]
    async fn missing_step_left_verbatim() {
        let ctx = Context::new(HashMap::new());
        assert_eq!(
            resolve("${steps.nope.status}", &ctx).await,
            "${steps.nope.status}".to_string()
        );
    }

    #[tokio::test]
    async fn idempotent_on_already_resolved_text() {
        let ctx = Context::new(HashMap::new());
        let text = "no placeholders here";
        assert_eq!(resolve(text, &ctx).await, text);
    }

    #[tokio::test]
    async fn multiple_references_resolved_in_one_pass() {
        let mut inputs = HashMap::new();
        inputs.insert("A".to_string(), "1".to_string());
        inputs.insert("B".to_string(), "2".to_string());
        let ctx = Context::new(inputs);
        assert_eq!(
            resolve("${inputs.A}-${inputs.B}", &ctx).await,
            "1-2".to_string()
        );
    }
}
