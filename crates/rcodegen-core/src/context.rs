//! Per-run mutable state, shared between the orchestrator and its
//! executors.
//!
//! `step_results` and `tool_sessions` are protected by a single `RwLock`
//! each; readers take the lock only for the duration of a map lookup and
//! release it before doing any file I/O (required by the variable
//! resolver, see `resolver.rs`). There is no direct map access from
//! outside this module — every caller goes through `get_result` /
//! `record_result` / `tool_session` / `set_tool_session`.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::envelope::Envelope;

#[derive(Debug)]
pub struct Context {
    pub inputs: HashMap<String, String>,
    step_results: RwLock<HashMap<String, Envelope>>,
    tool_sessions: RwLock<HashMap<String, String>>,
    pub variables: RwLock<HashMap<String, String>>,
}

impl Context {
    pub fn new(inputs: HashMap<String, String>) -> Self {
        Self {
            inputs,
            step_results: RwLock::new(HashMap::new()),
            tool_sessions: RwLock::new(HashMap::new()),
            variables: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a step's envelope. Once inserted, it is never overwritten;
    /// callers that need a different value for the same name are
    /// misusing the API — the orchestrator and executors only ever call
    /// this once per step name per run.
    pub async fn record_result(&self, name: &str, envelope: Envelope) {
        self.step_results
            .write()
            .await
            .insert(name.to_string(), envelope);
    }

    /// The only accessor for step results; no caller touches the
    /// underlying map directly.
    pub async fn get_result(&self, name: &str) -> Option<Envelope> {
        self.step_results.read().await.get(name).cloned()
    }

    pub async fn all_results(&self) -> Vec<(String, Envelope)> {
        self.step_results
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn tool_session(&self, tool: &str) -> Option<String> {
        self.tool_sessions.read().await.get(tool).cloned()
    }

    pub async fn set_tool_session(&self, tool: &str, session_id: impl Into<String>) {
        self.tool_sessions
            .write()
            .await
            .insert(tool.to_string(), session_id.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Metrics;

    #[tokio::test]
    async fn record_then_get_round_trips() {
        let ctx = Context::new(HashMap::new());
        ctx.record_result("a", Envelope::success(None, Metrics::default()))
            .await;
        let got = ctx.get_result("a").await.unwrap();
        assert!(got.status.is_success());
    }

    #[tokio::test]
    async fn missing_result_is_none() {
        let ctx = Context::new(HashMap::new());
        assert!(ctx.get_result("nope").await.is_none());
    }

    #[tokio::test]
    async fn tool_sessions_track_latest_writer() {
        let ctx = Context::new(HashMap::new());
        ctx.set_tool_session("echo", "s1").await;
        ctx.set_tool_session("echo", "s2").await;
        assert_eq!(ctx.tool_session("echo").await.as_deref(), Some("s2"));
    }

    #[tokio::test]
    async fn concurrent_writes_to_distinct_names_both_land() {
        let ctx = Context::new(HashMap::new());
        let (a, b) = tokio::join!(
            ctx.record_result("a", Envelope::success(None, Metrics::default())),
            ctx.record_result("b", Envelope::skipped()),
        );
        let _ = (a, b);
        assert!(ctx.get_result("a").await.is_some());
        assert!(ctx.get_result("b").await.is_some());
    }
}
