//! The `Tool` adapter interface — the only injection point for
//! tool-specific behavior. The core never inspects stdout/stderr for
//! meaning beyond what an adapter exposes, and spawns subprocesses
//! without a shell: argv elements pass through verbatim.

use async_trait::async_trait;

/// Usage extracted from a tool invocation's output.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UsageInfo {
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    /// Set when the adapter detects a fatal condition in the output even
    /// though the process exited 0 (e.g. an embedded error envelope).
    /// A success envelope requires both exit code 0 AND this being
    /// `None`.
    pub hard_failure: Option<String>,
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable identifier used in `Context::tool_sessions` and logs.
    fn name(&self) -> &str;

    /// Produce the subprocess argument vector. The core appends no
    /// extra args beyond what this returns.
    fn build_command(&self, task: &str, resume_session_id: Option<&str>) -> Vec<String>;

    /// Extract usage metrics. Adapters that cannot distinguish a hard
    /// failure return `Ok` usage; a non-zero exit code is what signals
    /// failure, not this method.
    fn parse_output(&self, stdout: &str, stderr: &str) -> UsageInfo;

    /// Extract a session identifier for resume, or `None`.
    fn parse_session_id(&self, stdout: &str, stderr: &str) -> Option<String>;

    /// Whether the core should feed a prior session id back into
    /// `build_command`.
    fn supports_resume(&self) -> bool;
}

/// Minimal adapter used by the test suite and the `smoke` builtin
/// bundle: echoes its task back via `/bin/sh -c`, passed through an
/// environment variable (never interpolated into the shell command
/// string) to avoid shell injection through task text.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn build_command(&self, _task: &str, _resume_session_id: Option<&str>) -> Vec<String> {
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "printf '%s' \"$RCODEGEN_TASK\"".to_string(),
        ]
    }

    fn parse_output(&self, _stdout: &str, _stderr: &str) -> UsageInfo {
        UsageInfo::default()
    }

    fn parse_session_id(&self, _stdout: &str, _stderr: &str) -> Option<String> {
        None
    }

    fn supports_resume(&self) -> bool {
        false
    }
}

/// Test-only adapter that reports a fixed non-zero cost/token usage per
/// invocation, used to exercise parallel cost aggregation (spec.md
/// §8.4 S3).
#[cfg(test)]
pub struct CostTool;

#[cfg(test)]
#[async_trait]
impl Tool for CostTool {
    fn name(&self) -> &str {
        "cost_tool"
    }

    fn build_command(&self, _task: &str, _resume_session_id: Option<&str>) -> Vec<String> {
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "printf '%s' \"$RCODEGEN_TASK\"".to_string(),
        ]
    }

    fn parse_output(&self, _stdout: &str, _stderr: &str) -> UsageInfo {
        UsageInfo {
            cost_usd: 0.25,
            input_tokens: 100,
            output_tokens: 0,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
        }
    }

    fn parse_session_id(&self, _stdout: &str, _stderr: &str) -> Option<String> {
        None
    }

    fn supports_resume(&self) -> bool {
        false
    }
}
