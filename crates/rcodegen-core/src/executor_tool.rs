//! The tool executor: invokes a single `Tool` subprocess and returns an
//! envelope.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{instrument, warn};

use crate::bundle::Step;
use crate::cancel::CancellationToken;
use crate::context::Context;
use crate::envelope::{Envelope, Metrics};
use crate::error::CoreError;
use crate::resolver::resolve;
use crate::stream_cap::{MAX_LINE_BYTES, capture_capped};
use crate::tool::Tool;
use crate::workspace::{Workspace, set_owner_only_file};

const SIGTERM_GRACE: Duration = Duration::from_secs(5);

pub type ToolRegistry = HashMap<String, Arc<dyn Tool>>;

#[instrument(skip(step, ctx, ws, tools, cancel), fields(step = %step.name))]
pub async fn execute(
    step: &Step,
    ctx: &Context,
    ws: &Workspace,
    tools: &ToolRegistry,
    cancel: &CancellationToken,
) -> Envelope {
    let tool_name = match &step.tool {
        Some(t) => t.clone(),
        None => {
            return Envelope::from_error(
                &CoreError::UnknownStep(format!("step '{}' has no tool", step.name)),
                Metrics::default(),
            );
        }
    };

    let Some(tool) = tools.get(&tool_name) else {
        return Envelope::from_error(
            &CoreError::UnknownStep(format!("no registered tool named '{tool_name}'")),
            Metrics::default(),
        );
    };

    let task_template = step.task.as_deref().unwrap_or_default();
    let resolved_task = resolve(task_template, ctx).await;

    let resume_id = if step.session_resume.unwrap_or(false) && tool.supports_resume() {
        ctx.tool_session(&tool_name).await
    } else {
        None
    };

    let argv = tool.build_command(&resolved_task, resume_id.as_deref());
    if argv.is_empty() {
        return Envelope::from_error(
            &CoreError::ExecFailed(format!("tool '{tool_name}' produced an empty command")),
            Metrics::default(),
        );
    }

    let sanitized = step.sanitized_name();
    let start_time = Utc::now();

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.env("RCODEGEN_TASK", &resolved_task);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return Envelope::from_error(
                &CoreError::ExecFailed(format!("failed to spawn '{tool_name}': {e}")),
                Metrics::default(),
            );
        }
    };

    let (stdout_text, stdout_dropped, stderr_text, stderr_dropped, wait_result) =
        run_and_capture(&mut child, cancel).await;

    let end_time = Utc::now();
    let duration_ms = (end_time - start_time).num_milliseconds().max(0) as u64;

    if stdout_dropped || stderr_dropped {
        warn!(step = %step.name, "oversized line skipped during capture");
    }

    let exit_status = match wait_result {
        Ok(status) => status,
        Err(e) => {
            return Envelope::from_error(
                &CoreError::ExecFailed(format!("process wait failed: {e}")),
                Metrics::default(),
            );
        }
    };

    write_log(ws, &sanitized, &stdout_text, &stderr_text);

    let usage = tool.parse_output(&stdout_text, &stderr_text);
    let metrics = Metrics {
        tool: Some(tool_name.clone()),
        duration_ms,
        start_time: Some(start_time),
        end_time: Some(end_time),
        cost_usd: usage.cost_usd,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_read_tokens: usage.cache_read_tokens,
        cache_write_tokens: usage.cache_write_tokens,
    };

    if let Some(session_id) = tool.parse_session_id(&stdout_text, &stderr_text) {
        if !session_id.is_empty() {
            ctx.set_tool_session(&tool_name, session_id).await;
        }
    }

    let artifact = json!({ "stdout": stdout_text, "stderr": stderr_text });
    let output_ref = match ws.write_output(&sanitized, &artifact) {
        Ok(path) => path,
        Err(e) => {
            return Envelope::from_error(&e, metrics);
        }
    };

    if !exit_status.success() || usage.hard_failure.is_some() {
        let message = usage
            .hard_failure
            .unwrap_or_else(|| stderr_text.trim().to_string());
        return Envelope::from_error(&CoreError::ExecFailed(message), metrics)
            .with_output_ref(output_ref.to_string_lossy().to_string());
    }

    Envelope::success(Some(output_ref.to_string_lossy().to_string()), metrics)
}

/// Drive the child to completion, capturing stdout/stderr concurrently
/// and honoring cancellation: SIGTERM, a grace period, then SIGKILL.
async fn run_and_capture(
    child: &mut tokio::process::Child,
    cancel: &CancellationToken,
) -> (String, bool, String, bool, std::io::Result<std::process::ExitStatus>) {
    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let stdout_task = tokio::spawn(capture_capped(stdout, MAX_LINE_BYTES, "stdout"));
    let stderr_task = tokio::spawn(capture_capped(stderr, MAX_LINE_BYTES, "stderr"));

    tokio::select! {
        _ = cancel.cancelled() => {
            terminate_then_kill(child).await;
        }
        _ = child.wait() => {}
    }

    let wait_result = child.wait().await;
    let (stdout_text, stdout_dropped) = stdout_task.await.unwrap_or_default();
    let (stderr_text, stderr_dropped) = stderr_task.await.unwrap_or_default();

    (stdout_text, stdout_dropped, stderr_text, stderr_dropped, wait_result)
}

async fn terminate_then_kill(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        // SAFETY: pid is the child's own process id; SIGTERM requests
        // graceful shutdown.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    if timeout(SIGTERM_GRACE, child.wait()).await.is_err() {
        let _ = child.start_kill();
    }
}

fn write_log(ws: &Workspace, sanitized: &str, stdout: &str, stderr: &str) {
    // Best-effort: if the log file cannot be created, proceed
    // buffer-only (the caller already has stdout/stderr in memory).
    let path = ws.log_path(sanitized);
    let result = (|| -> std::io::Result<()> {
        let mut f = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
        set_owner_only_file(&path)?;
        f.write_all(b"=== stdout ===\n")?;
        f.write_all(stdout.as_bytes())?;
        f.write_all(b"=== stderr ===\n")?;
        f.write_all(stderr.as_bytes())?;
        Ok(())
    })();
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "failed to write log file, continuing buffer-only");
    }
}
