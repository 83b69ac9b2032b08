//! The immutable outcome record produced by every step.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failure,
    Skipped,
}

impl StepStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

/// Usage metrics extracted from a tool invocation, or aggregated across
/// a group of children.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub tool: Option<String>,
    pub duration_ms: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

impl Metrics {
    /// Sum two metrics' cost/token fields. Timing and tool identity are not
    /// meaningful for a sum and are left at the default/None.
    pub fn add(&self, other: &Metrics) -> Metrics {
        Metrics {
            tool: None,
            duration_ms: self.duration_ms + other.duration_ms,
            start_time: None,
            end_time: None,
            cost_usd: self.cost_usd + other.cost_usd,
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            cache_read_tokens: self.cache_read_tokens + other.cache_read_tokens,
            cache_write_tokens: self.cache_write_tokens + other.cache_write_tokens,
        }
    }
}

/// Immutable outcome of a step. Once inserted into `Context::step_results`,
/// an envelope is never mutated — callers that need a different value
/// construct a new one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub status: StepStatus,
    #[serde(default)]
    pub result: HashMap<String, String>,
    /// Path to the on-disk artifact. Empty for skipped steps.
    #[serde(default)]
    pub output_ref: Option<String>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub metrics: Metrics,
}

impl Envelope {
    pub fn skipped() -> Self {
        Self {
            status: StepStatus::Skipped,
            result: HashMap::new(),
            output_ref: None,
            error: None,
            metrics: Metrics::default(),
        }
    }

    pub fn success(output_ref: Option<String>, metrics: Metrics) -> Self {
        Self {
            status: StepStatus::Success,
            result: HashMap::new(),
            output_ref,
            error: None,
            metrics,
        }
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>, metrics: Metrics) -> Self {
        Self {
            status: StepStatus::Failure,
            result: HashMap::new(),
            output_ref: None,
            error: Some(ErrorInfo {
                code: code.into(),
                message: message.into(),
            }),
            metrics,
        }
    }

    /// Build a failure envelope from a typed `CoreError`, deriving the
    /// string error code from `CoreError::code()` rather than repeating it
    /// ad hoc at each call site.
    pub fn from_error(error: &CoreError, metrics: Metrics) -> Self {
        Self::failure(error.code(), error.to_string(), metrics)
    }

    pub fn with_result(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.result.insert(key.into(), value.into());
        self
    }

    pub fn with_output_ref(mut self, output_ref: impl Into<String>) -> Self {
        self.output_ref = Some(output_ref.into());
        self
    }
}
