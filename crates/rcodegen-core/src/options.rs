//! Run-wide options, carried as an immutable value rather than global
//! state (spec design note: "global mutable state for flags" becomes a
//! field on this struct, passed once into `Orchestrator::run`).

use std::path::PathBuf;

/// Whether the run aborts on the first failing top-level step, or
/// records the failure and continues to the next top-level step.
///
/// Applies only at the top level: a `Parallel` group never fails fast
/// among its own siblings regardless of this setting (spec.md §4.7).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    #[default]
    FailFast,
    ContinueOnError,
}

impl FailurePolicy {
    /// Read from a bundle's `failure_policy` field: `None` or
    /// `"fail-fast"` means `FailFast`; `"continue-on-error"` means
    /// `ContinueOnError`; anything else is treated as `FailFast` (an
    /// unrecognized value does not abort the load).
    pub fn from_bundle_field(field: Option<&str>) -> Self {
        match field {
            Some("continue-on-error") => Self::ContinueOnError,
            _ => Self::FailFast,
        }
    }
}

/// Immutable configuration for a single `Orchestrator::run` call.
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Root directory under which `jobs/<job_id>/` is created.
    pub workspace_base: PathBuf,
    /// Home directory used to locate `.rcodegen/{bundles,locks}`.
    pub home: PathBuf,
    /// Whether the cross-process advisory lock is taken at all.
    pub lock_enabled: bool,
    pub failure_policy: FailurePolicy,
    /// Override for the user-bundle search directory. `None` means the
    /// default `home/.rcodegen/bundles`.
    pub bundles_dir: Option<PathBuf>,
}

impl RunOptions {
    pub fn new(home: PathBuf, workspace_base: PathBuf) -> Self {
        Self {
            workspace_base,
            home,
            lock_enabled: true,
            failure_policy: FailurePolicy::FailFast,
            bundles_dir: None,
        }
    }
}
