//! Bundle model and loader.
//!
//! A bundle is a declarative workflow definition loaded from
//! `$HOME/.rcodegen/bundles/<name>.json`, or from an embedded builtin set
//! when no matching user file exists.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

const NAME_MAX_LEN: usize = 100;

fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap())
}

fn reference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\$\{steps\.([A-Za-z0-9_-]+)(\.[a-zA-Z_]+)?\}$").unwrap())
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= NAME_MAX_LEN && name_re().is_match(name)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MergeSpec {
    pub inputs: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteStrategy {
    Majority,
    Unanimous,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteSpec {
    pub inputs: Vec<String>,
    pub strategy: VoteStrategy,
}

/// A single node in the workflow tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub session_resume: Option<bool>,
    #[serde(default)]
    pub extra_args: Option<Vec<String>>,
    #[serde(default, rename = "if")]
    pub if_condition: Option<String>,
    #[serde(default)]
    pub parallel: Option<Vec<Step>>,
    #[serde(default)]
    pub merge: Option<MergeSpec>,
    #[serde(default)]
    pub vote: Option<VoteSpec>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    Tool,
    Parallel,
    Merge,
    Vote,
}

impl Step {
    /// Which of the four mutually-exclusive shapes this step has.
    ///
    /// Caller must have already validated exactly one is set (the loader
    /// does this at load time); a step reaching here with zero or more
    /// than one set is a loader bug, not a runtime condition to recover
    /// from.
    pub fn kind(&self) -> StepKind {
        if self.parallel.is_some() {
            StepKind::Parallel
        } else if self.merge.is_some() {
            StepKind::Merge
        } else if self.vote.is_some() {
            StepKind::Vote
        } else {
            StepKind::Tool
        }
    }

    fn set_count(&self) -> usize {
        [
            self.tool.is_some(),
            self.parallel.is_some(),
            self.merge.is_some(),
            self.vote.is_some(),
        ]
        .into_iter()
        .filter(|b| *b)
        .count()
    }

    /// Sanitize this step's name for use as a filename component:
    /// characters outside `[A-Za-z0-9._-]` become `_`, empty becomes
    /// `step`, truncated to 80 chars.
    pub fn sanitized_name(&self) -> String {
        sanitize_filename_component(&self.name)
    }
}

/// Sanitize a name for use as a filename component per the shared rule
/// used for step names throughout the core (outputs/, logs/, lock info).
pub fn sanitize_filename_component(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() {
        out = "step".to_string();
    }
    out.truncate(80);
    out
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Bundle {
    pub name: String,
    pub steps: Vec<Step>,
    /// Default is fail-fast; a bundle opts into continue-on-error.
    #[serde(default)]
    pub failure_policy: Option<String>,
    /// Absolute path the bundle was loaded from, for reporting only. Not
    /// part of the serialized schema (skipped on serialize, defaulted on
    /// deserialize) since it is filled in by the loader after parse.
    #[serde(skip)]
    pub source_path: PathBuf,
}

/// Pre-order traversal over every step in a bundle, parent before children.
pub fn preorder(steps: &[Step]) -> Vec<&Step> {
    let mut out = Vec::new();
    fn walk<'a>(steps: &'a [Step], out: &mut Vec<&'a Step>) {
        for s in steps {
            out.push(s);
            if let Some(children) = &s.parallel {
                walk(children, out);
            }
        }
    }
    walk(steps, &mut out);
    out
}

fn validate_bundle(bundle: &Bundle) -> CoreResult<()> {
    if !valid_name(&bundle.name) {
        return Err(CoreError::InvalidName(bundle.name.clone()));
    }
    validate_steps(&bundle.steps, &mut HashSet::new())?;

    // Merge/vote references must point to an earlier step in pre-order
    // traversal.
    let order = preorder(&bundle.steps);
    let mut seen: HashSet<&str> = HashSet::new();
    for step in &order {
        let refs: Vec<&str> = match step.kind() {
            StepKind::Merge => step
                .merge
                .as_ref()
                .map(|m| m.inputs.iter().map(|s| s.as_str()).collect())
                .unwrap_or_default(),
            StepKind::Vote => step
                .vote
                .as_ref()
                .map(|v| v.inputs.iter().map(|s| s.as_str()).collect())
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        for r in refs {
            let caps = reference_re()
                .captures(r)
                .ok_or_else(|| CoreError::UnresolvedReference(r.to_string()))?;
            let target = &caps[1];
            if !seen.contains(target) {
                return Err(CoreError::UnresolvedReference(r.to_string()));
            }
        }
        seen.insert(&step.name);
    }
    Ok(())
}

fn validate_steps<'a>(steps: &'a [Step], global_seen: &mut HashSet<String>) -> CoreResult<()> {
    let mut sibling_names = HashSet::new();
    for step in steps {
        if !valid_name(&step.name) {
            return Err(CoreError::InvalidName(step.name.clone()));
        }
        if !sibling_names.insert(step.name.clone()) {
            return Err(CoreError::DuplicateStep(step.name.clone()));
        }
        global_seen.insert(step.name.clone());
        if step.set_count() != 1 {
            return Err(CoreError::SchemaError(format!(
                "step '{}' must set exactly one of tool/parallel/merge/vote",
                step.name
            )));
        }
        if let Some(children) = &step.parallel {
            // Children may be any step kind except parallel (no nested fan-out).
            for child in children {
                if child.parallel.is_some() {
                    return Err(CoreError::SchemaError(format!(
                        "step '{}' nests a parallel step, which is not permitted",
                        child.name
                    )));
                }
            }
            validate_steps(children, global_seen)?;
        }
    }
    Ok(())
}

/// Embedded builtin bundles, compiled into the binary.
fn builtins() -> &'static [(&'static str, &'static str)] {
    &[(
        "smoke",
        r#"{
            "name": "smoke",
            "steps": [
                { "name": "probe", "tool": "echo", "task": "ok" }
            ]
        }"#,
    )]
}

fn bundles_dir(home: &Path) -> PathBuf {
    home.join(".rcodegen").join("bundles")
}

/// Load a bundle by name. Source order: user file under
/// `$HOME/.rcodegen/bundles/<name>.json`, falling back to an embedded
/// builtin of the same name.
pub fn load(home: &Path, name: &str) -> CoreResult<Bundle> {
    load_from(&bundles_dir(home), name)
}

/// Like `load`, but the user-bundle directory is given explicitly
/// rather than derived from a home directory. Backs `RunOptions`'
/// `bundles_dir` override.
pub fn load_from(dir: &Path, name: &str) -> CoreResult<Bundle> {
    if !valid_name(name) {
        return Err(CoreError::InvalidName(name.to_string()));
    }

    let user_path = dir.join(format!("{name}.json"));
    let (contents, source_path) = if user_path.is_file() {
        let contents = fs::read_to_string(&user_path)
            .map_err(|e| CoreError::ParseError(format!("{}: {e}", user_path.display())))?;
        (contents, user_path)
    } else if let Some((_, body)) = builtins().iter().find(|(n, _)| *n == name) {
        (body.to_string(), PathBuf::from(format!("<builtin:{name}>")))
    } else {
        return Err(CoreError::NotFound(name.to_string()));
    };

    let mut bundle: Bundle =
        serde_json::from_str(&contents).map_err(|e| CoreError::ParseError(e.to_string()))?;
    bundle.source_path = source_path;
    validate_bundle(&bundle)?;
    Ok(bundle)
}

/// List bundle names: user bundles first, then builtins not shadowed by a
/// user bundle of the same name.
pub fn list(home: &Path) -> CoreResult<Vec<String>> {
    list_from(&bundles_dir(home))
}

/// Like `list`, but the user-bundle directory is given explicitly.
pub fn list_from(dir: &Path) -> CoreResult<Vec<String>> {
    let mut names = Vec::new();
    if dir.is_dir() {
        let mut entries: Vec<String> = fs::read_dir(&dir)
            .map_err(|e| CoreError::ParseError(e.to_string()))?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                if path.extension().and_then(|s| s.to_str()) == Some("json") {
                    path.file_stem().and_then(|s| s.to_str()).map(String::from)
                } else {
                    None
                }
            })
            .collect();
        entries.sort();
        names.extend(entries);
    }
    for (builtin_name, _) in builtins() {
        if !names.iter().any(|n| n == builtin_name) {
            names.push(builtin_name.to_string());
        }
    }
    Ok(names)
}
