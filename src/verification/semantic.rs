//! Reference checks: commands, environment variables and paths
//!
//! Confidence grows with the number of references that could be checked,
//! so a directive with nothing checkable passes with low confidence.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use super::{Layer, VerificationContext, VerificationInput, VerificationResult, Verifier};
use crate::execution::{ExecutionPlan, FileAction};

static ENV_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").unwrap());

static ASSIGNMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[\s;&|])([A-Za-z_][A-Za-z0-9_]*)=").unwrap());

const SEGMENT_BREAKS: &[&str] = &["|", "||", "&&", ";", "&"];

/// Prefix commands whose argument is the real command
const WRAPPERS: &[&str] = &["sudo", "nohup", "time", "nice", "env", "exec", "xargs"];

pub struct SemanticVerifier;

#[derive(Default)]
struct Findings {
    checks: usize,
    failures: Vec<String>,
    warnings: Vec<String>,
}

impl Verifier for SemanticVerifier {
    fn layer(&self) -> Layer {
        Layer::Semantic
    }

    fn verify(&self, input: &VerificationInput, ctx: &VerificationContext) -> VerificationResult {
        let mut found = Findings::default();

        match &input.plan {
            Ok(ExecutionPlan::Process { command }) => {
                check_commands(command, ctx, &mut found);
                check_env_refs(command, ctx, &mut found);
                check_mentioned_paths(input, ctx, &mut found);
            }
            Ok(ExecutionPlan::File(action)) => check_file_target(action, ctx, &mut found),
            Ok(ExecutionPlan::Passthrough { .. }) => check_mentioned_paths(input, ctx, &mut found),
            Ok(ExecutionPlan::Interpreter { .. }) | Err(_) => {}
        }

        let confidence = if found.checks == 0 {
            0.5
        } else {
            (0.6 + 0.1 * found.checks as f64).min(1.0)
        };
        let details = format!("{} reference(s) checked", found.checks);

        if !found.failures.is_empty() {
            let mut issues = found.failures;
            issues.extend(found.warnings);
            VerificationResult::fail(Layer::Semantic, issues, confidence, details)
        } else if !found.warnings.is_empty() {
            VerificationResult::warn(Layer::Semantic, found.warnings, confidence, details)
        } else {
            VerificationResult::pass(Layer::Semantic, confidence, details)
        }
    }
}

/// Command names at the head of each pipeline or list segment
fn command_heads(command: &str) -> Vec<String> {
    let Ok(words) = shell_words::split(command) else {
        return Vec::new();
    };

    let mut heads = Vec::new();
    let mut expecting = true;
    for word in words {
        if SEGMENT_BREAKS.contains(&word.as_str()) {
            expecting = true;
            continue;
        }
        if !expecting {
            continue;
        }
        if ASSIGNMENT_RE.is_match(&word) || WRAPPERS.contains(&word.as_str()) || word.starts_with('-') {
            continue;
        }
        heads.push(word);
        expecting = false;
    }
    heads
}

fn check_commands(command: &str, ctx: &VerificationContext, found: &mut Findings) {
    let mut seen = HashSet::new();
    for head in command_heads(command) {
        if !seen.insert(head.clone()) {
            continue;
        }
        found.checks += 1;
        if !ctx.command_exists(&head) {
            found.failures.push(format!("command '{}' not found", head));
        }
    }
}

fn check_env_refs(command: &str, ctx: &VerificationContext, found: &mut Findings) {
    let assigned: HashSet<&str> = ASSIGNMENT_RE
        .captures_iter(command)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();

    let mut seen = HashSet::new();
    for cap in ENV_REF_RE.captures_iter(command) {
        let name = &cap[1];
        if assigned.contains(name) || !seen.insert(name.to_string()) {
            continue;
        }
        found.checks += 1;
        if !ctx.env_vars.contains(name) {
            found.failures.push(format!("environment variable '{}' is not set", name));
        }
    }
}

fn check_mentioned_paths(input: &VerificationInput, ctx: &VerificationContext, found: &mut Findings) {
    for raw in &input.features.lexical.paths {
        if raw.contains("..") {
            continue;
        }
        found.checks += 1;
        let path = ctx.resolve(raw);
        if !path.exists() {
            found.warnings.push(format!("{} does not exist", path.display()));
        }
    }
}

fn check_file_target(action: &FileAction, ctx: &VerificationContext, found: &mut Findings) {
    let path = ctx.resolve(action.path());
    found.checks += 1;

    if path.is_dir() {
        found.failures.push(format!("{} is a directory", path.display()));
        return;
    }
    if matches!(action, FileAction::Delete { .. } | FileAction::Read { .. }) {
        if !path.exists() {
            found.failures.push(format!("{} does not exist", path.display()));
        }
        return;
    }
    if action.creates() && !path.exists() {
        found.checks += 1;
        match path.parent() {
            Some(parent) if parent.as_os_str().is_empty() || parent.is_dir() => {}
            Some(parent) => found
                .failures
                .push(format!("parent directory {} does not exist", parent.display())),
            None => found.failures.push(format!("{} has no parent directory", path.display())),
        }
    }
}
