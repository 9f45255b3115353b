//! Side-effect prediction for mutating operations

use regex::Regex;
use std::sync::LazyLock;

use super::{Layer, VerificationContext, VerificationInput, VerificationResult, Verifier};
use crate::execution::{ExecutionPlan, FileAction};
use crate::features::lexicon;

static RESOURCE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?:^|\s)-[a-zA-Z]*[rR][a-zA-Z]*(?:\s|$)|--recursive", "recursive operation"),
        (r"\bfind\s+/(?:\s|$)", "filesystem-wide search"),
        (r"\bdu\s+(?:-\S+\s+)*/(?:\s|$)", "filesystem-wide size scan"),
        (r"\*\*|/\*", "wide glob"),
        (r"\bwhile\s+(?:true|:)|\bfor\s*\(\(\s*;\s*;", "unbounded loop"),
        (r"/dev/(?:zero|urandom|random)", "unbounded input stream"),
        (r"\b(?:tar|zip|gzip|xz|bzip2)\b", "archive or compression"),
        (r"\b(?:make|cargo\s+build|npm\s+install|docker\s+build)\b", "build step"),
        (r"\byes\b", "infinite output"),
    ]
    .into_iter()
    .map(|(p, label)| (Regex::new(p).unwrap(), label))
    .collect()
});

static NETWORK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:curl|wget|ssh|scp|sftp|rsync|nc|netcat|ncat|ftp|telnet|ping|nmap|dig|nslookup)\b|https?://")
        .unwrap()
});

pub struct BehavioralVerifier;

impl Verifier for BehavioralVerifier {
    fn layer(&self) -> Layer {
        Layer::Behavioral
    }

    fn verify(&self, input: &VerificationInput, ctx: &VerificationContext) -> VerificationResult {
        if input.classification.is_pure_read() {
            return VerificationResult::skip(Layer::Behavioral, "skipped for read-only operation");
        }

        let mut failures = Vec::new();
        let mut warnings = Vec::new();
        let mut notes = Vec::new();

        match &input.plan {
            Ok(ExecutionPlan::File(action)) => check_file(action, ctx, &mut failures, &mut notes),
            Ok(ExecutionPlan::Process { command }) => {
                check_command(command, ctx, &mut failures, &mut warnings, &mut notes)
            }
            Ok(plan) => notes.push(format!("no side effects predicted for {} executor", plan.kind())),
            Err(_) => notes.push("no executable form".to_string()),
        }

        let issue_count = failures.len() + warnings.len();
        let confidence = (1.0 - 0.1 * issue_count as f64).max(0.3);
        let details = notes.join("; ");

        if !failures.is_empty() {
            failures.extend(warnings);
            VerificationResult::fail(Layer::Behavioral, failures, confidence, details)
        } else if !warnings.is_empty() {
            VerificationResult::warn(Layer::Behavioral, warnings, confidence, details)
        } else {
            VerificationResult::pass(Layer::Behavioral, confidence, details)
        }
    }
}

fn check_file(action: &FileAction, ctx: &VerificationContext, failures: &mut Vec<String>, notes: &mut Vec<String>) {
    let path = ctx.resolve(action.path());
    let Ok(meta) = std::fs::metadata(&path) else {
        notes.push(format!("no backup needed: {} does not exist", path.display()));
        return;
    };

    if matches!(action, FileAction::Touch { .. }) {
        notes.push(format!("{} already exists, nothing changes", path.display()));
        return;
    }
    if !ctx.backup_available {
        failures.push(format!(
            "{} of {} needs a backup but backups are unavailable",
            action.verb(),
            path.display()
        ));
    } else if meta.len() > ctx.max_backup_bytes {
        failures.push(format!(
            "{} is {} bytes, too large to back up before {}",
            path.display(),
            meta.len(),
            action.verb()
        ));
    } else {
        notes.push(format!("backup of {} will be taken first", path.display()));
    }
}

fn check_command(
    command: &str,
    ctx: &VerificationContext,
    failures: &mut Vec<String>,
    warnings: &mut Vec<String>,
    notes: &mut Vec<String>,
) {
    let lower = command.to_lowercase();
    let destructive: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || matches!(c, ';' | '|' | '&'))
        .filter(|w| lexicon::contains(lexicon::DESTRUCTIVE_WORDS, w))
        .collect();
    if !destructive.is_empty() {
        if ctx.backup_available {
            notes.push(format!("destructive command ({}), named files are backed up first", destructive.join(", ")));
        } else {
            failures.push(format!(
                "destructive command ({}) but backups are unavailable",
                destructive.join(", ")
            ));
        }
    }

    let resource: Vec<&str> = RESOURCE_PATTERNS
        .iter()
        .filter(|(re, _)| re.is_match(&lower))
        .map(|(_, label)| *label)
        .collect();
    if resource.len() > ctx.resource_threshold {
        failures.push(format!("resource-intensive: {}", resource.join(", ")));
    } else if !resource.is_empty() {
        warnings.push(format!("may be resource-intensive: {}", resource.join(", ")));
    }

    if NETWORK_RE.is_match(&lower) {
        if ctx.allow_network {
            notes.push("network access allowed by policy".to_string());
        } else {
            failures.push("command accesses the network, which policy disallows".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::test_support::{context, input};
    use tempfile::tempdir;

    #[test]
    fn test_skipped_for_reads() {
        let dir = tempdir().unwrap();
        let result = BehavioralVerifier.verify(&input("show memory usage", "stream/human/read", 0.8), &context(dir.path()));
        assert!(result.passed);
        assert!(result.skipped);
    }

    #[test]
    fn test_absent_file_needs_no_backup() {
        let dir = tempdir().unwrap();
        let result = BehavioralVerifier.verify(
            &input("write notes.txt with 'hello'", "file/human/execute", 0.8),
            &context(dir.path()),
        );
        assert!(result.passed);
        assert!(result.details.contains("no backup needed"));
    }

    #[test]
    fn test_overwrite_without_backups_fails() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "old").unwrap();
        let ctx = context(dir.path()).with_backups(false, 1024);
        let result = BehavioralVerifier.verify(&input("delete notes.txt", "file/human/execute", 0.8), &ctx);
        assert!(!result.passed);

        let ctx = context(dir.path()).with_backups(true, 1);
        let result = BehavioralVerifier.verify(&input("delete notes.txt", "file/human/execute", 0.8), &ctx);
        assert!(!result.passed);
        assert!(result.issues[0].contains("too large"));
    }

    #[test]
    fn test_network_gated_by_policy() {
        let dir = tempdir().unwrap();
        let op = input("curl https://example.com", "process/machine/execute", 0.8);
        assert!(!BehavioralVerifier.verify(&op, &context(dir.path())).passed);

        let mut ctx = context(dir.path());
        ctx.allow_network = true;
        assert!(BehavioralVerifier.verify(&op, &ctx).passed);
    }

    #[test]
    fn test_resource_threshold() {
        let dir = tempdir().unwrap();
        let mut ctx = context(dir.path());
        let op = input("tar -czf /tmp/all.tgz /home/* && find / -name x", "process/machine/execute", 0.8);
        let result = BehavioralVerifier.verify(&op, &ctx);
        assert!(result.passed);
        assert!(!result.issues.is_empty());

        ctx.resource_threshold = 1;
        assert!(!BehavioralVerifier.verify(&op, &ctx).passed);
    }
}
