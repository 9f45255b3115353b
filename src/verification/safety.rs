//! Safety policy: blocklists, escalation and injection checks, rate limit
//!
//! Blocked signatures fail at every [`SafetyLevel`]. The other checks get
//! stricter as the level goes up.

use regex::Regex;
use std::sync::LazyLock;

use super::{Layer, SafetyLevel, VerificationContext, VerificationInput, VerificationResult, Verifier};
use crate::execution::ExecutionPlan;
use crate::types::Semantics;

fn compile(patterns: &[(&str, &'static str)]) -> Vec<(Regex, &'static str)> {
    patterns
        .iter()
        .map(|(p, label)| (Regex::new(&format!("(?i){}", p)).unwrap(), *label))
        .collect()
}

/// Catastrophic signatures, never allowed
static BLOCKED: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    compile(&[
        (r"\brm\s+(?:-[a-z]*r[a-z]*|--recursive)(?:\s+-\S+)*\s+(?:/|~|/home|/\*)\s*$", "recursive delete of root or home"),
        (r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&", "fork bomb"),
        (r">\s*/dev/(?:sd[a-z]|nvme\d|hd[a-z])", "direct write to block device"),
        (r"\bdd\s+.*of=/dev/(?:sd[a-z]|nvme\d|hd[a-z])", "dd to block device"),
        (r"\bmkfs", "filesystem creation"),
        (r"\b(?:fdisk|parted|gdisk)\b", "partition manipulation"),
        (r"\bchmod\s+(?:-R\s+)?777\s+/", "chmod 777 on root paths"),
        (r"\bchown\s+-R\s+.*\s+/", "recursive chown on root paths"),
        (r"/etc/(?:passwd|shadow)", "password file access"),
        (r"\b(?:curl|wget)\s+.*\|\s*(?:ba|z)?sh\b", "download piped to shell"),
        (r"\beval\s+.*\$", "eval with variable expansion"),
    ])
});

/// Risky but sometimes legitimate
static DANGEROUS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    compile(&[
        (r"\brm\s+(?:-[a-z]*[rf][a-z]*|--force|--recursive)\b", "forced or recursive delete"),
        (r">>?\s*/etc/", "write to /etc"),
        (r"\bcrontab\b", "cron manipulation"),
        (r"\bsystemctl\s+(?:disable|mask|stop)\b", "service disable or stop"),
        (r"\bkill\s+-9\b", "force kill"),
        (r"\b(?:killall|pkill)\b", "mass process kill"),
        (r"\b(?:reboot|shutdown|poweroff|halt)\b", "system power control"),
        (r"\b(?:iptables|nft|ufw|firewalld)\b", "firewall manipulation"),
        (r"\b(?:useradd|userdel|usermod|groupadd|groupdel|groupmod)\b", "account manipulation"),
        (r"\b(?:visudo|sudoers)\b", "sudo configuration"),
        (r"\bssh-keygen\b.*-f", "ssh key generation"),
    ])
});

static SENSITIVE: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    compile(&[
        (r"\b(?:password|passwd|secret|token|api.?key|credential)s?\b", "sensitive data reference"),
        (r"(?:^|[\s/])\.env\b", "environment file"),
        (r"\.ssh/", "ssh directory"),
        (r"\.gnupg/", "gpg directory"),
        (r"\.aws/", "aws credentials"),
        (r"\.kube/", "kubernetes config"),
    ])
});

static ESCALATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[\s;&|(])(?:sudo|su|doas|pkexec)(?:\s|$)|\bchmod\s+[ugo]*\+s\b|\bchmod\s+[2467]\d{3}\b").unwrap()
});

static NETWORK_TOOL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:curl|wget|ssh|scp|sftp|rsync|nc|netcat|ncat|ftp|telnet|nmap)\b").unwrap()
});

/// Chained-command operators; a plain pipe is allowed
const INJECTION_OPERATORS: &[(&str, &str)] = &[
    (";", "command separator"),
    ("&&", "command chaining"),
    ("||", "command chaining"),
    ("$(", "command substitution"),
    ("`", "command substitution"),
];

pub struct SafetyVerifier;

impl Verifier for SafetyVerifier {
    fn layer(&self) -> Layer {
        Layer::Safety
    }

    fn verify(&self, input: &VerificationInput, ctx: &VerificationContext) -> VerificationResult {
        let level = ctx.safety_level;
        let text = input.directive.as_str();
        let details = format!("safety level {}", level.as_str());

        let blocked: Vec<String> = BLOCKED
            .iter()
            .filter(|(re, _)| re.is_match(text))
            .map(|(_, label)| format!("blocked: {}", label))
            .collect();
        if !blocked.is_empty() {
            return VerificationResult::fail(Layer::Safety, blocked, 1.0, details);
        }

        let mut failures = Vec::new();
        let mut warnings = Vec::new();
        let mut flag = |issue: String, fails: bool| {
            if fails {
                failures.push(issue);
            } else {
                warnings.push(issue);
            }
        };

        if let Ok(ExecutionPlan::Process { command }) = &input.plan {
            let chained = level != SafetyLevel::Permissive;
            if ESCALATION_RE.is_match(command) {
                flag("privilege escalation".to_string(), chained);
            }
            for (op, label) in INJECTION_OPERATORS {
                if command.contains(op) {
                    flag(format!("{} '{}'", label, op), chained);
                }
            }
            if NETWORK_TOOL_RE.is_match(command) && level == SafetyLevel::Strict {
                flag("network tool under strict policy".to_string(), true);
            }
        }

        for (re, label) in DANGEROUS.iter() {
            if re.is_match(text) {
                flag(format!("dangerous: {}", label), level == SafetyLevel::Strict);
            }
        }

        if level != SafetyLevel::Permissive {
            for (re, label) in SENSITIVE.iter() {
                if re.is_match(text) {
                    flag(format!("sensitive: {}", label), level == SafetyLevel::Strict);
                }
            }
        }

        if input.classification.semantics == Semantics::Execute && ctx.recent_execute_count >= ctx.rate_limit_max {
            flag(
                format!(
                    "rate limit: {} execute operations in the last {}s (max {})",
                    ctx.recent_execute_count, ctx.rate_limit_window_secs, ctx.rate_limit_max
                ),
                true,
            );
        }

        if !failures.is_empty() {
            failures.extend(warnings);
            VerificationResult::fail(Layer::Safety, failures, 1.0, details)
        } else if !warnings.is_empty() {
            let confidence = (1.0 - 0.2 * warnings.len() as f64).max(0.3);
            VerificationResult::warn(Layer::Safety, warnings, confidence, details)
        } else {
            VerificationResult::pass(Layer::Safety, 1.0, details)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::test_support::{context, input};
    use tempfile::tempdir;

    fn at(level: SafetyLevel, directive: &str, triple: &str) -> VerificationResult {
        let dir = tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.safety_level = level;
        SafetyVerifier.verify(&input(directive, triple, 0.8), &ctx)
    }

    #[test]
    fn test_root_delete_is_blocked_everywhere() {
        for level in [SafetyLevel::Permissive, SafetyLevel::Standard, SafetyLevel::Strict] {
            let result = at(level, "rm -rf /", "process/machine/execute");
            assert!(!result.passed);
            assert!(result.issues[0].starts_with("blocked"));
        }
        assert!(!at(SafetyLevel::Standard, "cat /etc/shadow", "process/machine/read").passed);
    }

    #[test]
    fn test_benign_pipe_is_allowed() {
        let result = at(SafetyLevel::Standard, "ps aux | grep nginx", "process/machine/read");
        assert!(result.passed, "{:?}", result.issues);
        assert!(result.issues.is_empty());
    }

    #[test]
    fn test_chained_commands_depend_on_level() {
        assert!(!at(SafetyLevel::Standard, "ls; cat notes.txt", "process/machine/execute").passed);
        assert!(!at(SafetyLevel::Standard, "echo $(whoami)", "process/machine/execute").passed);
        let permissive = at(SafetyLevel::Permissive, "ls && pwd", "process/machine/execute");
        assert!(permissive.passed);
        assert!(!permissive.issues.is_empty());
    }

    #[test]
    fn test_privilege_escalation() {
        assert!(!at(SafetyLevel::Standard, "sudo apt-get update", "process/machine/execute").passed);
        assert!(at(SafetyLevel::Permissive, "sudo apt-get update", "process/machine/execute").passed);
    }

    #[test]
    fn test_dangerous_warns_unless_strict() {
        let standard = at(SafetyLevel::Standard, "rm -rf build", "process/machine/execute");
        assert!(standard.passed);
        assert!((standard.confidence - 0.8).abs() < 1e-9);
        assert!(!at(SafetyLevel::Strict, "rm -rf build", "process/machine/execute").passed);
    }

    #[test]
    fn test_sensitive_by_level() {
        let d = "show my api key";
        assert!(at(SafetyLevel::Permissive, d, "stream/human/read").issues.is_empty());
        let standard = at(SafetyLevel::Standard, d, "stream/human/read");
        assert!(standard.passed && !standard.issues.is_empty());
        assert!(!at(SafetyLevel::Strict, d, "stream/human/read").passed);
    }

    #[test]
    fn test_rate_limit_counts_executes_only() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path()).with_recent_executes(60);
        let exec = SafetyVerifier.verify(&input("touch a.txt", "file/human/execute", 0.8), &ctx);
        assert!(!exec.passed);
        assert!(exec.issues.iter().any(|i| i.starts_with("rate limit")));

        let read = SafetyVerifier.verify(&input("show memory usage", "stream/human/read", 0.8), &ctx);
        assert!(read.passed);

        let under = context(dir.path()).with_recent_executes(59);
        assert!(SafetyVerifier.verify(&input("touch a.txt", "file/human/execute", 0.8), &under).passed);
    }
}
