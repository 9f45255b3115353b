//! Structural checks, and the only layer that stops the others

use super::{Layer, VerificationContext, VerificationInput, VerificationResult, Verifier};
use crate::execution::{interpreter, ExecutionPlan, FileAction};

const MIN_CHARS: usize = 2;
const MAX_CHARS: usize = 8192;
const MAX_REPEAT_RUN: usize = 10;

const DANGLING_OPERATORS: &[&str] = &["|", "||", "&&", ";", ">", ">>", "<"];

pub struct SyntaxVerifier;

impl Verifier for SyntaxVerifier {
    fn layer(&self) -> Layer {
        Layer::Syntax
    }

    fn verify(&self, input: &VerificationInput, _ctx: &VerificationContext) -> VerificationResult {
        let text = input.directive.trim();
        let chars = text.chars().count();

        if text.is_empty() {
            return VerificationResult::fail(Layer::Syntax, vec!["directive is empty".into()], 1.0, "");
        }

        let mut issues = Vec::new();
        if chars < MIN_CHARS {
            issues.push(format!("directive is shorter than {} characters", MIN_CHARS));
        }
        if chars > MAX_CHARS {
            issues.push(format!("directive is longer than {} characters", MAX_CHARS));
        }
        if text.chars().any(|c| c.is_control() && !matches!(c, '\n' | '\t' | '\r')) {
            issues.push("directive contains control characters".into());
        }
        if let Some(c) = repeated_run(text, MAX_REPEAT_RUN) {
            issues.push(format!("directive repeats '{}' {} or more times in a row", c, MAX_REPEAT_RUN));
        }

        let details = match &input.plan {
            Err(reason) => {
                issues.push(reason.clone());
                "no executable form".to_string()
            }
            Ok(plan) => {
                issues.extend(check_plan(plan));
                format!("{} plan", plan.kind())
            }
        };

        if issues.is_empty() {
            let words = text.split_whitespace().count() as f64;
            VerificationResult::pass(Layer::Syntax, (0.5 + 0.1 * words).min(1.0), details)
        } else {
            VerificationResult::fail(Layer::Syntax, issues, 1.0, details)
        }
    }
}

fn check_plan(plan: &ExecutionPlan) -> Vec<String> {
    match plan {
        ExecutionPlan::Passthrough { .. } => Vec::new(),
        ExecutionPlan::Process { command } => check_command(command),
        ExecutionPlan::Interpreter { script } => interpreter::compile_check(script).err().into_iter().collect(),
        ExecutionPlan::File(action) => check_file_action(action),
    }
}

fn check_command(command: &str) -> Vec<String> {
    let words = match shell_words::split(command) {
        Ok(words) => words,
        Err(e) => return vec![format!("command does not parse: {}", e)],
    };
    let Some(first) = words.first() else {
        return vec!["command is empty".into()];
    };

    let mut issues = Vec::new();
    if DANGLING_OPERATORS.contains(&first.as_str()) {
        issues.push(format!("command starts with operator '{}'", first));
    }
    if let Some(last) = words.last().filter(|w| DANGLING_OPERATORS.contains(&w.as_str())) {
        issues.push(format!("command ends with operator '{}'", last));
    }
    let open = command.matches("$(").count();
    let close = command.matches(')').count();
    if open > close {
        issues.push("unclosed command substitution".into());
    }
    issues
}

fn check_file_action(action: &FileAction) -> Vec<String> {
    let path = action.path();
    let mut issues = Vec::new();
    if path.is_empty() {
        issues.push("file path is empty".into());
    }
    if path.contains('\0') {
        issues.push("file path contains a NUL byte".into());
    }
    if path.contains("//") {
        issues.push(format!("file path '{}' has an empty component", path));
    }
    if path.len() > 1 && path.ends_with('/') {
        issues.push(format!("file path '{}' names a directory", path));
    }
    issues
}

/// First char repeated `min` or more times in a row, ignoring whitespace
fn repeated_run(text: &str, min: usize) -> Option<char> {
    let mut prev = None;
    let mut run = 0;
    for c in text.chars() {
        if Some(c) == prev {
            run += 1;
        } else {
            prev = Some(c);
            run = 1;
        }
        if run >= min && !c.is_whitespace() {
            return Some(c);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::test_support::{context, input};
    use tempfile::tempdir;

    fn run(directive: &str, triple: &str) -> VerificationResult {
        let dir = tempdir().unwrap();
        SyntaxVerifier.verify(&input(directive, triple, 0.8), &context(dir.path()))
    }

    #[test]
    fn test_plain_read_passes() {
        let result = run("show memory usage", "stream/human/read");
        assert!(result.passed);
        assert!((result.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_length_and_content_checks() {
        assert!(!run("x", "stream/human/read").passed);
        assert!(!run(&"a ".repeat(5000), "stream/human/read").passed);
        assert!(!run("show\u{7}bell", "stream/human/read").passed);
        assert!(!run("aaaaaaaaaaaa", "stream/human/read").passed);
    }

    #[test]
    fn test_shell_grammar() {
        assert!(run("ls -la | grep foo", "process/machine/read").passed);
        assert!(!run("echo 'unterminated", "process/machine/execute").passed);
        assert!(!run("ls -la |", "process/machine/read").passed);
    }

    #[test]
    fn test_script_must_compile() {
        assert!(run("evaluate `40 + 2`", "stream/machine/interpret").passed);
        assert!(!run("evaluate `let = ;`", "stream/machine/interpret").passed);
    }

    #[test]
    fn test_file_plan_must_parse() {
        assert!(run("write notes.txt with hello", "file/human/execute").passed);
        let result = run("write somewhere", "file/human/execute");
        assert!(!result.passed);
        assert!(result.issues[0].contains("no file action"));
        assert!(!run("write notes//a.txt with hi", "file/human/execute").passed);
    }

    #[test]
    fn test_repeated_run_ignores_spaces() {
        assert_eq!(repeated_run("a          b", 10), None);
        assert_eq!(repeated_run("==========", 10), Some('='));
    }
}
