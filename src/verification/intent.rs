//! Intent cross-checks against the classify-time decision
//!
//! The ambiguity check is a filler-word ratio. It is coarse and is the
//! first candidate for replacement by a learned check.

use super::{Layer, VerificationContext, VerificationInput, VerificationResult, Verifier};
use crate::features::lexicon;
use crate::types::Semantics;

const MIN_WORDS_FOR_AMBIGUITY: usize = 2;
const WARNING_PENALTY: f64 = 0.7;

pub struct IntentVerifier;

/// Share of words that carry no referent
pub fn filler_ratio(words: &[String]) -> f64 {
    if words.is_empty() {
        return 0.0;
    }
    let filler = words.iter().filter(|w| lexicon::contains(lexicon::FILLER_WORDS, w)).count();
    filler as f64 / words.len() as f64
}

impl Verifier for IntentVerifier {
    fn layer(&self) -> Layer {
        Layer::Intent
    }

    fn verify(&self, input: &VerificationInput, ctx: &VerificationContext) -> VerificationResult {
        let features = &input.features;
        let semantics = input.classification.semantics;
        let words = &features.lexical.words;

        let mut failures = Vec::new();
        let mut warnings = Vec::new();

        if input.confidence < ctx.intent_min_confidence {
            warnings.push(format!(
                "classification confidence {:.2} is below {:.2}",
                input.confidence, ctx.intent_min_confidence
            ));
        }

        if semantics == Semantics::Execute {
            if features.syntactic.is_interrogative {
                warnings.push("question classified as execute".to_string());
            }
            if !features.domain.immediate_read_verbs.is_empty() && features.domain.file_operation_verbs.is_empty() {
                warnings.push(format!(
                    "read wording ({}) classified as execute",
                    features.domain.immediate_read_verbs.join(", ")
                ));
            }
        }

        if semantics == Semantics::Read {
            let destructive: Vec<&str> = words
                .iter()
                .filter(|w| lexicon::contains(lexicon::DESTRUCTIVE_WORDS, w))
                .map(String::as_str)
                .collect();
            if !destructive.is_empty() {
                failures.push(format!("destructive wording ({}) classified as read", destructive.join(", ")));
            }
        }

        let ratio = filler_ratio(words);
        if words.len() >= MIN_WORDS_FOR_AMBIGUITY && ratio > ctx.ambiguity_threshold {
            failures.push(format!(
                "ambiguous: {:.0}% of words are filler (limit {:.0}%)",
                ratio * 100.0,
                ctx.ambiguity_threshold * 100.0
            ));
        }

        let mut confidence = input.confidence.clamp(0.0, 1.0);
        if !warnings.is_empty() {
            confidence *= WARNING_PENALTY;
        }
        let details = format!("filler ratio {:.2}", ratio);

        if !failures.is_empty() {
            failures.extend(warnings);
            VerificationResult::fail(Layer::Intent, failures, confidence, details)
        } else if !warnings.is_empty() {
            VerificationResult::warn(Layer::Intent, warnings, confidence, details)
        } else {
            VerificationResult::pass(Layer::Intent, confidence, details)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::test_support::{context, input};
    use tempfile::tempdir;

    fn run(directive: &str, triple: &str, confidence: f64) -> VerificationResult {
        let dir = tempdir().unwrap();
        IntentVerifier.verify(&input(directive, triple, confidence), &context(dir.path()))
    }

    #[test]
    fn test_confident_read_passes() {
        let result = run("show memory usage", "stream/human/read", 0.8);
        assert!(result.passed);
        assert!(result.issues.is_empty());
        assert!((result.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_low_confidence_warns() {
        let result = run("show memory usage", "stream/human/read", 0.2);
        assert!(result.passed);
        assert_eq!(result.issues.len(), 1);
        assert!(result.confidence < 0.2);
    }

    #[test]
    fn test_destructive_read_fails() {
        let result = run("delete the old logs", "stream/human/read", 0.9);
        assert!(!result.passed);
    }

    #[test]
    fn test_filler_heavy_directive_is_ambiguous() {
        let result = run("do that thing with this stuff", "stream/human/interpret", 0.9);
        assert!(!result.passed);
        assert!(result.issues[0].starts_with("ambiguous"));
        assert!(run("fix it", "stream/human/interpret", 0.9).passed);
    }

    #[test]
    fn test_filler_ratio() {
        let words: Vec<String> = ["move", "it", "there"].iter().map(|s| s.to_string()).collect();
        assert!((filler_ratio(&words) - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(filler_ratio(&[]), 0.0);
    }
}
