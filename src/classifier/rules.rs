//! Additive rule classifier
//!
//! Every axis is scored independently. A candidate's score is the number of
//! its indicators that matched times a fixed increment, capped at 1.0.
//! Ties and empty matches fall back to stream, human and interpret.

use crate::config::ClassifierConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::features::lexicon::{self, contains};
use crate::features::{ExtensionCategory, FeatureRecord};
use crate::types::{
    Alternative, Axis, AxisReasoning, Classification, ClassificationReasoning, Consumer,
    Destination, Semantics,
};

use super::{ClassificationOutcome, Classifier};

struct Rule {
    label: &'static str,
    check: fn(&FeatureRecord) -> bool,
}

fn has(f: &FeatureRecord, table: &[&str]) -> bool {
    f.lexical.words.iter().any(|w| contains(table, w))
}

fn mutating_shell(f: &FeatureRecord) -> bool {
    f.domain
        .shell_command
        .as_deref()
        .is_some_and(|c| !contains(lexicon::READ_ONLY_COMMANDS, c))
}

const STREAM_RULES: &[Rule] = &[
    Rule { label: "read verb", check: |f| !f.domain.immediate_read_verbs.is_empty() },
    Rule { label: "question", check: |f| f.syntactic.is_interrogative },
    Rule { label: "explanation request", check: |f| has(f, lexicon::EXPLANATION_WORDS) },
    Rule {
        label: "no side-effect target",
        check: |f| {
            f.domain.file_operation_verbs.is_empty()
                && !f.domain.looks_like_shell
                && !has(f, lexicon::PROCESS_VERBS)
        },
    },
];

const FILE_RULES: &[Rule] = &[
    Rule { label: "file operation verb", check: |f| !f.domain.file_operation_verbs.is_empty() },
    Rule {
        label: "file path argument",
        check: |f| !f.lexical.paths.is_empty() && f.domain.immediate_read_verbs.is_empty(),
    },
    Rule {
        label: "file extension",
        check: |f| f.lexical.file_extension.is_some() && f.domain.immediate_read_verbs.is_empty(),
    },
];

const PROCESS_RULES: &[Rule] = &[
    Rule { label: "shell command", check: |f| f.domain.shell_command.is_some() },
    Rule { label: "shell operators", check: |f| f.domain.has_shell_operators },
    Rule { label: "process verb", check: |f| has(f, lexicon::PROCESS_VERBS) },
    Rule { label: "pipe or redirect", check: |f| f.syntactic.has_pipe || f.syntactic.has_redirect },
];

const HUMAN_RULES: &[Rule] = &[
    Rule { label: "display verb", check: |f| has(f, lexicon::DISPLAY_WORDS) },
    Rule { label: "question", check: |f| f.syntactic.is_interrogative },
    Rule {
        label: "document target",
        check: |f| f.lexical.extension_category == Some(ExtensionCategory::Document),
    },
    Rule { label: "personal reference", check: |f| has(f, lexicon::PERSONAL_WORDS) },
];

const MACHINE_RULES: &[Rule] = &[
    Rule { label: "shell command", check: |f| f.domain.shell_command.is_some() },
    Rule { label: "command-line syntax", check: |f| f.domain.has_shell_operators },
    Rule { label: "structured format", check: |f| has(f, lexicon::STRUCTURED_FORMAT_WORDS) },
    Rule {
        label: "code or config target",
        check: |f| {
            matches!(
                f.lexical.extension_category,
                Some(ExtensionCategory::Code | ExtensionCategory::Config | ExtensionCategory::Data)
            )
        },
    },
    Rule {
        label: "script language",
        check: |f| !f.domain.code_languages.is_empty() || has(f, lexicon::SCRIPT_WORDS),
    },
];

const READ_RULES: &[Rule] = &[
    Rule { label: "read verb", check: |f| !f.domain.immediate_read_verbs.is_empty() },
    Rule {
        label: "question",
        check: |f| f.syntactic.is_interrogative && !has(f, lexicon::MUTATING_VERBS),
    },
    Rule {
        label: "read-only command",
        check: |f| {
            f.domain
                .shell_command
                .as_deref()
                .is_some_and(|c| contains(lexicon::READ_ONLY_COMMANDS, c))
        },
    },
    Rule { label: "status query", check: |f| has(f, lexicon::STATUS_WORDS) },
];

const INTERPRET_RULES: &[Rule] = &[
    Rule { label: "analysis verb", check: |f| has(f, lexicon::ANALYSIS_VERBS) },
    Rule { label: "expression or script", check: |f| has(f, lexicon::SCRIPT_WORDS) },
    Rule { label: "conditional", check: |f| f.syntactic.has_conditional },
];

const EXECUTE_RULES: &[Rule] = &[
    Rule { label: "mutating verb", check: |f| has(f, lexicon::MUTATING_VERBS) },
    Rule { label: "mutating command", check: mutating_shell },
    Rule { label: "destructive verb", check: |f| has(f, lexicon::DESTRUCTIVE_WORDS) },
    Rule { label: "file operation", check: |f| !f.domain.file_operation_verbs.is_empty() },
];

/// Confidence for `matches` indicators. Monotone in `matches`, capped at 1.0.
pub fn score(matches: usize, increment: f64) -> f64 {
    (matches as f64 * increment).clamp(0.0, 1.0)
}

struct AxisOutcome<C> {
    winner: C,
    reasoning: AxisReasoning,
    alternatives: Vec<Alternative>,
}

pub struct RuleClassifier {
    increment: f64,
    discount: f64,
}

impl RuleClassifier {
    pub fn new(increment: f64, discount: f64) -> Self {
        Self {
            increment: increment.max(0.0),
            discount: discount.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &ClassifierConfig) -> Self {
        Self::new(config.increment, config.alternative_discount)
    }

    fn score_axis<C>(
        &self,
        axis: Axis,
        table: &[(C, &[Rule])],
        default: C,
        features: &FeatureRecord,
    ) -> AxisOutcome<C>
    where
        C: Copy + PartialEq + std::fmt::Display,
    {
        let scored: Vec<(C, f64, Vec<String>)> = table
            .iter()
            .map(|(candidate, rules)| {
                let matched: Vec<String> = rules
                    .iter()
                    .filter(|r| (r.check)(features))
                    .map(|r| r.label.to_string())
                    .collect();
                (*candidate, score(matched.len(), self.increment), matched)
            })
            .collect();

        let best = scored.iter().map(|(_, s, _)| *s).fold(0.0, f64::max);
        let top: Vec<&(C, f64, Vec<String>)> = scored
            .iter()
            .filter(|(_, s, _)| best > 0.0 && (s - best).abs() < f64::EPSILON)
            .collect();

        let (winner, indicators, explanation) = match top.as_slice() {
            [] => (
                default,
                Vec::new(),
                format!("no {} indicators matched; defaulting to {}", axis, default),
            ),
            [(candidate, _, matched)] => (
                *candidate,
                matched.clone(),
                format!("{} chosen from: {}", candidate, matched.join(", ")),
            ),
            tied => {
                let names: Vec<String> = tied.iter().map(|(c, _, _)| c.to_string()).collect();
                let indicators = tied
                    .iter()
                    .find(|(c, _, _)| *c == default)
                    .map(|(_, _, m)| m.clone())
                    .unwrap_or_default();
                (
                    default,
                    indicators,
                    format!("tie between {}; defaulting to {}", names.join(" and "), default),
                )
            }
        };

        let alternatives = scored
            .iter()
            .filter(|(c, s, _)| *c != winner && *s > 0.0)
            .map(|(c, s, _)| Alternative {
                axis,
                candidate: c.to_string(),
                confidence: s * self.discount,
            })
            .collect();

        AxisOutcome {
            winner,
            reasoning: AxisReasoning {
                indicators,
                confidence: best,
                explanation,
            },
            alternatives,
        }
    }
}

impl Default for RuleClassifier {
    fn default() -> Self {
        Self::from_config(&ClassifierConfig::default())
    }
}

impl Classifier for RuleClassifier {
    fn name(&self) -> &str {
        "rules"
    }

    fn classify(&self, features: &FeatureRecord) -> PipelineResult<ClassificationOutcome> {
        if features.is_empty() {
            return Err(PipelineError::Classification(
                "directive has no tokens to classify".to_string(),
            ));
        }

        let destination = self.score_axis(
            Axis::Destination,
            &[
                (Destination::Stream, STREAM_RULES),
                (Destination::File, FILE_RULES),
                (Destination::Process, PROCESS_RULES),
            ],
            Destination::Stream,
            features,
        );
        let consumer = self.score_axis(
            Axis::Consumer,
            &[(Consumer::Human, HUMAN_RULES), (Consumer::Machine, MACHINE_RULES)],
            Consumer::Human,
            features,
        );
        let semantics = self.score_axis(
            Axis::Semantics,
            &[
                (Semantics::Read, READ_RULES),
                (Semantics::Interpret, INTERPRET_RULES),
                (Semantics::Execute, EXECUTE_RULES),
            ],
            Semantics::Interpret,
            features,
        );

        let confidence = (destination.reasoning.confidence
            + consumer.reasoning.confidence
            + semantics.reasoning.confidence)
            / 3.0;

        let mut alternatives = destination.alternatives;
        alternatives.extend(consumer.alternatives);
        alternatives.extend(semantics.alternatives);

        Ok(ClassificationOutcome {
            classification: Classification::new(destination.winner, consumer.winner, semantics.winner),
            confidence,
            reasoning: ClassificationReasoning {
                destination: destination.reasoning,
                consumer: consumer.reasoning,
                semantics: semantics.reasoning,
                alternatives,
                strategy: self.name().to_string(),
                corrected_from: None,
            },
        })
    }
}
