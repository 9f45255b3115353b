//! Five-layer verification
//!
//! Every layer is a pure function of the directive, its classification and
//! a [`VerificationContext`] snapshot. Layers always run in [`Layer::ALL`]
//! order. Syntax is the only hard gate: when it fails nothing else runs.
//! Any other failing layer still lets the rest report.

pub mod behavioral;
pub mod intent;
pub mod safety;
pub mod semantic;
pub mod syntax;

pub use behavioral::BehavioralVerifier;
pub use intent::IntentVerifier;
pub use safety::SafetyVerifier;
pub use semantic::SemanticVerifier;
pub use syntax::SyntaxVerifier;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;
use tracing::debug;

use crate::config::VerificationConfig;
use crate::execution::ExecutionPlan;
use crate::features::FeatureRecord;
use crate::types::Classification;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Syntax,
    Semantic,
    Behavioral,
    Safety,
    Intent,
}

impl Layer {
    pub const ALL: [Layer; 5] = [
        Layer::Syntax,
        Layer::Semantic,
        Layer::Behavioral,
        Layer::Safety,
        Layer::Intent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Syntax => "syntax",
            Layer::Semantic => "semantic",
            Layer::Behavioral => "behavioral",
            Layer::Safety => "safety",
            Layer::Intent => "intent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.as_str() == s)
    }

    pub fn position(&self) -> usize {
        Self::ALL.iter().position(|l| l == self).unwrap_or(0)
    }

    /// Share of the overall confidence
    pub fn weight(&self) -> f64 {
        match self {
            Layer::Syntax => 0.15,
            Layer::Semantic => 0.20,
            Layer::Behavioral => 0.20,
            Layer::Safety => 0.25,
            Layer::Intent => 0.20,
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How hard the Safety layer leans on warnings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyLevel {
    Permissive,
    #[default]
    Standard,
    Strict,
}

impl SafetyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyLevel::Permissive => "permissive",
            SafetyLevel::Standard => "standard",
            SafetyLevel::Strict => "strict",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub layer: Layer,
    pub passed: bool,
    /// The layer did not apply and counts as passed
    pub skipped: bool,
    pub confidence: f64,
    pub issues: Vec<String>,
    pub details: String,
    pub duration_ms: u64,
}

impl VerificationResult {
    pub fn pass(layer: Layer, confidence: f64, details: impl Into<String>) -> Self {
        Self {
            layer,
            passed: true,
            skipped: false,
            confidence: confidence.clamp(0.0, 1.0),
            issues: Vec::new(),
            details: details.into(),
            duration_ms: 0,
        }
    }

    /// Passed, but with issues worth showing
    pub fn warn(layer: Layer, issues: Vec<String>, confidence: f64, details: impl Into<String>) -> Self {
        Self {
            issues,
            ..Self::pass(layer, confidence, details)
        }
    }

    pub fn fail(layer: Layer, issues: Vec<String>, confidence: f64, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            issues,
            ..Self::pass(layer, confidence, details)
        }
    }

    pub fn skip(layer: Layer, details: impl Into<String>) -> Self {
        Self {
            skipped: true,
            ..Self::pass(layer, 1.0, details)
        }
    }
}

/// What gets verified
#[derive(Debug, Clone)]
pub struct VerificationInput {
    pub directive: String,
    pub classification: Classification,
    /// Classifier confidence recorded at classify time
    pub confidence: f64,
    pub features: FeatureRecord,
    /// Executor plan, or why none could be derived
    pub plan: Result<ExecutionPlan, String>,
}

impl VerificationInput {
    pub fn new(directive: &str, classification: Classification, confidence: f64, features: FeatureRecord) -> Self {
        Self {
            directive: directive.to_string(),
            classification,
            confidence,
            plan: ExecutionPlan::build(directive, &classification),
            features,
        }
    }
}

/// Environment the layers check against, captured once per run
#[derive(Debug, Clone)]
pub struct VerificationContext {
    pub requester: String,
    pub working_dir: PathBuf,
    pub env_vars: HashSet<String>,
    pub path_dirs: Vec<PathBuf>,
    pub safety_level: SafetyLevel,
    pub allow_network: bool,
    pub backup_available: bool,
    pub max_backup_bytes: u64,
    /// Execute operations by this requester inside the rate window
    pub recent_execute_count: u32,
    pub rate_limit_max: u32,
    pub rate_limit_window_secs: u64,
    pub intent_min_confidence: f64,
    pub ambiguity_threshold: f64,
    pub resource_threshold: usize,
}

impl VerificationContext {
    pub fn new(config: &VerificationConfig, requester: &str, working_dir: PathBuf) -> Self {
        Self {
            requester: requester.to_string(),
            working_dir,
            env_vars: std::env::vars_os()
                .map(|(k, _)| k.to_string_lossy().to_string())
                .collect(),
            path_dirs: std::env::var_os("PATH")
                .map(|p| std::env::split_paths(&p).collect())
                .unwrap_or_default(),
            safety_level: config.safety_level,
            allow_network: config.allow_network,
            backup_available: true,
            max_backup_bytes: u64::MAX,
            recent_execute_count: 0,
            rate_limit_max: config.rate_limit_max,
            rate_limit_window_secs: config.rate_limit_window_secs,
            intent_min_confidence: config.intent_min_confidence,
            ambiguity_threshold: config.ambiguity_threshold,
            resource_threshold: config.resource_threshold,
        }
    }

    pub fn with_backups(mut self, available: bool, max_bytes: u64) -> Self {
        self.backup_available = available;
        self.max_backup_bytes = max_bytes;
        self
    }

    pub fn with_recent_executes(mut self, count: u32) -> Self {
        self.recent_execute_count = count;
        self
    }

    pub fn resolve(&self, raw: &str) -> PathBuf {
        crate::execution::backup::resolve_path(raw, &self.working_dir)
    }

    /// Whether `name` resolves to something runnable
    pub fn command_exists(&self, name: &str) -> bool {
        if name.contains('/') {
            return self.resolve(name).is_file();
        }
        SHELL_BUILTINS.contains(&name) || self.path_dirs.iter().any(|d| d.join(name).is_file())
    }
}

const SHELL_BUILTINS: &[&str] = &[
    "cd", "echo", "export", "set", "unset", "exit", "true", "false", "test", "[", "read", "type",
    "alias", "source", ".", "pwd", "printf", "kill", "wait", "umask", "exec", "eval", "shift",
];

pub trait Verifier: Send + Sync {
    fn layer(&self) -> Layer;

    fn verify(&self, input: &VerificationInput, ctx: &VerificationContext) -> VerificationResult;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub results: Vec<VerificationResult>,
    pub passed: bool,
    pub confidence: f64,
}

impl VerificationReport {
    fn from_results(results: Vec<VerificationResult>) -> Self {
        let passed = results.len() == Layer::ALL.len() && results.iter().all(|r| r.passed);
        let total_weight: f64 = results.iter().map(|r| r.layer.weight()).sum();
        let confidence = if total_weight > 0.0 {
            results.iter().map(|r| r.confidence * r.layer.weight()).sum::<f64>() / total_weight
        } else {
            0.0
        };
        Self {
            results,
            passed,
            confidence,
        }
    }

    /// Issues of every layer prefixed with the layer name
    pub fn issues(&self) -> Vec<String> {
        self.results
            .iter()
            .flat_map(|r| r.issues.iter().map(move |i| format!("{}: {}", r.layer, i)))
            .collect()
    }

    /// Issues of the layers that failed
    pub fn failures(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .flat_map(|r| r.issues.iter().map(move |i| format!("{}: {}", r.layer, i)))
            .collect()
    }

    pub fn result(&self, layer: Layer) -> Option<&VerificationResult> {
        self.results.iter().find(|r| r.layer == layer)
    }

    /// Per-layer merge of child reports for a composite operation. A layer
    /// passes only when it passed for every child.
    pub fn aggregate(children: &[VerificationReport]) -> Self {
        let mut results = Vec::new();
        for layer in Layer::ALL {
            let per_child: Vec<&VerificationResult> =
                children.iter().filter_map(|c| c.result(layer)).collect();
            if per_child.is_empty() {
                continue;
            }
            let mut issues = Vec::new();
            for (i, r) in per_child.iter().enumerate() {
                issues.extend(r.issues.iter().map(|issue| format!("step {}: {}", i + 1, issue)));
            }
            let confidence = per_child.iter().map(|r| r.confidence).fold(1.0_f64, f64::min);
            results.push(VerificationResult {
                layer,
                passed: per_child.len() == children.len() && per_child.iter().all(|r| r.passed),
                skipped: per_child.iter().all(|r| r.skipped),
                confidence,
                issues,
                details: format!("aggregated over {} step(s)", children.len()),
                duration_ms: per_child.iter().map(|r| r.duration_ms).sum(),
            });
        }
        Self::from_results(results)
    }
}

pub struct VerificationEngine {
    layers: Vec<Box<dyn Verifier>>,
}

impl VerificationEngine {
    pub fn new() -> Self {
        Self {
            layers: vec![
                Box::new(SyntaxVerifier),
                Box::new(SemanticVerifier),
                Box::new(BehavioralVerifier),
                Box::new(SafetyVerifier),
                Box::new(IntentVerifier),
            ],
        }
    }

    pub fn verify(&self, input: &VerificationInput, ctx: &VerificationContext) -> VerificationReport {
        let mut results = Vec::with_capacity(self.layers.len());
        for verifier in &self.layers {
            let start = Instant::now();
            let mut result = verifier.verify(input, ctx);
            result.duration_ms = start.elapsed().as_millis() as u64;

            debug!(
                layer = %result.layer,
                passed = result.passed,
                skipped = result.skipped,
                issues = result.issues.len(),
                "Verification layer finished"
            );

            let gate_closed = result.layer == Layer::Syntax && !result.passed;
            results.push(result);
            if gate_closed {
                break;
            }
        }
        VerificationReport::from_results(results)
    }
}

impl Default for VerificationEngine {
    fn default() -> Self {
        Self::new()
    }
}
