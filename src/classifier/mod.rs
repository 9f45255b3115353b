//! Classification of feature bundles into the three-axis triple
//!
//! Downstream components only see [`Classifier`]. The rule engine is one
//! variant of [`ClassifierStrategy`]; a learned model plugs in as
//! [`ClassifierStrategy::External`] without touching verification or
//! execution.

pub mod rules;

pub use rules::RuleClassifier;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{ClassifierConfig, StrategyKind};
use crate::error::PipelineResult;
use crate::features::FeatureRecord;
use crate::types::{Classification, ClassificationReasoning};

/// Result of one classification pass
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationOutcome {
    pub classification: Classification,
    /// Mean of the three axis confidences
    pub confidence: f64,
    pub reasoning: ClassificationReasoning,
}

impl ClassificationOutcome {
    /// Override with a requester's prior correction, keeping the original
    /// triple in the reasoning
    pub fn corrected(mut self, corrected: Classification) -> Self {
        if corrected == self.classification {
            return self;
        }
        self.reasoning.corrected_from = Some(self.classification);
        self.classification = corrected;
        self.confidence = 1.0;
        self
    }
}

pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    fn classify(&self, features: &FeatureRecord) -> PipelineResult<ClassificationOutcome>;
}

/// Selected classifier implementation
pub enum ClassifierStrategy {
    Rules(RuleClassifier),
    External(Arc<dyn Classifier>),
}

impl ClassifierStrategy {
    pub fn from_config(config: &ClassifierConfig) -> Self {
        match config.strategy {
            StrategyKind::Rules => ClassifierStrategy::Rules(RuleClassifier::from_config(config)),
        }
    }
}

impl Classifier for ClassifierStrategy {
    fn name(&self) -> &str {
        match self {
            ClassifierStrategy::Rules(c) => c.name(),
            ClassifierStrategy::External(c) => c.name(),
        }
    }

    fn classify(&self, features: &FeatureRecord) -> PipelineResult<ClassificationOutcome> {
        match self {
            ClassifierStrategy::Rules(c) => c.classify(features),
            ClassifierStrategy::External(c) => c.classify(features),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureConfig;
    use crate::features::FeatureExtractor;
    use crate::types::{AxisReasoning, Consumer, Destination, Semantics};

    struct Fixed;

    impl Classifier for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn classify(&self, _features: &FeatureRecord) -> PipelineResult<ClassificationOutcome> {
            Ok(ClassificationOutcome {
                classification: Classification::new(Destination::File, Consumer::Machine, Semantics::Read),
                confidence: 0.8,
                reasoning: ClassificationReasoning {
                    destination: AxisReasoning::default(),
                    consumer: AxisReasoning::default(),
                    semantics: AxisReasoning::default(),
                    alternatives: Vec::new(),
                    strategy: "fixed".to_string(),
                    corrected_from: None,
                },
            })
        }
    }

    #[test]
    fn test_external_strategy_is_used() {
        let strategy = ClassifierStrategy::External(Arc::new(Fixed));
        let features = FeatureExtractor::from_config(&FeatureConfig::default()).extract("anything", None);
        let out = strategy.classify(&features).unwrap();
        assert_eq!(strategy.name(), "fixed");
        assert_eq!(out.classification.to_string(), "file/machine/read");
    }

    #[test]
    fn test_correction_keeps_original() {
        let strategy = ClassifierStrategy::from_config(&ClassifierConfig::default());
        let features = FeatureExtractor::from_config(&FeatureConfig::default()).extract("show memory usage", None);
        let out = strategy.classify(&features).unwrap();
        let original = out.classification;

        let corrected = Classification::new(Destination::Process, Consumer::Human, Semantics::Read);
        let out = out.corrected(corrected);
        assert_eq!(out.classification, corrected);
        assert_eq!(out.reasoning.corrected_from, Some(original));
        assert_eq!(out.confidence, 1.0);
    }
}
