//! Feedback collection
//!
//! Five append-only channels keyed to an operation id. Each event carries
//! an inferred confidence: how much the signal should be trusted when the
//! learning loop weighs it. The latency-based inference is a heuristic and
//! all of its thresholds come from [`FeedbackConfig`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use crate::config::FeedbackConfig;
use crate::error::{FeedbackError, PipelineResult};
use crate::ledger::Ledger;
use crate::types::Classification;

const RATING_CONFIDENCE: f64 = 0.8;
const CORRECTION_CONFIDENCE: f64 = 1.0;
const LONG_TERM_CONFIDENCE: f64 = 0.95;
const BEHAVIORAL_FAST_CONFIDENCE: f64 = 0.9;
const BEHAVIORAL_SLOW_CONFIDENCE: f64 = 0.6;
const ABANDON_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackChannel {
    Rating,
    Correction,
    Approval,
    Behavioral,
    LongTerm,
}

impl FeedbackChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackChannel::Rating => "rating",
            FeedbackChannel::Correction => "correction",
            FeedbackChannel::Approval => "approval",
            FeedbackChannel::Behavioral => "behavioral",
            FeedbackChannel::LongTerm => "long_term",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BehavioralSignal {
    Retry,
    Undo,
    Abandon,
}

impl BehavioralSignal {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "retry" => Some(BehavioralSignal::Retry),
            "undo" => Some(BehavioralSignal::Undo),
            "abandon" => Some(BehavioralSignal::Abandon),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum FeedbackPayload {
    Rating {
        rating: u8,
        #[serde(default)]
        dimensions: BTreeMap<String, u8>,
        #[serde(default)]
        comment: Option<String>,
    },
    Correction {
        system: Classification,
        corrected: Classification,
        #[serde(default)]
        reasoning: Option<String>,
    },
    Approval {
        approved: bool,
        latency_ms: u64,
    },
    Behavioral {
        signal: BehavioralSignal,
        latency_ms: u64,
    },
    LongTerm {
        persisted: bool,
        days: u32,
        #[serde(default)]
        reused: bool,
        #[serde(default)]
        referenced: bool,
    },
}

impl FeedbackPayload {
    pub fn channel(&self) -> FeedbackChannel {
        match self {
            FeedbackPayload::Rating { .. } => FeedbackChannel::Rating,
            FeedbackPayload::Correction { .. } => FeedbackChannel::Correction,
            FeedbackPayload::Approval { .. } => FeedbackChannel::Approval,
            FeedbackPayload::Behavioral { .. } => FeedbackChannel::Behavioral,
            FeedbackPayload::LongTerm { .. } => FeedbackChannel::LongTerm,
        }
    }

    pub fn validate(&self) -> Result<(), FeedbackError> {
        match self {
            FeedbackPayload::Rating { rating, dimensions, .. } => {
                if !(1..=5).contains(rating) {
                    return Err(FeedbackError::InvalidRating(*rating));
                }
                if let Some(bad) = dimensions.values().find(|r| !(1..=5).contains(*r)) {
                    return Err(FeedbackError::InvalidRating(*bad));
                }
                Ok(())
            }
            FeedbackPayload::Correction { system, corrected, .. } if system == corrected => {
                Err(FeedbackError::EmptyCorrection)
            }
            _ => Ok(()),
        }
    }

    /// Trust placed in the event
    pub fn infer_confidence(&self, config: &FeedbackConfig) -> f64 {
        match self {
            FeedbackPayload::Rating { .. } => RATING_CONFIDENCE,
            FeedbackPayload::Correction { .. } => CORRECTION_CONFIDENCE,
            FeedbackPayload::Approval { latency_ms, .. } => {
                if *latency_ms <= config.fast_decision_ms {
                    config.fast_confidence
                } else if *latency_ms >= config.slow_decision_ms {
                    config.slow_confidence
                } else {
                    config.medium_confidence
                }
            }
            FeedbackPayload::Behavioral { signal: BehavioralSignal::Abandon, .. } => ABANDON_CONFIDENCE,
            FeedbackPayload::Behavioral { latency_ms, .. } => {
                if *latency_ms <= config.behavioral_fast_ms {
                    BEHAVIORAL_FAST_CONFIDENCE
                } else {
                    BEHAVIORAL_SLOW_CONFIDENCE
                }
            }
            FeedbackPayload::LongTerm { .. } => LONG_TERM_CONFIDENCE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub id: String,
    pub operation_id: String,
    pub requester: String,
    pub payload: FeedbackPayload,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

/// All channels merged for one operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackSummary {
    pub operation_id: String,
    pub event_count: usize,
    pub avg_rating: Option<f64>,
    pub approvals: u32,
    pub rejections: u32,
    /// approvals / (approvals + rejections + corrections)
    pub approval_rate: Option<f64>,
    pub correction_count: u32,
    pub retry_count: u32,
    pub undo_count: u32,
    pub abandon_count: u32,
    /// Latest long-term persistence report
    pub persisted: Option<bool>,
    /// Mean event confidence
    pub confidence: Option<f64>,
}

impl FeedbackSummary {
    pub fn from_events(operation_id: &str, events: &[FeedbackEvent]) -> Self {
        let mut summary = FeedbackSummary {
            operation_id: operation_id.to_string(),
            event_count: events.len(),
            ..Default::default()
        };

        let mut ratings = Vec::new();
        for event in events {
            match &event.payload {
                FeedbackPayload::Rating { rating, .. } => ratings.push(f64::from(*rating)),
                FeedbackPayload::Correction { .. } => summary.correction_count += 1,
                FeedbackPayload::Approval { approved: true, .. } => summary.approvals += 1,
                FeedbackPayload::Approval { approved: false, .. } => summary.rejections += 1,
                FeedbackPayload::Behavioral { signal, .. } => match signal {
                    BehavioralSignal::Retry => summary.retry_count += 1,
                    BehavioralSignal::Undo => summary.undo_count += 1,
                    BehavioralSignal::Abandon => summary.abandon_count += 1,
                },
                FeedbackPayload::LongTerm { persisted, .. } => summary.persisted = Some(*persisted),
            }
        }

        summary.avg_rating = mean(&ratings);
        let decisions = summary.approvals + summary.rejections + summary.correction_count;
        if decisions > 0 {
            summary.approval_rate = Some(f64::from(summary.approvals) / f64::from(decisions));
        }
        let confidences: Vec<f64> = events.iter().map(|e| e.confidence).collect();
        summary.confidence = mean(&confidences);
        summary
    }
}

pub(crate) fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Validates, scores and appends feedback events
#[derive(Clone)]
pub struct FeedbackCollector {
    ledger: Ledger,
    config: FeedbackConfig,
}

impl FeedbackCollector {
    pub fn new(ledger: Ledger, config: FeedbackConfig) -> Self {
        Self { ledger, config }
    }

    pub async fn record(&self, operation_id: &str, payload: FeedbackPayload) -> PipelineResult<FeedbackEvent> {
        payload.validate()?;
        let op = self
            .ledger
            .get_operation(operation_id)
            .await?
            .ok_or_else(|| FeedbackError::UnknownOperation(operation_id.to_string()))?;

        let event = FeedbackEvent {
            id: uuid::Uuid::new_v4().to_string(),
            operation_id: op.id,
            requester: op.requester,
            confidence: payload.infer_confidence(&self.config),
            payload,
            created_at: Utc::now(),
        };
        self.ledger.insert_feedback(&event).await?;

        info!(
            op_id = %event.operation_id,
            channel = event.payload.channel().as_str(),
            confidence = event.confidence,
            "Feedback recorded"
        );
        Ok(event)
    }

    pub async fn rate(
        &self,
        operation_id: &str,
        rating: u8,
        dimensions: BTreeMap<String, u8>,
        comment: Option<String>,
    ) -> PipelineResult<FeedbackEvent> {
        self.record(operation_id, FeedbackPayload::Rating { rating, dimensions, comment })
            .await
    }

    /// Record the requester's own triple against the one the system chose
    pub async fn correct(
        &self,
        operation_id: &str,
        corrected: Classification,
        reasoning: Option<String>,
    ) -> PipelineResult<FeedbackEvent> {
        let op = self
            .ledger
            .get_operation(operation_id)
            .await?
            .ok_or_else(|| FeedbackError::UnknownOperation(operation_id.to_string()))?;
        let system = op.classification.ok_or(FeedbackError::EmptyCorrection)?;
        let reasoning = reasoning.filter(|r| !r.trim().is_empty());
        self.record(operation_id, FeedbackPayload::Correction { system, corrected, reasoning })
            .await
    }

    pub async fn approval(&self, operation_id: &str, approved: bool, latency_ms: u64) -> PipelineResult<FeedbackEvent> {
        self.record(operation_id, FeedbackPayload::Approval { approved, latency_ms })
            .await
    }

    pub async fn behavioral(
        &self,
        operation_id: &str,
        signal: BehavioralSignal,
        latency_ms: u64,
    ) -> PipelineResult<FeedbackEvent> {
        self.record(operation_id, FeedbackPayload::Behavioral { signal, latency_ms })
            .await
    }

    pub async fn outcome(
        &self,
        operation_id: &str,
        persisted: bool,
        days: u32,
        reused: bool,
        referenced: bool,
    ) -> PipelineResult<FeedbackEvent> {
        self.record(
            operation_id,
            FeedbackPayload::LongTerm {
                persisted,
                days,
                reused,
                referenced,
            },
        )
        .await
    }

    pub async fn summary(&self, operation_id: &str) -> PipelineResult<FeedbackSummary> {
        let events = self.ledger.feedback_for(operation_id).await?;
        Ok(FeedbackSummary::from_events(operation_id, &events))
    }

    /// Newest corrections first, for classifier hints
    pub async fn recent_corrections(&self, requester: &str, limit: usize) -> PipelineResult<Vec<FeedbackEvent>> {
        self.ledger.recent_corrections(requester, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::features::request_hash;
    use crate::types::Operation;

    async fn setup() -> (FeedbackCollector, Operation) {
        let ledger = Ledger::open_in_memory().unwrap();
        let op = Operation::new("show memory usage", "alice", request_hash("show memory usage"));
        ledger.insert_operation(&op, 0).await.unwrap();
        ledger
            .set_classification(&op.id, &Classification::parse("stream/human/read").unwrap(), 0.6)
            .await
            .unwrap();
        (FeedbackCollector::new(ledger, FeedbackConfig::default()), op)
    }

    fn event(payload: FeedbackPayload) -> FeedbackEvent {
        FeedbackEvent {
            id: "e".into(),
            operation_id: "op".into(),
            requester: "alice".into(),
            confidence: payload.infer_confidence(&FeedbackConfig::default()),
            payload,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_latency_drives_approval_confidence() {
        let config = FeedbackConfig::default();
        let at = |ms| FeedbackPayload::Approval { approved: true, latency_ms: ms }.infer_confidence(&config);
        assert_eq!(at(500), 0.9);
        assert_eq!(at(5_000), 0.7);
        assert_eq!(at(60_000), 0.5);
    }

    #[test]
    fn test_behavioral_confidence() {
        let config = FeedbackConfig::default();
        let at = |signal, ms| FeedbackPayload::Behavioral { signal, latency_ms: ms }.infer_confidence(&config);
        assert_eq!(at(BehavioralSignal::Undo, 1_000), 0.9);
        assert_eq!(at(BehavioralSignal::Retry, 120_000), 0.6);
        assert_eq!(at(BehavioralSignal::Abandon, 1_000), 0.5);
    }

    #[test]
    fn test_rating_validation() {
        let bad = FeedbackPayload::Rating { rating: 6, dimensions: BTreeMap::new(), comment: None };
        assert!(matches!(bad.validate(), Err(FeedbackError::InvalidRating(6))));

        let mut dimensions = BTreeMap::new();
        dimensions.insert("speed".to_string(), 0);
        let bad = FeedbackPayload::Rating { rating: 4, dimensions, comment: None };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_summary_merges_channels() {
        let triple = |s| Classification::parse(s).unwrap();
        let events = vec![
            event(FeedbackPayload::Rating { rating: 4, dimensions: BTreeMap::new(), comment: None }),
            event(FeedbackPayload::Rating { rating: 2, dimensions: BTreeMap::new(), comment: None }),
            event(FeedbackPayload::Approval { approved: true, latency_ms: 100 }),
            event(FeedbackPayload::Correction {
                system: triple("stream/human/read"),
                corrected: triple("process/human/read"),
                reasoning: None,
            }),
            event(FeedbackPayload::Behavioral { signal: BehavioralSignal::Undo, latency_ms: 100 }),
            event(FeedbackPayload::LongTerm { persisted: true, days: 7, reused: false, referenced: false }),
        ];
        let summary = FeedbackSummary::from_events("op", &events);
        assert_eq!(summary.avg_rating, Some(3.0));
        assert_eq!(summary.approval_rate, Some(0.5));
        assert_eq!(summary.undo_count, 1);
        assert_eq!(summary.persisted, Some(true));
        assert!(summary.confidence.is_some());
    }

    #[test]
    fn test_empty_summary_has_no_data() {
        let summary = FeedbackSummary::from_events("op", &[]);
        assert_eq!(summary.approval_rate, None);
        assert_eq!(summary.avg_rating, None);
        assert_eq!(summary.confidence, None);
    }

    #[tokio::test]
    async fn test_correction_lowers_approval_rate() {
        let (collector, op) = setup().await;
        collector.approval(&op.id, true, 800).await.unwrap();
        assert_eq!(collector.summary(&op.id).await.unwrap().approval_rate, Some(1.0));

        collector
            .correct(&op.id, Classification::parse("process/human/read").unwrap(), Some("it runs free".into()))
            .await
            .unwrap();
        let summary = collector.summary(&op.id).await.unwrap();
        assert_eq!(summary.approval_rate, Some(0.5));
        assert_eq!(summary.correction_count, 1);
    }

    #[tokio::test]
    async fn test_correction_matching_system_is_rejected() {
        let (collector, op) = setup().await;
        let err = collector
            .correct(&op.id, Classification::parse("stream/human/read").unwrap(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Feedback(FeedbackError::EmptyCorrection)));
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let (collector, _) = setup().await;
        let err = collector.approval("missing", true, 10).await.unwrap_err();
        assert!(matches!(err, PipelineError::Feedback(FeedbackError::UnknownOperation(_))));
    }
}
