//! Learning loop
//!
//! Reads operations and feedback in aggregate over a sliding per-requester
//! window and persists an immutable [`LearningMetricSnapshot`]. Nothing
//! here takes locks that classification, verification or execution wait
//! on beyond single ledger reads.

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::LearningConfig;
use crate::error::PipelineResult;
use crate::feedback::{mean, FeedbackEvent, FeedbackPayload};
use crate::ledger::Ledger;
use crate::types::{Axis, Classification, Operation};

/// Snapshots with fewer operations than this do not recalibrate confidence
const MIN_CALIBRATION_SAMPLES: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisAccuracy {
    pub destination: Option<f64>,
    pub consumer: Option<f64>,
    pub semantics: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackQuality {
    /// Pearson correlation between ratings and approvals
    pub consistency: Option<f64>,
    /// Share of corrections that explain themselves
    pub informativeness: Option<f64>,
    /// Share of operations with any explicit feedback
    pub engagement: Option<f64>,
    /// Share of operations with behavioral or long-term signals
    pub implicit_availability: Option<f64>,
}

/// Metrics for one requester over one window. `None` means no data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningMetricSnapshot {
    pub id: String,
    pub requester: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub window_days: i64,
    pub sample_size: usize,
    pub accuracy: Option<f64>,
    pub avg_rating: Option<f64>,
    pub correction_rate: Option<f64>,
    pub per_axis: AxisAccuracy,
    pub previous_accuracy: Option<f64>,
    /// Signed change against the preceding window of equal length
    pub improvement: Option<f64>,
    pub quality: FeedbackQuality,
    pub computed_at: DateTime<Utc>,
}

impl LearningMetricSnapshot {
    /// Multiplier for classifier confidence, 1.0 when there is too little
    /// history to judge
    pub fn calibration(&self) -> f64 {
        match self.accuracy {
            Some(accuracy) if self.sample_size >= MIN_CALIBRATION_SAMPLES => 0.5 + 0.5 * accuracy,
            _ => 1.0,
        }
    }
}

/// Aggregates computed from one window of operations and their feedback
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowMetrics {
    pub sample_size: usize,
    pub accuracy: Option<f64>,
    pub avg_rating: Option<f64>,
    pub correction_rate: Option<f64>,
    pub per_axis: AxisAccuracy,
    pub quality: FeedbackQuality,
}

impl WindowMetrics {
    pub fn compute(operations: &[Operation], events: &[FeedbackEvent]) -> Self {
        let mut by_op: HashMap<&str, Vec<&FeedbackEvent>> = HashMap::new();
        for event in events {
            by_op.entry(event.operation_id.as_str()).or_default().push(event);
        }

        let classified: Vec<&Operation> = operations.iter().filter(|o| o.classification.is_some()).collect();
        let n = classified.len();
        if n == 0 {
            return Self::default();
        }

        let mut accurate = 0usize;
        let mut corrected = 0usize;
        let mut axis_hits: HashMap<Axis, usize> = HashMap::new();
        let mut ratings = Vec::new();
        let mut pairs = Vec::new();
        let mut explicit = 0usize;
        let mut implicit = 0usize;
        let mut corrections = 0usize;
        let mut explained = 0usize;

        for op in &classified {
            let feedback = by_op.get(op.id.as_str()).map(Vec::as_slice).unwrap_or(&[]);

            let mut approved = None;
            let mut correction: Option<(Classification, Classification)> = None;
            let mut op_ratings = Vec::new();
            let mut has_explicit = false;
            let mut has_implicit = false;

            for event in feedback {
                match &event.payload {
                    FeedbackPayload::Rating { rating, .. } => {
                        op_ratings.push(f64::from(*rating));
                        has_explicit = true;
                    }
                    FeedbackPayload::Approval { approved: a, .. } => {
                        approved = Some(*a);
                        has_explicit = true;
                    }
                    FeedbackPayload::Correction { system, corrected, reasoning } => {
                        correction = Some((*system, *corrected));
                        corrections += 1;
                        if reasoning.as_deref().is_some_and(|r| !r.trim().is_empty()) {
                            explained += 1;
                        }
                        has_explicit = true;
                    }
                    FeedbackPayload::Behavioral { .. } | FeedbackPayload::LongTerm { .. } => has_implicit = true,
                }
            }

            if correction.is_none() || approved == Some(true) {
                accurate += 1;
            }
            match correction {
                Some((system, fixed)) => {
                    corrected += 1;
                    for axis in Axis::ALL {
                        if axis_value(&system, axis) == axis_value(&fixed, axis) {
                            *axis_hits.entry(axis).or_default() += 1;
                        }
                    }
                }
                None => {
                    for axis in Axis::ALL {
                        *axis_hits.entry(axis).or_default() += 1;
                    }
                }
            }

            if let Some(r) = mean(&op_ratings) {
                ratings.extend(op_ratings.iter().copied());
                if let Some(a) = approved {
                    pairs.push((r, if a { 1.0 } else { 0.0 }));
                }
            }
            explicit += usize::from(has_explicit);
            implicit += usize::from(has_implicit);
        }

        let share = |count: usize| Some(count as f64 / n as f64);
        let axis = |a: Axis| share(axis_hits.get(&a).copied().unwrap_or(0));

        Self {
            sample_size: n,
            accuracy: share(accurate),
            avg_rating: mean(&ratings),
            correction_rate: share(corrected),
            per_axis: AxisAccuracy {
                destination: axis(Axis::Destination),
                consumer: axis(Axis::Consumer),
                semantics: axis(Axis::Semantics),
            },
            quality: FeedbackQuality {
                consistency: pearson(&pairs),
                informativeness: (corrections > 0).then(|| explained as f64 / corrections as f64),
                engagement: share(explicit),
                implicit_availability: share(implicit),
            },
        }
    }
}

fn axis_value(c: &Classification, axis: Axis) -> &'static str {
    match axis {
        Axis::Destination => c.destination.as_str(),
        Axis::Consumer => c.consumer.as_str(),
        Axis::Semantics => c.semantics.as_str(),
    }
}

/// Pearson correlation, `None` for fewer than two pairs or zero variance
pub fn pearson(pairs: &[(f64, f64)]) -> Option<f64> {
    if pairs.len() < 2 {
        return None;
    }
    let n = pairs.len() as f64;
    let mx = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let my = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut cov, mut vx, mut vy) = (0.0, 0.0, 0.0);
    for (x, y) in pairs {
        cov += (x - mx) * (y - my);
        vx += (x - mx).powi(2);
        vy += (y - my).powi(2);
    }
    if vx == 0.0 || vy == 0.0 {
        return None;
    }
    Some(cov / (vx.sqrt() * vy.sqrt()))
}

#[derive(Clone)]
pub struct LearningLoop {
    ledger: Ledger,
    config: LearningConfig,
}

impl LearningLoop {
    pub fn new(ledger: Ledger, config: LearningConfig) -> Self {
        Self { ledger, config }
    }

    fn window(&self) -> Duration {
        Duration::days(self.config.window_days.max(1))
    }

    async fn window_metrics(&self, requester: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> PipelineResult<WindowMetrics> {
        let ops = self.ledger.operations_for_requester(requester, from, to).await?;
        let events = self.ledger.feedback_in_window(requester, from, to).await?;
        Ok(WindowMetrics::compute(&ops, &events))
    }

    /// Compute and persist the snapshot for `[now - window, now)`
    pub async fn compute(&self, requester: &str, now: DateTime<Utc>) -> PipelineResult<LearningMetricSnapshot> {
        let window = self.window();
        let start = now - window;
        let current = self.window_metrics(requester, start, now).await?;
        let previous = self.window_metrics(requester, start - window, start).await?;

        let improvement = match (current.accuracy, previous.accuracy) {
            (Some(now), Some(before)) => Some(now - before),
            _ => None,
        };

        let snapshot = LearningMetricSnapshot {
            id: uuid::Uuid::new_v4().to_string(),
            requester: requester.to_string(),
            window_start: start,
            window_end: now,
            window_days: window.num_days(),
            sample_size: current.sample_size,
            accuracy: current.accuracy,
            avg_rating: current.avg_rating,
            correction_rate: current.correction_rate,
            per_axis: current.per_axis,
            previous_accuracy: previous.accuracy,
            improvement,
            quality: current.quality,
            computed_at: Utc::now(),
        };
        self.ledger.insert_snapshot(&snapshot).await?;

        info!(
            requester = %requester,
            sample_size = snapshot.sample_size,
            accuracy = ?snapshot.accuracy,
            improvement = ?snapshot.improvement,
            "Learning snapshot computed"
        );
        Ok(snapshot)
    }

    pub async fn feedback_quality(&self, requester: &str, now: DateTime<Utc>) -> PipelineResult<FeedbackQuality> {
        Ok(self.window_metrics(requester, now - self.window(), now).await?.quality)
    }

    pub async fn latest(&self, requester: &str) -> PipelineResult<Option<LearningMetricSnapshot>> {
        Ok(self.ledger.snapshots(requester, 1).await?.into_iter().next())
    }

    /// One snapshot per requester active in the window. Failures are
    /// logged and skipped.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Vec<LearningMetricSnapshot> {
        let requesters = match self.ledger.active_requesters(now - self.window()).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Could not list active requesters");
                return Vec::new();
            }
        };

        let results = join_all(requesters.iter().map(|r| self.compute(r, now))).await;
        results
            .into_iter()
            .zip(&requesters)
            .filter_map(|(result, requester)| match result {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(requester = %requester, error = %e, "Learning snapshot failed");
                    None
                }
            })
            .collect()
    }
}

/// Periodic background runner for [`LearningLoop::run_once`]
pub struct LearningRunner {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl LearningRunner {
    pub fn spawn(learning: LearningLoop, interval: std::time::Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            info!(interval_secs = interval.as_secs(), "Learning runner started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let snapshots = learning.run_once(Utc::now()).await;
                        debug!(count = snapshots.len(), "Learning tick finished");
                    }
                }
            }
            info!("Learning runner stopped");
        });
        Self { shutdown_tx, handle }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::request_hash;
    use crate::feedback::BehavioralSignal;
    use std::collections::BTreeMap;

    fn op(id: &str, triple: &str) -> Operation {
        let mut op = Operation::new("directive", "alice", request_hash("directive"));
        op.id = id.to_string();
        op.classification = Classification::parse(triple);
        op
    }

    fn fb(op_id: &str, payload: FeedbackPayload) -> FeedbackEvent {
        FeedbackEvent {
            id: uuid::Uuid::new_v4().to_string(),
            operation_id: op_id.to_string(),
            requester: "alice".to_string(),
            payload,
            confidence: 0.8,
            created_at: Utc::now(),
        }
    }

    fn rating(r: u8) -> FeedbackPayload {
        FeedbackPayload::Rating { rating: r, dimensions: BTreeMap::new(), comment: None }
    }

    #[test]
    fn test_empty_window_is_no_data() {
        let m = WindowMetrics::compute(&[], &[]);
        assert_eq!(m.sample_size, 0);
        assert_eq!(m.accuracy, None);
        assert_eq!(m.quality, FeedbackQuality::default());
    }

    #[test]
    fn test_corrections_reduce_accuracy_per_axis() {
        let ops = vec![op("a", "stream/human/read"), op("b", "stream/human/read")];
        let events = vec![fb(
            "b",
            FeedbackPayload::Correction {
                system: Classification::parse("stream/human/read").unwrap(),
                corrected: Classification::parse("process/human/read").unwrap(),
                reasoning: Some("runs a command".into()),
            },
        )];
        let m = WindowMetrics::compute(&ops, &events);
        assert_eq!(m.accuracy, Some(0.5));
        assert_eq!(m.correction_rate, Some(0.5));
        assert_eq!(m.per_axis.destination, Some(0.5));
        assert_eq!(m.per_axis.consumer, Some(1.0));
        assert_eq!(m.quality.informativeness, Some(1.0));
    }

    #[test]
    fn test_quality_metrics() {
        let ops = vec![op("a", "stream/human/read"), op("b", "stream/human/read"), op("c", "stream/human/read")];
        let events = vec![
            fb("a", rating(5)),
            fb("a", FeedbackPayload::Approval { approved: true, latency_ms: 100 }),
            fb("b", rating(1)),
            fb("b", FeedbackPayload::Approval { approved: false, latency_ms: 100 }),
            fb("c", FeedbackPayload::Behavioral { signal: BehavioralSignal::Retry, latency_ms: 10 }),
        ];
        let m = WindowMetrics::compute(&ops, &events);
        assert!((m.quality.consistency.unwrap() - 1.0).abs() < 1e-9);
        assert!((m.quality.engagement.unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert!((m.quality.implicit_availability.unwrap() - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(m.quality.informativeness, None);
        assert_eq!(m.avg_rating, Some(3.0));
    }

    #[test]
    fn test_pearson_edge_cases() {
        assert_eq!(pearson(&[(1.0, 1.0)]), None);
        assert_eq!(pearson(&[(1.0, 1.0), (1.0, 0.0)]), None);
        let r = pearson(&[(1.0, 0.0), (5.0, 1.0), (3.0, 0.0)]).unwrap();
        assert!(r > 0.0 && r <= 1.0);
    }

    #[test]
    fn test_calibration_needs_history() {
        let snapshot = LearningMetricSnapshot {
            id: "s".into(),
            requester: "alice".into(),
            window_start: Utc::now(),
            window_end: Utc::now(),
            window_days: 7,
            sample_size: 2,
            accuracy: Some(0.0),
            avg_rating: None,
            correction_rate: None,
            per_axis: AxisAccuracy::default(),
            previous_accuracy: None,
            improvement: None,
            quality: FeedbackQuality::default(),
            computed_at: Utc::now(),
        };
        assert_eq!(snapshot.calibration(), 1.0);
        let seasoned = LearningMetricSnapshot { sample_size: 10, ..snapshot };
        assert_eq!(seasoned.calibration(), 0.5);
    }

    #[tokio::test]
    async fn test_compute_persists_and_compares_windows() {
        let ledger = Ledger::open_in_memory().unwrap();
        let learning = LearningLoop::new(ledger.clone(), LearningConfig::default());

        let mut old = Operation::new("show memory usage", "alice", request_hash("show memory usage"));
        old.created_at = Utc::now() - Duration::days(10);
        ledger.insert_operation(&old, 0).await.unwrap();
        ledger
            .set_classification(&old.id, &Classification::parse("stream/human/read").unwrap(), 0.6)
            .await
            .unwrap();

        let fresh = Operation::new("list files", "alice", request_hash("list files"));
        ledger.insert_operation(&fresh, 0).await.unwrap();
        ledger
            .set_classification(&fresh.id, &Classification::parse("stream/human/read").unwrap(), 0.6)
            .await
            .unwrap();

        let snapshot = learning.compute("alice", Utc::now() + Duration::seconds(1)).await.unwrap();
        assert_eq!(snapshot.sample_size, 1);
        assert_eq!(snapshot.accuracy, Some(1.0));
        assert_eq!(snapshot.previous_accuracy, Some(1.0));
        assert_eq!(snapshot.improvement, Some(0.0));

        let stored = learning.latest("alice").await.unwrap().unwrap();
        assert_eq!(stored.id, snapshot.id);

        let empty = learning.compute("nobody", Utc::now()).await.unwrap();
        assert_eq!(empty.accuracy, None);
    }

    #[tokio::test]
    async fn test_runner_shuts_down() {
        let ledger = Ledger::open_in_memory().unwrap();
        let runner = LearningRunner::spawn(
            LearningLoop::new(ledger, LearningConfig::default()),
            std::time::Duration::from_millis(10),
        );
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        runner.shutdown().await;
    }
}
