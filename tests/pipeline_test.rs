//! End-to-end tests for the operation pipeline:
//! - Submission, classification and verification outcomes
//! - Approval, rejection and the status graph
//! - Undo with byte-for-byte restore
//! - Feedback and learning over the shared ledger

use atomic_ops::classifier::{ClassificationOutcome, Classifier, ClassifierStrategy};
use atomic_ops::execution::{ExecutorKind, UndoAction};
use atomic_ops::features::FeatureRecord;
use atomic_ops::types::{
    AxisReasoning, Classification, ClassificationReasoning, FailureKind, OperationStatus,
};
use atomic_ops::verification::Layer;
use atomic_ops::{Config, Ledger, Pipeline, PipelineError, PipelineResult, SubmitRequest, UndoError};
use chrono::{Duration, Utc};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;
use tokio_test::{assert_err, assert_ok};

fn pipeline_with(dir: &Path, config: Config) -> Pipeline {
    Pipeline::new(
        config,
        Ledger::open_in_memory().unwrap(),
        dir.to_path_buf(),
        dir.join(".backups"),
    )
}

fn pipeline(dir: &Path) -> Pipeline {
    pipeline_with(dir, Config::in_dir(dir))
}

async fn submit(p: &Pipeline, directive: &str) -> atomic_ops::SubmitResponse {
    p.submit(SubmitRequest::new(directive, "alice")).await.unwrap()
}

// =====================================================================
// SCENARIOS
// =====================================================================

#[tokio::test]
async fn test_memory_usage_is_a_side_effect_free_read() {
    let dir = tempdir().unwrap();
    let p = pipeline(dir.path());

    let response = submit(&p, "show memory usage").await;
    assert_eq!(response.classification.unwrap().to_string(), "stream/human/read");
    assert!(response.verified());
    assert_eq!(response.status, OperationStatus::Complete);

    let record = response.execution.unwrap();
    assert_eq!(record.executor, ExecutorKind::Passthrough);
    assert!(record.success);
    assert!(!record.stdout.is_empty());
    assert!(record.affected_paths.is_empty());
    assert!(record.process_ids.is_empty());
    assert!(!record.reversible);
}

#[tokio::test]
async fn test_rm_rf_root_never_executes() {
    let dir = tempdir().unwrap();
    let p = pipeline(dir.path());

    let response = submit(&p, "rm -rf /").await;
    assert_eq!(response.classification.unwrap().to_string(), "process/machine/execute");
    assert_eq!(response.status, OperationStatus::Failed);
    assert_eq!(response.failure, Some(FailureKind::Verification));

    let report = response.verification.unwrap();
    let safety = report.result(Layer::Safety).unwrap();
    assert!(!safety.passed);
    assert!(safety.issues.iter().any(|i| i.starts_with("blocked")));

    assert!(response.execution.is_none());
    assert!(p.ledger().execution(&response.operation_id).await.unwrap().is_none());
    assert!(p.approve(&response.operation_id).await.is_err());
}

#[tokio::test]
async fn test_write_new_file_then_undo_deletes_it() {
    let dir = tempdir().unwrap();
    let p = pipeline(dir.path());
    let target = dir.path().join("notes.txt");

    let response = submit(&p, "write notes.txt with 'hello'").await;
    assert_eq!(response.classification.unwrap().to_string(), "file/human/execute");
    assert!(response.awaiting_approval());
    let behavioral = response.verification.as_ref().unwrap().result(Layer::Behavioral).unwrap();
    assert!(behavioral.details.contains("no backup needed"));

    let view = p.approve(&response.operation_id).await.unwrap();
    assert_eq!(view.operation.status, OperationStatus::Complete);
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "hello");

    let record = view.execution.unwrap();
    assert!(record.reversible);
    assert_eq!(record.undo_actions, vec![UndoAction::DeleteCreated { path: target.clone() }]);

    p.undo(&response.operation_id).await.unwrap();
    assert!(!target.exists());
}

#[tokio::test]
async fn test_correction_lowers_approval_rate_and_feeds_learning() {
    let dir = tempdir().unwrap();
    let p = pipeline(dir.path());

    let response = submit(&p, "write notes.txt with 'hello'").await;
    p.approve(&response.operation_id).await.unwrap();
    let before = p.feedback().summary(&response.operation_id).await.unwrap();
    assert_eq!(before.approval_rate, Some(1.0));

    let corrected = Classification::parse("file/machine/execute").unwrap();
    p.feedback()
        .correct(&response.operation_id, corrected, Some("a script reads this file".into()))
        .await
        .unwrap();
    let after = p.feedback().summary(&response.operation_id).await.unwrap();
    assert_eq!(after.correction_count, 1);
    assert!(after.approval_rate.unwrap() < before.approval_rate.unwrap());

    let snapshot = p.learning().compute("alice", Utc::now()).await.unwrap();
    assert_eq!(snapshot.sample_size, 1);
    assert_eq!(snapshot.correction_rate, Some(1.0));
    assert_eq!(snapshot.per_axis.consumer, Some(0.0));
    assert_eq!(snapshot.per_axis.destination, Some(1.0));

    // The same directive now starts from the corrected triple
    let again = submit(&p, "write notes.txt with 'hello'").await;
    assert_eq!(again.classification, Some(corrected));
    assert_eq!(again.reasoning.unwrap().corrected_from.unwrap().to_string(), "file/human/execute");
}

// =====================================================================
// STATUS GRAPH
// =====================================================================

#[tokio::test]
async fn test_rejected_operation_cannot_be_approved() {
    let dir = tempdir().unwrap();
    let p = pipeline(dir.path());

    let response = submit(&p, "write notes.txt with 'hello'").await;
    let view = assert_ok!(p.reject(&response.operation_id).await);
    assert_eq!(view.operation.status, OperationStatus::Cancelled);
    assert_eq!(view.feedback.rejections, 1);

    let err = assert_err!(p.approve(&response.operation_id).await);
    assert!(matches!(
        err,
        PipelineError::InvalidTransition { from: OperationStatus::Cancelled, .. }
    ));
    assert!(!dir.path().join("notes.txt").exists());
}

#[tokio::test]
async fn test_concurrent_approvals_execute_once() {
    let dir = tempdir().unwrap();
    let p = pipeline(dir.path());

    let response = submit(&p, "append 'line' to log.txt").await;
    assert!(response.awaiting_approval());

    let (a, b) = futures::join!(p.approve(&response.operation_id), p.approve(&response.operation_id));
    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(assert_err!(loser), PipelineError::InvalidTransition { .. }));

    assert_eq!(std::fs::read_to_string(dir.path().join("log.txt")).unwrap(), "line");
    let op = p.ledger().require_operation(&response.operation_id).await.unwrap();
    assert_eq!(op.status, OperationStatus::Complete);
}

#[tokio::test]
async fn test_empty_directive_fails_classification() {
    let dir = tempdir().unwrap();
    let p = pipeline(dir.path());

    let response = submit(&p, "   ").await;
    assert_eq!(response.status, OperationStatus::Failed);
    assert_eq!(response.failure, Some(FailureKind::Classification));
    assert!(response.error.is_some());

    let op = p.ledger().require_operation(&response.operation_id).await.unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert!(op.classification.is_none());
}

#[tokio::test]
async fn test_preview_does_not_mutate() {
    let dir = tempdir().unwrap();
    let p = pipeline(dir.path());

    let response = submit(&p, "write draft.txt with 'x'").await;
    let previews = p.preview(&response.operation_id).await.unwrap();
    assert_eq!(previews.len(), 1);
    assert!(previews[0].simulated);
    assert!(previews[0].undo_actions.is_empty());
    assert!(!dir.path().join("draft.txt").exists());

    let op = p.ledger().require_operation(&response.operation_id).await.unwrap();
    assert_eq!(op.status, OperationStatus::AwaitingApproval);
    assert!(p.ledger().execution(&response.operation_id).await.unwrap().is_none());
}

// =====================================================================
// UNDO
// =====================================================================

#[tokio::test]
async fn test_overwrite_undo_restores_exact_bytes() {
    let dir = tempdir().unwrap();
    let p = pipeline(dir.path());
    let target = dir.path().join("data.bin");
    let original: Vec<u8> = vec![0xff, 0x00, b'a', b'\n', 0x80, 0x7f];
    std::fs::write(&target, &original).unwrap();

    let response = submit(&p, "write data.bin with 'replaced'").await;
    assert!(response.awaiting_approval(), "{:?}", response.verification);
    let behavioral = response.verification.as_ref().unwrap().result(Layer::Behavioral).unwrap();
    assert!(behavioral.details.contains("backup"));

    p.approve(&response.operation_id).await.unwrap();
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "replaced");

    let report = p.undo_latest("alice").await.unwrap();
    assert_eq!(report.operation_id, response.operation_id);
    assert_eq!(std::fs::read(&target).unwrap(), original);

    let err = p.undo(&response.operation_id).await.unwrap_err();
    assert!(matches!(err, PipelineError::Undo(UndoError::AlreadyConsumed(_))));

    let view = p.operation(&response.operation_id).await.unwrap();
    assert!(view.undo_consumed);
    assert_eq!(view.feedback.undo_count, 1);
}

#[tokio::test]
async fn test_undo_of_read_is_not_reversible() {
    let dir = tempdir().unwrap();
    let p = pipeline(dir.path());

    let response = submit(&p, "show memory usage").await;
    let err = p.undo(&response.operation_id).await.unwrap_err();
    assert!(matches!(err, PipelineError::Undo(UndoError::NotReversible(_))));
}

// =====================================================================
// COMPOSITE OPERATIONS
// =====================================================================

#[tokio::test]
async fn test_chained_directive_runs_steps_in_order() {
    let dir = tempdir().unwrap();
    let p = pipeline(dir.path());

    let response = submit(&p, "write a.txt with 'one' and then write b.txt with 'two'").await;
    assert_eq!(response.steps.len(), 2);
    assert!(response.classification.is_none());
    assert!(response.awaiting_approval());
    assert!(response.steps.iter().all(|s| s.awaiting_approval()));

    let view = p.approve(&response.operation_id).await.unwrap();
    assert_eq!(view.operation.status, OperationStatus::Complete);
    assert_eq!(view.steps.len(), 2);
    assert!(view.steps.iter().all(|s| s.operation.status == OperationStatus::Complete));
    assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "one");
    assert_eq!(std::fs::read_to_string(dir.path().join("b.txt")).unwrap(), "two");

    let report = p.undo_latest("alice").await.unwrap();
    assert_eq!(report.operation_id, response.operation_id);
    assert_eq!(report.actions.len(), 2);
    assert!(!dir.path().join("a.txt").exists());
    assert!(!dir.path().join("b.txt").exists());
}

#[tokio::test]
async fn test_chained_directive_fails_as_a_whole() {
    let dir = tempdir().unwrap();
    let p = pipeline(dir.path());

    let response = submit(&p, "write a.txt with 'one' and then rm -rf /").await;
    assert_eq!(response.status, OperationStatus::Failed);
    assert_eq!(response.failure, Some(FailureKind::Verification));
    assert_eq!(response.steps[0].status, OperationStatus::Cancelled);
    assert_eq!(response.steps[1].status, OperationStatus::Failed);
    assert!(response
        .verification
        .unwrap()
        .issues()
        .iter()
        .any(|i| i.contains("step 2:")));
}

// =====================================================================
// RATE LIMIT AND HISTORY
// =====================================================================

#[tokio::test]
async fn test_rate_limit_comes_from_the_ledger() {
    let dir = tempdir().unwrap();
    let mut config = Config::in_dir(dir.path());
    config.verification.rate_limit_max = 2;
    let p = pipeline_with(dir.path(), config);

    for name in ["a", "b"] {
        let response = submit(&p, &format!("write {}.txt with 'x'", name)).await;
        assert!(response.awaiting_approval());
    }

    let third = submit(&p, "write c.txt with 'x'").await;
    assert_eq!(third.status, OperationStatus::Failed);
    let safety = third.verification.unwrap();
    let safety = safety.result(Layer::Safety).unwrap();
    assert!(safety.issues.iter().any(|i| i.starts_with("rate limit")));

    // Reads are not limited
    let read = submit(&p, "show memory usage").await;
    assert_eq!(read.status, OperationStatus::Complete);

    // Other requesters have their own budget
    let other = p
        .submit(SubmitRequest::new("write d.txt with 'x'", "bob"))
        .await
        .unwrap();
    assert!(other.awaiting_approval());
}

#[tokio::test]
async fn test_history_is_per_requester() {
    let dir = tempdir().unwrap();
    let p = pipeline(dir.path());

    submit(&p, "show memory usage").await;
    submit(&p, "write notes.txt with 'hello'").await;
    p.submit(SubmitRequest::new("show disk usage", "bob")).await.unwrap();

    let ops = p.history("alice", Utc::now() - Duration::days(1)).await.unwrap();
    assert_eq!(ops.len(), 2);
    assert!(ops.iter().all(|o| o.requester == "alice"));
    assert!(ops[0].created_at <= ops[1].created_at);
}

// =====================================================================
// PLUGGABLE CLASSIFIER
// =====================================================================

/// Classifier that always answers with the same outcome
struct FixedStrategy {
    outcome: ClassificationOutcome,
    calls: AtomicUsize,
}

impl FixedStrategy {
    fn new(triple: &str, confidence: f64) -> Arc<Self> {
        Arc::new(Self {
            outcome: outcome(triple, confidence),
            calls: AtomicUsize::new(0),
        })
    }
}

impl Classifier for FixedStrategy {
    fn name(&self) -> &str {
        "fixed"
    }

    fn classify(&self, _features: &FeatureRecord) -> PipelineResult<ClassificationOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.outcome.clone())
    }
}

fn outcome(triple: &str, confidence: f64) -> ClassificationOutcome {
    let axis = AxisReasoning {
        indicators: vec!["fixed".to_string()],
        confidence,
        explanation: "fixed outcome".to_string(),
    };
    ClassificationOutcome {
        classification: Classification::parse(triple).unwrap(),
        confidence,
        reasoning: ClassificationReasoning {
            destination: axis.clone(),
            consumer: axis.clone(),
            semantics: axis,
            alternatives: Vec::new(),
            strategy: "fixed".to_string(),
            corrected_from: None,
        },
    }
}

#[tokio::test]
async fn test_external_classifier_below_minimum_confidence_fails() {
    let dir = tempdir().unwrap();
    let mut config = Config::in_dir(dir.path());
    config.classifier.min_confidence = 0.5;

    let strategy = FixedStrategy::new("stream/human/read", 0.2);
    let p = pipeline_with(dir.path(), config)
        .with_classifier(ClassifierStrategy::External(strategy.clone()));

    let response = submit(&p, "show memory usage").await;
    assert_eq!(response.status, OperationStatus::Failed);
    assert_eq!(response.failure, Some(FailureKind::Classification));
    assert!(response.error.unwrap().contains("below"));
    assert_eq!(strategy.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_external_classifier_drives_execution() {
    let dir = tempdir().unwrap();

    let strategy = FixedStrategy::new("stream/human/read", 0.9);
    let p = pipeline(dir.path()).with_classifier(ClassifierStrategy::External(strategy));

    let response = submit(&p, "what is the uptime").await;
    assert_eq!(response.reasoning.unwrap().strategy, "fixed");
    assert_eq!(response.status, OperationStatus::Complete);
}

// =====================================================================
// EXECUTION OUTCOMES
// =====================================================================

#[cfg(unix)]
#[tokio::test]
async fn test_stream_execute_runs_the_command() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempdir().unwrap();
    let target = dir.path().join("report.txt");
    std::fs::write(&target, "q3").unwrap();
    std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o644)).unwrap();

    let strategy = FixedStrategy::new("stream/machine/execute", 0.9);
    let p = pipeline(dir.path()).with_classifier(ClassifierStrategy::External(strategy));

    let response = submit(&p, &format!("chmod 600 {}", target.display())).await;
    assert!(response.awaiting_approval(), "{:?}", response.verification);

    let view = p.approve(&response.operation_id).await.unwrap();
    assert_eq!(view.operation.status, OperationStatus::Complete);
    let record = view.execution.unwrap();
    assert_eq!(record.executor, ExecutorKind::Process);
    assert_eq!(record.exit_code, Some(0));
    assert_eq!(record.process_ids.len(), 1);

    let mode = std::fs::metadata(&target).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[tokio::test]
async fn test_failed_command_keeps_output_and_backup() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("data.txt");
    std::fs::write(&data, "keep me").unwrap();

    let strategy = FixedStrategy::new("process/machine/execute", 0.9);
    let p = pipeline(dir.path()).with_classifier(ClassifierStrategy::External(strategy));

    let response = submit(&p, "cp data.txt missing-dir/copy.txt").await;
    assert!(response.awaiting_approval(), "{:?}", response.verification);

    let view = p.approve(&response.operation_id).await.unwrap();
    assert_eq!(view.operation.status, OperationStatus::Failed);
    assert_eq!(view.operation.failure, Some(FailureKind::Execution));

    let record = view.execution.unwrap();
    assert!(!record.success);
    assert!(matches!(record.exit_code, Some(code) if code != 0));
    assert!(!record.stderr.is_empty());
    assert!(record.reversible);
    assert!(matches!(record.undo_actions.first(), Some(UndoAction::RestoreBackup { .. })));

    // No automatic retry: the operation stays failed and cannot be claimed again
    let err = assert_err!(p.approve(&response.operation_id).await);
    assert!(matches!(
        err,
        PipelineError::InvalidTransition { from: OperationStatus::Failed, .. }
    ));
    let op = p.ledger().require_operation(&response.operation_id).await.unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    let stored = p.ledger().execution(&response.operation_id).await.unwrap().unwrap();
    assert_eq!(stored.exit_code, record.exit_code);
    assert_eq!(stored.stderr, record.stderr);

    std::fs::write(&data, "clobbered").unwrap();
    let report = assert_ok!(p.undo(&response.operation_id).await);
    assert_eq!(report.actions.len(), 1);
    assert_eq!(std::fs::read_to_string(&data).unwrap(), "keep me");
}

#[tokio::test]
async fn test_timed_out_command_fails_without_retry() {
    let dir = tempdir().unwrap();
    let mut config = Config::in_dir(dir.path());
    config.execution.timeout_secs = 1;

    let strategy = FixedStrategy::new("process/machine/execute", 0.9);
    let p = pipeline_with(dir.path(), config).with_classifier(ClassifierStrategy::External(strategy));

    let response = submit(&p, "sleep 5").await;
    assert!(response.awaiting_approval(), "{:?}", response.verification);

    let view = p.approve(&response.operation_id).await.unwrap();
    assert_eq!(view.operation.status, OperationStatus::Failed);
    assert_eq!(view.operation.failure, Some(FailureKind::Execution));
    assert!(view.execution.unwrap().timed_out);
    assert_err!(p.approve(&response.operation_id).await);
}

#[tokio::test]
async fn test_step_error_cancels_remaining_steps() {
    let dir = tempdir().unwrap();
    let p = pipeline(dir.path());

    let response = submit(&p, "write a.txt with 'one' and then write b.txt with 'two'").await;
    assert!(response.awaiting_approval());
    p.ledger()
        .transition(
            &response.steps[0].operation_id,
            OperationStatus::AwaitingApproval,
            OperationStatus::Cancelled,
            None,
        )
        .await
        .unwrap();

    assert_err!(p.approve(&response.operation_id).await);

    let parent = p.ledger().require_operation(&response.operation_id).await.unwrap();
    assert_eq!(parent.status, OperationStatus::Failed);
    assert_eq!(parent.failure, Some(FailureKind::Execution));
    let second = p.ledger().require_operation(&response.steps[1].operation_id).await.unwrap();
    assert_eq!(second.status, OperationStatus::Cancelled);
    assert!(!dir.path().join("b.txt").exists());
}
