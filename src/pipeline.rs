//! The operation pipeline
//!
//! `submit` extracts features, classifies, records and verifies a
//! directive. Pure reads may run straight away; everything else waits in
//! `awaiting_approval` until `approve` claims it through the ledger's
//! compare-and-set. Directives chained with "and then" become a parent
//! with one child operation per step.

use chrono::{DateTime, Duration, Timelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

use crate::classifier::{Classifier, ClassifierStrategy};
use crate::config::Config;
use crate::error::{PipelineError, PipelineResult, UndoError};
use crate::execution::{ExecutionEngine, ExecutionPlan, ExecutionRecord, ExecutorKind};
use crate::features::{FeatureExtractor, FeatureRecord, LanguageProvider, RequestContext};
use crate::feedback::{BehavioralSignal, FeedbackCollector, FeedbackSummary};
use crate::learning::LearningLoop;
use crate::ledger::Ledger;
use crate::types::{Classification, ClassificationReasoning, FailureKind, Operation, OperationStatus};
use crate::verification::{
    VerificationContext, VerificationEngine, VerificationInput, VerificationReport, VerificationResult,
};

static STEP_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*(?:,\s*and\s+then|,\s*then|;\s*then|\band\s+then)\s+").unwrap());

/// Window used to fill the context's recent-operation fields
const RECENT_CONTEXT_HOURS: i64 = 24;

const SIMILAR_LIMIT: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub directive: String,
    pub requester: String,
    #[serde(default)]
    pub context: Option<RequestContext>,
}

impl SubmitRequest {
    pub fn new(directive: impl Into<String>, requester: impl Into<String>) -> Self {
        Self {
            directive: directive.into(),
            requester: requester.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = Some(context);
        self
    }
}

/// What an originator gets back from `submit`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub operation_id: String,
    pub status: OperationStatus,
    pub failure: Option<FailureKind>,
    pub classification: Option<Classification>,
    pub confidence: f64,
    pub reasoning: Option<ClassificationReasoning>,
    pub verification: Option<VerificationReport>,
    pub execution: Option<ExecutionRecord>,
    /// Steps of a composite operation, in order
    pub steps: Vec<SubmitResponse>,
    /// Why classification failed, when it did
    pub error: Option<String>,
}

impl SubmitResponse {
    fn new(op: &Operation) -> Self {
        Self {
            operation_id: op.id.clone(),
            status: op.status,
            failure: op.failure,
            classification: op.classification,
            confidence: op.confidence,
            reasoning: None,
            verification: None,
            execution: None,
            steps: Vec::new(),
            error: None,
        }
    }

    pub fn awaiting_approval(&self) -> bool {
        self.status == OperationStatus::AwaitingApproval
    }

    pub fn verified(&self) -> bool {
        self.verification.as_ref().is_some_and(|v| v.passed)
    }
}

/// Everything the ledger knows about one operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationView {
    pub operation: Operation,
    pub reasoning: Option<ClassificationReasoning>,
    pub verification: Vec<VerificationResult>,
    pub execution: Option<ExecutionRecord>,
    pub undo_consumed: bool,
    pub feedback: FeedbackSummary,
    /// Earlier operations with the closest embeddings, best first
    pub similar: Vec<(String, f32)>,
    pub steps: Vec<OperationView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndoReport {
    pub operation_id: String,
    /// Replayed actions, one line each, in replay order
    pub actions: Vec<String>,
}

pub struct Pipeline {
    config: Config,
    ledger: Ledger,
    extractor: FeatureExtractor,
    classifier: ClassifierStrategy,
    verifier: Arc<VerificationEngine>,
    executor: ExecutionEngine,
    feedback: FeedbackCollector,
    learning: LearningLoop,
    working_dir: PathBuf,
}

impl Pipeline {
    pub fn new(config: Config, ledger: Ledger, working_dir: PathBuf, backup_dir: PathBuf) -> Self {
        Self {
            extractor: FeatureExtractor::from_config(&config.features),
            classifier: ClassifierStrategy::from_config(&config.classifier),
            verifier: Arc::new(VerificationEngine::new()),
            executor: ExecutionEngine::new(&config.execution, backup_dir, working_dir.clone()),
            feedback: FeedbackCollector::new(ledger.clone(), config.feedback.clone()),
            learning: LearningLoop::new(ledger.clone(), config.learning.clone()),
            working_dir,
            ledger,
            config,
        }
    }

    /// Open the configured ledger and resolve working and backup dirs
    pub async fn open(config: Config) -> anyhow::Result<Self> {
        use anyhow::Context;

        let ledger_path = config.ledger.resolved_path()?;
        if let Some(parent) = ledger_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create ledger directory {}", parent.display()))?;
        }
        let ledger = Ledger::open(&ledger_path)
            .await
            .with_context(|| format!("Failed to open ledger at {}", ledger_path.display()))?;

        let backup_dir = config.execution.resolved_backup_dir()?;
        let working_dir = match &config.execution.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("Failed to read current directory")?,
        };
        Ok(Self::new(config, ledger, working_dir, backup_dir))
    }

    pub fn with_classifier(mut self, classifier: ClassifierStrategy) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_language_provider(mut self, provider: Arc<dyn LanguageProvider>) -> Self {
        self.extractor = FeatureExtractor::new(provider, self.config.features.max_chars);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn feedback(&self) -> &FeedbackCollector {
        &self.feedback
    }

    pub fn learning(&self) -> &LearningLoop {
        &self.learning
    }

    // ---- submit ----

    pub async fn submit(&self, request: SubmitRequest) -> PipelineResult<SubmitResponse> {
        let directive = request.directive.trim().to_string();
        let context = self.enrich_context(&request.requester, request.context).await?;

        if self.config.pipeline.decompose {
            let steps = split_steps(&directive);
            if steps.len() > 1 {
                let features: Vec<FeatureRecord> = steps
                    .iter()
                    .map(|s| self.extractor.extract(s, Some(&context)))
                    .collect();
                if features
                    .iter()
                    .all(|f| f.syntactic.is_imperative || f.domain.looks_like_shell)
                {
                    return self
                        .submit_composite(&directive, &request.requester, &context, steps, features)
                        .await;
                }
            }
        }

        let features = self.extractor.extract(&directive, Some(&context));
        let op = Operation::new(&directive, &request.requester, features.request_hash.clone());
        self.ledger.insert_operation(&op, 0).await?;
        self.ledger.record_features(&op.id, &features).await?;
        info!(op_id = %op.id, requester = %op.requester, "Operation submitted");

        let mut response = self.guard(&op.id, self.classify_and_verify(&op, &features)).await?;

        if response.awaiting_approval() && self.auto_executes(&response) {
            let plan = self.plan_for(&op.directive, response.classification)?;
            response.execution = Some(self.guard(&op.id, self.run(&op.id, &plan)).await?);
            response.status = self.ledger.require_operation(&op.id).await?.status;
        }
        Ok(response)
    }

    async fn submit_composite(
        &self,
        directive: &str,
        requester: &str,
        context: &RequestContext,
        steps: Vec<String>,
        features: Vec<FeatureRecord>,
    ) -> PipelineResult<SubmitResponse> {
        let parent_features = self.extractor.extract(directive, Some(context));
        let parent = Operation::new(directive, requester, parent_features.request_hash.clone());
        self.ledger.insert_operation(&parent, 0).await?;
        self.ledger.record_features(&parent.id, &parent_features).await?;
        info!(op_id = %parent.id, steps = steps.len(), "Composite operation submitted");

        let mut responses = Vec::with_capacity(steps.len());
        for (i, (step, step_features)) in steps.iter().zip(features).enumerate() {
            let mut child = Operation::new(step, requester, step_features.request_hash.clone());
            child.parent_id = Some(parent.id.clone());
            self.ledger.insert_operation(&child, i).await?;
            self.ledger.record_features(&child.id, &step_features).await?;
            responses.push(self.guard(&child.id, self.classify_and_verify(&child, &step_features)).await?);
        }

        let mut response = SubmitResponse::new(&parent);
        let unclassified = responses.iter().any(|r| r.failure == Some(FailureKind::Classification));
        if unclassified {
            self.ledger
                .transition(&parent.id, OperationStatus::Classifying, OperationStatus::Failed, Some(FailureKind::Classification))
                .await?;
            response.status = OperationStatus::Failed;
            response.failure = Some(FailureKind::Classification);
            response.error = Some("a step could not be classified".to_string());
        } else {
            let reports: Vec<VerificationReport> = responses.iter().filter_map(|r| r.verification.clone()).collect();
            let report = VerificationReport::aggregate(&reports);
            self.ledger.record_verification(&parent.id, &report.results).await?;
            response.confidence = report.confidence;
            if report.passed {
                self.ledger
                    .transition(&parent.id, OperationStatus::Classifying, OperationStatus::AwaitingApproval, None)
                    .await?;
                response.status = OperationStatus::AwaitingApproval;
            } else {
                self.ledger
                    .transition(&parent.id, OperationStatus::Classifying, OperationStatus::Failed, Some(FailureKind::Verification))
                    .await?;
                response.status = OperationStatus::Failed;
                response.failure = Some(FailureKind::Verification);
            }
            response.verification = Some(report);
        }

        if response.status == OperationStatus::Failed {
            self.cancel_waiting_steps(&parent.id).await?;
            for step in responses.iter_mut() {
                step.status = self.ledger.require_operation(&step.operation_id).await?.status;
            }
        }
        response.steps = responses;

        if response.awaiting_approval() && response.steps.iter().all(|s| self.auto_executes(s)) {
            self.guard(&parent.id, self.execute_claimed(&parent.id)).await?;
            return self.refresh_composite(response).await;
        }
        Ok(response)
    }

    async fn refresh_composite(&self, mut response: SubmitResponse) -> PipelineResult<SubmitResponse> {
        response.status = self.ledger.require_operation(&response.operation_id).await?.status;
        for step in response.steps.iter_mut() {
            let op = self.ledger.require_operation(&step.operation_id).await?;
            step.status = op.status;
            step.failure = op.failure;
            step.execution = self.ledger.execution(&step.operation_id).await?;
        }
        Ok(response)
    }

    /// Classify, record, verify and park `op` in `awaiting_approval` or
    /// `failed`
    async fn classify_and_verify(&self, op: &Operation, features: &FeatureRecord) -> PipelineResult<SubmitResponse> {
        let mut response = SubmitResponse::new(op);

        let outcome = match self.classifier.classify(features) {
            Ok(outcome) if outcome.confidence < self.config.classifier.min_confidence => Err(format!(
                "confidence {:.2} is below the {:.2} minimum",
                outcome.confidence, self.config.classifier.min_confidence
            )),
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(e.to_string()),
        };
        let mut outcome = match outcome {
            Ok(outcome) => outcome,
            Err(reason) => {
                warn!(op_id = %op.id, reason = %reason, "Classification failed");
                self.ledger
                    .transition(&op.id, OperationStatus::Classifying, OperationStatus::Failed, Some(FailureKind::Classification))
                    .await?;
                response.status = OperationStatus::Failed;
                response.failure = Some(FailureKind::Classification);
                response.error = Some(reason);
                return Ok(response);
            }
        };

        if let Some(corrected) = self.ledger.correction_for(&op.requester, &op.request_hash).await? {
            debug!(op_id = %op.id, corrected = %corrected, "Applying prior correction");
            outcome = outcome.corrected(corrected);
        } else if let Some(snapshot) = self.learning.latest(&op.requester).await? {
            let factor = snapshot.calibration();
            if factor < 1.0 {
                debug!(op_id = %op.id, factor, "Calibrating confidence from learning history");
                outcome.confidence *= factor;
            }
        }

        self.ledger.set_classification(&op.id, &outcome.classification, outcome.confidence).await?;
        self.ledger.record_reasoning(&op.id, &outcome.reasoning).await?;
        info!(
            op_id = %op.id,
            classification = %outcome.classification,
            confidence = outcome.confidence,
            strategy = self.classifier.name(),
            "Operation classified"
        );

        let input = VerificationInput::new(&op.directive, outcome.classification, outcome.confidence, features.clone());
        let ctx = self.verification_context(op).await?;
        // Layers stat the filesystem and look up commands on PATH
        let verifier = Arc::clone(&self.verifier);
        let report = tokio::task::spawn_blocking(move || verifier.verify(&input, &ctx)).await?;
        self.ledger.record_verification(&op.id, &report.results).await?;

        if report.passed {
            self.ledger
                .transition(&op.id, OperationStatus::Classifying, OperationStatus::AwaitingApproval, None)
                .await?;
            response.status = OperationStatus::AwaitingApproval;
        } else {
            warn!(op_id = %op.id, issues = ?report.failures(), "Verification failed");
            self.ledger
                .transition(&op.id, OperationStatus::Classifying, OperationStatus::Failed, Some(FailureKind::Verification))
                .await?;
            response.status = OperationStatus::Failed;
            response.failure = Some(FailureKind::Verification);
        }

        response.classification = Some(outcome.classification);
        response.confidence = outcome.confidence;
        response.reasoning = Some(outcome.reasoning);
        response.verification = Some(report);
        Ok(response)
    }

    async fn verification_context(&self, op: &Operation) -> PipelineResult<VerificationContext> {
        let window = Duration::seconds(self.config.verification.rate_limit_window_secs as i64);
        let recent = self
            .ledger
            .count_recent_executes(&op.requester, Utc::now() - window, &op.id)
            .await?;
        let backups = self.executor.backups().clone();
        let backup_available = tokio::task::spawn_blocking(move || backups.available()).await?;
        Ok(
            VerificationContext::new(&self.config.verification, &op.requester, self.working_dir.clone())
                .with_backups(backup_available, self.config.execution.max_backup_bytes)
                .with_recent_executes(recent),
        )
    }

    async fn enrich_context(&self, requester: &str, context: Option<RequestContext>) -> PipelineResult<RequestContext> {
        let mut context = context.unwrap_or_default();
        if context.time_of_day.is_none() {
            context.time_of_day = Some(chrono::Local::now().hour() as u8);
        }
        if context.recent_operation_count.is_none() || context.recent_success_rate.is_none() {
            let since = Utc::now() - Duration::hours(RECENT_CONTEXT_HOURS);
            let (total, complete) = self.ledger.recent_outcomes(requester, since).await?;
            context.recent_operation_count.get_or_insert(total);
            if total > 0 {
                context
                    .recent_success_rate
                    .get_or_insert(f64::from(complete) / f64::from(total));
            }
        }
        Ok(context)
    }

    fn auto_executes(&self, response: &SubmitResponse) -> bool {
        self.config.pipeline.auto_execute_read_only
            && response
                .classification
                .is_some_and(|c| c.is_pure_read() && ExecutorKind::select(&c) == Some(ExecutorKind::Passthrough))
    }

    fn plan_for(&self, directive: &str, classification: Option<Classification>) -> PipelineResult<ExecutionPlan> {
        let classification = classification
            .ok_or_else(|| PipelineError::Execution("operation has no classification".to_string()))?;
        ExecutionPlan::build(directive, &classification).map_err(PipelineError::Execution)
    }

    /// Leave a failed status behind when a step errors out part way
    async fn guard<T>(&self, op_id: &str, work: impl std::future::Future<Output = PipelineResult<T>>) -> PipelineResult<T> {
        let result = work.await;
        // A lost compare-and-set means another caller owns the operation
        if let Err(e) = &result {
            if matches!(e, PipelineError::InvalidTransition { .. }) {
                return result;
            }
            if let Ok(Some(op)) = self.ledger.get_operation(op_id).await {
                let kind = match op.status {
                    OperationStatus::Classifying if op.classification.is_none() => FailureKind::Classification,
                    OperationStatus::Classifying | OperationStatus::AwaitingApproval => FailureKind::Verification,
                    _ => FailureKind::Execution,
                };
                if !op.status.is_terminal() && op.status.can_transition_to(OperationStatus::Failed) {
                    warn!(op_id = %op_id, error = %e, "Marking operation failed after error");
                    if let Err(err) = self.ledger.transition(op_id, op.status, OperationStatus::Failed, Some(kind)).await {
                        warn!(op_id = %op_id, error = %err, "Could not mark operation failed");
                    }
                }
            }
        }
        result
    }

    // ---- execution ----

    /// Claim an awaiting operation and run it
    async fn run(&self, op_id: &str, plan: &ExecutionPlan) -> PipelineResult<ExecutionRecord> {
        self.ledger.begin_execution(op_id).await?;
        self.run_claimed(op_id, plan).await
    }

    async fn run_claimed(&self, op_id: &str, plan: &ExecutionPlan) -> PipelineResult<ExecutionRecord> {
        let record = self.executor.execute(op_id, plan, false).await;
        let stored = self.ledger.record_execution(&record).await;

        let (to, failure) = if record.success && stored.is_ok() {
            (OperationStatus::Complete, None)
        } else {
            (OperationStatus::Failed, Some(FailureKind::Execution))
        };
        self.ledger
            .transition(op_id, OperationStatus::Executing, to, failure)
            .await?;
        stored?;
        Ok(record)
    }

    /// Run the steps of an already verified parent in order, stopping at
    /// the first failure
    async fn execute_claimed(&self, parent_id: &str) -> PipelineResult<()> {
        self.ledger.begin_execution(parent_id).await?;
        let parent = self.ledger.require_operation(parent_id).await?;

        let mut failed = false;
        for child_id in &parent.children {
            let child = self.ledger.require_operation(child_id).await?;
            if failed {
                self.ledger
                    .transition(child_id, OperationStatus::AwaitingApproval, OperationStatus::Cancelled, None)
                    .await?;
                continue;
            }
            let step = async {
                let plan = self.plan_for(&child.directive, child.classification)?;
                self.guard(child_id, self.run(child_id, &plan)).await
            };
            match step.await {
                Ok(record) => failed = !record.success,
                Err(e) => {
                    warn!(op_id = %parent_id, step = %child_id, error = %e, "Step errored, abandoning the rest");
                    if let Err(err) = self.cancel_waiting_steps(parent_id).await {
                        warn!(op_id = %parent_id, error = %err, "Could not cancel remaining steps");
                    }
                    if let Err(err) = self
                        .ledger
                        .transition(parent_id, OperationStatus::Executing, OperationStatus::Failed, Some(FailureKind::Execution))
                        .await
                    {
                        warn!(op_id = %parent_id, error = %err, "Could not mark operation failed");
                    }
                    return Err(e);
                }
            }
        }

        let (to, failure) = if failed {
            (OperationStatus::Failed, Some(FailureKind::Execution))
        } else {
            (OperationStatus::Complete, None)
        };
        self.ledger.transition(parent_id, OperationStatus::Executing, to, failure).await
    }

    async fn cancel_waiting_steps(&self, parent_id: &str) -> PipelineResult<()> {
        let parent = self.ledger.require_operation(parent_id).await?;
        for child_id in &parent.children {
            let child = self.ledger.require_operation(child_id).await?;
            if child.status == OperationStatus::AwaitingApproval {
                self.ledger
                    .transition(child_id, OperationStatus::AwaitingApproval, OperationStatus::Cancelled, None)
                    .await?;
            }
        }
        Ok(())
    }

    fn top_level(op: &Operation) -> PipelineResult<()> {
        match &op.parent_id {
            Some(parent) => Err(PipelineError::Execution(format!(
                "{} is a step of {}; act on the parent instead",
                op.id, parent
            ))),
            None => Ok(()),
        }
    }

    fn awaiting(op: &Operation, to: OperationStatus) -> PipelineResult<()> {
        if op.status == OperationStatus::AwaitingApproval {
            Ok(())
        } else {
            Err(PipelineError::InvalidTransition {
                id: op.id.clone(),
                from: op.status,
                to,
            })
        }
    }

    /// Execute an operation waiting for approval
    pub async fn approve(&self, op_id: &str) -> PipelineResult<OperationView> {
        let op = self.ledger.require_operation(op_id).await?;
        Self::top_level(&op)?;
        Self::awaiting(&op, OperationStatus::Executing)?;
        let latency = latency_ms(op.updated_at);

        if op.is_composite() {
            self.guard(op_id, self.execute_claimed(op_id)).await?;
        } else {
            let plan = self.plan_for(&op.directive, op.classification)?;
            self.guard(op_id, self.run(op_id, &plan)).await?;
        }

        if let Err(e) = self.feedback.approval(op_id, true, latency).await {
            warn!(op_id = %op_id, error = %e, "Could not record approval feedback");
        }
        self.operation(op_id).await
    }

    /// Cancel an operation waiting for approval
    pub async fn reject(&self, op_id: &str) -> PipelineResult<OperationView> {
        let op = self.ledger.require_operation(op_id).await?;
        Self::top_level(&op)?;
        Self::awaiting(&op, OperationStatus::Cancelled)?;
        let latency = latency_ms(op.updated_at);

        self.ledger
            .transition(op_id, OperationStatus::AwaitingApproval, OperationStatus::Cancelled, None)
            .await?;
        self.cancel_waiting_steps(op_id).await?;
        info!(op_id = %op_id, "Operation rejected");

        if let Err(e) = self.feedback.approval(op_id, false, latency).await {
            warn!(op_id = %op_id, error = %e, "Could not record rejection feedback");
        }
        self.operation(op_id).await
    }

    /// Simulate an awaiting operation. Nothing is mutated or recorded.
    pub async fn preview(&self, op_id: &str) -> PipelineResult<Vec<ExecutionRecord>> {
        let op = self.ledger.require_operation(op_id).await?;
        Self::awaiting(&op, OperationStatus::Executing)?;

        let targets = if op.is_composite() { op.children.clone() } else { vec![op.id.clone()] };
        let mut records = Vec::with_capacity(targets.len());
        for id in targets {
            let target = self.ledger.require_operation(&id).await?;
            let plan = self.plan_for(&target.directive, target.classification)?;
            records.push(self.executor.execute(&id, &plan, true).await);
        }
        Ok(records)
    }

    // ---- undo ----

    /// Replay the undo actions of a finished operation. Steps of a
    /// composite operation are undone in reverse order.
    pub async fn undo(&self, op_id: &str) -> PipelineResult<UndoReport> {
        let op = self
            .ledger
            .get_operation(op_id)
            .await?
            .ok_or_else(|| UndoError::UnknownOperation(op_id.to_string()))?;

        let targets: Vec<String> = if op.is_composite() {
            op.children.iter().rev().cloned().collect()
        } else {
            vec![op.id.clone()]
        };

        let mut records = Vec::new();
        let mut consumed = 0;
        for id in &targets {
            match self.ledger.execution(id).await? {
                Some(record) if record.reversible && !record.simulated => {
                    if self.ledger.undo_consumed(id).await? {
                        consumed += 1;
                    } else {
                        records.push(record);
                    }
                }
                _ => {}
            }
        }

        if records.is_empty() {
            return Err(match (consumed, self.ledger.execution(&targets[0]).await?) {
                (n, _) if n > 0 => UndoError::AlreadyConsumed(op_id.to_string()),
                (_, Some(_)) if !op.is_composite() => UndoError::NotReversible(op_id.to_string()),
                _ => UndoError::NoBackup(op_id.to_string()),
            }
            .into());
        }

        let mut actions = Vec::new();
        for record in &records {
            if !self.ledger.claim_undo(&record.operation_id).await? {
                if records.len() == 1 {
                    return Err(UndoError::AlreadyConsumed(op_id.to_string()).into());
                }
                continue;
            }
            actions.extend(self.executor.undo(record).await?);

            if let Err(e) = self
                .feedback
                .behavioral(&record.operation_id, BehavioralSignal::Undo, latency_ms(record.finished_at))
                .await
            {
                warn!(op_id = %record.operation_id, error = %e, "Could not record undo signal");
            }
        }

        info!(op_id = %op_id, actions = actions.len(), "Operation undone");
        Ok(UndoReport {
            operation_id: op_id.to_string(),
            actions,
        })
    }

    /// Undo the most recent reversible operation of `requester`
    pub async fn undo_latest(&self, requester: &str) -> PipelineResult<UndoReport> {
        match self.ledger.latest_reversible(requester).await? {
            Some(op_id) => self.undo(&op_id).await,
            None => Err(UndoError::NoBackup(format!("requester {}", requester)).into()),
        }
    }

    // ---- queries ----

    pub async fn operation(&self, op_id: &str) -> PipelineResult<OperationView> {
        let op = self.ledger.require_operation(op_id).await?;
        let mut steps = Vec::with_capacity(op.children.len());
        for child_id in &op.children {
            let child = self.ledger.require_operation(child_id).await?;
            steps.push(self.view(child).await?);
        }
        let mut view = self.view(op).await?;
        view.steps = steps;
        view.similar = self.similar_to(op_id).await?;
        Ok(view)
    }

    async fn similar_to(&self, op_id: &str) -> PipelineResult<Vec<(String, f32)>> {
        let Some(features) = self.ledger.features(op_id).await? else {
            return Ok(Vec::new());
        };
        let mut similar = self.ledger.find_similar(&features.embedding, SIMILAR_LIMIT + 1).await?;
        similar.retain(|(id, _)| id != op_id);
        similar.truncate(SIMILAR_LIMIT);
        Ok(similar)
    }

    async fn view(&self, op: Operation) -> PipelineResult<OperationView> {
        Ok(OperationView {
            reasoning: self.ledger.reasoning(&op.id).await?.pop(),
            verification: self.ledger.verification_results(&op.id).await?,
            execution: self.ledger.execution(&op.id).await?,
            undo_consumed: self.ledger.undo_consumed(&op.id).await?,
            feedback: self.feedback.summary(&op.id).await?,
            similar: Vec::new(),
            steps: Vec::new(),
            operation: op,
        })
    }

    /// Operations of `requester` created since `since`, oldest first
    pub async fn history(&self, requester: &str, since: DateTime<Utc>) -> PipelineResult<Vec<Operation>> {
        self.ledger
            .operations_for_requester(requester, since, Utc::now() + Duration::milliseconds(1))
            .await
    }
}

fn latency_ms(since: DateTime<Utc>) -> u64 {
    (Utc::now() - since).num_milliseconds().max(0) as u64
}

/// Split "a and then b, then c" into its steps
pub fn split_steps(directive: &str) -> Vec<String> {
    STEP_SPLIT_RE
        .split(directive)
        .map(|s| s.trim().trim_end_matches([',', ';']).trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
