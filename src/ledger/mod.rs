//! Durable operation ledger
//!
//! The single source of truth for every operation. Addressed by operation
//! id, with secondary lookup by requester and time range. Status changes
//! are compare-and-set updates so two workers can never both move the same
//! operation out of `awaiting_approval`.

pub mod schema;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};
use crate::execution::ExecutionRecord;
use crate::features::{cosine_similarity, FeatureRecord};
use crate::feedback::{FeedbackChannel, FeedbackEvent, FeedbackPayload};
use crate::learning::LearningMetricSnapshot;
use crate::types::{
    Classification, ClassificationReasoning, Consumer, Destination, FailureKind, Operation,
    OperationStatus, Semantics,
};
use crate::verification::{Layer, VerificationResult};

const OPERATION_COLUMNS: &str = "id, directive, requester, destination, consumer, semantics,
     confidence, status, failure, parent_id, request_hash, created_at, updated_at";

/// SQLite-backed ledger
#[derive(Clone)]
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

impl Ledger {
    /// Open (or create) a ledger at the given path
    pub async fn open<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
        schema::init(&conn)?;

        info!(path = %path.display(), "Opened operation ledger");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> PipelineResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---- operations ----

    pub async fn insert_operation(&self, op: &Operation, position: usize) -> PipelineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO operations
             (id, directive, requester, destination, consumer, semantics, confidence, status,
              failure, parent_id, position, request_hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                op.id,
                op.directive,
                op.requester,
                op.classification.map(|c| c.destination.as_str()),
                op.classification.map(|c| c.consumer.as_str()),
                op.classification.map(|c| c.semantics.as_str()),
                op.confidence,
                op.status.as_str(),
                op.failure.map(|f| f.as_str()),
                op.parent_id,
                position as i64,
                op.request_hash,
                to_ms(op.created_at),
                to_ms(op.updated_at),
            ],
        )?;
        debug!(op_id = %op.id, requester = %op.requester, "Inserted operation");
        Ok(())
    }

    /// Store the classification of an operation that is still `classifying`
    pub async fn set_classification(
        &self,
        id: &str,
        classification: &Classification,
        confidence: f64,
    ) -> PipelineResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE operations
             SET destination = ?1, consumer = ?2, semantics = ?3, confidence = ?4, updated_at = ?5
             WHERE id = ?6 AND status = 'classifying'",
            params![
                classification.destination.as_str(),
                classification.consumer.as_str(),
                classification.semantics.as_str(),
                confidence,
                to_ms(Utc::now()),
                id,
            ],
        )?;
        if changed != 1 {
            return Err(Self::transition_error(&conn, id, OperationStatus::Classifying, OperationStatus::Classifying)?);
        }
        Ok(())
    }

    pub async fn get_operation(&self, id: &str) -> PipelineResult<Option<Operation>> {
        let conn = self.conn.lock().await;
        let op = conn
            .query_row(
                &format!("SELECT {} FROM operations WHERE id = ?1", OPERATION_COLUMNS),
                params![id],
                operation_from_row,
            )
            .optional()?;

        match op {
            Some(mut op) => {
                op.children = Self::child_ids(&conn, id)?;
                Ok(Some(op))
            }
            None => Ok(None),
        }
    }

    /// Like [`Ledger::get_operation`] but missing ids are an error
    pub async fn require_operation(&self, id: &str) -> PipelineResult<Operation> {
        self.get_operation(id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))
    }

    fn child_ids(conn: &Connection, parent: &str) -> rusqlite::Result<Vec<String>> {
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM operations WHERE parent_id = ?1 ORDER BY position",
        )?;
        let ids = stmt
            .query_map(params![parent], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Compare-and-set status change. Fails with `InvalidTransition` when the
    /// edge is not in the lifecycle graph or the operation is no longer in
    /// `from`.
    pub async fn transition(
        &self,
        id: &str,
        from: OperationStatus,
        to: OperationStatus,
        failure: Option<FailureKind>,
    ) -> PipelineResult<()> {
        if !from.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition {
                id: id.to_string(),
                from,
                to,
            });
        }

        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE operations SET status = ?1, failure = ?2, updated_at = ?3
             WHERE id = ?4 AND status = ?5",
            params![to.as_str(), failure.map(|f| f.as_str()), to_ms(Utc::now()), id, from.as_str()],
        )?;

        if changed != 1 {
            return Err(Self::transition_error(&conn, id, from, to)?);
        }

        info!(op_id = %id, from = %from, to = %to, "Operation status changed");
        Ok(())
    }

    /// Atomically move `awaiting_approval -> executing`, refusing unless every
    /// verification layer is recorded as passed
    pub async fn begin_execution(&self, id: &str) -> PipelineResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let passed: i64 = tx.query_row(
            "SELECT COUNT(DISTINCT layer) FROM verification_results
             WHERE operation_id = ?1 AND passed = 1",
            params![id],
            |row| row.get(0),
        )?;

        if passed < Layer::ALL.len() as i64 {
            let status = current_status(&tx, id)?;
            return Err(match status {
                None => PipelineError::NotFound(id.to_string()),
                Some(_) => PipelineError::Verification {
                    issues: vec![format!(
                        "only {} of {} verification layers recorded as passed",
                        passed,
                        Layer::ALL.len()
                    )],
                },
            });
        }

        let changed = tx.execute(
            "UPDATE operations SET status = 'executing', updated_at = ?1
             WHERE id = ?2 AND status = 'awaiting_approval'",
            params![to_ms(Utc::now()), id],
        )?;

        if changed != 1 {
            let err = Self::transition_error(&tx, id, OperationStatus::AwaitingApproval, OperationStatus::Executing)?;
            return Err(err);
        }

        tx.commit()?;
        info!(op_id = %id, "Operation claimed for execution");
        Ok(())
    }

    fn transition_error(
        conn: &Connection,
        id: &str,
        from: OperationStatus,
        to: OperationStatus,
    ) -> PipelineResult<PipelineError> {
        Ok(match current_status(conn, id)? {
            None => PipelineError::NotFound(id.to_string()),
            Some(current) => PipelineError::InvalidTransition {
                id: id.to_string(),
                from: if current == from { from } else { current },
                to,
            },
        })
    }

    /// Operations of one requester created in `[from, to)`, oldest first
    pub async fn operations_for_requester(
        &self,
        requester: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> PipelineResult<Vec<Operation>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM operations
             WHERE requester = ?1 AND created_at >= ?2 AND created_at < ?3
             ORDER BY created_at, position",
            OPERATION_COLUMNS
        ))?;
        let mut ops = stmt
            .query_map(params![requester, to_ms(from), to_ms(to)], operation_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        for op in ops.iter_mut() {
            op.children = Self::child_ids(&conn, &op.id)?;
        }
        Ok(ops)
    }

    /// Requesters with at least one operation since `since`
    pub async fn active_requesters(&self, since: DateTime<Utc>) -> PipelineResult<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT requester FROM operations WHERE created_at >= ?1 ORDER BY requester",
        )?;
        let requesters = stmt
            .query_map(params![to_ms(since)], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(requesters)
    }

    /// Execute-semantics operations by `requester` since `since`, not
    /// counting `excluding`. Backs the Safety rate limit.
    pub async fn count_recent_executes(
        &self,
        requester: &str,
        since: DateTime<Utc>,
        excluding: &str,
    ) -> PipelineResult<u32> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM operations
             WHERE requester = ?1 AND semantics = 'execute' AND created_at >= ?2 AND id != ?3",
            params![requester, to_ms(since), excluding],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u32)
    }

    /// Finished top-level operations since `since` and how many completed
    pub async fn recent_outcomes(&self, requester: &str, since: DateTime<Utc>) -> PipelineResult<(u32, u32)> {
        let conn = self.conn.lock().await;
        let (total, complete): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(status = 'complete'), 0) FROM operations
             WHERE requester = ?1 AND created_at >= ?2 AND parent_id IS NULL
               AND status IN ('complete', 'failed', 'cancelled')",
            params![requester, to_ms(since)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((total.max(0) as u32, complete.max(0) as u32))
    }

    // ---- immutable records ----

    pub async fn record_reasoning(&self, op_id: &str, reasoning: &ClassificationReasoning) -> PipelineResult<()> {
        let json = serde_json::to_string(reasoning)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO classification_reasoning (operation_id, strategy, reasoning, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![op_id, reasoning.strategy, json, to_ms(Utc::now())],
        )?;
        Ok(())
    }

    pub async fn reasoning(&self, op_id: &str) -> PipelineResult<Vec<ClassificationReasoning>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT reasoning FROM classification_reasoning WHERE operation_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![op_id], |row| json_col(row, 0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn record_features(&self, op_id: &str, features: &FeatureRecord) -> PipelineResult<()> {
        let mut stored = features.clone();
        let embedding = std::mem::take(&mut stored.embedding);
        let json = serde_json::to_string(&stored)?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO features (operation_id, request_hash, embedding, record, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![op_id, features.request_hash, embedding_to_blob(&embedding), json, to_ms(Utc::now())],
        )?;
        Ok(())
    }

    pub async fn features(&self, op_id: &str) -> PipelineResult<Option<FeatureRecord>> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                "SELECT record, embedding FROM features WHERE operation_id = ?1",
                params![op_id],
                |row| {
                    let mut record: FeatureRecord = json_col(row, 0)?;
                    let blob: Vec<u8> = row.get(1)?;
                    record.embedding = blob_to_embedding(&blob);
                    Ok(record)
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Operations whose stored embedding is closest to `embedding`
    pub async fn find_similar(&self, embedding: &[f32], limit: usize) -> PipelineResult<Vec<(String, f32)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT operation_id, embedding FROM features")?;
        let mut scored = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((id, cosine_similarity(embedding, &blob_to_embedding(&blob))))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    pub async fn record_verification(&self, op_id: &str, results: &[VerificationResult]) -> PipelineResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO verification_results
                 (operation_id, layer, position, passed, skipped, confidence, issues, details,
                  duration_ms, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            let now = to_ms(Utc::now());
            for result in results {
                stmt.execute(params![
                    op_id,
                    result.layer.as_str(),
                    result.layer.position() as i64,
                    result.passed,
                    result.skipped,
                    result.confidence,
                    serde_json::to_string(&result.issues)?,
                    result.details,
                    result.duration_ms as i64,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn verification_results(&self, op_id: &str) -> PipelineResult<Vec<VerificationResult>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT layer, passed, skipped, confidence, issues, details, duration_ms
             FROM verification_results WHERE operation_id = ?1 ORDER BY position",
        )?;
        let rows = stmt
            .query_map(params![op_id], |row| {
                let layer: String = row.get(0)?;
                let duration: i64 = row.get(6)?;
                Ok(VerificationResult {
                    layer: Layer::parse(&layer).ok_or_else(|| bad_column(0, format!("unknown layer {}", layer)))?,
                    passed: row.get(1)?,
                    skipped: row.get(2)?,
                    confidence: row.get(3)?,
                    issues: json_col(row, 4)?,
                    details: row.get(5)?,
                    duration_ms: duration.max(0) as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Store the single execution record of an operation
    pub async fn record_execution(&self, record: &ExecutionRecord) -> PipelineResult<()> {
        let json = serde_json::to_string(record)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO executions
             (operation_id, executor, success, simulated, reversible, record, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.operation_id,
                record.executor.as_str(),
                record.success,
                record.simulated,
                record.reversible,
                json,
                to_ms(record.finished_at),
            ],
        )?;
        Ok(())
    }

    pub async fn execution(&self, op_id: &str) -> PipelineResult<Option<ExecutionRecord>> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                "SELECT record FROM executions WHERE operation_id = ?1",
                params![op_id],
                |row| json_col(row, 0),
            )
            .optional()?;
        Ok(record)
    }

    pub async fn undo_consumed(&self, op_id: &str) -> PipelineResult<bool> {
        let conn = self.conn.lock().await;
        let consumed: Option<bool> = conn
            .query_row(
                "SELECT undo_consumed FROM executions WHERE operation_id = ?1",
                params![op_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(consumed.unwrap_or(false))
    }

    /// Claim the undo list of an execution. Returns false when another
    /// caller already consumed it.
    pub async fn claim_undo(&self, op_id: &str) -> PipelineResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE executions SET undo_consumed = 1
             WHERE operation_id = ?1 AND reversible = 1 AND undo_consumed = 0",
            params![op_id],
        )?;
        Ok(changed == 1)
    }

    /// Most recent operation of `requester` with an unconsumed reversible
    /// execution. Child operations resolve to their parent.
    pub async fn latest_reversible(&self, requester: &str) -> PipelineResult<Option<String>> {
        let conn = self.conn.lock().await;
        let id = conn
            .query_row(
                "SELECT COALESCE(o.parent_id, o.id) FROM executions e
                 JOIN operations o ON o.id = e.operation_id
                 WHERE o.requester = ?1 AND e.reversible = 1 AND e.undo_consumed = 0
                   AND e.simulated = 0
                 ORDER BY e.created_at DESC, o.position DESC
                 LIMIT 1",
                params![requester],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    // ---- feedback ----

    pub async fn insert_feedback(&self, event: &FeedbackEvent) -> PipelineResult<()> {
        let json = serde_json::to_string(&event.payload)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO feedback_events
             (id, operation_id, requester, channel, payload, confidence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.id,
                event.operation_id,
                event.requester,
                event.payload.channel().as_str(),
                json,
                event.confidence,
                to_ms(event.created_at),
            ],
        )?;
        Ok(())
    }

    pub async fn feedback_for(&self, op_id: &str) -> PipelineResult<Vec<FeedbackEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, operation_id, requester, payload, confidence, created_at
             FROM feedback_events WHERE operation_id = ?1 ORDER BY created_at, id",
        )?;
        let events = stmt
            .query_map(params![op_id], feedback_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Feedback on operations of `requester` created in `[from, to)`
    pub async fn feedback_in_window(
        &self,
        requester: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> PipelineResult<Vec<FeedbackEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT f.id, f.operation_id, f.requester, f.payload, f.confidence, f.created_at
             FROM feedback_events f JOIN operations o ON o.id = f.operation_id
             WHERE o.requester = ?1 AND o.created_at >= ?2 AND o.created_at < ?3
             ORDER BY f.created_at, f.id",
        )?;
        let events = stmt
            .query_map(params![requester, to_ms(from), to_ms(to)], feedback_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Latest correction the requester gave for the same normalised directive
    pub async fn correction_for(&self, requester: &str, request_hash: &str) -> PipelineResult<Option<Classification>> {
        let conn = self.conn.lock().await;
        let payload: Option<FeedbackPayload> = conn
            .query_row(
                "SELECT f.payload FROM feedback_events f JOIN operations o ON o.id = f.operation_id
                 WHERE o.requester = ?1 AND o.request_hash = ?2 AND f.channel = ?3
                 ORDER BY f.created_at DESC LIMIT 1",
                params![requester, request_hash, FeedbackChannel::Correction.as_str()],
                |row| json_col(row, 0),
            )
            .optional()?;

        Ok(match payload {
            Some(FeedbackPayload::Correction { corrected, .. }) => Some(corrected),
            _ => None,
        })
    }

    /// Most recent corrections of `requester`, newest first
    pub async fn recent_corrections(&self, requester: &str, limit: usize) -> PipelineResult<Vec<FeedbackEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, operation_id, requester, payload, confidence, created_at
             FROM feedback_events WHERE requester = ?1 AND channel = ?2
             ORDER BY created_at DESC LIMIT ?3",
        )?;
        let events = stmt
            .query_map(
                params![requester, FeedbackChannel::Correction.as_str(), limit as i64],
                feedback_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    // ---- learning ----

    /// Snapshots are insert-only
    pub async fn insert_snapshot(&self, snapshot: &LearningMetricSnapshot) -> PipelineResult<()> {
        let json = serde_json::to_string(snapshot)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO learning_snapshots
             (id, requester, window_start, window_end, accuracy, improvement, snapshot, computed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                snapshot.id,
                snapshot.requester,
                to_ms(snapshot.window_start),
                to_ms(snapshot.window_end),
                snapshot.accuracy,
                snapshot.improvement,
                json,
                to_ms(snapshot.computed_at),
            ],
        )?;
        Ok(())
    }

    /// Snapshot history of a requester, newest first
    pub async fn snapshots(&self, requester: &str, limit: usize) -> PipelineResult<Vec<LearningMetricSnapshot>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT snapshot FROM learning_snapshots WHERE requester = ?1
             ORDER BY computed_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![requester, limit as i64], |row| json_col(row, 0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn current_status(conn: &Connection, id: &str) -> rusqlite::Result<Option<OperationStatus>> {
    let status: Option<String> = conn
        .query_row("SELECT status FROM operations WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?;
    Ok(status.and_then(|s| OperationStatus::parse(&s)))
}

fn operation_from_row(row: &Row<'_>) -> rusqlite::Result<Operation> {
    let destination: Option<String> = row.get(3)?;
    let consumer: Option<String> = row.get(4)?;
    let semantics: Option<String> = row.get(5)?;
    let classification = match (destination, consumer, semantics) {
        (Some(d), Some(c), Some(s)) => Some(Classification::new(
            Destination::parse(&d).ok_or_else(|| bad_column(3, format!("bad destination {}", d)))?,
            Consumer::parse(&c).ok_or_else(|| bad_column(4, format!("bad consumer {}", c)))?,
            Semantics::parse(&s).ok_or_else(|| bad_column(5, format!("bad semantics {}", s)))?,
        )),
        _ => None,
    };

    let status: String = row.get(7)?;
    let failure: Option<String> = row.get(8)?;

    Ok(Operation {
        id: row.get(0)?,
        directive: row.get(1)?,
        requester: row.get(2)?,
        classification,
        confidence: row.get(6)?,
        status: OperationStatus::parse(&status)
            .ok_or_else(|| bad_column(7, format!("bad status {}", status)))?,
        failure: failure.as_deref().and_then(FailureKind::parse),
        parent_id: row.get(9)?,
        children: Vec::new(),
        request_hash: row.get(10)?,
        created_at: from_ms(row.get(11)?),
        updated_at: from_ms(row.get(12)?),
    })
}

fn feedback_from_row(row: &Row<'_>) -> rusqlite::Result<FeedbackEvent> {
    Ok(FeedbackEvent {
        id: row.get(0)?,
        operation_id: row.get(1)?,
        requester: row.get(2)?,
        payload: json_col(row, 3)?,
        confidence: row.get(4)?,
        created_at: from_ms(row.get(5)?),
    })
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn bad_column(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

pub(crate) fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Convert embedding vector to binary blob
fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        blob.extend_from_slice(&val.to_le_bytes());
    }
    blob
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
