//! Execution engine
//!
//! The executor is picked once from the classification triple and carried
//! as an [`ExecutionPlan`]. Each run yields one [`ExecutionRecord`] with
//! before/after state and the ordered undo actions that reverse it.

pub mod backup;
pub mod file;
pub mod interpreter;
pub mod process;

pub use backup::{BackupStore, FileState, StateSnapshot};
pub use file::{FileAction, FileExecutor};
pub use interpreter::InterpreterExecutor;
pub use process::ProcessExecutor;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::ExecutionConfig;
use crate::error::UndoError;
use crate::features::lexicon;
use crate::types::{Classification, Consumer, Destination, Semantics};

static BACKTICK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`]+)`").unwrap());
static QUOTED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""([^"]+)"|'([^']+)'"#).unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    Passthrough,
    File,
    Process,
    Interpreter,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::Passthrough => "passthrough",
            ExecutorKind::File => "file",
            ExecutorKind::Process => "process",
            ExecutorKind::Interpreter => "interpreter",
        }
    }

    /// The executor for a triple. Pass-through only serves stream reads and
    /// human interpretation; `None` means nothing can carry the triple out.
    pub fn select(classification: &Classification) -> Option<Self> {
        let Classification {
            destination,
            consumer,
            semantics,
        } = *classification;
        match (destination, consumer, semantics) {
            (_, Consumer::Machine, Semantics::Interpret) => Some(ExecutorKind::Interpreter),
            (Destination::Process, _, Semantics::Read | Semantics::Execute)
            | (Destination::Stream, _, Semantics::Execute) => Some(ExecutorKind::Process),
            (Destination::File, _, Semantics::Read | Semantics::Execute) => Some(ExecutorKind::File),
            (Destination::Stream, _, Semantics::Read | Semantics::Interpret) => Some(ExecutorKind::Passthrough),
            (Destination::File | Destination::Process, Consumer::Human, Semantics::Interpret) => None,
        }
    }
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What will run, fixed before verification starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "executor", rename_all = "lowercase")]
pub enum ExecutionPlan {
    Passthrough { text: String },
    File(FileAction),
    Process { command: String },
    Interpreter { script: String },
}

impl ExecutionPlan {
    /// Derive the plan for a classified directive. An error means the
    /// directive has no runnable form for its executor.
    pub fn build(directive: &str, classification: &Classification) -> Result<Self, String> {
        let text = directive.trim();
        let kind = ExecutorKind::select(classification)
            .ok_or_else(|| format!("no executor handles {}", classification))?;
        match kind {
            ExecutorKind::Passthrough => Ok(ExecutionPlan::Passthrough { text: text.to_string() }),
            ExecutorKind::File => {
                let action = FileAction::parse(text)?;
                let reading = classification.semantics == Semantics::Read;
                if action.is_read() != reading {
                    return Err(format!(
                        "'{}' is a {} action but the operation is classified {}",
                        text,
                        action.verb(),
                        classification
                    ));
                }
                Ok(ExecutionPlan::File(action))
            }
            ExecutorKind::Process => Ok(ExecutionPlan::Process {
                command: extract_command(text),
            }),
            ExecutorKind::Interpreter => {
                let script = extract_script(text);
                if script.is_empty() {
                    Err(format!("no script found in '{}'", text))
                } else {
                    Ok(ExecutionPlan::Interpreter { script })
                }
            }
        }
    }

    pub fn kind(&self) -> ExecutorKind {
        match self {
            ExecutionPlan::Passthrough { .. } => ExecutorKind::Passthrough,
            ExecutionPlan::File(_) => ExecutorKind::File,
            ExecutionPlan::Process { .. } => ExecutorKind::Process,
            ExecutionPlan::Interpreter { .. } => ExecutorKind::Interpreter,
        }
    }

    /// The text the syntax checks look at
    pub fn payload(&self) -> &str {
        match self {
            ExecutionPlan::Passthrough { text } => text,
            ExecutionPlan::File(action) => action.path(),
            ExecutionPlan::Process { command } => command,
            ExecutionPlan::Interpreter { script } => script,
        }
    }
}

fn extract_command(text: &str) -> String {
    if let Some(caps) = BACKTICK_RE.captures(text) {
        return caps[1].trim().to_string();
    }
    let mut words = text.splitn(2, char::is_whitespace);
    let first = words.next().unwrap_or_default().to_lowercase();
    let rest = words.next().unwrap_or_default().trim();
    if matches!(first.as_str(), "run" | "execute" | "exec") {
        let head = rest.split_whitespace().next().unwrap_or_default();
        if lexicon::contains(lexicon::SHELL_COMMANDS, head) || head.contains('/') {
            return rest.to_string();
        }
    }
    text.to_string()
}

fn extract_script(text: &str) -> String {
    if let Some(caps) = BACKTICK_RE.captures(text) {
        return caps[1].trim().to_string();
    }
    if let Some(caps) = QUOTED_RE.captures(text) {
        if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
            return m.as_str().trim().to_string();
        }
    }
    text.split_once(char::is_whitespace)
        .map(|(_, rest)| rest.trim().to_string())
        .unwrap_or_default()
}

/// One step of reversing an execution, replayed in registration order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UndoAction {
    RestoreBackup { original: PathBuf, backup: PathBuf },
    DeleteCreated { path: PathBuf },
    RunCommand { command: String },
}

impl std::fmt::Display for UndoAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UndoAction::RestoreBackup { original, backup } => {
                write!(f, "restore {} from {}", original.display(), backup.display())
            }
            UndoAction::DeleteCreated { path } => write!(f, "delete created file {}", path.display()),
            UndoAction::RunCommand { command } => write!(f, "run `{}`", command),
        }
    }
}

/// What a single executor produced, before the engine adds timing and
/// state snapshots
#[derive(Debug, Default)]
pub struct ExecutorOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub affected_paths: Vec<PathBuf>,
    pub process_ids: Vec<u32>,
    pub undo_actions: Vec<UndoAction>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub operation_id: String,
    pub executor: ExecutorKind,
    pub success: bool,
    pub simulated: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub affected_paths: Vec<PathBuf>,
    pub process_ids: Vec<u32>,
    pub state_before: StateSnapshot,
    pub state_after: StateSnapshot,
    pub reversible: bool,
    pub undo_actions: Vec<UndoAction>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Cut `text` to at most `max_bytes` on a char boundary
pub fn truncate_output(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated, total: {} bytes]", &text[..end], text.len())
}

/// Run filesystem work on the blocking pool
pub(crate) async fn blocking<T, F>(work: F) -> Result<T, String>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| format!("blocking task failed: {}", e))
}

#[derive(Clone)]
pub struct ExecutionEngine {
    backups: BackupStore,
    file: FileExecutor,
    process: ProcessExecutor,
    interpreter: InterpreterExecutor,
    dry_run: bool,
}

impl ExecutionEngine {
    pub fn new(config: &ExecutionConfig, backup_dir: PathBuf, working_dir: PathBuf) -> Self {
        let backups = BackupStore::new(backup_dir, config.max_backup_bytes);
        let timeout = config.effective_timeout();
        Self {
            file: FileExecutor::new(backups.clone(), working_dir.clone()),
            process: ProcessExecutor::new(backups.clone(), working_dir, timeout, config.max_output_bytes),
            interpreter: InterpreterExecutor::new(timeout, config.max_output_bytes),
            backups,
            dry_run: config.dry_run,
        }
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// Paths whose state is captured around a run of `plan`
    pub fn watched_paths(&self, plan: &ExecutionPlan) -> Vec<PathBuf> {
        match plan {
            ExecutionPlan::File(action) => vec![self.file.resolve(action)],
            ExecutionPlan::Process { command } => self.process.touched_paths(command),
            _ => Vec::new(),
        }
    }

    async fn capture(&self, plan: &ExecutionPlan) -> (Vec<PathBuf>, StateSnapshot) {
        let engine = self.clone();
        let plan = plan.clone();
        blocking(move || {
            let watched = engine.watched_paths(&plan);
            let snapshot = engine.backups.snapshot(&watched);
            (watched, snapshot)
        })
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "State capture failed");
            (Vec::new(), StateSnapshot::default())
        })
    }

    async fn snapshot(&self, paths: &[PathBuf]) -> StateSnapshot {
        let backups = self.backups.clone();
        let paths = paths.to_vec();
        blocking(move || backups.snapshot(&paths)).await.unwrap_or_else(|e| {
            warn!(error = %e, "State capture failed");
            StateSnapshot::default()
        })
    }

    /// Run `plan` for `operation_id`. Failures come back inside the record.
    pub async fn execute(&self, operation_id: &str, plan: &ExecutionPlan, simulate: bool) -> ExecutionRecord {
        let simulate = simulate || self.dry_run;
        let started_at = Utc::now();
        let start = Instant::now();
        let (watched, state_before) = self.capture(plan).await;

        let output = if simulate {
            match self.preview(plan).await {
                Ok(text) => ExecutorOutput {
                    success: true,
                    stdout: text,
                    affected_paths: watched.clone(),
                    ..Default::default()
                },
                Err(e) => ExecutorOutput {
                    error: Some(e),
                    ..Default::default()
                },
            }
        } else {
            match plan {
                ExecutionPlan::Passthrough { text } => ExecutorOutput {
                    success: true,
                    stdout: text.clone(),
                    ..Default::default()
                },
                ExecutionPlan::File(action) => {
                    let file = self.file.clone();
                    let action = action.clone();
                    blocking(move || file.run(&action))
                        .await
                        .unwrap_or_else(|e| ExecutorOutput {
                            error: Some(e),
                            ..Default::default()
                        })
                }
                ExecutionPlan::Process { command } => self.process.run(command).await,
                ExecutionPlan::Interpreter { script } => self.interpreter.run(script).await,
            }
        };

        let state_after = if simulate {
            state_before.clone()
        } else {
            self.snapshot(&watched).await
        };
        let reversible = !simulate && !output.undo_actions.is_empty();
        let duration_ms = start.elapsed().as_millis() as u64;

        if output.success {
            info!(
                operation_id = %operation_id,
                executor = %plan.kind(),
                simulated = simulate,
                reversible,
                duration_ms,
                "Execution finished"
            );
        } else {
            warn!(
                operation_id = %operation_id,
                executor = %plan.kind(),
                error = ?output.error,
                duration_ms,
                "Execution failed"
            );
        }

        ExecutionRecord {
            operation_id: operation_id.to_string(),
            executor: plan.kind(),
            success: output.success,
            simulated: simulate,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            timed_out: output.timed_out,
            duration_ms,
            affected_paths: output.affected_paths,
            process_ids: output.process_ids,
            state_before,
            state_after,
            reversible,
            undo_actions: if simulate { Vec::new() } else { output.undo_actions },
            error: output.error,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Describe what `plan` would do. Looks at the filesystem, so it runs
    /// on the blocking pool.
    pub async fn preview(&self, plan: &ExecutionPlan) -> Result<String, String> {
        let engine = self.clone();
        let plan = plan.clone();
        blocking(move || engine.describe(&plan)).await
    }

    pub fn describe(&self, plan: &ExecutionPlan) -> String {
        match plan {
            ExecutionPlan::Passthrough { text } => format!("would return: {}", text),
            ExecutionPlan::File(action) => self.file.describe(action),
            ExecutionPlan::Process { command } => self.process.describe(command),
            ExecutionPlan::Interpreter { script } => self.interpreter.describe(script),
        }
    }

    /// Replay the undo actions of `record` in registration order. Returns
    /// a line per action performed.
    pub async fn undo(&self, record: &ExecutionRecord) -> Result<Vec<String>, UndoError> {
        if !record.reversible || record.undo_actions.is_empty() {
            return Err(UndoError::NotReversible(record.operation_id.clone()));
        }

        let mut done = Vec::with_capacity(record.undo_actions.len());
        for action in &record.undo_actions {
            self.replay(action)
                .await
                .map_err(|e| UndoError::Replay(format!("{}: {}", action, e)))?;
            info!(operation_id = %record.operation_id, action = %action, "Undo action replayed");
            done.push(action.to_string());
        }
        Ok(done)
    }

    async fn replay(&self, action: &UndoAction) -> Result<(), String> {
        match action {
            UndoAction::RestoreBackup { original, backup } => {
                let backups = self.backups.clone();
                let (original, backup) = (original.clone(), backup.clone());
                blocking(move || {
                    if !backup.exists() {
                        return Err(format!("backup {} is missing", backup.display()));
                    }
                    backups.restore(&backup, &original).map_err(|e| e.to_string())
                })
                .await?
            }
            UndoAction::DeleteCreated { path } => {
                let path = path.clone();
                blocking(move || match std::fs::remove_file(&path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.to_string()),
                })
                .await?
            }
            UndoAction::RunCommand { command } => {
                let out = self.process.run(command).await;
                if out.success {
                    Ok(())
                } else {
                    Err(out.error.unwrap_or_else(|| "inverse command failed".to_string()))
                }
            }
        }
    }
}
