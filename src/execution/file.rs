//! File executor
//!
//! Parses one file action out of a directive and applies it. Any existing
//! target is backed up before it is touched; if that backup cannot be made
//! the action does not run. Reads return the content and touch nothing.
//!
//! Everything here is blocking I/O. The engine calls [`FileExecutor::run`]
//! from the blocking pool.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{info, warn};

use super::backup::{resolve_path, BackupStore};
use super::{ExecutorOutput, UndoAction};

static APPEND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^append\s+(.+?)\s+to\s+(?:the\s+)?(?:file\s+)?(\S+)$").unwrap());

static WRITE_WITH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^(?:write|create|save|make)\s+(?:an?\s+)?(?:new\s+)?(?:file\s+)?(\S+)\s+(?:with|containing)\s+(.+)$")
        .unwrap()
});

static WRITE_TO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^(?:write|save|put)\s+(.+?)\s+(?:to|into)\s+(?:the\s+)?(?:file\s+)?(\S+)$").unwrap()
});

static DELETE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:delete|remove|erase)\s+(?:the\s+)?(?:file\s+)?(\S+)$").unwrap()
});

static READ_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:read|show|cat|open|view|print|display)\s+(?:me\s+)?(?:the\s+)?(?:contents?\s+of\s+)?(?:the\s+)?(?:file\s+)?(\S+)$",
    )
    .unwrap()
});

/// Larger files are refused rather than read
const MAX_READ_BYTES: u64 = 10 * 1024 * 1024;

static TOUCH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:touch|create)\s+(?:an?\s+)?(?:empty\s+)?(?:file\s+)?(\S+)$").unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum FileAction {
    Write { path: String, content: String },
    Append { path: String, content: String },
    Delete { path: String },
    Touch { path: String },
    Read { path: String },
}

impl FileAction {
    pub fn parse(directive: &str) -> Result<Self, String> {
        let text = directive.trim().trim_end_matches(['.', '!']);

        if let Some(caps) = APPEND_RE.captures(text) {
            return Ok(FileAction::Append {
                path: unquote(&caps[2]),
                content: unquote(&caps[1]),
            });
        }
        if let Some(caps) = WRITE_WITH_RE.captures(text) {
            return Ok(FileAction::Write {
                path: unquote(&caps[1]),
                content: unquote(&caps[2]),
            });
        }
        if let Some(caps) = WRITE_TO_RE.captures(text) {
            return Ok(FileAction::Write {
                path: unquote(&caps[2]),
                content: unquote(&caps[1]),
            });
        }
        if let Some(caps) = DELETE_RE.captures(text) {
            return Ok(FileAction::Delete { path: unquote(&caps[1]) });
        }
        if let Some(caps) = TOUCH_RE.captures(text) {
            return Ok(FileAction::Touch { path: unquote(&caps[1]) });
        }
        if let Some(caps) = READ_RE.captures(text) {
            return Ok(FileAction::Read { path: unquote(&caps[1]) });
        }

        Err(format!("no file action recognised in '{}'", directive.trim()))
    }

    pub fn path(&self) -> &str {
        match self {
            FileAction::Write { path, .. }
            | FileAction::Append { path, .. }
            | FileAction::Delete { path }
            | FileAction::Touch { path }
            | FileAction::Read { path } => path,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            FileAction::Write { .. } => "write",
            FileAction::Append { .. } => "append",
            FileAction::Delete { .. } => "delete",
            FileAction::Touch { .. } => "touch",
            FileAction::Read { .. } => "read",
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, FileAction::Read { .. })
    }

    /// Whether the action needs the target's parent directory to exist
    pub fn creates(&self) -> bool {
        !matches!(self, FileAction::Delete { .. } | FileAction::Read { .. })
    }

    /// Whether the action can lose existing content
    pub fn destroys_content(&self) -> bool {
        matches!(self, FileAction::Write { .. } | FileAction::Delete { .. })
    }
}

fn unquote(raw: &str) -> String {
    let s = raw.trim();
    for q in ['\'', '"', '`'] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

#[derive(Debug, Clone)]
pub struct FileExecutor {
    backups: BackupStore,
    working_dir: PathBuf,
}

impl FileExecutor {
    pub fn new(backups: BackupStore, working_dir: PathBuf) -> Self {
        Self { backups, working_dir }
    }

    pub fn resolve(&self, action: &FileAction) -> PathBuf {
        resolve_path(action.path(), &self.working_dir)
    }

    pub fn describe(&self, action: &FileAction) -> String {
        let path = self.resolve(action);
        let exists = path.exists();
        if action.is_read() {
            return format!(
                "would read {} ({}; nothing to undo)",
                path.display(),
                if exists { "exists" } else { "absent" }
            );
        }
        let undo = match (action, exists) {
            (FileAction::Touch { .. }, true) => "nothing to undo",
            (_, true) => "restore from backup",
            (_, false) => "delete created file",
        };
        let what = match action {
            FileAction::Write { content, .. } => format!("write {} bytes to", content.len()),
            FileAction::Append { content, .. } => format!("append {} bytes to", content.len()),
            FileAction::Delete { .. } => "delete".to_string(),
            FileAction::Touch { .. } => "touch".to_string(),
            FileAction::Read { .. } => "read".to_string(),
        };
        format!(
            "would {} {} ({}; undo: {})",
            what,
            path.display(),
            if exists { "exists" } else { "absent" },
            undo
        )
    }

    pub fn run(&self, action: &FileAction) -> ExecutorOutput {
        let path = self.resolve(action);
        let mut out = ExecutorOutput {
            affected_paths: vec![path.clone()],
            ..Default::default()
        };

        if path.is_dir() {
            out.error = Some(format!("{} is a directory", path.display()));
            return out;
        }
        if action.is_read() {
            match read(&path) {
                Ok(content) => {
                    out.success = true;
                    out.stdout = content;
                }
                Err(e) => out.error = Some(format!("read {} failed: {}", path.display(), e)),
            }
            return out;
        }

        let existed = path.exists();
        if existed {
            if matches!(action, FileAction::Touch { .. }) {
                out.success = true;
                out.stdout = format!("{} already exists", path.display());
                return out;
            }
            match self.backups.backup(&path) {
                Ok(backup) => out.undo_actions.push(UndoAction::RestoreBackup {
                    original: path.clone(),
                    backup,
                }),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Backup failed, mutation aborted");
                    out.error = Some(format!("backup failed, mutation aborted: {}", e));
                    return out;
                }
            }
        } else if matches!(action, FileAction::Delete { .. }) {
            out.error = Some(format!("{} does not exist", path.display()));
            return out;
        } else {
            out.undo_actions.push(UndoAction::DeleteCreated { path: path.clone() });
        }

        match apply(action, &path) {
            Ok(summary) => {
                info!(action = action.verb(), path = %path.display(), "File action applied");
                out.success = true;
                out.stdout = summary;
            }
            Err(e) => {
                warn!(action = action.verb(), path = %path.display(), error = %e, "File action failed");
                out.error = Some(format!("{} {} failed: {}", action.verb(), path.display(), e));
            }
        }
        out
    }
}

fn read(path: &Path) -> std::io::Result<String> {
    let size = std::fs::metadata(path)?.len();
    if size > MAX_READ_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} bytes is over the {} byte read limit", size, MAX_READ_BYTES),
        ));
    }
    let bytes = std::fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn apply(action: &FileAction, path: &Path) -> std::io::Result<String> {
    match action {
        FileAction::Write { content, .. } => {
            let mut file = std::fs::File::create(path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
            Ok(format!("wrote {} bytes to {}", content.len(), path.display()))
        }
        FileAction::Append { content, .. } => {
            let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
            Ok(format!("appended {} bytes to {}", content.len(), path.display()))
        }
        FileAction::Delete { .. } => {
            std::fs::remove_file(path)?;
            Ok(format!("deleted {}", path.display()))
        }
        FileAction::Touch { .. } => {
            std::fs::File::create(path)?.sync_all()?;
            Ok(format!("created {}", path.display()))
        }
        FileAction::Read { .. } => read(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn executor(dir: &Path) -> FileExecutor {
        FileExecutor::new(BackupStore::new(dir.join("backups"), 1024 * 1024), dir.to_path_buf())
    }

    #[test]
    fn test_parse_actions() {
        assert_eq!(
            FileAction::parse("write notes.txt with 'hello'").unwrap(),
            FileAction::Write { path: "notes.txt".into(), content: "hello".into() }
        );
        assert_eq!(
            FileAction::parse("save \"a b\" to out.txt").unwrap(),
            FileAction::Write { path: "out.txt".into(), content: "a b".into() }
        );
        assert_eq!(
            FileAction::parse("append 'more' to log.txt").unwrap(),
            FileAction::Append { path: "log.txt".into(), content: "more".into() }
        );
        assert_eq!(
            FileAction::parse("delete the file old.txt").unwrap(),
            FileAction::Delete { path: "old.txt".into() }
        );
        assert_eq!(
            FileAction::parse("touch empty.txt").unwrap(),
            FileAction::Touch { path: "empty.txt".into() }
        );
        assert_eq!(
            FileAction::parse("show me the contents of notes.txt").unwrap(),
            FileAction::Read { path: "notes.txt".into() }
        );
        assert!(FileAction::parse("refactor the module").is_err());
    }

    #[test]
    fn test_write_new_file_registers_delete() {
        let dir = tempdir().unwrap();
        let exec = executor(dir.path());
        let action = FileAction::parse("write notes.txt with 'hello'").unwrap();

        let out = exec.run(&action);
        assert!(out.success, "{:?}", out.error);
        assert_eq!(std::fs::read_to_string(dir.path().join("notes.txt")).unwrap(), "hello");
        assert_eq!(
            out.undo_actions,
            vec![UndoAction::DeleteCreated { path: dir.path().join("notes.txt") }]
        );
    }

    #[test]
    fn test_overwrite_backs_up_first() {
        let dir = tempdir().unwrap();
        let exec = executor(dir.path());
        std::fs::write(dir.path().join("notes.txt"), "old").unwrap();

        let out = exec.run(&FileAction::parse("write notes.txt with new").unwrap());
        assert!(out.success);
        match &out.undo_actions[0] {
            UndoAction::RestoreBackup { backup, .. } => {
                assert_eq!(std::fs::read_to_string(backup).unwrap(), "old");
            }
            other => panic!("unexpected undo action {:?}", other),
        }
    }

    #[test]
    fn test_backup_failure_aborts_mutation() {
        let dir = tempdir().unwrap();
        let exec = FileExecutor::new(BackupStore::new(dir.path().join("backups"), 2), dir.path().to_path_buf());
        std::fs::write(dir.path().join("big.txt"), "original").unwrap();

        let out = exec.run(&FileAction::parse("delete big.txt").unwrap());
        assert!(!out.success);
        assert!(out.error.unwrap().contains("mutation aborted"));
        assert_eq!(std::fs::read_to_string(dir.path().join("big.txt")).unwrap(), "original");
    }

    #[test]
    fn test_read_missing_file_fails() {
        let dir = tempdir().unwrap();
        let out = executor(dir.path()).run(&FileAction::Read { path: "ghost.txt".into() });
        assert!(!out.success);
        assert!(out.error.unwrap().contains("read"));
        assert!(out.undo_actions.is_empty());
    }

    #[test]
    fn test_delete_missing_fails() {
        let dir = tempdir().unwrap();
        let out = executor(dir.path()).run(&FileAction::parse("delete ghost.txt").unwrap());
        assert!(!out.success);
        assert!(out.undo_actions.is_empty());
    }

    #[test]
    fn test_describe_has_no_side_effects() {
        let dir = tempdir().unwrap();
        let exec = executor(dir.path());
        let text = exec.describe(&FileAction::parse("write notes.txt with hi").unwrap());
        assert!(text.contains("delete created file"));
        assert!(!dir.path().join("notes.txt").exists());
    }
}
