//! Process executor
//!
//! Runs a command through `sh -c` with captured output and a hard
//! wall-clock timeout. Files named in the command are backed up on a
//! best-effort basis before the process starts. Path checks and backups
//! run on the blocking pool.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use super::backup::{extract_paths, BackupStore};
use super::{blocking, truncate_output, ExecutorOutput, UndoAction};

/// Verb pairs that undo each other for service-style commands
const INVERSE_VERBS: &[(&str, &str)] = &[
    ("start", "stop"),
    ("stop", "start"),
    ("enable", "disable"),
    ("disable", "enable"),
    ("mount", "umount"),
    ("mkdir", "rmdir"),
];

const SHELL_OPERATORS: &[&str] = &[";", "&&", "||", "|", ">", ">>", "<", "&"];

#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    backups: BackupStore,
    working_dir: PathBuf,
    timeout: Duration,
    max_output_bytes: usize,
}

impl ProcessExecutor {
    pub fn new(backups: BackupStore, working_dir: PathBuf, timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            backups,
            working_dir,
            timeout,
            max_output_bytes,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn touched_paths(&self, command: &str) -> Vec<PathBuf> {
        extract_paths(command, &self.working_dir)
    }

    pub fn describe(&self, command: &str) -> String {
        let paths = self.touched_paths(command);
        let backed_up = paths.iter().filter(|p| p.is_file()).count();
        let mut text = format!(
            "would run `{}` in {} (timeout {}s, {} file(s) backed up first)",
            command,
            self.working_dir.display(),
            self.timeout.as_secs(),
            backed_up
        );
        if let Some(inverse) = inverse_command(command) {
            text.push_str(&format!("; undo runs `{}`", inverse));
        }
        text
    }

    /// Back up every existing file the command names. Returns the paths,
    /// the ones absent beforehand and the restore actions.
    fn back_up_paths(&self, command: &str) -> (Vec<PathBuf>, Vec<PathBuf>, Vec<UndoAction>) {
        let paths = self.touched_paths(command);
        let absent_before: Vec<PathBuf> = paths.iter().filter(|p| !p.exists()).cloned().collect();
        let mut undo_actions = Vec::new();
        for path in paths.iter().filter(|p| p.is_file()) {
            match self.backups.backup(path) {
                Ok(backup) => undo_actions.push(UndoAction::RestoreBackup {
                    original: path.clone(),
                    backup,
                }),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping backup of command path"),
            }
        }
        (paths, absent_before, undo_actions)
    }

    pub async fn run(&self, command: &str) -> ExecutorOutput {
        let mut out = ExecutorOutput::default();

        // Backups are durable before the process starts
        let this = self.clone();
        let text = command.to_string();
        let (paths, absent_before, undo_actions) = match blocking(move || this.back_up_paths(&text)).await {
            Ok(prepared) => prepared,
            Err(e) => {
                out.error = Some(format!("could not prepare backups: {}", e));
                return out;
            }
        };
        out.affected_paths = paths;
        out.undo_actions = undo_actions;

        let start = Instant::now();
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                out.error = Some(format!("failed to spawn command: {}", e));
                return out;
            }
        };
        if let Some(pid) = child.id() {
            out.process_ids.push(pid);
        }

        // Dropping the child on timeout kills it
        let result = timeout(self.timeout, child.wait_with_output()).await;
        let duration = start.elapsed();

        match result {
            Ok(Ok(output)) => {
                out.exit_code = output.status.code();
                out.success = output.status.success();
                out.stdout = truncate_output(&String::from_utf8_lossy(&output.stdout), self.max_output_bytes);
                out.stderr = truncate_output(&String::from_utf8_lossy(&output.stderr), self.max_output_bytes);
                if !out.success {
                    out.error = Some(format!("command exited with {:?}", out.exit_code));
                }

                info!(
                    command = %command,
                    exit_code = ?out.exit_code,
                    duration_ms = %duration.as_millis(),
                    "Command finished"
                );
            }
            Ok(Err(e)) => {
                out.error = Some(format!("failed to collect command output: {}", e));
            }
            Err(_) => {
                warn!(
                    command = %command,
                    pids = ?out.process_ids,
                    timeout = ?self.timeout,
                    "Command timed out, process killed"
                );
                out.timed_out = true;
                out.error = Some(format!("timed out after {}s", self.timeout.as_secs()));
            }
        }

        let created = blocking(move || absent_before.into_iter().filter(|p| p.is_file()).collect::<Vec<_>>())
            .await
            .unwrap_or_default();
        out.undo_actions
            .extend(created.into_iter().map(|path| UndoAction::DeleteCreated { path }));
        if out.success {
            if let Some(inverse) = inverse_command(command) {
                out.undo_actions.push(UndoAction::RunCommand { command: inverse });
            }
        }

        out
    }
}

/// Inverse of a single simple command whose verb has a known opposite
pub fn inverse_command(command: &str) -> Option<String> {
    let words = shell_words::split(command).ok()?;
    if words.is_empty() || words.iter().any(|w| SHELL_OPERATORS.contains(&w.as_str())) {
        return None;
    }
    if SHELL_OPERATORS.iter().any(|op| command.contains(op)) {
        return None;
    }

    let position = words
        .iter()
        .take(3)
        .position(|w| INVERSE_VERBS.iter().any(|(verb, _)| verb == w))?;
    let inverse = INVERSE_VERBS
        .iter()
        .find(|(verb, _)| *verb == words[position])
        .map(|(_, inv)| *inv)?;

    let mut inverted = words.clone();
    inverted[position] = inverse.to_string();
    if inverse == "rmdir" {
        inverted.retain(|w| w != "-p" && w != "--parents");
    }
    Some(shell_words::join(inverted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn executor(dir: &std::path::Path, secs: u64) -> ProcessExecutor {
        ProcessExecutor::new(
            BackupStore::new(dir.join("backups"), 1024 * 1024),
            dir.to_path_buf(),
            Duration::from_secs(secs),
            1024,
        )
    }

    #[test]
    fn test_inverse_command() {
        assert_eq!(inverse_command("systemctl start nginx").as_deref(), Some("systemctl stop nginx"));
        assert_eq!(inverse_command("systemctl enable nginx").as_deref(), Some("systemctl disable nginx"));
        assert_eq!(inverse_command("mkdir -p build").as_deref(), Some("rmdir build"));
        assert_eq!(inverse_command("mount /dev/sdb1 /mnt").as_deref(), Some("umount /dev/sdb1 /mnt"));
        // "restart" is not "start"
        assert_eq!(inverse_command("systemctl restart nginx"), None);
        assert_eq!(inverse_command("mkdir a && cd a"), None);
        assert_eq!(inverse_command("ls -la"), None);
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let dir = tempdir().unwrap();
        let out = executor(dir.path(), 5).run("echo hello").await;
        assert!(out.success);
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.process_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let dir = tempdir().unwrap();
        let out = executor(dir.path(), 5).run("exit 3").await;
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempdir().unwrap();
        let started = Instant::now();
        let out = executor(dir.path(), 1).run("sleep 10").await;
        assert!(out.timed_out);
        assert!(!out.success);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_backs_up_named_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("data.txt"), "keep").unwrap();
        let out = executor(dir.path(), 5).run("truncate -s 0 data.txt").await;
        assert!(out.success);
        assert!(matches!(out.undo_actions.first(), Some(UndoAction::RestoreBackup { .. })));
    }

    #[tokio::test]
    async fn test_mkdir_registers_rmdir() {
        let dir = tempdir().unwrap();
        let out = executor(dir.path(), 5).run("mkdir fresh").await;
        assert!(out.success);
        assert_eq!(
            out.undo_actions.last(),
            Some(&UndoAction::RunCommand { command: "rmdir fresh".to_string() })
        );
    }
}
