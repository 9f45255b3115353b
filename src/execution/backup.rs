//! Backups and state capture
//!
//! A backup is durable (fsynced) before the function returns, so callers
//! can mutate the original as soon as they get the backup path back.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, warn};

static ABSOLUTE_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[\s"'=])([/~][\w./-]+)"#).unwrap()
});

const PSEUDO_FS_PREFIXES: &[&str] = &["/proc", "/sys", "/dev"];

/// State of one path at a point in time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileState {
    pub path: PathBuf,
    pub exists: bool,
    pub is_dir: bool,
    pub size: Option<u64>,
    /// Content hash; absent for directories and files over the backup limit
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    pub files: Vec<FileState>,
    pub mem_available_kb: Option<u64>,
    pub load_avg_1m: Option<f64>,
    pub captured_at: Option<DateTime<Utc>>,
}

impl StateSnapshot {
    pub fn file(&self, path: &Path) -> Option<&FileState> {
        self.files.iter().find(|f| f.path == path)
    }
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
    max_bytes: u64,
}

impl BackupStore {
    pub fn new(dir: PathBuf, max_bytes: u64) -> Self {
        Self { dir, max_bytes }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Whether backups can be written right now
    pub fn available(&self) -> bool {
        if std::fs::create_dir_all(&self.dir).is_err() {
            return false;
        }
        match std::fs::metadata(&self.dir) {
            Ok(meta) => meta.is_dir() && !meta.permissions().readonly(),
            Err(_) => false,
        }
    }

    /// Copy `source` into the backup directory as `<name>.<id8>.bak` and
    /// fsync it
    pub fn backup(&self, source: &Path) -> std::io::Result<PathBuf> {
        let meta = std::fs::metadata(source)?;
        if !meta.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", source.display()),
            ));
        }
        if meta.len() > self.max_bytes {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "{} is {} bytes, over the {} byte backup limit",
                    source.display(),
                    meta.len(),
                    self.max_bytes
                ),
            ));
        }

        std::fs::create_dir_all(&self.dir)?;
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        let id = uuid::Uuid::new_v4().simple().to_string();
        let target = self.dir.join(format!("{}.{}.bak", name, &id[..8]));

        let contents = std::fs::read(source)?;
        let mut file = std::fs::File::create(&target)?;
        file.write_all(&contents)?;
        file.sync_all()?;

        // Make the new directory entry durable too
        if let Ok(dir) = std::fs::File::open(&self.dir) {
            let _ = dir.sync_all();
        }

        debug!(source = %source.display(), backup = %target.display(), "Backed up file");
        Ok(target)
    }

    /// Put a backup back in place of `original`
    pub fn restore(&self, backup: &Path, original: &Path) -> std::io::Result<()> {
        let contents = std::fs::read(backup)?;
        let mut file = std::fs::File::create(original)?;
        file.write_all(&contents)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn capture_file(&self, path: &Path) -> FileState {
        match std::fs::metadata(path) {
            Ok(meta) => {
                let sha256 = if meta.is_file() && meta.len() <= self.max_bytes {
                    hash_file(path).ok()
                } else {
                    None
                };
                FileState {
                    path: path.to_path_buf(),
                    exists: true,
                    is_dir: meta.is_dir(),
                    size: Some(meta.len()),
                    sha256,
                }
            }
            Err(_) => FileState {
                path: path.to_path_buf(),
                exists: false,
                is_dir: false,
                size: None,
                sha256: None,
            },
        }
    }

    pub fn snapshot(&self, paths: &[PathBuf]) -> StateSnapshot {
        StateSnapshot {
            files: paths.iter().map(|p| self.capture_file(p)).collect(),
            mem_available_kb: read_mem_available(),
            load_avg_1m: read_load_avg(),
            captured_at: Some(Utc::now()),
        }
    }
}

pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let contents = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&contents)))
}

/// Expand `~` and resolve relative paths against `base`
pub fn resolve_path(raw: &str, base: &Path) -> PathBuf {
    let expanded = if raw == "~" || raw.starts_with("~/") {
        match directories::BaseDirs::new() {
            Some(dirs) => dirs.home_dir().join(raw.trim_start_matches('~').trim_start_matches('/')),
            None => PathBuf::from(raw),
        }
    } else {
        PathBuf::from(raw)
    };

    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

/// Paths a command is likely to touch: absolute and home-relative paths,
/// plus arguments naming existing entries under `base`. Traversal and
/// pseudo-filesystem paths are dropped.
pub fn extract_paths(command: &str, base: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = Vec::new();
    let mut push = |path: PathBuf| {
        if !found.contains(&path) {
            found.push(path);
        }
    };

    for cap in ABSOLUTE_PATH_RE.captures_iter(command) {
        if let Some(m) = cap.get(1) {
            if let Some(path) = accept_path(m.as_str(), base) {
                push(path);
            }
        }
    }

    if let Ok(words) = shell_words::split(command) {
        for word in words.iter().skip(1) {
            if word.starts_with('-') || word.starts_with('/') || word.starts_with('~') {
                continue;
            }
            if let Some(path) = accept_path(word, base) {
                if path.exists() {
                    push(path);
                }
            }
        }
    }

    found
}

fn accept_path(raw: &str, base: &Path) -> Option<PathBuf> {
    if raw.contains("..") {
        warn!(path = %raw, "Rejected path with traversal");
        return None;
    }
    let path = resolve_path(raw, base);
    let resolved = std::fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
    if PSEUDO_FS_PREFIXES
        .iter()
        .any(|p| resolved.starts_with(p) || path.starts_with(p))
    {
        warn!(path = %raw, "Rejected pseudo-filesystem path");
        return None;
    }
    Some(path)
}

fn read_mem_available() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    meminfo
        .lines()
        .find(|l| l.starts_with("MemAvailable:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

fn read_load_avg() -> Option<f64> {
    let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
    loadavg.split_whitespace().next()?.parse().ok()
}
