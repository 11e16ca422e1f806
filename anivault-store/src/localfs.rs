//! Local fallback write target, used when the primary store is unavailable.
//!
//! Layout under the data dir:
//!   content/{id}.json           one file per catalog item
//!   config.json                 site configuration singleton
//!   logs.jsonl                  append-only audit log
//!   userdata/{user}/{ns}.json   one file per (user, namespace) pair
//!   tmp/                        staging for atomic renames
//!
//! Every write goes to `tmp/` first and is promoted with `rename`, so a
//! crash mid-write cannot leave a half-written blob.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;
use walkdir::WalkDir;

use crate::documents::{ContentItem, LogEntry, UserStats};
use crate::error::Result;

pub struct FallbackFiles {
    root: PathBuf,
}

impl FallbackFiles {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join("tmp"))?;
        fs::create_dir_all(root.join("content"))?;
        fs::create_dir_all(root.join("userdata"))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn content_path(&self, id: &str) -> PathBuf {
        self.root.join("content").join(format!("{id}.json"))
    }

    fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    fn log_path(&self) -> PathBuf {
        self.root.join("logs.jsonl")
    }

    fn user_dir(&self, user_id: &str) -> PathBuf {
        self.root.join("userdata").join(user_id)
    }

    fn user_blob_path(&self, user_id: &str, namespace: &str) -> PathBuf {
        self.user_dir(user_id).join(format!("{namespace}.json"))
    }

    fn write_atomic(&self, dest: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let staging = self
            .root
            .join("tmp")
            .join(uuid::Uuid::new_v4().to_string());
        fs::write(&staging, bytes)?;
        fs::rename(&staging, dest)?;
        Ok(())
    }

    // ── Content ──

    pub fn write_content(&self, item: &ContentItem) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(item)?;
        self.write_atomic(&self.content_path(&item.id), &bytes)
    }

    pub fn read_content(&self, id: &str) -> Option<ContentItem> {
        let bytes = fs::read(self.content_path(id)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// All locally persisted items, in id order. Unparseable files are
    /// skipped with a warning.
    pub fn read_content_all(&self) -> Vec<ContentItem> {
        let mut items = Vec::new();
        let dir = match fs::read_dir(self.root.join("content")) {
            Ok(d) => d,
            Err(_) => return items,
        };
        let mut paths: Vec<PathBuf> = dir.flatten().map(|e| e.path()).collect();
        paths.sort();
        for path in paths {
            match fs::read(&path).ok().and_then(|b| serde_json::from_slice(&b).ok()) {
                Some(item) => items.push(item),
                None => warn!(path = %path.display(), "Skipping unreadable fallback item"),
            }
        }
        items
    }

    // ── Config ──

    pub fn write_config(&self, config: &Value) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(config)?;
        self.write_atomic(&self.config_path(), &bytes)
    }

    pub fn read_config(&self) -> Option<Value> {
        let bytes = fs::read(self.config_path()).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    // ── Logs ──

    pub fn append_log(&self, entry: &LogEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        file.write_all(&line)?;
        Ok(())
    }

    /// Newest-first tail of the local log file.
    pub fn read_logs(&self, limit: usize) -> Vec<LogEntry> {
        let file = match fs::File::open(self.log_path()) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };
        let mut entries: Vec<LogEntry> = BufReader::new(file)
            .lines()
            .map_while(std::io::Result::ok)
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect();
        entries.reverse();
        entries.truncate(limit);
        entries
    }

    pub fn clear_logs(&self) -> Result<()> {
        match fs::remove_file(self.log_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ── User data ──

    pub fn write_user_blob(&self, user_id: &str, namespace: &str, value: &Value) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_atomic(&self.user_blob_path(user_id, namespace), &bytes)
    }

    pub fn read_user_blob(&self, user_id: &str, namespace: &str) -> Option<Value> {
        let bytes = fs::read(self.user_blob_path(user_id, namespace)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn delete_user_blob(&self, user_id: &str, namespace: &str) -> Result<bool> {
        match fs::remove_file(self.user_blob_path(user_id, namespace)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Enumerate users with local blobs: namespaces present and the most
    /// recent modification time across them.
    pub fn user_stats(&self) -> Vec<UserStats> {
        let mut stats = Vec::new();
        let userdata = self.root.join("userdata");

        for entry in WalkDir::new(&userdata)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .flatten()
        {
            if !entry.file_type().is_dir() {
                continue;
            }
            let user_id = entry.file_name().to_string_lossy().to_string();
            let mut namespaces = Vec::new();
            let mut updated_at: Option<DateTime<Utc>> = None;

            for blob in WalkDir::new(entry.path())
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .flatten()
            {
                let path = blob.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    namespaces.push(stem.to_string());
                }
                if let Ok(meta) = blob.metadata() {
                    if let Ok(modified) = meta.modified() {
                        let ts: DateTime<Utc> = modified.into();
                        updated_at = Some(updated_at.map_or(ts, |cur| cur.max(ts)));
                    }
                }
            }

            if !namespaces.is_empty() {
                namespaces.sort();
                stats.push(UserStats {
                    user_id,
                    namespaces,
                    updated_at,
                });
            }
        }

        stats.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        stats
    }
}
