//! Per-user, per-namespace JSON blobs.
//!
//! Namespaces come from a fixed whitelist and user ids must be canonical
//! lowercase hyphenated UUIDs; both are checked before any I/O. Writes are
//! full replacements and, in fallback mode, atomic temp-then-rename files.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::backup::BackupHandle;
use crate::connection::ConnectionManager;
use crate::documents::UserStats;
use crate::error::{Result, StoreError};
use crate::localfs::FallbackFiles;
use crate::store::{split_user_key, user_key, USER_PREFIX};

/// The only namespaces callers may touch.
pub const NAMESPACES: &[&str] = &[
    "watchlist",
    "watched-episodes",
    "history",
    "subscriptions",
    "episode-counts",
];

pub struct UserDataStore {
    conn: Arc<ConnectionManager>,
    files: Arc<FallbackFiles>,
    backup: BackupHandle,
}

fn validate(user_id: &str, namespace: &str) -> Result<()> {
    let canonical = Uuid::try_parse(user_id)
        .map(|u| u.as_hyphenated().to_string())
        .map_err(|_| StoreError::Validation(format!("malformed user id: {user_id}")))?;
    if canonical != user_id {
        return Err(StoreError::Validation(format!(
            "user id is not in canonical form: {user_id}"
        )));
    }
    if !NAMESPACES.contains(&namespace) {
        return Err(StoreError::Validation(format!(
            "namespace not allowed: {namespace}"
        )));
    }
    Ok(())
}

impl UserDataStore {
    pub fn new(
        conn: Arc<ConnectionManager>,
        files: Arc<FallbackFiles>,
        backup: BackupHandle,
    ) -> Self {
        Self {
            conn,
            files,
            backup,
        }
    }

    pub async fn read(&self, user_id: &str, namespace: &str) -> Result<Value> {
        validate(user_id, namespace)?;
        let key = user_key(user_id, namespace);

        if let Some(store) = self.conn.acquire().await {
            match store.get(&key).await {
                Ok(Some(doc)) => {
                    return doc
                        .get("value")
                        .cloned()
                        .ok_or_else(|| StoreError::NotFound(key));
                }
                Ok(None) => return Err(StoreError::NotFound(key)),
                Err(e) => warn!(error = %e, "User blob read failed, using local fallback"),
            }
        }
        self.files
            .read_user_blob(user_id, namespace)
            .ok_or(StoreError::NotFound(key))
    }

    /// Full replacement of the blob for `(user_id, namespace)`.
    pub async fn write(&self, user_id: &str, namespace: &str, value: Value) -> Result<()> {
        validate(user_id, namespace)?;

        if let Some(store) = self.conn.acquire().await {
            let doc = serde_json::json!({
                "user_id": user_id,
                "namespace": namespace,
                "value": value,
                "updatedAt": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            });
            store.upsert(&user_key(user_id, namespace), doc).await?;
        } else {
            self.files.write_user_blob(user_id, namespace, &value)?;
        }

        self.backup
            .notify("userdata", &format!("{user_id}/{namespace}"));
        Ok(())
    }

    /// Delete by pair. Requires the primary store, matching the content
    /// repository's no-fallback-delete policy.
    pub async fn delete(&self, user_id: &str, namespace: &str) -> Result<bool> {
        validate(user_id, namespace)?;
        let store = self.conn.acquire().await.ok_or_else(|| {
            StoreError::Unavailable("delete requires the primary store".into())
        })?;
        let existed = store.remove(&user_key(user_id, namespace)).await?;
        if existed {
            self.backup
                .notify("userdata", &format!("delete {user_id}/{namespace}"));
        }
        Ok(existed)
    }

    /// Operational tooling only: every known user, the namespaces they have
    /// data in, and the latest modification time across those namespaces.
    pub async fn stats(&self) -> Result<Vec<UserStats>> {
        if let Some(store) = self.conn.acquire().await {
            let docs = store.list_docs(USER_PREFIX, false, None).await?;
            let mut stats: Vec<UserStats> = Vec::new();
            for doc in docs {
                let Some((user_id, namespace)) = doc
                    .get("_id")
                    .and_then(Value::as_str)
                    .and_then(split_user_key)
                else {
                    continue;
                };
                let updated_at: Option<DateTime<Utc>> = doc
                    .get("updatedAt")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok());

                match stats.iter_mut().find(|s| s.user_id == user_id) {
                    Some(entry) => {
                        entry.namespaces.push(namespace);
                        entry.updated_at = match (entry.updated_at, updated_at) {
                            (Some(a), Some(b)) => Some(a.max(b)),
                            (a, b) => a.or(b),
                        };
                    }
                    None => stats.push(UserStats {
                        user_id,
                        namespaces: vec![namespace],
                        updated_at,
                    }),
                }
            }
            for entry in &mut stats {
                entry.namespaces.sort();
            }
            return Ok(stats);
        }
        Ok(self.files.user_stats())
    }

    /// All blobs for `run_backup`. Requires the primary store.
    pub async fn dump(&self) -> Result<Vec<(String, String, Value)>> {
        let store = self.conn.acquire().await.ok_or_else(|| {
            StoreError::Unavailable("backup export requires the primary store".into())
        })?;
        let docs = store.list_docs(USER_PREFIX, false, None).await?;
        Ok(docs
            .into_iter()
            .filter_map(|doc| {
                let (user_id, namespace) = doc
                    .get("_id")
                    .and_then(Value::as_str)
                    .and_then(split_user_key)?;
                let value = doc.get("value").cloned()?;
                Some((user_id, namespace, value))
            })
            .collect())
    }
}
