//! `PrimaryStore` is the narrow surface the repository layer needs from the
//! primary document database. `CouchStore` is the production implementation;
//! tests inject an in-memory fake.

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::couch::{CouchClient, CouchError};
use crate::error::{Result, StoreError};

pub const CONTENT_PREFIX: &str = "content::";
pub const CONFIG_KEY: &str = "config::site";
pub const LOG_PREFIX: &str = "log::";
pub const USER_PREFIX: &str = "user::";

pub fn content_key(id: &str) -> String {
    format!("{CONTENT_PREFIX}{id}")
}

pub fn user_key(user_id: &str, namespace: &str) -> String {
    format!("{USER_PREFIX}{user_id}::{namespace}")
}

/// Split a `user::{user_id}::{namespace}` key back into its parts.
pub fn split_user_key(key: &str) -> Option<(String, String)> {
    let rest = key.strip_prefix(USER_PREFIX)?;
    let (user_id, namespace) = rest.split_once("::")?;
    Some((user_id.to_string(), namespace.to_string()))
}

#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Cheap liveness probe.
    async fn ping(&self) -> Result<()>;

    /// Idempotent schema setup (database + indexes).
    async fn ensure_schema(&self) -> Result<()>;

    async fn get(&self, doc_id: &str) -> Result<Option<Value>>;

    /// Full-document replace keyed on `doc_id`.
    async fn upsert(&self, doc_id: &str, doc: Value) -> Result<()>;

    /// Insert-only bulk write: documents whose id already exists are left
    /// untouched. Returns the number of documents actually inserted.
    async fn insert_missing(&self, docs: Vec<Value>) -> Result<usize>;

    /// Delete by id. Returns whether a document existed.
    async fn remove(&self, doc_id: &str) -> Result<bool>;

    async fn list_docs(
        &self,
        prefix: &str,
        newest_first: bool,
        limit: Option<usize>,
    ) -> Result<Vec<Value>>;

    /// Document ids under `prefix`, ascending.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    async fn remove_many(&self, doc_ids: &[String]) -> Result<usize>;
}

/// CouchDB-backed primary store.
#[derive(Clone)]
pub struct CouchStore {
    db: CouchClient,
}

impl CouchStore {
    pub fn new(db: CouchClient) -> Self {
        Self { db }
    }
}

fn map_err(e: CouchError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

#[async_trait]
impl PrimaryStore for CouchStore {
    async fn ping(&self) -> Result<()> {
        self.db.db_info().await.map(|_| ()).map_err(map_err)
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.db.ensure_db().await.map_err(map_err)?;
        self.db.create_indexes().await.map_err(map_err)
    }

    async fn get(&self, doc_id: &str) -> Result<Option<Value>> {
        match self.db.get_document(doc_id).await {
            Ok(doc) => Ok(Some(doc)),
            Err(CouchError::NotFound(_)) => Ok(None),
            Err(e) => Err(map_err(e)),
        }
    }

    async fn upsert(&self, doc_id: &str, mut doc: Value) -> Result<()> {
        doc["_id"] = Value::String(doc_id.to_string());

        // Carry the current revision, retrying once if a concurrent writer
        // bumped it between our read and our put.
        for _ in 0..2 {
            match self.db.get_document(doc_id).await {
                Ok(existing) => {
                    if let Some(rev) = existing.get("_rev").cloned() {
                        doc["_rev"] = rev;
                    }
                }
                Err(CouchError::NotFound(_)) => {
                    if let Some(obj) = doc.as_object_mut() {
                        obj.remove("_rev");
                    }
                }
                Err(e) => return Err(map_err(e)),
            }

            match self.db.put_document(doc_id, &doc).await {
                Ok(_) => return Ok(()),
                Err(CouchError::Conflict(_)) => continue,
                Err(e) => return Err(map_err(e)),
            }
        }
        Err(StoreError::Unavailable(format!(
            "persistent write conflict on {doc_id}"
        )))
    }

    async fn insert_missing(&self, docs: Vec<Value>) -> Result<usize> {
        if docs.is_empty() {
            return Ok(0);
        }
        // No `_rev` on any document: existing ids come back as per-document
        // conflicts and are skipped, which is the required no-overwrite seed.
        let results = self.db.bulk_docs(&docs).await.map_err(map_err)?;
        let inserted = results.iter().filter(|r| r.ok == Some(true)).count();
        let conflicts = results.len() - inserted;
        if conflicts > 0 {
            warn!(inserted, conflicts, "Bulk insert skipped existing documents");
        }
        Ok(inserted)
    }

    async fn remove(&self, doc_id: &str) -> Result<bool> {
        let existing = match self.db.get_document(doc_id).await {
            Ok(doc) => doc,
            Err(CouchError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(map_err(e)),
        };
        let rev = existing
            .get("_rev")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match self.db.delete_document(doc_id, &rev).await {
            Ok(_) => Ok(true),
            Err(CouchError::NotFound(_)) => Ok(false),
            Err(e) => Err(map_err(e)),
        }
    }

    async fn list_docs(
        &self,
        prefix: &str,
        newest_first: bool,
        limit: Option<usize>,
    ) -> Result<Vec<Value>> {
        let resp = self
            .db
            .all_docs_by_prefix(prefix, true, newest_first, limit)
            .await
            .map_err(map_err)?;
        Ok(resp.rows.into_iter().filter_map(|r| r.doc).collect())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let resp = self
            .db
            .all_docs_by_prefix(prefix, false, false, None)
            .await
            .map_err(map_err)?;
        Ok(resp.rows.into_iter().map(|r| r.id).collect())
    }

    async fn remove_many(&self, doc_ids: &[String]) -> Result<usize> {
        let mut removed = 0;
        for id in doc_ids {
            if self.remove(id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_key_round_trip() {
        let key = user_key("2f4a7c1e-9b3d-4e6f-8a10-5c2d3e4f5a6b", "watchlist");
        assert_eq!(
            split_user_key(&key),
            Some((
                "2f4a7c1e-9b3d-4e6f-8a10-5c2d3e4f5a6b".to_string(),
                "watchlist".to_string()
            ))
        );
        assert_eq!(split_user_key("content::frieren"), None);
    }

    #[tokio::test]
    async fn test_memory_insert_missing_skips_existing() {
        let store = memory::MemoryStore::new();
        store
            .upsert("content::a1", serde_json::json!({ "id": "a1", "title": "orig" }))
            .await
            .unwrap();

        let inserted = store
            .insert_missing(vec![
                serde_json::json!({ "_id": "content::a1", "id": "a1", "title": "new" }),
                serde_json::json!({ "_id": "content::b2", "id": "b2", "title": "B" }),
            ])
            .await
            .unwrap();

        assert_eq!(inserted, 1);
        let kept = store.get("content::a1").await.unwrap().unwrap();
        assert_eq!(kept["title"], "orig");
    }

    #[tokio::test]
    async fn test_memory_prefix_scan_is_ordered() {
        let store = memory::MemoryStore::new();
        for k in ["log::2026-01-01", "log::2026-01-03", "log::2026-01-02", "content::x"] {
            store.upsert(k, serde_json::json!({ "k": k })).await.unwrap();
        }
        let keys = store.list_keys(LOG_PREFIX).await.unwrap();
        assert_eq!(keys, vec!["log::2026-01-01", "log::2026-01-02", "log::2026-01-03"]);

        let newest = store.list_docs(LOG_PREFIX, true, Some(1)).await.unwrap();
        assert_eq!(newest[0]["k"], "log::2026-01-03");
    }
}
