//! Catalog repository: CRUD for content items plus the site-config singleton
//! and the capped audit log.
//!
//! Reads are tiered: primary store when reachable and non-empty, then the
//! remote read-only fallback source, with an opportunistic insert-only seed
//! of the primary when it was merely empty. Writes land in the primary or,
//! when it is down, in the local fallback file tree. Unavailability never
//! surfaces to read callers; the worst case is an empty result.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::backup::BackupHandle;
use crate::connection::ConnectionManager;
use crate::documents::{ContentItem, LogEntry};
use crate::error::{Result, StoreError};
use crate::fallback::FallbackSource;
use crate::localfs::FallbackFiles;
use crate::store::{content_key, PrimaryStore, CONFIG_KEY, CONTENT_PREFIX, LOG_PREFIX};

/// Audit log retention cap; oldest entries beyond it are pruned.
pub const LOG_RETENTION: usize = 2000;

pub struct ContentRepository {
    conn: Arc<ConnectionManager>,
    fallback: Arc<dyn FallbackSource>,
    files: Arc<FallbackFiles>,
    backup: BackupHandle,
    log_seq: AtomicU64,
}

/// Strip store-internal fields before handing a document back to callers.
fn doc_to_item(doc: Value) -> Option<ContentItem> {
    serde_json::from_value(strip_internal(doc)).ok()
}

fn strip_internal(mut doc: Value) -> Value {
    if let Some(obj) = doc.as_object_mut() {
        obj.remove("_id");
        obj.remove("_rev");
        obj.remove("updatedAt");
    }
    doc
}

fn validate_slug(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(StoreError::Validation("id must not be empty".into()));
    }
    if id.contains('/') || id.contains('\\') || id.contains("..") {
        return Err(StoreError::Validation(format!("id is not a plain slug: {id}")));
    }
    Ok(())
}

impl ContentRepository {
    pub fn new(
        conn: Arc<ConnectionManager>,
        fallback: Arc<dyn FallbackSource>,
        files: Arc<FallbackFiles>,
        backup: BackupHandle,
    ) -> Self {
        Self {
            conn,
            fallback,
            files,
            backup,
            log_seq: AtomicU64::new(0),
        }
    }

    // ── Content ──

    /// Full catalog. Primary store when reachable and non-empty; otherwise
    /// the fallback source, seeding the primary insert-only when it was
    /// reachable but empty. Never errors.
    pub async fn read_all(&self) -> Vec<ContentItem> {
        if let Some(store) = self.conn.acquire().await {
            match store.list_docs(CONTENT_PREFIX, false, None).await {
                Ok(docs) if !docs.is_empty() => {
                    return docs.into_iter().filter_map(doc_to_item).collect();
                }
                Ok(_) => {
                    let items = self.fetch_fallback().await;
                    if !items.is_empty() {
                        self.seed(&store, &items).await;
                    }
                    return items;
                }
                Err(e) => {
                    warn!(error = %e, "Primary store query failed, using fallback source");
                }
            }
        }

        // Degraded mode: remote fallback overlaid with local fallback writes,
        // which are newer by construction.
        let mut items = self.fetch_fallback().await;
        for local in self.files.read_content_all() {
            match items.iter_mut().find(|i| i.id == local.id) {
                Some(slot) => *slot = local,
                None => items.push(local),
            }
        }
        items
    }

    /// Fetch from the fallback source, degrading to empty on failure.
    /// Duplicate ids within one fetch are collapsed first-wins.
    async fn fetch_fallback(&self) -> Vec<ContentItem> {
        let items = match self.fallback.fetch_catalog().await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "Fallback fetch failed");
                return Vec::new();
            }
        };
        let mut seen = HashSet::new();
        items
            .into_iter()
            .filter(|item| seen.insert(item.id.clone()))
            .collect()
    }

    /// Insert-only seed: never overwrites documents a concurrent writer may
    /// have created since the emptiness check. Failures are logged, never
    /// surfaced to the read that triggered them.
    async fn seed(&self, store: &Arc<dyn PrimaryStore>, items: &[ContentItem]) {
        let docs: Vec<Value> = items
            .iter()
            .filter_map(|item| {
                let mut doc = serde_json::to_value(item).ok()?;
                doc["_id"] = Value::String(content_key(&item.id));
                doc["updatedAt"] =
                    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
                Some(doc)
            })
            .collect();
        match store.insert_missing(docs).await {
            Ok(n) => info!(seeded = n, "Seeded primary store from fallback source"),
            Err(e) => warn!(error = %e, "Seeding primary store failed"),
        }
    }

    pub async fn read_one(&self, id: &str) -> Result<ContentItem> {
        if let Some(store) = self.conn.acquire().await {
            match store.get(&content_key(id)).await {
                Ok(Some(doc)) => {
                    return doc_to_item(doc)
                        .ok_or_else(|| StoreError::NotFound(id.to_string()));
                }
                Ok(None) => return Err(StoreError::NotFound(id.to_string())),
                Err(e) => warn!(error = %e, "Point query failed, scanning fallback"),
            }
        }
        // Fallback mode: O(n) scan, accepted for simplicity.
        self.read_all()
            .await
            .into_iter()
            .find(|item| item.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Upsert keyed on `item.id`. Requires a non-empty id and title.
    pub async fn write(&self, item: ContentItem) -> Result<()> {
        validate_slug(&item.id)?;
        if item.title().map_or(true, |t| t.trim().is_empty()) {
            return Err(StoreError::Validation(format!(
                "item {} is missing a title",
                item.id
            )));
        }

        if let Some(store) = self.conn.acquire().await {
            let mut doc = serde_json::to_value(&item)?;
            doc["updatedAt"] =
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
            store.upsert(&content_key(&item.id), doc).await?;
        } else {
            self.files.write_content(&item)?;
        }

        self.backup.notify("content", &format!("write {}", item.id));
        self.log_event(LogEntry::new("content", &format!("Saved {}", item.id)))
            .await;
        Ok(())
    }

    /// Delete by id. Requires the primary store; there is no fallback-mode
    /// delete.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let store = self.conn.acquire().await.ok_or_else(|| {
            StoreError::Unavailable("delete requires the primary store".into())
        })?;
        let existed = store.remove(&content_key(id)).await?;
        if existed {
            self.backup.notify("content", &format!("remove {id}"));
            self.log_event(LogEntry::new("content", &format!("Removed {id}")))
                .await;
        }
        Ok(existed)
    }

    // ── Site config ──

    /// The config singleton, or an empty object if absent.
    pub async fn read_config(&self) -> Value {
        if let Some(store) = self.conn.acquire().await {
            match store.get(CONFIG_KEY).await {
                Ok(Some(doc)) => return strip_internal(doc),
                Ok(None) => return Value::Object(Default::default()),
                Err(e) => warn!(error = %e, "Config read failed, using local fallback"),
            }
        }
        self.files
            .read_config()
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    pub async fn write_config(&self, config: Value) -> Result<()> {
        if !config.is_object() {
            return Err(StoreError::Validation(
                "site config must be a JSON object".into(),
            ));
        }

        if let Some(store) = self.conn.acquire().await {
            let mut doc = config.clone();
            doc["updatedAt"] =
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
            store.upsert(CONFIG_KEY, doc).await?;
        } else {
            self.files.write_config(&config)?;
        }

        self.backup.notify("config", "write site config");
        self.log_event(LogEntry::new("config", "Updated site configuration"))
            .await;
        Ok(())
    }

    // ── Audit log ──

    /// Lexicographically ordered key: timestamp then a per-process sequence,
    /// so same-millisecond entries keep their insertion order.
    fn log_key(&self, entry: &LogEntry) -> String {
        let seq = self.log_seq.fetch_add(1, Ordering::SeqCst);
        format!(
            "{LOG_PREFIX}{}::{seq:012}",
            entry.at.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }

    pub async fn write_log(&self, entry: LogEntry) -> Result<()> {
        if let Some(store) = self.conn.acquire().await {
            let key = self.log_key(&entry);
            store.upsert(&key, serde_json::to_value(&entry)?).await?;
            self.prune_logs(&store).await;
            Ok(())
        } else {
            self.files.append_log(&entry)
        }
    }

    /// Internal append; a failing audit write never fails the mutation that
    /// produced it.
    async fn log_event(&self, entry: LogEntry) {
        if let Err(e) = self.write_log(entry).await {
            warn!(error = %e, "Audit log append failed");
        }
    }

    async fn prune_logs(&self, store: &Arc<dyn PrimaryStore>) {
        let keys = match store.list_keys(LOG_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Log prune scan failed");
                return;
            }
        };
        if keys.len() <= LOG_RETENTION {
            return;
        }
        let excess = keys.len() - LOG_RETENTION;
        let oldest: Vec<String> = keys.into_iter().take(excess).collect();
        if let Err(e) = store.remove_many(&oldest).await {
            warn!(error = %e, "Log prune failed");
        }
    }

    pub async fn read_logs(&self, limit: usize, kind: Option<&str>) -> Vec<LogEntry> {
        if let Some(store) = self.conn.acquire().await {
            let fetch_limit = if kind.is_none() { Some(limit) } else { None };
            match store.list_docs(LOG_PREFIX, true, fetch_limit).await {
                Ok(docs) => {
                    let mut entries: Vec<LogEntry> = docs
                        .into_iter()
                        .filter_map(|d| serde_json::from_value(d).ok())
                        .collect();
                    if let Some(kind) = kind {
                        entries.retain(|e| e.kind == kind);
                    }
                    entries.truncate(limit);
                    return entries;
                }
                Err(e) => warn!(error = %e, "Log read failed, using local fallback"),
            }
        }
        let mut entries = self.files.read_logs(usize::MAX);
        if let Some(kind) = kind {
            entries.retain(|e| e.kind == kind);
        }
        entries.truncate(limit);
        entries
    }

    pub async fn clear_logs(&self) -> Result<usize> {
        if let Some(store) = self.conn.acquire().await {
            let keys = store.list_keys(LOG_PREFIX).await?;
            store.remove_many(&keys).await
        } else {
            self.files.clear_logs()?;
            Ok(0)
        }
    }

    // ── Backup export ──

    /// Full content set and config for `run_backup`. A backup of
    /// fallback-only state is just the fallback files themselves, so this is
    /// a hard error when the primary store is unavailable.
    pub async fn dump(&self) -> Result<(Vec<ContentItem>, Value)> {
        let store = self.conn.acquire().await.ok_or_else(|| {
            StoreError::Unavailable("backup export requires the primary store".into())
        })?;
        let docs = store.list_docs(CONTENT_PREFIX, false, None).await?;
        let items = docs.into_iter().filter_map(doc_to_item).collect();
        let config = match store.get(CONFIG_KEY).await? {
            Some(doc) => strip_internal(doc),
            None => Value::Object(Default::default()),
        };
        Ok((items, config))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fallback::counting::CountingFallback;
    use crate::store::memory::MemoryStore;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<MemoryStore>,
        fallback: Arc<CountingFallback>,
        repo: ContentRepository,
    }

    fn item(id: &str, title: &str) -> ContentItem {
        ContentItem::new(id).with_field("title", serde_json::json!(title))
    }

    fn fixture(store: MemoryStore, fallback: CountingFallback) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store);
        let fallback = Arc::new(fallback);
        let conn = Arc::new(ConnectionManager::new(
            Arc::clone(&store) as Arc<dyn PrimaryStore>,
            Duration::from_secs(3),
        ));
        let files = Arc::new(FallbackFiles::open(dir.path()).unwrap());
        let repo = ContentRepository::new(
            conn,
            Arc::clone(&fallback) as Arc<dyn FallbackSource>,
            files,
            BackupHandle::detached(),
        );
        Fixture {
            _dir: dir,
            store,
            fallback,
            repo,
        }
    }

    #[tokio::test]
    async fn test_write_then_read_one_round_trip_primary() {
        let f = fixture(MemoryStore::new(), CountingFallback::failing());
        let written = item("frieren", "Frieren");
        f.repo.write(written.clone()).await.unwrap();
        let read = f.repo.read_one("frieren").await.unwrap();
        assert_eq!(read, written);
    }

    #[tokio::test]
    async fn test_write_then_read_one_round_trip_fallback_mode() {
        let f = fixture(MemoryStore::unreachable(), CountingFallback::failing());
        let written = item("frieren", "Frieren");
        f.repo.write(written.clone()).await.unwrap();
        let read = f.repo.read_one("frieren").await.unwrap();
        assert_eq!(read, written);
        assert_eq!(f.store.len(), 0);
    }

    #[tokio::test]
    async fn test_write_validation() {
        let f = fixture(MemoryStore::new(), CountingFallback::failing());
        let err = f.repo.write(ContentItem::new("")).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        let err = f.repo.write(item("no-title", "  ")).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        let err = f.repo.write(item("../escape", "X")).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_read_all_nonempty_primary_never_fetches_fallback() {
        let f = fixture(MemoryStore::new(), CountingFallback::returning(vec![item("a1", "X")]));
        f.repo.write(item("frieren", "Frieren")).await.unwrap();

        let items = f.repo.read_all().await;
        assert_eq!(items.len(), 1);
        assert_eq!(f.fallback.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_primary_seeds_from_fallback_once() {
        let f = fixture(
            MemoryStore::new(),
            CountingFallback::returning(vec![item("a1", "X"), item("b2", "Y")]),
        );

        let items = f.repo.read_all().await;
        assert_eq!(items.len(), 2);
        assert_eq!(f.fallback.fetch_count(), 1);
        assert_eq!(f.store.len(), 2);

        // Primary is now authoritative; no further fetches.
        let again = f.repo.read_all().await;
        assert_eq!(again.len(), 2);
        assert_eq!(f.fallback.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_primary_record_survives_when_fallback_has_same_id() {
        let f = fixture(MemoryStore::new(), CountingFallback::returning(vec![item("a1", "fallback")]));
        f.repo.write(item("a1", "primary")).await.unwrap();

        let items = f.repo.read_all().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title(), Some("primary"));
        assert_eq!(f.fallback.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_fallback_ids_collapse_first_wins() {
        let f = fixture(
            MemoryStore::unreachable(),
            CountingFallback::returning(vec![item("a1", "X"), item("a1", "Y")]),
        );
        let items = f.repo.read_all().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title(), Some("X"));
    }

    #[tokio::test]
    async fn test_failed_fallback_degrades_to_empty() {
        let f = fixture(MemoryStore::unreachable(), CountingFallback::failing());
        assert!(f.repo.read_all().await.is_empty());
        assert!(matches!(
            f.repo.read_one("missing").await.unwrap_err(),
            StoreError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_remove_requires_primary() {
        let f = fixture(MemoryStore::unreachable(), CountingFallback::failing());
        assert!(matches!(
            f.repo.remove("frieren").await.unwrap_err(),
            StoreError::Unavailable(_)
        ));

        let f = fixture(MemoryStore::new(), CountingFallback::failing());
        f.repo.write(item("frieren", "Frieren")).await.unwrap();
        assert!(f.repo.remove("frieren").await.unwrap());
        assert!(!f.repo.remove("frieren").await.unwrap());
    }

    #[tokio::test]
    async fn test_config_round_trip_and_default() {
        let f = fixture(MemoryStore::new(), CountingFallback::failing());
        assert_eq!(f.repo.read_config().await, serde_json::json!({}));

        let cfg = serde_json::json!({ "siteName": "AniVault", "featured": ["frieren"] });
        f.repo.write_config(cfg.clone()).await.unwrap();
        assert_eq!(f.repo.read_config().await, cfg);

        assert!(matches!(
            f.repo.write_config(serde_json::json!([1, 2])).await.unwrap_err(),
            StoreError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_log_retention_cap() {
        let f = fixture(MemoryStore::new(), CountingFallback::failing());
        for i in 0..(LOG_RETENTION + 500) {
            f.repo
                .write_log(LogEntry::new("content", &format!("entry {i}")))
                .await
                .unwrap();
        }
        let keys = f.store.list_keys(LOG_PREFIX).await.unwrap();
        assert_eq!(keys.len(), LOG_RETENTION);

        // The survivors are the most recent by insertion order.
        let newest = f.repo.read_logs(1, None).await;
        assert_eq!(newest[0].title, format!("entry {}", LOG_RETENTION + 499));
        let oldest_kept = f.repo.read_logs(LOG_RETENTION, None).await;
        assert_eq!(oldest_kept.last().unwrap().title, "entry 500");
    }

    #[tokio::test]
    async fn test_read_logs_kind_filter_and_clear() {
        let f = fixture(MemoryStore::new(), CountingFallback::failing());
        f.repo.write_log(LogEntry::new("content", "a")).await.unwrap();
        f.repo.write_log(LogEntry::new("config", "b")).await.unwrap();
        f.repo.write_log(LogEntry::new("content", "c")).await.unwrap();

        let content_only = f.repo.read_logs(10, Some("content")).await;
        assert_eq!(content_only.len(), 2);
        assert_eq!(content_only[0].title, "c");

        let cleared = f.repo.clear_logs().await.unwrap();
        assert_eq!(cleared, 3);
        assert!(f.repo.read_logs(10, None).await.is_empty());
    }

    #[tokio::test]
    async fn test_dump_requires_primary() {
        let f = fixture(MemoryStore::unreachable(), CountingFallback::failing());
        assert!(matches!(
            f.repo.dump().await.unwrap_err(),
            StoreError::Unavailable(_)
        ));

        let f = fixture(MemoryStore::new(), CountingFallback::failing());
        f.repo.write(item("frieren", "Frieren")).await.unwrap();
        let (items, config) = f.repo.dump().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(config, serde_json::json!({}));
    }
}
