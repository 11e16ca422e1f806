//! anivault-store — resilient tiered content store with debounced git
//! snapshot backups.
//!
//! The catalog lives in a CouchDB primary store. Reads fall back to a
//! remote read-only source and opportunistically seed an empty primary;
//! writes degrade to a local file tree when the primary is down. Every
//! write feeds a scheduler that coalesces bursts into infrequent full-state
//! snapshots committed and pushed to an external git remote.

pub mod auth;
pub mod backup;
pub mod config;
pub mod connection;
pub mod content;
pub mod couch;
pub mod documents;
pub mod error;
pub mod fallback;
pub mod localfs;
pub mod store;
pub mod userdata;

use std::sync::Arc;
use std::time::Duration;

use auth::AdminTokens;
use backup::{
    backup_channel, BackupHandle, BackupScheduler, GitPublisher, SnapshotPublisher,
};
use config::StoreConfig;
use connection::ConnectionManager;
use content::ContentRepository;
use couch::CouchClient;
use fallback::{FallbackSource, HttpFallback, NoFallback};
use localfs::FallbackFiles;
use store::{CouchStore, PrimaryStore};
use userdata::UserDataStore;

/// Bounded primary-store connection attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// The wired-up store: one shared connection, the two repositories, and the
/// running backup scheduler.
pub struct Store {
    pub conn: Arc<ConnectionManager>,
    pub content: Arc<ContentRepository>,
    pub users: Arc<UserDataStore>,
    pub scheduler: Arc<BackupScheduler>,
    pub backup: BackupHandle,
    pub admin_tokens: AdminTokens,
}

/// Construct every component from config and start the scheduler. The
/// primary-store connection itself stays lazy; the first repository call
/// triggers it.
pub fn bootstrap(config: &StoreConfig) -> error::Result<Store> {
    let couch = CouchClient::new(
        &config.couchdb_url,
        &config.db_name,
        &config.couchdb_user,
        &config.couchdb_password,
    );
    let primary: Arc<dyn PrimaryStore> = Arc::new(CouchStore::new(couch));
    let conn = Arc::new(ConnectionManager::new(primary, CONNECT_TIMEOUT));

    let files = Arc::new(FallbackFiles::open(&config.data_dir)?);
    let fallback: Arc<dyn FallbackSource> = match config.fallback_url.as_deref() {
        Some(url) if !url.is_empty() => Arc::new(HttpFallback::new(url)),
        _ => Arc::new(NoFallback),
    };

    let (handle, rx) = backup_channel();
    let content = Arc::new(ContentRepository::new(
        Arc::clone(&conn),
        fallback,
        Arc::clone(&files),
        handle.clone(),
    ));
    let users = Arc::new(UserDataStore::new(
        Arc::clone(&conn),
        files,
        handle.clone(),
    ));

    let publisher: Arc<dyn SnapshotPublisher> = Arc::new(GitPublisher::new(
        &config.backup.branch,
        config.backup.remote.clone(),
    ));
    let scheduler = BackupScheduler::start(
        backup::BackupConfig {
            workdir: config.backup.workdir.clone(),
            debounce: config.debounce(),
            interval: config.interval(),
        },
        rx,
        Arc::clone(&content),
        Arc::clone(&users),
        publisher,
    );

    Ok(Store {
        conn,
        content,
        users,
        scheduler,
        backup: handle,
        admin_tokens: AdminTokens::new(config.admin_tokens.clone()),
    })
}
