//! Debounced snapshot synchronization.
//!
//! Repositories report writes through a `BackupHandle`; the scheduler
//! coalesces bursts behind a debounce window, runs unconditionally on a
//! fixed interval to bound staleness, and serializes every run through one
//! event loop. A run dumps full state, materializes one JSON artifact per
//! logical group, and commits/pushes only real changes to a dedicated
//! branch of an external git remote. Failures never reach the write path
//! that triggered them; they land in `BackupStatus`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::content::ContentRepository;
use crate::documents::{BackupStatus, StateDump};
use crate::error::{Result, StoreError};
use crate::userdata::UserDataStore;

/// Idle debounce: far enough out to never fire while disarmed.
const PARKED: Duration = Duration::from_secs(86_400 * 365);
const ERROR_TRUNCATE: usize = 300;

#[derive(Debug, Clone)]
pub enum BackupEvent {
    Write { component: String, label: String },
    Manual { message: Option<String> },
}

/// Fire-and-forget capability handed to the repositories. Sending never
/// blocks and never fails the caller.
#[derive(Clone)]
pub struct BackupHandle {
    tx: mpsc::UnboundedSender<BackupEvent>,
}

impl BackupHandle {
    pub fn notify(&self, component: &str, label: &str) {
        let _ = self.tx.send(BackupEvent::Write {
            component: component.to_string(),
            label: label.to_string(),
        });
    }

    /// Manual trigger: cancels any pending debounce and runs immediately.
    pub fn trigger(&self, message: Option<String>) {
        let _ = self.tx.send(BackupEvent::Manual { message });
    }

    /// A handle wired to nothing. Notifications are dropped.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }
}

pub fn backup_channel() -> (BackupHandle, mpsc::UnboundedReceiver<BackupEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (BackupHandle { tx }, rx)
}

/// Outcome of publishing the artifact directory.
#[derive(Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// A commit was created and pushed.
    Committed,
    /// Working tree matched the last snapshot; nothing to do.
    Clean,
}

#[async_trait]
pub trait SnapshotPublisher: Send + Sync {
    async fn publish(&self, workdir: &Path, reason: &str) -> Result<PublishOutcome>;
}

/// Publishes snapshots with the standard `git` command-line client.
pub struct GitPublisher {
    branch: String,
    remote: Option<String>,
}

impl GitPublisher {
    pub fn new(branch: &str, remote: Option<String>) -> Self {
        Self {
            branch: branch.to_string(),
            remote,
        }
    }

    async fn git(&self, workdir: &Path, args: &[&str]) -> Result<String> {
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(workdir)
            .output()
            .await
            .map_err(|e| StoreError::BackupRun(format!("git {}: {e}", args.join(" "))))?;
        if !output.status.success() {
            return Err(StoreError::BackupRun(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn ensure_repo(&self, workdir: &Path) -> Result<()> {
        if !workdir.join(".git").exists() {
            self.git(workdir, &["init"]).await?;
        }
        self.git(workdir, &["checkout", "-B", &self.branch]).await?;
        if let Some(remote) = &self.remote {
            let existing = self.git(workdir, &["remote"]).await?;
            if !existing.lines().any(|r| r.trim() == "origin") {
                self.git(workdir, &["remote", "add", "origin", remote]).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotPublisher for GitPublisher {
    async fn publish(&self, workdir: &Path, reason: &str) -> Result<PublishOutcome> {
        self.ensure_repo(workdir).await?;
        self.git(workdir, &["add", "-A"]).await?;

        let staged = self.git(workdir, &["status", "--porcelain"]).await?;
        if staged.trim().is_empty() {
            return Ok(PublishOutcome::Clean);
        }

        let message = format!(
            "snapshot: {} ({})",
            reason,
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        self.git(workdir, &["commit", "-m", &message]).await?;

        if self.remote.is_some() {
            self.git(workdir, &["push", "origin", &self.branch]).await?;
        }
        Ok(PublishOutcome::Committed)
    }
}

pub struct BackupConfig {
    pub workdir: PathBuf,
    pub debounce: Duration,
    pub interval: Duration,
}

pub struct BackupScheduler {
    status: Arc<Mutex<BackupStatus>>,
}

impl BackupScheduler {
    /// Spawn the scheduler loop. Repositories must already hold the sending
    /// side of `rx` (see `backup_channel`).
    pub fn start(
        config: BackupConfig,
        rx: mpsc::UnboundedReceiver<BackupEvent>,
        content: Arc<ContentRepository>,
        userdata: Arc<UserDataStore>,
        publisher: Arc<dyn SnapshotPublisher>,
    ) -> Arc<Self> {
        let status = Arc::new(Mutex::new(BackupStatus::default()));
        let scheduler = Arc::new(Self {
            status: Arc::clone(&status),
        });

        tokio::spawn(run_loop(config, rx, content, userdata, publisher, status));
        scheduler
    }

    pub fn status(&self) -> BackupStatus {
        self.status.lock().unwrap().clone()
    }
}

async fn run_loop(
    config: BackupConfig,
    mut rx: mpsc::UnboundedReceiver<BackupEvent>,
    content: Arc<ContentRepository>,
    userdata: Arc<UserDataStore>,
    publisher: Arc<dyn SnapshotPublisher>,
    status: Arc<Mutex<BackupStatus>>,
) {
    let mut interval =
        time::interval_at(Instant::now() + config.interval, config.interval);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    let debounce = time::sleep(PARKED);
    tokio::pin!(debounce);
    let mut armed = false;

    {
        let mut s = status.lock().unwrap();
        s.next_interval_at = Some(Utc::now() + chrono::Duration::from_std(config.interval).unwrap_or_else(|_| chrono::Duration::zero()));
    }

    info!(
        debounce_s = config.debounce.as_secs(),
        interval_s = config.interval.as_secs(),
        "Backup scheduler started"
    );

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    None => break, // all handles dropped
                    Some(BackupEvent::Write { component, label }) => {
                        debug!(component = %component, label = %label, "Write reported, debounce reset");
                        status.lock().unwrap().pending = true;
                        armed = true;
                        debounce.as_mut().reset(Instant::now() + config.debounce);
                    }
                    Some(BackupEvent::Manual { message }) => {
                        armed = false;
                        debounce.as_mut().reset(Instant::now() + PARKED);
                        let reason = message.unwrap_or_else(|| "manual trigger".to_string());
                        run_backup(&config, &content, &userdata, publisher.as_ref(), &status, &reason).await;
                    }
                }
            }

            () = &mut debounce, if armed => {
                armed = false;
                debounce.as_mut().reset(Instant::now() + PARKED);
                run_backup(&config, &content, &userdata, publisher.as_ref(), &status, "debounced writes").await;
            }

            _ = interval.tick() => {
                {
                    let mut s = status.lock().unwrap();
                    s.next_interval_at = Some(Utc::now() + chrono::Duration::from_std(config.interval).unwrap_or_else(|_| chrono::Duration::zero()));
                }
                run_backup(&config, &content, &userdata, publisher.as_ref(), &status, "scheduled interval").await;
            }
        }
    }

    status.lock().unwrap().last_message = Some("scheduler stopped".to_string());
    info!("Backup scheduler stopped");
}

/// One snapshot run. Serialized by construction: only the scheduler loop
/// calls it, and the loop awaits completion before touching the next
/// trigger. Every failure is captured into `BackupStatus`.
async fn run_backup(
    config: &BackupConfig,
    content: &ContentRepository,
    userdata: &UserDataStore,
    publisher: &dyn SnapshotPublisher,
    status: &Arc<Mutex<BackupStatus>>,
    reason: &str,
) {
    info!(reason = %reason, "Backup run starting");
    let outcome = try_run(config, content, userdata, publisher, reason).await;

    let mut s = status.lock().unwrap();
    s.pending = false;
    match outcome {
        Ok(PublishOutcome::Committed) => {
            s.last_run_at = Some(Utc::now());
            s.last_message = Some(format!("snapshot pushed ({reason})"));
            s.last_error = None;
            s.runs += 1;
            info!(reason = %reason, "Backup run complete");
        }
        Ok(PublishOutcome::Clean) => {
            s.last_run_at = Some(Utc::now());
            s.last_message = Some("already synchronized".to_string());
            s.last_error = None;
            s.runs += 1;
            info!("Backup run found nothing to publish");
        }
        Err(e) => {
            let mut msg = e.to_string();
            msg.truncate(ERROR_TRUNCATE);
            error!(error = %msg, "Backup run failed");
            s.last_error = Some(msg);
        }
    }
}

async fn try_run(
    config: &BackupConfig,
    content: &ContentRepository,
    userdata: &UserDataStore,
    publisher: &dyn SnapshotPublisher,
    reason: &str,
) -> Result<PublishOutcome> {
    let (items, site_config) = content.dump().await?;
    let user_blobs = userdata.dump().await?;
    let dump = StateDump {
        content: items,
        config: site_config,
        user_blobs,
    };
    write_artifacts(&config.workdir, &dump)?;
    publisher.publish(&config.workdir, reason).await
}

/// Materialize the dump as one JSON artifact per logical group. User blobs
/// that disappeared from the store are removed from the tree so deletions
/// reach the snapshot too.
fn write_artifacts(workdir: &Path, dump: &StateDump) -> Result<()> {
    fs::create_dir_all(workdir)?;
    fs::write(
        workdir.join("content.json"),
        serde_json::to_vec_pretty(&dump.content)?,
    )?;
    fs::write(
        workdir.join("config.json"),
        serde_json::to_vec_pretty(&dump.config)?,
    )?;

    let userdata_dir = workdir.join("userdata");
    fs::create_dir_all(&userdata_dir)?;

    let mut expected: Vec<PathBuf> = Vec::new();
    for (user_id, namespace, value) in &dump.user_blobs {
        let dir = userdata_dir.join(user_id);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{namespace}.json"));
        fs::write(&path, serde_json::to_vec_pretty(value)?)?;
        expected.push(path);
    }

    for entry in walkdir::WalkDir::new(&userdata_dir)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .flatten()
    {
        let path = entry.path().to_path_buf();
        if entry.file_type().is_file() && !expected.contains(&path) {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Could not drop stale artifact");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::connection::ConnectionManager;
    use crate::documents::ContentItem;
    use crate::fallback::counting::CountingFallback;
    use crate::fallback::FallbackSource;
    use crate::localfs::FallbackFiles;
    use crate::store::memory::MemoryStore;
    use crate::store::PrimaryStore;
    use tempfile::TempDir;

    struct CountingPublisher {
        runs: AtomicUsize,
    }

    impl CountingPublisher {
        fn new() -> Self {
            Self {
                runs: AtomicUsize::new(0),
            }
        }

        fn run_count(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SnapshotPublisher for CountingPublisher {
        async fn publish(&self, _workdir: &Path, _reason: &str) -> Result<PublishOutcome> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(PublishOutcome::Committed)
        }
    }

    struct Fixture {
        _data_dir: TempDir,
        _work_dir: TempDir,
        handle: BackupHandle,
        scheduler: Arc<BackupScheduler>,
        publisher: Arc<CountingPublisher>,
        content: Arc<ContentRepository>,
    }

    fn fixture(store: MemoryStore, debounce: Duration, interval: Duration) -> Fixture {
        let data_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();
        let store = Arc::new(store);
        let conn = Arc::new(ConnectionManager::new(
            Arc::clone(&store) as Arc<dyn PrimaryStore>,
            Duration::from_secs(3),
        ));
        let files = Arc::new(FallbackFiles::open(data_dir.path()).unwrap());
        let (handle, rx) = backup_channel();
        let content = Arc::new(ContentRepository::new(
            Arc::clone(&conn),
            Arc::new(CountingFallback::failing()) as Arc<dyn FallbackSource>,
            Arc::clone(&files),
            handle.clone(),
        ));
        let userdata = Arc::new(UserDataStore::new(
            Arc::clone(&conn),
            files,
            handle.clone(),
        ));
        let publisher = Arc::new(CountingPublisher::new());
        let scheduler = BackupScheduler::start(
            BackupConfig {
                workdir: work_dir.path().to_path_buf(),
                debounce,
                interval,
            },
            rx,
            Arc::clone(&content),
            userdata,
            Arc::clone(&publisher) as Arc<dyn SnapshotPublisher>,
        );
        Fixture {
            _data_dir: data_dir,
            _work_dir: work_dir,
            handle,
            scheduler,
            publisher,
            content,
        }
    }

    fn item(id: &str, title: &str) -> ContentItem {
        ContentItem::new(id).with_field("title", serde_json::json!(title))
    }

    #[tokio::test]
    async fn test_debounce_coalesces_burst_into_one_run() {
        let f = fixture(
            MemoryStore::new(),
            Duration::from_millis(100),
            Duration::from_secs(3600),
        );

        f.content.write(item("a1", "X")).await.unwrap();
        f.content.write(item("a1", "Y")).await.unwrap();
        assert_eq!(f.publisher.run_count(), 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(f.publisher.run_count(), 1);

        let status = f.scheduler.status();
        assert!(!status.pending);
        assert_eq!(status.runs, 1);
        assert!(status.last_error.is_none());
        assert!(status.last_run_at.is_some());
    }

    #[tokio::test]
    async fn test_manual_trigger_cancels_armed_debounce() {
        let f = fixture(
            MemoryStore::new(),
            Duration::from_millis(200),
            Duration::from_secs(3600),
        );

        f.content.write(item("a1", "X")).await.unwrap();
        f.handle.trigger(Some("operator request".to_string()));

        // Manual run happens promptly; the armed debounce must not add a
        // second run once its original window elapses.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(f.publisher.run_count(), 1);
        assert!(f
            .scheduler
            .status()
            .last_message
            .unwrap()
            .contains("operator request"));
    }

    #[tokio::test]
    async fn test_interval_fires_without_writes() {
        let f = fixture(
            MemoryStore::new(),
            Duration::from_secs(3600),
            Duration::from_millis(150),
        );
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(f.publisher.run_count() >= 1);
    }

    #[tokio::test]
    async fn test_failed_run_is_contained() {
        // Primary unreachable: dump fails, status captures it, pending clears.
        let f = fixture(
            MemoryStore::unreachable(),
            Duration::from_millis(50),
            Duration::from_secs(3600),
        );
        f.handle.notify("content", "write a1");
        tokio::time::sleep(Duration::from_millis(300)).await;

        let status = f.scheduler.status();
        assert_eq!(f.publisher.run_count(), 0);
        assert_eq!(status.runs, 0);
        assert!(!status.pending);
        assert!(status.last_error.unwrap().contains("primary store"));
    }

    #[tokio::test]
    async fn test_artifacts_written_and_stale_blobs_pruned() {
        let work = TempDir::new().unwrap();
        let dump = StateDump {
            content: vec![item("a1", "X")],
            config: serde_json::json!({ "siteName": "AniVault" }),
            user_blobs: vec![(
                "2f4a7c1e-9b3d-4e6f-8a10-5c2d3e4f5a6b".to_string(),
                "watchlist".to_string(),
                serde_json::json!(["a1"]),
            )],
        };
        write_artifacts(work.path(), &dump).unwrap();
        assert!(work.path().join("content.json").exists());
        assert!(work.path().join("config.json").exists());
        let blob = work
            .path()
            .join("userdata/2f4a7c1e-9b3d-4e6f-8a10-5c2d3e4f5a6b/watchlist.json");
        assert!(blob.exists());

        // Blob deleted upstream: next run drops the artifact.
        let empty = StateDump {
            content: vec![],
            config: serde_json::json!({}),
            user_blobs: vec![],
        };
        write_artifacts(work.path(), &empty).unwrap();
        assert!(!blob.exists());
    }
}
