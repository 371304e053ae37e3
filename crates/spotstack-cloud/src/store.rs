//! Durable deployment state store
//!
//! One JSON file per stack id under the state directory:
//!
//! ```text
//! <state_dir>/
//! ├── demo-1.json          current record
//! ├── demo-1.json.backup   previous record
//! ├── demo-1.json.tmp      in-flight write (never read)
//! └── demo-1.lock          exclusive lock held during read-modify-write
//! ```
//!
//! Writes go to the temp file first, are re-read and validated, and only
//! then renamed over the record, so readers observe either the old or the
//! new complete record.
//!
//! A held lock is refreshed in the background; only a lock whose holder
//! stopped refreshing it for the stale window can be broken by a waiter.

use crate::error::{CloudError, Result};
use crate::state::DeploymentState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

const STATE_VERSION: u32 = 1;
const RECORD_SUFFIX: &str = ".json";
const TEMP_SUFFIX: &str = ".json.tmp";
const BACKUP_SUFFIX: &str = ".json.backup";
const LOCK_SUFFIX: &str = ".lock";

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_LOCK_POLL: Duration = Duration::from_millis(50);
const DEFAULT_STALE_LOCK: Duration = Duration::from_secs(600);
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

#[derive(Debug, Deserialize)]
struct RecordFile {
    version: u32,
    state: DeploymentState,
}

#[derive(Serialize)]
struct RecordFileRef<'a> {
    version: u32,
    state: &'a DeploymentState,
}

/// File-backed store of [`DeploymentState`] records
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
    lock_timeout: Duration,
    lock_poll: Duration,
    stale_lock_after: Duration,
}

impl StateStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_poll: DEFAULT_LOCK_POLL,
            stale_lock_after: DEFAULT_STALE_LOCK,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_stale_lock_after(mut self, age: Duration) -> Self {
        self.stale_lock_after = age;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    fn path_with(&self, stack_id: &str, suffix: &str) -> PathBuf {
        self.root.join(format!("{}{}", stack_id, suffix))
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.root.exists() {
            fs::create_dir_all(&self.root).await?;
            tracing::debug!("Created state directory: {}", self.root.display());
        }
        Ok(())
    }

    /// Load the record for `stack_id`, if any.
    pub async fn get(&self, stack_id: &str) -> Result<Option<DeploymentState>> {
        check_key(stack_id)?;
        let path = self.path_with(stack_id, RECORD_SUFFIX);
        match fs::read_to_string(&path).await {
            Ok(content) => decode(&path, &content).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load every record, ordered by stack id.
    pub async fn list(&self) -> Result<Vec<DeploymentState>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut states = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stack_id) = name.to_str().and_then(|n| n.strip_suffix(RECORD_SUFFIX)) else {
                continue;
            };
            if let Some(state) = self.get(stack_id).await? {
                states.push(state);
            }
        }

        states.sort_by(|a, b| a.stack_id.cmp(&b.stack_id));
        tracing::debug!("Listed {} deployment records", states.len());
        Ok(states)
    }

    /// Acquire the exclusive lock of a record, waiting at most the configured timeout.
    pub async fn lock(&self, stack_id: &str) -> Result<StateLock> {
        self.lock_with_timeout(stack_id, self.lock_timeout).await
    }

    pub async fn lock_with_timeout(&self, stack_id: &str, timeout: Duration) -> Result<StateLock> {
        check_key(stack_id)?;
        self.ensure_dir().await?;

        let lock_path = self.path_with(stack_id, LOCK_SUFFIX);
        let started = tokio::time::Instant::now();

        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await
            {
                Ok(mut file) => {
                    let info = LockInfo::current();
                    file.write_all(&serde_json::to_vec_pretty(&info)?).await?;
                    file.sync_all().await?;
                    tracing::debug!(stack_id, "Acquired state lock");
                    let every = (self.stale_lock_after / 4).max(MIN_HEARTBEAT);
                    let heartbeat = spawn_heartbeat(lock_path.clone(), info.token.clone(), every);
                    return Ok(StateLock {
                        stack_id: stack_id.to_string(),
                        lock_path,
                        token: info.token,
                        heartbeat: Some(heartbeat),
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.remove_if_stale(&lock_path).await? {
                        continue;
                    }
                }
                Err(e) => return Err(e.into()),
            }

            if started.elapsed() >= timeout {
                let holder = read_lock_info(&lock_path)
                    .await
                    .map(|info| format!("{} (pid {}) since {}", info.holder, info.pid, info.acquired_at))
                    .unwrap_or_else(|| "unknown holder".to_string());
                return Err(CloudError::Lock(format!(
                    "stack {} is locked by {}; gave up after {:?}",
                    stack_id, holder, timeout
                )));
            }

            tokio::time::sleep(self.lock_poll).await;
        }
    }

    /// Break the lock at `lock_path` if its holder stopped refreshing it.
    ///
    /// The lock is moved aside before it is deleted; if what was moved is no
    /// longer the lock judged stale, it is put back.
    async fn remove_if_stale(&self, lock_path: &Path) -> Result<bool> {
        let Some(info) = read_lock_info(lock_path).await else {
            // Holder is still writing its info
            return Ok(false);
        };
        let idle = Utc::now().signed_duration_since(info.last_seen());
        if !idle.to_std().is_ok_and(|idle| idle >= self.stale_lock_after) {
            return Ok(false);
        }

        let aside = sibling(lock_path, &format!("stale-{}", uuid::Uuid::new_v4()));
        match fs::rename(lock_path, &aside).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }

        let taken = read_lock_info(&aside).await;
        if taken
            .as_ref()
            .is_some_and(|t| t.token == info.token && t.last_seen() == info.last_seen())
        {
            tracing::warn!(
                "Removed stale lock from {} (pid {}) last seen at {}",
                info.holder,
                info.pid,
                info.last_seen()
            );
            let _ = fs::remove_file(&aside).await;
            return Ok(true);
        }

        // The holder refreshed or replaced the lock after the check
        if let Err(e) = fs::hard_link(&aside, lock_path).await
            && e.kind() != std::io::ErrorKind::AlreadyExists
        {
            tracing::warn!("Failed to reinstate lock {}: {}", lock_path.display(), e);
        }
        let _ = fs::remove_file(&aside).await;
        Ok(false)
    }

    /// Atomically replace the record guarded by `lock`.
    ///
    /// The serialized record is re-read from the temp file and validated
    /// before the rename; an invalid record is rejected and the previous one
    /// stays in place.
    pub async fn put(&self, lock: &StateLock, state: &DeploymentState) -> Result<()> {
        if lock.stack_id != state.stack_id {
            return Err(CloudError::Lock(format!(
                "lock for {} cannot guard a write of {}",
                lock.stack_id, state.stack_id
            )));
        }
        state.check_invariants()?;
        self.ensure_dir().await?;

        let path = self.path_with(&state.stack_id, RECORD_SUFFIX);
        let temp = self.path_with(&state.stack_id, TEMP_SUFFIX);
        let backup = self.path_with(&state.stack_id, BACKUP_SUFFIX);

        let content = serde_json::to_vec_pretty(&RecordFileRef {
            version: STATE_VERSION,
            state,
        })?;
        {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(&content).await?;
            file.sync_all().await?;
        }

        let written = fs::read_to_string(&temp).await?;
        if let Err(e) = decode(&temp, &written) {
            let _ = fs::remove_file(&temp).await;
            tracing::error!(stack_id = %state.stack_id, "Rejected state write: {}", e);
            return Err(e);
        }

        if path.exists() {
            fs::copy(&path, &backup).await?;
        }
        fs::rename(&temp, &path).await?;

        tracing::debug!(
            stack_id = %state.stack_id,
            status = %state.status,
            "Saved state with {} resources",
            state.resources.len()
        );
        Ok(())
    }

    /// Delete the record guarded by `lock` and release the lock.
    pub async fn delete(&self, lock: StateLock) -> Result<()> {
        for suffix in [RECORD_SUFFIX, BACKUP_SUFFIX, TEMP_SUFFIX] {
            match fs::remove_file(self.path_with(&lock.stack_id, suffix)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::info!(stack_id = %lock.stack_id, "Deleted state record");
        lock.release().await
    }

    /// Load the previous version of a record.
    pub async fn backup(&self, stack_id: &str) -> Result<Option<DeploymentState>> {
        check_key(stack_id)?;
        let path = self.path_with(stack_id, BACKUP_SUFFIX);
        match fs::read_to_string(&path).await {
            Ok(content) => decode(&path, &content).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the current record with its backup.
    pub async fn restore_backup(&self, lock: &StateLock) -> Result<DeploymentState> {
        let previous = self.backup(&lock.stack_id).await?.ok_or_else(|| {
            CloudError::State(format!("no backup recorded for {}", lock.stack_id))
        })?;
        self.put(lock, &previous).await?;
        tracing::info!(stack_id = %lock.stack_id, "Restored state from backup");
        Ok(previous)
    }
}

fn check_key(stack_id: &str) -> Result<()> {
    let safe = !stack_id.is_empty()
        && stack_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if safe {
        Ok(())
    } else {
        Err(CloudError::Validation(format!(
            "'{}' is not a valid state key",
            stack_id
        )))
    }
}

fn decode(path: &Path, content: &str) -> Result<DeploymentState> {
    let record: RecordFile = serde_json::from_str(content).map_err(|e| {
        CloudError::State(format!("corrupt record {}: {}", path.display(), e))
    })?;

    if record.version > STATE_VERSION {
        return Err(CloudError::State(format!(
            "record {} has version {} newer than supported version {}",
            path.display(),
            record.version,
            STATE_VERSION
        )));
    }

    record.state.check_invariants()?;
    Ok(record.state)
}

/// Lock information
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    pid: u32,
    /// Unique per acquisition
    #[serde(default)]
    token: String,
    acquired_at: DateTime<Utc>,
    #[serde(default)]
    heartbeat_at: Option<DateTime<Utc>>,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            holder: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
            token: uuid::Uuid::new_v4().to_string(),
            acquired_at: Utc::now(),
            heartbeat_at: None,
        }
    }

    fn last_seen(&self) -> DateTime<Utc> {
        self.heartbeat_at.unwrap_or(self.acquired_at)
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

async fn read_lock_info(path: &Path) -> Option<LockInfo> {
    let content = fs::read_to_string(path).await.ok()?;
    serde_json::from_str(&content).ok()
}

fn owns(path: &Path, token: &str) -> bool {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| serde_json::from_str::<LockInfo>(&content).ok())
        .is_some_and(|info| info.token == token)
}

/// Rewrite the heartbeat of the lock at `path` if it still carries `token`.
async fn refresh_lock(path: &Path, token: &str) -> Result<bool> {
    let Some(mut info) = read_lock_info(path).await else {
        return Ok(false);
    };
    if info.token != token {
        return Ok(false);
    }
    info.heartbeat_at = Some(Utc::now());
    let temp = sibling(path, &format!("hb-{}", token));
    fs::write(&temp, serde_json::to_vec_pretty(&info)?).await?;
    fs::rename(&temp, path).await?;
    Ok(true)
}

fn spawn_heartbeat(path: PathBuf, token: String, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match refresh_lock(&path, &token).await {
                Ok(true) => {}
                Ok(false) => {
                    if let Some(other) = read_lock_info(&path).await
                        && other.token != token
                    {
                        tracing::warn!(
                            "Lock {} was taken over by {} (pid {})",
                            path.display(),
                            other.holder,
                            other.pid
                        );
                        return;
                    }
                }
                Err(e) => tracing::warn!("Failed to refresh lock {}: {}", path.display(), e),
            }
        }
    })
}

/// RAII guard for a record lock
///
/// Releasing removes the lock file only while it still carries this
/// acquisition's token.
#[derive(Debug)]
pub struct StateLock {
    stack_id: String,
    lock_path: PathBuf,
    token: String,
    heartbeat: Option<JoinHandle<()>>,
    released: bool,
}

impl StateLock {
    pub fn stack_id(&self) -> &str {
        &self.stack_id
    }

    fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }

    /// Release the lock
    pub async fn release(mut self) -> Result<()> {
        self.stop_heartbeat();
        if !self.released {
            self.released = true;
            match read_lock_info(&self.lock_path).await {
                Some(info) if info.token == self.token => {}
                Some(info) => {
                    tracing::warn!(
                        stack_id = %self.stack_id,
                        "Lock was taken over by {} (pid {}); leaving it in place",
                        info.holder,
                        info.pid
                    );
                    return Ok(());
                }
                None => return Ok(()),
            }
            match fs::remove_file(&self.lock_path).await {
                Ok(()) => tracing::debug!(stack_id = %self.stack_id, "Released state lock"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        self.stop_heartbeat();
        if !self.released && owns(&self.lock_path, &self.token) {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeploymentConfig, TierKind};
    use crate::state::{DeploymentStatus, ResourceHandle, ResourceKind};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn state(stack_id: &str) -> DeploymentState {
        DeploymentState::new(DeploymentConfig::new(stack_id, TierKind::Dev, "us-east-1"))
    }

    #[tokio::test]
    async fn test_state_put_get() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());

        let mut record = state("demo-1");
        record.upsert_handle(ResourceHandle::created(ResourceKind::Network, "vpc-1"));

        let lock = store.lock("demo-1").await.unwrap();
        store.put(&lock, &record).await.unwrap();
        lock.release().await.unwrap();

        let loaded = store.get("demo-1").await.unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_missing_record() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());

        assert!(store.get("nothing").await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_write_rejected_and_old_record_kept() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());
        let lock = store.lock("demo-1").await.unwrap();

        let good = state("demo-1");
        store.put(&lock, &good).await.unwrap();

        let mut bad = good.clone();
        bad.set_status(DeploymentStatus::Running);
        assert!(matches!(
            store.put(&lock, &bad).await,
            Err(CloudError::State(_))
        ));

        let loaded = store.get("demo-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, DeploymentStatus::Initializing);
        assert!(!temp_dir.path().join("demo-1.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_crash_mid_write_leaves_old_record() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());
        let lock = store.lock("demo-1").await.unwrap();
        store.put(&lock, &state("demo-1")).await.unwrap();

        // A process died after writing half of the temp file
        std::fs::write(temp_dir.path().join("demo-1.json.tmp"), "{\"version\": 1, \"sta").unwrap();

        let loaded = store.get("demo-1").await.unwrap().unwrap();
        assert_eq!(loaded.stack_id, "demo-1");
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_hard_error() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());
        std::fs::write(temp_dir.path().join("broken.json"), "not json").unwrap();

        assert!(matches!(
            store.get("broken").await,
            Err(CloudError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());
        let content = serde_json::json!({ "version": 99, "state": state("future") });
        std::fs::write(temp_dir.path().join("future.json"), content.to_string()).unwrap();

        assert!(matches!(
            store.get("future").await,
            Err(CloudError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_readers_see_complete_records() {
        let temp_dir = tempdir().unwrap();
        let store = Arc::new(StateStore::new(temp_dir.path()));
        let lock = store.lock("demo-1").await.unwrap();
        store.put(&lock, &state("demo-1")).await.unwrap();

        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let record = store.get("demo-1").await.unwrap();
                    assert!(record.is_some());
                }
            })
        };

        for i in 0..50 {
            let mut record = state("demo-1");
            record.upsert_handle(ResourceHandle::created(
                ResourceKind::Network,
                format!("vpc-{}", i),
            ));
            store.put(&lock, &record).await.unwrap();
        }

        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_with_bounded_wait() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path()).with_lock_timeout(Duration::from_millis(200));

        let held = store.lock("demo-1").await.unwrap();
        assert!(matches!(
            store.lock("demo-1").await,
            Err(CloudError::Lock(_))
        ));

        // Other stacks are unaffected
        let other = store.lock("demo-2").await.unwrap();
        other.release().await.unwrap();

        held.release().await.unwrap();
        let again = store.lock("demo-1").await.unwrap();
        drop(again);
        assert!(!temp_dir.path().join("demo-1.lock").exists());
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path()).with_lock_timeout(Duration::from_secs(5));

        let held = store.lock("demo-1").await.unwrap();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.lock("demo-1").await })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!waiter.is_finished());
        held.release().await.unwrap();

        let acquired = waiter.await.unwrap().unwrap();
        assert_eq!(acquired.stack_id(), "demo-1");
    }

    #[tokio::test]
    async fn test_stale_lock_is_removed() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path())
            .with_lock_timeout(Duration::from_millis(200))
            .with_stale_lock_after(Duration::from_secs(60));

        let stale = serde_json::json!({
            "holder": "crashed-host",
            "pid": 1,
            "acquired_at": Utc::now() - chrono::Duration::hours(2),
        });
        std::fs::write(temp_dir.path().join("demo-1.lock"), stale.to_string()).unwrap();

        let lock = store.lock("demo-1").await.unwrap();
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_held_lock_outlives_stale_window() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path())
            .with_lock_timeout(Duration::from_millis(300))
            .with_stale_lock_after(Duration::from_millis(200));

        let held = store.lock("demo-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;

        assert!(matches!(
            store.lock("demo-1").await,
            Err(CloudError::Lock(_))
        ));

        held.release().await.unwrap();
        let again = store.lock("demo-1").await.unwrap();
        again.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_broken_lock_release_keeps_new_holder() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path())
            .with_lock_timeout(Duration::from_secs(5))
            .with_stale_lock_after(Duration::from_millis(200));

        // The first holder hangs and stops refreshing its lock
        let mut hung = store.lock("demo-1").await.unwrap();
        hung.stop_heartbeat();

        let current = store.lock("demo-1").await.unwrap();
        hung.release().await.unwrap();

        assert!(temp_dir.path().join("demo-1.lock").exists());
        assert!(matches!(
            store.lock_with_timeout("demo-1", Duration::from_millis(100)).await,
            Err(CloudError::Lock(_))
        ));

        current.release().await.unwrap();
        assert!(!temp_dir.path().join("demo-1.lock").exists());
    }

    #[tokio::test]
    async fn test_backup_and_restore() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());
        let lock = store.lock("demo-1").await.unwrap();

        let first = state("demo-1");
        store.put(&lock, &first).await.unwrap();
        let mut second = first.clone();
        second.upsert_handle(ResourceHandle::created(ResourceKind::Network, "vpc-9"));
        store.put(&lock, &second).await.unwrap();

        assert_eq!(store.backup("demo-1").await.unwrap(), Some(first.clone()));
        let restored = store.restore_backup(&lock).await.unwrap();
        assert_eq!(restored, first);
        assert_eq!(store.get("demo-1").await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_delete_removes_record() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());
        let lock = store.lock("demo-1").await.unwrap();
        store.put(&lock, &state("demo-1")).await.unwrap();

        store.delete(lock).await.unwrap();
        assert!(store.get("demo-1").await.unwrap().is_none());
        assert!(!temp_dir.path().join("demo-1.lock").exists());
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());
        assert!(matches!(
            store.get("../etc/passwd").await,
            Err(CloudError::Validation(_))
        ));
    }
}
