//! Local file backend for state storage
//!
//! The default state lives in a single JSON file (default: statehouse.state.json).
//! Named states live under a workspace directory, one subdirectory per state:
//!
//! ```text
//! statehouse.state.json
//! statehouse.state.d/
//!   staging/statehouse.state.json
//!   prod/statehouse.state.json
//! ```
//!
//! Each state file has a sibling `.lock` file that is created exclusively, so two
//! processes pointed at the same directory cannot both hold the lock. Removing a
//! lock file (release or takeover of an expired lock) additionally requires the
//! exclusive `.lock.takeover` marker.

use async_trait::async_trait;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::{
    Backend, BackendConfig, BackendError, BackendResult, DEFAULT_STATE_NAME, Locker, StateManager,
    validate_state_name,
};
use crate::client::{ClientStateManager, StateClient};
use crate::lock::{LockInfo, check_existing, check_holder};
use crate::state::StateFile;

/// Age after which a takeover marker is considered abandoned by `force_unlock`
const TAKEOVER_MARKER_TIMEOUT: Duration = Duration::from_secs(60);

/// Local file backend for development and simple use cases
pub struct LocalBackend {
    /// Path to the default state file
    state_path: PathBuf,
    /// Directory holding named states
    workspace_dir: PathBuf,
}

impl LocalBackend {
    /// Default state file name
    pub const DEFAULT_STATE_FILE: &'static str = "statehouse.state.json";

    /// Default directory for named states
    pub const DEFAULT_WORKSPACE_DIR: &'static str = "statehouse.state.d";

    /// Create a new LocalBackend with default paths in the current directory
    pub fn new() -> Self {
        Self::with_path(PathBuf::from(Self::DEFAULT_STATE_FILE))
    }

    /// Create a new LocalBackend with a specific default state file path
    ///
    /// Named states go into `statehouse.state.d` next to the state file.
    pub fn with_path(state_path: PathBuf) -> Self {
        let workspace_dir = state_path
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(Self::DEFAULT_WORKSPACE_DIR);
        Self {
            state_path,
            workspace_dir,
        }
    }

    /// Override the directory holding named states
    pub fn with_workspace_dir(mut self, workspace_dir: PathBuf) -> Self {
        self.workspace_dir = workspace_dir;
        self
    }

    /// Create a LocalBackend from configuration
    pub fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let path = config
            .get_string("path")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_STATE_FILE));

        let backend = Self::with_path(path);
        Ok(match config.get_string("workspace_dir") {
            Some(dir) => backend.with_workspace_dir(PathBuf::from(dir)),
            None => backend,
        })
    }

    /// Get the default state file path
    pub fn state_path(&self) -> &PathBuf {
        &self.state_path
    }

    /// Get the named state directory
    pub fn workspace_dir(&self) -> &PathBuf {
        &self.workspace_dir
    }

    /// Path of the state file for a named state
    pub fn state_path_for(&self, name: &str) -> PathBuf {
        if name == DEFAULT_STATE_NAME {
            return self.state_path.clone();
        }
        let file_name = self
            .state_path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_STATE_FILE));
        self.workspace_dir.join(name).join(file_name)
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn states(&self) -> BackendResult<Vec<String>> {
        let mut names = Vec::new();

        match fs::read_dir(&self.workspace_dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry.map_err(|e| {
                        BackendError::Io(format!("Failed to read workspace directory: {}", e))
                    })?;
                    if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                        continue;
                    }
                    let file_name = entry.file_name();
                    if let Some(name) = file_name.to_str()
                        && name != DEFAULT_STATE_NAME
                    {
                        names.push(name.to_string());
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(BackendError::Io(format!(
                    "Failed to read workspace directory: {}",
                    e
                )));
            }
        }

        names.sort();
        names.insert(0, DEFAULT_STATE_NAME.to_string());
        Ok(names)
    }

    async fn state(&self, name: &str) -> BackendResult<Box<dyn StateManager>> {
        validate_state_name(name)?;

        let client = LocalClient::new(self.state_path_for(name));
        if name != DEFAULT_STATE_NAME {
            client.create_if_missing()?;
        }

        Ok(Box::new(ClientStateManager::new(name, client)))
    }

    async fn delete_state(&self, name: &str) -> BackendResult<()> {
        if name == DEFAULT_STATE_NAME {
            return Err(BackendError::DefaultStateDeletion);
        }
        validate_state_name(name)?;

        let dir = self.workspace_dir.join(name);
        if !dir.is_dir() {
            return Err(BackendError::StateNotFound(name.to_string()));
        }

        LocalClient::new(self.state_path_for(name)).delete().await?;
        fs::remove_dir_all(&dir)
            .map_err(|e| BackendError::Io(format!("Failed to delete state {}: {}", name, e)))?;
        log::debug!("Deleted state {} at {}", name, dir.display());
        Ok(())
    }
}

/// Storage client for one local state file and its lock file
pub struct LocalClient {
    /// Path to the state file
    state_path: PathBuf,
    /// Path to the lock file
    lock_path: PathBuf,
    /// Marker serializing everything that removes the lock file
    takeover_path: PathBuf,
}

impl LocalClient {
    pub fn new(state_path: PathBuf) -> Self {
        let lock_path = state_path.with_extension("lock");
        let takeover_path = state_path.with_extension("lock.takeover");
        Self {
            state_path,
            lock_path,
            takeover_path,
        }
    }

    /// Write an empty state unless one is already there
    fn create_if_missing(&self) -> BackendResult<()> {
        if let Some(parent) = self.state_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .map_err(|e| BackendError::Io(format!("Failed to create state directory: {}", e)))?;
        }

        let content = to_json(&StateFile::new())?;
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.state_path)
        {
            Ok(mut file) => file
                .write_all(content.as_bytes())
                .map_err(|e| BackendError::Io(format!("Failed to write state file: {}", e))),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(BackendError::Io(format!(
                "Failed to create state file: {}",
                e
            ))),
        }
    }

    fn read_lock(&self) -> BackendResult<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(BackendError::Io(format!("Failed to read lock file: {}", e)));
            }
        };

        let lock = serde_json::from_str(&content)
            .map_err(|e| BackendError::InvalidState(format!("Failed to parse lock file: {}", e)))?;
        Ok(Some(lock))
    }

    /// Create the lock file, failing if it already exists
    fn try_create_lock(&self, lock: &LockInfo) -> BackendResult<bool> {
        let content = to_json(lock)?;
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(mut file) => {
                if let Err(e) = file.write_all(content.as_bytes()).and_then(|_| file.sync_all()) {
                    drop(file);
                    // An empty lock file would block every later acquisition
                    let _ = fs::remove_file(&self.lock_path);
                    return Err(BackendError::Io(format!("Failed to write lock file: {}", e)));
                }
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(BackendError::Io(format!(
                "Failed to create lock file: {}",
                e
            ))),
        }
    }

    fn remove_lock(&self) -> BackendResult<()> {
        match fs::remove_file(&self.lock_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackendError::Io(format!(
                "Failed to remove lock file: {}",
                e
            ))),
        }
    }

    /// Take the takeover marker
    ///
    /// Only the marker holder may remove the lock file, so the lock it read
    /// is still the one on disk when it deletes it. Creating a lock in the
    /// first place needs no marker.
    fn takeover(&self) -> BackendResult<TakeoverGuard<'_>> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.takeover_path)
        {
            Ok(_) => Ok(TakeoverGuard {
                path: self.takeover_path.as_path(),
            }),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(self.held_by_other()),
            Err(e) => Err(BackendError::Io(format!(
                "Failed to create lock takeover marker: {}",
                e
            ))),
        }
    }

    /// Remove a takeover marker left behind by a process that died holding it
    fn clear_stale_takeover(&self) {
        let stale = fs::metadata(&self.takeover_path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age > TAKEOVER_MARKER_TIMEOUT);

        if stale {
            log::warn!(
                "Removing stale lock takeover marker {}",
                self.takeover_path.display()
            );
            let _ = fs::remove_file(&self.takeover_path);
        }
    }

    /// Report the current holder of a lock we failed to create
    fn held_by_other(&self) -> BackendError {
        match self.read_lock() {
            Ok(Some(existing)) => BackendError::locked(&existing),
            // The holder may still be writing its lock file
            _ => BackendError::Locked {
                lock_id: String::new(),
                who: "unknown".to_string(),
                operation: "unknown".to_string(),
            },
        }
    }
}

/// Removes the takeover marker when dropped
struct TakeoverGuard<'a> {
    path: &'a Path,
}

impl Drop for TakeoverGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(self.path) {
            log::warn!(
                "Failed to remove lock takeover marker {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

#[async_trait]
impl StateClient for LocalClient {
    async fn get(&self) -> BackendResult<Option<StateFile>> {
        let content = match fs::read_to_string(&self.state_path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(BackendError::Io(format!(
                    "Failed to read state file: {}",
                    e
                )));
            }
        };

        let state: StateFile = serde_json::from_str(&content).map_err(|e| {
            BackendError::InvalidState(format!("Failed to parse state file: {}", e))
        })?;

        Ok(Some(state))
    }

    async fn put(&self, state: &StateFile) -> BackendResult<()> {
        let content = to_json(state)?;

        // Write next to the target and rename so readers never see a partial file
        let tmp_path = self.state_path.with_extension("tmp");
        fs::write(&tmp_path, content)
            .map_err(|e| BackendError::Io(format!("Failed to write state file: {}", e)))?;
        fs::rename(&tmp_path, &self.state_path)
            .map_err(|e| BackendError::Io(format!("Failed to write state file: {}", e)))?;

        log::debug!("Wrote state file {}", self.state_path.display());
        Ok(())
    }

    /// Remove the state file and its lock file
    async fn delete(&self) -> BackendResult<()> {
        match fs::remove_file(&self.state_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(BackendError::Io(format!(
                    "Failed to remove state file: {}",
                    e
                )));
            }
        }
        self.remove_lock()
    }

    fn as_locker(&self) -> Option<&dyn Locker> {
        Some(self)
    }
}

#[async_trait]
impl Locker for LocalClient {
    async fn lock(&self, info: &LockInfo) -> BackendResult<String> {
        let lock = info.issue();

        if !self.try_create_lock(&lock)? {
            let _guard = self.takeover()?;

            match self.read_lock() {
                Ok(Some(existing)) => {
                    check_existing(&existing)?;
                    self.remove_lock()?;
                }
                Ok(None) => {}
                Err(_) => return Err(self.held_by_other()),
            }

            if !self.try_create_lock(&lock)? {
                return Err(self.held_by_other());
            }
        }

        log::info!(
            "Acquired lock {} on {}",
            lock.id,
            self.state_path.display()
        );
        Ok(lock.id)
    }

    async fn unlock(&self, lock_id: &str) -> BackendResult<()> {
        let _guard = self.takeover()?;
        let existing = self.read_lock()?;
        check_holder(existing.as_ref(), lock_id)?;

        self.remove_lock()?;
        log::info!("Released lock {} on {}", lock_id, self.state_path.display());
        Ok(())
    }

    async fn force_unlock(&self, lock_id: &str) -> BackendResult<()> {
        log::warn!(
            "Force unlocking lock {} on {}",
            lock_id,
            self.state_path.display()
        );

        self.clear_stale_takeover();
        let _guard = self.takeover()?;
        match self.read_lock() {
            Ok(existing) => check_holder(existing.as_ref(), lock_id)?,
            Err(BackendError::InvalidState(e)) => {
                log::warn!("Removing unreadable lock file {}: {}", self.lock_path.display(), e);
            }
            Err(e) => return Err(e),
        }

        self.remove_lock()
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> BackendResult<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| BackendError::Serialization(format!("Failed to serialize: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_backend;
    use std::fs::File;
    use std::sync::Arc;
    use std::time::SystemTime;
    use tempfile::tempdir;
    use tokio::sync::Barrier;

    #[tokio::test]
    async fn test_local_backend_conformance() {
        let dir = tempdir().unwrap();
        let state_path = dir.path().join("test.state.json");
        let b1 = LocalBackend::with_path(state_path.clone());
        let b2 = LocalBackend::with_path(state_path);

        test_backend(&b1, Some(&b2)).await;
    }

    #[tokio::test]
    async fn test_local_client_read_write() {
        let dir = tempdir().unwrap();
        let client = LocalClient::new(dir.path().join("test.state.json"));

        // Initially no state
        assert!(client.get().await.unwrap().is_none());

        let mut state_file = StateFile::new();
        state_file.increment_serial();
        client.put(&state_file).await.unwrap();

        let read_state = client.get().await.unwrap().unwrap();
        assert_eq!(read_state, state_file);

        client.delete().await.unwrap();
        assert!(client.get().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_client_invalid_state_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.state.json");
        fs::write(&path, "not json").unwrap();

        let result = LocalClient::new(path).get().await;
        assert!(matches!(result, Err(BackendError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_local_backend_locking() {
        let dir = tempdir().unwrap();
        let client = LocalClient::new(dir.path().join("test.state.json"));

        let lock_id = client.lock(&LockInfo::new("apply")).await.unwrap();

        // Try to acquire again - should fail
        let result = client.lock(&LockInfo::new("plan")).await;
        match result {
            Err(BackendError::Locked {
                lock_id: holder,
                operation,
                ..
            }) => {
                assert_eq!(holder, lock_id);
                assert_eq!(operation, "apply");
            }
            other => panic!("Expected Locked error, got {:?}", other),
        }

        client.unlock(&lock_id).await.unwrap();

        // Now can acquire again
        let lock_id2 = client.lock(&LockInfo::new("destroy")).await.unwrap();
        assert_ne!(lock_id, lock_id2);
        client.unlock(&lock_id2).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_backend_expired_lock_is_replaced() {
        let dir = tempdir().unwrap();
        let client = LocalClient::new(dir.path().join("test.state.json"));

        let stale = client
            .lock(&LockInfo::with_timeout("apply", -1))
            .await
            .unwrap();
        let fresh = client.lock(&LockInfo::new("apply")).await.unwrap();

        assert!(matches!(
            client.unlock(&stale).await,
            Err(BackendError::LockMismatch { .. })
        ));
        client.unlock(&fresh).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_local_backend_expired_lock_has_single_taker() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.state.json");

        for _ in 0..100 {
            LocalClient::new(path.clone())
                .lock(&LockInfo::with_timeout("apply", -1))
                .await
                .unwrap();

            let barrier = Arc::new(Barrier::new(8));
            let mut tasks = Vec::new();
            for _ in 0..8 {
                let barrier = Arc::clone(&barrier);
                let client = LocalClient::new(path.clone());
                tasks.push(tokio::spawn(async move {
                    barrier.wait().await;
                    client.lock(&LockInfo::new("apply")).await
                }));
            }

            let mut winners = Vec::new();
            for task in tasks {
                match task.await.unwrap() {
                    Ok(id) => winners.push(id),
                    Err(BackendError::Locked { .. }) => {}
                    Err(other) => panic!("Expected Locked error, got {:?}", other),
                }
            }
            assert_eq!(winners.len(), 1, "expected exactly one holder");

            LocalClient::new(path.clone())
                .unlock(&winners[0])
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_local_backend_force_unlock_clears_empty_lock_file() {
        let dir = tempdir().unwrap();
        let client = LocalClient::new(dir.path().join("test.state.json"));
        fs::write(dir.path().join("test.state.lock"), "").unwrap();

        assert!(matches!(
            client.lock(&LockInfo::new("apply")).await,
            Err(BackendError::Locked { .. })
        ));
        assert!(matches!(
            client.unlock("").await,
            Err(BackendError::InvalidState(_))
        ));

        client.force_unlock("").await.unwrap();
        let lock_id = client.lock(&LockInfo::new("apply")).await.unwrap();
        client.unlock(&lock_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_backend_takeover_marker_blocks_release() {
        let dir = tempdir().unwrap();
        let client = LocalClient::new(dir.path().join("test.state.json"));
        let lock_id = client.lock(&LockInfo::new("apply")).await.unwrap();

        let marker = dir.path().join("test.state.lock.takeover");
        File::create(&marker).unwrap();
        assert!(matches!(
            client.unlock(&lock_id).await,
            Err(BackendError::Locked { .. })
        ));
        assert!(matches!(
            client.force_unlock(&lock_id).await,
            Err(BackendError::Locked { .. })
        ));

        // A marker abandoned by a dead process is cleared by force_unlock
        File::options()
            .write(true)
            .open(&marker)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(600))
            .unwrap();
        client.force_unlock(&lock_id).await.unwrap();
        assert!(!marker.exists());
        assert!(client.read_lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_backend_delete_state_removes_lock() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path().join("infra.json"));
        let manager = backend.state("staging").await.unwrap();
        manager
            .as_locker()
            .unwrap()
            .lock(&LockInfo::new("apply"))
            .await
            .unwrap();

        backend.delete_state("staging").await.unwrap();
        assert!(!backend.state_path_for("staging").exists());
        assert_eq!(backend.states().await.unwrap(), vec![DEFAULT_STATE_NAME]);

        let manager = backend.state("staging").await.unwrap();
        let locker = manager.as_locker().unwrap();
        let lock_id = locker.lock(&LockInfo::new("apply")).await.unwrap();
        locker.unlock(&lock_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_backend_unlock_without_lock() {
        let dir = tempdir().unwrap();
        let client = LocalClient::new(dir.path().join("test.state.json"));

        let result = client.unlock("missing").await;
        assert!(matches!(result, Err(BackendError::LockNotFound(id)) if id == "missing"));
    }

    #[tokio::test]
    async fn test_local_backend_named_state_layout() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path().join("infra.json"));

        backend.state("staging").await.unwrap();

        let expected = dir
            .path()
            .join(LocalBackend::DEFAULT_WORKSPACE_DIR)
            .join("staging")
            .join("infra.json");
        assert_eq!(backend.state_path_for("staging"), expected);
        assert!(expected.exists());
        assert_eq!(
            backend.state_path_for(DEFAULT_STATE_NAME),
            dir.path().join("infra.json")
        );
    }

    #[tokio::test]
    async fn test_local_backend_rejects_escaping_names() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path().join("infra.json"));

        assert!(matches!(
            backend.state("../outside").await,
            Err(BackendError::InvalidStateName { .. })
        ));
        assert!(matches!(
            backend.delete_state("..").await,
            Err(BackendError::InvalidStateName { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_backend_delete_missing_state() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path().join("infra.json"));

        assert!(matches!(
            backend.delete_state("nope").await,
            Err(BackendError::StateNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_local_backend_from_config() {
        let config = BackendConfig::new("local");

        let backend = LocalBackend::from_config(&config).unwrap();
        assert_eq!(
            backend.state_path(),
            &PathBuf::from("statehouse.state.json")
        );
        assert_eq!(
            backend.workspace_dir(),
            &PathBuf::from("statehouse.state.d")
        );
    }

    #[tokio::test]
    async fn test_local_backend_custom_path() {
        let config = BackendConfig::new("local")
            .with_attribute("path", serde_json::json!("custom.state.json"))
            .with_attribute("workspace_dir", serde_json::json!("envs"));

        let backend = LocalBackend::from_config(&config).unwrap();
        assert_eq!(backend.state_path(), &PathBuf::from("custom.state.json"));
        assert_eq!(
            backend.state_path_for("prod"),
            PathBuf::from("envs/prod/custom.state.json")
        );
    }
}
