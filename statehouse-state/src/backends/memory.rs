//! In-memory backend for state storage
//!
//! All states and locks live in a [`MemoryStore`]. Cloning the store hands out
//! another handle to the same medium, so several backends built from clones
//! contend for the same locks, the way separate processes would over a bucket.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::backend::{
    Backend, BackendConfig, BackendError, BackendResult, DEFAULT_STATE_NAME, Locker, StateManager,
    validate_state_name,
};
use crate::client::{ClientStateManager, StateClient};
use crate::lock::{LockInfo, check_existing, check_holder};
use crate::state::StateFile;

#[derive(Debug, Default)]
struct StoreContents {
    states: BTreeMap<String, Option<StateFile>>,
    locks: HashMap<String, LockInfo>,
}

/// Shared in-memory storage medium
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreContents>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut contents = StoreContents::default();
        contents.states.insert(DEFAULT_STATE_NAME.to_string(), None);
        Self {
            inner: Arc::new(Mutex::new(contents)),
        }
    }

    fn contents(&self) -> MutexGuard<'_, StoreContents> {
        // A panic while holding the guard cannot leave the maps half-updated
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Backend keeping all states in process memory, mainly for tests
pub struct MemoryBackend {
    store: MemoryStore,
    lock_enabled: bool,
}

impl MemoryBackend {
    /// Create a backend over a fresh store
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }

    /// Create a backend over an existing (possibly shared) store
    pub fn with_store(store: MemoryStore) -> Self {
        Self {
            store,
            lock_enabled: true,
        }
    }

    /// Turn lock enforcement off; `lock` then hands out empty lock IDs
    pub fn with_locking(mut self, enabled: bool) -> Self {
        self.lock_enabled = enabled;
        self
    }

    /// Create a MemoryBackend from configuration
    pub fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        Ok(Self::new().with_locking(config.get_bool_or("lock", true)))
    }

    /// Handle to the underlying store
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    fn client(&self, name: &str) -> MemoryClient {
        MemoryClient {
            store: self.store.clone(),
            name: name.to_string(),
            lock_enabled: self.lock_enabled,
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn states(&self) -> BackendResult<Vec<String>> {
        Ok(self.store.contents().states.keys().cloned().collect())
    }

    async fn state(&self, name: &str) -> BackendResult<Box<dyn StateManager>> {
        validate_state_name(name)?;

        self.store
            .contents()
            .states
            .entry(name.to_string())
            .or_insert_with(|| Some(StateFile::new()));

        Ok(Box::new(ClientStateManager::new(name, self.client(name))))
    }

    async fn delete_state(&self, name: &str) -> BackendResult<()> {
        if name == DEFAULT_STATE_NAME {
            return Err(BackendError::DefaultStateDeletion);
        }

        if !self.store.contents().states.contains_key(name) {
            return Err(BackendError::StateNotFound(name.to_string()));
        }
        self.client(name).delete().await
    }
}

/// Storage client for one state in a [`MemoryStore`]
pub struct MemoryClient {
    store: MemoryStore,
    name: String,
    lock_enabled: bool,
}

#[async_trait]
impl StateClient for MemoryClient {
    async fn get(&self) -> BackendResult<Option<StateFile>> {
        Ok(self.store.contents().states.get(&self.name).cloned().flatten())
    }

    async fn put(&self, state: &StateFile) -> BackendResult<()> {
        self.store
            .contents()
            .states
            .insert(self.name.clone(), Some(state.clone()));
        Ok(())
    }

    /// Remove the state together with any lock held on it
    async fn delete(&self) -> BackendResult<()> {
        let mut contents = self.store.contents();
        contents.states.remove(&self.name);
        contents.locks.remove(&self.name);
        Ok(())
    }

    fn as_locker(&self) -> Option<&dyn Locker> {
        Some(self)
    }
}

#[async_trait]
impl Locker for MemoryClient {
    async fn lock(&self, info: &LockInfo) -> BackendResult<String> {
        if !self.lock_enabled {
            return Ok(String::new());
        }

        let mut contents = self.store.contents();
        if let Some(existing) = contents.locks.get(&self.name) {
            check_existing(existing)?;
        }

        let lock = info.issue();
        let lock_id = lock.id.clone();
        contents.locks.insert(self.name.clone(), lock);
        log::info!("Acquired lock {} on state {}", lock_id, self.name);
        Ok(lock_id)
    }

    async fn unlock(&self, lock_id: &str) -> BackendResult<()> {
        if !self.lock_enabled {
            return Ok(());
        }

        let mut contents = self.store.contents();
        check_holder(contents.locks.get(&self.name), lock_id)?;
        contents.locks.remove(&self.name);
        log::info!("Released lock {} on state {}", lock_id, self.name);
        Ok(())
    }
}
