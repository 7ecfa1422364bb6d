//! Per-state storage clients and the generic state manager built on them

use async_trait::async_trait;

use crate::backend::{BackendResult, Locker, StateManager};
use crate::state::StateFile;

/// Raw storage for a single state slot
///
/// Backends implement this once per medium and wrap it in a
/// [`ClientStateManager`] to get refresh/persist semantics for free.
#[async_trait]
pub trait StateClient: Send + Sync {
    /// Read the stored state, `None` if the slot holds nothing
    async fn get(&self) -> BackendResult<Option<StateFile>>;

    /// Overwrite the stored state
    async fn put(&self, state: &StateFile) -> BackendResult<()>;

    /// Remove the stored state and any lock held on it
    async fn delete(&self) -> BackendResult<()>;

    /// Locking capability of the medium, if any
    fn as_locker(&self) -> Option<&dyn Locker> {
        None
    }
}

/// [`StateManager`] over any [`StateClient`]
pub struct ClientStateManager<C> {
    name: String,
    client: C,
    /// Working copy handed out to callers
    state: Option<StateFile>,
    /// Last copy read from or written to storage
    stored: Option<StateFile>,
}

impl<C: StateClient> ClientStateManager<C> {
    pub fn new(name: impl Into<String>, client: C) -> Self {
        Self {
            name: name.into(),
            client,
            state: None,
            stored: None,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

#[async_trait]
impl<C: StateClient + 'static> StateManager for ClientStateManager<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn refresh_state(&mut self) -> BackendResult<()> {
        let state = self.client.get().await?;
        log::debug!(
            "Refreshed state {} (serial: {:?})",
            self.name,
            state.as_ref().map(|s| s.serial)
        );
        self.stored = state.clone();
        self.state = state;
        Ok(())
    }

    fn state(&self) -> Option<&StateFile> {
        self.state.as_ref()
    }

    fn write_state(&mut self, state: StateFile) -> BackendResult<()> {
        self.state = Some(state);
        Ok(())
    }

    async fn persist_state(&mut self) -> BackendResult<()> {
        let Some(current) = self.state.as_ref() else {
            log::debug!("Nothing to persist for state {}", self.name);
            return Ok(());
        };

        // The snapshot only takes the new serial once storage has accepted it
        let mut state = current.clone();
        if self.stored.as_ref() != Some(current) {
            state.increment_serial();
        }

        self.client.put(&state).await?;
        log::debug!("Persisted state {} (serial: {})", self.name, state.serial);
        self.stored = Some(state.clone());
        self.state = Some(state);
        Ok(())
    }

    fn as_locker(&self) -> Option<&dyn Locker> {
        self.client.as_locker()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use std::sync::{Arc, Mutex};

    /// Client that keeps the slot in shared memory and counts writes
    #[derive(Clone, Default)]
    struct RecordingClient {
        slot: Arc<Mutex<Option<StateFile>>>,
        puts: Arc<Mutex<usize>>,
        fail_puts: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl StateClient for RecordingClient {
        async fn get(&self) -> BackendResult<Option<StateFile>> {
            Ok(self.slot.lock().unwrap().clone())
        }

        async fn put(&self, state: &StateFile) -> BackendResult<()> {
            if *self.fail_puts.lock().unwrap() {
                return Err(BackendError::Io("storage unavailable".to_string()));
            }
            *self.slot.lock().unwrap() = Some(state.clone());
            *self.puts.lock().unwrap() += 1;
            Ok(())
        }

        async fn delete(&self) -> BackendResult<()> {
            *self.slot.lock().unwrap() = None;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_refresh_empty_slot() {
        let mut manager = ClientStateManager::new("foo", RecordingClient::default());
        manager.refresh_state().await.unwrap();
        assert!(manager.state().is_none());
        assert_eq!(manager.name(), "foo");
    }

    #[tokio::test]
    async fn test_write_does_not_touch_storage() {
        let client = RecordingClient::default();
        let mut manager = ClientStateManager::new("foo", client.clone());

        manager.write_state(StateFile::with_lineage("foo")).unwrap();
        assert_eq!(manager.state().unwrap().lineage, "foo");
        assert!(client.slot.lock().unwrap().is_none());

        manager.persist_state().await.unwrap();
        let stored = client.slot.lock().unwrap().clone().unwrap();
        assert_eq!(stored.lineage, "foo");
        assert_eq!(stored.serial, 1);
    }

    #[tokio::test]
    async fn test_persist_bumps_serial_only_on_change() {
        let client = RecordingClient::default();
        let mut manager = ClientStateManager::new("foo", client.clone());

        manager.write_state(StateFile::new()).unwrap();
        manager.persist_state().await.unwrap();
        manager.persist_state().await.unwrap();

        assert_eq!(*client.puts.lock().unwrap(), 2);
        assert_eq!(manager.state().unwrap().serial, 1);

        let mut changed = manager.state().unwrap().clone();
        changed.lineage = "other".to_string();
        manager.write_state(changed).unwrap();
        manager.persist_state().await.unwrap();
        assert_eq!(manager.state().unwrap().serial, 2);
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_serial() {
        let client = RecordingClient::default();
        let mut manager = ClientStateManager::new("foo", client.clone());

        manager.write_state(StateFile::new()).unwrap();
        *client.fail_puts.lock().unwrap() = true;
        assert!(manager.persist_state().await.is_err());
        assert!(manager.persist_state().await.is_err());
        assert_eq!(manager.state().unwrap().serial, 0);

        *client.fail_puts.lock().unwrap() = false;
        manager.persist_state().await.unwrap();
        assert_eq!(manager.state().unwrap().serial, 1);
        assert_eq!(client.slot.lock().unwrap().as_ref().unwrap().serial, 1);
    }

    #[tokio::test]
    async fn test_persist_without_snapshot_is_noop() {
        let client = RecordingClient::default();
        let mut manager = ClientStateManager::new("foo", client.clone());

        manager.persist_state().await.unwrap();
        assert_eq!(*client.puts.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refresh_sees_other_manager_writes() {
        let client = RecordingClient::default();
        let mut writer = ClientStateManager::new("foo", client.clone());
        let mut reader = ClientStateManager::new("foo", client.clone());

        writer.write_state(StateFile::with_lineage("shared")).unwrap();
        writer.persist_state().await.unwrap();

        reader.refresh_state().await.unwrap();
        assert_eq!(reader.state(), writer.state());
    }

    #[tokio::test]
    async fn test_no_locker_by_default() {
        let manager = ClientStateManager::new("foo", RecordingClient::default());
        assert!(manager.as_locker().is_none());
        assert!(manager.client().delete().await.is_ok());
    }
}
