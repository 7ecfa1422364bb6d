//! Conformance checks every [`Backend`] implementation should pass
//!
//! Drivers call [`test_backend`] from their own tests. Failures panic with a
//! description of the broken guarantee, so the calling test fails.
//!
//! ```ignore
//! let store = MemoryStore::new();
//! let b1 = MemoryBackend::with_store(store.clone());
//! let b2 = MemoryBackend::with_store(store);
//! statehouse_state::testing::test_backend(&b1, Some(&b2)).await;
//! ```

use crate::backend::{Backend, BackendConfig, BackendError, DEFAULT_STATE_NAME, StateManager};
use crate::backends::create_backend;
use crate::lock::LockInfo;

/// Build and configure a backend, failing the test on any error
pub async fn test_backend_config(config: &BackendConfig) -> Box<dyn Backend> {
    create_backend(config)
        .await
        .unwrap_or_else(|e| panic!("bad backend config: {}", e))
}

/// Check the named-state lifecycle of `b1`, and locking between `b1` and `b2`
///
/// `b1` must be freshly configured. Locking is only checked when `b2` is
/// given; it has to point at the same storage as `b1`. Backends without named
/// states or without locking skip the corresponding part.
pub async fn test_backend(b1: &dyn Backend, b2: Option<&dyn Backend>) {
    test_backend_states(b1).await;

    if let Some(b2) = b2 {
        test_backend_state_lock(b1, b2).await;
    }
}

/// `None` means the backend reported named states as unsupported
async fn list_states(b: &dyn Backend) -> Option<Vec<String>> {
    match b.states().await {
        Ok(mut states) => {
            states.sort();
            Some(states)
        }
        Err(BackendError::NamedStatesNotSupported) => {
            log::info!("named states not supported, skipping");
            None
        }
        Err(e) => panic!("error listing states: {}", e),
    }
}

async fn open_refreshed(b: &dyn Backend, name: &str) -> Box<dyn StateManager> {
    let mut manager = b
        .state(name)
        .await
        .unwrap_or_else(|e| panic!("error getting state {:?}: {}", name, e));
    manager
        .refresh_state()
        .await
        .unwrap_or_else(|e| panic!("error refreshing state {:?}: {}", name, e));
    manager
}

fn assert_empty(manager: &dyn StateManager) {
    if let Some(state) = manager.state()
        && state.has_resources()
    {
        panic!("state {:?} should be empty: {:?}", manager.name(), state);
    }
}

async fn test_backend_states(b: &dyn Backend) {
    let Some(states) = list_states(b).await else {
        return;
    };

    // Starts with only the default
    assert_eq!(
        states,
        vec![DEFAULT_STATE_NAME],
        "should only have default to start"
    );

    // Create a couple states
    let mut foo = open_refreshed(b, "foo").await;
    assert_empty(foo.as_ref());

    let mut bar = open_refreshed(b, "bar").await;
    assert_empty(bar.as_ref());

    // Verify they are distinct states
    {
        let mut state = bar.state().cloned().unwrap_or_default();
        state.lineage = "bar".to_string();
        bar.write_state(state).expect("error writing bar");
        bar.persist_state().await.expect("error persisting bar");

        foo.refresh_state().await.expect("error refreshing foo");
        if let Some(state) = foo.state() {
            assert_ne!(state.lineage, "bar", "foo sees the state written to bar");
        }
    }

    // Asking for the same name again reaches the same stored state
    {
        let again = open_refreshed(b, "bar").await;
        bar.refresh_state().await.expect("error refreshing bar");
        assert_eq!(
            again.state(),
            bar.state(),
            "two managers for bar disagree"
        );
        assert_eq!(again.state().map(|s| s.lineage.as_str()), Some("bar"));
    }

    // Verify we can now list them
    {
        let Some(states) = list_states(b).await else {
            return;
        };
        assert_eq!(states, vec!["bar", DEFAULT_STATE_NAME, "foo"]);
    }

    // Delete some states
    b.delete_state("foo")
        .await
        .unwrap_or_else(|e| panic!("error deleting foo: {}", e));

    // Verify the default state can't be deleted
    if b.delete_state(DEFAULT_STATE_NAME).await.is_ok() {
        panic!("deleting the default state should fail");
    }

    // Verify deletion
    {
        let Some(states) = list_states(b).await else {
            return;
        };
        assert_eq!(states, vec!["bar", DEFAULT_STATE_NAME]);
    }
}

async fn test_backend_state_lock(b1: &dyn Backend, b2: &dyn Backend) {
    // Get the default state for each
    let manager_a = open_refreshed(b1, DEFAULT_STATE_NAME).await;

    // Fast exit if this doesn't support locking at all
    let Some(locker_a) = manager_a.as_locker() else {
        log::info!("backend doesn't support state locking, not testing");
        return;
    };

    log::info!("testing state locking");

    let manager_b = open_refreshed(b2, DEFAULT_STATE_NAME).await;
    let locker_b = manager_b
        .as_locker()
        .expect("second backend does not support locking while the first one does");

    let info_a = LockInfo::new("test").with_who("clientA");
    let info_b = LockInfo::new("test").with_who("clientB");

    let lock_id_a = locker_a
        .lock(&info_a)
        .await
        .unwrap_or_else(|e| panic!("unable to get initial lock: {}", e));

    // If the lock ID is blank, assume locking is disabled
    if lock_id_a.is_empty() {
        log::info!("empty string returned for lock, assuming disabled");
        return;
    }

    match locker_b.lock(&info_b).await {
        Ok(_) => {
            let _ = locker_a.unlock(&lock_id_a).await;
            panic!("client B obtained lock while held by client A");
        }
        Err(BackendError::Locked { .. }) => {}
        Err(e) => {
            let _ = locker_a.unlock(&lock_id_a).await;
            panic!("client B failed to lock with an unexpected error: {}", e);
        }
    }

    locker_a
        .unlock(&lock_id_a)
        .await
        .unwrap_or_else(|e| panic!("error unlocking client A: {}", e));

    let lock_id_b = locker_b
        .lock(&info_b)
        .await
        .unwrap_or_else(|e| panic!("unable to obtain lock from client B: {}", e));

    assert_ne!(lock_id_b, lock_id_a, "duplicate lock IDs");

    locker_b
        .unlock(&lock_id_b)
        .await
        .unwrap_or_else(|e| panic!("error unlocking client B: {}", e));
}
