//! Statehouse State Management
//!
//! This crate stores infrastructure state for the statehouse tool. A backend
//! holds any number of named states (always including `"default"`) and lets
//! concurrent clients take an exclusive lock on a state before changing it.
//!
//! # Overview
//!
//! - **Backend**: lists, creates and deletes named states
//! - **StateManager**: handle to one state; refresh, write, persist
//! - **Locker**: optional fail-fast lock on one state
//! - **StateFile**: the versioned state document
//! - **testing**: conformance checks shared by every backend implementation
//!
//! # Example
//!
//! ```ignore
//! use statehouse_state::{create_backend, BackendConfig, LockInfo};
//!
//! let config = BackendConfig::from_json(r#"{"type": "local", "path": "infra.state.json"}"#)?;
//! let backend = create_backend(&config).await?;
//!
//! let mut manager = backend.state("staging").await?;
//! manager.refresh_state().await?;
//!
//! // Acquire lock before modifying state
//! let locker = manager.as_locker().expect("local backend supports locking");
//! let lock_id = locker.lock(&LockInfo::new("apply")).await?;
//!
//! let mut state = manager.state().cloned().unwrap_or_default();
//! // ... modify resources ...
//! manager.write_state(state)?;
//! manager.persist_state().await?;
//!
//! manager.as_locker().unwrap().unlock(&lock_id).await?;
//! ```

pub mod backend;
pub mod backends;
pub mod client;
pub mod lock;
pub mod state;
pub mod testing;

// Re-export main types for convenience
pub use backend::{
    Backend, BackendConfig, BackendError, BackendResult, DEFAULT_STATE_NAME, Locker, StateManager,
    validate_state_name,
};
pub use backends::create_backend;
pub use client::{ClientStateManager, StateClient};
pub use lock::LockInfo;
pub use state::{ResourceState, StateFile};
