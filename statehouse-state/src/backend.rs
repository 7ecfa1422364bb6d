//! Backend contract: named states, state managers, lockers and their errors

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::lock::LockInfo;
use crate::state::StateFile;

/// Name of the state that every backend always has
pub const DEFAULT_STATE_NAME: &str = "default";

/// Errors that can occur when interacting with a state backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend stores a single state and cannot list or create others
    #[error("Named states are not supported by this backend")]
    NamedStatesNotSupported,

    /// The named state does not exist
    #[error("State not found: {0}")]
    StateNotFound(String),

    /// The default state is permanent
    #[error("Cannot delete the default state")]
    DefaultStateDeletion,

    /// The state name cannot be used as a storage key
    #[error("Invalid state name {name:?}: {reason}")]
    InvalidStateName { name: String, reason: String },

    /// The state is locked by another process
    #[error("State is locked by {who} (lock ID: {lock_id}, operation: {operation})")]
    Locked {
        lock_id: String,
        who: String,
        operation: String,
    },

    /// The lock was not found (for release/force-unlock operations)
    #[error("Lock not found: {0}")]
    LockNotFound(String),

    /// Lock ID mismatch when trying to release
    #[error("Lock ID mismatch: expected {expected}, got {actual}")]
    LockMismatch { expected: String, actual: String },

    /// The backend type is not supported
    #[error("Unsupported backend type: {0}")]
    UnsupportedBackend(String),

    /// Configuration error
    #[error("Backend configuration error: {0}")]
    Configuration(String),

    /// The bucket/container does not exist
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    /// Failed to create bucket
    #[error("Failed to create bucket: {0}")]
    BucketCreationFailed(String),

    /// State file is corrupted or invalid
    #[error("Invalid state file: {0}")]
    InvalidState(String),

    /// Network or I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// AWS SDK error
    #[error("AWS error: {0}")]
    Aws(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BackendError {
    /// Create a Locked error from a LockInfo
    pub fn locked(lock: &LockInfo) -> Self {
        Self::Locked {
            lock_id: lock.id.clone(),
            who: lock.who.clone(),
            operation: lock.operation.clone(),
        }
    }

    /// Create an unsupported backend error
    pub fn unsupported_backend(backend_type: impl Into<String>) -> Self {
        Self::UnsupportedBackend(backend_type.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create an invalid state name error
    pub fn invalid_state_name(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidStateName {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// A collection of independent named states over one durable medium
///
/// Every backend has a [`DEFAULT_STATE_NAME`] state that exists from first
/// use and can never be deleted. Backends that store a single state return
/// [`BackendError::NamedStatesNotSupported`] from [`Backend::states`].
#[async_trait]
pub trait Backend: Send + Sync {
    /// List all named states, including the default one
    async fn states(&self) -> BackendResult<Vec<String>>;

    /// Get a manager for the named state, creating the state if needed
    ///
    /// A newly created name shows up in [`Backend::states`] right away.
    async fn state(&self, name: &str) -> BackendResult<Box<dyn StateManager>>;

    /// Delete the named state and its stored content
    async fn delete_state(&self, name: &str) -> BackendResult<()>;

    /// Prepare the underlying storage (create bucket if needed, etc.)
    async fn init(&self) -> BackendResult<()> {
        Ok(())
    }
}

/// Handle to one named state
///
/// Holds an in-memory snapshot that only touches storage on
/// [`StateManager::refresh_state`] and [`StateManager::persist_state`].
#[async_trait]
pub trait StateManager: Send + Sync {
    /// Name of the state this manager is bound to
    fn name(&self) -> &str;

    /// Replace the snapshot with the stored content
    async fn refresh_state(&mut self) -> BackendResult<()>;

    /// Current snapshot, `None` if nothing was read or written yet
    fn state(&self) -> Option<&StateFile>;

    /// Replace the snapshot without touching storage
    fn write_state(&mut self, state: StateFile) -> BackendResult<()>;

    /// Write the snapshot to storage
    async fn persist_state(&mut self) -> BackendResult<()>;

    /// Locking capability, if this manager supports it
    fn as_locker(&self) -> Option<&dyn Locker> {
        None
    }
}

/// Exclusive advisory lock on one stored state
///
/// Acquisition never waits: a held lock makes [`Locker::lock`] fail with
/// [`BackendError::Locked`]. An empty lock ID from a successful `lock` means
/// the medium accepts the call but does not enforce exclusion.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Acquire the lock and return its ID
    async fn lock(&self, info: &LockInfo) -> BackendResult<String>;

    /// Release the lock held under `lock_id`
    async fn unlock(&self, lock_id: &str) -> BackendResult<()>;

    /// Release a lock left behind by another process
    ///
    /// This is an administrative operation that should be used with caution
    async fn force_unlock(&self, lock_id: &str) -> BackendResult<()> {
        log::warn!("Force unlocking lock {}", lock_id);
        self.unlock(lock_id).await
    }
}

/// Reject names that cannot be mapped safely onto a storage key or path
pub fn validate_state_name(name: &str) -> BackendResult<()> {
    if name.is_empty() {
        return Err(BackendError::invalid_state_name(name, "name is empty"));
    }
    if name == "." || name == ".." {
        return Err(BackendError::invalid_state_name(name, "reserved path name"));
    }
    if name.contains(['/', '\\']) {
        return Err(BackendError::invalid_state_name(
            name,
            "name contains a path separator",
        ));
    }
    Ok(())
}

/// Configuration for a state backend
///
/// Deserializes from a flat JSON object, e.g.
/// `{"type": "local", "path": "infra.state.json"}`.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Backend type (e.g., "s3", "local", "memory")
    #[serde(rename = "type")]
    pub backend_type: String,
    /// Backend-specific attributes
    #[serde(flatten)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl BackendConfig {
    /// Create a configuration with no attributes
    pub fn new(backend_type: impl Into<String>) -> Self {
        Self {
            backend_type: backend_type.into(),
            attributes: HashMap::new(),
        }
    }

    /// Set an attribute value
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Parse a configuration from JSON text
    pub fn from_json(content: &str) -> BackendResult<Self> {
        serde_json::from_str(content)
            .map_err(|e| BackendError::configuration(format!("Invalid backend config: {}", e)))
    }

    /// Get a string attribute value
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    /// Get a boolean attribute value
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.attributes.get(key).and_then(|v| v.as_bool())
    }

    /// Get a boolean attribute with a default value
    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockInfo;

    #[test]
    fn test_backend_error_locked() {
        let lock = LockInfo::new("apply");
        let error = BackendError::locked(&lock);

        match error {
            BackendError::Locked {
                lock_id,
                who,
                operation,
            } => {
                assert_eq!(lock_id, lock.id);
                assert_eq!(who, lock.who);
                assert_eq!(operation, "apply");
            }
            _ => panic!("Expected Locked error"),
        }
    }

    #[test]
    fn test_backend_error_display() {
        let error = BackendError::unsupported_backend("azure");
        assert_eq!(error.to_string(), "Unsupported backend type: azure");

        let error = BackendError::DefaultStateDeletion;
        assert_eq!(error.to_string(), "Cannot delete the default state");

        let error = BackendError::invalid_state_name("a/b", "name contains a path separator");
        assert_eq!(
            error.to_string(),
            "Invalid state name \"a/b\": name contains a path separator"
        );
    }

    #[test]
    fn test_validate_state_name() {
        assert!(validate_state_name("default").is_ok());
        assert!(validate_state_name("prod-eu_1.v2").is_ok());

        for name in ["", ".", "..", "a/b", "a\\b", "../escape"] {
            assert!(
                matches!(
                    validate_state_name(name),
                    Err(BackendError::InvalidStateName { .. })
                ),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_backend_config_from_json() {
        let config = BackendConfig::from_json(
            r#"{"type": "s3", "bucket": "my-state-bucket", "encrypt": false}"#,
        )
        .unwrap();

        assert_eq!(config.backend_type, "s3");
        assert_eq!(config.get_string("bucket"), Some("my-state-bucket"));
        assert_eq!(config.get_bool("encrypt"), Some(false));
        assert!(config.get_bool_or("auto_create", true));
        assert_eq!(config.get_string("encrypt"), None);
    }

    #[test]
    fn test_backend_config_requires_type() {
        let result = BackendConfig::from_json(r#"{"path": "x.json"}"#);
        assert!(matches!(result, Err(BackendError::Configuration(_))));
    }

    #[test]
    fn test_backend_config_builder() {
        let config = BackendConfig::new("memory").with_attribute("lock", serde_json::json!(false));
        assert_eq!(config.backend_type, "memory");
        assert!(!config.get_bool_or("lock", true));
    }
}
