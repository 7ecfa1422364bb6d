//! Lock information for state locking

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, BackendResult};

/// Default lock timeout in seconds (15 minutes)
pub const DEFAULT_LOCK_TIMEOUT_SECS: i64 = 900;

/// Information about a state lock
///
/// Callers describe who is locking and why; the backend assigns the lock ID
/// when the lock is actually acquired (see [`LockInfo::issue`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique identifier for this lock
    pub id: String,
    /// The operation being performed (e.g., "apply", "destroy", "plan")
    pub operation: String,
    /// Who acquired the lock (username@hostname by default)
    pub who: String,
    /// Free-form extra information about the lock holder
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub info: String,
    /// When the lock was created
    pub created: DateTime<Utc>,
    /// When the lock expires
    pub expires: DateTime<Utc>,
}

impl LockInfo {
    /// Create a new lock for an operation
    pub fn new(operation: impl Into<String>) -> Self {
        Self::with_timeout(operation, DEFAULT_LOCK_TIMEOUT_SECS)
    }

    /// Create a new lock with a custom timeout
    pub fn with_timeout(operation: impl Into<String>, timeout_secs: i64) -> Self {
        let now = Utc::now();

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation: operation.into(),
            who: get_lock_owner(),
            info: String::new(),
            created: now,
            expires: now + Duration::seconds(timeout_secs),
        }
    }

    /// Override the lock holder identity
    pub fn with_who(mut self, who: impl Into<String>) -> Self {
        self.who = who.into();
        self
    }

    /// Attach free-form information to the lock
    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }

    /// Check if the lock has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires
    }

    /// Get the remaining time until expiration
    pub fn time_remaining(&self) -> Duration {
        self.expires - Utc::now()
    }

    /// Stamp a copy of this request for acquisition
    ///
    /// Every acquisition gets a fresh ID and a fresh expiry window of the same
    /// length, so a caller reusing one `LockInfo` never sees a repeated ID.
    pub fn issue(&self) -> LockInfo {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created: now,
            expires: now + (self.expires - self.created),
            ..self.clone()
        }
    }
}

/// Decide whether a lock already present on the medium blocks a new acquisition
///
/// Succeeds only when the existing lock has expired and may be replaced.
pub(crate) fn check_existing(existing: &LockInfo) -> BackendResult<()> {
    if existing.is_expired() {
        log::warn!(
            "Taking over expired lock {} held by {} (operation: {})",
            existing.id,
            existing.who,
            existing.operation
        );
        Ok(())
    } else {
        Err(BackendError::locked(existing))
    }
}

/// Check that the lock presented for release is the one currently held
pub(crate) fn check_holder(existing: Option<&LockInfo>, lock_id: &str) -> BackendResult<()> {
    match existing {
        None => Err(BackendError::LockNotFound(lock_id.to_string())),
        Some(existing) if existing.id != lock_id => Err(BackendError::LockMismatch {
            expected: lock_id.to_string(),
            actual: existing.id.clone(),
        }),
        Some(_) => Ok(()),
    }
}

/// Get the lock owner string (username@hostname)
fn get_lock_owner() -> String {
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{}@{}", username, hostname)
}
