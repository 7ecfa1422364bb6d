//! Backend implementations for state storage

mod local;
mod memory;
mod s3;

pub use local::{LocalBackend, LocalClient};
pub use memory::{MemoryBackend, MemoryClient, MemoryStore};
pub use s3::{DEFAULT_WORKSPACE_KEY_PREFIX, S3Backend, S3Client};

use crate::backend::{Backend, BackendConfig, BackendError, BackendResult};

/// Create a backend from configuration
///
/// This function dispatches to the appropriate backend implementation
/// based on the backend_type in the configuration.
pub async fn create_backend(config: &BackendConfig) -> BackendResult<Box<dyn Backend>> {
    log::debug!("Creating {} backend", config.backend_type);
    match config.backend_type.as_str() {
        "local" => Ok(Box::new(LocalBackend::from_config(config)?)),
        "memory" => Ok(Box::new(MemoryBackend::from_config(config)?)),
        "s3" => {
            let backend = S3Backend::from_config(config).await?;
            Ok(Box::new(backend))
        }
        other => Err(BackendError::unsupported_backend(other)),
    }
}
