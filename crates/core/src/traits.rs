//! Repository capability trait
//!
//! The orchestrator drives one [`RepositoryAdapter`] selected at
//! construction time. Adapters translate the generic upload contract into a
//! specific repository's wire protocol.

use async_trait::async_trait;

use crate::error::Result;
use crate::resource::Resource;

/// Backend-specific behavior the orchestrator relies on
///
/// Per-resource methods return `Err` for conditions that concern only that
/// resource, or for fatal conditions (see [`crate::Error::is_fatal`]). A soft
/// upload failure that should be retried later is expressed as `Ok(None)`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RepositoryAdapter: Send + Sync {
    /// Validate the target collection and load the remote catalog
    async fn prepare(&mut self) -> Result<()>;

    /// Replace the remote catalog with a fresh listing
    async fn reload_catalog(&mut self) -> Result<()>;

    /// Identifier of an existing remote entity matching this resource
    async fn existing_id(&self, resource: &Resource, parent_path: &str) -> Result<Option<String>>;

    /// Create (or virtualize) a remote directory and return its identifier
    async fn create_directory(&self, directory: &Resource, parent_path: &str) -> Result<String>;

    /// Upload a file; `Ok(None)` marks a soft failure queued for retry
    async fn upload(&self, file: &Resource, parent_path: &str) -> Result<Option<String>>;

    /// Compare the local content hash with the remote record
    async fn verify_checksum(&self, file: &Resource, remote_id: &str) -> Result<bool>;

    /// Hook run after all children of a directory were processed
    async fn post_process_directory(&self, _directory: &Resource, _dir_id: &str) -> Result<()> {
        Ok(())
    }
}
