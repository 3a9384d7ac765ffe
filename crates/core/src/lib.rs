//! dvu-core: Core library for the dvu repository uploader
//!
//! This crate provides the backend-independent part of an upload run:
//! - Local resource abstraction with streaming reads and cached hashes
//! - Remote catalog indices used for duplicate detection
//! - The `RepositoryAdapter` trait implemented by repository backends
//! - The upload orchestrator with its retry pass
//! - Configuration, statistics and the reporter interface
//!
//! Nothing here speaks HTTP, so the orchestrator can be tested against
//! in-memory adapters.

pub mod catalog;
pub mod checksum;
pub mod config;
pub mod error;
pub mod report;
pub mod resource;
pub mod retry;
pub mod traits;
pub mod uploader;

pub use catalog::{RemoteCatalog, RemoteFileRecord};
pub use checksum::ChecksumAlgorithm;
pub use config::{RetryConfig, UploaderConfig};
pub use error::{Error, Result};
pub use report::{
    FailedItem, Reporter, RunReport, SkipReason, TracingReporter, UploadOutcome, UploadStats,
};
pub use resource::{Resource, ResourceReader};
pub use retry::{is_retryable_error, retry_with_backoff};
pub use traits::RepositoryAdapter;
pub use uploader::{RetryQueue, Uploader};
