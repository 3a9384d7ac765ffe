//! Upload orchestrator
//!
//! Walks the local resource tree in pre-order, applies the skip and limit
//! policy, dispatches each resource to the repository adapter and collects
//! statistics. Files whose upload comes back without an identifier are
//! queued and retried in a second pass with exponential backoff.
//!
//! Everything runs serially: the existence check, decision and upload for
//! one resource complete before the next resource is looked at.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use jiff::Timestamp;
use tokio_util::sync::CancellationToken;

use crate::config::UploaderConfig;
use crate::error::{Error, Result};
use crate::report::{FailedItem, Reporter, RunReport, SkipReason, UploadOutcome, UploadStats};
use crate::resource::Resource;
use crate::traits::RepositoryAdapter;

/// Parent path of top-level resources
pub const ROOT_PARENT: &str = "/";

/// A file whose upload returned no identifier
#[derive(Debug, Clone)]
pub struct RetryEntry {
    pub resource: Resource,
    pub parent_path: String,
}

/// Files waiting for the retry pass, in failure order
#[derive(Debug, Default)]
pub struct RetryQueue {
    entries: VecDeque<RetryEntry>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, resource: Resource, parent_path: impl Into<String>) {
        self.entries.push_back(RetryEntry {
            resource,
            parent_path: parent_path.into(),
        });
    }

    pub fn pop(&mut self) -> Option<RetryEntry> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Extend<RetryEntry> for RetryQueue {
    fn extend<I: IntoIterator<Item = RetryEntry>>(&mut self, iter: I) {
        self.entries.extend(iter);
    }
}

impl IntoIterator for RetryQueue {
    type Item = RetryEntry;
    type IntoIter = std::collections::vec_deque::IntoIter<RetryEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Drives one upload run against one repository adapter
pub struct Uploader {
    config: UploaderConfig,
    adapter: Box<dyn RepositoryAdapter>,
    reporter: Arc<dyn Reporter>,
    cancel: CancellationToken,
    stats: UploadStats,
    failures: Vec<FailedItem>,
    interrupted: bool,
}

impl Uploader {
    pub fn new(
        config: UploaderConfig,
        adapter: Box<dyn RepositoryAdapter>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            config,
            adapter,
            reporter,
            cancel: CancellationToken::new(),
            stats: UploadStats::default(),
            failures: Vec::new(),
            interrupted: false,
        }
    }

    /// Use an externally controlled token to interrupt the run
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Upload the given roots.
    ///
    /// The uploader (and the adapter's connections with it) is consumed, so
    /// its lifetime ends with the run. Fatal errors are returned after the
    /// reporter has seen the statistics accumulated so far.
    pub async fn run(mut self, roots: &[PathBuf]) -> Result<RunReport> {
        let started_at = Timestamp::now();

        if let Err(e) = self.config.validate() {
            self.reporter.aborted(&self.stats, &e);
            return Err(e);
        }

        if let Err(e) = self.execute(roots).await {
            self.reporter.aborted(&self.stats, &e);
            return Err(e);
        }

        let report = RunReport {
            stats: self.stats.clone(),
            failures: std::mem::take(&mut self.failures),
            list_only: self.config.list_only,
            interrupted: self.interrupted,
            started_at,
            finished_at: Timestamp::now(),
        };
        self.reporter.finished(&report);
        Ok(report)
    }

    async fn execute(&mut self, roots: &[PathBuf]) -> Result<()> {
        let planned = count_files(roots, self.config.recurse_directories);
        self.reporter.run_started(planned, &self.config);

        match until_cancelled(&self.cancel, self.adapter.prepare()).await {
            Err(Error::Cancelled) => {
                self.interrupted = true;
                return Ok(());
            }
            prepared => prepared?,
        }

        let mut queue = RetryQueue::new();
        match self.process_roots(roots, &mut queue).await {
            Err(Error::Cancelled) => self.interrupted = true,
            processed => processed?,
        }
        // The token may fire while the last resource is in flight.
        self.check_cancelled();

        if !queue.is_empty() && !self.config.list_only && !self.interrupted {
            queue = self.retry_failed(queue).await?;
        }

        let rounds = self.config.max_retries;
        for entry in queue {
            let error = if rounds > 0 && !self.interrupted {
                format!("upload failed after {rounds} retry attempts")
            } else {
                "upload failed".to_string()
            };
            self.failures.push(FailedItem {
                path: entry.resource.path().to_string(),
                error,
            });
        }

        Ok(())
    }

    async fn process_roots(&mut self, roots: &[PathBuf], queue: &mut RetryQueue) -> Result<()> {
        for root in roots {
            if self.check_cancelled() {
                break;
            }
            match Resource::new(root) {
                Ok(resource) => self.process_resource(&resource, ROOT_PARENT, queue).await?,
                Err(e) => self
                    .reporter
                    .warning(&format!("Skipping {}: {e}", root.display())),
            }
        }
        Ok(())
    }

    fn process_resource<'a>(
        &'a mut self,
        resource: &'a Resource,
        parent_path: &'a str,
        queue: &'a mut RetryQueue,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.check_cancelled() {
                return Ok(());
            }

            self.stats.discovered += 1;
            let position = self.stats.discovered;

            if position <= self.config.skip_files {
                tracing::debug!(path = %resource.path(), position, "Skipping by request");
                if !resource.is_directory() {
                    self.record(
                        resource,
                        UploadOutcome::Skipped {
                            existing_id: None,
                            reason: SkipReason::Policy,
                        },
                    );
                }
                return Ok(());
            }

            if let Some(max) = self.config.max_files
                && self.stats.uploaded_files >= max
            {
                tracing::debug!(path = %resource.path(), max, "Upload limit reached");
                if !resource.is_directory() {
                    self.record(
                        resource,
                        UploadOutcome::Skipped {
                            existing_id: None,
                            reason: SkipReason::Limit,
                        },
                    );
                }
                return Ok(());
            }

            if resource.is_directory() {
                match self.process_directory(resource, parent_path, queue).await {
                    Err(e) if !e.is_fatal() => {
                        self.reporter
                            .warning(&format!("Failed to process directory {resource}: {e}"));
                        self.failures.push(FailedItem {
                            path: resource.path().to_string(),
                            error: e.to_string(),
                        });
                        Ok(())
                    }
                    other => other,
                }
            } else {
                let outcome = match self.process_file(resource, parent_path, queue).await {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        self.failures.push(FailedItem {
                            path: resource.path().to_string(),
                            error: e.to_string(),
                        });
                        UploadOutcome::Failed {
                            error: e.to_string(),
                        }
                    }
                };
                self.record(resource, outcome);
                Ok(())
            }
        })
    }

    async fn process_directory(
        &mut self,
        directory: &Resource,
        parent_path: &str,
        queue: &mut RetryQueue,
    ) -> Result<()> {
        self.reporter.directory(directory);

        let cancel = &self.cancel;
        let mut dir_id =
            until_cancelled(cancel, self.adapter.existing_id(directory, parent_path)).await?;
        if dir_id.is_none() && !self.config.list_only {
            dir_id = Some(
                until_cancelled(cancel, self.adapter.create_directory(directory, parent_path))
                    .await?,
            );
        }

        if !self.config.recurse_directories {
            return Ok(());
        }

        let child_parent = child_parent_path(parent_path, directory.name());
        for child in directory.children()? {
            if self.check_cancelled() {
                return Ok(());
            }
            match child {
                Ok(child) => {
                    self.process_resource(&child, &child_parent, queue).await?;
                }
                Err(e) => self
                    .reporter
                    .warning(&format!("Skipping entry in {directory}: {e}")),
            }
        }

        if let Some(id) = dir_id
            && !self.config.list_only
            && !self.interrupted
        {
            until_cancelled(
                &self.cancel,
                self.adapter.post_process_directory(directory, &id),
            )
            .await?;
        }

        Ok(())
    }

    async fn process_file(
        &mut self,
        file: &Resource,
        parent_path: &str,
        queue: &mut RetryQueue,
    ) -> Result<UploadOutcome> {
        self.reporter.file_started(file);
        let bytes = file.length()?;

        let cancel = &self.cancel;
        if let Some(existing_id) =
            until_cancelled(cancel, self.adapter.existing_id(file, parent_path)).await?
        {
            if !self.config.verify_checksums {
                return Ok(UploadOutcome::Skipped {
                    existing_id: Some(existing_id),
                    reason: SkipReason::Exists,
                });
            }
            if until_cancelled(cancel, self.adapter.verify_checksum(file, &existing_id)).await? {
                return Ok(UploadOutcome::Skipped {
                    existing_id: Some(existing_id),
                    reason: SkipReason::ChecksumMatch,
                });
            }
            if !self.config.force_new {
                return Ok(UploadOutcome::Skipped {
                    existing_id: Some(existing_id),
                    reason: SkipReason::ChecksumMismatch,
                });
            }
            tracing::info!(path = %file.path(), "Checksum differs, uploading a new copy");
        }

        if self.config.list_only {
            return Ok(UploadOutcome::Planned { bytes });
        }

        match until_cancelled(cancel, self.adapter.upload(file, parent_path)).await? {
            Some(id) => Ok(UploadOutcome::Uploaded { id, bytes }),
            None => {
                queue.push(file.clone(), parent_path);
                Ok(UploadOutcome::Failed {
                    error: "repository returned no file identifier".to_string(),
                })
            }
        }
    }

    /// Retry queued files, returning those still failing
    async fn retry_failed(&mut self, mut queue: RetryQueue) -> Result<RetryQueue> {
        let max_attempts = self.config.max_retries;
        let between_files = Duration::from_millis(self.config.retry_pause_ms);
        let mut delay = Duration::from_millis(self.config.retry_delay_ms);

        for attempt in 1..=max_attempts {
            if queue.is_empty() {
                break;
            }

            self.reporter
                .retry_round(attempt, max_attempts, queue.len(), delay);
            if !self.pause(delay).await {
                break;
            }

            // Uploads that timed out client-side may have completed since.
            match until_cancelled(&self.cancel, self.adapter.reload_catalog()).await {
                Ok(()) => {}
                Err(Error::Cancelled) => {
                    self.interrupted = true;
                    break;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => self
                    .reporter
                    .warning(&format!("Could not reload existing files: {e}")),
            }

            let mut still_failed = RetryQueue::new();
            while let Some(entry) = queue.pop() {
                if self.check_cancelled() {
                    still_failed.push(entry.resource, entry.parent_path);
                    break;
                }

                self.reporter.retry_file(&entry.resource);
                match self.retry_entry(&entry).await {
                    Ok(Some(outcome)) => self.resolve_failure(&entry.resource, outcome),
                    Ok(None) => still_failed.push(entry.resource, entry.parent_path),
                    Err(Error::Cancelled) => {
                        self.interrupted = true;
                        still_failed.push(entry.resource, entry.parent_path);
                        break;
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        self.reporter
                            .warning(&format!("Retry of {} failed: {e}", entry.resource));
                        still_failed.push(entry.resource, entry.parent_path);
                    }
                }

                if !queue.is_empty() && !self.pause(between_files).await {
                    break;
                }
            }
            still_failed.extend(queue);
            queue = still_failed;

            if self.interrupted {
                break;
            }
            delay *= 2;
        }

        Ok(queue)
    }

    async fn retry_entry(&self, entry: &RetryEntry) -> Result<Option<UploadOutcome>> {
        let file = &entry.resource;

        let cancel = &self.cancel;
        if let Some(existing_id) =
            until_cancelled(cancel, self.adapter.existing_id(file, &entry.parent_path)).await?
        {
            return Ok(Some(UploadOutcome::Skipped {
                existing_id: Some(existing_id),
                reason: SkipReason::CompletedRemotely,
            }));
        }

        let bytes = file.length()?;
        Ok(
            until_cancelled(cancel, self.adapter.upload(file, &entry.parent_path))
                .await?
                .map(|id| UploadOutcome::Uploaded { id, bytes }),
        )
    }

    /// Count a file outcome from the first pass
    fn record(&mut self, file: &Resource, outcome: UploadOutcome) {
        self.stats.total_files += 1;
        match &outcome {
            UploadOutcome::Skipped { .. } => self.stats.skipped_files += 1,
            UploadOutcome::Uploaded { bytes, .. } | UploadOutcome::Planned { bytes } => {
                self.stats.uploaded_files += 1;
                self.stats.uploaded_bytes += bytes;
            }
            UploadOutcome::Failed { .. } => self.stats.failed_files += 1,
        }
        self.reporter.outcome(file, &outcome);
    }

    /// Convert a failed file into a skip or an upload
    fn resolve_failure(&mut self, file: &Resource, outcome: UploadOutcome) {
        self.stats.failed_files = self.stats.failed_files.saturating_sub(1);
        match &outcome {
            UploadOutcome::Uploaded { bytes, .. } => {
                self.stats.uploaded_files += 1;
                self.stats.uploaded_bytes += bytes;
            }
            _ => self.stats.skipped_files += 1,
        }
        self.reporter.outcome(file, &outcome);
    }

    /// Sleep unless cancelled first; returns false on cancellation
    async fn pause(&mut self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.check_cancelled();
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.interrupted = true;
                false
            }
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn check_cancelled(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            self.interrupted = true;
        }
        self.interrupted
    }
}

/// Race an adapter call against the cancellation token
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = operation => result,
    }
}

/// Parent path handed to the children of `name`
fn child_parent_path(parent_path: &str, name: &str) -> String {
    format!("{}/{}", parent_path.trim_end_matches('/'), name)
}

/// Number of files a run over `roots` will visit
pub fn count_files(roots: &[PathBuf], recurse: bool) -> u64 {
    fn count(resource: &Resource, recurse: bool) -> u64 {
        if !resource.is_directory() {
            return 1;
        }
        if !recurse {
            return 0;
        }
        resource
            .children()
            .map(|children| {
                children
                    .filter_map(|child| child.ok())
                    .map(|child| count(&child, recurse))
                    .sum()
            })
            .unwrap_or(0)
    }

    roots
        .iter()
        .filter_map(|root| Resource::new(root).ok())
        .map(|resource| count(&resource, recurse))
        .sum()
}
