//! Run statistics, per-resource outcomes and the reporter interface
//!
//! The orchestrator never writes to the console itself. Every event is
//! handed to a [`Reporter`] injected for the duration of one run.

use std::time::Duration;

use jiff::Timestamp;
use serde::Serialize;

use crate::config::UploaderConfig;
use crate::error::Error;
use crate::resource::Resource;

/// Counters accumulated over one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadStats {
    /// Traversal counter over files and directories, in discovery order
    pub discovered: u64,
    /// Files that reached an outcome
    pub total_files: u64,
    pub uploaded_files: u64,
    pub skipped_files: u64,
    pub failed_files: u64,
    pub uploaded_bytes: u64,
}

impl UploadStats {
    /// Every counted file has exactly one outcome
    pub fn is_balanced(&self) -> bool {
        self.total_files == self.uploaded_files + self.skipped_files + self.failed_files
    }
}

/// Why a file was not uploaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Within the configured skip count
    Policy,
    /// Upload limit already reached
    Limit,
    /// Found remotely, checksums not verified
    Exists,
    /// Found remotely with the same checksum
    ChecksumMatch,
    /// Found remotely with a different checksum and `force_new` unset
    ChecksumMismatch,
    /// Found remotely during a retry round
    CompletedRemotely,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SkipReason::Policy => "skipped by request",
            SkipReason::Limit => "upload limit reached",
            SkipReason::Exists => "already exists",
            SkipReason::ChecksumMatch => "exists with matching checksum",
            SkipReason::ChecksumMismatch => "exists but checksum differs",
            SkipReason::CompletedRemotely => "now exists remotely",
        };
        f.write_str(text)
    }
}

/// Result of processing one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Skipped {
        existing_id: Option<String>,
        reason: SkipReason,
    },
    Uploaded {
        id: String,
        bytes: u64,
    },
    /// List-only mode: the file would have been uploaded
    Planned { bytes: u64 },
    Failed { error: String },
}

/// A file that is still failed at the end of the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    pub path: String,
    pub error: String,
}

/// Final summary of one run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub stats: UploadStats,
    pub failures: Vec<FailedItem>,
    pub list_only: bool,
    pub interrupted: bool,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.interrupted
    }

    pub fn elapsed(&self) -> Duration {
        self.finished_at
            .duration_since(self.started_at)
            .unsigned_abs()
    }
}

/// Receiver for orchestrator events
///
/// All methods default to doing nothing so implementations only override
/// what they render.
pub trait Reporter: Send + Sync {
    fn run_started(&self, _planned_files: u64, _config: &UploaderConfig) {}

    fn directory(&self, _directory: &Resource) {}

    fn file_started(&self, _file: &Resource) {}

    fn outcome(&self, _file: &Resource, _outcome: &UploadOutcome) {}

    fn warning(&self, _message: &str) {}

    fn retry_round(&self, _attempt: u32, _max_attempts: u32, _pending: usize, _delay: Duration) {}

    fn retry_file(&self, _file: &Resource) {}

    fn finished(&self, _report: &RunReport) {}

    fn aborted(&self, _stats: &UploadStats, _error: &Error) {}
}

/// Reporter that turns every event into a tracing record
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn run_started(&self, planned_files: u64, config: &UploaderConfig) {
        tracing::info!(
            server = %config.server_url,
            dataset = %config.dataset_pid,
            list_only = config.list_only,
            planned_files,
            "Starting upload"
        );
    }

    fn directory(&self, directory: &Resource) {
        tracing::info!(path = %directory.path(), "Processing directory");
    }

    fn file_started(&self, file: &Resource) {
        let size = file
            .length()
            .map(|len| humansize::format_size(len, humansize::BINARY))
            .unwrap_or_default();
        tracing::debug!(path = %file.path(), %size, "Processing file");
    }

    fn outcome(&self, file: &Resource, outcome: &UploadOutcome) {
        match outcome {
            UploadOutcome::Skipped {
                reason: SkipReason::ChecksumMismatch,
                ..
            } => tracing::warn!(path = %file.path(), "File exists but checksum differs"),
            UploadOutcome::Skipped { reason, .. } => {
                tracing::info!(path = %file.path(), %reason, "Skipped")
            }
            UploadOutcome::Uploaded { id, bytes } => {
                tracing::info!(path = %file.path(), id = %id, bytes, "Uploaded")
            }
            UploadOutcome::Planned { bytes } => {
                tracing::info!(path = %file.path(), bytes, "Would upload")
            }
            UploadOutcome::Failed { error } => {
                tracing::error!(path = %file.path(), %error, "Upload failed")
            }
        }
    }

    fn warning(&self, message: &str) {
        tracing::warn!("{message}");
    }

    fn retry_round(&self, attempt: u32, max_attempts: u32, pending: usize, delay: Duration) {
        tracing::warn!(
            attempt,
            max_attempts,
            pending,
            delay_ms = delay.as_millis() as u64,
            "Retrying failed uploads"
        );
    }

    fn retry_file(&self, file: &Resource) {
        tracing::info!(path = %file.path(), "Retrying");
    }

    fn finished(&self, report: &RunReport) {
        let stats = &report.stats;
        tracing::info!(
            total = stats.total_files,
            uploaded = stats.uploaded_files,
            skipped = stats.skipped_files,
            failed = stats.failed_files,
            bytes = %humansize::format_size(stats.uploaded_bytes, humansize::BINARY),
            interrupted = report.interrupted,
            "Upload finished"
        );
        for failure in &report.failures {
            tracing::error!(path = %failure.path, error = %failure.error, "Still failed");
        }
    }

    fn aborted(&self, stats: &UploadStats, error: &Error) {
        tracing::error!(
            error = %error,
            uploaded = stats.uploaded_files,
            skipped = stats.skipped_files,
            failed = stats.failed_files,
            "Upload aborted"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_balance() {
        let mut stats = UploadStats {
            total_files: 3,
            uploaded_files: 1,
            skipped_files: 1,
            failed_files: 1,
            ..Default::default()
        };
        assert!(stats.is_balanced());

        stats.failed_files = 0;
        assert!(!stats.is_balanced());
    }

    #[test]
    fn test_report_success_and_elapsed() {
        let started_at = Timestamp::from_second(1_700_000_000).unwrap();
        let finished_at = Timestamp::from_second(1_700_000_065).unwrap();
        let mut report = RunReport {
            stats: UploadStats::default(),
            failures: Vec::new(),
            list_only: false,
            interrupted: false,
            started_at,
            finished_at,
        };
        assert!(report.is_success());
        assert_eq!(report.elapsed(), Duration::from_secs(65));

        report.failures.push(FailedItem {
            path: "a.txt".into(),
            error: "boom".into(),
        });
        assert!(!report.is_success());
    }

    #[test]
    fn test_skip_reason_serialization() {
        let json = serde_json::to_string(&SkipReason::ChecksumMismatch).unwrap();
        assert_eq!(json, "\"checksum_mismatch\"");
    }
}
