//! Progress rendering for upload runs
//!
//! Implements the core `Reporter` with an indicatif bar. Per-file lines
//! are printed above the bar so they survive once it is cleared.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dvu_core::{
    Error, Reporter, Resource, RunReport, SkipReason, UploadOutcome, UploadStats, UploaderConfig,
};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::output::Formatter;

const BAR_TEMPLATE: &str = "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {wide_msg}";

/// Create the progress container, hidden in quiet and JSON modes
pub fn multi_progress(formatter: &Formatter) -> MultiProgress {
    if formatter.is_interactive() {
        MultiProgress::new()
    } else {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    }
}

/// Reporter drawing a progress bar and per-file result lines
pub struct ProgressReporter {
    bar: ProgressBar,
    formatter: Formatter,
    verbose: bool,
    retrying: AtomicBool,
}

impl ProgressReporter {
    pub fn new(progress: &MultiProgress, formatter: Formatter, verbose: bool) -> Self {
        let bar = progress.add(ProgressBar::new(0));
        bar.set_style(
            ProgressStyle::default_bar()
                .template(BAR_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar.enable_steady_tick(Duration::from_millis(120));

        Self {
            bar,
            formatter,
            verbose,
            retrying: AtomicBool::new(false),
        }
    }

    fn line(&self, text: String) {
        if self.formatter.is_interactive() {
            self.bar.println(text);
        }
    }

    fn outcome_line(&self, file: &Resource, outcome: &UploadOutcome) -> Option<String> {
        let f = &self.formatter;
        let path = f.style_path(file.path());
        match outcome {
            UploadOutcome::Failed { error } => Some(f.error_line(&format!("{path}: {error}"))),
            UploadOutcome::Skipped {
                reason: SkipReason::ChecksumMismatch,
                ..
            } => Some(f.warning_line(&format!(
                "{path}: exists with a different checksum, not replaced"
            ))),
            _ if !self.verbose => None,
            UploadOutcome::Uploaded { bytes, .. } => Some(f.success_line(&format!(
                "{path} {}",
                f.style_size(&humansize::format_size(*bytes, humansize::BINARY))
            ))),
            UploadOutcome::Planned { bytes } => Some(format!(
                "  {path} {} {}",
                f.style_size(&humansize::format_size(*bytes, humansize::BINARY)),
                f.style_detail("(would upload)")
            )),
            UploadOutcome::Skipped { reason, .. } => Some(format!(
                "  {path} {}",
                f.style_detail(&format!("({reason})"))
            )),
        }
    }
}

impl Reporter for ProgressReporter {
    fn run_started(&self, planned_files: u64, config: &UploaderConfig) {
        self.bar.set_length(planned_files);
        self.bar.set_message(if config.list_only {
            "Checking..."
        } else {
            "Uploading..."
        });
    }

    fn directory(&self, directory: &Resource) {
        self.bar.set_message(directory.path().to_string());
    }

    fn file_started(&self, file: &Resource) {
        self.bar.set_message(file.path().to_string());
    }

    fn outcome(&self, file: &Resource, outcome: &UploadOutcome) {
        if !self.retrying.load(Ordering::Relaxed) {
            self.bar.inc(1);
        }
        if let Some(line) = self.outcome_line(file, outcome) {
            self.line(line);
        }
    }

    fn warning(&self, message: &str) {
        self.line(self.formatter.warning_line(message));
    }

    fn retry_round(&self, attempt: u32, max_attempts: u32, pending: usize, delay: Duration) {
        self.retrying.store(true, Ordering::Relaxed);
        self.line(self.formatter.warning_line(&format!(
            "Retrying {pending} failed upload(s) in {:.1}s (attempt {attempt}/{max_attempts})",
            delay.as_secs_f64()
        )));
        self.bar.set_message("Waiting to retry...");
    }

    fn retry_file(&self, file: &Resource) {
        self.bar.set_message(format!("retry {}", file.path()));
    }

    fn finished(&self, _report: &RunReport) {
        self.bar.finish_and_clear();
    }

    fn aborted(&self, _stats: &UploadStats, _error: &Error) {
        self.bar.abandon();
    }
}
