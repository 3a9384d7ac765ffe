//! Log subscriber setup
//!
//! Console logs go to stderr and are interleaved with the progress bar by
//! suspending it while a record is written. `--log <file>` adds a second,
//! uncolored layer appending to that file.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use indicatif::MultiProgress;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Targets raised to `debug` by `--verbose`
const CRATE_TARGETS: &[&str] = &["dvu", "dvu_core", "dvu_dataverse"];

/// Install the global subscriber
pub fn init(
    verbose: bool,
    log_file: Option<&Path>,
    ansi: bool,
    progress: &MultiProgress,
) -> anyhow::Result<()> {
    let filter = build_filter(verbose)?;

    let console = fmt::layer()
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(ProgressAwareStderr {
            progress: progress.clone(),
        });

    let file = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .context("Failed to initialize logging")
}

fn build_filter(verbose: bool) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(default_directives(verbose)).context("Invalid log filter")
}

fn default_directives(verbose: bool) -> String {
    if !verbose {
        return "warn".to_string();
    }
    let mut directives = vec!["warn".to_string()];
    directives.extend(CRATE_TARGETS.iter().map(|target| format!("{target}=debug")));
    directives.join(",")
}

/// Writer factory that hides the progress bar while a record is printed
struct ProgressAwareStderr {
    progress: MultiProgress,
}

impl<'a> MakeWriter<'a> for ProgressAwareStderr {
    type Writer = SuspendedWrite;

    fn make_writer(&'a self) -> Self::Writer {
        SuspendedWrite {
            progress: self.progress.clone(),
            buf: Vec::new(),
        }
    }
}

/// Buffers one record and flushes it to stderr on drop
struct SuspendedWrite {
    progress: MultiProgress,
    buf: Vec<u8>,
}

impl Write for SuspendedWrite {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for SuspendedWrite {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let buf = std::mem::take(&mut self.buf);
        self.progress.suspend(|| {
            let _ = std::io::stderr().write_all(&buf);
        });
    }
}
