//! upload command - Upload local files and directories into a dataset
//!
//! Merges the configuration sources, runs the orchestrator against the
//! Dataverse adapter and prints a summary.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{Cell, CellAlignment, Table};
use dvu_core::{
    ChecksumAlgorithm, FailedItem, RunReport, UploadStats, Uploader, UploaderConfig,
};
use dvu_dataverse::DataverseAdapter;
use jiff::Timestamp;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::exit_code::ExitCode;
use crate::logging;
use crate::output::{Formatter, OutputConfig};
use crate::progress::{self, ProgressReporter};

/// Upload files and directories into a Dataverse dataset
#[derive(Args, Debug)]
pub struct UploadArgs {
    /// Files or directories to upload (glob patterns are expanded)
    #[arg(required = true, value_name = "PATH")]
    pub paths: Vec<String>,

    /// Dataverse server URL
    #[arg(short, long, env = "DV_SERVER_URL")]
    pub server: Option<String>,

    /// API token
    #[arg(short, long, env = "DV_API_KEY", hide_env_values = true)]
    pub key: Option<String>,

    /// Dataset persistent identifier (e.g. doi:10.5072/FK2/ABCDEF)
    #[arg(short, long, env = "DV_DATASET_PID")]
    pub dataset: Option<String>,

    /// Only report what would be uploaded
    #[arg(short, long)]
    pub list_only: bool,

    /// Compare checksums of files that already exist
    #[arg(long)]
    pub verify: bool,

    /// Descend into directories
    #[arg(short, long)]
    pub recurse: bool,

    /// Upload a new copy when an existing file's checksum differs
    #[arg(long)]
    pub force_new: bool,

    /// Skip the first N files and directories
    #[arg(long, value_name = "N")]
    pub skip: Option<u64>,

    /// Stop after uploading N files
    #[arg(long, value_name = "N")]
    pub limit: Option<u64>,

    /// Send files through the Dataverse server instead of direct upload
    #[arg(long)]
    pub traditional: bool,

    /// Checksum algorithm (MD5, SHA-1, SHA-256, SHA-512)
    #[arg(long, value_name = "ALG")]
    pub fixity: Option<ChecksumAlgorithm>,

    /// Retry rounds for failed uploads
    #[arg(long, value_name = "N")]
    pub max_retries: Option<u32>,

    /// Ask Dataverse not to ingest tabular files
    #[arg(long)]
    pub no_ingest: bool,

    /// Accept invalid TLS certificates
    #[arg(long)]
    pub insecure: bool,

    /// Configuration file (defaults to the user config directory)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Append logs to FILE
    #[arg(long, value_name = "FILE")]
    pub log: Option<PathBuf>,

    /// Show debug logs and every file result
    #[arg(short, long)]
    pub verbose: bool,
}

impl UploadArgs {
    /// Override configuration values with the flags that were given
    pub fn apply(&self, config: &mut UploaderConfig) {
        if let Some(server) = &self.server {
            config.server_url = server.clone();
        }
        if let Some(key) = &self.key {
            config.api_key = key.clone();
        }
        if let Some(dataset) = &self.dataset {
            config.dataset_pid = dataset.clone();
        }
        if let Some(skip) = self.skip {
            config.skip_files = skip;
        }
        if let Some(limit) = self.limit {
            config.max_files = Some(limit);
        }
        if let Some(fixity) = self.fixity {
            config.fixity_algorithm = fixity;
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }

        config.list_only |= self.list_only;
        config.verify_checksums |= self.verify;
        config.recurse_directories |= self.recurse;
        config.force_new |= self.force_new;
        config.no_ingest |= self.no_ingest;
        config.trust_all_certs |= self.insecure;
        if self.traditional {
            config.direct_upload = false;
        }
    }

    fn load_config(&self) -> dvu_core::Result<UploaderConfig> {
        let mut config = match &self.config {
            Some(path) => UploaderConfig::from_file(path)?,
            None => UploaderConfig::load_default()?,
        };
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }
}

/// Summary printed at the end of a run
#[derive(Debug, Serialize)]
pub struct UploadSummary {
    pub server: String,
    pub dataset: String,
    pub list_only: bool,
    pub interrupted: bool,
    pub stats: UploadStats,
    pub failures: Vec<FailedItem>,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub elapsed_ms: u64,
}

impl UploadSummary {
    pub fn new(config: &UploaderConfig, report: RunReport) -> Self {
        let elapsed_ms = report.elapsed().as_millis() as u64;
        Self {
            server: config.server_url.clone(),
            dataset: config.dataset_pid.clone(),
            list_only: report.list_only,
            interrupted: report.interrupted,
            stats: report.stats,
            failures: report.failures,
            started_at: report.started_at,
            finished_at: report.finished_at,
            elapsed_ms,
        }
    }
}

impl fmt::Display for UploadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = &self.stats;
        let size = |bytes: u64| humansize::format_size(bytes, humansize::BINARY);

        let mut table = Table::new();
        table.load_preset(UTF8_FULL_CONDENSED);
        table.set_header(vec!["", "Files", "Size"]);
        let uploaded = if self.list_only {
            "Would upload"
        } else {
            "Uploaded"
        };
        for (label, count, bytes) in [
            (uploaded, stats.uploaded_files, Some(stats.uploaded_bytes)),
            ("Skipped", stats.skipped_files, None),
            ("Failed", stats.failed_files, None),
            ("Total", stats.total_files, None),
        ] {
            table.add_row(vec![
                Cell::new(label),
                Cell::new(count).set_alignment(CellAlignment::Right),
                Cell::new(bytes.map(size).unwrap_or_default())
                    .set_alignment(CellAlignment::Right),
            ]);
        }

        writeln!(f, "{} -> {}", self.dataset, self.server)?;
        writeln!(f, "{table}")?;
        write!(f, "Finished in {:.1}s", self.elapsed_ms as f64 / 1000.0)?;
        if self.interrupted {
            write!(f, " (interrupted, counts are partial)")?;
        }

        if !self.failures.is_empty() {
            write!(f, "\n\nFailed files:")?;
            for failure in &self.failures {
                write!(f, "\n  {}: {}", failure.path, failure.error)?;
            }
        }
        Ok(())
    }
}

/// Execute the upload command
pub async fn execute(args: UploadArgs, output_config: OutputConfig) -> ExitCode {
    let formatter = Formatter::new(output_config);
    let progress = progress::multi_progress(&formatter);

    if let Err(e) = logging::init(
        args.verbose,
        args.log.as_deref(),
        formatter.colors_enabled(),
        &progress,
    ) {
        formatter.error(&format!("{e:#}"));
        return ExitCode::GeneralError;
    }

    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => {
            formatter.error(&e.to_string());
            return exit_code_from_error(&e);
        }
    };

    let roots = match expand_paths(&args.paths) {
        Ok(roots) => roots,
        Err(message) => {
            formatter.error(&message);
            return ExitCode::UsageError;
        }
    };
    if roots.is_empty() {
        formatter.error("No files match the given paths");
        return ExitCode::UsageError;
    }

    let adapter = match DataverseAdapter::new(&config) {
        Ok(adapter) => adapter,
        Err(e) => {
            formatter.error(&e.to_string());
            return exit_code_from_error(&e);
        }
    };

    let reporter = Arc::new(ProgressReporter::new(
        &progress,
        formatter.clone(),
        args.verbose,
    ));
    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::warn!("Interrupted, stopping the upload (press Ctrl-C again to exit now)");
        signal.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(ExitCode::Interrupted.as_i32());
        }
    });

    let result = Uploader::new(config.clone(), Box::new(adapter), reporter)
        .with_cancellation(cancel)
        .run(&roots)
        .await;

    match result {
        Ok(report) => {
            let summary = UploadSummary::new(&config, report);
            formatter.output(&summary);
            if summary.interrupted {
                ExitCode::Interrupted
            } else if summary.failures.is_empty() {
                ExitCode::Success
            } else {
                ExitCode::GeneralError
            }
        }
        Err(e) => {
            formatter.error(&e.to_string());
            exit_code_from_error(&e)
        }
    }
}

/// Expand glob patterns; other arguments are taken literally
pub fn expand_paths(patterns: &[String]) -> Result<Vec<PathBuf>, String> {
    let mut roots = Vec::new();
    for pattern in patterns {
        if !is_glob(pattern) {
            roots.push(PathBuf::from(pattern));
            continue;
        }

        let matches =
            glob::glob(pattern).map_err(|e| format!("Invalid pattern '{pattern}': {e}"))?;
        let before = roots.len();
        for entry in matches {
            match entry {
                Ok(path) => roots.push(path),
                Err(e) => tracing::warn!(error = %e, "Cannot read matched path"),
            }
        }
        if roots.len() == before {
            tracing::warn!(pattern = %pattern, "Pattern matched nothing");
        }
    }
    Ok(roots)
}

fn is_glob(pattern: &str) -> bool {
    // Existing paths with bracket characters are taken as is.
    pattern.contains(['*', '?', '[']) && !Path::new(pattern).exists()
}

fn exit_code_from_error(error: &dvu_core::Error) -> ExitCode {
    ExitCode::from_i32(error.exit_code()).unwrap_or(ExitCode::GeneralError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: UploadArgs,
    }

    fn parse(args: &[&str]) -> UploadArgs {
        let mut argv = vec!["dvu"];
        argv.extend_from_slice(args);
        TestCli::try_parse_from(argv).unwrap().args
    }

    #[test]
    fn test_flags_override_file() {
        let mut config = UploaderConfig::from_toml(
            r#"
server_url = "https://file.example.org"
dataset_pid = "doi:10.5072/FK2/FILE"
max_retries = 5
direct_upload = true
"#,
        )
        .unwrap();

        let args = parse(&[
            "data",
            "--server",
            "https://flag.example.org",
            "--limit",
            "10",
            "--fixity",
            "sha-256",
            "--traditional",
            "-r",
            "--verify",
        ]);
        args.apply(&mut config);

        assert_eq!(config.server_url, "https://flag.example.org");
        assert_eq!(config.dataset_pid, "doi:10.5072/FK2/FILE");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.max_files, Some(10));
        assert_eq!(config.fixity_algorithm, ChecksumAlgorithm::Sha256);
        assert!(!config.direct_upload);
        assert!(config.recurse_directories);
        assert!(config.verify_checksums);
        assert!(!config.force_new);
    }

    #[test]
    fn test_invalid_fixity_is_rejected() {
        let result = TestCli::try_parse_from(["dvu", "data", "--fixity", "crc32"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_expand_paths() {
        let dir = TempDir::new().unwrap();
        for name in ["a.csv", "b.csv", "c.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let root = dir.path().display().to_string();

        let roots = expand_paths(&[format!("{root}/*.csv"), format!("{root}/missing")]).unwrap();
        assert_eq!(
            roots,
            vec![
                dir.path().join("a.csv"),
                dir.path().join("b.csv"),
                PathBuf::from(format!("{root}/missing")),
            ]
        );

        assert!(expand_paths(&[format!("{root}/*.pdf")]).unwrap().is_empty());
        assert!(expand_paths(&["[".to_string()]).is_err());
    }

    #[test]
    fn test_summary_json() {
        let config = UploaderConfig {
            server_url: "https://demo.dataverse.org".into(),
            dataset_pid: "doi:10.5072/FK2/TEST".into(),
            ..Default::default()
        };
        let report = RunReport {
            stats: UploadStats {
                discovered: 6,
                total_files: 5,
                uploaded_files: 3,
                skipped_files: 1,
                failed_files: 1,
                uploaded_bytes: 2048,
            },
            failures: vec![FailedItem {
                path: "data/b.csv".into(),
                error: "upload failed after 3 retry attempts".into(),
            }],
            list_only: false,
            interrupted: false,
            started_at: Timestamp::from_second(1_700_000_000).unwrap(),
            finished_at: Timestamp::from_second(1_700_000_065).unwrap(),
        };

        let summary = UploadSummary::new(&config, report);
        insta::assert_json_snapshot!(summary, @r#"
        {
          "server": "https://demo.dataverse.org",
          "dataset": "doi:10.5072/FK2/TEST",
          "list_only": false,
          "interrupted": false,
          "stats": {
            "discovered": 6,
            "total_files": 5,
            "uploaded_files": 3,
            "skipped_files": 1,
            "failed_files": 1,
            "uploaded_bytes": 2048
          },
          "failures": [
            {
              "path": "data/b.csv",
              "error": "upload failed after 3 retry attempts"
            }
          ],
          "started_at": "2023-11-14T22:13:20Z",
          "finished_at": "2023-11-14T22:14:25Z",
          "elapsed_ms": 65000
        }
        "#);
    }

    #[test]
    fn test_summary_text() {
        let summary = UploadSummary {
            server: "https://demo.dataverse.org".into(),
            dataset: "doi:10.5072/FK2/TEST".into(),
            list_only: true,
            interrupted: true,
            stats: UploadStats {
                total_files: 2,
                uploaded_files: 2,
                uploaded_bytes: 1024,
                ..Default::default()
            },
            failures: Vec::new(),
            started_at: Timestamp::UNIX_EPOCH,
            finished_at: Timestamp::UNIX_EPOCH,
            elapsed_ms: 1500,
        };

        let text = summary.to_string();
        assert!(text.starts_with("doi:10.5072/FK2/TEST -> https://demo.dataverse.org"));
        assert!(text.contains("Would upload"));
        assert!(text.contains("1 KiB"));
        assert!(text.contains("Finished in 1.5s (interrupted, counts are partial)"));
        assert!(!text.contains("Failed files"));
    }
}
