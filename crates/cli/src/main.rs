//! dvu - Bulk uploader for Dataverse datasets
//!
//! Walks local files and directories and adds them to a dataset, skipping
//! files that are already present and retrying the ones that fail.

mod commands;
mod exit_code;
mod logging;
mod output;
mod progress;

use clap::Parser;

use crate::commands::Commands;
use crate::output::OutputConfig;

#[derive(Parser, Debug)]
#[command(name = "dvu", version, about, propagate_version = true)]
pub struct Cli {
    /// Output JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    if cli.no_color {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let output_config = OutputConfig {
        json: cli.json,
        no_color: cli.no_color,
        quiet: cli.quiet,
    };

    commands::execute(cli.command, output_config).await.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["dvu", "upload", "data", "--json", "-q"]).unwrap();
        assert!(cli.json);
        assert!(cli.quiet);
        assert!(matches!(cli.command, Commands::Upload(ref args) if args.paths == ["data"]));
    }

    #[test]
    fn test_upload_requires_paths() {
        assert!(Cli::try_parse_from(["dvu", "upload"]).is_err());
    }
}
