//! CLI subcommands

pub mod completions;
pub mod upload;

use clap::Subcommand;

use crate::exit_code::ExitCode;
use crate::output::OutputConfig;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Upload files and directories into a dataset
    Upload(upload::UploadArgs),

    /// Generate shell completion scripts
    Completions(completions::CompletionsArgs),
}

/// Execute a subcommand
pub async fn execute(cmd: Commands, output_config: OutputConfig) -> ExitCode {
    match cmd {
        Commands::Upload(args) => upload::execute(args, output_config).await,
        Commands::Completions(args) => completions::execute(args),
    }
}
