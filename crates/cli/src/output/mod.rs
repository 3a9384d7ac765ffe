//! Output formatting
//!
//! Human-readable output goes to stdout with optional colors; `--json`
//! switches every command to machine-readable output.

mod formatter;

pub use formatter::Formatter;

/// Global output switches shared by all commands
#[derive(Debug, Clone, Default)]
pub struct OutputConfig {
    /// Emit JSON instead of human-readable text
    pub json: bool,
    /// Disable colors
    pub no_color: bool,
    /// Only print errors
    pub quiet: bool,
}
