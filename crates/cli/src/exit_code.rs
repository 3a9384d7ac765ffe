//! Process exit codes
//!
//! Scripts rely on these values, so they must stay stable.

/// Exit status of a `dvu` invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Every file was uploaded or skipped
    Success = 0,
    /// Unexpected failure, or some files are still failed after retries
    GeneralError = 1,
    /// Bad arguments or invalid configuration
    UsageError = 2,
    /// Server unreachable
    NetworkError = 3,
    /// API key rejected
    AuthError = 4,
    /// Dataset does not exist
    NotFound = 5,
    /// Dataset stayed locked
    DatasetLocked = 6,
    /// Stopped by Ctrl-C
    Interrupted = 130,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::GeneralError),
            2 => Some(Self::UsageError),
            3 => Some(Self::NetworkError),
            4 => Some(Self::AuthError),
            5 => Some(Self::NotFound),
            6 => Some(Self::DatasetLocked),
            130 => Some(Self::Interrupted),
            _ => None,
        }
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code.as_i32() as u8)
    }
}
