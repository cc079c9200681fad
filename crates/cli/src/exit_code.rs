// Consistent exit codes for the workloop CLI.
//
//   0 = success
//   1 = general error
//   2 = usage/validation error
//   3 = record not found
//   4 = invalid status transition

use std::process;

use workloop_common::error::{StoreError, ValidationError};

use crate::commands::UsageError;

/// Named exit codes for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    Usage = 2,
    NotFound = 3,
    InvalidTransition = 4,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map an anyhow error to an exit code by inspecting the error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(store_err) = cause.downcast_ref::<StoreError>() {
                return Self::from_store_code(store_err.code());
            }
            if cause.is::<ValidationError>() || cause.is::<UsageError>() {
                return Self::Usage;
            }
        }
        Self::Error
    }

    /// Map a `StoreError::code` string to an exit code.
    pub fn from_store_code(code: &str) -> Self {
        match code {
            "VALIDATION_FAILED" => Self::Usage,
            "NOT_FOUND" => Self::NotFound,
            "INVALID_TRANSITION" => Self::InvalidTransition,
            _ => Self::Error,
        }
    }
}

impl From<ExitCode> for process::ExitCode {
    fn from(code: ExitCode) -> Self {
        process::ExitCode::from(code.code() as u8)
    }
}
