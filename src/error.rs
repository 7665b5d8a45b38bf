//! Unified error handling for tuneforge
//!
//! This module provides a centralized error type for the optimization
//! pipeline. Errors are categorized so callers can tell apart:
//! - User errors (bad level name, optimizer/training mismatch, mixed devices)
//! - Hardware errors (requested dtype/prepack unsupported by the probed CPU/device)
//! - Recoverable errors (best-effort transform or graph capture failures)
//! - Internal errors (bugs, poisoned locks)
//! - Model errors (shape mismatches during forward or rewrite)

use std::fmt;

// Re-export thiserror for convenience
pub use thiserror;

/// Unified error type for tuneforge
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    // ========== Configuration / Argument Errors ==========
    /// Unknown optimization level or unresolvable flag combination
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Optimizer presence disagrees with training mode, or dtype unsupported for the mode
    #[error("Argument mismatch: {0}")]
    ArgumentMismatch(String),

    /// Model parameters live on different device classes
    #[error("Mixed device placement: {0}")]
    MixedDevice(String),

    // ========== Hardware Errors ==========
    /// Requested dtype/prepack combination not supported by the probed hardware
    #[error("Unsupported hardware: {0}")]
    UnsupportedHardware(String),

    // ========== Recoverable Errors ==========
    /// A best-effort transform stage failed; the pipeline continues without it
    #[error("Transform '{stage}' failed: {reason}")]
    TransformFailed { stage: String, reason: String },

    /// Graph capture (trace or compile) failed; execution falls back to eager
    #[error("Graph capture failed: {0}")]
    CaptureFailed(String),

    // ========== Model Errors ==========
    /// Tensor shape does not fit the operation
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Parameter referenced by id is not reachable from the model
    #[error("Parameter not found: {0}")]
    ParameterNotFound(u64),

    // ========== Internal Errors ==========
    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Lock poisoned (indicates a panic while holding a lock)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl ForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            ForgeError::InvalidConfiguration(_)
            | ForgeError::ArgumentMismatch(_)
            | ForgeError::MixedDevice(_) => ErrorCategory::User,

            ForgeError::UnsupportedHardware(_) => ErrorCategory::Hardware,

            ForgeError::TransformFailed { .. } | ForgeError::CaptureFailed(_) => {
                ErrorCategory::Recoverable
            }

            ForgeError::ShapeMismatch(_) | ForgeError::ParameterNotFound(_) => {
                ErrorCategory::Model
            }

            ForgeError::InternalError(_) | ForgeError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Recoverable errors are downgraded to warnings by the pipeline driver
    /// and the capture state machine; they never reach the caller of `optimize`.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Recoverable)
    }

    /// Check if this is a user-facing error (actionable by users)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// User error - invalid arguments or configuration
    User,
    /// Hardware error - capability missing on this machine
    Hardware,
    /// Recoverable error - stage or capture failure with a safe fallback
    Recoverable,
    /// Internal error - indicates a bug
    Internal,
    /// Model error - shape or structure problem
    Model,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Hardware => write!(f, "Hardware"),
            ErrorCategory::Recoverable => write!(f, "Recoverable"),
            ErrorCategory::Internal => write!(f, "Internal"),
            ErrorCategory::Model => write!(f, "Model"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for ForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ForgeError::LockPoisoned(err.to_string())
    }
}

// Helper type alias for Results using ForgeError
pub type ForgeResult<T> = std::result::Result<T, ForgeError>;

/// Create a configuration error with context
///
/// # Examples
/// ```ignore
/// return Err(config_error!("Unexpected optimization level {}", level));
/// ```
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::ForgeError::InvalidConfiguration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::InvalidConfiguration(format!($fmt, $($arg)*))
    };
}

/// Create an argument mismatch error with context
#[macro_export]
macro_rules! argument_error {
    ($msg:expr) => {
        $crate::error::ForgeError::ArgumentMismatch($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::ArgumentMismatch(format!($fmt, $($arg)*))
    };
}

/// Create an internal error with context
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::ForgeError::InternalError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::InternalError(format!($fmt, $($arg)*))
    };
}

/// Wrap a stage-local error as a recoverable transform failure
pub fn transform_failed(stage: &str, reason: impl fmt::Display) -> ForgeError {
    ForgeError::TransformFailed {
        stage: stage.to_string(),
        reason: reason.to_string(),
    }
}

/// Shape check helper used by forward passes and rewrites
pub fn shape_err(msg: &str) -> ForgeError {
    ForgeError::ShapeMismatch(msg.to_string())
}
