//! Error types for primitive planning.

use std::fmt;
use thiserror::Error;

/// Errors that can occur while building an execution plan.
///
/// Post-op execution has no error channel; only descriptor validation and
/// planning report failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PrimitiveError {
    /// Malformed or contradictory descriptors, or attribute flags outside
    /// the documented mask.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// Valid but unsupported configuration (runtime shapes, unsupported
    /// data types, ineligible fusion shapes).
    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    /// Scratchpad allocation could not be satisfied.
    #[error("Out of memory: scratchpad needs {requested} bytes, limit is {limit} bytes")]
    OutOfMemory { requested: usize, limit: usize },
}

/// Result type for primitive operations.
pub type PrimitiveResult<T> = Result<T, PrimitiveError>;

/// Coarse status class of a [`PrimitiveError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    InvalidArguments,
    Unimplemented,
    OutOfMemory,
}

impl PrimitiveError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        PrimitiveError::InvalidArguments(msg.into())
    }

    pub fn unimplemented(msg: impl Into<String>) -> Self {
        PrimitiveError::Unimplemented(msg.into())
    }

    /// Returns the status class, for callers that branch on the kind of
    /// failure rather than its message.
    pub fn kind(&self) -> Status {
        match self {
            PrimitiveError::InvalidArguments(_) => Status::InvalidArguments,
            PrimitiveError::Unimplemented(_) => Status::Unimplemented,
            PrimitiveError::OutOfMemory { .. } => Status::OutOfMemory,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::InvalidArguments => "invalid_arguments",
            Status::Unimplemented => "unimplemented",
            Status::OutOfMemory => "out_of_memory",
        };
        f.write_str(name)
    }
}

/// Returns early with [`PrimitiveError::Unimplemented`] unless `cond` holds.
macro_rules! ensure_impl {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::PrimitiveError::Unimplemented(format!($($arg)+)));
        }
    };
}

/// Returns early with [`PrimitiveError::InvalidArguments`] unless `cond` holds.
macro_rules! ensure_args {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::PrimitiveError::InvalidArguments(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure_args;
pub(crate) use ensure_impl;
