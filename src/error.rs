//! Error types for the calculation engine.
//!
//! Uses `thiserror` for structured, matchable error variants covering the
//! failure modes of identity computation, cache lookups, and user functions.

use thiserror::Error;

use crate::id::ShortId;

/// Boxed error type carried by [`CalcError::User`].
pub type BoxError = Box<dyn std::error::Error + 'static>;

/// Errors produced by the calcgraph crate.
#[derive(Debug, Error)]
pub enum CalcError {
    /// An argument could not be turned into a cache key part.
    #[error("unhashable argument: {reason}")]
    UnhashableArg { reason: String },

    /// Two semantically distinct long identities hashed to the same short id.
    #[error("short id collision on {short}: conflicting long identities")]
    IdCollision { short: ShortId },

    /// A cached value could not be downcast to the node's value type.
    #[error("cached value for {short} has an unexpected type")]
    ValueTypeMismatch { short: ShortId },

    /// The wrapped user function failed. The engine never wraps or retries;
    /// no cache write occurs for the failed call.
    #[error("user function error: {0}")]
    User(BoxError),
}

impl CalcError {
    /// Wraps an arbitrary error from a user function body.
    pub fn user(err: impl Into<BoxError>) -> Self {
        CalcError::User(err.into())
    }

    /// Shorthand for an [`CalcError::UnhashableArg`] with the given reason.
    pub fn unhashable(reason: impl Into<String>) -> Self {
        CalcError::UnhashableArg {
            reason: reason.into(),
        }
    }
}
