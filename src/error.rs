//! Error types for observation setup and delivery.

use thiserror::Error;

/// Errors raised while registering observations or reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObserveError {
    /// The property path does not resolve on the target's type.
    #[error("property path `{path}` does not resolve on `{type_name}`")]
    InvalidPath {
        /// Type (or object kind) the path was looked up on.
        type_name: String,
        /// The path that failed to resolve.
        path: String,
    },

    /// The combined callback accepts a different number of values than pairs were registered.
    #[error("combined callback accepts {expected} values but {actual} pairs were registered")]
    ArityMismatch {
        /// Number of values the callback accepts.
        expected: usize,
        /// Number of (target, path) pairs supplied.
        actual: usize,
    },

    /// `observe_latest` was called with an empty pair list.
    #[error("at least one (target, path) pair is required")]
    NoPairs,

    /// Provider-specific failure.
    #[error("notification provider error: {0}")]
    Provider(String),
}

impl ObserveError {
    /// Shorthand for [`ObserveError::InvalidPath`].
    pub fn invalid_path(type_name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::InvalidPath {
            type_name: type_name.into(),
            path: path.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = ObserveError> = std::result::Result<T, E>;
