//! # Error Taxonomy
//!
//! Failure kinds surfaced by the store. Collaborator policies (expiry,
//! veto) report their own failures as `anyhow::Error` and are contained
//! by the store; only the kinds below reach callers.

use thiserror::Error;

/// Result alias used throughout the store crates.
pub type StoreResult<T> = Result<T, StoreError>;

/// Caller-visible store failures.
///
/// `OversizeMapping` is deliberately absent: it is an internal condition
/// handled by the oversize protocol and only surfaces here, as
/// `StoreAccess`, once every remediation step has failed.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Construction-time validation failure (zero segments, zero
    /// capacity, non-power-of-two page size). Fails fast, no side effects.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Backing-map or arena failure, including a terminal oversize and
    /// codec failures at the serialization boundary.
    #[error("store access failure: {0}")]
    StoreAccess(String),

    /// An operation was invoked in a state its contract forbids, such as
    /// `install_mapping` on a slot that is not empty.
    #[error("precondition violated: {0}")]
    PreconditionViolated(&'static str),
}

impl StoreError {
    /// Wraps an arbitrary backing failure as a `StoreAccess`.
    pub fn access(err: impl std::fmt::Display) -> Self {
        StoreError::StoreAccess(err.to_string())
    }
}
