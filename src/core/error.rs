//! Typed failures the engine inspects by kind.
//!
//! Operations return `anyhow::Result`; failures that drive a state-machine
//! transition carry an [`AtlasError`] in the chain and are discriminated with
//! `downcast_ref`, so context wrapping along the way never hides the kind.

use std::fmt;
use std::path::PathBuf;

/// Failure kinds with engine-visible meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtlasError {
    /// The cancellation scope was signalled. Never retried.
    Cancelled,
    /// Transient external failure (network, 5xx, reset). Retriable.
    Transient(String),
    /// Authentication/authorization failure. Not retried.
    AuthFailed(String),
    /// A named resource does not exist.
    NotFound(String),
    /// A state-machine transition was rejected. Indicates a caller bug.
    InvalidTransition { from: String, to: String },
    /// The operation targets a task already in a terminal status.
    AlreadyTerminal { status: String },
    /// Metadata on disk could not be parsed.
    CorruptedState { path: PathBuf },
    /// Another writer holds the workspace lock.
    Locked { workspace: String },
    /// The validation pipeline reported failure.
    ValidationFailed { failed_step: String },
    /// A required CI check concluded fail/cancel.
    CiFailed,
    /// CI watch exceeded its timeout with checks still pending.
    CiTimeout,
    /// A required check pattern matched no reported checks.
    RequiredCheckMissing { patterns: Vec<String> },
    /// Remote rejected a push.
    PushRejected(String),
    /// PR creation failed on the GitHub side.
    PrCreationFailed(String),
}

impl fmt::Display for AtlasError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Transient(msg) => write!(f, "transient failure: {msg}"),
            Self::AuthFailed(msg) => write!(f, "authentication failed: {msg}"),
            Self::NotFound(what) => write!(f, "not found: {what}"),
            Self::InvalidTransition { from, to } => {
                write!(f, "invalid transition from {from} to {to}")
            }
            Self::AlreadyTerminal { status } => {
                write!(f, "task is already terminal ({status})")
            }
            Self::CorruptedState { path } => {
                write!(f, "corrupted state file {}", path.display())
            }
            Self::Locked { workspace } => {
                write!(f, "workspace '{workspace}' is locked by another process")
            }
            Self::ValidationFailed { failed_step } => {
                write!(f, "validation failed at step '{failed_step}'")
            }
            Self::CiFailed => write!(f, "CI checks failed"),
            Self::CiTimeout => write!(f, "CI watch timed out"),
            Self::RequiredCheckMissing { patterns } => {
                write!(f, "no CI checks matched required patterns {patterns:?}")
            }
            Self::PushRejected(msg) => write!(f, "push rejected: {msg}"),
            Self::PrCreationFailed(msg) => write!(f, "PR creation failed: {msg}"),
        }
    }
}

impl std::error::Error for AtlasError {}

/// Kind lookup through an `anyhow` chain (context wrapping included).
pub fn kind_of(err: &anyhow::Error) -> Option<&AtlasError> {
    err.downcast_ref::<AtlasError>()
}

/// True when the chain bottoms out in a cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(kind_of(err), Some(AtlasError::Cancelled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn kind_survives_context_wrapping() {
        let err: anyhow::Error = AtlasError::CiTimeout.into();
        let wrapped = Err::<(), _>(err)
            .context("watch PR checks")
            .context("run ci step")
            .unwrap_err();
        assert_eq!(kind_of(&wrapped), Some(&AtlasError::CiTimeout));
    }

    #[test]
    fn is_cancelled_matches_only_cancellation() {
        let cancelled: anyhow::Error = AtlasError::Cancelled.into();
        let other: anyhow::Error = AtlasError::CiFailed.into();
        assert!(is_cancelled(&cancelled));
        assert!(!is_cancelled(&other));
    }
}
