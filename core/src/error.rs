//! Error taxonomy for document operations.
//!
//! Every service returns [`DocumentError`]. Store adapters report
//! [`StoreError`], which services wrap transparently, except for unique
//! violations on the child dedup key which surface as
//! [`DocumentError::DuplicateAllocation`] so callers can retry.

use crate::numbering::NumberingError;
use crate::providers::ProviderError;
use crate::sequence::SequenceError;
use crate::workflow::{EntityKind, StateId, TransitionRejection, WorkflowConfigError};
use thiserror::Error;

/// Errors reported by a persistence adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection, query or driver failure.
    #[error("Database error: {0}")]
    Database(String),

    /// A unique constraint rejected a write.
    #[error("Unique constraint violated: {constraint}")]
    UniqueViolation {
        /// Name of the violated constraint or index.
        constraint: String,
    },

    /// The transaction lost a serialization or lock race and may be retried.
    #[error("Concurrent modification: {0}")]
    Conflict(String),

    /// A stored value could not be decoded.
    #[error("Corrupt row: {0}")]
    Decode(String),
}

impl StoreError {
    /// Whether retrying the whole transaction may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Errors returned by document services.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DocumentError {
    /// The referenced entity does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity type, e.g. `"coordination"` or `"consignee"`.
        entity: &'static str,
        /// Requested key.
        id: i64,
    },

    /// A business precondition does not hold.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// No configured transition matches, or the actor's roles are not allowed.
    #[error("Transition {from} -> {to} is not allowed for {kind}")]
    ForbiddenTransition {
        /// Entity kind.
        kind: EntityKind,
        /// Requested origin.
        from: StateId,
        /// Requested destination.
        to: StateId,
    },

    /// The transition requires a comment.
    #[error("Transition {from} -> {to} for {kind} requires a comment")]
    MissingComment {
        /// Entity kind.
        kind: EntityKind,
        /// Requested origin.
        from: StateId,
        /// Requested destination.
        to: StateId,
    },

    /// A concurrent allocation won the race on the dedup key.
    #[error("Child waybill already allocated for {key}")]
    DuplicateAllocation {
        /// The contested dedup key.
        key: String,
    },

    /// Malformed request input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Sequence generation failed.
    #[error(transparent)]
    Sequence(#[from] SequenceError),

    /// Numbering failed.
    #[error(transparent)]
    Numbering(#[from] NumberingError),

    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The loaded workflow configuration is unusable.
    #[error(transparent)]
    WorkflowConfig(#[from] WorkflowConfigError),

    /// A catalog or ledger collaborator failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl DocumentError {
    /// Shorthand for [`DocumentError::NotFound`].
    #[must_use]
    pub const fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    /// Shorthand for [`DocumentError::PreconditionFailed`].
    #[must_use]
    pub fn precondition(reason: impl Into<String>) -> Self {
        Self::PreconditionFailed(reason.into())
    }

    /// Whether the operation may succeed if retried unchanged.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::DuplicateAllocation { .. } => true,
            Self::Store(store) => store.is_retryable(),
            _ => false,
        }
    }
}

impl From<TransitionRejection> for DocumentError {
    fn from(rejection: TransitionRejection) -> Self {
        match rejection {
            TransitionRejection::Forbidden { kind, from, to } => {
                Self::ForbiddenTransition { kind, from, to }
            },
            TransitionRejection::MissingComment { kind, from, to } => {
                Self::MissingComment { kind, from, to }
            },
        }
    }
}

/// Result alias for document services.
pub type Result<T> = std::result::Result<T, DocumentError>;
