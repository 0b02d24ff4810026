//! Error types for the document operation engine.
//!
//! Three layers, from the bottom up:
//! - `ProviderError`: what a storage provider reports for one call.
//! - `DocumentError`: a failure confined to one document. It is recorded in
//!   the job's counters and never aborts sibling transfers.
//! - `EngineError`: job-level errors that reject a job at submission or abort
//!   it while running.

use std::io;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{JobState, OperationKind};

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors reported by a `DocumentsProvider`.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("document not found: {0}")]
    NotFound(String),

    /// Connection to the backend is gone; nothing else will succeed
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("document already exists: {0}")]
    AlreadyExists(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProviderError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ProviderError::Unavailable(_))
    }
}

/// A failure affecting a single document.
#[derive(Error, Debug)]
pub enum DocumentError {
    /// Virtual document has no export type matching the requested one
    #[error("cannot convert {name} to {required}")]
    ConversionUnsupported { name: String, required: String },

    /// Reads kept failing after the configured number of reopen attempts
    #[error("failed to read {name} after {attempts} attempts")]
    TransferRead {
        name: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {name}")]
    Write {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("{operation} is not supported for {name}")]
    Unsupported {
        name: String,
        operation: &'static str,
    },

    /// Provider kept reporting the listing as loading
    #[error("listing {name} did not finish loading")]
    ListingTimedOut { name: String },

    /// The destination directory meant to hold this document was not created
    #[error("no destination directory for {name}")]
    ParentFailed { name: String },

    #[error("invalid archive entry: {0}")]
    InvalidEntry(String),

    #[error("provider error on {name}: {source}")]
    Provider {
        name: String,
        #[source]
        source: ProviderError,
    },

    /// Provider error while writing to the destination of a transfer
    #[error("destination error on {name}: {source}")]
    Destination {
        name: String,
        #[source]
        source: ProviderError,
    },

    /// Cancellation observed at a checkpoint; not counted as a failure
    #[error("canceled")]
    Canceled,
}

impl DocumentError {
    pub(crate) fn provider(name: &str, source: ProviderError) -> Self {
        DocumentError::Provider {
            name: name.to_string(),
            source,
        }
    }

    pub(crate) fn destination(name: &str, source: ProviderError) -> Self {
        DocumentError::Destination {
            name: name.to_string(),
            source,
        }
    }

    /// True if the underlying provider is gone, which makes the error job-fatal.
    pub fn is_provider_unavailable(&self) -> bool {
        match self {
            DocumentError::Provider { source, .. } | DocumentError::Destination { source, .. } => {
                source.is_unavailable()
            }
            _ => false,
        }
    }

    /// Turn loss of a provider into a job-level error; anything else stays
    /// a per-document failure.
    pub(crate) fn escalate(self, authority: &str) -> Result<DocumentError, EngineError> {
        self.escalate_transfer(authority, authority)
    }

    /// Like `escalate`, naming `destination_authority` when the failed call
    /// went to the destination provider.
    pub(crate) fn escalate_transfer(
        self,
        source_authority: &str,
        destination_authority: &str,
    ) -> Result<DocumentError, EngineError> {
        match self {
            DocumentError::Provider {
                source: ProviderError::Unavailable(reason),
                ..
            } => Err(EngineError::ProviderUnavailable {
                authority: source_authority.to_string(),
                reason,
            }),
            DocumentError::Destination {
                source: ProviderError::Unavailable(reason),
                ..
            } => Err(EngineError::ProviderUnavailable {
                authority: destination_authority.to_string(),
                reason,
            }),
            other => Ok(other),
        }
    }
}

/// Job-level errors.
///
/// These reject a job before any I/O (pre-flight) or abort it while running.
/// Per-document failures are `DocumentError`s and never become `EngineError`s
/// unless the provider itself is gone.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Destination is the source or one of its descendants
    #[error("cannot {operation} {source_name} into itself or one of its descendants")]
    RecursiveOperation {
        operation: OperationKind,
        source_name: String,
    },

    #[error("provider unavailable: {authority}: {reason}")]
    ProviderUnavailable { authority: String, reason: String },

    #[error("no provider registered for authority {0}")]
    UnknownAuthority(String),

    #[error("no job with id {0}")]
    UnknownJob(Uuid),

    #[error("no source documents could be resolved")]
    NoSources,

    #[error("{0} requires a destination")]
    DestinationRequired(OperationKind),

    #[error("destination {0} is not a directory")]
    DestinationNotDirectory(String),

    #[error("job {id} is {actual:?}, expected {expected:?}")]
    InvalidState {
        id: Uuid,
        actual: JobState,
        expected: JobState,
    },

    #[error("failed to write archive {name}")]
    ArchiveWrite {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Planned bytes exceed the destination's free space
    #[error("not enough space on {name}: {required} bytes needed, {available} available")]
    InsufficientSpace {
        name: String,
        required: u64,
        available: u64,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to start worker: {0}")]
    Worker(#[source] io::Error),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

impl EngineError {
    /// Lift a provider error seen during a job-level step, promoting loss of
    /// the provider to `ProviderUnavailable`.
    pub(crate) fn from_provider(authority: &str, err: ProviderError) -> Self {
        match err {
            ProviderError::Unavailable(reason) => EngineError::ProviderUnavailable {
                authority: authority.to_string(),
                reason,
            },
            other => EngineError::Provider(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_provider_is_detected_through_document_error() {
        let err = DocumentError::provider("a.txt", ProviderError::Unavailable("gone".into()));
        assert!(err.is_provider_unavailable());

        let err = DocumentError::provider("a.txt", ProviderError::NotFound("a".into()));
        assert!(!err.is_provider_unavailable());
    }

    #[test]
    fn test_from_provider_promotes_unavailable() {
        let err = EngineError::from_provider("mem", ProviderError::Unavailable("down".into()));
        assert!(matches!(err, EngineError::ProviderUnavailable { .. }));

        let err = EngineError::from_provider("mem", ProviderError::NotFound("x".into()));
        assert!(matches!(err, EngineError::Provider(ProviderError::NotFound(_))));
    }

    #[test]
    fn test_escalate_only_unavailable() {
        let err = DocumentError::provider("a.txt", ProviderError::Unavailable("gone".into()));
        assert!(matches!(
            err.escalate("mem"),
            Err(EngineError::ProviderUnavailable { .. })
        ));

        let err = DocumentError::ListingTimedOut {
            name: "dir".to_string(),
        };
        assert!(matches!(
            err.escalate("mem"),
            Ok(DocumentError::ListingTimedOut { .. })
        ));
    }

    #[test]
    fn test_destination_loss_names_destination_authority() {
        let err = DocumentError::destination("a.txt", ProviderError::Unavailable("gone".into()));
        assert!(err.is_provider_unavailable());
        match err.escalate_transfer("src", "dst") {
            Err(EngineError::ProviderUnavailable { authority, .. }) => assert_eq!(authority, "dst"),
            other => panic!("Unexpected result: {:?}", other),
        }

        let err = DocumentError::provider("a.txt", ProviderError::Unavailable("gone".into()));
        match err.escalate_transfer("src", "dst") {
            Err(EngineError::ProviderUnavailable { authority, .. }) => assert_eq!(authority, "src"),
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_recursive_error_message() {
        let err = EngineError::RecursiveOperation {
            operation: OperationKind::Copy,
            source_name: "photos".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "cannot Copy photos into itself or one of its descendants"
        );
    }
}
