//! Core data model for document operation jobs.
//!
//! This module defines the main data structures shared by every stage:
//! - DocumentRef: a resolved document addressed through a provider
//! - OperationKind, JobState: enums controlling behavior
//! - JobProgress: the immutable snapshot published to listeners
//! - TransferOutcome: per-document result, folded into JobProgress

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::DocumentError;

/// Sentinel used by `JobProgress` byte and time fields when the value is unknown.
pub const UNKNOWN: i64 = -1;

/// Mime type that marks a document as a directory.
pub const MIME_TYPE_DIR: &str = "inode/directory";

/// Capability and kind flags reported by a provider for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DocumentFlags {
    /// No direct byte representation; must be exported before transfer
    pub is_virtual: bool,
    /// Contents may be read out into another document or an archive
    pub supports_copy: bool,
    pub supports_move: bool,
    pub supports_delete: bool,
    pub is_directory: bool,
}

impl DocumentFlags {
    /// Flags for a plain, fully capable file.
    pub fn file() -> Self {
        DocumentFlags {
            is_virtual: false,
            supports_copy: true,
            supports_move: true,
            supports_delete: true,
            is_directory: false,
        }
    }

    /// Flags for a plain, fully capable directory.
    pub fn directory() -> Self {
        DocumentFlags {
            is_directory: true,
            ..Self::file()
        }
    }

    /// Flags for a virtual document that can still be copied and moved.
    pub fn virtual_file() -> Self {
        DocumentFlags {
            is_virtual: true,
            ..Self::file()
        }
    }
}

/// A document resolved through its provider.
///
/// Immutable once resolved. Holders that suspect the metadata is stale
/// re-resolve through `ProviderRegistry::refresh`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    /// Key of the provider that owns this document
    pub authority: String,

    /// Opaque identifier, meaningful only to the owning provider
    pub document_id: String,

    pub display_name: String,

    pub mime_type: String,

    /// Size in bytes, `None` when the provider cannot tell
    pub size: Option<u64>,

    /// Last modification time in milliseconds since the Unix epoch
    pub last_modified: Option<i64>,

    pub flags: DocumentFlags,
}

impl DocumentRef {
    pub fn is_directory(&self) -> bool {
        self.flags.is_directory
    }

    pub fn is_virtual(&self) -> bool {
        self.flags.is_virtual
    }

    /// True if both references address the same document of the same provider.
    pub fn same_document(&self, other: &DocumentRef) -> bool {
        self.authority == other.authority && self.document_id == other.document_id
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.authority, self.document_id, self.display_name)
    }
}

/// The operation a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Copy documents; sources remain unchanged
    Copy,
    /// Move documents; sources deleted after a successful transfer
    Move,
    /// Pack documents into one archive in the destination
    Compress,
    /// Unpack archive documents into the destination
    Extract,
    /// Delete documents; no destination
    Delete,
}

impl OperationKind {
    /// Whether this operation writes into a destination directory.
    pub fn needs_destination(&self) -> bool {
        !matches!(self, OperationKind::Delete)
    }

    /// Whether the destination must be checked against copying a tree into itself.
    pub fn checks_recursion(&self) -> bool {
        matches!(
            self,
            OperationKind::Copy | OperationKind::Move | OperationKind::Compress
        )
    }

    /// Present participle used in progress messages ("Copying").
    pub fn progressive(&self) -> &'static str {
        match self {
            OperationKind::Copy => "Copying",
            OperationKind::Move => "Moving",
            OperationKind::Compress => "Compressing",
            OperationKind::Extract => "Extracting",
            OperationKind::Delete => "Deleting",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Copy => write!(f, "Copy"),
            OperationKind::Move => write!(f, "Move"),
            OperationKind::Compress => write!(f, "Compress"),
            OperationKind::Extract => write!(f, "Extract"),
            OperationKind::Delete => write!(f, "Delete"),
        }
    }
}

/// The lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Submitted, not yet started
    Queued,
    /// Currently executing
    Running,
    /// All documents processed; some may have failed (see `has_failures`)
    Completed,
    /// Aborted by a job-level error
    Failed,
    /// Stopped by a cancellation request
    Canceled,
}

impl JobState {
    /// Returns true if this state is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Canceled
        )
    }
}

/// A point-in-time snapshot of a job's progress.
///
/// Snapshots are plain values: listeners receive clones and never observe
/// a half-applied update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub id: Uuid,

    pub state: JobState,

    /// Human-readable message meant for direct display
    pub msg: String,

    pub has_failures: bool,

    /// Bytes written so far, `UNKNOWN` when byte accounting is off
    pub current_bytes: i64,

    /// Bytes the job expects to write, `UNKNOWN` when it cannot tell
    pub required_bytes: i64,

    /// Estimated time to completion, `UNKNOWN` until there is enough data
    pub ms_remaining: i64,

    /// Documents finished, whether they succeeded, were skipped or failed
    pub processed_files: u64,

    pub total_files: u64,

    pub failed_files: u64,
}

impl JobProgress {
    /// A fresh snapshot in the Queued state.
    pub fn queued(id: Uuid, msg: String) -> Self {
        JobProgress {
            id,
            state: JobState::Queued,
            msg,
            has_failures: false,
            current_bytes: UNKNOWN,
            required_bytes: UNKNOWN,
            ms_remaining: UNKNOWN,
            processed_files: 0,
            total_files: 0,
            failed_files: 0,
        }
    }

    /// Whether both byte counters are known.
    pub fn bytes_known(&self) -> bool {
        self.current_bytes != UNKNOWN && self.required_bytes != UNKNOWN
    }
}

/// Result of processing one document.
///
/// Never surfaced on its own; the state machine folds it into the counters
/// and the `has_failures` flag.
#[derive(Debug)]
pub(crate) enum TransferOutcome {
    Success,
    Skipped,
    Failed(DocumentError),
}

impl From<Result<(), DocumentError>> for TransferOutcome {
    fn from(result: Result<(), DocumentError>) -> Self {
        match result {
            Ok(()) => TransferOutcome::Success,
            Err(err) => TransferOutcome::Failed(err),
        }
    }
}
