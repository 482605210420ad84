//! Error types for resumable transfers
//!
//! Every failure a caller can see is a [`TransferError`]. Callers that need to
//! decide mechanically whether to retry should match on [`TransferError::kind`]
//! or call [`TransferError::is_retryable`] rather than inspect messages.
//!
//! A malformed checkpoint is deliberately absent from this taxonomy: the
//! checkpoint store logs it and reports the record as missing.

use std::io;
use thiserror::Error;

use crate::core::record::ObjectIdentity;
use crate::transport::TransportError;

/// Result type alias for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;

/// Coarse classification of a [`TransferError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Planning,
    PartTransfer,
    Integrity,
    RemoteChanged,
    SourceChanged,
    Finalization,
    Checkpoint,
    Transport,
    Cancelled,
    InvalidConfig,
    Io,
}

/// What an integrity check found
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityFailure {
    /// Bytes moved for a part differ from its planned length
    #[error("part {part_number} is incomplete: expected {expected} bytes, got {actual}")]
    IncompletePart {
        part_number: u32,
        expected: u64,
        actual: u64,
    },

    /// Server-side CRC of a part differs from the locally computed one
    #[error("part {part_number} crc64 mismatch: expected {expected:016x}, got {actual:016x}")]
    PartChecksum {
        part_number: u32,
        expected: u64,
        actual: u64,
    },

    /// Combined CRC of all parts differs from the object's CRC
    #[error("object crc64 mismatch: expected {expected:016x}, got {actual:016x}")]
    ObjectChecksum { expected: u64, actual: u64 },
}

/// Errors that can occur during a resumable transfer
#[derive(Error, Debug)]
pub enum TransferError {
    /// Invalid size or part-size combination
    #[error("Planning error: {0}")]
    Planning(String),

    /// A single part failed; completed parts stay recorded
    #[error("Part {part_number} failed [{fingerprint}]: {source}")]
    PartTransfer {
        fingerprint: String,
        part_number: u32,
        source: TransportError,
    },

    /// Transferred data does not match what was expected
    #[error("Integrity check failed [{fingerprint}]: {failure}")]
    Integrity {
        fingerprint: String,
        failure: IntegrityFailure,
    },

    /// The remote object changed while the transfer was running
    #[error("Remote object changed during transfer [{fingerprint}]: expected {expected}, {detail}")]
    RemoteChanged {
        fingerprint: String,
        expected: ObjectIdentity,
        detail: String,
    },

    /// The local upload source changed while the transfer was running
    #[error("Upload source {path} changed during transfer [{fingerprint}]: expected {expected}, found {actual}")]
    SourceChanged {
        fingerprint: String,
        path: String,
        expected: ObjectIdentity,
        actual: ObjectIdentity,
    },

    /// Rename or commit failed; checkpoint and temp artifact are preserved
    #[error("Finalization failed [{fingerprint}]: {message}")]
    Finalization { fingerprint: String, message: String },

    /// The checkpoint backend could not be read or written
    #[error("Checkpoint store error for {key}: {source}")]
    Checkpoint { key: String, source: io::Error },

    /// A request outside the part pool failed (HEAD, initiate, list)
    #[error("{operation} failed: {source}")]
    Transport {
        operation: &'static str,
        source: TransportError,
    },

    /// Caller cancelled before every part was dispatched
    #[error("Transfer cancelled [{fingerprint}]: {remaining} parts not transferred")]
    Cancelled { fingerprint: String, remaining: usize },

    /// Rejected options or configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Local file I/O
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    /// Wrap a failed non-part request
    pub fn transport(operation: &'static str, source: TransportError) -> Self {
        TransferError::Transport { operation, source }
    }

    pub fn integrity(fingerprint: impl Into<String>, failure: IntegrityFailure) -> Self {
        TransferError::Integrity {
            fingerprint: fingerprint.into(),
            failure,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Planning(_) => ErrorKind::Planning,
            TransferError::PartTransfer { .. } => ErrorKind::PartTransfer,
            TransferError::Integrity { .. } => ErrorKind::Integrity,
            TransferError::RemoteChanged { .. } => ErrorKind::RemoteChanged,
            TransferError::SourceChanged { .. } => ErrorKind::SourceChanged,
            TransferError::Finalization { .. } => ErrorKind::Finalization,
            TransferError::Checkpoint { .. } => ErrorKind::Checkpoint,
            TransferError::Transport { .. } => ErrorKind::Transport,
            TransferError::Cancelled { .. } => ErrorKind::Cancelled,
            TransferError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            TransferError::Io(_) => ErrorKind::Io,
        }
    }

    /// Check if calling the same transfer again is likely to make progress
    ///
    /// A retry resumes from the checkpoint, or starts over when the remote
    /// object or local source changed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::PartTransfer { .. }
            | TransferError::Finalization { .. }
            | TransferError::RemoteChanged { .. }
            | TransferError::SourceChanged { .. }
            | TransferError::Cancelled { .. }
            | TransferError::Integrity { .. }
            | TransferError::Io(_) => true,
            TransferError::Transport { source, .. } => source.is_retryable(),
            TransferError::Checkpoint { .. }
            | TransferError::Planning(_)
            | TransferError::InvalidConfig(_) => false,
        }
    }

    /// Fingerprint of the transfer the error belongs to, if known
    pub fn fingerprint(&self) -> Option<&str> {
        match self {
            TransferError::PartTransfer { fingerprint, .. }
            | TransferError::Integrity { fingerprint, .. }
            | TransferError::RemoteChanged { fingerprint, .. }
            | TransferError::SourceChanged { fingerprint, .. }
            | TransferError::Finalization { fingerprint, .. }
            | TransferError::Cancelled { fingerprint, .. } => Some(fingerprint),
            TransferError::Checkpoint { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Part number the error is about, if any
    pub fn part_number(&self) -> Option<u32> {
        match self {
            TransferError::PartTransfer { part_number, .. } => Some(*part_number),
            TransferError::Integrity { failure, .. } => match failure {
                IntegrityFailure::IncompletePart { part_number, .. }
                | IntegrityFailure::PartChecksum { part_number, .. } => Some(*part_number),
                IntegrityFailure::ObjectChecksum { .. } => None,
            },
            _ => None,
        }
    }
}
