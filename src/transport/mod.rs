//! Transport collaborators for the transfer engine
//!
//! The engine never builds HTTP requests itself. It talks to a [`Transport`],
//! which exposes the handful of object-storage operations a multipart transfer
//! needs: metadata lookup, conditional ranged reads, single-request writes and
//! the multipart upload lifecycle. Request signing, connection pooling and
//! response decoding all live behind this trait.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryTransport`]: in-process object store with fault injection
//! - `S3Transport` (feature `s3-native`): S3-compatible services via `aws-sdk-s3`

pub mod memory;
#[cfg(feature = "s3-native")]
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::fmt;
use std::ops::Range;
use std::pin::Pin;
use thiserror::Error;

use crate::core::record::ObjectIdentity;

pub use memory::{FaultPlan, MemoryTransport};
#[cfg(feature = "s3-native")]
pub use s3::S3Transport;

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Streaming response body
pub type BodyStream = Pin<Box<dyn Stream<Item = TransportResult<Bytes>> + Send>>;

/// Errors surfaced by a [`Transport`]
///
/// Transport-level failures (the request never produced a response) are kept
/// apart from protocol-level failures (the service answered with an error).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection, DNS or TLS failure
    #[error("Network error: {0}")]
    Network(String),

    /// The request did not complete in time
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Non-2xx response not covered by a more specific variant
    #[error("Service returned {status} ({code}): {message}")]
    Status {
        status: u16,
        code: String,
        message: String,
        request_id: Option<String>,
    },

    /// An `If-Match` condition did not hold (HTTP 412)
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Object does not exist
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Multipart upload id is unknown or no longer valid
    #[error("No such upload: {0}")]
    NoSuchUpload(String),
}

impl TransportError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(_) | TransportError::Timeout(_) => true,
            TransportError::Status { status, code, .. } => {
                *status >= 500 || *status == 429 || is_retryable_code(code)
            }
            TransportError::PreconditionFailed(_)
            | TransportError::NotFound(_)
            | TransportError::NoSuchUpload(_) => false,
        }
    }

    /// Check if the request never produced a response
    pub fn is_transport_level(&self) -> bool {
        matches!(self, TransportError::Network(_) | TransportError::Timeout(_))
    }
}

/// Check if a service error code is retryable
pub(crate) fn is_retryable_code(code: &str) -> bool {
    matches!(
        code,
        "RequestTimeout" | "ServiceUnavailable" | "InternalError" | "SlowDown"
    )
}

/// Bucket and key of a remote object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Metadata returned by a HEAD request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    /// Last-modified time, seconds since the Unix epoch
    pub mtime: i64,
    pub etag: String,
    /// Server-side CRC-64/ECMA of the full object, when the service reports one
    pub crc64: Option<u64>,
}

impl ObjectMeta {
    /// The (size, mtime, etag) triple used to detect remote changes
    pub fn identity(&self) -> ObjectIdentity {
        ObjectIdentity {
            size: self.size,
            mtime: self.mtime,
            etag: Some(self.etag.clone()),
        }
    }
}

/// Response to a single part upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub etag: String,
    pub crc64: Option<u64>,
}

/// A part as reported by `list_parts`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedPart {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

/// Part identifier submitted with a multipart commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartTag {
    pub part_number: u32,
    pub etag: String,
}

/// Response to `put_object` or `complete_multipart`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    pub etag: String,
    pub crc64: Option<u64>,
}

/// Object-storage operations used by the transfer engine
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch the current metadata of an object
    async fn head(&self, location: &ObjectLocation) -> TransportResult<ObjectMeta>;

    /// Read an object, or a byte range of it
    ///
    /// `range` is half-open. When `if_match` is set the service must reject the
    /// request with [`TransportError::PreconditionFailed`] if the object's
    /// current ETag differs.
    async fn get(
        &self,
        location: &ObjectLocation,
        range: Option<Range<u64>>,
        if_match: Option<&str>,
    ) -> TransportResult<BodyStream>;

    /// Single-request upload
    async fn put_object(
        &self,
        location: &ObjectLocation,
        body: Bytes,
    ) -> TransportResult<CommitResult>;

    /// Start a multipart upload and return its id
    async fn initiate_multipart(&self, location: &ObjectLocation) -> TransportResult<String>;

    async fn upload_part(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> TransportResult<UploadedPart>;

    /// Parts the service currently holds for an upload, in part-number order
    async fn list_parts(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
    ) -> TransportResult<Vec<ListedPart>>;

    /// Commit an upload; `parts` must be sorted by part number
    async fn complete_multipart(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
        parts: &[PartTag],
    ) -> TransportResult<CommitResult>;

    async fn abort_multipart(&self, location: &ObjectLocation, upload_id: &str)
        -> TransportResult<()>;
}
