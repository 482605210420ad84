//! Resumable multipart uploads
//!
//! A seekable source is split into parts that are uploaded concurrently under
//! one multipart upload id. The checkpoint record keeps the upload id and the
//! ETag of every acknowledged part. On resume the record is reconciled with the
//! service's own view of the upload (`list_parts`) before any new part is sent,
//! so a part the service has forgotten is simply uploaded again.
//!
//! Non-seekable input goes through [`upload_stream`], which uploads
//! sequentially without a checkpoint.

use bytes::{Bytes, BytesMut};
use ossx_core_crc::Crc64;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, instrument, warn};

use super::planner::{determine_part_size, Part};
use super::pool::PartWorkerPool;
use super::progress::ProgressTracker;
use super::record::{CompletedPart, ObjectIdentity, TransferKind, TransferRecord};
use super::{combine_part_crcs, lock, TransferState};
use crate::checkpoint::{fingerprint, CheckpointStore};
use crate::config::{TransferOptions, DEFAULT_MULTIPART_THRESHOLD};
use crate::error::{IntegrityFailure, Result, TransferError};
use crate::source::SeekableSource;
use crate::transport::{ObjectLocation, PartTag, Transport, TransportError};

/// Result of a completed upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    /// ETag of the committed object
    pub etag: String,
    pub bytes: u64,
    pub parts_total: usize,
    /// Parts sent by this call; excludes parts the service already held
    pub parts_transferred: usize,
    pub resumed: bool,
    pub crc64: Option<u64>,
    /// Multipart upload id, `None` for single-request uploads
    pub upload_id: Option<String>,
}

/// Uploads seekable sources with checkpointed resume
pub struct ResumableUploader {
    transport: Arc<dyn Transport>,
    options: TransferOptions,
}

impl ResumableUploader {
    pub fn new(transport: Arc<dyn Transport>, options: TransferOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { transport, options })
    }

    /// Upload `source` to `destination`
    ///
    /// A later call with the same source and destination resumes the same
    /// multipart upload, provided the source is unchanged and the service
    /// still knows the upload id.
    #[instrument(skip_all, fields(source = %source.name(), destination = %destination))]
    pub async fn upload(
        &self,
        source: Arc<dyn SeekableSource>,
        destination: &ObjectLocation,
    ) -> Result<UploadOutcome> {
        let mut state = TransferState::Init;
        let result = self.run(source, destination, &mut state).await;
        if let Err(error) = &result {
            warn!(state = ?state, error = %error, "Upload failed");
            state.enter(TransferState::Failed);
        }
        result
    }

    async fn run(
        &self,
        source: Arc<dyn SeekableSource>,
        destination: &ObjectLocation,
        state: &mut TransferState,
    ) -> Result<UploadOutcome> {
        let destination_id = destination.to_string();
        let source_id = source.name();
        let fingerprint = fingerprint(&destination_id, &source_id, source.local_path())?;

        state.enter(TransferState::Validating);
        let identity = source.stat().await?;

        let threshold = self.options.threshold.unwrap_or(DEFAULT_MULTIPART_THRESHOLD);
        if identity.size < threshold {
            debug!(size = identity.size, threshold, "Below multipart threshold, single PUT");
            return self
                .upload_whole(&*source, destination, &identity, &fingerprint, state)
                .await;
        }

        let store = self.options.resolve_checkpoint_store()?;
        let part_size =
            determine_part_size(identity.size, self.options.part_size, &self.options.limits);

        let existing = self
            .load_record(&store, &fingerprint, destination, &identity, part_size)
            .await?;
        let resumed = existing.is_some();
        let record = match existing {
            Some(record) => {
                state.enter(TransferState::Resuming);
                record
            }
            None => {
                state.enter(TransferState::Fresh);
                let upload_id = self
                    .transport
                    .initiate_multipart(destination)
                    .await
                    .map_err(|e| TransferError::transport("initiate_multipart", e))?;
                let record = TransferRecord::new_upload(
                    source_id.clone(),
                    destination_id,
                    identity.clone(),
                    part_size,
                    upload_id,
                );
                store.put(&fingerprint, &record)?;
                record
            }
        };

        let upload_id = record.upload_id.clone().unwrap_or_default();
        let plan = record.plan()?;
        let pending = record.pending_parts(&plan);
        info!(
            fingerprint = %fingerprint,
            upload_id = %upload_id,
            size = identity.size,
            part_size,
            parts = plan.len(),
            pending = pending.len(),
            resumed,
            "Starting upload"
        );

        let progress = ProgressTracker::new(
            identity.size,
            record.completed_bytes(),
            self.options.progress.clone(),
        );
        progress.start();

        state.enter(TransferState::Transferring);
        let ctx = Arc::new(PartContext {
            transport: Arc::clone(&self.transport),
            source: Arc::clone(&source),
            destination: destination.clone(),
            upload_id: upload_id.clone(),
            fingerprint: fingerprint.clone(),
            store: Arc::clone(&store),
            record: Mutex::new(record),
            progress,
            verify_crc: self.options.verify_crc,
            part_timeout: self.options.part_timeout,
        });
        let worker_ctx = Arc::clone(&ctx);
        let report = PartWorkerPool::new(self.options.concurrency)
            .run(pending, &self.options.cancel, move |part| {
                let ctx = Arc::clone(&worker_ctx);
                async move { ctx.send_part(part).await }
            })
            .await;

        let parts_transferred = report.completed.len();
        let remaining = report.undispatched.len();
        if let Some(error) = report.first_failure() {
            return Err(error);
        }
        if remaining > 0 {
            return Err(TransferError::Cancelled {
                fingerprint,
                remaining,
            });
        }

        state.enter(TransferState::Finalizing);
        let current = source.stat().await?;
        if current != identity {
            return Err(TransferError::SourceChanged {
                fingerprint,
                path: source_id,
                expected: identity,
                actual: current,
            });
        }

        let record = lock(&ctx.record).clone();
        let parts = record.sorted_parts();
        let tags: Vec<PartTag> = parts
            .iter()
            .map(|p| PartTag {
                part_number: p.part_number,
                etag: p.etag.clone().unwrap_or_default(),
            })
            .collect();

        let commit = self
            .transport
            .complete_multipart(destination, &upload_id, &tags)
            .await
            .map_err(|e| TransferError::Finalization {
                fingerprint: fingerprint.clone(),
                message: format!("complete_multipart {}: {}", upload_id, e),
            })?;

        let crc64 = combine_part_crcs(&parts);
        if let Some(failure) = check_object_crc(self.options.verify_crc, commit.crc64, crc64) {
            // the upload id is consumed by the commit, nothing left to resume
            store.delete(&fingerprint)?;
            return Err(TransferError::integrity(fingerprint, failure));
        }

        if let Err(e) = store.delete(&fingerprint) {
            warn!(fingerprint = %fingerprint, error = %e, "Upload committed but checkpoint removal failed");
        }
        state.enter(TransferState::Done);
        info!(fingerprint = %fingerprint, etag = %commit.etag, parts_transferred, "Upload complete");

        Ok(UploadOutcome {
            etag: commit.etag,
            bytes: identity.size,
            parts_total: plan.len(),
            parts_transferred,
            resumed,
            crc64,
            upload_id: Some(upload_id),
        })
    }

    /// Load the checkpoint and reconcile it with the service
    async fn load_record(
        &self,
        store: &CheckpointStore,
        fingerprint: &str,
        destination: &ObjectLocation,
        identity: &ObjectIdentity,
        part_size: u64,
    ) -> Result<Option<TransferRecord>> {
        let Some(mut record) = store.get(fingerprint)? else {
            return Ok(None);
        };
        let upload_id = record.upload_id.clone().unwrap_or_default();

        let reason = if record.kind != TransferKind::Upload {
            Some("record is not an upload")
        } else if record.identity != *identity {
            Some("source changed since the checkpoint")
        } else if record.part_size != part_size {
            Some("part size changed")
        } else {
            None
        };
        if let Some(reason) = reason {
            warn!(fingerprint, reason, upload_id = %upload_id, "Discarding checkpoint record");
            if record.kind == TransferKind::Upload {
                self.abort_quietly(destination, &upload_id).await;
            }
            store.delete(fingerprint)?;
            return Ok(None);
        }

        let listed = match self.transport.list_parts(destination, &upload_id).await {
            Ok(listed) => listed,
            Err(TransportError::NoSuchUpload(_)) => {
                warn!(fingerprint, upload_id = %upload_id, "Upload no longer exists, starting over");
                store.delete(fingerprint)?;
                return Ok(None);
            }
            Err(e) => return Err(TransferError::transport("list_parts", e)),
        };

        let server: HashMap<u32, (String, u64)> = listed
            .into_iter()
            .map(|p| (p.part_number, (p.etag, p.size)))
            .collect();
        let before = record.parts.len();
        record.parts.retain(|part| match server.get(&part.part_number) {
            Some((etag, size)) => part.etag.as_ref() == Some(etag) && *size == part.len(),
            None => false,
        });
        if record.parts.len() != before {
            warn!(
                fingerprint,
                dropped = before - record.parts.len(),
                "Recorded parts missing on the service, they will be uploaded again"
            );
            store.put(fingerprint, &record)?;
        }

        info!(
            fingerprint,
            upload_id = %upload_id,
            completed = record.parts.len(),
            "Resuming upload from checkpoint"
        );
        Ok(Some(record))
    }

    async fn abort_quietly(&self, destination: &ObjectLocation, upload_id: &str) {
        if let Err(e) = self.transport.abort_multipart(destination, upload_id).await {
            warn!(upload_id, error = %e, "Failed to abort abandoned multipart upload");
        }
    }

    /// Sources below the multipart threshold: one PUT, no checkpoint
    async fn upload_whole(
        &self,
        source: &dyn SeekableSource,
        destination: &ObjectLocation,
        identity: &ObjectIdentity,
        fingerprint: &str,
        state: &mut TransferState,
    ) -> Result<UploadOutcome> {
        state.enter(TransferState::Fresh);
        let progress = ProgressTracker::new(identity.size, 0, self.options.progress.clone());
        progress.start();

        let body = source.read_range(0..identity.size).await?;
        if body.len() as u64 != identity.size {
            return Err(TransferError::integrity(
                fingerprint,
                IntegrityFailure::IncompletePart {
                    part_number: 1,
                    expected: identity.size,
                    actual: body.len() as u64,
                },
            ));
        }
        let crc64 = Crc64::checksum(&body);

        state.enter(TransferState::Transferring);
        let commit = self
            .transport
            .put_object(destination, body)
            .await
            .map_err(|e| TransferError::transport("put_object", e))?;
        progress.advance(identity.size);

        state.enter(TransferState::Finalizing);
        if let Some(failure) = check_object_crc(self.options.verify_crc, commit.crc64, Some(crc64)) {
            return Err(TransferError::integrity(fingerprint, failure));
        }

        state.enter(TransferState::Done);
        Ok(UploadOutcome {
            etag: commit.etag,
            bytes: identity.size,
            parts_total: 1,
            parts_transferred: 1,
            resumed: false,
            crc64: Some(crc64),
            upload_id: None,
        })
    }
}

fn check_object_crc(verify: bool, expected: Option<u64>, actual: Option<u64>) -> Option<IntegrityFailure> {
    match (verify, expected, actual) {
        (true, Some(expected), Some(actual)) if expected != actual => {
            Some(IntegrityFailure::ObjectChecksum { expected, actual })
        }
        _ => None,
    }
}

/// State shared by the workers of one upload
struct PartContext {
    transport: Arc<dyn Transport>,
    source: Arc<dyn SeekableSource>,
    destination: ObjectLocation,
    upload_id: String,
    fingerprint: String,
    store: Arc<CheckpointStore>,
    record: Mutex<TransferRecord>,
    progress: ProgressTracker,
    verify_crc: bool,
    part_timeout: Option<Duration>,
}

impl PartContext {
    async fn send_part(&self, part: Part) -> Result<u32> {
        let body = self.source.read_range(part.range()).await?;
        if body.len() as u64 != part.len() {
            return Err(TransferError::integrity(
                self.fingerprint.clone(),
                IntegrityFailure::IncompletePart {
                    part_number: part.part_number,
                    expected: part.len(),
                    actual: body.len() as u64,
                },
            ));
        }
        let crc64 = Crc64::checksum(&body);

        let request = self.transport.upload_part(
            &self.destination,
            &self.upload_id,
            part.part_number,
            body,
        );
        let response = match self.part_timeout {
            Some(limit) => match tokio::time::timeout(limit, request).await {
                Ok(response) => response,
                Err(_) => Err(TransportError::Timeout(format!("no response within {:?}", limit))),
            },
            None => request.await,
        };
        let uploaded = response.map_err(|source| TransferError::PartTransfer {
            fingerprint: self.fingerprint.clone(),
            part_number: part.part_number,
            source,
        })?;

        if let Some(failure) = check_part_crc(self.verify_crc, part.part_number, uploaded.crc64, crc64) {
            return Err(TransferError::integrity(self.fingerprint.clone(), failure));
        }

        {
            let mut record = lock(&self.record);
            record.record_part(CompletedPart::from_part(&part, Some(uploaded.etag), Some(crc64)));
            self.store.put(&self.fingerprint, &record)?;
        }
        self.progress.advance(part.len());
        debug!(part_number = part.part_number, bytes = part.len(), "Part uploaded");
        Ok(part.part_number)
    }
}

fn check_part_crc(verify: bool, part_number: u32, server: Option<u64>, local: u64) -> Option<IntegrityFailure> {
    match server {
        Some(expected) if verify && expected != local => Some(IntegrityFailure::PartChecksum {
            part_number,
            expected,
            actual: local,
        }),
        _ => None,
    }
}

/// Upload a non-seekable reader as a multipart upload
///
/// Parts are read and sent one at a time. There is no checkpoint since the
/// input cannot be replayed; on any failure the multipart upload is aborted.
/// Progress is reported as `(bytes_sent, 0)` because the total is unknown.
pub async fn upload_stream<R>(
    transport: Arc<dyn Transport>,
    mut reader: R,
    destination: &ObjectLocation,
    options: TransferOptions,
) -> Result<UploadOutcome>
where
    R: AsyncRead + Unpin + Send,
{
    options.validate()?;
    let part_size = options
        .part_size
        .unwrap_or(options.limits.default_part_size)
        .max(options.limits.min_part_size);
    let buffer_len = usize::try_from(part_size).map_err(|_| {
        TransferError::InvalidConfig(format!("part size {} does not fit in memory", part_size))
    })?;

    let upload_id = transport
        .initiate_multipart(destination)
        .await
        .map_err(|e| TransferError::transport("initiate_multipart", e))?;
    info!(destination = %destination, upload_id = %upload_id, part_size, "Starting stream upload");

    let sent = stream_parts(&*transport, &mut reader, destination, &upload_id, buffer_len, &options).await;
    let (tags, crcs, bytes) = match sent {
        Ok(sent) => sent,
        Err(error) => {
            if let Err(e) = transport.abort_multipart(destination, &upload_id).await {
                warn!(upload_id = %upload_id, error = %e, "Failed to abort stream upload");
            }
            return Err(error);
        }
    };

    let commit = match transport.complete_multipart(destination, &upload_id, &tags).await {
        Ok(commit) => commit,
        Err(e) => {
            if let Err(abort) = transport.abort_multipart(destination, &upload_id).await {
                warn!(upload_id = %upload_id, error = %abort, "Failed to abort stream upload");
            }
            return Err(TransferError::Finalization {
                fingerprint: upload_id,
                message: format!("complete_multipart: {}", e),
            });
        }
    };

    let crc64 = combine_part_crcs(&crcs);
    if let Some(failure) = check_object_crc(options.verify_crc, commit.crc64, crc64) {
        return Err(TransferError::integrity(upload_id, failure));
    }

    Ok(UploadOutcome {
        etag: commit.etag,
        bytes,
        parts_total: tags.len(),
        parts_transferred: tags.len(),
        resumed: false,
        crc64,
        upload_id: Some(upload_id),
    })
}

async fn stream_parts<R>(
    transport: &dyn Transport,
    reader: &mut R,
    destination: &ObjectLocation,
    upload_id: &str,
    buffer_len: usize,
    options: &TransferOptions,
) -> Result<(Vec<PartTag>, Vec<CompletedPart>, u64)>
where
    R: AsyncRead + Unpin + Send,
{
    let mut tags = Vec::new();
    let mut parts = Vec::new();
    let mut offset = 0u64;

    loop {
        if options.cancel.is_cancelled() {
            return Err(TransferError::Cancelled {
                fingerprint: upload_id.to_string(),
                remaining: 0,
            });
        }

        let chunk = read_full(reader, buffer_len).await?;
        // an empty stream still needs one part to commit
        if chunk.is_empty() && !tags.is_empty() {
            break;
        }
        let part_number = u32::try_from(tags.len() + 1).map_err(|_| {
            TransferError::Planning("stream exceeds the maximum number of parts".to_string())
        })?;
        let part = Part {
            part_number,
            start: offset,
            end: offset + chunk.len() as u64,
        };
        let crc64 = Crc64::checksum(&chunk);
        let last = chunk.len() < buffer_len;

        let uploaded = transport
            .upload_part(destination, upload_id, part_number, chunk)
            .await
            .map_err(|source| TransferError::PartTransfer {
                fingerprint: upload_id.to_string(),
                part_number,
                source,
            })?;
        if let Some(failure) = check_part_crc(options.verify_crc, part_number, uploaded.crc64, crc64) {
            return Err(TransferError::integrity(upload_id, failure));
        }

        offset = part.end;
        if let Some(cb) = &options.progress {
            cb(offset, 0);
        }
        tags.push(PartTag {
            part_number,
            etag: uploaded.etag.clone(),
        });
        parts.push(CompletedPart::from_part(&part, Some(uploaded.etag), Some(crc64)));

        if last {
            break;
        }
    }
    Ok((tags, parts, offset))
}

/// Read until `len` bytes are buffered or the reader is exhausted
async fn read_full<R>(reader: &mut R, len: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = BytesMut::with_capacity(len);
    while buf.len() < len {
        let mut limited = (&mut *reader).take((len - buf.len()) as u64);
        if limited.read_buf(&mut buf).await? == 0 {
            break;
        }
    }
    Ok(buf.freeze())
}
