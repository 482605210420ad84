//! Resumable downloads
//!
//! Parts are fetched with conditional ranged GETs into a staging file next to
//! the destination (`<dest>.tmp-<uuid>`), each worker writing at its own
//! offset through its own file handle. Every finished part is recorded in the
//! checkpoint store. Once all parts are in, the remote identity is checked
//! again, the combined CRC-64 is compared with the service's value, and the
//! staging file is renamed over the destination.
//!
//! # Example
//!
//! ```no_run
//! use ossx::config::TransferOptions;
//! use ossx::core::download::ResumableDownloader;
//! use ossx::transport::{MemoryTransport, ObjectLocation};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn example() -> ossx::Result<()> {
//! let transport = Arc::new(MemoryTransport::new());
//! let downloader = ResumableDownloader::new(transport, TransferOptions::default())?;
//! let outcome = downloader
//!     .download(&ObjectLocation::new("bucket", "big.iso"), Path::new("big.iso"))
//!     .await?;
//! println!("{} bytes, resumed: {}", outcome.bytes, outcome.resumed);
//! # Ok(())
//! # }
//! ```

use futures::StreamExt;
use ossx_core_crc::Crc64;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use super::planner::{determine_part_size, Part};
use super::pool::PartWorkerPool;
use super::progress::ProgressTracker;
use super::record::{new_temp_suffix, CompletedPart, ObjectIdentity, TransferKind, TransferRecord};
use super::{combine_part_crcs, lock, remove_quietly, TransferState};
use crate::checkpoint::{canonical_path, fingerprint, CheckpointStore};
use crate::config::{TransferOptions, DEFAULT_MULTIGET_THRESHOLD};
use crate::error::{IntegrityFailure, Result, TransferError};
use crate::transport::{ObjectLocation, ObjectMeta, Transport, TransportError};

/// Result of a completed download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    pub bytes: u64,
    pub parts_total: usize,
    /// Parts fetched by this call; excludes parts restored from a checkpoint
    pub parts_transferred: usize,
    pub resumed: bool,
    pub crc64: Option<u64>,
}

/// Downloads objects with checkpointed resume
pub struct ResumableDownloader {
    transport: Arc<dyn Transport>,
    options: TransferOptions,
}

impl ResumableDownloader {
    pub fn new(transport: Arc<dyn Transport>, options: TransferOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { transport, options })
    }

    /// Download `source` to `destination`
    ///
    /// Calling again after a failure resumes from the last persisted part,
    /// unless the remote object changed in between, in which case the old
    /// progress is discarded and the download starts over.
    #[instrument(skip_all, fields(source = %source, destination = %destination.display()))]
    pub async fn download(
        &self,
        source: &ObjectLocation,
        destination: &Path,
    ) -> Result<DownloadOutcome> {
        let mut state = TransferState::Init;
        let result = self.run(source, destination, &mut state).await;
        if let Err(error) = &result {
            warn!(state = ?state, error = %error, "Download failed");
            state.enter(TransferState::Failed);
        }
        result
    }

    async fn run(
        &self,
        source: &ObjectLocation,
        destination: &Path,
        state: &mut TransferState,
    ) -> Result<DownloadOutcome> {
        let destination = canonical_path(destination)?;
        let destination_id = destination.display().to_string();
        let source_id = source.to_string();
        let fingerprint = fingerprint(&destination_id, &source_id, Some(&destination))?;

        state.enter(TransferState::Validating);
        let meta = self
            .transport
            .head(source)
            .await
            .map_err(|e| TransferError::transport("head", e))?;

        let store = self.options.resolve_checkpoint_store()?;
        let threshold = self.options.threshold.unwrap_or(DEFAULT_MULTIGET_THRESHOLD);
        if meta.size < threshold {
            debug!(size = meta.size, threshold, "Below multiget threshold, single GET");
            self.discard_stale_record(&store, &fingerprint, &destination)
                .await?;
            return self
                .download_whole(source, &destination, &meta, &fingerprint, state)
                .await;
        }

        let identity = meta.identity();
        let part_size = determine_part_size(meta.size, self.options.part_size, &self.options.limits);

        let existing = self
            .load_record(&store, &fingerprint, &identity, part_size, &destination)
            .await?;
        let resumed = existing.is_some();
        let record = match existing {
            Some(record) => {
                state.enter(TransferState::Resuming);
                record
            }
            None => {
                state.enter(TransferState::Fresh);
                let record =
                    TransferRecord::new_download(source_id, destination_id, identity, part_size);
                let temp_path = staging_path(&record, &destination)?;
                if let Some(parent) = destination.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let file = tokio::fs::File::create(&temp_path).await?;
                file.set_len(meta.size).await?;
                store.put(&fingerprint, &record)?;
                record
            }
        };

        let plan = record.plan()?;
        let pending = record.pending_parts(&plan);
        info!(
            fingerprint = %fingerprint,
            size = meta.size,
            part_size,
            parts = plan.len(),
            pending = pending.len(),
            resumed,
            "Starting download"
        );

        let progress = ProgressTracker::new(
            meta.size,
            record.completed_bytes(),
            self.options.progress.clone(),
        );
        progress.start();

        let ctx = Arc::new(PartContext {
            transport: Arc::clone(&self.transport),
            source: source.clone(),
            identity: record.identity.clone(),
            temp_path: staging_path(&record, &destination)?,
            fingerprint: fingerprint.clone(),
            store: Arc::clone(&store),
            record: Mutex::new(record),
            progress,
            part_timeout: self.options.part_timeout,
        });

        state.enter(TransferState::Transferring);
        let worker_ctx = Arc::clone(&ctx);
        let report = PartWorkerPool::new(self.options.concurrency)
            .run(pending, &self.options.cancel, move |part| {
                let ctx = Arc::clone(&worker_ctx);
                async move { ctx.fetch_part(part).await }
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
        let record = lock(&ctx.record).clone();
        let crc64 = self
            .finalize(source, &destination, &ctx.temp_path, &record, &store, &fingerprint)
            .await?;

        state.enter(TransferState::Done);
        info!(fingerprint = %fingerprint, parts_transferred, "Download complete");

        Ok(DownloadOutcome {
            path: destination,
            bytes: meta.size,
            parts_total: plan.len(),
            parts_transferred,
            resumed,
            crc64,
        })
    }

    /// Load the checkpoint for this transfer and decide whether it can resume
    async fn load_record(
        &self,
        store: &CheckpointStore,
        fingerprint: &str,
        identity: &ObjectIdentity,
        part_size: u64,
        destination: &Path,
    ) -> Result<Option<TransferRecord>> {
        let Some(record) = store.get(fingerprint)? else {
            return Ok(None);
        };
        if record.kind != TransferKind::Download {
            warn!(fingerprint, kind = ?record.kind, "Discarding checkpoint record of another kind");
            store.delete(fingerprint)?;
            return Ok(None);
        }
        let temp_path = record.temp_path(destination);

        let (reason, remove_temp) = if record.identity != *identity {
            ("remote object changed since the checkpoint", true)
        } else if record.part_size != part_size {
            ("part size changed", false)
        } else if let Some(temp_path) = &temp_path {
            match tokio::fs::metadata(temp_path).await {
                Ok(m) if m.len() == identity.size => {
                    info!(
                        fingerprint,
                        completed = record.parts.len(),
                        "Resuming download from checkpoint"
                    );
                    return Ok(Some(record));
                }
                Ok(_) => ("staging file has unexpected length", false),
                Err(e) if e.kind() == io::ErrorKind::NotFound => ("staging file missing", false),
                Err(e) => return Err(e.into()),
            }
        } else {
            ("record has no staging file", false)
        };

        warn!(
            fingerprint,
            reason,
            recorded = %record.identity,
            current = %identity,
            "Discarding checkpoint record"
        );
        if let (true, Some(temp_path)) = (remove_temp, &temp_path) {
            remove_quietly(temp_path).await;
        }
        store.delete(fingerprint)?;
        Ok(None)
    }

    /// Drop a checkpoint left behind by an earlier multipart attempt
    ///
    /// Used when the object is now fetched with a single GET, so the record
    /// and its staging file would otherwise never be reclaimed.
    async fn discard_stale_record(
        &self,
        store: &CheckpointStore,
        fingerprint: &str,
        destination: &Path,
    ) -> Result<()> {
        let Some(record) = store.get(fingerprint)? else {
            return Ok(());
        };
        warn!(fingerprint, "Discarding checkpoint record, object is below the multiget threshold");
        if record.kind == TransferKind::Download {
            if let Some(temp_path) = record.temp_path(destination) {
                remove_quietly(&temp_path).await;
            }
        }
        store.delete(fingerprint)?;
        Ok(())
    }

    async fn finalize(
        &self,
        source: &ObjectLocation,
        destination: &Path,
        temp_path: &Path,
        record: &TransferRecord,
        store: &CheckpointStore,
        fingerprint: &str,
    ) -> Result<Option<u64>> {
        let current = self
            .transport
            .head(source)
            .await
            .map_err(|e| TransferError::transport("head", e))?;
        if current.identity() != record.identity {
            return Err(TransferError::RemoteChanged {
                fingerprint: fingerprint.to_string(),
                expected: record.identity.clone(),
                detail: format!("found {}", current.identity()),
            });
        }

        let crc64 = combine_part_crcs(&record.sorted_parts());
        if let Some(failure) = self.check_object_crc(current.crc64, crc64) {
            // the staged bytes are wrong; keeping them would only resume into the same result
            remove_quietly(temp_path).await;
            store.delete(fingerprint)?;
            return Err(TransferError::integrity(fingerprint, failure));
        }

        tokio::fs::rename(temp_path, destination)
            .await
            .map_err(|e| TransferError::Finalization {
                fingerprint: fingerprint.to_string(),
                message: format!(
                    "rename {} -> {}: {}",
                    temp_path.display(),
                    destination.display(),
                    e
                ),
            })?;

        if let Err(e) = store.delete(fingerprint) {
            warn!(fingerprint, error = %e, "Download complete but checkpoint removal failed");
        }
        Ok(crc64)
    }

    fn check_object_crc(&self, expected: Option<u64>, actual: Option<u64>) -> Option<IntegrityFailure> {
        match (self.options.verify_crc, expected, actual) {
            (true, Some(expected), Some(actual)) if expected != actual => {
                Some(IntegrityFailure::ObjectChecksum { expected, actual })
            }
            _ => None,
        }
    }

    /// Objects below the multiget threshold: one GET, no checkpoint
    async fn download_whole(
        &self,
        source: &ObjectLocation,
        destination: &Path,
        meta: &ObjectMeta,
        fingerprint: &str,
        state: &mut TransferState,
    ) -> Result<DownloadOutcome> {
        state.enter(TransferState::Fresh);
        let mut name = destination.as_os_str().to_owned();
        name.push(new_temp_suffix());
        let temp_path = PathBuf::from(name);

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let progress = ProgressTracker::new(meta.size, 0, self.options.progress.clone());
        progress.start();

        state.enter(TransferState::Transferring);
        let fetched = self
            .fetch_whole(source, meta, &temp_path, fingerprint)
            .await;
        let crc64 = match fetched {
            Ok(crc64) => crc64,
            Err(error) => {
                remove_quietly(&temp_path).await;
                return Err(error);
            }
        };
        progress.advance(meta.size);

        state.enter(TransferState::Finalizing);
        if let Some(failure) = self.check_object_crc(meta.crc64, Some(crc64)) {
            remove_quietly(&temp_path).await;
            return Err(TransferError::integrity(fingerprint, failure));
        }
        if let Err(e) = tokio::fs::rename(&temp_path, destination).await {
            remove_quietly(&temp_path).await;
            return Err(TransferError::Finalization {
                fingerprint: fingerprint.to_string(),
                message: format!("rename to {}: {}", destination.display(), e),
            });
        }

        state.enter(TransferState::Done);
        Ok(DownloadOutcome {
            path: destination.to_path_buf(),
            bytes: meta.size,
            parts_total: 1,
            parts_transferred: 1,
            resumed: false,
            crc64: Some(crc64),
        })
    }

    async fn fetch_whole(
        &self,
        source: &ObjectLocation,
        meta: &ObjectMeta,
        temp_path: &Path,
        fingerprint: &str,
    ) -> Result<u64> {
        let mut body = self
            .transport
            .get(source, None, Some(&meta.etag))
            .await
            .map_err(|e| match e {
                TransportError::PreconditionFailed(detail) => TransferError::RemoteChanged {
                    fingerprint: fingerprint.to_string(),
                    expected: meta.identity(),
                    detail,
                },
                other => TransferError::transport("get", other),
            })?;

        let mut file = tokio::fs::File::create(temp_path).await?;
        let mut hasher = Crc64::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| TransferError::transport("get", e))?;
            file.write_all(&chunk).await?;
            hasher.update(&chunk);
        }
        file.flush().await?;
        file.sync_data().await?;

        if hasher.len() != meta.size {
            return Err(TransferError::integrity(
                fingerprint,
                IntegrityFailure::IncompletePart {
                    part_number: 1,
                    expected: meta.size,
                    actual: hasher.len(),
                },
            ));
        }
        Ok(hasher.finish())
    }
}

fn staging_path(record: &TransferRecord, destination: &Path) -> Result<PathBuf> {
    record.temp_path(destination).ok_or_else(|| {
        TransferError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            "download record has no temp suffix",
        ))
    })
}

/// State shared by the workers of one download
struct PartContext {
    transport: Arc<dyn Transport>,
    source: ObjectLocation,
    identity: ObjectIdentity,
    temp_path: PathBuf,
    fingerprint: String,
    store: Arc<CheckpointStore>,
    record: Mutex<TransferRecord>,
    progress: ProgressTracker,
    part_timeout: Option<Duration>,
}

impl PartContext {
    async fn fetch_part(&self, part: Part) -> Result<()> {
        let crc64 = match self.part_timeout {
            Some(limit) => tokio::time::timeout(limit, self.write_part(part))
                .await
                .map_err(|_| TransferError::PartTransfer {
                    fingerprint: self.fingerprint.clone(),
                    part_number: part.part_number,
                    source: TransportError::Timeout(format!("no response within {:?}", limit)),
                })??,
            None => self.write_part(part).await?,
        };

        {
            let mut record = lock(&self.record);
            record.record_part(CompletedPart::from_part(&part, None, Some(crc64)));
            self.store.put(&self.fingerprint, &record)?;
        }
        self.progress.advance(part.len());
        debug!(part_number = part.part_number, bytes = part.len(), "Part downloaded");
        Ok(())
    }

    async fn write_part(&self, part: Part) -> Result<u64> {
        if part.is_empty() {
            return Ok(Crc64::new().finish());
        }

        let etag = self.identity.etag.as_deref();
        let mut body = self
            .transport
            .get(&self.source, Some(part.range()), etag)
            .await
            .map_err(|e| self.classify(&part, e))?;

        let mut file = OpenOptions::new().write(true).open(&self.temp_path).await?;
        file.seek(SeekFrom::Start(part.start)).await?;

        let mut hasher = Crc64::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| self.classify(&part, e))?;
            let received = hasher.len() + chunk.len() as u64;
            if received > part.len() {
                return Err(self.incomplete(&part, received));
            }
            file.write_all(&chunk).await?;
            hasher.update(&chunk);
        }
        file.flush().await?;
        file.sync_data().await?;

        if hasher.len() != part.len() {
            return Err(self.incomplete(&part, hasher.len()));
        }
        Ok(hasher.finish())
    }

    fn classify(&self, part: &Part, error: TransportError) -> TransferError {
        match error {
            TransportError::PreconditionFailed(detail) => TransferError::RemoteChanged {
                fingerprint: self.fingerprint.clone(),
                expected: self.identity.clone(),
                detail: format!("part {} read rejected: {}", part.part_number, detail),
            },
            source => TransferError::PartTransfer {
                fingerprint: self.fingerprint.clone(),
                part_number: part.part_number,
                source,
            },
        }
    }

    fn incomplete(&self, part: &Part, actual: u64) -> TransferError {
        TransferError::integrity(
            self.fingerprint.clone(),
            IntegrityFailure::IncompletePart {
                part_number: part.part_number,
                expected: part.len(),
                actual,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::init_test_logging;
    use crate::transport::{FaultPlan, MemoryTransport};
    use tempfile::tempdir;

    fn options(store: &Arc<CheckpointStore>) -> TransferOptions {
        TransferOptions::default()
            .with_threshold(0)
            .with_part_size(500)
            .with_limits(crate::config::PartLimits {
                min_part_size: 100,
                ..Default::default()
            })
            .with_concurrency(3)
            .with_checkpoint_store(Arc::clone(store))
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_download_in_parts() {
        init_test_logging();
        let dir = tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let location = ObjectLocation::new("bucket", "obj");
        transport.put_fixture(&location, payload(5130));

        let store = Arc::new(CheckpointStore::in_memory());
        let downloader = ResumableDownloader::new(transport.clone(), options(&store)).unwrap();
        let dest = dir.path().join("out.bin");

        let outcome = downloader.download(&location, &dest).await.unwrap();
        assert_eq!(outcome.parts_total, 11);
        assert_eq!(outcome.parts_transferred, 11);
        assert!(!outcome.resumed);
        assert_eq!(outcome.crc64, Some(Crc64::checksum(&payload(5130))));
        assert_eq!(std::fs::read(&dest).unwrap(), payload(5130));
        assert_eq!(transport.range_gets(), 11);
        assert!(store.backend().keys().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_truncated_part_is_integrity_error() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let location = ObjectLocation::new("bucket", "obj");
        transport.put_fixture(&location, payload(1500));
        transport.set_faults(FaultPlan::new().truncate_get_at(500, 120));

        let store = Arc::new(CheckpointStore::in_memory());
        let downloader = ResumableDownloader::new(
            transport.clone(),
            options(&store).with_concurrency(1),
        )
        .unwrap();

        let err = downloader
            .download(&location, &dir.path().join("out.bin"))
            .await
            .unwrap_err();
        match err {
            TransferError::Integrity {
                failure:
                    IntegrityFailure::IncompletePart {
                        part_number,
                        expected,
                        actual,
                    },
                ..
            } => assert_eq!((part_number, expected, actual), (2, 500, 120)),
            other => panic!("unexpected error: {other}"),
        }

        // part 1 stays recorded, part 2 does not
        let key = store.backend().keys().unwrap().pop().unwrap();
        let record = store.get(&key).unwrap().unwrap();
        assert!(record.is_part_done(1));
        assert!(!record.is_part_done(2));
    }

    #[tokio::test]
    async fn test_object_crc_mismatch_discards_progress() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let location = ObjectLocation::new("bucket", "obj");
        transport.put_fixture(&location, payload(1000));
        transport.set_faults(FaultPlan::new().corrupt_get_at(500));

        let store = Arc::new(CheckpointStore::in_memory());
        let downloader = ResumableDownloader::new(transport.clone(), options(&store)).unwrap();
        let dest = dir.path().join("out.bin");

        let err = downloader.download(&location, &dest).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::Integrity {
                failure: IntegrityFailure::ObjectChecksum { .. },
                ..
            }
        ));
        assert!(!dest.exists());
        assert!(store.backend().keys().unwrap().is_empty());

        // the corruption fired once; a retry downloads cleanly from scratch
        let outcome = downloader.download(&location, &dest).await.unwrap();
        assert!(!outcome.resumed);
        assert_eq!(std::fs::read(&dest).unwrap(), payload(1000));
    }

    #[tokio::test]
    async fn test_crc_verification_can_be_disabled() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let location = ObjectLocation::new("bucket", "obj");
        transport.put_fixture(&location, payload(1000));
        transport.set_faults(FaultPlan::new().corrupt_get_at(0));

        let store = Arc::new(CheckpointStore::in_memory());
        let downloader = ResumableDownloader::new(
            transport.clone(),
            options(&store).with_verify_crc(false),
        )
        .unwrap();

        let dest = dir.path().join("out.bin");
        downloader.download(&location, &dest).await.unwrap();
        assert_ne!(std::fs::read(&dest).unwrap(), payload(1000));
    }

    #[tokio::test]
    async fn test_small_object_single_get() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let location = ObjectLocation::new("bucket", "small");
        transport.put_fixture(&location, payload(300));

        let store = Arc::new(CheckpointStore::in_memory());
        let downloader = ResumableDownloader::new(
            transport.clone(),
            options(&store).with_threshold(1024),
        )
        .unwrap();

        let dest = dir.path().join("nested").join("small.bin");
        let outcome = downloader.download(&location, &dest).await.unwrap();
        assert_eq!(outcome.parts_total, 1);
        assert_eq!(std::fs::read(&dest).unwrap(), payload(300));
        assert_eq!(transport.full_gets(), 1);
        assert_eq!(transport.range_gets(), 0);
        assert!(store.backend().keys().unwrap().is_empty());
    }

    fn download_fingerprint(location: &ObjectLocation, dest: &Path) -> String {
        let dest = canonical_path(dest).unwrap();
        fingerprint(&dest.display().to_string(), &location.to_string(), Some(&dest)).unwrap()
    }

    #[tokio::test]
    async fn test_upload_record_under_download_key_is_replaced() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let location = ObjectLocation::new("bucket", "obj");
        transport.put_fixture(&location, payload(1500));

        let store = Arc::new(CheckpointStore::in_memory());
        let dest = dir.path().join("out.bin");
        let key = download_fingerprint(&location, &dest);
        let identity = ObjectIdentity {
            size: 1500,
            mtime: 0,
            etag: None,
        };
        store
            .put(&key, &TransferRecord::new_upload("src", "dst", identity, 500, "upload-1"))
            .unwrap();

        let downloader = ResumableDownloader::new(transport.clone(), options(&store)).unwrap();
        let outcome = downloader.download(&location, &dest).await.unwrap();
        assert!(!outcome.resumed);
        assert_eq!(outcome.parts_transferred, 3);
        assert_eq!(std::fs::read(&dest).unwrap(), payload(1500));
        assert!(store.backend().keys().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_get_discards_stale_multipart_checkpoint() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let location = ObjectLocation::new("bucket", "obj");
        transport.put_fixture(&location, payload(1500));
        transport.set_faults(FaultPlan::new().fail_get_at(1000));

        let store = Arc::new(CheckpointStore::in_memory());
        let dest = dir.path().join("out.bin");
        let first = ResumableDownloader::new(
            transport.clone(),
            options(&store).with_concurrency(1),
        )
        .unwrap();
        first.download(&location, &dest).await.unwrap_err();
        let key = store.backend().keys().unwrap().pop().unwrap();
        let staging = store.get(&key).unwrap().unwrap().temp_path(&dest).unwrap();
        assert!(staging.exists());

        transport.set_faults(FaultPlan::new());
        let second = ResumableDownloader::new(
            transport.clone(),
            options(&store).with_threshold(4096),
        )
        .unwrap();
        let outcome = second.download(&location, &dest).await.unwrap();
        assert_eq!(outcome.parts_total, 1);
        assert_eq!(std::fs::read(&dest).unwrap(), payload(1500));
        assert!(store.backend().keys().unwrap().is_empty());
        assert!(!staging.exists());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty(), "staging files left: {leftovers:?}");
    }

    #[tokio::test]
    async fn test_empty_object() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let location = ObjectLocation::new("bucket", "empty");
        transport.put_fixture(&location, Vec::new());

        let store = Arc::new(CheckpointStore::in_memory());
        let downloader = ResumableDownloader::new(transport.clone(), options(&store)).unwrap();

        let dest = dir.path().join("empty.bin");
        let outcome = downloader.download(&location, &dest).await.unwrap();
        assert_eq!(outcome.parts_total, 1);
        assert_eq!(outcome.crc64, Some(0));
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);
        assert_eq!(transport.range_gets(), 0);
    }

    #[tokio::test]
    async fn test_missing_object() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let store = Arc::new(CheckpointStore::in_memory());
        let downloader = ResumableDownloader::new(transport, options(&store)).unwrap();

        let err = downloader
            .download(&ObjectLocation::new("bucket", "nope"), &dir.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Transport {
                source: TransportError::NotFound(_),
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_part_timeout() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let location = ObjectLocation::new("bucket", "slow");
        transport.put_fixture(&location, payload(1000));
        transport.set_faults(FaultPlan::new().with_latency(Duration::from_secs(60)));

        let store = Arc::new(CheckpointStore::in_memory());
        let downloader = ResumableDownloader::new(
            transport,
            options(&store).with_part_timeout(Duration::from_secs(5)),
        )
        .unwrap();

        let err = downloader
            .download(&location, &dir.path().join("slow.bin"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::PartTransfer {
                source: TransportError::Timeout(_),
                ..
            }
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancelled_download_keeps_checkpoint() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let location = ObjectLocation::new("bucket", "obj");
        transport.put_fixture(&location, payload(1000));

        let store = Arc::new(CheckpointStore::in_memory());
        let cancel = tokio_util::sync::CancellationToken::new();
        cancel.cancel();
        let downloader = ResumableDownloader::new(
            transport.clone(),
            options(&store).with_cancellation(cancel),
        )
        .unwrap();

        let dest = dir.path().join("out.bin");
        let err = downloader.download(&location, &dest).await.unwrap_err();
        assert!(matches!(err, TransferError::Cancelled { remaining: 2, .. }));
        assert_eq!(store.backend().keys().unwrap().len(), 1);

        let resumed = ResumableDownloader::new(transport, options(&store))
            .unwrap()
            .download(&location, &dest)
            .await
            .unwrap();
        assert!(resumed.resumed);
        assert_eq!(std::fs::read(&dest).unwrap(), payload(1000));
    }
}
