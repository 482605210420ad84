//! In-memory transport for testing
//!
//! Holds objects and multipart uploads in process memory and can inject
//! faults at precise points: a ranged GET at a given offset, an upload of a
//! given part number, the commit, or a change of the object between GETs.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream;
use ossx_core_crc::Crc64;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{
    BodyStream, CommitResult, ListedPart, ObjectLocation, ObjectMeta, PartTag, Transport,
    TransportError, TransportResult, UploadedPart,
};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
    mtime: i64,
    crc64: u64,
}

#[derive(Debug)]
struct PendingUpload {
    location: ObjectLocation,
    parts: BTreeMap<u32, (Bytes, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Times(u32),
    Always,
}

impl Trigger {
    /// Consume one firing; returns whether the fault applies now
    fn fire(&mut self) -> bool {
        match self {
            Trigger::Always => true,
            Trigger::Times(0) => false,
            Trigger::Times(n) => {
                *n -= 1;
                true
            }
        }
    }
}

/// Faults to inject into a [`MemoryTransport`]
///
/// GET faults are keyed by the start offset of the requested range, upload
/// faults by part number.
///
/// # Example
///
/// ```
/// use ossx::transport::FaultPlan;
///
/// // Part 7 of a 500-byte plan fails once, part 3 uploads fail every time
/// let plan = FaultPlan::new().fail_get_at(3000).fail_part_always(3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    get_failures: HashMap<u64, Trigger>,
    get_truncations: HashMap<u64, u64>,
    get_corruptions: HashMap<u64, Trigger>,
    part_failures: HashMap<u32, Trigger>,
    complete_failures: u32,
    replace_after_gets: Option<(ObjectLocation, usize, Bytes)>,
    latency: Option<Duration>,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next ranged GET starting at `offset` fails with a network error
    pub fn fail_get_at(mut self, offset: u64) -> Self {
        self.get_failures.insert(offset, Trigger::Times(1));
        self
    }

    pub fn fail_get_at_always(mut self, offset: u64) -> Self {
        self.get_failures.insert(offset, Trigger::Always);
        self
    }

    /// Ranged GETs starting at `offset` deliver at most `deliver` bytes
    pub fn truncate_get_at(mut self, offset: u64, deliver: u64) -> Self {
        self.get_truncations.insert(offset, deliver);
        self
    }

    /// The next ranged GET starting at `offset` has its first byte flipped
    pub fn corrupt_get_at(mut self, offset: u64) -> Self {
        self.get_corruptions.insert(offset, Trigger::Times(1));
        self
    }

    /// The next upload of `part_number` fails with a network error
    pub fn fail_part(mut self, part_number: u32) -> Self {
        self.part_failures.insert(part_number, Trigger::Times(1));
        self
    }

    pub fn fail_part_always(mut self, part_number: u32) -> Self {
        self.part_failures.insert(part_number, Trigger::Always);
        self
    }

    /// The next `times` commits fail with a 500
    pub fn fail_complete(mut self, times: u32) -> Self {
        self.complete_failures = times;
        self
    }

    /// Overwrite `location` with `data` right after the `n`-th ranged GET
    pub fn replace_after_gets(mut self, location: ObjectLocation, n: usize, data: Bytes) -> Self {
        self.replace_after_gets = Some((location, n, data));
        self
    }

    /// Delay every GET and part upload
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: HashMap<ObjectLocation, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    faults: FaultPlan,
    clock: i64,
    next_upload: u64,
}

impl MemoryState {
    fn store(&mut self, location: &ObjectLocation, data: Bytes, etag: Option<String>) -> StoredObject {
        self.clock += 1;
        let crc64 = Crc64::checksum(&data);
        let object = StoredObject {
            etag: etag.unwrap_or_else(|| format!("\"{:016X}\"", crc64)),
            data,
            mtime: 1_700_000_000 + self.clock,
            crc64,
        };
        self.objects.insert(location.clone(), object.clone());
        object
    }
}

/// In-process object store implementing [`Transport`]
#[derive(Debug)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    range_gets: AtomicUsize,
    full_gets: AtomicUsize,
    part_uploads: AtomicUsize,
    completes: AtomicUsize,
    aborts: AtomicUsize,
    report_crc: AtomicBool,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            range_gets: AtomicUsize::new(0),
            full_gets: AtomicUsize::new(0),
            part_uploads: AtomicUsize::new(0),
            completes: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            report_crc: AtomicBool::new(true),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or overwrite an object; returns its new metadata
    pub fn put_fixture(&self, location: &ObjectLocation, data: impl Into<Bytes>) -> ObjectMeta {
        let object = self.state().store(location, data.into(), None);
        self.meta_of(&object)
    }

    pub fn object(&self, location: &ObjectLocation) -> Option<Bytes> {
        self.state().objects.get(location).map(|o| o.data.clone())
    }

    pub fn set_faults(&self, faults: FaultPlan) {
        self.state().faults = faults;
    }

    /// Whether HEAD and part uploads report CRC-64 values
    pub fn set_crc_reporting(&self, enabled: bool) {
        self.report_crc.store(enabled, Ordering::SeqCst);
    }

    pub fn range_gets(&self) -> usize {
        self.range_gets.load(Ordering::SeqCst)
    }

    pub fn full_gets(&self) -> usize {
        self.full_gets.load(Ordering::SeqCst)
    }

    pub fn part_uploads(&self) -> usize {
        self.part_uploads.load(Ordering::SeqCst)
    }

    pub fn completes(&self) -> usize {
        self.completes.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    /// Ids of multipart uploads neither completed nor aborted
    pub fn active_uploads(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state().uploads.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn meta_of(&self, object: &StoredObject) -> ObjectMeta {
        ObjectMeta {
            size: object.data.len() as u64,
            mtime: object.mtime,
            etag: object.etag.clone(),
            crc64: self.report_crc.load(Ordering::SeqCst).then_some(object.crc64),
        }
    }

    async fn delay(&self) {
        let latency = self.state().faults.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn injected(what: String) -> TransportError {
    TransportError::Network(format!("injected failure: {}", what))
}

fn into_body(data: Bytes) -> BodyStream {
    // two chunks so consumers exercise their streaming path
    let mid = data.len() / 2;
    let chunks = if mid == 0 {
        vec![Ok(data)]
    } else {
        vec![Ok(data.slice(..mid)), Ok(data.slice(mid..))]
    };
    Box::pin(stream::iter(chunks))
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn head(&self, location: &ObjectLocation) -> TransportResult<ObjectMeta> {
        let state = self.state();
        let object = state
            .objects
            .get(location)
            .ok_or_else(|| TransportError::NotFound(location.to_string()))?;
        Ok(self.meta_of(object))
    }

    async fn get(
        &self,
        location: &ObjectLocation,
        range: Option<Range<u64>>,
        if_match: Option<&str>,
    ) -> TransportResult<BodyStream> {
        self.delay().await;

        let body = {
            let mut state = self.state();
            let object = state
                .objects
                .get(location)
                .cloned()
                .ok_or_else(|| TransportError::NotFound(location.to_string()))?;

            if let Some(expected) = if_match {
                if expected != object.etag {
                    return Err(TransportError::PreconditionFailed(format!(
                        "{}: If-Match {} but current etag is {}",
                        location, expected, object.etag
                    )));
                }
            }

            let size = object.data.len() as u64;
            let Some(range) = range else {
                self.full_gets.fetch_add(1, Ordering::SeqCst);
                return Ok(into_body(object.data));
            };

            let gets = self.range_gets.fetch_add(1, Ordering::SeqCst) + 1;
            if range.start > range.end || range.end > size {
                return Err(TransportError::Status {
                    status: 416,
                    code: "InvalidRange".to_string(),
                    message: format!("{}..{} outside 0..{}", range.start, range.end, size),
                    request_id: None,
                });
            }

            if let Some(trigger) = state.faults.get_failures.get_mut(&range.start) {
                if trigger.fire() {
                    return Err(injected(format!("GET {} at {}", location, range.start)));
                }
            }

            let mut body = object.data.slice(range.start as usize..range.end as usize);
            if let Some(&deliver) = state.faults.get_truncations.get(&range.start) {
                body = body.slice(..(deliver as usize).min(body.len()));
            }
            let corrupt = state
                .faults
                .get_corruptions
                .get_mut(&range.start)
                .is_some_and(Trigger::fire);
            if corrupt && !body.is_empty() {
                let mut flipped = BytesMut::from(&body[..]);
                flipped[0] ^= 0xFF;
                body = flipped.freeze();
            }

            let replace = match &state.faults.replace_after_gets {
                Some((target, n, data)) if target == location && *n == gets => Some(data.clone()),
                _ => None,
            };
            if let Some(data) = replace {
                state.store(location, data, None);
            }

            body
        };

        Ok(into_body(body))
    }

    async fn put_object(
        &self,
        location: &ObjectLocation,
        body: Bytes,
    ) -> TransportResult<CommitResult> {
        let object = self.state().store(location, body, None);
        Ok(CommitResult {
            etag: object.etag,
            crc64: self.report_crc.load(Ordering::SeqCst).then_some(object.crc64),
        })
    }

    async fn initiate_multipart(&self, location: &ObjectLocation) -> TransportResult<String> {
        let mut state = self.state();
        state.next_upload += 1;
        let upload_id = format!("upload-{:04}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                location: location.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> TransportResult<UploadedPart> {
        self.delay().await;
        self.part_uploads.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state();
        if let Some(trigger) = state.faults.part_failures.get_mut(&part_number) {
            if trigger.fire() {
                return Err(injected(format!("upload of part {}", part_number)));
            }
        }

        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|u| &u.location == location)
            .ok_or_else(|| TransportError::NoSuchUpload(upload_id.to_string()))?;

        let crc64 = Crc64::checksum(&body);
        let etag = format!("\"{:016X}\"", crc64);
        upload.parts.insert(part_number, (body, etag.clone()));

        Ok(UploadedPart {
            etag,
            crc64: self.report_crc.load(Ordering::SeqCst).then_some(crc64),
        })
    }

    async fn list_parts(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
    ) -> TransportResult<Vec<ListedPart>> {
        let state = self.state();
        let upload = state
            .uploads
            .get(upload_id)
            .filter(|u| &u.location == location)
            .ok_or_else(|| TransportError::NoSuchUpload(upload_id.to_string()))?;

        Ok(upload
            .parts
            .iter()
            .map(|(&part_number, (data, etag))| ListedPart {
                part_number,
                etag: etag.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    async fn complete_multipart(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
        parts: &[PartTag],
    ) -> TransportResult<CommitResult> {
        let mut state = self.state();
        if state.faults.complete_failures > 0 {
            state.faults.complete_failures -= 1;
            return Err(TransportError::Status {
                status: 500,
                code: "InternalError".to_string(),
                message: "injected commit failure".to_string(),
                request_id: Some(format!("req-{}", upload_id)),
            });
        }

        let upload = state
            .uploads
            .get(upload_id)
            .filter(|u| &u.location == location)
            .ok_or_else(|| TransportError::NoSuchUpload(upload_id.to_string()))?;

        let invalid = |code: &str, message: String| TransportError::Status {
            status: 400,
            code: code.to_string(),
            message,
            request_id: None,
        };

        if parts.is_empty() {
            return Err(invalid("MalformedXML", "no parts".to_string()));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(invalid(
                "InvalidPartOrder",
                "parts must be in ascending order".to_string(),
            ));
        }

        let mut data = BytesMut::new();
        for tag in parts {
            match upload.parts.get(&tag.part_number) {
                Some((bytes, etag)) if *etag == tag.etag => data.extend_from_slice(bytes),
                _ => {
                    return Err(invalid(
                        "InvalidPart",
                        format!("part {} with etag {}", tag.part_number, tag.etag),
                    ))
                }
            }
        }

        let data = data.freeze();
        let etag = format!("\"{:016X}-{}\"", Crc64::checksum(&data), parts.len());
        let object = state.store(location, data, Some(etag));
        state.uploads.remove(upload_id);
        self.completes.fetch_add(1, Ordering::SeqCst);

        Ok(CommitResult {
            etag: object.etag,
            crc64: self.report_crc.load(Ordering::SeqCst).then_some(object.crc64),
        })
    }

    async fn abort_multipart(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
    ) -> TransportResult<()> {
        let mut state = self.state();
        match state.uploads.get(upload_id) {
            Some(upload) if &upload.location == location => {
                state.uploads.remove(upload_id);
                self.aborts.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(TransportError::NoSuchUpload(upload_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn collect(body: BodyStream) -> Vec<u8> {
        body.try_fold(Vec::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await
        .unwrap()
    }

    fn loc() -> ObjectLocation {
        ObjectLocation::new("bucket", "object.bin")
    }

    #[tokio::test]
    async fn test_head_and_ranged_get() {
        let transport = MemoryTransport::new();
        let meta = transport.put_fixture(&loc(), &b"0123456789"[..]);
        assert_eq!(meta.size, 10);
        assert_eq!(meta.crc64, Some(Crc64::checksum(b"0123456789")));

        let body = transport
            .get(&loc(), Some(2..6), Some(&meta.etag))
            .await
            .unwrap();
        assert_eq!(collect(body).await, b"2345");
        assert_eq!(transport.range_gets(), 1);

        let whole = transport.get(&loc(), None, None).await.unwrap();
        assert_eq!(collect(whole).await, b"0123456789");
        assert_eq!(transport.full_gets(), 1);
    }

    #[tokio::test]
    async fn test_if_match_mismatch() {
        let transport = MemoryTransport::new();
        transport.put_fixture(&loc(), &b"abc"[..]);
        let err = transport
            .get(&loc(), Some(0..1), Some("\"stale\""))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn test_get_faults() {
        let transport = MemoryTransport::new();
        transport.put_fixture(&loc(), vec![7u8; 100]);
        transport.set_faults(FaultPlan::new().fail_get_at(50).truncate_get_at(0, 10));

        assert!(transport.get(&loc(), Some(50..100), None).await.is_err());
        assert!(transport.get(&loc(), Some(50..100), None).await.is_ok());

        let short = transport.get(&loc(), Some(0..50), None).await.unwrap();
        assert_eq!(collect(short).await.len(), 10);
    }

    #[tokio::test]
    async fn test_replace_after_gets() {
        let transport = MemoryTransport::new();
        let before = transport.put_fixture(&loc(), vec![1u8; 10]);
        transport.set_faults(FaultPlan::new().replace_after_gets(loc(), 1, Bytes::from(vec![2u8; 12])));

        transport.get(&loc(), Some(0..5), None).await.unwrap();
        let after = transport.head(&loc()).await.unwrap();
        assert_eq!(after.size, 12);
        assert_ne!(after.etag, before.etag);
        assert_ne!(after.mtime, before.mtime);
    }

    #[tokio::test]
    async fn test_multipart_lifecycle() {
        let transport = MemoryTransport::new();
        let id = transport.initiate_multipart(&loc()).await.unwrap();

        let p2 = transport
            .upload_part(&loc(), &id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let p1 = transport
            .upload_part(&loc(), &id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();

        let listed = transport.list_parts(&loc(), &id).await.unwrap();
        assert_eq!(listed.iter().map(|p| p.part_number).collect::<Vec<_>>(), vec![1, 2]);

        let out_of_order = [
            PartTag { part_number: 2, etag: p2.etag.clone() },
            PartTag { part_number: 1, etag: p1.etag.clone() },
        ];
        assert!(transport.complete_multipart(&loc(), &id, &out_of_order).await.is_err());

        let ordered = [
            PartTag { part_number: 1, etag: p1.etag },
            PartTag { part_number: 2, etag: p2.etag },
        ];
        let result = transport.complete_multipart(&loc(), &id, &ordered).await.unwrap();
        assert_eq!(result.crc64, Some(Crc64::checksum(b"hello world")));
        assert_eq!(transport.object(&loc()).unwrap(), Bytes::from_static(b"hello world"));
        assert!(transport.active_uploads().is_empty());

        let err = transport.list_parts(&loc(), &id).await.unwrap_err();
        assert!(matches!(err, TransportError::NoSuchUpload(_)));
    }

    #[tokio::test]
    async fn test_abort_and_part_faults() {
        let transport = MemoryTransport::new();
        transport.set_faults(FaultPlan::new().fail_part(1).fail_complete(1));
        let id = transport.initiate_multipart(&loc()).await.unwrap();

        assert!(transport.upload_part(&loc(), &id, 1, Bytes::new()).await.is_err());
        let part = transport.upload_part(&loc(), &id, 1, Bytes::new()).await.unwrap();
        assert_eq!(transport.part_uploads(), 2);

        let tags = [PartTag { part_number: 1, etag: part.etag }];
        assert!(transport.complete_multipart(&loc(), &id, &tags).await.is_err());

        transport.abort_multipart(&loc(), &id).await.unwrap();
        assert_eq!(transport.aborts(), 1);
        assert!(transport.abort_multipart(&loc(), &id).await.is_err());
    }
}
