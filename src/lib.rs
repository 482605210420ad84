/*!
 * ossx - resumable multipart transfers for object storage
 *
 * Large objects are split into parts and moved concurrently over a bounded
 * worker pool. Progress is persisted to a checkpoint record after every part,
 * so an interrupted transfer picks up from the last acknowledged part instead
 * of starting over. Integrity is checked end to end with CRC-64, and the
 * remote object's identity (size, mtime, ETag) guards against resuming into
 * an object that changed underneath.
 *
 * ```no_run
 * use ossx::{resumable_download, MemoryTransport, ObjectLocation, TransferOptions};
 * use std::path::Path;
 * use std::sync::Arc;
 *
 * # async fn example() -> ossx::Result<()> {
 * let transport = Arc::new(MemoryTransport::new());
 * let outcome = resumable_download(
 *     transport,
 *     &ObjectLocation::new("bucket", "dataset.tar"),
 *     Path::new("dataset.tar"),
 *     TransferOptions::default().with_concurrency(8),
 * )
 * .await?;
 * println!("{} bytes in {} parts", outcome.bytes, outcome.parts_total);
 * # Ok(())
 * # }
 * ```
 */

pub mod checkpoint;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod source;
pub mod transport;

pub use ossx_core_crc as crc;

pub use checkpoint::CheckpointStore;
pub use config::{PartLimits, TransferConfig, TransferOptions};
pub use crate::core::download::{DownloadOutcome, ResumableDownloader};
pub use crate::core::upload::{upload_stream, ResumableUploader, UploadOutcome};
pub use error::{ErrorKind, Result, TransferError};
pub use source::{BytesSource, FileSource, SeekableSource};
pub use transport::{MemoryTransport, ObjectLocation, Transport};

use std::path::Path;
use std::sync::Arc;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Upload a seekable source, resuming a previous attempt when one is recorded
pub async fn resumable_upload(
    transport: Arc<dyn Transport>,
    source: Arc<dyn SeekableSource>,
    destination: &ObjectLocation,
    options: TransferOptions,
) -> Result<UploadOutcome> {
    ResumableUploader::new(transport, options)?
        .upload(source, destination)
        .await
}

/// Download an object to a local path, resuming a previous attempt when one is recorded
pub async fn resumable_download(
    transport: Arc<dyn Transport>,
    source: &ObjectLocation,
    destination: &Path,
    options: TransferOptions,
) -> Result<DownloadOutcome> {
    ResumableDownloader::new(transport, options)?
        .download(source, destination)
        .await
}
