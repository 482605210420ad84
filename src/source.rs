//! Upload sources
//!
//! Resumable uploads need to re-read arbitrary byte ranges, so they take a
//! [`SeekableSource`]. Plain `AsyncRead` streams go through
//! [`upload_stream`](crate::core::upload::upload_stream) instead, which
//! cannot resume.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io::{self, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use ossx_core_crc::Crc64;

use crate::checkpoint::canonical_path;
use crate::core::record::ObjectIdentity;

/// A source whose bytes can be read at any offset, any number of times
#[async_trait]
pub trait SeekableSource: Send + Sync {
    /// Stable name of the source, stored in checkpoints
    fn name(&self) -> String;

    /// Local file backing the source, if any; part of the checkpoint key
    fn local_path(&self) -> Option<&Path>;

    /// Current size and modification marker
    async fn stat(&self) -> io::Result<ObjectIdentity>;

    /// Read `range`; may return fewer bytes if the source shrank
    async fn read_range(&self, range: Range<u64>) -> io::Result<Bytes>;
}

/// A local file
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            path: canonical_path(path.as_ref())?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SeekableSource for FileSource {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn local_path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    async fn stat(&self) -> io::Result<ObjectIdentity> {
        let metadata = tokio::fs::metadata(&self.path).await?;
        let mtime = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        Ok(ObjectIdentity {
            size: metadata.len(),
            mtime,
            etag: None,
        })
    }

    async fn read_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        let len = range.end.saturating_sub(range.start);
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(range.start)).await?;

        let mut buf = BytesMut::with_capacity(len as usize);
        let mut limited = file.take(len);
        while limited.read_buf(&mut buf).await? > 0 {}
        Ok(buf.freeze())
    }
}

/// An in-memory buffer, mainly for tests and generated content
///
/// The identity carries a CRC-64 of the content, so different bytes under
/// the same name and size never resume each other's upload.
#[derive(Debug, Clone)]
pub struct BytesSource {
    name: String,
    data: Bytes,
    mtime: i64,
    content_tag: String,
}

impl BytesSource {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            content_tag: format!("{:016x}", Crc64::checksum(&data)),
            data,
            mtime: 0,
        }
    }

    pub fn with_mtime(mut self, mtime: i64) -> Self {
        self.mtime = mtime;
        self
    }
}

#[async_trait]
impl SeekableSource for BytesSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn local_path(&self) -> Option<&Path> {
        None
    }

    async fn stat(&self) -> io::Result<ObjectIdentity> {
        Ok(ObjectIdentity {
            size: self.data.len() as u64,
            mtime: self.mtime,
            etag: Some(self.content_tag.clone()),
        })
    }

    async fn read_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        let len = self.data.len() as u64;
        let start = range.start.min(len) as usize;
        let end = range.end.min(len).max(range.start.min(len)) as usize;
        Ok(self.data.slice(start..end))
    }
}
