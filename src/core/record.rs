//! Transfer records
//!
//! A [`TransferRecord`] is the persisted progress of one upload or download.
//! It is written to the checkpoint store after every completed part and read
//! back when the same transfer is attempted again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::planner::{plan, Part};
use crate::error::Result;

/// Current on-disk schema version
pub const RECORD_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Download,
    Upload,
}

/// Identity of the data being transferred
///
/// For a download this is the remote object's (size, mtime, etag). For an
/// upload it is the local source's (size, mtime) plus a content tag when the
/// source can provide one cheaply.
/// `mtime` is compared for equality only; its unit depends on the side it
/// was taken from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectIdentity {
    pub size: u64,
    pub mtime: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "size={}, mtime={}", self.size, self.mtime)?;
        if let Some(etag) = &self.etag {
            write!(f, ", etag={}", etag)?;
        }
        Ok(())
    }
}

/// A part that finished transferring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub start: u64,
    pub end: u64,
    /// ETag returned by the part upload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// CRC-64/ECMA of the part's bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc64: Option<u64>,
}

impl CompletedPart {
    pub fn from_part(part: &Part, etag: Option<String>, crc64: Option<u64>) -> Self {
        Self {
            part_number: part.part_number,
            start: part.start,
            end: part.end,
            etag,
            crc64,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Persisted progress of one transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub version: u32,
    pub kind: TransferKind,
    /// `bucket/key` for downloads, absolute local path or stream name for uploads
    pub source: String,
    /// Absolute local path for downloads, `bucket/key` for uploads
    pub destination: String,
    pub identity: ObjectIdentity,
    pub part_size: u64,
    /// Suffix of the staging file next to the download destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_suffix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Completed parts in completion order
    #[serde(default)]
    pub parts: Vec<CompletedPart>,
}

impl TransferRecord {
    pub fn new_download(
        source: impl Into<String>,
        destination: impl Into<String>,
        identity: ObjectIdentity,
        part_size: u64,
    ) -> Self {
        Self {
            version: RECORD_VERSION,
            kind: TransferKind::Download,
            source: source.into(),
            destination: destination.into(),
            identity,
            part_size,
            temp_suffix: Some(new_temp_suffix()),
            upload_id: None,
            created_at: Utc::now(),
            parts: Vec::new(),
        }
    }

    pub fn new_upload(
        source: impl Into<String>,
        destination: impl Into<String>,
        identity: ObjectIdentity,
        part_size: u64,
        upload_id: impl Into<String>,
    ) -> Self {
        Self {
            version: RECORD_VERSION,
            kind: TransferKind::Upload,
            source: source.into(),
            destination: destination.into(),
            identity,
            part_size,
            temp_suffix: None,
            upload_id: Some(upload_id.into()),
            created_at: Utc::now(),
            parts: Vec::new(),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.identity.size
    }

    /// The full part list implied by the record's size and part size
    pub fn plan(&self) -> Result<Vec<Part>> {
        plan(self.identity.size, self.part_size)
    }

    pub fn is_part_done(&self, part_number: u32) -> bool {
        self.parts.iter().any(|p| p.part_number == part_number)
    }

    /// Insert or replace a completed part
    pub fn record_part(&mut self, part: CompletedPart) {
        match self
            .parts
            .iter_mut()
            .find(|p| p.part_number == part.part_number)
        {
            Some(existing) => *existing = part,
            None => self.parts.push(part),
        }
    }

    /// Parts of `plan` not yet completed, in part-number order
    pub fn pending_parts(&self, plan: &[Part]) -> Vec<Part> {
        plan.iter()
            .filter(|p| !self.is_part_done(p.part_number))
            .copied()
            .collect()
    }

    pub fn completed_bytes(&self) -> u64 {
        self.parts.iter().map(CompletedPart::len).sum()
    }

    /// Completed parts sorted by part number
    pub fn sorted_parts(&self) -> Vec<CompletedPart> {
        let mut parts = self.parts.clone();
        parts.sort_by_key(|p| p.part_number);
        parts
    }

    /// Staging file for a download record, next to `destination`
    pub fn temp_path(&self, destination: &Path) -> Option<PathBuf> {
        let suffix = self.temp_suffix.as_ref()?;
        let mut name = destination.as_os_str().to_owned();
        name.push(suffix);
        Some(PathBuf::from(name))
    }

    /// Structural checks beyond what deserialization enforces
    ///
    /// Returns a description of the first defect found.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.version != RECORD_VERSION {
            return Err(format!("unsupported record version {}", self.version));
        }
        if self.part_size == 0 {
            return Err("part_size is 0".to_string());
        }

        match self.kind {
            TransferKind::Download => {
                match self.temp_suffix.as_deref() {
                    Some(s) if !s.is_empty() && !s.contains(|c| c == '/' || c == '\\') => {}
                    _ => return Err("download record has no usable temp_suffix".to_string()),
                }
                if self.identity.etag.is_none() {
                    return Err("download record has no etag".to_string());
                }
            }
            TransferKind::Upload => {
                if self.upload_id.as_deref().map_or(true, str::is_empty) {
                    return Err("upload record has no upload_id".to_string());
                }
                if self.parts.iter().any(|p| p.etag.is_none()) {
                    return Err("upload record has a part without etag".to_string());
                }
            }
        }

        let plan = self.plan().map_err(|e| e.to_string())?;
        let mut seen = std::collections::HashSet::new();
        for done in &self.parts {
            if !seen.insert(done.part_number) {
                return Err(format!("part {} recorded twice", done.part_number));
            }
            let planned = done
                .part_number
                .checked_sub(1)
                .and_then(|i| plan.get(i as usize))
                .ok_or_else(|| format!("part {} is outside the plan", done.part_number))?;
            if planned.start != done.start || planned.end != done.end {
                return Err(format!(
                    "part {} range {}..{} does not match plan {}..{}",
                    done.part_number, done.start, done.end, planned.start, planned.end
                ));
            }
        }

        Ok(())
    }
}

/// Fresh staging-file suffix, unique per record instance
pub fn new_temp_suffix() -> String {
    format!(".tmp-{}", Uuid::new_v4().simple())
}
