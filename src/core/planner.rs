//! Part planning
//!
//! Splits an object into contiguous, 1-indexed byte ranges and picks a part
//! size that keeps the part count within the service limit.

use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::config::PartLimits;
use crate::error::{Result, TransferError};

/// A contiguous byte range `[start, end)` of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Part {
    pub part_number: u32,
    pub start: u64,
    pub end: u64,
}

impl Part {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn range(&self) -> Range<u64> {
        self.start..self.end
    }
}

/// Split `total_size` bytes into parts of `part_size` bytes
///
/// The last part carries the remainder. An empty object yields a single
/// zero-length part so it still goes through the commit path.
///
/// # Example
///
/// ```
/// use ossx::core::planner::plan;
///
/// let parts = plan(5130, 500).unwrap();
/// assert_eq!(parts.len(), 11);
/// assert_eq!(parts[10].len(), 130);
/// ```
pub fn plan(total_size: u64, part_size: u64) -> Result<Vec<Part>> {
    if part_size == 0 {
        return Err(TransferError::Planning(
            "part size must be greater than 0".to_string(),
        ));
    }

    if total_size == 0 {
        return Ok(vec![Part {
            part_number: 1,
            start: 0,
            end: 0,
        }]);
    }

    let count = total_size.div_ceil(part_size);
    if count > u64::from(u32::MAX) {
        return Err(TransferError::Planning(format!(
            "{} bytes in parts of {} bytes needs {} parts",
            total_size, part_size, count
        )));
    }

    let parts = (0..count)
        .map(|i| {
            let start = i * part_size;
            Part {
                part_number: (i + 1) as u32,
                start,
                end: start.saturating_add(part_size).min(total_size),
            }
        })
        .collect();

    Ok(parts)
}

/// Choose a part size for `total_size` bytes
///
/// Starts from `preferred` (or the configured default), raised to
/// `min_part_size`, and doubles it until the part count fits in `max_parts`.
/// Objects smaller than the starting size become a single part.
///
/// The result is non-decreasing in `total_size`, and passing a previous
/// result back as `preferred` for the same size returns it unchanged.
pub fn determine_part_size(total_size: u64, preferred: Option<u64>, limits: &PartLimits) -> u64 {
    let mut part_size = preferred
        .unwrap_or(limits.default_part_size)
        .max(limits.min_part_size)
        .max(1);

    if total_size < part_size {
        return total_size.max(1);
    }

    let max_parts = u64::from(limits.max_parts.max(1));
    while part_size.saturating_mul(max_parts) < total_size {
        part_size = part_size.saturating_mul(2);
    }

    part_size
}
