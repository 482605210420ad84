/*!
 * Core transfer engine
 *
 * - [`planner`]: part layout and part-size selection
 * - [`record`]: persisted transfer progress
 * - [`pool`]: bounded concurrent part dispatch
 * - [`progress`]: cumulative progress reporting
 * - [`download`] / [`upload`]: resumable orchestration
 */

pub mod download;
pub mod planner;
pub mod pool;
pub mod progress;
pub mod record;
pub mod upload;

use ossx_core_crc::CrcParams;
use std::io;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use record::CompletedPart;

/// Lifecycle of one orchestrated transfer
///
/// `Init -> Validating -> (Resuming | Fresh) -> Transferring -> Finalizing -> Done`,
/// with `Failed` reachable from any state before `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Init,
    Validating,
    Resuming,
    Fresh,
    Transferring,
    Finalizing,
    Done,
    Failed,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Done | TransferState::Failed)
    }

    pub(crate) fn enter(&mut self, next: TransferState) {
        debug!(from = ?*self, to = ?next, "Transfer state change");
        *self = next;
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// CRC-64 of the whole object from per-part values, if every part has one
pub(crate) fn combine_part_crcs(parts: &[CompletedPart]) -> Option<u64> {
    let blocks = parts
        .iter()
        .map(|p| p.crc64.map(|crc| (crc, p.len())))
        .collect::<Option<Vec<_>>>()?;
    Some(CrcParams::CRC64_XZ.combine_all(blocks))
}

/// Best-effort removal of a staging file
pub(crate) async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed staging file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove staging file"),
    }
}
