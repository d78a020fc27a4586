//! Per-record sync metadata

use serde::{Deserialize, Serialize};

/// Sync bookkeeping attached to locally-owned records
///
/// Lifecycle: dirty on any local write, clean only after a confirmed remote
/// acknowledgement, dirty with an error string after a failed push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncMeta {
    /// Whether local changes are still unpushed
    pub needs_sync: bool,
    /// Why the last push failed, if it did
    pub last_sync_error: Option<String>,
    /// When the remote last acknowledged this record (Unix ms)
    pub synced_at: Option<i64>,
}

impl SyncMeta {
    /// Metadata for a fresh local write
    #[must_use]
    pub const fn dirty() -> Self {
        Self {
            needs_sync: true,
            last_sync_error: None,
            synced_at: None,
        }
    }

    /// Metadata for a record applied from a remote event
    #[must_use]
    pub const fn clean(synced_at: i64) -> Self {
        Self {
            needs_sync: false,
            last_sync_error: None,
            synced_at: Some(synced_at),
        }
    }

    /// Whether the record is fully pushed
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        !self.needs_sync
    }
}

/// Engine-level sync indicator shown by client UIs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// No remote configured or remote unreachable
    Offline,
    /// Pushes in flight
    Syncing,
    /// All known records clean
    Synced,
    /// At least one record exhausted its retries
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirty_and_clean() {
        let dirty = SyncMeta::dirty();
        assert!(!dirty.is_clean());
        assert!(dirty.last_sync_error.is_none());

        let clean = SyncMeta::clean(42);
        assert!(clean.is_clean());
        assert_eq!(clean.synced_at, Some(42));
    }
}
