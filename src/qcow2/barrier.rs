//! Write-ordering discipline (spec §4.7, §5).

use crate::error::Result;
use crate::backend::StorageBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierMode {
    /// Never syncs. Ordering guarantees hold only "eventually, at close".
    None,
    /// Defers every sync to the next explicit `flush`.
    Batched,
    /// Syncs after every metadata write (L1, L2, refcount block, header).
    /// The default.
    Metadata,
    /// `Metadata`, plus syncs after every data write too.
    Full,
}

impl Default for BarrierMode {
    fn default() -> Self {
        BarrierMode::Metadata
    }
}

/// Tracks whether a sync is owed, per write-barrier mode, without owning
/// any backend itself — callers ask `should_sync_on_*` at the point spec
/// §4.5 calls for a barrier and flush the relevant backend when it answers
/// `true`.
#[derive(Debug, Default)]
pub struct Barriers {
    mode: BarrierMode,
    pending: bool,
}

impl Barriers {
    pub fn new(mode: BarrierMode) -> Self {
        Barriers { mode, pending: false }
    }

    pub fn mode(&self) -> BarrierMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: BarrierMode) {
        self.mode = mode;
    }

    pub fn should_sync_on_data_write(&mut self) -> bool {
        match self.mode {
            BarrierMode::Full => true,
            BarrierMode::Batched => {
                self.pending = true;
                false
            }
            BarrierMode::None | BarrierMode::Metadata => false,
        }
    }

    pub fn should_sync_on_metadata_write(&mut self) -> bool {
        match self.mode {
            BarrierMode::Metadata | BarrierMode::Full => true,
            BarrierMode::Batched => {
                self.pending = true;
                false
            }
            BarrierMode::None => false,
        }
    }

    /// Flushes `backend` unconditionally and clears any pending flag,
    /// matching an explicit `flush()`/clean `close()` call.
    pub fn force_flush(&mut self, backend: &mut dyn StorageBackend) -> Result<()> {
        self.pending = false;
        backend.flush()
    }

    pub fn has_pending(&self) -> bool {
        self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_mode_syncs_on_metadata_not_data() {
        let mut b = Barriers::new(BarrierMode::Metadata);
        assert!(!b.should_sync_on_data_write());
        assert!(b.should_sync_on_metadata_write());
    }

    #[test]
    fn full_mode_syncs_on_both() {
        let mut b = Barriers::new(BarrierMode::Full);
        assert!(b.should_sync_on_data_write());
        assert!(b.should_sync_on_metadata_write());
    }

    #[test]
    fn batched_mode_defers() {
        let mut b = Barriers::new(BarrierMode::Batched);
        assert!(!b.should_sync_on_data_write());
        assert!(!b.should_sync_on_metadata_write());
        assert!(b.has_pending());
    }

    #[test]
    fn none_mode_never_syncs() {
        let mut b = Barriers::new(BarrierMode::None);
        assert!(!b.should_sync_on_data_write());
        assert!(!b.should_sync_on_metadata_write());
        assert!(!b.has_pending());
    }
}
