//! Two-phase commit coordinator: `PREPARE TRANSACTION`,
//! `COMMIT PREPARED`, `ROLLBACK PREPARED`, and crash recovery for
//! externally-coordinated distributed transactions.
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

pub mod clog;
pub mod config;
pub mod critical;
pub mod error;
pub mod finish;
pub mod gid;
pub mod participant;
pub mod prepare;
pub mod recovery;
pub mod registry;
pub mod rmgr;
pub mod statefile;
pub mod wal;

pub use config::TwoPhaseConfig;
pub use error::{Result, TwoPhaseError};
pub use finish::{finish, FinishContext, FinishStats};
pub use gid::Gid;
pub use prepare::{end_prepare, prepare_transaction, PrepareContext};
pub use recovery::{prescan, recover, recreate_state_file, PrescanResult, RecoverContext, SubtransactionRegistry};
pub use registry::{DatabaseId, Gxact, GxactHandle, GxactRegistry, UserId, Xid, XidLiveness};

/// Global monotonically increasing timestamp generator (single node MVP).
static GLOBAL_TS: AtomicU64 = AtomicU64::new(1);

/// Generate next commit timestamp.
pub fn next_ts() -> u64 {
    GLOBAL_TS.fetch_add(1, Ordering::SeqCst)
}

/// A record version stored in MVCC storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionedTuple<T> {
    /// Begin timestamp (inclusive).
    pub min_ts: u64,
    /// End timestamp (exclusive). Running/visible if max_ts = u64::MAX.
    pub max_ts: u64,
    /// Actual tuple payload.
    pub value: T,
}

impl<T> VersionedTuple<T> {
    /// Create new committed tuple visible to future snapshots.
    pub fn new_committed(value: T, ts: u64) -> Self {
        Self {
            min_ts: ts,
            max_ts: u64::MAX,
            value,
        }
    }

    /// Check visibility for snapshot at given timestamp.
    pub fn visible_at(&self, snap_ts: u64) -> bool {
        self.min_ts <= snap_ts && snap_ts < self.max_ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mvcc_visibility() {
        let ts1 = next_ts();
        let rec = VersionedTuple::new_committed(10, ts1);
        assert!(rec.visible_at(ts1));
        let ts2 = next_ts();
        assert!(rec.visible_at(ts2));
    }
}
