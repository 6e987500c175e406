//! Write-ahead log integration contract.
//!
//! The WAL itself is out of scope for this subsystem (spec §1) — it is
//! an external collaborator referenced only by interface: `append`
//! returns the LSN the record landed at, `flush` durably persists up to
//! a given LSN, and `checkpoint_start_shared_lock` lets PREPARE/FINISH
//! block a checkpoint from completing mid-critical-section (spec §5).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::gid::Gid;
use crate::registry::Xid;

/// Log sequence number: a WAL-assigned monotonic position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

/// WAL record kinds this subsystem produces and consumes (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TwoPhaseWalRecord {
    /// Carries the same byte chain as the on-disk state file.
    Prepare {
        /// Transaction identifier.
        xid: Xid,
        /// Global identifier, for observability only (not reparsed from the chain).
        gid: Gid,
        /// The exact bytes handed to the state-file builder.
        payload: Vec<u8>,
    },
    /// Commit-prepared. `NO_TRAN` (spec §6) is implicit: replay must not
    /// treat `xid` as the record's owning transaction.
    CommitPrepared {
        /// Transaction identifier being committed.
        xid: Xid,
        /// Subtransaction children, committed parent-first.
        children: Vec<Xid>,
        /// Physical files to unlink after the WAL record is durable.
        commit_drops: Vec<String>,
    },
    /// Abort-prepared, the `is_commit = false` counterpart.
    AbortPrepared {
        /// Transaction identifier being aborted.
        xid: Xid,
        /// Subtransaction children.
        children: Vec<Xid>,
        /// Physical files to unlink after the WAL record is durable.
        abort_drops: Vec<String>,
    },
}

/// Interface onto the write-ahead log.
///
/// Out of scope to implement for real (spec §1); `serin_txn` only
/// depends on this trait, satisfied in production by the server's WAL
/// subsystem and in tests by [`InMemoryWal`].
#[async_trait]
pub trait WriteAheadLog: Send + Sync {
    /// Insert a record into the log, returning the LSN it was assigned.
    async fn append(&self, record: TwoPhaseWalRecord) -> std::io::Result<Lsn>;

    /// Durably flush the log up to and including `lsn`.
    async fn flush(&self, lsn: Lsn) -> std::io::Result<()>;
}

/// Interface onto the checkpointer's shared/exclusive gate.
///
/// PREPARE and FINISH acquire this in shared mode for the duration of
/// their critical section (spec §4.3 step 5, §4.4 step 4); a checkpoint
/// acquires it exclusively before it may complete. Modeled as an async
/// trait because the checkpointer, like the rest of this workspace's
/// server-side code, runs as a tokio task.
#[async_trait]
pub trait CheckpointCoordinator: Send + Sync {
    /// RAII-style guard released on drop.
    type Guard<'a>: Send
    where
        Self: 'a;

    /// Block checkpoint start until this guard is dropped.
    async fn begin_shared<'a>(&'a self) -> Self::Guard<'a>;
}

/// In-memory `WriteAheadLog` used by this crate's own tests and by
/// standalone demonstrations (e.g. `serindb twophase`).
///
/// Not a production WAL: durability here is process-lifetime only.
#[derive(Default)]
pub struct InMemoryWal {
    records: tokio::sync::Mutex<Vec<TwoPhaseWalRecord>>,
}

impl InMemoryWal {
    /// Construct an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot every record appended so far, in order.
    pub async fn records(&self) -> Vec<TwoPhaseWalRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl WriteAheadLog for InMemoryWal {
    async fn append(&self, record: TwoPhaseWalRecord) -> std::io::Result<Lsn> {
        let mut records = self.records.lock().await;
        records.push(record);
        Ok(Lsn(records.len() as u64))
    }

    async fn flush(&self, _lsn: Lsn) -> std::io::Result<()> {
        // Everything appended is already "durable" for the lifetime of the process.
        Ok(())
    }
}

/// Checkpoint coordinator that never blocks, for tests and standalone use.
#[derive(Default)]
pub struct NullCheckpointCoordinator {
    lock: tokio::sync::RwLock<()>,
}

/// Guard returned by [`NullCheckpointCoordinator::begin_shared`].
pub struct NullGuard<'a>(tokio::sync::RwLockReadGuard<'a, ()>);

#[async_trait]
impl CheckpointCoordinator for NullCheckpointCoordinator {
    type Guard<'a> = NullGuard<'a>;

    async fn begin_shared<'a>(&'a self) -> NullGuard<'a> {
        NullGuard(self.lock.read().await)
    }
}
