//! Recovery Scanner: the startup-time walk of `pg_twophase/` that
//! re-materializes prepared transactions into the registry after a
//! crash (spec §2 component 5, §4.5).

use std::fs;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use std::collections::HashMap;

use crate::clog::{CommitLog, TransactionStatus};
use crate::gid::Gid;
use crate::participant::ParticipantRegistry;
use crate::registry::{DatabaseId, GxactRegistry, UserId, Xid, XidLiveness};
use crate::rmgr::RmgrTable;
use crate::statefile;

/// Restores a subtransaction child's parent pointer, out of scope to
/// implement for real (owned by the subtransaction-log subsystem,
/// spec §1). `serin_txn` only depends on this trait.
pub trait SubtransactionRegistry: Send + Sync {
    /// Record that `child` is a subtransaction of `parent`.
    fn set_parent(&self, child: Xid, parent: Xid);
}

/// In-memory `SubtransactionRegistry` for tests and standalone use.
#[derive(Default)]
pub struct InMemorySubtransactionRegistry {
    parents: RwLock<HashMap<Xid, Xid>>,
}

impl InMemorySubtransactionRegistry {
    /// Construct an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the parent recorded for `child`, if any.
    pub fn parent_of(&self, child: Xid) -> Option<Xid> {
        self.parents.read().unwrap().get(&child).copied()
    }
}

impl SubtransactionRegistry for InMemorySubtransactionRegistry {
    fn set_parent(&self, child: Xid, parent: Xid) {
        self.parents.write().unwrap().insert(child, parent);
    }
}

fn list_state_files(state_dir: &Path) -> std::io::Result<Vec<(Xid, std::path::PathBuf)>> {
    let mut out = Vec::new();
    if !state_dir.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(state_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(xid) = Xid::from_hex_filename(name) {
            out.push((xid, entry.path()));
        }
    }
    Ok(out)
}

/// Result of [`prescan`]: the lowest XID any valid state file named,
/// used by the commit-log / subtrans startup (spec §4.5 Pass 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrescanResult {
    /// Lowest XID among valid state files, if any existed.
    pub min_valid_xid: Option<Xid>,
}

/// Pass 1: validate every state file, discard files from a discarded
/// timeline or that are corrupt, and advance `next_xid` past every
/// subtransaction XID found (subtransaction commits are not themselves
/// WAL-logged, so the watermark must be nudged manually).
///
/// Must run after WAL redo has established the initial `next_xid`
/// watermark (spec §4.5).
pub fn prescan(state_dir: &Path, next_xid: &mut Xid) -> std::io::Result<PrescanResult> {
    let discard_threshold = *next_xid;
    let mut min_valid_xid: Option<Xid> = None;

    for (xid, path) in list_state_files(state_dir)? {
        if xid >= discard_threshold {
            tracing::warn!(xid = %xid, path = %path.display(), "discarding state file from a future/discarded timeline");
            let _ = fs::remove_file(&path);
            continue;
        }

        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(xid = %xid, path = %path.display(), error = %e, "removing unreadable state file");
                let _ = fs::remove_file(&path);
                continue;
            }
        };
        let parsed = match statefile::parse(&bytes) {
            Ok(p) if p.header.xid == xid => p,
            Ok(p) => {
                tracing::warn!(
                    filename_xid = %xid, header_xid = %p.header.xid,
                    "removing state file whose header XID does not match its filename"
                );
                let _ = fs::remove_file(&path);
                continue;
            }
            Err(e) => {
                tracing::warn!(xid = %xid, path = %path.display(), error = %e, "removing corrupt state file");
                let _ = fs::remove_file(&path);
                continue;
            }
        };

        min_valid_xid = Some(min_valid_xid.map_or(xid, |m| m.min(xid)));
        for child in parsed.children {
            if child.0 + 1 > next_xid.0 {
                next_xid.0 = child.0 + 1;
            }
        }
    }

    Ok(PrescanResult { min_valid_xid })
}

/// Everything Pass 2 needs from the rest of the server.
pub struct RecoverContext<'a> {
    /// Commit log, consulted to skip transactions finished before crash.
    pub clog: &'a dyn CommitLog,
    /// Registry re-populated with one entry per surviving state file.
    pub registry: &'a GxactRegistry,
    /// Liveness view; recovered gxacts have no live backend, so any
    /// implementation that always reports `false` is correct here.
    pub liveness: &'a dyn XidLiveness,
    /// Live participant registry, updated to keep recovered
    /// transactions visible as in-progress.
    pub participants: &'a dyn ParticipantRegistry,
    /// Subtransaction parent-pointer registry.
    pub subxacts: &'a dyn SubtransactionRegistry,
    /// Resource-manager callback tables, `recover` callbacks invoked.
    pub rmgr: &'a RmgrTable,
}

/// Pass 2: re-materialize one `Gxact` per surviving, unfinished state
/// file and invoke each resource manager's `recover` callback.
///
/// Transactions that `clog` already reports finished were completed
/// before the crash but didn't get their state file cleaned up; those
/// files are simply removed.
pub async fn recover(state_dir: &Path, ctx: RecoverContext<'_>) -> std::io::Result<usize> {
    let mut recovered = 0;
    for (xid, path) in list_state_files(state_dir)? {
        match ctx.clog.status(xid).await {
            TransactionStatus::Committed | TransactionStatus::Aborted => {
                let _ = fs::remove_file(&path);
                continue;
            }
            TransactionStatus::InProgress | TransactionStatus::SubCommitted => {}
        }

        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(xid = %xid, error = %e, "removing unreadable state file during recovery");
                let _ = fs::remove_file(&path);
                continue;
            }
        };
        let parsed = match statefile::parse(&bytes) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(xid = %xid, error = %e, "removing corrupt state file during recovery");
                let _ = fs::remove_file(&path);
                continue;
            }
        };

        for &child in &parsed.children {
            ctx.subxacts.set_parent(child, xid);
        }

        let database: DatabaseId = parsed.header.database;
        let owner: UserId = parsed.header.owner;
        let gid: Gid = parsed.header.gid.clone();
        let handle = match ctx.registry.reserve(xid, database, gid, owner, ctx.liveness) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(xid = %xid, error = %e, "could not re-reserve registry slot during recovery");
                continue;
            }
        };
        ctx.registry.set_children(handle, &parsed.children).expect("handle just issued by reserve");
        ctx.registry.mark_prepared(handle).expect("handle just issued by reserve");
        // Warm the single-entry XID->participant cache (Design Notes §9)
        // here rather than using the value `mark_prepared` already
        // returned: recovery and a later finish of the same transaction
        // both query this XID, so the cache should carry the lookup
        // across calls instead of each one re-scanning the registry.
        let participant = ctx
            .registry
            .dummy_participant_for(xid)
            .expect("just reserved and marked prepared above");
        ctx.participants.insert(participant).await;

        for record in &parsed.records {
            ctx.rmgr.invoke_recover(record.rmid, xid, record.info, &record.payload);
        }

        recovered += 1;
    }
    Ok(recovered)
}

/// Inverse of the Durable Handoff (spec §4.3), invoked by WAL replay of
/// a PREPARE record whose CRC-finalize step never reached disk. No
/// critical-section ordering is needed here: WAL is the canonical
/// truth, the file is only a materialization of it.
pub fn recreate_state_file(state_dir: &Path, xid: Xid, content: &[u8]) -> std::io::Result<()> {
    let path = state_dir.join(xid.to_hex_filename());
    let crc = statefile::checksum(content);
    let mut file = fs::OpenOptions::new().create(true).truncate(true).write(true).open(&path)?;
    use std::io::Write;
    file.write_all(content)?;
    file.write_all(&crc.to_le_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Serializes concurrent calls to functions in this module during
/// tests, since they share a temp directory across assertions.
#[cfg(test)]
static TEST_LOCK: Mutex<()> = Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clog::InMemoryCommitLog;
    use crate::config::TwoPhaseConfig;
    use crate::gid::Gid;
    use crate::participant::InMemoryParticipantRegistry;
    use crate::prepare::end_prepare;
    use crate::registry::FixedLiveness;
    use crate::statefile::StateFileBuilder;
    use crate::wal::{InMemoryWal, NullCheckpointCoordinator};

    #[tokio::test]
    async fn future_file_is_deleted_with_warning() {
        let _guard = TEST_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let wal = InMemoryWal::new();
        let checkpoint = NullCheckpointCoordinator::default();
        let builder = StateFileBuilder::start_prepare(Xid(0xFFFE), 1, 1, Gid::new("future").unwrap(), &[], &[], &[]);
        end_prepare(builder, dir.path(), &wal, &checkpoint).await.unwrap();

        let mut next_xid = Xid(100);
        let result = prescan(dir.path(), &mut next_xid).unwrap();
        assert_eq!(result.min_valid_xid, None);
        assert!(!dir.path().join(Xid(0xFFFE).to_hex_filename()).exists());
    }

    #[tokio::test]
    async fn prescan_advances_watermark_past_subxacts() {
        let _guard = TEST_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let wal = InMemoryWal::new();
        let checkpoint = NullCheckpointCoordinator::default();
        let builder = StateFileBuilder::start_prepare(
            Xid(5),
            1,
            1,
            Gid::new("withsubx").unwrap(),
            &[Xid(50), Xid(60)],
            &[],
            &[],
        );
        end_prepare(builder, dir.path(), &wal, &checkpoint).await.unwrap();

        let mut next_xid = Xid(10);
        let result = prescan(dir.path(), &mut next_xid).unwrap();
        assert_eq!(result.min_valid_xid, Some(Xid(5)));
        assert!(next_xid.0 >= 61);
    }

    #[tokio::test]
    async fn recover_rematerializes_a_gxact_and_calls_recover_callback() {
        let _guard = TEST_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let wal = InMemoryWal::new();
        let checkpoint = NullCheckpointCoordinator::default();
        let mut builder =
            StateFileBuilder::start_prepare(Xid(7), 3, 9, Gid::new("recoverme").unwrap(), &[Xid(8)], &[], &[]);
        builder.register_record(crate::rmgr::ResourceManagerId(1), 0, b"lockstate");
        end_prepare(builder, dir.path(), &wal, &checkpoint).await.unwrap();

        let registry = GxactRegistry::new(&TwoPhaseConfig {
            max_prepared_xacts: 4,
            state_dir: dir.path().to_path_buf(),
        });
        let liveness = FixedLiveness::new();
        let clog = InMemoryCommitLog::new();
        let participants = InMemoryParticipantRegistry::new();
        let subxacts = InMemorySubtransactionRegistry::new();
        let rmgr = RmgrTable::new();
        rmgr.register(crate::rmgr::ResourceManagerId(1), None, None, Some(|_, _, _| {}));

        let ctx = RecoverContext {
            clog: &clog,
            registry: &registry,
            liveness: &liveness,
            participants: &participants,
            subxacts: &subxacts,
            rmgr: &rmgr,
        };
        let n = recover(dir.path(), ctx).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(registry.snapshot().len(), 1);
        assert_eq!(subxacts.parent_of(Xid(8)), Some(Xid(7)));
        assert!(participants.contains(Xid(7)).await);
    }

    #[tokio::test]
    async fn recover_removes_files_already_finished_in_clog() {
        let _guard = TEST_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let wal = InMemoryWal::new();
        let checkpoint = NullCheckpointCoordinator::default();
        let builder = StateFileBuilder::start_prepare(Xid(1), 1, 1, Gid::new("alreadydone").unwrap(), &[], &[], &[]);
        end_prepare(builder, dir.path(), &wal, &checkpoint).await.unwrap();

        let registry = GxactRegistry::new(&TwoPhaseConfig {
            max_prepared_xacts: 4,
            state_dir: dir.path().to_path_buf(),
        });
        let liveness = FixedLiveness::new();
        let clog = InMemoryCommitLog::new();
        clog.set_committed(Xid(1)).await;
        let participants = InMemoryParticipantRegistry::new();
        let subxacts = InMemorySubtransactionRegistry::new();
        let rmgr = RmgrTable::new();

        let ctx = RecoverContext {
            clog: &clog,
            registry: &registry,
            liveness: &liveness,
            participants: &participants,
            subxacts: &subxacts,
            rmgr: &rmgr,
        };
        let n = recover(dir.path(), ctx).await.unwrap();
        assert_eq!(n, 0);
        assert!(!dir.path().join(Xid(1).to_hex_filename()).exists());
    }

    #[test]
    fn recreate_state_file_produces_a_parseable_file() {
        let _guard = TEST_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let builder = StateFileBuilder::start_prepare(Xid(3), 1, 1, Gid::new("replayed").unwrap(), &[], &[], &[]);
        let body = builder.finish();
        recreate_state_file(dir.path(), Xid(3), &body).unwrap();

        let bytes = fs::read(dir.path().join(Xid(3).to_hex_filename())).unwrap();
        let parsed = statefile::parse(&bytes).unwrap();
        assert_eq!(parsed.header.xid, Xid(3));
    }
}
