//! Durable Handoff: the PREPARE critical section (spec §2 component 4,
//! §4.3).
//!
//! Orders (a) state-file write + fsync with a deliberately bogus CRC,
//! (b) WAL insert + flush, (c) rewrite of the correct CRC + fsync, so
//! that crash recovery either sees a WAL PREPARE paired with a valid
//! state file or neither.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use crate::critical::critical_section;
use crate::error::{Result, TwoPhaseError};
use crate::gid::Gid;
use crate::participant::ParticipantRegistry;
use crate::registry::{DatabaseId, GxactRegistry, UserId, Xid, XidLiveness};
use crate::statefile::{self, StateFileBuilder};
use crate::wal::{CheckpointCoordinator, TwoPhaseWalRecord, WriteAheadLog};

/// Everything `prepare_transaction` needs beyond the registry itself,
/// gathered for the same reason as [`crate::finish::FinishContext`].
pub struct PrepareContext<'a, C: CheckpointCoordinator> {
    /// Directory receiving one state file per prepared transaction.
    pub state_dir: &'a Path,
    /// Write-ahead log.
    pub wal: &'a dyn WriteAheadLog,
    /// Checkpoint start/exclusive gate.
    pub checkpoint: &'a C,
    /// Live participant registry, given the new dummy participant once
    /// the slot is valid.
    pub participants: &'a dyn ParticipantRegistry,
}

/// Run `PREPARE TRANSACTION '<gid>'` end to end (spec §4.2 `start_prepare`
/// through §4.3 `end_prepare`, plus `mark_prepared`): reserve a slot,
/// assemble the state-file record chain (copying `children` into the
/// slot's cache along the way, per `start_prepare`'s "children are also
/// copied into the gxact's dummy participant" note), run the Durable
/// Handoff, then flip the slot valid and publish its dummy participant.
#[allow(clippy::too_many_arguments)]
pub async fn prepare_transaction<C: CheckpointCoordinator>(
    xid: Xid,
    database: DatabaseId,
    owner: UserId,
    gid: Gid,
    children: &[Xid],
    commit_drops: &[String],
    abort_drops: &[String],
    rmgr_records: &[(crate::rmgr::ResourceManagerId, u32, Vec<u8>)],
    registry: &GxactRegistry,
    liveness: &dyn XidLiveness,
    ctx: PrepareContext<'_, C>,
) -> Result<Xid> {
    let handle = registry.reserve(xid, database, gid.clone(), owner, liveness)?;

    let mut builder = StateFileBuilder::start_prepare(xid, database, owner, gid, children, commit_drops, abort_drops);
    for (rmid, info, payload) in rmgr_records {
        builder.register_record(*rmid, *info, payload);
    }

    end_prepare(builder, ctx.state_dir, ctx.wal, ctx.checkpoint).await?;

    registry.set_children(handle, children)?;
    let participant = registry.mark_prepared(handle)?;
    ctx.participants.insert(participant).await;

    Ok(xid)
}

#[cfg(unix)]
fn open_exclusive(path: &Path) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .create_new(true)
        .write(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_exclusive(path: &Path) -> std::io::Result<std::fs::File> {
    OpenOptions::new().create_new(true).write(true).open(path)
}

/// Run the Durable Handoff for one `PREPARE TRANSACTION`, per spec §4.3
/// steps 1–8.
///
/// On success, a subsequent crash + restart is guaranteed (spec §8
/// property 3) to leave the transaction recoverable: either the WAL
/// PREPARE and a valid state file are both on disk, or neither is, and
/// recovery treats the transaction as aborted.
pub async fn end_prepare<C: CheckpointCoordinator>(
    builder: StateFileBuilder,
    state_dir: &Path,
    wal: &dyn WriteAheadLog,
    checkpoint: &C,
) -> Result<(Xid, Gid)> {
    let xid = builder.xid();
    let gid = builder.gid().clone();
    let body = builder.finish();
    let path = state_dir.join(xid.to_hex_filename());

    // Step 1: create the state file exclusively; a pre-existing file
    // (stale leftovers, or an XID collision) is a hard error, not
    // something this function papers over.
    let mut file = open_exclusive(&path).map_err(|e| classify_create_error(e, xid))?;

    // Step 2: stream the chain; the CRC is computed over these bytes.
    file.write_all(&body)?;
    let correct_crc = statefile::checksum(&body);
    let bogus_crc = !correct_crc;

    // Step 3: append the deliberately-wrong CRC and fsync. A crash or
    // ENOSPC here is surfaced to the caller as an ordinary error; no
    // WAL record has been written yet, so nothing has diverged.
    file.write_all(&bogus_crc.to_le_bytes())?;
    file.sync_all()?;

    // Step 4: seek back over the CRC so it can be rewritten in place.
    file.seek(SeekFrom::End(-4))?;

    // Steps 5–8: the critical section. From here on any I/O failure is
    // fatal, because the WAL and the on-disk state file may already
    // have diverged and only WAL replay can reconcile them.
    let guard = checkpoint.begin_shared().await;
    critical_section("prepare", async {
        let record = TwoPhaseWalRecord::Prepare { xid, gid: gid.clone(), payload: body.clone() };
        let lsn = wal.append(record).await?;
        wal.flush(lsn).await?;

        file.write_all(&correct_crc.to_le_bytes())?;
        file.sync_all()?;
        Ok::<(), std::io::Error>(())
    })
    .await;
    drop(guard);

    Ok((xid, gid))
}

/// Map a file-creation failure where the state file already exists into
/// the taxonomy's `invalid-parameter`-adjacent surface; everything else
/// passes through as a plain I/O error (spec §7 only names the user-
/// facing categories explicitly, `io::Error` covers the rest).
pub fn classify_create_error(err: std::io::Error, xid: Xid) -> TwoPhaseError {
    if err.kind() == std::io::ErrorKind::AlreadyExists {
        TwoPhaseError::DataCorrupted {
            xid,
            gid: None,
            reason: "state file already exists".to_string(),
        }
    } else {
        TwoPhaseError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DatabaseId;
    use crate::statefile::StateFileBuilder;
    use crate::wal::{InMemoryWal, NullCheckpointCoordinator};
    use std::fs;

    fn builder(xid: Xid, gid: &str) -> StateFileBuilder {
        let database: DatabaseId = 1;
        StateFileBuilder::start_prepare(xid, database, 7, Gid::new(gid).unwrap(), &[], &[], &[])
    }

    #[tokio::test]
    async fn end_prepare_leaves_a_crc_valid_file_and_a_wal_record() {
        let dir = tempfile::tempdir().unwrap();
        let wal = InMemoryWal::new();
        let checkpoint = NullCheckpointCoordinator::default();

        let (xid, gid) = end_prepare(builder(Xid(1), "g1"), dir.path(), &wal, &checkpoint)
            .await
            .unwrap();
        assert_eq!(xid, Xid(1));
        assert_eq!(gid.as_str(), "g1");

        let path = dir.path().join(xid.to_hex_filename());
        let bytes = fs::read(path).unwrap();
        let parsed = statefile::parse(&bytes).unwrap();
        assert_eq!(parsed.header.xid, Xid(1));

        let records = wal.records().await;
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn end_prepare_rejects_a_pre_existing_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let wal = InMemoryWal::new();
        let checkpoint = NullCheckpointCoordinator::default();

        end_prepare(builder(Xid(2), "first"), dir.path(), &wal, &checkpoint)
            .await
            .unwrap();
        let err = end_prepare(builder(Xid(2), "second"), dir.path(), &wal, &checkpoint).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn prepare_transaction_caches_children_and_publishes_participant() {
        use crate::config::TwoPhaseConfig;
        use crate::participant::InMemoryParticipantRegistry;
        use crate::registry::{FixedLiveness, GxactRegistry};

        let dir = tempfile::tempdir().unwrap();
        let wal = InMemoryWal::new();
        let checkpoint = NullCheckpointCoordinator::default();
        let participants = InMemoryParticipantRegistry::new();
        let registry = GxactRegistry::new(&TwoPhaseConfig {
            max_prepared_xacts: 4,
            state_dir: dir.path().to_path_buf(),
        });
        let liveness = FixedLiveness::new();

        let ctx = PrepareContext {
            state_dir: dir.path(),
            wal: &wal,
            checkpoint: &checkpoint,
            participants: &participants,
        };
        let children = [Xid(10), Xid(11)];
        let xid = prepare_transaction(
            Xid(3),
            1,
            7,
            Gid::new("withkids").unwrap(),
            &children,
            &[],
            &[],
            &[],
            &registry,
            &liveness,
            ctx,
        )
        .await
        .unwrap();
        assert_eq!(xid, Xid(3));

        let snap = registry.snapshot();
        assert_eq!(snap.len(), 1);
        assert!(snap[0].is_valid());
        assert_eq!(snap[0].children(), &children);
        assert!(participants.contains(Xid(3)).await);
    }
}
