//! Finish: `COMMIT PREPARED` / `ROLLBACK PREPARED` (spec §2 "Finish",
//! §4.4).

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::clog::CommitLog;
use crate::critical::critical_section;
use crate::error::{Result, TwoPhaseError};
use crate::gid::Gid;
use crate::participant::ParticipantRegistry;
use crate::registry::{GxactRegistry, UserId, Xid, XidLiveness};
use crate::rmgr::RmgrTable;
use crate::statefile;
use crate::wal::{CheckpointCoordinator, TwoPhaseWalRecord, WriteAheadLog};

/// Running totals for completed FINISH operations (spec §4.4 step 12,
/// "increment commit statistics"). A full statistics subsystem is out
/// of scope; this is the minimal counterpart an administrator can read.
#[derive(Default)]
pub struct FinishStats {
    commits: AtomicU64,
    aborts: AtomicU64,
}

impl FinishStats {
    /// Number of `COMMIT PREPARED` operations completed so far.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Number of `ROLLBACK PREPARED` operations completed so far.
    pub fn aborts(&self) -> u64 {
        self.aborts.load(Ordering::Relaxed)
    }
}

/// Everything `finish` needs from the rest of the server, gathered into
/// one borrow so the function signature stays manageable. Each field is
/// an out-of-scope external collaborator referenced only by interface
/// (spec §1).
pub struct FinishContext<'a, C: CheckpointCoordinator> {
    /// Directory containing one state file per prepared transaction.
    pub state_dir: &'a Path,
    /// Write-ahead log.
    pub wal: &'a dyn WriteAheadLog,
    /// Checkpoint start/exclusive gate.
    pub checkpoint: &'a C,
    /// Commit log.
    pub clog: &'a dyn CommitLog,
    /// Live participant registry.
    pub participants: &'a dyn ParticipantRegistry,
    /// Resource-manager callback tables.
    pub rmgr: &'a RmgrTable,
    /// FINISH statistics counters.
    pub stats: &'a FinishStats,
}

/// Run `COMMIT PREPARED '<gid>'` (`is_commit = true`) or
/// `ROLLBACK PREPARED '<gid>'` (`is_commit = false`), spec §4.4 steps
/// 1–13 in order.
#[tracing::instrument(skip(registry, liveness, ctx), fields(gid = %gid, is_commit))]
pub async fn finish<C: CheckpointCoordinator>(
    gid: &Gid,
    is_commit: bool,
    caller_user: UserId,
    caller_is_superuser: bool,
    caller_xid: Xid,
    registry: &GxactRegistry,
    liveness: &dyn XidLiveness,
    ctx: FinishContext<'_, C>,
) -> Result<()> {
    // Step 1.
    let handle = registry.lock_for_finish(gid, caller_user, caller_is_superuser, caller_xid, liveness)?;
    let xid = handle.xid();

    // Step 2.
    let path = ctx.state_dir.join(xid.to_hex_filename());
    let bytes = std::fs::read(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            TwoPhaseError::DataCorrupted {
                xid,
                gid: Some(gid.clone()),
                reason: "state file missing".to_string(),
            }
        } else {
            TwoPhaseError::Io(e)
        }
    })?;

    // Step 3.
    let parsed = statefile::parse(&bytes)?;

    // Steps 4–7: critical section.
    let guard = ctx.checkpoint.begin_shared().await;
    critical_section("finish", async {
        let record = if is_commit {
            TwoPhaseWalRecord::CommitPrepared {
                xid,
                children: parsed.children.clone(),
                commit_drops: parsed.commit_drops.clone(),
            }
        } else {
            TwoPhaseWalRecord::AbortPrepared {
                xid,
                children: parsed.children.clone(),
                abort_drops: parsed.abort_drops.clone(),
            }
        };
        let lsn = ctx.wal.append(record).await?;
        ctx.wal.flush(lsn).await?;

        // Parent before any child (spec §8 property 6: no reader may
        // observe a committed child with an uncommitted parent).
        if is_commit {
            ctx.clog.set_committed(xid).await;
            for &child in &parsed.children {
                ctx.clog.set_committed(child).await;
            }
        } else {
            ctx.clog.set_aborted(xid).await;
            for &child in &parsed.children {
                ctx.clog.set_aborted(child).await;
            }
        }
        Ok::<(), std::io::Error>(())
    })
    .await;
    drop(guard);

    // Step 8. Look the dummy participant up through the single-entry
    // cache (Design Notes §9) rather than re-scanning the registry:
    // commit/abort and recovery repeatedly query the same XID.
    if let Some(participant) = registry.dummy_participant_for(xid) {
        tracing::trace!(xid = %participant.xid, "removing dummy participant after finish");
    }
    ctx.participants.remove(xid).await;

    // Step 9.
    registry.invalidate(handle)?;

    // Step 10.
    for record in &parsed.records {
        if is_commit {
            ctx.rmgr.invoke_post_commit(record.rmid, xid, record.info, &record.payload);
        } else {
            ctx.rmgr.invoke_post_abort(record.rmid, xid, record.info, &record.payload);
        }
    }

    // Step 11.
    let drops: &[String] = if is_commit { &parsed.commit_drops } else { &parsed.abort_drops };
    for rel in drops {
        if let Err(e) = std::fs::remove_file(rel) {
            tracing::warn!(file = %rel, error = %e, "failed to unlink dropped file after finish");
        }
    }

    // Step 12.
    if is_commit {
        ctx.stats.commits.fetch_add(1, Ordering::Relaxed);
    } else {
        ctx.stats.aborts.fetch_add(1, Ordering::Relaxed);
    }

    // Step 13.
    std::fs::remove_file(&path)?;
    registry.remove(handle)?;

    tracing::info!(xid = %xid, gid = %gid, is_commit, "prepared transaction finished");
    Ok(())
}
