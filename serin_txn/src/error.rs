//! Error taxonomy for the two-phase commit coordinator (spec §7).

use crate::gid::Gid;
use crate::registry::Xid;
use thiserror::Error;

/// Errors surfaced to the SQL layer by `PREPARE TRANSACTION`,
/// `COMMIT PREPARED` and `ROLLBACK PREPARED`.
///
/// `fatal` conditions (spec §7) are deliberately absent from this enum:
/// they are not recoverable results, they escalate through
/// [`crate::critical::CriticalSection`] instead.
#[derive(Debug, Error)]
pub enum TwoPhaseError {
    /// GID longer than [`crate::gid::MAX_GID_LEN`] bytes including terminator.
    #[error("invalid GID: {0}")]
    InvalidParameter(#[from] crate::gid::GidTooLong),

    /// GID conflicts with an entry that is prepared or being prepared.
    #[error("transaction with GID \"{0}\" already exists")]
    DuplicateGid(Gid),

    /// The registry's free list is empty.
    #[error("maximum number of prepared transactions reached ({capacity}); increase max_prepared_xacts")]
    OutOfSlots {
        /// Configured registry capacity.
        capacity: usize,
    },

    /// `FINISH` referenced a GID with no matching registry entry.
    #[error("prepared transaction with GID \"{0}\" does not exist")]
    NoSuchGid(Gid),

    /// `FINISH` referenced a GID whose current driver is still active.
    #[error("prepared transaction with GID \"{0}\" is being processed by another backend")]
    Busy(Gid),

    /// `FINISH` attempted by neither the owner nor a superuser.
    #[error("permission denied to finish prepared transaction \"{gid}\" (owned by {owner})")]
    PermissionDenied {
        /// GID under contention.
        gid: Gid,
        /// Owning user id.
        owner: u32,
    },

    /// State file missing, bad magic, bad CRC, or over the size bound.
    #[error("could not access state of transaction {xid}, GID \"{gid}\": {reason}")]
    DataCorrupted {
        /// Transaction identifier the state file is named after.
        xid: Xid,
        /// GID, if known at the point of failure.
        gid: Option<Gid>,
        /// Human-readable corruption reason.
        reason: String,
    },

    /// Underlying I/O error that did not occur inside a critical section.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TwoPhaseError>;
