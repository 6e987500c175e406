//! Dummy participant: the record that keeps a prepared transaction
//! visible to concurrent readers of the live transaction registry
//! (spec §2 component 2, GLOSSARY "Participant registry").
//!
//! The real participant/procarray registry is out of scope (spec §1);
//! `serin_txn` only needs a handle it can insert into and remove from
//! it. Design Notes §9 calls for an explicit trait here instead of the
//! original's "first-field cast" between a participant pointer and a
//! `gxact` pointer.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::RwLock;

use crate::registry::Xid;

/// Minimal participant record a prepared transaction contributes to
/// the live registry, just enough for it to keep appearing
/// "in progress" until finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DummyParticipant {
    /// The top-level transaction id this dummy stands in for.
    pub xid: Xid,
}

/// Anything that can expose a [`DummyParticipant`] handle.
///
/// `Gxact` implements this by returning a reference to its embedded
/// field, the safe equivalent of the original's pointer-punned
/// first-field cast.
pub trait HasDummyParticipant {
    /// Borrow the embedded dummy participant record.
    fn dummy_participant(&self) -> &DummyParticipant;
}

/// Interface onto the live transaction/participant registry
/// (`procarray`). Out of scope to implement for real; `serin_txn` only
/// depends on this trait.
#[async_trait]
pub trait ParticipantRegistry: Send + Sync {
    /// Insert a dummy participant so its XID continues to read as
    /// in-progress.
    async fn insert(&self, participant: DummyParticipant);

    /// Remove a dummy participant once its transaction has finished.
    async fn remove(&self, xid: Xid);

    /// Whether `xid` currently appears in the registry.
    async fn contains(&self, xid: Xid) -> bool;
}

/// In-memory `ParticipantRegistry`, in the style of
/// `serin_meta::ShardMapStore`'s `RwLock<HashMap>`.
#[derive(Default)]
pub struct InMemoryParticipantRegistry {
    xids: RwLock<HashSet<Xid>>,
}

impl InMemoryParticipantRegistry {
    /// Construct an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ParticipantRegistry for InMemoryParticipantRegistry {
    async fn insert(&self, participant: DummyParticipant) {
        self.xids.write().unwrap().insert(participant.xid);
    }

    async fn remove(&self, xid: Xid) {
        self.xids.write().unwrap().remove(&xid);
    }

    async fn contains(&self, xid: Xid) -> bool {
        self.xids.read().unwrap().contains(&xid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_then_remove_round_trips() {
        let reg = InMemoryParticipantRegistry::new();
        let p = DummyParticipant { xid: Xid(5) };
        reg.insert(p).await;
        assert!(reg.contains(Xid(5)).await);
        reg.remove(Xid(5)).await;
        assert!(!reg.contains(Xid(5)).await);
    }
}
