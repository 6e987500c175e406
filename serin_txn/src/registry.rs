//! Shared Registry: the process-wide, fixed-capacity table of global
//! transaction slots (spec §2 component 1, §4.1).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Mutex, RwLock};

use crate::config::TwoPhaseConfig;
use crate::error::{Result, TwoPhaseError};
use crate::gid::Gid;
use crate::participant::{DummyParticipant, HasDummyParticipant};

/// Server-assigned top-level transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Xid(pub u32);

impl std::fmt::Display for Xid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Xid {
    /// Format as the eight uppercase hex digits used for state-file names
    /// (spec §3 State File, §6 on-disk layout).
    pub fn to_hex_filename(self) -> String {
        format!("{:08X}", self.0)
    }

    /// Parse a state-file name back into an `Xid`. Only accepts exactly
    /// eight hex digits, matching the `^[0-9A-F]{8}$` pattern from
    /// spec §4.5.
    pub fn from_hex_filename(name: &str) -> Option<Self> {
        if name.len() != 8 || !name.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_lowercase()) {
            return None;
        }
        u32::from_str_radix(name, 16).ok().map(Xid)
    }
}

/// Database identifier a prepared transaction belongs to.
pub type DatabaseId = u32;

/// Authenticated user identifier.
pub type UserId = u32;

/// Maximum number of subtransaction XIDs cached directly on a `Gxact`
/// before the overflow flag is set (spec §3 "bounded cache").
pub const CHILDREN_CACHE_SIZE: usize = 64;

/// One in-flight or prepared global transaction (spec §3 `gxact`).
#[derive(Debug, Clone)]
pub struct Gxact {
    participant: DummyParticipant,
    xid: Xid,
    database: DatabaseId,
    owner: UserId,
    locking_xid: Option<Xid>,
    valid: bool,
    gid: Gid,
    children: Vec<Xid>,
    children_overflowed: bool,
}

impl Gxact {
    /// Transaction identifier.
    pub fn xid(&self) -> Xid {
        self.xid
    }

    /// Owning database.
    pub fn database(&self) -> DatabaseId {
        self.database
    }

    /// Authenticated owner.
    pub fn owner(&self) -> UserId {
        self.owner
    }

    /// Global identifier.
    pub fn gid(&self) -> &Gid {
        &self.gid
    }

    /// `true` once `mark_prepared` has run.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Current driving backend, if the slot is locked.
    pub fn locking_xid(&self) -> Option<Xid> {
        self.locking_xid
    }

    /// Cached subtransaction children (may be incomplete; see
    /// [`Gxact::children_overflowed`]).
    pub fn children(&self) -> &[Xid] {
        &self.children
    }

    /// Whether more children existed than [`CHILDREN_CACHE_SIZE`] could hold.
    pub fn children_overflowed(&self) -> bool {
        self.children_overflowed
    }

    /// Record a subtransaction child, honoring the cache bound.
    pub fn push_child(&mut self, xid: Xid) {
        if self.children.len() < CHILDREN_CACHE_SIZE {
            self.children.push(xid);
        } else {
            self.children_overflowed = true;
        }
    }
}

impl HasDummyParticipant for Gxact {
    fn dummy_participant(&self) -> &DummyParticipant {
        &self.participant
    }
}

/// Opaque handle to a registry slot, returned by [`GxactRegistry::reserve`]
/// and consumed by [`GxactRegistry::mark_prepared`] and
/// [`GxactRegistry::remove`].
///
/// Carries the slot's `xid` alongside its array index so a stale handle
/// (slot since reused) is detected rather than silently operating on
/// the wrong transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GxactHandle {
    index: usize,
    xid: Xid,
}

impl GxactHandle {
    /// The transaction this handle was issued for.
    pub fn xid(&self) -> Xid {
        self.xid
    }
}

/// Tells the registry whether a given XID still names a live backend
/// session. Out of scope to implement for real (that's `procarray`'s
/// job); `serin_txn` only depends on this trait.
pub trait XidLiveness: Send + Sync {
    /// Whether `xid` currently names a live, running backend.
    fn is_active(&self, xid: Xid) -> bool;
}

/// Fixed-set `XidLiveness` for tests and standalone demonstrations.
#[derive(Default)]
pub struct FixedLiveness(Mutex<HashSet<Xid>>);

impl FixedLiveness {
    /// Construct a liveness view where no XID is active.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `xid` as an active backend.
    pub fn mark_active(&self, xid: Xid) {
        self.0.lock().unwrap().insert(xid);
    }

    /// Mark `xid` as no longer active (backend exited or crashed).
    pub fn mark_inactive(&self, xid: Xid) {
        self.0.lock().unwrap().remove(&xid);
    }
}

impl XidLiveness for FixedLiveness {
    fn is_active(&self, xid: Xid) -> bool {
        self.0.lock().unwrap().contains(&xid)
    }
}

struct Slot {
    gxact: Option<Gxact>,
    next_free: usize,
}

/// Sentinel meaning "no further free slot" in the intrusive free list
/// (Design Notes §9: arena + index, no pointers).
const NIL: usize = usize::MAX;

struct Inner {
    slots: Vec<Slot>,
    free_head: usize,
    used: Vec<usize>,
}

/// The process-wide prepared-transaction registry (spec §2 component 1,
/// §4.1). One registry-wide reader/writer lock protects all slot
/// maintenance; it is never held across I/O, WAL, or callbacks.
pub struct GxactRegistry {
    capacity: usize,
    inner: RwLock<Inner>,
    participant_cache: Mutex<Option<(Xid, DummyParticipant)>>,
}

impl GxactRegistry {
    /// Build an empty registry with capacity taken from `config`.
    pub fn new(config: &TwoPhaseConfig) -> Self {
        let capacity = config.capacity();
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(Slot {
                gxact: None,
                next_free: if i + 1 < capacity { i + 1 } else { NIL },
            });
        }
        Self {
            capacity,
            inner: RwLock::new(Inner {
                slots,
                free_head: if capacity == 0 { NIL } else { 0 },
                used: Vec::with_capacity(capacity),
            }),
            participant_cache: Mutex::new(None),
        }
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserve a slot for a new (or recovering) global transaction.
    ///
    /// First sweeps the used array for dead prepares (`valid == false`
    /// and `locking_xid` no longer active) and reclaims them, then
    /// checks for a `gid` collision against every remaining entry
    /// regardless of validity, then pops the free list.
    pub fn reserve(
        &self,
        xid: Xid,
        database: DatabaseId,
        gid: Gid,
        owner: UserId,
        liveness: &dyn XidLiveness,
    ) -> Result<GxactHandle> {
        let mut inner = self.inner.write().unwrap();

        // Sweep: reclaim prepares whose driving backend died before mark_prepared.
        let mut dead = Vec::new();
        for &idx in &inner.used {
            let g = inner.slots[idx].gxact.as_ref().expect("used index always populated");
            let stale = !g.valid
                && g.locking_xid
                    .map(|lx| !liveness.is_active(lx))
                    .unwrap_or(false);
            if stale {
                dead.push((idx, g.xid));
            }
        }
        for (idx, dead_xid) in dead {
            Self::evict_locked(&mut inner, idx);
            self.invalidate_participant_cache(dead_xid);
        }

        // Duplicate-GID check against every remaining entry.
        if inner
            .used
            .iter()
            .any(|&idx| inner.slots[idx].gxact.as_ref().unwrap().gid == gid)
        {
            return Err(TwoPhaseError::DuplicateGid(gid));
        }

        let free_idx = inner.free_head;
        if free_idx == NIL {
            return Err(TwoPhaseError::OutOfSlots { capacity: self.capacity });
        }
        inner.free_head = inner.slots[free_idx].next_free;

        let gxact = Gxact {
            participant: DummyParticipant { xid },
            xid,
            database,
            owner,
            locking_xid: Some(xid),
            valid: false,
            gid,
            children: Vec::new(),
            children_overflowed: false,
        };
        inner.slots[free_idx].gxact = Some(gxact);
        inner.used.push(free_idx);

        Ok(GxactHandle { index: free_idx, xid })
    }

    /// Promote a reserved slot to `valid = true` (spec §4.1 `mark_prepared`).
    ///
    /// Returns the now-valid entry's [`DummyParticipant`] so the caller
    /// can insert it into the live participant registry outside this
    /// lock, per spec.
    pub fn mark_prepared(&self, handle: GxactHandle) -> Result<DummyParticipant> {
        let mut inner = self.inner.write().unwrap();
        let g = Self::slot_mut(&mut inner, handle)?;
        assert!(!g.valid, "mark_prepared called on an already-valid gxact");
        g.valid = true;
        Ok(g.participant)
    }

    /// Lock a valid entry for FINISH (spec §4.1 `lock_for_finish`).
    ///
    /// Fails `Busy` if the current driver is still active, silently
    /// reclaims the slot if the previous driver died mid-flight,
    /// authorizes the caller, then stamps `locking_xid`.
    pub fn lock_for_finish(
        &self,
        gid: &Gid,
        user: UserId,
        is_superuser: bool,
        caller_xid: Xid,
        liveness: &dyn XidLiveness,
    ) -> Result<GxactHandle> {
        let mut inner = self.inner.write().unwrap();
        let idx = inner
            .used
            .iter()
            .copied()
            .find(|&idx| {
                let g = inner.slots[idx].gxact.as_ref().unwrap();
                g.valid && &g.gid == gid
            })
            .ok_or_else(|| TwoPhaseError::NoSuchGid(gid.clone()))?;

        {
            let g = inner.slots[idx].gxact.as_ref().unwrap();
            if let Some(lx) = g.locking_xid {
                if liveness.is_active(lx) {
                    return Err(TwoPhaseError::Busy(gid.clone()));
                }
                // Previous driver died between lock and commit: reapable.
            }
            if g.owner != user && !is_superuser {
                return Err(TwoPhaseError::PermissionDenied { gid: gid.clone(), owner: g.owner });
            }
        }

        let g = inner.slots[idx].gxact.as_mut().unwrap();
        g.locking_xid = Some(caller_xid);
        let xid = g.xid;
        Ok(GxactHandle { index: idx, xid })
    }

    /// Remove a slot entirely, returning it to the free list (spec §4.1 `remove`).
    pub fn remove(&self, handle: GxactHandle) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        Self::check_handle(&inner, handle)?;
        Self::evict_locked(&mut inner, handle.index);
        self.invalidate_participant_cache(handle.xid());
        Ok(())
    }

    /// Populate a reserved or recovered slot's cached children (spec
    /// §4.2 `start_prepare`: "children are also copied into the gxact's
    /// dummy participant cache", spec §4.5 recovery re-population).
    /// Subject to the same [`CHILDREN_CACHE_SIZE`] bound as
    /// [`Gxact::push_child`].
    pub fn set_children(&self, handle: GxactHandle, children: &[Xid]) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let g = Self::slot_mut(&mut inner, handle)?;
        for &child in children {
            g.push_child(child);
        }
        Ok(())
    }

    /// Mark a slot invalid without freeing it (spec §4.4 step 9): if a
    /// post-commit/post-abort callback later fails, the slot is clearly
    /// dead and will be reaped by a future `reserve` sweep rather than
    /// silently looking like a live prepared transaction.
    pub fn invalidate(&self, handle: GxactHandle) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let g = Self::slot_mut(&mut inner, handle)?;
        g.valid = false;
        Ok(())
    }

    /// Copy every used entry under a shared lock, for streaming to a
    /// client (`pg_prepared_xact()`, spec §6) without holding the lock.
    pub fn snapshot(&self) -> Vec<Gxact> {
        let inner = self.inner.read().unwrap();
        inner
            .used
            .iter()
            .map(|&idx| inner.slots[idx].gxact.clone().unwrap())
            .collect()
    }

    /// Look up the dummy participant for `xid`, consulting (and
    /// refreshing) a single-entry cache first, since commit/abort and
    /// recovery repeatedly query the same XID (Design Notes §9).
    ///
    /// The cache is invalidated by [`GxactRegistry::remove`] and by the
    /// dead-prepare sweep in [`GxactRegistry::reserve`], so it never
    /// reports a participant for an `xid` whose slot has since been
    /// freed.
    pub fn dummy_participant_for(&self, xid: Xid) -> Option<DummyParticipant> {
        if let Some((cached_xid, participant)) = *self.participant_cache.lock().unwrap() {
            if cached_xid == xid {
                return Some(participant);
            }
        }
        let inner = self.inner.read().unwrap();
        let found = inner.used.iter().find_map(|&idx| {
            let g = inner.slots[idx].gxact.as_ref().unwrap();
            (g.xid == xid).then(|| g.participant)
        });
        if let Some(participant) = found {
            *self.participant_cache.lock().unwrap() = Some((xid, participant));
        }
        found
    }

    /// Clear the single-entry participant cache if it currently holds
    /// `xid`, so a freed slot can never be served back out of a stale
    /// cache entry.
    fn invalidate_participant_cache(&self, xid: Xid) {
        let mut cache = self.participant_cache.lock().unwrap();
        if matches!(*cache, Some((cached_xid, _)) if cached_xid == xid) {
            *cache = None;
        }
    }

    fn check_handle(inner: &Inner, handle: GxactHandle) -> Result<()> {
        match &inner.slots[handle.index].gxact {
            Some(g) if g.xid == handle.xid => Ok(()),
            _ => Err(TwoPhaseError::NoSuchGid(Gid::new(format!("<stale xid {}>", handle.xid)).unwrap())),
        }
    }

    fn slot_mut(inner: &mut Inner, handle: GxactHandle) -> Result<&mut Gxact> {
        match inner.slots[handle.index].gxact.as_mut() {
            Some(g) if g.xid == handle.xid => Ok(g),
            _ => Err(TwoPhaseError::NoSuchGid(Gid::new(format!("<stale xid {}>", handle.xid)).unwrap())),
        }
    }

    fn evict_locked(inner: &mut Inner, idx: usize) {
        inner.slots[idx].gxact = None;
        inner.slots[idx].next_free = inner.free_head;
        inner.free_head = idx;
        inner.used.swap_remove(inner.used.iter().position(|&u| u == idx).unwrap());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(capacity: usize) -> TwoPhaseConfig {
        TwoPhaseConfig {
            max_prepared_xacts: capacity,
            state_dir: std::path::PathBuf::from("/tmp/pg_twophase_test"),
        }
    }

    #[test]
    fn reserve_mark_and_snapshot() {
        let reg = GxactRegistry::new(&cfg(4));
        let liveness = FixedLiveness::new();
        let handle = reg
            .reserve(Xid(100), 1, Gid::new("g1").unwrap(), 42, &liveness)
            .unwrap();
        assert_eq!(reg.snapshot().len(), 0, "not valid until mark_prepared");
        reg.mark_prepared(handle).unwrap();
        let snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        assert!(snap[0].is_valid());
        assert_eq!(snap[0].gid().as_str(), "g1");
    }

    #[test]
    fn duplicate_gid_rejected() {
        let reg = GxactRegistry::new(&cfg(4));
        let liveness = FixedLiveness::new();
        reg.reserve(Xid(1), 1, Gid::new("dup").unwrap(), 1, &liveness).unwrap();
        let err = reg
            .reserve(Xid(2), 1, Gid::new("dup").unwrap(), 1, &liveness)
            .unwrap_err();
        assert!(matches!(err, TwoPhaseError::DuplicateGid(_)));
    }

    #[test]
    fn out_of_slots_when_capacity_exhausted() {
        let reg = GxactRegistry::new(&cfg(1));
        let liveness = FixedLiveness::new();
        reg.reserve(Xid(1), 1, Gid::new("a").unwrap(), 1, &liveness).unwrap();
        let err = reg
            .reserve(Xid(2), 1, Gid::new("b").unwrap(), 1, &liveness)
            .unwrap_err();
        assert!(matches!(err, TwoPhaseError::OutOfSlots { capacity: 1 }));
    }

    #[test]
    fn dead_prepare_is_swept_on_next_reserve() {
        let reg = GxactRegistry::new(&cfg(1));
        let liveness = FixedLiveness::new();
        liveness.mark_active(Xid(1));
        reg.reserve(Xid(1), 1, Gid::new("dead").unwrap(), 1, &liveness).unwrap();
        // Backend 1 crashed before mark_prepared: no longer active.
        liveness.mark_inactive(Xid(1));
        // A new reserve should reclaim the dead slot instead of erroring.
        let handle = reg
            .reserve(Xid(2), 1, Gid::new("alive").unwrap(), 1, &liveness)
            .unwrap();
        reg.mark_prepared(handle).unwrap();
        let snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].gid().as_str(), "alive");
    }

    #[test]
    fn lock_for_finish_busy_then_reapable() {
        let reg = GxactRegistry::new(&cfg(4));
        let liveness = FixedLiveness::new();
        let handle = reg
            .reserve(Xid(1), 1, Gid::new("g1").unwrap(), 7, &liveness)
            .unwrap();
        reg.mark_prepared(handle).unwrap();
        liveness.mark_active(Xid(1));
        let busy = reg.lock_for_finish(&Gid::new("g1").unwrap(), 7, false, Xid(2), &liveness);
        assert!(matches!(busy, Err(TwoPhaseError::Busy(_))));

        liveness.mark_inactive(Xid(1));
        let locked = reg
            .lock_for_finish(&Gid::new("g1").unwrap(), 7, false, Xid(2), &liveness)
            .unwrap();
        assert_eq!(locked.xid(), Xid(1));
    }

    #[test]
    fn lock_for_finish_permission_denied_for_non_owner() {
        let reg = GxactRegistry::new(&cfg(4));
        let liveness = FixedLiveness::new();
        let handle = reg
            .reserve(Xid(1), 1, Gid::new("g2").unwrap(), 7, &liveness)
            .unwrap();
        reg.mark_prepared(handle).unwrap();
        let err = reg.lock_for_finish(&Gid::new("g2").unwrap(), 999, false, Xid(2), &liveness);
        assert!(matches!(err, Err(TwoPhaseError::PermissionDenied { .. })));
        // Superuser may finish regardless of ownership.
        assert!(reg.lock_for_finish(&Gid::new("g2").unwrap(), 999, true, Xid(2), &liveness).is_ok());
    }

    #[test]
    fn remove_returns_slot_to_free_list() {
        let reg = GxactRegistry::new(&cfg(1));
        let liveness = FixedLiveness::new();
        let handle = reg
            .reserve(Xid(1), 1, Gid::new("g1").unwrap(), 1, &liveness)
            .unwrap();
        reg.mark_prepared(handle).unwrap();
        reg.remove(handle).unwrap();
        assert_eq!(reg.snapshot().len(), 0);
        // Freed slot is reusable.
        let handle2 = reg
            .reserve(Xid(2), 1, Gid::new("g2").unwrap(), 1, &liveness)
            .unwrap();
        reg.mark_prepared(handle2).unwrap();
        assert_eq!(reg.snapshot().len(), 1);
    }

    #[test]
    fn dummy_participant_cache_does_not_survive_remove() {
        let reg = GxactRegistry::new(&cfg(4));
        let liveness = FixedLiveness::new();
        let handle = reg
            .reserve(Xid(9), 1, Gid::new("g9").unwrap(), 1, &liveness)
            .unwrap();
        reg.mark_prepared(handle).unwrap();
        // Warm the cache, then free the slot; the cache must not keep
        // serving a participant for an xid the registry no longer knows.
        assert!(reg.dummy_participant_for(Xid(9)).is_some());
        reg.remove(handle).unwrap();
        assert!(reg.dummy_participant_for(Xid(9)).is_none());
    }

    #[test]
    fn dummy_participant_cache_hits_after_first_lookup() {
        let reg = GxactRegistry::new(&cfg(4));
        let liveness = FixedLiveness::new();
        let handle = reg
            .reserve(Xid(9), 1, Gid::new("g9").unwrap(), 1, &liveness)
            .unwrap();
        reg.mark_prepared(handle).unwrap();
        let p1 = reg.dummy_participant_for(Xid(9)).unwrap();
        let p2 = reg.dummy_participant_for(Xid(9)).unwrap();
        assert_eq!(p1, p2);
        assert!(reg.dummy_participant_for(Xid(404)).is_none());
    }

    #[test]
    fn set_children_caps_at_cache_size_and_flags_overflow() {
        let reg = GxactRegistry::new(&cfg(4));
        let liveness = FixedLiveness::new();
        let handle = reg
            .reserve(Xid(1), 1, Gid::new("withkids").unwrap(), 1, &liveness)
            .unwrap();
        let many: Vec<Xid> = (0..CHILDREN_CACHE_SIZE as u32 + 5).map(Xid).collect();
        reg.set_children(handle, &many).unwrap();
        reg.mark_prepared(handle).unwrap();
        let snap = reg.snapshot();
        assert_eq!(snap[0].children().len(), CHILDREN_CACHE_SIZE);
        assert!(snap[0].children_overflowed());
    }

    #[test]
    fn xid_hex_filename_roundtrip() {
        let xid = Xid(0xFFFE);
        let name = xid.to_hex_filename();
        assert_eq!(name, "0000FFFE");
        assert_eq!(Xid::from_hex_filename(&name), Some(xid));
        assert_eq!(Xid::from_hex_filename("not-hex!"), None);
    }
}
