//! Resource-manager callback registration (spec §3 "Registered 2PC
//! Callback Tables", §6 "Resource-manager interface").
//!
//! Each resource manager (locks, notify, ...) that needs its own
//! recovery state in a prepared transaction's state file registers up
//! to three callbacks here, indexed by a stable [`ResourceManagerId`].
//! The resource managers themselves are out of scope (spec §1); this
//! module only owns the registration tables and the dispatch.

use std::sync::RwLock;

use crate::registry::Xid;

/// Maximum number of distinct resource managers (compile-time bound,
/// spec §3).
pub const MAX_RESOURCE_MANAGERS: usize = 16;

/// Reserved id marking the end-of-record sentinel in the state file.
pub const END_ID: u8 = 255;

/// Stable identifier for a resource manager's 2PC callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceManagerId(pub u8);

impl ResourceManagerId {
    fn index(self) -> Option<usize> {
        if self.0 as usize >= MAX_RESOURCE_MANAGERS || self.0 == END_ID {
            None
        } else {
            Some(self.0 as usize)
        }
    }
}

/// Callback invoked once per resource-manager record, `post_commit`,
/// `post_abort` or `recover` depending on context.
pub type RmgrCallback = fn(xid: Xid, info: u32, payload: &[u8]);

#[derive(Default, Clone, Copy)]
struct CallbackSet {
    post_commit: Option<RmgrCallback>,
    post_abort: Option<RmgrCallback>,
    recover: Option<RmgrCallback>,
}

/// Registry of resource-manager 2PC callbacks, indexed by `rmid`.
///
/// Modeled as three parallel fixed arrays per spec §3, rather than a
/// `HashMap`, since `rmid` space is small and bounded at compile time.
pub struct RmgrTable {
    slots: RwLock<[CallbackSet; MAX_RESOURCE_MANAGERS]>,
}

impl Default for RmgrTable {
    fn default() -> Self {
        Self {
            slots: RwLock::new([CallbackSet::default(); MAX_RESOURCE_MANAGERS]),
        }
    }
}

impl RmgrTable {
    /// Construct an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource manager's callbacks. Passing `None` for a
    /// callback means that resource manager does not act at that phase.
    pub fn register(
        &self,
        rmid: ResourceManagerId,
        post_commit: Option<RmgrCallback>,
        post_abort: Option<RmgrCallback>,
        recover: Option<RmgrCallback>,
    ) {
        let idx = rmid.index().expect("rmid out of range or reserved END_ID");
        let mut slots = self.slots.write().unwrap();
        slots[idx] = CallbackSet { post_commit, post_abort, recover };
    }

    /// Invoke the `post_commit` callback for `rmid`, if one is registered.
    pub fn invoke_post_commit(&self, rmid: ResourceManagerId, xid: Xid, info: u32, payload: &[u8]) {
        if let Some(idx) = rmid.index() {
            if let Some(cb) = self.slots.read().unwrap()[idx].post_commit {
                cb(xid, info, payload);
            }
        }
    }

    /// Invoke the `post_abort` callback for `rmid`, if one is registered.
    pub fn invoke_post_abort(&self, rmid: ResourceManagerId, xid: Xid, info: u32, payload: &[u8]) {
        if let Some(idx) = rmid.index() {
            if let Some(cb) = self.slots.read().unwrap()[idx].post_abort {
                cb(xid, info, payload);
            }
        }
    }

    /// Invoke the `recover` callback for `rmid`, if one is registered.
    pub fn invoke_recover(&self, rmid: ResourceManagerId, xid: Xid, info: u32, payload: &[u8]) {
        if let Some(idx) = rmid.index() {
            if let Some(cb) = self.slots.read().unwrap()[idx].recover {
                cb(xid, info, payload);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static RECOVER_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn recover_cb(_xid: Xid, _info: u32, _payload: &[u8]) {
        RECOVER_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn dispatches_registered_recover_callback() {
        let table = RmgrTable::new();
        let lock_rmgr = ResourceManagerId(2);
        table.register(lock_rmgr, None, None, Some(recover_cb));
        let before = RECOVER_CALLS.load(Ordering::SeqCst);
        table.invoke_recover(lock_rmgr, Xid(7), 0, &[]);
        assert_eq!(RECOVER_CALLS.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn unregistered_rmid_is_a_silent_noop() {
        let table = RmgrTable::new();
        table.invoke_post_commit(ResourceManagerId(5), Xid(1), 0, &[]);
    }

    #[test]
    #[should_panic]
    fn registering_end_id_panics() {
        let table = RmgrTable::new();
        table.register(ResourceManagerId(END_ID), None, None, None);
    }
}
