//! Lifecycle tree: rosters, detach, and the shutdown broadcast.
//!
//! Nodes (listeners, connections) are attached to their parent's roster,
//! which holds the only strong reference besides whoever is actively
//! using the node. A node's [`Attachment`] points back at the roster
//! weakly, so detaching removes the strong reference without a cycle and
//! destruction follows once the remaining holders drop.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// A lifecycle participant that can receive the shutdown broadcast.
///
/// `asap` and `now` are the epoch seconds the respective phases were
/// requested at, zero when not yet requested. `asap` stops new work while
/// letting in-flight handlers finish; `now` forces teardown.
pub trait Node: Send + Sync {
    fn shutdown(&self, asap: i64, now: i64);
}

struct RosterInner {
    members: Mutex<HashMap<u64, Arc<dyn Node>>>,
    next_id: AtomicU64,
}

/// Strong child ownership for one parent node.
#[derive(Clone)]
pub struct Roster {
    inner: Arc<RosterInner>,
}

impl Roster {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RosterInner {
                members: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Adds a node and returns the handle it later detaches with.
    pub fn attach(&self, node: Arc<dyn Node>) -> Attachment {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.members.lock().insert(id, node);
        Attachment {
            roster: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.members.lock().is_empty()
    }

    /// Broadcasts the shutdown phases to every member.
    ///
    /// Members are snapshotted first so a node detaching from inside its
    /// own shutdown does not deadlock the roster lock.
    pub fn shutdown_all(&self, asap: i64, now: i64) {
        let members: Vec<Arc<dyn Node>> = self.inner.members.lock().values().cloned().collect();
        for member in members {
            member.shutdown(asap, now);
        }
    }
}

impl Default for Roster {
    fn default() -> Self {
        Self::new()
    }
}

/// A node's membership in its parent roster.
#[derive(Clone)]
pub struct Attachment {
    roster: Weak<RosterInner>,
    id: u64,
}

impl Attachment {
    /// A handle that was never attached anywhere; detach is a no-op.
    pub fn detached() -> Self {
        Self {
            roster: Weak::new(),
            id: 0,
        }
    }

    /// Removes the node from its parent roster. Idempotent; returns true
    /// if this call removed the membership. Callers that raced a still
    /// running handler simply call this again later.
    pub fn detach(&self) -> bool {
        match self.roster.upgrade() {
            Some(roster) => roster.members.lock().remove(&self.id).is_some(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    struct Probe {
        asap: AtomicI64,
        now: AtomicI64,
    }

    impl Probe {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                asap: AtomicI64::new(0),
                now: AtomicI64::new(0),
            })
        }
    }

    impl Node for Probe {
        fn shutdown(&self, asap: i64, now: i64) {
            self.asap.store(asap, Ordering::SeqCst);
            self.now.store(now, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_attach_detach() {
        let roster = Roster::new();
        let probe = Probe::new();
        let attachment = roster.attach(probe.clone());
        assert_eq!(roster.len(), 1);

        assert!(attachment.detach());
        assert!(roster.is_empty());

        // Second detach is a no-op.
        assert!(!attachment.detach());
    }

    #[test]
    fn test_shutdown_broadcast() {
        let roster = Roster::new();
        let a = Probe::new();
        let b = Probe::new();
        let _at_a = roster.attach(a.clone());
        let _at_b = roster.attach(b.clone());

        roster.shutdown_all(100, 0);
        assert_eq!(a.asap.load(Ordering::SeqCst), 100);
        assert_eq!(b.asap.load(Ordering::SeqCst), 100);
        assert_eq!(a.now.load(Ordering::SeqCst), 0);

        roster.shutdown_all(100, 200);
        assert_eq!(b.now.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn test_detach_releases_strong_ref() {
        let roster = Roster::new();
        let probe = Probe::new();
        let weak = Arc::downgrade(&probe);
        let attachment = roster.attach(probe.clone());

        drop(probe);
        assert!(weak.upgrade().is_some(), "roster still holds the node");

        attachment.detach();
        assert!(weak.upgrade().is_none(), "last strong ref released");
    }

    #[test]
    fn test_never_attached_handle() {
        let attachment = Attachment::detached();
        assert!(!attachment.detach());
    }
}
