//! Storage for live process nodes.
//!
//! Nodes live in a growable slot array; removed nodes go on a free list
//! and are reused before the array grows, so steady-state process churn
//! does not allocate. A pid-keyed hash index maps to slots. A `(slot,
//! pid)` pair works as a revalidation token: after the tree lock has been
//! dropped and re-acquired, `matches` tells whether the slot still holds
//! the same process or was recycled in between.

use std::collections::HashMap;
use std::ops::BitOr;

use agent_common::Pid;
use thiserror::Error;

use crate::identity::{IdentityId, IdentityPool};

/// Bitset of per-node name-resolution states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct NodeFlags(u16);

impl NodeFlags {
    /// Inheritance resolution has been attempted for this node.
    pub(crate) const INHERIT_CHECKED: NodeFlags = NodeFlags(0x0001);
    /// This node's own path is force-inherited by its children.
    pub(crate) const INHERIT: NodeFlags = NodeFlags(0x0002);
    /// This node's identity was inherited from an ancestor.
    pub(crate) const INHERITED: NodeFlags = NodeFlags(0x0004);
    /// The identity is a synthetic service name.
    pub(crate) const CUSTOM: NodeFlags = NodeFlags(0x0008);

    pub(crate) fn contains(self, other: NodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn intersects(self, other: NodeFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub(crate) fn insert(&mut self, other: NodeFlags) {
        self.0 |= other.0;
    }
}

impl BitOr for NodeFlags {
    type Output = NodeFlags;
    fn bitor(self, rhs: NodeFlags) -> NodeFlags {
        NodeFlags(self.0 | rhs.0)
    }
}

/// One live process. The pid and parent pid are fixed at creation; the
/// identity is attached lazily by service-name derivation or inheritance
/// resolution.
#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) pid: Pid,
    pub(crate) ppid: Pid,
    pub(crate) identity: Option<IdentityId>,
    pub(crate) flags: NodeFlags,
}

#[derive(Error, Debug)]
pub(crate) enum StoreError {
    #[error("process table full ({max} nodes)")]
    OutOfMemory { max: usize },
    #[error("process {0} already tracked")]
    DuplicatePid(Pid),
}

pub(crate) struct NodeStore {
    slots: Vec<Node>,
    free: Vec<usize>,
    index: HashMap<Pid, usize>,
    max_nodes: usize,
}

const FREE_PID: Pid = Pid::from_raw(0);

impl NodeStore {
    pub(crate) fn new(max_nodes: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            max_nodes,
        }
    }

    /// Slot of the live node for `pid`, if any.
    pub(crate) fn find(&self, pid: Pid) -> Option<usize> {
        if pid == FREE_PID {
            return None;
        }
        self.index.get(&pid).copied()
    }

    pub(crate) fn get(&self, slot: usize) -> &Node {
        &self.slots[slot]
    }

    pub(crate) fn get_mut(&mut self, slot: usize) -> &mut Node {
        &mut self.slots[slot]
    }

    /// Whether `slot` still holds the node observed as `pid` before the
    /// tree lock was dropped.
    pub(crate) fn matches(&self, slot: usize, pid: Pid) -> bool {
        pid != FREE_PID && self.slots.get(slot).is_some_and(|node| node.pid == pid)
    }

    /// Creates a node for `pid`, reusing a free slot when one exists.
    pub(crate) fn insert(&mut self, pid: Pid, ppid: Pid) -> Result<usize, StoreError> {
        if self.index.contains_key(&pid) {
            return Err(StoreError::DuplicatePid(pid));
        }

        let node = Node {
            pid,
            ppid,
            identity: None,
            flags: NodeFlags::default(),
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = node;
                slot
            }
            None => {
                if self.slots.len() >= self.max_nodes {
                    return Err(StoreError::OutOfMemory {
                        max: self.max_nodes,
                    });
                }
                self.slots.push(node);
                self.slots.len() - 1
            }
        };
        self.index.insert(pid, slot);
        Ok(slot)
    }

    /// Removes the node at `slot`, releasing its identity reference and
    /// pushing the slot onto the free list.
    pub(crate) fn remove(&mut self, slot: usize, pool: &mut IdentityPool) {
        let node = &mut self.slots[slot];
        if let Some(id) = node.identity.take() {
            pool.release(id);
        }
        let pid = std::mem::replace(&mut node.pid, FREE_PID);
        node.ppid = FREE_PID;
        node.flags = NodeFlags::default();

        self.index.remove(&pid);
        self.free.push(slot);
    }

    /// Number of live nodes.
    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    /// Removes every node, releasing all identity references.
    pub(crate) fn clear(&mut self, pool: &mut IdentityPool) {
        let live: Vec<usize> = self.index.values().copied().collect();
        for slot in live {
            self.remove(slot, pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(raw: i32) -> Pid {
        Pid::from_raw(raw)
    }

    #[test]
    fn insert_then_find_then_remove() {
        let mut pool = IdentityPool::new(1024);
        let mut store = NodeStore::new(16);

        let slot = store.insert(pid(10), pid(1)).unwrap();
        assert_eq!(store.find(pid(10)), Some(slot));
        assert_eq!(store.get(slot).ppid, pid(1));

        store.remove(slot, &mut pool);
        assert_eq!(store.find(pid(10)), None);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn duplicate_pid_is_rejected() {
        let mut store = NodeStore::new(16);
        store.insert(pid(10), pid(1)).unwrap();
        assert!(matches!(
            store.insert(pid(10), pid(2)),
            Err(StoreError::DuplicatePid(p)) if p == pid(10)
        ));
    }

    #[test]
    fn free_slots_are_reused_before_growth() {
        let mut pool = IdentityPool::new(1024);
        let mut store = NodeStore::new(16);

        let slot = store.insert(pid(10), pid(1)).unwrap();
        store.remove(slot, &mut pool);
        let reused = store.insert(pid(11), pid(1)).unwrap();
        assert_eq!(slot, reused);
    }

    #[test]
    fn node_cap_is_enforced() {
        let mut store = NodeStore::new(1);
        store.insert(pid(10), pid(1)).unwrap();
        assert!(matches!(
            store.insert(pid(11), pid(1)),
            Err(StoreError::OutOfMemory { max: 1 })
        ));
    }

    #[test]
    fn removal_releases_the_identity_reference() {
        let mut pool = IdentityPool::new(1024);
        let mut store = NodeStore::new(16);

        let slot = store.insert(pid(10), pid(1)).unwrap();
        let id = pool.alloc("/usr/bin/nginx").unwrap();
        store.get_mut(slot).identity = Some(id);

        store.remove(slot, &mut pool);
        assert_eq!(pool.live_records(), 0);
    }

    #[test]
    fn recycled_slot_fails_revalidation() {
        let mut pool = IdentityPool::new(1024);
        let mut store = NodeStore::new(16);

        let slot = store.insert(pid(10), pid(1)).unwrap();
        assert!(store.matches(slot, pid(10)));

        store.remove(slot, &mut pool);
        assert!(!store.matches(slot, pid(10)));

        store.insert(pid(11), pid(1)).unwrap();
        assert!(!store.matches(slot, pid(10)));
        assert!(store.matches(slot, pid(11)));
    }
}
