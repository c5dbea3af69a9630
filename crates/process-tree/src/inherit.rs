//! Lazy, memoized resolution of inherited identities.
//!
//! When a rule marks an executable as applying to its children, every
//! descendant must be judged under that executable's path. Resolution is
//! deferred until a process is created: the walk climbs the ancestor
//! chain until it finds a node whose resolution was already attempted
//! (`INHERIT_CHECKED`), then unwinds, evaluating each ancestor's image
//! path against the rule matcher and propagating identities downwards.
//!
//! Fetching an ancestor's image path blocks, so the tree lock is dropped
//! around every [`ProcessSource`] call. Nodes are recycled slots, not
//! stable references: after re-acquiring the lock each `(slot, pid)`
//! pair is revalidated, and a resolution touching a since-exited node is
//! abandoned silently.

use std::sync::Mutex;

use agent_common::Pid;

use crate::rules::{RuleMatcher, RuleProvider};
use crate::source::ProcessSource;
use crate::store::NodeFlags;
use crate::tracker::{lock_state, TreeState};

/// Ceiling on the ancestor walk, against ppid cycles and degenerate
/// trees.
const MAX_ANCESTRY_DEPTH: usize = 64;

/// One step of the ancestor chain, captured under the lock during the
/// climb.
struct Frame {
    slot: usize,
    pid: Pid,
    parent_slot: usize,
    parent_pid: Pid,
    /// The parent had not been resolved yet and this node had no
    /// identity when the frame was captured, so the unwind must evaluate
    /// the parent before attaching.
    check_parent: bool,
}

/// Resolves the identity a newly created node should be judged under.
/// Invoked with the tree lock not held.
pub(crate) fn resolve_inheritance(
    state: &Mutex<TreeState>,
    source: &dyn ProcessSource,
    rules: &dyn RuleProvider,
    slot: usize,
    pid: Pid,
) {
    // filtering inactive: leave the node unresolved
    let Some(matcher) = rules.current() else {
        return;
    };

    let mut chain: Vec<Frame> = Vec::new();
    let (mut cur_slot, mut cur_pid) = (slot, pid);

    loop {
        if chain.len() >= MAX_ANCESTRY_DEPTH {
            log::warn!("ancestry of process {pid} deeper than {MAX_ANCESTRY_DEPTH}, truncating");
            break;
        }

        let frame = {
            let state = lock_state(state);
            if !state.store.matches(cur_slot, cur_pid) {
                break;
            }
            let node = state.store.get(cur_slot);
            let ppid = node.ppid;
            let identity_unset = node.identity.is_none();
            if ppid == cur_pid {
                break;
            }
            let Some(parent_slot) = state.store.find(ppid) else {
                break;
            };
            let parent_checked = state
                .store
                .get(parent_slot)
                .flags
                .contains(NodeFlags::INHERIT_CHECKED);
            Frame {
                slot: cur_slot,
                pid: cur_pid,
                parent_slot,
                parent_pid: ppid,
                check_parent: !parent_checked && identity_unset,
            }
        };

        let climb = frame.check_parent;
        (cur_slot, cur_pid) = (frame.parent_slot, frame.parent_pid);
        chain.push(frame);
        if !climb {
            break;
        }
    }

    // unwind root-first so each attach sees the parent's final state
    for frame in chain.iter().rev() {
        if frame.check_parent {
            evaluate_parent(state, source, &*matcher, frame.parent_slot, frame.parent_pid);
        }
        attach_inherited(state, frame);
    }
}

/// Fetches the parent's image path (lock dropped) and records whether
/// its rules extend to children. A failed OS query still marks the node
/// as checked: there is nothing to retry, the node simply grants no
/// inheritance.
fn evaluate_parent(
    state: &Mutex<TreeState>,
    source: &dyn ProcessSource,
    matcher: &dyn RuleMatcher,
    parent_slot: usize,
    parent_pid: Pid,
) {
    let path = match source.image_path(parent_pid) {
        Ok(path) => Some(path),
        Err(err) => {
            log::debug!("image path of process {parent_pid} unavailable: {err}");
            None
        }
    };

    let mut state = lock_state(state);
    if !state.store.matches(parent_slot, parent_pid) {
        return;
    }

    let TreeState { store, pool } = &mut *state;
    let node = store.get_mut(parent_slot);
    node.flags.insert(NodeFlags::INHERIT_CHECKED);

    // service nodes keep their synthetic identity and never grant their
    // own path to children
    if node.flags.contains(NodeFlags::CUSTOM) {
        return;
    }

    if let Some(path) = path {
        if matcher.applies_to_children(&path) {
            match pool.alloc(&path) {
                Ok(id) => {
                    if let Some(old) = node.identity.replace(id) {
                        pool.release(old);
                    }
                    node.flags.insert(NodeFlags::INHERIT);
                }
                Err(err) => {
                    log::warn!("dropping inheritable identity for process {parent_pid}: {err}")
                }
            }
        }
    }
}

/// Attaches the parent's identity to the child when the parent either
/// originates an inheritance grant or inherited one itself.
fn attach_inherited(state: &Mutex<TreeState>, frame: &Frame) {
    let mut state = lock_state(state);
    if !state.store.matches(frame.slot, frame.pid)
        || !state.store.matches(frame.parent_slot, frame.parent_pid)
    {
        return;
    }

    let parent = state.store.get(frame.parent_slot);
    if !parent.flags.intersects(NodeFlags::INHERIT | NodeFlags::INHERITED) {
        return;
    }
    let Some(identity) = parent.identity else {
        log::warn!(
            "process {} grants inheritance but holds no identity",
            frame.parent_pid
        );
        return;
    };

    let TreeState { store, pool } = &mut *state;
    // retain before a possible release of the same record
    pool.retain(identity);
    let child = store.get_mut(frame.slot);
    if let Some(old) = child.identity.replace(identity) {
        pool.release(old);
    }
    child.flags.insert(NodeFlags::INHERIT_CHECKED | NodeFlags::INHERITED);
}
