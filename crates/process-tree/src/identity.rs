//! Pool of refcounted process-identity records.
//!
//! Every distinct identity assignment (an executable path, or a synthetic
//! service name) allocates one record here. Descendants inheriting the
//! identity bump the refcount instead of copying the string, so process
//! churn does not translate into per-event string churn. The pool is not
//! thread safe on its own: all calls happen while the tree lock is held.

use std::sync::Arc;

use thiserror::Error;

/// Handle to a record inside the pool. Only meaningful together with the
/// pool that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IdentityId(u32);

#[derive(Error, Debug)]
pub(crate) enum PoolError {
    #[error("identity pool exhausted: {requested} bytes requested, {available} available")]
    OutOfMemory { requested: usize, available: usize },
}

struct Record {
    refcount: u32,
    name: Arc<str>,
}

pub(crate) struct IdentityPool {
    records: Vec<Option<Record>>,
    free: Vec<usize>,
    /// Remaining byte budget for record payloads.
    available: usize,
}

impl IdentityPool {
    pub(crate) fn new(budget_bytes: usize) -> Self {
        Self {
            records: Vec::new(),
            free: Vec::new(),
            available: budget_bytes,
        }
    }

    /// Allocates a record holding `name` with refcount 1.
    pub(crate) fn alloc(&mut self, name: &str) -> Result<IdentityId, PoolError> {
        let requested = name.len();
        if requested > self.available {
            return Err(PoolError::OutOfMemory {
                requested,
                available: self.available,
            });
        }
        self.available -= requested;

        let record = Record {
            refcount: 1,
            name: Arc::from(name),
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.records[slot] = Some(record);
                slot
            }
            None => {
                self.records.push(Some(record));
                self.records.len() - 1
            }
        };
        Ok(IdentityId(slot as u32))
    }

    /// Adds one owner to the record.
    pub(crate) fn retain(&mut self, id: IdentityId) {
        let record = self.record_mut(id);
        record.refcount += 1;
    }

    /// Drops one owner; the last release returns the slot and its bytes
    /// to the pool.
    pub(crate) fn release(&mut self, id: IdentityId) {
        let slot = id.0 as usize;
        let record = self.record_mut(id);
        record.refcount -= 1;
        if record.refcount == 0 {
            let record = self.records[slot].take();
            self.available += record.map_or(0, |r| r.name.len());
            self.free.push(slot);
        }
    }

    pub(crate) fn name(&self, id: IdentityId) -> &Arc<str> {
        let record = self.records[id.0 as usize]
            .as_ref()
            .expect("identity record released while still referenced");
        &record.name
    }

    /// Number of records currently allocated.
    pub(crate) fn live_records(&self) -> usize {
        self.records.iter().filter(|r| r.is_some()).count()
    }

    #[cfg(test)]
    pub(crate) fn refcount(&self, id: IdentityId) -> u32 {
        self.records[id.0 as usize]
            .as_ref()
            .map_or(0, |r| r.refcount)
    }

    fn record_mut(&mut self, id: IdentityId) -> &mut Record {
        self.records[id.0 as usize]
            .as_mut()
            .expect("identity record released while still referenced")
    }
}
