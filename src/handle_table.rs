//! Handle table (C3): the process-wide mapping from objid to in-memory
//! descriptor, owned by a [`crate::pool::Pool`].
//!
//! The table is a fixed-capacity array, not a growable map, matching the
//! core's `MAX_OPEN_MLOGS` ceiling: allocation past that ceiling is a
//! resource-exhaustion error, not a silent reallocation.

use std::sync::Mutex;

use log::{trace, warn};

use crate::error::{Error, Result};
use crate::objid::ObjId;

/// Maximum number of live descriptors a single pool handle may hold open
/// at once.
pub const MAX_OPEN_MLOGS: usize = 516;

#[derive(Debug)]
struct Slot<D> {
    objid: ObjId,
    descriptor: D,
    refcnt: u32,
}

/// Fixed-capacity, mutex-protected table of `{objid, descriptor, refcnt}`
/// slots. Generic over the descriptor type so the pool can run one table
/// for mlog descriptors and reuse the same discipline for MDC/mblock
/// descriptors if needed.
#[derive(Debug)]
pub struct HandleTable<D> {
    slots: Mutex<Vec<Slot<D>>>,
}

impl<D> Default for HandleTable<D> {
    fn default() -> Self {
        HandleTable { slots: Mutex::new(Vec::new()) }
    }
}

impl<D: Clone> HandleTable<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an existing descriptor, bumping its refcount, or allocate
    /// a fresh one via `make`. Fails with resource exhaustion when the
    /// table is at capacity and `objid` is not already present.
    pub fn acquire(&self, objid: ObjId, make: impl FnOnce() -> Result<D>) -> Result<D> {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.iter_mut().find(|s| s.objid == objid) {
            slot.refcnt += 1;
            trace!("handle table: {objid} refcnt now {}", slot.refcnt);
            return Ok(slot.descriptor.clone());
        }
        if slots.len() >= MAX_OPEN_MLOGS {
            return Err(Error::Exhausted(format!(
                "handle table full ({MAX_OPEN_MLOGS} slots in use)"
            )));
        }
        let descriptor = make()?;
        slots.push(Slot { objid, descriptor: descriptor.clone(), refcnt: 1 });
        trace!("handle table: {objid} opened, refcnt 1");
        Ok(descriptor)
    }

    /// Decrement the refcount for `objid`; tear down (remove) the slot
    /// once it reaches zero. Returns the descriptor to allow the caller
    /// to run teardown logic outside the table's lock if the refcount
    /// dropped to zero, or `None` if other holders remain.
    pub fn release(&self, objid: ObjId) -> Option<D> {
        let mut slots = self.slots.lock().unwrap();
        let idx = match slots.iter().position(|s| s.objid == objid) {
            Some(idx) => idx,
            None => {
                warn!("handle table: release of unknown objid {objid}");
                return None;
            }
        };
        slots[idx].refcnt -= 1;
        if slots[idx].refcnt == 0 {
            let slot = slots.remove(idx);
            trace!("handle table: {objid} refcnt 0, slot freed");
            Some(slot.descriptor)
        } else {
            None
        }
    }

    pub fn lookup(&self, objid: ObjId) -> Option<D> {
        let slots = self.slots.lock().unwrap();
        slots.iter().find(|s| s.objid == objid).map(|s| s.descriptor.clone())
    }

    /// Drain every live descriptor, regardless of refcount. Used by
    /// [`crate::pool::Pool::close`] to tear down whatever is still open.
    pub fn drain(&self) -> Vec<D> {
        let mut slots = self.slots.lock().unwrap();
        slots.drain(..).map(|s| s.descriptor).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objid::ObjType;

    #[test]
    fn acquire_reuses_existing_slot() {
        let table: HandleTable<u32> = HandleTable::new();
        let id = ObjId::compose(ObjType::Mlog, 1, 1);
        let mut calls = 0;
        let d1 = table.acquire(id, || { calls += 1; Ok(42) }).unwrap();
        let d2 = table.acquire(id, || { calls += 1; Ok(99) }).unwrap();
        assert_eq!(d1, 42);
        assert_eq!(d2, 42);
        assert_eq!(calls, 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn release_frees_slot_at_zero_refcount() {
        let table: HandleTable<u32> = HandleTable::new();
        let id = ObjId::compose(ObjType::Mlog, 1, 1);
        table.acquire(id, || Ok(1)).unwrap();
        table.acquire(id, || Ok(1)).unwrap();
        assert!(table.release(id).is_none());
        assert_eq!(table.len(), 1);
        assert!(table.release(id).is_some());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn acquire_fails_when_full() {
        let table: HandleTable<u32> = HandleTable::new();
        for i in 0..MAX_OPEN_MLOGS as u64 {
            let id = ObjId::compose(ObjType::Mlog, 1, i + 1);
            table.acquire(id, || Ok(1)).unwrap();
        }
        let extra = ObjId::compose(ObjType::Mlog, 1, 9999);
        assert!(table.acquire(extra, || Ok(1)).is_err());
    }
}
