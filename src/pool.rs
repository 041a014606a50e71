//! Pool handle façade (C8): owns the transport (C2) and the handle table
//! (C3), exposes open/close/params/trim, and enforces lifecycle rules
//! such as exclusive-open semantics.
//!
//! Lock ordering for every operation that touches both a descriptor and
//! the pool follows MDC → mlog → pool → core; this module is the "pool"
//! link in that chain and never calls back up into an MDC or mlog lock
//! it doesn't already hold.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::error::{Error, Result};
use crate::flags::PoolOpenFlags;
use crate::handle_table::HandleTable;
use crate::mblock::Mblock;
use crate::mlog::Mlog;
use crate::objid::ObjId;
use crate::params::PoolParams;
use crate::transport::{Command, CoreTransport, InMemoryCore, Response, TransportStub};

/// Process-wide registry of pool names currently held with `EXCL`, so a
/// second exclusive (or non-exclusive) open of the same name can be
/// rejected the way the core would reject it. This crate's `InMemoryCore`
/// has no cross-handle notion of "pool name", so the client enforces the
/// `O_EXCL` contract locally.
static EXCLUSIVE_POOLS: Mutex<Vec<String>> = Mutex::new(Vec::new());

/// An open mpool handle.
#[derive(Debug)]
pub struct Pool {
    name: String,
    flags: PoolOpenFlags,
    transport: Arc<dyn CoreTransport>,
    mlogs: HandleTable<Mlog>,
    mblocks: HandleTable<Mblock>,
    params: PoolParams,
    closed: AtomicBool,
}

impl Pool {
    /// `open(name, flags)`: contacts the core, populates the handle,
    /// caches parameters. Uses an in-process [`InMemoryCore`] behind a
    /// [`TransportStub`]; a real deployment supplies its own
    /// `CoreTransport` via [`Pool::open_with_transport`].
    pub fn open(name: &str, flags: PoolOpenFlags) -> Result<Self> {
        let transport: Arc<dyn CoreTransport> = Arc::new(TransportStub::new(InMemoryCore::new()));
        Self::open_with_transport(name, flags, transport)
    }

    pub fn open_with_transport(name: &str, flags: PoolOpenFlags, transport: Arc<dyn CoreTransport>) -> Result<Self> {
        if name.is_empty() || name.len() > crate::params::MPOOL_LABEL_LEN {
            return Err(Error::InvalidArgument(format!(
                "pool name must be 1..={} bytes",
                crate::params::MPOOL_LABEL_LEN
            )));
        }

        {
            let mut held = EXCLUSIVE_POOLS.lock().unwrap();
            if held.iter().any(|n| n == name) {
                return Err(Error::State(format!("pool {name} is already open exclusively")));
            }
            if flags.contains(PoolOpenFlags::EXCL) {
                held.push(name.to_string());
            }
        }

        let params = match transport.submit(Command::PoolParamsGet)? {
            Response::PoolParams(p) => p,
            other => return Err(Error::Bug(format!("unexpected response to pool_params_get: {other:?}"))),
        };

        info!("pool {name} opened (flags {flags:?})");
        Ok(Pool {
            name: name.to_string(),
            flags,
            transport,
            mlogs: HandleTable::new(),
            mblocks: HandleTable::new(),
            params,
            closed: AtomicBool::new(false),
        })
    }

    pub fn transport(&self) -> Arc<dyn CoreTransport> {
        self.transport.clone()
    }

    /// `name_get`: returns the pool name as recorded at open time.
    pub fn name_get(&self) -> &str {
        &self.name
    }

    /// `params_get`: a snapshot of the parameters cached at open time.
    pub fn params_get(&self) -> &PoolParams {
        &self.params
    }

    /// Opens (or re-acquires, bumping refcount) an mlog descriptor
    /// through this pool's handle table.
    pub fn mlog_open(&self, objid: ObjId, flags: crate::flags::MlogOpenFlags) -> Result<Mlog> {
        let transport = self.transport.clone();
        self.mlogs.acquire(objid, || Mlog::open(transport, objid, flags))
    }

    pub fn mlog_release(&self, objid: ObjId) -> Result<()> {
        if let Some(ml) = self.mlogs.release(objid) {
            ml.close()?;
        }
        Ok(())
    }

    pub fn mblock_open(&self, objid: ObjId) -> Result<Mblock> {
        let transport = self.transport.clone();
        self.mblocks.acquire(objid, || Mblock::from_objid(transport, objid))
    }

    pub fn mblock_release(&self, objid: ObjId) {
        self.mblocks.release(objid);
    }

    /// `trim(pool, objid_list)`: forwarded to the transport as a
    /// best-effort hint. Failures are logged and swallowed, matching the
    /// advisory nature of trim.
    pub fn trim(&self, objids: Vec<ObjId>) {
        if let Err(e) = self.transport.submit(Command::PoolTrim { objids }) {
            warn!("pool {}: trim hint failed (ignored): {e}", self.name);
        }
    }

    /// `close(pool)`: tears down every descriptor still in the handle
    /// tables (logging but continuing past individual teardown errors),
    /// then drops the transport. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for ml in self.mlogs.drain() {
            if let Err(e) = ml.close() {
                warn!("pool {}: error closing mlog {} during pool close: {e}", self.name, ml.objid());
            }
        }
        let _ = self.mblocks.drain();

        if self.flags.contains(PoolOpenFlags::EXCL) {
            EXCLUSIVE_POOLS.lock().unwrap().retain(|n| n != &self.name);
        }
        info!("pool {} closed", self.name);
        Ok(())
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("pool {}: error during drop: {e}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_open_blocks_second_open() {
        let p1 = Pool::open("mp-excl-test", PoolOpenFlags::EXCL).unwrap();
        let err = Pool::open("mp-excl-test", PoolOpenFlags::empty()).unwrap_err();
        assert!(matches!(err, Error::State(_)));
        p1.close().unwrap();
        // Once closed, the name is free again.
        let p2 = Pool::open("mp-excl-test", PoolOpenFlags::empty()).unwrap();
        p2.close().unwrap();
    }

    #[test]
    fn rejects_empty_name() {
        assert!(Pool::open("", PoolOpenFlags::empty()).is_err());
    }

    #[test]
    fn close_is_idempotent() {
        let p = Pool::open("mp-idempotent-test", PoolOpenFlags::empty()).unwrap();
        p.close().unwrap();
        p.close().unwrap();
    }
}
