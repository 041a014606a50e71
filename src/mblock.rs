//! mblock client (C6): thin, commit-once bulk object operations. An
//! mblock is append-only while uncommitted and read-only once committed;
//! the transition is one-way, enforced by the core and mirrored here so
//! a caller gets a local error without a round trip whenever possible.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::objid::ObjId;
use crate::params::{MblockProps, MediaClass};
use crate::transport::{Command, CoreTransport, Response};

/// A handle to an mblock. Cheap to clone: every clone shares the same
/// transport and objid, mirroring a descriptor pulled from the handle
/// table by multiple callers.
#[derive(Clone, Debug)]
pub struct Mblock {
    objid: ObjId,
    transport: Arc<dyn CoreTransport>,
}

impl Mblock {
    /// `mb_alloc`: allocates an uncommitted mblock of the given class.
    /// `spare` selects the spare pool for the class.
    pub fn alloc(transport: Arc<dyn CoreTransport>, class: MediaClass, cap: u64, spare: bool) -> Result<(Self, MblockProps)> {
        let resp = transport.submit(Command::MbAlloc { class, cap, spare })?;
        match resp {
            Response::MblockAllocated { objid, props } => {
                Ok((Mblock { objid, transport }, props))
            }
            other => Err(Error::Bug(format!("unexpected response to mb_alloc: {other:?}"))),
        }
    }

    /// Wraps an existing objid without allocating, for callers that
    /// obtained it from elsewhere (e.g. enumerated from pool metadata).
    pub fn from_objid(transport: Arc<dyn CoreTransport>, objid: ObjId) -> Result<Self> {
        if !objid.is_mblock() {
            return Err(Error::InvalidArgument(format!("{objid} is not an mblock")));
        }
        Ok(Mblock { objid, transport })
    }

    pub fn objid(&self) -> ObjId {
        self.objid
    }

    /// `mb_write`: appends `data` to the uncommitted mblock.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.transport
            .submit(Command::MbWrite { objid: self.objid, data: data.to_vec() })
            .map(|_| ())
    }

    /// `mb_commit`: transitions to committed. Subsequent writes fail.
    pub fn commit(&self) -> Result<()> {
        self.transport.submit(Command::MbCommit { objid: self.objid }).map(|_| ())
    }

    /// `mb_abort`: releases an uncommitted mblock.
    pub fn abort(&self) -> Result<()> {
        self.transport.submit(Command::MbAbort { objid: self.objid }).map(|_| ())
    }

    /// `mb_read`: reads `len` bytes starting at `off` from a committed
    /// mblock.
    pub fn read(&self, off: u64, len: usize) -> Result<Vec<u8>> {
        match self.transport.submit(Command::MbRead { objid: self.objid, offset: off, len })? {
            Response::Bytes(b) => Ok(b),
            other => Err(Error::Bug(format!("unexpected response to mb_read: {other:?}"))),
        }
    }

    /// `mb_delete`: removes a committed mblock.
    pub fn delete(&self) -> Result<()> {
        self.transport.submit(Command::MbDelete { objid: self.objid }).map(|_| ())
    }

    /// `mb_getprops`.
    pub fn getprops(&self) -> Result<MblockProps> {
        match self.transport.submit(Command::MbGetProps { objid: self.objid })? {
            Response::MblockProps(p) => Ok(p),
            other => Err(Error::Bug(format!("unexpected response to mb_getprops: {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InMemoryCore, TransportStub};

    fn transport() -> Arc<dyn CoreTransport> {
        Arc::new(TransportStub::new(InMemoryCore::new()))
    }

    #[test]
    fn p8_write_after_commit_fails() {
        let transport = transport();
        let (mb, _) = Mblock::alloc(transport, MediaClass::Capacity, 4096, false).unwrap();
        mb.write(b"hello").unwrap();
        mb.commit().unwrap();
        assert!(mb.write(b"more").is_err());
    }

    #[test]
    fn p8_operations_after_abort_fail_not_found() {
        let transport = transport();
        let (mb, _) = Mblock::alloc(transport, MediaClass::Capacity, 4096, false).unwrap();
        mb.abort().unwrap();
        let err = mb.getprops().unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn scenario_3_write_commit_read_round_trips() {
        let transport = transport();
        let (mb, props) = Mblock::alloc(transport, MediaClass::Capacity, 4096, false).unwrap();
        let content: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
        mb.write(&content).unwrap();
        mb.commit().unwrap();
        assert_eq!(props.objid, mb.objid());

        let back = mb.read(0, content.len()).unwrap();
        assert_eq!(back, content);
    }

    #[test]
    fn read_out_of_range_is_invalid_argument() {
        let transport = transport();
        let (mb, _) = Mblock::alloc(transport, MediaClass::Capacity, 16, false).unwrap();
        mb.write(&[1, 2, 3]).unwrap();
        mb.commit().unwrap();
        assert!(mb.read(0, 100).is_err());
    }
}
