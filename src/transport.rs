//! Transport stub (C2): a single request/response channel to the pool
//! core.
//!
//! The core itself (superblock owner, physical drive set, metadata
//! catalog) is out of scope for this crate; it is modeled as an RPC
//! target behind the [`CoreTransport`] trait. [`InMemoryCore`] is a
//! reference implementation that backs mblocks and mlogs with growable
//! byte buffers, sufficient to drive every client code path and the test
//! suite. [`TransportStub`] wraps any `CoreTransport` and adds the two
//! guarantees the client depends on: per-handle (per-objid) submission
//! ordering, and at most one outstanding erase per mlog objid.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::objid::{ObjId, ObjType};
use crate::params::{MblockProps, MediaClass, MlogProps, PoolParams, MEDIA_CLASS_COUNT};

/// Default sector size used by [`InMemoryCore`]-backed mlogs.
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// A request sent across the transport. One variant per entry in the core
/// command table (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    MbAlloc { class: MediaClass, cap: u64, spare: bool },
    MbCommit { objid: ObjId },
    MbAbort { objid: ObjId },
    MbDelete { objid: ObjId },
    MbWrite { objid: ObjId, data: Vec<u8> },
    MbRead { objid: ObjId, offset: u64, len: usize },
    MbGetProps { objid: ObjId },

    MlAlloc { class: MediaClass, cap: u64 },
    MlCommit { objid: ObjId },
    MlAbort { objid: ObjId },
    MlDelete { objid: ObjId },
    MlErase { objid: ObjId, mingen: u64 },
    /// Opens the mlog for I/O, bumping its generation. This is the sole
    /// source of generation monotonicity: the core (here, `InMemoryCore`)
    /// owns `gen` and increments it on every successful open.
    MlOpen { objid: ObjId },
    /// Bumps `gen` past `mingen` without disturbing on-media content.
    /// Used by MDC compaction to promote a freshly-compacted staging log
    /// to the active side; unlike `MlErase` this does not clear data.
    MlBumpGen { objid: ObjId, mingen: u64 },
    MlWrite { objid: ObjId, sector_offset: u64, data: Vec<u8> },
    MlRead { objid: ObjId, sector_offset: u64, len: usize },
    MlGetProps { objid: ObjId },

    PoolParamsGet,
    PoolTrim { objids: Vec<ObjId> },
}

/// The response to a [`Command`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Unit,
    MblockAllocated { objid: ObjId, props: MblockProps },
    MblockProps(MblockProps),
    Bytes(Vec<u8>),
    MlogAllocated { objid: ObjId, props: MlogProps },
    MlogProps(MlogProps),
    PoolParams(PoolParams),
}

impl Command {
    /// The objid this command is submitted against, used by
    /// [`TransportStub`] to serialize per-handle ordering. Pool-wide
    /// commands (no single objid) return `None` and are never serialized
    /// against a handle.
    fn objid(&self) -> Option<ObjId> {
        match self {
            Command::MbAlloc { .. } => None,
            Command::MbCommit { objid }
            | Command::MbAbort { objid }
            | Command::MbDelete { objid }
            | Command::MbWrite { objid, .. }
            | Command::MbRead { objid, .. }
            | Command::MbGetProps { objid } => Some(*objid),
            Command::MlAlloc { .. } => None,
            Command::MlCommit { objid }
            | Command::MlAbort { objid }
            | Command::MlDelete { objid }
            | Command::MlErase { objid, .. }
            | Command::MlOpen { objid }
            | Command::MlBumpGen { objid, .. }
            | Command::MlWrite { objid, .. }
            | Command::MlRead { objid, .. }
            | Command::MlGetProps { objid } => Some(*objid),
            Command::PoolParamsGet | Command::PoolTrim { .. } => None,
        }
    }
}

/// The RPC target contract. A real deployment would implement this over a
/// kernel device or a socket; this crate only ships [`InMemoryCore`].
pub trait CoreTransport: Send + Sync + std::fmt::Debug {
    fn submit(&self, cmd: Command) -> Result<Response>;
}

/// Wraps a [`CoreTransport`] with the ordering and busy-detection
/// guarantees the rest of the client depends on.
#[derive(Debug)]
pub struct TransportStub<T: CoreTransport> {
    inner: T,
    /// One lock per objid seen so far, so requests against the same
    /// handle apply in submission order while unrelated handles proceed
    /// concurrently.
    handle_locks: Mutex<HashMap<ObjId, Arc<Mutex<()>>>>,
    /// mlog objids with an erase currently in flight.
    active_erases: Mutex<HashSet<ObjId>>,
}

impl<T: CoreTransport> TransportStub<T> {
    pub fn new(inner: T) -> Self {
        TransportStub {
            inner,
            handle_locks: Mutex::new(HashMap::new()),
            active_erases: Mutex::new(HashSet::new()),
        }
    }

    fn lock_for(&self, objid: ObjId) -> Arc<Mutex<()>> {
        let mut table = self.handle_locks.lock().unwrap();
        table.entry(objid).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub fn submit(&self, cmd: Command) -> Result<Response> {
        if let Command::MlErase { objid, .. } = &cmd {
            let objid = *objid;
            {
                let mut active = self.active_erases.lock().unwrap();
                if !active.insert(objid) {
                    warn!("erase already in flight for {objid}, returning busy");
                    return Err(Error::Transient(format!("erase in progress for {objid}")));
                }
            }
            let result = self.submit_ordered(cmd);
            self.active_erases.lock().unwrap().remove(&objid);
            return result;
        }
        self.submit_ordered(cmd)
    }

    fn submit_ordered(&self, cmd: Command) -> Result<Response> {
        match cmd.objid() {
            Some(objid) => {
                let lock = self.lock_for(objid);
                let _guard = lock.lock().unwrap();
                trace!("submitting {cmd:?} for {objid}");
                submit_over_wire(&self.inner, cmd)
            }
            None => {
                trace!("submitting pool-wide {cmd:?}");
                submit_over_wire(&self.inner, cmd)
            }
        }
    }
}

/// Frames `cmd` through `bincode` before handing it to `inner`, and frames
/// the response the same way on the way back. `InMemoryCore` lives in the
/// same process, so this round trip isn't load-bearing today, but it
/// keeps every `CoreTransport` implementor — in-process or a real
/// kernel/socket transport — talking the same encoded envelope, and
/// catches non-serializable command/response additions at the point
/// they're introduced rather than only once a real wire is in the loop.
fn submit_over_wire<T: CoreTransport>(inner: &T, cmd: Command) -> Result<Response> {
    let encoded = bincode::serialize(&cmd).map_err(|e| Error::Bug(format!("command encode failed: {e}")))?;
    let decoded: Command =
        bincode::deserialize(&encoded).map_err(|e| Error::Bug(format!("command decode failed: {e}")))?;
    let resp = inner.submit(decoded)?;
    let encoded = bincode::serialize(&resp).map_err(|e| Error::Bug(format!("response encode failed: {e}")))?;
    bincode::deserialize(&encoded).map_err(|e| Error::Bug(format!("response decode failed: {e}")))
}

impl<T: CoreTransport> CoreTransport for TransportStub<T> {
    fn submit(&self, cmd: Command) -> Result<Response> {
        TransportStub::submit(self, cmd)
    }
}

#[derive(Debug)]
struct MblockEntry {
    mclass: MediaClass,
    alloc_cap: u64,
    data: Vec<u8>,
    committed: bool,
}

#[derive(Debug)]
struct MlogEntry {
    mclass: MediaClass,
    cap: u64,
    sector_size: u32,
    data: Vec<u8>,
    committed: bool,
    gen: u64,
    /// Artificial delay injected before processing an erase, so tests can
    /// deterministically observe the "busy" response on a second
    /// concurrent erase attempt.
    erase_delay: Option<Duration>,
}

#[derive(Debug)]
struct CoreState {
    next_unique: u64,
    mblocks: HashMap<ObjId, MblockEntry>,
    mlogs: HashMap<ObjId, MlogEntry>,
    params: PoolParams,
}

/// An in-process reference implementation of [`CoreTransport`] backing
/// mblocks/mlogs with growable byte buffers. Good enough to drive every
/// client-visible code path and the scenarios in the test suite; a real
/// deployment would replace this with a transport that talks to the
/// kernel-resident core.
#[derive(Debug)]
pub struct InMemoryCore {
    state: Mutex<CoreState>,
}

impl Default for InMemoryCore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCore {
    pub fn new() -> Self {
        InMemoryCore {
            state: Mutex::new(CoreState {
                next_unique: 1,
                mblocks: HashMap::new(),
                mlogs: HashMap::new(),
                params: PoolParams {
                    mblocksz: [1 << 20; MEDIA_CLASS_COUNT],
                    ..PoolParams::default()
                },
            }),
        }
    }

    /// Test-only hook: make the next erase on `objid` take `delay` before
    /// completing, to exercise the stub's busy-on-concurrent-erase path.
    #[doc(hidden)]
    pub fn inject_erase_delay(&self, objid: ObjId, delay: Duration) {
        if let Some(entry) = self.state.lock().unwrap().mlogs.get_mut(&objid) {
            entry.erase_delay = Some(delay);
        }
    }

    fn mint(&self, state: &mut CoreState, ty: ObjType) -> ObjId {
        let unique = state.next_unique;
        state.next_unique += 1;
        ObjId::compose(ty, 1, unique)
    }
}

impl CoreTransport for InMemoryCore {
    fn submit(&self, cmd: Command) -> Result<Response> {
        let mut state = self.state.lock().unwrap();
        match cmd {
            Command::MbAlloc { class, cap, spare: _ } => {
                let objid = self.mint(&mut state, ObjType::Mblock);
                state.mblocks.insert(
                    objid,
                    MblockEntry { mclass: class, alloc_cap: cap, data: Vec::new(), committed: false },
                );
                let props = mblock_props(objid, &state.mblocks[&objid]);
                debug!("allocated mblock {objid} cap {cap}");
                Ok(Response::MblockAllocated { objid, props })
            }
            Command::MbCommit { objid } => {
                let entry = get_mblock_mut(&mut state, objid)?;
                if entry.committed {
                    return Err(Error::State(format!("mblock {objid} already committed")));
                }
                entry.committed = true;
                Ok(Response::Unit)
            }
            Command::MbAbort { objid } => {
                let entry = state
                    .mblocks
                    .get(&objid)
                    .ok_or_else(|| Error::NotFound(format!("mblock {objid}")))?;
                if entry.committed {
                    return Err(Error::State(format!("mblock {objid} already committed, cannot abort")));
                }
                state.mblocks.remove(&objid);
                Ok(Response::Unit)
            }
            Command::MbDelete { objid } => {
                let entry = state
                    .mblocks
                    .get(&objid)
                    .ok_or_else(|| Error::NotFound(format!("mblock {objid}")))?;
                if !entry.committed {
                    return Err(Error::State(format!("mblock {objid} not committed, cannot delete")));
                }
                state.mblocks.remove(&objid);
                Ok(Response::Unit)
            }
            Command::MbWrite { objid, data } => {
                let entry = get_mblock_mut(&mut state, objid)?;
                if entry.committed {
                    return Err(Error::InvalidArgument(format!("mblock {objid} is committed")));
                }
                if entry.data.len() as u64 + data.len() as u64 > entry.alloc_cap {
                    return Err(Error::Capacity(format!("mblock {objid} write exceeds allocated capacity")));
                }
                entry.data.extend_from_slice(&data);
                Ok(Response::Unit)
            }
            Command::MbRead { objid, offset, len } => {
                let entry = state
                    .mblocks
                    .get(&objid)
                    .ok_or_else(|| Error::NotFound(format!("mblock {objid}")))?;
                if !entry.committed {
                    return Err(Error::InvalidArgument(format!("mblock {objid} is not committed")));
                }
                let start = offset as usize;
                let end = start.checked_add(len).ok_or_else(|| {
                    Error::InvalidArgument(format!("mblock {objid} read range overflows"))
                })?;
                if end > entry.data.len() {
                    return Err(Error::InvalidArgument(format!(
                        "mblock {objid} read [{start}, {end}) out of range (len {})",
                        entry.data.len()
                    )));
                }
                Ok(Response::Bytes(entry.data[start..end].to_vec()))
            }
            Command::MbGetProps { objid } => {
                let entry = state
                    .mblocks
                    .get(&objid)
                    .ok_or_else(|| Error::NotFound(format!("mblock {objid}")))?;
                Ok(Response::MblockProps(mblock_props(objid, entry)))
            }

            Command::MlAlloc { class, cap } => {
                let objid = self.mint(&mut state, ObjType::Mlog);
                let sector_size = DEFAULT_SECTOR_SIZE;
                let totsec = (cap / sector_size as u64).max(1);
                let data = vec![0u8; (totsec * sector_size as u64) as usize];
                state.mlogs.insert(
                    objid,
                    MlogEntry {
                        mclass: class,
                        cap: totsec * sector_size as u64,
                        sector_size,
                        data,
                        committed: false,
                        gen: 0,
                        erase_delay: None,
                    },
                );
                let props = mlog_props(objid, &state.mlogs[&objid]);
                debug!("allocated mlog {objid} cap {cap}");
                Ok(Response::MlogAllocated { objid, props })
            }
            Command::MlCommit { objid } => {
                let entry = get_mlog_mut(&mut state, objid)?;
                entry.committed = true;
                Ok(Response::Unit)
            }
            Command::MlAbort { objid } => {
                let entry = state
                    .mlogs
                    .get(&objid)
                    .ok_or_else(|| Error::NotFound(format!("mlog {objid}")))?;
                if entry.committed {
                    return Err(Error::State(format!("mlog {objid} already committed, cannot abort")));
                }
                state.mlogs.remove(&objid);
                Ok(Response::Unit)
            }
            Command::MlDelete { objid } => {
                let removed = state.mlogs.remove(&objid);
                if removed.is_none() {
                    return Err(Error::NotFound(format!("mlog {objid}")));
                }
                Ok(Response::Unit)
            }
            Command::MlErase { objid, mingen } => {
                let delay = state.mlogs.get(&objid).and_then(|e| e.erase_delay);
                if let Some(delay) = delay {
                    drop(state);
                    std::thread::sleep(delay);
                    state = self.state.lock().unwrap();
                }
                let entry = get_mlog_mut(&mut state, objid)?;
                entry.gen = entry.gen.max(mingen) + 1;
                entry.data.iter_mut().for_each(|b| *b = 0);
                entry.erase_delay = None;
                Ok(Response::Unit)
            }
            Command::MlOpen { objid } => {
                let entry = get_mlog_mut(&mut state, objid)?;
                if !entry.committed {
                    return Err(Error::State(format!("mlog {objid} not committed, cannot open")));
                }
                entry.gen += 1;
                Ok(Response::MlogProps(mlog_props(objid, entry)))
            }
            Command::MlBumpGen { objid, mingen } => {
                let entry = get_mlog_mut(&mut state, objid)?;
                entry.gen = entry.gen.max(mingen) + 1;
                Ok(Response::Unit)
            }
            Command::MlWrite { objid, sector_offset, data } => {
                let entry = get_mlog_mut(&mut state, objid)?;
                let start = sector_offset as usize * entry.sector_size as usize;
                let end = start + data.len();
                if end > entry.data.len() {
                    return Err(Error::Capacity(format!("mlog {objid} write exceeds capacity")));
                }
                entry.data[start..end].copy_from_slice(&data);
                Ok(Response::Unit)
            }
            Command::MlRead { objid, sector_offset, len } => {
                let entry = state
                    .mlogs
                    .get(&objid)
                    .ok_or_else(|| Error::NotFound(format!("mlog {objid}")))?;
                let start = sector_offset as usize * entry.sector_size as usize;
                let end = start + len;
                if end > entry.data.len() {
                    return Err(Error::InvalidArgument(format!("mlog {objid} read out of range")));
                }
                Ok(Response::Bytes(entry.data[start..end].to_vec()))
            }
            Command::MlGetProps { objid } => {
                let entry = state
                    .mlogs
                    .get(&objid)
                    .ok_or_else(|| Error::NotFound(format!("mlog {objid}")))?;
                Ok(Response::MlogProps(mlog_props(objid, entry)))
            }

            Command::PoolParamsGet => Ok(Response::PoolParams(state.params.clone())),
            Command::PoolTrim { objids } => {
                debug!("trim hint for {} objids", objids.len());
                Ok(Response::Unit)
            }
        }
    }
}

fn get_mblock_mut(state: &mut CoreState, objid: ObjId) -> Result<&mut MblockEntry> {
    state
        .mblocks
        .get_mut(&objid)
        .ok_or_else(|| Error::NotFound(format!("mblock {objid}")))
}

fn get_mlog_mut(state: &mut CoreState, objid: ObjId) -> Result<&mut MlogEntry> {
    state
        .mlogs
        .get_mut(&objid)
        .ok_or_else(|| Error::NotFound(format!("mlog {objid}")))
}

fn mblock_props(objid: ObjId, entry: &MblockEntry) -> MblockProps {
    MblockProps {
        objid,
        mclass: entry.mclass,
        alloc_cap: entry.alloc_cap,
        write_len: entry.data.len() as u64,
        optimal_write_sz: 4096,
        committed: entry.committed,
    }
}

fn mlog_props(objid: ObjId, entry: &MlogEntry) -> MlogProps {
    MlogProps {
        objid,
        mclass: entry.mclass,
        cap: entry.cap,
        sector_size: entry.sector_size,
        totsec: (entry.cap / entry.sector_size as u64) as u32,
        gen: entry.gen,
        committed: entry.committed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn stub() -> Arc<TransportStub<InMemoryCore>> {
        Arc::new(TransportStub::new(InMemoryCore::new()))
    }

    #[test]
    fn mblock_commit_once() {
        let t = stub();
        let resp = t
            .submit(Command::MbAlloc { class: MediaClass::Capacity, cap: 4096, spare: false })
            .unwrap();
        let objid = match resp {
            Response::MblockAllocated { objid, .. } => objid,
            _ => panic!("unexpected response"),
        };
        t.submit(Command::MbWrite { objid, data: vec![1, 2, 3] }).unwrap();
        t.submit(Command::MbCommit { objid }).unwrap();
        assert!(t
            .submit(Command::MbWrite { objid, data: vec![4] })
            .is_err());
        t.submit(Command::MbAbort { objid }).unwrap_err();
    }

    #[test]
    fn concurrent_erase_returns_busy() {
        let core = InMemoryCore::new();
        let resp = core
            .submit(Command::MlAlloc { class: MediaClass::Capacity, cap: 4096 })
            .unwrap();
        let objid = match resp {
            Response::MlogAllocated { objid, .. } => objid,
            _ => panic!("unexpected response"),
        };
        core.inject_erase_delay(objid, Duration::from_millis(200));
        let stub = Arc::new(TransportStub::new(core));

        let s1 = stub.clone();
        let h1 = thread::spawn(move || s1.submit(Command::MlErase { objid, mingen: 0 }));
        thread::sleep(Duration::from_millis(50));
        let second = stub.submit(Command::MlErase { objid, mingen: 0 });
        assert!(matches!(second, Err(Error::Transient(_))));
        h1.join().unwrap().unwrap();
    }
}
