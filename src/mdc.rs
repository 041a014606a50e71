//! MDC dual-log (C5): a pair of mlogs acting as a replicated, compactable
//! key/value journal. Exactly one side is active at a time; the active
//! side is whichever mlog carries the higher generation at open time.

use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::flags::{MdcOpenFlags, MlogOpenFlags};
use crate::mlog::{Mlog, ReadIterator};
use crate::objid::ObjId;
use crate::params::MediaClass;
use crate::transport::{Command, CoreTransport};

/// Maximum number of channels a single MDC may be opened with.
pub const MDC_CHANNELS_MAX: usize = 16;

/// An open MDC handle.
#[derive(Debug)]
pub struct Mdc {
    transport: Arc<dyn CoreTransport>,
    inner: Mutex<MdcInner>,
}

#[derive(Debug)]
struct MdcInner {
    active: Mlog,
    staging: Mlog,
    reader: Option<ReadIterator>,
}

impl Mdc {
    /// `mdc_alloc`: allocates both mlogs uncommitted with identical
    /// capacity targets. Returns `(oid1, oid2)` in allocation order.
    ///
    /// The second mlog is pre-seeded one generation ahead of the first
    /// (via `MlBumpGen`, which does not touch data) so that a brand-new
    /// MDC's very first open is never ambiguous: without this, both
    /// mlogs would sit at generation 0 until opened, and `mdc_open`
    /// bumps both by the same amount on open, leaving them tied forever.
    /// The gap established here persists across every later compaction
    /// swap, since `compact_end` always bumps the staging side strictly
    /// past the active side's current generation.
    pub fn alloc(transport: Arc<dyn CoreTransport>, class: MediaClass, captgt: u64) -> Result<(ObjId, ObjId)> {
        let r1 = transport.submit(Command::MlAlloc { class, cap: captgt })?;
        let oid1 = match r1 {
            crate::transport::Response::MlogAllocated { objid, .. } => objid,
            other => return Err(Error::Bug(format!("unexpected response to ml_alloc: {other:?}"))),
        };
        let r2 = transport.submit(Command::MlAlloc { class, cap: captgt });
        let oid2 = match r2 {
            Ok(crate::transport::Response::MlogAllocated { objid, .. }) => objid,
            Ok(other) => return Err(Error::Bug(format!("unexpected response to ml_alloc: {other:?}"))),
            Err(e) => {
                // First allocation succeeded but the second didn't: clean up so
                // the caller isn't left with a half-allocated MDC.
                let _ = transport.submit(Command::MlAbort { objid: oid1 });
                return Err(e);
            }
        };
        transport.submit(Command::MlBumpGen { objid: oid2, mingen: 0 })?;
        Ok((oid1, oid2))
    }

    /// `mdc_commit`: commits both mlogs. Either succeeds from the
    /// caller's view or surfaces the first failure; the caller is
    /// expected to clean up partial state via [`Mdc::delete`].
    pub fn commit(transport: &Arc<dyn CoreTransport>, oid1: ObjId, oid2: ObjId) -> Result<()> {
        transport.submit(Command::MlCommit { objid: oid1 })?;
        transport.submit(Command::MlCommit { objid: oid2 })?;
        Ok(())
    }

    pub fn abort(transport: &Arc<dyn CoreTransport>, oid1: ObjId, oid2: ObjId) -> Result<()> {
        transport.submit(Command::MlAbort { objid: oid1 })?;
        transport.submit(Command::MlAbort { objid: oid2 })?;
        Ok(())
    }

    /// `mdc_delete`: deletes both mlogs. Either objid missing is
    /// "not found"; partial deletion leaves the remaining mlog deleted
    /// too, matching the all-or-nothing intent even though the core
    /// itself only guarantees per-objid atomicity.
    pub fn delete(transport: &Arc<dyn CoreTransport>, oid1: ObjId, oid2: ObjId) -> Result<()> {
        let r1 = transport.submit(Command::MlDelete { objid: oid1 });
        let r2 = transport.submit(Command::MlDelete { objid: oid2 });
        r1?;
        r2?;
        Ok(())
    }

    /// `mdc_open`: opens both mlogs with `csem=true`, selects the active
    /// side by comparing generations, and rejects an equal-generation or
    /// torn-compaction state.
    pub fn open(transport: Arc<dyn CoreTransport>, oid1: ObjId, oid2: ObjId, flags: MdcOpenFlags) -> Result<Self> {
        let ml_flags = if flags.contains(MdcOpenFlags::RDONLY) {
            MlogOpenFlags::CSEM | MlogOpenFlags::RDONLY
        } else {
            MlogOpenFlags::CSEM
        };

        let log1 = Mlog::open(transport.clone(), oid1, ml_flags)?;
        let log2 = Mlog::open(transport.clone(), oid2, ml_flags)?;

        if log1.gen() == log2.gen() {
            return Err(Error::State(format!(
                "inconsistent MDC: {oid1} and {oid2} both at generation {}",
                log1.gen()
            )));
        }

        let (active, staging) = if log1.gen() > log2.gen() {
            (log1, log2)
        } else {
            (log2, log1)
        };

        debug!("mdc opened: active={} staging={} gen={}", active.objid(), staging.objid(), active.gen());

        Ok(Mdc {
            transport,
            inner: Mutex::new(MdcInner { active, staging, reader: None }),
        })
    }

    /// Appends `data` to the active log.
    pub fn append(&self, data: &[u8], sync: bool) -> Result<()> {
        let guard = self.inner.lock().unwrap();
        guard.active.append(data, sync)
    }

    /// Resets the read iterator to the start of the active log.
    pub fn rewind(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.reader = Some(guard.active.read_init());
    }

    /// Reads the next record from the active log, starting a fresh
    /// iterator at the beginning if `rewind` has not been called yet.
    pub fn read_next(&self, buf: &mut [u8]) -> Result<(usize, bool)> {
        let mut guard = self.inner.lock().unwrap();
        if guard.reader.is_none() {
            guard.reader = Some(guard.active.read_init());
        }
        guard.reader.as_mut().unwrap().read_next(buf)
    }

    /// `mdc_compact_begin`: appends CSTART to the staging log, readying
    /// it to receive the compacted record stream.
    pub fn compact_begin(&self) -> Result<()> {
        let guard = self.inner.lock().unwrap();
        guard.staging.append_cstart(true)
    }

    /// Appends one compacted record to the staging log, to be called
    /// between [`Mdc::compact_begin`] and [`Mdc::compact_end`].
    pub fn compact_write(&self, data: &[u8]) -> Result<()> {
        let guard = self.inner.lock().unwrap();
        guard.staging.append(data, false)
    }

    /// `mdc_compact_end`: appends CEND to the staging log, then promotes
    /// it to active by bumping its generation past the current active
    /// log's via an `ml_erase`-equivalent `mingen` bump on the transport
    /// (`MlBumpGen`, which unlike `MlErase` leaves on-media content
    /// untouched). The next open will observe the staging log as the
    /// higher-generation (active) side; an incomplete compaction (no
    /// CEND) leaves the previous active log in place on crash recovery.
    pub fn compact_end(&self) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        guard.staging.append_cend(true)?;
        guard.staging.flush()?;

        let active_gen = guard.active.gen();
        self.transport
            .submit(Command::MlBumpGen { objid: guard.staging.objid(), mingen: active_gen })?;
        let reopened = Mlog::open(self.transport.clone(), guard.staging.objid(), MlogOpenFlags::CSEM)?;

        let inner = &mut *guard;
        std::mem::swap(&mut inner.active, &mut inner.staging);
        guard.active = reopened;
        guard.reader = None;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let guard = self.inner.lock().unwrap();
        guard.active.close()?;
        guard.staging.close()
    }
}

/// Client-side convention layering up to [`MDC_CHANNELS_MAX`] independent
/// interleaved streams over a single MDC's append stream. Each channel's
/// records are tagged with a one-byte channel id prefix that is stripped
/// on read; this is not a new on-media format, just a framing discipline
/// applied by the client.
pub struct MdcChannel<'a> {
    mdc: &'a Mdc,
    channel: u8,
}

impl<'a> MdcChannel<'a> {
    pub fn new(mdc: &'a Mdc, channel: u8) -> Result<Self> {
        if channel as usize >= MDC_CHANNELS_MAX {
            return Err(Error::InvalidArgument(format!(
                "channel {channel} exceeds MDC_CHANNELS_MAX ({MDC_CHANNELS_MAX})"
            )));
        }
        Ok(MdcChannel { mdc, channel })
    }

    pub fn append(&self, data: &[u8], sync: bool) -> Result<()> {
        let mut tagged = Vec::with_capacity(data.len() + 1);
        tagged.push(self.channel);
        tagged.extend_from_slice(data);
        self.mdc.append(&tagged, sync)
    }

    /// Reads the next record belonging to this channel, skipping over
    /// records tagged for other channels. Returns `(len, eof)`, same as
    /// [`Mdc::read_next`].
    pub fn read_next(&self, buf: &mut [u8]) -> Result<(usize, bool)> {
        let mut scratch = vec![0u8; buf.len() + 1];
        loop {
            let (len, eof) = self.mdc.read_next(&mut scratch)?;
            if eof {
                return Ok((0, true));
            }
            if len == 0 {
                warn!("mdc channel {}: empty record with no channel tag", self.channel);
                continue;
            }
            let tag = scratch[0];
            let payload_len = len - 1;
            if tag == self.channel {
                if buf.len() < payload_len {
                    return Err(Error::Overflow { required: payload_len });
                }
                buf[..payload_len].copy_from_slice(&scratch[1..len]);
                return Ok((payload_len, false));
            }
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

    fn alloc_commit_open(transport: &Arc<dyn CoreTransport>) -> Mdc {
        let (oid1, oid2) = Mdc::alloc(transport.clone(), MediaClass::Capacity, 1 << 16).unwrap();
        Mdc::commit(transport, oid1, oid2).unwrap();
        Mdc::open(transport.clone(), oid1, oid2, MdcOpenFlags::empty()).unwrap()
    }

    #[test]
    fn scenario_4_alloc_commit_open_succeeds() {
        let transport = transport();
        let _mdc = alloc_commit_open(&transport);
    }

    #[test]
    fn scenario_4_abort_then_delete_both_is_not_found() {
        let transport = transport();
        let (oid1, oid2) = Mdc::alloc(transport.clone(), MediaClass::Capacity, 1 << 16).unwrap();
        Mdc::abort(&transport, oid1, oid2).unwrap();
        assert!(Mdc::delete(&transport, oid1, oid2).is_err());
    }

    #[test]
    fn p6_equal_generation_is_inconsistent() {
        let transport = transport();
        let (oid1, oid2) = Mdc::alloc(transport.clone(), MediaClass::Capacity, 1 << 16).unwrap();
        Mdc::commit(&transport, oid1, oid2).unwrap();
        // `Mdc::alloc` pre-seeds oid2 one generation ahead to disambiguate
        // a brand-new MDC's very first open; undo that here by bumping
        // oid1 to match, so both sides genuinely tie.
        transport.submit(Command::MlBumpGen { objid: oid1, mingen: 0 }).unwrap();
        let err = Mdc::open(transport.clone(), oid1, oid2, MdcOpenFlags::empty()).unwrap_err();
        assert!(matches!(err, Error::State(_)));
    }

    #[test]
    fn scenario_5_round_trip_twelve_records() {
        let transport = transport();
        let mdc = alloc_commit_open(&transport);
        for i in 0u8..12 {
            mdc.append(&[i; 128], false).unwrap();
        }
        mdc.close().unwrap();

        // `open` bumps both mlogs' generations equally, so the gap
        // `Mdc::alloc` pre-seeded survives close/reopen without needing a
        // compaction in between; rewinding the still-live handle exercises
        // the read path independently of the reopen path covered below.
        mdc.rewind();
        for i in 0u8..12 {
            let mut buf = [0u8; 128];
            let (len, eof) = mdc.read_next(&mut buf).unwrap();
            assert!(!eof);
            assert_eq!(len, 128);
            assert!(buf.iter().all(|b| *b == i));
        }
    }

    #[test]
    fn scenario_5_genuine_reopen_on_a_fresh_handle_preserves_records() {
        let transport = transport();
        let (oid1, oid2) = Mdc::alloc(transport.clone(), MediaClass::Capacity, 1 << 16).unwrap();
        Mdc::commit(&transport, oid1, oid2).unwrap();

        let mdc = Mdc::open(transport.clone(), oid1, oid2, MdcOpenFlags::empty()).unwrap();
        for i in 0u8..12 {
            mdc.append(&[i; 128], true).unwrap();
        }
        mdc.close().unwrap();
        drop(mdc);

        // A genuinely fresh handle, not a reuse of the one above.
        let mdc2 = Mdc::open(transport.clone(), oid1, oid2, MdcOpenFlags::empty()).unwrap();
        for i in 0u8..12 {
            let mut buf = [0u8; 128];
            let (len, eof) = mdc2.read_next(&mut buf).unwrap();
            assert!(!eof, "record {i} lost across a genuine Mdc reopen");
            assert_eq!(len, 128);
            assert!(buf.iter().all(|b| *b == i));
        }

        for i in 12u8..16 {
            mdc2.append(&[i; 128], true).unwrap();
        }
        mdc2.close().unwrap();
        drop(mdc2);

        let mdc3 = Mdc::open(transport, oid1, oid2, MdcOpenFlags::empty()).unwrap();
        for i in 0u8..16 {
            let mut buf = [0u8; 128];
            let (len, eof) = mdc3.read_next(&mut buf).unwrap();
            assert!(!eof, "record {i} lost across a second genuine Mdc reopen");
            assert_eq!(len, 128);
            assert!(buf.iter().all(|b| *b == i));
        }
    }

    #[test]
    fn scenario_6_four_interleaved_channels() {
        let transport = transport();
        let mdc = alloc_commit_open(&transport);
        let channels: Vec<MdcChannel> = (0u8..4).map(|c| MdcChannel::new(&mdc, c).unwrap()).collect();
        for j in 0u8..12 {
            for (c, ch) in channels.iter().enumerate() {
                ch.append(&[((c as u8) << 4) | j], true).unwrap();
            }
        }
        for j in 0u8..12 {
            for (c, ch) in channels.iter().enumerate() {
                let mut buf = [0u8; 1];
                let (len, eof) = ch.read_next(&mut buf).unwrap();
                assert!(!eof);
                assert_eq!(len, 1);
                assert_eq!(buf[0], ((c as u8) << 4) | j);
            }
        }
    }

    #[test]
    fn compact_end_promotes_staging_to_active() {
        let transport = transport();
        let mdc = alloc_commit_open(&transport);
        mdc.append(b"old data", true).unwrap();

        mdc.compact_begin().unwrap();
        mdc.compact_write(b"compacted data").unwrap();
        mdc.compact_end().unwrap();

        mdc.rewind();
        let mut buf = [0u8; 64];
        let (len, _) = mdc.read_next(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"compacted data");
    }
}
