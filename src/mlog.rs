//! mlog engine (C4): append buffer, read iterator, compaction markers,
//! flush-set tracking, open/validate, generation bookkeeping.
//!
//! An mlog is laid out on media as a sequence of fixed-size log blocks
//! (one per sector). Each block starts with a [`LogBlockHeader`] carrying
//! a previous/current flush-set id pair; a contiguous run of blocks
//! written together in one flush shares a single (pfsetid, cfsetid) pair,
//! so a reader can detect a torn write by noticing the chain break and
//! stop there instead of reading corrupt tail data.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use log::{trace, warn};

use crate::error::{Error, Result};
use crate::flags::MlogOpenFlags;
use crate::objid::ObjId;
use crate::omf::{LogBlockHeader, LogRecordDescriptor, RecordType, LOG_BLOCK_HEADER_LEN, LOG_RECORD_DESCRIPTOR_LEN};
use crate::transport::{Command, CoreTransport, Response};

/// Append buffers and read buffers are capped at 1 MiB, per the on-media
/// contract.
pub const MAX_BUFFER_BYTES: usize = 1 << 20;

/// An open mlog handle. Cheap to clone: clones share the same underlying
/// state behind a reader/writer lock, mirroring a process-wide handle
/// table entry that multiple callers can acquire concurrently.
#[derive(Clone, Debug)]
pub struct Mlog {
    pub(crate) objid: ObjId,
    transport: Arc<dyn CoreTransport>,
    state: Arc<RwLock<MlogState>>,
}

#[derive(Debug)]
struct MlogState {
    gen: u64,
    totsec: u32,
    sector_size: u32,
    flags: MlogOpenFlags,
    csem: bool,
    uuid: [u8; 16],

    /// Sector index one past the last validated sector: everything at
    /// `[0, valid_sectors)` is trusted log content as of open time.
    valid_sectors: u32,
    /// Sector currently being appended to.
    wsoff: u32,
    /// Next free byte offset within sector `wsoff`.
    aoff: u32,
    /// Sectors modified since the last flush, keyed by sector index, with
    /// their full (header + records) contents built up so far.
    dirty: BTreeMap<u32, Vec<u8>>,
    /// Flush-set id of the last durably flushed run.
    pfsetid: u32,
    /// Flush-set id that will be stamped on the run currently being
    /// built (assigned to `dirty` blocks at flush time).
    cfsetid: u32,
    /// True while a CSTART has been appended without a matching CEND.
    cstart_open: bool,
}

/// A lazily-consumed cursor over an mlog's records, created by
/// [`Mlog::read_init`].
#[derive(Debug)]
pub struct ReadIterator {
    mlog: Mlog,
    gen_at_creation: u64,
    cur_sector: u32,
    cur_byte: u32,
}

impl Mlog {
    /// `ml_alloc` + `ml_commit`, returning an uncommitted-then-committed
    /// mlog objid ready to be opened. Most callers want [`Mlog::open`]
    /// directly against an objid obtained this way.
    pub fn create(
        transport: Arc<dyn CoreTransport>,
        class: crate::params::MediaClass,
        cap_target: u64,
    ) -> Result<ObjId> {
        let resp = transport.submit(Command::MlAlloc { class, cap: cap_target })?;
        let objid = match resp {
            Response::MlogAllocated { objid, .. } => objid,
            other => return Err(Error::Bug(format!("unexpected response to ml_alloc: {other:?}"))),
        };
        transport.submit(Command::MlCommit { objid })?;
        Ok(objid)
    }

    pub fn abort(transport: &Arc<dyn CoreTransport>, objid: ObjId) -> Result<()> {
        transport.submit(Command::MlAbort { objid }).map(|_| ())
    }

    pub fn delete(transport: &Arc<dyn CoreTransport>, objid: ObjId) -> Result<()> {
        transport.submit(Command::MlDelete { objid }).map(|_| ())
    }

    /// Opens the mlog, validating it from offset zero and establishing
    /// `wsoff`, `aoff`, the flush-set chain, and `gen`. Re-opening an
    /// already-open handle is idempotent at the transport level (the
    /// core still bumps `gen`, matching real reopen semantics: two
    /// sequential opens of the same objid are two distinct open cycles).
    pub fn open(transport: Arc<dyn CoreTransport>, objid: ObjId, flags: MlogOpenFlags) -> Result<Self> {
        if !objid.is_mlog() {
            return Err(Error::InvalidArgument(format!("{objid} is not an mlog")));
        }
        let csem = flags.contains(MlogOpenFlags::CSEM);

        let props = match transport.submit(Command::MlOpen { objid })? {
            Response::MlogProps(p) => p,
            other => return Err(Error::Bug(format!("unexpected response to ml_open: {other:?}"))),
        };

        let scan = scan_log(&transport, objid, props.totsec, props.sector_size, csem)?;

        let state = MlogState {
            gen: props.gen,
            totsec: props.totsec,
            sector_size: props.sector_size,
            flags,
            csem,
            uuid: scan.uuid,
            valid_sectors: scan.valid_sectors,
            wsoff: scan.wsoff,
            aoff: scan.aoff,
            dirty: BTreeMap::new(),
            pfsetid: scan.last_cfsetid.unwrap_or(0),
            cfsetid: scan.last_cfsetid.unwrap_or(0).wrapping_add(1),
            cstart_open: scan.cstart_open,
        };

        trace!(
            "opened mlog {objid} gen {} valid_sectors {} wsoff {} aoff {}",
            state.gen, state.valid_sectors, state.wsoff, state.aoff
        );

        Ok(Mlog { objid, transport, state: Arc::new(RwLock::new(state)) })
    }

    pub fn objid(&self) -> ObjId {
        self.objid
    }

    pub fn gen(&self) -> u64 {
        self.state.read().unwrap().gen
    }

    /// Appends `data` as a single logical record, chunking it across log
    /// blocks with continuation records as needed. `sync` forces an
    /// immediate flush to the transport.
    pub fn append(&self, data: &[u8], sync: bool) -> Result<()> {
        self.append_record(data, RecordType::Data, sync)
    }

    pub fn append_cstart(&self, sync: bool) -> Result<()> {
        let mut guard = self.state.write().unwrap();
        if guard.cstart_open {
            return Err(Error::State("CSTART already open without matching CEND".into()));
        }
        guard.cstart_open = true;
        drop(guard);
        self.append_record(&[], RecordType::CStart, sync)
    }

    pub fn append_cend(&self, sync: bool) -> Result<()> {
        {
            let guard = self.state.read().unwrap();
            if !guard.cstart_open {
                return Err(Error::State("CEND without a matching open CSTART".into()));
            }
        }
        self.append_record(&[], RecordType::CEnd, sync)?;
        self.state.write().unwrap().cstart_open = false;
        Ok(())
    }

    fn append_record(&self, data: &[u8], rtype: RecordType, sync: bool) -> Result<()> {
        let mut guard = self.state.write().unwrap();
        if guard.flags.contains(MlogOpenFlags::RDONLY) {
            return Err(Error::State(format!("mlog {} is open read-only", self.objid)));
        }

        let mlog_capacity = guard.totsec as u64 * guard.sector_size as u64;
        if data.len() as u64 > mlog_capacity {
            return Err(Error::InvalidArgument(format!(
                "no room: record of {} bytes exceeds the {mlog_capacity}-byte capacity of mlog {}",
                data.len(),
                self.objid
            )));
        }

        let remaining_capacity =
            (guard.totsec.saturating_sub(guard.wsoff)) as u64 * guard.sector_size as u64
                - guard.aoff as u64;
        let worst_case_overhead = LOG_RECORD_DESCRIPTOR_LEN as u64
            * (data.len() as u64 / guard.sector_size.max(1) as u64 + 2);
        if (data.len() as u64).saturating_add(worst_case_overhead) > remaining_capacity {
            return Err(Error::Capacity(format!(
                "log full: {} bytes requested, ~{remaining_capacity} remaining in mlog {}",
                data.len(),
                self.objid
            )));
        }

        let tlen = data.len() as u32;
        let mut offset = 0usize;
        let mut first_chunk = true;
        loop {
            ensure_block_started(&mut guard, &self.transport, self.objid)?;
            let sector_size = guard.sector_size;
            let space_left = sector_size - guard.aoff;
            if (space_left as usize) <= LOG_RECORD_DESCRIPTOR_LEN {
                advance_to_next_block(&mut guard, &self.transport, self.objid)?;
                continue;
            }
            let chunk_cap = space_left as usize - LOG_RECORD_DESCRIPTOR_LEN;
            let remaining_payload = data.len() - offset;
            let chunk_len = remaining_payload.min(chunk_cap);
            let chunk_rtype = if first_chunk {
                rtype
            } else {
                RecordType::Continuation
            };
            let desc = LogRecordDescriptor {
                tlen,
                rlen: chunk_len as u16,
                rtype: chunk_rtype,
            };
            write_into_current_block(&mut guard, &desc.pack()?)?;
            write_into_current_block(&mut guard, &data[offset..offset + chunk_len])?;
            offset += chunk_len;
            first_chunk = false;
            if offset >= data.len() {
                break;
            }
            advance_to_next_block(&mut guard, &self.transport, self.objid)?;
        }

        if sync || guard.dirty.values().map(|b| b.len()).sum::<usize>() >= MAX_BUFFER_BYTES {
            flush_locked(&self.transport, self.objid, &mut guard)?;
        }
        Ok(())
    }

    /// Forces any buffered-but-unflushed records to media.
    pub fn flush(&self) -> Result<()> {
        let mut guard = self.state.write().unwrap();
        flush_locked(&self.transport, self.objid, &mut guard)
    }

    /// Flushes and releases the handle's reference to the transport.
    /// Subsequent use of a closed handle is a logic error in the caller;
    /// this crate does not track a separate "closed" bit because the
    /// handle table (C3) is what owns handle lifetime.
    pub fn close(&self) -> Result<()> {
        self.flush()
    }

    /// Creates a read iterator positioned at the start of the log,
    /// snapshotting the current generation.
    pub fn read_init(&self) -> ReadIterator {
        ReadIterator {
            mlog: self.clone(),
            gen_at_creation: self.gen(),
            cur_sector: 0,
            cur_byte: LOG_BLOCK_HEADER_LEN as u32,
        }
    }
}

fn ensure_block_started(state: &mut MlogState, transport: &Arc<dyn CoreTransport>, objid: ObjId) -> Result<()> {
    if state.wsoff >= state.totsec {
        return Err(Error::Capacity(format!("log full: mlog {objid} has no more sectors")));
    }
    if state.dirty.contains_key(&state.wsoff) {
        return Ok(());
    }
    if state.aoff == LOG_BLOCK_HEADER_LEN as u32 {
        // Fresh sector: reserve the header region; its bytes are finalized at flush time.
        state.dirty.insert(state.wsoff, vec![0u8; LOG_BLOCK_HEADER_LEN]);
    } else {
        // Sector already has content on media from a previous flush (re-opened, appending
        // more into a not-yet-full block); read back the real on-media bytes for [0, aoff)
        // so the records already durable in that range survive the next flush instead of
        // being clobbered with zeros. The header bytes at the front of this buffer get
        // overwritten with a freshly packed header at flush time regardless.
        let sector_size = state.sector_size;
        let wsoff = state.wsoff;
        let raw = match transport.submit(Command::MlRead {
            objid,
            sector_offset: wsoff as u64,
            len: sector_size as usize,
        })? {
            Response::Bytes(b) => b,
            other => return Err(Error::Bug(format!("unexpected response to ml_read: {other:?}"))),
        };
        let aoff = (state.aoff as usize).min(raw.len());
        state.dirty.insert(wsoff, raw[..aoff].to_vec());
    }
    Ok(())
}

fn write_into_current_block(state: &mut MlogState, bytes: &[u8]) -> Result<()> {
    let wsoff = state.wsoff;
    let block = state
        .dirty
        .get_mut(&wsoff)
        .ok_or_else(|| Error::Bug("append into an unstaged block".into()))?;
    block.extend_from_slice(bytes);
    state.aoff += bytes.len() as u32;
    Ok(())
}

fn advance_to_next_block(state: &mut MlogState, transport: &Arc<dyn CoreTransport>, objid: ObjId) -> Result<()> {
    state.wsoff += 1;
    state.aoff = LOG_BLOCK_HEADER_LEN as u32;
    if state.wsoff >= state.totsec {
        return Err(Error::Capacity(format!("log full: mlog {objid} has no more sectors")));
    }
    ensure_block_started(state, transport, objid)
}

fn flush_locked(transport: &Arc<dyn CoreTransport>, objid: ObjId, state: &mut MlogState) -> Result<()> {
    if state.dirty.is_empty() {
        return Ok(());
    }
    let cfsetid = state.cfsetid;
    let pfsetid = state.pfsetid;
    let sector_size = state.sector_size as usize;
    let uuid = state.uuid;
    let gen = state.gen;

    let sectors: Vec<u32> = state.dirty.keys().copied().collect();
    for sector in sectors {
        let body = state.dirty.remove(&sector).unwrap();
        let header = LogBlockHeader { uuid, pfsetid, cfsetid, gen, version: crate::omf::LOG_BLOCK_HEADER_VERSION };
        let mut full = header.pack();
        full.extend_from_slice(&body[LOG_BLOCK_HEADER_LEN.min(body.len())..]);
        if full.len() < sector_size {
            full.resize(sector_size, 0);
        }
        transport.submit(Command::MlWrite { objid, sector_offset: sector as u64, data: full })?;
    }

    state.pfsetid = cfsetid;
    state.cfsetid = cfsetid.wrapping_add(1);
    state.valid_sectors = state.valid_sectors.max(state.wsoff + 1);
    Ok(())
}

struct ScanResult {
    uuid: [u8; 16],
    valid_sectors: u32,
    wsoff: u32,
    aoff: u32,
    last_cfsetid: Option<u32>,
    cstart_open: bool,
}

/// Scans an mlog from sector zero, validating the flush-set chain and
/// (when `csem`) CSTART/CEND balance, stopping at the first torn
/// boundary or empty block.
fn scan_log(
    transport: &Arc<dyn CoreTransport>,
    objid: ObjId,
    totsec: u32,
    sector_size: u32,
    csem: bool,
) -> Result<ScanResult> {
    let mut running_cfsetid: Option<u32> = None;
    let mut uuid = [0u8; 16];
    let mut valid_sectors = 0u32;
    let mut cstart_open = false;

    for sector in 0..totsec {
        let raw = match transport.submit(Command::MlRead {
            objid,
            sector_offset: sector as u64,
            len: sector_size as usize,
        })? {
            Response::Bytes(b) => b,
            other => return Err(Error::Bug(format!("unexpected response to ml_read: {other:?}"))),
        };

        if LogBlockHeader::is_empty_block(&raw) {
            break;
        }

        let (header, _) = match LogBlockHeader::unpack(&raw) {
            Ok(h) => h,
            Err(_) => break, // unreadable/garbage header: treat as end of validated log
        };

        match running_cfsetid {
            None => {
                uuid = header.uuid;
            }
            Some(r) => {
                let continues_same_set = header.cfsetid == r;
                let clean_transition = header.pfsetid == r;
                if !continues_same_set && !clean_transition {
                    warn!("mlog {objid}: torn flush-set boundary at sector {sector}, discarding tail");
                    break;
                }
            }
        }
        running_cfsetid = Some(header.cfsetid);

        // Walk records in this sector to track CSTART/CEND balance and
        // find the first free offset for an append cursor.
        let mut off = LOG_BLOCK_HEADER_LEN;
        while off + LOG_RECORD_DESCRIPTOR_LEN <= raw.len() {
            if raw[off..off + LOG_RECORD_DESCRIPTOR_LEN].iter().all(|b| *b == 0) {
                break; // rest of the sector is unwritten
            }
            let desc = match LogRecordDescriptor::unpack(&raw[off..off + LOG_RECORD_DESCRIPTOR_LEN]) {
                Ok(d) => d,
                Err(_) => break,
            };
            match desc.rtype {
                RecordType::CStart => cstart_open = true,
                RecordType::CEnd => cstart_open = false,
                _ => {}
            }
            off += LOG_RECORD_DESCRIPTOR_LEN + desc.rlen as usize;
        }

        valid_sectors = sector + 1;
        if sector + 1 == totsec {
            // Last sector validated fully; the write cursor parks at the
            // very end, forcing the next append onto a fresh (nonexistent)
            // sector, which will correctly fail with "log full".
        }
    }

    if csem && cstart_open {
        return Err(Error::Malformed("cstart-without-cend: malformed log".into()));
    }

    // Re-derive the append cursor by finding the first free offset in the
    // last validated sector (or starting a fresh sector if none validated
    // or the last one is exactly full).
    let (wsoff, aoff) = if valid_sectors == 0 {
        (0, LOG_BLOCK_HEADER_LEN as u32)
    } else {
        let last = valid_sectors - 1;
        let raw = match transport.submit(Command::MlRead {
            objid,
            sector_offset: last as u64,
            len: sector_size as usize,
        })? {
            Response::Bytes(b) => b,
            other => return Err(Error::Bug(format!("unexpected response to ml_read: {other:?}"))),
        };
        let mut off = LOG_BLOCK_HEADER_LEN;
        loop {
            if off + LOG_RECORD_DESCRIPTOR_LEN > raw.len() {
                break;
            }
            if raw[off..off + LOG_RECORD_DESCRIPTOR_LEN].iter().all(|b| *b == 0) {
                break;
            }
            let desc = match LogRecordDescriptor::unpack(&raw[off..off + LOG_RECORD_DESCRIPTOR_LEN]) {
                Ok(d) => d,
                Err(_) => break,
            };
            off += LOG_RECORD_DESCRIPTOR_LEN + desc.rlen as usize;
        }
        (last, off as u32)
    };

    Ok(ScanResult {
        uuid: if running_cfsetid.is_some() { uuid } else { uuid_for_new_log() },
        valid_sectors,
        wsoff,
        aoff,
        last_cfsetid: running_cfsetid,
        cstart_open,
    })
}

fn uuid_for_new_log() -> [u8; 16] {
    *uuid::Uuid::new_v4().as_bytes()
}

impl ReadIterator {
    /// Reads the next logical datum into `buf`, reassembling continuation
    /// chunks. Returns `(len, eof)`. On overflow the iterator position is
    /// left unchanged so the caller may retry with a bigger buffer.
    pub fn read_next(&mut self, buf: &mut [u8]) -> Result<(usize, bool)> {
        self.read_from(self.cur_sector, self.cur_byte, buf)
    }

    /// Same as [`ReadIterator::read_next`] but first seeks to an explicit
    /// byte offset from the start of the log.
    pub fn seek_read_next(&mut self, byte_offset: u64, buf: &mut [u8]) -> Result<(usize, bool)> {
        let state = self.mlog.state.read().unwrap();
        let sector_size = state.sector_size as u64;
        drop(state);
        let sector = (byte_offset / sector_size) as u32;
        let within = (byte_offset % sector_size) as u32;
        self.cur_sector = sector;
        self.cur_byte = within.max(LOG_BLOCK_HEADER_LEN as u32);
        self.read_next(buf)
    }

    fn read_from(&mut self, start_sector: u32, start_byte: u32, buf: &mut [u8]) -> Result<(usize, bool)> {
        let state = self.mlog.state.read().unwrap();
        if state.gen != self.gen_at_creation {
            return Err(Error::NotFound("read iterator invalidated by reopen".into()));
        }
        let sector_size = state.sector_size;
        let valid_sectors = state.valid_sectors;
        let totsec = state.totsec;
        drop(state);

        let mut sector = start_sector;
        let mut byte = start_byte;
        let mut assembled: Vec<u8> = Vec::new();
        let mut tlen: Option<u32> = None;

        loop {
            if sector >= valid_sectors || sector >= totsec {
                return Ok((0, true));
            }
            let raw = self.read_sector(sector, sector_size)?;
            if byte as usize + LOG_RECORD_DESCRIPTOR_LEN > raw.len()
                || raw[byte as usize..byte as usize + LOG_RECORD_DESCRIPTOR_LEN].iter().all(|b| *b == 0)
            {
                // No more records in this sector.
                if tlen.is_some() {
                    return Err(Error::Malformed("record truncated at sector boundary".into()));
                }
                sector += 1;
                byte = LOG_BLOCK_HEADER_LEN as u32;
                continue;
            }
            let desc_start = byte as usize;
            let desc = LogRecordDescriptor::unpack(&raw[desc_start..desc_start + LOG_RECORD_DESCRIPTOR_LEN])?;
            let payload_start = desc_start + LOG_RECORD_DESCRIPTOR_LEN;
            let payload_end = payload_start + desc.rlen as usize;
            if payload_end > raw.len() {
                return Err(Error::Malformed("record chunk overruns log block".into()));
            }

            match desc.rtype {
                RecordType::CStart | RecordType::CEnd | RecordType::Pad => {
                    byte = payload_end as u32;
                    continue;
                }
                RecordType::Eol => {
                    return Ok((0, true));
                }
                RecordType::Data => {
                    if tlen.is_some() {
                        return Err(Error::Malformed("unexpected new record mid-datum".into()));
                    }
                    tlen = Some(desc.tlen);
                    assembled.extend_from_slice(&raw[payload_start..payload_end]);
                }
                RecordType::Continuation => {
                    if tlen.is_none() {
                        return Err(Error::Malformed("continuation without a preceding data record".into()));
                    }
                    assembled.extend_from_slice(&raw[payload_start..payload_end]);
                }
            }
            byte = payload_end as u32;

            if let Some(total) = tlen {
                if assembled.len() as u32 >= total {
                    if buf.len() < assembled.len() {
                        return Err(Error::Overflow { required: assembled.len() });
                    }
                    buf[..assembled.len()].copy_from_slice(&assembled);
                    self.cur_sector = sector;
                    self.cur_byte = byte;
                    return Ok((assembled.len(), false));
                }
            }
        }
    }

    fn read_sector(&self, sector: u32, sector_size: u32) -> Result<Vec<u8>> {
        match self.mlog.transport.submit(Command::MlRead {
            objid: self.mlog.objid,
            sector_offset: sector as u64,
            len: sector_size as usize,
        })? {
            Response::Bytes(b) => Ok(b),
            other => Err(Error::Bug(format!("unexpected response to ml_read: {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::MediaClass;
    use crate::transport::{InMemoryCore, TransportStub};

    fn transport() -> Arc<dyn CoreTransport> {
        Arc::new(TransportStub::new(InMemoryCore::new()))
    }

    fn open_fresh(transport: &Arc<dyn CoreTransport>, cap: u64) -> Mlog {
        let objid = Mlog::create(transport.clone(), MediaClass::Capacity, cap).unwrap();
        Mlog::open(transport.clone(), objid, MlogOpenFlags::empty()).unwrap()
    }

    #[test]
    fn scenario_1_single_record_round_trip() {
        let transport = transport();
        let ml = open_fresh(&transport, 1 << 20);
        let record: Vec<u8> = (0u8..16).collect();
        ml.append(&record, true).unwrap();
        ml.close().unwrap();

        let ml2 = Mlog::open(transport.clone(), ml.objid(), MlogOpenFlags::empty()).unwrap();
        let mut it = ml2.read_init();
        let mut buf = [0u8; 32];
        let (len, eof) = it.read_next(&mut buf).unwrap();
        assert!(!eof);
        assert_eq!(len, 16);
        assert_eq!(&buf[..16], &record[..]);
    }

    #[test]
    fn scenario_2_twelve_records_round_trip() {
        let transport = transport();
        let ml = open_fresh(&transport, 1 << 20);
        for i in 0..12u8 {
            ml.append(&[i; 128], false).unwrap();
        }
        ml.close().unwrap();

        let ml2 = Mlog::open(transport.clone(), ml.objid(), MlogOpenFlags::empty()).unwrap();
        let mut it = ml2.read_init();
        for i in 0..12u8 {
            let mut buf = [0u8; 128];
            let (len, eof) = it.read_next(&mut buf).unwrap();
            assert!(!eof);
            assert_eq!(len, 128);
            assert!(buf.iter().all(|b| *b == i));
        }
        let mut buf = [0u8; 128];
        let (_, eof) = it.read_next(&mut buf).unwrap();
        assert!(eof);
    }

    #[test]
    fn appending_after_reopen_preserves_earlier_records_in_same_sector() {
        // sector_size = 512 (DEFAULT_SECTOR_SIZE). A 50-byte record costs
        // 7B descriptor + 50B payload = 57B, landing aoff at
        // LOG_BLOCK_HEADER_LEN (34) + 57 = 91, well short of a full sector,
        // so the second record below lands in the very same sector that a
        // prior open cycle already flushed to media.
        let transport = transport();
        let ml = open_fresh(&transport, 1 << 16);
        let first = vec![0xAAu8; 50];
        ml.append(&first, true).unwrap();
        ml.close().unwrap();

        let ml2 = Mlog::open(transport.clone(), ml.objid(), MlogOpenFlags::empty()).unwrap();
        let second = vec![0xBBu8; 20];
        ml2.append(&second, true).unwrap();
        ml2.close().unwrap();

        let ml3 = Mlog::open(transport, ml2.objid(), MlogOpenFlags::empty()).unwrap();
        let mut it = ml3.read_init();
        let mut buf = [0u8; 64];

        let (len, eof) = it.read_next(&mut buf).unwrap();
        assert!(!eof, "first record lost across the reopen");
        assert_eq!(&buf[..len], &first[..]);

        let (len, eof) = it.read_next(&mut buf).unwrap();
        assert!(!eof);
        assert_eq!(&buf[..len], &second[..]);
    }

    #[test]
    fn p2_generation_strictly_increases_across_opens() {
        let transport = transport();
        let objid = Mlog::create(transport.clone(), MediaClass::Capacity, 1 << 16).unwrap();
        let mut last = 0u64;
        for _ in 0..3 {
            let ml = Mlog::open(transport.clone(), objid, MlogOpenFlags::empty()).unwrap();
            assert!(ml.gen() > last);
            last = ml.gen();
            ml.close().unwrap();
        }
    }

    #[test]
    fn p7_overflow_then_retry_returns_same_record() {
        let transport = transport();
        let ml = open_fresh(&transport, 1 << 16);
        ml.append(b"hello world", true).unwrap();
        let mut it = ml.read_init();
        let mut small = [0u8; 4];
        let err = it.read_next(&mut small).unwrap_err();
        let required = match err {
            Error::Overflow { required } => required,
            other => panic!("expected overflow, got {other:?}"),
        };
        assert_eq!(required, b"hello world".len());
        let mut big = vec![0u8; required];
        let (len, eof) = it.read_next(&mut big).unwrap();
        assert!(!eof);
        assert_eq!(&big[..len], b"hello world");
    }

    #[test]
    fn csem_rejects_dangling_cstart() {
        let transport = transport();
        let ml = open_fresh(&transport, 1 << 16);
        ml.append_cstart(true).unwrap();
        ml.append(b"mid-compaction", true).unwrap();
        ml.close().unwrap();

        let err = Mlog::open(transport.clone(), ml.objid(), MlogOpenFlags::CSEM).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn csem_accepts_balanced_markers() {
        let transport = transport();
        let ml = open_fresh(&transport, 1 << 16);
        ml.append_cstart(true).unwrap();
        ml.append(b"compacted data", true).unwrap();
        ml.append_cend(true).unwrap();
        ml.close().unwrap();

        let ml2 = Mlog::open(transport.clone(), ml.objid(), MlogOpenFlags::CSEM).unwrap();
        let mut it = ml2.read_init();
        let mut buf = [0u8; 64];
        let (len, _) = it.read_next(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"compacted data");
    }

    #[test]
    fn p4_torn_flush_boundary_is_discarded() {
        let transport_inner = InMemoryCore::new();
        let transport: Arc<dyn CoreTransport> = Arc::new(TransportStub::new(transport_inner));
        let ml = open_fresh(&transport, 8192);
        ml.append(&[1u8; 32], true).unwrap();
        ml.append(&[2u8; 32], true).unwrap();
        ml.close().unwrap();

        // Corrupt the chain by overwriting the second sector's pfsetid
        // field so it no longer matches the first sector's cfsetid,
        // simulating a crash mid-flush.
        let objid = ml.objid();
        let sector_size = ml.state.read().unwrap().sector_size;
        let raw = match transport.submit(Command::MlRead { objid, sector_offset: 1, len: sector_size as usize }).unwrap() {
            Response::Bytes(b) => b,
            _ => unreachable!(),
        };
        let mut corrupted = raw.clone();
        corrupted[16] ^= 0xFF; // first byte of pfsetid
        transport
            .submit(Command::MlWrite { objid, sector_offset: 1, data: corrupted })
            .unwrap();

        let ml2 = Mlog::open(transport.clone(), objid, MlogOpenFlags::empty()).unwrap();
        let mut it = ml2.read_init();
        let mut buf = [0u8; 64];
        let (len, eof) = it.read_next(&mut buf).unwrap();
        assert!(!eof);
        assert_eq!(&buf[..len], &[1u8; 32]);
        let (_, eof) = it.read_next(&mut buf).unwrap();
        assert!(eof, "iteration must cleanly stop at the torn boundary");
    }
}
