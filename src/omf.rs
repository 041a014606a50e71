//! On-media codec (C1).
//!
//! Little-endian, bit-exact pack/unpack for the three on-media layouts the
//! core and this client agree on: the superblock, the log-block header,
//! and the log-record descriptor. Every scalar field has an explicit wire
//! width, so hand-rolled `byteorder` pack/unpack is used here rather than
//! a general-purpose serializer: these are wire contracts, not
//! Rust-shaped data.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read};

use crate::error::{Error, Result};

/// The codec assumes these primitive widths; verified once at compile time
/// rather than hoping the target matches.
const _WIDTH_CHECK: () = {
    assert!(std::mem::size_of::<u8>() == 1);
    assert!(std::mem::size_of::<u16>() == 2);
    assert!(std::mem::size_of::<u32>() == 4);
    assert!(std::mem::size_of::<u64>() == 8);
};

/// ASCII "mpoolDev" in wire order.
pub const SUPERBLOCK_MAGIC: [u8; 8] = *b"mpoolDev";

/// Current (and only understood) log-block header version.
pub const LOG_BLOCK_HEADER_VERSION: u16 = 1;

pub const SUPERBLOCK_NAME_LEN: usize = 32;
pub const LOG_BLOCK_HEADER_LEN: usize = 16 + 4 + 4 + 8 + 2;
pub const LOG_RECORD_DESCRIPTOR_LEN: usize = 4 + 2 + 1;

/// On-media superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub pool_name: [u8; SUPERBLOCK_NAME_LEN],
    pub checksum_type: u8,
    pub version: u16,
    pub pool_uuid: [u8; 16],
    pub generation: u32,
}

impl Superblock {
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + SUPERBLOCK_NAME_LEN + 1 + 2 + 16 + 4);
        out.extend_from_slice(&SUPERBLOCK_MAGIC);
        out.extend_from_slice(&self.pool_name);
        out.push(self.checksum_type);
        out.write_u16::<LittleEndian>(self.version).unwrap();
        out.extend_from_slice(&self.pool_uuid);
        out.write_u32::<LittleEndian>(self.generation).unwrap();
        out
    }

    /// Unpack a superblock. Presence of the magic does not imply validity;
    /// callers must separately check `version`.
    pub fn unpack(buf: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(buf);
        let mut magic = [0u8; 8];
        cur.read_exact(&mut magic)
            .map_err(|e| short_read("superblock magic", e))?;
        if magic != SUPERBLOCK_MAGIC {
            return Err(Error::Malformed("superblock magic mismatch".into()));
        }
        let mut pool_name = [0u8; SUPERBLOCK_NAME_LEN];
        cur.read_exact(&mut pool_name)
            .map_err(|e| short_read("superblock pool name", e))?;
        let checksum_type = cur
            .read_u8()
            .map_err(|e| short_read("superblock checksum type", e))?;
        let version = cur
            .read_u16::<LittleEndian>()
            .map_err(|e| short_read("superblock version", e))?;
        let mut pool_uuid = [0u8; 16];
        cur.read_exact(&mut pool_uuid)
            .map_err(|e| short_read("superblock uuid", e))?;
        let generation = cur
            .read_u32::<LittleEndian>()
            .map_err(|e| short_read("superblock generation", e))?;
        Ok(Superblock {
            pool_name,
            checksum_type,
            version,
            pool_uuid,
            generation,
        })
    }
}

/// Record type tag carried by a [`LogRecordDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Data,
    Continuation,
    CStart,
    CEnd,
    Pad,
    Eol,
}

impl RecordType {
    fn to_byte(self) -> u8 {
        match self {
            RecordType::Data => 0,
            RecordType::Continuation => 1,
            RecordType::CStart => 2,
            RecordType::CEnd => 3,
            RecordType::Pad => 4,
            RecordType::Eol => 5,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(RecordType::Data),
            1 => Ok(RecordType::Continuation),
            2 => Ok(RecordType::CStart),
            3 => Ok(RecordType::CEnd),
            4 => Ok(RecordType::Pad),
            5 => Ok(RecordType::Eol),
            other => Err(Error::Malformed(format!("unknown record type {other}"))),
        }
    }
}

/// On-media log-block header: a per-mlog UUID, the previous and current
/// flush-set ids, the generation at write time, and a format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogBlockHeader {
    pub uuid: [u8; 16],
    pub pfsetid: u32,
    pub cfsetid: u32,
    pub gen: u64,
    pub version: u16,
}

impl LogBlockHeader {
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LOG_BLOCK_HEADER_LEN);
        out.extend_from_slice(&self.uuid);
        out.write_u32::<LittleEndian>(self.pfsetid).unwrap();
        out.write_u32::<LittleEndian>(self.cfsetid).unwrap();
        out.write_u64::<LittleEndian>(self.gen).unwrap();
        out.write_u16::<LittleEndian>(self.version).unwrap();
        out
    }

    /// Unpack the header, returning `(header, header_len)` so the caller
    /// can locate the first record. Fails with "invalid version" for an
    /// unknown version field.
    pub fn unpack(buf: &[u8]) -> Result<(Self, usize)> {
        let mut cur = Cursor::new(buf);
        let mut uuid = [0u8; 16];
        cur.read_exact(&mut uuid)
            .map_err(|e| short_read("log-block uuid", e))?;
        let pfsetid = cur
            .read_u32::<LittleEndian>()
            .map_err(|e| short_read("log-block pfsetid", e))?;
        let cfsetid = cur
            .read_u32::<LittleEndian>()
            .map_err(|e| short_read("log-block cfsetid", e))?;
        let gen = cur
            .read_u64::<LittleEndian>()
            .map_err(|e| short_read("log-block gen", e))?;
        let version = cur
            .read_u16::<LittleEndian>()
            .map_err(|e| short_read("log-block version", e))?;
        if version != LOG_BLOCK_HEADER_VERSION {
            return Err(Error::Malformed(format!(
                "invalid version: log block header version {version}"
            )));
        }
        Ok((
            LogBlockHeader {
                uuid,
                pfsetid,
                cfsetid,
                gen,
                version,
            },
            LOG_BLOCK_HEADER_LEN,
        ))
    }

    /// A log block is empty iff its first header word (the first four
    /// bytes of the UUID, treated as the presence word) is all zero.
    pub fn is_empty_block(buf: &[u8]) -> bool {
        buf.len() >= 4 && buf[0..4] == [0, 0, 0, 0]
    }
}

/// On-media log-record descriptor preceding every record chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecordDescriptor {
    /// Logical length of the entire record across all continuation chunks.
    pub tlen: u32,
    /// Length of this chunk.
    pub rlen: u16,
    pub rtype: RecordType,
}

impl LogRecordDescriptor {
    pub fn pack(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(LOG_RECORD_DESCRIPTOR_LEN);
        out.write_u32::<LittleEndian>(self.tlen).unwrap();
        out.write_u16::<LittleEndian>(self.rlen).unwrap();
        out.push(self.rtype.to_byte());
        Ok(out)
    }

    pub fn unpack(buf: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(buf);
        let tlen = cur
            .read_u32::<LittleEndian>()
            .map_err(|e| short_read("record tlen", e))?;
        let rlen = cur
            .read_u16::<LittleEndian>()
            .map_err(|e| short_read("record rlen", e))?;
        let rtype = cur
            .read_u8()
            .map_err(|e| short_read("record rtype", e))?;
        Ok(LogRecordDescriptor {
            tlen,
            rlen,
            rtype: RecordType::from_byte(rtype)?,
        })
    }
}

fn short_read(field: &str, e: io::Error) -> Error {
    Error::Malformed(format!("short read unpacking {field}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_round_trips() {
        let sb = Superblock {
            pool_name: [b'x'; SUPERBLOCK_NAME_LEN],
            checksum_type: 1,
            version: 1,
            pool_uuid: [7u8; 16],
            generation: 42,
        };
        let packed = sb.pack();
        let unpacked = Superblock::unpack(&packed).unwrap();
        assert_eq!(sb, unpacked);
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let mut packed = Superblock {
            pool_name: [0; SUPERBLOCK_NAME_LEN],
            checksum_type: 0,
            version: 1,
            pool_uuid: [0; 16],
            generation: 0,
        }
        .pack();
        packed[0] = b'X';
        assert!(Superblock::unpack(&packed).is_err());
    }

    #[test]
    fn log_block_header_round_trips() {
        let hdr = LogBlockHeader {
            uuid: [3u8; 16],
            pfsetid: 1,
            cfsetid: 2,
            gen: 99,
            version: LOG_BLOCK_HEADER_VERSION,
        };
        let packed = hdr.pack();
        let (unpacked, len) = LogBlockHeader::unpack(&packed).unwrap();
        assert_eq!(hdr, unpacked);
        assert_eq!(len, LOG_BLOCK_HEADER_LEN);
    }

    #[test]
    fn log_block_header_rejects_unknown_version() {
        let hdr = LogBlockHeader {
            uuid: [0u8; 16],
            pfsetid: 0,
            cfsetid: 0,
            gen: 0,
            version: 99,
        };
        assert!(LogBlockHeader::unpack(&hdr.pack()).is_err());
    }

    #[test]
    fn empty_block_predicate() {
        let zero = [0u8; LOG_BLOCK_HEADER_LEN];
        assert!(LogBlockHeader::is_empty_block(&zero));
        let mut nonzero = zero;
        nonzero[0] = 1;
        assert!(!LogBlockHeader::is_empty_block(&nonzero));
    }

    #[test]
    fn log_record_descriptor_round_trips() {
        for rtype in [
            RecordType::Data,
            RecordType::Continuation,
            RecordType::CStart,
            RecordType::CEnd,
            RecordType::Pad,
            RecordType::Eol,
        ] {
            let d = LogRecordDescriptor { tlen: 128, rlen: 64, rtype };
            let packed = d.pack().unwrap();
            assert_eq!(packed.len(), LOG_RECORD_DESCRIPTOR_LEN);
            let unpacked = LogRecordDescriptor::unpack(&packed).unwrap();
            assert_eq!(d, unpacked);
        }
    }

    /// Round-trips a log-block header through a scratch file rather than
    /// an in-memory buffer, exercising the codec against the same kind of
    /// byte-for-byte boundary a real block-device-backed log would cross.
    #[test]
    fn log_block_header_round_trips_through_a_scratch_file() {
        use std::io::{Read, Seek, SeekFrom, Write};

        let hdr = LogBlockHeader {
            uuid: [9u8; 16],
            pfsetid: 5,
            cfsetid: 6,
            gen: 777,
            version: LOG_BLOCK_HEADER_VERSION,
        };
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&hdr.pack()).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut raw = vec![0u8; LOG_BLOCK_HEADER_LEN];
        file.read_exact(&mut raw).unwrap();

        let (unpacked, len) = LogBlockHeader::unpack(&raw).unwrap();
        assert_eq!(unpacked, hdr);
        assert_eq!(len, LOG_BLOCK_HEADER_LEN);
    }

    #[test]
    fn log_record_descriptor_rejects_unknown_type() {
        let mut packed = LogRecordDescriptor {
            tlen: 1,
            rlen: 1,
            rtype: RecordType::Data,
        }
        .pack()
        .unwrap();
        *packed.last_mut().unwrap() = 200;
        assert!(LogRecordDescriptor::unpack(&packed).is_err());
    }
}
