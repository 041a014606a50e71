//! mcache engine (C7): bounded per-mblock virtual mapping with guard
//! pages, page access, and OS paging advice.
//!
//! Each mapped mblock occupies exactly its allocated capacity; a guard
//! page follows every mblock so a load crossing the boundary takes a
//! hardware bus fault instead of silently reading adjacent mblock data.
//! Where the host doesn't support `mmap`/`mprotect` guard pages, the
//! engine falls back to an explicit bounds-checked path that refuses to
//! ever hand out an out-of-range address.

use std::ptr::NonNull;
use std::sync::Arc;

use log::{trace, warn};
use nix::sys::mman::{self, MapFlags, MmapAdvise, ProtFlags};

use crate::error::{Error, Result};
use crate::flags::{MadviseKind, McAdvice};
use crate::mblock::Mblock;
use crate::objid::ObjId;
use crate::transport::CoreTransport;

/// Host page size, read once via `sysconf(_SC_PAGESIZE)` rather than
/// assumed, since guard-page placement must line up with whatever the
/// kernel actually enforces for `mprotect`.
fn page_size() -> usize {
    static CACHED: std::sync::OnceLock<usize> = std::sync::OnceLock::new();
    *CACHED.get_or_init(|| {
        let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if ret > 0 {
            ret as usize
        } else {
            4096
        }
    })
}

fn round_up_to_page(n: usize) -> usize {
    let page = page_size();
    (n + page - 1) / page * page
}

struct Region {
    objid: ObjId,
    base: usize,
    len: usize,
}

/// A live mapping of one or more committed mblocks.
///
/// On platforms with `mmap`/`mprotect` support (all targets reachable via
/// `nix`), backed by a real anonymous mapping with `PROT_NONE` guard
/// pages. If the reservation fails, [`McacheMap::map`] falls back
/// automatically to [`McacheMap::map_checked`]'s bounds-checked mode,
/// which never exposes a raw pointer outside a caller-verified range.
pub struct McacheMap {
    regions: Vec<Region>,
    mapping: Option<(NonNull<std::ffi::c_void>, usize)>,
    #[allow(dead_code)]
    advice: McAdvice,
}

unsafe impl Send for McacheMap {}
unsafe impl Sync for McacheMap {}

impl McacheMap {
    /// `mc_map`: maps `mblocks` (objid + committed length pairs) in
    /// order, separated by guard pages. Reads mblock content through
    /// `transport` to populate the mapped pages.
    pub fn map(transport: &Arc<dyn CoreTransport>, mblocks: &[(Mblock, u64)], advice: McAdvice) -> Result<Self> {
        match Self::map_with_guard_pages(transport, mblocks, advice) {
            Ok(m) => Ok(m),
            Err(e) => {
                warn!("mcache: guard-page mapping unavailable ({e}), falling back to bounds-checked mode");
                Self::map_checked(mblocks, advice)
            }
        }
    }

    fn map_with_guard_pages(transport: &Arc<dyn CoreTransport>, mblocks: &[(Mblock, u64)], advice: McAdvice) -> Result<Self> {
        if mblocks.is_empty() {
            return Err(Error::InvalidArgument("mcache map requires at least one mblock".into()));
        }

        let page = page_size();
        let page_lens: Vec<usize> = mblocks.iter().map(|(_, cap)| round_up_to_page(*cap as usize)).collect();
        let total: usize = page_lens.iter().map(|l| l + page).sum();

        let base = unsafe {
            mman::mmap_anonymous(
                None,
                std::num::NonZeroUsize::new(total).ok_or_else(|| Error::InvalidArgument("zero-length mcache map".into()))?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }?;

        let mut regions = Vec::with_capacity(mblocks.len());
        let mut offset = 0usize;
        for ((mblock, cap), page_len) in mblocks.iter().zip(page_lens.iter()) {
            let region_base = base.as_ptr() as usize + offset;
            let data = mblock.read(0, *cap as usize)?;
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), region_base as *mut u8, data.len());
            }
            regions.push(Region { objid: mblock.objid(), base: region_base, len: *cap as usize });

            let guard_addr = region_base + page_len;
            let guard_ptr = NonNull::new(guard_addr as *mut std::ffi::c_void)
                .ok_or_else(|| Error::Bug("null guard page address".into()))?;
            unsafe { mman::mprotect(guard_ptr, page, ProtFlags::PROT_NONE) }?;

            offset += page_len + page;
        }

        trace!("mcache: mapped {} mblocks, {total} bytes reserved with guard pages", regions.len());
        let _ = transport;
        Ok(McacheMap { regions, mapping: Some((base, total)), advice })
    }

    /// Bounds-checked fallback used when the host can't provide guard
    /// pages. Content is held in ordinary owned buffers; `getbase` always
    /// refuses to hand out a raw pointer in this mode, and `getpages`
    /// range-checks every request against the per-mblock capacity.
    pub fn map_checked(mblocks: &[(Mblock, u64)], advice: McAdvice) -> Result<Self> {
        if mblocks.is_empty() {
            return Err(Error::InvalidArgument("mcache map requires at least one mblock".into()));
        }
        let mut owned: Vec<(ObjId, Vec<u8>)> = Vec::with_capacity(mblocks.len());
        for (mblock, cap) in mblocks {
            let data = mblock.read(0, *cap as usize)?;
            owned.push((mblock.objid(), data));
        }
        // Leak the buffers into a stable heap location for the lifetime of
        // the map so `getpages` can return addresses into it; `munmap`
        // reclaims them.
        let regions = owned
            .into_iter()
            .map(|(objid, mut data)| {
                data.shrink_to_fit();
                let base = data.as_ptr() as usize;
                let len = data.len();
                std::mem::forget(data);
                Region { objid, base, len }
            })
            .collect();
        Ok(McacheMap { regions, mapping: None, advice })
    }

    fn region(&self, idx: usize) -> Result<&Region> {
        self.regions
            .get(idx)
            .ok_or_else(|| Error::InvalidArgument(format!("mcache: no mblock at index {idx}")))
    }

    /// `mc_unmap`. Idempotent teardown; double-`munmap` is a caller bug
    /// but is tolerated here by consuming `self`.
    pub fn unmap(mut self) -> Result<()> {
        if let Some((base, total)) = self.mapping.take() {
            unsafe { mman::munmap(base, total) }?;
        } else {
            for region in self.regions.drain(..) {
                unsafe {
                    drop(Vec::from_raw_parts(region.base as *mut u8, region.len, region.len));
                }
            }
        }
        Ok(())
    }

    /// `getbase`: returns the mblock's virtual base address. Refuses to
    /// hand out a pointer in bounds-checked fallback mode, since that
    /// mode can't back the pointer with a guard-page contract.
    pub fn getbase(&self, mblock_idx: usize) -> Result<usize> {
        if self.mapping.is_none() {
            return Err(Error::InvalidArgument(
                "getbase refused: mcache is running in bounds-checked fallback mode".into(),
            ));
        }
        Ok(self.region(mblock_idx)?.base)
    }

    /// `getpages`: returns virtual addresses for `count` pages at the
    /// given in-mblock page offsets. In fallback mode, every offset is
    /// range-checked against the mblock's capacity before an address is
    /// returned.
    pub fn getpages(&self, mblock_idx: usize, offsets: &[usize], out_addrs: &mut [usize]) -> Result<()> {
        if offsets.len() != out_addrs.len() {
            return Err(Error::InvalidArgument("offsets/out_addrs length mismatch".into()));
        }
        let region = self.region(mblock_idx)?;
        for (offset, out) in offsets.iter().zip(out_addrs.iter_mut()) {
            let byte_off = offset * page_size();
            if byte_off >= region.len {
                return Err(Error::InvalidArgument(format!(
                    "getpages: page offset {offset} out of range for mblock {} (len {})",
                    region.objid, region.len
                )));
            }
            *out = region.base + byte_off;
        }
        Ok(())
    }

    /// `mc_advise`.
    pub fn madvise(&self, mblock_idx: usize, off: usize, len: usize, kind: MadviseKind) -> Result<()> {
        let region = self.region(mblock_idx)?;
        if off + len > region.len {
            return Err(Error::InvalidArgument("madvise range exceeds mblock length".into()));
        }
        if self.mapping.is_none() {
            // No OS mapping to advise in fallback mode; a no-op is the
            // correct "hint" semantics.
            return Ok(());
        }
        let addr = NonNull::new((region.base + off) as *mut std::ffi::c_void)
            .ok_or_else(|| Error::Bug("null madvise address".into()))?;
        let advise = match kind {
            MadviseKind::WillNeed => MmapAdvise::MADV_WILLNEED,
            MadviseKind::DontNeed => MmapAdvise::MADV_DONTNEED,
            MadviseKind::Random => MmapAdvise::MADV_RANDOM,
            MadviseKind::Sequential => MmapAdvise::MADV_SEQUENTIAL,
        };
        unsafe { mman::madvise(addr, len, advise) }.map_err(Error::from)
    }

    /// `mincore`: resident and virtual set sizes across the whole map, in
    /// bytes.
    pub fn mincore(&self) -> Result<(u64, u64)> {
        let vss: u64 = self.regions.iter().map(|r| r.len as u64).sum();
        let Some((base, total)) = self.mapping else {
            // Fallback mode content is always backed by ordinary process
            // memory, so it's resident by definition.
            return Ok((vss, vss));
        };
        let page = page_size();
        let page_count = total.div_ceil(page);
        let mut vec = vec![0u8; page_count];
        let rc = unsafe { libc::mincore(base.as_ptr(), total, vec.as_mut_ptr()) };
        nix::errno::Errno::result(rc)?;
        let resident_pages = vec.iter().filter(|b| **b & 1 != 0).count();
        Ok(((resident_pages * page) as u64, vss))
    }
}

impl Drop for McacheMap {
    fn drop(&mut self) {
        if let Some((base, total)) = self.mapping.take() {
            if let Err(e) = unsafe { mman::munmap(base, total) } {
                warn!("mcache: munmap failed during drop: {e}");
            }
        } else {
            for region in self.regions.drain(..) {
                unsafe {
                    drop(Vec::from_raw_parts(region.base as *mut u8, region.len, region.len));
                }
            }
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

    #[test]
    fn checked_mode_rejects_out_of_range_pages() {
        let transport = transport();
        let (mb, _) = Mblock::alloc(transport, MediaClass::Capacity, 4096, false).unwrap();
        mb.write(&[7u8; 4096]).unwrap();
        mb.commit().unwrap();

        let map = McacheMap::map_checked(&[(mb, 4096)], McAdvice::Warm).unwrap();
        let mut out = [0usize; 1];
        map.getpages(0, &[0], &mut out).unwrap();
        assert!(map.getpages(0, &[1], &mut out).is_err());
        assert!(map.getbase(0).is_err());
        map.unmap().unwrap();
    }

    #[test]
    fn checked_mode_reads_match_mblock_contents() {
        let transport = transport();
        let (mb, _) = Mblock::alloc(transport, MediaClass::Capacity, 16, false).unwrap();
        let content = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];
        mb.write(&content).unwrap();
        mb.commit().unwrap();

        let map = McacheMap::map_checked(&[(mb, 16)], McAdvice::Hot).unwrap();
        let mut out = [0usize; 1];
        map.getpages(0, &[0], &mut out).unwrap();
        let slice = unsafe { std::slice::from_raw_parts(out[0] as *const u8, 16) };
        assert_eq!(slice, &content[..]);
        map.unmap().unwrap();
    }
}
