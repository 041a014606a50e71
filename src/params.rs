//! Pool-wide parameters and properties returned by the core.

use serde::{Deserialize, Serialize};

use crate::objid::ObjId;

/// Sentinel for "unset" on fields that use it (`spare_*`, `ra_pages_max`).
pub const PARAM_INVALID: u32 = u32::MAX;

pub const MPOOL_LABEL_LEN: usize = 64;

/// Media class a mblock/mlog is allocated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaClass {
    Capacity,
    Staging,
}

pub const MEDIA_CLASS_COUNT: usize = 2;

/// Snapshot of pool-wide parameters, as returned by `pool_params_get`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolParams {
    pub uid: i32,
    pub gid: i32,
    pub mode: i32,
    pub spare_cap: u32,
    pub spare_stg: u32,
    pub ra_pages_max: u32,
    pub mdc0cap: u64,
    pub mdcncap: u64,
    pub mdcnum: u32,
    pub label: String,
    pub mblocksz: [u32; MEDIA_CLASS_COUNT],
}

impl Default for PoolParams {
    fn default() -> Self {
        PoolParams {
            uid: -1,
            gid: -1,
            mode: -1,
            spare_cap: PARAM_INVALID,
            spare_stg: PARAM_INVALID,
            ra_pages_max: PARAM_INVALID,
            mdc0cap: 0,
            mdcncap: 0,
            mdcnum: 0,
            label: "invalid".to_string(),
            mblocksz: [0; MEDIA_CLASS_COUNT],
        }
    }
}

/// Properties of an mblock, as returned by `mb_alloc`/`mb_getprops`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MblockProps {
    pub objid: ObjId,
    pub mclass: MediaClass,
    pub alloc_cap: u64,
    pub write_len: u64,
    pub optimal_write_sz: u32,
    pub committed: bool,
}

/// Properties of an mlog, as returned by `ml_alloc`/`ml_getprops`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MlogProps {
    pub objid: ObjId,
    pub mclass: MediaClass,
    pub cap: u64,
    pub sector_size: u32,
    pub totsec: u32,
    pub gen: u64,
    pub committed: bool,
}
