//! Flag words used across the pool/mlog/mcache surface.
//!
//! These are expressed as [`bitflags`] types instead of raw integers so
//! misuse (passing an mlog flag where a pool flag is expected) is caught
//! at compile time, mirroring how the on-media/ABI flag words in the rest
//! of the retrieval pack are wrapped.

use bitflags::bitflags;

bitflags! {
    /// Flags accepted by [`crate::pool::Pool::open`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PoolOpenFlags: u32 {
        /// Request exclusive access; a later non-exclusive open must fail.
        const EXCL = 1 << 0;
        /// Open read-only.
        const RDONLY = 1 << 1;
    }
}

bitflags! {
    /// Flags accepted by [`crate::mlog::Mlog::open`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MlogOpenFlags: u32 {
        /// Enforce CSTART/CEND balance; a dangling CSTART fails the open.
        const CSEM = 1 << 0;
        /// Open for reading only; appends are refused.
        const RDONLY = 1 << 1;
    }
}

bitflags! {
    /// Flags accepted by [`crate::mdc::Mdc::open`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MdcOpenFlags: u32 {
        const RDONLY = 1 << 0;
    }
}

/// Page-replacement aggressiveness hint for an mcache map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McAdvice {
    Cold,
    Warm,
    Hot,
}

/// Hint passed to [`crate::mcache::McacheMap::madvise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MadviseKind {
    WillNeed,
    DontNeed,
    Random,
    Sequential,
}
