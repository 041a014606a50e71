//! Client library for a block-device-backed object storage pool (mpool).
//!
//! A pool exposes three object kinds — mblocks (append-once, commit-once
//! bulk objects), mlogs (append-only logs with compaction markers and
//! monotonic generations), and MDCs (a pair of mlogs forming a
//! compactable metadata journal) — plus an mcache facility that maps
//! committed mblocks into the process address space with per-object
//! bounds enforcement.
//!
//! The kernel-resident core that owns the superblock, physical drive
//! set, and metadata catalog is out of scope; it is modeled here as the
//! [`transport::CoreTransport`] trait, with [`transport::InMemoryCore`]
//! as a reference implementation sufficient to drive every client code
//! path and this crate's test suite.

pub mod error;
pub mod flags;
pub mod handle_table;
pub mod mblock;
pub mod mcache;
pub mod mdc;
pub mod mlog;
pub mod objid;
pub mod omf;
pub mod params;
pub mod pool;
pub mod transport;

pub use error::{DeviceErrorReport, Error, RCode, Result};
pub use flags::{MadviseKind, McAdvice, MdcOpenFlags, MlogOpenFlags, PoolOpenFlags};
pub use mblock::Mblock;
pub use mcache::McacheMap;
pub use mdc::{Mdc, MdcChannel};
pub use mlog::{Mlog, ReadIterator};
pub use objid::{ObjId, ObjType};
pub use params::{MblockProps, MediaClass, MlogProps, PoolParams};
pub use pool::Pool;
pub use transport::{Command, CoreTransport, InMemoryCore, Response, TransportStub};
