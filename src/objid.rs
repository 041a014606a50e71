//! Object identifiers.
//!
//! The bit layout used by the core is opaque to this crate except for the
//! two fields it needs to dispatch on: the object-type nibble (bits 8..11)
//! and the low byte ("slot"), which must be non-zero for any user-visible
//! object. An [`ObjId`] is immutable once issued; the client only ever
//! receives one from the transport and hands it back unmodified.

use std::fmt;

const TYPE_SHIFT: u64 = 8;
const TYPE_MASK: u64 = 0xF;
const SLOT_MASK: u64 = 0xFF;

/// The object type encoded in an [`ObjId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ObjType {
    Mblock,
    Mlog,
}

impl ObjType {
    fn bits(self) -> u64 {
        match self {
            ObjType::Mblock => 1,
            ObjType::Mlog => 2,
        }
    }

    fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            1 => Some(ObjType::Mblock),
            2 => Some(ObjType::Mlog),
            _ => None,
        }
    }
}

/// A 64-bit object identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ObjId(u64);

impl ObjId {
    /// Construct an id from its raw 64-bit representation, validating the
    /// invariants every user-visible objid must satisfy.
    pub fn from_raw(raw: u64) -> crate::error::Result<Self> {
        let id = ObjId(raw);
        if id.slot() == 0 {
            return Err(crate::error::Error::InvalidArgument(
                "objid has zero slot".into(),
            ));
        }
        if id.obj_type().is_none() {
            return Err(crate::error::Error::InvalidArgument(format!(
                "objid {raw:#x} has unknown object type"
            )));
        }
        Ok(id)
    }

    /// Build an objid out of a type tag and a slot number; used by
    /// [`crate::transport::InMemoryCore`] to mint fresh ids.
    pub(crate) fn compose(ty: ObjType, slot: u8, unique: u64) -> Self {
        let raw = (unique << 16) | (ty.bits() << TYPE_SHIFT) | (slot as u64);
        ObjId(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn obj_type(self) -> Option<ObjType> {
        ObjType::from_bits((self.0 >> TYPE_SHIFT) & TYPE_MASK)
    }

    pub fn slot(self) -> u8 {
        (self.0 & SLOT_MASK) as u8
    }

    pub fn is_mlog(self) -> bool {
        self.obj_type() == Some(ObjType::Mlog)
    }

    pub fn is_mblock(self) -> bool {
        self.obj_type() == Some(ObjType::Mblock)
    }
}

impl fmt::Debug for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjId({:#018x})", self.0)
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_slot() {
        let raw = (ObjType::Mlog.bits() << TYPE_SHIFT) | 0;
        assert!(ObjId::from_raw(raw).is_err());
    }

    #[test]
    fn rejects_unknown_type() {
        let raw = (0xF << TYPE_SHIFT) | 1;
        assert!(ObjId::from_raw(raw).is_err());
    }

    #[test]
    fn round_trips_type_and_slot() {
        let id = ObjId::compose(ObjType::Mblock, 7, 42);
        assert_eq!(id.obj_type(), Some(ObjType::Mblock));
        assert_eq!(id.slot(), 7);
    }
}
