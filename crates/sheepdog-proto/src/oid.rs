//! 64-bit object identifiers.
//!
//! ```text
//!  63      59 58   56 55           32 31               0
//! +----------+-------+---------------+------------------+
//! | type bits|  rsvd |    vdi id     |    data index    |
//! +----------+-------+---------------+------------------+
//! ```
//!
//! At most one type bit is set. An oid without type bits is a data object;
//! its ledger companion is the same oid with the ledger bit added.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::MAX_DATA_OBJS;
use crate::error::SdError;

const VID_SHIFT: u32 = 32;
const VID_MASK: u64 = 0x00FF_FFFF << VID_SHIFT;

const KIND_BITS: [(u64, ObjectKind); 5] = [
    (1 << 63, ObjectKind::Vdi),
    (1 << 62, ObjectKind::VmState),
    (1 << 61, ObjectKind::VdiAttr),
    (1 << 60, ObjectKind::VdiBtree),
    (1 << 59, ObjectKind::Ledger),
];
const LEDGER_BIT: u64 = 1 << 59;
const KIND_MASK: u64 = 0x1F << 59;

/// What an object holds, from its type bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Data,
    /// Inode of a virtual disk.
    Vdi,
    VmState,
    VdiAttr,
    VdiBtree,
    /// Reference counts of the data object sharing the same low bits.
    Ledger,
}

impl ObjectKind {
    /// Anything but data and ledgers is metadata.
    pub fn is_meta(self) -> bool {
        !matches!(self, Self::Data | Self::Ledger)
    }
}

/// A 64-bit object identifier. Displays as 16 lowercase hex digits, the
/// form used for object file names and in logs.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Inode oid of `vid`.
    pub const fn from_vid(vid: u32) -> Self {
        Self((1 << 63) | ((vid as u64) << VID_SHIFT))
    }

    /// Data oid of block `idx` of `vid`.
    pub const fn from_vid_data(vid: u32, idx: u64) -> Self {
        Self(((vid as u64) << VID_SHIFT) | (idx & (MAX_DATA_OBJS - 1)))
    }

    pub fn kind(self) -> ObjectKind {
        KIND_BITS
            .iter()
            .find(|(bit, _)| self.0 & bit != 0)
            .map_or(ObjectKind::Data, |(_, kind)| *kind)
    }

    pub fn is_data_obj(self) -> bool {
        self.0 & KIND_MASK == 0
    }

    pub fn is_ledger_obj(self) -> bool {
        self.0 & LEDGER_BIT != 0
    }

    pub const fn vid(self) -> u32 {
        ((self.0 & VID_MASK) >> VID_SHIFT) as u32
    }

    pub const fn data_index(self) -> u64 {
        self.0 & (MAX_DATA_OBJS - 1)
    }

    pub const fn data_to_ledger(self) -> Self {
        Self(self.0 | LEDGER_BIT)
    }

    pub const fn ledger_to_data(self) -> Self {
        Self(self.0 & !LEDGER_BIT)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({:016x}, {:?})", self.0, self.kind())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Parses exactly 16 hex digits; no prefix, no sign.
impl FromStr for ObjectId {
    type Err = SdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(SdError::InvalidParms);
        }
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| SdError::InvalidParms)
    }
}
