/// Fixed-width request and response headers.
///
/// Both headers are 48 bytes and share one slot on the wire: a client sends
/// a request header, the server answers with a response header of the same
/// size, each optionally followed by `data_length` bytes of payload.
/// Multi-byte fields are host-endian; heterogeneous clusters are not
/// supported.
///
/// ```text
///  0  proto_ver u8     1  opcode u8     2  flags u16
///  4  epoch u32        8  id u32       12  data_length u32
/// 16  request:  oid u64 | cow_oid u64 | copies u8 | copy_policy u8
///               | ec_index u8 | rsvd u8 | tgt_epoch u32 | offset u64
///     refcount: ledger oid u64 | generation u32 | count u32
///     response: result u32 | copies u8 | rsvd [u8; 3] | offset u64
/// ```

use bitflags::bitflags;

use crate::constants::{SD_PROTO_VER, SD_REQ_SIZE, SD_RSP_SIZE};
use crate::error::{code_to_result, SdError, SdResult, SD_RES_SUCCESS};
use crate::oid::ObjectId;

bitflags! {
    /// Request flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReqFlags: u16 {
        /// Payload flows client to server.
        const WRITE = 0x01;
        /// Server returns a payload of the same length back.
        const PIGGYBACK = 0x02;
        /// Forwarded by a gateway thread; must not re-enter the gateway queue.
        const FWD = 0x04;
    }
}

/// Operation codes carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    CreateAndWriteObj = 0x01,
    ReadObj = 0x02,
    WriteObj = 0x03,
    RemoveObj = 0x04,
    DiscardObj = 0x05,
    CreateAndWritePeer = 0xA3,
    ReadPeer = 0xA4,
    WritePeer = 0xA5,
    RemovePeer = 0xA6,
    DecrefObj = 0xBA,
    DecrefPeer = 0xBB,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x01 => Self::CreateAndWriteObj,
            0x02 => Self::ReadObj,
            0x03 => Self::WriteObj,
            0x04 => Self::RemoveObj,
            0x05 => Self::DiscardObj,
            0xA3 => Self::CreateAndWritePeer,
            0xA4 => Self::ReadPeer,
            0xA5 => Self::WritePeer,
            0xA6 => Self::RemovePeer,
            0xBA => Self::DecrefObj,
            0xBB => Self::DecrefPeer,
            _ => return None,
        })
    }

    /// Whether the opcode carries the refcount triplet instead of object
    /// arguments.
    pub fn is_refcount(self) -> bool {
        matches!(self, Self::DecrefObj | Self::DecrefPeer)
    }
}

/// Arguments of object operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjArgs {
    pub oid: ObjectId,
    pub cow_oid: ObjectId,
    pub copies: u8,
    pub copy_policy: u8,
    pub ec_index: u8,
    pub tgt_epoch: u32,
    pub offset: u64,
}

/// Arguments of refcount operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefArgs {
    /// Ledger oid whose counter is decremented.
    pub oid: ObjectId,
    pub generation: u32,
    pub count: u32,
}

/// Discriminated argument area of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqArgs {
    Obj(ObjArgs),
    Ref(RefArgs),
}

/// Request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub proto_ver: u8,
    pub opcode: Opcode,
    pub flags: ReqFlags,
    pub epoch: u32,
    pub id: u32,
    pub data_length: u32,
    pub args: ReqArgs,
}

impl RequestHeader {
    /// A zeroed request for `opcode` with the client protocol version.
    pub fn new(opcode: Opcode) -> Self {
        let args = if opcode.is_refcount() {
            ReqArgs::Ref(RefArgs::default())
        } else {
            ReqArgs::Obj(ObjArgs::default())
        };
        Self {
            proto_ver: SD_PROTO_VER,
            opcode,
            flags: ReqFlags::empty(),
            epoch: 0,
            id: 0,
            data_length: 0,
            args,
        }
    }

    /// Object arguments, if this is an object request.
    pub fn obj(&self) -> Option<&ObjArgs> {
        match &self.args {
            ReqArgs::Obj(o) => Some(o),
            ReqArgs::Ref(_) => None,
        }
    }

    pub fn obj_mut(&mut self) -> Option<&mut ObjArgs> {
        match &mut self.args {
            ReqArgs::Obj(o) => Some(o),
            ReqArgs::Ref(_) => None,
        }
    }

    /// Refcount arguments, if this is a refcount request.
    pub fn refcnt(&self) -> Option<&RefArgs> {
        match &self.args {
            ReqArgs::Ref(r) => Some(r),
            ReqArgs::Obj(_) => None,
        }
    }

    /// Bytes of payload the client sends after the header.
    pub fn write_len(&self) -> u32 {
        if self.flags.contains(ReqFlags::WRITE) {
            self.data_length
        } else {
            0
        }
    }

    /// Bytes of payload the client expects back at most.
    pub fn read_len(&self) -> u32 {
        if !self.flags.contains(ReqFlags::WRITE) || self.flags.contains(ReqFlags::PIGGYBACK) {
            self.data_length
        } else {
            0
        }
    }

    pub fn to_bytes(&self) -> [u8; SD_REQ_SIZE] {
        let mut buf = [0u8; SD_REQ_SIZE];
        buf[0] = self.proto_ver;
        buf[1] = self.opcode as u8;
        buf[2..4].copy_from_slice(&self.flags.bits().to_ne_bytes());
        buf[4..8].copy_from_slice(&self.epoch.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.id.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.data_length.to_ne_bytes());
        match &self.args {
            ReqArgs::Obj(o) => {
                buf[16..24].copy_from_slice(&o.oid.raw().to_ne_bytes());
                buf[24..32].copy_from_slice(&o.cow_oid.raw().to_ne_bytes());
                buf[32] = o.copies;
                buf[33] = o.copy_policy;
                buf[34] = o.ec_index;
                buf[36..40].copy_from_slice(&o.tgt_epoch.to_ne_bytes());
                buf[40..48].copy_from_slice(&o.offset.to_ne_bytes());
            }
            ReqArgs::Ref(r) => {
                buf[16..24].copy_from_slice(&r.oid.raw().to_ne_bytes());
                buf[24..28].copy_from_slice(&r.generation.to_ne_bytes());
                buf[28..32].copy_from_slice(&r.count.to_ne_bytes());
            }
        }
        buf
    }

    /// Decode a request header. Unknown opcodes yield `NoSupport`.
    pub fn from_bytes(buf: &[u8; SD_REQ_SIZE]) -> SdResult<Self> {
        let opcode = Opcode::from_u8(buf[1]).ok_or(SdError::NoSupport)?;
        let args = if opcode.is_refcount() {
            ReqArgs::Ref(RefArgs {
                oid: ObjectId::new(u64_at(buf, 16)),
                generation: u32_at(buf, 24),
                count: u32_at(buf, 28),
            })
        } else {
            ReqArgs::Obj(ObjArgs {
                oid: ObjectId::new(u64_at(buf, 16)),
                cow_oid: ObjectId::new(u64_at(buf, 24)),
                copies: buf[32],
                copy_policy: buf[33],
                ec_index: buf[34],
                tgt_epoch: u32_at(buf, 36),
                offset: u64_at(buf, 40),
            })
        };
        Ok(Self {
            proto_ver: buf[0],
            opcode,
            flags: ReqFlags::from_bits_retain(u16::from_ne_bytes([buf[2], buf[3]])),
            epoch: u32_at(buf, 4),
            id: u32_at(buf, 8),
            data_length: u32_at(buf, 12),
            args,
        })
    }
}

/// Response header; occupies the same 48-byte slot as the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseHeader {
    pub proto_ver: u8,
    pub opcode: u8,
    pub flags: u16,
    pub epoch: u32,
    pub id: u32,
    /// Payload bytes that follow; may be shorter than requested.
    pub data_length: u32,
    /// Wire result code, [`SD_RES_SUCCESS`] on success.
    pub result: u32,
    pub copies: u8,
    pub offset: u64,
}

impl ResponseHeader {
    /// A response echoing the identity of `req` with the given outcome.
    pub fn for_request(req: &RequestHeader, result: SdResult<()>, data_length: u32) -> Self {
        Self {
            proto_ver: req.proto_ver,
            opcode: req.opcode as u8,
            flags: req.flags.bits(),
            epoch: req.epoch,
            id: req.id,
            data_length,
            result: match result {
                Ok(()) => SD_RES_SUCCESS,
                Err(e) => e.to_code(),
            },
            copies: 0,
            offset: 0,
        }
    }

    /// Interpret the result code.
    pub fn result(&self) -> SdResult<()> {
        code_to_result(self.result)
    }

    pub fn to_bytes(&self) -> [u8; SD_RSP_SIZE] {
        let mut buf = [0u8; SD_RSP_SIZE];
        buf[0] = self.proto_ver;
        buf[1] = self.opcode;
        buf[2..4].copy_from_slice(&self.flags.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.epoch.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.id.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.data_length.to_ne_bytes());
        buf[16..20].copy_from_slice(&self.result.to_ne_bytes());
        buf[20] = self.copies;
        buf[24..32].copy_from_slice(&self.offset.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; SD_RSP_SIZE]) -> Self {
        Self {
            proto_ver: buf[0],
            opcode: buf[1],
            flags: u16::from_ne_bytes([buf[2], buf[3]]),
            epoch: u32_at(buf, 4),
            id: u32_at(buf, 8),
            data_length: u32_at(buf, 12),
            result: u32_at(buf, 16),
            copies: buf[20],
            offset: u64_at(buf, 24),
        }
    }
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_ne_bytes(b)
}

fn u64_at(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_ne_bytes(b)
}
