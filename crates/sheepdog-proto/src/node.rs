/// Node identity and the fixed-width node record stored in epoch logs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

use crate::addr::{addr_to_str, CanonicalAddr};
use crate::constants::*;
use crate::error::{SdError, SdResult};

/// Network address of a sheepdog node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    /// Primary address for cluster communication
    pub addr: CanonicalAddr,
    /// Primary port
    pub port: u16,
    /// Separate IO address (for a dedicated data NIC); used when `io_port > 0`
    pub io_addr: CanonicalAddr,
    /// IO port (0 if no separate IO address)
    pub io_port: u16,
}

impl NodeId {
    pub fn new(addr: impl Into<CanonicalAddr>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
            io_addr: CanonicalAddr::UNSPECIFIED,
            io_port: 0,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr.to_ip(), self.port)
    }

    pub fn io_socket_addr(&self) -> SocketAddr {
        if self.io_port > 0 {
            SocketAddr::new(self.io_addr.to_ip(), self.io_port)
        } else {
            self.socket_addr()
        }
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new(CanonicalAddr::UNSPECIFIED, SD_LISTEN_PORT)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&addr_to_str(&self.addr, self.port))
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.addr.cmp(&other.addr).then(self.port.cmp(&other.port))
    }
}

/// Disk information for multi-disk support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub disk_id: u64,
    pub disk_space: u64,
}

/// A sheepdog cluster member node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdNode {
    /// Network identifier
    pub nid: NodeId,
    /// Number of virtual nodes
    pub nr_vnodes: u16,
    /// Fault domain zone
    pub zone: u32,
    /// Available storage space in bytes
    pub space: u64,
    /// Per-disk information; at most [`DISK_MAX`] entries with non-zero ids
    pub disks: Vec<DiskInfo>,
}

impl SdNode {
    pub fn new(nid: NodeId) -> Self {
        Self {
            nid,
            nr_vnodes: SD_DEFAULT_VNODES,
            zone: 0,
            space: 0,
            disks: Vec::new(),
        }
    }
}

impl PartialOrd for SdNode {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SdNode {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.nid.cmp(&other.nid)
    }
}

impl fmt::Display for SdNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (vnodes={}, zone={}, space={})",
            self.nid, self.nr_vnodes, self.zone, self.space
        )
    }
}

// ─── Fixed-width node record ────────────────────────────────────────────────
//
// Layout (host-endian, all clusters are homogeneous):
//
//   0   index      [u8; 24]   in-memory tree linkage, always zero on disk
//  24   addr       [u8; 16]
//  40   port       u16
//  42   io_addr    [u8; 16]
//  58   io_port    u16
//  60   pad        [u8; 4]
//  64   nr_vnodes  u16
//  66   pad        [u8; 2]
//  68   zone       u32
//  72   space      u64
//  80   disks      [(disk_id u64, disk_space u64); DISK_MAX]

/// Width of the reserved index region at the head of a node record.
pub const NODE_INDEX_LEN: usize = 24;

const NID_OFF: usize = NODE_INDEX_LEN;
const PORT_OFF: usize = NID_OFF + ADDR_LEN;
const IO_ADDR_OFF: usize = PORT_OFF + 2;
const IO_PORT_OFF: usize = IO_ADDR_OFF + ADDR_LEN;
const VNODES_OFF: usize = IO_PORT_OFF + 2 + 4;
const ZONE_OFF: usize = VNODES_OFF + 4;
const SPACE_OFF: usize = ZONE_OFF + 4;
const DISKS_OFF: usize = SPACE_OFF + 8;
const DISK_INFO_LEN: usize = 16;

/// Width of one node record on disk.
pub const SD_NODE_SIZE: usize = DISKS_OFF + DISK_MAX * DISK_INFO_LEN;

impl SdNode {
    /// Serialize into exactly [`SD_NODE_SIZE`] bytes of `buf`.
    ///
    /// The index region is zero-filled. Fails with `InvalidParms` if the
    /// node carries more than [`DISK_MAX`] disks.
    pub fn encode_record(&self, buf: &mut [u8]) -> SdResult<()> {
        if buf.len() != SD_NODE_SIZE || self.disks.len() > DISK_MAX {
            return Err(SdError::InvalidParms);
        }
        buf.fill(0);
        buf[NID_OFF..PORT_OFF].copy_from_slice(self.nid.addr.as_bytes());
        buf[PORT_OFF..IO_ADDR_OFF].copy_from_slice(&self.nid.port.to_ne_bytes());
        buf[IO_ADDR_OFF..IO_PORT_OFF].copy_from_slice(self.nid.io_addr.as_bytes());
        buf[IO_PORT_OFF..IO_PORT_OFF + 2].copy_from_slice(&self.nid.io_port.to_ne_bytes());
        buf[VNODES_OFF..VNODES_OFF + 2].copy_from_slice(&self.nr_vnodes.to_ne_bytes());
        buf[ZONE_OFF..SPACE_OFF].copy_from_slice(&self.zone.to_ne_bytes());
        buf[SPACE_OFF..DISKS_OFF].copy_from_slice(&self.space.to_ne_bytes());
        for (i, disk) in self.disks.iter().enumerate() {
            let off = DISKS_OFF + i * DISK_INFO_LEN;
            buf[off..off + 8].copy_from_slice(&disk.disk_id.to_ne_bytes());
            buf[off + 8..off + 16].copy_from_slice(&disk.disk_space.to_ne_bytes());
        }
        Ok(())
    }

    /// Deserialize one record. The index region is ignored; disk slots
    /// with a zero id are treated as empty.
    pub fn decode_record(buf: &[u8]) -> SdResult<Self> {
        if buf.len() != SD_NODE_SIZE {
            return Err(SdError::InvalidParms);
        }
        let nid = NodeId {
            addr: CanonicalAddr::from_bytes(array_at(buf, NID_OFF)),
            port: u16::from_ne_bytes(array_at(buf, PORT_OFF)),
            io_addr: CanonicalAddr::from_bytes(array_at(buf, IO_ADDR_OFF)),
            io_port: u16::from_ne_bytes(array_at(buf, IO_PORT_OFF)),
        };
        let disks = (0..DISK_MAX)
            .map(|i| DISKS_OFF + i * DISK_INFO_LEN)
            .map(|off| DiskInfo {
                disk_id: u64::from_ne_bytes(array_at(buf, off)),
                disk_space: u64::from_ne_bytes(array_at(buf, off + 8)),
            })
            .filter(|d| d.disk_id != 0)
            .collect();
        Ok(Self {
            nid,
            nr_vnodes: u16::from_ne_bytes(array_at(buf, VNODES_OFF)),
            zone: u32::from_ne_bytes(array_at(buf, ZONE_OFF)),
            space: u64::from_ne_bytes(array_at(buf, SPACE_OFF)),
            disks,
        })
    }
}

/// Encode a node list into concatenated records.
pub fn encode_nodes(nodes: &[SdNode]) -> SdResult<Vec<u8>> {
    let mut buf = vec![0u8; nodes.len() * SD_NODE_SIZE];
    for (node, chunk) in nodes.iter().zip(buf.chunks_exact_mut(SD_NODE_SIZE)) {
        node.encode_record(chunk)?;
    }
    Ok(buf)
}

/// Decode concatenated records; the length must be an exact multiple of
/// [`SD_NODE_SIZE`].
pub fn decode_nodes(buf: &[u8]) -> SdResult<Vec<SdNode>> {
    if buf.len() % SD_NODE_SIZE != 0 {
        return Err(SdError::InvalidParms);
    }
    buf.chunks_exact(SD_NODE_SIZE)
        .map(SdNode::decode_record)
        .collect()
}

fn array_at<const N: usize>(buf: &[u8], off: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[off..off + N]);
    out
}
