/// Sheepdog protocol and on-disk layout constants.

/// Client protocol version
pub const SD_PROTO_VER: u8 = 0x02;

/// Default listen port for client connections
pub const SD_LISTEN_PORT: u16 = 7000;

/// Default virtual nodes per physical node
pub const SD_DEFAULT_VNODES: u16 = 128;

/// Maximum data objects per VDI (2^32)
pub const MAX_DATA_OBJS: u64 = 1 << 32;

/// Size of a request header on the wire.
pub const SD_REQ_SIZE: usize = 48;
/// Size of a response header on the wire; shares the request slot.
pub const SD_RSP_SIZE: usize = SD_REQ_SIZE;

/// Maximum number of disks per node
pub const DISK_MAX: usize = 32;

/// Store name length (including the terminating NUL on disk)
pub const STORE_LEN: usize = 16;

/// Length of the canonical address form.
pub const ADDR_LEN: usize = 16;

/// Epoch log file names are exactly this many decimal digits.
pub const EPOCH_NAME_LEN: usize = 8;

/// Width of the creation timestamp that trails each epoch log.
pub const EPOCH_TIMESTAMP_LEN: usize = 8;

/// I/O alignment unit for direct I/O eligibility.
pub const SECTOR_SIZE: u64 = 512;
