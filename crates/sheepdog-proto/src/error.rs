//! Result taxonomy shared by the transport, the store layer and the
//! replication/recovery layers above them.
//!
//! Wire codes follow the sheepdog protocol: `0x00` is success and never
//! becomes an `SdError`; public codes live below `0x80`, inter-sheep codes
//! above it.

use serde::{Deserialize, Serialize};

/// Wire code for a successful operation.
pub const SD_RES_SUCCESS: u32 = 0x00;

/// Failure result of a sheepdog operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum SdError {
    #[error("unknown error")]
    Unknown,
    /// The oid is absent on this node.
    #[error("no object found")]
    NoObj,
    /// Disk error; the placement layer decides whether to eject the disk.
    #[error("I/O error")]
    Eio,
    #[error("invalid parameters")]
    InvalidParms,
    #[error("system error")]
    SystemError,
    /// Requested epoch is absent or corrupt.
    #[error("requested tag not found")]
    NoTag,
    /// Write cannot proceed, recovery should pause.
    #[error("no space available")]
    NoSpace,
    /// Transient failure; the gateway retries.
    #[error("network error between sheep")]
    NetworkError,
    /// Caller's buffer is undersized; no state was touched.
    #[error("buffer too small")]
    BufferSmall,
    /// Store driver missing or uninitialized.
    #[error("no targeted store")]
    NoStore,
    #[error("operation not supported")]
    NoSupport,
    #[error("object ID already exists")]
    OidExist,
    #[error("try again")]
    Again,
}

impl SdError {
    /// Convert a raw protocol result code.
    ///
    /// Returns `None` for [`SD_RES_SUCCESS`]; unrecognized codes become
    /// [`SdError::Unknown`].
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            SD_RES_SUCCESS => None,
            0x02 => Some(Self::NoObj),
            0x03 => Some(Self::Eio),
            0x05 => Some(Self::InvalidParms),
            0x06 => Some(Self::SystemError),
            0x0E => Some(Self::NoTag),
            0x15 => Some(Self::NoSpace),
            0x86 => Some(Self::NetworkError),
            0x88 => Some(Self::BufferSmall),
            0x8A => Some(Self::NoStore),
            0x8B => Some(Self::NoSupport),
            0x8E => Some(Self::OidExist),
            0x8F => Some(Self::Again),
            _ => Some(Self::Unknown),
        }
    }

    /// Convert to the raw protocol result code.
    pub fn to_code(self) -> u32 {
        match self {
            Self::Unknown => 0x01,
            Self::NoObj => 0x02,
            Self::Eio => 0x03,
            Self::InvalidParms => 0x05,
            Self::SystemError => 0x06,
            Self::NoTag => 0x0E,
            Self::NoSpace => 0x15,
            Self::NetworkError => 0x86,
            Self::BufferSmall => 0x88,
            Self::NoStore => 0x8A,
            Self::NoSupport => 0x8B,
            Self::OidExist => 0x8E,
            Self::Again => 0x8F,
        }
    }

    /// Whether the gateway should retry the request.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::NetworkError | Self::Again)
    }
}

/// Result type alias for sheepdog operations.
pub type SdResult<T> = Result<T, SdError>;

/// Collapse an `SdResult` into a wire result code.
pub fn result_code<T>(res: &SdResult<T>) -> u32 {
    match res {
        Ok(_) => SD_RES_SUCCESS,
        Err(e) => e.to_code(),
    }
}

/// Expand a wire result code into an `SdResult`.
pub fn code_to_result(code: u32) -> SdResult<()> {
    match SdError::from_code(code) {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

impl From<std::io::Error> for SdError {
    fn from(_: std::io::Error) -> Self {
        SdError::Eio
    }
}
