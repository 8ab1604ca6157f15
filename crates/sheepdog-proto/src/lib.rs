//! # sheepdog-proto
//!
//! Protocol types and constants shared by the sheepdog node substrate.
//!
//! This crate defines the fixed request/response framing, object ID
//! manipulation, the canonical node address form, the on-disk node record,
//! and the result taxonomy consumed by the replication and recovery layers.

pub mod addr;
pub mod constants;
pub mod defaults;
pub mod error;
pub mod node;
pub mod oid;
pub mod request;

// Re-export commonly used types at the crate root
pub use addr::CanonicalAddr;
pub use error::{SdError, SdResult};
pub use node::{NodeId, SdNode};
pub use oid::{ObjectId, ObjectKind};
pub use request::{Opcode, ReqFlags, RequestHeader, ResponseHeader};
