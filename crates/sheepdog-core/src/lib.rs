//! # sheepdog-core
//!
//! Peer I/O substrate for the sheepdog distributed storage system.
//! Provides blocking socket helpers with timeouts and keepalive,
//! edge-triggered event-loop hooks, and the fixed request/response
//! framing used between nodes and clients.

pub mod event;
pub mod net;
pub mod transport;

pub use event::{Connection, EventLoop, Interest, Multiplexer};
pub use transport::{exec_request, read_exact, send_request, write_all, RetryGuard, TransportError};
