//! Framed request/response transport over blocking sockets.
//!
//! A request is a fixed 48-byte header optionally followed by a payload;
//! the response reuses the same slot and may carry a (possibly shorter)
//! payload back. All I/O is synchronous: sockets carry send/receive
//! timeouts (see [`crate::net`]) so a stuck peer surfaces as `EAGAIN`.
//!
//! Two interruption classes are handled differently:
//! - `EINTR` is retried transparently, without limit.
//! - `EAGAIN` is retried at most `max_count` times, and only while the
//!   epoch guard agrees. Recovery uses the guard to abandon requests that
//!   became stale when the cluster epoch moved on.

use std::io::IoSlice;
use std::os::fd::{AsFd, AsRawFd};

use nix::errno::Errno;
use nix::sys::socket::{self, MsgFlags};
use sheepdog_proto::constants::{SD_REQ_SIZE, SD_RSP_SIZE};
use sheepdog_proto::defaults::{DEFAULT_MAX_PAYLOAD, DEFAULT_MAX_RETRY_COUNT};
use sheepdog_proto::{RequestHeader, ResponseHeader, SdError, SdResult};
use tracing::{debug, error};

/// Failure of a framed transfer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The peer closed the connection cleanly with bytes still expected.
    #[error("connection closed by peer ({0} bytes left)")]
    Closed(usize),
    /// The socket failed, or timed out beyond what the retry guard allowed.
    #[error("socket I/O failed: {0}")]
    Io(#[from] Errno),
    /// The caller's payload buffer cannot hold the transfer.
    #[error("payload buffer holds {have} bytes, {need} required")]
    ShortBuffer { need: usize, have: usize },
    /// The peer sent a header that cannot be served.
    #[error("malformed request: {0}")]
    Malformed(SdError),
}

impl From<TransportError> for SdError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Malformed(e) => e,
            TransportError::ShortBuffer { .. } => SdError::InvalidParms,
            TransportError::Closed(_) | TransportError::Io(_) => SdError::NetworkError,
        }
    }
}

/// Byte-level socket operations the framing is built on.
///
/// Implemented for every file-descriptor owner; tests substitute wrappers
/// that inject short transfers or timeouts.
pub trait RawIo {
    /// One `read(2)`; `Ok(0)` means the peer closed.
    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, Errno>;

    /// One `sendmsg(2)` over the given iovec array.
    fn write_some(&mut self, iov: &[IoSlice<'_>]) -> Result<usize, Errno>;
}

impl<T: AsFd> RawIo for T {
    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, Errno> {
        nix::unistd::read(self.as_fd().as_raw_fd(), buf)
    }

    fn write_some(&mut self, iov: &[IoSlice<'_>]) -> Result<usize, Errno> {
        socket::sendmsg::<()>(self.as_fd().as_raw_fd(), iov, &[], MsgFlags::MSG_NOSIGNAL, None)
    }
}

/// Retry budget for timed-out transfers, gated on the cluster epoch.
#[derive(Clone, Copy)]
pub struct RetryGuard<'a> {
    need_retry: Option<&'a dyn Fn(u32) -> bool>,
    epoch: u32,
    max_count: u32,
}

impl<'a> RetryGuard<'a> {
    /// Retry up to `max_count` timeouts unconditionally.
    pub fn new(max_count: u32) -> Self {
        Self {
            need_retry: None,
            epoch: 0,
            max_count,
        }
    }

    /// Retry up to `max_count` timeouts while `need_retry(epoch)` holds.
    pub fn with_epoch(need_retry: &'a dyn Fn(u32) -> bool, epoch: u32, max_count: u32) -> Self {
        Self {
            need_retry: Some(need_retry),
            epoch,
            max_count,
        }
    }

    /// Never retry a timeout.
    pub fn no_retry() -> Self {
        Self::new(0)
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    fn allows(&self, remaining: u32) -> bool {
        remaining > 0 && self.need_retry.map_or(true, |f| f(self.epoch))
    }
}

impl Default for RetryGuard<'_> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRY_COUNT)
    }
}

impl std::fmt::Debug for RetryGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryGuard")
            .field("epoch_guarded", &self.need_retry.is_some())
            .field("epoch", &self.epoch)
            .field("max_count", &self.max_count)
            .finish()
    }
}

/// Read exactly `buf.len()` bytes.
pub fn read_exact<R: RawIo + ?Sized>(
    io: &mut R,
    mut buf: &mut [u8],
    guard: &RetryGuard<'_>,
) -> Result<(), TransportError> {
    let mut repeat = guard.max_count;

    while !buf.is_empty() {
        match io.read_some(buf) {
            Ok(0) => {
                debug!("connection is closed ({} bytes left)", buf.len());
                return Err(TransportError::Closed(buf.len()));
            }
            Ok(n) => buf = &mut std::mem::take(&mut buf)[n..],
            Err(Errno::EINTR) => continue,
            // The receive timeout turns a blocking read into EAGAIN.
            Err(Errno::EAGAIN) if guard.allows(repeat) => repeat -= 1,
            Err(e) => {
                error!("failed to read from socket: {}", e);
                return Err(e.into());
            }
        }
    }
    Ok(())
}

/// Drop the first `n` sent bytes from an iovec array in place: fully sent
/// elements are skipped and the first partial one is narrowed.
fn forward_iov<'a>(bufs: &mut &mut [&'a [u8]], mut n: usize) {
    let mut skip = 0;
    while skip < bufs.len() && bufs[skip].len() <= n {
        n -= bufs[skip].len();
        skip += 1;
    }
    *bufs = &mut std::mem::take(bufs)[skip..];
    if let Some(first) = bufs.first_mut() {
        let cur: &'a [u8] = *first;
        *first = &cur[n..];
    }
}

/// Write every byte of `bufs` with `sendmsg`, resuming short writes.
pub fn write_all<W: RawIo + ?Sized>(
    io: &mut W,
    mut bufs: &mut [&[u8]],
    guard: &RetryGuard<'_>,
) -> Result<(), TransportError> {
    let mut repeat = guard.max_count;
    forward_iov(&mut bufs, 0);

    while !bufs.is_empty() {
        let iov: Vec<IoSlice<'_>> = bufs.iter().map(|b| IoSlice::new(b)).collect();
        match io.write_some(&iov) {
            Ok(0) => {
                let left = bufs.iter().map(|b| b.len()).sum();
                error!("socket accepted no data ({} bytes left)", left);
                return Err(TransportError::Closed(left));
            }
            Ok(n) => forward_iov(&mut bufs, n),
            Err(Errno::EINTR) => continue,
            // The send timeout turns a blocking write into EAGAIN.
            Err(Errno::EAGAIN) if guard.allows(repeat) => repeat -= 1,
            Err(e) => {
                error!("failed to write to socket: {}", e);
                return Err(e.into());
            }
        }
    }
    Ok(())
}

/// Send `hdr` followed by the first `wlen` bytes of `data`.
pub fn send_request<W: RawIo + ?Sized>(
    io: &mut W,
    hdr: &RequestHeader,
    data: &[u8],
    wlen: usize,
    guard: &RetryGuard<'_>,
) -> Result<(), TransportError> {
    if data.len() < wlen {
        return Err(TransportError::ShortBuffer { need: wlen, have: data.len() });
    }

    let raw = hdr.to_bytes();
    let mut bufs: [&[u8]; 2] = [&raw, &data[..wlen]];
    let nr = if wlen > 0 { 2 } else { 1 };

    write_all(io, &mut bufs[..nr], guard).map_err(|e| {
        error!("failed to send request {:?}, {}: {}", hdr.opcode, wlen, e);
        e
    })
}

/// Issue a request and read its response.
///
/// The payload sent and the payload expected back follow the `WRITE` and
/// `PIGGYBACK` flags (see [`RequestHeader::write_len`] and
/// [`RequestHeader::read_len`]). At most `min(read_len, rsp.data_length)`
/// bytes are read into `data`; the effective length is in the returned
/// header, whose result code the caller interprets.
pub fn exec_request<S: RawIo + ?Sized>(
    io: &mut S,
    hdr: &RequestHeader,
    data: &mut [u8],
    guard: &RetryGuard<'_>,
) -> SdResult<ResponseHeader> {
    let wlen = hdr.write_len() as usize;
    let rlen = hdr.read_len() as usize;
    if data.len() < wlen.max(rlen) {
        error!("buffer of {} bytes too small for request {:?}", data.len(), hdr.opcode);
        return Err(SdError::InvalidParms);
    }

    send_request(io, hdr, data, wlen, guard)?;

    let mut raw = [0u8; SD_RSP_SIZE];
    read_exact(io, &mut raw, guard).map_err(|e| {
        error!("failed to read a response: {}", e);
        SdError::NetworkError
    })?;
    let rsp = ResponseHeader::from_bytes(&raw);

    let rlen = rlen.min(rsp.data_length as usize);
    if rlen > 0 {
        read_exact(io, &mut data[..rlen], guard).map_err(|e| {
            error!("failed to read the response data: {}", e);
            SdError::NetworkError
        })?;
    }
    Ok(rsp)
}

/// Server side: read one request header and the payload it carries.
///
/// Payloads larger than [`DEFAULT_MAX_PAYLOAD`] are refused.
pub fn read_request<R: RawIo + ?Sized>(
    io: &mut R,
    guard: &RetryGuard<'_>,
) -> Result<(RequestHeader, Vec<u8>), TransportError> {
    let mut raw = [0u8; SD_REQ_SIZE];
    read_exact(io, &mut raw, guard)?;
    let hdr = RequestHeader::from_bytes(&raw).map_err(TransportError::Malformed)?;

    let wlen = hdr.write_len() as usize;
    if wlen > DEFAULT_MAX_PAYLOAD {
        error!("request payload too large: {} bytes", wlen);
        return Err(TransportError::Malformed(SdError::InvalidParms));
    }
    let mut data = vec![0u8; wlen];
    read_exact(io, &mut data, guard)?;
    Ok((hdr, data))
}

/// Server side: send a response header followed by `rsp.data_length`
/// bytes of `data`.
pub fn send_response<W: RawIo + ?Sized>(
    io: &mut W,
    rsp: &ResponseHeader,
    data: &[u8],
    guard: &RetryGuard<'_>,
) -> Result<(), TransportError> {
    let len = rsp.data_length as usize;
    if data.len() < len {
        return Err(TransportError::ShortBuffer { need: len, have: data.len() });
    }
    let raw = rsp.to_bytes();
    let mut bufs: [&[u8]; 2] = [&raw, &data[..len]];
    write_all(io, &mut bufs, guard)
}

/// A single vectored write of a header and a body, without resumption.
/// Returns the number of bytes the kernel accepted.
pub fn writev2<W: RawIo + ?Sized>(io: &mut W, hdr: &[u8], body: &[u8]) -> Result<usize, Errno> {
    io.write_some(&[IoSlice::new(hdr), IoSlice::new(body)])
}
