//! In-process request dispatch.
//!
//! Code running inside a node reads and writes objects with the same
//! request headers a remote peer would send, but hands them straight to a
//! [`LocalHandler`] instead of a socket. Callers stay symmetric between
//! local and remote targets.
//!
//! Requests carrying `FWD` were forwarded by a gateway thread; handlers
//! must not queue them behind gateway work again.

use std::sync::Arc;

use sheepdog_proto::error::{SdError, SdResult};
use sheepdog_proto::oid::ObjectId;
use sheepdog_proto::request::{Opcode, ReqArgs, ReqFlags, RequestHeader};
use tracing::{debug, error};

use crate::store::common::{Iocb, Substrate};

/// Payload of a local request.
#[derive(Debug)]
pub enum Payload<'a> {
    None,
    /// Data flowing to the handler (`WRITE` requests).
    Out(&'a [u8]),
    /// Buffer the handler fills.
    In(&'a mut [u8]),
}

impl Payload<'_> {
    fn len(&self) -> usize {
        match self {
            Payload::None => 0,
            Payload::Out(b) => b.len(),
            Payload::In(b) => b.len(),
        }
    }
}

/// Something that serves requests without going through the transport.
pub trait LocalHandler: Send + Sync {
    /// Serve `hdr`; returns the number of payload bytes produced.
    fn handle(&self, hdr: &RequestHeader, payload: Payload<'_>) -> SdResult<u32>;
}

/// Run `hdr` against the local handler.
pub fn exec_local_req(
    handler: &dyn LocalHandler,
    hdr: &RequestHeader,
    payload: Payload<'_>,
) -> SdResult<u32> {
    if payload.len() < hdr.data_length as usize {
        error!(
            "payload of {} bytes for a {} byte request {:?}",
            payload.len(),
            hdr.data_length,
            hdr.opcode
        );
        return Err(SdError::InvalidParms);
    }
    debug!("{:?} flags={:?}", hdr.opcode, hdr.flags);
    handler.handle(hdr, payload)
}

fn obj_req(opcode: Opcode, oid: ObjectId, offset: u64, len: usize, flags: ReqFlags) -> SdResult<RequestHeader> {
    let mut hdr = RequestHeader::new(opcode);
    hdr.flags = flags;
    hdr.data_length = u32::try_from(len).map_err(|_| SdError::InvalidParms)?;
    let args = hdr.obj_mut().ok_or(SdError::InvalidParms)?;
    args.oid = oid;
    args.offset = offset;
    Ok(hdr)
}

fn do_write_object(
    handler: &dyn LocalHandler,
    oid: ObjectId,
    data: &[u8],
    offset: u64,
    create: bool,
    flags: ReqFlags,
) -> SdResult<()> {
    let opcode = if create {
        Opcode::CreateAndWriteObj
    } else {
        Opcode::WriteObj
    };
    let hdr = obj_req(opcode, oid, offset, data.len(), ReqFlags::WRITE | flags)?;

    exec_local_req(handler, &hdr, Payload::Out(data))
        .map(|_| ())
        .map_err(|e| {
            error!("failed to write object {}, {}", oid, e);
            e
        })
}

pub fn sd_write_object(
    handler: &dyn LocalHandler,
    oid: ObjectId,
    data: &[u8],
    offset: u64,
    create: bool,
) -> SdResult<()> {
    do_write_object(handler, oid, data, offset, create, ReqFlags::empty())
}

/// [`sd_write_object`] issued from a gateway thread.
pub fn sd_write_object_fwd(
    handler: &dyn LocalHandler,
    oid: ObjectId,
    data: &[u8],
    offset: u64,
    create: bool,
) -> SdResult<()> {
    do_write_object(handler, oid, data, offset, create, ReqFlags::FWD)
}

fn do_read_object(
    handler: &dyn LocalHandler,
    oid: ObjectId,
    data: &mut [u8],
    offset: u64,
    flags: ReqFlags,
) -> SdResult<()> {
    let hdr = obj_req(Opcode::ReadObj, oid, offset, data.len(), flags)?;

    exec_local_req(handler, &hdr, Payload::In(data))
        .map(|_| ())
        .map_err(|e| {
            error!("failed to read object {}, {}", oid, e);
            e
        })
}

pub fn sd_read_object(handler: &dyn LocalHandler, oid: ObjectId, data: &mut [u8], offset: u64) -> SdResult<()> {
    do_read_object(handler, oid, data, offset, ReqFlags::empty())
}

/// [`sd_read_object`] issued from a gateway thread.
pub fn sd_read_object_fwd(handler: &dyn LocalHandler, oid: ObjectId, data: &mut [u8], offset: u64) -> SdResult<()> {
    do_read_object(handler, oid, data, offset, ReqFlags::FWD)
}

pub fn sd_remove_object(handler: &dyn LocalHandler, oid: ObjectId) -> SdResult<()> {
    let hdr = obj_req(Opcode::RemoveObj, oid, 0, 0, ReqFlags::empty())?;

    exec_local_req(handler, &hdr, Payload::None)
        .map(|_| ())
        .map_err(|e| {
            error!("failed to remove object {}, {}", oid, e);
            e
        })
}

/// Drop `refcnt` references of `generation` from a data object's ledger.
///
/// Generation 0 with count 0 means the object was never shared and is
/// simply removed.
pub fn sd_dec_object_refcnt(
    handler: &dyn LocalHandler,
    data_oid: ObjectId,
    generation: u32,
    refcnt: u32,
) -> SdResult<()> {
    let ledger_oid = data_oid.data_to_ledger();

    debug!("{}, {}, {}", data_oid, generation, refcnt);

    if generation == 0 && refcnt == 0 {
        return sd_remove_object(handler, data_oid);
    }

    let mut hdr = RequestHeader::new(Opcode::DecrefObj);
    // Decrements always run on gateway threads.
    hdr.flags = ReqFlags::FWD;
    match &mut hdr.args {
        ReqArgs::Ref(r) => {
            r.oid = ledger_oid;
            r.generation = generation;
            r.count = refcnt;
        }
        ReqArgs::Obj(_) => return Err(SdError::InvalidParms),
    }

    exec_local_req(handler, &hdr, Payload::None)
        .map(|_| ())
        .map_err(|e| {
            error!("failed to decrement reference {}, {}", ledger_oid, e);
            e
        })
}

fn iocb_at<B: AsRef<[u8]>>(hdr: &RequestHeader, buf: B) -> Iocb<B> {
    let offset = hdr.obj().map_or(0, |args| args.offset);
    let mut iocb = Iocb::new(buf, offset);
    iocb.epoch = hdr.epoch;
    iocb
}

/// Serves object requests from the node's selected store driver.
#[derive(Debug, Clone)]
pub struct StoreHandler {
    sub: Arc<Substrate>,
}

impl StoreHandler {
    pub fn new(sub: Arc<Substrate>) -> Self {
        Self { sub }
    }
}

impl LocalHandler for StoreHandler {
    fn handle(&self, hdr: &RequestHeader, payload: Payload<'_>) -> SdResult<u32> {
        let store = self.sub.store()?;
        let args = hdr.obj().ok_or(SdError::NoSupport)?;
        let len = hdr.data_length as usize;

        match (hdr.opcode, payload) {
            (Opcode::CreateAndWriteObj | Opcode::CreateAndWritePeer, Payload::Out(data)) => {
                store.create_and_write(args.oid, &iocb_at(hdr, data.get(..len).ok_or(SdError::InvalidParms)?))?;
                Ok(0)
            }
            (Opcode::WriteObj | Opcode::WritePeer, Payload::Out(data)) => {
                store.write(args.oid, &iocb_at(hdr, data.get(..len).ok_or(SdError::InvalidParms)?))?;
                Ok(0)
            }
            (Opcode::ReadObj | Opcode::ReadPeer, Payload::In(buf)) => {
                store.read(args.oid, &mut iocb_at(hdr, buf.get_mut(..len).ok_or(SdError::InvalidParms)?))?;
                Ok(hdr.data_length)
            }
            (Opcode::RemoveObj | Opcode::RemovePeer, _) => {
                store.remove(args.oid)?;
                Ok(0)
            }
            (Opcode::DiscardObj, _) => {
                let end = args.offset.checked_add(len as u64).ok_or(SdError::InvalidParms)?;
                store.discard(args.oid, args.offset, end)?;
                Ok(0)
            }
            (opcode, _) => {
                debug!("{:?} is not served locally", opcode);
                Err(SdError::NoSupport)
            }
        }
    }
}
