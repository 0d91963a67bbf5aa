//! Transfer descriptors: turning I/O requests into TRB chains on an endpoint ring, and turning
//! transfer events back into completed requests.
//!
//! Every transfer ring carries at most one TD. A bulk request that does not fit on the ring, even
//! after growing it to its limit, is split into chunks; each chunk is queued when the previous
//! one completes successfully.
use std::sync::atomic::{fence, Ordering};

use common::dma::Dma;
use log::{debug, error, trace, warn};

use super::context::EndpointType;
use super::ring::{Cursor, Ring};
use super::trb::{
    TransferKind, Trb, TrbCompletionCode, TrbType, TRB_MAX_PAYLOAD, TRB_MAX_TD_SIZE,
};
use crate::error::{Result, XhciError};
use crate::usb::{EndpointTy, Irp, IrpFlags, IrpStatus, UsbSpeed};

/// An endpoint (or stream) ring and the TD in flight on it.
pub struct TransferRing {
    pub ring: Ring,
    pub td: Option<Td>,
}

impl TransferRing {
    pub fn new(segments: usize, trbs_per_segment: usize, max_trbs: usize) -> Result<Self> {
        Ok(Self {
            ring: Ring::new(segments, trbs_per_segment, true, max_trbs)?,
            td: None,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.td.is_some()
    }

    /// Takes the TD away from the ring. Its request comes back cancelled, with nothing
    /// transferred.
    pub fn cancel(&mut self) -> Option<Retirement> {
        self.td.take().map(|td| {
            debug!("cancelling request on {}", td.irp.pipe);
            Retirement {
                irp: td.irp,
                status: IrpStatus::Cancelled,
                actual_length: 0,
            }
        })
    }

    /// Cancels the TD in flight and returns the ring to its initial state. The endpoint must be
    /// stopped or halted, and its dequeue pointer reprogrammed afterwards.
    pub fn reinitialize(&mut self) -> Option<Retirement> {
        let cancelled = self.cancel();
        self.ring.reset();
        cancelled
    }
}

/// One request on a ring, or the current chunk of it.
pub struct Td {
    pub first: Cursor,
    /// The TRB whose completion ends the TD.
    pub last: Cursor,
    pub trb_count: usize,
    pub stream_id: u16,
    control: bool,
    irp: Irp,
    /// Copy of the request buffer the controller works on, unless the buffer is DMA coherent.
    bounce: Option<Dma<[u8]>>,
    max_packet: u16,
    chunk_len: usize,
    /// Bytes finished by earlier chunks.
    transferred: usize,
}

impl Td {
    fn new(irp: Irp, control: bool, stream_id: u16, max_packet: u16) -> Result<Self> {
        let bounce = if irp.length == 0 || irp.flags.contains(IrpFlags::DMA_COHERENT) {
            None
        } else if irp.is_in() {
            Some(unsafe { Dma::<[u8]>::zeroed_slice(irp.length)?.assume_init() })
        } else {
            Some(Dma::from_bytes(&irp.buffer[..irp.length])?)
        };
        Ok(Self {
            first: Cursor::default(),
            last: Cursor::default(),
            trb_count: 0,
            stream_id,
            control,
            irp,
            bounce,
            max_packet: max_packet.max(1),
            chunk_len: 0,
            transferred: 0,
        })
    }

    pub fn irp(&self) -> &Irp {
        &self.irp
    }

    /// Bus address of byte `offset` of the request.
    fn buffer_address(&self, offset: usize) -> u64 {
        match &self.bounce {
            Some(bounce) => (bounce.physical() + offset) as u64,
            None if self.irp.length == 0 => 0,
            None => self.irp.buffer.as_ptr() as u64 + offset as u64,
        }
    }

    fn remaining(&self) -> usize {
        self.irp.length - self.transferred
    }

    /// TRBs for the rest of the request in one piece.
    fn trbs_needed(&self) -> usize {
        data_trb_count(self.remaining()).max(1)
            + usize::from(self.wants_zlp())
            + usize::from(self.stream_id != 0)
    }

    fn wants_zlp(&self) -> bool {
        !self.control
            && !self.irp.is_in()
            && self.irp.flags.contains(IrpFlags::ZERO_LENGTH_PACKET)
            && self.irp.length > 0
            && self.irp.length % usize::from(self.max_packet) == 0
    }

    /// Copies what the controller wrote for the current chunk into the request buffer.
    fn copy_in(&mut self, length: usize) {
        if !self.irp.is_in() {
            return;
        }
        if let Some(bounce) = &self.bounce {
            let range = self.transferred..self.transferred + length;
            self.irp.buffer[range.clone()].copy_from_slice(&bounce[range]);
        }
    }
}

/// A finished request, to be handed back once no lock is held.
pub struct Retirement {
    irp: Irp,
    pub status: IrpStatus,
    pub actual_length: usize,
}

impl Retirement {
    pub(crate) fn new(irp: Irp, status: IrpStatus, actual_length: usize) -> Self {
        Self {
            irp,
            status,
            actual_length,
        }
    }

    pub fn irp(&self) -> &Irp {
        &self.irp
    }

    /// Runs the request's completion callback.
    pub fn deliver(self) {
        self.irp.complete(self.status, self.actual_length)
    }
}

pub enum TdOutcome {
    Retired(Retirement),
    /// The next chunk is on the ring; the endpoint doorbell must be rung.
    Continued,
    /// There was no TD to complete.
    Idle,
}

/// Data TRBs needed for `length` bytes.
pub fn data_trb_count(length: usize) -> usize {
    (length + TRB_MAX_PAYLOAD - 1) / TRB_MAX_PAYLOAD
}

/// TRBs of a control TD: setup, data and status stages.
pub fn control_trb_count(length: usize) -> usize {
    data_trb_count(length) + 2
}

/// The TD Size field of a TRB: packets left after it, where `done` counts the bytes of the TD up
/// to and including the TRB. Always 0 on the last TRB. (See XHCI 4.11.2.4)
pub fn td_size(total: usize, done: usize, max_packet: u16, last: bool) -> u8 {
    if last {
        return 0;
    }
    let mps = usize::from(max_packet.max(1));
    let packets = (total + mps - 1) / mps;
    packets.saturating_sub(done / mps).min(TRB_MAX_TD_SIZE) as u8
}

fn validate(tr: &TransferRing, irp: &Irp) -> Result<()> {
    if irp.length > irp.buffer.len() {
        return Err(XhciError::InvalidArgument("request length exceeds its buffer"));
    }
    if tr.is_busy() {
        debug!("{} already has a request in flight", irp.pipe);
        return Err(XhciError::InvalidState);
    }
    Ok(())
}

/// Hands a TD to the controller by flipping the cycle bit of its first TRB. Every other TRB of
/// the TD must be written already.
fn hand_over(ring: &mut Ring, first: Cursor, cycle: bool) {
    fence(Ordering::Release);
    ring.trb_mut(first).set_cycle(cycle);
}

/// Queues a control request. The ring grows if the TD does not fit.
pub fn queue_control(tr: &mut TransferRing, irp: Irp, max_packet: u16) -> Result<()> {
    let setup = irp
        .setup
        .ok_or(XhciError::InvalidArgument("control request without a setup packet"))?;
    validate(tr, &irp)?;
    let count = control_trb_count(irp.length);
    tr.ring.room(count)?;

    let mut td = Td::new(irp, true, 0, max_packet)?;
    let length = td.irp.length;
    let input = td.irp.is_in();
    let kind = match (length, input) {
        (0, _) => TransferKind::NoData,
        (_, true) => TransferKind::In,
        (_, false) => TransferKind::Out,
    };

    let ring = &mut tr.ring;
    let mut first_cycle = true;
    let first = ring.enqueue_with(|trb, cycle| {
        first_cycle = cycle;
        trb.setup(setup, kind, !cycle);
    })?;

    let data_trbs = data_trb_count(length);
    let mut done = 0;
    for i in 0..data_trbs {
        let len = (length - done).min(TRB_MAX_PAYLOAD);
        let address = td.buffer_address(done);
        let chain = i + 1 < data_trbs;
        let size = td_size(length, done + len, td.max_packet, !chain);
        ring.enqueue_with(|trb, cycle| {
            if i == 0 {
                trb.data(address, len as u32, size, input, chain, cycle);
            } else {
                trb.normal(address, len as u32, size, false, chain, false, cycle);
            }
        })?;
        done += len;
    }

    let last = ring.enqueue_with(|trb, cycle| trb.status(!(length > 0 && input), true, cycle))?;
    hand_over(ring, first, first_cycle);

    td.first = first;
    td.last = last;
    td.trb_count = count;
    td.chunk_len = length;
    trace!(
        "control TD on {}: {:?}, {} bytes in {} TRBs",
        td.irp.pipe,
        kind,
        length,
        count
    );
    tr.td = Some(td);
    Ok(())
}

/// Queues a bulk or interrupt request, on a stream's ring when `stream_id` is not 0. The ring
/// grows to fit the whole request where it can; past its limit the request is sent in chunks.
pub fn queue_bulk(
    tr: &mut TransferRing,
    irp: Irp,
    max_packet: u16,
    stream_id: u16,
) -> Result<()> {
    validate(tr, &irp)?;
    let mut td = Td::new(irp, false, stream_id, max_packet)?;
    match tr.ring.room(td.trbs_needed()) {
        Ok(()) | Err(XhciError::RingFull) => (),
        Err(err) => return Err(err),
    }
    queue_chunk(&mut tr.ring, &mut td)?;
    tr.td = Some(td);
    Ok(())
}

/// Places as much of the rest of the request on the ring as fits. Nothing is written if not
/// even one TRB fits.
fn queue_chunk(ring: &mut Ring, td: &mut Td) -> Result<()> {
    let remaining = td.remaining();
    let full_trbs = data_trb_count(remaining).max(1);
    let stream = td.stream_id != 0;
    let zlp = td.wants_zlp();
    let available = ring.available();

    let (data_trbs, chunk_len, zlp) =
        if available >= td.trbs_needed() {
            (full_trbs, remaining, zlp)
        } else {
            let trbs = available
                .saturating_sub(usize::from(stream))
                .min(full_trbs - 1);
            if trbs == 0 {
                return Err(XhciError::RingFull);
            }
            (trbs, trbs * TRB_MAX_PAYLOAD, false)
        };

    let mut first = ring.enqueue_cursor();
    let mut last = first;
    let mut first_cycle = true;
    let mut done = 0;
    for i in 0..data_trbs {
        let len = (chunk_len - done).min(TRB_MAX_PAYLOAD);
        let address = td.buffer_address(td.transferred + done);
        let terminal = i + 1 == data_trbs;
        let chain = !terminal || stream;
        let ioc = terminal && !zlp && !stream;
        let size = td_size(chunk_len, done + len, td.max_packet, terminal);
        let cursor = ring.enqueue_with(|trb, cycle| {
            let cycle = if i == 0 {
                first_cycle = cycle;
                !cycle
            } else {
                cycle
            };
            trb.normal(address, len as u32, size, !stream, chain, ioc, cycle);
        })?;
        if i == 0 {
            first = cursor;
        }
        last = cursor;
        done += len;
    }
    if zlp {
        // On a stream ring the ZLP chains into the Event Data TRB, which ends the TD.
        last = ring.enqueue_with(|trb, cycle| trb.normal(0, 0, 0, false, stream, !stream, cycle))?;
    }
    if stream {
        let stream_id = u64::from(td.stream_id);
        last = ring.enqueue_with(|trb, cycle| trb.event_data(stream_id, true, cycle))?;
    }
    hand_over(ring, first, first_cycle);

    td.first = first;
    td.last = last;
    td.trb_count = data_trbs + usize::from(zlp) + usize::from(stream);
    td.chunk_len = chunk_len;
    trace!(
        "TD on {} stream {}: {} of {} remaining bytes in {} TRBs",
        td.irp.pipe,
        td.stream_id,
        chunk_len,
        remaining,
        td.trb_count
    );
    Ok(())
}

fn completion_status(ring: &Ring, td: &Td, event: &Trb) -> IrpStatus {
    let code = event.completion_code();
    if code == TrbCompletionCode::Success as u8 {
        let expected = if event.event_data_bit() {
            u64::from(td.stream_id)
        } else {
            ring.physical(td.last)
        };
        if event.read_data() == expected {
            IrpStatus::Success
        } else {
            error!(
                "{}: successful completion names {:#X}, expected {:#X}",
                td.irp.pipe,
                event.read_data(),
                expected
            );
            IrpStatus::DeviceNotResponding
        }
    } else if code == TrbCompletionCode::Stall as u8 {
        IrpStatus::Stall
    } else if code == TrbCompletionCode::ShortPacket as u8 {
        IrpStatus::DataUnderrun
    } else {
        warn!("{}: transfer completion code {}", td.irp.pipe, code);
        IrpStatus::DeviceNotResponding
    }
}

/// Bytes moved by a TD that ended early: the lengths of its data TRBs up to the one the event
/// names, less the residual count of that TRB.
fn partial_length(ring: &Ring, td: &Td, event: &Trb) -> usize {
    let stop = match ring.position_of(event.read_data()) {
        Some(stop) => stop,
        None => {
            warn!(
                "{}: transfer event names {:#X}, outside the ring",
                td.irp.pipe,
                event.read_data()
            );
            return 0;
        }
    };
    let residual = event.residual_length() as usize;

    let mut cursor = td.first;
    let mut length = 0;
    for _ in 0..td.trb_count {
        let trb = ring.trb(cursor);
        if trb.is_type(TrbType::StatusStage) {
            break;
        }
        if trb.is_type(TrbType::Normal) || trb.is_type(TrbType::DataStage) {
            length += trb.transfer_length() as usize;
            if cursor == stop {
                return length.saturating_sub(residual);
            }
        }
        if cursor == stop {
            break;
        }
        cursor = ring.step(cursor).0;
    }
    length
}

/// Accounts for a transfer event on `tr`: retires the TD, or queues the next chunk of its
/// request.
pub fn complete_td(tr: &mut TransferRing, event: &Trb) -> TdOutcome {
    let mut td = match tr.td.take() {
        Some(td) => td,
        None => {
            warn!("transfer event {} with no TD in flight", event);
            return TdOutcome::Idle;
        }
    };
    let ring = &mut tr.ring;

    let status = completion_status(ring, &td, event);
    let length = match status {
        IrpStatus::Success => td.chunk_len,
        _ if event.event_data_bit() => (event.residual_length() as usize).min(td.chunk_len),
        _ => partial_length(ring, &td, event).min(td.chunk_len),
    };
    td.copy_in(length);
    ring.dequeue_through(td.last);
    td.transferred += length;

    let mut status = status;
    if status == IrpStatus::Success && !td.control && td.remaining() > 0 {
        match queue_chunk(ring, &mut td) {
            Ok(()) => {
                tr.td = Some(td);
                return TdOutcome::Continued;
            }
            Err(err) => {
                error!("{}: cannot queue the next chunk: {}", td.irp.pipe, err);
                status = IrpStatus::DeviceNotResponding;
            }
        }
    }

    TdOutcome::Retired(Retirement {
        status,
        actual_length: td.transferred,
        irp: td.irp,
    })
}

/// The endpoint context type of a pipe.
pub fn endpoint_type(ty: EndpointTy, is_in: bool) -> EndpointType {
    match (ty, is_in) {
        (EndpointTy::Ctrl, _) => EndpointType::Control,
        (EndpointTy::Isoch, false) => EndpointType::IsochOut,
        (EndpointTy::Isoch, true) => EndpointType::IsochIn,
        (EndpointTy::Bulk, false) => EndpointType::BulkOut,
        (EndpointTy::Bulk, true) => EndpointType::BulkIn,
        (EndpointTy::Interrupt, false) => EndpointType::InterruptOut,
        (EndpointTy::Interrupt, true) => EndpointType::InterruptIn,
    }
}

/// The endpoint context Interval field, a service interval of 2^n * 125us. Only periodic
/// endpoints have one.
pub fn interval_for(speed: UsbSpeed, ty: EndpointTy, b_interval: u8) -> u8 {
    match ty {
        EndpointTy::Isoch | EndpointTy::Interrupt => (),
        EndpointTy::Ctrl | EndpointTy::Bulk => return 0,
    }
    match speed {
        UsbSpeed::High | UsbSpeed::Super => b_interval.saturating_sub(1).min(15),
        UsbSpeed::Low | UsbSpeed::Full => {
            // bInterval counts 1ms frames; round down to a power of two.
            let exponent = 7 - b_interval.max(1).leading_zeros() as u8;
            (exponent + 3).clamp(3, 10)
        }
    }
}
