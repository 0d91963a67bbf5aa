use std::fmt;

use common::io::{Io, Mmio};
use log::trace;

use super::context::StreamContextType;
use crate::usb;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TrbType {
    Reserved,
    /* Transfer */
    Normal,
    SetupStage,
    DataStage,
    StatusStage,
    Isoch,
    Link,
    EventData,
    NoOp,
    /* Command */
    EnableSlot,
    DisableSlot,
    AddressDevice,
    ConfigureEndpoint,
    EvaluateContext,
    ResetEndpoint,
    StopEndpoint,
    SetTrDequeuePointer,
    ResetDevice,
    ForceEvent,
    NegotiateBandwidth,
    SetLatencyToleranceValue,
    GetPortBandwidth,
    ForceHeader,
    NoOpCmd,
    /* Events */
    Transfer = 32,
    CommandCompletion,
    PortStatusChange,
    BandwidthRequest,
    Doorbell,
    HostController,
    DeviceNotification,
    MfindexWrap,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TrbCompletionCode {
    Invalid = 0x00,
    Success = 0x01,
    DataBuffer = 0x02,
    BabbleDetected = 0x03,
    UsbTransaction = 0x04,
    Trb = 0x05,
    Stall = 0x06,
    Resource = 0x07,
    Bandwidth = 0x08,
    NoSlotsAvailable = 0x09,
    InvalidStreamType = 0x0A,
    SlotNotEnabled = 0x0B,
    EndpointNotEnabled = 0x0C,
    ShortPacket = 0x0D,
    RingUnderrun = 0x0E,
    RingOverrun = 0x0F,
    VfEventRingFull = 0x10,
    Parameter = 0x11,
    BandwidthOverrun = 0x12,
    ContextState = 0x13,
    NoPingResponse = 0x14,
    EventRingFull = 0x15,
    IncompatibleDevice = 0x16,
    MissedService = 0x17,
    CommandRingStopped = 0x18,
    CommandAborted = 0x19,
    Stopped = 0x1A,
    StoppedLengthInvalid = 0x1B,
}

/// Transfer type of a Setup Stage TRB (TRT).
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferKind {
    NoData,
    Reserved,
    Out,
    In,
}

/// Largest payload a single transfer TRB carries.
pub const TRB_MAX_PAYLOAD: usize = 4096;
/// The remaining-packets estimate saturates at this value.
pub const TRB_MAX_TD_SIZE: usize = 31;

pub const TRB_CONTROL_CYCLE_BIT: u32 = 1 << 0;
pub const TRB_CONTROL_ENT_BIT: u32 = 1 << 1;
pub const TRB_CONTROL_LINK_TOGGLE_BIT: u32 = 1 << 1;
pub const TRB_CONTROL_EVENT_DATA_BIT: u32 = 1 << 2;
pub const TRB_CONTROL_ISP_BIT: u32 = 1 << 2;
pub const TRB_CONTROL_CHAIN_BIT: u32 = 1 << 4;
pub const TRB_CONTROL_IOC_BIT: u32 = 1 << 5;
pub const TRB_CONTROL_IDT_BIT: u32 = 1 << 6;
pub const TRB_CONTROL_DIR_IN_BIT: u32 = 1 << 16;
pub const TRB_CONTROL_SUSPEND_BIT: u32 = 1 << 23;

pub const TRB_CONTROL_TRB_TYPE_SHIFT: u8 = 10;
pub const TRB_CONTROL_TRB_TYPE_MASK: u32 = 0x0000_FC00;
pub const TRB_CONTROL_ENDPOINT_ID_SHIFT: u8 = 16;
pub const TRB_CONTROL_ENDPOINT_ID_MASK: u32 = 0x001F_0000;
pub const TRB_CONTROL_SLOT_ID_SHIFT: u8 = 24;

pub const TRB_STATUS_LENGTH_MASK: u32 = 0x0001_FFFF;
pub const TRB_STATUS_TD_SIZE_SHIFT: u8 = 17;
pub const TRB_STATUS_TD_SIZE_MASK: u32 = 0x1F;
pub const TRB_STATUS_INTERRUPTER_SHIFT: u8 = 22;
pub const TRB_STATUS_COMPLETION_CODE_SHIFT: u8 = 24;
pub const TRB_STATUS_EVENT_LENGTH_MASK: u32 = 0x00FF_FFFF;

/// A Transfer Request Block: the 16 byte unit of every ring. (See XHCI 4.11)
#[repr(C)]
#[derive(Clone, Default)]
pub struct Trb {
    pub data_low: Mmio<u32>,
    pub data_high: Mmio<u32>,
    pub status: Mmio<u32>,
    pub control: Mmio<u32>,
}

const fn ty(trb_type: TrbType) -> u32 {
    (trb_type as u32) << TRB_CONTROL_TRB_TYPE_SHIFT
}

const fn slot(slot_id: u8) -> u32 {
    (slot_id as u32) << TRB_CONTROL_SLOT_ID_SHIFT
}

const fn endpoint(dci: u8) -> u32 {
    ((dci as u32) & 0x1F) << TRB_CONTROL_ENDPOINT_ID_SHIFT
}

/// Status word of a transfer TRB.
pub const fn transfer_status(length: u32, td_size: u8, interrupter: u16) -> u32 {
    (length & TRB_STATUS_LENGTH_MASK)
        | (((td_size as u32) & TRB_STATUS_TD_SIZE_MASK) << TRB_STATUS_TD_SIZE_SHIFT)
        | ((interrupter as u32) << TRB_STATUS_INTERRUPTER_SHIFT)
}

impl Trb {
    pub fn set(&mut self, data: u64, status: u32, control: u32) {
        self.data_low.write(data as u32);
        self.data_high.write((data >> 32) as u32);
        self.status.write(status);
        self.control.write(control);
    }

    pub fn read_data(&self) -> u64 {
        u64::from(self.data_low.read()) | (u64::from(self.data_high.read()) << 32)
    }

    pub fn cycle(&self) -> bool {
        self.control.readf(TRB_CONTROL_CYCLE_BIT)
    }
    /// Hands the TRB to the consumer whose cycle state is `cycle`.
    pub fn set_cycle(&mut self, cycle: bool) {
        self.control.writef(TRB_CONTROL_CYCLE_BIT, cycle);
    }
    pub fn chain(&self) -> bool {
        self.control.readf(TRB_CONTROL_CHAIN_BIT)
    }
    pub fn trb_type(&self) -> u8 {
        ((self.control.read() & TRB_CONTROL_TRB_TYPE_MASK) >> TRB_CONTROL_TRB_TYPE_SHIFT) as u8
    }
    pub fn is_type(&self, trb_type: TrbType) -> bool {
        self.trb_type() == trb_type as u8
    }
    /// Payload length of a transfer TRB.
    pub fn transfer_length(&self) -> u32 {
        self.status.read() & TRB_STATUS_LENGTH_MASK
    }

    /* Event accessors */

    pub fn completion_code(&self) -> u8 {
        (self.status.read() >> TRB_STATUS_COMPLETION_CODE_SHIFT) as u8
    }
    /// Bytes of the TRB named by a transfer event that were not transferred.
    pub fn residual_length(&self) -> u32 {
        self.status.read() & TRB_STATUS_EVENT_LENGTH_MASK
    }
    pub fn event_slot(&self) -> u8 {
        (self.control.read() >> TRB_CONTROL_SLOT_ID_SHIFT) as u8
    }
    pub fn endpoint_id(&self) -> u8 {
        ((self.control.read() & TRB_CONTROL_ENDPOINT_ID_MASK) >> TRB_CONTROL_ENDPOINT_ID_SHIFT)
            as u8
    }
    /// Set when a transfer event was produced by an Event Data TRB; the parameter then holds
    /// the Event Data TRB's payload instead of a TRB pointer.
    pub fn event_data_bit(&self) -> bool {
        self.control.readf(TRB_CONTROL_EVENT_DATA_BIT)
    }
    pub fn port_status_change_port_id(&self) -> u8 {
        debug_assert!(self.is_type(TrbType::PortStatusChange));
        ((self.read_data() >> 24) & 0xFF) as u8
    }

    /* Ring structure */

    pub fn link(&mut self, address: usize, toggle: bool, chain: bool, cycle: bool) {
        self.set(
            address as u64,
            0,
            ty(TrbType::Link)
                | (u32::from(chain) << 4)
                | (u32::from(toggle) << 1)
                | u32::from(cycle),
        );
    }
    pub fn link_toggles(&self) -> bool {
        self.is_type(TrbType::Link) && self.control.readf(TRB_CONTROL_LINK_TOGGLE_BIT)
    }
    pub fn set_chain(&mut self, chain: bool) {
        self.control.writef(TRB_CONTROL_CHAIN_BIT, chain);
    }

    /* Commands */

    pub fn no_op_cmd(&mut self, cycle: bool) {
        self.set(0, 0, ty(TrbType::NoOpCmd) | u32::from(cycle));
    }
    pub fn enable_slot(&mut self, slot_type: u8, cycle: bool) {
        trace!("Enabling slot with type {}", slot_type);
        self.set(
            0,
            0,
            ((u32::from(slot_type) & 0x1F) << 16) | ty(TrbType::EnableSlot) | u32::from(cycle),
        );
    }
    pub fn disable_slot(&mut self, slot_id: u8, cycle: bool) {
        self.set(0, 0, slot(slot_id) | ty(TrbType::DisableSlot) | u32::from(cycle));
    }
    pub fn address_device(&mut self, slot_id: u8, input_ctx_ptr: usize, bsr: bool, cycle: bool) {
        debug_assert_eq!(input_ctx_ptr & 0xF, 0, "unaligned input context ptr");
        self.set(
            input_ctx_ptr as u64,
            0,
            slot(slot_id) | ty(TrbType::AddressDevice) | (u32::from(bsr) << 9) | u32::from(cycle),
        );
    }
    pub fn configure_endpoint(&mut self, slot_id: u8, input_ctx_ptr: usize, cycle: bool) {
        debug_assert_eq!(input_ctx_ptr & 0xF, 0, "unaligned input context ptr");
        self.set(
            input_ctx_ptr as u64,
            0,
            slot(slot_id) | ty(TrbType::ConfigureEndpoint) | u32::from(cycle),
        );
    }
    pub fn evaluate_context(&mut self, slot_id: u8, input_ctx_ptr: usize, cycle: bool) {
        debug_assert_eq!(input_ctx_ptr & 0xF, 0, "unaligned input context ptr");
        self.set(
            input_ctx_ptr as u64,
            0,
            slot(slot_id) | ty(TrbType::EvaluateContext) | u32::from(cycle),
        );
    }
    pub fn reset_endpoint(&mut self, slot_id: u8, dci: u8, tsp: bool, cycle: bool) {
        self.set(
            0,
            0,
            slot(slot_id)
                | endpoint(dci)
                | ty(TrbType::ResetEndpoint)
                | (u32::from(tsp) << 9)
                | u32::from(cycle),
        );
    }
    pub fn stop_endpoint(&mut self, slot_id: u8, dci: u8, suspend: bool, cycle: bool) {
        self.set(
            0,
            0,
            slot(slot_id)
                | (u32::from(suspend) << 23)
                | endpoint(dci)
                | ty(TrbType::StopEndpoint)
                | u32::from(cycle),
        );
    }
    /// `deque_ptr` must carry the dequeue cycle state in bit 0.
    pub fn set_tr_deque_ptr(
        &mut self,
        deque_ptr: u64,
        sct: StreamContextType,
        stream_id: u16,
        dci: u8,
        slot_id: u8,
        cycle: bool,
    ) {
        debug_assert_eq!(deque_ptr & 0xE, 0, "unaligned dequeue ptr");
        self.set(
            deque_ptr | ((sct as u64) << 1),
            u32::from(stream_id) << 16,
            slot(slot_id) | endpoint(dci) | ty(TrbType::SetTrDequeuePointer) | u32::from(cycle),
        )
    }
    pub fn reset_device(&mut self, slot_id: u8, cycle: bool) {
        self.set(0, 0, slot(slot_id) | ty(TrbType::ResetDevice) | u32::from(cycle));
    }

    /* Transfers */

    /// The cycle bit is written with the rest of the TRB; callers that hand a whole TD over at
    /// once pass the inverted cycle here and flip it last.
    pub fn setup(&mut self, setup: usb::Setup, transfer: TransferKind, cycle: bool) {
        self.set(
            setup.to_u64(),
            transfer_status(8, 0, 0),
            ((transfer as u32) << 16) | ty(TrbType::SetupStage) | TRB_CONTROL_IDT_BIT | u32::from(cycle),
        );
    }
    pub fn data(
        &mut self,
        buffer: u64,
        length: u32,
        td_size: u8,
        input: bool,
        chain: bool,
        cycle: bool,
    ) {
        self.set(
            buffer,
            transfer_status(length, td_size, 0),
            (u32::from(input) << 16)
                | ty(TrbType::DataStage)
                | (u32::from(chain) << 4)
                | u32::from(cycle),
        );
    }
    pub fn status(&mut self, input: bool, ioc: bool, cycle: bool) {
        self.set(
            0,
            0,
            (u32::from(input) << 16)
                | ty(TrbType::StatusStage)
                | (u32::from(ioc) << 5)
                | u32::from(cycle),
        );
    }
    pub fn normal(
        &mut self,
        buffer: u64,
        length: u32,
        td_size: u8,
        isp: bool,
        chain: bool,
        ioc: bool,
        cycle: bool,
    ) {
        self.set(
            buffer,
            transfer_status(length, td_size, 0),
            ty(TrbType::Normal)
                | (u32::from(ioc) << 5)
                | (u32::from(chain) << 4)
                | (u32::from(isp) << 2)
                | u32::from(cycle),
        )
    }
    /// An Event Data TRB; its payload is reported back in the transfer event.
    pub fn event_data(&mut self, data: u64, ioc: bool, cycle: bool) {
        self.set(
            data,
            0,
            ty(TrbType::EventData) | (u32::from(ioc) << 5) | u32::from(cycle),
        );
    }
}

impl fmt::Debug for Trb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Trb {{ data: {:>016X}, status: {:>08X}, control: {:>08X} }}",
            self.read_data(),
            self.status.read(),
            self.control.read()
        )
    }
}

impl fmt::Display for Trb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "({:>016X}, {:>08X}, {:>08X})",
            self.read_data(),
            self.status.read(),
            self.control.read()
        )
    }
}
