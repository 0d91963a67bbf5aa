use common::dma::Dma;
use common::io::{Io, Mmio};
use common::PAGE_SIZE;
use log::debug;

use super::transfer::TransferRing;
use crate::error::{Result, XhciError};

/// Selects 32 byte contexts (HCCPARAMS1.CSZ clear).
pub const CONTEXT_32: usize = 0;
/// Selects 64 byte contexts (HCCPARAMS1.CSZ set).
pub const CONTEXT_64: usize = 1;

#[repr(C)]
struct Rsvd64<const N: usize>([[Mmio<u32>; 8]; N]);

#[repr(C)]
pub struct SlotContext<const N: usize> {
    pub a: Mmio<u32>,
    pub b: Mmio<u32>,
    pub c: Mmio<u32>,
    pub d: Mmio<u32>,
    _rsvd: [Mmio<u32>; 4],
    _rsvd64: Rsvd64<N>,
}

pub const SLOT_CONTEXT_ROUTE_STRING_MASK: u32 = 0x000F_FFFF;
pub const SLOT_CONTEXT_SPEED_SHIFT: u8 = 20;
pub const SLOT_CONTEXT_SPEED_MASK: u32 = 0x00F0_0000;
pub const SLOT_CONTEXT_HUB_BIT: u32 = 1 << 26;
pub const SLOT_CONTEXT_ENTRIES_SHIFT: u8 = 27;
pub const SLOT_CONTEXT_ENTRIES_MASK: u32 = 0xF800_0000;

pub const SLOT_CONTEXT_MAX_EXIT_LATENCY_MASK: u32 = 0x0000_FFFF;
pub const SLOT_CONTEXT_ROOT_HUB_PORT_SHIFT: u8 = 16;
pub const SLOT_CONTEXT_NUM_PORTS_SHIFT: u8 = 24;

pub const SLOT_CONTEXT_TT_HUB_SLOT_MASK: u32 = 0x0000_00FF;
pub const SLOT_CONTEXT_TT_PORT_SHIFT: u8 = 8;
pub const SLOT_CONTEXT_TT_THINK_TIME_SHIFT: u8 = 16;
pub const SLOT_CONTEXT_INTERRUPTER_SHIFT: u8 = 22;

pub const SLOT_CONTEXT_ADDRESS_MASK: u32 = 0x0000_00FF;
pub const SLOT_CONTEXT_STATE_MASK: u32 = 0xF800_0000;
pub const SLOT_CONTEXT_STATE_SHIFT: u8 = 27;

/// Slot speed encodings of the slot context and PORTSC.
pub const SLOT_SPEED_FULL: u8 = 1;
pub const SLOT_SPEED_LOW: u8 = 2;
pub const SLOT_SPEED_HIGH: u8 = 3;
pub const SLOT_SPEED_SUPER: u8 = 4;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlotState {
    EnabledOrDisabled = 0,
    Default = 1,
    Addressed = 2,
    Configured = 3,
}

impl<const N: usize> SlotContext<N> {
    pub fn speed(&self) -> u8 {
        ((self.a.read() & SLOT_CONTEXT_SPEED_MASK) >> SLOT_CONTEXT_SPEED_SHIFT) as u8
    }
    /// Index of the last valid endpoint context.
    pub fn context_entries(&self) -> u8 {
        ((self.a.read() & SLOT_CONTEXT_ENTRIES_MASK) >> SLOT_CONTEXT_ENTRIES_SHIFT) as u8
    }
    pub fn set_context_entries(&mut self, entries: u8) {
        let a = self.a.read() & !SLOT_CONTEXT_ENTRIES_MASK;
        self.a
            .write(a | (u32::from(entries & 0x1F) << SLOT_CONTEXT_ENTRIES_SHIFT));
    }
    pub fn device_address(&self) -> u8 {
        (self.d.read() & SLOT_CONTEXT_ADDRESS_MASK) as u8
    }
    pub fn state(&self) -> u8 {
        ((self.d.read() & SLOT_CONTEXT_STATE_MASK) >> SLOT_CONTEXT_STATE_SHIFT) as u8
    }
    pub fn copy_from(&mut self, other: &Self) {
        self.a.write(other.a.read());
        self.b.write(other.b.read());
        self.c.write(other.c.read());
        self.d.write(other.d.read());
    }
}

#[repr(C)]
pub struct EndpointContext<const N: usize> {
    pub a: Mmio<u32>,
    pub b: Mmio<u32>,
    pub trl: Mmio<u32>,
    pub trh: Mmio<u32>,
    pub c: Mmio<u32>,
    _rsvd: [Mmio<u32>; 3],
    _rsvd64: Rsvd64<N>,
}

pub const ENDPOINT_CONTEXT_STATUS_MASK: u32 = 0x7;
pub const ENDPOINT_CONTEXT_MULT_SHIFT: u8 = 8;
pub const ENDPOINT_CONTEXT_MAX_PSTREAMS_SHIFT: u8 = 10;
pub const ENDPOINT_CONTEXT_LSA_BIT: u32 = 1 << 15;
pub const ENDPOINT_CONTEXT_INTERVAL_SHIFT: u8 = 16;

pub const ENDPOINT_CONTEXT_CERR_SHIFT: u8 = 1;
pub const ENDPOINT_CONTEXT_TYPE_SHIFT: u8 = 3;
pub const ENDPOINT_CONTEXT_MAX_BURST_SHIFT: u8 = 8;
pub const ENDPOINT_CONTEXT_MAX_PACKET_SHIFT: u8 = 16;
pub const ENDPOINT_CONTEXT_MAX_PACKET_MASK: u32 = 0xFFFF_0000;

/// Error count programmed into every endpoint.
pub const ENDPOINT_ERROR_COUNT: u32 = 3;

/// Endpoint context types. (See XHCI Table 6-9)
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndpointType {
    NotValid = 0,
    IsochOut = 1,
    BulkOut = 2,
    InterruptOut = 3,
    Control = 4,
    IsochIn = 5,
    BulkIn = 6,
    InterruptIn = 7,
}

/// Endpoint states reported in the output context.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndpointState {
    Disabled = 0,
    Running = 1,
    Halted = 2,
    Stopped = 3,
    Error = 4,
}

impl EndpointState {
    pub fn from_raw(raw: u8) -> Self {
        match raw & ENDPOINT_CONTEXT_STATUS_MASK as u8 {
            1 => EndpointState::Running,
            2 => EndpointState::Halted,
            3 => EndpointState::Stopped,
            4 => EndpointState::Error,
            _ => EndpointState::Disabled,
        }
    }
}

impl<const N: usize> EndpointContext<N> {
    pub fn state(&self) -> EndpointState {
        EndpointState::from_raw((self.a.read() & ENDPOINT_CONTEXT_STATUS_MASK) as u8)
    }
    pub fn set_max_packet_size(&mut self, size: u16) {
        let b = self.b.read() & !ENDPOINT_CONTEXT_MAX_PACKET_MASK;
        self.b
            .write(b | (u32::from(size) << ENDPOINT_CONTEXT_MAX_PACKET_SHIFT));
    }
    pub fn max_packet_size(&self) -> u16 {
        (self.b.read() >> ENDPOINT_CONTEXT_MAX_PACKET_SHIFT) as u16
    }
    pub fn set_dequeue(&mut self, pointer: u64) {
        self.trl.write(pointer as u32);
        self.trh.write((pointer >> 32) as u32);
    }
    pub fn dequeue(&self) -> u64 {
        u64::from(self.trl.read()) | (u64::from(self.trh.read()) << 32)
    }
    pub fn clear(&mut self) {
        self.a.write(0);
        self.b.write(0);
        self.trl.write(0);
        self.trh.write(0);
        self.c.write(0);
    }
    pub fn copy_from(&mut self, other: &Self) {
        self.a.write(other.a.read());
        self.b.write(other.b.read());
        self.trl.write(other.trl.read());
        self.trh.write(other.trh.read());
        self.c.write(other.c.read());
    }
}

#[repr(C)]
pub struct DeviceContext<const N: usize> {
    pub slot: SlotContext<N>,
    pub endpoints: [EndpointContext<N>; 31],
}

/// Input control context add/drop flags.
pub const INPUT_CONTEXT_SLOT_FLAG: u32 = 1 << 0;
pub const INPUT_CONTEXT_EP0_FLAG: u32 = 1 << 1;

#[repr(C)]
pub struct InputContext<const N: usize> {
    pub drop_context: Mmio<u32>,
    pub add_context: Mmio<u32>,
    _rsvd: [Mmio<u32>; 5],
    pub control: Mmio<u32>,
    _rsvd64: Rsvd64<N>,
    pub device: DeviceContext<N>,
}

impl<const N: usize> InputContext<N> {
    pub fn set_flags(&mut self, add: u32, drop: u32) {
        self.add_context.write(add);
        self.drop_context.write(drop);
    }
    pub fn clear_flags(&mut self) {
        self.set_flags(0, 0);
    }
    pub fn dump_control(&self) {
        debug!(
            "INPUT CONTEXT: drop {:#X} add {:#X} slot [{:08X} {:08X} {:08X} {:08X}]",
            self.drop_context.read(),
            self.add_context.read(),
            self.device.slot.a.read(),
            self.device.slot.b.read(),
            self.device.slot.c.read(),
            self.device.slot.d.read(),
        );
    }
}

/// Allocates a zeroed, 64 byte aligned context.
pub fn alloc_context<T>() -> Result<Dma<T>> {
    Ok(unsafe { Dma::<T>::zeroed()?.assume_init() })
}

/// The Device Context Base Address Array: one entry per slot, entry 0 for the scratchpads.
pub struct DeviceContextList {
    pub dcbaa: Dma<[Mmio<u64>]>,
}

impl DeviceContextList {
    pub fn new(max_slots: u8) -> Result<Self> {
        let dcbaa = Dma::<[Mmio<u64>]>::zeroed_slice(usize::from(max_slots) + 1)?;
        Ok(DeviceContextList {
            dcbaa: unsafe { dcbaa.assume_init() },
        })
    }

    pub fn set(&mut self, slot: u8, address: u64) {
        self.dcbaa[usize::from(slot)].write(address);
    }
    pub fn get(&self, slot: u8) -> u64 {
        self.dcbaa[usize::from(slot)].read()
    }
    pub fn clear(&mut self, slot: u8) {
        self.set(slot, 0);
    }
    pub fn dcbaap(&self) -> u64 {
        self.dcbaa.physical() as u64
    }
}

#[repr(C)]
pub struct StreamContext {
    trl: Mmio<u32>,
    trh: Mmio<u32>,
    edtla: Mmio<u32>,
    rsvd: Mmio<u32>,
}

unsafe impl plain::Plain for StreamContext {}

impl StreamContext {
    pub fn dequeue(&self) -> u64 {
        u64::from(self.trl.read()) | (u64::from(self.trh.read()) << 32)
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamContextType {
    SecondaryRing,
    PrimaryRing,
    PrimarySsa8,
    PrimarySsa16,
    PrimarySsa32,
    PrimarySsa64,
    PrimarySsa128,
    PrimarySsa256,
}

/// Something a stream context can point at.
pub trait StreamRing {
    /// Dequeue pointer with the cycle state in bit 0.
    fn register(&self) -> u64;
}

impl StreamRing for TransferRing {
    fn register(&self) -> u64 {
        self.ring.register()
    }
}

/// A primary stream context array and the ring of every stream. Stream id `n` uses
/// `rings[n - 1]`; stream id 0 is reserved.
pub struct StreamContextArray<R = TransferRing> {
    pub contexts: Dma<[StreamContext]>,
    pub rings: Vec<R>,
}

impl<R: StreamRing> StreamContextArray<R> {
    /// Builds the array for `streams` stream ids (1 through `streams`). `max_psa_size` is
    /// HCCPARAMS1.MaxPSASize. If a ring cannot be created, the rings already built are
    /// released and the error returned.
    pub fn new<F>(streams: u16, max_psa_size: u8, mut new_ring: F) -> Result<Self>
    where
        F: FnMut(u16) -> Result<R>,
    {
        if streams == 0 {
            return Err(XhciError::InvalidArgument("stream count"));
        }
        let count = (usize::from(streams) + 1).next_power_of_two();
        if max_psa_size == 0 || count > 1usize << (u32::from(max_psa_size) + 1) {
            debug!(
                "{} stream contexts exceed the controller limit (MaxPSASize {})",
                count, max_psa_size
            );
            return Err(XhciError::StreamLimit);
        }

        let contexts = unsafe { Dma::<[StreamContext]>::zeroed_slice(count)?.assume_init() };
        let mut array = Self {
            contexts,
            rings: Vec::with_capacity(usize::from(streams)),
        };
        for stream_id in 1..=streams {
            let ring = new_ring(stream_id)?;
            let pointer = ring.register();
            let context = &mut array.contexts[usize::from(stream_id)];
            context
                .trl
                .write(pointer as u32 | ((StreamContextType::PrimaryRing as u32) << 1));
            context.trh.write((pointer >> 32) as u32);
            array.rings.push(ring);
        }
        Ok(array)
    }

    pub fn ring_mut(&mut self, stream_id: u16) -> Option<&mut R> {
        usize::from(stream_id)
            .checked_sub(1)
            .and_then(move |index| self.rings.get_mut(index))
    }

    pub fn register(&self) -> u64 {
        self.contexts.physical() as u64
    }
}

#[repr(C, align(4096))]
pub struct ScratchpadPage([u8; PAGE_SIZE]);

pub struct ScratchpadBufferArray {
    pub entries: Dma<[Mmio<u64>]>,
    pub pages: Vec<Dma<ScratchpadPage>>,
}

impl ScratchpadBufferArray {
    pub fn new(entries: u16) -> Result<Self> {
        let mut entries =
            unsafe { Dma::<[Mmio<u64>]>::zeroed_slice(usize::from(entries))?.assume_init() };

        let pages = entries
            .iter_mut()
            .map(|entry| -> Result<_> {
                let page = alloc_context::<ScratchpadPage>()?;
                entry.write(page.physical() as u64);
                Ok(page)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { entries, pages })
    }
    pub fn register(&self) -> usize {
        self.entries.physical()
    }
}
