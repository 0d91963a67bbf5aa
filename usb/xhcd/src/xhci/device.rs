//! Device slots and the pipes opened on them.
//!
//! A device is admitted with Enable Slot, which hands out a slot id, and gets an output context,
//! an input context and a ring for its default control pipe. Everything the controller is told
//! about the device afterwards goes through the input context: Address Device, Configure
//! Endpoint and Evaluate Context all read it.
use std::convert::TryFrom;
use std::mem;

use common::dma::Dma;
use common::io::Io;
use log::{debug, error, info, warn};

use super::context::{
    alloc_context, DeviceContext, EndpointContext, EndpointState, InputContext, SlotContext,
    SlotState, StreamContextArray, StreamContextType, ENDPOINT_CONTEXT_CERR_SHIFT,
    ENDPOINT_CONTEXT_INTERVAL_SHIFT, ENDPOINT_CONTEXT_LSA_BIT, ENDPOINT_CONTEXT_MAX_BURST_SHIFT,
    ENDPOINT_CONTEXT_MAX_PACKET_SHIFT, ENDPOINT_CONTEXT_MAX_PSTREAMS_SHIFT,
    ENDPOINT_CONTEXT_MULT_SHIFT, ENDPOINT_CONTEXT_TYPE_SHIFT, ENDPOINT_ERROR_COUNT,
    INPUT_CONTEXT_EP0_FLAG, INPUT_CONTEXT_SLOT_FLAG, SLOT_CONTEXT_ENTRIES_SHIFT,
    SLOT_CONTEXT_HUB_BIT, SLOT_CONTEXT_MAX_EXIT_LATENCY_MASK, SLOT_CONTEXT_NUM_PORTS_SHIFT,
    SLOT_CONTEXT_ROOT_HUB_PORT_SHIFT, SLOT_CONTEXT_ROUTE_STRING_MASK, SLOT_CONTEXT_SPEED_SHIFT,
    SLOT_CONTEXT_TT_PORT_SHIFT, SLOT_CONTEXT_TT_THINK_TIME_SHIFT, SLOT_SPEED_FULL,
    SLOT_SPEED_HIGH, SLOT_SPEED_LOW, SLOT_SPEED_SUPER,
};
use super::capability::HCI_VERSION_0_95;
use super::transfer::{endpoint_type, interval_for, Retirement, TransferRing};
use super::trb::Trb;
use super::{deliver, Xhci};
use crate::config::XhciConfig;
use crate::error::{Result, XhciError};
use crate::usb::{
    EndpointDescriptor, EndpointTy, Irp, IrpStatus, SuperSpeedCompanionDescriptor, UsbSpeed,
    DEFAULT_ADDRESS,
};

/// A stream context array together with the ring of every stream.
pub type StreamTable = StreamContextArray<TransferRing>;

/// The hub a device is attached to, when it is not the root hub.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ParentHub {
    pub function_address: u8,
    pub speed: UsbSpeed,
    pub route_string: u32,
}

/// Where a new device sits in the topology, as enumerated by the USB stack.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeviceInfo {
    pub speed: UsbSpeed,
    /// Port number on the parent hub, or on the root hub when there is no parent.
    pub port: u8,
    /// Root hub port of the top-level ancestor.
    pub root_port: u8,
    /// Number of external hubs between the root hub and the device.
    pub depth: u8,
    pub parent: Option<ParentHub>,
}

impl DeviceInfo {
    /// A device plugged straight into a root hub port.
    pub fn root(speed: UsbSpeed, root_port: u8) -> Self {
        Self {
            speed,
            port: root_port,
            root_port,
            depth: 0,
            parent: None,
        }
    }

    /// Whether split transactions to this device go through the parent's transaction
    /// translator.
    pub fn needs_tt(&self) -> bool {
        matches!(self.speed, UsbSpeed::Low | UsbSpeed::Full)
            && matches!(self.parent, Some(parent) if parent.speed == UsbSpeed::High)
    }
}

/// Hub parameters the controller needs once a device turns out to be a hub.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HubParams {
    pub ports: u8,
    /// TT think time, in units of 8 FS bit times minus one (0..=3).
    pub tt_think_time: u8,
}

/// Context changes learned after the device was addressed. Each present field is sent to the
/// controller with its own command, in field order.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DeviceUpdate {
    /// bMaxPacketSize0 from the device descriptor.
    pub max_packet_size: Option<u16>,
    /// Max exit latency in microseconds, from the SEL values.
    pub max_exit_latency: Option<u16>,
    pub hub: Option<HubParams>,
}

pub enum Transfer {
    Ring(TransferRing),
    Streams(StreamTable),
}

/// Runtime state of an open pipe.
pub struct Endpoint {
    pub transfer: Transfer,
    pub ty: EndpointTy,
    pub is_in: bool,
    pub max_packet: u16,
    pub state: EndpointState,
}

impl Endpoint {
    fn default_control(ring: TransferRing, max_packet: u16) -> Self {
        Self {
            transfer: Transfer::Ring(ring),
            ty: EndpointTy::Ctrl,
            is_in: false,
            max_packet,
            state: EndpointState::Running,
        }
    }

    pub fn ring_mut(&mut self) -> Option<&mut TransferRing> {
        match &mut self.transfer {
            Transfer::Ring(ring) => Some(ring),
            Transfer::Streams(_) => None,
        }
    }

    /// Takes every TD in flight on the endpoint.
    pub fn cancel_all(&mut self) -> Vec<Retirement> {
        match &mut self.transfer {
            Transfer::Ring(ring) => ring.cancel().into_iter().collect(),
            Transfer::Streams(table) => table.rings.iter_mut().filter_map(|r| r.cancel()).collect(),
        }
    }

    /// Cancels what is in flight and rewinds every ring. Returns the retired requests and, per
    /// ring, the stream id and the dequeue pointer to program with Set TR Dequeue Pointer.
    fn reinitialize(&mut self) -> (Vec<Retirement>, Vec<(u16, u64)>) {
        let mut retired = Vec::new();
        let mut dequeues = Vec::new();
        match &mut self.transfer {
            Transfer::Ring(ring) => {
                retired.extend(ring.reinitialize());
                dequeues.push((0, ring.ring.register()));
            }
            Transfer::Streams(table) => {
                for (index, ring) in table.rings.iter_mut().enumerate() {
                    retired.extend(ring.reinitialize());
                    dequeues.push((index as u16 + 1, ring.ring.register()));
                }
            }
        }
        (retired, dequeues)
    }
}

/// One admitted device.
pub struct Device<const N: usize> {
    pub slot: u8,
    pub info: DeviceInfo,
    /// The address the controller assigned, 0 until Address Device.
    pub address: u8,
    pub input: Dma<InputContext<N>>,
    pub output: Dma<DeviceContext<N>>,
    /// Indexed by DCI - 1.
    pub endpoints: [Option<Endpoint>; 31],
}

impl<const N: usize> Device<N> {
    pub fn endpoint_mut(&mut self, dci: u8) -> Option<&mut Endpoint> {
        usize::from(dci)
            .checked_sub(1)
            .and_then(move |index| self.endpoints.get_mut(index))
            .and_then(Option::as_mut)
    }

    /// The highest DCI still open, other than `except`.
    fn last_open_dci(&self, except: u8) -> u8 {
        self.endpoints
            .iter()
            .enumerate()
            .rev()
            .filter(|(index, endpoint)| endpoint.is_some() && *index as u8 + 1 != except)
            .map(|(index, _)| index as u8 + 1)
            .next()
            .unwrap_or(1)
    }

    /// Copies the current slot context into the input context, ready for a Configure Endpoint
    /// or Evaluate Context command.
    fn stage_slot(&mut self) {
        let Self { input, output, .. } = self;
        input.device.slot.copy_from(&output.slot);
    }

    fn cancel_all(&mut self) -> Vec<Retirement> {
        self.endpoints
            .iter_mut()
            .flatten()
            .flat_map(Endpoint::cancel_all)
            .collect()
    }
}

/// Maps USB function addresses to slot ids.
pub struct AddressTable([Option<u8>; 128]);

impl Default for AddressTable {
    fn default() -> Self {
        Self([None; 128])
    }
}

impl AddressTable {
    pub fn get(&self, address: u8) -> Option<u8> {
        self.0.get(usize::from(address)).copied().flatten()
    }
    pub fn set(&mut self, address: u8, slot: u8) {
        if let Some(entry) = self.0.get_mut(usize::from(address)) {
            *entry = Some(slot);
        }
    }
    pub fn unmap(&mut self, address: u8, slot: u8) {
        if self.get(address) == Some(slot) {
            self.0[usize::from(address)] = None;
        }
    }
    /// Drops every address that maps to `slot`.
    pub fn remove_slot(&mut self, slot: u8) {
        for entry in self.0.iter_mut().filter(|entry| **entry == Some(slot)) {
            *entry = None;
        }
    }
}

/// The device context index of an endpoint address: 1 for the default control pipe, then two
/// per endpoint number with IN after OUT.
pub fn dci(endpoint_address: u8) -> u8 {
    let number = endpoint_address & 0x0F;
    if number == 0 {
        1
    } else {
        number * 2 + u8::from(endpoint_address & 0x80 != 0)
    }
}

/// The slot context speed of a device being addressed.
pub fn slot_speed_for_address(speed: UsbSpeed) -> u8 {
    match speed {
        UsbSpeed::Low => SLOT_SPEED_LOW,
        UsbSpeed::Full => SLOT_SPEED_FULL,
        UsbSpeed::High => SLOT_SPEED_HIGH,
        UsbSpeed::Super => SLOT_SPEED_SUPER,
    }
}

/// The speed a pipe is reopened at, read back from the output slot context.
pub fn reopen_speed_from_slot(slot_speed: u8) -> Option<UsbSpeed> {
    match slot_speed {
        SLOT_SPEED_LOW => Some(UsbSpeed::Low),
        SLOT_SPEED_FULL => Some(UsbSpeed::Full),
        SLOT_SPEED_HIGH => Some(UsbSpeed::High),
        SLOT_SPEED_SUPER => Some(UsbSpeed::Super),
        _ => None,
    }
}

/// The 20 bit route string: one nibble per hub tier, the tier closest to the root hub in the
/// low nibble.
pub fn route_string(info: &DeviceInfo) -> u32 {
    match info.parent {
        Some(parent) if info.depth > 0 => {
            let shift = 4 * u32::from(info.depth.min(5) - 1);
            ((u32::from(info.port.min(15)) << shift) | parent.route_string)
                & SLOT_CONTEXT_ROUTE_STRING_MASK
        }
        _ => 0,
    }
}

/// Fills the input context for Address Device: slot context plus the default control
/// endpoint, whose ring dequeue pointer (with cycle state) is `ep0_dequeue`.
pub fn fill_address_context<const N: usize>(
    input: &mut InputContext<N>,
    info: &DeviceInfo,
    tt_hub_slot: Option<u8>,
    ep0_dequeue: u64,
) {
    input.set_flags(INPUT_CONTEXT_SLOT_FLAG | INPUT_CONTEXT_EP0_FLAG, 0);

    let slot = &mut input.device.slot;
    let route = if info.speed == UsbSpeed::Super {
        route_string(info)
    } else {
        0
    };
    slot.a.write(
        route
            | (u32::from(slot_speed_for_address(info.speed)) << SLOT_CONTEXT_SPEED_SHIFT)
            | (1 << SLOT_CONTEXT_ENTRIES_SHIFT),
    );
    slot.b
        .write(u32::from(info.root_port) << SLOT_CONTEXT_ROOT_HUB_PORT_SHIFT);
    let tt = match tt_hub_slot {
        Some(hub_slot) if info.needs_tt() => {
            u32::from(hub_slot) | (u32::from(info.port) << SLOT_CONTEXT_TT_PORT_SHIFT)
        }
        _ => 0,
    };
    // Interrupter target 0.
    slot.c.write(tt);
    slot.d.write(0);

    let ep0 = &mut input.device.endpoints[0];
    ep0.clear();
    ep0.b.write(
        (ENDPOINT_ERROR_COUNT << ENDPOINT_CONTEXT_CERR_SHIFT)
            | ((endpoint_type(EndpointTy::Ctrl, false) as u32) << ENDPOINT_CONTEXT_TYPE_SHIFT)
            | (u32::from(info.speed.default_max_packet_size()) << ENDPOINT_CONTEXT_MAX_PACKET_SHIFT),
    );
    ep0.set_dequeue(ep0_dequeue);
    // Average TRB length.
    ep0.c.write(8);
}

/// Fills one endpoint context for Configure Endpoint. `max_pstreams` is 0 for an endpoint
/// without streams; otherwise `dequeue` is the stream context array.
pub fn fill_endpoint_context<const N: usize>(
    ctx: &mut EndpointContext<N>,
    desc: &EndpointDescriptor,
    companion: Option<&SuperSpeedCompanionDescriptor>,
    speed: UsbSpeed,
    dequeue: u64,
    max_pstreams: u8,
) {
    let ty = desc.ty();
    let raw_mps = desc.max_packet_size();
    let max_packet = raw_mps & 0x7FF;
    let periodic = matches!(ty, EndpointTy::Interrupt | EndpointTy::Isoch);
    let (burst, mult) = match (speed, companion) {
        (UsbSpeed::Super, Some(companion)) => {
            let mult = if ty == EndpointTy::Isoch {
                companion.attributes & 0x3
            } else {
                0
            };
            (companion.max_burst, mult)
        }
        (UsbSpeed::High, _) if periodic => (((raw_mps & 0x1800) >> 11) as u8, 0),
        _ => (0, 0),
    };
    let interval = interval_for(speed, ty, desc.interval);

    let mut a = (u32::from(interval) << ENDPOINT_CONTEXT_INTERVAL_SHIFT)
        | (u32::from(mult) << ENDPOINT_CONTEXT_MULT_SHIFT);
    if max_pstreams > 0 {
        a |= (u32::from(max_pstreams) << ENDPOINT_CONTEXT_MAX_PSTREAMS_SHIFT)
            | ENDPOINT_CONTEXT_LSA_BIT;
    }

    ctx.clear();
    ctx.a.write(a);
    ctx.b.write(
        (ENDPOINT_ERROR_COUNT << ENDPOINT_CONTEXT_CERR_SHIFT)
            | ((endpoint_type(ty, desc.is_in()) as u32) << ENDPOINT_CONTEXT_TYPE_SHIFT)
            | (u32::from(burst) << ENDPOINT_CONTEXT_MAX_BURST_SHIFT)
            | (u32::from(max_packet) << ENDPOINT_CONTEXT_MAX_PACKET_SHIFT),
    );
    ctx.set_dequeue(dequeue);
    let average = match ty {
        EndpointTy::Interrupt => 1024,
        EndpointTy::Ctrl => 8,
        EndpointTy::Bulk | EndpointTy::Isoch => 3072,
    };
    ctx.c.write(average);
}

/// Marks `dci` for dropping and keeps the slot context, with its last valid index lowered to
/// `last_dci`.
pub fn fill_drop_context<const N: usize>(input: &mut InputContext<N>, dci: u8, last_dci: u8) {
    input.device.slot.set_context_entries(last_dci.max(1));
    input.set_flags(INPUT_CONTEXT_SLOT_FLAG, 1 << dci);
}

/// Slot bookkeeping the admission path needs from the controller.
pub trait SlotAllocator {
    /// Issues Enable Slot; the slot id is never 0.
    fn enable_slot(&self, slot_type: u8) -> Result<u8>;
    fn disable_slot(&self, slot: u8) -> Result<()>;
    /// Writes the output context address of `slot` into the DCBAA; 0 clears the entry.
    fn publish(&self, slot: u8, output: u64);
}

/// Owns a slot while the device behind it is being set up. Dropping the builder before
/// [DeviceBuilder::build] returns undoes the steps taken so far.
pub struct DeviceBuilder<'a, A: SlotAllocator, const N: usize> {
    allocator: &'a A,
    slot: u8,
    output: Option<Dma<DeviceContext<N>>>,
    input: Option<Dma<InputContext<N>>>,
    published: bool,
}

impl<'a, A: SlotAllocator, const N: usize> DeviceBuilder<'a, A, N> {
    pub fn begin(allocator: &'a A, slot_type: u8) -> Result<Self> {
        let slot = allocator.enable_slot(slot_type)?;
        if slot == 0 {
            return Err(XhciError::SlotUnavailable);
        }
        Ok(Self {
            allocator,
            slot,
            output: None,
            input: None,
            published: false,
        })
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    pub fn build(mut self, info: DeviceInfo, config: &XhciConfig) -> Result<Device<N>> {
        let output = self.output.insert(alloc_context::<DeviceContext<N>>()?);
        let output_address = output.physical() as u64;
        self.input = Some(alloc_context::<InputContext<N>>()?);

        self.allocator.publish(self.slot, output_address);
        self.published = true;

        let ring = TransferRing::new(
            config.transfer_ring_segments,
            config.trbs_per_segment,
            config.ring_max_trbs,
        )?;

        let (output, input) = match (self.output.take(), self.input.take()) {
            (Some(output), Some(input)) => (output, input),
            _ => return Err(XhciError::OutOfMemory),
        };
        let mut endpoints: [Option<Endpoint>; 31] = Default::default();
        endpoints[0] = Some(Endpoint::default_control(
            ring,
            info.speed.default_max_packet_size(),
        ));
        let slot = mem::replace(&mut self.slot, 0);
        Ok(Device {
            slot,
            info,
            address: 0,
            input,
            output,
            endpoints,
        })
    }
}

impl<'a, A: SlotAllocator, const N: usize> Drop for DeviceBuilder<'a, A, N> {
    fn drop(&mut self) {
        if self.slot == 0 {
            return;
        }
        warn!("rolling back admission of slot {}", self.slot);
        if self.published {
            self.allocator.publish(self.slot, 0);
        }
        self.input.take();
        self.output.take();
        if let Err(err) = self.allocator.disable_slot(self.slot) {
            error!("failed to disable slot {}: {}", self.slot, err);
        }
    }
}

impl<const N: usize> SlotAllocator for Xhci<N> {
    fn enable_slot(&self, slot_type: u8) -> Result<u8> {
        let event = self.command(|trb, cycle| trb.enable_slot(slot_type, cycle))?;
        Ok(event.slot_id)
    }
    fn disable_slot(&self, slot: u8) -> Result<()> {
        self.command(|trb, cycle| trb.disable_slot(slot, cycle))
            .map(|_| ())
    }
    fn publish(&self, slot: u8, output: u64) {
        self.dev_ctx.lock().unwrap().set(slot, output);
    }
}

impl<const N: usize> Xhci<N> {
    /// Admits a new device at the default address. Returns its slot id.
    pub fn initialize_device(&self, info: DeviceInfo) -> Result<u8> {
        let _control = self.control_plane()?;
        let slot_type = self.root_hub.lock().unwrap().slot_type(info.root_port);

        let builder = DeviceBuilder::<_, N>::begin(self, slot_type)?;
        let slot = builder.slot();
        if self.devices.get(usize::from(slot)).is_none() {
            error!("controller returned slot {} past MaxSlots", slot);
            return Err(XhciError::Fatal("slot id out of range"));
        }
        let device = builder.build(info, &self.config)?;

        *self.device_slot(slot)? = Some(device);
        self.addresses.lock().unwrap().set(DEFAULT_ADDRESS, slot);
        info!(
            "slot {}: {:?} device on root port {} (port {}, depth {})",
            slot, info.speed, info.root_port, info.port, info.depth
        );
        Ok(slot)
    }

    /// Removes the device answering at `function_address` and releases everything it holds.
    pub fn uninitialize_device(&self, function_address: u8) -> Result<()> {
        if self.is_root_hub(function_address) {
            return Ok(());
        }
        let _control = self.control_plane()?;
        let slot = self.lookup_slot(function_address)?;

        let disabled = self.disable_slot(slot);
        let device = self.device_slot(slot)?.take();
        self.dev_ctx.lock().unwrap().clear(slot);
        self.addresses.lock().unwrap().remove_slot(slot);

        if let Some(mut device) = device {
            deliver(device.cancel_all());
        }
        info!("slot {} at address {} removed", slot, function_address);
        disabled
    }

    /// Drops every device and its slot mapping without issuing commands. Returns the requests
    /// that were still in flight, cancelled.
    pub(crate) fn release_devices(&self) -> Vec<Retirement> {
        let mut retired = Vec::new();
        let mut dev_ctx = self.dev_ctx.lock().unwrap();
        for (slot, entry) in self.devices.iter().enumerate().skip(1) {
            if let Some(mut device) = entry.lock().unwrap().take() {
                debug!("releasing slot {}", slot);
                retired.extend(device.cancel_all());
                dev_ctx.clear(slot as u8);
            }
        }
        *self.addresses.lock().unwrap() = AddressTable::default();
        retired
    }

    fn tt_hub_slot(&self, info: &DeviceInfo) -> Option<u8> {
        let parent = info.parent.filter(|_| info.needs_tt())?;
        let slot = self.addresses.lock().unwrap().get(parent.function_address);
        if slot.is_none() {
            warn!(
                "parent hub {} of a {:?} device has no slot",
                parent.function_address, info.speed
            );
        }
        slot
    }

    /// Handles SET_ADDRESS: issues Address Device and binds the requested address to the slot.
    pub(crate) fn address_device(&self, slot: u8, irp: Irp) -> Result<()> {
        let setup = irp
            .setup
            .ok_or(XhciError::InvalidArgument("SET_ADDRESS without a setup packet"))?;
        let value = setup.value;
        let address = match u8::try_from(value) {
            Ok(address) if address > 0 && address < 128 => address,
            _ => return Err(XhciError::InvalidArgument("function address")),
        };
        let _control = self.control_plane()?;

        let info = {
            let guard = self.device_slot(slot)?;
            let device = guard.as_ref().ok_or(XhciError::BadSlot)?;
            device.info
        };
        let tt_hub_slot = self.tt_hub_slot(&info);

        let input_address = {
            let mut guard = self.device_slot(slot)?;
            let device = guard.as_mut().ok_or(XhciError::BadSlot)?;
            let state = device.output.slot.state();
            if state == SlotState::Addressed as u8 || state == SlotState::Configured as u8 {
                debug!("slot {} is already addressed", slot);
                None
            } else {
                let Device {
                    input, endpoints, ..
                } = device;
                let ep0 = endpoints[0]
                    .as_mut()
                    .and_then(Endpoint::ring_mut)
                    .ok_or(XhciError::NoSuchEndpoint(0))?;
                fill_address_context(input, &info, tt_hub_slot, ep0.ring.register());
                input.dump_control();
                Some(input.physical())
            }
        };

        if let Some(input_address) = input_address {
            self.command(|trb, cycle| trb.address_device(slot, input_address, false, cycle))?;
        }

        {
            let mut guard = self.device_slot(slot)?;
            let device = guard.as_mut().ok_or(XhciError::BadSlot)?;
            device.address = device.output.slot.device_address();
            device.input.clear_flags();
            debug!(
                "slot {}: function address {}, controller address {}",
                slot, address, device.address
            );
        }
        {
            let mut addresses = self.addresses.lock().unwrap();
            addresses.unmap(DEFAULT_ADDRESS, slot);
            addresses.set(address, slot);
        }

        irp.complete(IrpStatus::Success, 0);
        Ok(())
    }

    /// Opens a pipe for `desc` at the speed the device was admitted with.
    pub fn open_pipe(
        &self,
        function_address: u8,
        desc: &EndpointDescriptor,
        companion: Option<&SuperSpeedCompanionDescriptor>,
    ) -> Result<()> {
        if self.is_root_hub(function_address) {
            return Ok(());
        }
        let _control = self.control_plane()?;
        let slot = self.lookup_slot(function_address)?;
        let speed = {
            let guard = self.device_slot(slot)?;
            guard.as_ref().ok_or(XhciError::BadSlot)?.info.speed
        };
        self.open_endpoint(slot, desc, companion, speed)
    }

    fn new_stream_table(&self, streams_exp: u8) -> Result<StreamTable> {
        let streams = 1u16 << streams_exp.min(15);
        StreamContextArray::new(streams, self.cap.max_psa_size(), |_| {
            TransferRing::new(
                self.config.stream_ring_segments,
                self.config.trbs_per_segment,
                self.config.ring_max_trbs,
            )
        })
    }

    fn open_endpoint(
        &self,
        slot: u8,
        desc: &EndpointDescriptor,
        companion: Option<&SuperSpeedCompanionDescriptor>,
        speed: UsbSpeed,
    ) -> Result<()> {
        let dci = dci(desc.address);
        if dci == 1 {
            debug!("slot {}: default control pipe is always open", slot);
            return Ok(());
        }

        let streams_exp = match (desc.ty(), speed, companion) {
            (EndpointTy::Bulk, UsbSpeed::Super, Some(companion)) => companion.max_streams_exp(),
            _ => 0,
        };
        let (transfer, dequeue, max_pstreams) = if streams_exp > 0 {
            let table = self.new_stream_table(streams_exp)?;
            let dequeue = table.register();
            let max_pstreams = table.contexts.len().trailing_zeros().saturating_sub(1) as u8;
            (Transfer::Streams(table), dequeue, max_pstreams)
        } else {
            let ring = TransferRing::new(
                self.config.transfer_ring_segments,
                self.config.trbs_per_segment,
                self.config.ring_max_trbs,
            )?;
            let dequeue = ring.ring.register();
            (Transfer::Ring(ring), dequeue, 0)
        };

        let input_address = {
            let mut guard = self.device_slot(slot)?;
            let device = guard.as_mut().ok_or(XhciError::BadSlot)?;
            if device.endpoint_mut(dci).is_some() {
                debug!("slot {}: endpoint {:#04X} is already open", slot, desc.address);
                return Err(XhciError::InvalidState);
            }
            device.stage_slot();
            let input = &mut device.input;
            fill_endpoint_context(
                &mut input.device.endpoints[usize::from(dci) - 1],
                desc,
                companion,
                speed,
                dequeue,
                max_pstreams,
            );
            if input.device.slot.context_entries() < dci {
                input.device.slot.set_context_entries(dci);
            }
            input.set_flags(INPUT_CONTEXT_SLOT_FLAG | (1 << dci), 0);
            input.physical()
        };

        let configured =
            self.command(|trb, cycle| trb.configure_endpoint(slot, input_address, cycle));

        let mut guard = self.device_slot(slot)?;
        let device = guard.as_mut().ok_or(XhciError::BadSlot)?;
        device.input.clear_flags();
        configured?;

        debug!(
            "slot {}: opened {:?} endpoint {:#04X} (DCI {}, {} streams)",
            slot,
            desc.ty(),
            desc.address,
            dci,
            if max_pstreams > 0 { 1u32 << streams_exp } else { 0 }
        );
        device.endpoints[usize::from(dci) - 1] = Some(Endpoint {
            transfer,
            ty: desc.ty(),
            is_in: desc.is_in(),
            max_packet: desc.max_packet_size() & 0x7FF,
            state: EndpointState::Running,
        });
        Ok(())
    }

    /// Closes a pipe. Requests in flight come back cancelled. The default control pipe stays
    /// configured; only its request is cancelled.
    pub fn close_pipe(&self, function_address: u8, endpoint_address: u8) -> Result<()> {
        if self.is_root_hub(function_address) {
            return Ok(());
        }
        let _control = self.control_plane()?;
        let slot = self.lookup_slot(function_address)?;
        self.close_endpoint(slot, dci(endpoint_address))
    }

    fn close_endpoint(&self, slot: u8, dci: u8) -> Result<()> {
        if dci == 1 {
            let retired = {
                let mut guard = self.device_slot(slot)?;
                let device = guard.as_mut().ok_or(XhciError::BadSlot)?;
                device
                    .endpoint_mut(1)
                    .map(Endpoint::cancel_all)
                    .unwrap_or_default()
            };
            deliver(retired);
            return Ok(());
        }

        let input_address = {
            let mut guard = self.device_slot(slot)?;
            let device = guard.as_mut().ok_or(XhciError::BadSlot)?;
            if device.endpoint_mut(dci).is_none() {
                return Err(XhciError::NoSuchEndpoint(dci));
            }
            let last = device.last_open_dci(dci);
            device.stage_slot();
            fill_drop_context(&mut device.input, dci, last);
            device.input.physical()
        };

        let configured =
            self.command(|trb, cycle| trb.configure_endpoint(slot, input_address, cycle));

        let endpoint = {
            let mut guard = self.device_slot(slot)?;
            let device = guard.as_mut().ok_or(XhciError::BadSlot)?;
            device.input.clear_flags();
            configured?;
            device.endpoints[usize::from(dci) - 1].take()
        };
        if let Some(mut endpoint) = endpoint {
            deliver(endpoint.cancel_all());
        }
        debug!("slot {}: closed DCI {}", slot, dci);
        Ok(())
    }

    /// Reopens a pipe with a new descriptor, at the speed the controller has in the slot
    /// context.
    pub fn modify_pipe(
        &self,
        function_address: u8,
        desc: &EndpointDescriptor,
        companion: Option<&SuperSpeedCompanionDescriptor>,
    ) -> Result<()> {
        if self.is_root_hub(function_address) {
            return Ok(());
        }
        let _control = self.control_plane()?;
        let slot = self.lookup_slot(function_address)?;
        let slot_speed = {
            let guard = self.device_slot(slot)?;
            guard.as_ref().ok_or(XhciError::BadSlot)?.output.slot.speed()
        };
        let speed = reopen_speed_from_slot(slot_speed).ok_or_else(|| {
            warn!("slot {} has unknown speed {}", slot, slot_speed);
            XhciError::InvalidState
        })?;

        self.close_endpoint(slot, dci(desc.address))?;
        self.open_endpoint(slot, desc, companion, speed)
    }

    fn endpoint_state(&self, slot: u8, dci: u8) -> Result<(EndpointState, EndpointState)> {
        let mut guard = self.device_slot(slot)?;
        let device = guard.as_mut().ok_or(XhciError::BadSlot)?;
        let hardware = device.output.endpoints[usize::from(dci) - 1].state();
        let tracked = device
            .endpoint_mut(dci)
            .ok_or(XhciError::NoSuchEndpoint(dci))?
            .state;
        Ok((hardware, tracked))
    }

    /// Cancels and rewinds every ring of the endpoint and points the controller at the new
    /// dequeue positions. The endpoint must be stopped or halted.
    fn rewind_endpoint(&self, slot: u8, dci: u8) -> Result<()> {
        let (retired, dequeues, streams) = {
            let mut guard = self.device_slot(slot)?;
            let device = guard.as_mut().ok_or(XhciError::BadSlot)?;
            let endpoint = device
                .endpoint_mut(dci)
                .ok_or(XhciError::NoSuchEndpoint(dci))?;
            let streams = matches!(endpoint.transfer, Transfer::Streams(_));
            let (retired, dequeues) = endpoint.reinitialize();
            (retired, dequeues, streams)
        };
        deliver(retired);

        let sct = if streams {
            StreamContextType::PrimaryRing
        } else {
            StreamContextType::SecondaryRing
        };
        for (stream_id, dequeue) in dequeues {
            self.command(|trb: &mut Trb, cycle| {
                trb.set_tr_deque_ptr(dequeue, sct, stream_id, dci, slot, cycle)
            })?;
        }
        Ok(())
    }

    /// Stops (or resets, when halted) the endpoint and discards everything queued on it.
    pub fn flush_pipe(&self, function_address: u8, endpoint_address: u8) -> Result<()> {
        if self.is_root_hub(function_address) {
            return Ok(());
        }
        let _control = self.control_plane()?;
        let slot = self.lookup_slot(function_address)?;
        let dci = dci(endpoint_address);

        let (hardware, _) = self.endpoint_state(slot, dci)?;
        match hardware {
            EndpointState::Running => {
                self.command(|trb, cycle| trb.stop_endpoint(slot, dci, false, cycle))?;
            }
            EndpointState::Halted => {
                self.command(|trb, cycle| trb.reset_endpoint(slot, dci, false, cycle))?;
            }
            _ => (),
        }
        self.rewind_endpoint(slot, dci)?;
        self.set_endpoint_state(slot, dci, EndpointState::Running)
    }

    /// Recovers an endpoint that stalled.
    pub fn unstall_pipe(&self, function_address: u8, endpoint_address: u8) -> Result<()> {
        if self.is_root_hub(function_address) {
            return Ok(());
        }
        let _control = self.control_plane()?;
        let slot = self.lookup_slot(function_address)?;
        let dci = dci(endpoint_address);

        let (_, tracked) = self.endpoint_state(slot, dci)?;
        if tracked != EndpointState::Halted {
            return Ok(());
        }
        self.command(|trb, cycle| trb.reset_endpoint(slot, dci, false, cycle))?;
        self.rewind_endpoint(slot, dci)?;
        self.set_endpoint_state(slot, dci, EndpointState::Running)
    }

    /// Stops the endpoint with the suspend hint set.
    pub fn disable_pipe(&self, function_address: u8, endpoint_address: u8) -> Result<()> {
        if self.is_root_hub(function_address) {
            return Ok(());
        }
        let _control = self.control_plane()?;
        let slot = self.lookup_slot(function_address)?;
        let dci = dci(endpoint_address);

        self.endpoint_state(slot, dci)?;
        self.command(|trb, cycle| trb.stop_endpoint(slot, dci, true, cycle))?;
        self.set_endpoint_state(slot, dci, EndpointState::Stopped)
    }

    fn set_endpoint_state(&self, slot: u8, dci: u8, state: EndpointState) -> Result<()> {
        let mut guard = self.device_slot(slot)?;
        let device = guard.as_mut().ok_or(XhciError::BadSlot)?;
        let endpoint = device
            .endpoint_mut(dci)
            .ok_or(XhciError::NoSuchEndpoint(dci))?;
        endpoint.state = state;
        Ok(())
    }

    /// Sends context changes learned after addressing to the controller.
    pub fn update_device(&self, function_address: u8, update: DeviceUpdate) -> Result<()> {
        if self.is_root_hub(function_address) {
            return Ok(());
        }
        let _control = self.control_plane()?;
        let slot = self.lookup_slot(function_address)?;

        if let Some(max_packet_size) = update.max_packet_size {
            let input_address = self.stage_update(slot, INPUT_CONTEXT_EP0_FLAG, |device| {
                let Device {
                    input, output, endpoints, ..
                } = device;
                input.device.endpoints[0].copy_from(&output.endpoints[0]);
                input.device.endpoints[0].set_max_packet_size(max_packet_size);
                if let Some(ep0) = endpoints[0].as_mut() {
                    ep0.max_packet = max_packet_size;
                }
            })?;
            self.evaluate(slot, input_address)?;
            debug!("slot {}: EP0 max packet size {}", slot, max_packet_size);
        }

        if let Some(latency) = update.max_exit_latency {
            let input_address = self.stage_update(slot, INPUT_CONTEXT_SLOT_FLAG, |device| {
                let slot_ctx = &mut device.input.device.slot;
                let b = slot_ctx.b.read() & !SLOT_CONTEXT_MAX_EXIT_LATENCY_MASK;
                slot_ctx.b.write(b | u32::from(latency));
            })?;
            self.evaluate(slot, input_address)?;
            debug!("slot {}: max exit latency {}us", slot, latency);
        }

        if let Some(hub) = update.hub {
            let input_address = self.stage_update(slot, INPUT_CONTEXT_SLOT_FLAG, |device| {
                mark_hub(&mut device.input.device.slot, hub);
            })?;
            if self.cap.hci_version() == HCI_VERSION_0_95 {
                self.evaluate(slot, input_address)?;
            } else {
                let configured = self
                    .command(|trb, cycle| trb.configure_endpoint(slot, input_address, cycle));
                self.clear_input_flags(slot)?;
                configured?;
            }
            debug!("slot {}: hub with {} ports", slot, hub.ports);
        }
        Ok(())
    }

    /// Copies the slot context into the input context, lets `edit` change it and sets the add
    /// flags. Returns the input context address.
    fn stage_update<F>(&self, slot: u8, add: u32, edit: F) -> Result<usize>
    where
        F: FnOnce(&mut Device<N>),
    {
        let mut guard = self.device_slot(slot)?;
        let device = guard.as_mut().ok_or(XhciError::BadSlot)?;
        device.stage_slot();
        edit(device);
        device.input.set_flags(add, 0);
        Ok(device.input.physical())
    }

    fn evaluate(&self, slot: u8, input_address: usize) -> Result<()> {
        let evaluated = self.command(|trb, cycle| trb.evaluate_context(slot, input_address, cycle));
        self.clear_input_flags(slot)?;
        evaluated.map(|_| ())
    }

    fn clear_input_flags(&self, slot: u8) -> Result<()> {
        let mut guard = self.device_slot(slot)?;
        guard
            .as_mut()
            .ok_or(XhciError::BadSlot)?
            .input
            .clear_flags();
        Ok(())
    }
}

fn mark_hub<const N: usize>(slot: &mut SlotContext<N>, hub: HubParams) {
    slot.a.write(slot.a.read() | SLOT_CONTEXT_HUB_BIT);
    let b = slot.b.read() & !(0xFF << SLOT_CONTEXT_NUM_PORTS_SHIFT);
    slot.b
        .write(b | (u32::from(hub.ports) << SLOT_CONTEXT_NUM_PORTS_SHIFT));
    let c = slot.c.read() & !(0x3 << SLOT_CONTEXT_TT_THINK_TIME_SHIFT);
    slot.c
        .write(c | (u32::from(hub.tt_think_time & 0x3) << SLOT_CONTEXT_TT_THINK_TIME_SHIFT));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xhci::context::{
        CONTEXT_32, CONTEXT_64, ENDPOINT_CONTEXT_MAX_PACKET_MASK, SLOT_CONTEXT_TT_HUB_SLOT_MASK,
    };
    use std::cell::RefCell;

    #[test]
    fn device_context_indices() {
        assert_eq!(dci(0x00), 1);
        assert_eq!(dci(0x80), 1);
        assert_eq!(dci(0x01), 2);
        assert_eq!(dci(0x81), 3);
        assert_eq!(dci(0x8F), 31);
    }

    #[test]
    fn speed_encodings_round_trip() {
        assert_eq!(slot_speed_for_address(UsbSpeed::Low), 2);
        assert_eq!(slot_speed_for_address(UsbSpeed::Full), 1);
        assert_eq!(slot_speed_for_address(UsbSpeed::High), 3);
        assert_eq!(slot_speed_for_address(UsbSpeed::Super), 4);
        for speed in [UsbSpeed::Low, UsbSpeed::Full, UsbSpeed::High, UsbSpeed::Super] {
            assert_eq!(reopen_speed_from_slot(slot_speed_for_address(speed)), Some(speed));
        }
        assert_eq!(reopen_speed_from_slot(0), None);
    }

    fn hub(function_address: u8, speed: UsbSpeed, route_string: u32) -> ParentHub {
        ParentHub {
            function_address,
            speed,
            route_string,
        }
    }

    #[test]
    fn route_strings() {
        assert_eq!(route_string(&DeviceInfo::root(UsbSpeed::Super, 3)), 0);

        let tier1 = DeviceInfo {
            speed: UsbSpeed::Super,
            port: 2,
            root_port: 3,
            depth: 1,
            parent: Some(hub(5, UsbSpeed::Super, 0)),
        };
        assert_eq!(route_string(&tier1), 0x2);

        let tier2 = DeviceInfo {
            port: 4,
            depth: 2,
            parent: Some(hub(6, UsbSpeed::Super, 0x2)),
            ..tier1
        };
        assert_eq!(route_string(&tier2), 0x42);
    }

    #[test]
    fn low_speed_behind_high_speed_hub_uses_the_tt() {
        let mut input = alloc_context::<InputContext<CONTEXT_32>>().unwrap();
        let info = DeviceInfo {
            speed: UsbSpeed::Low,
            port: 3,
            root_port: 1,
            depth: 1,
            parent: Some(hub(4, UsbSpeed::High, 0)),
        };
        assert!(info.needs_tt());
        fill_address_context(&mut input, &info, Some(7), 0x8000 | 1);

        assert_eq!(input.add_context.read(), 0b11);
        assert_eq!(input.drop_context.read(), 0);
        let slot = &input.device.slot;
        assert_eq!(slot.speed(), SLOT_SPEED_LOW);
        assert_eq!(slot.context_entries(), 1);
        assert_eq!(slot.a.read() & SLOT_CONTEXT_ROUTE_STRING_MASK, 0);
        assert_eq!(slot.b.read() >> SLOT_CONTEXT_ROOT_HUB_PORT_SHIFT & 0xFF, 1);
        assert_eq!(slot.c.read() & SLOT_CONTEXT_TT_HUB_SLOT_MASK, 7);
        assert_eq!(slot.c.read() >> SLOT_CONTEXT_TT_PORT_SHIFT & 0xFF, 3);

        let ep0 = &input.device.endpoints[0];
        assert_eq!(ep0.max_packet_size(), 8);
        assert_eq!(ep0.dequeue(), 0x8001);
        assert_eq!(ep0.b.read() >> ENDPOINT_CONTEXT_TYPE_SHIFT & 0x7, 4);
        assert_eq!(ep0.b.read() >> ENDPOINT_CONTEXT_CERR_SHIFT & 0x3, 3);
    }

    #[test]
    fn no_tt_for_full_speed_hubs_or_the_root_hub() {
        let mut input = alloc_context::<InputContext<CONTEXT_64>>().unwrap();
        let behind_fs_hub = DeviceInfo {
            speed: UsbSpeed::Full,
            port: 2,
            root_port: 1,
            depth: 1,
            parent: Some(hub(4, UsbSpeed::Full, 0)),
        };
        fill_address_context(&mut input, &behind_fs_hub, Some(7), 0x8001);
        assert_eq!(input.device.slot.c.read(), 0);

        let on_root = DeviceInfo::root(UsbSpeed::Full, 2);
        assert!(!on_root.needs_tt());
        fill_address_context(&mut input, &on_root, None, 0x8001);
        assert_eq!(input.device.slot.c.read(), 0);
        assert_eq!(input.device.slot.speed(), SLOT_SPEED_FULL);
    }

    #[test]
    fn superspeed_address_context() {
        let mut input = alloc_context::<InputContext<CONTEXT_32>>().unwrap();
        let info = DeviceInfo {
            speed: UsbSpeed::Super,
            port: 5,
            root_port: 2,
            depth: 2,
            parent: Some(hub(9, UsbSpeed::Super, 0x3)),
        };
        fill_address_context(&mut input, &info, None, 0x4001);
        assert_eq!(input.device.slot.a.read() & SLOT_CONTEXT_ROUTE_STRING_MASK, 0x53);
        assert_eq!(input.device.slot.speed(), SLOT_SPEED_SUPER);
        assert_eq!(input.device.endpoints[0].max_packet_size(), 512);
    }

    #[test]
    fn endpoint_contexts() {
        let mut input = alloc_context::<InputContext<CONTEXT_32>>().unwrap();
        let ctx = &mut input.device.endpoints[2];

        // High speed interrupt IN with two extra transactions per microframe.
        let desc = EndpointDescriptor::new(0x81, EndpointTy::Interrupt, 0x1000 | 64, 4);
        fill_endpoint_context(ctx, &desc, None, UsbSpeed::High, 0x9001, 0);
        assert_eq!(ctx.a.read() >> ENDPOINT_CONTEXT_INTERVAL_SHIFT & 0xFF, 3);
        assert_eq!(ctx.b.read() >> ENDPOINT_CONTEXT_TYPE_SHIFT & 0x7, 7);
        assert_eq!(ctx.b.read() >> ENDPOINT_CONTEXT_MAX_BURST_SHIFT & 0xFF, 2);
        assert_eq!(ctx.max_packet_size(), 64);
        assert_eq!(ctx.dequeue(), 0x9001);

        // Full speed interrupt OUT every 10 frames: 8ms, 2^6 microframes.
        let desc = EndpointDescriptor::new(0x02, EndpointTy::Interrupt, 8, 10);
        fill_endpoint_context(ctx, &desc, None, UsbSpeed::Full, 0x9001, 0);
        assert_eq!(ctx.a.read() >> ENDPOINT_CONTEXT_INTERVAL_SHIFT & 0xFF, 6);
        assert_eq!(ctx.b.read() >> ENDPOINT_CONTEXT_TYPE_SHIFT & 0x7, 3);

        // SuperSpeed bulk with streams.
        let desc = EndpointDescriptor::new(0x83, EndpointTy::Bulk, 1024, 0);
        let companion = SuperSpeedCompanionDescriptor::new(15, 4);
        fill_endpoint_context(ctx, &desc, Some(&companion), UsbSpeed::Super, 0xA000, 4);
        assert_eq!(ctx.a.read() >> ENDPOINT_CONTEXT_INTERVAL_SHIFT & 0xFF, 0);
        assert_eq!(ctx.a.read() >> ENDPOINT_CONTEXT_MAX_PSTREAMS_SHIFT & 0x1F, 4);
        assert_ne!(ctx.a.read() & ENDPOINT_CONTEXT_LSA_BIT, 0);
        assert_eq!(ctx.b.read() >> ENDPOINT_CONTEXT_MAX_BURST_SHIFT & 0xFF, 15);
        assert_eq!(ctx.b.read() & ENDPOINT_CONTEXT_MAX_PACKET_MASK, 1024 << 16);
        assert_eq!(ctx.b.read() >> ENDPOINT_CONTEXT_TYPE_SHIFT & 0x7, 6);
    }

    #[test]
    fn drop_context_lowers_entries() {
        let mut input = alloc_context::<InputContext<CONTEXT_32>>().unwrap();
        input.device.slot.set_context_entries(5);
        fill_drop_context(&mut input, 5, 3);
        assert_eq!(input.device.slot.context_entries(), 3);
        assert_eq!(input.add_context.read(), INPUT_CONTEXT_SLOT_FLAG);
        assert_eq!(input.drop_context.read(), 1 << 5);
    }

    #[test]
    fn hub_fields() {
        let mut input = alloc_context::<InputContext<CONTEXT_32>>().unwrap();
        input.device.slot.c.write(0x0304);
        mark_hub(
            &mut input.device.slot,
            HubParams {
                ports: 4,
                tt_think_time: 1,
            },
        );
        let slot = &input.device.slot;
        assert_ne!(slot.a.read() & SLOT_CONTEXT_HUB_BIT, 0);
        assert_eq!(slot.b.read() >> SLOT_CONTEXT_NUM_PORTS_SHIFT, 4);
        assert_eq!(slot.c.read(), 0x0001_0304);
    }

    #[test]
    fn address_table() {
        let mut table = AddressTable::default();
        table.set(0, 3);
        table.set(9, 3);
        table.set(10, 4);
        assert_eq!(table.get(9), Some(3));
        table.unmap(0, 4);
        assert_eq!(table.get(0), Some(3));
        table.remove_slot(3);
        assert_eq!(table.get(0), None);
        assert_eq!(table.get(9), None);
        assert_eq!(table.get(10), Some(4));
        assert_eq!(table.get(200), None);
    }

    #[derive(Debug, Eq, PartialEq)]
    enum Call {
        Enable,
        Publish(u8, bool),
        Disable(u8),
    }

    struct MockSlots {
        slot: u8,
        calls: RefCell<Vec<Call>>,
    }

    impl MockSlots {
        fn new(slot: u8) -> Self {
            Self {
                slot,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl SlotAllocator for MockSlots {
        fn enable_slot(&self, _slot_type: u8) -> Result<u8> {
            self.calls.borrow_mut().push(Call::Enable);
            Ok(self.slot)
        }
        fn disable_slot(&self, slot: u8) -> Result<()> {
            self.calls.borrow_mut().push(Call::Disable(slot));
            Ok(())
        }
        fn publish(&self, slot: u8, output: u64) {
            self.calls.borrow_mut().push(Call::Publish(slot, output != 0));
        }
    }

    #[test]
    fn admission_builds_a_device() {
        let slots = MockSlots::new(2);
        let builder = DeviceBuilder::<_, CONTEXT_32>::begin(&slots, 0).unwrap();
        let mut device = builder
            .build(DeviceInfo::root(UsbSpeed::High, 1), &XhciConfig::default())
            .unwrap();
        assert_eq!(device.slot, 2);
        let ep0 = device.endpoint_mut(1).unwrap();
        assert_eq!(ep0.max_packet, 64);
        assert!(ep0.ring_mut().is_some());
        assert!(device.endpoint_mut(2).is_none());

        drop(device);
        assert_eq!(
            *slots.calls.borrow(),
            vec![Call::Enable, Call::Publish(2, true)]
        );
    }

    #[test]
    fn admission_rolls_back_when_the_ring_fails() {
        let slots = MockSlots::new(5);
        let config = XhciConfig {
            transfer_ring_segments: 4,
            trbs_per_segment: 64,
            ring_max_trbs: 128,
            ..XhciConfig::default()
        };
        let builder = DeviceBuilder::<_, CONTEXT_64>::begin(&slots, 0).unwrap();
        let result = builder.build(DeviceInfo::root(UsbSpeed::Super, 1), &config);
        assert!(matches!(result, Err(XhciError::RingFull)));
        assert_eq!(
            *slots.calls.borrow(),
            vec![
                Call::Enable,
                Call::Publish(5, true),
                Call::Publish(5, false),
                Call::Disable(5)
            ]
        );
    }

    #[test]
    fn slot_zero_is_unavailable() {
        let slots = MockSlots::new(0);
        let result = DeviceBuilder::<_, CONTEXT_32>::begin(&slots, 0);
        assert!(matches!(result, Err(XhciError::SlotUnavailable)));
        assert_eq!(*slots.calls.borrow(), vec![Call::Enable]);
    }

    #[test]
    fn dropped_builder_releases_the_slot() {
        let slots = MockSlots::new(1);
        let builder = DeviceBuilder::<_, CONTEXT_32>::begin(&slots, 0).unwrap();
        drop(builder);
        assert_eq!(*slots.calls.borrow(), vec![Call::Enable, Call::Disable(1)]);
    }
}
