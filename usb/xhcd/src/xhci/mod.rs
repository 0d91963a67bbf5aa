//! The eXtensible Host Controller Interface (XHCI) Module
//!
//! This module implements the host controller side of the USB stack: it owns the controller's
//! register blocks and the DMA structures shared with it, and moves I/O requests from the USB
//! stack onto transfer rings.
//!
//! XHCI is a standard for the USB Host Controller interface specified by Intel that provides a
//! common register interface for systems to use to interact with the Universal Serial Bus (USB)
//! subsystem.
//!
//! The standard can be found [here](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf).
//! The standard is referenced frequently throughout this documentation as XHCI.
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use std::{ptr, slice};

use common::io::Io;
use common::timeout::Timeout;
use log::{debug, error, info, warn};

use crate::config::XhciConfig;
use crate::error::{Result, XhciError};
use crate::usb::{EndpointTy, Irp, ReqType, SetupReq};

pub mod capability;
pub mod command;
pub mod context;
pub mod device;
pub mod doorbell;
pub mod event;
pub mod extended;
pub mod irq;
pub mod operational;
pub mod port;
pub mod ring;
pub mod root_hub;
pub mod runtime;
pub mod transfer;
pub mod trb;

pub use self::capability::CapabilityRegs;
use self::command::{CommandCompletion, CommandEngine};
use self::context::{DeviceContextList, ScratchpadBufferArray};
pub use self::context::{CONTEXT_32, CONTEXT_64};
use self::device::{dci, AddressTable, Device, Transfer};
pub use self::device::{DeviceInfo, DeviceUpdate, ParentHub};
use self::doorbell::Doorbell;
use self::event::EventRing;
use self::irq::InterruptGuard;
use self::operational::*;
use self::port::Port;
use self::ring::Ring;
use self::root_hub::{RootHub, RootHubParams};
use self::runtime::RuntimeRegs;
use self::transfer::{queue_bulk, queue_control, Retirement};
use self::trb::Trb;

/// Where the controller is in its start/stop cycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControllerState {
    Reset,
    Running,
    Stopped,
}

/// The controller-wide section every control-plane operation runs in.
pub struct ControlPlane {
    pub state: ControllerState,
    initialized: bool,
}

pub struct Xhci<const N: usize> {
    /// The Host Controller Interface Capability Registers. These read-only registers specify the
    /// limits and capabilities of the host controller implementation (See XHCI section 5.3)
    cap: &'static CapabilityRegs,
    /// The Host Controller Interface Operational Registers. These registers provide the software
    /// interface to configure and monitor the state of the XHCI (See XHCI section 5.4)
    op: Mutex<&'static mut OperationalRegs>,
    ports: Mutex<&'static mut [Port]>,
    /// The Host Controller Interface Doorbell Registers. There is one register per device slot,
    /// and these registers are used by system software to notify the XHC that it has work to perform
    /// for a specific device slot. (See XHCI sections 4.7 and 5.6)
    dbs: Mutex<&'static mut [Doorbell]>,
    /// The Host Controller Interface Runtime Registers. These handle interrupt and event processing,
    /// and provide time-sensitive information such as the current microframe. (See XHCI section 5.5)
    run: Mutex<&'static mut RuntimeRegs>,

    config: XhciConfig,

    cmd: CommandEngine,
    event_ring: Mutex<EventRing>,
    dev_ctx: Mutex<DeviceContextList>,
    scratchpads: Mutex<Option<ScratchpadBufferArray>>,

    control: Mutex<ControlPlane>,
    addresses: Mutex<AddressTable>,
    /// Indexed by slot id; entry 0 is never used.
    devices: Box<[Mutex<Option<Device<N>>>]>,
    root_hub: Mutex<RootHub>,
    /// Nesting depth of [Xhci::disable_interrupts].
    interrupts: Mutex<usize>,
}

unsafe impl<const N: usize> Send for Xhci<N> {}
unsafe impl<const N: usize> Sync for Xhci<N> {}

/// Polls `done` until it holds, for at most a second.
fn wait_until<F: FnMut() -> bool>(what: &'static str, mut done: F) -> Result<()> {
    let timeout = Timeout::from_secs(1);
    while !done() {
        timeout.run().map_err(|()| {
            log::error!("timeout on {}", what);
            XhciError::Timeout(what)
        })?;
    }
    Ok(())
}

fn deliver(retired: Vec<Retirement>) {
    for retirement in retired {
        retirement.deliver();
    }
}

impl<const N: usize> Xhci<N> {
    /// Maps the register blocks of the controller at `address` and allocates the command ring,
    /// the event ring and the device context table. The controller is left untouched until
    /// [Xhci::init].
    ///
    /// # Safety
    /// `address` must be the base of the controller's mapped MMIO space, valid for the lifetime
    /// of the program.
    pub unsafe fn new(address: usize, config: XhciConfig) -> Result<Self> {
        config.validate()?;

        //Locate the capability registers from the mapped PCI Bar
        let cap = &*(address as *const CapabilityRegs);
        debug!("CAP REGS BASE {:X}", address);

        if cap.csz() != (N == CONTEXT_64) {
            error!("xHC context size does not match the driver's ({} byte contexts)", 32 << N);
            return Err(XhciError::Fatal("context size mismatch"));
        }

        //The operational registers appear immediately after the capability registers.
        let op_base = address + cap.len.read() as usize;
        let op = &mut *(op_base as *mut OperationalRegs);
        debug!("OP REGS BASE {:X}", op_base);

        debug!("Waiting for xHC becoming ready.");
        wait_until("USB_STS_CNR", || !op.usb_sts.readf(USB_STS_CNR))?;

        let max_slots = cap.max_slots();
        let max_ports = cap.max_ports();
        info!(
            "xHC version {:X}, max slots: {}, max ports: {}, max interrupters: {}",
            cap.hci_version(),
            max_slots,
            max_ports,
            cap.max_interrupters()
        );

        //Get the address of the port register table
        let port_base = op_base + OP_PORT_REGS_OFFSET;
        let ports = slice::from_raw_parts_mut(port_base as *mut Port, usize::from(max_ports));
        debug!("PORT BASE {:X}", port_base);

        //Get the address of the doorbell register table
        let db_base = address + cap.db_offset.read() as usize;
        let dbs = slice::from_raw_parts_mut(db_base as *mut Doorbell, 256);
        debug!("DOORBELL REGS BASE {:X}", db_base);

        let run_base = address + cap.rts_offset.read() as usize;
        let run = &mut *(run_base as *mut RuntimeRegs);
        debug!("RUNTIME REGS BASE {:X}", run_base);

        let ext_caps = match cap.ext_caps_ptr_in_dwords() {
            0 => ptr::null(),
            offset => (address + usize::from(offset) * 4) as *const u8,
        };
        let protocols = extended::supported_protocols(ext_caps);
        for protocol in protocols.iter() {
            info!(
                "Ports {}..{} are USB {}.{} ports with slot type {}",
                protocol.ports.start, protocol.ports.end, protocol.major, protocol.minor, protocol.slot_type
            );
        }
        let root_hub = RootHub::new(&config, RootHubParams::from_capabilities(cap), &protocols)?;

        let erst_max = 1usize << cap.erst_max().min(15);
        if config.event_ring_segments > erst_max {
            error!(
                "{} event ring segments requested, the xHC supports {}",
                config.event_ring_segments, erst_max
            );
            return Err(XhciError::InvalidArgument("event_ring_segments"));
        }

        let command_ring = Ring::new(
            config.command_ring_segments,
            config.trbs_per_segment,
            true,
            config.ring_max_trbs,
        )?;
        let cmd = CommandEngine::new(command_ring, Duration::from_millis(config.command_timeout_ms));
        let event_ring = EventRing::new(config.event_ring_segments, config.trbs_per_segment)?;
        let devices = (0..=max_slots).map(|_| Mutex::new(None)).collect();

        Ok(Self {
            cap,
            op: Mutex::new(op),
            ports: Mutex::new(ports),
            dbs: Mutex::new(dbs),
            run: Mutex::new(run),

            cmd,
            event_ring: Mutex::new(event_ring),
            dev_ctx: Mutex::new(DeviceContextList::new(max_slots)?),
            scratchpads: Mutex::new(None), // allocated in init()

            control: Mutex::new(ControlPlane {
                state: ControllerState::Reset,
                initialized: false,
            }),
            addresses: Mutex::new(AddressTable::default()),
            devices,
            root_hub: Mutex::new(root_hub),
            interrupts: Mutex::new(0),

            config,
        })
    }

    /// Resets the controller and programs it with the driver's DMA structures. Any device left
    /// over from an earlier initialization is released.
    pub fn init(&self) -> Result<()> {
        let mut control = self.control.lock().unwrap();
        if control.initialized {
            deliver(self.release_devices());
        }

        debug!("Stopping xHC.");
        self.op.lock().unwrap().usb_cmd.writef(USB_CMD_RS, false);
        wait_until("USB_STS_HCH", || self.op.lock().unwrap().halted())?;

        debug!("Reset xHC");
        self.op.lock().unwrap().usb_cmd.writef(USB_CMD_HCRST, true);
        wait_until("USB_CMD_HCRST", || {
            !self.op.lock().unwrap().usb_cmd.readf(USB_CMD_HCRST)
        })?;
        wait_until("USB_STS_CNR", || {
            !self.op.lock().unwrap().usb_sts.readf(USB_STS_CNR)
        })?;

        {
            let mut op = self.op.lock().unwrap();

            let max_slots = self.cap.max_slots();
            debug!("Setting enabled slots to {}.", max_slots);
            op.set_max_slots_enabled(max_slots);
            debug!("Enabled Slots: {}", op.max_slots_enabled());

            let dcbaap = self.dev_ctx.lock().unwrap().dcbaap();
            debug!("Writing DCBAAP: {:X}", dcbaap);
            op.set_dcbaap(dcbaap);

            self.cmd.reset();
            let crcr = self.cmd.crcr();
            debug!("Writing CRCR: {:X}", crcr);
            op.set_crcr(crcr);
        }

        {
            let mut event_ring = self.event_ring.lock().unwrap();
            event_ring.reset();

            let mut run = self.run.lock().unwrap();
            let int = &mut run.ints[0];

            let erstsz = event_ring.erst_size();
            debug!("Writing ERSTSZ: {}", erstsz);
            int.erstsz.write(erstsz);

            let erdp = event_ring.erdp();
            debug!("Writing ERDP: {:X}", erdp);
            int.set_erdp(erdp, true);

            let erstba = event_ring.erstba();
            debug!("Writing ERSTBA: {:X}", erstba);
            int.set_erstba(erstba);

            debug!("Writing IMOD: {}", self.config.interrupt_moderation);
            int.set_moderation(self.config.interrupt_moderation);

            debug!("Enabling Primary Interrupter.");
            int.set_enabled(true);
        }
        *self.interrupts.lock().unwrap() = 0;
        self.op.lock().unwrap().usb_cmd.writef(USB_CMD_INTE, true);

        self.setup_scratchpads()?;

        {
            let root_hub = self.root_hub.lock().unwrap();
            let mut ports = self.ports.lock().unwrap();
            root_hub.set_indicators(&mut **ports);
        }

        control.state = ControllerState::Reset;
        control.initialized = true;
        info!("XHCI initialized.");
        Ok(())
    }

    fn setup_scratchpads(&self) -> Result<()> {
        let buf_count = self.cap.max_scratchpad_bufs();
        let mut scratchpads = self.scratchpads.lock().unwrap();

        if buf_count == 0 {
            *scratchpads = None;
            return Ok(());
        }
        let scratchpad_buf_arr = ScratchpadBufferArray::new(buf_count)?;
        self.dev_ctx.lock().unwrap().dcbaa[0].write(scratchpad_buf_arr.register() as u64);
        debug!(
            "Setting up {} scratchpads, at {:#0x}",
            buf_count,
            scratchpad_buf_arr.register()
        );
        *scratchpads = Some(scratchpad_buf_arr);

        Ok(())
    }

    /// Sets Run/Stop and waits for the controller to leave the halted state.
    pub fn start(&self) -> Result<()> {
        let mut control = self.control.lock().unwrap();
        if !control.initialized {
            return Err(XhciError::InvalidState);
        }
        if control.state == ControllerState::Running {
            return Ok(());
        }

        debug!("Starting xHC.");
        self.op.lock().unwrap().usb_cmd.writef(USB_CMD_RS, true);
        wait_until("USB_STS_HCH", || !self.op.lock().unwrap().halted())?;
        self.op.lock().unwrap().set_cie(self.cap.cic());

        control.state = ControllerState::Running;
        info!("xHC running");
        Ok(())
    }

    /// Clears Run/Stop and waits for the controller to halt. Pending root hub status polls are
    /// cancelled.
    pub fn stop(&self) -> Result<()> {
        let mut control = self.control.lock().unwrap();
        if control.state != ControllerState::Running {
            return Ok(());
        }

        debug!("Stopping xHC.");
        self.op.lock().unwrap().usb_cmd.writef(USB_CMD_RS, false);
        let halted = wait_until("USB_STS_HCH", || self.op.lock().unwrap().halted());
        control.state = ControllerState::Stopped;
        drop(control);

        let cancelled = self.root_hub.lock().unwrap().cancel_polls();
        deliver(cancelled);
        info!("xHC stopped");
        halted
    }

    /// Halts and resets the controller and releases every device. Every request still in
    /// flight is cancelled.
    pub fn uninit(&self) -> Result<()> {
        let mut control = self.control.lock().unwrap();

        {
            let mut op = self.op.lock().unwrap();
            op.usb_cmd.writef(USB_CMD_INTE, false);
            op.usb_cmd.writef(USB_CMD_RS, false);
        }
        let mut result = wait_until("USB_STS_HCH", || self.op.lock().unwrap().halted());
        if result.is_ok() {
            self.op.lock().unwrap().usb_cmd.writef(USB_CMD_HCRST, true);
            result = wait_until("USB_CMD_HCRST", || {
                !self.op.lock().unwrap().usb_cmd.readf(USB_CMD_HCRST)
            });
        } else {
            warn!("resetting a controller that did not halt is skipped");
        }
        self.run.lock().unwrap().ints[0].clear();
        *self.interrupts.lock().unwrap() = 0;

        let mut retired = self.release_devices();
        retired.extend(self.root_hub.lock().unwrap().cancel_polls());
        self.scratchpads.lock().unwrap().take();
        self.dev_ctx.lock().unwrap().clear(0);

        control.state = ControllerState::Reset;
        control.initialized = false;
        drop(control);

        deliver(retired);
        info!("XHCI uninitialized.");
        result
    }

    pub fn state(&self) -> ControllerState {
        self.control.lock().unwrap().state
    }

    /// Enters the control-plane section. Fails unless the controller is running.
    fn control_plane(&self) -> Result<MutexGuard<'_, ControlPlane>> {
        let control = self.control.lock().unwrap();
        if control.state != ControllerState::Running {
            debug!("control plane operation while the xHC is {:?}", control.state);
            return Err(XhciError::InvalidState);
        }
        Ok(control)
    }

    /// Issues one command and waits for its completion, decoded.
    fn command<F>(&self, fill: F) -> Result<CommandCompletion>
    where
        F: FnOnce(&mut Trb, bool),
    {
        self.cmd
            .execute(fill, || self.dbs.lock().unwrap()[0].write(0))
    }

    fn ring_doorbell(&self, slot: u8, dci: u8, stream_id: u16) {
        self.dbs.lock().unwrap()[usize::from(slot)].ring_endpoint(dci, stream_id);
    }

    fn device_slot(&self, slot: u8) -> Result<MutexGuard<'_, Option<Device<N>>>> {
        if slot == 0 {
            return Err(XhciError::BadSlot);
        }
        self.devices
            .get(usize::from(slot))
            .map(|device| device.lock().unwrap())
            .ok_or(XhciError::BadSlot)
    }

    fn lookup_slot(&self, function_address: u8) -> Result<u8> {
        self.addresses
            .lock()
            .unwrap()
            .get(function_address)
            .ok_or(XhciError::NoSuchDevice(function_address))
    }

    /// Whether `function_address` belongs to one of the emulated root hubs.
    pub fn is_root_hub(&self, function_address: u8) -> bool {
        self.root_hub
            .lock()
            .unwrap()
            .personality_for_address(function_address)
            .is_some()
    }

    /// Queues an I/O request. The request is handed back through its callback when it retires;
    /// a request rejected here is dropped without its callback being called.
    ///
    /// Requests addressed to a root hub are answered by the emulated hub. SET_ADDRESS on a
    /// default control pipe becomes an Address Device command and blocks until it completes.
    pub fn submit_irp(&self, irp: Irp) -> Result<()> {
        let pipe = irp.pipe;
        let personality = self
            .root_hub
            .lock()
            .unwrap()
            .personality_for_address(pipe.function_address);
        if let Some(personality) = personality {
            let retired = {
                let mut root_hub = self.root_hub.lock().unwrap();
                let mut ports = self.ports.lock().unwrap();
                root_hub.handle_irp(personality, irp, &mut **ports)?
            };
            if let Some(retirement) = retired {
                retirement.deliver();
            }
            return Ok(());
        }

        // Nothing may reach the doorbells of a halted controller.
        self.control_plane().map(drop)?;
        let slot = self.lookup_slot(pipe.function_address)?;
        if pipe.is_default_control() {
            if let Some(setup) = irp.setup {
                if setup.request == SetupReq::SetAddress as u8
                    && setup.req_ty() == ReqType::Standard as u8
                {
                    return self.address_device(slot, irp);
                }
            }
        }

        let dci = dci(pipe.endpoint_address);
        {
            let mut guard = self.device_slot(slot)?;
            let endpoint = guard
                .as_mut()
                .and_then(|device| device.endpoint_mut(dci))
                .ok_or(XhciError::NoSuchEndpoint(pipe.endpoint_address))?;
            let max_packet = endpoint.max_packet;

            match endpoint.ty {
                EndpointTy::Isoch => return Err(XhciError::InvalidRequest),
                EndpointTy::Ctrl => {
                    let ring = endpoint.ring_mut().ok_or(XhciError::InvalidRequest)?;
                    let _masked = InterruptGuard::new(self);
                    queue_control(ring, irp, max_packet)?;
                }
                EndpointTy::Bulk | EndpointTy::Interrupt => {
                    let ring = endpoint.ring_mut().ok_or_else(|| {
                        warn!("{} has streams, use submit_stream", pipe);
                        XhciError::InvalidRequest
                    })?;
                    let _masked = InterruptGuard::new(self);
                    queue_bulk(ring, irp, max_packet, 0)?;
                }
            }
        }

        self.ring_doorbell(slot, dci, 0);
        Ok(())
    }

    /// Queues a bulk request on one stream of a stream-capable endpoint.
    pub fn submit_stream(&self, irp: Irp, stream_id: u16) -> Result<()> {
        let pipe = irp.pipe;
        if stream_id == 0 {
            return Err(XhciError::InvalidArgument("stream id 0"));
        }
        if self.is_root_hub(pipe.function_address) {
            return Err(XhciError::InvalidRequest);
        }
        self.control_plane().map(drop)?;
        let slot = self.lookup_slot(pipe.function_address)?;
        let dci = dci(pipe.endpoint_address);
        {
            let mut guard = self.device_slot(slot)?;
            let endpoint = guard
                .as_mut()
                .and_then(|device| device.endpoint_mut(dci))
                .ok_or(XhciError::NoSuchEndpoint(pipe.endpoint_address))?;
            let max_packet = endpoint.max_packet;
            let table = match &mut endpoint.transfer {
                Transfer::Streams(table) => table,
                Transfer::Ring(_) => return Err(XhciError::InvalidRequest),
            };
            let ring = table
                .ring_mut(stream_id)
                .ok_or(XhciError::InvalidArgument("stream id"))?;
            let _masked = InterruptGuard::new(self);
            queue_bulk(ring, irp, max_packet, stream_id)?;
        }

        self.ring_doorbell(slot, dci, stream_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::usb::{DescriptorKind, IrpStatus, PipeId, Setup};
    use crate::xhci::ring::Cursor;
    use crate::xhci::trb::{TrbCompletionCode, TrbType};

    const OP_BASE: usize = 0x20;
    const DB_OFFSET: usize = 0x1000;
    const RTS_OFFSET: usize = 0x2000;
    const MMIO_SIZE: usize = 0x10000;

    /// A register block with the capability fields filled in and everything else zero: the
    /// controller is ready, halted and reports no extended capabilities.
    fn mmio(hcc_params1: u32) -> usize {
        let memory: &'static mut [u32] = Box::leak(vec![0u32; MMIO_SIZE / 4].into_boxed_slice());
        memory[0] = OP_BASE as u32 | (0x0095 << 16);
        memory[1] = 8 | (4 << 24);
        memory[4] = hcc_params1;
        memory[5] = DB_OFFSET as u32;
        memory[6] = RTS_OFFSET as u32;
        memory.as_mut_ptr() as usize
    }

    fn controller() -> Xhci<CONTEXT_32> {
        unsafe { Xhci::<CONTEXT_32>::new(mmio(0), XhciConfig::default()).unwrap() }
    }

    fn retired() -> (Arc<Mutex<Vec<Irp>>>, impl FnOnce(Irp) + Send + 'static) {
        let done = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&done);
        (done, move |irp| sink.lock().unwrap().push(irp))
    }

    #[test]
    fn waits_are_bounded() {
        assert_eq!(wait_until("ready", || true), Ok(()));
        assert_eq!(wait_until("never", || false), Err(XhciError::Timeout("never")));
    }

    #[test]
    fn context_size_must_match() {
        let address = mmio(capability::HCC_PARAMS1_CSZ_BIT);
        assert!(matches!(
            unsafe { Xhci::<CONTEXT_32>::new(address, XhciConfig::default()) },
            Err(XhciError::Fatal(_))
        ));
        let xhci = unsafe { Xhci::<CONTEXT_64>::new(address, XhciConfig::default()) }.unwrap();
        assert_eq!(xhci.devices.len(), 9);
    }

    #[test]
    fn control_plane_requires_a_running_controller() {
        let xhci = controller();
        assert_eq!(xhci.state(), ControllerState::Reset);
        assert_eq!(xhci.start(), Err(XhciError::InvalidState));
        assert_eq!(
            xhci.initialize_device(DeviceInfo::root(crate::usb::UsbSpeed::High, 1)).unwrap_err(),
            XhciError::InvalidState
        );
        // Stopping a controller that never ran is a no-op.
        assert_eq!(xhci.stop(), Ok(()));
    }

    #[test]
    fn requests_need_a_running_controller() {
        let xhci = controller();
        let (done, callback) = retired();
        let irp = Irp::new(PipeId::new(3, 0x81), vec![0; 8]).on_complete(callback);
        assert_eq!(xhci.submit_irp(irp), Err(XhciError::InvalidState));
        let irp = Irp::new(PipeId::new(3, 0x81), vec![0; 8]);
        assert_eq!(xhci.submit_stream(irp, 1), Err(XhciError::InvalidState));
        assert!(done.lock().unwrap().is_empty());

        // The root hub answers whatever the controller state.
        let setup = Setup::get_descriptor(DescriptorKind::Device as u8, 0, 0, 18);
        let (done, callback) = retired();
        xhci.submit_irp(Irp::control(PipeId::new(1, 0), setup).on_complete(callback))
            .unwrap();
        assert_eq!(done.lock().unwrap().len(), 1);
    }

    #[test]
    fn unknown_addresses_and_slots() {
        let xhci = controller();
        assert!(xhci.is_root_hub(1));
        assert!(xhci.is_root_hub(2));
        assert!(!xhci.is_root_hub(3));
        assert_eq!(xhci.lookup_slot(5), Err(XhciError::NoSuchDevice(5)));
        assert!(xhci.device_slot(0).is_err());
        assert!(xhci.device_slot(9).is_err());
        assert!(xhci.device_slot(8).unwrap().is_none());

        let irp = Irp::new(PipeId::new(5, 0x81), vec![0; 8]);
        assert_eq!(xhci.submit_irp(irp), Err(XhciError::InvalidState));
        let irp = Irp::new(PipeId::new(1, 0x81), vec![0; 8]);
        assert_eq!(xhci.submit_stream(irp, 1), Err(XhciError::InvalidRequest));
    }

    #[test]
    fn root_hub_requests_complete_inline() {
        let xhci = controller();
        let (done, callback) = retired();
        let setup = Setup::get_descriptor(DescriptorKind::Device as u8, 0, 0, 18);
        let irp = Irp::control(PipeId::new(2, 0), setup).on_complete(callback);
        xhci.submit_irp(irp).unwrap();

        let done = done.lock().unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, IrpStatus::Success);
        assert_eq!(done[0].actual_length, 18);
        assert_eq!(done[0].buffer[1], DescriptorKind::Device as u8);
        // bcdUSB 2.0 for the High-Speed personality.
        assert_eq!(&done[0].buffer[2..4], &[0x00, 0x02]);
    }

    #[test]
    fn port_change_event_completes_a_status_poll() {
        let xhci = controller();
        let (done, callback) = retired();
        let irp = Irp::new(PipeId::new(2, 0x81), vec![0; 2]).on_complete(callback);
        xhci.submit_irp(irp).unwrap();
        assert!(done.lock().unwrap().is_empty());

        let expected_erdp = {
            let mut event_ring = xhci.event_ring.lock().unwrap();
            let mut event = Trb::default();
            event.set(
                3 << 24,
                (TrbCompletionCode::Success as u32) << 24,
                ((TrbType::PortStatusChange as u32) << 10) | 1,
            );
            *event_ring.ring.trb_mut(Cursor::new(0, 0)) = event;
            event_ring.ring.physical(Cursor::new(0, 1))
        };
        xhci.handle_events();

        let done = done.lock().unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].actual_length, 2);
        assert_eq!(&done[0].buffer[..], &[1 << 3, 0]);
        assert_eq!(xhci.run.lock().unwrap().ints[0].erdp(), expected_erdp);
    }

    #[test]
    fn interrupt_masking_nests() {
        let xhci = controller();
        let enabled = |xhci: &Xhci<CONTEXT_32>| {
            let iman = xhci.run.lock().unwrap().ints[0].iman.read();
            let inte = xhci.op.lock().unwrap().usb_cmd.readf(USB_CMD_INTE);
            (iman & runtime::IMAN_IE != 0, inte)
        };

        xhci.disable_interrupts();
        {
            let _masked = InterruptGuard::new(&xhci);
            assert_eq!(enabled(&xhci), (false, false));
        }
        assert_eq!(enabled(&xhci), (false, false));
        xhci.enable_interrupts();
        assert_eq!(enabled(&xhci), (true, true));
        assert_eq!(
            xhci.run.lock().unwrap().ints[0].imod.read(),
            u32::from(xhci.config.interrupt_moderation)
        );
    }
}
