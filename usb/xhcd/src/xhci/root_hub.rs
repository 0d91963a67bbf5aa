//! Root hub emulation.
//!
//! The controller's ports are presented to the USB stack as two hubs: a SuperSpeed hub for the
//! ports of USB 3 protocol capabilities and a High-Speed hub for the rest. Hub class requests
//! are answered from static descriptor tables and by translating port features into PORTSC
//! reads and writes. (See USB2 11.24 and USB32 10.16)
use std::thread;
use std::time::Duration;

use common::io::Io;
use log::{debug, error, info, trace, warn};

use super::capability::{CapabilityRegs, HCI_VERSION_0_95};
use super::extended::PortProtocol;
use super::port::{Port, PortFlags, PortIndicator, PORT_PLS_SHIFT, PORT_SPEED_SHIFT};
use super::transfer::Retirement;
use crate::config::XhciConfig;
use crate::error::{Result, XhciError};
use crate::usb::setup::USB_SETUP_RECIPIENT_OTHER;
use crate::usb::{self, HubPortStatus, Irp, IrpStatus, ReqType, Setup, SetupReq};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Personality {
    SuperSpeed,
    HighSpeed,
}

impl Personality {
    fn index(self) -> usize {
        match self {
            Personality::SuperSpeed => 0,
            Personality::HighSpeed => 1,
        }
    }
}

/// Protocol speed IDs of the default speed mapping. (See XHCI 7.2.1)
const PSI_LOW: u8 = 2;
const PSI_HIGH: u8 = 3;
const PSI_SUPER: u8 = 4;

const PORT_LINK_STATE_U3: u8 = 3;

/// Port ids that fit the status change bitmap.
const MAX_REPORTED_PORT: u8 = 15;

const SS_DEVICE_DESCRIPTOR: [u8; 18] = [
    18, 1, 0x00, 0x03, 0x09, 0x00, 0x03, 0x09, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1,
];
const HS_DEVICE_DESCRIPTOR: [u8; 18] = [
    18, 1, 0x00, 0x02, 0x09, 0x00, 0x00, 0x08, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1,
];

/// Configuration, interface, status change endpoint and its SuperSpeed companion.
const SS_CONFIG_DESCRIPTOR: [u8; 31] = [
    9, 2, 31, 0, 1, 1, 0, 0xC0, 0, // configuration
    9, 4, 0, 0, 1, 9, 0, 0, 1, // interface
    7, 5, 0x81, 3, 0x10, 0, 0x0F, // endpoint
    6, 48, 0, 0, 2, 0, // companion
];
const HS_CONFIG_DESCRIPTOR: [u8; 25] = [
    9, 2, 25, 0, 1, 1, 0, 0xC0, 0, // configuration
    9, 4, 0, 0, 1, 9, 0, 0, 0, // interface
    7, 5, 0x81, 3, 0x10, 0, 0x0F, // endpoint
];

const BOS_LEN: usize = 42;
const BOS_U1_EXIT_LATENCY: usize = 19;
const BOS_U2_EXIT_LATENCY: usize = 20;

fn bos_descriptor(u1_exit_latency: u8, u2_exit_latency: u16) -> [u8; BOS_LEN] {
    let mut bos = [
        5, 15, BOS_LEN as u8, 0, 3, // BOS
        7, 16, 2, 2, 0, 0, 0, // USB 2.0 extension, LPM
        10, 16, 3, 0, 12, 0, 3, 0, 0, 0, // SuperSpeed USB device capability
        20, 16, 4, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // container ID
    ];
    bos[BOS_U1_EXIT_LATENCY] = u1_exit_latency;
    bos[BOS_U2_EXIT_LATENCY..BOS_U2_EXIT_LATENCY + 2]
        .copy_from_slice(&u2_exit_latency.to_le_bytes());
    bos
}

/// What the hub descriptors and BOS are built from.
#[derive(Clone, Copy, Debug)]
pub struct RootHubParams {
    pub max_ports: u8,
    pub hci_version: u16,
    /// Port power switching.
    pub ppc: bool,
    /// Port indicators.
    pub pind: bool,
    pub u1_exit_latency: u8,
    pub u2_exit_latency: u16,
}

impl RootHubParams {
    pub fn from_capabilities(cap: &CapabilityRegs) -> Self {
        Self {
            max_ports: cap.max_ports(),
            hci_version: cap.hci_version(),
            ppc: cap.ppc(),
            pind: cap.pind(),
            u1_exit_latency: cap.u1_device_exit_latency(),
            u2_exit_latency: cap.u2_device_exit_latency(),
        }
    }

    fn hub_characteristics(&self) -> u8 {
        let mut characteristics = 0;
        if self.ppc {
            characteristics |= 0x01;
        }
        if self.pind {
            characteristics |= 0x80;
        }
        characteristics
    }

    fn ss_hub_descriptor(&self) -> [u8; 12] {
        [
            12,
            usb::DescriptorKind::SuperSpeedHub as u8,
            self.max_ports,
            self.hub_characteristics(),
            0,
            1,
            0,
            0,
            0,
            0,
            0,
            0,
        ]
    }

    fn hs_hub_descriptor(&self) -> [u8; 11] {
        [
            11,
            usb::DescriptorKind::Hub as u8,
            self.max_ports,
            self.hub_characteristics(),
            0,
            1,
            0,
            0,
            0,
            0xFF,
            0xFF,
        ]
    }
}

/// The status change endpoint of one personality: a request waiting for a change, or changes
/// waiting for a request.
#[derive(Default)]
struct StatusPoll {
    pending: Option<Irp>,
    changes: u32,
}

pub struct RootHub {
    addresses: [u8; 2],
    /// Personality of each port, indexed by port id - 1.
    personalities: Vec<Personality>,
    slot_types: Vec<u8>,
    /// Without protocol capabilities the personality follows the speed of the connected device.
    detect_speed: bool,
    ss_hub: [u8; 12],
    hs_hub: [u8; 11],
    bos: [u8; BOS_LEN],
    polls: [StatusPoll; 2],
}

impl RootHub {
    pub fn new(config: &XhciConfig, params: RootHubParams, protocols: &[PortProtocol]) -> Result<Self> {
        if protocols.is_empty() && params.hci_version != HCI_VERSION_0_95 {
            error!("no supported protocol capabilities on an xHC version {:X}", params.hci_version);
            return Err(XhciError::Fatal("no supported protocol capability"));
        }

        let count = usize::from(params.max_ports);
        let mut personalities = vec![Personality::HighSpeed; count];
        let mut slot_types = vec![0; count];
        for protocol in protocols {
            let personality = if protocol.is_superspeed() {
                Personality::SuperSpeed
            } else {
                Personality::HighSpeed
            };
            for port in protocol.ports.clone() {
                match usize::from(port).checked_sub(1).filter(|&index| index < count) {
                    Some(index) => {
                        personalities[index] = personality;
                        slot_types[index] = protocol.slot_type;
                    }
                    None => warn!("USB {}.{} protocol names port {} past MaxPorts", protocol.major, protocol.minor, port),
                }
            }
        }

        Ok(Self {
            addresses: [config.root_hub_address, config.usb2_root_hub_address],
            personalities,
            slot_types,
            detect_speed: protocols.is_empty(),
            ss_hub: params.ss_hub_descriptor(),
            hs_hub: params.hs_hub_descriptor(),
            bos: bos_descriptor(params.u1_exit_latency, params.u2_exit_latency),
            polls: Default::default(),
        })
    }

    pub fn personality_for_address(&self, function_address: u8) -> Option<Personality> {
        if function_address == self.addresses[0] {
            Some(Personality::SuperSpeed)
        } else if function_address == self.addresses[1] {
            Some(Personality::HighSpeed)
        } else {
            None
        }
    }

    pub fn personality_of(&self, port_id: u8) -> Option<Personality> {
        let index = usize::from(port_id).checked_sub(1)?;
        self.personalities.get(index).copied()
    }

    /// Slot type for Enable Slot, from the protocol capability covering the port.
    pub fn slot_type(&self, port_id: u8) -> u8 {
        usize::from(port_id)
            .checked_sub(1)
            .and_then(|index| self.slot_types.get(index))
            .copied()
            .unwrap_or(0)
    }

    /// Turns every port indicator green and logs the port layout.
    pub fn set_indicators<R: Io<Value = u32>>(&self, ports: &mut [Port<R>]) {
        for (index, port) in ports.iter_mut().enumerate() {
            port.set_indicator(PortIndicator::Green);
            let personality = match self.personalities.get(index) {
                Some(Personality::SuperSpeed) => "SuperSpeed",
                _ => "High-Speed",
            };
            info!(
                "Port {} is a {} port in link state {}: {:?}",
                index + 1,
                personality,
                port.state(),
                port.flags()
            );
        }
    }

    /// Handles a request addressed to the root hub. A completed request is returned for the
    /// caller to deliver; a status poll with nothing to report is kept until a port changes.
    pub fn handle_irp<R: Io<Value = u32>>(
        &mut self,
        personality: Personality,
        mut irp: Irp,
        ports: &mut [Port<R>],
    ) -> Result<Option<Retirement>> {
        if !irp.pipe.is_default_control() {
            let poll = &mut self.polls[personality.index()];
            if poll.changes != 0 {
                let bitmap = poll.changes.to_le_bytes();
                poll.changes = 0;
                let len = write_data(&mut irp, &bitmap);
                return Ok(Some(Retirement::new(irp, IrpStatus::Success, len)));
            }
            if poll.pending.is_some() {
                warn!("{:?} root hub already has a status poll pending", personality);
                return Err(XhciError::InvalidState);
            }
            trace!("{:?} root hub status poll pending", personality);
            poll.pending = Some(irp);
            return Ok(None);
        }

        let setup = irp
            .setup
            .ok_or(XhciError::InvalidArgument("control request without a setup packet"))?;
        let length = irp.length.min(irp.buffer.len());
        for byte in irp.buffer[..length].iter_mut() {
            *byte = 0;
        }
        let len = self.control(personality, &setup, &mut irp.buffer[..length], ports)?;
        Ok(Some(Retirement::new(irp, IrpStatus::Success, len)))
    }

    fn control<R: Io<Value = u32>>(
        &mut self,
        personality: Personality,
        setup: &Setup,
        data: &mut [u8],
        ports: &mut [Port<R>],
    ) -> Result<usize> {
        let request = setup.request;
        if request > SetupReq::SynchFrame as u8 {
            return Err(XhciError::InvalidArgument("hub request"));
        }
        match SetupReq::from_u8(request) {
            Some(SetupReq::GetStatus) => self.get_status(personality, setup, data, ports),
            Some(SetupReq::ClearFeature) => {
                self.clear_feature(personality, setup, ports)?;
                Ok(0)
            }
            Some(SetupReq::SetFeature) => {
                self.set_feature(personality, setup, ports)?;
                Ok(0)
            }
            Some(SetupReq::GetDescriptor) => self.get_descriptor(personality, setup, data),
            Some(SetupReq::GetState)
            | Some(SetupReq::SetAddress)
            | Some(SetupReq::GetConfiguration)
            | Some(SetupReq::SetConfiguration) => Ok(0),
            _ => {
                debug!("{:?} root hub rejects request {:#04X}", personality, request);
                Err(XhciError::InvalidRequest)
            }
        }
    }

    fn get_status<R: Io<Value = u32>>(
        &self,
        personality: Personality,
        setup: &Setup,
        data: &mut [u8],
        ports: &mut [Port<R>],
    ) -> Result<usize> {
        if setup.req_recipient() != USB_SETUP_RECIPIENT_OTHER {
            // Hub and device status are all zero.
            return Ok(data.len().min(4));
        }
        let port = port_for(setup, ports)?;
        let status = port_status(personality, port.flags());
        let bytes = status.bits().to_le_bytes();
        let len = data.len().min(bytes.len());
        data[..len].copy_from_slice(&bytes[..len]);
        Ok(len)
    }

    fn clear_feature<R: Io<Value = u32>>(
        &self,
        personality: Personality,
        setup: &Setup,
        ports: &mut [Port<R>],
    ) -> Result<()> {
        if setup.req_recipient() != USB_SETUP_RECIPIENT_OTHER {
            return Ok(());
        }
        let port = port_for(setup, ports)?;
        let feature = setup.value;
        let change = match feature {
            usb::C_PORT_CONNECTION => PortFlags::CSC,
            usb::C_PORT_ENABLE => PortFlags::PEC,
            usb::C_PORT_OVER_CURRENT => PortFlags::OCC,
            usb::C_PORT_RESET => PortFlags::PRC,
            usb::C_PORT_LINK_STATE | usb::C_PORT_SUSPEND => PortFlags::PLC,
            usb::C_BH_PORT_RESET => PortFlags::WRC,
            usb::C_PORT_CONFIG_ERROR => PortFlags::CEC,
            usb::PORT_ENABLE => PortFlags::PED,
            usb::PORT_SUSPEND if personality == Personality::HighSpeed => {
                port.set_link_state(usb::LINK_STATE_U0);
                return Ok(());
            }
            _ => {
                debug!("{:?} root hub ignores ClearFeature({})", personality, feature);
                return Ok(());
            }
        };
        port.clear(change);
        Ok(())
    }

    fn set_feature<R: Io<Value = u32>>(
        &self,
        personality: Personality,
        setup: &Setup,
        ports: &mut [Port<R>],
    ) -> Result<()> {
        if setup.req_recipient() != USB_SETUP_RECIPIENT_OTHER {
            return Ok(());
        }
        let index = setup.index;
        let selector = (index >> 8) as u8;
        let port = port_for(setup, ports)?;
        let feature = setup.value;
        match feature {
            usb::PORT_LINK_STATE => link_state(port, selector)?,
            usb::PORT_SUSPEND if personality == Personality::HighSpeed => {
                link_state(port, usb::LINK_STATE_U3)?
            }
            usb::PORT_U1_TIMEOUT => port.set_u1_timeout(selector),
            usb::PORT_U2_TIMEOUT => port.set_u2_timeout(selector),
            usb::PORT_RESET => {
                port.set_pr();
                thread::sleep(Duration::from_millis(10));
            }
            usb::PORT_POWER => {
                port.set(PortFlags::PP);
                thread::sleep(Duration::from_millis(20));
            }
            _ => debug!("{:?} root hub ignores SetFeature({})", personality, feature),
        }
        Ok(())
    }

    fn get_descriptor(&self, personality: Personality, setup: &Setup, data: &mut [u8]) -> Result<usize> {
        let descriptor: &[u8] = if setup.req_ty() == ReqType::Class as u8 {
            match personality {
                Personality::SuperSpeed => &self.ss_hub[..],
                Personality::HighSpeed => &self.hs_hub[..],
            }
        } else {
            let value = setup.value;
            let kind = (value >> 8) as u8;
            match (kind, personality) {
                (k, Personality::SuperSpeed) if k == usb::DescriptorKind::Device as u8 => {
                    &SS_DEVICE_DESCRIPTOR[..]
                }
                (k, Personality::HighSpeed) if k == usb::DescriptorKind::Device as u8 => {
                    &HS_DEVICE_DESCRIPTOR[..]
                }
                (k, Personality::SuperSpeed) if k == usb::DescriptorKind::Configuration as u8 => {
                    &SS_CONFIG_DESCRIPTOR[..]
                }
                (k, Personality::HighSpeed) if k == usb::DescriptorKind::Configuration as u8 => {
                    &HS_CONFIG_DESCRIPTOR[..]
                }
                (k, _) if k == usb::DescriptorKind::BinaryObjectStorage as u8 => &self.bos[..],
                _ => {
                    debug!("{:?} root hub has no descriptor of type {}", personality, kind);
                    return Err(XhciError::InvalidRequest);
                }
            }
        };
        let len = data.len().min(descriptor.len());
        data[..len].copy_from_slice(&descriptor[..len]);
        Ok(len)
    }

    /// Handles a Port Status Change event. Returns the status poll it completes, if one was
    /// waiting.
    pub fn port_change<R: Io<Value = u32>>(
        &mut self,
        port_id: u8,
        ports: &mut [Port<R>],
    ) -> Option<Retirement> {
        if port_id == 0 || port_id > MAX_REPORTED_PORT {
            debug!("ignoring status change on port {}", port_id);
            return None;
        }
        let index = usize::from(port_id - 1);
        let port = ports.get_mut(index)?;
        let flags = port.flags();
        trace!("port {} changed: {:?}", port_id, flags);

        if self.detect_speed && flags.contains(PortFlags::CCS) {
            if let Some(personality) = self.personalities.get_mut(index) {
                *personality = if port.speed() >= PSI_SUPER {
                    Personality::SuperSpeed
                } else {
                    Personality::HighSpeed
                };
            }
        }
        let personality = self.personality_of(port_id)?;

        if flags.contains(PortFlags::PLC) && port.state() == usb::LINK_STATE_RESUME {
            debug!("port {} resuming", port_id);
            if personality == Personality::SuperSpeed {
                port.clear(PortFlags::PLC);
            } else {
                thread::sleep(Duration::from_millis(20));
            }
            port.set_link_state(usb::LINK_STATE_U0);
        }

        let report = 1u32 << port_id;
        let poll = &mut self.polls[personality.index()];
        match poll.pending.take() {
            Some(mut irp) => {
                poll.changes = 0;
                let len = write_data(&mut irp, &(report as u16).to_le_bytes());
                Some(Retirement::new(irp, IrpStatus::Success, len))
            }
            None => {
                poll.changes |= report;
                None
            }
        }
    }

    /// Hands back the status polls still waiting, cancelled.
    pub fn cancel_polls(&mut self) -> Vec<Retirement> {
        self.polls
            .iter_mut()
            .filter_map(|poll| {
                poll.changes = 0;
                poll.pending.take()
            })
            .map(|irp| Retirement::new(irp, IrpStatus::Cancelled, 0))
            .collect()
    }
}

fn port_for<'a, R: Io<Value = u32>>(setup: &Setup, ports: &'a mut [Port<R>]) -> Result<&'a mut Port<R>> {
    let index = setup.index;
    let port = (index & 0xFF) as usize;
    port.checked_sub(1)
        .and_then(move |index| ports.get_mut(index))
        .ok_or(XhciError::InvalidArgument("hub port"))
}

fn link_state<R: Io<Value = u32>>(port: &mut Port<R>, state: u8) -> Result<()> {
    if state == usb::LINK_STATE_U3 && !port.flags().contains(PortFlags::PED) {
        return Err(XhciError::PortDisabled);
    }
    port.set_link_state(state);
    thread::sleep(Duration::from_millis(10));
    Ok(())
}

fn write_data(irp: &mut Irp, data: &[u8]) -> usize {
    let len = irp.length.min(irp.buffer.len()).min(data.len());
    irp.buffer[..len].copy_from_slice(&data[..len]);
    len
}

/// Maps PORTSC into the hub class wPortStatus and wPortChange words.
pub fn port_status(personality: Personality, flags: PortFlags) -> HubPortStatus {
    let mut status = HubPortStatus::empty();
    let pairs: &[(PortFlags, HubPortStatus)] = &[
        (PortFlags::CCS, HubPortStatus::CONNECTION),
        (PortFlags::PED, HubPortStatus::ENABLE),
        (PortFlags::OCA, HubPortStatus::OVER_CURRENT),
        (PortFlags::PR, HubPortStatus::RESET),
        (PortFlags::CSC, HubPortStatus::C_CONNECTION),
        (PortFlags::OCC, HubPortStatus::C_OVER_CURRENT),
        (PortFlags::PRC, HubPortStatus::C_RESET),
    ];
    for &(flag, bit) in pairs {
        status.set(bit, flags.contains(flag));
    }

    let link_state = ((flags & PortFlags::PLS).bits() >> PORT_PLS_SHIFT) as u8;
    let speed = ((flags & PortFlags::SPEED).bits() >> PORT_SPEED_SHIFT) as u8;
    match personality {
        Personality::SuperSpeed => {
            status |= HubPortStatus::from_bits_truncate((flags & PortFlags::PLS).bits());
            status.set(HubPortStatus::SS_POWER, flags.contains(PortFlags::PP));
            status.set(HubPortStatus::C_LINK_STATE, flags.contains(PortFlags::PLC));
            status.set(HubPortStatus::C_BH_RESET, flags.contains(PortFlags::WRC));
        }
        Personality::HighSpeed => {
            status.set(HubPortStatus::SUSPEND, link_state == PORT_LINK_STATE_U3);
            status.set(HubPortStatus::POWER, flags.contains(PortFlags::PP));
            status.set(HubPortStatus::C_ENABLE, flags.contains(PortFlags::PEC));
            status.set(HubPortStatus::C_SUSPEND, flags.contains(PortFlags::PLC));
            match speed {
                PSI_HIGH => status |= HubPortStatus::HIGH_SPEED,
                PSI_LOW => status |= HubPortStatus::LOW_SPEED,
                // Full speed sets neither bit.
                _ => (),
            }
        }
    }
    status
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::usb::{PipeId, C_PORT_CONNECTION, PORT_POWER, PORT_RESET};
    use crate::xhci::port::sim::SimRegister;

    const PSI_FULL: u8 = 1;
    const SS_ADDRESS: u8 = 1;
    const HS_ADDRESS: u8 = 2;

    fn params() -> RootHubParams {
        RootHubParams {
            max_ports: 4,
            hci_version: 0x0110,
            ppc: true,
            pind: false,
            u1_exit_latency: 0x0A,
            u2_exit_latency: 0x0203,
        }
    }

    fn protocols() -> Vec<PortProtocol> {
        vec![
            PortProtocol {
                major: 2,
                minor: 0,
                slot_type: 0,
                ports: 1..3,
            },
            PortProtocol {
                major: 3,
                minor: 1,
                slot_type: 0,
                ports: 3..5,
            },
        ]
    }

    fn hub() -> RootHub {
        RootHub::new(&XhciConfig::default(), params(), &protocols()).unwrap()
    }

    fn ports(flags: &[PortFlags]) -> Vec<Port<SimRegister>> {
        flags
            .iter()
            .map(|&flags| {
                Port::from_registers(
                    SimRegister::portsc(flags),
                    SimRegister::plain(0),
                    SimRegister::plain(0),
                    SimRegister::plain(0),
                )
            })
            .collect()
    }

    fn control(address: u8, setup: Setup) -> Irp {
        Irp::control(PipeId::new(address, 0), setup)
    }

    fn request(
        hub: &mut RootHub,
        personality: Personality,
        setup: Setup,
        ports: &mut [Port<SimRegister>],
    ) -> Result<Vec<u8>> {
        let address = match personality {
            Personality::SuperSpeed => SS_ADDRESS,
            Personality::HighSpeed => HS_ADDRESS,
        };
        let done = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&done);
        let irp = control(address, setup).on_complete(move |irp| {
            *sink.lock().unwrap() = Some(irp.buffer[..irp.actual_length].to_vec());
        });
        hub.handle_irp(personality, irp, ports)?
            .expect("control requests complete immediately")
            .deliver();
        let data = done.lock().unwrap().take().unwrap();
        Ok(data)
    }

    fn status(data: &[u8]) -> HubPortStatus {
        HubPortStatus::from_bits_truncate(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
    }

    #[test]
    fn personalities() {
        let hub = hub();
        assert_eq!(hub.personality_for_address(SS_ADDRESS), Some(Personality::SuperSpeed));
        assert_eq!(hub.personality_for_address(HS_ADDRESS), Some(Personality::HighSpeed));
        assert_eq!(hub.personality_for_address(3), None);
        assert_eq!(hub.personality_of(1), Some(Personality::HighSpeed));
        assert_eq!(hub.personality_of(4), Some(Personality::SuperSpeed));
        assert_eq!(hub.personality_of(0), None);
        assert_eq!(hub.personality_of(5), None);
    }

    #[test]
    fn protocols_are_required_after_0_95() {
        assert!(matches!(
            RootHub::new(&XhciConfig::default(), params(), &[]),
            Err(XhciError::Fatal(_))
        ));
        let old = RootHubParams {
            hci_version: HCI_VERSION_0_95,
            ..params()
        };
        assert!(RootHub::new(&XhciConfig::default(), old, &[]).is_ok());
    }

    #[test]
    fn connect_change_then_clear() {
        let mut hub = hub();
        let mut ports = ports(&[PortFlags::PP; 4]);
        ports[2]
            .portsc_mut()
            .raise(PortFlags::CCS | PortFlags::CSC | PortFlags::SPEED_2);

        let data = request(
            &mut hub,
            Personality::SuperSpeed,
            Setup::get_port_status(3),
            &mut ports,
        )
        .unwrap();
        assert_eq!(data.len(), 4);
        let first = status(&data);
        assert!(first.contains(HubPortStatus::CONNECTION | HubPortStatus::C_CONNECTION));
        assert!(first.contains(HubPortStatus::SS_POWER));

        request(
            &mut hub,
            Personality::SuperSpeed,
            Setup::clear_port_feature(C_PORT_CONNECTION, 3),
            &mut ports,
        )
        .unwrap();
        let second = status(
            &request(
                &mut hub,
                Personality::SuperSpeed,
                Setup::get_port_status(3),
                &mut ports,
            )
            .unwrap(),
        );
        assert!(second.contains(HubPortStatus::CONNECTION));
        assert!(!second.contains(HubPortStatus::C_CONNECTION));
        assert!(ports[2].flags().contains(PortFlags::PP));
    }

    #[test]
    fn status_layouts() {
        let high = PortFlags::CCS
            | PortFlags::PED
            | PortFlags::PP
            | PortFlags::PLC
            | PortFlags::PEC
            | PortFlags::from_bits_truncate(u32::from(PSI_HIGH) << PORT_SPEED_SHIFT)
            | PortFlags::from_bits_truncate(u32::from(PORT_LINK_STATE_U3) << PORT_PLS_SHIFT);
        let hs = port_status(Personality::HighSpeed, high);
        assert_eq!(
            hs,
            HubPortStatus::CONNECTION
                | HubPortStatus::ENABLE
                | HubPortStatus::SUSPEND
                | HubPortStatus::POWER
                | HubPortStatus::HIGH_SPEED
                | HubPortStatus::C_ENABLE
                | HubPortStatus::C_SUSPEND
        );

        let low = PortFlags::CCS
            | PortFlags::from_bits_truncate(u32::from(PSI_LOW) << PORT_SPEED_SHIFT);
        assert!(port_status(Personality::HighSpeed, low).contains(HubPortStatus::LOW_SPEED));
        let full = PortFlags::CCS
            | PortFlags::from_bits_truncate(u32::from(PSI_FULL) << PORT_SPEED_SHIFT);
        assert!(!port_status(Personality::HighSpeed, full)
            .intersects(HubPortStatus::LOW_SPEED | HubPortStatus::HIGH_SPEED));

        let ss = port_status(
            Personality::SuperSpeed,
            PortFlags::CCS
                | PortFlags::PP
                | PortFlags::PLC
                | PortFlags::WRC
                | PortFlags::PEC
                | PortFlags::from_bits_truncate(u32::from(PORT_LINK_STATE_U3) << PORT_PLS_SHIFT),
        );
        assert_eq!(
            ss.bits(),
            0x1 | (3 << 5) | (1 << 9) | HubPortStatus::C_LINK_STATE.bits() | HubPortStatus::C_BH_RESET.bits()
        );
    }

    #[test]
    fn port_features() {
        let mut hub = hub();
        let mut ports = ports(&[PortFlags::empty(); 4]);

        request(&mut hub, Personality::HighSpeed, Setup::set_port_feature(PORT_POWER, 1, 0), &mut ports).unwrap();
        assert!(ports[0].flags().contains(PortFlags::PP));

        request(&mut hub, Personality::HighSpeed, Setup::set_port_feature(PORT_RESET, 1, 0), &mut ports).unwrap();
        assert!(ports[0].flags().contains(PortFlags::PED | PortFlags::PRC));

        request(
            &mut hub,
            Personality::SuperSpeed,
            Setup::set_port_feature(usb::PORT_U2_TIMEOUT, 3, 0x40),
            &mut ports,
        )
        .unwrap();
        assert_eq!(ports[2].portpmsc.read(), 0x4000);

        assert_eq!(
            request(
                &mut hub,
                Personality::SuperSpeed,
                Setup::set_port_feature(usb::PORT_LINK_STATE, 3, usb::LINK_STATE_U3),
                &mut ports,
            ),
            Err(XhciError::PortDisabled)
        );
        assert_eq!(ports[2].state(), 0);

        assert_eq!(
            request(&mut hub, Personality::HighSpeed, Setup::get_port_status(9), &mut ports),
            Err(XhciError::InvalidArgument("hub port"))
        );
    }

    #[test]
    fn descriptors() {
        let mut hub = hub();
        let mut ports = ports(&[PortFlags::empty(); 4]);
        let device = usb::DescriptorKind::Device as u8;
        let config = usb::DescriptorKind::Configuration as u8;
        let bos = usb::DescriptorKind::BinaryObjectStorage as u8;

        let ss = request(&mut hub, Personality::SuperSpeed, Setup::get_descriptor(device, 0, 0, 64), &mut ports).unwrap();
        assert_eq!(ss.len(), 18);
        assert_eq!(&ss[2..4], &[0x00, 0x03]);
        let hs = request(&mut hub, Personality::HighSpeed, Setup::get_descriptor(device, 0, 0, 8), &mut ports).unwrap();
        assert_eq!(hs, &HS_DEVICE_DESCRIPTOR[..8]);

        let ss = request(&mut hub, Personality::SuperSpeed, Setup::get_descriptor(config, 0, 0, 255), &mut ports).unwrap();
        assert_eq!(ss.len(), 31);
        let hs = request(&mut hub, Personality::HighSpeed, Setup::get_descriptor(config, 0, 0, 255), &mut ports).unwrap();
        assert_eq!(hs.len(), 25);

        let bos = request(&mut hub, Personality::SuperSpeed, Setup::get_descriptor(bos, 0, 0, 255), &mut ports).unwrap();
        assert_eq!(bos.len(), 42);
        assert_eq!(&bos[19..22], &[0x0A, 0x03, 0x02]);

        let mut class = Setup::get_descriptor(usb::DescriptorKind::SuperSpeedHub as u8, 0, 0, 64);
        class.kind = 0b1010_0000;
        let ss_hub = request(&mut hub, Personality::SuperSpeed, class, &mut ports).unwrap();
        assert_eq!(ss_hub, &[12, 0x2A, 4, 0x01, 0, 1, 0, 0, 0, 0, 0, 0]);
        let hs_hub = request(&mut hub, Personality::HighSpeed, class, &mut ports).unwrap();
        assert_eq!(hs_hub.len(), 11);
        assert_eq!(&hs_hub[..4], &[11, 0x29, 4, 0x01]);

        assert_eq!(
            request(&mut hub, Personality::HighSpeed, Setup::get_descriptor(3, 0, 0, 255), &mut ports),
            Err(XhciError::InvalidRequest)
        );
    }

    #[test]
    fn request_table() {
        let mut hub = hub();
        let mut ports = ports(&[PortFlags::empty(); 4]);
        let mut setup = Setup::set_address(5);
        assert_eq!(request(&mut hub, Personality::SuperSpeed, setup, &mut ports).unwrap(), Vec::<u8>::new());
        setup.request = SetupReq::SetConfiguration as u8;
        assert!(request(&mut hub, Personality::SuperSpeed, setup, &mut ports).is_ok());
        setup.request = 4;
        assert_eq!(
            request(&mut hub, Personality::SuperSpeed, setup, &mut ports),
            Err(XhciError::InvalidRequest)
        );
        setup.request = SetupReq::SetInterface as u8;
        assert_eq!(
            request(&mut hub, Personality::SuperSpeed, setup, &mut ports),
            Err(XhciError::InvalidRequest)
        );
        setup.request = 13;
        assert!(matches!(
            request(&mut hub, Personality::SuperSpeed, setup, &mut ports),
            Err(XhciError::InvalidArgument(_))
        ));

        let mut device_status = Setup::get_port_status(0);
        device_status.kind = 0b1000_0000;
        device_status.length = 2;
        assert_eq!(
            request(&mut hub, Personality::HighSpeed, device_status, &mut ports).unwrap(),
            vec![0, 0]
        );
    }

    #[test]
    fn status_polling() {
        let mut hub = hub();
        let mut ports = ports(&[PortFlags::PP; 4]);
        let done = Arc::new(Mutex::new(Vec::new()));

        let poll = |done: &Arc<Mutex<Vec<(u8, Vec<u8>)>>>, address: u8| {
            let sink = Arc::clone(done);
            Irp::new(PipeId::new(address, 0x81), vec![0; 4]).on_complete(move |irp| {
                sink.lock()
                    .unwrap()
                    .push((irp.pipe.function_address, irp.buffer[..irp.actual_length].to_vec()));
            })
        };

        // Changes arrive first and are cached.
        ports[0].portsc_mut().raise(PortFlags::CCS | PortFlags::CSC);
        assert!(hub.port_change(1, &mut ports).is_none());
        ports[1].portsc_mut().raise(PortFlags::CCS | PortFlags::CSC);
        assert!(hub.port_change(2, &mut ports).is_none());
        hub.handle_irp(Personality::HighSpeed, poll(&done, HS_ADDRESS), &mut ports)
            .unwrap()
            .unwrap()
            .deliver();
        assert_eq!(done.lock().unwrap().pop(), Some((HS_ADDRESS, vec![0b110, 0, 0, 0])));

        // The poll arrives first and waits.
        assert!(hub
            .handle_irp(Personality::SuperSpeed, poll(&done, SS_ADDRESS), &mut ports)
            .unwrap()
            .is_none());
        assert_eq!(
            hub.handle_irp(Personality::SuperSpeed, poll(&done, SS_ADDRESS), &mut ports)
                .err(),
            Some(XhciError::InvalidState)
        );
        ports[3].portsc_mut().raise(PortFlags::CCS | PortFlags::CSC);
        hub.port_change(4, &mut ports).unwrap().deliver();
        assert_eq!(done.lock().unwrap().pop(), Some((SS_ADDRESS, vec![0b1_0000, 0])));

        // Nothing is left for the next poll.
        assert!(hub
            .handle_irp(Personality::HighSpeed, poll(&done, HS_ADDRESS), &mut ports)
            .unwrap()
            .is_none());
        let cancelled = hub.cancel_polls();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].status, IrpStatus::Cancelled);
        assert!(hub.port_change(16, &mut ports).is_none());
    }

    #[test]
    fn resume_returns_to_u0() {
        let mut hub = hub();
        let resume = PortFlags::CCS
            | PortFlags::PED
            | PortFlags::PLC
            | PortFlags::from_bits_truncate(u32::from(usb::LINK_STATE_RESUME) << PORT_PLS_SHIFT);
        let mut ports = ports(&[PortFlags::PP, PortFlags::PP, resume, PortFlags::PP]);
        hub.port_change(3, &mut ports);
        assert_eq!(ports[2].state(), usb::LINK_STATE_U0);
        assert!(!ports[2].flags().contains(PortFlags::PLC));
    }

    #[test]
    fn speed_detection_without_protocols() {
        let old = RootHubParams {
            hci_version: HCI_VERSION_0_95,
            ..params()
        };
        let mut hub = RootHub::new(&XhciConfig::default(), old, &[]).unwrap();
        assert_eq!(hub.personality_of(2), Some(Personality::HighSpeed));
        let superspeed = PortFlags::CCS
            | PortFlags::CSC
            | PortFlags::from_bits_truncate(u32::from(PSI_SUPER) << PORT_SPEED_SHIFT);
        let mut ports = ports(&[PortFlags::PP, superspeed, PortFlags::PP, PortFlags::PP]);
        hub.port_change(2, &mut ports);
        assert_eq!(hub.personality_of(2), Some(Personality::SuperSpeed));
        assert_eq!(hub.slot_type(2), 0);
    }
}
