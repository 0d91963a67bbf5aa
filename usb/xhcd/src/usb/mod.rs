//! The Universal Serial Bus (USB) Module
//!
//! Types shared between the generic USB stack and the host controller driver: setup packets,
//! endpoint descriptors, hub class constants and the I/O request passed down for every
//! transfer.
//!
//! - USB2  - [Universal Serial Bus Specification](https://www.usb.org/document-library/usb-20-specification)
//! - USB32 - [Universal Serial Bus 3.2 Specification Revision 1.1](https://usb.org/document-library/usb-32-revision-11-june-2022)
pub use self::endpoint::{
    EndpointDescriptor, EndpointTy, SuperSpeedCompanionDescriptor, ENDP_ATTR_TY_MASK,
};
pub use self::hub::*;
pub use self::irp::{Irp, IrpCallback, IrpFlags, IrpStatus, PipeId};
pub use self::setup::{ReqType, Setup, SetupReq};

/// Descriptor types the driver produces or consumes. (See USB32 Table 9-6)
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DescriptorKind {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    BinaryObjectStorage = 15,
    /// USB 2.0 hub class descriptor. (See USB2 11.23.2.1)
    Hub = 0x29,
    /// SuperSpeed hub class descriptor. (See USB32 10.15.2.1)
    SuperSpeedHub = 0x2A,
    SuperSpeedCompanion = 48,
}

/// Bus speed of a device, as reported by the USB stack.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum UsbSpeed {
    Low,
    Full,
    High,
    Super,
}

impl UsbSpeed {
    /// The default control endpoint max packet size before the device descriptor is read.
    pub fn default_max_packet_size(self) -> u16 {
        match self {
            UsbSpeed::Low | UsbSpeed::Full => 8,
            UsbSpeed::High => 64,
            UsbSpeed::Super => 512,
        }
    }
}

/// The function address every device answers to before SET_ADDRESS.
pub const DEFAULT_ADDRESS: u8 = 0;

pub(crate) mod endpoint;
pub(crate) mod hub;
pub(crate) mod irp;
pub(crate) mod setup;
