use plain::Plain;

/// A control transfer SETUP packet. (See USB32 9.3)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Setup {
    pub kind: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

unsafe impl Plain for Setup {}

#[repr(u8)]
pub enum ReqType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetupReq {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    GetState = 0x02,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

impl SetupReq {
    /// Decodes a standard `bRequest`; reserved values give `None`.
    pub fn from_u8(request: u8) -> Option<Self> {
        Some(match request {
            0x00 => SetupReq::GetStatus,
            0x01 => SetupReq::ClearFeature,
            0x02 => SetupReq::GetState,
            0x03 => SetupReq::SetFeature,
            0x05 => SetupReq::SetAddress,
            0x06 => SetupReq::GetDescriptor,
            0x07 => SetupReq::SetDescriptor,
            0x08 => SetupReq::GetConfiguration,
            0x09 => SetupReq::SetConfiguration,
            0x0A => SetupReq::GetInterface,
            0x0B => SetupReq::SetInterface,
            0x0C => SetupReq::SynchFrame,
            _ => return None,
        })
    }
}

pub const USB_SETUP_DIR_BIT: u8 = 1 << 7;
pub const USB_SETUP_REQ_TY_MASK: u8 = 0x60;
pub const USB_SETUP_REQ_TY_SHIFT: u8 = 5;
pub const USB_SETUP_RECIPIENT_MASK: u8 = 0x1F;

/// Recipient value for a hub port (the "other" recipient).
pub const USB_SETUP_RECIPIENT_OTHER: u8 = 3;

impl Setup {
    /// Parses the eight bytes of a SETUP packet.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        plain::from_bytes::<Self>(bytes).ok().copied()
    }

    /// The packet as the immediate data of a Setup Stage TRB.
    pub fn to_u64(self) -> u64 {
        u64::from(self.kind)
            | (u64::from(self.request) << 8)
            | (u64::from(self.value) << 16)
            | (u64::from(self.index) << 32)
            | (u64::from(self.length) << 48)
    }

    pub const fn is_device_to_host(&self) -> bool {
        self.kind & USB_SETUP_DIR_BIT != 0
    }
    pub const fn req_ty(&self) -> u8 {
        (self.kind & USB_SETUP_REQ_TY_MASK) >> USB_SETUP_REQ_TY_SHIFT
    }
    pub const fn req_recipient(&self) -> u8 {
        self.kind & USB_SETUP_RECIPIENT_MASK
    }

    pub const fn set_address(address: u16) -> Self {
        Self {
            kind: 0b0000_0000,
            request: SetupReq::SetAddress as u8,
            value: address,
            index: 0,
            length: 0,
        }
    }

    pub const fn get_descriptor(kind: u8, index: u8, language: u16, length: u16) -> Self {
        Self {
            kind: 0b1000_0000,
            request: SetupReq::GetDescriptor as u8,
            value: ((kind as u16) << 8) | (index as u16),
            index: language,
            length,
        }
    }

    /// GET_STATUS addressed to a hub port.
    pub const fn get_port_status(port: u8) -> Self {
        Self {
            kind: 0b1010_0011,
            request: SetupReq::GetStatus as u8,
            value: 0,
            index: port as u16,
            length: 4,
        }
    }

    pub const fn set_port_feature(feature: u16, port: u8, selector: u8) -> Self {
        Self {
            kind: 0b0010_0011,
            request: SetupReq::SetFeature as u8,
            value: feature,
            index: ((selector as u16) << 8) | port as u16,
            length: 0,
        }
    }

    pub const fn clear_port_feature(feature: u16, port: u8) -> Self {
        Self {
            kind: 0b0010_0011,
            request: SetupReq::ClearFeature as u8,
            value: feature,
            index: port as u16,
            length: 0,
        }
    }
}
