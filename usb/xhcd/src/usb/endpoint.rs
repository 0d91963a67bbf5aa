use plain::Plain;

/// The descriptor for a USB Endpoint. (See USB32 9.6.6)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub kind: u8,
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

unsafe impl Plain for EndpointDescriptor {}

/// Mask that is ANDed to the [EndpointDescriptor].attributes buffer to get the endpoint type.
pub const ENDP_ATTR_TY_MASK: u8 = 0x3;

pub const ENDP_ADDR_DIR_IN: u8 = 0x80;
pub const ENDP_ADDR_NUM_MASK: u8 = 0x0F;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EndpointTy {
    Ctrl = 0,
    Isoch = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl EndpointDescriptor {
    pub fn new(address: u8, ty: EndpointTy, max_packet_size: u16, interval: u8) -> Self {
        Self {
            length: 7,
            kind: 5,
            address,
            attributes: ty as u8,
            max_packet_size,
            interval,
        }
    }

    pub fn ty(&self) -> EndpointTy {
        match self.attributes & ENDP_ATTR_TY_MASK {
            0 => EndpointTy::Ctrl,
            1 => EndpointTy::Isoch,
            2 => EndpointTy::Bulk,
            _ => EndpointTy::Interrupt,
        }
    }
    pub fn is_in(&self) -> bool {
        self.address & ENDP_ADDR_DIR_IN != 0
    }
    pub fn number(&self) -> u8 {
        self.address & ENDP_ADDR_NUM_MASK
    }
    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size
    }
}

/// SuperSpeed endpoint companion. (See USB32 9.6.7)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SuperSpeedCompanionDescriptor {
    pub length: u8,
    pub kind: u8,
    pub max_burst: u8,
    pub attributes: u8,
    pub bytes_per_interval: u16,
}
unsafe impl Plain for SuperSpeedCompanionDescriptor {}

impl SuperSpeedCompanionDescriptor {
    pub fn new(max_burst: u8, attributes: u8) -> Self {
        Self {
            length: 6,
            kind: 48,
            max_burst,
            attributes,
            bytes_per_interval: 0,
        }
    }

    /// For bulk endpoints, log2 of the number of streams supported (0 means no streams).
    pub fn max_streams_exp(&self) -> u8 {
        self.attributes & 0x1F
    }
}
