//! xHCI extended capabilities. Only the Supported Protocol capability is interpreted; it tells
//! which root hub ports speak USB 2 and which speak USB 3.
use std::ops::Range;
use std::ptr::{self, NonNull};

use common::io::{Io, Mmio};
use smallvec::SmallVec;

pub struct ExtendedCapabilitiesIter {
    base: *const u8,
}

impl ExtendedCapabilitiesIter {
    /// # Safety
    /// `base` must point at the first extended capability of a mapped controller, or be null.
    pub unsafe fn new(base: *const u8) -> Self {
        Self { base }
    }
}

impl Iterator for ExtendedCapabilitiesIter {
    type Item = (NonNull<u8>, u8); // pointer, capability id

    fn next(&mut self) -> Option<Self::Item> {
        unsafe {
            let current = NonNull::new(self.base as *mut u8)?;

            let reg = current.cast::<Mmio<u32>>().as_ref().read();
            let capability_id = (reg & 0xFF) as u8;
            let next_rel_in_dwords = ((reg & 0xFF00) >> 8) as u8;

            let next_rel = usize::from(next_rel_in_dwords) << 2;

            self.base = if next_rel != 0 {
                self.base.add(next_rel)
            } else {
                ptr::null()
            };

            Some((current, capability_id))
        }
    }
}

#[repr(u8)]
pub enum CapabilityId {
    // bit 0 is reserved
    UsbLegacySupport = 1,
    SupportedProtocol,
    ExtendedPowerManagement,
    IoVirtualization,
    MessageInterrupt,
    LocalMem,
    // 7-9 are reserved
    UsbDebugCapability = 10,
    // 11-16 are reserved
    ExtendedMessageInterrupt = 17,
}

#[repr(C)]
pub struct SupportedProtoCap {
    a: Mmio<u32>,
    b: Mmio<u32>,
    c: Mmio<u32>,
    d: Mmio<u32>,
}

pub const SUPP_PROTO_CAP_REV_MIN_MASK: u32 = 0x00FF_0000;
pub const SUPP_PROTO_CAP_REV_MIN_SHIFT: u8 = 16;

pub const SUPP_PROTO_CAP_REV_MAJ_MASK: u32 = 0xFF00_0000;
pub const SUPP_PROTO_CAP_REV_MAJ_SHIFT: u8 = 24;

pub const SUPP_PROTO_CAP_COMPAT_PORT_OFF_MASK: u32 = 0x0000_00FF;

pub const SUPP_PROTO_CAP_COMPAT_PORT_CNT_MASK: u32 = 0x0000_FF00;
pub const SUPP_PROTO_CAP_COMPAT_PORT_CNT_SHIFT: u8 = 8;

pub const SUPP_PROTO_CAP_PORT_SLOT_TYPE_MASK: u32 = 0x0000_001F;

impl SupportedProtoCap {
    pub fn rev_minor(&self) -> u8 {
        ((self.a.read() & SUPP_PROTO_CAP_REV_MIN_MASK) >> SUPP_PROTO_CAP_REV_MIN_SHIFT) as u8
    }
    pub fn rev_major(&self) -> u8 {
        ((self.a.read() & SUPP_PROTO_CAP_REV_MAJ_MASK) >> SUPP_PROTO_CAP_REV_MAJ_SHIFT) as u8
    }
    /// "USB " for every protocol defined so far.
    pub fn name_string(&self) -> [u8; 4] {
        u32::to_le_bytes(self.b.read())
    }
    /// First root hub port (1-based) of this protocol.
    pub fn compat_port_offset(&self) -> u8 {
        (self.c.read() & SUPP_PROTO_CAP_COMPAT_PORT_OFF_MASK) as u8
    }
    pub fn compat_port_count(&self) -> u8 {
        ((self.c.read() & SUPP_PROTO_CAP_COMPAT_PORT_CNT_MASK)
            >> SUPP_PROTO_CAP_COMPAT_PORT_CNT_SHIFT) as u8
    }
    pub fn proto_slot_ty(&self) -> u8 {
        (self.d.read() & SUPP_PROTO_CAP_PORT_SLOT_TYPE_MASK) as u8
    }
}

/// A run of root hub ports that share one protocol.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortProtocol {
    pub major: u8,
    pub minor: u8,
    pub slot_type: u8,
    /// 1-based port numbers.
    pub ports: Range<u8>,
}

impl PortProtocol {
    pub fn is_superspeed(&self) -> bool {
        self.major == 3
    }
}

/// Collects the Supported Protocol capabilities of the list starting at `base`.
///
/// # Safety
/// `base` must point at the first extended capability of a mapped controller, or be null.
pub unsafe fn supported_protocols(base: *const u8) -> SmallVec<[PortProtocol; 4]> {
    ExtendedCapabilitiesIter::new(base)
        .filter(|&(_, id)| id == CapabilityId::SupportedProtocol as u8)
        .map(|(pointer, _)| {
            let cap = pointer.cast::<SupportedProtoCap>().as_ref();
            let offset = cap.compat_port_offset();
            PortProtocol {
                major: cap.rev_major(),
                minor: cap.rev_minor(),
                slot_type: cap.proto_slot_ty(),
                ports: offset..offset.saturating_add(cap.compat_port_count()),
            }
        })
        .collect()
}
