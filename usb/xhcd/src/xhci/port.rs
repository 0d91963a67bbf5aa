use common::io::{Io, Mmio};

// RO - read-only
// ROS - read-only sticky
// RW - read/write
// RWS - read/write sticky
// RW1CS - read/write-1-to-clear sticky
// RW1S - read/write-1-to-set
// Sticky register values may preserve values through chip hardware reset

bitflags! {
    pub struct PortFlags: u32 {
        const CCS = 1 << 0; // ROS
        const PED = 1 << 1; // RW1CS
        const RSVD_2 = 1 << 2; // RsvdZ
        const OCA = 1 << 3; // RO
        const PR =  1 << 4; // RW1S
        const PLS_0 = 1 << 5; // RWS
        const PLS_1 = 1 << 6; // RWS
        const PLS_2 = 1 << 7; // RWS
        const PLS_3 = 1 << 8; // RWS
        const PP =  1 << 9; // RWS
        const SPEED_0 =  1 << 10; // ROS
        const SPEED_1 =  1 << 11; // ROS
        const SPEED_2 =  1 << 12; // ROS
        const SPEED_3 =  1 << 13; // ROS
        const PIC_AMB = 1 << 14; // RWS
        const PIC_GRN = 1 << 15; // RWS
        const LWS = 1 << 16; // RW
        const CSC = 1 << 17; // RW1CS
        const PEC = 1 << 18; // RW1CS
        const WRC = 1 << 19; // RW1CS
        const OCC = 1 << 20; // RW1CS
        const PRC = 1 << 21; // RW1CS
        const PLC = 1 << 22; // RW1CS
        const CEC = 1 << 23; // RW1CS
        const CAS = 1 << 24; // RO
        const WCE = 1 << 25; // RWS
        const WDE = 1 << 26; // RWS
        const WOE = 1 << 27; // RWS
        const RSVD_28 = 1 << 28; // RsvdZ
        const RSVD_29 = 1 << 29; // RsvdZ
        const DR =  1 << 30; // RO
        const WPR = 1 << 31; // RW1S

        const PLS = Self::PLS_0.bits | Self::PLS_1.bits | Self::PLS_2.bits | Self::PLS_3.bits;
        const SPEED = Self::SPEED_0.bits | Self::SPEED_1.bits | Self::SPEED_2.bits | Self::SPEED_3.bits;
        const PIC = Self::PIC_AMB.bits | Self::PIC_GRN.bits;
        /// All write-one-to-clear change bits.
        const CHANGES = Self::CSC.bits | Self::PEC.bits | Self::WRC.bits | Self::OCC.bits
            | Self::PRC.bits | Self::PLC.bits | Self::CEC.bits;
    }
}

pub const PORT_PLS_SHIFT: u8 = 5;
pub const PORT_SPEED_SHIFT: u8 = 10;
pub const PORT_PIC_SHIFT: u8 = 14;

pub const PORTPMSC_U1_TIMEOUT_MASK: u32 = 0x0000_00FF;
pub const PORTPMSC_U2_TIMEOUT_SHIFT: u8 = 8;
pub const PORTPMSC_U2_TIMEOUT_MASK: u32 = 0x0000_FF00;

/// Port indicator colors, as written to PORTSC.PIC.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PortIndicator {
    Off = 0,
    Amber = 1,
    Green = 2,
}

/// A port register set. (See XHCI 5.4.8)
///
/// The register type is a parameter so that request handling can run against a simulated port.
#[repr(C)]
pub struct Port<R: Io<Value = u32> = Mmio<u32>> {
    // This has write one to clear fields, do not expose it, handle writes carefully!
    portsc: R,
    pub portpmsc: R,
    pub portli: R,
    pub porthlpmc: R,
}

impl<R: Io<Value = u32>> Port<R> {
    #[cfg(test)]
    pub(crate) fn from_registers(portsc: R, portpmsc: R, portli: R, porthlpmc: R) -> Self {
        Self {
            portsc,
            portpmsc,
            portli,
            porthlpmc,
        }
    }
    #[cfg(test)]
    pub(crate) fn portsc_mut(&mut self) -> &mut R {
        &mut self.portsc
    }

    pub fn read(&self) -> u32 {
        self.portsc.read()
    }

    /// Port link state.
    pub fn state(&self) -> u8 {
        ((self.read() & PortFlags::PLS.bits()) >> PORT_PLS_SHIFT) as u8
    }

    /// Protocol speed ID.
    pub fn speed(&self) -> u8 {
        ((self.read() & PortFlags::SPEED.bits()) >> PORT_SPEED_SHIFT) as u8
    }

    pub fn flags(&self) -> PortFlags {
        PortFlags::from_bits_truncate(self.read())
    }

    // Read only preserved flags
    pub fn flags_preserved(&self) -> PortFlags {
        // RO(S) and RW(S) bits should be preserved
        // RW1S and RW1CS bits should not
        let preserved = PortFlags::CCS
            | PortFlags::OCA
            | PortFlags::PLS
            | PortFlags::PP
            | PortFlags::SPEED
            | PortFlags::PIC
            | PortFlags::WCE
            | PortFlags::WDE
            | PortFlags::WOE
            | PortFlags::DR;

        self.flags() & preserved
    }

    /// Writes one to the given RW1C bits and leaves every other bit as it is.
    pub fn clear(&mut self, flags: PortFlags) {
        debug_assert!((PortFlags::CHANGES | PortFlags::PED).contains(flags));
        self.portsc.write((self.flags_preserved() | flags).bits());
    }

    /// Sets RW1S or RWS bits, such as PR or PP.
    pub fn set(&mut self, flags: PortFlags) {
        self.portsc.write((self.flags_preserved() | flags).bits());
    }

    pub fn set_pr(&mut self) {
        self.set(PortFlags::PR);
    }

    /// Requests a link state transition.
    pub fn set_link_state(&mut self, state: u8) {
        let value = (self.flags_preserved() - PortFlags::PLS).bits()
            | (u32::from(state & 0xF) << PORT_PLS_SHIFT)
            | PortFlags::LWS.bits();
        self.portsc.write(value);
    }

    pub fn set_indicator(&mut self, indicator: PortIndicator) {
        let value = (self.flags_preserved() - PortFlags::PIC).bits()
            | (u32::from(indicator as u8) << PORT_PIC_SHIFT);
        self.portsc.write(value);
    }

    pub fn set_u1_timeout(&mut self, timeout: u8) {
        let pmsc = self.portpmsc.read() & !PORTPMSC_U1_TIMEOUT_MASK;
        self.portpmsc.write(pmsc | u32::from(timeout));
    }

    pub fn set_u2_timeout(&mut self, timeout: u8) {
        let pmsc = self.portpmsc.read() & !PORTPMSC_U2_TIMEOUT_MASK;
        self.portpmsc
            .write(pmsc | (u32::from(timeout) << PORTPMSC_U2_TIMEOUT_SHIFT));
    }
}

#[cfg(test)]
pub(crate) mod sim {
    use super::PortFlags;
    use common::io::Io;

    /// A register in ordinary memory. In PORTSC mode it follows the access rules of the real
    /// register: change bits are write one to clear, PR completes immediately and the link state
    /// only changes together with LWS.
    pub(crate) struct SimRegister {
        pub value: u32,
        portsc: bool,
    }

    impl SimRegister {
        pub(crate) fn portsc(value: PortFlags) -> Self {
            Self {
                value: value.bits(),
                portsc: true,
            }
        }
        pub(crate) fn plain(value: u32) -> Self {
            Self {
                value,
                portsc: false,
            }
        }
        /// Hardware side of a status change.
        pub(crate) fn raise(&mut self, flags: PortFlags) {
            self.value |= flags.bits();
        }
    }

    impl Io for SimRegister {
        type Value = u32;

        fn read(&self) -> u32 {
            self.value
        }

        fn write(&mut self, value: u32) {
            if !self.portsc {
                self.value = value;
                return;
            }
            let written = PortFlags::from_bits_truncate(value);
            let mut next = PortFlags::from_bits_truncate(self.value);

            next -= written & (PortFlags::CHANGES | PortFlags::PED);

            let rw = PortFlags::PP | PortFlags::PIC | PortFlags::WCE | PortFlags::WDE | PortFlags::WOE;
            next = (next - rw) | (written & rw);

            if written.contains(PortFlags::LWS) {
                next = (next - PortFlags::PLS) | (written & PortFlags::PLS);
            }
            if written.contains(PortFlags::PR) {
                next |= PortFlags::PRC | PortFlags::PED;
            }
            self.value = next.bits();
        }
    }
}
