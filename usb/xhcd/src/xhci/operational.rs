use common::io::{Io, Mmio};

/// Operational registers, located CAPLENGTH bytes after the capability registers. (See XHCI 5.4)
#[repr(C)]
pub struct OperationalRegs {
    pub usb_cmd: Mmio<u32>,
    pub usb_sts: Mmio<u32>,
    pub page_size: Mmio<u32>,
    _rsvd: [Mmio<u32>; 2],
    pub dn_ctrl: Mmio<u32>,
    pub crcr_low: Mmio<u32>,
    pub crcr_high: Mmio<u32>,
    _rsvd2: [Mmio<u32>; 4],
    pub dcbaap_low: Mmio<u32>,
    pub dcbaap_high: Mmio<u32>,
    pub config: Mmio<u32>,
}

/// Port register sets start at this offset from the operational base.
pub const OP_PORT_REGS_OFFSET: usize = 0x400;

pub const USB_CMD_RS: u32 = 1 << 0;
pub const USB_CMD_HCRST: u32 = 1 << 1;
pub const USB_CMD_INTE: u32 = 1 << 2;
pub const USB_CMD_HSEE: u32 = 1 << 3;

pub const USB_STS_HCH: u32 = 1 << 0;
pub const USB_STS_HSE: u32 = 1 << 2;
pub const USB_STS_EINT: u32 = 1 << 3;
pub const USB_STS_PCD: u32 = 1 << 4;
pub const USB_STS_CNR: u32 = 1 << 11;
pub const USB_STS_HCE: u32 = 1 << 12;

pub const CRCR_CRR_BIT: u32 = 1 << 3;

pub const OP_CONFIG_MAX_SLOTS_MASK: u32 = 0xFF;
pub const OP_CONFIG_CIE_BIT: u32 = 1 << 9;

impl OperationalRegs {
    pub fn halted(&self) -> bool {
        self.usb_sts.readf(USB_STS_HCH)
    }
    pub fn running(&self) -> bool {
        self.usb_cmd.readf(USB_CMD_RS)
    }
    pub fn set_crcr(&mut self, crcr: u64) {
        self.crcr_low.write(crcr as u32);
        self.crcr_high.write((crcr >> 32) as u32);
    }
    pub fn set_dcbaap(&mut self, dcbaap: u64) {
        self.dcbaap_low.write(dcbaap as u32);
        self.dcbaap_high.write((dcbaap >> 32) as u32);
    }
    pub fn set_max_slots_enabled(&mut self, slots: u8) {
        let config = self.config.read() & !OP_CONFIG_MAX_SLOTS_MASK;
        self.config.write(config | u32::from(slots));
    }
    pub fn max_slots_enabled(&self) -> u8 {
        (self.config.read() & OP_CONFIG_MAX_SLOTS_MASK) as u8
    }
    pub fn set_cie(&mut self, value: bool) {
        self.config.writef(OP_CONFIG_CIE_BIT, value)
    }
    /// Acknowledges the event interrupt; EINT is write one to clear.
    pub fn clear_eint(&mut self) -> bool {
        let status = self.usb_sts.read();
        if status & USB_STS_EINT == USB_STS_EINT {
            self.usb_sts.write(USB_STS_EINT);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem;

    #[test]
    fn layout() {
        assert_eq!(mem::size_of::<OperationalRegs>(), 0x3C);
        let mut regs: OperationalRegs = unsafe { mem::zeroed() };
        regs.set_crcr(0x1_2345_6780 | 1);
        assert_eq!(regs.crcr_low.read(), 0x2345_6781);
        assert_eq!(regs.crcr_high.read(), 1);

        regs.config.write(OP_CONFIG_CIE_BIT);
        regs.set_max_slots_enabled(32);
        assert_eq!(regs.max_slots_enabled(), 32);
        assert!(regs.config.readf(OP_CONFIG_CIE_BIT));
    }
}
