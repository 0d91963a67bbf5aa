use common::io::{Io, Mmio};

/// One interrupter register set. (See XHCI 5.5.2)
#[repr(C)]
pub struct Interrupter {
    pub iman: Mmio<u32>,
    pub imod: Mmio<u32>,
    pub erstsz: Mmio<u32>,
    _rsvd: Mmio<u32>,
    pub erstba_low: Mmio<u32>,
    pub erstba_high: Mmio<u32>,
    pub erdp_low: Mmio<u32>,
    pub erdp_high: Mmio<u32>,
}

/// Interrupt pending, write one to clear.
pub const IMAN_IP: u32 = 1 << 0;
pub const IMAN_IE: u32 = 1 << 1;

/// Event handler busy, write one to clear.
pub const ERDP_EHB: u32 = 1 << 3;

#[repr(C)]
pub struct RuntimeRegs {
    pub mfindex: Mmio<u32>,
    _rsvd: [Mmio<u32>; 7],
    pub ints: [Interrupter; 1024],
}

impl Interrupter {
    pub fn set_erstba(&mut self, address: u64) {
        self.erstba_low.write(address as u32);
        self.erstba_high.write((address >> 32) as u32);
    }
    /// Writes the dequeue pointer. Setting EHB clears the busy flag.
    pub fn set_erdp(&mut self, address: u64, clear_busy: bool) {
        let busy = if clear_busy { ERDP_EHB } else { 0 };
        self.erdp_low.write(address as u32 | busy);
        self.erdp_high.write((address >> 32) as u32);
    }
    pub fn erdp(&self) -> u64 {
        u64::from(self.erdp_low.read() & !0xF) | (u64::from(self.erdp_high.read()) << 32)
    }
    /// Acknowledges a pending interrupt while keeping IE as is.
    pub fn acknowledge(&mut self) {
        let iman = self.iman.read();
        self.iman.write((iman & IMAN_IE) | IMAN_IP);
    }
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled {
            self.iman.write(IMAN_IE);
        } else {
            // IP is write one to clear, so a pending interrupt is dropped as well.
            self.iman.write(IMAN_IP);
        }
    }
    /// Moderation interval in 250ns units.
    pub fn set_moderation(&mut self, interval: u16) {
        self.imod.write(u32::from(interval));
    }
    pub fn clear(&mut self) {
        self.iman.write(IMAN_IP);
        self.imod.write(0);
        self.erstsz.write(0);
        self.set_erstba(0);
        self.set_erdp(0, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem;

    #[test]
    fn layout() {
        assert_eq!(mem::size_of::<Interrupter>(), 32);
        assert_eq!(mem::size_of::<RuntimeRegs>(), 32 + 32 * 1024);
        let mut int: Interrupter = unsafe { mem::zeroed() };
        int.set_erdp(0x1000, true);
        assert_eq!(int.erdp_low.read(), 0x1000 | ERDP_EHB);
        assert_eq!(int.erdp(), 0x1000);
    }
}
