use common::io::{Mmio, ReadOnly};

/// The capability register block at the start of the controller's MMIO space. (See XHCI 5.3)
///
/// Every field is read-only. The driver reads them once at `init` to size the device slot
/// table, the port array, the scratchpad pool and the root hub descriptors.
#[repr(C)]
pub struct CapabilityRegs {
    /// CAPLENGTH: offset of the operational registers from the base.
    pub len: ReadOnly<Mmio<u8>>,
    _rsvd: ReadOnly<Mmio<u8>>,
    /// HCIVERSION, binary coded decimal (0x0100 for 1.0).
    pub hci_ver: ReadOnly<Mmio<u16>>,
    /// HCSPARAMS1: max slots (7:0), max interrupters (18:8), max ports (31:24).
    pub hcs_params1: ReadOnly<Mmio<u32>>,
    /// HCSPARAMS2: ERST max (7:4), scratchpad count high (25:21), SPR (26), scratchpad count
    /// low (31:27).
    pub hcs_params2: ReadOnly<Mmio<u32>>,
    /// HCSPARAMS3: U1 device exit latency (7:0), U2 device exit latency (31:16).
    pub hcs_params3: ReadOnly<Mmio<u32>>,
    /// HCCPARAMS1: AC64 (0), CSZ (2), PPC (3), PIND (4), MaxPSASize (15:12), xECP (31:16).
    pub hcc_params1: ReadOnly<Mmio<u32>>,
    /// DBOFF: doorbell array offset, dword aligned.
    pub db_offset: ReadOnly<Mmio<u32>>,
    /// RTSOFF: runtime register offset, 32 byte aligned.
    pub rts_offset: ReadOnly<Mmio<u32>>,
    pub hcc_params2: ReadOnly<Mmio<u32>>,
}

pub const HCS_PARAMS1_MAX_SLOTS_MASK: u32 = 0x0000_00FF;
pub const HCS_PARAMS1_MAX_INTRS_MASK: u32 = 0x0007_FF00;
pub const HCS_PARAMS1_MAX_INTRS_SHIFT: u8 = 8;
pub const HCS_PARAMS1_MAX_PORTS_MASK: u32 = 0xFF00_0000;
pub const HCS_PARAMS1_MAX_PORTS_SHIFT: u8 = 24;

pub const HCS_PARAMS2_ERST_MAX_MASK: u32 = 0x0000_00F0;
pub const HCS_PARAMS2_ERST_MAX_SHIFT: u8 = 4;
pub const HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_HI_MASK: u32 = 0x03E0_0000;
pub const HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_HI_SHIFT: u8 = 21;
pub const HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_LO_MASK: u32 = 0xF800_0000;
pub const HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_LO_SHIFT: u8 = 27;

pub const HCS_PARAMS3_U1_LATENCY_MASK: u32 = 0x0000_00FF;
pub const HCS_PARAMS3_U2_LATENCY_SHIFT: u8 = 16;

pub const HCC_PARAMS1_AC64_BIT: u32 = 1 << 0;
pub const HCC_PARAMS1_CSZ_BIT: u32 = 1 << 2;
pub const HCC_PARAMS1_PPC_BIT: u32 = 1 << 3;
pub const HCC_PARAMS1_PIND_BIT: u32 = 1 << 4;
pub const HCC_PARAMS1_MAXPSASIZE_MASK: u32 = 0xF000; // 15:12
pub const HCC_PARAMS1_MAXPSASIZE_SHIFT: u8 = 12;
pub const HCC_PARAMS1_XECP_MASK: u32 = 0xFFFF_0000;
pub const HCC_PARAMS1_XECP_SHIFT: u8 = 16;

pub const HCC_PARAMS2_CIC_BIT: u32 = 1 << 5;

/// HCI 0.95 controllers may come without Supported Protocol capabilities.
pub const HCI_VERSION_0_95: u16 = 0x0095;

impl CapabilityRegs {
    pub fn hci_version(&self) -> u16 {
        self.hci_ver.read()
    }

    pub fn max_slots(&self) -> u8 {
        (self.hcs_params1.read() & HCS_PARAMS1_MAX_SLOTS_MASK) as u8
    }
    pub fn max_interrupters(&self) -> u16 {
        ((self.hcs_params1.read() & HCS_PARAMS1_MAX_INTRS_MASK) >> HCS_PARAMS1_MAX_INTRS_SHIFT)
            as u16
    }
    pub fn max_ports(&self) -> u8 {
        ((self.hcs_params1.read() & HCS_PARAMS1_MAX_PORTS_MASK) >> HCS_PARAMS1_MAX_PORTS_SHIFT)
            as u8
    }

    /// Event ring segment table entries are limited to 2^ERSTMax.
    pub fn erst_max(&self) -> u8 {
        ((self.hcs_params2.read() & HCS_PARAMS2_ERST_MAX_MASK) >> HCS_PARAMS2_ERST_MAX_SHIFT) as u8
    }
    pub fn max_scratchpad_bufs(&self) -> u16 {
        let params = self.hcs_params2.read();
        let lo = (params & HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_LO_MASK)
            >> HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_LO_SHIFT;
        let hi = (params & HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_HI_MASK)
            >> HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_HI_SHIFT;
        (lo | (hi << 5)) as u16
    }

    /// Worst case U1 exit latency in microseconds.
    pub fn u1_device_exit_latency(&self) -> u8 {
        (self.hcs_params3.read() & HCS_PARAMS3_U1_LATENCY_MASK) as u8
    }
    /// Worst case U2 exit latency in microseconds.
    pub fn u2_device_exit_latency(&self) -> u16 {
        (self.hcs_params3.read() >> HCS_PARAMS3_U2_LATENCY_SHIFT) as u16
    }

    pub fn ac64(&self) -> bool {
        self.hcc_params1.readf(HCC_PARAMS1_AC64_BIT)
    }
    /// Whether contexts are 64 bytes wide.
    pub fn csz(&self) -> bool {
        self.hcc_params1.readf(HCC_PARAMS1_CSZ_BIT)
    }
    /// Port power control.
    pub fn ppc(&self) -> bool {
        self.hcc_params1.readf(HCC_PARAMS1_PPC_BIT)
    }
    /// Port indicators.
    pub fn pind(&self) -> bool {
        self.hcc_params1.readf(HCC_PARAMS1_PIND_BIT)
    }
    pub fn max_psa_size(&self) -> u8 {
        ((self.hcc_params1.read() & HCC_PARAMS1_MAXPSASIZE_MASK) >> HCC_PARAMS1_MAXPSASIZE_SHIFT)
            as u8
    }
    pub fn ext_caps_ptr_in_dwords(&self) -> u16 {
        ((self.hcc_params1.read() & HCC_PARAMS1_XECP_MASK) >> HCC_PARAMS1_XECP_SHIFT) as u16
    }
    pub fn cic(&self) -> bool {
        self.hcc_params2.readf(HCC_PARAMS2_CIC_BIT)
    }
}
