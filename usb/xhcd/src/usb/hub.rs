//! Hub class constants. (See USB2 11.24 and USB32 10.16)

/// Port feature selectors.
pub const PORT_CONNECTION: u16 = 0;
pub const PORT_ENABLE: u16 = 1;
pub const PORT_SUSPEND: u16 = 2;
pub const PORT_OVER_CURRENT: u16 = 3;
pub const PORT_RESET: u16 = 4;
pub const PORT_LINK_STATE: u16 = 5;
pub const PORT_POWER: u16 = 8;
pub const C_PORT_CONNECTION: u16 = 16;
pub const C_PORT_ENABLE: u16 = 17;
pub const C_PORT_SUSPEND: u16 = 18;
pub const C_PORT_OVER_CURRENT: u16 = 19;
pub const C_PORT_RESET: u16 = 20;
pub const PORT_U1_TIMEOUT: u16 = 23;
pub const PORT_U2_TIMEOUT: u16 = 24;
pub const C_PORT_LINK_STATE: u16 = 25;
pub const C_PORT_CONFIG_ERROR: u16 = 26;
pub const C_BH_PORT_RESET: u16 = 29;

/// Link states used with PORT_LINK_STATE.
pub const LINK_STATE_U0: u8 = 0;
pub const LINK_STATE_U3: u8 = 3;
pub const LINK_STATE_RESUME: u8 = 15;

bitflags! {
    /// wPortStatus/wPortChange as returned by GET_STATUS, change bits in the upper half.
    #[derive(Default)]
    pub struct HubPortStatus: u32 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
        /// SuperSpeed link state, bits 5-8.
        const SS_LINK_STATE = 0xF << 5;
        const POWER = 1 << 8;
        const LOW_SPEED = 1 << 9;
        /// SuperSpeed hubs report port power here instead.
        const SS_POWER = 1 << 9;
        const HIGH_SPEED = 1 << 10;

        const C_CONNECTION = 1 << 16;
        const C_ENABLE = 1 << 17;
        const C_SUSPEND = 1 << 18;
        const C_OVER_CURRENT = 1 << 19;
        const C_RESET = 1 << 20;
        const C_BH_RESET = 1 << 21;
        const C_LINK_STATE = 1 << 22;
    }
}
