//! Driver tunables.
//!
//! The defaults are embedded from `config.toml` at build time; a caller with its own
//! configuration file parses it with [XhciConfig::from_toml].
use lazy_static::lazy_static;
use serde::Deserialize;

use crate::error::{Result, XhciError};

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct XhciConfig {
    /// TRBs per ring segment. Command and transfer rings spend the last one on a link TRB.
    pub trbs_per_segment: usize,
    /// The largest number of TRBs a growable ring may hold.
    pub ring_max_trbs: usize,
    pub command_ring_segments: usize,
    pub event_ring_segments: usize,
    pub transfer_ring_segments: usize,
    pub stream_ring_segments: usize,
    /// How long a command issuer waits for its completion event.
    pub command_timeout_ms: u64,
    /// IMOD interval, in 250ns units.
    pub interrupt_moderation: u16,
    /// Function address of the SuperSpeed root hub.
    pub root_hub_address: u8,
    /// Function address of the High-Speed root hub.
    pub usb2_root_hub_address: u8,
}

impl Default for XhciConfig {
    fn default() -> Self {
        Self {
            trbs_per_segment: 64,
            ring_max_trbs: 4096,
            command_ring_segments: 1,
            event_ring_segments: 1,
            transfer_ring_segments: 1,
            stream_ring_segments: 1,
            command_timeout_ms: 5000,
            interrupt_moderation: 160,
            root_hub_address: 1,
            usb2_root_hub_address: 2,
        }
    }
}

impl XhciConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|err| {
            log::error!("failed to parse xhcd configuration: {}", err);
            XhciError::InvalidArgument("configuration")
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.trbs_per_segment < 4 || self.trbs_per_segment > 4096 {
            return Err(XhciError::InvalidArgument("trbs_per_segment"));
        }
        if self.ring_max_trbs < self.trbs_per_segment {
            return Err(XhciError::InvalidArgument("ring_max_trbs"));
        }
        if self.command_ring_segments == 0
            || self.event_ring_segments == 0
            || self.transfer_ring_segments == 0
            || self.stream_ring_segments == 0
        {
            return Err(XhciError::InvalidArgument("ring segment count"));
        }
        if self.root_hub_address == 0 || self.root_hub_address > 127 {
            return Err(XhciError::InvalidArgument("root_hub_address"));
        }
        if self.usb2_root_hub_address == 0
            || self.usb2_root_hub_address > 127
            || self.usb2_root_hub_address == self.root_hub_address
        {
            return Err(XhciError::InvalidArgument("usb2_root_hub_address"));
        }
        Ok(())
    }
}

lazy_static! {
    pub static ref DEFAULT_CONFIG: XhciConfig = {
        const TOML: &'static [u8] = include_bytes!("../config.toml");

        toml::from_slice::<XhciConfig>(TOML).expect("Failed to parse internally embedded config file")
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults() {
        assert_eq!(*DEFAULT_CONFIG, XhciConfig::default());
        DEFAULT_CONFIG.validate().unwrap();
    }

    #[test]
    fn partial_override() {
        let config = XhciConfig::from_toml("trbs_per_segment = 16\ncommand_timeout_ms = 50\n")
            .unwrap();
        assert_eq!(config.trbs_per_segment, 16);
        assert_eq!(config.command_timeout_ms, 50);
        assert_eq!(config.ring_max_trbs, 4096);

        assert!(XhciConfig::from_toml("root_hub_address = 0").is_err());
        assert!(XhciConfig::from_toml("usb2_root_hub_address = 1").is_err());
        assert!(XhciConfig::from_toml("trbs_per_segment = \"many\"").is_err());
    }
}
