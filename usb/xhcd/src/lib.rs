//! The eXtensible Host Controller Interface (XHCI) driver core
//!
//! This crate drives an xHCI host controller on behalf of a generic USB stack: it enumerates
//! devices into controller slots, opens and tears down pipes, and moves I/O requests between the
//! stack and the controller's transfer rings. The glue that maps the controller, routes its
//! interrupt to [xhci::Xhci::isr] and exposes the driver to the rest of the system lives with the
//! embedder.
//!
//! ```ignore
//! common::logger::setup_logging(
//!     "usb",
//!     "host",
//!     "xhcd",
//!     common::logger::output_level(),
//!     common::logger::file_level(),
//! )?;
//! let xhci = unsafe { Xhci::<{ CONTEXT_32 }>::new(bar0, DEFAULT_CONFIG.clone())? };
//! xhci.init()?;
//! xhci.start()?;
//! ```
//!
//! This documentation will refer directly to the relevant standards, which are as follows:
//!
//! - XHCI  - [eXtensible Host Controller Interface for Universal Serial Bus (xHCI) Requirements Specification](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf)
//! - USB2  - [Universal Serial Bus Specification](https://www.usb.org/document-library/usb-20-specification)
//! - USB32 - [Universal Serial Bus 3.2 Specification Revision 1.1](https://usb.org/document-library/usb-32-revision-11-june-2022)

#[macro_use]
extern crate bitflags;

pub mod config;
pub mod error;
pub mod usb;
pub mod xhci;

pub use crate::config::{XhciConfig, DEFAULT_CONFIG};
pub use crate::error::{Result, XhciError};
pub use crate::xhci::{ControllerState, Xhci, CONTEXT_32, CONTEXT_64};

#[cfg(test)]
mod tests {
    use common::logger::{file_level, output_level, setup_logging};

    #[test]
    fn logger_installs_once() {
        assert!(setup_logging("usb", "host", "xhcd", output_level(), file_level()).is_ok());
        log::info!("xhcd test logger installed");
        assert!(setup_logging("usb", "host", "xhcd", output_level(), file_level()).is_err());
    }
}
