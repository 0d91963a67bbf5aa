use thiserror::Error;

use crate::xhci::trb::TrbCompletionCode;

/// Errors reported by the host controller driver.
///
/// The first group mirrors the decoded outcome of a controller command; the rest are raised by
/// the driver itself.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum XhciError {
    #[error("controller is out of internal resources")]
    NoMemory,
    #[error("not enough bandwidth for the endpoint configuration")]
    BandwidthError,
    #[error("no device slots available")]
    NoSlotsAvailable,
    #[error("device slot is not enabled")]
    BadSlot,
    #[error("controller rejected a context parameter")]
    ParameterInvalid,
    #[error("command is invalid for the current context state")]
    ContextStateError,
    #[error("fatal controller error: {0}")]
    Fatal(&'static str),

    #[error("ring is full")]
    RingFull,
    #[error("requested stream count exceeds the controller's limit")]
    StreamLimit,
    #[error("no slot could be assigned to the device")]
    SlotUnavailable,
    #[error("out of DMA memory")]
    OutOfMemory,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("request is not supported")]
    InvalidRequest,
    #[error("no device with function address {0}")]
    NoSuchDevice(u8),
    #[error("endpoint {0:#04X} is not open")]
    NoSuchEndpoint(u8),
    #[error("port is disabled")]
    PortDisabled,
    #[error("operation is invalid in the current controller state")]
    InvalidState,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

pub type Result<T, E = XhciError> = std::result::Result<T, E>;

impl From<std::io::Error> for XhciError {
    fn from(err: std::io::Error) -> Self {
        log::error!("DMA allocation failed: {}", err);
        XhciError::OutOfMemory
    }
}

impl XhciError {
    /// Decodes the completion code of a command completion event.
    pub fn check_command(code: u8) -> Result<()> {
        match code {
            c if c == TrbCompletionCode::Success as u8 => Ok(()),
            c if c == TrbCompletionCode::Resource as u8 => Err(XhciError::NoMemory),
            c if c == TrbCompletionCode::Bandwidth as u8 => Err(XhciError::BandwidthError),
            c if c == TrbCompletionCode::NoSlotsAvailable as u8 => Err(XhciError::NoSlotsAvailable),
            c if c == TrbCompletionCode::SlotNotEnabled as u8 => Err(XhciError::BadSlot),
            c if c == TrbCompletionCode::Parameter as u8 => Err(XhciError::ParameterInvalid),
            c if c == TrbCompletionCode::ContextState as u8 => Err(XhciError::ContextStateError),
            _ => Err(XhciError::Fatal("unexpected command completion code")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes() {
        assert_eq!(XhciError::check_command(1), Ok(()));
        assert_eq!(XhciError::check_command(7), Err(XhciError::NoMemory));
        assert_eq!(XhciError::check_command(8), Err(XhciError::BandwidthError));
        assert_eq!(XhciError::check_command(9), Err(XhciError::NoSlotsAvailable));
        assert_eq!(XhciError::check_command(11), Err(XhciError::BadSlot));
        assert_eq!(XhciError::check_command(17), Err(XhciError::ParameterInvalid));
        assert_eq!(XhciError::check_command(19), Err(XhciError::ContextStateError));
        assert!(matches!(XhciError::check_command(5), Err(XhciError::Fatal(_))));
        assert!(matches!(XhciError::check_command(0), Err(XhciError::Fatal(_))));
    }
}
