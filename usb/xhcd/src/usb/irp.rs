use std::fmt;

use super::endpoint::ENDP_ADDR_DIR_IN;
use super::Setup;

bitflags! {
    pub struct IrpFlags: u32 {
        /// A short IN transfer completes with [IrpStatus::Success].
        const ACCEPT_SHORT = 1 << 0;
        /// Terminate an OUT transfer that is a multiple of the max packet size with a zero
        /// length packet.
        const ZERO_LENGTH_PACKET = 1 << 1;
        /// The buffer may be handed to the controller as is, without a bounce copy.
        const DMA_COHERENT = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IrpStatus {
    Pending,
    Success,
    Stall,
    DataUnderrun,
    DeviceNotResponding,
    Cancelled,
}

/// Identifies the pipe a request travels on.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PipeId {
    pub function_address: u8,
    pub endpoint_address: u8,
}

impl PipeId {
    pub const fn new(function_address: u8, endpoint_address: u8) -> Self {
        Self {
            function_address,
            endpoint_address,
        }
    }
    pub const fn is_default_control(&self) -> bool {
        self.endpoint_address & 0x7F == 0
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{:02X}", self.function_address, self.endpoint_address)
    }
}

/// Called exactly once, from the event dispatcher, when the request retires. It must not block.
pub type IrpCallback = Box<dyn FnOnce(Irp) + Send + 'static>;

/// One I/O request from the USB stack.
///
/// The driver owns the request while it is in flight and hands it back through the callback,
/// with [Irp::status] and [Irp::actual_length] filled in.
pub struct Irp {
    pub pipe: PipeId,
    /// Present for control transfers.
    pub setup: Option<Setup>,
    pub buffer: Vec<u8>,
    /// Bytes to transfer; at most `buffer.len()`.
    pub length: usize,
    pub flags: IrpFlags,
    pub status: IrpStatus,
    pub actual_length: usize,
    callback: Option<IrpCallback>,
}

impl Irp {
    pub fn new(pipe: PipeId, buffer: Vec<u8>) -> Self {
        Self {
            pipe,
            setup: None,
            length: buffer.len(),
            buffer,
            flags: IrpFlags::empty(),
            status: IrpStatus::Pending,
            actual_length: 0,
            callback: None,
        }
    }

    /// A control request; the data stage length comes from the setup packet.
    pub fn control(pipe: PipeId, setup: Setup) -> Self {
        let length = usize::from(setup.length);
        let mut irp = Self::new(pipe, vec![0; length]);
        irp.setup = Some(setup);
        irp
    }

    pub fn with_flags(mut self, flags: IrpFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Irp) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Direction of the data stage.
    pub fn is_in(&self) -> bool {
        match self.setup {
            Some(setup) => setup.is_device_to_host(),
            None => self.pipe.endpoint_address & ENDP_ADDR_DIR_IN != 0,
        }
    }

    /// Retires the request and hands it back to its owner.
    pub(crate) fn complete(mut self, status: IrpStatus, actual_length: usize) {
        self.actual_length = actual_length;
        self.status = if status == IrpStatus::DataUnderrun
            && self.flags.contains(IrpFlags::ACCEPT_SHORT)
        {
            IrpStatus::Success
        } else {
            status
        };
        log::trace!(
            "IRP on {} done: {:?}, {} of {} bytes",
            self.pipe,
            self.status,
            self.actual_length,
            self.length
        );
        if let Some(callback) = self.callback.take() {
            callback(self);
        }
    }
}

impl fmt::Debug for Irp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Irp")
            .field("pipe", &self.pipe)
            .field("setup", &self.setup)
            .field("length", &self.length)
            .field("flags", &self.flags)
            .field("status", &self.status)
            .field("actual_length", &self.actual_length)
            .finish()
    }
}
