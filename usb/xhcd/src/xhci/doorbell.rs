use common::io::{Mmio, WriteOnly};

#[repr(C)]
pub struct Doorbell(WriteOnly<Mmio<u32>>);

/// Doorbell target of the default control endpoint.
pub const DOORBELL_CONTROL_TARGET: u32 = 1;

impl Doorbell {
    pub fn write(&mut self, data: u32) {
        self.0.write(data);
    }

    /// Rings the doorbell of an endpoint (DCI) on a stream, 0 when the endpoint has no streams.
    pub fn ring_endpoint(&mut self, dci: u8, stream_id: u16) {
        self.write(u32::from(dci) | (u32::from(stream_id) << 16));
    }
}
