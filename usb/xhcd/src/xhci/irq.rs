//! Event dispatch for the primary interrupter.
//!
//! The interrupt context drains the event ring and hands every event to its consumer: transfer
//! events retire TDs, command completions wake the waiting issuer and port status changes go to
//! the root hub. Completion callbacks run once no device lock is held.
use common::io::Io;
use log::{error, trace, warn};
use smallvec::SmallVec;

use super::context::EndpointState;
use super::device::{Endpoint, Transfer};
use super::event::{route_event, EventRoute};
use super::operational::USB_CMD_INTE;
use super::transfer::{complete_td, TdOutcome, TransferRing};
use super::trb::{Trb, TrbCompletionCode};
use super::Xhci;
use crate::usb::EndpointTy;

impl<const N: usize> Xhci<N> {
    /// The interrupt service routine: acknowledges the interrupt and handles every pending
    /// event.
    pub fn isr(&self) {
        self.op.lock().unwrap().clear_eint();
        self.run.lock().unwrap().ints[0].acknowledge();
        self.handle_events();
    }

    /// Takes every event the controller has posted, moves the dequeue pointer past them and
    /// dispatches them in order.
    pub fn handle_events(&self) {
        let events = {
            let mut event_ring = self.event_ring.lock().unwrap();
            let mut events = SmallVec::<[Trb; 16]>::new();
            while let Some(event) = event_ring.next_event() {
                events.push(event);
            }
            let erdp = event_ring.erdp();
            self.run.lock().unwrap().ints[0].set_erdp(erdp, true);
            events
        };

        for (index, event) in events.iter().enumerate() {
            trace!("Found event TRB {}: {}", index, event);
            self.dispatch(event);
        }
    }

    fn dispatch(&self, event: &Trb) {
        match route_event(event) {
            EventRoute::Transfer {
                slot,
                dci,
                stream_id,
            } => self.transfer_event(slot, dci, stream_id, event),
            EventRoute::Command(completion) => self.cmd.complete(completion),
            EventRoute::PortStatusChange(port_id) => self.port_event(port_id),
            EventRoute::HostController(code) if code == TrbCompletionCode::EventRingFull as u8 => {
                warn!("Host Controller Event: event ring full")
            }
            EventRoute::HostController(code) => {
                error!("Host Controller Event with completion code {}", code)
            }
            EventRoute::Other(trb_type) => trace!("ignoring event of type {}", trb_type),
        }
    }

    fn transfer_event(&self, slot: u8, dci: u8, stream_id: Option<u16>, event: &Trb) {
        let (outcome, stream) = {
            let mut guard = match self.device_slot(slot) {
                Ok(guard) => guard,
                Err(_) => {
                    warn!("transfer event for slot {} past MaxSlots", slot);
                    return;
                }
            };
            let endpoint = match guard.as_mut().and_then(|device| device.endpoint_mut(dci)) {
                Some(endpoint) => endpoint,
                None => {
                    warn!("transfer event for closed endpoint {} of slot {}", dci, slot);
                    return;
                }
            };
            if endpoint.ty == EndpointTy::Isoch {
                return;
            }
            let (outcome, stream) = match transfer_ring(endpoint, stream_id, event) {
                Some((ring, stream)) => (complete_td(ring, event), stream),
                None => {
                    warn!(
                        "transfer event {} matches no ring of endpoint {} of slot {}",
                        event, dci, slot
                    );
                    return;
                }
            };
            if event.completion_code() == TrbCompletionCode::Stall as u8 {
                endpoint.state = EndpointState::Halted;
            }
            (outcome, stream)
        };

        match outcome {
            TdOutcome::Retired(retirement) => retirement.deliver(),
            TdOutcome::Continued => self.ring_doorbell(slot, dci, stream),
            TdOutcome::Idle => (),
        }
    }

    fn port_event(&self, port_id: u8) {
        let retired = {
            let mut root_hub = self.root_hub.lock().unwrap();
            let mut ports = self.ports.lock().unwrap();
            root_hub.port_change(port_id, &mut **ports)
        };
        if let Some(retirement) = retired {
            retirement.deliver();
        }
    }

    /// Masks the primary interrupter. Calls nest; each must be paired with
    /// [Xhci::enable_interrupts].
    pub fn disable_interrupts(&self) {
        let mut depth = self.interrupts.lock().unwrap();
        self.run.lock().unwrap().ints[0].set_enabled(false);
        self.op.lock().unwrap().usb_cmd.writef(USB_CMD_INTE, false);
        *depth += 1;
    }

    /// Undoes one [Xhci::disable_interrupts]; the interrupter is unmasked when the last one is
    /// undone.
    pub fn enable_interrupts(&self) {
        let mut depth = self.interrupts.lock().unwrap();
        *depth = depth.saturating_sub(1);
        if *depth == 0 {
            {
                let mut run = self.run.lock().unwrap();
                run.ints[0].set_moderation(self.config.interrupt_moderation);
                run.ints[0].set_enabled(true);
            }
            self.op.lock().unwrap().usb_cmd.writef(USB_CMD_INTE, true);
        }
    }
}

/// The ring a transfer event completes on, and its stream id. Events from an Event Data TRB
/// name their stream; any other event on a stream endpoint is matched by its TRB pointer.
fn transfer_ring<'a>(
    endpoint: &'a mut Endpoint,
    stream_id: Option<u16>,
    event: &Trb,
) -> Option<(&'a mut TransferRing, u16)> {
    match &mut endpoint.transfer {
        Transfer::Ring(ring) => Some((ring, 0)),
        Transfer::Streams(table) => match stream_id {
            Some(stream_id) => table.ring_mut(stream_id).map(|ring| (ring, stream_id)),
            None => {
                let address = event.read_data();
                table
                    .rings
                    .iter_mut()
                    .enumerate()
                    .find(|(_, ring)| ring.ring.position_of(address).is_some())
                    .map(|(index, ring)| (ring, index as u16 + 1))
            }
        },
    }
}

/// Keeps the primary interrupter masked while alive.
pub struct InterruptGuard<'a, const N: usize> {
    xhci: &'a Xhci<N>,
}

impl<'a, const N: usize> InterruptGuard<'a, N> {
    pub fn new(xhci: &'a Xhci<N>) -> Self {
        xhci.disable_interrupts();
        Self { xhci }
    }
}

impl<'a, const N: usize> Drop for InterruptGuard<'a, N> {
    fn drop(&mut self) {
        self.xhci.enable_interrupts();
    }
}
