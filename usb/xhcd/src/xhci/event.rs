use std::sync::atomic::{fence, Ordering};

use common::dma::Dma;
use common::io::{Io, Mmio};
use log::trace;

use super::command::CommandCompletion;
use super::ring::{Cursor, Ring};
use super::trb::{Trb, TrbType};
use crate::error::Result;

/// Event ring segment table entry. (See XHCI 6.5)
#[repr(C)]
pub struct EventRingSte {
    pub address_low: Mmio<u32>,
    pub address_high: Mmio<u32>,
    pub size: Mmio<u16>,
    _rsvd: Mmio<u16>,
    _rsvd2: Mmio<u32>,
}

/// The primary event ring and its segment table.
pub struct EventRing {
    pub ste: Dma<[EventRingSte]>,
    pub ring: Ring,
    /// Segment addresses in table order.
    segments: Vec<u64>,
}

impl EventRing {
    pub fn new(segments: usize, trbs_per_segment: usize) -> Result<EventRing> {
        let ring = Ring::new(segments, trbs_per_segment, false, segments * trbs_per_segment)?;
        let addresses = ring.segment_addresses();
        let mut ste = unsafe { Dma::<[EventRingSte]>::zeroed_slice(addresses.len())?.assume_init() };

        for (entry, &address) in ste.iter_mut().zip(addresses.iter()) {
            entry.address_low.write(address as u32);
            entry.address_high.write((address >> 32) as u32);
            entry.size.write(trbs_per_segment as u16);
        }

        Ok(EventRing {
            ste,
            ring,
            segments: addresses,
        })
    }

    /// Number of segment table entries, for ERSTSZ.
    pub fn erst_size(&self) -> u32 {
        self.ste.len() as u32
    }

    /// The dequeue pointer for ERDP, with the segment index in bits 0-2.
    pub fn erdp(&self) -> u64 {
        let cursor = self.ring.dequeue_cursor();
        let address = self.ring.physical(cursor);
        let segment = self.ring.physical(Cursor::new(cursor.segment, 0));
        let index = self
            .segments
            .iter()
            .position(|&start| start == segment)
            .unwrap_or(0);
        (address & !0xF) | (index as u64 & 0x7)
    }

    pub fn erstba(&self) -> u64 {
        self.ste.physical() as u64
    }

    /// Takes the next event the controller has written, if any.
    pub fn next_event(&mut self) -> Option<Trb> {
        let cursor = self.ring.dequeue_cursor();
        let trb = self.ring.trb(cursor);
        if trb.cycle() != self.ring.cycle {
            return None;
        }
        fence(Ordering::Acquire);
        let event = trb.clone();
        trace!("event {} at {:?}", event, cursor);
        self.ring.advance_dequeue();
        Some(event)
    }

    /// Rewinds the ring to its initial state; the controller must be halted.
    pub fn reset(&mut self) {
        self.ring.reset();
    }
}

/// Where an event goes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventRoute {
    Transfer {
        slot: u8,
        dci: u8,
        /// Set for events produced by an Event Data TRB, whose payload is the stream id.
        stream_id: Option<u16>,
    },
    Command(CommandCompletion),
    PortStatusChange(u8),
    HostController(u8),
    Other(u8),
}

pub fn route_event(event: &Trb) -> EventRoute {
    match event.trb_type() {
        t if t == TrbType::Transfer as u8 => EventRoute::Transfer {
            slot: event.event_slot(),
            dci: event.endpoint_id(),
            stream_id: if event.event_data_bit() {
                Some(event.read_data() as u16)
            } else {
                None
            },
        },
        t if t == TrbType::CommandCompletion as u8 => {
            EventRoute::Command(CommandCompletion::from_event(event))
        }
        t if t == TrbType::PortStatusChange as u8 => {
            EventRoute::PortStatusChange(event.port_status_change_port_id())
        }
        t if t == TrbType::HostController as u8 => {
            EventRoute::HostController(event.completion_code())
        }
        t => EventRoute::Other(t),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xhci::trb::{TrbCompletionCode, TRB_CONTROL_EVENT_DATA_BIT};

    fn event(data: u64, code: TrbCompletionCode, control: u32, cycle: bool) -> Trb {
        let mut trb = Trb::default();
        trb.set(
            data,
            (code as u32) << 24,
            control | u32::from(cycle),
        );
        trb
    }

    const fn ty(trb_type: TrbType) -> u32 {
        (trb_type as u32) << 10
    }

    #[test]
    fn segment_table() {
        let events = EventRing::new(2, 16).unwrap();
        assert_eq!(events.erst_size(), 2);
        let first = events.ring.physical(Cursor::new(events.ring.first_segment(), 0));
        assert_eq!(events.ste[0].address_low.read(), first as u32);
        assert_eq!(events.ste[1].size.read(), 16);
        assert_eq!(events.erdp(), first);
        assert_eq!(events.erstba() % 64, 0);
    }

    #[test]
    fn consumes_only_owned_events() {
        let mut events = EventRing::new(1, 4).unwrap();
        assert!(events.next_event().is_none());

        let port_change = event(3 << 24, TrbCompletionCode::Success, ty(TrbType::PortStatusChange), true);
        *events.ring.trb_mut(Cursor::new(0, 0)) = port_change;
        let event = events.next_event().unwrap();
        assert_eq!(route_event(&event), EventRoute::PortStatusChange(3));
        assert!(events.next_event().is_none());
        assert_eq!(events.erdp(), events.ring.physical(Cursor::new(0, 1)));
    }

    #[test]
    fn cycle_flips_after_a_full_pass() {
        let mut events = EventRing::new(2, 2).unwrap();
        for i in 0..4 {
            let cursor = events.ring.dequeue_cursor();
            *events.ring.trb_mut(cursor) = event(i, TrbCompletionCode::Success, ty(TrbType::MfindexWrap), true);
            assert!(events.next_event().is_some());
        }
        assert!(!events.ring.cycle);
        // Stale events from the previous pass are still marked with the old cycle state.
        assert!(events.next_event().is_none());

        let cursor = events.ring.dequeue_cursor();
        *events.ring.trb_mut(cursor) = event(9, TrbCompletionCode::Success, ty(TrbType::MfindexWrap), false);
        assert_eq!(events.next_event().unwrap().read_data(), 9);
    }

    #[test]
    fn routes() {
        let transfer = event(
            0x1000,
            TrbCompletionCode::ShortPacket,
            ty(TrbType::Transfer) | (3 << 16) | (7 << 24),
            true,
        );
        assert_eq!(
            route_event(&transfer),
            EventRoute::Transfer {
                slot: 7,
                dci: 3,
                stream_id: None
            }
        );

        let stream = event(
            5,
            TrbCompletionCode::Success,
            ty(TrbType::Transfer) | TRB_CONTROL_EVENT_DATA_BIT | (4 << 16) | (2 << 24),
            true,
        );
        assert_eq!(
            route_event(&stream),
            EventRoute::Transfer {
                slot: 2,
                dci: 4,
                stream_id: Some(5)
            }
        );

        let command = event(
            0x2000,
            TrbCompletionCode::Success,
            ty(TrbType::CommandCompletion) | (1 << 24),
            true,
        );
        assert_eq!(
            route_event(&command),
            EventRoute::Command(CommandCompletion {
                code: 1,
                slot_id: 1,
                command: 0x2000
            })
        );

        let full = event(0, TrbCompletionCode::EventRingFull, ty(TrbType::HostController), true);
        assert_eq!(route_event(&full), EventRoute::HostController(0x15));
        let other = event(0, TrbCompletionCode::Success, ty(TrbType::DeviceNotification), true);
        assert_eq!(
            route_event(&other),
            EventRoute::Other(TrbType::DeviceNotification as u8)
        );
    }
}
