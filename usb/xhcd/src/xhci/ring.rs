//! Command, transfer and event rings.
//!
//! A ring is an arena of segments. Segments are never moved once allocated; the order hardware
//! walks them in is kept in `next`, so a [Cursor] stays valid while the ring grows. Command and
//! transfer rings end every segment with a Link TRB, and the Link of the last segment toggles
//! the cycle state. The event ring has no Link TRBs: the controller moves on at the end of each
//! segment, in the order of the segment table.
use std::fmt;

use common::dma::Dma;
use log::{debug, trace};

use super::trb::Trb;
use crate::error::{Result, XhciError};

/// A TRB position: segment index into the arena and slot index inside the segment.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Cursor {
    pub segment: usize,
    pub index: usize,
}

impl Cursor {
    pub const fn new(segment: usize, index: usize) -> Self {
        Self { segment, index }
    }
}

pub struct Ring {
    segments: Vec<Dma<[Trb]>>,
    /// Ring order: `next[s]` is the segment that follows segment `s`.
    next: Vec<usize>,
    /// The segment after which the traversal wraps and the cycle state flips.
    last: usize,
    trbs_per_segment: usize,
    max_trbs: usize,
    /// Whether segments end in a Link TRB. Rings without links are consumed by the driver.
    link: bool,
    enqueue: Cursor,
    dequeue: Cursor,
    /// Producer cycle state for link rings, consumer cycle state for the event ring.
    pub cycle: bool,
    available: usize,
    total: usize,
}

fn alloc_segment(trbs_per_segment: usize) -> Result<Dma<[Trb]>> {
    Ok(unsafe { Dma::<[Trb]>::zeroed_slice(trbs_per_segment)?.assume_init() })
}

impl Ring {
    pub fn new(
        segment_count: usize,
        trbs_per_segment: usize,
        link: bool,
        max_trbs: usize,
    ) -> Result<Ring> {
        if segment_count == 0 || trbs_per_segment < 2 {
            return Err(XhciError::InvalidArgument("ring geometry"));
        }
        if link && segment_count * trbs_per_segment > max_trbs {
            return Err(XhciError::RingFull);
        }

        let segments = (0..segment_count)
            .map(|_| alloc_segment(trbs_per_segment))
            .collect::<Result<Vec<_>>>()?;
        let next = (0..segment_count).map(|s| (s + 1) % segment_count).collect();

        let mut ring = Ring {
            segments,
            next,
            last: segment_count - 1,
            trbs_per_segment,
            max_trbs,
            link,
            enqueue: Cursor::default(),
            dequeue: Cursor::default(),
            cycle: true,
            available: 0,
            total: 0,
        };
        ring.total = segment_count * ring.usable_per_segment();
        ring.write_links();
        ring.available = ring.total;
        Ok(ring)
    }

    fn usable_per_segment(&self) -> usize {
        if self.link {
            self.trbs_per_segment - 1
        } else {
            self.trbs_per_segment
        }
    }

    /// Points every Link TRB at its successor, with the toggle flag on the last segment. Link
    /// TRBs start out owned by the producer.
    fn write_links(&mut self) {
        if !self.link {
            return;
        }
        let cycle = !self.cycle;
        for segment in 0..self.segments.len() {
            let target = self.segments[self.next[segment]].physical();
            let toggle = segment == self.last;
            self.segments[segment][self.trbs_per_segment - 1].link(target, toggle, false, cycle);
        }
    }

    /// The segment hardware starts from.
    pub fn first_segment(&self) -> usize {
        self.next[self.last]
    }

    /// The position after `cursor`, and whether moving there wraps the ring.
    pub fn step(&self, cursor: Cursor) -> (Cursor, bool) {
        if cursor.index + 1 < self.usable_per_segment() {
            (Cursor::new(cursor.segment, cursor.index + 1), false)
        } else {
            (
                Cursor::new(self.next[cursor.segment], 0),
                cursor.segment == self.last,
            )
        }
    }

    pub fn enqueue_cursor(&self) -> Cursor {
        self.enqueue
    }
    pub fn dequeue_cursor(&self) -> Cursor {
        self.dequeue
    }
    pub fn available(&self) -> usize {
        self.available
    }
    pub fn total(&self) -> usize {
        self.total
    }
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
    pub fn trbs_per_segment(&self) -> usize {
        self.trbs_per_segment
    }

    pub fn trb(&self, cursor: Cursor) -> &Trb {
        &self.segments[cursor.segment][cursor.index]
    }
    pub fn trb_mut(&mut self, cursor: Cursor) -> &mut Trb {
        &mut self.segments[cursor.segment][cursor.index]
    }

    /// Physical address of the TRB at `cursor`.
    pub fn physical(&self, cursor: Cursor) -> u64 {
        (self.segments[cursor.segment].physical() + cursor.index * std::mem::size_of::<Trb>())
            as u64
    }

    /// Finds the TRB a controller pointer refers to.
    pub fn position_of(&self, address: u64) -> Option<Cursor> {
        let size = std::mem::size_of::<Trb>() as u64;
        self.segments.iter().enumerate().find_map(|(segment, trbs)| {
            let base = trbs.physical() as u64;
            let end = base + (self.trbs_per_segment as u64) * size;
            if address >= base && address < end && (address - base) % size == 0 {
                Some(Cursor::new(segment, ((address - base) / size) as usize))
            } else {
                None
            }
        })
    }

    /// The enqueue pointer with the cycle state in bit 0, as programmed into CRCR, endpoint and
    /// stream contexts.
    pub fn register(&self) -> u64 {
        self.physical(self.enqueue) | u64::from(self.cycle)
    }

    /// Physical address of each segment in ring order, starting with the first.
    pub fn segment_addresses(&self) -> Vec<u64> {
        let mut addresses = Vec::with_capacity(self.segments.len());
        let mut segment = self.first_segment();
        for _ in 0..self.segments.len() {
            addresses.push(self.segments[segment].physical() as u64);
            segment = self.next[segment];
        }
        addresses
    }

    /// Fills the TRB at the enqueue pointer and moves past it. The closure receives the current
    /// cycle state.
    pub fn enqueue_with<F>(&mut self, fill: F) -> Result<Cursor>
    where
        F: FnOnce(&mut Trb, bool),
    {
        if self.available == 0 {
            return Err(XhciError::RingFull);
        }
        let cursor = self.enqueue;
        let cycle = self.cycle;
        fill(self.trb_mut(cursor), cycle);
        self.advance_enqueue();
        Ok(cursor)
    }

    /// Moves the enqueue pointer one TRB. Crossing a Link TRB hands the link to the consumer
    /// with the chain flag of the TRB before it.
    pub fn advance_enqueue(&mut self) {
        let (next, wrapped) = self.step(self.enqueue);
        if self.link && next.index == 0 {
            let chain = self.trb(self.enqueue).chain();
            let cycle = self.cycle;
            let link = Cursor::new(self.enqueue.segment, self.trbs_per_segment - 1);
            let link_trb = self.trb_mut(link);
            link_trb.set_chain(chain);
            link_trb.set_cycle(cycle);
        }
        if wrapped && self.link {
            self.cycle = !self.cycle;
            trace!("ring enqueue wrapped, cycle now {}", self.cycle);
        }
        self.enqueue = next;
        self.available = self.available.saturating_sub(1);
    }

    /// Moves the dequeue pointer one TRB.
    pub fn advance_dequeue(&mut self) {
        let (next, wrapped) = self.step(self.dequeue);
        if wrapped && !self.link {
            self.cycle = !self.cycle;
        }
        self.dequeue = next;
        if self.link {
            self.available = (self.available + 1).min(self.total);
        }
    }

    /// Retires every TRB up to and including `last`.
    pub fn dequeue_through(&mut self, last: Cursor) {
        for _ in 0..self.total {
            let current = self.dequeue;
            self.advance_dequeue();
            if current == last {
                return;
            }
        }
        log::warn!("dequeue pointer never reached {:?}", last);
    }

    /// Makes at least `needed` TRBs available, growing the ring if necessary.
    pub fn room(&mut self, needed: usize) -> Result<()> {
        if self.available >= needed {
            Ok(())
        } else {
            self.grow(needed)
        }
    }

    /// Splices new segments after the enqueue segment until `needed` TRBs are available.
    pub fn grow(&mut self, needed: usize) -> Result<()> {
        if self.available >= needed {
            return Ok(());
        }
        if !self.link {
            return Err(XhciError::RingFull);
        }

        let usable = self.usable_per_segment();
        let count = (needed - self.available + usable - 1) / usable;
        if (self.segments.len() + count) * self.trbs_per_segment > self.max_trbs {
            debug!(
                "ring cannot grow by {} segments past {} TRBs",
                count, self.max_trbs
            );
            return Err(XhciError::RingFull);
        }

        // The controller may be walking through the end of the enqueue segment.
        let (enq, deq) = (self.enqueue, self.dequeue);
        if enq.segment == deq.segment
            && (enq.index < deq.index || enq == deq && self.available == 0)
        {
            return Err(XhciError::RingFull);
        }

        let mut added = Vec::with_capacity(count);
        for _ in 0..count {
            added.push(alloc_segment(self.trbs_per_segment)?);
        }

        let splice = enq.segment;
        let after = self.next[splice];
        let first_new = self.segments.len();
        // New TRBs are not owned by the consumer until written.
        let cycle = !self.cycle;
        for (i, mut trbs) in added.into_iter().enumerate() {
            for trb in trbs.iter_mut() {
                trb.set_cycle(cycle);
            }
            self.segments.push(trbs);
            let this = first_new + i;
            self.next.push(if i + 1 == count { after } else { this + 1 });
        }
        self.next[splice] = first_new;

        let moves_toggle = splice == self.last;
        if moves_toggle {
            self.last = first_new + count - 1;
        }

        let link_index = self.trbs_per_segment - 1;
        let splice_link_cycle = self.segments[splice][link_index].cycle();
        let target = self.segments[first_new].physical();
        self.segments[splice][link_index].link(target, false, false, splice_link_cycle);
        for segment in first_new..first_new + count {
            let target = self.segments[self.next[segment]].physical();
            let toggle = segment == self.last;
            self.segments[segment][link_index].link(target, toggle, false, cycle);
        }

        self.total += count * usable;
        self.available += count * usable;
        debug!(
            "ring grew by {} segments to {} TRBs, {} available",
            count, self.total, self.available
        );
        Ok(())
    }

    /// Zeroes every TRB and moves both pointers back to the start of the ring.
    pub fn reset(&mut self) {
        for trbs in self.segments.iter_mut() {
            for trb in trbs.iter_mut() {
                trb.set(0, 0, 0);
            }
        }
        self.cycle = true;
        self.write_links();
        let start = Cursor::new(self.first_segment(), 0);
        self.enqueue = start;
        self.dequeue = start;
        self.available = self.total;
    }
}

impl fmt::Debug for Ring {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Ring")
            .field("segments", &self.segments.len())
            .field("trbs_per_segment", &self.trbs_per_segment)
            .field("link", &self.link)
            .field("enqueue", &self.enqueue)
            .field("dequeue", &self.dequeue)
            .field("cycle", &self.cycle)
            .field("available", &self.available)
            .field("total", &self.total)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xhci::trb::TrbType;

    fn noop(ring: &mut Ring) -> Cursor {
        ring.enqueue_with(|trb, cycle| trb.normal(0, 0, 0, false, false, false, cycle))
            .unwrap()
    }

    #[test]
    fn links_and_toggle() {
        let ring = Ring::new(3, 4, true, 64).unwrap();
        assert_eq!(ring.total(), 9);
        for segment in 0..3 {
            let link = ring.trb(Cursor::new(segment, 3));
            assert!(link.is_type(TrbType::Link));
            assert_eq!(link.read_data(), ring.physical(Cursor::new((segment + 1) % 3, 0)));
            assert_eq!(link.link_toggles(), segment == 2);
        }
    }

    #[test]
    fn enqueue_then_dequeue_restores_state() {
        let mut ring = Ring::new(2, 4, true, 64).unwrap();
        let start = (ring.enqueue_cursor(), ring.dequeue_cursor(), ring.available());
        for n in [1usize, 4, 5] {
            for _ in 0..n {
                noop(&mut ring);
            }
            assert_eq!(ring.available(), start.2 - n);
            for _ in 0..n {
                ring.advance_dequeue();
            }
            assert_eq!(ring.available(), start.2);
            assert_eq!(ring.enqueue_cursor(), ring.dequeue_cursor());
        }

        let mut ring = Ring::new(2, 4, true, 64).unwrap();
        let total = ring.total();
        for _ in 0..total {
            noop(&mut ring);
        }
        assert!(ring.enqueue_with(|_, _| ()).is_err());
        for _ in 0..total {
            ring.advance_dequeue();
        }
        assert_eq!(
            (ring.enqueue_cursor(), ring.dequeue_cursor(), ring.available()),
            start
        );
    }

    #[test]
    fn cycle_parity_follows_traversals() {
        for k in 0..5 {
            let mut ring = Ring::new(3, 4, true, 64).unwrap();
            let initial = ring.cycle;
            for _ in 0..k {
                for _ in 0..ring.total() {
                    noop(&mut ring);
                    ring.advance_dequeue();
                }
            }
            assert_eq!(ring.cycle, if k % 2 == 0 { initial } else { !initial });
        }

        let mut event = Ring::new(2, 4, false, 64).unwrap();
        let initial = event.cycle;
        for k in 1..4 {
            for _ in 0..event.total() {
                event.advance_dequeue();
            }
            assert_eq!(event.cycle, if k % 2 == 0 { initial } else { !initial });
        }
    }

    #[test]
    fn link_handover_mirrors_chain() {
        let mut ring = Ring::new(2, 4, true, 64).unwrap();
        for i in 0..3 {
            let chain = i == 2;
            ring.enqueue_with(|trb, cycle| trb.normal(0, 8, 0, false, chain, false, cycle))
                .unwrap();
        }
        let link = ring.trb(Cursor::new(0, 3));
        assert!(link.chain());
        assert!(link.cycle());
        assert_eq!(ring.enqueue_cursor(), Cursor::new(1, 0));
    }

    #[test]
    fn grow_then_enqueue_never_fails() {
        for k in [1usize, 3, 7, 20] {
            let mut ring = Ring::new(1, 4, true, 256).unwrap();
            noop(&mut ring);
            ring.grow(k).unwrap();
            for _ in 0..k {
                noop(&mut ring);
            }
        }
    }

    #[test]
    fn grow_keeps_cursors_and_moves_toggle() {
        let mut ring = Ring::new(1, 4, true, 256).unwrap();
        let first = noop(&mut ring);
        ring.grow(8).unwrap();
        assert_eq!(ring.segment_count(), 3);
        assert_eq!(ring.physical(first), ring.segment_addresses()[0]);
        let toggles: Vec<_> = (0..3)
            .map(|s| ring.trb(Cursor::new(s, 3)).link_toggles())
            .collect();
        assert_eq!(toggles, vec![false, false, true]);

        let before = ring.cycle;
        for _ in 0..ring.total() {
            noop(&mut ring);
            ring.advance_dequeue();
        }
        assert_eq!(ring.cycle, !before);
    }

    #[test]
    fn grow_refuses_unowned_splice_point() {
        let mut ring = Ring::new(1, 8, true, 256).unwrap();
        // Dequeue ahead of enqueue within one segment: the controller owns the segment end.
        for _ in 0..7 {
            noop(&mut ring);
        }
        for _ in 0..5 {
            ring.advance_dequeue();
        }
        noop(&mut ring);
        assert_eq!(ring.enqueue_cursor(), Cursor::new(0, 1));
        assert_eq!(ring.dequeue_cursor(), Cursor::new(0, 5));
        assert_eq!(ring.grow(10), Err(XhciError::RingFull));

        let mut ring = Ring::new(1, 8, true, 16).unwrap();
        assert_eq!(ring.grow(20), Err(XhciError::RingFull));
    }

    #[test]
    fn dequeue_through_a_full_ring() {
        let mut ring = Ring::new(1, 4, true, 64).unwrap();
        let mut last = Cursor::default();
        for _ in 0..ring.total() {
            last = noop(&mut ring);
        }
        assert_eq!(ring.available(), 0);
        ring.dequeue_through(last);
        assert_eq!(ring.available(), ring.total());
        assert_eq!(ring.dequeue_cursor(), ring.enqueue_cursor());
    }

    #[test]
    fn position_lookup() {
        let ring = Ring::new(2, 4, true, 64).unwrap();
        let cursor = Cursor::new(1, 2);
        assert_eq!(ring.position_of(ring.physical(cursor)), Some(cursor));
        assert_eq!(ring.position_of(ring.physical(cursor) + 4), None);
        assert_eq!(ring.position_of(0), None);
    }

    #[test]
    fn reset_restores_start() {
        let mut ring = Ring::new(2, 4, true, 64).unwrap();
        for _ in 0..5 {
            noop(&mut ring);
        }
        ring.reset();
        assert_eq!(ring.enqueue_cursor(), Cursor::new(0, 0));
        assert_eq!(ring.available(), ring.total());
        assert!(ring.cycle);
        assert_eq!(ring.register(), ring.physical(Cursor::new(0, 0)) | 1);
    }
}
