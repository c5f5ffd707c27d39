// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Descriptor rings shared between the host and an accelerator core.
//!
//! Every ring is single-producer/single-consumer. Host-to-NSS (H2N)
//! rings are produced by the host and consumed by the firmware;
//! NSS-to-host (N2H) rings go the other way. The indices are
//! free-running and masked on access, so a ring of size N holds up to
//! N entries and "full" is simply `prod - cons == N`.
//!
//! The producer publishes an entry by writing the slot and then
//! storing the new producer index with release ordering; the consumer
//! observes it by loading the producer index with acquire ordering.
//! The consumer index is published back the same way, which is what
//! lets the producer reuse a slot.
use super::Error;
use super::Result;
use super::nbuf::Nbuf;
use crate::ddi::sync::KMutex;
use bitflags::bitflags;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use std::sync::Arc;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Upper bound on any ring's size.
pub const MAX_RING_SIZE: u32 = 4096;

bitflags! {
    /// Per-descriptor flags.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct DescFlags: u16 {
        const FIRST_SEGMENT = 0x0020;
        const LAST_SEGMENT = 0x0040;
        const DISCARD = 0x0080;
        /// The buffer is a virtual (host-only) buffer and must not be
        /// returned to the empty buffer pool.
        const VIRTUAL_BUFFER = 0x2000;
        const BUFFER_REUSE = 0x8000;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct RingFlags: u32 {
        /// A transmit was refused because the ring was full; cleared
        /// when the firmware signals that it drained the ring.
        const TX_STOPPED = 0x1;
    }
}

/// What a descriptor's buffer carries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum BufferType {
    Empty = 0,
    Packet = 1,
    Ctrl = 2,
    CryptoReq = 3,
    CryptoResp = 4,
    Status = 5,
}

impl TryFrom<u8> for BufferType {
    type Error = ();

    fn try_from(num: u8) -> core::result::Result<Self, Self::Error> {
        match num {
            0 => Ok(Self::Empty),
            1 => Ok(Self::Packet),
            2 => Ok(Self::Ctrl),
            3 => Ok(Self::CryptoReq),
            4 => Ok(Self::CryptoResp),
            5 => Ok(Self::Status),
            _ => Err(()),
        }
    }
}

/// A ring descriptor, laid out as the firmware reads it.
#[derive(
    Clone, Copy, Debug, Default, Eq, FromBytes, Immutable, IntoBytes, KnownLayout, PartialEq,
)]
#[repr(C)]
pub struct Desc {
    pub opaque: u64,
    pub buffer: u32,
    pub interface_num: u32,
    pub buffer_len: u16,
    pub payload_offs: u16,
    pub payload_len: u16,
    pub bit_flags: u16,
    pub buffer_type: u8,
    pub int_bit: u8,
    pub _reserved: [u8; 6],
}

impl Desc {
    pub fn flags(&self) -> DescFlags {
        DescFlags::from_bits_truncate(self.bit_flags)
    }

    pub fn buffer_type(&self) -> core::result::Result<BufferType, u8> {
        BufferType::try_from(self.buffer_type).map_err(|_| self.buffer_type)
    }
}

/// A descriptor plus the buffer it owns, if any.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Entry {
    pub desc: Desc,
    pub nbuf: Option<Nbuf>,
}

impl Entry {
    pub fn new(desc: Desc, nbuf: Option<Nbuf>) -> Self {
        Self { desc, nbuf }
    }
}

/// The shared part of a ring: the slots and the two indices.
///
/// Each slot sits behind its own mutex only so that the type is safe to
/// share; producer and consumer never contend on a slot because the
/// indices keep them on disjoint ranges.
pub struct DescRing {
    size: u32,
    mask: u32,
    prod: AtomicU32,
    cons: AtomicU32,
    slots: Box<[KMutex<Option<Entry>>]>,
}

impl DescRing {
    /// Create a ring. The size is rounded up to a power of two.
    pub fn new(size: u32) -> Self {
        let size = size.clamp(1, MAX_RING_SIZE).next_power_of_two();
        let slots = (0..size).map(|_| KMutex::new(None)).collect();
        Self {
            size,
            mask: size - 1,
            prod: AtomicU32::new(0),
            cons: AtomicU32::new(0),
            slots,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn occupancy(&self) -> u32 {
        let prod = self.prod.load(Ordering::Acquire);
        let cons = self.cons.load(Ordering::Acquire);
        prod.wrapping_sub(cons)
    }

    pub fn is_empty(&self) -> bool {
        self.occupancy() == 0
    }

    pub fn is_full(&self) -> bool {
        self.occupancy() >= self.size
    }

    /// Publish an entry. A full ring hands the entry back untouched.
    ///
    /// Only one producer may call this at a time.
    pub fn push(&self, entry: Entry) -> core::result::Result<(), Entry> {
        let prod = self.prod.load(Ordering::Relaxed);
        let cons = self.cons.load(Ordering::Acquire);
        if prod.wrapping_sub(cons) >= self.size {
            return Err(entry);
        }

        *self.slots[(prod & self.mask) as usize].lock() = Some(entry);
        self.prod.store(prod.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Take the oldest entry, if any.
    ///
    /// Only one consumer may call this at a time.
    pub fn pop(&self) -> Option<Entry> {
        let cons = self.cons.load(Ordering::Relaxed);
        let prod = self.prod.load(Ordering::Acquire);
        if cons == prod {
            return None;
        }

        let entry = self.slots[(cons & self.mask) as usize].lock().take();
        self.cons.store(cons.wrapping_add(1), Ordering::Release);
        // A published slot always holds an entry.
        entry
    }
}

/// The host's producer view of a host-to-NSS ring.
pub struct H2nRing {
    qid: u8,
    int_bit: u8,
    ring: Arc<DescRing>,
    lock: KMutex<()>,
    flags: AtomicU32,
    tx_q_full_cnt: AtomicU64,
}

impl H2nRing {
    pub fn new(qid: u8, int_bit: u8, size: u32) -> Self {
        Self {
            qid,
            int_bit,
            ring: Arc::new(DescRing::new(size)),
            lock: KMutex::new(()),
            flags: AtomicU32::new(0),
            tx_q_full_cnt: AtomicU64::new(0),
        }
    }

    pub fn qid(&self) -> u8 {
        self.qid
    }

    pub fn int_bit(&self) -> u8 {
        self.int_bit
    }

    /// The shared ring, as the firmware side sees it.
    pub fn shared(&self) -> &Arc<DescRing> {
        &self.ring
    }

    /// Enqueue an entry under the ring's producer lock.
    ///
    /// On a full ring nothing is written, the ring is marked stopped,
    /// and the full count is bumped.
    pub fn enqueue(&self, entry: Entry) -> Result<()> {
        let _guard = self.lock.lock();
        match self.ring.push(entry) {
            Ok(()) => Ok(()),

            Err(_entry) => {
                self.flags
                    .fetch_or(RingFlags::TX_STOPPED.bits(), Ordering::AcqRel);
                self.tx_q_full_cnt.fetch_add(1, Ordering::Relaxed);
                Err(Error::QueueFull(self.qid))
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        RingFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
            .contains(RingFlags::TX_STOPPED)
    }

    /// Clear the stopped flag, returning whether it was set.
    pub fn clear_stopped(&self) -> bool {
        let prev = self
            .flags
            .fetch_and(!RingFlags::TX_STOPPED.bits(), Ordering::AcqRel);
        RingFlags::from_bits_truncate(prev).contains(RingFlags::TX_STOPPED)
    }

    pub fn tx_q_full_cnt(&self) -> u64 {
        self.tx_q_full_cnt.load(Ordering::Relaxed)
    }

    pub fn occupancy(&self) -> u32 {
        self.ring.occupancy()
    }
}

/// The largest buffer a chain may reassemble to; the length has to fit
/// the descriptor's `payload_len`.
pub const MAX_REASM_LEN: usize = u16::MAX as usize;

/// Where a partially reassembled buffer stands.
enum Partial {
    Building { desc: Desc, nbuf: Nbuf },
    /// The chain grew past [`MAX_REASM_LEN`]; skip it up to its LAST
    /// segment.
    Discarding,
}

impl Partial {
    fn is_building(&self) -> bool {
        matches!(self, Partial::Building { .. })
    }
}

/// The host's consumer view of an NSS-to-host ring.
///
/// Buffers larger than one descriptor arrive as a FIRST segment, any
/// number of middle segments, and a LAST segment. Only whole buffers
/// are handed up; an interrupted or oversized chain is dropped and
/// counted.
pub struct N2hRing {
    qid: u8,
    ring: Arc<DescRing>,
    partial: KMutex<Option<Partial>>,
    reasm_drops: AtomicU64,
    bad_desc: AtomicU64,
}

impl N2hRing {
    pub fn new(qid: u8, size: u32) -> Self {
        Self {
            qid,
            ring: Arc::new(DescRing::new(size)),
            partial: KMutex::new(None),
            reasm_drops: AtomicU64::new(0),
            bad_desc: AtomicU64::new(0),
        }
    }

    pub fn qid(&self) -> u8 {
        self.qid
    }

    pub fn shared(&self) -> &Arc<DescRing> {
        &self.ring
    }

    pub fn reasm_drops(&self) -> u64 {
        self.reasm_drops.load(Ordering::Relaxed)
    }

    pub fn bad_desc(&self) -> u64 {
        self.bad_desc.load(Ordering::Relaxed)
    }

    pub fn has_pending(&self) -> bool {
        !self.ring.is_empty()
    }

    /// Consume up to `budget` descriptors, handing every completed
    /// buffer to `deliver` in ring order. Returns the number of
    /// descriptors consumed.
    ///
    /// Delivery happens after the ring's consumer lock is dropped, so
    /// `deliver` is free to transmit or take other locks.
    pub fn drain<F>(&self, budget: usize, mut deliver: F) -> usize
    where
        F: FnMut(Entry),
    {
        let mut done = Vec::new();
        let mut consumed = 0;

        {
            let mut partial = self.partial.lock();
            while consumed < budget {
                let Some(entry) = self.ring.pop() else {
                    break;
                };
                consumed += 1;
                if let Some(whole) = self.reassemble(&mut partial, entry) {
                    done.push(whole);
                }
            }
        }

        for entry in done {
            deliver(entry);
        }

        consumed
    }

    fn reassemble(
        &self,
        partial: &mut Option<Partial>,
        entry: Entry,
    ) -> Option<Entry> {
        let flags = entry.desc.flags();
        let first = flags.contains(DescFlags::FIRST_SEGMENT);
        let last = flags.contains(DescFlags::LAST_SEGMENT);

        if first {
            if partial.take().is_some_and(|p| p.is_building()) {
                self.reasm_drops.fetch_add(1, Ordering::Relaxed);
            }

            if last {
                return Some(entry);
            }

            let Some(nbuf) = entry.nbuf else {
                self.bad_desc.fetch_add(1, Ordering::Relaxed);
                return None;
            };
            *partial = Some(Partial::Building { desc: entry.desc, nbuf });
            return None;
        }

        let (desc, mut nbuf) = match partial.take() {
            Some(Partial::Building { desc, nbuf }) => (desc, nbuf),
            Some(Partial::Discarding) => {
                if !last {
                    *partial = Some(Partial::Discarding);
                }
                return None;
            }

            // A continuation segment with nothing to continue.
            None => {
                self.bad_desc.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let seg = entry.nbuf.as_ref().map(Nbuf::as_slice).unwrap_or(&[]);
        let fits = nbuf.len() + seg.len() <= MAX_REASM_LEN;
        if !fits || nbuf.append(seg).is_err() {
            self.reasm_drops.fetch_add(1, Ordering::Relaxed);
            if !last {
                *partial = Some(Partial::Discarding);
            }
            return None;
        }

        if !last {
            *partial = Some(Partial::Building { desc, nbuf });
            return None;
        }

        let Ok(payload_len) = u16::try_from(nbuf.len()) else {
            self.reasm_drops.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let mut desc = desc;
        desc.bit_flags |= DescFlags::LAST_SEGMENT.bits();
        desc.payload_len = payload_len;
        Some(Entry { desc, nbuf: Some(nbuf) })
    }

    /// Throw away any half-assembled buffer, e.g. after a firmware
    /// restart.
    pub fn reset(&self) {
        if self.partial.lock().take().is_some_and(|p| p.is_building()) {
            self.reasm_drops.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::Rng;

    fn entry(tag: u32, flags: DescFlags, data: &[u8]) -> Entry {
        let desc = Desc {
            opaque: u64::from(tag),
            interface_num: tag,
            bit_flags: flags.bits(),
            payload_len: data.len() as u16,
            ..Default::default()
        };
        Entry::new(desc, Some(Nbuf::from_vec(data.to_vec())))
    }

    fn whole(tag: u32) -> Entry {
        entry(tag, DescFlags::FIRST_SEGMENT | DescFlags::LAST_SEGMENT, &[])
    }

    #[test]
    fn desc_layout() {
        assert_eq!(core::mem::size_of::<Desc>(), 32);
    }

    #[test]
    fn size_rounds_to_power_of_two() {
        assert_eq!(DescRing::new(100).size(), 128);
        assert_eq!(DescRing::new(64).size(), 64);
        assert_eq!(DescRing::new(1 << 20).size(), MAX_RING_SIZE);
    }

    #[test]
    fn fifo_across_wrap() {
        let ring = DescRing::new(8);
        let mut rng = rand::rng();
        let mut next_in = 0u32;
        let mut next_out = 0u32;

        for _ in 0..1000 {
            let n = rng.random_range(0..=8);
            for _ in 0..n {
                if ring.push(whole(next_in)).is_ok() {
                    next_in += 1;
                }
            }
            let m = rng.random_range(0..=8);
            for _ in 0..m {
                if let Some(e) = ring.pop() {
                    assert_eq!(e.desc.interface_num, next_out);
                    next_out += 1;
                }
            }
            assert!(ring.occupancy() <= ring.size());
        }
    }

    #[test]
    fn full_ring_is_not_overwritten() {
        let h2n = H2nRing::new(1, 1, 4);
        for i in 0..4 {
            h2n.enqueue(whole(i)).unwrap();
        }
        assert!(!h2n.is_stopped());
        assert_eq!(h2n.enqueue(whole(99)), Err(Error::QueueFull(1)));
        assert!(h2n.is_stopped());
        assert_eq!(h2n.tx_q_full_cnt(), 1);
        assert_eq!(h2n.occupancy(), 4);

        for i in 0..4 {
            assert_eq!(h2n.shared().pop().unwrap().desc.interface_num, i);
        }
        assert!(h2n.shared().pop().is_none());
        assert!(h2n.clear_stopped());
        assert!(!h2n.is_stopped());
    }

    #[test]
    fn threaded_spsc() {
        let ring = Arc::new(DescRing::new(16));
        let prod = ring.clone();
        let n = 10_000u32;
        let t = std::thread::spawn(move || {
            let mut i = 0;
            while i < n {
                if prod.push(whole(i)).is_ok() {
                    i += 1;
                }
            }
        });

        let mut expect = 0;
        while expect < n {
            if let Some(e) = ring.pop() {
                assert_eq!(e.desc.interface_num, expect);
                expect += 1;
            }
        }
        t.join().unwrap();
    }

    #[test]
    fn segments_are_reassembled() {
        let n2h = N2hRing::new(1, 16);
        let shared = n2h.shared();
        shared.push(entry(5, DescFlags::FIRST_SEGMENT, &[1, 2])).unwrap();
        shared.push(entry(5, DescFlags::empty(), &[3])).unwrap();
        shared.push(entry(5, DescFlags::LAST_SEGMENT, &[4, 5])).unwrap();
        shared.push(whole(6)).unwrap();

        let mut got = vec![];
        assert_eq!(n2h.drain(64, |e| got.push(e)), 4);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].desc.interface_num, 5);
        assert_eq!(got[0].nbuf.as_ref().unwrap().as_slice(), &[1, 2, 3, 4, 5]);
        assert_eq!(got[0].desc.payload_len, 5);
        assert_eq!(got[1].desc.interface_num, 6);
    }

    #[test]
    fn broken_chains_are_dropped() {
        let n2h = N2hRing::new(1, 16);
        let shared = n2h.shared();
        // Orphaned continuation.
        shared.push(entry(1, DescFlags::LAST_SEGMENT, &[9])).unwrap();
        // A chain interrupted by a new first segment.
        shared.push(entry(2, DescFlags::FIRST_SEGMENT, &[1])).unwrap();
        shared.push(whole(3)).unwrap();

        let mut got = vec![];
        n2h.drain(64, |e| got.push(e));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].desc.interface_num, 3);
        assert_eq!(n2h.bad_desc(), 1);
        assert_eq!(n2h.reasm_drops(), 1);
    }

    #[test]
    fn oversized_chain_is_dropped() {
        let n2h = N2hRing::new(1, 16);
        let shared = n2h.shared();
        let seg = vec![0xa5; 60000];
        shared.push(entry(1, DescFlags::FIRST_SEGMENT, &seg)).unwrap();
        for _ in 0..8 {
            shared.push(entry(1, DescFlags::empty(), &seg)).unwrap();
        }
        shared.push(entry(1, DescFlags::LAST_SEGMENT, &seg[..10000])).unwrap();
        shared.push(whole(2)).unwrap();

        let mut got = vec![];
        n2h.drain(64, |e| got.push(e));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].desc.interface_num, 2);
        assert_eq!(n2h.reasm_drops(), 1);
        assert_eq!(n2h.bad_desc(), 0);
    }

    #[test]
    fn chain_up_to_the_limit_is_kept() {
        let n2h = N2hRing::new(1, 4);
        let shared = n2h.shared();
        let head = vec![1; MAX_REASM_LEN - 5];
        shared.push(entry(1, DescFlags::FIRST_SEGMENT, &head)).unwrap();
        shared.push(entry(1, DescFlags::LAST_SEGMENT, &[2; 5])).unwrap();

        let mut got = vec![];
        n2h.drain(64, |e| got.push(e));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].desc.payload_len, u16::MAX);
        assert_eq!(got[0].nbuf.as_ref().unwrap().len(), MAX_REASM_LEN);
        assert_eq!(n2h.reasm_drops(), 0);
    }

    #[test]
    fn drain_respects_budget() {
        let n2h = N2hRing::new(2, 16);
        for i in 0..10 {
            n2h.shared().push(whole(i)).unwrap();
        }
        let mut got = vec![];
        assert_eq!(n2h.drain(4, |e| got.push(e.desc.interface_num)), 4);
        assert!(n2h.has_pending());
        assert_eq!(n2h.drain(64, |e| got.push(e.desc.interface_num)), 6);
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn reset_drops_partial() {
        let n2h = N2hRing::new(1, 4);
        n2h.shared().push(entry(1, DescFlags::FIRST_SEGMENT, &[1])).unwrap();
        n2h.drain(64, |_| panic!("nothing is complete"));
        n2h.reset();
        assert_eq!(n2h.reasm_drops(), 1);
    }
}
