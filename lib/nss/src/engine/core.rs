// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! One accelerator core: its rings, its state, how buffers are sent to
//! it, and how its interrupts are serviced.
use super::Error;
use super::Result;
use super::hal::H2nIntr;
use super::hal::Hal;
use super::hal::N2hIntr;
use super::msg::Msg;
use super::msg::log_msg_failures;
use super::msg::validate;
use super::nbuf::Nbuf;
use super::ring::BufferType;
use super::ring::Desc;
use super::ring::DescFlags;
use super::ring::Entry;
use super::ring::H2nRing;
use super::ring::N2hRing;
use super::top::NssTop;
use crate::api::CoreId;
use crate::cfg::DriverCfg;
use crate::ddi::sync::KMutex;
use crate::provider::LogLevel;
use core::fmt;
use core::fmt::Display;
use core::str::FromStr;
use core::sync::atomic::AtomicU8;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use std::sync::Arc;

/// Marks a live context.
pub const NSS_CTX_MAGIC: u32 = 0xDEDE_DEDE;

pub const H2N_DESC_RING_NUM: usize = 16;
pub const N2H_DESC_RING_NUM: usize = 15;

pub const EMPTY_BUFFER_QUEUE: u8 = 0;
pub const DATA_QUEUE_0: u8 = 1;
pub const DATA_QUEUE_1: u8 = 2;
/// Control messages share the first data queue.
pub const CMD_QUEUE: u8 = 1;

/// How many descriptors one cause may consume per service pass.
pub const QUEUE_WEIGHT: usize = 64;
pub const TX_UNBLOCKED_WEIGHT: usize = 1;

/// Maximum decongestion callbacks per core.
pub const MAX_CLIENTS: usize = 12;

/// The N2H causes that carry ring work, with the ring each drains.
const RX_QUEUES: [(N2hIntr, u8); 3] = [
    (N2hIntr::EMPTY_BUFFER_QUEUE, EMPTY_BUFFER_QUEUE),
    (N2hIntr::DATA_COMMAND_QUEUE, DATA_QUEUE_0),
    (N2hIntr::DATA_QUEUE_1, DATA_QUEUE_1),
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum CoreState {
    Uninitialized = 0,
    Initialized = 1,
    FirmwareDead = 2,
    FirmwareDump = 4,
    Panic = 8,
}

impl TryFrom<u8> for CoreState {
    type Error = ();

    fn try_from(num: u8) -> core::result::Result<Self, Self::Error> {
        match num {
            0 => Ok(Self::Uninitialized),
            1 => Ok(Self::Initialized),
            2 => Ok(Self::FirmwareDead),
            4 => Ok(Self::FirmwareDump),
            8 => Ok(Self::Panic),
            _ => Err(()),
        }
    }
}

impl FromStr for CoreState {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uninitialized" => Ok(Self::Uninitialized),
            "initialized" => Ok(Self::Initialized),
            "firmware_dead" => Ok(Self::FirmwareDead),
            "firmware_dump" => Ok(Self::FirmwareDump),
            "panic" => Ok(Self::Panic),
            _ => Err(format!("invalid core state: {s}")),
        }
    }
}

impl Display for CoreState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::FirmwareDead => "firmware_dead",
            Self::FirmwareDump => "firmware_dump",
            Self::Panic => "panic",
        };
        write!(f, "{s}")
    }
}

/// Called when a full transmit ring has drained.
pub type DecongestionCallback = Arc<dyn Fn(CoreId) + Send + Sync>;

/// The per-core context.
pub struct NssCtx {
    id: CoreId,
    magic: AtomicU32,
    state: AtomicU8,
    h2n: Box<[H2nRing]>,
    n2h: Box<[N2hRing]>,
    max_buf_size: usize,
    hal: Arc<dyn Hal>,
    decongestion: KMutex<heapless::Vec<DecongestionCallback, MAX_CLIENTS>>,
    // Serializes interrupt service; each N2H ring has one consumer.
    irq_gate: KMutex<()>,
    // Causes taken but not fully serviced on a previous pass.
    carry: AtomicU32,
    next_opaque: AtomicU64,
}

impl NssCtx {
    pub fn new(id: CoreId, cfg: &DriverCfg, hal: Arc<dyn Hal>) -> Self {
        let h2n = (0..H2N_DESC_RING_NUM as u8)
            .map(|qid| {
                let int_bit = if qid == EMPTY_BUFFER_QUEUE { 0 } else { 1 };
                H2nRing::new(qid, int_bit, cfg.h2n_ring_size)
            })
            .collect();
        let n2h = (0..N2H_DESC_RING_NUM as u8)
            .map(|qid| N2hRing::new(qid, cfg.n2h_ring_size))
            .collect();

        Self {
            id,
            magic: AtomicU32::new(0),
            state: AtomicU8::new(CoreState::Uninitialized as u8),
            h2n,
            n2h,
            max_buf_size: cfg.max_buf_size,
            hal,
            decongestion: KMutex::new(heapless::Vec::new()),
            irq_gate: KMutex::new(()),
            carry: AtomicU32::new(0),
            next_opaque: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> CoreId {
        self.id
    }

    pub fn max_buf_size(&self) -> usize {
        self.max_buf_size
    }

    pub fn state(&self) -> CoreState {
        CoreState::try_from(self.state.load(Ordering::Acquire))
            .unwrap_or(CoreState::Panic)
    }

    pub fn set_state(&self, state: CoreState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether buffers may be sent to this core.
    pub fn is_ready(&self) -> bool {
        self.magic.load(Ordering::Acquire) == NSS_CTX_MAGIC
            && self.state() == CoreState::Initialized
    }

    /// Mark the context live once the firmware has booted.
    pub fn start(&self) {
        self.magic.store(NSS_CTX_MAGIC, Ordering::Release);
        self.set_state(CoreState::Initialized);
        self.hal.enable_interrupt(self.id, N2hIntr::all());
    }

    pub fn stop(&self) {
        self.hal.disable_interrupt(self.id, N2hIntr::all());
        self.set_state(CoreState::Uninitialized);
        self.magic.store(0, Ordering::Release);
        self.n2h.iter().for_each(N2hRing::reset);
    }

    pub fn h2n(&self, qid: u8) -> Option<&H2nRing> {
        self.h2n.get(usize::from(qid))
    }

    pub fn n2h(&self, qid: u8) -> Option<&N2hRing> {
        self.n2h.get(usize::from(qid))
    }

    /// Enqueue a buffer for the firmware and ring its doorbell.
    ///
    /// Readiness is checked before anything else and size before the
    /// ring is touched, so a refused send has no side effects. The
    /// doorbell is rung only for a buffer that was actually enqueued.
    pub fn send_buffer(
        &self,
        if_num: u32,
        nbuf: Nbuf,
        qid: u8,
        buffer_type: BufferType,
        flags: DescFlags,
    ) -> Result<()> {
        if !self.is_ready() {
            return Err(Error::NotReady);
        }

        if nbuf.len() > self.max_buf_size {
            return Err(Error::TooLarge {
                len: nbuf.len(),
                max: self.max_buf_size,
            });
        }

        let ring = self.h2n(qid).ok_or(Error::BadParam("queue id"))?;
        let len = nbuf.len() as u16;
        let desc = Desc {
            opaque: self.next_opaque.fetch_add(1, Ordering::Relaxed),
            interface_num: if_num,
            buffer_len: len,
            payload_len: len,
            bit_flags: (flags
                | DescFlags::FIRST_SEGMENT
                | DescFlags::LAST_SEGMENT)
                .bits(),
            buffer_type: buffer_type as u8,
            int_bit: ring.int_bit(),
            ..Default::default()
        };

        if let Err(e) = ring.enqueue(Entry::new(desc, Some(nbuf))) {
            self.ring_full_probe(qid, ring.tx_q_full_cnt());
            return Err(e);
        }

        self.doorbell(ring);
        Ok(())
    }

    /// The narrower path used by the crypto engine: the buffer is
    /// already mapped, so only its device address and length travel.
    pub fn send_crypto(&self, nbuf: Nbuf, paddr: u32, len: u16) -> Result<()> {
        if !self.is_ready() {
            return Err(Error::NotReady);
        }

        if usize::from(len) > self.max_buf_size {
            return Err(Error::TooLarge {
                len: usize::from(len),
                max: self.max_buf_size,
            });
        }

        let ring = self.h2n(DATA_QUEUE_0).ok_or(Error::BadParam("queue id"))?;
        let desc = Desc {
            opaque: self.next_opaque.fetch_add(1, Ordering::Relaxed),
            buffer: paddr,
            interface_num: crate::api::CRYPTO_INTERFACE,
            buffer_len: len,
            payload_len: len,
            bit_flags: (DescFlags::FIRST_SEGMENT | DescFlags::LAST_SEGMENT)
                .bits(),
            buffer_type: BufferType::CryptoReq as u8,
            int_bit: ring.int_bit(),
            ..Default::default()
        };

        if let Err(e) = ring.enqueue(Entry::new(desc, Some(nbuf))) {
            self.ring_full_probe(DATA_QUEUE_0, ring.tx_q_full_cnt());
            return Err(e);
        }

        self.doorbell(ring);
        Ok(())
    }

    fn doorbell(&self, ring: &H2nRing) {
        let cause = if ring.qid() == EMPTY_BUFFER_QUEUE {
            H2nIntr::EMPTY_BUFFER_QUEUE
        } else {
            H2nIntr::DATA_COMMAND_QUEUE
        };
        self.hal.send_interrupt(self.id, ring.int_bit(), cause);
    }

    /// Hand up to `count` fresh empty buffers to the firmware. Stops
    /// early when the ring fills or allocation fails.
    fn replenish_empty(&self, top: &NssTop, count: usize) -> usize {
        let Some(ring) = self.h2n(EMPTY_BUFFER_QUEUE) else {
            return 0;
        };

        let mut pushed = 0;
        while pushed < count {
            let nbuf = match Nbuf::alloc(self.max_buf_size) {
                Ok(nbuf) => nbuf,
                Err(_) => {
                    top.stats().vals.nbuf_alloc_fails.incr(1);
                    break;
                }
            };

            let desc = Desc {
                opaque: self.next_opaque.fetch_add(1, Ordering::Relaxed),
                buffer_len: self.max_buf_size as u16,
                buffer_type: BufferType::Empty as u8,
                int_bit: ring.int_bit(),
                ..Default::default()
            };
            if ring.enqueue(Entry::new(desc, Some(nbuf))).is_err() {
                break;
            }
            top.stats().vals.tx_empty.incr(1);
            pushed += 1;
        }

        if pushed > 0 {
            self.doorbell(ring);
        }
        pushed
    }

    /// Register a callback for when a full ring drains.
    pub fn register_decongestion(&self, cb: DecongestionCallback) -> Result<()> {
        self.decongestion
            .lock()
            .push(cb)
            .map_err(|_| Error::Failure("decongestion table full"))
    }

    /// Remove a callback, matched by identity.
    pub fn unregister_decongestion(&self, cb: &DecongestionCallback) -> bool {
        let mut tbl = self.decongestion.lock();
        match tbl.iter().position(|c| Arc::ptr_eq(c, cb)) {
            Some(idx) => {
                tbl.swap_remove(idx);
                true
            }
            None => false,
        }
    }

    /// Service pending interrupt causes with at most `budget` units of
    /// work. Interrupts are re-enabled only if everything was handled
    /// within the budget; otherwise the caller is expected to call
    /// again.
    pub(crate) fn service(&self, top: &NssTop, budget: usize) -> usize {
        let _gate = self.irq_gate.lock();
        self.hal.disable_interrupt(self.id, N2hIntr::all());

        let cause = self.hal.read_interrupt_cause(self.id);
        self.hal.clear_interrupt_cause(self.id, cause);
        let cause = cause
            | N2hIntr::from_bits_truncate(self.carry.swap(0, Ordering::AcqRel));

        let mut processed = 0;
        let mut unfinished = N2hIntr::empty();

        if cause.contains(N2hIntr::EMPTY_BUFFERS_SOS) {
            let want = QUEUE_WEIGHT.min(budget.saturating_sub(processed));
            processed += self.replenish_empty(top, want);
        }

        for (bit, qid) in RX_QUEUES {
            if !cause.contains(bit) {
                continue;
            }

            let Some(ring) = self.n2h(qid) else {
                continue;
            };
            let limit = QUEUE_WEIGHT.min(budget.saturating_sub(processed));
            let drops = (ring.reasm_drops(), ring.bad_desc());
            processed += ring.drain(limit, |entry| top.rx_entry(self, entry));
            top.stats().vals.rx_reasm_drops.incr(ring.reasm_drops().saturating_sub(drops.0));
            top.stats().vals.rx_bad_desc.incr(ring.bad_desc().saturating_sub(drops.1));
            if ring.has_pending() {
                unfinished |= bit;
            }
        }

        if cause.contains(N2hIntr::TX_UNBLOCKED) {
            self.tx_unblocked();
            processed += TX_UNBLOCKED_WEIGHT;
        }

        if cause.intersects(
            N2hIntr::COREDUMP_COMPLETE_0 | N2hIntr::COREDUMP_COMPLETE_1,
        ) {
            self.set_state(CoreState::FirmwareDump);
            top.log(
                LogLevel::Error,
                &format!("{}: firmware coredump complete", self.id),
            );
        }

        self.carry.fetch_or(unfinished.bits(), Ordering::AcqRel);
        if processed < budget && unfinished.is_empty() {
            self.hal.enable_interrupt(self.id, N2hIntr::all());
        }
        processed
    }

    fn tx_unblocked(&self) {
        for ring in self.h2n.iter() {
            ring.clear_stopped();
        }

        // Call outside the lock; a client may re-register from its
        // callback.
        let cbs: Vec<DecongestionCallback> =
            self.decongestion.lock().iter().cloned().collect();
        for cb in cbs {
            cb(self.id);
        }
    }

    fn ring_full_probe(&self, qid: u8, full_cnt: u64) {
        cfg_if! {
            if #[cfg(feature = "usdt")] {
                crate::nss_provider::ring__full!(
                    || (self.id as u8, qid, full_cnt)
                );
            } else {
                let (_, _) = (qid, full_cnt);
            }
        }
    }
}

impl NssTop {
    /// Route one received buffer by its type.
    pub(crate) fn rx_entry(&self, ctx: &NssCtx, entry: Entry) {
        let Entry { desc, nbuf } = entry;
        let stats = &self.stats().vals;

        match (desc.buffer_type(), nbuf) {
            (Ok(BufferType::Ctrl), Some(nbuf)) => {
                match Msg::decode(nbuf.as_slice()) {
                    Ok(msg) => self.dispatch_msg(ctx, msg),
                    Err(e) => {
                        self.log(
                            LogLevel::Warn,
                            &format!("{}: bad control buffer: {e}", ctx.id()),
                        );
                        self.drop_msg(ctx, desc.interface_num, e.reason());
                    }
                }
            }

            (Ok(BufferType::Packet), Some(nbuf)) => {
                stats.rx_packet.incr(1);
                self.deliver_packet(desc.interface_num, nbuf);
            }

            (Ok(BufferType::CryptoResp), Some(nbuf)) => {
                self.deliver_crypto(nbuf, desc.buffer, desc.payload_len);
            }

            (Ok(BufferType::Empty), _) => {
                stats.rx_empty.incr(1);
            }

            (Ok(BufferType::Status), _) => {
                stats.rx_status.incr(1);
            }

            (ty, _) => {
                stats.rx_invalid.incr(1);
                self.log(
                    LogLevel::Warn,
                    &format!(
                        "{}: unexpected descriptor on interface {}: {ty:?}",
                        ctx.id(),
                        desc.interface_num
                    ),
                );
            }
        }
    }

    /// Validate an inbound control message and hand it to the handler
    /// registered for its interface.
    pub fn dispatch_msg(&self, ctx: &NssCtx, msg: Msg) {
        self.stats().vals.rx_cmd_resp.incr(1);
        let if_num = msg.interface();
        msg_rx_probe(ctx.id(), &msg);

        let Some(handler) = self.handlers().get(if_num) else {
            self.log(
                LogLevel::Warn,
                &format!(
                    "{}: no handler for interface {if_num}, type {}",
                    ctx.id(),
                    msg.msg_type()
                ),
            );
            return self.drop_msg(ctx, if_num, "no handler");
        };

        let bounds = handler.bounds();
        if let Err(e) = validate(&msg.cm, bounds, |i| handler.owns_interface(i))
        {
            self.log(
                LogLevel::Warn,
                &format!("{}: dropped message: {e}", bounds.name),
            );
            return self.drop_msg(ctx, if_num, e.reason());
        }

        log_msg_failures(self.log_provider(), bounds.name, &msg.cm);
        handler.handle(ctx, &msg);
    }

    fn drop_msg(&self, ctx: &NssCtx, if_num: u32, reason: &str) {
        self.stats().vals.rx_invalid.incr(1);
        cfg_if! {
            if #[cfg(feature = "usdt")] {
                crate::nss_provider::msg__drop!(
                    || (ctx.id() as u8, if_num, reason)
                );
            } else {
                let (_, _, _) = (ctx, if_num, reason);
            }
        }
    }
}

fn msg_rx_probe(core: CoreId, msg: &Msg) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            crate::nss_provider::msg__rx!(|| (
                core as u8,
                msg.interface(),
                msg.msg_type(),
                msg.cm.response
            ));
        } else {
            let (_, _) = (core, msg);
        }
    }
}
