// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common routines for integration tests.
//!
//! The centrepiece is [`SimFirmware`]: a thread standing in for the
//! accelerator firmware. It drains the host-to-NSS rings whenever the
//! driver rings a doorbell, answers each control message as its
//! responder says, and services the driver's interrupt exactly like a
//! host interrupt handler would.

// This type of pedantry is more trouble than it's worth here.
#![allow(dead_code)]

pub use nss::api::CoreId;
pub use nss::api::DYNAMIC_IF_START;
pub use nss::api::DYNAMIC_INTERFACE;
pub use nss::api::DynamicIfType;
pub use nss::api::Response;
pub use nss::api::dynamic_interface::DynamicIfMsgType;
pub use nss::api::dynamic_interface::DynamicIfNodeMsg;
pub use nss::cfg::DriverCfg;
pub use nss::cfg::Timeouts;
pub use nss::engine::Driver;
pub use nss::engine::Error;
pub use nss::engine::Msg;
pub use nss::engine::Nbuf;
pub use nss::engine::NssTop;
pub use nss::engine::core::DATA_QUEUE_0;
pub use nss::engine::hal::H2nIntr;
pub use nss::engine::hal::N2hIntr;
pub use nss::engine::hal::SimHal;
pub use nss::engine::ring::BufferType;
pub use nss::engine::ring::Desc;
pub use nss::engine::ring::DescFlags;
pub use nss::engine::ring::Entry;
pub use nss::engine::top::Netdev;
pub use nss::provider::LogLevel;
pub use nss::provider::Providers;
pub use nss::provider::RecordLog;
pub use nss::provider::SlogLog;

use nss::ddi::sync::KCondvar;
use nss::ddi::sync::KMutex;
use slog::Drain;
use slog::Logger;
use slog::o;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use zerocopy::IntoBytes;

/// How the simulated firmware answers one control message.
#[derive(Clone, Debug)]
pub enum Reply {
    /// Ack, echoing the request's payload.
    Ack,
    /// Ack with a different payload.
    AckWith(Vec<u8>),
    /// Refuse with `EMsg` and the given error code.
    Nack(u32),
    /// Never answer.
    Drop,
    /// Answer with the inner reply after a pause.
    Delayed(Duration, Box<Reply>),
}

pub type Responder = Box<dyn FnMut(&Msg) -> Option<Reply> + Send>;

#[derive(Default)]
struct Work {
    kicks: usize,
    stop: bool,
}

struct Inner {
    top: Arc<NssTop>,
    hal: Arc<SimHal>,
    work: KMutex<Work>,
    cv: KCondvar,
    responder: KMutex<Option<Responder>>,
    received: KMutex<Vec<Msg>>,
    packets: KMutex<Vec<Entry>>,
    next_alloc: KMutex<u32>,
}

pub struct SimFirmware {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl SimFirmware {
    /// Start answering for `top`, which must be built on `hal`.
    pub fn start(top: Arc<NssTop>, hal: Arc<SimHal>) -> Self {
        let inner = Arc::new(Inner {
            top,
            hal: hal.clone(),
            work: KMutex::new(Work::default()),
            cv: KCondvar::new(),
            responder: KMutex::new(None),
            received: KMutex::new(vec![]),
            packets: KMutex::new(vec![]),
            next_alloc: KMutex::new(0),
        });

        let weak = Arc::downgrade(&inner);
        hal.set_hook(move |_, _, _| {
            if let Some(inner) = weak.upgrade() {
                inner.work.lock().kicks += 1;
                inner.cv.notify_all();
            }
        });

        let worker = inner.clone();
        let thread = std::thread::spawn(move || worker.run());
        Self { inner, thread: Some(thread) }
    }

    /// Override the default answers. The responder runs on the
    /// firmware thread; returning `None` falls back to the default.
    pub fn set_responder<F>(&self, f: F)
    where
        F: FnMut(&Msg) -> Option<Reply> + Send + 'static,
    {
        *self.inner.responder.lock() = Some(Box::new(f));
    }

    /// Go back to answering every request the default way.
    pub fn clear_responder(&self) {
        *self.inner.responder.lock() = None;
    }

    /// Skip the next `n` dynamic interface numbers.
    pub fn skip_allocs(&self, n: u32) {
        *self.inner.next_alloc.lock() += n;
    }

    /// Every control message received so far.
    pub fn received(&self) -> Vec<Msg> {
        self.inner.received.lock().clone()
    }

    /// Every data-queue entry received so far.
    pub fn packets(&self) -> Vec<Entry> {
        self.inner.packets.lock().clone()
    }

    /// Send an unsolicited message to the host on `core`.
    pub fn notify(&self, core: CoreId, mut msg: Msg) {
        msg.cm.response = Response::Notify as u32;
        self.inner.deliver(core, &msg);
    }

    /// Send a message as-is, without touching its envelope.
    pub fn send_raw(&self, core: CoreId, msg: &Msg) {
        self.inner.deliver(core, msg);
    }

    /// Deliver a packet on `if_num` as the firmware would.
    pub fn send_packet(&self, core: CoreId, if_num: u32, data: &[u8]) {
        self.inner.push(core, if_num, BufferType::Packet, data.to_vec());
    }
}

impl Drop for SimFirmware {
    fn drop(&mut self) {
        self.inner.hal.clear_hook();
        self.inner.work.lock().stop = true;
        self.inner.cv.notify_all();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Inner {
    fn run(&self) {
        loop {
            {
                let mut work = self.work.lock();
                while work.kicks == 0 && !work.stop {
                    work = self.cv.wait(work);
                }
                if work.stop {
                    return;
                }
                work.kicks = 0;
            }

            for ctx in self.top.cores() {
                let Some(ring) = ctx.h2n(DATA_QUEUE_0) else {
                    continue;
                };

                while let Some(entry) = ring.shared().pop() {
                    self.consume(ctx.id(), entry);
                }
            }
        }
    }

    fn consume(&self, core: CoreId, entry: Entry) {
        match (entry.desc.buffer_type(), &entry.nbuf) {
            (Ok(BufferType::Ctrl), Some(nbuf)) => {
                let Ok(msg) = Msg::decode(nbuf.as_slice()) else {
                    return;
                };
                self.received.lock().push(msg.clone());
                let reply = self.answer(&msg);
                self.respond(core, &msg, reply);
            }

            _ => self.packets.lock().push(entry),
        }
    }

    fn answer(&self, msg: &Msg) -> Reply {
        if let Some(reply) = self.responder.lock().as_mut().and_then(|r| r(msg)) {
            return reply;
        }

        if msg.interface() == DYNAMIC_INTERFACE
            && msg.msg_type() == DynamicIfMsgType::AllocNode as u32
        {
            let mut next = self.next_alloc.lock();
            let mut body: DynamicIfNodeMsg = msg.read();
            body.if_num = (DYNAMIC_IF_START + *next) as i32;
            *next += 1;
            return Reply::AckWith(body.as_bytes().to_vec());
        }
        Reply::Ack
    }

    fn respond(&self, core: CoreId, req: &Msg, reply: Reply) {
        let resp = match reply {
            Reply::Ack => req.as_response(Response::Ack, 0),
            Reply::AckWith(payload) => {
                let mut cm = req.cm;
                cm.response = Response::Ack as u32;
                cm.len = payload.len() as u32;
                Msg::from_parts(cm, payload)
            }
            Reply::Nack(error) => req.as_response(Response::EMsg, error),
            Reply::Drop => return,
            Reply::Delayed(pause, inner) => {
                std::thread::sleep(pause);
                return self.respond(core, req, *inner);
            }
        };
        self.deliver(core, &resp);
    }

    fn deliver(&self, core: CoreId, msg: &Msg) {
        self.push(core, msg.interface(), BufferType::Ctrl, msg.encode());
    }

    fn push(&self, core: CoreId, if_num: u32, ty: BufferType, data: Vec<u8>) {
        let Ok(ctx) = self.top.core(core) else {
            return;
        };
        let Some(ring) = ctx.n2h(DATA_QUEUE_0) else {
            return;
        };

        let len = data.len() as u16;
        let desc = Desc {
            interface_num: if_num,
            buffer_len: len,
            payload_len: len,
            bit_flags: (DescFlags::FIRST_SEGMENT | DescFlags::LAST_SEGMENT)
                .bits(),
            buffer_type: ty as u8,
            ..Default::default()
        };
        if ring.shared().push(Entry::new(desc, Some(Nbuf::from_vec(data)))).is_err() {
            return;
        }

        self.hal.raise(core, N2hIntr::DATA_COMMAND_QUEUE);
        let budget = self.top.rx_budget();
        while let Ok(done) = self.top.handle_irq(core, budget) {
            if done < budget {
                break;
            }
        }
    }
}

/// A netdev with a fixed name, index and MAC.
pub struct FakeNetdev {
    pub name: String,
    pub ifindex: u32,
    pub mac: [u8; 6],
    pub features: u32,
}

impl FakeNetdev {
    pub fn new(name: &str, ifindex: u32) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            ifindex,
            mac: [0xa8, 0x40, 0x25, 0, 0, ifindex as u8],
            features: 0,
        })
    }
}

impl Netdev for FakeNetdev {
    fn name(&self) -> &str {
        &self.name
    }

    fn ifindex(&self) -> u32 {
        self.ifindex
    }

    fn mac_addr(&self) -> [u8; 6] {
        self.mac
    }

    fn features(&self) -> u32 {
        self.features
    }
}

/// A logger whose output the test harness captures.
pub fn test_logger() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!("unit" => "test"))
}

/// A driver attached to a simulated firmware, with every log line
/// recorded.
pub struct Harness {
    pub drv: Driver,
    pub hal: Arc<SimHal>,
    pub log: Arc<RecordLog>,
    pub fw: SimFirmware,
}

impl Harness {
    pub fn new(cfg: &DriverCfg) -> anyhow::Result<Self> {
        let hal = Arc::new(SimHal::new());
        let log = Arc::new(RecordLog::new());
        let drv = Driver::attach(
            cfg,
            hal.clone(),
            Providers { log: Box::new(log.clone()) },
        )?;
        let fw = SimFirmware::start(drv.top().clone(), hal.clone());
        Ok(Self { drv, hal, log, fw })
    }

    pub fn top(&self) -> &Arc<NssTop> {
        self.drv.top()
    }
}
