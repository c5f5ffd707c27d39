// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The driver instance.
//!
//! Everything that would otherwise be process-wide lives here: the
//! per-core contexts, the handler table, requests in flight, data-path
//! registrations, and the shared statistics. Subsystems are handed an
//! `Arc<NssTop>` when they are built, so several instances can coexist
//! (as they do in tests).
use super::Error;
use super::Result;
use super::core::CMD_QUEUE;
use super::core::DATA_QUEUE_0;
use super::core::NssCtx;
use super::hal::Hal;
use super::handler::HandlerTable;
use super::handler::MsgHandler;
use super::handler::Registered;
use super::msg::AppData;
use super::msg::Msg;
use super::nbuf::Nbuf;
use super::ring::BufferType;
use super::ring::DescFlags;
use super::stats::DrvStats;
use super::stats::GlobalStats;
use super::sync::PendingTable;
use super::sync::Resolution;
use crate::api::CoreId;
use crate::api::MAX_NET_INTERFACES;
use crate::cfg::CoreRouting;
use crate::cfg::DriverCfg;
use crate::cfg::Timeouts;
use crate::ddi::kstat::KStatNamed;
use crate::ddi::kstat::KStatProvider;
use crate::ddi::sync::KMutex;
use crate::ddi::sync::KRwLock;
use crate::provider::LogLevel;
use crate::provider::LogProvider;
use crate::provider::Providers;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering;
use std::sync::Arc;

/// The host network device a data-path registration is bound to.
pub trait Netdev: Send + Sync {
    fn name(&self) -> &str;
    fn ifindex(&self) -> u32;
    fn mac_addr(&self) -> [u8; 6];

    fn features(&self) -> u32 {
        0
    }
}

pub type NetdevRef = Arc<dyn Netdev>;

/// Notification callback of subsystems that report against a netdev.
pub type NetdevMsgCallback = Arc<dyn Fn(&NetdevRef, &Msg) + Send + Sync>;

/// Receives packets for a registered interface.
pub type DataCallback = Arc<dyn Fn(Option<&NetdevRef>, Nbuf) + Send + Sync>;

/// Receives completed crypto buffers: context, buffer, device address,
/// payload length.
pub type CryptoBufCallback =
    Arc<dyn Fn(Option<&AppData>, Nbuf, u32, u16) + Send + Sync>;

/// A data-path registration for one interface.
#[derive(Clone, Default)]
pub struct DpRegister {
    pub cb: Option<DataCallback>,
    /// Takes precedence over `cb` when set.
    pub ext_cb: Option<DataCallback>,
    pub ndev: Option<NetdevRef>,
    pub features: u32,
}

impl DpRegister {
    pub fn new(cb: DataCallback, ndev: Option<NetdevRef>, features: u32) -> Self {
        Self { cb: Some(cb), ext_cb: None, ndev, features }
    }

    pub fn is_registered(&self) -> bool {
        self.cb.is_some() || self.ext_cb.is_some()
    }
}

/// Connection table sizes currently configured in the firmware.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnCounts {
    pub ipv4: u32,
    pub ipv6: u32,
}

pub struct NssTop {
    cores: Vec<Arc<NssCtx>>,
    handlers: HandlerTable,
    pending: PendingTable,
    dp: KRwLock<Vec<DpRegister>>,
    crypto_buf: KRwLock<Option<(CryptoBufCallback, Option<AppData>)>>,
    stats: KStatNamed<DrvStats>,
    global_stats: KMutex<GlobalStats>,
    log: Box<dyn LogProvider>,
    routing: CoreRouting,
    timeouts: Timeouts,
    rx_budget: usize,
    wifi_redirect: AtomicBool,
    conn: KMutex<ConnCounts>,
}

impl NssTop {
    /// Build an instance with every core present but not yet started.
    pub fn new(
        cfg: &DriverCfg,
        hal: Arc<dyn Hal>,
        providers: Providers,
    ) -> Result<Arc<Self>> {
        cfg.validate()?;

        let mut cores = Vec::with_capacity(usize::from(cfg.num_cores));
        for i in 0..cfg.num_cores {
            let id = CoreId::try_from(i)
                .map_err(|_| Error::Cfg(format!("bad core index {i}")))?;
            cores.push(Arc::new(NssCtx::new(id, cfg, hal.clone())));
        }

        let stats = KStatNamed::new("nss", "drv", DrvStats::new())
            .map_err(|e| Error::Cfg(e.to_string()))?;

        Ok(Arc::new(Self {
            cores,
            handlers: HandlerTable::new(),
            pending: PendingTable::new(),
            dp: KRwLock::new(vec![DpRegister::default(); MAX_NET_INTERFACES as usize]),
            crypto_buf: KRwLock::new(None),
            stats,
            global_stats: KMutex::new(GlobalStats::default()),
            log: providers.log,
            routing: cfg.routing.clone(),
            timeouts: cfg.timeouts.clone(),
            rx_budget: cfg.rx_budget,
            wifi_redirect: AtomicBool::new(cfg.wifi_redirect),
            conn: KMutex::new(ConnCounts {
                ipv4: cfg.conn.ipv4_num_conn,
                ipv6: cfg.conn.ipv6_num_conn,
            }),
        }))
    }

    pub fn core(&self, id: CoreId) -> Result<&Arc<NssCtx>> {
        self.cores.get(id.index()).ok_or(Error::NotReady)
    }

    pub fn cores(&self) -> &[Arc<NssCtx>] {
        &self.cores
    }

    /// Mark every core live.
    pub fn start(&self) {
        self.cores.iter().for_each(|c| c.start());
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub fn stats(&self) -> &KStatNamed<DrvStats> {
        &self.stats
    }

    /// Run `f` under the global stats lock.
    pub fn with_global_stats<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut GlobalStats) -> R,
    {
        f(&mut self.global_stats.lock())
    }

    pub fn global_stats(&self) -> GlobalStats {
        self.global_stats.lock().clone()
    }

    pub fn log(&self, level: LogLevel, msg: &str) {
        self.log.log(level, msg);
    }

    pub fn log_provider(&self) -> &dyn LogProvider {
        self.log.as_ref()
    }

    pub fn routing(&self) -> &CoreRouting {
        &self.routing
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn rx_budget(&self) -> usize {
        self.rx_budget
    }

    pub fn wifi_redirect(&self) -> bool {
        self.wifi_redirect.load(Ordering::Relaxed)
    }

    pub fn set_wifi_redirect(&self, on: bool) {
        self.wifi_redirect.store(on, Ordering::Relaxed);
    }

    pub fn conn_counts(&self) -> ConnCounts {
        *self.conn.lock()
    }

    pub(crate) fn with_conn_counts<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut ConnCounts) -> R,
    {
        f(&mut self.conn.lock())
    }

    /// Install a message handler for `if_num`, replacing any existing
    /// one.
    pub fn register_handler(
        &self,
        if_num: u32,
        handler: Arc<dyn MsgHandler>,
    ) -> Result<()> {
        let name = handler.bounds().name;
        if self.handlers.register(if_num, handler)? == Registered::Replaced {
            self.log(
                LogLevel::Note,
                &format!("{name}: replaced handler for interface {if_num}"),
            );
        }
        Ok(())
    }

    pub fn unregister_handler(&self, if_num: u32) -> Result<()> {
        self.handlers.unregister(if_num)
    }

    pub fn dp_register(&self, if_num: u32, reg: DpRegister) -> Result<()> {
        let mut dp = self.dp.write();
        let slot =
            dp.get_mut(if_num as usize).ok_or(Error::OutOfRange(if_num))?;
        *slot = reg;
        Ok(())
    }

    pub fn dp_unregister(&self, if_num: u32) -> Result<()> {
        self.dp_register(if_num, DpRegister::default())
    }

    /// Modify a registration in place.
    pub fn update_dp<R, F>(&self, if_num: u32, f: F) -> Result<R>
    where
        F: FnOnce(&mut DpRegister) -> R,
    {
        let mut dp = self.dp.write();
        let slot =
            dp.get_mut(if_num as usize).ok_or(Error::OutOfRange(if_num))?;
        Ok(f(slot))
    }

    /// A copy of the registration for `if_num`; empty when out of range.
    pub fn dp(&self, if_num: u32) -> DpRegister {
        self.dp.read().get(if_num as usize).cloned().unwrap_or_default()
    }

    pub fn register_crypto_buf(
        &self,
        cb: CryptoBufCallback,
        app_data: Option<AppData>,
    ) {
        *self.crypto_buf.write() = Some((cb, app_data));
    }

    pub fn unregister_crypto_buf(&self) {
        *self.crypto_buf.write() = None;
    }

    /// Send a control message on the command queue.
    ///
    /// A message carrying a reply route is armed in the pending table
    /// first and disarmed again if the send fails, so a caller never
    /// waits on a request that did not go out.
    pub fn tx_ctrl(&self, ctx: &NssCtx, mut msg: Msg) -> Result<()> {
        if !ctx.is_ready() {
            return Err(Error::NotReady);
        }

        let id = msg.take_reply().map(|r| self.pending.arm(r));
        msg.cm.cb = id.unwrap_or(0);
        msg.cm.app_data = 0;

        let nbuf = Nbuf::from_vec(msg.encode());
        match ctx.send_buffer(
            0,
            nbuf,
            CMD_QUEUE,
            BufferType::Ctrl,
            DescFlags::empty(),
        ) {
            Ok(()) => {
                self.stats.vals.tx_cmd_req.incr(1);
                Ok(())
            }

            Err(e) => {
                if let Some(id) = id {
                    self.pending.cancel(id);
                }
                if matches!(e, Error::QueueFull(_)) {
                    self.stats.vals.queue_full.incr(1);
                }
                Err(e)
            }
        }
    }

    /// Send a packet on the data queue.
    pub fn tx_data(
        &self,
        ctx: &NssCtx,
        if_num: u32,
        nbuf: Nbuf,
        flags: DescFlags,
    ) -> Result<()> {
        match ctx.send_buffer(
            if_num,
            nbuf,
            DATA_QUEUE_0,
            BufferType::Packet,
            flags,
        ) {
            Ok(()) => {
                self.stats.vals.tx_packet.incr(1);
                Ok(())
            }

            Err(e) => {
                if matches!(e, Error::QueueFull(_)) {
                    self.stats.vals.queue_full.incr(1);
                }
                Err(e)
            }
        }
    }

    /// Hand a response to the request it answers.
    ///
    /// Responses for requests nobody is waiting on any more are counted
    /// and logged, never delivered.
    pub fn complete(&self, msg: &Msg) -> Resolution {
        let res = self.pending.resolve(msg);
        if let Resolution::Late(id) = res {
            self.stats.vals.rx_late.incr(1);
            self.log(
                LogLevel::Warn,
                &format!(
                    "late response to request {id} on interface {}, \
                     type {}, response {}",
                    msg.interface(),
                    msg.msg_type(),
                    msg.cm.response
                ),
            );
            late_response_probe(msg.interface(), id, msg.cm.response);
        }
        res
    }

    /// Service one core's interrupt causes. Returns the work done; a
    /// result equal to `budget` means more may be pending.
    pub fn handle_irq(&self, core: CoreId, budget: usize) -> Result<usize> {
        let ctx = self.core(core)?;
        Ok(ctx.service(self, budget))
    }

    pub(crate) fn deliver_packet(&self, if_num: u32, nbuf: Nbuf) {
        let reg = self.dp(if_num);
        match reg.ext_cb.as_ref().or(reg.cb.as_ref()) {
            Some(cb) => cb(reg.ndev.as_ref(), nbuf),
            None => self.stats.vals.rx_dropped.incr(1),
        }
    }

    pub(crate) fn deliver_crypto(&self, nbuf: Nbuf, paddr: u32, len: u16) {
        let reg = self.crypto_buf.read().clone();
        match reg {
            Some((cb, app_data)) => cb(app_data.as_ref(), nbuf, paddr, len),
            None => self.stats.vals.rx_dropped.incr(1),
        }
    }

    /// Quiesce the instance: stop every core and drop all handlers and
    /// registrations. Callers blocked on a request in flight wake up
    /// with [`Error::NotReady`].
    pub fn shutdown(&self) {
        self.cores.iter().for_each(|c| c.stop());
        self.handlers.clear();
        self.dp.write().iter_mut().for_each(|r| *r = DpRegister::default());
        self.unregister_crypto_buf();
        self.pending.clear();
    }
}

fn late_response_probe(iface: u32, req_id: u32, resp: u32) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            crate::nss_provider::late__response!(|| (iface, req_id, resp));
        } else {
            let (_, _, _) = (iface, req_id, resp);
        }
    }
}

/// An instance on a simulated interrupt block, with every core started
/// and all logging recorded.
#[cfg(test)]
pub(crate) fn test_top(
    cfg: &DriverCfg,
) -> (Arc<NssTop>, Arc<super::hal::SimHal>, Arc<crate::provider::RecordLog>) {
    let hal = Arc::new(super::hal::SimHal::new());
    let log = Arc::new(crate::provider::RecordLog::new());
    let top = NssTop::new(
        cfg,
        hal.clone(),
        Providers { log: Box::new(log.clone()) },
    )
    .unwrap();
    top.start();
    (top, hal, log)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::Response;
    use crate::engine::msg::MsgCallback;
    use crate::engine::msg::ReplyTo;
    use crate::engine::sync::Completion;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn tx_ctrl_arms_and_stamps_request_id() {
        let (top, hal, _) = test_top(&DriverCfg::default());
        let ctx = top.core(CoreId::Core0).unwrap();
        let done = Arc::new(Completion::new());
        let msg = Msg::header_only(5, 0).with_reply(ReplyTo::Waiter(done.clone()));
        top.tx_ctrl(ctx, msg).unwrap();

        assert_eq!(hal.doorbell_count(), 1);
        assert!(top.pending().is_pending(done.id()));
        let entry = ctx.h2n(CMD_QUEUE).unwrap().shared().pop().unwrap();
        let sent = Msg::decode(entry.nbuf.unwrap().as_slice()).unwrap();
        assert_eq!(sent.cm.cb, done.id());
        assert_eq!(sent.cm.app_data, 0);
        assert_eq!(top.stats().vals.tx_cmd_req.val(), 1);
    }

    #[test]
    fn failed_send_disarms_request() {
        let cfg = DriverCfg { h2n_ring_size: 2, ..Default::default() };
        let (top, _, _) = test_top(&cfg);
        let ctx = top.core(CoreId::Core0).unwrap();
        for _ in 0..2 {
            top.tx_ctrl(ctx, Msg::header_only(5, 0)).unwrap();
        }

        let done = Arc::new(Completion::new());
        let msg = Msg::header_only(5, 0).with_reply(ReplyTo::Waiter(done.clone()));
        assert_eq!(top.tx_ctrl(ctx, msg), Err(Error::QueueFull(CMD_QUEUE)));
        assert_eq!(top.pending().len(), 0);
        assert_eq!(top.stats().vals.queue_full.val(), 1);
    }

    #[test]
    fn not_ready_core_refuses_control() {
        let (top, hal, _) = test_top(&DriverCfg::default());
        let ctx = top.core(CoreId::Core1).unwrap();
        ctx.stop();
        let cb: MsgCallback = Arc::new(|_, _| {});
        let msg = Msg::header_only(5, 0).with_callback(cb, None);
        assert_eq!(top.tx_ctrl(ctx, msg), Err(Error::NotReady));
        assert_eq!(top.pending().len(), 0);
        assert_eq!(hal.doorbell_count(), 0);
    }

    #[test]
    fn late_responses_are_counted() {
        let (top, _, log) = test_top(&DriverCfg::default());
        let mut reply = Msg::header_only(5, 0).as_response(Response::Ack, 0);
        reply.cm.cb = 77;
        assert_eq!(top.complete(&reply), Resolution::Late(77));
        assert_eq!(top.stats().vals.rx_late.val(), 1);
        assert_eq!(log.count_matching(LogLevel::Warn, "late response"), 1);
    }

    #[test]
    fn packets_follow_registration() {
        let (top, _, _) = test_top(&DriverCfg::default());
        let hits = Arc::new(AtomicUsize::new(0));
        let ext_hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let cb: DataCallback = Arc::new(move |_, nbuf| {
            h.fetch_add(nbuf.len(), Ordering::Relaxed);
        });

        top.deliver_packet(3, Nbuf::from_vec(vec![0; 4]));
        assert_eq!(top.stats().vals.rx_dropped.val(), 1);

        top.dp_register(3, DpRegister::new(cb, None, 0)).unwrap();
        top.deliver_packet(3, Nbuf::from_vec(vec![0; 4]));
        assert_eq!(hits.load(Ordering::Relaxed), 4);

        let e = ext_hits.clone();
        top.update_dp(3, |r| {
            r.ext_cb = Some(Arc::new(move |_, _| {
                e.fetch_add(1, Ordering::Relaxed);
            }))
        })
        .unwrap();
        top.deliver_packet(3, Nbuf::from_vec(vec![0; 4]));
        assert_eq!(hits.load(Ordering::Relaxed), 4);
        assert_eq!(ext_hits.load(Ordering::Relaxed), 1);

        top.dp_unregister(3).unwrap();
        assert!(!top.dp(3).is_registered());
        assert!(top.dp_register(MAX_NET_INTERFACES, DpRegister::default()).is_err());
    }

    #[test]
    fn shutdown_drops_everything() {
        let (top, _, _) = test_top(&DriverCfg::default());
        let cb: MsgCallback = Arc::new(|_, _| {});
        top.pending().arm(ReplyTo::Callback { cb, app_data: None });
        top.shutdown();
        assert_eq!(top.pending().len(), 0);
        assert!(top.cores().iter().all(|c| !c.is_ready()));
    }
}
