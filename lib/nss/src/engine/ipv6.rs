// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The IPv6 forwarding engine: statistics sync, notifications and
//! connection table sizing.
use super::Error;
use super::Result;
use super::core::NssCtx;
use super::handler::MsgHandler;
use super::msg::AppData;
use super::msg::Msg;
use super::msg::MsgBounds;
use super::msg::MsgCallback;
use super::sync::SyncAdapter;
use super::top::NssTop;
use crate::api::IPV6_RX_INTERFACE;
use crate::api::NBUF_PAYLOAD_SIZE;
use crate::api::PAGE_SIZE;
use crate::api::ipv6::IPV6_CONN_SYNC_LEN;
use crate::api::ipv6::IPV6_CONN_SYNC_MANY_HDR_LEN;
use crate::api::ipv6::IPV6_MSG_MAX_LEN;
use crate::api::ipv6::IPV6_MSG_TYPE_MAX;
use crate::api::ipv6::Ipv6ConnCfg;
use crate::api::ipv6::Ipv6ConnSync;
use crate::api::ipv6::Ipv6ConnSyncManyHdr;
use crate::api::ipv6::Ipv6MsgType;
use crate::api::ipv6::Ipv6NodeSync;
use crate::api::ipv6::MAX_TOTAL_NUM_CONN;
use crate::api::ipv6::MIN_NUM_CONN;
use crate::ddi::sync::KMutex;
use crate::ddi::sync::KRwLock;
use crate::provider::LogLevel;
use std::sync::Arc;
use std::sync::Weak;

const BOUNDS: MsgBounds = MsgBounds {
    name: "ipv6",
    max_type: IPV6_MSG_TYPE_MAX,
    max_len: IPV6_MSG_MAX_LEN as u32,
};

/// Check a pair of connection table sizes. Each must be a power of two
/// no smaller than [`MIN_NUM_CONN`], and together they may not exceed
/// [`MAX_TOTAL_NUM_CONN`].
pub fn validate_conn_counts(ipv4: u32, ipv6: u32) -> Result<()> {
    for conn in [ipv4, ipv6] {
        if !conn.is_power_of_two() {
            return Err(Error::BadParam(
                "connection count must be a power of two",
            ));
        }

        if conn < MIN_NUM_CONN {
            return Err(Error::BadParam("connection count below minimum"));
        }
    }

    match ipv4.checked_add(ipv6) {
        Some(sum) if sum <= MAX_TOTAL_NUM_CONN => Ok(()),
        _ => Err(Error::BadParam("ipv4 + ipv6 connection counts too large")),
    }
}

pub struct Ipv6 {
    top: Arc<NssTop>,
    notify: KRwLock<Option<(MsgCallback, Option<AppData>)>>,
    conn_cfg: SyncAdapter,
    // Serializes reconfiguration so the restore on failure puts back
    // the value this caller replaced.
    cfg_lock: KMutex<()>,
}

impl Ipv6 {
    pub fn new(top: Arc<NssTop>) -> Arc<Self> {
        let timeout = top.timeouts().conn_cfg();
        Arc::new(Self {
            top,
            notify: KRwLock::new(None),
            conn_cfg: SyncAdapter::new("ipv6_conn_cfg", timeout),
            cfg_lock: KMutex::new(()),
        })
    }

    pub fn register_handler(self: &Arc<Self>) -> Result<()> {
        self.top.register_handler(IPV6_RX_INTERFACE, self.clone())
    }

    pub fn get_mgr(&self) -> Result<&Arc<NssCtx>> {
        self.top.core(self.top.routing().ipv6)
    }

    pub fn notify_register(
        &self,
        cb: MsgCallback,
        app_data: Option<AppData>,
    ) -> Result<&Arc<NssCtx>> {
        *self.notify.write() = Some((cb, app_data));
        self.get_mgr()
    }

    pub fn notify_unregister(&self) {
        *self.notify.write() = None;
    }

    pub fn tx(&self, msg: Msg) -> Result<()> {
        self.tx_with_size(msg, NBUF_PAYLOAD_SIZE)
    }

    /// Send a message in a control buffer of `size` bytes. A buffer may
    /// not exceed a page.
    pub fn tx_with_size(&self, msg: Msg, size: usize) -> Result<()> {
        let ctx = self.get_mgr()?;
        if !ctx.is_ready() {
            self.top.log(
                LogLevel::Warn,
                &format!("ipv6: {}: msg dropped as core not ready", ctx.id()),
            );
            return Err(Error::NotReady);
        }

        BOUNDS.check_tx(&msg, |i| i == IPV6_RX_INTERFACE)?;

        if size > PAGE_SIZE {
            self.top.log(
                LogLevel::Warn,
                &format!("ipv6: tx request size too large: {size}"),
            );
            return Err(Error::TooLarge { len: size, max: PAGE_SIZE });
        }

        if msg.encoded_len() > size {
            return Err(Error::TooLarge { len: msg.encoded_len(), max: size });
        }

        self.top.tx_ctrl(ctx, msg)
    }

    /// The IPv6 connection table size currently configured.
    pub fn max_conn_count(&self) -> u32 {
        self.top.conn_counts().ipv6
    }

    /// Ask the firmware to size the IPv6 connection table for `conn`
    /// entries. `cb`, if given, receives the firmware's answer.
    pub fn conn_cfg_process(&self, conn: u32, cb: Option<MsgCallback>) -> Result<()> {
        let msg = self.conn_cfg_msg(conn)?;
        let msg = match cb {
            Some(cb) => msg.with_callback(cb, None),
            None => msg,
        };

        self.tx(msg).inspect_err(|e| {
            self.top.log(
                LogLevel::Warn,
                &format!("ipv6: error setting {conn} connections: {e}"),
            )
        })
    }

    /// Reconfigure the connection table and wait for the firmware to
    /// accept it. On any failure the previous count is restored.
    pub fn set_conn_count(&self, conn: u32) -> Result<()> {
        let _guard = self.cfg_lock.lock();
        let msg = self.conn_cfg_msg(conn)?;
        let old = self.top.with_conn_counts(|c| core::mem::replace(&mut c.ipv6, conn));

        let res = self.conn_cfg.call_ack(&self.top, msg, |m| self.tx(m));
        if let Err(e) = &res {
            self.top.with_conn_counts(|c| c.ipv6 = old);
            self.top.log(
                LogLevel::Warn,
                &format!(
                    "ipv6: connection count {conn} not applied, kept {old}: {e}"
                ),
            );
        }
        res.map(|_| ())
    }

    /// Reconfigure the connection table without waiting. The firmware's
    /// answer is only logged; the new count is kept unless the request
    /// could not be sent.
    pub fn update_conn_count(&self, conn: u32) -> Result<()> {
        let _guard = self.cfg_lock.lock();
        let old = self.top.with_conn_counts(|c| core::mem::replace(&mut c.ipv6, conn));

        let top: Weak<NssTop> = Arc::downgrade(&self.top);
        let cb: MsgCallback = Arc::new(move |_, reply| {
            let Some(top) = top.upgrade() else { return };
            if reply.is_ack() {
                top.log(LogLevel::Note, "ipv6: connection count update success");
            } else {
                top.log(
                    LogLevel::Warn,
                    &format!(
                        "ipv6: connection count update failed with error: {}",
                        reply.cm.error
                    ),
                );
            }
        });

        self.conn_cfg_process(conn, Some(cb)).inspect_err(|_| {
            self.top.with_conn_counts(|c| c.ipv6 = old);
        })
    }

    fn conn_cfg_msg(&self, conn: u32) -> Result<Msg> {
        validate_conn_counts(self.top.conn_counts().ipv4, conn).inspect_err(|e| {
            self.top.log(
                LogLevel::Warn,
                &format!(
                    "ipv6: {conn} connections rejected: {e}; must be a power \
                     of two, at least {MIN_NUM_CONN}, and with IPv4 at most \
                     {MAX_TOTAL_NUM_CONN}"
                ),
            )
        })?;

        Ok(Msg::new(
            IPV6_RX_INTERFACE,
            Ipv6MsgType::ConnCfgRule as u32,
            &Ipv6ConnCfg { num_conn: conn.to_be() },
        ))
    }

    fn conn_sync_many(&self, ctx: &NssCtx, msg: &Msg) {
        let Some(hdr) = msg.read_at::<Ipv6ConnSyncManyHdr>(0) else {
            return;
        };

        let count = usize::from(hdr.count);
        if count * IPV6_CONN_SYNC_LEN >= usize::from(hdr.size) {
            self.top.log(
                LogLevel::Warn,
                &format!(
                    "ipv6: {}: stats sync count {} exceeds the size of this \
                     msg {}",
                    ctx.id(),
                    hdr.count,
                    hdr.size
                ),
            );
            return;
        }

        self.top.with_global_stats(|g| {
            (0..count)
                .map_while(|i| {
                    msg.read_at::<Ipv6ConnSync>(
                        IPV6_CONN_SYNC_MANY_HDR_LEN + i * IPV6_CONN_SYNC_LEN,
                    )
                })
                .for_each(|sync| g.ipv6.add_conn(&sync))
        });
    }
}

impl MsgHandler for Ipv6 {
    fn bounds(&self) -> &MsgBounds {
        &BOUNDS
    }

    fn owns_interface(&self, if_num: u32) -> bool {
        if_num == IPV6_RX_INTERFACE
    }

    fn handle(&self, ctx: &NssCtx, msg: &Msg) {
        match Ipv6MsgType::try_from(msg.msg_type()) {
            Ok(Ipv6MsgType::NodeStatsSync) => {
                let sync: Ipv6NodeSync = msg.read();
                self.top.with_global_stats(|g| {
                    g.add_node(IPV6_RX_INTERFACE, &sync.node_stats);
                    g.ipv6.add_node(&sync);
                });
            }

            Ok(Ipv6MsgType::ConnStatsSync) => {
                let sync: Ipv6ConnSync = msg.read();
                self.top.with_global_stats(|g| g.ipv6.add_conn(&sync));
            }

            Ok(Ipv6MsgType::ConnStatsSyncMany) => self.conn_sync_many(ctx, msg),

            _ => {}
        }

        if !msg.is_notify() {
            self.top.complete(msg);
            return;
        }

        let notifier = self.notify.read().clone();
        if let Some((cb, app_data)) = notifier {
            cb(app_data.as_ref(), msg);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::CoreId;
    use crate::api::NodeStatsSync;
    use crate::api::Response;
    use crate::cfg::DriverCfg;
    use crate::engine::core::CMD_QUEUE;
    use crate::engine::top::test_top;
    use core::sync::atomic::AtomicUsize;
    use core::sync::atomic::Ordering;
    use zerocopy::IntoBytes;

    fn notify(ty: Ipv6MsgType, payload: Vec<u8>) -> Msg {
        let mut cm = crate::api::CmnMsg::new(
            IPV6_RX_INTERFACE,
            ty as u32,
            payload.len() as u32,
        );
        cm.response = Response::Notify as u32;
        Msg::from_parts(cm, payload)
    }

    fn conn(rx: u32) -> Ipv6ConnSync {
        Ipv6ConnSync {
            flow_rx_packet_count: rx,
            return_rx_packet_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn conn_count_rules() {
        assert!(validate_conn_counts(4096, 4096).is_ok());
        assert!(validate_conn_counts(256, 256).is_ok());
        assert!(validate_conn_counts(4096, 3000).is_err());
        assert!(validate_conn_counts(4096, 128).is_err());
        assert!(validate_conn_counts(4096, 8192).is_err());
        assert!(validate_conn_counts(0, 1024).is_err());
    }

    #[test]
    fn stats_sync_accumulates() {
        let (top, _, _) = test_top(&DriverCfg::default());
        let ipv6 = Ipv6::new(top.clone());
        ipv6.register_handler().unwrap();
        let ctx = top.core(CoreId::Core0).unwrap();

        let node = Ipv6NodeSync {
            node_stats: NodeStatsSync { rx_packets: 3, ..Default::default() },
            fragmentations: 2,
            ..Default::default()
        };
        top.dispatch_msg(
            ctx,
            notify(Ipv6MsgType::NodeStatsSync, node.as_bytes().to_vec()),
        );
        top.dispatch_msg(
            ctx,
            notify(Ipv6MsgType::ConnStatsSync, conn(4).as_bytes().to_vec()),
        );

        let stats = top.global_stats();
        assert_eq!(stats.node(IPV6_RX_INTERFACE).rx_packets, 3);
        assert_eq!(stats.ipv6.fragmentations, 2);
        assert_eq!(stats.ipv6.accelerated_rx_pkts, 5);
    }

    #[test]
    fn sync_many_checks_its_size() {
        let (top, _, log) = test_top(&DriverCfg::default());
        let ipv6 = Ipv6::new(top.clone());
        ipv6.register_handler().unwrap();
        let ctx = top.core(CoreId::Core0).unwrap();

        let batch = |size: u16| {
            let hdr = Ipv6ConnSyncManyHdr { index: 0, next: 0, count: 2, size };
            let mut payload = hdr.as_bytes().to_vec();
            payload.extend_from_slice(conn(10).as_bytes());
            payload.extend_from_slice(conn(20).as_bytes());
            notify(Ipv6MsgType::ConnStatsSyncMany, payload)
        };

        top.dispatch_msg(ctx, batch((2 * IPV6_CONN_SYNC_LEN) as u16));
        assert_eq!(top.global_stats().ipv6.accelerated_rx_pkts, 0);
        assert_eq!(log.count_matching(LogLevel::Warn, "exceeds the size"), 1);

        top.dispatch_msg(ctx, batch((2 * IPV6_CONN_SYNC_LEN + 8) as u16));
        assert_eq!(top.global_stats().ipv6.accelerated_rx_pkts, 32);
    }

    #[test]
    fn notifications_reach_registered_callback() {
        let (top, _, _) = test_top(&DriverCfg::default());
        let ipv6 = Ipv6::new(top.clone());
        ipv6.register_handler().unwrap();
        let ctx = top.core(CoreId::Core0).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let cb: MsgCallback = Arc::new(move |_, _| {
            h.fetch_add(1, Ordering::Relaxed);
        });
        ipv6.notify_register(cb, None).unwrap();

        let msg = notify(Ipv6MsgType::ConnStatsSync, conn(1).as_bytes().to_vec());
        top.dispatch_msg(ctx, msg.clone());
        ipv6.notify_unregister();
        top.dispatch_msg(ctx, msg);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn conn_cfg_goes_out_big_endian() {
        let (top, _, _) = test_top(&DriverCfg::default());
        let ipv6 = Ipv6::new(top.clone());
        let ctx = top.core(CoreId::Core0).unwrap();

        ipv6.conn_cfg_process(2048, None).unwrap();
        let entry = ctx.h2n(CMD_QUEUE).unwrap().shared().pop().unwrap();
        let sent = Msg::decode(entry.nbuf.unwrap().as_slice()).unwrap();
        assert_eq!(sent.msg_type(), Ipv6MsgType::ConnCfgRule as u32);
        let cfg: Ipv6ConnCfg = sent.read();
        assert_eq!(u32::from_be(cfg.num_conn), 2048);

        assert!(ipv6.conn_cfg_process(1000, None).is_err());
        assert!(ctx.h2n(CMD_QUEUE).unwrap().shared().pop().is_none());
    }

    #[test]
    fn update_restores_when_unsent() {
        let (top, _, _) = test_top(&DriverCfg::default());
        let ipv6 = Ipv6::new(top.clone());
        let before = ipv6.max_conn_count();

        ipv6.update_conn_count(2048).unwrap();
        assert_eq!(ipv6.max_conn_count(), 2048);

        top.core(CoreId::Core0).unwrap().stop();
        assert_eq!(ipv6.update_conn_count(1024), Err(Error::NotReady));
        assert_eq!(ipv6.max_conn_count(), 2048);

        // Rejected outright.
        assert!(ipv6.update_conn_count(100).is_err());
        assert_ne!(ipv6.max_conn_count(), before);
    }

    #[test]
    fn oversize_buffers_refused() {
        let (top, _, _) = test_top(&DriverCfg::default());
        let ipv6 = Ipv6::new(top.clone());
        let msg = Msg::new(IPV6_RX_INTERFACE, 0, &conn(1));
        assert!(matches!(
            ipv6.tx_with_size(msg.clone(), PAGE_SIZE + 1),
            Err(Error::TooLarge { .. })
        ));
        assert!(matches!(
            ipv6.tx_with_size(msg, 16),
            Err(Error::TooLarge { .. })
        ));
        let ctx = top.core(CoreId::Core0).unwrap();
        assert_eq!(ctx.h2n(CMD_QUEUE).unwrap().occupancy(), 0);
    }
}
