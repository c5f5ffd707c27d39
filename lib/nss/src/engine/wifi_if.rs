// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Wifi virtual interfaces.
//!
//! Creating an interface is a three-step exchange with the firmware:
//! allocate a dynamic node, route its messages here, then tell the
//! firmware the node is a wifi interface with the netdev's MAC. Any
//! step failing undoes the ones before it.
use super::Error;
use super::Result;
use super::core::NssCtx;
use super::dynamic_interface::DynamicInterface;
use super::handler::MsgHandler;
use super::msg::AppData;
use super::msg::Msg;
use super::msg::MsgBounds;
use super::msg::MsgCallback;
use super::nbuf::Nbuf;
use super::ring::DescFlags;
use super::sync::SyncAdapter;
use super::top::DataCallback;
use super::top::DpRegister;
use super::top::NetdevRef;
use super::top::NssTop;
use crate::api::CoreId;
use crate::api::DynamicIfType;
use crate::api::ETH_HLEN;
use crate::api::MAX_DYNAMIC_INTERFACES;
use crate::api::NodeStats;
use crate::api::dynamic_index;
use crate::api::wifi_if::WIFI_IF_MSG_MAX;
use crate::api::wifi_if::WIFI_IF_MSG_MAX_LEN;
use crate::api::wifi_if::WifiIfCreate;
use crate::api::wifi_if::WifiIfMsgType;
use crate::api::wifi_if::WifiIfStatsSync;
use crate::ddi::sync::KMutex;
use crate::ddi::sync::KRwLock;
use crate::provider::LogLevel;
use serde::Serialize;
use std::sync::Arc;

const BOUNDS: MsgBounds = MsgBounds {
    name: "wifi_if",
    max_type: WIFI_IF_MSG_MAX,
    max_len: WIFI_IF_MSG_MAX_LEN as u32,
};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct WifiIfStats {
    pub node: NodeStats,
    pub tx_enqueue_failed: u64,
    pub shaper_enqueue_failed: u64,
}

impl WifiIfStats {
    fn add(&mut self, sync: &WifiIfStatsSync) {
        self.node.accumulate(&sync.node_stats);
        self.tx_enqueue_failed += u64::from(sync.tx_enqueue_failed);
        self.shaper_enqueue_failed += u64::from(sync.shaper_enqueue_failed);
    }

    /// The counters in display order.
    pub fn entries(&self) -> [(&'static str, u64); 7] {
        [
            ("rx_packets", self.node.rx_packets),
            ("rx_bytes", self.node.rx_bytes),
            ("rx_dropped", self.node.rx_dropped),
            ("tx_packets", self.node.tx_packets),
            ("tx_bytes", self.node.tx_bytes),
            ("tx_enqueue_failed", self.tx_enqueue_failed),
            ("shaper_enqueue_failed", self.shaper_enqueue_failed),
        ]
    }
}

/// One wifi interface created in the firmware.
pub struct WifiIfHandle {
    if_num: u32,
    core: CoreId,
    notify: KRwLock<Option<(MsgCallback, Option<AppData>)>>,
    stats: KMutex<WifiIfStats>,
    sync: SyncAdapter,
}

impl WifiIfHandle {
    pub fn if_num(&self) -> u32 {
        self.if_num
    }

    pub fn core(&self) -> CoreId {
        self.core
    }

    pub fn stats(&self) -> WifiIfStats {
        *self.stats.lock()
    }

    /// Route unsolicited events for this interface to `cb`.
    pub fn set_notify(&self, cb: MsgCallback, app_data: Option<AppData>) {
        *self.notify.write() = Some((cb, app_data));
    }

    pub fn clear_notify(&self) {
        *self.notify.write() = None;
    }
}

pub struct WifiIf {
    top: Arc<NssTop>,
    di: Arc<DynamicInterface>,
    handles: KRwLock<Vec<Option<Arc<WifiIfHandle>>>>,
}

impl WifiIf {
    pub fn new(top: Arc<NssTop>, di: Arc<DynamicInterface>) -> Arc<Self> {
        Arc::new(Self {
            top,
            di,
            handles: KRwLock::new(vec![None; MAX_DYNAMIC_INTERFACES as usize]),
        })
    }

    fn ctx(&self) -> Result<&Arc<NssCtx>> {
        self.top.core(self.top.routing().wlan)
    }

    /// The live handle for `if_num`, if any.
    pub fn handle(&self, if_num: u32) -> Option<Arc<WifiIfHandle>> {
        let idx = dynamic_index(if_num)?;
        self.handles.read().get(idx).cloned().flatten()
    }

    /// Create a wifi interface for `ndev`.
    ///
    /// Blocks on two firmware round trips.
    pub fn create(self: &Arc<Self>, ndev: NetdevRef) -> Result<Arc<WifiIfHandle>> {
        let ctx = self.ctx()?;
        if !ctx.is_ready() {
            self.top.log(
                LogLevel::Warn,
                &format!(
                    "wifi_if: {}: interface could not be created as core not \
                     ready",
                    ctx.id()
                ),
            );
            return Err(Error::NotReady);
        }

        let handle = self.handle_create(ctx.id())?;
        let if_num = handle.if_num;

        let res = self
            .top
            .register_handler(if_num, self.clone())
            .and_then(|()| {
                let body = WifiIfCreate {
                    flags: 0,
                    mac_addr: ndev.mac_addr(),
                    _pad: [0; 2],
                };
                let msg = Msg::new(if_num, WifiIfMsgType::TxCreate as u32, &body);
                handle.sync.call_ack(&self.top, msg, |m| self.tx_msg(m))
            });

        if let Err(e) = res {
            self.top.log(
                LogLevel::Warn,
                &format!("wifi_if: create of interface {if_num} failed: {e}"),
            );
            // The original error is what the caller needs; a failed
            // rollback is only logged.
            let _ = self.handle_destroy(&handle);
            return Err(e);
        }

        self.top.update_dp(if_num, |reg| {
            if reg.ndev.is_none() {
                reg.ndev = Some(ndev);
            }
        })?;
        Ok(handle)
    }

    /// Tear down an interface made by [`WifiIf::create`].
    pub fn destroy(&self, handle: &WifiIfHandle) -> Result<()> {
        let ctx = self.ctx()?;
        if !ctx.is_ready() {
            return Err(Error::NotReady);
        }

        let if_num = handle.if_num;
        let ndev = self.top.update_dp(if_num, |reg| reg.ndev.take())?;
        if ndev.is_none() {
            self.top.log(
                LogLevel::Warn,
                &format!("wifi_if: destroy of interface {if_num}: no netdev"),
            );
            return Err(Error::BadParam("wifi interface has no netdev"));
        }

        self.handle_destroy(handle)
    }

    /// Deliver packets received on the interface to `rx_cb`.
    pub fn register(&self, handle: &WifiIfHandle, rx_cb: DataCallback, ndev: NetdevRef) -> Result<()> {
        let features = ndev.features();
        self.top.dp_register(handle.if_num, DpRegister::new(rx_cb, Some(ndev), features))
    }

    pub fn unregister(&self, handle: &WifiIfHandle) -> Result<()> {
        self.top.dp_unregister(handle.if_num)
    }

    pub fn tx_msg(&self, msg: Msg) -> Result<()> {
        let ctx = self.ctx()?;
        if !ctx.is_ready() {
            return Err(Error::NotReady);
        }

        BOUNDS
            .check_tx(&msg, |i| self.di.is_dynamic(i))
            .and_then(|()| self.top.tx_ctrl(ctx, msg))
            .inspect_err(|e| {
                self.top.log(LogLevel::Warn, &format!("wifi_if: tx msg failed: {e}"))
            })
    }

    /// Hand a packet from the wifi driver to the firmware.
    pub fn tx_buf(&self, handle: &WifiIfHandle, nbuf: Nbuf) -> Result<()> {
        if !self.top.wifi_redirect() {
            return Err(Error::NotEnabled);
        }

        if nbuf.vlan_tci().is_some() {
            return Err(Error::NotSupported);
        }

        let ctx = self.top.core(handle.core)?;
        if !ctx.is_ready() {
            return Err(Error::NotReady);
        }

        if nbuf.len() <= ETH_HLEN {
            return Err(Error::TooShort(nbuf.len()));
        }

        self.top
            .tx_data(ctx, handle.if_num, nbuf, DescFlags::VIRTUAL_BUFFER)
            .inspect_err(|e| {
                self.top.log(
                    LogLevel::Warn,
                    &format!(
                        "wifi_if: packet for {} unable to enqueue: {e}",
                        handle.if_num
                    ),
                )
            })
    }

    /// Stat line `i` of interface `if_num`, as `name=value`.
    pub fn copy_stats(&self, if_num: u32, i: usize) -> Option<String> {
        let stats = self.handle(if_num)?.stats();
        stats.entries().get(i).map(|(name, val)| format!("{name}={val}\n"))
    }

    fn handle_create(&self, core: CoreId) -> Result<Arc<WifiIfHandle>> {
        let if_num = self.di.alloc_node(DynamicIfType::Wifi)?;
        let timeout = self.top.timeouts().wifi_if();
        let handle = Arc::new(WifiIfHandle {
            if_num,
            core,
            notify: KRwLock::new(None),
            stats: KMutex::new(WifiIfStats::default()),
            sync: SyncAdapter::new("wifi_if", timeout),
        });

        let stored = dynamic_index(if_num)
            .and_then(|i| self.handles.write().get_mut(i).map(|s| *s = Some(handle.clone())));
        if stored.is_none() {
            let _ = self.di.dealloc_node(if_num, DynamicIfType::Wifi);
            return Err(Error::BadInterface(if_num));
        }
        Ok(handle)
    }

    fn handle_destroy(&self, handle: &WifiIfHandle) -> Result<()> {
        let if_num = handle.if_num;
        if let Some(i) = dynamic_index(if_num) {
            self.handles.write()[i] = None;
        }

        if self.top.handlers().is_registered(if_num) {
            self.top.unregister_handler(if_num)?;
        }

        self.di.dealloc_node(if_num, DynamicIfType::Wifi).inspect_err(|e| {
            self.top.log(
                LogLevel::Warn,
                &format!("wifi_if: dynamic interface {if_num} destroy failed: {e}"),
            )
        })
    }
}

impl MsgHandler for WifiIf {
    fn bounds(&self) -> &MsgBounds {
        &BOUNDS
    }

    fn owns_interface(&self, if_num: u32) -> bool {
        self.di.is_dynamic(if_num)
    }

    fn handle(&self, ctx: &NssCtx, msg: &Msg) {
        let Some(handle) = self.handle(msg.interface()) else {
            self.top.log(
                LogLevel::Warn,
                &format!(
                    "wifi_if: {}: no handle for interface {}",
                    ctx.id(),
                    msg.interface()
                ),
            );
            return;
        };

        if let Ok(WifiIfMsgType::StatsSync) = WifiIfMsgType::try_from(msg.msg_type()) {
            let sync: WifiIfStatsSync = msg.read();
            handle.stats.lock().add(&sync);
        }

        if !msg.is_notify() {
            self.top.complete(msg);
            return;
        }

        let notifier = handle.notify.read().clone();
        if let Some((cb, app_data)) = notifier {
            cb(app_data.as_ref(), msg);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::CmnMsg;
    use crate::api::DYNAMIC_IF_START;
    use crate::api::NodeStatsSync;
    use crate::api::Response;
    use crate::cfg::DriverCfg;
    use crate::engine::core::DATA_QUEUE_0;
    use crate::engine::top::test_top;
    use zerocopy::IntoBytes;

    /// Install a handle as if `create` had succeeded, without a
    /// firmware to answer.
    fn fake_handle(wifi: &Arc<WifiIf>, if_num: u32) -> Arc<WifiIfHandle> {
        let handle = Arc::new(WifiIfHandle {
            if_num,
            core: CoreId::Core1,
            notify: KRwLock::new(None),
            stats: KMutex::new(WifiIfStats::default()),
            sync: SyncAdapter::new("wifi_if", std::time::Duration::from_millis(10)),
        });
        wifi.handles.write()[dynamic_index(if_num).unwrap()] = Some(handle.clone());
        wifi.top.register_handler(if_num, wifi.clone()).unwrap();
        handle
    }

    fn setup() -> (Arc<NssTop>, Arc<WifiIf>) {
        let (top, _, _) = test_top(&DriverCfg::default());
        let di = DynamicInterface::new(top.clone());
        (top.clone(), WifiIf::new(top, di))
    }

    #[test]
    fn tx_buf_gates_in_order() {
        let (top, wifi) = setup();
        let handle = fake_handle(&wifi, DYNAMIC_IF_START + 3);
        let ctx = top.core(CoreId::Core1).unwrap();
        let packet = || Nbuf::from_vec(vec![0xaa; 64]);

        top.set_wifi_redirect(false);
        assert_eq!(wifi.tx_buf(&handle, packet().with_vlan(5)), Err(Error::NotEnabled));
        top.set_wifi_redirect(true);
        assert_eq!(wifi.tx_buf(&handle, packet().with_vlan(5)), Err(Error::NotSupported));

        ctx.stop();
        assert_eq!(wifi.tx_buf(&handle, Nbuf::from_vec(vec![0; 4])), Err(Error::NotReady));
        ctx.start();
        assert_eq!(
            wifi.tx_buf(&handle, Nbuf::from_vec(vec![0; ETH_HLEN])),
            Err(Error::TooShort(ETH_HLEN))
        );
        assert_eq!(top.stats().vals.tx_packet.val(), 0);

        wifi.tx_buf(&handle, packet()).unwrap();
        assert_eq!(top.stats().vals.tx_packet.val(), 1);
        let entry = ctx.h2n(DATA_QUEUE_0).unwrap().shared().pop().unwrap();
        assert!(entry.desc.flags().contains(DescFlags::VIRTUAL_BUFFER));
        assert_eq!(entry.desc.interface_num, handle.if_num());
    }

    #[test]
    fn stats_sync_accumulates_per_handle() {
        let (top, wifi) = setup();
        let if_num = DYNAMIC_IF_START + 1;
        let handle = fake_handle(&wifi, if_num);
        let ctx = top.core(CoreId::Core1).unwrap();

        let sync = WifiIfStatsSync {
            node_stats: NodeStatsSync { rx_packets: 5, ..Default::default() },
            tx_enqueue_failed: 2,
            shaper_enqueue_failed: 1,
        };
        let mut cm = CmnMsg::new(if_num, WifiIfMsgType::StatsSync as u32, sync.as_bytes().len() as u32);
        cm.response = Response::Notify as u32;
        let msg = Msg::from_parts(cm, sync.as_bytes().to_vec());
        top.dispatch_msg(ctx, msg.clone());
        top.dispatch_msg(ctx, msg);

        let stats = handle.stats();
        assert_eq!(stats.node.rx_packets, 10);
        assert_eq!(stats.tx_enqueue_failed, 4);
        assert_eq!(wifi.copy_stats(if_num, 6).as_deref(), Some("shaper_enqueue_failed=2\n"));
        assert_eq!(wifi.copy_stats(if_num, 7), None);
        assert_eq!(wifi.copy_stats(if_num + 1, 0), None);
    }

    #[test]
    fn destroy_requires_netdev() {
        let (_, wifi) = setup();
        let handle = fake_handle(&wifi, DYNAMIC_IF_START);
        assert_eq!(
            wifi.destroy(&handle),
            Err(Error::BadParam("wifi interface has no netdev"))
        );
    }
}
