// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! MAP-T (IPv4/IPv6 translation) instances.
//!
//! Each instance lives on a dynamic interface of type
//! [`DynamicIfType::MapT`]. Rule configuration may be sent either
//! fire-and-forget ([`MapT::tx`]) or blocking ([`MapT::tx_sync`]).
use super::Error;
use super::Result;
use super::core::NssCtx;
use super::dynamic_interface::DynamicInterface;
use super::handler::MsgHandler;
use super::msg::Msg;
use super::msg::MsgBounds;
use super::msg::ReplyTo;
use super::stats::DebugTable;
use super::stats::InstanceDebug;
use super::stats::MapTDebugStats;
use super::sync::SyncAdapter;
use super::sync::expect_ack;
use super::top::DataCallback;
use super::top::DpRegister;
use super::top::NetdevMsgCallback;
use super::top::NetdevRef;
use super::top::NssTop;
use crate::api::DynamicIfType;
use crate::api::MAP_T_INTERFACE;
use crate::api::map_t::MAP_T_MSG_MAX;
use crate::api::map_t::MAP_T_MSG_MAX_LEN;
use crate::api::map_t::MAX_MAP_T_DYNAMIC_INTERFACES;
use crate::api::map_t::MapTMsgType;
use crate::api::map_t::MapTSyncStats;
use crate::ddi::sync::KRwLock;
use crate::provider::LogLevel;
use std::sync::Arc;

const BOUNDS: MsgBounds = MsgBounds {
    name: "map_t",
    max_type: MAP_T_MSG_MAX,
    max_len: MAP_T_MSG_MAX_LEN as u32,
};

pub struct MapT {
    top: Arc<NssTop>,
    di: Arc<DynamicInterface>,
    event_cb: KRwLock<Option<NetdevMsgCallback>>,
    debug: DebugTable<MapTDebugStats, MAX_MAP_T_DYNAMIC_INTERFACES>,
    sync: SyncAdapter,
}

impl MapT {
    pub fn new(top: Arc<NssTop>, di: Arc<DynamicInterface>) -> Arc<Self> {
        let timeout = top.timeouts().map_t();
        Arc::new(Self {
            top,
            di,
            event_cb: KRwLock::new(None),
            debug: DebugTable::new(),
            sync: SyncAdapter::new("map_t", timeout),
        })
    }

    pub fn register_handler(self: &Arc<Self>) -> Result<()> {
        self.top.register_handler(MAP_T_INTERFACE, self.clone())
    }

    pub fn get_context(&self) -> Result<&Arc<NssCtx>> {
        self.top.core(self.top.routing().map_t)
    }

    /// Is `if_num` a dynamic interface allocated to MAP-T?
    pub fn verify_if_num(&self, if_num: u32) -> bool {
        self.di.is_dynamic(if_num)
            && self.di.get_type(if_num) == DynamicIfType::MapT
    }

    pub fn tx(&self, msg: Msg) -> Result<()> {
        let ctx = self.get_context()?;
        if !ctx.is_ready() {
            self.top.log(
                LogLevel::Warn,
                &format!("map_t: {}: msg dropped as core not ready", ctx.id()),
            );
            return Err(Error::NotReady);
        }

        BOUNDS
            .check_tx(&msg, |i| self.di.is_dynamic(i))
            .and_then(|()| self.top.tx_ctrl(ctx, msg))
            .inspect_err(|e| {
                self.top.log(LogLevel::Warn, &format!("map_t: tx failed: {e}"))
            })
    }

    /// Send `msg` and wait for the firmware's answer.
    ///
    /// A reply callback attached to `msg` still receives the response
    /// before this returns; on timeout it is never called.
    pub fn tx_sync(&self, mut msg: Msg) -> Result<()> {
        let caller = msg.take_reply();
        let reply = self
            .sync
            .call(&self.top, msg, |m| self.tx(m))
            .inspect_err(|e| {
                self.top.log(LogLevel::Warn, &format!("map_t: tx sync failed: {e}"))
            })?;

        if let Some(ReplyTo::Callback { cb, app_data }) = caller {
            cb(app_data.as_ref(), &reply);
        }

        expect_ack(&reply).inspect_err(|_| {
            self.top.log(
                LogLevel::Warn,
                &format!("map_t: error response {}", reply.cm.response),
            )
        })
    }

    /// Bind an allocated MAP-T interface to its netdev: packets go to
    /// `data_cb`, unsolicited events to `event_cb`.
    pub fn register_if(
        self: &Arc<Self>,
        if_num: u32,
        data_cb: DataCallback,
        event_cb: NetdevMsgCallback,
        ndev: NetdevRef,
        features: u32,
    ) -> Result<&Arc<NssCtx>> {
        if !self.di.is_dynamic(if_num) {
            return Err(Error::BadInterface(if_num));
        }

        let if_index = ndev.ifindex();
        self.top.dp_register(if_num, DpRegister::new(data_cb, Some(ndev), features))?;
        *self.event_cb.write() = Some(event_cb);
        self.top.register_handler(if_num, self.clone())?;

        if !self.debug.claim(if_num, if_index) {
            self.top.log(
                LogLevel::Warn,
                &format!("map_t: no debug stats slot for interface {if_num}"),
            );
        }
        self.get_context()
    }

    pub fn unregister_if(&self, if_num: u32) -> Result<()> {
        if !self.di.is_dynamic(if_num) {
            return Err(Error::BadInterface(if_num));
        }

        self.top.dp_unregister(if_num)?;
        *self.event_cb.write() = None;
        self.top.unregister_handler(if_num)?;
        self.debug.release(if_num);
        Ok(())
    }

    /// Debug counters of every registered instance.
    pub fn instance_debug_stats_get(&self) -> Vec<InstanceDebug<MapTDebugStats>> {
        self.debug.get()
    }
}

impl MsgHandler for MapT {
    fn bounds(&self) -> &MsgBounds {
        &BOUNDS
    }

    fn owns_interface(&self, if_num: u32) -> bool {
        if_num == MAP_T_INTERFACE || self.verify_if_num(if_num)
    }

    fn handle(&self, ctx: &NssCtx, msg: &Msg) {
        if let Ok(MapTMsgType::SyncStats) = MapTMsgType::try_from(msg.msg_type())
        {
            let sync: MapTSyncStats = msg.read();
            self.debug.update(msg.interface(), |s| s.add(&sync));
        }

        if !msg.is_notify() {
            self.top.complete(msg);
            return;
        }

        let Some(cb) = self.event_cb.read().clone() else {
            self.top.log(
                LogLevel::Warn,
                &format!(
                    "map_t: {}: no callback for interface {}",
                    ctx.id(),
                    msg.interface()
                ),
            );
            return;
        };

        match self.top.dp(msg.interface()).ndev {
            Some(ndev) => cb(&ndev, msg),
            None => self.top.log(
                LogLevel::Warn,
                &format!(
                    "map_t: {}: event for interface {} before registration",
                    ctx.id(),
                    msg.interface()
                ),
            ),
        }
    }
}
