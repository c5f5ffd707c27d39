// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! DS-Lite (IPv4 in IPv6) tunnels. All control traffic goes through
//! the one static tunipip6 node.
use super::Error;
use super::Result;
use super::core::NssCtx;
use super::handler::MsgHandler;
use super::msg::Msg;
use super::msg::MsgBounds;
use super::top::DataCallback;
use super::top::DpRegister;
use super::top::NetdevMsgCallback;
use super::top::NetdevRef;
use super::top::NssTop;
use crate::api::TUNIPIP6_INTERFACE;
use crate::api::VIRTUAL_IF_START;
use crate::api::is_valid_interface;
use crate::api::tunipip6::TUNIPIP6_MSG_MAX;
use crate::api::tunipip6::TUNIPIP6_MSG_MAX_LEN;
use crate::api::tunipip6::Tunipip6MsgType;
use crate::api::tunipip6::Tunipip6StatsSync;
use crate::ddi::sync::KRwLock;
use crate::provider::LogLevel;
use std::sync::Arc;

const BOUNDS: MsgBounds = MsgBounds {
    name: "tunipip6",
    max_type: TUNIPIP6_MSG_MAX,
    max_len: TUNIPIP6_MSG_MAX_LEN as u32,
};

pub struct Tunipip6 {
    top: Arc<NssTop>,
    event_cb: KRwLock<Option<NetdevMsgCallback>>,
}

impl Tunipip6 {
    pub fn new(top: Arc<NssTop>) -> Arc<Self> {
        Arc::new(Self { top, event_cb: KRwLock::new(None) })
    }

    pub fn register_handler(self: &Arc<Self>) -> Result<()> {
        self.top.register_handler(TUNIPIP6_INTERFACE, self.clone())
    }

    pub fn get_context(&self) -> Result<&Arc<NssCtx>> {
        self.top.core(self.top.routing().tunipip6)
    }

    pub fn tx(&self, msg: Msg) -> Result<()> {
        let ctx = self.get_context()?;
        if !ctx.is_ready() {
            self.top.log(
                LogLevel::Warn,
                &format!("tunipip6: {}: msg dropped as core not ready", ctx.id()),
            );
            return Err(Error::NotReady);
        }

        BOUNDS
            .check_tx(&msg, |i| i == TUNIPIP6_INTERFACE)
            .and_then(|()| self.top.tx_ctrl(ctx, msg))
            .inspect_err(|e| {
                self.top.log(LogLevel::Warn, &format!("tunipip6: tx failed: {e}"))
            })
    }

    /// Bind the tunnel's netdev to `if_num` for data and events.
    pub fn register_if(
        &self,
        if_num: u32,
        data_cb: DataCallback,
        event_cb: NetdevMsgCallback,
        ndev: NetdevRef,
        features: u32,
    ) -> Result<&Arc<NssCtx>> {
        if if_num < VIRTUAL_IF_START || !is_valid_interface(if_num) {
            return Err(Error::BadInterface(if_num));
        }

        self.top.dp_register(if_num, DpRegister::new(data_cb, Some(ndev), features))?;
        *self.event_cb.write() = Some(event_cb);
        self.get_context()
    }

    pub fn unregister_if(&self, if_num: u32) -> Result<()> {
        if if_num < VIRTUAL_IF_START || !is_valid_interface(if_num) {
            return Err(Error::BadInterface(if_num));
        }

        self.top.dp_unregister(if_num)?;
        *self.event_cb.write() = None;
        Ok(())
    }
}

impl MsgHandler for Tunipip6 {
    fn bounds(&self) -> &MsgBounds {
        &BOUNDS
    }

    fn owns_interface(&self, if_num: u32) -> bool {
        if_num == TUNIPIP6_INTERFACE
    }

    fn handle(&self, ctx: &NssCtx, msg: &Msg) {
        if let Ok(Tunipip6MsgType::RxStatsSync) =
            Tunipip6MsgType::try_from(msg.msg_type())
        {
            let sync: Tunipip6StatsSync = msg.read();
            self.top.with_global_stats(|g| g.add_node(msg.interface(), &sync.node_stats));
        }

        if !msg.is_notify() {
            self.top.complete(msg);
            return;
        }

        let Some(cb) = self.event_cb.read().clone() else {
            return;
        };

        match self.top.dp(msg.interface()).ndev {
            Some(ndev) => cb(&ndev, msg),
            None => self.top.log(
                LogLevel::Warn,
                &format!(
                    "tunipip6: {}: event for interface {} before registration",
                    ctx.id(),
                    msg.interface()
                ),
            ),
        }
    }
}
