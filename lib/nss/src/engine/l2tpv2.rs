// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! L2TPv2 sessions, one per dynamic interface.
use super::Error;
use super::Result;
use super::core::NssCtx;
use super::dynamic_interface::DynamicInterface;
use super::handler::MsgHandler;
use super::msg::Msg;
use super::msg::MsgBounds;
use super::stats::DebugTable;
use super::stats::InstanceDebug;
use super::stats::L2tpv2DebugStats;
use super::top::DataCallback;
use super::top::DpRegister;
use super::top::NetdevMsgCallback;
use super::top::NetdevRef;
use super::top::NssTop;
use crate::api::L2TPV2_INTERFACE;
use crate::api::l2tpv2::L2TPV2_MSG_MAX;
use crate::api::l2tpv2::L2TPV2_MSG_MAX_LEN;
use crate::api::l2tpv2::L2tpv2MsgType;
use crate::api::l2tpv2::L2tpv2SyncSessionStats;
use crate::api::l2tpv2::MAX_L2TPV2_DYNAMIC_INTERFACES;
use crate::ddi::sync::KRwLock;
use crate::provider::LogLevel;
use std::sync::Arc;

const BOUNDS: MsgBounds = MsgBounds {
    name: "l2tpv2",
    max_type: L2TPV2_MSG_MAX,
    max_len: L2TPV2_MSG_MAX_LEN as u32,
};

pub struct L2tpv2 {
    top: Arc<NssTop>,
    di: Arc<DynamicInterface>,
    event_cb: KRwLock<Option<NetdevMsgCallback>>,
    debug: DebugTable<L2tpv2DebugStats, MAX_L2TPV2_DYNAMIC_INTERFACES>,
}

impl L2tpv2 {
    pub fn new(top: Arc<NssTop>, di: Arc<DynamicInterface>) -> Arc<Self> {
        Arc::new(Self {
            top,
            di,
            event_cb: KRwLock::new(None),
            debug: DebugTable::new(),
        })
    }

    pub fn register_handler(self: &Arc<Self>) -> Result<()> {
        self.top.register_handler(L2TPV2_INTERFACE, self.clone())
    }

    pub fn get_context(&self) -> Result<&Arc<NssCtx>> {
        self.top.core(self.top.routing().l2tpv2)
    }

    pub fn tx(&self, msg: Msg) -> Result<()> {
        let ctx = self.get_context()?;
        if !ctx.is_ready() {
            self.top.log(
                LogLevel::Warn,
                &format!("l2tpv2: {}: msg dropped as core not ready", ctx.id()),
            );
            return Err(Error::NotReady);
        }

        BOUNDS
            .check_tx(&msg, |i| self.di.is_dynamic(i))
            .and_then(|()| self.top.tx_ctrl(ctx, msg))
            .inspect_err(|e| {
                self.top.log(LogLevel::Warn, &format!("l2tpv2: tx failed: {e}"))
            })
    }

    /// Bind a session interface to its netdev.
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
                &format!("l2tpv2: no debug stats slot for session {if_num}"),
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

    pub fn session_debug_stats_get(&self) -> Vec<InstanceDebug<L2tpv2DebugStats>> {
        self.debug.get()
    }
}

impl MsgHandler for L2tpv2 {
    fn bounds(&self) -> &MsgBounds {
        &BOUNDS
    }

    fn owns_interface(&self, if_num: u32) -> bool {
        if_num == L2TPV2_INTERFACE || self.di.is_dynamic(if_num)
    }

    fn handle(&self, ctx: &NssCtx, msg: &Msg) {
        if let Ok(L2tpv2MsgType::SyncStats) =
            L2tpv2MsgType::try_from(msg.msg_type())
        {
            let sync: L2tpv2SyncSessionStats = msg.read();
            self.debug.update(msg.interface(), |s| s.add(&sync.debug_stats));
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
                    "l2tpv2: {}: event for tunnel interface {} before \
                     registration",
                    ctx.id(),
                    msg.interface()
                ),
            ),
        }
    }
}
