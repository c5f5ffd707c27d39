// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The crypto engine node.
//!
//! Engine and session setup are control messages; the requests
//! themselves are pre-mapped buffers sent on the data queue, and their
//! completions come back through the crypto buffer callback.
use super::Error;
use super::Result;
use super::core::NssCtx;
use super::handler::MsgHandler;
use super::msg::AppData;
use super::msg::Msg;
use super::msg::MsgBounds;
use super::msg::MsgCallback;
use super::nbuf::Nbuf;
use super::top::CryptoBufCallback;
use super::top::NssTop;
use crate::api::CRYPTO_INTERFACE;
use crate::api::crypto::CRYPTO_MSG_MAX_LEN;
use crate::api::crypto::CRYPTO_MSG_TYPE_MAX;
use crate::api::crypto::CryptoMsgType;
use crate::api::crypto::CryptoSyncStats;
use crate::ddi::sync::KMutex;
use crate::ddi::sync::KRwLock;
use crate::provider::LogLevel;
use std::sync::Arc;

const BOUNDS: MsgBounds = MsgBounds {
    name: "crypto",
    max_type: CRYPTO_MSG_TYPE_MAX,
    max_len: CRYPTO_MSG_MAX_LEN as u32,
};

pub struct Crypto {
    top: Arc<NssTop>,
    notify: KRwLock<Option<(MsgCallback, Option<AppData>)>>,
    last_stats: KMutex<Option<CryptoSyncStats>>,
}

impl Crypto {
    pub fn new(top: Arc<NssTop>) -> Arc<Self> {
        Arc::new(Self {
            top,
            notify: KRwLock::new(None),
            last_stats: KMutex::new(None),
        })
    }

    pub fn register_handler(self: &Arc<Self>) -> Result<()> {
        self.top.register_handler(CRYPTO_INTERFACE, self.clone())
    }

    pub fn get_context(&self) -> Result<&Arc<NssCtx>> {
        self.top.core(self.top.routing().crypto)
    }

    pub fn tx_msg(&self, msg: Msg) -> Result<()> {
        let ctx = self.get_context()?;
        if !ctx.is_ready() {
            self.top.log(
                LogLevel::Warn,
                &format!("crypto: {}: msg dropped as core not ready", ctx.id()),
            );
            return Err(Error::NotReady);
        }

        BOUNDS
            .check_tx(&msg, |i| i == CRYPTO_INTERFACE)
            .and_then(|()| self.top.tx_ctrl(ctx, msg))
            .inspect_err(|e| {
                self.top.log(LogLevel::Warn, &format!("crypto: tx msg failed: {e}"))
            })
    }

    /// Queue a crypto request whose buffer the caller already mapped at
    /// `paddr`.
    pub fn tx_buf(&self, nbuf: Nbuf, paddr: u32, len: u16) -> Result<()> {
        let ctx = self.get_context()?;
        let res = ctx.send_crypto(nbuf, paddr, len);
        match &res {
            Ok(()) => self.top.stats().vals.tx_packet.incr(1),
            Err(Error::QueueFull(_)) => self.top.stats().vals.queue_full.incr(1),
            Err(_) => (),
        }
        res
    }

    pub fn notify_register(&self, cb: MsgCallback, app_data: Option<AppData>) -> Result<&Arc<NssCtx>> {
        *self.notify.write() = Some((cb, app_data));
        self.get_context()
    }

    pub fn notify_unregister(&self) {
        *self.notify.write() = None;
    }

    /// Route completed crypto requests to `cb`.
    pub fn data_register(&self, cb: CryptoBufCallback, app_data: Option<AppData>) -> Result<&Arc<NssCtx>> {
        self.top.register_crypto_buf(cb, app_data);
        self.get_context()
    }

    pub fn data_unregister(&self) {
        self.top.unregister_crypto_buf();
    }

    /// The most recent statistics the engine reported.
    pub fn stats(&self) -> Option<CryptoSyncStats> {
        *self.last_stats.lock()
    }
}

impl MsgHandler for Crypto {
    fn bounds(&self) -> &MsgBounds {
        &BOUNDS
    }

    fn owns_interface(&self, if_num: u32) -> bool {
        if_num == CRYPTO_INTERFACE
    }

    fn handle(&self, _ctx: &NssCtx, msg: &Msg) {
        if let Ok(CryptoMsgType::Stats) = CryptoMsgType::try_from(msg.msg_type()) {
            *self.last_stats.lock() = Some(msg.read());
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
    use crate::api::CmnMsg;
    use crate::api::Response;
    use crate::api::crypto::CryptoConfigSession;
    use crate::cfg::DriverCfg;
    use crate::engine::core::DATA_QUEUE_0;
    use crate::engine::top::test_top;
    use core::sync::atomic::AtomicU32;
    use core::sync::atomic::Ordering;
    use zerocopy::IntoBytes;

    #[test]
    fn stats_are_kept_and_notified() {
        let (top, _, _) = test_top(&DriverCfg::default());
        let crypto = Crypto::new(top.clone());
        crypto.register_handler().unwrap();
        let seen = Arc::new(AtomicU32::new(0));
        let s = seen.clone();
        crypto
            .notify_register(Arc::new(move |_, m| s.store(m.msg_type(), Ordering::Relaxed)), None)
            .unwrap();

        let mut sync = CryptoSyncStats::default();
        sync.total.completed = 12;
        let mut cm = CmnMsg::new(
            CRYPTO_INTERFACE,
            CryptoMsgType::Stats as u32,
            sync.as_bytes().len() as u32,
        );
        cm.response = Response::Notify as u32;
        let ctx = top.core(top.routing().crypto).unwrap();
        top.dispatch_msg(ctx, Msg::from_parts(cm, sync.as_bytes().to_vec()));

        assert_eq!(crypto.stats().map(|s| s.total.completed), Some(12));
        assert_eq!(seen.load(Ordering::Relaxed), CryptoMsgType::Stats as u32);
    }

    #[test]
    fn requests_go_out_on_the_data_queue() {
        let (top, _, _) = test_top(&DriverCfg::default());
        let crypto = Crypto::new(top.clone());
        let ctx = top.core(top.routing().crypto).unwrap();

        crypto.tx_buf(Nbuf::from_vec(vec![0; 32]), 0x8000, 32).unwrap();
        let entry = ctx.h2n(DATA_QUEUE_0).unwrap().shared().pop().unwrap();
        assert_eq!(entry.desc.buffer, 0x8000);
        assert_eq!(entry.desc.interface_num, CRYPTO_INTERFACE);
        assert_eq!(top.stats().vals.tx_packet.val(), 1);

        let too_big = u16::try_from(ctx.max_buf_size() + 1).unwrap();
        assert!(matches!(
            crypto.tx_buf(Nbuf::from_vec(vec![]), 0, too_big),
            Err(Error::TooLarge { .. })
        ));
    }

    #[test]
    fn session_updates_address_the_crypto_node() {
        let (top, _, _) = test_top(&DriverCfg::default());
        let crypto = Crypto::new(top.clone());
        let body = CryptoConfigSession { idx: 1, ..Default::default() };
        let msg = Msg::new(CRYPTO_INTERFACE + 1, CryptoMsgType::UpdateSession as u32, &body);
        assert_eq!(crypto.tx_msg(msg), Err(Error::BadInterface(CRYPTO_INTERFACE + 1)));

        let msg = Msg::new(CRYPTO_INTERFACE, CryptoMsgType::UpdateSession as u32, &body);
        crypto.tx_msg(msg).unwrap();
        assert_eq!(top.stats().vals.tx_cmd_req.val(), 1);
    }
}
