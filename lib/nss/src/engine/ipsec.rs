// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IPsec offload.
//!
//! The firmware exposes two fixed nodes, one per direction. Rule
//! changes and statistics travel as control messages addressed to
//! them; notifications are delivered to whichever callback the crypto
//! layer registered for the direction.
use super::Error;
use super::Result;
use super::core::NssCtx;
use super::handler::MsgHandler;
use super::msg::AppData;
use super::msg::Msg;
use super::msg::MsgBounds;
use super::msg::MsgCallback;
use super::nbuf::Nbuf;
use super::ring::DescFlags;
use super::top::DataCallback;
use super::top::DpRegister;
use super::top::NetdevRef;
use super::top::NssTop;
use crate::api::C2C_TX_INTERFACE;
use crate::api::CoreId;
use crate::api::IPSEC_DECAP_IF_NUMBER;
use crate::api::IPSEC_ENCAP_IF_NUMBER;
use crate::api::IPSEC_RULE_INTERFACE;
use crate::api::MAX_NET_INTERFACES;
use crate::api::Response;
use crate::api::ipsec::IPSEC_MSG_MAX_LEN;
use crate::api::ipsec::IPSEC_MSG_TYPE_MAX;
use crate::ddi::sync::KRwLock;
use crate::provider::LogLevel;
use std::sync::Arc;

const BOUNDS: MsgBounds = MsgBounds {
    name: "ipsec",
    max_type: IPSEC_MSG_TYPE_MAX,
    max_len: IPSEC_MSG_MAX_LEN as u32,
};

type Notifier = (MsgCallback, Option<AppData>);

fn direction(if_num: u32) -> Option<usize> {
    match if_num {
        IPSEC_ENCAP_IF_NUMBER => Some(0),
        IPSEC_DECAP_IF_NUMBER => Some(1),
        _ => None,
    }
}

pub struct Ipsec {
    top: Arc<NssTop>,
    core: CoreId,
    notify: KRwLock<[Option<Notifier>; 2]>,
}

impl Ipsec {
    pub fn new(top: Arc<NssTop>) -> Arc<Self> {
        let core = top.routing().ipsec;
        Arc::new(Self { top, core, notify: KRwLock::new([None, None]) })
    }

    /// Install the handler on both the encap and decap nodes, with no
    /// notification callbacks.
    pub fn register_handler(self: &Arc<Self>) -> Result<()> {
        *self.notify.write() = [None, None];
        self.top.register_handler(IPSEC_ENCAP_IF_NUMBER, self.clone())?;
        self.top.register_handler(IPSEC_DECAP_IF_NUMBER, self.clone())
    }

    /// The core IPsec traffic is handled on.
    pub fn get_context(&self) -> Result<&Arc<NssCtx>> {
        self.top.core(self.core)
    }

    /// The interface rules are pushed to on `core`.
    pub fn get_interface(core: CoreId) -> u32 {
        match core {
            CoreId::Core0 => IPSEC_RULE_INTERFACE,
            CoreId::Core1 => C2C_TX_INTERFACE,
        }
    }

    /// Send a rule or configuration message to the encap or decap
    /// node.
    pub fn tx_msg(&self, msg: Msg) -> Result<()> {
        let ctx = self.get_context()?;
        if !ctx.is_ready() {
            self.top.log(
                LogLevel::Warn,
                &format!("ipsec: {}: tx message dropped as core not ready", ctx.id()),
            );
            return Err(Error::NotReady);
        }

        BOUNDS
            .check_tx(&msg, |i| direction(i).is_some())
            .and_then(|()| self.top.tx_ctrl(ctx, msg))
            .inspect_err(|e| {
                self.top.log(LogLevel::Warn, &format!("ipsec: tx message failed: {e}"))
            })
    }

    /// Send a packet for `if_num` into the IPsec engine.
    pub fn tx_buf(&self, nbuf: Nbuf, if_num: u32) -> Result<()> {
        let ctx = self.get_context()?;
        self.top
            .tx_data(ctx, if_num, nbuf, DescFlags::empty())
            .inspect_err(|e| {
                self.top.log(
                    LogLevel::Warn,
                    &format!("ipsec: unable to enqueue packet for {if_num}: {e}"),
                )
            })
    }

    /// Register the notification callback of one direction. An
    /// existing registration is left in place.
    pub fn notify_register(
        &self,
        if_num: u32,
        cb: MsgCallback,
        app_data: Option<AppData>,
    ) -> Result<&Arc<NssCtx>> {
        let dir = direction(if_num).ok_or(Error::BadInterface(if_num))?;
        let mut notify = self.notify.write();
        if notify[dir].is_none() {
            notify[dir] = Some((cb, app_data));
        }
        drop(notify);
        self.get_context()
    }

    pub fn notify_unregister(&self, if_num: u32) -> Result<()> {
        let dir = direction(if_num).ok_or(Error::BadInterface(if_num))?;
        self.notify.write()[dir] = None;
        Ok(())
    }

    /// Bind packets the engine emits on `if_num` to `cb`. An existing
    /// registration is left in place.
    pub fn data_register(
        &self,
        if_num: u32,
        cb: DataCallback,
        ndev: Option<NetdevRef>,
        features: u32,
    ) -> Result<&Arc<NssCtx>> {
        if if_num >= MAX_NET_INTERFACES {
            return Err(Error::BadInterface(if_num));
        }

        self.top.update_dp(if_num, |reg| {
            if !reg.is_registered() {
                *reg = DpRegister::new(cb, ndev, features);
            }
        })?;
        self.get_context()
    }

    pub fn data_unregister(&self, if_num: u32) -> Result<()> {
        self.top.dp_unregister(if_num)
    }
}

impl MsgHandler for Ipsec {
    fn bounds(&self) -> &MsgBounds {
        &BOUNDS
    }

    fn owns_interface(&self, if_num: u32) -> bool {
        direction(if_num).is_some()
    }

    fn handle(&self, ctx: &NssCtx, msg: &Msg) {
        match msg.cm.response() {
            Ok(Response::None) | Err(_) => {
                self.top.log(
                    LogLevel::Warn,
                    &format!(
                        "ipsec: {}: response for interface {}, type {} is \
                         invalid: {}",
                        ctx.id(),
                        msg.interface(),
                        msg.msg_type(),
                        msg.cm.response
                    ),
                );
                return;
            }

            Ok(_) => {}
        }

        if !msg.is_notify() {
            self.top.complete(msg);
            return;
        }

        let notifier = direction(msg.interface())
            .and_then(|dir| self.notify.read()[dir].clone());

        // Nobody registered; the event goes nowhere.
        if let Some((cb, app_data)) = notifier {
            cb(app_data.as_ref(), msg);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::ipsec::IpsecMsgType;
    use crate::api::ipsec::IpsecNodeStatsSync;
    use crate::api::ipsec::IpsecRule;
    use crate::cfg::DriverCfg;
    use crate::engine::core::CMD_QUEUE;
    use crate::engine::top::test_top;
    use core::sync::atomic::AtomicU32;
    use core::sync::atomic::Ordering;

    fn setup() -> (Arc<NssTop>, Arc<Ipsec>, Arc<crate::provider::RecordLog>) {
        let (top, _, log) = test_top(&DriverCfg::default());
        let ipsec = Ipsec::new(top.clone());
        ipsec.register_handler().unwrap();
        (top, ipsec, log)
    }

    #[test]
    fn notifications_follow_direction() {
        let (top, ipsec, _) = setup();
        let seen = Arc::new(AtomicU32::new(0));
        let s = seen.clone();
        let cb: MsgCallback = Arc::new(move |app, msg| {
            let tag = app.and_then(|a| a.downcast_ref::<u32>()).copied();
            assert_eq!(tag, Some(9));
            s.store(msg.interface(), Ordering::Relaxed);
        });
        ipsec
            .notify_register(IPSEC_DECAP_IF_NUMBER, cb, Some(Arc::new(9u32)))
            .unwrap();

        let ctx = top.core(CoreId::Core0).unwrap();
        let event = Msg::new(
            IPSEC_ENCAP_IF_NUMBER,
            IpsecMsgType::SyncNodeStats as u32,
            &IpsecNodeStatsSync::default(),
        )
        .as_response(Response::Notify, 0);

        // Encap has no callback: dropped quietly.
        top.dispatch_msg(ctx, event.clone());
        assert_eq!(seen.load(Ordering::Relaxed), 0);

        let mut event = event;
        event.cm.interface = IPSEC_DECAP_IF_NUMBER as u16;
        top.dispatch_msg(ctx, event);
        assert_eq!(seen.load(Ordering::Relaxed), IPSEC_DECAP_IF_NUMBER);
    }

    #[test]
    fn invalid_responses_are_refused() {
        let (top, ipsec, log) = setup();
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let cb: MsgCallback = Arc::new(move |_, _| {
            h.fetch_add(1, Ordering::Relaxed);
        });
        ipsec.notify_register(IPSEC_ENCAP_IF_NUMBER, cb, None).unwrap();

        let ctx = top.core(CoreId::Core0).unwrap();
        let mut msg = Msg::header_only(IPSEC_ENCAP_IF_NUMBER, 1);
        msg.cm.response = 42;
        top.dispatch_msg(ctx, msg);
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        assert_eq!(log.count_matching(LogLevel::Warn, "is invalid: 42"), 1);
    }

    #[test]
    fn tx_msg_checks_before_sending() {
        let (top, ipsec, _) = setup();
        let ctx = top.core(CoreId::Core0).unwrap();
        let rule = IpsecRule::default();

        let wrong = Msg::new(IPSEC_RULE_INTERFACE, 1, &rule);
        assert_eq!(
            ipsec.tx_msg(wrong),
            Err(Error::BadInterface(IPSEC_RULE_INTERFACE))
        );

        let bad_type = Msg::new(IPSEC_ENCAP_IF_NUMBER, IPSEC_MSG_TYPE_MAX, &rule);
        assert!(matches!(ipsec.tx_msg(bad_type), Err(Error::BadMsgType { .. })));

        let huge = Msg::new(IPSEC_ENCAP_IF_NUMBER, 1, &[0u8; IPSEC_MSG_MAX_LEN + 1]);
        assert!(matches!(ipsec.tx_msg(huge), Err(Error::TooLarge { .. })));
        assert_eq!(ctx.h2n(CMD_QUEUE).unwrap().occupancy(), 0);

        let add = Msg::new(IPSEC_ENCAP_IF_NUMBER, IpsecMsgType::AddRule as u32, &rule);
        ipsec.tx_msg(add).unwrap();
        assert_eq!(ctx.h2n(CMD_QUEUE).unwrap().occupancy(), 1);

        ctx.stop();
        let add = Msg::new(IPSEC_ENCAP_IF_NUMBER, IpsecMsgType::AddRule as u32, &rule);
        assert_eq!(ipsec.tx_msg(add), Err(Error::NotReady));
    }

    #[test]
    fn data_registration_keeps_first() {
        let (top, ipsec, _) = setup();
        let first: DataCallback = Arc::new(|_, _| {});
        let second: DataCallback = Arc::new(|_, _| {});
        ipsec.data_register(40, first.clone(), None, 1).unwrap();
        ipsec.data_register(40, second, None, 2).unwrap();
        assert_eq!(top.dp(40).features, 1);
        assert!(ipsec.data_register(MAX_NET_INTERFACES, first, None, 0).is_err());

        ipsec.data_unregister(40).unwrap();
        assert!(!top.dp(40).is_registered());
    }

    #[test]
    fn rule_interface_by_core() {
        assert_eq!(Ipsec::get_interface(CoreId::Core0), IPSEC_RULE_INTERFACE);
        assert_eq!(Ipsec::get_interface(CoreId::Core1), C2C_TX_INTERFACE);
    }
}
