// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The dynamic interface manager.
//!
//! Dynamic interfaces are numbered by the firmware: the driver asks
//! for a node of some type and learns its interface number from the
//! ACK. The manager mirrors which numbers are in use and for what, so
//! subsystems can check an interface before acting on it.
//!
//! ```text
//!   Free --(ALLOC ack)--> Allocated(type) --(DEALLOC ack)--> Free
//! ```
use super::Error;
use super::Result;
use super::core::NssCtx;
use super::handler::MsgHandler;
use super::msg::Msg;
use super::msg::MsgBounds;
use super::sync::Resolution;
use super::sync::SyncAdapter;
use super::top::NssTop;
use crate::api::DYNAMIC_INTERFACE;
use crate::api::DynamicIfType;
use crate::api::MAX_DYNAMIC_INTERFACES;
use crate::api::Response;
use crate::api::dynamic_index;
use crate::api::dynamic_interface::DYNAMIC_IF_MSG_MAX;
use crate::api::dynamic_interface::DYNAMIC_IF_MSG_MAX_LEN;
use crate::api::dynamic_interface::DynamicIfMsgType;
use crate::api::dynamic_interface::DynamicIfNodeMsg;
use crate::api::is_dynamic_interface;
use crate::ddi::sync::KRwLock;
use crate::provider::LogLevel;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use std::sync::Arc;

/// Error code of the synthesized reply sent to a waiter when the
/// firmware hands out an interface number the driver cannot record.
pub const ERR_SLOT_CONFLICT: u32 = 0x100;

const BOUNDS: MsgBounds = MsgBounds {
    name: "dynamic_interface",
    max_type: DYNAMIC_IF_MSG_MAX,
    max_len: DYNAMIC_IF_MSG_MAX_LEN as u32,
};

pub struct DynamicInterface {
    top: Arc<NssTop>,
    slots: KRwLock<Vec<DynamicIfType>>,
    sync: SyncAdapter,
    orphans: AtomicU64,
}

impl DynamicInterface {
    pub fn new(top: Arc<NssTop>) -> Arc<Self> {
        let timeout = top.timeouts().dynamic_interface();
        Arc::new(Self {
            top,
            slots: KRwLock::new(vec![
                DynamicIfType::None;
                MAX_DYNAMIC_INTERFACES as usize
            ]),
            sync: SyncAdapter::new("dynamic_interface", timeout),
            orphans: AtomicU64::new(0),
        })
    }

    pub fn register_handler(self: &Arc<Self>) -> Result<()> {
        self.top.register_handler(DYNAMIC_INTERFACE, self.clone())
    }

    /// Ask the firmware for a node of type `ty` and return its
    /// interface number.
    ///
    /// Blocks until the firmware answers or the deadline passes; must
    /// not be called from the receive path.
    pub fn alloc_node(&self, ty: DynamicIfType) -> Result<u32> {
        if ty == DynamicIfType::None {
            return Err(Error::BadParam("dynamic interface type"));
        }

        let ctx = self.top.core(self.top.routing().dynamic_core(ty))?;
        let msg = Msg::new(
            DYNAMIC_INTERFACE,
            DynamicIfMsgType::AllocNode as u32,
            &DynamicIfNodeMsg { if_type: ty as u32, if_num: -1 },
        );

        let reply = self
            .sync
            .call_ack(&self.top, msg, |m| self.top.tx_ctrl(ctx, m))
            .inspect_err(|e| {
                self.top.log(
                    LogLevel::Warn,
                    &format!("{}: alloc_node({ty}) failed: {e}", ctx.id()),
                )
            })?;

        let body: DynamicIfNodeMsg = reply.read();
        let if_num = u32::try_from(body.if_num)
            .map_err(|_| Error::Failure("firmware assigned no interface"))?;

        // The handler records the slot before the reply is released.
        if self.get_type(if_num) != ty {
            return Err(Error::Failure("allocated interface not recorded"));
        }
        Ok(if_num)
    }

    /// Return a node to the firmware.
    pub fn dealloc_node(&self, if_num: u32, ty: DynamicIfType) -> Result<()> {
        if ty == DynamicIfType::None {
            return Err(Error::BadParam("dynamic interface type"));
        }

        if !is_dynamic_interface(if_num) {
            return Err(Error::BadParam("not a dynamic interface"));
        }

        if self.get_type(if_num) != ty {
            return Err(Error::BadParam("interface not allocated to type"));
        }

        let ctx = self.top.core(self.top.routing().dynamic_core(ty))?;
        let msg = Msg::new(
            DYNAMIC_INTERFACE,
            DynamicIfMsgType::DeallocNode as u32,
            &DynamicIfNodeMsg { if_type: ty as u32, if_num: if_num as i32 },
        );

        self.sync
            .call_ack(&self.top, msg, |m| self.top.tx_ctrl(ctx, m))
            .inspect_err(|e| {
                self.top.log(
                    LogLevel::Warn,
                    &format!(
                        "{}: dealloc_node({if_num}, {ty}) failed: {e}",
                        ctx.id()
                    ),
                )
            })?;
        Ok(())
    }

    pub fn is_dynamic(&self, if_num: u32) -> bool {
        is_dynamic_interface(if_num)
    }

    /// The type `if_num` is allocated to; [`DynamicIfType::None`] when
    /// free or not a dynamic interface at all.
    pub fn get_type(&self, if_num: u32) -> DynamicIfType {
        dynamic_index(if_num)
            .and_then(|i| self.slots.read().get(i).copied())
            .unwrap_or_default()
    }

    /// Every allocated interface, in number order.
    pub fn allocated(&self) -> Vec<(u32, DynamicIfType)> {
        self.slots
            .read()
            .iter()
            .enumerate()
            .filter(|(_, ty)| **ty != DynamicIfType::None)
            .map(|(i, ty)| (crate::api::DYNAMIC_IF_START + i as u32, *ty))
            .collect()
    }

    /// ALLOC ACKs nobody was waiting for, typically because the
    /// requester timed out. The node exists in the firmware and stays
    /// recorded here.
    pub fn orphans(&self) -> u64 {
        self.orphans.load(Ordering::Relaxed)
    }

    fn claim(&self, body: &DynamicIfNodeMsg) -> core::result::Result<(), &'static str> {
        let ty = DynamicIfType::try_from(body.if_type)
            .ok()
            .filter(|t| *t != DynamicIfType::None)
            .ok_or("bad type")?;
        let idx = u32::try_from(body.if_num)
            .ok()
            .and_then(dynamic_index)
            .ok_or("interface out of range")?;

        let mut slots = self.slots.write();
        let slot = slots.get_mut(idx).ok_or("interface out of range")?;
        if *slot != DynamicIfType::None {
            return Err("slot already allocated");
        }
        *slot = ty;
        Ok(())
    }

    fn release(&self, body: &DynamicIfNodeMsg) {
        let idx = u32::try_from(body.if_num).ok().and_then(dynamic_index);
        match idx.and_then(|i| self.slots.write().get_mut(i).map(|s| *s = DynamicIfType::None)) {
            Some(()) => {}
            None => self.top.log(
                LogLevel::Warn,
                &format!(
                    "dynamic_interface: dealloc ack for bad interface {}",
                    body.if_num
                ),
            ),
        }
    }

    fn handle_alloc(&self, ctx: &NssCtx, msg: &Msg) {
        if !msg.is_ack() {
            self.top.complete(msg);
            return;
        }

        let body: DynamicIfNodeMsg = msg.read();
        if let Err(reason) = self.claim(&body) {
            self.top.stats().vals.rx_invalid.incr(1);
            self.top.log(
                LogLevel::Warn,
                &format!(
                    "{}: alloc_node ack for interface {} type {} rejected: \
                     {reason}",
                    ctx.id(),
                    body.if_num,
                    body.if_type
                ),
            );
            self.top
                .complete(&msg.as_response(Response::EMsg, ERR_SLOT_CONFLICT));
            return;
        }

        if self.top.complete(msg) != Resolution::Delivered {
            self.orphans.fetch_add(1, Ordering::Relaxed);
            self.top.log(
                LogLevel::Warn,
                &format!(
                    "{}: interface {} allocated with nobody waiting",
                    ctx.id(),
                    body.if_num
                ),
            );
        }
    }
}

impl MsgHandler for DynamicInterface {
    fn bounds(&self) -> &MsgBounds {
        &BOUNDS
    }

    fn owns_interface(&self, if_num: u32) -> bool {
        if_num == DYNAMIC_INTERFACE
    }

    fn handle(&self, ctx: &NssCtx, msg: &Msg) {
        match DynamicIfMsgType::try_from(msg.msg_type()) {
            Ok(DynamicIfMsgType::AllocNode) => self.handle_alloc(ctx, msg),

            Ok(DynamicIfMsgType::DeallocNode) => {
                if msg.is_ack() {
                    self.release(&msg.read());
                }
                self.top.complete(msg);
            }

            Err(_) => {}
        }
    }
}
