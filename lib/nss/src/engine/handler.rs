// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The per-interface handler table.
use super::Error;
use super::Result;
use super::core::NssCtx;
use super::msg::Msg;
use super::msg::MsgBounds;
use crate::api::MAX_NET_INTERFACES;
use crate::ddi::sync::KRwLock;
use std::sync::Arc;

/// A subsystem's entry point for inbound control messages.
///
/// Core dispatch has already checked the envelope against
/// [`MsgHandler::bounds`] and [`MsgHandler::owns_interface`] by the time
/// [`MsgHandler::handle`] runs, so handlers only deal in well-formed
/// messages.
pub trait MsgHandler: Send + Sync {
    fn bounds(&self) -> &MsgBounds;

    /// Whether the handler accepts messages addressed to `if_num`.
    fn owns_interface(&self, if_num: u32) -> bool;

    fn handle(&self, ctx: &NssCtx, msg: &Msg);
}

/// What happened to an existing entry on registration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Registered {
    New,
    Replaced,
}

/// Maps interface numbers to handlers.
///
/// Lookups happen on every inbound message and take the read side of
/// the lock; registration is rare.
pub struct HandlerTable {
    slots: KRwLock<Vec<Option<Arc<dyn MsgHandler>>>>,
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerTable {
    pub fn new() -> Self {
        let slots = (0..MAX_NET_INTERFACES).map(|_| None).collect();
        Self { slots: KRwLock::new(slots) }
    }

    /// Install `handler` for `if_num`, replacing any previous one.
    pub fn register(
        &self,
        if_num: u32,
        handler: Arc<dyn MsgHandler>,
    ) -> Result<Registered> {
        let mut slots = self.slots.write();
        let slot =
            slots.get_mut(if_num as usize).ok_or(Error::OutOfRange(if_num))?;
        let prev = slot.replace(handler);
        Ok(if prev.is_some() { Registered::Replaced } else { Registered::New })
    }

    /// Install `handler` for `if_num` only if the slot is free.
    pub fn register_exclusive(
        &self,
        if_num: u32,
        handler: Arc<dyn MsgHandler>,
    ) -> Result<()> {
        let mut slots = self.slots.write();
        let slot =
            slots.get_mut(if_num as usize).ok_or(Error::OutOfRange(if_num))?;
        if slot.is_some() {
            return Err(Error::AlreadyRegistered(if_num));
        }
        *slot = Some(handler);
        Ok(())
    }

    pub fn unregister(&self, if_num: u32) -> Result<()> {
        let mut slots = self.slots.write();
        let slot =
            slots.get_mut(if_num as usize).ok_or(Error::OutOfRange(if_num))?;
        *slot = None;
        Ok(())
    }

    pub fn get(&self, if_num: u32) -> Option<Arc<dyn MsgHandler>> {
        self.slots.read().get(if_num as usize).cloned().flatten()
    }

    pub fn is_registered(&self, if_num: u32) -> bool {
        self.slots.read().get(if_num as usize).is_some_and(Option::is_some)
    }

    /// Drop every handler.
    ///
    /// Subsystems hold a reference to the driver instance, so this is
    /// what lets a detached instance actually be freed.
    pub fn clear(&self) {
        self.slots.write().iter_mut().for_each(|s| *s = None);
    }
}
