// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Control messages: the common envelope plus a typed payload.
use super::sync::Completion;
use crate::api::CMN_MSG_LEN;
use crate::api::CmnMsg;
use crate::api::Response;
use crate::api::is_valid_interface;
use crate::provider::LogLevel;
use crate::provider::LogProvider;
use core::any::Any;
use core::fmt;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Opaque caller context handed back with a response.
pub type AppData = Arc<dyn Any + Send + Sync>;

/// Invoked with the response to an asynchronous request, or with a
/// notification.
pub type MsgCallback = Arc<dyn Fn(Option<&AppData>, &Msg) + Send + Sync>;

/// Where the response to a request goes.
#[derive(Clone)]
pub enum ReplyTo {
    Callback { cb: MsgCallback, app_data: Option<AppData> },
    Waiter(Arc<Completion>),
}

/// A control message.
///
/// On the wire a message is the [`CmnMsg`] envelope followed by exactly
/// `cm.len` bytes of payload. The reply route never goes on the wire;
/// the firmware sees a request id in `cm.cb` instead.
#[derive(Clone)]
pub struct Msg {
    pub cm: CmnMsg,
    pub payload: Vec<u8>,
    reply: Option<ReplyTo>,
}

impl fmt::Debug for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Msg")
            .field("cm", &self.cm)
            .field("payload_len", &self.payload.len())
            .field("has_reply", &self.reply.is_some())
            .finish()
    }
}

impl Msg {
    /// Build a request carrying `payload`.
    pub fn new<T>(interface: u32, msg_type: u32, payload: &T) -> Self
    where
        T: IntoBytes + Immutable,
    {
        let bytes = payload.as_bytes();
        Self {
            cm: CmnMsg::new(interface, msg_type, bytes.len() as u32),
            payload: bytes.to_vec(),
            reply: None,
        }
    }

    /// Build a request with no payload.
    pub fn header_only(interface: u32, msg_type: u32) -> Self {
        Self { cm: CmnMsg::new(interface, msg_type, 0), payload: vec![], reply: None }
    }

    pub fn from_parts(cm: CmnMsg, payload: Vec<u8>) -> Self {
        Self { cm, payload, reply: None }
    }

    /// Parse a message off the wire.
    ///
    /// Only the envelope is interpreted here; whether `cm.len` is
    /// acceptable for the message type is up to [`validate`].
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let (cm, rest) = CmnMsg::read_from_prefix(bytes).map_err(|_| {
            EnvelopeError::Truncated { have: bytes.len(), need: CMN_MSG_LEN }
        })?;

        let len = cm.len as usize;
        if rest.len() < len {
            return Err(EnvelopeError::Truncated {
                have: bytes.len(),
                need: CMN_MSG_LEN + len,
            });
        }

        Ok(Self { cm, payload: rest[..len].to_vec(), reply: None })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CMN_MSG_LEN + self.payload.len());
        out.extend_from_slice(self.cm.as_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn encoded_len(&self) -> usize {
        CMN_MSG_LEN + self.payload.len()
    }

    /// Read the payload as `T`.
    ///
    /// A payload shorter than `T` is zero-extended; the envelope length
    /// has been validated against the type's maximum by the time any
    /// handler sees the message.
    pub fn read<T>(&self) -> T
    where
        T: FromBytes + IntoBytes,
    {
        let mut val = T::new_zeroed();
        let dst = val.as_mut_bytes();
        let n = dst.len().min(self.payload.len());
        dst[..n].copy_from_slice(&self.payload[..n]);
        val
    }

    /// Read a `T` at `offset` into the payload, if it fits entirely.
    pub fn read_at<T>(&self, offset: usize) -> Option<T>
    where
        T: FromBytes + KnownLayout + Immutable,
    {
        let bytes = self.payload.get(offset..)?;
        T::read_from_prefix(bytes).ok().map(|(val, _)| val)
    }

    pub fn with_callback(
        mut self,
        cb: MsgCallback,
        app_data: Option<AppData>,
    ) -> Self {
        self.reply = Some(ReplyTo::Callback { cb, app_data });
        self
    }

    pub fn with_reply(mut self, reply: ReplyTo) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn has_reply(&self) -> bool {
        self.reply.is_some()
    }

    pub(crate) fn take_reply(&mut self) -> Option<ReplyTo> {
        self.reply.take()
    }

    pub fn interface(&self) -> u32 {
        self.cm.interface()
    }

    pub fn msg_type(&self) -> u32 {
        self.cm.msg_type
    }

    pub fn is_notify(&self) -> bool {
        self.cm.is_notify()
    }

    pub fn is_ack(&self) -> bool {
        self.cm.is_ack()
    }

    /// A copy of this message marked with the given response, as if
    /// the firmware had answered it that way.
    pub fn as_response(&self, response: Response, error: u32) -> Self {
        let mut cm = self.cm;
        cm.response = response as u32;
        cm.error = error;
        Self { cm, payload: self.payload.clone(), reply: None }
    }
}

/// The limits a subsystem places on the messages it accepts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MsgBounds {
    pub name: &'static str,
    /// Types at or above this are rejected.
    pub max_type: u32,
    /// Lengths above this are rejected.
    pub max_len: u32,
}

impl MsgBounds {
    /// Check an outbound request against the same bounds the receive
    /// path applies, before it goes near a ring.
    pub fn check_tx<F>(&self, msg: &Msg, owns: F) -> super::Result<()>
    where
        F: Fn(u32) -> bool,
    {
        validate(&msg.cm, self, owns).map_err(|e| match e {
            EnvelopeError::BadInterface(if_num) => {
                super::Error::BadInterface(if_num)
            }
            EnvelopeError::BadType { ty, max } => {
                super::Error::BadMsgType { ty, max }
            }
            EnvelopeError::BadLen { len, max } => super::Error::TooLarge {
                len: len as usize,
                max: max as usize,
            },
            EnvelopeError::Truncated { .. } => {
                super::Error::BadParam("truncated message")
            }
        })
    }
}

/// Why an inbound message was refused.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum EnvelopeError {
    #[error("truncated message: {have} bytes, need {need}")]
    Truncated { have: usize, need: usize },

    #[error("interface {0} invalid for handler")]
    BadInterface(u32),

    #[error("message type {ty} out of range (max {max})")]
    BadType { ty: u32, max: u32 },

    #[error("message length {len} too large (max {max})")]
    BadLen { len: u32, max: u32 },
}

impl EnvelopeError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Truncated { .. } => "truncated",
            Self::BadInterface(_) => "bad interface",
            Self::BadType { .. } => "bad type",
            Self::BadLen { .. } => "bad length",
        }
    }
}

/// Check an envelope against a subsystem's bounds: interface first,
/// then message type, then length.
///
/// This is a pure function of its inputs; `owns` decides whether the
/// handler accepts messages for the interface.
pub fn validate<F>(
    cm: &CmnMsg,
    bounds: &MsgBounds,
    owns: F,
) -> Result<(), EnvelopeError>
where
    F: Fn(u32) -> bool,
{
    let if_num = cm.interface();
    if !is_valid_interface(if_num) || !owns(if_num) {
        return Err(EnvelopeError::BadInterface(if_num));
    }

    if cm.msg_type >= bounds.max_type {
        return Err(EnvelopeError::BadType {
            ty: cm.msg_type,
            max: bounds.max_type,
        });
    }

    if cm.len > bounds.max_len {
        return Err(EnvelopeError::BadLen { len: cm.len, max: bounds.max_len });
    }

    Ok(())
}

/// Log a response that reports a failure. Acks and notifications are
/// the normal case and stay quiet.
pub fn log_msg_failures(log: &dyn LogProvider, name: &str, cm: &CmnMsg) {
    if cm.is_ack() || cm.is_notify() {
        return;
    }

    let resp = match cm.response() {
        Ok(r) => r.to_string(),
        Err(raw) => format!("unknown({raw})"),
    };
    log.log(
        LogLevel::Warn,
        &format!(
            "{name}: msg failure - interface: {}, type: {}, response: {resp}, \
             error: {}",
            cm.interface(),
            cm.msg_type,
            cm.error
        ),
    );
}
