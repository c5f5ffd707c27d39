// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The common message envelope.
//!
//! Every control message exchanged with the firmware starts with a
//! [`CmnMsg`]. The layout is a firmware ABI contract and must not
//! change.

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use super::NSS_MSG_VERSION;

/// The response classification carried in [`CmnMsg::response`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[repr(u32)]
pub enum Response {
    /// The request was accepted.
    Ack = 0,
    /// Envelope version mismatch.
    EVersion = 1,
    /// Request addressed to an unknown interface.
    EInterface = 2,
    /// Payload length rejected.
    ELength = 3,
    /// The message itself was rejected; see [`CmnMsg::error`].
    EMsg = 4,
    /// An unsolicited event, not a reply to any request.
    Notify = 5,
    /// Not yet answered. Every outbound request carries this.
    None = 6,
}

impl Response {
    /// Is this an explicit rejection by the firmware?
    pub fn is_nack(self) -> bool {
        matches!(
            self,
            Self::EVersion | Self::EInterface | Self::ELength | Self::EMsg
        )
    }
}

impl TryFrom<u32> for Response {
    type Error = ();

    fn try_from(num: u32) -> Result<Self, Self::Error> {
        match num {
            0 => Ok(Self::Ack),
            1 => Ok(Self::EVersion),
            2 => Ok(Self::EInterface),
            3 => Ok(Self::ELength),
            4 => Ok(Self::EMsg),
            5 => Ok(Self::Notify),
            6 => Ok(Self::None),
            _ => Err(()),
        }
    }
}

impl Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Ack => "ACK",
            Self::EVersion => "EVERSION",
            Self::EInterface => "EINTERFACE",
            Self::ELength => "ELENGTH",
            Self::EMsg => "EMSG",
            Self::Notify => "NOTIFY",
            Self::None => "NONE",
        };
        write!(f, "{s}")
    }
}

/// The common envelope prefixed to every control message.
///
/// `cb` and `app_data` are opaque to the firmware and echoed back in
/// the reply. The driver uses `cb` to carry a request id which it
/// resolves through its own pending table; `app_data` is always zero.
#[derive(
    Clone, Copy, Debug, Default, Eq, FromBytes, Immutable, IntoBytes, KnownLayout, PartialEq,
)]
#[repr(C)]
pub struct CmnMsg {
    pub version: u16,
    pub interface: u16,
    pub response: u32,
    pub msg_type: u32,
    pub error: u32,
    pub cb: u32,
    pub app_data: u32,
    pub len: u32,
}

pub const CMN_MSG_LEN: usize = core::mem::size_of::<CmnMsg>();

impl CmnMsg {
    /// Build the envelope of an outbound request.
    pub fn new(interface: u32, msg_type: u32, len: u32) -> Self {
        Self {
            version: NSS_MSG_VERSION,
            interface: interface as u16,
            response: Response::None as u32,
            msg_type,
            error: 0,
            cb: 0,
            app_data: 0,
            len,
        }
    }

    pub fn interface(&self) -> u32 {
        u32::from(self.interface)
    }

    pub fn response(&self) -> Result<Response, u32> {
        Response::try_from(self.response).map_err(|_| self.response)
    }

    pub fn is_notify(&self) -> bool {
        self.response == Response::Notify as u32
    }

    pub fn is_ack(&self) -> bool {
        self.response == Response::Ack as u32
    }
}
