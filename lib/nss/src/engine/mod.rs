// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The driver engine.
//!
//! Leaves first: [`ring`] is the shared-memory transport, [`core`]
//! drives one accelerator core (sending, interrupt service, inbound
//! dispatch), [`msg`] and [`handler`] validate and route control
//! messages, [`sync`] correlates replies with requests, and [`top`]
//! ties it together into a driver instance. The feature subsystems are
//! built on top of those.
pub mod core;
pub mod crypto;
pub mod driver;
pub mod dynamic_interface;
pub mod hal;
pub mod handler;
pub mod ipsec;
pub mod ipv6;
pub mod l2tpv2;
pub mod map_t;
pub mod msg;
pub mod nbuf;
pub mod ring;
pub mod stats;
pub mod sync;
pub mod top;
pub mod tunipip6;
pub mod wifi_if;

pub use driver::Driver;
pub use msg::Msg;
pub use nbuf::Nbuf;
pub use top::NssTop;

use crate::api::Response;
use crate::api::TxStatus;
use thiserror::Error;

/// Everything that can go wrong on the transmit and control paths.
///
/// Receive-side validation failures are not errors in this sense; they
/// are logged, counted, and dropped (see [`msg::EnvelopeError`]).
#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    #[error("core not ready")]
    NotReady,

    #[error("buffer too large: {len} > {max}")]
    TooLarge { len: usize, max: usize },

    #[error("bad parameter: {0}")]
    BadParam(&'static str),

    #[error("interface {0} not valid for this request")]
    BadInterface(u32),

    #[error("message type {ty} out of range (max {max})")]
    BadMsgType { ty: u32, max: u32 },

    #[error("queue {0} full")]
    QueueFull(u8),

    #[error("not enabled")]
    NotEnabled,

    #[error("not supported")]
    NotSupported,

    #[error("packet too short: {0} bytes")]
    TooShort(usize),

    #[error("no response after {0} ms")]
    Timeout(u64),

    #[error("firmware rejected request: {response} (error {error})")]
    Nack { response: Response, error: u32 },

    #[error("interface {0} out of range")]
    OutOfRange(u32),

    #[error("interface {0} already has a handler")]
    AlreadyRegistered(u32),

    #[error("buffer allocation failed")]
    NoMem,

    #[error("{0}")]
    Failure(&'static str),

    #[error("invalid configuration: {0}")]
    Cfg(String),
}

impl Error {
    /// The coarse status reported to the network stack glue.
    pub fn tx_status(&self) -> TxStatus {
        match self {
            Self::NotReady => TxStatus::NotReady,
            Self::TooLarge { .. } => TxStatus::TooLarge,
            Self::BadParam(_) => TxStatus::BadParam,
            Self::QueueFull(_) => TxStatus::Queue,
            Self::NotEnabled => TxStatus::NotEnabled,
            Self::NotSupported => TxStatus::NotSupported,
            Self::TooShort(_) => TxStatus::TooShort,
            _ => TxStatus::Failure,
        }
    }

    /// A transient condition the caller may retry after backing off.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::QueueFull(_) | Self::NoMem)
    }
}

pub type Result<T> = ::core::result::Result<T, Error>;

/// Map a send result onto the status reported to the stack glue.
pub fn tx_status<T>(res: &Result<T>) -> TxStatus {
    match res {
        Ok(_) => TxStatus::Success,
        Err(e) => e.tx_status(),
    }
}
