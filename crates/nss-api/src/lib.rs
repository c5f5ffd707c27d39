// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Wire-level API shared between the NSS host driver and anything that
//! speaks to the firmware: the common message envelope, the interface
//! number layout, and the message types and payloads of each feature
//! subsystem.

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

use alloc::string::String;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

pub mod cmn;
pub mod crypto;
pub mod dynamic_interface;
pub mod ifnum;
pub mod ipsec;
pub mod ipv6;
pub mod l2tpv2;
pub mod map_t;
pub mod stats;
pub mod tunipip6;
pub mod wifi_if;

pub use cmn::*;
pub use dynamic_interface::DynamicIfType;
pub use ifnum::*;
pub use stats::*;

/// The version stamped into every envelope we send. The firmware
/// rejects a mismatch with [`Response::EVersion`].
pub const NSS_MSG_VERSION: u16 = 1;

/// The maximum number of accelerator cores on a single SoC.
pub const NSS_MAX_CORES: usize = 2;

/// Size of the payload area of a control buffer.
pub const NBUF_PAYLOAD_SIZE: usize = 1984;

/// Control messages may never be larger than a page.
pub const PAGE_SIZE: usize = 4096;

/// Length of an Ethernet header; anything this short or shorter is not
/// a packet.
pub const ETH_HLEN: usize = 14;

/// An accelerator core.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CoreId {
    Core0 = 0,
    Core1 = 1,
}

impl CoreId {
    pub fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for CoreId {
    type Error = ();

    fn try_from(num: u8) -> Result<Self, Self::Error> {
        match num {
            0 => Ok(Self::Core0),
            1 => Ok(Self::Core1),
            _ => Err(()),
        }
    }
}

impl core::str::FromStr for CoreId {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "0" | "core0" => Ok(Self::Core0),
            "1" | "core1" => Ok(Self::Core1),
            _ => Err(format!("invalid core: {s}")),
        }
    }
}

impl Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "core{}", *self as u8)
    }
}

/// The status a transmit-side operation reports to its caller.
///
/// This is the coarse outcome the network stack glue consumes; the
/// driver's own error type carries more detail and maps onto this.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum TxStatus {
    Success,
    Failure,
    Queue,
    NotReady,
    TooLarge,
    TooShort,
    NotSupported,
    BadParam,
    NotEnabled,
}

impl Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Queue => "queue full",
            Self::NotReady => "not ready",
            Self::TooLarge => "too large",
            Self::TooShort => "too short",
            Self::NotSupported => "not supported",
            Self::BadParam => "bad parameter",
            Self::NotEnabled => "not enabled",
        };
        write!(f, "{s}")
    }
}
