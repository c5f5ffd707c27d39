// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IPv4-in-IPv6 (DS-Lite) tunnel messages.

use super::stats::NodeStatsSync;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Tunipip6MsgType {
    TxIfCreate = 0,
    TxIfDestroy = 1,
    RxStatsSync = 2,
}

pub const TUNIPIP6_MSG_MAX: u32 = 3;

impl TryFrom<u32> for Tunipip6MsgType {
    type Error = ();

    fn try_from(num: u32) -> Result<Self, Self::Error> {
        match num {
            0 => Ok(Self::TxIfCreate),
            1 => Ok(Self::TxIfDestroy),
            2 => Ok(Self::RxStatsSync),
            _ => Err(()),
        }
    }
}

/// Payload of TX_IF_CREATE.
#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct Tunipip6Create {
    pub saddr: [u32; 4],
    pub daddr: [u32; 4],
    pub flowlabel: u32,
    pub flags: u32,
    pub hop_limit: u8,
    pub draft03: u8,
    pub _pad: [u8; 2],
}

/// Payload of RX_STATS_SYNC.
#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct Tunipip6StatsSync {
    pub node_stats: NodeStatsSync,
}

pub const TUNIPIP6_MSG_MAX_LEN: usize = core::mem::size_of::<Tunipip6Create>();
