// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Wifi redirect virtual interface messages.

use super::stats::NodeStatsSync;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum WifiIfMsgType {
    TxCreate = 0,
    TxDestroy = 1,
    StatsSync = 2,
}

pub const WIFI_IF_MSG_MAX: u32 = 3;

impl TryFrom<u32> for WifiIfMsgType {
    type Error = ();

    fn try_from(num: u32) -> Result<Self, Self::Error> {
        match num {
            0 => Ok(Self::TxCreate),
            1 => Ok(Self::TxDestroy),
            2 => Ok(Self::StatsSync),
            _ => Err(()),
        }
    }
}

/// Payload of TX_CREATE.
#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct WifiIfCreate {
    pub flags: u32,
    pub mac_addr: [u8; 6],
    pub _pad: [u8; 2],
}

/// Payload of STATS_SYNC.
#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct WifiIfStatsSync {
    pub node_stats: NodeStatsSync,
    pub tx_enqueue_failed: u32,
    pub shaper_enqueue_failed: u32,
}

pub const WIFI_IF_MSG_MAX_LEN: usize = core::mem::size_of::<WifiIfStatsSync>();
