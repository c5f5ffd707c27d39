// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! L2TPv2 session messages.

use super::stats::NodeStatsSync;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum L2tpv2MsgType {
    SessionCreate = 0,
    SessionDestroy = 1,
    SyncStats = 2,
}

pub const L2TPV2_MSG_MAX: u32 = 3;

impl TryFrom<u32> for L2tpv2MsgType {
    type Error = ();

    fn try_from(num: u32) -> Result<Self, Self::Error> {
        match num {
            0 => Ok(Self::SessionCreate),
            1 => Ok(Self::SessionDestroy),
            2 => Ok(Self::SyncStats),
            _ => Err(()),
        }
    }
}

/// The number of L2TPv2 sessions the driver keeps debug stats for.
pub const MAX_L2TPV2_DYNAMIC_INTERFACES: usize = 4;

#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct L2tpv2SessionCreate {
    pub local_tunnel_id: u16,
    pub local_session_id: u16,
    pub peer_tunnel_id: u16,
    pub peer_session_id: u16,
    pub sip: u32,
    pub dip: u32,
    pub reorder_timeout: u32,
    pub sport: u16,
    pub dport: u16,
    pub hop_limit: u8,
    pub udp_csum: u8,
    pub reorder_len: u16,
}

#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct L2tpv2SessionDestroy {
    pub session_id: u16,
    pub tunnel_id: u16,
}

#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct L2tpv2DebugSync {
    pub rx_ppp_lcp_pkts: u32,
    pub rx_exception_data_pkts: u32,
    pub encap_pbuf_alloc_fail: u32,
    pub decap_pbuf_alloc_fail: u32,
}

/// Payload of SYNC_STATS.
#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct L2tpv2SyncSessionStats {
    pub node_stats: NodeStatsSync,
    pub tx_errors: u32,
    pub rx_seq_errors: u32,
    pub rx_oos_packets: u32,
    pub rx_errors: u32,
    pub rx_discards: u32,
    pub debug_stats: L2tpv2DebugSync,
}

pub const L2TPV2_MSG_MAX_LEN: usize = {
    let c = core::mem::size_of::<L2tpv2SessionCreate>();
    let s = core::mem::size_of::<L2tpv2SyncSessionStats>();
    if c > s { c } else { s }
};
