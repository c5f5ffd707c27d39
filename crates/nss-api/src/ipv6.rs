// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IPv6 forwarding engine messages.

use super::stats::NodeStatsSync;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Ipv6MsgType {
    CreateRule = 0,
    DestroyRule = 1,
    Deprecated = 2,
    ConnStatsSync = 3,
    NodeStatsSync = 4,
    ConnCfgRule = 5,
    CreateMcRule = 6,
    ConnStatsSyncMany = 7,
}

pub const IPV6_MSG_TYPE_MAX: u32 = 8;

impl TryFrom<u32> for Ipv6MsgType {
    type Error = ();

    fn try_from(num: u32) -> Result<Self, Self::Error> {
        match num {
            0 => Ok(Self::CreateRule),
            1 => Ok(Self::DestroyRule),
            2 => Ok(Self::Deprecated),
            3 => Ok(Self::ConnStatsSync),
            4 => Ok(Self::NodeStatsSync),
            5 => Ok(Self::ConnCfgRule),
            6 => Ok(Self::CreateMcRule),
            7 => Ok(Self::ConnStatsSyncMany),
            _ => Err(()),
        }
    }
}

/// The smallest connection table the firmware accepts.
pub const MIN_NUM_CONN: u32 = 256;
/// The combined IPv4 + IPv6 connection budget.
pub const MAX_TOTAL_NUM_CONN: u32 = 8192;
/// Connection table size used until configured otherwise.
pub const DEFAULT_NUM_CONN: u32 = 4096;

pub const IPV6_EXCEPTION_EVENT_MAX: usize = 16;

/// Payload of CONN_CFG_RULE. `num_conn` is big-endian on the wire.
#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct Ipv6ConnCfg {
    pub num_conn: u32,
}

/// Payload of CONN_STATS_SYNC; one entry of CONN_STATS_SYNC_MANY.
#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct Ipv6ConnSync {
    pub protocol: u32,
    pub flow_ip: [u32; 4],
    pub flow_ident: u32,
    pub return_ip: [u32; 4],
    pub return_ident: u32,
    pub flow_rx_packet_count: u32,
    pub flow_rx_byte_count: u32,
    pub flow_tx_packet_count: u32,
    pub flow_tx_byte_count: u32,
    pub return_rx_packet_count: u32,
    pub return_rx_byte_count: u32,
    pub return_tx_packet_count: u32,
    pub return_tx_byte_count: u32,
    pub reason: u32,
}

/// Header of CONN_STATS_SYNC_MANY; `count` [`Ipv6ConnSync`] entries
/// follow it in the payload.
#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct Ipv6ConnSyncManyHdr {
    pub index: u16,
    pub next: u16,
    pub count: u16,
    pub size: u16,
}

pub const IPV6_CONN_SYNC_LEN: usize = core::mem::size_of::<Ipv6ConnSync>();
pub const IPV6_CONN_SYNC_MANY_HDR_LEN: usize =
    core::mem::size_of::<Ipv6ConnSyncManyHdr>();

/// Payload of NODE_STATS_SYNC.
#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct Ipv6NodeSync {
    pub node_stats: NodeStatsSync,
    pub connection_create_requests: u32,
    pub connection_create_collisions: u32,
    pub connection_create_invalid_interface: u32,
    pub connection_destroy_requests: u32,
    pub connection_destroy_misses: u32,
    pub connection_hash_hits: u32,
    pub connection_hash_reorders: u32,
    pub connection_flushes: u32,
    pub connection_evictions: u32,
    pub fragmentations: u32,
    pub frag_fails: u32,
    pub mc_connection_create_requests: u32,
    pub mc_connection_update_requests: u32,
    pub mc_connection_create_invalid_interface: u32,
    pub mc_connection_destroy_requests: u32,
    pub mc_connection_destroy_misses: u32,
    pub mc_connection_flushes: u32,
    pub exception_events: [u32; IPV6_EXCEPTION_EVENT_MAX],
}

/// The IPv6 message union is as large as a control buffer allows a
/// batched stats sync to be.
pub const IPV6_MSG_MAX_LEN: usize = 1024;
