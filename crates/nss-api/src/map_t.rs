// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! MAP-T messages.

use super::stats::NodeStatsSync;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum MapTMsgType {
    InstanceRuleConfig = 0,
    InstanceRuleDeconfig = 1,
    SyncStats = 2,
}

pub const MAP_T_MSG_MAX: u32 = 3;

impl TryFrom<u32> for MapTMsgType {
    type Error = ();

    fn try_from(num: u32) -> Result<Self, Self::Error> {
        match num {
            0 => Ok(Self::InstanceRuleConfig),
            1 => Ok(Self::InstanceRuleDeconfig),
            2 => Ok(Self::SyncStats),
            _ => Err(()),
        }
    }
}

/// The number of MAP-T instances the driver keeps debug stats for.
pub const MAX_MAP_T_DYNAMIC_INTERFACES: usize = 4;

/// Payload of INSTANCE_RULE_CONFIG.
#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct MapTInstanceRuleConfig {
    pub rule_num: u32,
    pub total_rules: u32,
    pub local_ipv6_prefix: [u32; 4],
    pub local_ipv4_prefix: u32,
    pub remote_ipv6_prefix: [u32; 4],
    pub remote_ipv4_prefix: u32,
    pub local_ipv6_prefix_len: u8,
    pub local_ipv4_prefix_len: u8,
    pub local_ea_len: u8,
    pub local_psid_offset: u8,
    pub reserve_ports: u32,
    pub remote_ipv6_prefix_len: u8,
    pub remote_ipv4_prefix_len: u8,
    pub remote_ea_len: u8,
    pub remote_psid_offset: u8,
    pub sibling_if: u32,
}

#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct MapTV4ToV6Debug {
    pub exception_pkts: u32,
    pub no_matching_rule: u32,
    pub not_tcp_or_udp: u32,
    pub rule_err_local_psid_mismatch: u32,
    pub rule_err_local_ipv6: u32,
    pub rule_err_remote_psid: u32,
    pub rule_err_remote_ea_bits: u32,
    pub rule_err_remote_ipv6: u32,
}

#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct MapTV6ToV4Debug {
    pub exception_pkts: u32,
    pub no_matching_rule: u32,
    pub not_tcp_or_udp: u32,
    pub rule_err_local_ipv4: u32,
    pub rule_err_remote_ipv4: u32,
}

/// Payload of SYNC_STATS.
#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct MapTSyncStats {
    pub node_stats: NodeStatsSync,
    pub v4_to_v6: MapTV4ToV6Debug,
    pub v6_to_v4: MapTV6ToV4Debug,
}

pub const MAP_T_MSG_MAX_LEN: usize = {
    let c = core::mem::size_of::<MapTInstanceRuleConfig>();
    let s = core::mem::size_of::<MapTSyncStats>();
    if c > s { c } else { s }
};
