// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IPsec offload messages.

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum IpsecMsgType {
    None = 0,
    AddRule = 1,
    DelRule = 2,
    FlushTun = 3,
    SyncSaStats = 4,
    SyncFlowStats = 5,
    SyncNodeStats = 6,
    ConfigureNode = 7,
}

pub const IPSEC_MSG_TYPE_MAX: u32 = 8;

impl TryFrom<u32> for IpsecMsgType {
    type Error = ();

    fn try_from(num: u32) -> Result<Self, Self::Error> {
        match num {
            0 => Ok(Self::None),
            1 => Ok(Self::AddRule),
            2 => Ok(Self::DelRule),
            3 => Ok(Self::FlushTun),
            4 => Ok(Self::SyncSaStats),
            5 => Ok(Self::SyncFlowStats),
            6 => Ok(Self::SyncNodeStats),
            7 => Ok(Self::ConfigureNode),
            _ => Err(()),
        }
    }
}

/// Outer header selector of a security association.
#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct IpsecSel {
    pub ipv4_src: u32,
    pub ipv4_dst: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub esp_spi: u32,
    pub ipv4_proto: u8,
    pub ip_ver: u8,
    pub _pad: [u8; 2],
}

#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct IpsecRuleData {
    pub crypto_index: u16,
    pub window_size: u16,
    pub cipher_blk_len: u8,
    pub iv_len: u8,
    pub icv_len: u8,
    pub nat_t_req: u8,
    pub esp_seq_skip: u8,
    pub esp_tail_skip: u8,
    pub use_pattern: u8,
    pub _pad: u8,
}

/// Payload of ADD_RULE and DEL_RULE.
#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct IpsecRule {
    pub oip: IpsecSel,
    pub data: IpsecRuleData,
    pub index: u32,
    pub sa_idx: u32,
}

/// Payload of SYNC_SA_STATS.
#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct IpsecSaStatsSync {
    pub sel: IpsecSel,
    pub count: u32,
    pub bytes: u32,
    pub seq_num: u32,
    pub window_max: u32,
}

/// Payload of SYNC_NODE_STATS.
#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct IpsecNodeStatsSync {
    pub enqueued: u32,
    pub completed: u32,
    pub linearized: u32,
    pub exceptioned: u32,
    pub fail_enqueue: u32,
}

/// The largest payload any IPsec message carries.
pub const IPSEC_MSG_MAX_LEN: usize = {
    let rule = core::mem::size_of::<IpsecRule>();
    let sa = core::mem::size_of::<IpsecSaStatsSync>();
    if rule > sa { rule } else { sa }
};
