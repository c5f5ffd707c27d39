// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Crypto engine messages.

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const CRYPTO_MAX_IDXS: usize = 16;
pub const CRYPTO_MAX_ENGINES: usize = 4;
pub const CRYPTO_BAM_PP: usize = 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum CryptoMsgType {
    None = 0,
    OpenEng = 1,
    CloseEng = 2,
    UpdateSession = 3,
    Stats = 4,
}

pub const CRYPTO_MSG_TYPE_MAX: u32 = 5;

impl TryFrom<u32> for CryptoMsgType {
    type Error = ();

    fn try_from(num: u32) -> Result<Self, Self::Error> {
        match num {
            0 => Ok(Self::None),
            1 => Ok(Self::OpenEng),
            2 => Ok(Self::CloseEng),
            3 => Ok(Self::UpdateSession),
            4 => Ok(Self::Stats),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum CryptoSessionState {
    None = 0,
    Active = 1,
    Free = 2,
}

#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct CryptoIdx {
    pub pp_num: u16,
    pub cmd_len: u16,
    pub cblk_paddr: u32,
}

/// Payload of OPEN_ENG.
#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct CryptoConfigEng {
    pub eng_id: u32,
    pub bam_pbase: u32,
    pub crypto_pbase: u32,
    pub desc_paddr: [u32; CRYPTO_BAM_PP],
    pub idx: [CryptoIdx; CRYPTO_MAX_IDXS],
}

/// Payload of UPDATE_SESSION.
#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct CryptoConfigSession {
    pub idx: u32,
    pub state: u32,
    pub iv_len: u32,
}

#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct CryptoStats {
    pub queued: u32,
    pub completed: u32,
    pub dropped: u32,
}

/// Payload of STATS.
#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct CryptoSyncStats {
    pub eng_stats: [CryptoStats; CRYPTO_MAX_ENGINES],
    pub idx_stats: [CryptoStats; CRYPTO_MAX_IDXS],
    pub total: CryptoStats,
}

pub const CRYPTO_MSG_MAX_LEN: usize = {
    let e = core::mem::size_of::<CryptoConfigEng>();
    let s = core::mem::size_of::<CryptoSyncStats>();
    if e > s { e } else { s }
};
