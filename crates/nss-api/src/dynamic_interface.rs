// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Dynamic interface allocation messages.

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The feature a dynamic interface is allocated for.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum DynamicIfType {
    #[default]
    None = 0,
    Wifi = 1,
    L2tpv2 = 2,
    MapT = 3,
    Tunipip6 = 4,
}

/// One past the last valid [`DynamicIfType`].
pub const DYNAMIC_IF_TYPE_MAX: u32 = 5;

impl DynamicIfType {
    pub const ALL: [Self; DYNAMIC_IF_TYPE_MAX as usize] =
        [Self::None, Self::Wifi, Self::L2tpv2, Self::MapT, Self::Tunipip6];
}

impl TryFrom<u32> for DynamicIfType {
    type Error = ();

    fn try_from(num: u32) -> Result<Self, Self::Error> {
        match num {
            0 => Ok(Self::None),
            1 => Ok(Self::Wifi),
            2 => Ok(Self::L2tpv2),
            3 => Ok(Self::MapT),
            4 => Ok(Self::Tunipip6),
            _ => Err(()),
        }
    }
}

impl Display for DynamicIfType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Wifi => "wifi",
            Self::L2tpv2 => "l2tpv2",
            Self::MapT => "map_t",
            Self::Tunipip6 => "tunipip6",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum DynamicIfMsgType {
    AllocNode = 0,
    DeallocNode = 1,
}

pub const DYNAMIC_IF_MSG_MAX: u32 = 2;

impl TryFrom<u32> for DynamicIfMsgType {
    type Error = ();

    fn try_from(num: u32) -> Result<Self, Self::Error> {
        match num {
            0 => Ok(Self::AllocNode),
            1 => Ok(Self::DeallocNode),
            _ => Err(()),
        }
    }
}

/// Payload of both ALLOC_NODE and DEALLOC_NODE.
///
/// An allocation request carries `if_num = -1`; the firmware fills in
/// the number it assigned.
#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct DynamicIfNodeMsg {
    pub if_type: u32,
    pub if_num: i32,
}

pub const DYNAMIC_IF_MSG_MAX_LEN: usize =
    core::mem::size_of::<DynamicIfNodeMsg>();
