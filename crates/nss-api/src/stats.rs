// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Statistics blocks shared by several subsystems.

use serde::Deserialize;
use serde::Serialize;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Per-node packet counters as synced by the firmware.
#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct NodeStatsSync {
    pub rx_packets: u32,
    pub rx_bytes: u32,
    pub rx_dropped: u32,
    pub tx_packets: u32,
    pub tx_bytes: u32,
}

/// Accumulated node counters as kept by the driver.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct NodeStats {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_dropped: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

impl NodeStats {
    pub fn accumulate(&mut self, sync: &NodeStatsSync) {
        self.rx_packets += u64::from(sync.rx_packets);
        self.rx_bytes += u64::from(sync.rx_bytes);
        self.rx_dropped += u64::from(sync.rx_dropped);
        self.tx_packets += u64::from(sync.tx_packets);
        self.tx_bytes += u64::from(sync.tx_bytes);
    }
}
