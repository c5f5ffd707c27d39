// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Interface number layout.
//!
//! The firmware addresses every node by a flat interface number. The
//! number space is carved into contiguous ranges:
//!
//! ```text
//! [ physical | virtual | tunnel | dynamic | special ]
//!   0..8       8..24     24..28   28..156   156..211
//! ```
//!
//! Dynamic numbers are handed out by the firmware on request; special
//! numbers name fixed firmware nodes.

pub const MAX_PHYSICAL_INTERFACES: u32 = 8;
pub const MAX_VIRTUAL_INTERFACES: u32 = 16;
pub const MAX_TUNNEL_INTERFACES: u32 = 4;
pub const MAX_DYNAMIC_INTERFACES: u32 = 128;
pub const MAX_SPECIAL_INTERFACES: u32 = 55;

pub const PHYSICAL_IF_START: u32 = 0;
pub const VIRTUAL_IF_START: u32 = PHYSICAL_IF_START + MAX_PHYSICAL_INTERFACES;
pub const TUNNEL_IF_START: u32 = VIRTUAL_IF_START + MAX_VIRTUAL_INTERFACES;
pub const DYNAMIC_IF_START: u32 = TUNNEL_IF_START + MAX_TUNNEL_INTERFACES;
pub const SPECIAL_IF_START: u32 = DYNAMIC_IF_START + MAX_DYNAMIC_INTERFACES;
pub const MAX_NET_INTERFACES: u32 = SPECIAL_IF_START + MAX_SPECIAL_INTERFACES;

pub const N2H_INTERFACE: u32 = SPECIAL_IF_START;
pub const ETH_RX_INTERFACE: u32 = SPECIAL_IF_START + 1;
pub const PPPOE_RX_INTERFACE: u32 = SPECIAL_IF_START + 2;
pub const IPV4_RX_INTERFACE: u32 = SPECIAL_IF_START + 3;
pub const IPV6_RX_INTERFACE: u32 = SPECIAL_IF_START + 4;
pub const PROFILER_INTERFACE: u32 = SPECIAL_IF_START + 5;
pub const CRYPTO_INTERFACE: u32 = SPECIAL_IF_START + 6;
pub const DTLS_INTERFACE: u32 = SPECIAL_IF_START + 7;
pub const C2C_TX_INTERFACE: u32 = SPECIAL_IF_START + 8;
pub const C2C_RX_INTERFACE: u32 = SPECIAL_IF_START + 9;
pub const IPSEC_ENCAP_IF_NUMBER: u32 = SPECIAL_IF_START + 10;
pub const IPSEC_DECAP_IF_NUMBER: u32 = SPECIAL_IF_START + 11;
pub const IPSEC_RULE_INTERFACE: u32 = SPECIAL_IF_START + 12;
pub const TUNIPIP6_INTERFACE: u32 = SPECIAL_IF_START + 13;
pub const L2TPV2_INTERFACE: u32 = SPECIAL_IF_START + 14;
pub const MAP_T_INTERFACE: u32 = SPECIAL_IF_START + 15;
pub const DYNAMIC_INTERFACE: u32 = SPECIAL_IF_START + 16;

/// Is `if_num` anywhere in the interface number space?
pub const fn is_valid_interface(if_num: u32) -> bool {
    if_num < MAX_NET_INTERFACES
}

/// Is `if_num` within the range the firmware allocates dynamic
/// interfaces from?
pub const fn is_dynamic_interface(if_num: u32) -> bool {
    if_num >= DYNAMIC_IF_START && if_num < SPECIAL_IF_START
}

pub const fn is_virtual_interface(if_num: u32) -> bool {
    if_num >= VIRTUAL_IF_START && if_num < TUNNEL_IF_START
}

/// The slot index of a dynamic interface, if `if_num` is one.
pub const fn dynamic_index(if_num: u32) -> Option<usize> {
    if is_dynamic_interface(if_num) {
        Some((if_num - DYNAMIC_IF_START) as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ranges_are_contiguous() {
        assert_eq!(DYNAMIC_IF_START, 28);
        assert_eq!(MAX_NET_INTERFACES, 211);
        assert!(DYNAMIC_INTERFACE < MAX_NET_INTERFACES);
        assert!(!is_dynamic_interface(DYNAMIC_IF_START - 1));
        assert!(is_dynamic_interface(DYNAMIC_IF_START));
        assert!(is_dynamic_interface(SPECIAL_IF_START - 1));
        assert!(!is_dynamic_interface(SPECIAL_IF_START));
        assert_eq!(dynamic_index(DYNAMIC_IF_START + 5), Some(5));
        assert_eq!(dynamic_index(IPV6_RX_INTERFACE), None);
    }
}
