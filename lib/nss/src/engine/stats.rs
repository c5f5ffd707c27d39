// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Driver-wide statistics.
use crate::api::ipv6::IPV6_EXCEPTION_EVENT_MAX;
use crate::api::ipv6::Ipv6ConnSync;
use crate::api::ipv6::Ipv6NodeSync;
use crate::api::NodeStats;
use crate::api::NodeStatsSync;
use crate::api::l2tpv2::L2tpv2DebugSync;
use crate::api::map_t::MapTSyncStats;
use crate::ddi::kstat::KStatU64;
use crate::ddi::sync::KMutex;
use kstat_macro::KStatProvider;
use serde::Serialize;
use std::collections::BTreeMap;

/// Counters kept by the transport and dispatch layers.
#[derive(KStatProvider)]
pub struct DrvStats {
    pub tx_cmd_req: KStatU64,
    pub tx_packet: KStatU64,
    pub tx_buffer_reuse: KStatU64,
    pub tx_empty: KStatU64,
    pub rx_cmd_resp: KStatU64,
    pub rx_packet: KStatU64,
    pub rx_status: KStatU64,
    pub rx_empty: KStatU64,
    pub rx_dropped: KStatU64,
    pub rx_invalid: KStatU64,
    pub rx_late: KStatU64,
    pub rx_reasm_drops: KStatU64,
    pub rx_bad_desc: KStatU64,
    pub nbuf_alloc_fails: KStatU64,
    pub queue_full: KStatU64,
    pub sync_timeouts: KStatU64,
}

/// Accumulated IPv6 engine counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Ipv6Stats {
    pub accelerated_rx_pkts: u64,
    pub accelerated_rx_bytes: u64,
    pub accelerated_tx_pkts: u64,
    pub accelerated_tx_bytes: u64,
    pub connection_create_requests: u64,
    pub connection_create_collisions: u64,
    pub connection_create_invalid_interface: u64,
    pub connection_destroy_requests: u64,
    pub connection_destroy_misses: u64,
    pub connection_hash_hits: u64,
    pub connection_hash_reorders: u64,
    pub connection_flushes: u64,
    pub connection_evictions: u64,
    pub fragmentations: u64,
    pub frag_fails: u64,
    pub mc_connection_create_requests: u64,
    pub mc_connection_update_requests: u64,
    pub mc_connection_create_invalid_interface: u64,
    pub mc_connection_destroy_requests: u64,
    pub mc_connection_destroy_misses: u64,
    pub mc_connection_flushes: u64,
    pub exception_events: [u64; IPV6_EXCEPTION_EVENT_MAX],
}

impl Ipv6Stats {
    /// Fold one connection's counters in; flow and return directions
    /// are summed.
    pub fn add_conn(&mut self, sync: &Ipv6ConnSync) {
        let sum = |a: u32, b: u32| u64::from(a) + u64::from(b);
        self.accelerated_rx_pkts +=
            sum(sync.flow_rx_packet_count, sync.return_rx_packet_count);
        self.accelerated_rx_bytes +=
            sum(sync.flow_rx_byte_count, sync.return_rx_byte_count);
        self.accelerated_tx_pkts +=
            sum(sync.flow_tx_packet_count, sync.return_tx_packet_count);
        self.accelerated_tx_bytes +=
            sum(sync.flow_tx_byte_count, sync.return_tx_byte_count);
    }

    pub fn add_node(&mut self, sync: &Ipv6NodeSync) {
        let n = |v: u32| u64::from(v);
        self.connection_create_requests += n(sync.connection_create_requests);
        self.connection_create_collisions +=
            n(sync.connection_create_collisions);
        self.connection_create_invalid_interface +=
            n(sync.connection_create_invalid_interface);
        self.connection_destroy_requests += n(sync.connection_destroy_requests);
        self.connection_destroy_misses += n(sync.connection_destroy_misses);
        self.connection_hash_hits += n(sync.connection_hash_hits);
        self.connection_hash_reorders += n(sync.connection_hash_reorders);
        self.connection_flushes += n(sync.connection_flushes);
        self.connection_evictions += n(sync.connection_evictions);
        self.fragmentations += n(sync.fragmentations);
        self.frag_fails += n(sync.frag_fails);
        self.mc_connection_create_requests +=
            n(sync.mc_connection_create_requests);
        self.mc_connection_update_requests +=
            n(sync.mc_connection_update_requests);
        self.mc_connection_create_invalid_interface +=
            n(sync.mc_connection_create_invalid_interface);
        self.mc_connection_destroy_requests +=
            n(sync.mc_connection_destroy_requests);
        self.mc_connection_destroy_misses +=
            n(sync.mc_connection_destroy_misses);
        self.mc_connection_flushes += n(sync.mc_connection_flushes);
        for (acc, ev) in
            self.exception_events.iter_mut().zip(sync.exception_events)
        {
            *acc += n(ev);
        }
    }
}

/// Statistics shared by several subsystems, kept under the global
/// stats lock.
#[derive(Clone, Debug, Default, Serialize)]
pub struct GlobalStats {
    pub node: BTreeMap<u32, NodeStats>,
    pub ipv6: Ipv6Stats,
}

impl GlobalStats {
    pub fn add_node(&mut self, if_num: u32, sync: &NodeStatsSync) {
        self.node.entry(if_num).or_default().accumulate(sync);
    }

    pub fn node(&self, if_num: u32) -> NodeStats {
        self.node.get(&if_num).copied().unwrap_or_default()
    }
}

/// Per-session L2TPv2 counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct L2tpv2DebugStats {
    pub rx_ppp_lcp_pkts: u64,
    pub rx_exp_data_pkts: u64,
    pub encap_pbuf_alloc_fail_pkts: u64,
    pub decap_pbuf_alloc_fail_pkts: u64,
}

impl L2tpv2DebugStats {
    pub fn add(&mut self, sync: &L2tpv2DebugSync) {
        self.rx_ppp_lcp_pkts += u64::from(sync.rx_ppp_lcp_pkts);
        self.rx_exp_data_pkts += u64::from(sync.rx_exception_data_pkts);
        self.encap_pbuf_alloc_fail_pkts +=
            u64::from(sync.encap_pbuf_alloc_fail);
        self.decap_pbuf_alloc_fail_pkts +=
            u64::from(sync.decap_pbuf_alloc_fail);
    }
}

/// Per-instance MAP-T counters, one group per translation direction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct MapTDebugStats {
    pub v4_to_v6_pbuf_exception: u64,
    pub v4_to_v6_pbuf_no_matching_rule: u64,
    pub v4_to_v6_pbuf_not_tcp_or_udp: u64,
    pub v4_to_v6_rule_err_local_psid_mismatch: u64,
    pub v4_to_v6_rule_err_local_ipv6: u64,
    pub v4_to_v6_rule_err_remote_psid: u64,
    pub v4_to_v6_rule_err_remote_ea_bits: u64,
    pub v4_to_v6_rule_err_remote_ipv6: u64,
    pub v6_to_v4_pbuf_exception: u64,
    pub v6_to_v4_pbuf_no_matching_rule: u64,
    pub v6_to_v4_pbuf_not_tcp_or_udp: u64,
    pub v6_to_v4_rule_err_local_ipv4: u64,
    pub v6_to_v4_rule_err_remote_ipv4: u64,
}

impl MapTDebugStats {
    pub fn add(&mut self, sync: &MapTSyncStats) {
        let n = |v: u32| u64::from(v);
        let (a, b) = (&sync.v4_to_v6, &sync.v6_to_v4);
        self.v4_to_v6_pbuf_exception += n(a.exception_pkts);
        self.v4_to_v6_pbuf_no_matching_rule += n(a.no_matching_rule);
        self.v4_to_v6_pbuf_not_tcp_or_udp += n(a.not_tcp_or_udp);
        self.v4_to_v6_rule_err_local_psid_mismatch +=
            n(a.rule_err_local_psid_mismatch);
        self.v4_to_v6_rule_err_local_ipv6 += n(a.rule_err_local_ipv6);
        self.v4_to_v6_rule_err_remote_psid += n(a.rule_err_remote_psid);
        self.v4_to_v6_rule_err_remote_ea_bits += n(a.rule_err_remote_ea_bits);
        self.v4_to_v6_rule_err_remote_ipv6 += n(a.rule_err_remote_ipv6);
        self.v6_to_v4_pbuf_exception += n(b.exception_pkts);
        self.v6_to_v4_pbuf_no_matching_rule += n(b.no_matching_rule);
        self.v6_to_v4_pbuf_not_tcp_or_udp += n(b.not_tcp_or_udp);
        self.v6_to_v4_rule_err_local_ipv4 += n(b.rule_err_local_ipv4);
        self.v6_to_v4_rule_err_remote_ipv4 += n(b.rule_err_remote_ipv4);
    }
}

/// The debug counters of one registered instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct InstanceDebug<T> {
    pub if_num: u32,
    pub if_index: u32,
    pub stats: T,
}

/// A fixed number of per-instance debug counter sets, keyed by
/// interface number.
///
/// Each table has its own lock so syncing one subsystem's counters
/// never contends with the global stats lock.
pub struct DebugTable<T, const N: usize> {
    slots: KMutex<[Option<InstanceDebug<T>>; N]>,
}

impl<T: Copy + Default, const N: usize> Default for DebugTable<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Default, const N: usize> DebugTable<T, N> {
    pub fn new() -> Self {
        Self { slots: KMutex::new([None; N]) }
    }

    /// Start counting for `if_num`. Returns `false` when every slot is
    /// taken.
    pub fn claim(&self, if_num: u32, if_index: u32) -> bool {
        let mut slots = self.slots.lock();
        if slots.iter().flatten().any(|e| e.if_num == if_num) {
            return true;
        }

        match slots.iter_mut().find(|s| s.is_none()) {
            Some(slot) => {
                *slot = Some(InstanceDebug {
                    if_num,
                    if_index,
                    stats: T::default(),
                });
                true
            }
            None => false,
        }
    }

    pub fn release(&self, if_num: u32) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots
            .iter_mut()
            .find(|s| s.as_ref().is_some_and(|e| e.if_num == if_num))
        {
            *slot = None;
        }
    }

    /// Apply `f` to the counters of `if_num`, if it has a slot.
    pub fn update<F>(&self, if_num: u32, f: F) -> bool
    where
        F: FnOnce(&mut T),
    {
        let mut slots = self.slots.lock();
        match slots.iter_mut().flatten().find(|e| e.if_num == if_num) {
            Some(entry) => {
                f(&mut entry.stats);
                true
            }
            None => false,
        }
    }

    /// A copy of every valid entry.
    pub fn get(&self) -> Vec<InstanceDebug<T>> {
        self.slots.lock().iter().flatten().copied().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn conn_directions_are_summed() {
        let mut stats = Ipv6Stats::default();
        let sync = Ipv6ConnSync {
            flow_rx_packet_count: 2,
            return_rx_packet_count: 3,
            flow_tx_byte_count: 100,
            return_tx_byte_count: 50,
            ..Default::default()
        };
        stats.add_conn(&sync);
        stats.add_conn(&sync);
        assert_eq!(stats.accelerated_rx_pkts, 10);
        assert_eq!(stats.accelerated_tx_bytes, 300);
        assert_eq!(stats.accelerated_tx_pkts, 0);
    }

    #[test]
    fn node_stats_accumulate_per_interface() {
        let mut g = GlobalStats::default();
        let sync = NodeStatsSync { rx_packets: 4, tx_bytes: 9, ..Default::default() };
        g.add_node(10, &sync);
        g.add_node(10, &sync);
        assert_eq!(g.node(10).rx_packets, 8);
        assert_eq!(g.node(10).tx_bytes, 18);
        assert_eq!(g.node(11), NodeStats::default());
    }

    #[test]
    fn debug_table_slots() {
        let table: DebugTable<L2tpv2DebugStats, 2> = DebugTable::new();
        let sync = L2tpv2DebugSync { rx_ppp_lcp_pkts: 2, ..Default::default() };
        assert!(!table.update(40, |s| s.add(&sync)));

        assert!(table.claim(40, 7));
        assert!(table.claim(41, 8));
        assert!(table.claim(40, 7));
        assert!(!table.claim(42, 9));

        assert!(table.update(40, |s| s.add(&sync)));
        assert!(table.update(40, |s| s.add(&sync)));
        let entries = table.get();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].if_index, 7);
        assert_eq!(entries[0].stats.rx_ppp_lcp_pkts, 4);

        table.release(40);
        assert!(table.claim(42, 9));
        assert_eq!(table.get().iter().map(|e| e.if_num).collect::<Vec<_>>(), vec![42, 41]);
    }
}
