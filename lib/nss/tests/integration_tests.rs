// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Integration tests.
//!
//! Each test attaches a full driver to a simulated firmware thread and
//! drives it only through the public subsystem API, the way a network
//! stack glue layer would.

use nss::api::IPSEC_ENCAP_IF_NUMBER;
use nss::api::ipsec::IpsecMsgType;
use nss::api::ipsec::IpsecNodeStatsSync;
use nss::api::ipv6::Ipv6MsgType;
use nss::api::map_t::MapTInstanceRuleConfig;
use nss::api::map_t::MapTMsgType;
use nss::api::wifi_if::WifiIfMsgType;
use nss::engine::msg::MsgCallback;
use nss::engine::top::DataCallback;
use nss::engine::top::NetdevMsgCallback;
use nss_test_utils as common;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use common::*;

#[cfg(test)]
#[ctor::ctor]
fn register_usdt() {
    usdt::register_probes().unwrap();
}

fn harness() -> Harness {
    Harness::new(&DriverCfg::default()).unwrap()
}

/// Poll `f` until it holds or a generous deadline passes.
fn eventually<F: Fn() -> bool>(f: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    f()
}

#[test]
fn alloc_and_dealloc_dynamic_node() {
    let h = harness();
    let di = &h.drv.dynamic_interface;
    h.fw.skip_allocs(5);

    let if_num = di.alloc_node(DynamicIfType::Wifi).unwrap();
    assert_eq!(if_num, DYNAMIC_IF_START + 5);
    assert_eq!(di.get_type(if_num), DynamicIfType::Wifi);
    assert_eq!(di.allocated(), vec![(if_num, DynamicIfType::Wifi)]);

    // The request went out on the core wifi nodes live on.
    let sent = h.fw.received();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].interface(), DYNAMIC_INTERFACE);
    assert_ne!(sent[0].cm.cb, 0);

    assert_eq!(
        di.dealloc_node(if_num, DynamicIfType::L2tpv2),
        Err(Error::BadParam("interface not allocated to type"))
    );
    di.dealloc_node(if_num, DynamicIfType::Wifi).unwrap();
    assert_eq!(di.get_type(if_num), DynamicIfType::None);
    assert!(di.allocated().is_empty());
}

#[test]
fn nacked_alloc_reports_firmware_error() {
    let h = harness();
    h.fw.set_responder(|_| Some(Reply::Nack(9)));
    assert_eq!(
        h.drv.dynamic_interface.alloc_node(DynamicIfType::MapT),
        Err(Error::Nack { response: Response::EMsg, error: 9 })
    );
    assert!(h.drv.dynamic_interface.allocated().is_empty());
}

#[test]
fn concurrent_allocations_are_serialized() {
    let h = harness();
    let di = h.drv.dynamic_interface.clone();

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let di = di.clone();
            std::thread::spawn(move || di.alloc_node(DynamicIfType::L2tpv2))
        })
        .collect();
    let mut got: Vec<u32> =
        threads.into_iter().map(|t| t.join().unwrap().unwrap()).collect();
    got.sort();

    let want: Vec<u32> = (0..4).map(|i| DYNAMIC_IF_START + i).collect();
    assert_eq!(got, want);
    assert!(h.top().pending().is_empty());
}

#[test]
fn timed_out_request_gets_late_reply() {
    let cfg = DriverCfg { timeouts: Timeouts::uniform(100), ..Default::default() };
    let h = Harness::new(&cfg).unwrap();
    h.fw.set_responder(|msg| {
        (msg.interface() == DYNAMIC_INTERFACE).then(|| {
            let mut body: DynamicIfNodeMsg = msg.read();
            body.if_num = DYNAMIC_IF_START as i32;
            Reply::Delayed(
                Duration::from_millis(400),
                Box::new(Reply::AckWith(zerocopy::IntoBytes::as_bytes(&body).to_vec())),
            )
        })
    });

    let di = &h.drv.dynamic_interface;
    assert_eq!(di.alloc_node(DynamicIfType::MapT), Err(Error::Timeout(100)));
    assert_eq!(h.top().stats().vals.sync_timeouts.val(), 1);
    assert!(h.top().pending().is_empty());

    assert!(eventually(|| h.top().stats().vals.rx_late.val() == 1));
    assert_eq!(h.log.count_matching(LogLevel::Warn, "late response"), 1);
    // The node the firmware handed out is known but owned by no one.
    assert_eq!(di.orphans(), 1);

    // The adapter is free again and the next request is answered.
    h.fw.clear_responder();
    h.fw.skip_allocs(1);
    assert_eq!(di.alloc_node(DynamicIfType::MapT), Ok(DYNAMIC_IF_START + 1));
    assert_eq!(di.allocated().len(), 2);
    assert_eq!(h.top().stats().vals.sync_timeouts.val(), 1);
    assert_eq!(h.top().stats().vals.rx_late.val(), 1);
}

#[test]
fn shutdown_wakes_blocked_request() {
    let h = harness();
    h.fw.set_responder(|_| Some(Reply::Drop));
    let di = h.drv.dynamic_interface.clone();

    let started = Instant::now();
    let th = std::thread::spawn(move || di.alloc_node(DynamicIfType::Wifi));
    assert!(eventually(|| !h.top().pending().is_empty()));
    h.top().shutdown();

    assert_eq!(th.join().unwrap(), Err(Error::NotReady));
    assert!(started.elapsed() < h.top().timeouts().dynamic_interface());
    assert_eq!(h.top().stats().vals.sync_timeouts.val(), 0);
    assert!(h.drv.dynamic_interface.allocated().is_empty());
}

#[test]
fn wifi_create_rolls_back_on_nack() {
    let h = harness();
    h.fw.set_responder(|msg| {
        (msg.interface() != DYNAMIC_INTERFACE
            && msg.msg_type() == WifiIfMsgType::TxCreate as u32)
            .then_some(Reply::Nack(3))
    });

    let wifi = &h.drv.wifi_if;
    let res = wifi.create(FakeNetdev::new("wlan0", 4));
    assert_eq!(res.err(), Some(Error::Nack { response: Response::EMsg, error: 3 }));

    // Allocated, told to create, refused, then freed again.
    let types: Vec<(u32, u32)> =
        h.fw.received().iter().map(|m| (m.interface(), m.msg_type())).collect();
    assert_eq!(
        types,
        vec![
            (DYNAMIC_INTERFACE, DynamicIfMsgType::AllocNode as u32),
            (DYNAMIC_IF_START, WifiIfMsgType::TxCreate as u32),
            (DYNAMIC_INTERFACE, DynamicIfMsgType::DeallocNode as u32),
        ]
    );
    assert!(h.drv.dynamic_interface.allocated().is_empty());
    assert!(!h.top().handlers().is_registered(DYNAMIC_IF_START));
    assert!(wifi.handle(DYNAMIC_IF_START).is_none());
}

#[test]
fn wifi_interface_lifecycle() {
    let h = harness();
    let wifi = &h.drv.wifi_if;
    let ndev = FakeNetdev::new("wlan1", 6);
    let handle = wifi.create(ndev.clone()).unwrap();
    let if_num = handle.if_num();
    assert_eq!(handle.core(), h.top().routing().wlan);
    assert!(h.top().dp(if_num).ndev.is_some());

    let create = &h.fw.received()[1];
    let body: nss::api::wifi_if::WifiIfCreate = create.read();
    assert_eq!(body.mac_addr, ndev.mac);

    let rx = Arc::new(AtomicUsize::new(0));
    let r = rx.clone();
    let rx_cb: DataCallback = Arc::new(move |dev, nbuf| {
        assert_eq!(dev.map(|d| d.ifindex()), Some(6));
        r.fetch_add(nbuf.len(), Ordering::Relaxed);
    });
    wifi.register(&handle, rx_cb, ndev).unwrap();

    wifi.tx_buf(&handle, Nbuf::from_vec(vec![0x55; 60])).unwrap();
    assert!(eventually(|| h.fw.packets().len() == 1));
    let pkt = &h.fw.packets()[0];
    assert_eq!(pkt.desc.interface_num, if_num);
    assert!(pkt.desc.flags().contains(DescFlags::VIRTUAL_BUFFER));

    h.fw.send_packet(handle.core(), if_num, &[0u8; 42]);
    assert_eq!(rx.load(Ordering::Relaxed), 42);

    wifi.destroy(&handle).unwrap();
    assert!(h.drv.dynamic_interface.allocated().is_empty());
    assert!(h.top().dp(if_num).ndev.is_none());
    assert_eq!(
        wifi.destroy(&handle),
        Err(Error::BadParam("wifi interface has no netdev"))
    );
}

#[test]
fn map_t_sync_forwards_reply() {
    let h = harness();
    let map_t = &h.drv.map_t;
    let if_num = h.drv.dynamic_interface.alloc_node(DynamicIfType::MapT).unwrap();
    let data_cb: DataCallback = Arc::new(|_, _| {});
    let event_cb: NetdevMsgCallback = Arc::new(|_, _| {});
    map_t
        .register_if(if_num, data_cb, event_cb, FakeNetdev::new("mapt0", 2), 0)
        .unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let s = seen.clone();
    let cb: MsgCallback = Arc::new(move |_, reply| {
        assert!(reply.is_ack());
        s.fetch_add(1, Ordering::Relaxed);
    });
    let msg = nss::engine::Msg::new(
        if_num,
        MapTMsgType::InstanceRuleConfig as u32,
        &MapTInstanceRuleConfig::default(),
    )
    .with_callback(cb, None);
    map_t.tx_sync(msg).unwrap();
    assert_eq!(seen.load(Ordering::Relaxed), 1);

    h.fw.set_responder(|_| Some(Reply::Drop));
    let msg = nss::engine::Msg::new(
        if_num,
        MapTMsgType::InstanceRuleDeconfig as u32,
        &MapTInstanceRuleConfig::default(),
    );
    let timeout = h.top().timeouts().map_t().as_millis() as u64;
    let started = Instant::now();
    assert_eq!(map_t.tx_sync(msg), Err(Error::Timeout(timeout)));
    assert!(started.elapsed() >= Duration::from_millis(timeout));
}

#[test]
fn ipv6_conn_count_restored_on_refusal() {
    let h = harness();
    let ipv6 = &h.drv.ipv6;
    let before = h.top().conn_counts();

    h.fw.set_responder(|msg| {
        (msg.msg_type() == Ipv6MsgType::ConnCfgRule as u32)
            .then_some(Reply::Nack(1))
    });
    assert!(matches!(ipv6.set_conn_count(2048), Err(Error::Nack { .. })));
    assert_eq!(h.top().conn_counts(), before);
    assert_eq!(h.log.count_matching(LogLevel::Warn, "not applied"), 1);

    h.fw.set_responder(|_| None);
    ipv6.set_conn_count(2048).unwrap();
    assert_eq!(ipv6.max_conn_count(), 2048);

    // A count that cannot be configured never reaches the firmware.
    let sent = h.fw.received().len();
    assert!(matches!(ipv6.set_conn_count(1000), Err(Error::BadParam(_))));
    assert_eq!(h.fw.received().len(), sent);
}

#[test]
fn ipsec_notifications_reach_their_direction() {
    let h = harness();
    let ipsec = &h.drv.ipsec;
    let hits = Arc::new(AtomicUsize::new(0));
    let hc = hits.clone();
    let cb: MsgCallback = Arc::new(move |_, msg| {
        let stats: IpsecNodeStatsSync = msg.read();
        hc.fetch_add(stats.completed as usize, Ordering::Relaxed);
    });
    ipsec.notify_register(IPSEC_ENCAP_IF_NUMBER, cb, None).unwrap();

    let body = IpsecNodeStatsSync { completed: 4, ..Default::default() };
    let msg = nss::engine::Msg::new(
        IPSEC_ENCAP_IF_NUMBER,
        IpsecMsgType::SyncNodeStats as u32,
        &body,
    );
    h.fw.notify(h.top().routing().ipsec, msg);
    assert_eq!(hits.load(Ordering::Relaxed), 4);
}

#[test]
fn unsolicited_message_without_handler_is_counted() {
    let h = harness();
    let msg = nss::engine::Msg::header_only(DYNAMIC_IF_START + 40, 0);
    h.fw.notify(CoreId::Core0, msg);
    assert_eq!(h.top().stats().vals.rx_invalid.val(), 1);
    assert_eq!(h.log.count_matching(LogLevel::Warn, "no handler"), 1);
}

#[test]
fn detach_stops_the_cores() {
    let h = harness();
    let top = h.top().clone();
    let Harness { drv, fw, .. } = h;
    drop(fw);
    drv.detach();
    assert!(top.cores().iter().all(|c| !c.is_ready()));
    assert_eq!(
        nss::engine::dynamic_interface::DynamicInterface::new(top)
            .alloc_node(DynamicIfType::Wifi),
        Err(Error::NotReady)
    );
}

#[test]
fn tunnel_stats_show_up_in_global_stats() {
    use nss::api::NodeStatsSync;
    use nss::api::TUNIPIP6_INTERFACE;
    use nss::api::tunipip6::Tunipip6MsgType;
    use nss::api::tunipip6::Tunipip6StatsSync;

    let h = harness();
    let body = Tunipip6StatsSync {
        node_stats: NodeStatsSync { rx_packets: 3, tx_bytes: 900, ..Default::default() },
    };
    let msg = nss::engine::Msg::new(
        TUNIPIP6_INTERFACE,
        Tunipip6MsgType::RxStatsSync as u32,
        &body,
    );
    h.fw.notify(h.top().routing().tunipip6, msg.clone());
    h.fw.notify(h.top().routing().tunipip6, msg);

    let json = serde_json::to_value(h.top().global_stats()).unwrap();
    let node = &json["node"][TUNIPIP6_INTERFACE.to_string()];
    assert_eq!(node["rx_packets"], 6);
    assert_eq!(node["tx_bytes"], 1800);
}

#[test]
fn driver_logs_through_slog() -> anyhow::Result<()> {
    let hal = Arc::new(SimHal::new());
    let drv = Driver::attach(
        &DriverCfg::default(),
        hal.clone(),
        Providers { log: Box::new(SlogLog::new(test_logger())) },
    )?;
    let fw = SimFirmware::start(drv.top().clone(), hal);

    let if_num = drv.dynamic_interface.alloc_node(DynamicIfType::L2tpv2)?;
    drv.dynamic_interface.dealloc_node(if_num, DynamicIfType::L2tpv2)?;
    drop(fw);
    drv.detach();
    Ok(())
}
