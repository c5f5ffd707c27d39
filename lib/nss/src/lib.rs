// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The host-side driver for the network subsystem (NSS) accelerator.
//!
//! The driver moves buffers and control messages between the host and
//! the firmware running on one or more accelerator cores, across
//! shared-memory descriptor rings. On top of that transport sit the
//! per-interface message dispatch, request/response correlation, the
//! dynamic interface manager, and the feature subsystems.

#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]
// Enable features needed for USDT, if needed.
#![cfg_attr(all(feature = "usdt", not(usdt_stable_asm)), feature(asm))]
#![cfg_attr(
    all(feature = "usdt", target_os = "macos", not(usdt_stable_asm_sym)),
    feature(asm_sym)
)]

#[macro_use]
extern crate cfg_if;

// This is needed so that the kstat-macro (`#[derive(KStatProvider)]`)
// can use fully-qualified type paths.
extern crate self as nss;

pub mod api;
pub mod cfg;
pub mod ddi;
pub mod engine;
pub mod provider;

pub use engine::Error;

// ================================================================
// DTrace USDT Provider
//
// Allowing us to use USDT to trace the driver's SDT probes when
// running in std/test.
// ================================================================
#[cfg(feature = "usdt")]
#[usdt::provider]
mod nss_provider {
    fn msg__rx(core: u8, iface: u32, ty: u32, resp: u32) {}
    fn msg__drop(core: u8, iface: u32, reason: &str) {}
    fn ring__full(core: u8, qid: u8, full_cnt: u64) {}
    fn sync__timeout(adapter: &str, req_id: u32, timeout_ms: u64) {}
    fn late__response(iface: u32, req_id: u32, resp: u32) {}
}
