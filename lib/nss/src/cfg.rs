// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Driver configuration.
//!
//! Everything the platform glue decides before attach: how many cores
//! are present, ring geometry, which core each feature runs on, and
//! the deadlines of the blocking control-plane calls.

use crate::api::CoreId;
use crate::api::DynamicIfType;
use crate::api::NBUF_PAYLOAD_SIZE;
use crate::api::NSS_MAX_CORES;
use crate::api::CMN_MSG_LEN;
use crate::api::ipv6::DEFAULT_NUM_CONN;
use crate::engine::Error;
use crate::engine::ipv6::validate_conn_counts;
use crate::engine::ring::MAX_RING_SIZE;
use core::time::Duration;
use serde::Deserialize;
use serde::Serialize;

type Result<T> = core::result::Result<T, Error>;

/// The overall configuration of a driver instance.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverCfg {
    /// Number of accelerator cores to attach.
    pub num_cores: u8,

    /// Entries per host-to-NSS ring. Must be a power of two.
    pub h2n_ring_size: u32,

    /// Entries per NSS-to-host ring. Must be a power of two.
    pub n2h_ring_size: u32,

    /// The largest buffer `send_buffer()` accepts.
    pub max_buf_size: usize,

    /// Default work budget of a single interrupt service pass.
    pub rx_budget: usize,

    /// Whether wifi redirect transmit is enabled.
    pub wifi_redirect: bool,

    pub routing: CoreRouting,
    pub timeouts: Timeouts,
    pub conn: ConnCfg,
}

impl Default for DriverCfg {
    fn default() -> Self {
        Self {
            num_cores: 2,
            h2n_ring_size: 128,
            n2h_ring_size: 128,
            max_buf_size: NBUF_PAYLOAD_SIZE,
            rx_budget: 64,
            wifi_redirect: true,
            routing: CoreRouting::default(),
            timeouts: Timeouts::default(),
            conn: ConnCfg::default(),
        }
    }
}

/// Which core handles which feature.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreRouting {
    pub ipsec: CoreId,
    pub ipv6: CoreId,
    pub wlan: CoreId,
    pub tunipip6: CoreId,
    pub l2tpv2: CoreId,
    pub map_t: CoreId,
    pub crypto: CoreId,

    /// Core that dynamic interfaces of each type are allocated on.
    pub dynamic_interface: DynamicRouting,
}

/// The per-type table consulted by dynamic interface allocation.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DynamicRouting {
    pub wifi: CoreId,
    pub l2tpv2: CoreId,
    pub map_t: CoreId,
    pub tunipip6: CoreId,
}

impl Default for DynamicRouting {
    fn default() -> Self {
        Self {
            wifi: CoreId::Core1,
            l2tpv2: CoreId::Core0,
            map_t: CoreId::Core0,
            tunipip6: CoreId::Core0,
        }
    }
}

impl Default for CoreRouting {
    fn default() -> Self {
        Self {
            ipsec: CoreId::Core0,
            ipv6: CoreId::Core0,
            wlan: CoreId::Core1,
            tunipip6: CoreId::Core0,
            l2tpv2: CoreId::Core0,
            map_t: CoreId::Core0,
            crypto: CoreId::Core0,
            dynamic_interface: DynamicRouting::default(),
        }
    }
}

impl CoreRouting {
    /// The core a dynamic interface of type `ty` is allocated on.
    /// [`DynamicIfType::None`] has no home and goes to core 0.
    pub fn dynamic_core(&self, ty: DynamicIfType) -> CoreId {
        let d = &self.dynamic_interface;
        match ty {
            DynamicIfType::None => CoreId::Core0,
            DynamicIfType::Wifi => d.wifi,
            DynamicIfType::L2tpv2 => d.l2tpv2,
            DynamicIfType::MapT => d.map_t,
            DynamicIfType::Tunipip6 => d.tunipip6,
        }
    }

    /// Route every feature to core 0.
    pub fn single_core() -> Self {
        Self {
            wlan: CoreId::Core0,
            dynamic_interface: DynamicRouting {
                wifi: CoreId::Core0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn all(&self) -> impl Iterator<Item = CoreId> + '_ {
        [
            self.ipsec,
            self.ipv6,
            self.wlan,
            self.tunipip6,
            self.l2tpv2,
            self.map_t,
            self.crypto,
        ]
        .into_iter()
        .chain(DynamicIfType::ALL.into_iter().map(|t| self.dynamic_core(t)))
    }
}

/// Deadlines of the blocking control-plane calls, in milliseconds.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    pub dynamic_interface_ms: u64,
    pub wifi_if_ms: u64,
    pub map_t_ms: u64,
    pub conn_cfg_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            dynamic_interface_ms: 60_000,
            wifi_if_ms: 3_000,
            map_t_ms: 3_000,
            conn_cfg_ms: 6_000,
        }
    }
}

impl Timeouts {
    pub fn dynamic_interface(&self) -> Duration {
        Duration::from_millis(self.dynamic_interface_ms)
    }

    pub fn wifi_if(&self) -> Duration {
        Duration::from_millis(self.wifi_if_ms)
    }

    pub fn map_t(&self) -> Duration {
        Duration::from_millis(self.map_t_ms)
    }

    pub fn conn_cfg(&self) -> Duration {
        Duration::from_millis(self.conn_cfg_ms)
    }

    /// Every deadline set to `ms`. Handy for tests that exercise
    /// timeouts.
    pub fn uniform(ms: u64) -> Self {
        Self {
            dynamic_interface_ms: ms,
            wifi_if_ms: ms,
            map_t_ms: ms,
            conn_cfg_ms: ms,
        }
    }
}

/// Initial connection table sizes.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnCfg {
    pub ipv4_num_conn: u32,
    pub ipv6_num_conn: u32,
}

impl Default for ConnCfg {
    fn default() -> Self {
        Self { ipv4_num_conn: DEFAULT_NUM_CONN, ipv6_num_conn: DEFAULT_NUM_CONN }
    }
}

impl DriverCfg {
    /// Parse and validate a TOML document.
    pub fn from_toml(s: &str) -> Result<Self> {
        let cfg: Self =
            toml::from_str(s).map_err(|e| Error::Cfg(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check the configuration is one the driver can attach with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cfg`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.num_cores == 0 || usize::from(self.num_cores) > NSS_MAX_CORES {
            return Err(Error::Cfg(format!(
                "num_cores must be 1..={NSS_MAX_CORES}, got {}",
                self.num_cores
            )));
        }

        for (name, size) in [
            ("h2n_ring_size", self.h2n_ring_size),
            ("n2h_ring_size", self.n2h_ring_size),
        ] {
            if size < 2 || size > MAX_RING_SIZE || !size.is_power_of_two() {
                return Err(Error::Cfg(format!(
                    "{name} must be a power of two in 2..={MAX_RING_SIZE}, \
                     got {size}"
                )));
            }
        }

        if self.max_buf_size <= CMN_MSG_LEN
            || self.max_buf_size > usize::from(u16::MAX)
        {
            return Err(Error::Cfg(format!(
                "max_buf_size out of range: {}",
                self.max_buf_size
            )));
        }

        if self.rx_budget == 0 {
            return Err(Error::Cfg("rx_budget must be non-zero".to_string()));
        }

        if let Some(core) =
            self.routing.all().find(|c| c.index() >= usize::from(self.num_cores))
        {
            return Err(Error::Cfg(format!(
                "routing names {core} but only {} core(s) attached",
                self.num_cores
            )));
        }

        validate_conn_counts(self.conn.ipv4_num_conn, self.conn.ipv6_num_conn)
            .map_err(|e| Error::Cfg(e.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_is_valid() {
        DriverCfg::default().validate().unwrap();
    }

    #[test]
    fn parse_toml() {
        let cfg = DriverCfg::from_toml(
            r#"
            num_cores = 1
            h2n_ring_size = 64
            wifi_redirect = false

            [routing]
            wlan = "core0"

            [routing.dynamic_interface]
            wifi = "core0"

            [timeouts]
            wifi_if_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(cfg.num_cores, 1);
        assert_eq!(cfg.h2n_ring_size, 64);
        assert_eq!(cfg.n2h_ring_size, 128);
        assert!(!cfg.wifi_redirect);
        assert_eq!(cfg.routing.dynamic_core(DynamicIfType::Wifi), CoreId::Core0);
        assert_eq!(cfg.timeouts.wifi_if(), Duration::from_millis(500));
        assert_eq!(cfg.timeouts.dynamic_interface_ms, 60_000);
    }

    #[test]
    fn routing_must_name_attached_core() {
        let cfg = DriverCfg { num_cores: 1, ..Default::default() };
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, Error::Cfg(_)));

        let cfg = DriverCfg {
            num_cores: 1,
            routing: CoreRouting::single_core(),
            ..Default::default()
        };
        cfg.validate().unwrap();
    }

    #[test]
    fn ring_sizes_are_powers_of_two() {
        let cfg = DriverCfg { h2n_ring_size: 100, ..Default::default() };
        assert!(cfg.validate().is_err());
        let cfg = DriverCfg { n2h_ring_size: 8192, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(DriverCfg::from_toml("bogus = 1").is_err());
    }
}
