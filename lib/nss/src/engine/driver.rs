// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A driver instance: the engine plus every feature subsystem, wired
//! up and ready to talk to the firmware.
use super::Result;
use super::crypto::Crypto;
use super::dynamic_interface::DynamicInterface;
use super::hal::Hal;
use super::ipsec::Ipsec;
use super::ipv6::Ipv6;
use super::l2tpv2::L2tpv2;
use super::map_t::MapT;
use super::top::NssTop;
use super::tunipip6::Tunipip6;
use super::wifi_if::WifiIf;
use crate::cfg::DriverCfg;
use crate::provider::LogLevel;
use crate::provider::Providers;
use std::sync::Arc;

pub struct Driver {
    top: Arc<NssTop>,
    pub dynamic_interface: Arc<DynamicInterface>,
    pub ipsec: Arc<Ipsec>,
    pub ipv6: Arc<Ipv6>,
    pub l2tpv2: Arc<L2tpv2>,
    pub map_t: Arc<MapT>,
    pub tunipip6: Arc<Tunipip6>,
    pub wifi_if: Arc<WifiIf>,
    pub crypto: Arc<Crypto>,
}

impl Driver {
    /// Build an instance, install every subsystem's handlers and mark
    /// the cores live.
    pub fn attach(
        cfg: &DriverCfg,
        hal: Arc<dyn Hal>,
        providers: Providers,
    ) -> Result<Self> {
        let top = NssTop::new(cfg, hal, providers)?;
        let dynamic_interface = DynamicInterface::new(top.clone());
        let drv = Self {
            ipsec: Ipsec::new(top.clone()),
            ipv6: Ipv6::new(top.clone()),
            l2tpv2: L2tpv2::new(top.clone(), dynamic_interface.clone()),
            map_t: MapT::new(top.clone(), dynamic_interface.clone()),
            tunipip6: Tunipip6::new(top.clone()),
            wifi_if: WifiIf::new(top.clone(), dynamic_interface.clone()),
            crypto: Crypto::new(top.clone()),
            dynamic_interface,
            top,
        };

        if let Err(e) = drv.register_handlers() {
            drv.top.shutdown();
            return Err(e);
        }

        drv.top.start();
        drv.top.log(
            LogLevel::Note,
            &format!("nss: attached with {} cores", drv.top.cores().len()),
        );
        Ok(drv)
    }

    fn register_handlers(&self) -> Result<()> {
        self.dynamic_interface.register_handler()?;
        self.ipsec.register_handler()?;
        self.ipv6.register_handler()?;
        self.l2tpv2.register_handler()?;
        self.map_t.register_handler()?;
        self.tunipip6.register_handler()?;
        self.crypto.register_handler()
    }

    pub fn top(&self) -> &Arc<NssTop> {
        &self.top
    }

    /// Stop every core and drop all handlers and registrations. Any
    /// caller still blocked on a reply fails with [`Error::NotReady`].
    pub fn detach(self) {
        self.top.shutdown();
        self.top.log(LogLevel::Note, "nss: detached");
    }
}
