//! Periodic reconciliation of the network posture
//!
//! Every tick samples liveness and routing, decides the posture in strict
//! priority order (wired, wifi client, own access point) and converges the
//! supervised daemons and interface addressing to match. A failing tick is
//! logged and retried on the next one, the loop only ends on cancellation.

use crate::{
    command::{CommandRunner, args},
    config::AppConfig,
    services::{
        interface::{InterfaceProbe, LocalInterface},
        liveness::LivenessCheck,
        static_config::StaticConfigService,
        supervisor::{DaemonSupervisor, DhcpPool},
        wifi::{WifiControl, WifiStatus},
    },
};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::{fmt, net::IpAddr, sync::Arc, time::Duration};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Posture the device ended up in after a tick
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkPosture {
    /// Wired uplink with working internet, no wifi needed
    EthernetActive,
    /// Joined an upstream wifi network as client
    WifiStationActive,
    /// Hosting the fallback access point with dhcp
    AccessPointActive,
    /// Station daemon still negotiating, re-evaluated next tick
    Idle,
}

impl NetworkPosture {
    /// Wifi side of the decision table, a client link wins over the access point
    pub fn from_wifi_status(status: &WifiStatus) -> Self {
        if status.is_station_connected() {
            NetworkPosture::WifiStationActive
        } else if status.is_access_point() {
            NetworkPosture::AccessPointActive
        } else {
            NetworkPosture::Idle
        }
    }
}

impl fmt::Display for NetworkPosture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkPosture::EthernetActive => write!(f, "ethernet"),
            NetworkPosture::WifiStationActive => write!(f, "wifi station"),
            NetworkPosture::AccessPointActive => write!(f, "access point"),
            NetworkPosture::Idle => write!(f, "settling"),
        }
    }
}

/// Wired side of the decision table
pub fn wired_uplink_ready(outbound: Option<&LocalInterface>, alive: bool, ethernet: &str) -> bool {
    alive && outbound.is_some_and(|iface| iface.name == ethernet)
}

#[derive(Clone, Debug)]
pub struct ReconcileSettings {
    pub ethernet_interface: String,
    pub wireless_interface: String,
    pub pool: DhcpPool,
}

impl From<&AppConfig> for ReconcileSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            ethernet_interface: config.interfaces.ethernet.clone(),
            wireless_interface: config.interfaces.wireless.clone(),
            pool: DhcpPool {
                ap_ip: config.access_point.ip,
                start: config.access_point.dhcp_start,
                end: config.access_point.dhcp_end,
            },
        }
    }
}

pub struct Reconciler<L, P, S, W, R> {
    liveness: L,
    interfaces: P,
    supervisor: Arc<S>,
    wifi: Arc<W>,
    static_config: Arc<StaticConfigService<R>>,
    runner: Arc<R>,
    settings: ReconcileSettings,
}

impl<L, P, S, W, R> Reconciler<L, P, S, W, R>
where
    L: LivenessCheck,
    P: InterfaceProbe,
    S: DaemonSupervisor,
    W: WifiControl,
    R: CommandRunner,
{
    pub fn new(
        liveness: L,
        interfaces: P,
        supervisor: Arc<S>,
        wifi: Arc<W>,
        static_config: Arc<StaticConfigService<R>>,
        runner: Arc<R>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            liveness,
            interfaces,
            supervisor,
            wifi,
            static_config,
            runner,
            settings,
        }
    }

    /// Reconcile once immediately and then every `interval` until `shutdown`
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        info!("starting check loop every {interval:?}");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = self.reconcile() => match result {
                    Ok(posture) => debug!("network posture: {posture}"),
                    Err(e) => error!("reconcile failed: {e:#}"),
                }
            }
        }

        info!("check loop stopped");
    }

    /// One tick of the decision table
    pub async fn reconcile(&self) -> Result<NetworkPosture> {
        let alive = match self.liveness.is_alive().await {
            Ok(alive) => alive,
            Err(e) => {
                debug!("liveness check failed: {e:#}");
                false
            }
        };

        if let Err(e) = self.static_config.sync_static_config_if_needed().await {
            warn!("failed to sync static ip config: {e:#}");
        }

        let outbound = self
            .interfaces
            .outbound_interface()
            .context("failed to determine outbound interface")?;

        if wired_uplink_ready(outbound.as_ref(), alive, &self.settings.ethernet_interface) {
            self.supervisor.stop_dhcp_dns_daemon()?;
            self.supervisor.stop_station_daemon()?;
            return Ok(NetworkPosture::EthernetActive);
        }

        self.supervisor
            .start_station_daemon()
            .context("failed to ensure station daemon")?;

        let status = self.wifi.status().await?;
        let posture = NetworkPosture::from_wifi_status(&status);

        match posture {
            NetworkPosture::WifiStationActive => self.converge_station(&status).await?,
            NetworkPosture::AccessPointActive => self.converge_access_point().await?,
            _ => debug!(
                "{} not settled yet: {}",
                self.settings.wireless_interface, status.wpa_state
            ),
        }

        Ok(posture)
    }

    async fn converge_station(&self, status: &WifiStatus) -> Result<()> {
        debug!("connected to {}", status.connected_ssid());

        self.supervisor.stop_dhcp_dns_daemon()?;

        // still carrying the access point address, ask networkd for a client lease
        let ap_ip = IpAddr::V4(self.settings.pool.ap_ip);
        let Some(interface) = self.interface_for(ap_ip) else {
            return Ok(());
        };

        info!("{ap_ip} still assigned to {interface}, reconfiguring");

        self.runner
            .run("networkctl", &args(["reconfigure", interface.as_str()]))
            .await
            .with_context(|| format!("failed to reconfigure {interface}"))?;

        Ok(())
    }

    async fn converge_access_point(&self) -> Result<()> {
        self.supervisor
            .start_dhcp_dns_daemon(&self.settings.pool)
            .context("failed to ensure dhcp/dns daemon")?;

        let wireless = &self.settings.wireless_interface;
        let ap_ip = self.settings.pool.ap_ip.to_string();

        self.runner
            .run("ifconfig", &args([wireless.as_str(), ap_ip.as_str()]))
            .await
            .with_context(|| format!("failed to assign {ap_ip} to {wireless}"))?;

        Ok(())
    }

    fn interface_for(&self, ip: IpAddr) -> Option<String> {
        match self.interfaces.interface_for_ip(ip) {
            Ok(interface) => interface,
            Err(e) => {
                debug!("failed to look up interface of {ip}: {e:#}");
                None
            }
        }
    }
}
