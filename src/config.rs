use anyhow::{Context, Result, ensure};
use std::{env, net::Ipv4Addr, path::PathBuf, str::FromStr, time::Duration};

/// Application configuration loaded and validated at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// HTTP configuration API
    pub api: ApiConfig,

    /// Reconcile loop timing and liveness check
    pub reconcile: ReconcileConfig,

    /// Wired and wireless interface names
    pub interfaces: InterfaceConfig,

    /// Self-hosted access point and its DHCP pool
    pub access_point: AccessPointConfig,

    /// Supervised daemon binaries and their config
    pub daemons: DaemonConfig,

    /// Static ip stanza locations
    pub static_config: StaticConfigPaths,
}

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct ReconcileConfig {
    pub alive_url: String,
    pub interval: Duration,
}

#[derive(Clone, Debug)]
pub struct InterfaceConfig {
    pub ethernet: String,
    pub wireless: String,
}

#[derive(Clone, Debug)]
pub struct AccessPointConfig {
    pub ip: Ipv4Addr,
    pub ssid: String,
    pub psk: String,
    pub dhcp_start: Ipv4Addr,
    pub dhcp_end: Ipv4Addr,
}

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub wpa_supplicant_bin: PathBuf,
    pub wpa_supplicant_config: PathBuf,
    pub dnsmasq_bin: PathBuf,
}

#[derive(Clone, Debug)]
pub struct StaticConfigPaths {
    /// Where the wired static stanza is composed
    pub primary: PathBuf,
    /// Directory systemd-networkd reads from
    pub systemd_network_dir: PathBuf,
}

impl AppConfig {
    /// Load and validate all configuration from environment variables
    pub fn load() -> Result<Self> {
        Ok(Self {
            api: ApiConfig::load()?,
            reconcile: ReconcileConfig::load()?,
            interfaces: InterfaceConfig::load(),
            access_point: AccessPointConfig::load()?,
            daemons: DaemonConfig::load(),
            static_config: StaticConfigPaths::load(),
        })
    }
}

impl ApiConfig {
    fn load() -> Result<Self> {
        let port = parse_var("LISTEN_PORT", "8080")?;

        Ok(Self { port })
    }
}

impl ReconcileConfig {
    fn load() -> Result<Self> {
        let alive_url = env::var("ALIVE_URL").unwrap_or_default();
        ensure!(!alive_url.is_empty(), "missing config ALIVE_URL");

        let secs: u64 = parse_var("CHECK_INTERVAL_SECS", "30")?;
        ensure!(secs > 0, "CHECK_INTERVAL_SECS must be greater than zero");

        Ok(Self {
            alive_url,
            interval: Duration::from_secs(secs),
        })
    }
}

impl InterfaceConfig {
    fn load() -> Self {
        Self {
            ethernet: var_or("ETHERNET_INTERFACE", "end0"),
            wireless: var_or("WIRELESS_INTERFACE", "wlan0"),
        }
    }
}

impl AccessPointConfig {
    fn load() -> Result<Self> {
        let ssid = env::var("AP_SSID").unwrap_or_default();
        ensure!(!ssid.is_empty(), "missing config AP_SSID");

        let psk = env::var("AP_PSK").unwrap_or_default();
        ensure!(!psk.is_empty(), "missing config AP_PSK");

        Ok(Self {
            ip: parse_var("AP_IP", "192.168.27.1")?,
            ssid,
            psk,
            dhcp_start: parse_var("DHCP_START", "192.168.27.100")?,
            dhcp_end: parse_var("DHCP_END", "192.168.27.150")?,
        })
    }
}

impl DaemonConfig {
    fn load() -> Self {
        Self {
            wpa_supplicant_bin: var_or("WPA_SUPPLICANT_BIN", "wpa_supplicant").into(),
            wpa_supplicant_config: var_or("WPA_SUPPLICANT_CONFIG", "/etc/wpa_supplicant.conf")
                .into(),
            dnsmasq_bin: var_or("DNSMASQ_BIN", "dnsmasq").into(),
        }
    }
}

impl StaticConfigPaths {
    fn load() -> Self {
        Self {
            primary: var_or(
                "WIRED_STATIC_CONFIG_LOCATION",
                "/etc/systemd/network/20-wired-static.network",
            )
            .into(),
            systemd_network_dir: var_or("SYSTEMD_NETWORK_DIR", "/etc/systemd/network").into(),
        }
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var_or(key, default)
        .parse::<T>()
        .with_context(|| format!("failed to parse {key}: invalid format"))
}
