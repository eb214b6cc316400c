//! Wifi status, scanning and network provisioning through `wpa_cli`
//!
//! The control tool answers in free text. Parsing is done by the pure
//! functions [`WifiStatus::parse`], [`parse_scan_results`] and
//! [`parse_network_list`] so the service itself only sequences commands.

use crate::command::CommandRunner;
use anyhow::{Context, Result, bail, ensure};
use log::{debug, info};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use serde::Serialize;
use std::{
    fs::OpenOptions,
    io::{ErrorKind, Write},
    os::unix::fs::OpenOptionsExt,
    path::Path,
    sync::Arc,
    time::Duration,
};
use trait_variant::make;

const WPA_CLI: &str = "wpa_cli";
const SCAN_SETTLE_DELAY: Duration = Duration::from_secs(1);
const PROVISIONED_PRIORITY: &str = "10";

const ACCESS_POINT_MARKERS: [&str; 3] = ["ssid=", "mode=AP", "wpa_state=COMPLETED"];
const STATION_MARKERS: [&str; 3] = ["ssid=", "wpa_state=COMPLETED", "mode=station"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum WifiMode {
    Station,
    AccessPoint,
    Unknown,
}

/// One parsed answer of `wpa_cli status`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WifiStatus {
    pub mode: WifiMode,
    pub wpa_state: String,
    pub ssid: Option<String>,
}

impl WifiStatus {
    pub fn parse(text: &str) -> Self {
        let matches_all = |markers: &[&str]| markers.iter().all(|m| text.contains(m));

        let mode = if matches_all(&ACCESS_POINT_MARKERS) {
            WifiMode::AccessPoint
        } else if matches_all(&STATION_MARKERS) {
            WifiMode::Station
        } else {
            WifiMode::Unknown
        };

        let value_of = |key: &str| {
            text.lines()
                .find_map(|line| line.strip_prefix(key))
                .map(str::to_string)
        };

        Self {
            mode,
            wpa_state: value_of("wpa_state=").unwrap_or_default(),
            ssid: value_of("ssid="),
        }
    }

    pub fn is_access_point(&self) -> bool {
        self.mode == WifiMode::AccessPoint
    }

    pub fn is_station_connected(&self) -> bool {
        self.mode == WifiMode::Station
    }

    /// SSID of the network joined as a client, empty otherwise
    pub fn connected_ssid(&self) -> String {
        if self.is_station_connected() {
            self.ssid.clone().unwrap_or_default()
        } else {
            String::new()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannedNetwork {
    pub bssid: String,
    pub frequency: String,
    pub signal_level: String,
    pub flags: String,
    pub ssid: String,
}

/// Parse the `scan_results` table
///
/// The header line, peer-to-peer entries and rows with less than five fields
/// are skipped. The ssid is the remainder of the row and may contain spaces.
pub fn parse_scan_results(text: &str) -> Vec<ScannedNetwork> {
    text.lines()
        .skip(1)
        .filter(|row| !row.contains("[P2P]"))
        .filter_map(|row| {
            let fields: Vec<&str> = row.split_whitespace().collect();
            if fields.len() < 5 {
                return None;
            }

            Some(ScannedNetwork {
                bssid: fields[0].to_string(),
                frequency: fields[1].to_string(),
                signal_level: fields[2].to_string(),
                flags: fields[3].to_string(),
                ssid: fields[4..].join(" "),
            })
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkProfile {
    pub id: String,
    pub ssid: String,
    pub current: bool,
}

/// Parse the `list_networks` table, skipping its header
pub fn parse_network_list(text: &str) -> Vec<NetworkProfile> {
    text.lines()
        .skip(1)
        .filter_map(|row| {
            let fields: Vec<&str> = row.split_whitespace().collect();
            if fields.len() < 2 {
                return None;
            }

            Some(NetworkProfile {
                id: fields[0].to_string(),
                ssid: fields[1].to_string(),
                current: fields.get(3).is_some_and(|flags| flags.contains("CURRENT")),
            })
        })
        .collect()
}

#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait WifiControl: Send + Sync {
    /// Query and parse the current association state
    async fn status(&self) -> Result<WifiStatus>;

    /// Trigger a scan and return the visible networks
    async fn scan_networks(&self) -> Result<Vec<ScannedNetwork>>;

    /// Configure, enable and persist the user network profile
    async fn provision_network(&self, ssid: &str, psk: &str) -> Result<()>;
}

/// [`WifiControl`] backed by `wpa_cli -i <interface>`
pub struct WpaCli<R> {
    runner: Arc<R>,
    interface: String,
    scan_settle_delay: Duration,
}

impl<R: CommandRunner> WpaCli<R> {
    pub fn new(runner: Arc<R>, interface: impl Into<String>) -> Self {
        Self {
            runner,
            interface: interface.into(),
            scan_settle_delay: SCAN_SETTLE_DELAY,
        }
    }

    #[cfg(test)]
    fn with_scan_settle_delay(mut self, delay: Duration) -> Self {
        self.scan_settle_delay = delay;
        self
    }

    async fn cli(&self, command: &[&str]) -> Result<String> {
        let mut args = vec!["-i".to_string(), self.interface.clone()];
        args.extend(command.iter().map(|arg| arg.to_string()));

        self.runner.run(WPA_CLI, &args).await
    }

    /// Run a command that acknowledges with `OK` and fails with `FAIL`
    async fn cli_ok(&self, command: &[&str]) -> Result<()> {
        let response = self.cli(command).await?;
        info!("{}: {response}", command.join(" "));

        ensure!(
            response != "FAIL",
            "wpa_cli {} failed",
            command.first().copied().unwrap_or_default()
        );

        Ok(())
    }

    /// Id of the profile the user network is written to
    ///
    /// Profile 0 is the access point from the generated config. A second
    /// profile is added the first time and reused afterwards.
    async fn ensure_network_added(&self) -> Result<String> {
        let networks = parse_network_list(&self.cli(&["list_networks"]).await?);
        debug!("configured networks: {networks:?}");

        match networks.as_slice() {
            [] => bail!("failed to find any configured network profile"),
            [only] if only.id == "0" => {
                let id = self.cli(&["add_network"]).await?;
                info!("add_network: {id}");
                ensure!(id != "FAIL", "wpa_cli add_network failed");
                Ok(id)
            }
            [only] => Ok(only.id.clone()),
            [_, user, ..] => Ok(user.id.clone()),
        }
    }
}

impl<R: CommandRunner> WifiControl for WpaCli<R> {
    async fn status(&self) -> Result<WifiStatus> {
        let response = self
            .cli(&["status"])
            .await
            .context("failed to query wifi status")?;

        Ok(WifiStatus::parse(&response))
    }

    async fn scan_networks(&self) -> Result<Vec<ScannedNetwork>> {
        let ack = self.cli(&["scan"]).await?;
        ensure!(ack == "OK", "expected OK from wpa_cli scan got: {ack}");

        tokio::time::sleep(self.scan_settle_delay).await;

        let results = self.cli(&["scan_results"]).await?;

        Ok(parse_scan_results(&results))
    }

    async fn provision_network(&self, ssid: &str, psk: &str) -> Result<()> {
        let id = self.ensure_network_added().await?;
        let quoted_ssid = format!("\"{ssid}\"");
        let quoted_psk = format!("\"{psk}\"");

        self.cli_ok(&["set_network", &id, "ssid", &quoted_ssid])
            .await?;
        self.cli_ok(&["set_network", &id, "psk", &quoted_psk]).await?;
        self.cli_ok(&["set_network", &id, "key_mgmt", "WPA-PSK"])
            .await?;
        self.cli_ok(&["set_network", &id, "priority", PROVISIONED_PRIORITY])
            .await?;
        self.cli_ok(&["enable_network", &id]).await?;
        self.cli_ok(&["save_config"]).await?;
        self.cli_ok(&["reconfigure"]).await?;

        Ok(())
    }
}

/// Create the wpa_supplicant config with the access point as fallback network
///
/// An existing file is never touched, it may contain provisioned networks.
///
/// # Returns
/// true if the file was created
pub fn ensure_supplicant_config(path: &Path, ap_ssid: &str, ap_psk: &str) -> Result<bool> {
    let mut file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e).context(format!("failed to create {path:?}")),
    };

    write!(
        file,
        r#"ctrl_interface=/var/run/wpa_supplicant
ctrl_interface_group=0
update_config=1
country=SE
ap_scan=1

network={{
	ssid="{ap_ssid}"
	psk="{ap_psk}"
	key_mgmt=WPA-PSK
	mode=2
	frequency=2437
}}
"#
    )
    .context(format!("failed to write {path:?}"))?;

    info!("created wpa_supplicant config {path:?}");

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::MockCommandRunner;
    use mockall::{Sequence, predicate::eq};
    use std::fs;
    use tempfile::TempDir;

    const STATION_STATUS: &str = "bssid=aa:bb:cc:dd:ee:ff
freq=2437
ssid=home
id=1
mode=station
pairwise_cipher=CCMP
key_mgmt=WPA2-PSK
wpa_state=COMPLETED
ip_address=192.168.1.20";

    fn cli_args(args: &[&str]) -> Vec<String> {
        ["-i", "wlan0"]
            .iter()
            .chain(args)
            .map(|arg| arg.to_string())
            .collect()
    }

    fn expect_cli(
        runner: &mut MockCommandRunner,
        seq: &mut Sequence,
        args: &[&str],
        response: &'static str,
    ) {
        runner
            .expect_run()
            .with(eq(WPA_CLI), eq(cli_args(args)))
            .times(1)
            .in_sequence(seq)
            .returning(move |_, _| Box::pin(async move { Ok(response.to_string()) }));
    }

    #[test]
    fn station_status_is_classified_as_station() {
        let status = WifiStatus::parse(STATION_STATUS);

        assert!(status.is_station_connected());
        assert!(!status.is_access_point());
        assert_eq!(status.connected_ssid(), "home");
        assert_eq!(status.wpa_state, "COMPLETED");
    }

    #[test]
    fn ap_mode_status_is_classified_as_access_point() {
        let status = WifiStatus::parse(&STATION_STATUS.replace("mode=station", "mode=AP"));

        assert!(status.is_access_point());
        assert!(!status.is_station_connected());
        assert_eq!(status.connected_ssid(), "");
    }

    #[test]
    fn incomplete_status_is_unknown() {
        let status = WifiStatus::parse("wpa_state=SCANNING\nmode=station\nssid=home");

        assert_eq!(status.mode, WifiMode::Unknown);
        assert_eq!(status.wpa_state, "SCANNING");
        assert_eq!(status.connected_ssid(), "");
    }

    #[test]
    fn ssid_is_taken_from_line_prefix_not_bssid() {
        let status = WifiStatus::parse(STATION_STATUS);
        assert_eq!(status.ssid.as_deref(), Some("home"));
    }

    #[test]
    fn scan_results_skip_p2p_rows() {
        let text = "bssid / frequency / signal level / flags / ssid
aa:bb:cc:dd:ee:01\t2412\t-40\t[WPA2-PSK-CCMP][ESS]\tHome Network
aa:bb:cc:dd:ee:02\t2437\t-70\t[WPA2-PSK-CCMP][P2P]\tDIRECT-printer";

        let networks = parse_scan_results(text);

        assert_eq!(networks.len(), 1);
        assert_eq!(
            networks[0],
            ScannedNetwork {
                bssid: "aa:bb:cc:dd:ee:01".to_string(),
                frequency: "2412".to_string(),
                signal_level: "-40".to_string(),
                flags: "[WPA2-PSK-CCMP][ESS]".to_string(),
                ssid: "Home Network".to_string(),
            }
        );
    }

    #[test]
    fn scan_results_skip_rows_with_too_few_fields() {
        let text = "bssid / frequency / signal level / flags / ssid
aa:bb:cc:dd:ee:01\t2412\t-40
aa:bb:cc:dd:ee:02\t2437\t-70\t[ESS]\topen";

        let networks = parse_scan_results(text);

        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].ssid, "open");
    }

    #[test]
    fn network_list_marks_current_profile() {
        let text = "network id / ssid / bssid / flags
0\tfallback-ap\tany\t[DISABLED]
1\thome\tany\t[CURRENT]";

        let networks = parse_network_list(text);

        assert_eq!(networks.len(), 2);
        assert!(!networks[0].current);
        assert!(networks[1].current);
        assert_eq!(networks[1].id, "1");
    }

    #[tokio::test]
    async fn status_queries_configured_interface() {
        let mut runner = MockCommandRunner::new();
        let mut seq = Sequence::new();
        expect_cli(&mut runner, &mut seq, &["status"], STATION_STATUS);

        let status = WpaCli::new(Arc::new(runner), "wlan0")
            .status()
            .await
            .expect("status");

        assert!(status.is_station_connected());
    }

    #[tokio::test]
    async fn scan_requires_ok_acknowledgement() {
        let mut runner = MockCommandRunner::new();
        let mut seq = Sequence::new();
        expect_cli(&mut runner, &mut seq, &["scan"], "FAIL-BUSY");

        let result = WpaCli::new(Arc::new(runner), "wlan0")
            .with_scan_settle_delay(Duration::ZERO)
            .scan_networks()
            .await;

        let err = result.expect_err("scan must fail without OK");
        assert!(err.to_string().contains("FAIL-BUSY"));
    }

    #[tokio::test]
    async fn scan_reads_results_after_ack() {
        let mut runner = MockCommandRunner::new();
        let mut seq = Sequence::new();
        expect_cli(&mut runner, &mut seq, &["scan"], "OK");
        expect_cli(
            &mut runner,
            &mut seq,
            &["scan_results"],
            "bssid / frequency / signal level / flags / ssid
aa:bb:cc:dd:ee:01\t2412\t-40\t[ESS]\tcafe",
        );

        let networks = WpaCli::new(Arc::new(runner), "wlan0")
            .with_scan_settle_delay(Duration::ZERO)
            .scan_networks()
            .await
            .expect("scan");

        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].ssid, "cafe");
    }

    #[tokio::test]
    async fn provisioning_adds_profile_next_to_access_point() {
        let mut runner = MockCommandRunner::new();
        let mut seq = Sequence::new();
        expect_cli(
            &mut runner,
            &mut seq,
            &["list_networks"],
            "network id / ssid / bssid / flags\n0\tfallback-ap\tany\t[CURRENT]",
        );
        expect_cli(&mut runner, &mut seq, &["add_network"], "1");
        expect_cli(&mut runner, &mut seq, &["set_network", "1", "ssid", "\"home\""], "OK");
        expect_cli(&mut runner, &mut seq, &["set_network", "1", "psk", "\"secret123\""], "OK");
        expect_cli(&mut runner, &mut seq, &["set_network", "1", "key_mgmt", "WPA-PSK"], "OK");
        expect_cli(&mut runner, &mut seq, &["set_network", "1", "priority", "10"], "OK");
        expect_cli(&mut runner, &mut seq, &["enable_network", "1"], "OK");
        expect_cli(&mut runner, &mut seq, &["save_config"], "OK");
        expect_cli(&mut runner, &mut seq, &["reconfigure"], "OK");

        WpaCli::new(Arc::new(runner), "wlan0")
            .provision_network("home", "secret123")
            .await
            .expect("provisioning");
    }

    #[tokio::test]
    async fn provisioning_reuses_second_profile() {
        let mut runner = MockCommandRunner::new();
        let mut seq = Sequence::new();
        expect_cli(
            &mut runner,
            &mut seq,
            &["list_networks"],
            "network id / ssid / bssid / flags\n0\tfallback-ap\tany\n4\told\tany\t[CURRENT]",
        );
        expect_cli(&mut runner, &mut seq, &["set_network", "4", "ssid", "\"new\""], "OK");
        expect_cli(&mut runner, &mut seq, &["set_network", "4", "psk", "\"password\""], "OK");
        expect_cli(&mut runner, &mut seq, &["set_network", "4", "key_mgmt", "WPA-PSK"], "OK");
        expect_cli(&mut runner, &mut seq, &["set_network", "4", "priority", "10"], "OK");
        expect_cli(&mut runner, &mut seq, &["enable_network", "4"], "OK");
        expect_cli(&mut runner, &mut seq, &["save_config"], "OK");
        expect_cli(&mut runner, &mut seq, &["reconfigure"], "OK");

        WpaCli::new(Arc::new(runner), "wlan0")
            .provision_network("new", "password")
            .await
            .expect("provisioning");
    }

    #[tokio::test]
    async fn provisioning_aborts_on_failed_step() {
        let mut runner = MockCommandRunner::new();
        let mut seq = Sequence::new();
        expect_cli(
            &mut runner,
            &mut seq,
            &["list_networks"],
            "network id / ssid / bssid / flags\n0\tfallback-ap\tany\n1\thome\tany",
        );
        expect_cli(&mut runner, &mut seq, &["set_network", "1", "ssid", "\"home\""], "OK");
        expect_cli(&mut runner, &mut seq, &["set_network", "1", "psk", "\"short\""], "FAIL");

        let err = WpaCli::new(Arc::new(runner), "wlan0")
            .provision_network("home", "short")
            .await
            .expect_err("FAIL response must abort");

        assert!(err.to_string().contains("set_network"));
    }

    #[tokio::test]
    async fn provisioning_without_profiles_fails() {
        let mut runner = MockCommandRunner::new();
        let mut seq = Sequence::new();
        expect_cli(
            &mut runner,
            &mut seq,
            &["list_networks"],
            "network id / ssid / bssid / flags",
        );

        let result = WpaCli::new(Arc::new(runner), "wlan0")
            .provision_network("home", "secret123")
            .await;

        assert!(result.is_err());
    }

    #[test]
    fn supplicant_config_is_created_once() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("wpa_supplicant.conf");

        assert!(ensure_supplicant_config(&path, "device-ap", "devicepass").expect("create"));

        let content = fs::read_to_string(&path).expect("read config");
        assert!(content.contains("ctrl_interface=/var/run/wpa_supplicant"));
        assert!(content.contains("ssid=\"device-ap\""));
        assert!(content.contains("psk=\"devicepass\""));
        assert!(content.contains("mode=2"));

        fs::write(&path, "user edited").expect("overwrite");
        assert!(!ensure_supplicant_config(&path, "other", "otherpass").expect("second call"));
        assert_eq!(fs::read_to_string(&path).expect("read"), "user edited");
    }
}
