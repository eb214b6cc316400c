//! Static ip stanza for the wired interface
//!
//! The stanza is composed at the primary location. When that location is not
//! inside the systemd-networkd directory, a verbatim mirror is kept there so the
//! configuration survives a root filesystem upgrade. The mirror is compared and
//! copied by content hash only.

use crate::command::{CommandRunner, args};
use anyhow::{Context, Result, bail, ensure};
use ini::Ini;
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::{
    fmt, fs, io,
    io::ErrorKind,
    net::IpAddr,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

/// `address/prefix` as written to the `Address=` key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StaticAddress {
    pub ip: IpAddr,
    pub prefix: u8,
}

impl FromStr for StaticAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((ip, prefix)) = s.split_once('/') else {
            bail!("invalid address {s}: missing prefix length");
        };

        let ip: IpAddr = ip
            .parse()
            .with_context(|| format!("invalid address {s}: bad ip"))?;
        let prefix: u8 = prefix
            .parse()
            .with_context(|| format!("invalid address {s}: bad prefix length"))?;

        let max = if ip.is_ipv4() { 32 } else { 128 };
        ensure!(prefix <= max, "invalid address {s}: prefix exceeds {max}");

        Ok(Self { ip, prefix })
    }
}

impl fmt::Display for StaticAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix)
    }
}

pub struct StaticConfigService<R> {
    runner: Arc<R>,
    interface: String,
    primary: PathBuf,
    systemd_network_dir: PathBuf,
}

impl<R: CommandRunner> StaticConfigService<R> {
    pub fn new(
        runner: Arc<R>,
        interface: impl Into<String>,
        primary: impl Into<PathBuf>,
        systemd_network_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            interface: interface.into(),
            primary: primary.into(),
            systemd_network_dir: systemd_network_dir.into(),
        }
    }

    pub fn primary(&self) -> &Path {
        &self.primary
    }

    /// Configure `cidr` as static address of the wired interface
    ///
    /// An empty `cidr` removes the configuration. A primary stanza already
    /// carrying the exact `Address=` line is left untouched.
    pub async fn ensure_ethernet_static_ip(&self, cidr: &str) -> Result<()> {
        let cidr = cidr.trim();

        if cidr.is_empty() {
            let removed = remove_if_exists(&self.primary)?;
            let mirror_changed = self.mirror()?;

            if removed || mirror_changed {
                info!("removed static ip configuration of {}", self.interface);
                self.reload().await?;
            }
            return Ok(());
        }

        let address: StaticAddress = cidr.parse()?;

        if self.has_address(&address)? {
            debug!("{:?} already configures {address}", self.primary);
            return Ok(());
        }

        self.write_stanza(&address)?;
        self.mirror()?;
        self.reload().await
    }

    /// Mirror the primary stanza into the systemd-networkd directory
    ///
    /// # Returns
    /// true if the mirror was changed and networkd reloaded
    pub async fn sync_static_config_if_needed(&self) -> Result<bool> {
        if !self.mirror()? {
            return Ok(false);
        }

        self.reload().await?;
        Ok(true)
    }

    fn mirror_path(&self) -> Option<PathBuf> {
        if self.primary.starts_with(&self.systemd_network_dir) {
            return None;
        }

        self.primary
            .file_name()
            .map(|name| self.systemd_network_dir.join(name))
    }

    fn has_address(&self, address: &StaticAddress) -> Result<bool> {
        let content = match fs::read_to_string(&self.primary) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e).context(format!("failed to read {:?}", self.primary)),
        };

        let expected = format!("Address={address}");

        Ok(content.lines().any(|line| line.trim() == expected))
    }

    fn write_stanza(&self, address: &StaticAddress) -> Result<()> {
        let mut ini = Ini::new();

        ini.with_section(Some("Match".to_owned()))
            .set("Name", &self.interface);
        ini.with_section(Some("Network".to_owned()))
            .set("Address", address.to_string());

        info!("write static ip config to {:?}: {address}", self.primary);

        ini.write_to_file(&self.primary)
            .context(format!("failed to write static ip config: {:?}", self.primary))
    }

    /// Bring the mirror in line with the primary stanza, without reloading
    fn mirror(&self) -> Result<bool> {
        let Some(mirror) = self.mirror_path() else {
            return Ok(false);
        };

        let source_hash = match file_hash(&self.primary) {
            Ok(hash) => hash,
            // no source, no mirror
            Err(e) if e.kind() == ErrorKind::NotFound => return remove_if_exists(&mirror),
            Err(e) => return Err(e).context(format!("failed to hash {:?}", self.primary)),
        };

        let mirror_hash = match file_hash(&mirror) {
            Ok(hash) => Some(hash),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e).context(format!("failed to hash {mirror:?}")),
        };

        if mirror_hash.as_deref() == Some(source_hash.as_str()) {
            return Ok(false);
        }

        info!("mirror {:?} to {mirror:?}", self.primary);

        fs::copy(&self.primary, &mirror)
            .context(format!("failed to copy {:?} to {mirror:?}", self.primary))?;

        Ok(true)
    }

    async fn reload(&self) -> Result<()> {
        self.runner
            .run("networkctl", &args(["reload"]))
            .await
            .context("failed to reload systemd-networkd")
            .map(|_| ())
    }
}

fn file_hash(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;

    Ok(hex::encode(hasher.finalize()))
}

/// Remove a file, treating an already absent file as success
///
/// # Returns
/// true if a file was removed
fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).context(format!("failed to remove {path:?}")),
    }
}
