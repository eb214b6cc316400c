//! Supervision of the wifi association daemon and the dhcp/dns daemon
//!
//! At most one instance of each daemon is tracked. The tracked state lives in a
//! mutex guarded registry that is only ever read through copy-out accessors.
//! Each spawned daemon gets one task draining its output into the log and one
//! waiter task that clears the registry entry once the process has exited.

use anyhow::{Context, Result};
use log::{Level, debug, error, info, log};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use nix::{
    errno::Errno,
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use std::{
    fmt,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DaemonKind {
    /// wpa_supplicant, negotiating either a client link or the access point
    Station,
    /// dnsmasq, serving leases and dns answers on the access point network
    DhcpDns,
}

impl fmt::Display for DaemonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonKind::Station => write!(f, "station daemon"),
            DaemonKind::DhcpDns => write!(f, "dhcp/dns daemon"),
        }
    }
}

/// Address pool served by the dhcp/dns daemon while the access point is up
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhcpPool {
    pub ap_ip: Ipv4Addr,
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl DhcpPool {
    /// dnsmasq arguments: answer every dns query with the access point ip,
    /// serve the pool authoritatively, log to stderr and stay in foreground
    pub fn dnsmasq_args(&self) -> Vec<String> {
        vec![
            "--no-hosts".to_string(),
            "--keep-in-foreground".to_string(),
            "--log-queries".to_string(),
            "--no-resolv".to_string(),
            format!("--address=/#/{}", self.ap_ip),
            format!("--dhcp-range={},{},1h", self.start, self.end),
            "--dhcp-authoritative".to_string(),
            "--log-facility=-".to_string(),
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Program, arguments and the output stream drained into the log
#[derive(Clone, Debug)]
pub struct DaemonCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub output: OutputStream,
}

impl DaemonCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, output: OutputStream) -> Self {
        Self {
            program: program.into(),
            args,
            output,
        }
    }

    /// wpa_supplicant bound to `interface`, controlled through `config`
    pub fn wpa_supplicant(program: impl Into<PathBuf>, interface: &str, config: &Path) -> Self {
        Self::new(
            program,
            vec![
                "-Dnl80211".to_string(),
                format!("-i{interface}"),
                format!("-c{}", config.display()),
            ],
            OutputStream::Stdout,
        )
    }

    fn name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait DaemonSupervisor: Send + Sync {
    /// Start the station daemon unless it is already running
    fn start_station_daemon(&self) -> Result<()>;

    /// Interrupt the station daemon so it can release the interface
    fn stop_station_daemon(&self) -> Result<()>;

    /// Start the dhcp/dns daemon for `pool`
    ///
    /// A running instance serving the same pool is left alone. One serving a
    /// different pool is terminated and has to be started again by a later call.
    fn start_dhcp_dns_daemon(&self, pool: &DhcpPool) -> Result<()>;

    /// Terminate the dhcp/dns daemon
    fn stop_dhcp_dns_daemon(&self) -> Result<()>;
}

#[derive(Clone, Debug)]
struct Tracked {
    pid: u32,
    generation: u64,
    args: Vec<String>,
    stopping: bool,
}

#[derive(Debug, Default)]
struct Registry {
    station: Option<Tracked>,
    dhcp_dns: Option<Tracked>,
    next_generation: u64,
}

impl Registry {
    fn slot(&mut self, kind: DaemonKind) -> &mut Option<Tracked> {
        match kind {
            DaemonKind::Station => &mut self.station,
            DaemonKind::DhcpDns => &mut self.dhcp_dns,
        }
    }

    /// Only the waiter of the instance that is still tracked may clear it
    fn clear(&mut self, kind: DaemonKind, generation: u64) {
        let slot = self.slot(kind);
        if slot.as_ref().is_some_and(|t| t.generation == generation) {
            *slot = None;
        }
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    // every critical section is a single assignment, so the data stays valid
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Spawns and tracks the daemons as children of this process
pub struct ProcessSupervisor {
    registry: Arc<Mutex<Registry>>,
    station: DaemonCommand,
    dnsmasq_bin: PathBuf,
    shutdown: CancellationToken,
}

impl ProcessSupervisor {
    /// Daemons still running when `shutdown` is cancelled receive SIGTERM
    pub fn new(
        station: DaemonCommand,
        dnsmasq_bin: impl Into<PathBuf>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            station,
            dnsmasq_bin: dnsmasq_bin.into(),
            shutdown,
        }
    }

    /// Process id of the tracked instance, if any
    pub fn pid(&self, kind: DaemonKind) -> Option<u32> {
        lock(&self.registry)
            .slot(kind)
            .as_ref()
            .map(|tracked| tracked.pid)
    }

    /// true while an instance of `kind` is tracked, cleared once it exited
    pub fn is_running(&self, kind: DaemonKind) -> bool {
        lock(&self.registry).slot(kind).is_some()
    }

    fn start(&self, kind: DaemonKind, command: &DaemonCommand) -> Result<()> {
        // the lock is held across spawn so concurrent starts cannot both spawn
        let mut registry = lock(&self.registry);

        if let Some(tracked) = registry.slot(kind).as_mut() {
            if tracked.args == command.args {
                return Ok(());
            }

            info!("restarting {kind} with changed arguments");
            tracked.stopping = true;
            return send_signal(kind, tracked.pid, Signal::SIGTERM);
        }

        debug!("starting: {} {}", command.program.display(), command.args.join(" "));

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(match command.output {
                OutputStream::Stdout => Stdio::piped(),
                OutputStream::Stderr => Stdio::null(),
            })
            .stderr(match command.output {
                OutputStream::Stdout => Stdio::inherit(),
                OutputStream::Stderr => Stdio::piped(),
            })
            .spawn()
            .with_context(|| format!("failed to start {kind} {}", command.program.display()))?;

        let pid = child
            .id()
            .with_context(|| format!("failed to get {kind} process id"))?;

        let generation = registry.next_generation;
        registry.next_generation += 1;
        *registry.slot(kind) = Some(Tracked {
            pid,
            generation,
            args: command.args.clone(),
            stopping: false,
        });
        drop(registry);

        info!("{kind} started with pid {pid}");

        let name = command.name();
        match command.output {
            OutputStream::Stdout => {
                if let Some(stdout) = child.stdout.take() {
                    drain_output(name.clone(), stdout, Level::Info);
                }
            }
            OutputStream::Stderr => {
                if let Some(stderr) = child.stderr.take() {
                    drain_output(name.clone(), stderr, Level::Debug);
                }
            }
        }

        self.watch_exit(kind, generation, child);

        Ok(())
    }

    fn stop(&self, kind: DaemonKind, signal: Signal) -> Result<()> {
        let mut registry = lock(&self.registry);

        let Some(tracked) = registry.slot(kind).as_mut() else {
            return Ok(());
        };

        debug!("stopping {kind}");
        tracked.stopping = true;
        send_signal(kind, tracked.pid, signal)
    }

    fn watch_exit(&self, kind: DaemonKind, generation: u64, mut child: Child) {
        let registry = Arc::clone(&self.registry);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = shutdown.cancelled() => {
                    if let Some(pid) = child.id() {
                        if let Err(e) = send_signal(kind, pid, Signal::SIGTERM) {
                            error!("{e:#}");
                        }
                    }
                    child.wait().await
                }
            };

            let mut registry = lock(&registry);
            let requested = registry
                .slot(kind)
                .as_ref()
                .is_some_and(|t| t.generation == generation && t.stopping);

            match status {
                Ok(status) if status.success() || requested || shutdown.is_cancelled() => {
                    info!("{kind} exited: {status}")
                }
                Ok(status) => error!("{kind} exited unexpectedly: {status}"),
                Err(e) => error!("failed to wait for {kind}: {e}"),
            }

            registry.clear(kind, generation);
        });
    }
}

impl DaemonSupervisor for ProcessSupervisor {
    fn start_station_daemon(&self) -> Result<()> {
        self.start(DaemonKind::Station, &self.station)
    }

    fn stop_station_daemon(&self) -> Result<()> {
        self.stop(DaemonKind::Station, Signal::SIGINT)
    }

    fn start_dhcp_dns_daemon(&self, pool: &DhcpPool) -> Result<()> {
        let command = DaemonCommand::new(
            self.dnsmasq_bin.clone(),
            pool.dnsmasq_args(),
            OutputStream::Stderr,
        );
        self.start(DaemonKind::DhcpDns, &command)
    }

    fn stop_dhcp_dns_daemon(&self) -> Result<()> {
        self.stop(DaemonKind::DhcpDns, Signal::SIGTERM)
    }
}

fn send_signal(kind: DaemonKind, pid: u32, signal: Signal) -> Result<()> {
    let raw = i32::try_from(pid).with_context(|| format!("invalid {kind} pid {pid}"))?;

    match kill(Pid::from_raw(raw), signal) {
        // already gone, the waiter will clear it
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to send {signal:?} to {kind}")),
    }
}

fn drain_output<R>(name: String, reader: R, level: Level)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => log!(level, "{name} said: {line}"),
                Ok(None) => break,
                Err(e) => {
                    debug!("stopped reading {name} output: {e}");
                    break;
                }
            }
        }
    });
}
