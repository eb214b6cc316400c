use actix_server::ServerHandle;
use actix_web::{App, HttpServer, web};
use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use log::{debug, error, info};
use std::{io::Write, sync::Arc};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use wificonfig::{
    api::{Api, json_error_handler},
    command::SystemCommandRunner,
    config::AppConfig,
    services::{
        interface::SystemInterfaceProbe,
        liveness::HttpLivenessCheck,
        reconcile::{ReconcileSettings, Reconciler},
        static_config::StaticConfigService,
        supervisor::{DaemonCommand, DaemonSupervisor, ProcessSupervisor},
        wifi::{WpaCli, ensure_supplicant_config},
    },
};

type Wifi = WpaCli<SystemCommandRunner>;
type ConfigApi = Api<Wifi, SystemCommandRunner>;
type NetworkReconciler = Reconciler<
    HttpLivenessCheck,
    SystemInterfaceProbe,
    ProcessSupervisor,
    Wifi,
    SystemCommandRunner,
>;

#[actix_web::main]
async fn main() {
    if let Err(e) = run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    initialize();

    let config = AppConfig::load().context("failed to load configuration")?;

    ensure_supplicant_config(
        &config.daemons.wpa_supplicant_config,
        &config.access_point.ssid,
        &config.access_point.psk,
    )
    .context("failed to ensure wpa_supplicant config")?;

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    let shutdown = CancellationToken::new();
    let runner = Arc::new(SystemCommandRunner);

    let supervisor = Arc::new(ProcessSupervisor::new(
        DaemonCommand::wpa_supplicant(
            &config.daemons.wpa_supplicant_bin,
            &config.interfaces.wireless,
            &config.daemons.wpa_supplicant_config,
        ),
        &config.daemons.dnsmasq_bin,
        shutdown.clone(),
    ));
    let wifi = Arc::new(WpaCli::new(Arc::clone(&runner), &config.interfaces.wireless));
    let static_config = Arc::new(StaticConfigService::new(
        Arc::clone(&runner),
        &config.interfaces.ethernet,
        &config.static_config.primary,
        &config.static_config.systemd_network_dir,
    ));

    let reconciler = NetworkReconciler::new(
        HttpLivenessCheck::new(&config.reconcile.alive_url)?,
        SystemInterfaceProbe,
        Arc::clone(&supervisor),
        Arc::clone(&wifi),
        Arc::clone(&static_config),
        Arc::clone(&runner),
        ReconcileSettings::from(&config),
    );

    let interval = config.reconcile.interval;
    let reconcile_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { reconciler.run(interval, shutdown).await }
    });

    let api = ConfigApi::new(wifi, static_config, &config.interfaces.ethernet);
    let (server_handle, server_task) = run_server(config.api.port, api)?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => debug!("ctrl-c received"),
        _ = sigterm.recv() => debug!("SIGTERM received"),
        result = server_task => match result {
            Ok(Ok(())) => debug!("server stopped normally"),
            Ok(Err(e)) => error!("server stopped with error: {e}"),
            Err(e) => error!("server task panicked: {e}"),
        },
    }

    info!("shutting down");

    shutdown.cancel();

    if let Err(e) = reconcile_task.await {
        error!("check loop panicked: {e}");
    }

    if let Err(e) = supervisor.stop_dhcp_dns_daemon() {
        error!("failed to stop dhcp/dns daemon: {e:#}");
    }
    if let Err(e) = supervisor.stop_station_daemon() {
        error!("failed to stop station daemon: {e:#}");
    }

    server_handle.stop(true).await;

    info!("shutdown complete");

    Ok(())
}

fn initialize() {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("module version: {}", env!("CARGO_PKG_VERSION"));
}

fn run_server(
    port: u16,
    api: ConfigApi,
) -> Result<(
    ServerHandle,
    tokio::task::JoinHandle<Result<(), std::io::Error>>,
)> {
    let api = web::Data::new(api);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(api.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .route("/", web::get().to(ConfigApi::index))
            .route("/api/scan-v1", web::get().to(ConfigApi::scan))
            .route("/api/status-v1", web::get().to(ConfigApi::status))
            .route("/api/connect-v1", web::post().to(ConfigApi::connect))
            .route(
                "/api/ethernet-v1",
                web::post().to(ConfigApi::configure_ethernet),
            )
            .route("/healthcheck", web::get().to(ConfigApi::healthcheck))
            .route("/generate_204", web::get().to(ConfigApi::generate_204))
    })
    .bind(("0.0.0.0", port))
    .context("failed to bind server")?
    .disable_signals()
    .run();

    info!("listening on port {port}");

    Ok((server.handle(), tokio::spawn(server)))
}
