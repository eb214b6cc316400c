use crate::{
    command::CommandRunner,
    services::{
        interface::{InterfaceInfo, list_interfaces},
        static_config::StaticConfigService,
        wifi::WifiControl,
    },
};
use actix_web::{HttpResponse, Responder, web};
use anyhow::{Context, Result};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_valid::Validate;
use std::sync::Arc;

const INDEX_HTML: &str = include_str!("../static/index.html");

#[derive(Deserialize, Validate, Debug)]
pub struct ConnectRequest {
    #[serde(alias = "SSID")]
    #[validate(min_length = 1)]
    #[validate(max_length = 32)]
    pub ssid: String,
    #[serde(alias = "PSK")]
    #[validate(min_length = 8)]
    #[validate(max_length = 63)]
    pub psk: String,
}

#[derive(Deserialize, Debug)]
pub struct EthernetRequest {
    /// `address/prefix`, empty to drop the static configuration
    #[serde(alias = "IP", default)]
    pub ip: String,
}

#[derive(Serialize, Debug)]
pub struct StatusResponse {
    pub ssid: String,
    pub interfaces: Vec<InterfaceInfo>,
}

pub struct Api<Wifi, Runner>
where
    Wifi: WifiControl,
    Runner: CommandRunner,
{
    pub wifi: Arc<Wifi>,
    pub static_config: Arc<StaticConfigService<Runner>>,
    pub ethernet_interface: String,
}

impl<Wifi, Runner> Api<Wifi, Runner>
where
    Wifi: WifiControl,
    Runner: CommandRunner,
{
    pub fn new(
        wifi: Arc<Wifi>,
        static_config: Arc<StaticConfigService<Runner>>,
        ethernet_interface: impl Into<String>,
    ) -> Self {
        Api {
            wifi,
            static_config,
            ethernet_interface: ethernet_interface.into(),
        }
    }

    pub async fn index() -> impl Responder {
        debug!("index() called");

        HttpResponse::Ok()
            .content_type("text/html; charset=utf-8")
            .body(INDEX_HTML)
    }

    pub async fn healthcheck() -> impl Responder {
        HttpResponse::Ok().body(env!("CARGO_PKG_VERSION"))
    }

    /// Captive portal probe, send the client to the configuration page
    pub async fn generate_204() -> impl Responder {
        HttpResponse::Found()
            .append_header(("Location", "/"))
            .finish()
    }

    pub async fn scan(api: web::Data<Self>) -> impl Responder {
        debug!("scan() called");

        match api.wifi.scan_networks().await {
            Ok(networks) => HttpResponse::Ok().json(networks),
            Err(e) => {
                error!("scan failed: {e:#}");
                bad_request("scanning for network failed")
            }
        }
    }

    pub async fn status(api: web::Data<Self>) -> impl Responder {
        debug!("status() called");

        let interfaces =
            match list_interfaces(&api.ethernet_interface, api.static_config.primary()) {
                Ok(interfaces) => interfaces,
                Err(e) => return handle_error(e, "status"),
            };

        // an unreachable station daemon only blanks the ssid
        let ssid = match api.wifi.status().await {
            Ok(status) => status.connected_ssid(),
            Err(e) => {
                error!("status: failed to query wifi status: {e:#}");
                String::new()
            }
        };

        HttpResponse::Ok().json(StatusResponse { ssid, interfaces })
    }

    pub async fn connect(body: web::Json<ConnectRequest>, api: web::Data<Self>) -> impl Responder {
        debug!("connect() called for {}", body.ssid);

        match Self::provision(&api, body.into_inner()).await {
            Ok(()) => HttpResponse::Ok().json(json!({})),
            Err(e) => {
                error!("connect failed: {e:#}");
                bad_request("failed to connect")
            }
        }
    }

    pub async fn configure_ethernet(
        body: web::Json<EthernetRequest>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("configure_ethernet() called with {:?}", body.ip);

        match api.static_config.ensure_ethernet_static_ip(&body.ip).await {
            Ok(()) => HttpResponse::Ok().json(json!({})),
            Err(e) => handle_error(e, "configure_ethernet"),
        }
    }

    async fn provision(&self, request: ConnectRequest) -> Result<()> {
        request.validate().context("invalid connect request")?;
        self.wifi.provision_network(&request.ssid, &request.psk).await
    }
}

/// Json body or query extraction failures use the same error shape as handlers
pub fn json_error_handler(
    err: actix_web::error::JsonPayloadError,
    _req: &actix_web::HttpRequest,
) -> actix_web::Error {
    let message = err.to_string();
    actix_web::error::InternalError::from_response(err, bad_request(&message)).into()
}

fn handle_error(e: anyhow::Error, operation: &str) -> HttpResponse {
    error!("{operation} failed: {e:#}");
    bad_request(&format!("{e:#}"))
}

fn bad_request(message: &str) -> HttpResponse {
    HttpResponse::BadRequest().json(json!({ "error": message }))
}
