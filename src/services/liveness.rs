use anyhow::{Context, Result};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use trait_variant::make;

const ALIVE_TIMEOUT: Duration = Duration::from_secs(1);

#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait LivenessCheck: Send + Sync {
    /// true if the liveness url answers `200 OK`
    ///
    /// Transport errors are returned as errors. Callers treat them as "not alive".
    async fn is_alive(&self) -> Result<bool>;
}

/// Plain GET against the operator supplied url
#[derive(Clone)]
pub struct HttpLivenessCheck {
    client: Client,
    url: String,
}

impl HttpLivenessCheck {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(ALIVE_TIMEOUT)
            // the device's own uplink is what is being checked
            .no_proxy()
            .build()
            .context("failed to create liveness http client")?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl LivenessCheck for HttpLivenessCheck {
    async fn is_alive(&self) -> Result<bool> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", self.url))?;

        Ok(response.status() == StatusCode::OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    async fn serve_once(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response = format!("HTTP/1.1 {status_line}\r\nContent-Length: 0\r\n\r\n");
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn ok_response_is_alive() {
        let url = serve_once("200 OK").await;
        let check = HttpLivenessCheck::new(url).expect("client");

        assert!(check.is_alive().await.expect("request"));
    }

    #[tokio::test]
    async fn other_status_is_not_alive() {
        let url = serve_once("204 No Content").await;
        let check = HttpLivenessCheck::new(url).expect("client");

        assert!(!check.is_alive().await.expect("request"));
    }

    #[tokio::test]
    async fn unreachable_url_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let check = HttpLivenessCheck::new(format!("http://{addr}/")).expect("client");

        assert!(check.is_alive().await.is_err());
    }
}
