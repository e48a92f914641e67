//! The built-in HTTP HEAD liveness probe (`health/httphead.go`).

use std::time::Duration;

use async_trait::async_trait;

use super::Checker;
use crate::error::{Result, XdiscoError};
use crate::server::Server;

const TIMEOUT: Duration = Duration::from_secs(2);
const RETRIES: u32 = 3;

/// Probes `http://<private-address>/health/status` with HTTP HEAD,
/// retrying up to `retries` times before giving up.
pub struct HttpHead {
    client: reqwest::Client,
    port_name: String,
    retries: u32,
}

impl HttpHead {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(TIMEOUT)
                .build()
                .expect("static reqwest client config is valid"),
            port_name: port_name.into(),
            retries: RETRIES,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    async fn probe_once(&self, url: &str) -> Result<()> {
        let resp = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| XdiscoError::HealthCheck(format!("{e} from {url}")))?;
        if resp.status().as_u16() != 200 {
            return Err(XdiscoError::HealthCheck(format!(
                "non-200 status[{}] from '{url}'",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Checker for HttpHead {
    async fn ping(&self, server: &Server) -> Result<()> {
        let addr = server.private_address(&self.port_name);
        if addr.is_empty() || addr.starts_with(':') {
            return Err(XdiscoError::HealthCheck("empty address".into()));
        }
        let url = format!("http://{addr}/health/status");

        let mut last_err = self.probe_once(&url).await;
        if last_err.is_ok() {
            return Ok(());
        }
        for _ in 0..self.retries.saturating_sub(1) {
            last_err = self.probe_once(&url).await;
            if last_err.is_ok() {
                return Ok(());
            }
        }
        last_err
    }
}
