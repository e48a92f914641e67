//! Connection and lease options for the etcd backend (`broker/etcd/config.go`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, XdiscoError};

fn default_base_key() -> String {
    "/xdisco".to_string()
}

fn default_endpoints() -> Vec<String> {
    vec!["127.0.0.1:2379".to_string()]
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_ttl() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    #[serde(default = "default_base_key")]
    pub base_key: String,
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub dial_timeout: Duration,
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            base_key: default_base_key(),
            endpoints: default_endpoints(),
            dial_timeout: default_timeout(),
            ttl: default_ttl(),
        }
    }
}

impl Options {
    pub fn check_basic(&self) -> Result<()> {
        if self.base_key.is_empty() {
            return Err(XdiscoError::EmptyBaseKey);
        }
        if self.ttl.is_zero() {
            return Err(XdiscoError::InvalidTtl(self.ttl));
        }
        Ok(())
    }

    pub fn check(&self) -> Result<()> {
        self.check_basic()?;
        if self.endpoints.is_empty() {
            return Err(XdiscoError::EmptyEndpoints);
        }
        Ok(())
    }

    /// Fills in any zero-valued field with its default, mirroring
    /// `Options.WithDefault`.
    pub fn with_defaults(mut self) -> Self {
        let d = Options::default();
        if self.base_key.is_empty() {
            self.base_key = d.base_key;
        }
        if self.endpoints.is_empty() {
            self.endpoints = d.endpoints;
        }
        if self.dial_timeout.is_zero() {
            self.dial_timeout = d.dial_timeout;
        }
        if self.ttl.is_zero() {
            self.ttl = d.ttl;
        }
        self
    }
}
