//! The `Server` entity: one discoverable instance (§3 of the spec).

mod list;

pub use list::ServerList;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, XdiscoError};
use crate::health::Checker;

/// Advertised lifecycle state of a `Server`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Running => "running",
            State::Stopping => "stopping",
            State::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// One discoverable instance. See spec §3 for the field table and address
/// derivation rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub id: String,
    pub kind: String,
    pub host: String,
    #[serde(default)]
    pub ports: HashMap<String, u16>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    pub status: State,
    #[serde(default)]
    pub weight: i64,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,

    /// Backend-assigned identity (KV path or pod key). Never serialized;
    /// reconstructed by the broker on deserialization.
    #[serde(skip)]
    key: String,
}

impl Server {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, host: impl Into<String>) -> Self {
        let now = Utc::now();
        let id = id.into();
        let kind = kind.into();
        Self {
            key: format!("{kind}/{id}"),
            id,
            kind,
            host: host.into(),
            ports: HashMap::new(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            status: State::Running,
            weight: 0,
            updated_at: now,
            created_at: now,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.kind.is_empty() && !self.id.is_empty()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn set_key(&mut self, key: impl Into<String>) {
        self.key = key.into();
    }

    pub fn set_status(&mut self, status: State) {
        self.status = status;
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// `Host + ":" + Ports[portName]`. A missing port name yields port `0`.
    pub fn private_address(&self, port_name: &str) -> String {
        let port = self.ports.get(port_name).copied().unwrap_or(0);
        format!("{}:{}", self.host, port)
    }

    pub fn local_address(&self, port_name: &str) -> String {
        let port = self.ports.get(port_name).copied().unwrap_or(0);
        format!("127.0.0.1:{port}")
    }

    pub fn public_address(&self, port_name: &str) -> String {
        let port = self.ports.get(port_name).copied().unwrap_or(0);
        format!("0.0.0.0:{port}")
    }

    pub fn get_label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn get_annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    pub fn set_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.annotations.insert(key.into(), value.into());
    }

    /// Annotations are int-coercible on read (spec §3); unparseable or
    /// missing values fall back to `default`.
    pub fn get_annotation_as_int(&self, key: &str, default: i64) -> i64 {
        self.annotations
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Parse from the JSON body stored under a backend key, reconstructing
    /// `key` from the backend-supplied path (spec §3, §6.3).
    pub fn from_backend_bytes(key: impl Into<String>, data: &[u8]) -> Result<Self> {
        let mut s: Server = serde_json::from_slice(data)
            .map_err(|e| XdiscoError::MalformedRecord(e.to_string()))?;
        s.set_key(key);
        Ok(s)
    }

    pub async fn check(&self, checker: &dyn Checker) -> Result<()> {
        checker.ping(self).await
    }
}

/// Convenience constructor mirroring `build.go: NewServer`: derives `id`
/// from `addr`. Returns an error rather than panicking on an empty kind
/// or address.
pub fn new_server(kind: impl Into<String>, addr: impl Into<String>) -> Result<Server> {
    let kind = kind.into();
    let addr = addr.into();
    if kind.is_empty() {
        return Err(XdiscoError::InvalidServer("empty kind".into()));
    }
    if addr.is_empty() {
        return Err(XdiscoError::InvalidServer("empty address".into()));
    }
    Ok(Server::new(addr.clone(), kind, addr))
}
