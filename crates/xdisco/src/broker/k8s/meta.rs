//! Reads this pod's own identity from the Downward API env vars
//! (`broker/k8s/pod_meta.go`).

use crate::error::{Result, XdiscoError};

#[derive(Debug, Clone)]
pub struct MyPodMeta {
    pub namespace: String,
    pub name: String,
    pub ip: String,
}

fn getenv(key: &str) -> Result<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| XdiscoError::MissingEnv(key.to_string()))
}

impl MyPodMeta {
    /// Reads `MY_POD_NAME`, `MY_POD_NAMESPACE`, and `MY_POD_IP`. These are
    /// expected to be wired via the Downward API; their absence is a
    /// deployment misconfiguration the caller should fail fast on.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            name: getenv("MY_POD_NAME")?,
            namespace: getenv("MY_POD_NAMESPACE")?,
            ip: getenv("MY_POD_IP")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn missing_env_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("MY_POD_NAME");
        std::env::remove_var("MY_POD_NAMESPACE");
        std::env::remove_var("MY_POD_IP");
        assert!(MyPodMeta::from_env().is_err());
    }

    #[test]
    fn reads_all_three_vars() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("MY_POD_NAME", "pod-a");
        std::env::set_var("MY_POD_NAMESPACE", "default");
        std::env::set_var("MY_POD_IP", "10.0.0.5");
        let meta = MyPodMeta::from_env().unwrap();
        assert_eq!(meta.name, "pod-a");
        assert_eq!(meta.namespace, "default");
        assert_eq!(meta.ip, "10.0.0.5");
        std::env::remove_var("MY_POD_NAME");
        std::env::remove_var("MY_POD_NAMESPACE");
        std::env::remove_var("MY_POD_IP");
    }
}
