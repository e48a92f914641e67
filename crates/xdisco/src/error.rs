use thiserror::Error;

/// Standard Result type for the crate, mirroring the original's `error`
/// return convention.
pub type Result<T> = std::result::Result<T, XdiscoError>;

#[derive(Debug, Error)]
pub enum XdiscoError {
    #[error("invalid server: kind and id must both be non-empty ({0:?})")]
    InvalidServer(String),

    #[error("invalid event handler: all four callbacks (OnInit/OnAdd/OnUpdate/OnDelete) are required")]
    InvalidHandler,

    #[error("empty baseKey")]
    EmptyBaseKey,

    #[error("invalid ttl: {0:?} (must be greater than 1s)")]
    InvalidTtl(std::time::Duration),

    #[error("empty endpoints")]
    EmptyEndpoints,

    #[error("missing environment variable: {0}")]
    MissingEnv(String),

    #[error("malformed backend record: {0}")]
    MalformedRecord(String),

    #[cfg(feature = "etcd")]
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[cfg(feature = "k8s")]
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("health check failed: {0}")]
    HealthCheck(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
