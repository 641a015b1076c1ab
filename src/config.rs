use std::time::Duration;
use url::Url;

use crate::adapter::BackendKind;
use crate::codec::{OffloadPolicy, DEFAULT_OFFLOAD_THRESHOLD};
use crate::error::{PersistenceError, PersistenceResult};

pub const DEFAULT_PART_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentConfig {
    /// `memory://`, `file:///path`, `gs://bucket/prefix` or `s3://bucket/prefix`.
    pub object_store_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationalConfig {
    pub database_url: String,
    pub max_connections: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendConfig {
    Document(DocumentConfig),
    Relational(RelationalConfig),
}

impl BackendConfig {
    pub fn document(object_store_url: impl Into<String>) -> Self {
        BackendConfig::Document(DocumentConfig {
            object_store_url: object_store_url.into(),
        })
    }

    pub fn relational(database_url: impl Into<String>) -> Self {
        BackendConfig::Relational(RelationalConfig {
            database_url: database_url.into(),
            max_connections: 10,
        })
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::Document(_) => BackendKind::Document,
            BackendConfig::Relational(_) => BackendKind::Relational,
        }
    }

    /// Location of the backend, with credentials masked.
    pub fn describe(&self) -> String {
        match self {
            BackendConfig::Document(c) => redact_url(&c.object_store_url),
            BackendConfig::Relational(c) => redact_url(&c.database_url),
        }
    }
}

/// Deployment-level knobs every adapter shares.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdapterSettings {
    pub offload: OffloadPolicy,
    pub part_size: usize,
    /// Bounds connecting a backend and checking out a pooled connection.
    pub connect_timeout: Duration,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            offload: OffloadPolicy::default(),
            part_size: DEFAULT_PART_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistenceConfig {
    pub backend: BackendConfig,
    pub adapter: AdapterSettings,
    pub batch_max_parallelism: usize,
    pub operation_timeout: Duration,
    pub retry: RetrySettings,
    pub gc_interval: Duration,
    pub gc_grace: Duration,
}

impl PersistenceConfig {
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            backend,
            adapter: AdapterSettings::default(),
            batch_max_parallelism: 8,
            operation_timeout: Duration::from_secs(30),
            retry: RetrySettings::default(),
            gc_interval: Duration::from_secs(3600),
            gc_grace: Duration::from_secs(86_400),
        }
    }

    pub fn from_env() -> PersistenceResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> PersistenceResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let kind: BackendKind = lookup("STORAGE_BACKEND")
            .unwrap_or_else(|| "document".to_string())
            .parse()?;

        let backend = match kind {
            BackendKind::Document => BackendConfig::document(
                lookup("OBJECT_STORE_URL").unwrap_or_else(|| "memory://".to_string()),
            ),
            BackendKind::Relational => {
                let database_url = lookup("DATABASE_URL").ok_or_else(|| {
                    PersistenceError::config(
                        "DATABASE_URL environment variable is required for the relational backend",
                    )
                })?;
                BackendConfig::Relational(RelationalConfig {
                    database_url,
                    max_connections: parse_var(&lookup, "DATABASE_MAX_CONNECTIONS", 10usize)?,
                })
            }
        };

        let threshold = parse_var(&lookup, "OFFLOAD_THRESHOLD_BYTES", DEFAULT_OFFLOAD_THRESHOLD)?;
        let part_size = parse_var(&lookup, "BLOB_PART_SIZE_BYTES", DEFAULT_PART_SIZE)?;
        if part_size == 0 {
            return Err(PersistenceError::config("BLOB_PART_SIZE_BYTES must be positive"));
        }

        let batch_max_parallelism = parse_var(&lookup, "BATCH_MAX_PARALLELISM", 8usize)?;
        if batch_max_parallelism == 0 {
            return Err(PersistenceError::config(
                "BATCH_MAX_PARALLELISM must be at least 1",
            ));
        }

        let retry = RetrySettings {
            max_attempts: parse_var(&lookup, "RETRY_MAX_ATTEMPTS", 4usize)?,
            base_delay: Duration::from_millis(parse_var(&lookup, "RETRY_BASE_DELAY_MS", 100u64)?),
            max_delay: Duration::from_millis(parse_var(&lookup, "RETRY_MAX_DELAY_MS", 5000u64)?),
        };

        let connect_timeout = Duration::from_secs(parse_var(
            &lookup,
            "CONNECT_TIMEOUT_SECS",
            DEFAULT_CONNECT_TIMEOUT.as_secs(),
        )?);
        if connect_timeout.is_zero() {
            return Err(PersistenceError::config("CONNECT_TIMEOUT_SECS must be positive"));
        }

        let gc_interval = Duration::from_secs(parse_var(&lookup, "GC_INTERVAL_SECS", 3600u64)?);
        if gc_interval.is_zero() {
            return Err(PersistenceError::config("GC_INTERVAL_SECS must be positive"));
        }

        Ok(Self {
            backend,
            adapter: AdapterSettings {
                offload: OffloadPolicy::new(threshold),
                part_size,
                connect_timeout,
            },
            batch_max_parallelism,
            operation_timeout: Duration::from_secs(parse_var(
                &lookup,
                "OPERATION_TIMEOUT_SECS",
                30u64,
            )?),
            retry,
            gc_interval,
            gc_grace: Duration::from_secs(parse_var(&lookup, "GC_GRACE_SECS", 86_400u64)?),
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> PersistenceResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e| {
            PersistenceError::config(format!("Invalid value for {}: '{}' ({})", key, raw, e))
        }),
    }
}

/// Masks the password of a URL so it can be logged.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<unparseable url>".to_string(),
    }
}
