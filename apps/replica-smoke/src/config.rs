//! Environment-backed configuration for `replica-smoke`.

use std::{env, error::Error, fmt, time::Duration};

use replica_client::{CollectionRef, DEFAULT_LIST_TIMEOUT_SECONDS, SyncOptions};
use replica_core::DEFAULT_RELIST_DELAY_MS;
use url::Url;

/// Runtime configuration for one synced collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeConfig {
    /// API server base URL.
    pub server: Url,
    /// Bearer token; requests go out anonymously without one.
    pub token: Option<String>,
    /// Group/version prefix, e.g. `/apis/apps.example.com/v1`.
    pub api_path: String,
    /// Collection name under `api_path`.
    pub resource: String,
    pub namespace: Option<String>,
    /// Fixed delay between a failed watch and the next relist.
    pub backoff_ms: u64,
    pub list_timeout_seconds: u32,
    /// Client-side bound for non-streaming requests.
    pub request_timeout_ms: Option<u64>,
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let server_raw = required_trimmed_env("REPLICA_SERVER", &mut lookup)?;
        let server = Url::parse(&server_raw).map_err(|err| ConfigError::InvalidValue {
            key: "REPLICA_SERVER",
            value: server_raw.clone(),
            reason: err.to_string(),
        })?;
        if server.cannot_be_a_base() {
            return Err(ConfigError::InvalidValue {
                key: "REPLICA_SERVER",
                value: server_raw,
                reason: "must be an absolute http(s) URL".to_owned(),
            });
        }

        let token = optional_trimmed_env("REPLICA_TOKEN", &mut lookup);
        let api_path = required_trimmed_env("REPLICA_API_PATH", &mut lookup)?;
        if !api_path.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                key: "REPLICA_API_PATH",
                value: api_path,
                reason: "must start with '/'".to_owned(),
            });
        }
        let resource = required_trimmed_env("REPLICA_RESOURCE", &mut lookup)?;
        let namespace = optional_trimmed_env("REPLICA_NAMESPACE", &mut lookup);

        let backoff_ms = parse_optional_u64("REPLICA_BACKOFF_MS", &mut lookup)?
            .unwrap_or(DEFAULT_RELIST_DELAY_MS);
        let list_timeout_seconds = parse_optional_u32("REPLICA_LIST_TIMEOUT_SECONDS", &mut lookup)?
            .unwrap_or(DEFAULT_LIST_TIMEOUT_SECONDS);
        let request_timeout_ms = parse_optional_u64("REPLICA_REQUEST_TIMEOUT_MS", &mut lookup)?;

        if list_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                key: "REPLICA_LIST_TIMEOUT_SECONDS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if request_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "REPLICA_REQUEST_TIMEOUT_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            server,
            token,
            api_path,
            resource,
            namespace,
            backoff_ms,
            list_timeout_seconds,
            request_timeout_ms,
        })
    }

    pub fn collection(&self) -> CollectionRef {
        CollectionRef::new(self.api_path.clone(), self.resource.clone())
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            list_timeout_seconds: self.list_timeout_seconds,
            ..SyncOptions::default()
        }
        .with_backoff(Duration::from_millis(self.backoff_ms))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required environment variable is unset or blank.
    Missing { key: &'static str },
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { key } => write!(f, "{key} is required"),
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn required_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Result<String, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    optional_trimmed_env(key, lookup).ok_or(ConfigError::Missing { key })
}

fn parse_optional_u32<F>(key: &'static str, lookup: &mut F) -> Result<Option<u32>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u32>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u64<F>(key: &'static str, lookup: &mut F) -> Result<Option<u64>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const REQUIRED: &[(&str, &str)] = &[
        ("REPLICA_SERVER", "https://cluster.example.org:6443"),
        ("REPLICA_API_PATH", "/apis/apps.example.com/v1"),
        ("REPLICA_RESOURCE", "apps"),
    ];

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<SmokeConfig, ConfigError> {
        let map = REQUIRED
            .iter()
            .chain(pairs)
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        SmokeConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn parses_required_fields_and_defaults() {
        let cfg = config_from_pairs(&[]).expect("config should parse");

        assert_eq!(cfg.server.as_str(), "https://cluster.example.org:6443/");
        assert_eq!(cfg.collection().path(None), "/apis/apps.example.com/v1/apps");
        assert_eq!(cfg.token, None);
        assert_eq!(cfg.namespace, None);
        assert_eq!(cfg.backoff_ms, DEFAULT_RELIST_DELAY_MS);
        assert_eq!(cfg.list_timeout_seconds, 10);
        assert_eq!(cfg.request_timeout(), None);

        let options = cfg.sync_options();
        assert_eq!(options.retry.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(options.list_timeout_seconds, 10);
    }

    #[test]
    fn parses_optional_tuning_when_present() {
        let cfg = config_from_pairs(&[
            ("REPLICA_TOKEN", " abc "),
            ("REPLICA_NAMESPACE", "kube-system"),
            ("REPLICA_BACKOFF_MS", "250"),
            ("REPLICA_LIST_TIMEOUT_SECONDS", "30"),
            ("REPLICA_REQUEST_TIMEOUT_MS", "15000"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.token.as_deref(), Some("abc"));
        assert_eq!(cfg.namespace.as_deref(), Some("kube-system"));
        assert_eq!(cfg.sync_options().retry.delay_for_attempt(0), Duration::from_millis(250));
        assert_eq!(cfg.sync_options().list_timeout_seconds, 30);
        assert_eq!(cfg.request_timeout(), Some(Duration::from_secs(15)));
    }

    #[test]
    fn missing_required_value_is_reported_by_key() {
        let err = SmokeConfig::from_lookup(|key| match key {
            "REPLICA_SERVER" => Some("https://cluster.example.org".to_owned()),
            "REPLICA_RESOURCE" => Some("apps".to_owned()),
            _ => None,
        })
        .expect_err("api path is required");

        assert_eq!(err, ConfigError::Missing { key: "REPLICA_API_PATH" });
        assert_eq!(err.to_string(), "REPLICA_API_PATH is required");
    }

    #[test]
    fn rejects_invalid_values() {
        let err = config_from_pairs(&[("REPLICA_BACKOFF_MS", "soon")])
            .expect_err("invalid backoff should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "REPLICA_BACKOFF_MS",
                ..
            }
        ));

        let err = config_from_pairs(&[("REPLICA_SERVER", "not a url")])
            .expect_err("invalid server should fail");
        assert!(matches!(err, ConfigError::InvalidValue { key: "REPLICA_SERVER", .. }));

        let err = config_from_pairs(&[("REPLICA_LIST_TIMEOUT_SECONDS", "0")])
            .expect_err("zero list timeout should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "REPLICA_LIST_TIMEOUT_SECONDS",
                ..
            }
        ));
    }
}
