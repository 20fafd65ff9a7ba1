//! Runtime configuration of the bridge

use crate::bulk::{BulkOptions, RetryPolicy};
use crate::catalog::DEFAULT_DISCOVERY_URL;
use crate::codec::ManifestEncoding;
use crate::providers::RezkaOptions;
use crate::providers::rezka::DEFAULT_HOST;
use crate::session::Credentials;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by an inconsistent configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

/// Everything the bridge needs to reach its upstreams
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Host of the scraped portal mirror
    pub rezka_host: String,
    /// Portal account; without it the portal is used anonymously
    pub credentials: Option<Credentials>,
    /// Drop cached portal cookies and log in again
    pub relogin: bool,
    /// Catalog API host, used when no refreshed host is persisted
    pub catalog_base_url: Option<String>,
    /// Script that publishes the current catalog API host
    pub discovery_url: String,
    /// Upper bound for every upstream request
    pub timeout: Duration,
    pub manifest_encoding: ManifestEncoding,
    /// Worker limit and retry policy of whole-season resolution
    pub bulk: BulkOptions,
    /// Minimum delay between two episode listing calls on the portal
    pub pacing: Duration,
    /// Replaces the platform cache directory
    pub cache_dir: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            rezka_host: DEFAULT_HOST.to_string(),
            credentials: None,
            relogin: false,
            catalog_base_url: None,
            discovery_url: DEFAULT_DISCOVERY_URL.to_string(),
            timeout: Duration::from_secs(30),
            manifest_encoding: ManifestEncoding::default(),
            bulk: BulkOptions::default(),
            pacing: Duration::from_millis(500),
            cache_dir: None,
        }
    }
}

impl BridgeConfig {
    /// Rejects values the bridge cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let host = self.rezka_host.trim();
        if host.is_empty() || host.contains('/') {
            return Err(invalid("rezka host", format!("'{}' is not a host name", self.rezka_host)));
        }
        if let Some(base) = &self.catalog_base_url {
            url::Url::parse(base).map_err(|e| invalid("catalog URL", e.to_string()))?;
        }
        if self.timeout.is_zero() {
            return Err(invalid("timeout", "must be positive"));
        }
        if self.bulk.workers == 0 {
            return Err(invalid("workers", "at least one worker is required"));
        }
        if self.bulk.retry.max_attempts == Some(0) {
            return Err(invalid("retries", "at least one attempt is required"));
        }
        if let Some(credentials) = &self.credentials {
            if credentials.login.is_empty() || credentials.password.is_empty() {
                return Err(invalid("credentials", "login and password are both required"));
            }
        }
        Ok(())
    }

    /// Portal provider tunables derived from this configuration
    pub fn rezka_options(&self) -> RezkaOptions {
        RezkaOptions {
            encoding: self.manifest_encoding,
            pacing: self.pacing,
            ..RezkaOptions::default()
        }
    }

    /// Convenience setter for the retry policy of whole-season resolution
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.bulk.retry = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.rezka_host, "rezka.fi");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.bulk.workers, 6);
        assert_eq!(config.bulk.retry.max_attempts, Some(2));
        assert_eq!(config.pacing, Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_unusable_values() {
        let config = BridgeConfig {
            rezka_host: "https://rezka.fi/".into(),
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.bulk.workers = 0;
        assert!(config.validate().is_err());

        let config = BridgeConfig::default().with_retry(RetryPolicy {
            max_attempts: Some(0),
            backoff: Duration::ZERO,
        });
        assert!(config.validate().is_err());

        let config = BridgeConfig {
            credentials: Some(Credentials {
                login: "user".into(),
                password: String::new(),
            }),
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unbounded_retry_is_valid() {
        let config = BridgeConfig::default().with_retry(RetryPolicy::unbounded(Duration::from_secs(1)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rezka_options() {
        let config = BridgeConfig {
            pacing: Duration::ZERO,
            manifest_encoding: ManifestEncoding::Plain,
            ..BridgeConfig::default()
        };
        let options = config.rezka_options();
        assert_eq!(options.pacing, Duration::ZERO);
        assert_eq!(options.encoding, ManifestEncoding::Plain);
        assert_eq!(options.search_candidates, 2);
    }
}
