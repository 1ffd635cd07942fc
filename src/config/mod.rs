//! Configuration module

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address for the proxy
    pub listen: String,

    /// Suppress all header rewriting
    pub transparent: bool,

    /// Route name resolution through a DNSSEC-validating resolver
    #[serde(rename = "use-dnssec")]
    pub use_dnssec: bool,

    /// Idle timeout for client and server channels, in seconds (0 disables)
    #[serde(rename = "idle-timeout-seconds")]
    pub idle_timeout_seconds: u64,

    /// Token appended to Via headers; defaults to the package name
    #[serde(rename = "via-alias")]
    pub via_alias: Option<String>,

    /// Basic proxy authentication; presence enables the 407 gate
    pub auth: Option<AuthConfig>,

    /// Chained upstream proxy
    pub chain: Option<ChainConfig>,

    /// MITM TLS interception
    pub mitm: Option<MitmConfig>,

    /// Log level
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from file (synchronous)
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file (async)
    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            return Err(Error::config("listen address must not be empty"));
        }
        if let Some(ref chain) = self.chain {
            if chain.server.is_empty() {
                return Err(Error::config("chain.server must not be empty"));
            }
            if chain.port == 0 {
                return Err(Error::config("chain.port must not be zero"));
            }
        }
        if let Some(ref auth) = self.auth {
            if auth.username.is_empty() {
                return Err(Error::config("auth.username must not be empty"));
            }
        }
        Ok(())
    }

    pub fn via_alias(&self) -> &str {
        self.via_alias.as_deref().unwrap_or(env!("CARGO_PKG_NAME"))
    }

    pub fn idle_timeout(&self) -> Option<std::time::Duration> {
        if self.idle_timeout_seconds == 0 {
            None
        } else {
            Some(std::time::Duration::from_secs(self.idle_timeout_seconds))
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: "127.0.0.1:8118".to_string(),
            transparent: false,
            use_dnssec: false,
            idle_timeout_seconds: 70,
            via_alias: None,
            auth: None,
            chain: None,
            mitm: None,
            log_level: Some("info".to_string()),
        }
    }
}

/// Basic proxy authentication credentials
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

/// Chained upstream proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub server: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    /// Encrypt the leg to the chained proxy
    pub tls: bool,

    /// Accept any certificate from the chained proxy
    #[serde(rename = "skip-cert-verify")]
    pub skip_cert_verify: bool,

    /// Retry direct when the chained proxy is unreachable
    #[serde(rename = "fallback-to-direct")]
    pub fallback_to_direct: bool,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            server: String::new(),
            port: 0,
            username: None,
            password: None,
            tls: false,
            skip_cert_verify: false,
            fallback_to_direct: true,
        }
    }
}

/// MITM interception configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MitmConfig {
    pub enabled: bool,

    /// PEM files for a persistent CA; generated fresh when absent
    #[serde(rename = "ca-cert")]
    pub ca_cert: Option<String>,
    #[serde(rename = "ca-key")]
    pub ca_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.via_alias(), "relaygate");
        assert!(config.idle_timeout().is_some());
    }

    #[test]
    fn test_parse_yaml() {
        let config = Config::from_str(
            r#"
listen: "0.0.0.0:3128"
transparent: true
idle-timeout-seconds: 0
auth:
  username: user
  password: pass
chain:
  server: upstream.example
  port: 3128
  fallback-to-direct: false
"#,
        )
        .unwrap();
        assert_eq!(config.listen, "0.0.0.0:3128");
        assert!(config.transparent);
        assert!(config.idle_timeout().is_none());
        assert_eq!(config.auth.as_ref().unwrap().username, "user");
        let chain = config.chain.as_ref().unwrap();
        assert_eq!(chain.port, 3128);
        assert!(!chain.fallback_to_direct);
    }

    #[test]
    fn test_invalid_chain_rejected() {
        let result = Config::from_str("chain:\n  server: \"\"\n  port: 0\n");
        assert!(result.is_err());
    }
}
