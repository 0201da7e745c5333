mod error;

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub use error::Error;

use crate::driver::fs::FsConfig;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "ServerConfig::default_bind_address")]
    pub bind_address: String,
    #[serde(default = "ServerConfig::default_port")]
    pub port: u16,
}

impl ServerConfig {
    fn default_bind_address() -> String {
        "0.0.0.0".to_string()
    }

    fn default_port() -> u16 {
        5000
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: Self::default_bind_address(),
            port: Self::default_port(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct StorageConfig {
    /// Filesystem backend; the in-memory driver is used when absent.
    #[serde(default)]
    pub fs: Option<FsConfig>,
    #[serde(default)]
    pub delete: DeleteConfig,
    #[serde(default)]
    pub redirect: RedirectConfig,
    #[serde(default)]
    pub readonly: ReadOnlyConfig,
    #[serde(default)]
    pub tag: TagConfig,
    #[serde(default)]
    pub upload_purging: UploadPurgeConfig,
}

#[derive(Clone, Debug)]
pub enum StorageBackendConfig {
    Fs(FsConfig),
    Memory,
}

impl StorageConfig {
    pub fn backend(&self) -> StorageBackendConfig {
        match &self.fs {
            Some(fs_config) => StorageBackendConfig::Fs(fs_config.clone()),
            None => StorageBackendConfig::Memory,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DeleteConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RedirectConfig {
    #[serde(default)]
    pub disable: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ReadOnlyConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TagConfig {
    #[serde(default = "TagConfig::default_concurrency_limit")]
    pub concurrency_limit: usize,
}

impl TagConfig {
    fn default_concurrency_limit() -> usize {
        8
    }
}

impl Default for TagConfig {
    fn default() -> Self {
        TagConfig {
            concurrency_limit: Self::default_concurrency_limit(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct UploadPurgeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "UploadPurgeConfig::default_age", with = "duration")]
    pub age: Duration,
    #[serde(default = "UploadPurgeConfig::default_interval", with = "duration")]
    pub interval: Duration,
    #[serde(default)]
    pub dry_run: bool,
}

impl UploadPurgeConfig {
    fn default_age() -> Duration {
        Duration::from_secs(168 * 3600)
    }

    fn default_interval() -> Duration {
        Duration::from_secs(24 * 3600)
    }
}

impl Default for UploadPurgeConfig {
    fn default() -> Self {
        UploadPurgeConfig {
            enabled: true,
            age: Self::default_age(),
            interval: Self::default_interval(),
            dry_run: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum CacheConfig {
    Memory {
        #[serde(default = "default_cache_size")]
        size: usize,
    },
    Redis {
        url: String,
        #[serde(default)]
        key_prefix: String,
    },
}

fn default_cache_size() -> usize {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::Memory {
            size: default_cache_size(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub manifest_urls: UrlPolicyConfig,
    #[serde(default)]
    pub indexes: IndexValidationConfig,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        ValidationConfig {
            enabled: true,
            manifest_urls: UrlPolicyConfig::default(),
            indexes: IndexValidationConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct UrlPolicyConfig {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct IndexValidationConfig {
    #[serde(default)]
    pub platforms: IndexPlatformPolicy,
    #[serde(default)]
    pub platform_list: Vec<PlatformConfig>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum IndexPlatformPolicy {
    #[default]
    All,
    List,
    None,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct PlatformConfig {
    pub architecture: String,
    pub os: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProxyConfig {
    pub remote_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "ProxyConfig::default_ttl", with = "duration")]
    pub ttl: Duration,
}

impl ProxyConfig {
    fn default_ttl() -> Duration {
        Duration::from_secs(168 * 3600)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct HttpConfig {
    /// Shared secret for signing upload session state. Generated (and
    /// logged as a warning) when absent.
    #[serde(default)]
    pub secret: Option<String>,
}

impl HttpConfig {
    pub fn resolve_secret(&self) -> String {
        match &self.secret {
            Some(secret) => secret.clone(),
            None => {
                let secret: [u8; 32] = rand::random();
                tracing::warn!(
                    "No HTTP secret configured, generated a random one; \
                     upload resumption will not work across a fleet"
                );
                hex::encode(secret)
            }
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AuthConfig {
    /// Identities allowed to access the registry; empty means
    /// anonymous access is granted everything.
    #[serde(default)]
    pub identity: HashMap<String, IdentityConfig>,
    #[serde(default = "AuthConfig::default_realm")]
    pub realm: String,
}

impl AuthConfig {
    fn default_realm() -> String {
        "Registry Realm".to_string()
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct IdentityConfig {
    pub username: String,
    /// Argon2 PHC string, as produced by `argon2` tooling.
    pub password_hash: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub endpoints: Vec<NotificationEndpointConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NotificationEndpointConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "NotificationEndpointConfig::default_timeout", with = "duration")]
    pub timeout: Duration,
    #[serde(default = "NotificationEndpointConfig::default_threshold")]
    pub threshold: u32,
    #[serde(default = "NotificationEndpointConfig::default_backoff", with = "duration")]
    pub backoff: Duration,
    #[serde(default = "NotificationEndpointConfig::default_queue_size")]
    pub queue_size: usize,
}

impl NotificationEndpointConfig {
    fn default_timeout() -> Duration {
        Duration::from_secs(5)
    }

    fn default_threshold() -> u32 {
        3
    }

    fn default_backoff() -> Duration {
        Duration::from_secs(1)
    }

    fn default_queue_size() -> usize {
        100
    }
}

fn default_true() -> bool {
    true
}

impl Configuration {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let content = fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    pub fn load_from_str(content: &str) -> Result<Self, Error> {
        let config: Configuration =
            toml::from_str(content).map_err(|e| Error::Format(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if let Some(proxy) = &self.proxy {
            if proxy.remote_url.is_empty() {
                return Err(Error::Proxy("remote_url must not be empty".to_string()));
            }
        }
        Ok(())
    }
}

/// Go-style duration strings: `168h`, `30m`, `10s`, `1h30m`.
pub mod duration {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        parse(&text).ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {text}")))
    }

    pub fn parse(text: &str) -> Option<Duration> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let mut total = 0u64;
        let mut digits = String::new();

        for c in text.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
            } else {
                let value: u64 = digits.parse().ok()?;
                digits.clear();
                total += match c {
                    'h' => value.checked_mul(3600)?,
                    'm' => value.checked_mul(60)?,
                    's' => value,
                    _ => return None,
                };
            }
        }

        if !digits.is_empty() {
            // bare numbers are seconds
            total += digits.parse::<u64>().ok()?;
        }

        Some(Duration::from_secs(total))
    }
}
