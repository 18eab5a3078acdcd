//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The HTTP portal API key is loaded from BROKER_PORTAL_API_KEY or
//! api_key_file, never stored in the TOML directly to avoid leaking secrets.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use acquisition::{
    AcquisitionConfig, CacheConfig, Jitter, LimitsConfig, LoginConfig, OrchestrationConfig,
    RetryConfig,
};
use common::Secret;
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub stores: StoresConfig,
    pub portal: PortalConfig,
    #[serde(default)]
    pub login: LoginSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub orchestration: OrchestrationSection,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

/// File locations for the persistent stores
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoresConfig {
    pub credentials_path: PathBuf,
    pub tokens_path: PathBuf,
    pub history_path: PathBuf,
}

impl Default for StoresConfig {
    fn default() -> Self {
        Self {
            credentials_path: PathBuf::from("credentials.json"),
            tokens_path: PathBuf::from("tokens.json"),
            history_path: PathBuf::from("history.jsonl"),
        }
    }
}

/// Which login portal drives logins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortalKind {
    Command,
    Http,
}

#[derive(Debug, Deserialize)]
pub struct PortalConfig {
    pub kind: PortalKind,
    /// Automation program for the command portal
    #[serde(default)]
    pub command: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Login endpoint for the HTTP portal
    #[serde(default)]
    pub login_url: Option<String>,
    /// Per-attempt limit; a command still running at this point is killed
    #[serde(default = "default_portal_timeout")]
    pub timeout_secs: u64,
    #[serde(skip)]
    pub api_key: Option<Secret<String>>,
    /// Path to a file containing the API key (alternative to BROKER_PORTAL_API_KEY)
    #[serde(default)]
    pub api_key_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoginSection {
    pub max_network_retries: u32,
    pub network_base_delay_ms: u64,
    pub max_captcha_retries: u32,
    pub captcha_retry_delay_ms: u64,
    pub login_timeout_secs: u64,
}

impl Default for LoginSection {
    fn default() -> Self {
        let d = LoginConfig::default();
        Self {
            max_network_retries: d.max_network_retries,
            network_base_delay_ms: d.network_base_delay.as_millis() as u64,
            max_captcha_retries: d.max_captcha_retries,
            captcha_retry_delay_ms: d.captcha_retry_delay.as_millis() as u64,
            login_timeout_secs: d.login_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterKind {
    None,
    Full,
    Equal,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    pub total_timeout_secs: u64,
    pub not_found_delay_ms: u64,
    pub jitter: JitterKind,
}

impl Default for RetrySection {
    fn default() -> Self {
        let d = RetryConfig::default();
        Self {
            max_retries: d.max_retries,
            base_delay_ms: d.base_delay.as_millis() as u64,
            factor: d.factor,
            max_delay_ms: d.max_delay.as_millis() as u64,
            total_timeout_secs: d.total_timeout.as_secs(),
            not_found_delay_ms: d.not_found_delay.as_millis() as u64,
            jitter: JitterKind::None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub max_global: usize,
    pub max_per_site: usize,
    pub max_per_account: usize,
    pub max_queue_length: usize,
    pub queue_timeout_secs: u64,
    pub lock_timeout_secs: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        let d = LimitsConfig::default();
        Self {
            max_global: d.max_global,
            max_per_site: d.max_per_site,
            max_per_account: d.max_per_account,
            max_queue_length: d.max_queue_length,
            queue_timeout_secs: d.queue_timeout.as_secs(),
            lock_timeout_secs: d.lock_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub default_token_ttl_secs: u64,
    pub expiry_margin_secs: u64,
    pub credential_list_ttl_secs: u64,
    pub blacklist_ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        let d = CacheConfig::default();
        Self {
            default_token_ttl_secs: d.default_token_ttl.as_secs(),
            expiry_margin_secs: d.expiry_margin.as_secs(),
            credential_list_ttl_secs: d.credential_list_ttl.as_secs(),
            blacklist_ttl_secs: d.blacklist_ttl.as_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OrchestrationSection {
    pub acquisition_timeout_secs: u64,
    pub race_recheck_grace_ms: u64,
}

impl Default for OrchestrationSection {
    fn default() -> Self {
        let d = OrchestrationConfig::default();
        Self {
            acquisition_timeout_secs: d.acquisition_timeout.as_secs(),
            race_recheck_grace_ms: d.race_recheck_grace.as_millis() as u64,
        }
    }
}

fn default_max_connections() -> usize {
    256
}

fn default_drain_timeout() -> u64 {
    5
}

fn default_portal_timeout() -> u64 {
    60
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Overrides:
    /// - BROKER_LISTEN_ADDR replaces `server.listen_addr`
    /// - BROKER_PORTAL_COMMAND replaces `portal.command`
    ///
    /// API key resolution order:
    /// 1. BROKER_PORTAL_API_KEY env var
    /// 2. api_key_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(addr) = std::env::var("BROKER_LISTEN_ADDR") {
            config.server.listen_addr = addr.parse().map_err(|e| common::Error::Env {
                var: "BROKER_LISTEN_ADDR",
                reason: format!("{e}"),
            })?;
        }
        if let Ok(command) = std::env::var("BROKER_PORTAL_COMMAND") {
            config.portal.command = Some(PathBuf::from(command));
        }

        if let Ok(key) = std::env::var("BROKER_PORTAL_API_KEY") {
            config.portal.api_key = Some(Secret::new(key));
        } else if let Some(ref key_file) = config.portal.api_key_file {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read api_key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.portal.api_key = Some(Secret::new(key));
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        match self.portal.kind {
            PortalKind::Command if self.portal.command.is_none() => {
                return Err(common::Error::Config(
                    "portal.command is required for the command portal".into(),
                ));
            }
            PortalKind::Http => match self.portal.login_url.as_deref() {
                Some(url) if url.starts_with("http://") || url.starts_with("https://") => {}
                Some(url) => {
                    return Err(common::Error::Config(format!(
                        "login_url must start with http:// or https://, got: {url}"
                    )));
                }
                None => {
                    return Err(common::Error::Config(
                        "portal.login_url is required for the http portal".into(),
                    ));
                }
            },
            PortalKind::Command => {}
        }
        if self.portal.timeout_secs == 0 {
            return Err(common::Error::Config(
                "portal.timeout_secs must be greater than 0".into(),
            ));
        }
        self.acquisition()
            .validate()
            .map_err(|e| common::Error::Config(e.to_string()))
    }

    /// Assemble the immutable acquisition configuration.
    pub fn acquisition(&self) -> AcquisitionConfig {
        AcquisitionConfig {
            login: LoginConfig {
                max_network_retries: self.login.max_network_retries,
                network_base_delay: Duration::from_millis(self.login.network_base_delay_ms),
                max_captcha_retries: self.login.max_captcha_retries,
                captcha_retry_delay: Duration::from_millis(self.login.captcha_retry_delay_ms),
                login_timeout: Duration::from_secs(self.login.login_timeout_secs),
            },
            retry: RetryConfig {
                max_retries: self.retry.max_retries,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                factor: self.retry.factor,
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                total_timeout: Duration::from_secs(self.retry.total_timeout_secs),
                not_found_delay: Duration::from_millis(self.retry.not_found_delay_ms),
                jitter: match self.retry.jitter {
                    JitterKind::None => Jitter::None,
                    JitterKind::Full => Jitter::Full,
                    JitterKind::Equal => Jitter::Equal,
                },
            },
            limits: LimitsConfig {
                max_global: self.limits.max_global,
                max_per_site: self.limits.max_per_site,
                max_per_account: self.limits.max_per_account,
                max_queue_length: self.limits.max_queue_length,
                queue_timeout: Duration::from_secs(self.limits.queue_timeout_secs),
                lock_timeout: Duration::from_secs(self.limits.lock_timeout_secs),
            },
            cache: CacheConfig {
                default_token_ttl: Duration::from_secs(self.cache.default_token_ttl_secs),
                expiry_margin: Duration::from_secs(self.cache.expiry_margin_secs),
                credential_list_ttl: Duration::from_secs(self.cache.credential_list_ttl_secs),
                blacklist_ttl: Duration::from_secs(self.cache.blacklist_ttl_secs),
            },
            orchestration: OrchestrationConfig {
                acquisition_timeout: Duration::from_secs(
                    self.orchestration.acquisition_timeout_secs,
                ),
                race_recheck_grace: Duration::from_millis(self.orchestration.race_recheck_grace_ms),
            },
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("token-broker.toml")
    }
}
