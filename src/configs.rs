use crate::generate_proxy_request::{DEFAULT_SUBJECT_COMMON_NAME, RSA_KEY_SIZE_DEFAULT};
use crate::myproxy::DEFAULT_LIFETIME_HOURS;
use crate::validity::{tolerance_window, DEFAULT_TOLERANCE_HOURS};
use anyhow::{bail, Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_PATH: &str = "grid-proxy.toml";
/// Environment variable overriding `proxy.cert_base_dir`
pub const CERTDIR_ENV: &str = "CERTDIR";

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub proxy: ProxySettings,
    #[serde(default)]
    pub ca: Option<CaSettings>,
    #[serde(default)]
    pub myproxy: Option<MyproxySettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxySettings {
    pub cert_base_dir: PathBuf,
    /// CA certificates directory; `<cert_base_dir>/simple_ca` when unset
    #[serde(default)]
    pub ca_dir: Option<PathBuf>,
    #[serde(default = "default_tolerance_hours")]
    pub tolerance_hours: i64,
    #[serde(default = "default_key_size")]
    pub key_size: u32,
    #[serde(default = "default_subject_common_name")]
    pub subject_common_name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaSettings {
    pub base_url: String,
    /// Environment variable holding the bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MyproxySettings {
    pub host: String,
    pub credential_name: String,
    /// Environment variable holding the credential passphrase
    #[serde(default = "default_passphrase_env")]
    pub passphrase_env: String,
    #[serde(default = "default_lifetime_hours")]
    pub lifetime_hours: u32,
}

fn default_tolerance_hours() -> i64 {
    DEFAULT_TOLERANCE_HOURS
}

fn default_key_size() -> u32 {
    RSA_KEY_SIZE_DEFAULT
}

fn default_subject_common_name() -> String {
    DEFAULT_SUBJECT_COMMON_NAME.to_string()
}

fn default_token_env() -> String {
    "GRID_PROXY_CA_TOKEN".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_passphrase_env() -> String {
    "GRID_PROXY_MYPROXY_PASSPHRASE".to_string()
}

fn default_lifetime_hours() -> u32 {
    DEFAULT_LIFETIME_HOURS // one week
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&config_str)
    }

    pub fn from_toml(config_str: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(config_str).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with default path, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = Self::from_file(DEFAULT_CONFIG_PATH)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// `$CERTDIR` takes precedence over the configured base directory
    pub fn apply_env_overrides(&mut self) {
        if let Some(dir) = std::env::var_os(CERTDIR_ENV) {
            self.proxy.cert_base_dir = PathBuf::from(dir);
        }
    }

    fn validate(&self) -> Result<()> {
        tolerance_window(self.proxy.tolerance_hours).context("Invalid proxy.tolerance_hours")?;
        if self.proxy.subject_common_name.is_empty() {
            bail!("proxy.subject_common_name must not be empty");
        }
        Ok(())
    }

    pub fn ca_dir(&self) -> PathBuf {
        self.proxy
            .ca_dir
            .clone()
            .unwrap_or_else(|| self.proxy.cert_base_dir.join(crate::proxy_store::DEFAULT_CA_DIR_NAME))
    }
}

impl CaSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Bearer token, if the configured variable is set
    pub fn token(&self) -> Option<SecretString> {
        std::env::var(&self.token_env).ok().map(SecretString::new)
    }
}

impl MyproxySettings {
    /// Passphrase read from the configured variable
    pub fn passphrase(&self) -> Result<SecretString> {
        std::env::var(&self.passphrase_env)
            .map(SecretString::new)
            .with_context(|| format!("MyProxy passphrase variable {} is not set", self.passphrase_env))
    }
}
