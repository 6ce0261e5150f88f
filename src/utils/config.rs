//! Configuration management for the IPMSG engine.
//!
//! This module provides TOML-based configuration with support for multiple
//! configuration sources (default, file-based, environment variables) and
//! validation of configuration parameters.

use crate::crypto::asymmetric::RsaSize;
use crate::crypto::passphrase::PassphraseHash;
use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "ipmsg.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "IPMSG";

/// Directory name under the platform data and config dirs
pub const APP_DIR_NAME: &str = "ipmsg-engine";

/// Complete configuration for the messenger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpmsgConfig {
    /// Who we are on the LAN
    pub identity: IdentityConfig,
    /// Socket and broadcast settings
    pub network: NetworkConfig,
    /// Delivery acknowledgement and retries
    pub delivery: DeliveryConfig,
    /// Encryption settings
    pub crypto: CryptoConfig,
    /// Host-list exchange policy
    pub hostlist: HostListConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Local identity advertised in entry packets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Login name in the packet header
    pub user: String,
    /// Host name in the packet header
    pub host: String,
    /// Display name
    pub nickname: String,
    /// Group name
    pub group: String,
}

/// Network configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP port, shared by every IPMSG client on the LAN
    pub port: u16,
    /// Local address to bind
    pub bind_address: IpAddr,
    /// Where BR_* packets are sent
    pub broadcast_addresses: Vec<IpAddr>,
    /// Receive buffer size in bytes
    pub max_packet_size: usize,
}

/// Delivery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Resends before a message is reported undeliverable
    pub retry_count: u32,
    /// Seconds between resends
    pub retry_interval_secs: u64,
    /// Milliseconds between retry sweeps
    pub sweep_tick_ms: u64,
}

/// Cryptographic configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Advertise encryption and fetch peer keys
    pub enabled: bool,
    /// Prefer the fastest common cipher and digest
    pub prefer_speed: bool,
    /// RSA slot sizes in bits
    pub rsa_key_sizes: Vec<usize>,
    /// `$10$...` hash of the passphrase protecting private keys
    pub passphrase_hash: Option<String>,
    /// GETPUBKEY attempts before giving up on a peer key
    pub pubkey_wait_retries: u32,
    /// Milliseconds between GETPUBKEY attempts
    pub pubkey_wait_ms: u64,
}

/// Host-list configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostListConfig {
    /// Answer other clients' host-list requests
    pub serve: bool,
    /// Ask for host lists at startup
    pub want: bool,
    /// Entries per ANSLIST page
    pub page_size: usize,
}

/// Storage and persistence configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory for data storage
    pub data_dir: PathBuf,
    /// Directory for storing keys
    pub keys_dir: PathBuf,
    /// Single-instance lock file
    pub lock_file: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log message traffic under the `ipmsg::messages` target
    pub log_messages: bool,
}

fn env_or(vars: &[&str], fallback: &str) -> String {
    vars.iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| fallback.to_string())
}

impl Default for IdentityConfig {
    fn default() -> Self {
        let user = env_or(&["USER", "USERNAME", "LOGNAME"], "ipmsg");
        Self {
            host: env_or(&["HOSTNAME", "COMPUTERNAME"], "localhost"),
            nickname: user.clone(),
            user,
            group: String::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: crate::defaults::DEFAULT_PORT,
            bind_address: IpAddr::from([0, 0, 0, 0]),
            broadcast_addresses: vec![IpAddr::from([255, 255, 255, 255])],
            max_packet_size: crate::transport::protocol::MAX_UDP_BUFFER,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry_count: crate::defaults::DEFAULT_RETRY_COUNT,
            retry_interval_secs: crate::defaults::DEFAULT_RETRY_INTERVAL_SECS,
            sweep_tick_ms: 1000,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefer_speed: false,
            rsa_key_sizes: vec![512, 1024, 2048],
            passphrase_hash: None,
            pubkey_wait_retries: crate::defaults::DEFAULT_PUBKEY_MAX_RETRY,
            pubkey_wait_ms: crate::defaults::DEFAULT_PUBKEY_WAIT_MS,
        }
    }
}

impl Default for HostListConfig {
    fn default() -> Self {
        Self {
            serve: true,
            want: false,
            page_size: crate::defaults::DEFAULT_HOSTLIST_PAGE_SIZE,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR_NAME);

        Self {
            keys_dir: data_dir.join("keys"),
            lock_file: data_dir.join("ipmsg.lock"),
            data_dir,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_messages: true,
        }
    }
}

impl CryptoConfig {
    /// Configured RSA slots
    ///
    /// # Errors
    ///
    /// `Config` if a size is not 512, 1024 or 2048.
    pub fn rsa_sizes(&self) -> Result<Vec<RsaSize>> {
        self.rsa_key_sizes
            .iter()
            .map(|&bits| {
                RsaSize::from_bits(bits).ok_or_else(|| {
                    ConfigError::InvalidValue {
                        field: "crypto.rsa_key_sizes".to_string(),
                        value: bits.to_string(),
                    }
                    .into()
                })
            })
            .collect()
    }

    /// Parsed passphrase hash, if one is configured
    ///
    /// # Errors
    ///
    /// `Config` if the string is not a valid `$10$` hash.
    pub fn passphrase(&self) -> Result<Option<PassphraseHash>> {
        self.passphrase_hash
            .as_deref()
            .map(|text| {
                PassphraseHash::parse(text).map_err(|e| {
                    ConfigError::InvalidValue {
                        field: "crypto.passphrase_hash".to_string(),
                        value: e.to_string(),
                    }
                    .into()
                })
            })
            .transpose()
    }

    /// Delay between GETPUBKEY attempts
    pub fn pubkey_wait(&self) -> Duration {
        Duration::from_millis(self.pubkey_wait_ms)
    }
}

impl DeliveryConfig {
    /// Time between resends
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    /// Time between sweeps
    pub fn sweep_tick(&self) -> Duration {
        Duration::from_millis(self.sweep_tick_ms)
    }
}

impl IpmsgConfig {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    ///
    /// # Errors
    ///
    /// Returns error if a file exists but is invalid, or an environment
    /// override cannot be parsed
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            config = Self::from_file(path)?;
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(APP_DIR_NAME)
                    .join(DEFAULT_CONFIG_FILE),
            ];

            if let Some(location) = default_locations.iter().find(|l| l.exists()) {
                log::debug!("Using configuration file {}", location.display());
                config = Self::from_file(location)?;
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if serialization or the write fails
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Override fields from `IPMSG_*` environment variables
    fn merge_from_env(self) -> Result<Self> {
        self.merge_overrides(|key| std::env::var(key).ok())
    }

    /// Override fields from `IPMSG_*` variables resolved through `lookup`
    fn merge_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parsed<T: std::str::FromStr>(entry: Option<(String, String)>) -> Result<Option<T>> {
            match entry {
                None => Ok(None),
                Some((key, value)) => value
                    .parse()
                    .map(Some)
                    .map_err(|_| ConfigError::InvalidValue { field: key, value }.into()),
            }
        }
        let var = |name: &str| {
            let key = format!("{ENV_PREFIX}_{name}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some(port) = parsed(var("NETWORK_PORT"))? {
            self.network.port = port;
        }
        if let Some(addr) = parsed(var("NETWORK_BIND_ADDRESS"))? {
            self.network.bind_address = addr;
        }
        if let Some((_, user)) = var("IDENTITY_USER") {
            self.identity.user = user;
        }
        if let Some((_, host)) = var("IDENTITY_HOST") {
            self.identity.host = host;
        }
        if let Some((_, nickname)) = var("IDENTITY_NICKNAME") {
            self.identity.nickname = nickname;
        }
        if let Some((_, group)) = var("IDENTITY_GROUP") {
            self.identity.group = group;
        }
        if let Some(enabled) = parsed(var("CRYPTO_ENABLED"))? {
            self.crypto.enabled = enabled;
        }
        if let Some((_, level)) = var("LOGGING_LEVEL") {
            self.logging.level = level;
        }
        if let Some((_, data_dir)) = var("STORAGE_DATA_DIR") {
            let data_dir = PathBuf::from(data_dir);
            self.storage.keys_dir = data_dir.join("keys");
            self.storage.lock_file = data_dir.join("ipmsg.lock");
            self.storage.data_dir = data_dir;
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    ///
    /// # Errors
    ///
    /// `Config` naming the first invalid field
    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, value: String| -> Result<()> {
            Err(ConfigError::InvalidValue {
                field: field.to_string(),
                value,
            }
            .into())
        };

        for (field, value) in [
            ("identity.user", &self.identity.user),
            ("identity.host", &self.identity.host),
        ] {
            if value.is_empty() || value.contains(':') {
                return invalid(field, value.clone());
            }
        }
        if self.identity.nickname.contains('\0') || self.identity.group.contains('\0') {
            return invalid("identity.nickname", self.identity.nickname.clone());
        }

        if self.network.port == 0 {
            return invalid("network.port", "0".to_string());
        }
        if self.network.broadcast_addresses.is_empty() {
            return invalid("network.broadcast_addresses", "[]".to_string());
        }
        let packet_range =
            crate::transport::protocol::MIN_UDP_BUFFER..=crate::transport::protocol::MAX_UDP_BUFFER;
        if !packet_range.contains(&self.network.max_packet_size) {
            return invalid("network.max_packet_size", self.network.max_packet_size.to_string());
        }

        if self.delivery.retry_interval_secs == 0 {
            return invalid("delivery.retry_interval_secs", "0".to_string());
        }
        if self.delivery.sweep_tick_ms == 0 {
            return invalid("delivery.sweep_tick_ms", "0".to_string());
        }

        if self.crypto.enabled && self.crypto.rsa_key_sizes.is_empty() {
            return invalid("crypto.rsa_key_sizes", "[]".to_string());
        }
        self.crypto.rsa_sizes()?;
        self.crypto.passphrase()?;

        if self.hostlist.page_size == 0 {
            return invalid("hostlist.page_size", "0".to_string());
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return invalid("logging.level", self.logging.level.clone()),
        }

        Ok(())
    }

    /// Ensure all required directories exist
    ///
    /// The key directory is left to the key store, which creates it with
    /// restricted permissions.
    ///
    /// # Errors
    ///
    /// `Config` if the data directory cannot be created
    pub fn ensure_directories(&self) -> Result<()> {
        let dir = &self.storage.data_dir;
        if !dir.exists() {
            std::fs::create_dir_all(dir).map_err(|_| ConfigError::DirectoryCreation {
                path: dir.display().to_string(),
            })?;
        }
        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}
