//! TOML-based configuration for the proxy.
//!
//! Read from the platform-appropriate config file unless a path is given:
//! - Windows:  `%APPDATA%\USBProxy\config.toml`
//! - Linux:    `~/.config/usbproxy/config.toml`
//! - macOS:    `~/Library/Application Support/USBProxy/config.toml`
//!
//! Example:
//!
//! ```toml
//! [target]
//! vendor_id = 0x1d50
//! product_id = 0x6089
//!
//! [session]
//! in_poll_timeout_ms = 50
//!
//! [[filters]]
//! kind = "log"
//!
//! [[filters]]
//! kind = "suppress_control_out"
//! request = 0x09
//!
//! [[filters]]
//! kind = "descriptor_override"
//! descriptor_type = 0x01
//! data = [0x12, 0x01, 0x00, 0x02]
//! ```
//!
//! Every field has a default, so an absent file or a file that only names
//! the target is enough to start a session.  Filters are applied in the
//! order they appear.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use usbproxy_core::filter::{
    DescriptorOverrideFilter, LoggingFilter, RequestMatcher, SuppressControlOutFilter,
};
use usbproxy_core::FilterChain;

use crate::application::proxy_session::SessionConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Vendor or product id was given neither in the file nor on the command line.
    #[error("target {0} is not configured")]
    MissingDeviceId(&'static str),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProxyConfig {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
}

/// Which device to proxy and how long native transfers may take.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u16>,
    /// Timeout for control and OUT transfers on the target.
    #[serde(default = "default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
}

/// Session tunables; see [`SessionConfig`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSettings {
    #[serde(default = "default_in_poll_timeout_ms")]
    pub in_poll_timeout_ms: u64,
    #[serde(default = "default_in_transfer_size")]
    pub in_transfer_size: usize,
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
    /// Capacity of the victim event and command channels.
    #[serde(default = "default_event_queue_depth")]
    pub event_queue_depth: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// 0 = info, 1 = debug, 2 or more = trace.
    #[serde(default)]
    pub verbosity: u8,
}

/// One `[[filters]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterSpec {
    Log {
        #[serde(default = "default_log_label")]
        label: String,
    },
    SuppressControlOut {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_type: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<u16>,
    },
    DescriptorOverride {
        descriptor_type: u8,
        #[serde(default)]
        index: u8,
        data: Vec<u8>,
    },
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_transfer_timeout_ms() -> u64 {
    1000
}
fn default_in_poll_timeout_ms() -> u64 {
    100
}
fn default_in_transfer_size() -> usize {
    512
}
fn default_error_backoff_ms() -> u64 {
    250
}
fn default_event_queue_depth() -> usize {
    64
}
fn default_log_label() -> String {
    "log".to_string()
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            vendor_id: None,
            product_id: None,
            transfer_timeout_ms: default_transfer_timeout_ms(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            in_poll_timeout_ms: default_in_poll_timeout_ms(),
            in_transfer_size: default_in_transfer_size(),
            error_backoff_ms: default_error_backoff_ms(),
            event_queue_depth: default_event_queue_depth(),
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

impl ProxyConfig {
    /// The `(vendor_id, product_id)` pair to open.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingDeviceId`] if either id is unset.
    pub fn target_ids(&self) -> Result<(u16, u16), ConfigError> {
        let vendor_id = self
            .target
            .vendor_id
            .ok_or(ConfigError::MissingDeviceId("vendor id"))?;
        let product_id = self
            .target
            .product_id
            .ok_or(ConfigError::MissingDeviceId("product id"))?;
        Ok((vendor_id, product_id))
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.target.transfer_timeout_ms)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            in_poll_timeout: Duration::from_millis(self.session.in_poll_timeout_ms),
            in_transfer_size: self.session.in_transfer_size.max(1),
            error_backoff: Duration::from_millis(self.session.error_backoff_ms),
        }
    }

    /// Builds a fresh chain from the `[[filters]]` entries, in file order.
    pub fn build_filter_chain(&self) -> FilterChain {
        self.filters.iter().map(FilterSpec::build).collect()
    }
}

impl FilterSpec {
    fn build(&self) -> Box<dyn usbproxy_core::Filter> {
        match self {
            FilterSpec::Log { label } => Box::new(LoggingFilter::new(label.clone())),
            FilterSpec::SuppressControlOut {
                request_type,
                request,
                value,
                index,
            } => Box::new(SuppressControlOutFilter::new(RequestMatcher {
                request_type: *request_type,
                request: *request,
                value: *value,
                index: *index,
            })),
            FilterSpec::DescriptorOverride {
                descriptor_type,
                index,
                data,
            } => Box::new(DescriptorOverrideFilter::new(
                *descriptor_type,
                *index,
                data.clone(),
            )),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(platform_config_dir()
        .ok_or(ConfigError::NoPlatformConfigDir)?
        .join("config.toml"))
}

/// Loads the config from the default location.
///
/// # Errors
///
/// See [`load_config_from`].
pub fn load_config() -> Result<ProxyConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads the config at `path`, returning `ProxyConfig::default()` if the
/// file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<ProxyConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ProxyConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(config: &ProxyConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("USBProxy"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("usbproxy"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("USBProxy")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_session_defaults() {
        // Arrange / Act
        let cfg = ProxyConfig::default();

        // Assert
        assert_eq!(cfg.session_config(), SessionConfig::default());
        assert_eq!(cfg.transfer_timeout(), Duration::from_millis(1000));
        assert_eq!(cfg.session.event_queue_depth, 64);
        assert_eq!(cfg.logging.verbosity, 0);
        assert!(cfg.filters.is_empty());
    }

    #[test]
    fn test_missing_ids_are_reported() {
        let mut cfg = ProxyConfig::default();
        assert!(matches!(
            cfg.target_ids(),
            Err(ConfigError::MissingDeviceId("vendor id"))
        ));

        cfg.target.vendor_id = Some(0x1d50);
        assert!(matches!(
            cfg.target_ids(),
            Err(ConfigError::MissingDeviceId("product id"))
        ));

        cfg.target.product_id = Some(0x6089);
        assert_eq!(cfg.target_ids().unwrap(), (0x1d50, 0x6089));
    }

    #[test]
    fn test_parses_hex_ids_and_partial_sections() {
        let toml_str = r#"
            [target]
            vendor_id = 0x1d50
            product_id = 0x6089

            [session]
            in_poll_timeout_ms = 20
        "#;

        let cfg: ProxyConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.target_ids().unwrap(), (0x1d50, 0x6089));
        assert_eq!(cfg.session.in_poll_timeout_ms, 20);
        assert_eq!(cfg.session.in_transfer_size, 512);
        assert_eq!(cfg.target.transfer_timeout_ms, 1000);
    }

    #[test]
    fn test_filters_are_built_in_file_order() {
        // Arrange
        let toml_str = r#"
            [[filters]]
            kind = "suppress_control_out"
            request = 0x09

            [[filters]]
            kind = "log"
            label = "wire"

            [[filters]]
            kind = "descriptor_override"
            descriptor_type = 1
            data = [0x12, 0x01]
        "#;

        // Act
        let cfg: ProxyConfig = toml::from_str(toml_str).unwrap();
        let chain = cfg.build_filter_chain();

        // Assert
        assert_eq!(
            cfg.filters[0],
            FilterSpec::SuppressControlOut {
                request_type: None,
                request: Some(0x09),
                value: None,
                index: None,
            }
        );
        assert_eq!(
            chain.names(),
            vec!["suppress_control_out", "wire", "descriptor_override"]
        );
    }

    #[test]
    fn test_unknown_filter_kind_is_a_parse_error() {
        let result: Result<ProxyConfig, _> = toml::from_str("[[filters]]\nkind = \"teleport\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_missing_file_returns_default() {
        let path = std::env::temp_dir().join(format!("usbproxy-missing-{}.toml", uuid::Uuid::new_v4()));

        let cfg = load_config_from(&path).unwrap();

        assert_eq!(cfg, ProxyConfig::default());
    }

    #[test]
    fn test_save_then_load_preserves_config() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("usbproxy-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.toml");
        let mut cfg = ProxyConfig::default();
        cfg.target.vendor_id = Some(0x046d);
        cfg.target.product_id = Some(0xc52b);
        cfg.filters.push(FilterSpec::Log {
            label: "log".into(),
        });

        // Act
        save_config_to(&cfg, &path).unwrap();
        let restored = load_config_from(&path).unwrap();

        // Assert
        assert_eq!(restored, cfg);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_malformed_file_is_a_parse_error() {
        let dir = std::env::temp_dir().join(format!("usbproxy-bad-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[target\nvendor_id = ").unwrap();

        let result = load_config_from(&path);

        assert!(matches!(result, Err(ConfigError::Parse(_))));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
