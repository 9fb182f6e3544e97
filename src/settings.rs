//! Settings file.
//!
//! [`Settings`] is what a server reads from a TOML file, it is turned
//! into a [`DavConfig`] with [`Settings::apply`]. Every key is optional:
//!
//! ```toml
//! prefix = "/remote.php"
//! files_namespace = "/users/{username}"
//! public_url = "https://cloud.example.org"
//! enable_http_tpc = true
//! perf_marker_interval = 5
//!
//! [name_validation]
//! invalid_chars = ["\\", "\n"]
//! max_length = 255
//! ```
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::davhandler::DavConfig;
use crate::router::StatusInfo;
use crate::util::NameValidation;

/// Error loading a settings file.
#[derive(Debug)]
pub enum SettingsError {
    Read(std::io::Error),
    Parse(toml::de::Error),
}

impl std::error::Error for SettingsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SettingsError::Read(e) => Some(e),
            SettingsError::Parse(e) => Some(e),
        }
    }
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SettingsError::Read(e) => write!(f, "failed to read settings: {}", e),
            SettingsError::Parse(e) => write!(f, "failed to parse settings: {}", e),
        }
    }
}

impl From<std::io::Error> for SettingsError {
    fn from(e: std::io::Error) -> Self {
        SettingsError::Read(e)
    }
}

impl From<toml::de::Error> for SettingsError {
    fn from(e: toml::de::Error) -> Self {
        SettingsError::Parse(e)
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct NameValidationSettings {
    pub invalid_chars: Option<Vec<String>>,
    pub max_length: Option<usize>,
}

/// Product strings in `status.php` and the capabilities.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProductSettings {
    pub version: Option<String>,
    pub versionstring: Option<String>,
    pub product: Option<String>,
    pub edition: Option<String>,
}

/// Handler settings.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub prefix: Option<String>,
    pub files_namespace: Option<String>,
    pub webdav_namespace: Option<String>,
    pub public_url: Option<String>,
    pub machine_auth_api_key: Option<String>,
    pub enable_http_tpc: Option<bool>,
    /// In seconds.
    pub perf_marker_interval: Option<u64>,
    pub allow_propfind_depth_infinity: Option<bool>,
    /// In seconds.
    pub user_cache_ttl: Option<u64>,
    pub name_validation: NameValidationSettings,
    pub product: ProductSettings,
}

impl Settings {
    /// Parse settings from a TOML string.
    pub fn from_toml(s: &str) -> Result<Settings, SettingsError> {
        Ok(toml::from_str(s)?)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Settings, SettingsError> {
        let data = std::fs::read_to_string(path)?;
        Settings::from_toml(&data)
    }

    /// Set everything that is present on `cfg`.
    pub fn apply(&self, mut cfg: DavConfig) -> DavConfig {
        if let Some(ref p) = self.prefix {
            cfg = cfg.strip_prefix(p.as_str());
        }
        if let Some(ref ns) = self.files_namespace {
            cfg = cfg.files_namespace(ns.as_str());
        }
        if let Some(ref ns) = self.webdav_namespace {
            cfg = cfg.webdav_namespace(ns.as_str());
        }
        if let Some(ref url) = self.public_url {
            cfg = cfg.public_url(url.as_str());
        }
        if let Some(ref key) = self.machine_auth_api_key {
            cfg = cfg.machine_auth_api_key(key.as_str());
        }
        if let Some(tpc) = self.enable_http_tpc {
            cfg = cfg.enable_http_tpc(tpc);
        }
        if let Some(secs) = self.perf_marker_interval {
            cfg = cfg.perf_marker_interval(Duration::from_secs(secs));
        }
        if let Some(allow) = self.allow_propfind_depth_infinity {
            cfg = cfg.allow_propfind_depth_infinity(allow);
        }
        if let Some(secs) = self.user_cache_ttl {
            cfg = cfg.user_cache_ttl(Duration::from_secs(secs));
        }

        let nv = &self.name_validation;
        if nv.invalid_chars.is_some() || nv.max_length.is_some() {
            let mut v = NameValidation::default();
            if let Some(ref chars) = nv.invalid_chars {
                v.invalid_chars = chars.clone();
            }
            if let Some(max) = nv.max_length {
                v.max_length = max;
            }
            cfg = cfg.name_validation(v);
        }

        let p = &self.product;
        if p != &ProductSettings::default() {
            let mut status = StatusInfo::default();
            if let Some(ref v) = p.version {
                status.version = v.clone();
            }
            if let Some(ref v) = p.versionstring {
                status.versionstring = v.clone();
                status.productversion = v.clone();
            }
            if let Some(ref v) = p.product {
                status.product = v.clone();
                status.productname = v.clone();
            }
            if let Some(ref v) = p.edition {
                status.edition = v.clone();
            }
            cfg = cfg.status(status);
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        let s = Settings::from_toml(
            r#"
            prefix = "/remote.php"
            enable_http_tpc = true
            perf_marker_interval = 2

            [name_validation]
            max_length = 10

            [product]
            edition = "enterprise"
            "#,
        )
        .unwrap();
        assert_eq!(s.prefix.as_deref(), Some("/remote.php"));
        assert_eq!(s.enable_http_tpc, Some(true));
        assert_eq!(s.perf_marker_interval, Some(2));
        assert_eq!(s.name_validation.max_length, Some(10));
        assert!(s.name_validation.invalid_chars.is_none());
        assert_eq!(s.product.edition.as_deref(), Some("enterprise"));

        let cfg = s.apply(DavConfig::new());
        assert_eq!(cfg.prefix.as_deref(), Some("/remote.php"));
        assert_eq!(cfg.perf_marker_interval, Some(Duration::from_secs(2)));
        let nv = cfg.name_validation.unwrap();
        assert_eq!(nv.max_length, 10);
        assert_eq!(nv.invalid_chars, NameValidation::default().invalid_chars);
        assert_eq!(cfg.status.unwrap().edition, "enterprise");
    }

    #[test]
    fn empty_and_bad() {
        assert_eq!(Settings::from_toml("").unwrap(), Settings::default());
        assert!(matches!(
            Settings::from_toml("enable_http_tpc = 3"),
            Err(SettingsError::Parse(_))
        ));
    }
}
