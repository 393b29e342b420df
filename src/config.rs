//! Peer configuration loading.
//!
//! TOML is the sole config source. All fields are optional in the raw
//! document; missing ones fall back to the same defaults the programmatic
//! `PeerOptions` constructor uses.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub name: String,
    pub friendly: bool,
    pub listen_addr: Option<String>,
    pub preshared_keys: Vec<PresharedKeyConfig>,
}

#[derive(Debug, Clone)]
pub struct PresharedKeyConfig {
    pub id: String,
    pub secret: String,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    name: Option<String>,
    friendly: Option<bool>,
    listen_addr: Option<String>,
    auth: Option<RawAuthConfig>,
}

#[derive(Debug, Deserialize)]
struct RawAuthConfig {
    keys: Option<Vec<RawKeyConfig>>,
}

#[derive(Debug, Deserialize)]
struct RawKeyConfig {
    id: Option<String>,
    secret: Option<String>,
}

/// Loads a [`PeerConfig`] from a TOML file on disk.
pub fn load_config_from_path(path: &Path) -> Result<PeerConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    load_config_from_str(&toml_str)
}

/// Loads a [`PeerConfig`] from an in-memory TOML document (tests pass a
/// literal string rather than writing a temp file).
pub fn load_config_from_str(toml_str: &str) -> Result<PeerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str)?;

    let name = raw
        .name
        .ok_or_else(|| ConfigError::MissingField("name".to_owned()))?;
    if name.trim().is_empty() {
        return Err(ConfigError::InvalidValue("name must not be empty".to_owned()));
    }

    let preshared_keys = match raw.auth.and_then(|a| a.keys) {
        Some(raw_keys) => {
            let mut keys = Vec::with_capacity(raw_keys.len());
            for (i, k) in raw_keys.into_iter().enumerate() {
                let id = k
                    .id
                    .ok_or_else(|| ConfigError::MissingField(format!("auth.keys[{i}].id")))?;
                let secret = k
                    .secret
                    .ok_or_else(|| ConfigError::MissingField(format!("auth.keys[{i}].secret")))?;
                keys.push(PresharedKeyConfig { id, secret });
            }
            keys
        }
        None => Vec::new(),
    };

    Ok(PeerConfig {
        name,
        friendly: raw.friendly.unwrap_or(false),
        listen_addr: raw.listen_addr,
        preshared_keys,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_config_with_defaults() {
        let cfg = load_config_from_str(r#"name = "node-a""#).unwrap();
        assert_eq!(cfg.name, "node-a");
        assert!(!cfg.friendly);
        assert!(cfg.listen_addr.is_none());
        assert!(cfg.preshared_keys.is_empty());
    }

    #[test]
    fn loads_full_config() {
        let toml = r#"
            name = "node-a"
            friendly = true
            listen_addr = "0.0.0.0:9000"

            [[auth.keys]]
            id = "k1"
            secret = "s1"

            [[auth.keys]]
            id = "k2"
            secret = "s2"
        "#;
        let cfg = load_config_from_str(toml).unwrap();
        assert!(cfg.friendly);
        assert_eq!(cfg.listen_addr.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(cfg.preshared_keys.len(), 2);
        assert_eq!(cfg.preshared_keys[0].id, "k1");
    }

    #[test]
    fn missing_name_is_an_error() {
        let err = load_config_from_str("friendly = true").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "name"));
    }

    #[test]
    fn empty_name_is_rejected() {
        let err = load_config_from_str(r#"name = "   ""#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }
}
