//! Configuration: the daemon's own settings, and the INI-style layer
//! configuration format described in spec §6.
//!
//! Resolution order for the daemon config mirrors the teacher workspace's
//! convention: environment variables → config file → defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::{Layer, LayerKind};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuxtondConfig {
    pub socket: SocketConfig,
    pub storage: StorageConfig,
    pub access: AccessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// UNIX socket path. Empty = compiled-in default.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory layer config files (`*.conf`) are read from.
    pub layer_dir: PathBuf,
    /// Root directory persistent backends write their `.db` files under.
    pub db_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Path to the Smack-style rule file consumed by `AccessRules`.
    pub rule_file: PathBuf,
    /// How often the daemon polls the rule file for changes.
    pub rule_reload_interval_secs: u64,
}

impl Default for BuxtondConfig {
    fn default() -> Self {
        Self {
            socket: SocketConfig::default(),
            storage: StorageConfig::default(),
            access: AccessConfig::default(),
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/run/buxton/socket"),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            layer_dir: PathBuf::from("/etc/buxton/layers.d"),
            db_root: PathBuf::from("/var/lib/buxton"),
        }
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            rule_file: PathBuf::from("/etc/buxton/smack.rules"),
            rule_reload_interval_secs: 5,
        }
    }
}

impl BuxtondConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            BuxtondConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn file_path() -> PathBuf {
        std::env::var("BUXTON_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/etc/buxton/buxtond.toml"))
    }

    /// Write a default config file if none exists yet. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&BuxtondConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BUXTON_SOCKET_PATH") {
            self.socket.path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BUXTON_LAYER_DIR") {
            self.storage.layer_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BUXTON_DB_ROOT") {
            self.storage.db_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BUXTON_RULE_FILE") {
            self.access.rule_file = PathBuf::from(v);
        }
    }
}

/// Parse every `*.conf` file in `dir` (sorted by filename) into layers, in
/// file order within each file — together giving the insertion order
/// invariant 6 needs for priority ties.
pub fn load_layer_dir(dir: &Path) -> Result<Vec<Layer>, ConfigError> {
    let mut paths: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "conf"))
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(ConfigError::ReadFailed(dir.to_path_buf(), e)),
    };
    paths.sort();

    let mut layers = Vec::new();
    for path in paths {
        layers.extend(load_layer_file(&path)?);
    }
    Ok(layers)
}

/// Parse a single INI-style layer config file. Each `[section]` declares
/// one layer named after the section.
pub fn load_layer_file(path: &Path) -> Result<Vec<Layer>, ConfigError> {
    let text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
    let ini = ini::Ini::load_from_str(&text).map_err(|e| ConfigError::LayerConfigInvalid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut layers = Vec::new();
    for (section, props) in ini.iter() {
        let Some(name) = section else { continue };

        let invalid = |reason: &str| ConfigError::LayerConfigInvalid {
            path: path.to_path_buf(),
            reason: format!("[{name}]: {reason}"),
        };

        let kind = match props.get("type") {
            Some("System") => LayerKind::System,
            Some("User") => LayerKind::User,
            Some(other) => return Err(invalid(&format!("unknown type {other:?}"))),
            None => return Err(invalid("missing type")),
        };
        let backend_id = props
            .get("backend")
            .ok_or_else(|| invalid("missing backend"))?
            .to_string();
        let priority: u32 = props
            .get("priority")
            .ok_or_else(|| invalid("missing priority"))?
            .parse()
            .map_err(|_| invalid("priority must be a non-negative integer"))?;
        let description = props.get("description").unwrap_or("").to_string();

        layers.push(Layer {
            name: name.to_string(),
            kind,
            backend_id,
            priority,
            description,
            owning_uid: None,
        });
    }
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_well_known_paths() {
        let config = BuxtondConfig::default();
        assert_eq!(config.socket.path, PathBuf::from("/run/buxton/socket"));
        assert_eq!(config.access.rule_reload_interval_secs, 5);
    }

    #[test]
    fn parses_layer_config_in_file_order() {
        let tmp = std::env::temp_dir().join(format!("buxton-cfg-test-{}", std::process::id()));
        std::fs::create_dir_all(&tmp).unwrap();
        let file = tmp.join("10-base.conf");
        std::fs::write(
            &file,
            "[base]\ntype=System\nbackend=persistent\npriority=1\ndescription=base layer\n\n\
             [extra]\ntype=User\nbackend=memory\npriority=5\n",
        )
        .unwrap();

        let layers = load_layer_file(&file).unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].name, "base");
        assert_eq!(layers[0].kind, LayerKind::System);
        assert_eq!(layers[0].priority, 1);
        assert_eq!(layers[1].name, "extra");
        assert_eq!(layers[1].kind, LayerKind::User);

        std::fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let tmp = std::env::temp_dir().join(format!("buxton-cfg-test2-{}", std::process::id()));
        std::fs::create_dir_all(&tmp).unwrap();
        let file = tmp.join("bad.conf");
        std::fs::write(&file, "[base]\ntype=System\nbackend=persistent\n").unwrap();

        assert!(load_layer_file(&file).is_err());
        std::fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn missing_dir_yields_no_layers() {
        let layers = load_layer_dir(Path::new("/nonexistent/buxton-layers-dir")).unwrap();
        assert!(layers.is_empty());
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("buxton-config-test-{}", std::process::id()));
        let config_path = tmp.join("buxtond.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("BUXTON_CONFIG", config_path.to_str().unwrap());
        }

        let path = BuxtondConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let config = BuxtondConfig::load().expect("load should succeed");
        assert_eq!(config.socket.path, BuxtondConfig::default().socket.path);

        unsafe {
            std::env::remove_var("BUXTON_CONFIG");
        }
        std::fs::remove_dir_all(&tmp).ok();
    }
}
