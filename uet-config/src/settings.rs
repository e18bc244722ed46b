//! Process-level settings read from the environment: where the document
//! lives, where key material comes from and how verbose logging is.

use std::path::{Path, PathBuf};

use crate::crypto::keys::{DEFAULT_KEY_FILE, KEY_FILE_ENV, MASTER_KEY_ENV};
use crate::crypto::KeySource;

pub const CONFIG_PATH_ENV: &str = "UET_CONFIG_PATH";
pub const LOG_ENV: &str = "UET_LOG";

/// Default document path inside the container image.
pub const CONTAINER_CONFIG_PATH: &str = "/app/config/config.yaml";
pub const LOCAL_CONFIG_PATH: &str = "config.yaml";
const CONTAINER_ROOT: &str = "/app";
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone)]
pub struct Settings {
    pub config_path: PathBuf,
    pub keys: KeySource,
    pub log_filter: String,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(
            |name| std::env::var(name).ok(),
            Path::new(CONTAINER_ROOT).exists(),
        )
    }

    /// Builds settings from an arbitrary variable lookup. `in_container`
    /// selects the container default path when no explicit path is set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>, in_container: bool) -> Self {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let config_path = non_empty(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                PathBuf::from(if in_container {
                    CONTAINER_CONFIG_PATH
                } else {
                    LOCAL_CONFIG_PATH
                })
            });

        let mut keys = KeySource::new(
            non_empty(KEY_FILE_ENV).unwrap_or_else(|| DEFAULT_KEY_FILE.to_string()),
        );
        if let Some(master_key) = non_empty(MASTER_KEY_ENV) {
            keys = keys.with_master_key(master_key);
        }

        Self {
            config_path,
            keys,
            log_filter: non_empty(LOG_ENV).unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_outside_container() {
        let settings = Settings::from_lookup(lookup(&[]), false);
        assert_eq!(settings.config_path, PathBuf::from("config.yaml"));
        assert_eq!(settings.keys.key_file(), Path::new(".uet_key"));
        assert!(!settings.keys.has_master_key());
        assert_eq!(settings.log_filter, "info");
    }

    #[test]
    fn defaults_inside_container() {
        let settings = Settings::from_lookup(lookup(&[]), true);
        assert_eq!(settings.config_path, PathBuf::from("/app/config/config.yaml"));
    }

    #[test]
    fn explicit_values_win() {
        let settings = Settings::from_lookup(
            lookup(&[
                ("UET_CONFIG_PATH", "/etc/uet/config.yaml"),
                ("UET_KEY_FILE", "/etc/uet/key"),
                ("UET_MASTER_KEY", "correct horse"),
                ("UET_LOG", "uet_config=debug"),
            ]),
            true,
        );
        assert_eq!(settings.config_path, PathBuf::from("/etc/uet/config.yaml"));
        assert_eq!(settings.keys.key_file(), Path::new("/etc/uet/key"));
        assert!(settings.keys.has_master_key());
        assert_eq!(settings.log_filter, "uet_config=debug");
    }

    #[test]
    fn blank_values_fall_back() {
        let settings = Settings::from_lookup(
            lookup(&[("UET_CONFIG_PATH", " "), ("UET_MASTER_KEY", "")]),
            false,
        );
        assert_eq!(settings.config_path, PathBuf::from("config.yaml"));
        assert!(!settings.keys.has_master_key());
    }
}
