use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Top-level flagstore.toml configuration
#[derive(Debug, Deserialize, Default)]
pub struct FlagstoreConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    /// Defaults to `<root_dir>/storage_records.pb`.
    pub records_file: Option<String>,
    /// Build id of the running system, used to apply OTA staged flags.
    pub build_id: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

// ── Default value functions ──────────────────────────

fn default_root_dir() -> String {
    "/metadata/flagstore".to_string()
}

fn default_socket_path() -> String {
    "/dev/socket/flagstore".to_string()
}

fn default_request_timeout() -> u64 {
    2000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            socket_path: default_socket_path(),
            records_file: None,
            build_id: None,
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl DaemonConfig {
    pub fn root_dir(&self) -> PathBuf {
        PathBuf::from(&self.root_dir)
    }

    pub fn records_path(&self) -> PathBuf {
        match &self.records_file {
            Some(path) => PathBuf::from(path),
            None => self.root_dir().join("storage_records.pb"),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl FlagstoreConfig {
    /// Load configuration from a TOML file, falling back to defaults if the file
    /// doesn't exist or cannot be parsed.
    pub fn load(path: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content).unwrap_or_else(|e| {
                eprintln!("Warning: failed to parse {}: {}", path, e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(val) = var("FLAGSTORE_ROOT_DIR") {
            self.daemon.root_dir = val;
        }

        if let Some(val) = var("FLAGSTORE_SOCKET") {
            self.daemon.socket_path = val;
        }

        if let Some(val) = var("FLAGSTORE_RECORDS_FILE") {
            self.daemon.records_file = Some(val);
        }

        if let Some(val) = var("FLAGSTORE_BUILD_ID") {
            let val = val.trim().to_string();
            self.daemon.build_id = if val.is_empty() { None } else { Some(val) };
        }

        // FLAGSTORE_REQUEST_TIMEOUT_MS
        if let Some(val) = var("FLAGSTORE_REQUEST_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => self.daemon.request_timeout_ms = ms,
                _ => eprintln!("Warning: invalid FLAGSTORE_REQUEST_TIMEOUT_MS value: {}", val),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = FlagstoreConfig::parse("").unwrap();
        assert_eq!(config.daemon.root_dir, "/metadata/flagstore");
        assert_eq!(
            config.daemon.records_path(),
            PathBuf::from("/metadata/flagstore/storage_records.pb")
        );
        assert_eq!(config.daemon.request_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_parse_toml() {
        let config = FlagstoreConfig::parse(
            r#"
[daemon]
root_dir = "/tmp/flags"
socket_path = "/tmp/flags.sock"
build_id = "AP1A.240405.002"
request_timeout_ms = 500
"#,
        )
        .unwrap();
        assert_eq!(config.daemon.root_dir(), PathBuf::from("/tmp/flags"));
        assert_eq!(config.daemon.socket_path, "/tmp/flags.sock");
        assert_eq!(config.daemon.build_id.as_deref(), Some("AP1A.240405.002"));
        assert_eq!(config.daemon.request_timeout_ms, 500);
    }

    #[test]
    fn test_env_overrides() {
        let vars = HashMap::from([
            ("FLAGSTORE_ROOT_DIR", "/data/flags"),
            ("FLAGSTORE_BUILD_ID", " "),
            ("FLAGSTORE_REQUEST_TIMEOUT_MS", "not-a-number"),
        ]);
        let mut config = FlagstoreConfig::default();
        config.daemon.build_id = Some("old".into());
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.daemon.root_dir, "/data/flags");
        assert_eq!(config.daemon.build_id, None);
        assert_eq!(config.daemon.request_timeout_ms, 2000);
        assert_eq!(
            config.daemon.records_path(),
            PathBuf::from("/data/flags/storage_records.pb")
        );
    }
}
