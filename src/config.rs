//! Agent and controller settings
//!
//! Both halves read the same optional JSON file named by `NETCAP_CONFIG`:
//!
//! ```json
//! { "agent": { "class": "HttpHelper" }, "controller": { "dump_dir": "out" } }
//! ```
//!
//! Missing sections and fields fall back to defaults. A few environment
//! variables override the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hook::{HookTarget, FORWARDED_ARGS};
use crate::il2cpp::offsets::IL2CPP_LIBRARY;

pub const CONFIG_ENV: &str = "NETCAP_CONFIG";
pub const CONTROLLER_ADDR_ENV: &str = "NETCAP_CONTROLLER_ADDR";
pub const DUMP_DIR_ENV: &str = "NETCAP_DUMP_DIR";
pub const PROCESS_ENV: &str = "NETCAP_PROCESS";

pub const DEFAULT_CONTROLLER_ADDR: &str = "127.0.0.1:47110";
pub const DEFAULT_STATUS_ADDR: &str = "127.0.0.1:47111";
pub const DEFAULT_PROCESS: &str = "UmamusumePrettyDerby.exe";
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("cannot parse config {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings of the in-process agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Native module exporting the IL2CPP API
    pub module: String,
    pub namespace: String,
    pub class: String,
    pub response_method: String,
    pub request_method: String,
    /// Arity both methods are looked up with
    pub arg_count: i32,
    /// Argument positions tried for the request body, in order
    pub request_argument_order: Vec<usize>,
    /// Element offset used when the runtime does not export the array accessor
    pub array_data_offset: Option<usize>,
    pub controller_addr: String,
    pub queue_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            module: IL2CPP_LIBRARY.to_string(),
            namespace: "Gallop".to_string(),
            class: "HttpHelper".to_string(),
            response_method: HookTarget::DecompressResponse.method_name().to_string(),
            request_method: HookTarget::CompressRequest.method_name().to_string(),
            arg_count: 1,
            request_argument_order: vec![0, 1],
            array_data_offset: None,
            controller_addr: DEFAULT_CONTROLLER_ADDR.to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl AgentConfig {
    pub fn method_name(&self, target: HookTarget) -> &str {
        match target {
            HookTarget::DecompressResponse => &self.response_method,
            HookTarget::CompressRequest => &self.request_method,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.arg_count < 0 {
            return Err(ConfigError::Invalid(format!("arg_count {} is negative", self.arg_count)));
        }
        if self.request_argument_order.len() > 2 {
            return Err(ConfigError::Invalid(
                "request_argument_order takes at most a primary and a fallback".to_string(),
            ));
        }
        if let Some(index) = self.request_argument_order.iter().find(|i| **i >= FORWARDED_ARGS) {
            return Err(ConfigError::Invalid(format!(
                "request argument {} is beyond the {} forwarded registers",
                index, FORWARDED_ARGS
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be positive".to_string()));
        }
        Ok(())
    }

    /// Defaults, then the config file, then environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = ConfigFile::load(env(CONFIG_ENV).as_deref().map(Path::new))?.agent;
        if let Some(addr) = env(CONTROLLER_ADDR_ENV) {
            config.controller_addr = addr;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Settings of the out-of-process controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Where agent frames are accepted
    pub listen_addr: String,
    /// Target process to wait for before listening
    pub process_name: String,
    pub wait_for_process: bool,
    pub dump_dir: PathBuf,
    /// Status HTTP endpoint; `null` disables it
    pub status_addr: Option<String>,
    pub queue_capacity: usize,
    /// How many recent artifact paths `/captures` reports
    pub recent_captures: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            listen_addr: DEFAULT_CONTROLLER_ADDR.to_string(),
            process_name: DEFAULT_PROCESS.to_string(),
            wait_for_process: true,
            dump_dir: PathBuf::from("dumps"),
            status_addr: Some(DEFAULT_STATUS_ADDR.to_string()),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            recent_captures: 64,
        }
    }
}

impl ControllerConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = ConfigFile::load(env(CONFIG_ENV).as_deref().map(Path::new))?.controller;
        if let Some(addr) = env(CONTROLLER_ADDR_ENV) {
            config.listen_addr = addr;
        }
        if let Some(dir) = env(DUMP_DIR_ENV) {
            config.dump_dir = PathBuf::from(dir);
        }
        if let Some(process) = env(PROCESS_ENV) {
            config.process_name = process;
        }
        if config.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be positive".to_string()));
        }
        Ok(config)
    }
}

/// On-disk layout shared by both halves
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub agent: AgentConfig,
    pub controller: ControllerConfig,
}

impl ConfigFile {
    /// `None` or a missing file yields the defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(ConfigFile::default());
        };
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(ConfigFile::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let agent = AgentConfig::load_with(env(&[])).unwrap();
        assert_eq!(agent.namespace, "Gallop");
        assert_eq!(agent.class, "HttpHelper");
        assert_eq!(agent.method_name(HookTarget::DecompressResponse), "DecompressResponse");
        assert_eq!(agent.method_name(HookTarget::CompressRequest), "CompressRequest");
        assert_eq!(agent.arg_count, 1);
        assert_eq!(agent.request_argument_order, vec![0, 1]);
        assert_eq!(agent.array_data_offset, None);

        let controller = ControllerConfig::load_with(env(&[])).unwrap();
        assert_eq!(controller.listen_addr, agent.controller_addr);
        assert_eq!(controller.dump_dir, PathBuf::from("dumps"));
        assert_eq!(controller.status_addr.as_deref(), Some(DEFAULT_STATUS_ADDR));
    }

    #[test]
    fn test_file_and_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netcap.json");
        std::fs::write(
            &path,
            r#"{
                "agent": { "class": "Other", "array_data_offset": 16, "request_argument_order": [1] },
                "controller": { "dump_dir": "from-file", "status_addr": null }
            }"#,
        )
        .unwrap();
        let path = path.to_str().unwrap();

        let agent = AgentConfig::load_with(env(&[
            (CONFIG_ENV, path),
            (CONTROLLER_ADDR_ENV, "10.0.0.2:9000"),
        ]))
        .unwrap();
        assert_eq!(agent.class, "Other");
        assert_eq!(agent.namespace, "Gallop");
        assert_eq!(agent.array_data_offset, Some(16));
        assert_eq!(agent.request_argument_order, vec![1]);
        assert_eq!(agent.controller_addr, "10.0.0.2:9000");

        let controller = ControllerConfig::load_with(env(&[
            (CONFIG_ENV, path),
            (DUMP_DIR_ENV, "from-env"),
            (PROCESS_ENV, "Game.exe"),
        ]))
        .unwrap();
        assert_eq!(controller.dump_dir, PathBuf::from("from-env"));
        assert_eq!(controller.process_name, "Game.exe");
        assert_eq!(controller.status_addr, None);
    }

    #[test]
    fn test_missing_file_is_defaults() {
        let config = ConfigFile::load(Some(Path::new("/nonexistent/netcap.json"))).unwrap();
        assert_eq!(config, ConfigFile::default());
    }

    #[test]
    fn test_bad_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netcap.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ConfigFile::load(Some(&path)),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_validation() {
        let mut config = AgentConfig::default();
        config.request_argument_order = vec![0, 4];
        assert!(config.validate().is_err());

        config.request_argument_order = vec![];
        assert!(config.validate().is_ok());

        config.arg_count = -1;
        assert!(config.validate().is_err());
    }
}
