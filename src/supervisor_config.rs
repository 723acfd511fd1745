use crate::clienv::{self, EnvVar};
use crate::daemon::monitor::DEFAULT_POLL_FLOOR;
use crate::daemon::proxy::ProxyTimings;
use crate::error::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_IPC_GROUP: &str = "supervisor-ipc";

/// Optional `config.toml`. Every field falls back to a default derived from
/// the install root; environment variables win over the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub install_root: Option<PathBuf>,
    /// Directory of `<plugin>.json` descriptors
    pub registry_dir: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
    /// Side file listing the users and groups plugins run as
    pub identity_file: Option<PathBuf>,
    pub ipc_group: Option<String>,
    pub log_file: Option<PathBuf>,
    /// Force-killed plugins leave a core dump
    pub core_dump_on_kill: Option<bool>,
    #[serde(default)]
    pub timings: TimingsConfig,
}

/// Timing overrides, in seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingsConfig {
    pub minimum_backoff: Option<u64>,
    pub maximum_backoff: Option<u64>,
    pub precondition_retry: Option<u64>,
    pub kill_grace: Option<u64>,
    pub shutdown_timeout: Option<u64>,
    pub poll_floor: Option<u64>,
}

impl SupervisorConfig {
    /// Load from `$SUPERVISOR_CONFIG` or the default config path.
    pub fn load() -> anyhow::Result<Self> {
        let path = clienv::config_path();
        Self::load_from(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading supervisor config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        tracing::trace!(config = ?config, "Supervisor config loaded");
        Ok(config)
    }

    pub fn install_root(&self) -> PathBuf {
        clienv::env_opt(EnvVar::SupervisorInstall.as_str())
            .map(PathBuf::from)
            .or_else(|| self.install_root.clone())
            .unwrap_or_else(clienv::install_root)
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.registry_dir
            .clone()
            .unwrap_or_else(|| self.install_root().join("registry"))
    }

    pub fn socket_path(&self) -> PathBuf {
        clienv::socket_override()
            .or_else(|| self.socket_path.clone())
            .unwrap_or_else(|| self.install_root().join("supervisor.sock"))
    }

    pub fn identity_file(&self) -> PathBuf {
        self.identity_file
            .clone()
            .unwrap_or_else(|| self.install_root().join("identities.json"))
    }

    pub fn ipc_group(&self) -> String {
        self.ipc_group
            .clone()
            .unwrap_or_else(|| DEFAULT_IPC_GROUP.to_string())
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        clienv::log_override().or_else(|| self.log_file.clone())
    }

    pub fn core_dump_on_kill(&self) -> bool {
        self.core_dump_on_kill.unwrap_or(false)
    }

    pub fn proxy_timings(&self) -> ProxyTimings {
        let defaults = ProxyTimings::default();
        let secs = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_secs).unwrap_or(default)
        };
        let t = &self.timings;

        ProxyTimings {
            minimum_backoff: secs(t.minimum_backoff, defaults.minimum_backoff),
            maximum_backoff: secs(t.maximum_backoff, defaults.maximum_backoff),
            precondition_retry: secs(t.precondition_retry, defaults.precondition_retry),
            kill_grace: secs(t.kill_grace, defaults.kill_grace),
            shutdown_timeout: secs(t.shutdown_timeout, defaults.shutdown_timeout),
            ..defaults
        }
    }

    pub fn poll_floor(&self) -> Duration {
        self.timings
            .poll_floor
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_FLOOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("supervisor-no-such-config.toml");
        let config = SupervisorConfig::load_from(&path).unwrap();
        assert_eq!(config, SupervisorConfig::default());
        assert_eq!(config.proxy_timings(), ProxyTimings::default());
        assert_eq!(config.poll_floor(), DEFAULT_POLL_FLOOR);
        assert_eq!(config.ipc_group(), "supervisor-ipc");
    }

    #[test]
    fn parses_paths_and_timings() {
        let config: SupervisorConfig = toml::from_str(
            r#"
            install_root = "/opt/agent"
            registry_dir = "/opt/agent/plugins/registry"
            ipc_group = "agent-ipc"
            core_dump_on_kill = true

            [timings]
            minimum_backoff = 5
            maximum_backoff = 60
            poll_floor = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.registry_dir(), PathBuf::from("/opt/agent/plugins/registry"));
        assert_eq!(config.ipc_group(), "agent-ipc");
        assert!(config.core_dump_on_kill());

        let timings = config.proxy_timings();
        assert_eq!(timings.minimum_backoff, Duration::from_secs(5));
        assert_eq!(timings.maximum_backoff, Duration::from_secs(60));
        assert_eq!(timings.kill_grace, ProxyTimings::default().kill_grace);
        assert_eq!(config.poll_floor(), Duration::from_secs(1));
    }

    #[test]
    fn rejects_malformed_toml() {
        let path = std::env::temp_dir().join(format!(
            "supervisor-bad-config-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "timings = [").unwrap();
        assert!(SupervisorConfig::load_from(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
