use std::path::PathBuf;

#[derive(Debug, Clone, Copy)]
pub enum EnvVar {
    SupervisorConfig,
    SupervisorInstall,
    SupervisorSocket,
    SupervisorLog,
    SupervisorCoreDumpOnStop,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvVar::SupervisorConfig => "SUPERVISOR_CONFIG",
            EnvVar::SupervisorInstall => "SUPERVISOR_INSTALL",
            EnvVar::SupervisorSocket => "SUPERVISOR_SOCKET",
            EnvVar::SupervisorLog => "SUPERVISOR_LOG",
            EnvVar::SupervisorCoreDumpOnStop => "SUPERVISOR_CORE_DUMP_ON_STOP",
        }
    }
}

const FALLBACK_DATA_DIR: &str = "~/.local/share";
const FALLBACK_CONFIG_DIR: &str = "~/.config";
const SUPERVISOR_SUBDIR: &str = "supervisor";

/// Non-empty value of an environment variable.
pub fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// "1", "true", "yes" and "on" in any case.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Install root ($SUPERVISOR_INSTALL or ~/.local/share/supervisor)
pub fn install_root() -> PathBuf {
    let dir = env_opt(EnvVar::SupervisorInstall.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_DATA_DIR))
                .join(SUPERVISOR_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved install root");
    dir
}

/// Config file path ($SUPERVISOR_CONFIG or ~/.config/supervisor/config.toml)
pub fn config_path() -> PathBuf {
    let path = env_opt(EnvVar::SupervisorConfig.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(SUPERVISOR_SUBDIR)
                .join("config.toml")
        });
    tracing::trace!(path = %path.display(), "Config path");
    path
}

/// Control socket override ($SUPERVISOR_SOCKET)
pub fn socket_override() -> Option<PathBuf> {
    let val = env_opt(EnvVar::SupervisorSocket.as_str()).map(PathBuf::from);
    tracing::trace!(value = ?val, "SUPERVISOR_SOCKET env var");
    val
}

/// Log file override ($SUPERVISOR_LOG)
pub fn log_override() -> Option<PathBuf> {
    let val = env_opt(EnvVar::SupervisorLog.as_str()).map(PathBuf::from);
    tracing::trace!(value = ?val, "SUPERVISOR_LOG env var");
    val
}

/// Whether a STOP request should arm a core dump on the forced kill
/// ($SUPERVISOR_CORE_DUMP_ON_STOP). Read at request time.
pub fn core_dump_on_stop() -> bool {
    let enabled = env_opt(EnvVar::SupervisorCoreDumpOnStop.as_str())
        .map(|v| is_truthy(&v))
        .unwrap_or(false);
    tracing::trace!(enabled = enabled, "Core dump on stop");
    enabled
}
