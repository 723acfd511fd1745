use super::identity::RunAs;
use super::proxy::ProcessConfig;
use crate::error::{Result, SupervisorError};
use crate::fs::FileSystem;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Environment variable every plugin receives, pointing at the install root.
pub const INSTALL_ROOT_ENV: &str = "SUPERVISOR_INSTALL";

const DESCRIPTOR_EXTENSION: &str = "json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

fn default_true() -> bool {
    true
}

/// On-disk description of one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub executable_full_path: String,
    #[serde(default)]
    pub executable_arguments: Vec<String>,
    #[serde(default)]
    pub environment_variables: Vec<EnvironmentVariable>,
    #[serde(default)]
    pub executable_user_and_group: String,
    #[serde(default = "default_true")]
    pub is_managed_plugin: bool,
    #[serde(default)]
    pub has_service_health: bool,
    #[serde(default)]
    pub has_threat_service_health: bool,
    #[serde(default)]
    pub display_plugin_name: String,
}

impl PluginDescriptor {
    pub fn run_as(&self) -> Result<RunAs> {
        self.executable_user_and_group.parse()
    }
}

pub struct PluginRegistry {
    dir: PathBuf,
    install_root: PathBuf,
    core_dump_on_kill: bool,
    fs: Arc<dyn FileSystem>,
}

impl PluginRegistry {
    pub fn new(dir: impl Into<PathBuf>, install_root: impl Into<PathBuf>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            dir: dir.into(),
            install_root: install_root.into(),
            core_dump_on_kill: false,
            fs,
        }
    }

    /// Have every plugin built from this registry dump core when force-killed.
    pub fn with_core_dump_on_kill(mut self, enabled: bool) -> Self {
        self.core_dump_on_kill = enabled;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn descriptor_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, DESCRIPTOR_EXTENSION))
    }

    /// Load and validate the descriptor of `name`.
    pub fn load(&self, name: &str) -> Result<PluginDescriptor> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(SupervisorError::DescriptorNotFound(name.to_string()));
        }

        let path = self.descriptor_path(name);
        if !self.fs.is_file(&path) {
            return Err(SupervisorError::DescriptorNotFound(name.to_string()));
        }

        let content = self.fs.read_file(&path)?;
        let mut descriptor: PluginDescriptor =
            serde_json::from_str(&content).map_err(|e| SupervisorError::InvalidDescriptor {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        let invalid = |reason: String| SupervisorError::InvalidDescriptor {
            path: path.clone(),
            reason,
        };

        if descriptor.name.is_empty() {
            descriptor.name = name.to_string();
        } else if descriptor.name != name {
            return Err(invalid(format!(
                "name '{}' does not match file name",
                descriptor.name
            )));
        }
        if descriptor.executable_full_path.trim().is_empty() {
            return Err(invalid("executableFullPath is missing".to_string()));
        }
        descriptor
            .run_as()
            .map_err(|e| invalid(e.to_string()))?;

        debug!("Loaded descriptor for '{}' from {}", name, path.display());
        Ok(descriptor)
    }

    /// Every valid descriptor in the registry. Bad files are logged and skipped.
    pub fn load_all(&self) -> Result<Vec<PluginDescriptor>> {
        let files = match self.fs.list_files(&self.dir) {
            Ok(files) => files,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Plugin registry {} does not exist", self.dir.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut descriptors = Vec::new();
        for path in files {
            if path.extension().and_then(|e| e.to_str()) != Some(DESCRIPTOR_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(name) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }
        Ok(descriptors)
    }

    /// Launch configuration for a loaded descriptor.
    pub fn process_config(&self, descriptor: &PluginDescriptor) -> ProcessConfig {
        let executable = Path::new(&descriptor.executable_full_path);
        let executable = if executable.is_absolute() {
            executable.to_path_buf()
        } else {
            self.install_root.join(executable)
        };

        let display_name = if descriptor.display_plugin_name.is_empty() {
            descriptor.name.clone()
        } else {
            descriptor.display_plugin_name.clone()
        };

        let mut config = ProcessConfig::new(descriptor.name.clone(), executable)
            .args(descriptor.executable_arguments.iter().cloned())
            .user_and_group(descriptor.executable_user_and_group.clone())
            .display_name(display_name)
            .core_dump_on_kill(self.core_dump_on_kill)
            .service_health(
                descriptor.has_service_health,
                descriptor.has_threat_service_health,
            );

        for var in &descriptor.environment_variables {
            config = config.env(var.name.clone(), var.value.clone());
        }
        config.env(INSTALL_ROOT_ENV, self.install_root.to_string_lossy().into_owned())
    }
}
