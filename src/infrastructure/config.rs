use crate::domain::config::{
    EndpointConfig, FramingMode, GlobalConfig, NamedEndpoint, PortLinkConfig, ReconnectPolicy,
};
use crate::domain::error::{PortLinkError, PortLinkResult};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

const PROJECT_DIR: &str = ".portlink";
const CONFIG_FILE: &str = "config.toml";

/// Configuration manager
pub struct ConfigManager {
    global_config_path: PathBuf,
    project_config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Create a manager for the user config and the nearest project config
    pub fn new() -> PortLinkResult<Self> {
        let global_config_path = Self::default_global_config_path()?;
        let project_config_path = std::env::current_dir()
            .ok()
            .and_then(|dir| Self::find_project_config_path(&dir));

        Ok(Self {
            global_config_path,
            project_config_path,
        })
    }

    /// Create a manager with explicit file locations
    pub fn with_paths(global_config_path: PathBuf, project_config_path: Option<PathBuf>) -> Self {
        Self {
            global_config_path,
            project_config_path,
        }
    }

    /// Load configuration from files.
    ///
    /// Global settings come from the user file. Endpoints from both files
    /// are merged; a project endpoint replaces a user endpoint of the same
    /// name.
    pub fn load_config(&self) -> PortLinkResult<PortLinkConfig> {
        let mut config = PortLinkConfig::default();

        if self.global_config_path.exists() {
            config = Self::load_config_from_path(&self.global_config_path)?;
        }

        if let Some(project_path) = &self.project_config_path {
            if project_path.exists() {
                let project_config = Self::load_config_from_path(project_path)?;
                for endpoint in project_config.endpoints {
                    config.endpoints.retain(|existing| existing.name != endpoint.name);
                    config.endpoints.push(endpoint);
                }
            }
        }

        Ok(config)
    }

    /// Save global settings to the user file and endpoints to the project file
    pub fn save_config(&self, config: &PortLinkConfig) -> PortLinkResult<()> {
        let global_config = PortLinkConfig {
            global: config.global.clone(),
            endpoints: match &self.project_config_path {
                Some(_) => Vec::new(),
                None => config.endpoints.clone(),
            },
        };
        Self::save_config_to_path(&self.global_config_path, &global_config)?;

        if let Some(project_path) = &self.project_config_path {
            let project_config = PortLinkConfig {
                global: GlobalConfig::default(),
                endpoints: config.endpoints.clone(),
            };
            Self::save_config_to_path(project_path, &project_config)?;
        }

        Ok(())
    }

    /// Get global configuration path
    fn default_global_config_path() -> PortLinkResult<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| PortLinkError::config("Could not determine home directory"))?;

        Ok(home.join(".config").join("portlink").join(CONFIG_FILE))
    }

    /// Find project configuration path by walking up from `start`
    pub fn find_project_config_path(start: &Path) -> Option<PathBuf> {
        let mut path = start;

        loop {
            let config_path = path.join(PROJECT_DIR).join(CONFIG_FILE);
            if config_path.exists() {
                return Some(config_path);
            }

            path = path.parent()?;
        }
    }

    /// Load and validate configuration from a specific path
    pub fn load_config_from_path(path: &Path) -> PortLinkResult<PortLinkConfig> {
        let content = fs::read_to_string(path).map_err(|e| {
            PortLinkError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: PortLinkConfig = toml::from_str(&content).map_err(|e| {
            PortLinkError::config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        validate_config(&config)?;
        Ok(config)
    }

    /// Save configuration to a specific path, creating parent directories
    pub fn save_config_to_path(path: &Path, config: &PortLinkConfig) -> PortLinkResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                PortLinkError::config(format!(
                    "Failed to create config directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let content = toml::to_string_pretty(config)
            .map_err(|e| PortLinkError::config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, content).map_err(|e| {
            PortLinkError::config(format!("Failed to write config file {}: {}", path.display(), e))
        })
    }

    /// Create a project configuration with example endpoints under `path`
    pub fn init_project_config(&self, path: &Path) -> PortLinkResult<PathBuf> {
        let config_file = path.join(PROJECT_DIR).join(CONFIG_FILE);

        if config_file.exists() {
            return Err(PortLinkError::config(format!(
                "Project configuration already exists at {}",
                config_file.display()
            )));
        }

        let example = PortLinkConfig {
            global: GlobalConfig::default(),
            endpoints: vec![
                NamedEndpoint {
                    name: "example_serial".to_string(),
                    description: "Line-oriented serial device".to_string(),
                    endpoint: EndpointConfig::serial("/dev/ttyUSB0")
                        .with_split_char(b'\n')
                        .with_topic("serial"),
                },
                NamedEndpoint {
                    name: "example_tcp".to_string(),
                    description: "TCP device streaming JSON objects".to_string(),
                    endpoint: EndpointConfig::tcp_client("192.168.1.100", 8080)
                        .with_framing(FramingMode::Json)
                        .with_reconnect(ReconnectPolicy {
                            max_retries: Some(10),
                            ..ReconnectPolicy::default()
                        }),
                },
            ],
        };

        Self::save_config_to_path(&config_file, &example)?;
        Ok(config_file)
    }

    /// Get the current project config path (if any)
    pub fn project_config_path(&self) -> Option<&Path> {
        self.project_config_path.as_deref()
    }

    /// Get the global config path
    pub fn global_config_path(&self) -> &Path {
        &self.global_config_path
    }
}

/// Look up an endpoint by name
pub fn find_endpoint<'a>(
    config: &'a PortLinkConfig,
    name: &str,
) -> PortLinkResult<&'a NamedEndpoint> {
    config
        .endpoints
        .iter()
        .find(|endpoint| endpoint.name == name)
        .ok_or_else(|| PortLinkError::config(format!("Unknown endpoint '{}'", name)))
}

/// Validate every endpoint and reject duplicate names
pub fn validate_config(config: &PortLinkConfig) -> PortLinkResult<()> {
    let mut names = HashSet::new();

    for entry in &config.endpoints {
        if entry.name.trim().is_empty() {
            return Err(PortLinkError::config("Endpoint name must not be empty"));
        }
        if !names.insert(entry.name.as_str()) {
            return Err(PortLinkError::config(format!(
                "Duplicate endpoint name '{}'",
                entry.name
            )));
        }
        entry.endpoint.validate().map_err(|e| {
            PortLinkError::config(format!("Endpoint '{}': {}", entry.name, e))
        })?;
    }

    Ok(())
}
