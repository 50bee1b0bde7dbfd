//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults (compiled into binary)
//! 2. System config: `%ProgramData%\EndpointGuard\config.toml`
//! 3. Additional config file (via `--config` flag)
//! 4. Saved credentials (`<data_dir>\credentials.toml`), only when no API key is set
//! 5. Environment (`ENDPOINT_GUARD_DASHBOARD_URL`, `ENDPOINT_GUARD_API_KEY`)
//!
//! Lists (blocked_sites, whitelist) are **merged** (appended).
//! Scalars (intervals, URLs) are **overridden**.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::error::ConfigError;
use super::schema::{AgentConfig, Config};
use crate::cli::Cli;

/// Application directory name under the system data root.
pub const APP_DIR: &str = "EndpointGuard";

/// System configuration filename.
pub const CONFIG_FILE: &str = "config.toml";

/// File holding the API key issued at registration.
pub const CREDENTIALS_FILE: &str = "credentials.toml";

/// File holding the generated machine identifier.
pub const MACHINE_ID_FILE: &str = "machine_id";

/// Environment variable overriding the management server URL.
pub const ENV_DASHBOARD_URL: &str = "ENDPOINT_GUARD_DASHBOARD_URL";

/// Environment variable overriding the API key.
pub const ENV_API_KEY: &str = "ENDPOINT_GUARD_API_KEY";

/// Configuration loader with support for hierarchy merging.
pub struct ConfigLoader {
    /// Path to system-wide configuration.
    system_path: PathBuf,
    /// Data directory override (for testing).
    data_dir: Option<PathBuf>,
}

fn system_root() -> PathBuf {
    if cfg!(windows) {
        std::env::var_os("ProgramData")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\ProgramData"))
            .join(APP_DIR)
    } else {
        PathBuf::from("/etc/endpoint-guard")
    }
}

fn default_data_dir() -> PathBuf {
    if cfg!(windows) {
        system_root()
    } else {
        dirs::data_local_dir()
            .map(|p| p.join("endpoint-guard"))
            .unwrap_or_else(|| PathBuf::from(".endpoint-guard"))
    }
}

pub(crate) fn hostname() -> String {
    ["COMPUTERNAME", "HOSTNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "endpoint".to_string())
}

impl ConfigLoader {
    /// Create a new ConfigLoader with default paths.
    #[must_use]
    pub fn new() -> Self {
        Self {
            system_path: system_root().join(CONFIG_FILE),
            data_dir: None,
        }
    }

    /// Create a ConfigLoader with custom paths (for testing).
    #[must_use]
    pub fn with_paths(system_path: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            system_path,
            data_dir: Some(data_dir),
        }
    }

    /// Load and merge configuration from all sources.
    ///
    /// Missing config files are not errors - they are simply skipped.
    /// Invalid TOML is an error (fail fast with clear message).
    pub fn load(&self, cli: &Cli) -> Result<Config, ConfigError> {
        self.load_with_env(cli, |name| std::env::var(name).ok())
    }

    /// Like [`load`](Self::load) with an explicit environment lookup.
    pub fn load_with_env<F>(&self, cli: &Cli, env: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Start with embedded defaults
        let mut config = Config::embedded().map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<embedded:default.toml>"),
            source: e,
        })?;
        debug!("Loaded embedded default configuration");

        // Load and merge system config
        if let Some(system_config) = self.load_file(&self.system_path)? {
            config.merge(system_config);
            debug!("Loaded system config from {:?}", self.system_path);
        } else {
            debug!("No system config found at {:?}", self.system_path);
        }

        // Load and merge additional config file from CLI
        if let Some(ref cli_config_path) = cli.config {
            match self.load_file(cli_config_path)? {
                Some(cli_config) => {
                    config.merge(cli_config);
                    debug!("Loaded additional config from {:?}", cli_config_path);
                }
                None => {
                    // Unlike the system config, a missing CLI-specified config is an error
                    return Err(ConfigError::ReadError {
                        path: cli_config_path.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        let data_dir = self.data_dir(&config);

        // Saved credentials fill in a missing API key
        if config.agent.api_key.is_empty() {
            let credentials_path = data_dir.join(CREDENTIALS_FILE);
            if let Some(credentials) = self.load_file(&credentials_path)? {
                config.agent.api_key = credentials.agent.api_key;
                debug!("Loaded saved credentials from {:?}", credentials_path);
            }
        }

        // Environment (highest priority)
        if let Some(url) = env(ENV_DASHBOARD_URL).filter(|v| !v.is_empty()) {
            config.agent.dashboard_url = url;
        }
        if let Some(key) = env(ENV_API_KEY).filter(|v| !v.is_empty()) {
            config.agent.api_key = key;
        }

        if config.agent.machine_id.is_empty() {
            config.agent.machine_id = self.machine_id(&data_dir);
        }

        validate(&config)?;
        Ok(config)
    }

    /// The directory agent state is kept in.
    pub fn data_dir(&self, config: &Config) -> PathBuf {
        if let Some(ref dir) = self.data_dir {
            return dir.clone();
        }
        if !config.agent.data_dir.is_empty() {
            return PathBuf::from(&config.agent.data_dir);
        }
        default_data_dir()
    }

    /// Persist an API key issued at registration.
    pub fn save_credentials(&self, config: &Config, api_key: &str) -> Result<(), ConfigError> {
        let credentials = Config {
            agent: AgentConfig {
                api_key: api_key.to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let contents = toml::to_string(&credentials)?;
        let path = self.data_dir(config).join(CREDENTIALS_FILE);
        write_file(&path, &contents)?;
        debug!("Saved credentials to {:?}", path);
        Ok(())
    }

    /// Read the machine identifier, generating and saving one if needed.
    fn machine_id(&self, data_dir: &Path) -> String {
        let path = data_dir.join(MACHINE_ID_FILE);
        if let Ok(existing) = fs::read_to_string(&path) {
            let existing = existing.trim();
            if !existing.is_empty() {
                return existing.to_string();
            }
        }

        let simple = uuid::Uuid::new_v4().simple().to_string();
        let generated = format!("{}-{}", hostname(), &simple[..8]);
        if let Err(e) = write_file(&path, &generated) {
            warn!("Could not persist machine id: {}", e);
        }
        generated
    }

    /// Load a config file, returning None if it doesn't exist.
    fn load_file(&self, path: &PathBuf) -> Result<Option<Config>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config =
                    toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                        path: path.clone(),
                        source: e,
                    })?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::ReadError {
                path: path.clone(),
                source: e,
            }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn write_file(path: &Path, contents: &str) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    fs::write(path, contents).map_err(|e| ConfigError::WriteError {
        path: path.to_path_buf(),
        source: e,
    })
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let url = &config.agent.dashboard_url;
    if !url.is_empty() && !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ConfigError::InvalidValue {
            field: "agent.dashboard_url".to_string(),
            message: format!("'{}' is not an http(s) URL", url),
        });
    }

    for (field, value) in [
        ("network.dns_listen", &config.network.dns_listen),
        ("network.dns_upstream", &config.network.dns_upstream),
    ] {
        if !value.is_empty() && value.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidValue {
                field: field.to_string(),
                message: format!("'{}' is not an ip:port address", value),
            });
        }
    }
    Ok(())
}
