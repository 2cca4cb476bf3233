use crate::errors::{Result, TbError};
use crate::naming;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = ".testbed.yml";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Host on which bound container ports are reachable
    pub host: String,
    /// Role prefix for the per-environment network name
    pub network_role: String,
    pub database: DatabaseConfig,
    /// Port every application service listens on inside its container
    pub service_port: u16,
    pub aspnet_environment: String,
    pub env_keys: EnvKeys,
    /// Build descriptor filename inside each service's source directory
    pub build_descriptor: String,
    pub ports: PortRange,
    pub readiness: ReadinessConfig,
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub image: String,
    pub user: String,
    pub password: String,
    /// For postgres always 5432
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EnvKeys {
    pub environment: String,
    pub default_connection: String,
    pub database_init: String,
    /// Prefix for cross-service link variables
    pub link_prefix: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    /// Multiplier applied to the interval after each failed attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub name: String,
    pub image: String,
    pub source_dir: PathBuf,
    /// Services whose URL is injected into this service's environment
    #[serde(default)]
    pub links: Vec<String>,
    /// HTTP path polled for readiness; the service port is polled when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_path: Option<String>,
    /// Command executed inside the container for readiness, overrides the path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_command: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub database_init: bool,
    /// Variable under which linking services receive this service's URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_env: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            network_role: naming::NETWORK_ROLE.to_string(),
            database: DatabaseConfig::default(),
            service_port: 8080,
            aspnet_environment: "Development".to_string(),
            env_keys: EnvKeys::default(),
            build_descriptor: "Dockerfile".to_string(),
            ports: PortRange::default(),
            readiness: ReadinessConfig::default(),
            services: vec![
                ServiceConfig {
                    name: "authenticationservice".to_string(),
                    image: "tmpauthenticationservice:test".to_string(),
                    source_dir: PathBuf::from(
                        "../TMPAuthenticationService/TMPAuthenticationService",
                    ),
                    links: Vec::new(),
                    readiness_path: None,
                    readiness_command: None,
                    database_init: true,
                    link_env: Some("ConnectionStrings__AuthenticationService".to_string()),
                },
                ServiceConfig {
                    name: "taskservice".to_string(),
                    image: "tmptaskservice:test".to_string(),
                    source_dir: PathBuf::from("../TMPTaskService/TMPTaskService"),
                    links: vec!["authenticationservice".to_string()],
                    readiness_path: None,
                    readiness_command: None,
                    database_init: true,
                    link_env: None,
                },
            ],
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            image: "postgres:latest".to_string(),
            user: "myuser".to_string(),
            password: "mypassword".to_string(),
            port: 5432,
        }
    }
}

impl Default for EnvKeys {
    fn default() -> Self {
        Self {
            environment: "ASPNETCORE_ENVIRONMENT".to_string(),
            default_connection: "ConnectionStrings__DefaultConnection".to_string(),
            database_init: "DataBaseInit".to_string(),
            link_prefix: "ConnectionStrings__".to_string(),
        }
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 20000,
            end: 29999,
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            timeout_ms: 60_000,
            backoff: None,
            max_interval_ms: None,
        }
    }
}

impl ServiceConfig {
    /// Environment variable name used by services linking to this one
    pub fn link_key(&self, prefix: &str) -> String {
        match &self.link_env {
            Some(key) => key.clone(),
            None => format!("{}{}", prefix, self.name),
        }
    }
}

impl ReadinessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load config from .testbed.yml in `dir`, falling back to defaults
    ///
    /// Relative service source directories are resolved against `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            Self::from_yaml(&content)?
        } else {
            Config::default()
        };

        for service in &mut config.services {
            if service.source_dir.is_relative() {
                service.source_dir = dir.join(&service.source_dir);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yml::from_str(content)
            .map_err(|e| TbError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.ports.start == 0 || self.ports.start > self.ports.end {
            return Err(TbError::ConfigError(format!(
                "Invalid port range {}-{}",
                self.ports.start, self.ports.end
            )));
        }

        if self.readiness.timeout_ms == 0 {
            return Err(TbError::ConfigError(
                "Readiness timeout must be positive".to_string(),
            ));
        }

        if self.readiness.interval_ms == 0 {
            return Err(TbError::ConfigError(
                "Readiness interval must be positive".to_string(),
            ));
        }

        if let Some(factor) = self.readiness.backoff {
            if !factor.is_finite() || factor < 1.0 {
                return Err(TbError::ConfigError(format!(
                    "Backoff factor must be >= 1.0, got {}",
                    factor
                )));
            }
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            if !service.name.chars().any(|c| c.is_ascii_alphanumeric()) {
                return Err(TbError::ConfigError(format!(
                    "Invalid service name '{}'",
                    service.name
                )));
            }
            if !seen.insert(service.name.as_str()) {
                return Err(TbError::ConfigError(format!(
                    "Duplicate service '{}'",
                    service.name
                )));
            }
        }

        // Container names are derived after sanitizing, so distinct service
        // names can still map onto one container
        let mut containers: HashMap<String, &str> = HashMap::new();
        for service in &self.services {
            for role in [
                naming::service_role(&service.name),
                naming::store_role(&service.name),
            ] {
                let role = naming::sanitize_role(&role);
                if let Some(other) = containers.insert(role.clone(), &service.name) {
                    return Err(TbError::ConfigError(format!(
                        "Services '{}' and '{}' both map to container '{}'",
                        other, service.name, role
                    )));
                }
            }
        }

        for service in &self.services {
            for link in &service.links {
                if link == &service.name {
                    return Err(TbError::ConfigError(format!(
                        "Service '{}' links to itself",
                        service.name
                    )));
                }
                if !seen.contains(link.as_str()) {
                    return Err(TbError::ConfigError(format!(
                        "Service '{}' links to unknown service '{}'",
                        service.name, link
                    )));
                }
            }
        }

        Ok(())
    }

    /// Find a configured service by name
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }
}
