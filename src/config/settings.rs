/*
 * Configuration layers, lowest priority first:
 *
 *   1. hardcoded defaults (the Default impls below)
 *   2. $CONFIG_PATH/default.toml
 *   3. $CONFIG_PATH/local.toml
 *   4. CLUSTER_* environment variables, nested with "__"
 *      (CLUSTER_HYPERVISOR__HOST=rhodey, CLUSTER_READINESS__TIMEOUT=600)
 *
 * `--config FILE` replaces 2 and 3 with a single required file.
 */

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::cluster::{BootstrapCommands, FailurePolicy};
use crate::core::lifecycle::LeasePolicy;
use crate::core::spec::ClusterSpec;
use crate::remote::{JumpHost, RetryPolicy, SshCredentials};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub hypervisor: HypervisorSettings,
    pub lease: LeasePolicy,
    pub readiness: ReadinessSettings,
    pub ssh: SshSettings,
    pub bootstrap: BootstrapCommands,
    pub orchestrator: OrchestratorSettings,
    pub cloud_init: CloudInitSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorSettings {
    pub host: String,
    pub user: Option<String>,
    /// Key used by libvirt's ssh transport.
    pub identity_file: Option<PathBuf>,
    pub pool: String,
    /// Overrides the URI built from host/user/identity_file.
    pub uri: Option<String>,
}

impl Default for HypervisorSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            user: None,
            identity_file: None,
            pool: "default".to_string(),
            uri: None,
        }
    }
}

impl HypervisorSettings {
    pub fn connection_uri(&self) -> String {
        if let Some(uri) = &self.uri {
            return uri.clone();
        }
        if self.host == "localhost" && self.user.is_none() {
            return "qemu:///system".to_string();
        }

        let mut uri = match &self.user {
            Some(user) => format!("qemu+ssh://{}@{}/system", user, self.host),
            None => format!("qemu+ssh://{}/system", self.host),
        };
        if let Some(key) = &self.identity_file {
            uri.push_str(&format!("?keyfile={}", key.display()));
        }
        uri
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    #[serde(with = "crate::config::duration_secs")]
    pub timeout: Duration,
    #[serde(with = "crate::config::duration_secs")]
    pub initial_interval: Duration,
    #[serde(with = "crate::config::duration_secs")]
    pub max_interval: Duration,
    /// Per-probe TCP/ssh connect budget.
    #[serde(with = "crate::config::duration_secs")]
    pub connect_timeout: Duration,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            timeout: policy.timeout,
            initial_interval: policy.initial_interval,
            max_interval: policy.max_interval,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl ReadinessSettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: self.timeout,
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub private_key: PathBuf,
    pub passphrase: Option<String>,
    pub port: u16,
    pub jump_host: Option<JumpHost>,
}

impl Default for SshSettings {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        Self {
            private_key: PathBuf::from(home).join(".ssh").join("id_ed25519"),
            passphrase: None,
            port: 22,
            jump_host: None,
        }
    }
}

impl SshSettings {
    pub fn credentials(&self) -> SshCredentials {
        SshCredentials {
            private_key: self.private_key.clone(),
            passphrase: self.passphrase.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Cloned for nodes that do not name their own image.
    pub base_image: Option<String>,
    pub on_failure: FailurePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudInitSettings {
    pub enabled: bool,
    /// Where seed ISOs are written. Must be the same path on the hypervisor
    /// host, so remote hosts need it shared or mounted.
    pub seed_dir: PathBuf,
    pub genisoimage: String,
}

impl Default for CloudInitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            seed_dir: PathBuf::from("/var/lib/libvirt/images"),
            genisoimage: "genisoimage".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

fn environment() -> Environment {
    Environment::with_prefix("CLUSTER")
        .prefix_separator("_")
        .separator("__")
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());

        info!("Loading configuration from path: {}", config_path);

        let settings: Settings = Config::builder()
            .add_source(File::with_name(&format!("{}/default", config_path)).required(false))
            .add_source(File::with_name(&format!("{}/local", config_path)).required(false))
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn new_from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from file: {}", path.display());

        let settings: Settings = Config::builder()
            .add_source(File::from(path))
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Zero intervals would turn the polling loops into busy loops.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("readiness.timeout", self.readiness.timeout),
            ("readiness.initial_interval", self.readiness.initial_interval),
            ("readiness.max_interval", self.readiness.max_interval),
            ("readiness.connect_timeout", self.readiness.connect_timeout),
            ("lease.interval", self.lease.interval),
        ];
        for (key, value) in positive {
            if value.is_zero() {
                return Err(ConfigError::Message(format!("{key} must be greater than zero")));
            }
        }
        if self.lease.attempts == 0 {
            return Err(ConfigError::Message("lease.attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Reads a cluster description (TOML, YAML or JSON by extension).
pub fn load_cluster_spec(path: &Path) -> anyhow::Result<ClusterSpec> {
    let spec: ClusterSpec = Config::builder()
        .add_source(File::from(path))
        .build()?
        .try_deserialize()?;
    spec.validate()?;
    Ok(spec)
}

pub fn generate_default_config() -> Settings {
    Settings::default()
}
