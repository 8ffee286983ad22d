// Configuration structures for dbtunnel

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Environment toggle that disables SSH host key verification entirely.
///
/// INSECURE: with this set to an affirmative value any host key is accepted and
/// nothing is recorded. Intended only for throwaway environments.
pub const INSECURE_HOSTKEY_ENV: &str = "DBTUNNEL_SSH_INSECURE_IGNORE_HOSTKEY";

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default MySQL/MariaDB port
pub const DEFAULT_DB_PORT: u16 = 3306;

/// Name of the application directory under the user config dir
pub const APP_DIR_NAME: &str = "dbtunnel";

/// Returns true when `value` is one of the accepted affirmative spellings
pub fn is_affirmative(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Check whether host key verification has been explicitly disabled
pub fn insecure_hostkey_bypass() -> bool {
    std::env::var(INSECURE_HOSTKEY_ENV)
        .map(|v| is_affirmative(&v))
        .unwrap_or(false)
}

/// Where the credential resolver looks for an SSH agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentSource {
    /// Use `SSH_AUTH_SOCK` when set
    #[default]
    Auto,
    /// Never use an agent
    Disabled,
    /// Use the agent listening on this socket
    Socket(PathBuf),
}

/// Everything needed to start one local-forwarding tunnel.
///
/// Immutable for the lifetime of the tunnel it starts.
#[derive(Clone)]
pub struct TunnelConfig {
    /// SSH bastion hostname or IP
    pub ssh_host: String,
    /// SSH bastion port (0 is treated as 22)
    pub ssh_port: u16,
    /// SSH user, defaults to the current process user
    pub ssh_user: Option<String>,
    pub password: Option<Zeroizing<String>>,
    pub identity_file: Option<PathBuf>,
    pub identity_passphrase: Option<Zeroizing<String>>,
    pub agent: AgentSource,
    /// Local port to listen on, 0 picks an ephemeral port
    pub local_port: u16,
    /// Destination as seen from the bastion's network
    pub remote_host: String,
    pub remote_port: u16,
    pub connect_timeout: Duration,
    /// SSH keepalive interval, zero disables keepalives
    pub keepalive_interval: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            ssh_host: String::new(),
            ssh_port: DEFAULT_SSH_PORT,
            ssh_user: None,
            password: None,
            identity_file: None,
            identity_passphrase: None,
            agent: AgentSource::default(),
            local_port: 0,
            remote_host: String::new(),
            remote_port: 0,
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

// Manual Debug impl so secrets never end up in logs
impl std::fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("ssh_host", &self.ssh_host)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_user", &self.ssh_user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("identity_file", &self.identity_file)
            .field("agent", &self.agent)
            .field("local_port", &self.local_port)
            .field("remote_host", &self.remote_host)
            .field("remote_port", &self.remote_port)
            .field("connect_timeout", &self.connect_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .finish()
    }
}

impl TunnelConfig {
    /// Validate the tunnel configuration before any network I/O
    pub fn validate(&self) -> Result<()> {
        if self.ssh_host.trim().is_empty() {
            return Err(Error::Config("SSH host cannot be empty".to_string()));
        }
        if self.remote_host.trim().is_empty() {
            return Err(Error::Config("Remote host cannot be empty".to_string()));
        }
        if self.remote_port == 0 {
            return Err(Error::Config(
                "Remote port must be greater than 0".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::Config(
                "Connect timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// SSH port with the 0 => 22 default applied
    pub fn effective_ssh_port(&self) -> u16 {
        if self.ssh_port == 0 {
            DEFAULT_SSH_PORT
        } else {
            self.ssh_port
        }
    }

    /// Password, ignoring blank values
    pub fn password(&self) -> Option<&str> {
        self.password
            .as_deref()
            .map(|p| p.as_str())
            .filter(|p| !p.trim().is_empty())
    }
}

/// Complete connection profile (plain TOML on disk)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    #[serde(flatten)]
    pub metadata: ProfileMetadata,
    pub database: DatabaseEndpoint,
    #[serde(default)]
    pub ssh_tunnel: SshTunnelSettings,
}

/// Profile metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileMetadata {
    /// Unique profile identifier
    pub id: Uuid,
    /// Human-readable profile name
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// MySQL/MariaDB server the profile points at
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseEndpoint {
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Optional SSH bastion section of a profile
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshTunnelSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
    /// 0 = pick an ephemeral port
    #[serde(default)]
    pub local_port: u16,
}

fn default_db_port() -> u16 {
    DEFAULT_DB_PORT
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl Profile {
    /// Create a new profile with the given name and database endpoint
    pub fn new(name: String, database: DatabaseEndpoint) -> Self {
        let now = Utc::now();
        Self {
            metadata: ProfileMetadata {
                id: Uuid::new_v4(),
                name,
                description: None,
                created_at: now,
                modified_at: now,
            },
            database,
            ssh_tunnel: SshTunnelSettings::default(),
        }
    }

    /// Validate the stored profile shape (no file system checks)
    pub fn validate(&self) -> Result<()> {
        if self.metadata.name.trim().is_empty() {
            return Err(Error::Config("Profile name cannot be empty".to_string()));
        }
        if self.database.host.trim().is_empty() {
            return Err(Error::Config("Database host cannot be empty".to_string()));
        }
        if self.database.port == 0 {
            return Err(Error::Config(format!(
                "Invalid database port: {}",
                self.database.port
            )));
        }
        if self.database.user.trim().is_empty() {
            return Err(Error::Config("Database user cannot be empty".to_string()));
        }
        if self.ssh_tunnel.enabled && self.ssh_tunnel.host.trim().is_empty() {
            return Err(Error::Config(
                "SSH tunnel is enabled but SSH host is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the tunnel configuration for this profile.
    ///
    /// The remote end of the tunnel is the database endpoint, reached from the
    /// bastion's network.
    pub fn tunnel_config(&self, app: &AppConfig) -> TunnelConfig {
        let ssh = &self.ssh_tunnel;
        TunnelConfig {
            ssh_host: ssh.host.trim().to_string(),
            ssh_port: ssh.port,
            ssh_user: ssh
                .user
                .as_ref()
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty()),
            password: ssh.password.clone().map(Zeroizing::new),
            identity_file: ssh.identity_file.clone(),
            identity_passphrase: None,
            agent: AgentSource::Auto,
            local_port: ssh.local_port,
            remote_host: self.database.host.trim().to_string(),
            remote_port: self.database.port,
            connect_timeout: app.connect_timeout(),
            keepalive_interval: app.keepalive_interval(),
        }
    }
}

/// Tool-wide settings (~/.config/dbtunnel/config.toml)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Timeout for TCP dial and SSH handshake, in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// SSH keepalive interval in seconds (0 = disabled)
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_interval_secs: u64,

    /// Override for the known_hosts file used by the tunnel.
    /// Default: /etc/dbtunnel/known_hosts, falling back to
    /// ~/.config/dbtunnel/known_hosts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<PathBuf>,
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_keepalive_secs() -> u64 {
    30
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            keepalive_interval_secs: default_keepalive_secs(),
            known_hosts_path: None,
        }
    }
}

impl AppConfig {
    /// Load the tool configuration, falling back to defaults when absent
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            debug!("No configuration found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load the tool configuration from a specific file
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        if config.connect_timeout_secs == 0 {
            return Err(Error::Config(
                "connect_timeout_secs must be greater than 0".to_string(),
            ));
        }
        info!("Loaded configuration from: {}", path.display());
        Ok(config)
    }

    /// Path of the tool configuration file
    pub fn config_path() -> Result<PathBuf> {
        Ok(app_config_dir()?.join("config.toml"))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

/// ~/.config/dbtunnel
pub fn app_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
    Ok(config_dir.join(APP_DIR_NAME))
}
