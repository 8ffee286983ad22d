// Error types for dbtunnel

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config::INSECURE_HOSTKEY_ENV;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Profile already exists: {0}")]
    ProfileExists(String),

    #[error("Failed to determine local port: {0}")]
    PortAllocation(#[source] std::io::Error),

    #[error("Failed to connect TCP to SSH server {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to SSH server {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    #[error("SSH handshake with {addr} failed: {reason}")]
    Handshake { addr: String, reason: String },

    #[error(
        "SSH handshake with {addr} failed: known_hosts key mismatch for '{host_pattern}'. \
         Make sure the configured host is correct, then update or remove line {line} of {}",
        .path.display()
    )]
    HostKeyMismatch {
        addr: String,
        host_pattern: String,
        path: PathBuf,
        line: usize,
    },

    #[error(
        "Cannot use known_hosts file {}: {reason}. Fix the permissions or home directory, \
         or set {env}=1 to bypass host key verification (INSECURE)",
        .path.display(),
        env = INSECURE_HOSTKEY_ENV
    )]
    TrustStore { path: PathBuf, reason: String },

    #[error("Failed to read identity file '{}': {reason}", .path.display())]
    IdentityFileRead { path: PathBuf, reason: String },

    #[error("Failed to parse identity file '{}': {reason}", .path.display())]
    IdentityFileParse { path: PathBuf, reason: String },

    #[error(
        "No SSH authentication method available \
         (set an SSH password or identity file, or start ssh-agent with SSH_AUTH_SOCK)"
    )]
    NoAuthMethods,

    #[error("SSH authentication failed for user '{user}' (tried: {}): {detail}", .attempted.join(", "))]
    Authentication {
        user: String,
        attempted: Vec<String>,
        detail: String,
    },

    #[error("Failed to listen on local port 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("SSH connection error: {0}")]
    SshConnection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl Error {
    /// True for failures that happen before any network I/O
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::NoAuthMethods
                | Error::IdentityFileRead { .. }
                | Error::IdentityFileParse { .. }
        )
    }

    /// True for host key trust failures (mismatch or unusable store)
    pub fn is_trust(&self) -> bool {
        matches!(self, Error::HostKeyMismatch { .. } | Error::TrustStore { .. })
    }

    /// True for DNS/TCP/timeout failures while reaching the bastion
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Dial { .. } | Error::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
