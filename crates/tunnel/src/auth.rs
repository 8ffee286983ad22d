// dbtunnel - Credential Resolver
// Builds the ordered list of SSH authentication methods and runs them

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::client::{AuthResult, Handle};
use russh::keys::agent::client::AgentClient;
use russh::keys::{decode_secret_key, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use dbtunnel_common::{AgentSource, AuthMethodKind, Error, Result, TunnelConfig};

use crate::tunnel::ClientHandler;

/// One way of proving our identity to the SSH server
pub enum AuthMethod {
    PublicKey {
        path: PathBuf,
        key: Arc<PrivateKey>,
    },
    Password(Zeroizing<String>),
    Agent {
        client: AgentClient<UnixStream>,
        identities: Vec<PublicKey>,
    },
}

impl AuthMethod {
    pub fn kind(&self) -> AuthMethodKind {
        match self {
            AuthMethod::PublicKey { .. } => AuthMethodKind::PublicKey,
            AuthMethod::Password(_) => AuthMethodKind::Password,
            AuthMethod::Agent { .. } => AuthMethodKind::Agent,
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::PublicKey { path, .. } => {
                f.debug_struct("PublicKey").field("path", path).finish()
            }
            AuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
            AuthMethod::Agent { identities, .. } => f
                .debug_struct("Agent")
                .field("identities", &identities.len())
                .finish(),
        }
    }
}

/// The agent socket to try for this configuration, if any
pub fn agent_socket(source: &AgentSource) -> Option<PathBuf> {
    match source {
        AgentSource::Disabled => None,
        AgentSource::Socket(path) => Some(path.clone()),
        AgentSource::Auto => std::env::var_os("SSH_AUTH_SOCK")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from),
    }
}

/// SSH user: the configured one, else the user running this process
pub fn resolve_user(config: &TunnelConfig) -> String {
    if let Some(user) = config.ssh_user.as_deref().map(str::trim) {
        if !user.is_empty() {
            return user.to_string();
        }
    }

    users::get_current_username()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .or_else(|| std::env::var("USER").ok().filter(|u| !u.trim().is_empty()))
        .unwrap_or_else(|| "root".to_string())
}

/// Expand `~` and make the path absolute against the working directory
pub fn resolve_identity_path(path: &Path) -> Result<PathBuf> {
    let raw = path.to_str().ok_or_else(|| {
        Error::InvalidPath(format!("identity file path is not UTF-8: {}", path.display()))
    })?;
    let expanded = PathBuf::from(shellexpand::tilde(raw.trim()).as_ref());
    if expanded.is_absolute() {
        return Ok(expanded);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(expanded))
}

/// Read and decode a private key. Read and parse failures are reported separately.
pub fn load_identity(path: &Path, passphrase: Option<&str>) -> Result<PrivateKey> {
    let resolved = resolve_identity_path(path)?;

    let contents = fs::read_to_string(&resolved).map_err(|e| Error::IdentityFileRead {
        path: resolved.clone(),
        reason: e.to_string(),
    })?;

    decode_secret_key(&contents, passphrase).map_err(|e| Error::IdentityFileParse {
        path: resolved,
        reason: e.to_string(),
    })
}

/// Build the authentication methods to offer, in order: identity file,
/// password, then agent keys.
///
/// Agent problems are never fatal; an empty result is.
pub async fn build_auth_methods(
    config: &TunnelConfig,
    agent_socket: Option<&Path>,
) -> Result<Vec<AuthMethod>> {
    let mut methods = Vec::new();

    if let Some(path) = config.identity_file.as_deref() {
        if !path.as_os_str().is_empty() {
            let passphrase = config.identity_passphrase.as_deref().map(|p| p.as_str());
            let key = load_identity(path, passphrase)?;
            debug!("Loaded identity file {}", path.display());
            methods.push(AuthMethod::PublicKey {
                path: path.to_path_buf(),
                key: Arc::new(key),
            });
        }
    }

    if let Some(password) = config.password() {
        methods.push(AuthMethod::Password(Zeroizing::new(password.to_string())));
    }

    if let Some(socket) = agent_socket {
        match connect_agent(socket).await {
            Ok(Some(agent)) => methods.push(agent),
            Ok(None) => debug!("SSH agent at {} holds no identities", socket.display()),
            Err(e) => debug!("SSH agent at {} not usable: {}", socket.display(), e),
        }
    }

    if methods.is_empty() {
        return Err(Error::NoAuthMethods);
    }

    debug!(
        "Resolved SSH auth methods: {}",
        methods
            .iter()
            .map(|m| m.kind().as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(methods)
}

async fn connect_agent(socket: &Path) -> std::result::Result<Option<AuthMethod>, String> {
    let mut client = AgentClient::connect_uds(socket)
        .await
        .map_err(|e| e.to_string())?;
    let identities = client
        .request_identities()
        .await
        .map_err(|e| e.to_string())?;

    if identities.is_empty() {
        return Ok(None);
    }
    Ok(Some(AuthMethod::Agent { client, identities }))
}

/// Try each method in order until the server accepts one.
pub async fn authenticate(
    session: &mut Handle<ClientHandler>,
    user: &str,
    methods: Vec<AuthMethod>,
) -> Result<AuthMethodKind> {
    let mut attempted: Vec<String> = Vec::new();
    let mut detail = String::from("server rejected all offered credentials");

    for method in methods {
        let kind = method.kind();
        if !attempted.iter().any(|a| a == kind.as_str()) {
            attempted.push(kind.as_str().to_string());
        }

        let result = match method {
            AuthMethod::PublicKey { path, key } => {
                debug!("Trying public key {}", path.display());
                let hash = session
                    .best_supported_rsa_hash()
                    .await
                    .map_err(ssh_error)?
                    .flatten();
                session
                    .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key, hash))
                    .await
                    .map_err(ssh_error)?
            }
            AuthMethod::Password(password) => {
                debug!("Trying password authentication");
                session
                    .authenticate_password(user, password.as_str())
                    .await
                    .map_err(ssh_error)?
            }
            AuthMethod::Agent {
                mut client,
                identities,
            } => match authenticate_with_agent(session, user, &mut client, identities).await? {
                Some(result) => result,
                None => {
                    debug!("No SSH agent identity could sign the request");
                    continue;
                }
            },
        };

        match result {
            AuthResult::Success => {
                info!("SSH authentication succeeded for '{}' using {}", user, kind);
                return Ok(kind);
            }
            AuthResult::Failure {
                remaining_methods,
                partial_success,
            } => {
                let methods: Vec<String> = remaining_methods
                    .iter()
                    .map(|m| {
                        let s: &str = m.into();
                        s.to_string()
                    })
                    .collect();
                if partial_success {
                    debug!(
                        "{} accepted, server requires more: {}",
                        kind,
                        methods.join(", ")
                    );
                } else {
                    debug!("{} rejected by server", kind);
                }
                if !methods.is_empty() {
                    detail = format!("server accepts: {}", methods.join(", "));
                }
            }
        }
    }

    warn!(
        "SSH authentication failed for '{}' (tried: {})",
        user,
        attempted.join(", ")
    );
    Err(Error::Authentication {
        user: user.to_string(),
        attempted,
        detail,
    })
}

async fn authenticate_with_agent(
    session: &mut Handle<ClientHandler>,
    user: &str,
    client: &mut AgentClient<UnixStream>,
    identities: Vec<PublicKey>,
) -> Result<Option<AuthResult>> {
    let mut last = None;

    for identity in identities {
        let hash = session
            .best_supported_rsa_hash()
            .await
            .map_err(ssh_error)?
            .flatten();

        // Agent signing failures only skip that identity
        match session
            .authenticate_publickey_with(user, identity, hash, client)
            .await
        {
            Ok(AuthResult::Success) => return Ok(Some(AuthResult::Success)),
            Ok(failure) => last = Some(failure),
            Err(e) => debug!("SSH agent identity failed: {}", e),
        }
    }

    Ok(last)
}

fn ssh_error(e: russh::Error) -> Error {
    Error::SshConnection(e.to_string())
}
