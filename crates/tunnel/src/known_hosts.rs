// dbtunnel - Known Hosts Module
// Trust-on-first-use host key store backed by an OpenSSH-style known_hosts file

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use base64::Engine;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use dbtunnel_common::config::APP_DIR_NAME;
use dbtunnel_common::{format_host_port, insecure_hostkey_bypass, Error, Result};

use crate::permissions::ensure_private_file;

/// System-wide trust store, preferred when it can be created and written
pub const SYSTEM_KNOWN_HOSTS_PATH: &str = "/etc/dbtunnel/known_hosts";

/// Outcome of a successful host key check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    /// The presented key matches a stored entry
    Trusted,
    /// First contact: the key was appended to the store
    Learned,
}

/// A single entry in the known_hosts file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHostEntry {
    /// Host pattern field (e.g. "10.0.0.1", "[bastion]:2222", or a comma list)
    pub host_pattern: String,
    /// Key type (e.g. "ssh-ed25519", "ssh-rsa")
    pub key_type: String,
    /// Base64-encoded public key
    pub key_data: String,
    pub comment: Option<String>,
    /// 1-based line number in the file
    pub line_number: usize,
}

impl KnownHostEntry {
    /// Parse a single line from the known_hosts file
    fn parse(line: &str, line_number: usize) -> Option<Self> {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        // @cert-authority / @revoked markers are not supported
        if line.starts_with('@') {
            debug!("Skipping marker entry at known_hosts line {}", line_number);
            return None;
        }

        let mut parts = line.split_whitespace();
        let (host_pattern, key_type, key_data) = match (parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(t), Some(d)) => (h, t, d),
            _ => {
                warn!("Invalid known_hosts entry at line {}: too few fields", line_number);
                return None;
            }
        };
        let comment = parts.collect::<Vec<_>>().join(" ");

        Some(KnownHostEntry {
            host_pattern: host_pattern.to_string(),
            key_type: key_type.to_string(),
            key_data: key_data.to_string(),
            comment: (!comment.is_empty()).then_some(comment),
            line_number,
        })
    }

    /// Format entry as a known_hosts line
    fn format(&self) -> String {
        match &self.comment {
            Some(comment) => format!(
                "{} {} {} {}",
                self.host_pattern, self.key_type, self.key_data, comment
            ),
            None => format!("{} {} {}", self.host_pattern, self.key_type, self.key_data),
        }
    }

    /// Check if this entry names the given host and port. Host names compare
    /// case-insensitively, as in OpenSSH.
    pub fn matches(&self, host: &str, port: u16) -> bool {
        let pattern = format_host_pattern(host, port);
        self.host_pattern
            .split(',')
            .any(|candidate| !candidate.starts_with('|') && candidate.eq_ignore_ascii_case(&pattern))
    }

    /// Check if the presented key is the one stored in this entry
    fn verify_key(&self, key: &PublicKey) -> bool {
        self.key_type == key_type_to_string(key) && self.key_data == key.public_key_base64()
    }

    /// SHA256 fingerprint of the stored key
    pub fn fingerprint(&self) -> String {
        match base64::engine::general_purpose::STANDARD.decode(&self.key_data) {
            Ok(bytes) => fingerprint_bytes(&bytes),
            Err(_) => "(invalid key data)".to_string(),
        }
    }
}

struct StoreState {
    entries: Vec<KnownHostEntry>,
    /// Number of lines currently in the file
    line_count: usize,
    /// The file does not end with a newline
    needs_newline: bool,
}

/// Host key trust store.
///
/// The file is read once when the store is opened; lookups and appends then go
/// through one lock so concurrent first contacts never write duplicates.
pub struct KnownHosts {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl std::fmt::Debug for KnownHosts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnownHosts").field("path", &self.path).finish()
    }
}

impl KnownHosts {
    /// Open the store at the first usable default location
    pub fn open_default() -> Result<Self> {
        let path = Self::select_default_path()?;
        Self::open(&path)
    }

    /// Open (creating if needed) the store at a specific path
    pub fn open(path: &Path) -> Result<Self> {
        ensure_private_file(path, 0o700).map_err(|e| trust_store_error(path, &e))?;

        let contents = fs::read_to_string(path).map_err(|e| Error::TrustStore {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut entries = Vec::new();
        let mut line_count = 0;
        for (idx, line) in contents.lines().enumerate() {
            line_count = idx + 1;
            if let Some(entry) = KnownHostEntry::parse(line, idx + 1) {
                entries.push(entry);
            }
        }

        debug!(
            "Loaded {} entries from known_hosts: {}",
            entries.len(),
            path.display()
        );

        Ok(KnownHosts {
            path: path.to_path_buf(),
            state: Mutex::new(StoreState {
                entries,
                line_count,
                needs_newline: !contents.is_empty() && !contents.ends_with('\n'),
            }),
        })
    }

    /// Pick the backing file: the system path when it can be created and
    /// written, otherwise the per-user path under the config directory.
    pub fn select_default_path() -> Result<PathBuf> {
        let system = PathBuf::from(SYSTEM_KNOWN_HOSTS_PATH);
        match ensure_private_file(&system, 0o755) {
            Ok(()) => return Ok(system),
            Err(e) => debug!("System known_hosts not usable ({:#}), using per-user store", e),
        }

        let user = Self::user_path()?;
        ensure_private_file(&user, 0o700).map_err(|e| trust_store_error(&user, &e))?;
        Ok(user)
    }

    /// ~/.config/dbtunnel/known_hosts
    pub fn user_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| Error::TrustStore {
            path: PathBuf::from("~/.config").join(APP_DIR_NAME).join("known_hosts"),
            reason: "could not determine config directory".to_string(),
        })?;
        Ok(config_dir.join(APP_DIR_NAME).join("known_hosts"))
    }

    /// Accept a known key, learn an unknown host, reject a changed key.
    pub fn verify_or_trust(&self, host: &str, port: u16, key: &PublicKey) -> Result<TrustDecision> {
        let port = if port == 0 { 22 } else { port };
        let mut state = self.lock()?;

        let matching: Vec<&KnownHostEntry> =
            state.entries.iter().filter(|e| e.matches(host, port)).collect();

        if matching.iter().any(|e| e.verify_key(key)) {
            debug!("Host key verified for {}", format_host_port(host, port));
            return Ok(TrustDecision::Trusted);
        }

        if let Some(expected) = matching.first() {
            return Err(Error::HostKeyMismatch {
                addr: format_host_port(host, port),
                host_pattern: format_host_pattern(host, port),
                path: self.path.clone(),
                line: expected.line_number,
            });
        }

        let entry = KnownHostEntry {
            host_pattern: format_host_pattern(host, port),
            key_type: key_type_to_string(key),
            key_data: key.public_key_base64(),
            comment: None,
            line_number: state.line_count + 1,
        };
        self.append(&mut state, entry)?;

        info!(
            "Learned host key for {} ({}) in {}",
            format_host_port(host, port),
            calculate_fingerprint(key),
            self.path.display()
        );
        Ok(TrustDecision::Learned)
    }

    fn append(&self, state: &mut StoreState, entry: KnownHostEntry) -> Result<()> {
        let write = || -> std::io::Result<()> {
            let mut file = fs::OpenOptions::new().append(true).open(&self.path)?;
            let mut line = String::new();
            if state.needs_newline {
                line.push('\n');
            }
            line.push_str(&entry.format());
            line.push('\n');
            file.write_all(line.as_bytes())?;
            file.sync_data()
        };
        write().map_err(|e| Error::TrustStore {
            path: self.path.clone(),
            reason: format!("failed to append host key: {}", e),
        })?;

        if state.needs_newline {
            state.line_count += 1;
            state.needs_newline = false;
        }
        state.line_count += 1;
        state.entries.push(entry);
        Ok(())
    }

    /// Remove every entry for host:port. Returns the number of removed entries.
    pub fn remove(&self, host: &str, port: u16) -> Result<usize> {
        let port = if port == 0 { 22 } else { port };
        let mut state = self.lock()?;

        let io_err = |e: std::io::Error| Error::TrustStore {
            path: self.path.clone(),
            reason: e.to_string(),
        };

        let contents = fs::read_to_string(&self.path).map_err(io_err)?;
        let mut kept = Vec::new();
        let mut entries = Vec::new();
        let mut removed = 0;

        for (idx, line) in contents.lines().enumerate() {
            match KnownHostEntry::parse(line, idx + 1) {
                Some(entry) if entry.matches(host, port) => {
                    removed += 1;
                    continue;
                }
                Some(mut entry) => {
                    entry.line_number = kept.len() + 1;
                    entries.push(entry);
                }
                None => {}
            }
            kept.push(line);
        }

        if removed == 0 {
            return Ok(0);
        }

        let mut rewritten = kept.join("\n");
        if !rewritten.is_empty() {
            rewritten.push('\n');
        }
        fs::write(&self.path, rewritten).map_err(io_err)?;

        state.line_count = kept.len();
        state.needs_newline = false;
        state.entries = entries;

        info!(
            "Removed {} known_hosts entr{} for {}",
            removed,
            if removed == 1 { "y" } else { "ies" },
            format_host_port(host, port)
        );
        Ok(removed)
    }

    /// Snapshot of all stored entries
    pub fn entries(&self) -> Vec<KnownHostEntry> {
        self.lock().map(|s| s.entries.clone()).unwrap_or_default()
    }

    /// Get the path to the known_hosts file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| Error::TrustStore {
            path: self.path.clone(),
            reason: "store lock poisoned".to_string(),
        })
    }
}

/// How the tunnel treats the server's host key
#[derive(Debug, Clone)]
pub enum HostKeyPolicy {
    /// Verify against (and learn into) the trust store
    Verify(Arc<KnownHosts>),
    /// INSECURE: accept any key without recording it
    InsecureAcceptAny,
}

impl HostKeyPolicy {
    /// Build the policy from the environment.
    ///
    /// The insecure toggle wins over everything else; otherwise the store at
    /// `known_hosts_path` (or the default location) must be usable.
    pub fn from_env(known_hosts_path: Option<&Path>) -> Result<Self> {
        if insecure_hostkey_bypass() {
            warn!(
                "{} is set: SSH host key verification is DISABLED (insecure)",
                dbtunnel_common::INSECURE_HOSTKEY_ENV
            );
            return Ok(HostKeyPolicy::InsecureAcceptAny);
        }

        let store = match known_hosts_path {
            Some(path) => KnownHosts::open(path)?,
            None => KnownHosts::open_default()?,
        };
        info!("Using known_hosts file: {}", store.path().display());
        Ok(HostKeyPolicy::Verify(Arc::new(store)))
    }

    pub fn verify(known_hosts: KnownHosts) -> Self {
        HostKeyPolicy::Verify(Arc::new(known_hosts))
    }
}

fn trust_store_error(path: &Path, err: &anyhow::Error) -> Error {
    Error::TrustStore {
        path: path.to_path_buf(),
        reason: format!("{:#}", err),
    }
}

/// Format host pattern for known_hosts (e.g., "host" or "[host]:port").
/// The host is lowercased.
pub fn format_host_pattern(host: &str, port: u16) -> String {
    let host = host.trim().to_ascii_lowercase();
    if port == 22 || port == 0 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// Extract the algorithm name from the key's SSH wire encoding
fn key_type_to_string(key: &PublicKey) -> String {
    let key_bytes = key.public_key_bytes();
    if key_bytes.len() < 4 {
        return "unknown".to_string();
    }

    let len = u32::from_be_bytes([key_bytes[0], key_bytes[1], key_bytes[2], key_bytes[3]]) as usize;
    if key_bytes.len() < 4 + len {
        return "unknown".to_string();
    }

    String::from_utf8_lossy(&key_bytes[4..4 + len]).to_string()
}

fn fingerprint_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
    )
}

/// SHA256 fingerprint of a public key, in OpenSSH format
pub fn calculate_fingerprint(key: &PublicKey) -> String {
    fingerprint_bytes(&key.public_key_bytes())
}
