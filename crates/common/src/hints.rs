// dbtunnel - Connect Error Hints
// Turns SSH tunnel and database connect errors into actionable hints

use serde::Serialize;

const MAX_DETAIL_LINES: usize = 10;
const MAX_DETAIL_CHARS: usize = 800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectErrorKind {
    Ssh,
    Db,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectErrorInfo {
    pub kind: ConnectErrorKind,
    pub title: String,
    pub detail: String,
    pub hints: Vec<String>,
}

const SSH_MARKERS: &[&str] = &[
    "ssh handshake",
    "ssh server",
    "ssh authentication",
    "ssh tunnel",
    "known_hosts",
    "identity file",
    "no ssh authentication method",
    "local port",
];

/// (needle, hint) pairs; a hint is emitted when any needle matches
const HINT_RULES: &[(&[&str], &str)] = &[
    // SSH tunnel
    (
        &["no ssh authentication method"],
        "Set an SSH password or identity file, or make sure ssh-agent is running (SSH_AUTH_SOCK).",
    ),
    (
        &["failed to read identity file", "no such file"],
        "Check the identity file path and make sure the key exists and is readable by the current user.",
    ),
    (
        &["failed to parse identity file"],
        "The private key is invalid, unsupported or needs a passphrase; try an unencrypted key or ssh-agent.",
    ),
    (
        &["unprotected private key file", "bad permissions"],
        "Private key permissions are too open; run: chmod 600 <identity_file> and check its owner.",
    ),
    (
        &["known_hosts key mismatch"],
        "The SSH host key changed; make sure the host is correct, then update the entry in the named known_hosts file.",
    ),
    (
        &["cannot use known_hosts file"],
        "The known_hosts file is not usable; fix its permissions or set a known_hosts_path in config.toml.",
    ),
    (
        &["ssh authentication failed", "permission denied"],
        "Check the SSH user, password or key, and make sure the key is in ~/.ssh/authorized_keys on the bastion.",
    ),
    (
        &["failed to listen on local port"],
        "The local port is already in use; pick another local port or use 0 for an ephemeral one.",
    ),
    (
        &["could not resolve", "no such host", "failed to lookup address", "name or service not known"],
        "Check the hostname/DNS and network connectivity.",
    ),
    (
        &["connection refused"],
        "Connection refused; check the port, firewall/security group, and that the service is running.",
    ),
    (
        &["timed out", "timeout"],
        "Connection timed out; check the network/VPN and firewall, and that host and port are correct.",
    ),
    // Database
    (
        &["access denied", "error 1045"],
        "Check the database user/password, the allowed host list, and the user's privileges.",
    ),
    (
        &["unknown database"],
        "The initial database does not exist or the user has no access to it.",
    ),
    (
        &["x509", "tls", "ssl"],
        "There is a TLS/SSL problem; check the server certificate/CA configuration.",
    ),
    (
        &["caching_sha2_password", "public key retrieval is not allowed"],
        "The server requires caching_sha2_password; use TLS or a compatible auth plugin for this user.",
    ),
    (
        &["database host cannot be empty", "database user cannot be empty", "invalid database port"],
        "Preflight failed; fix the empty or invalid fields and try again.",
    ),
];

/// Classify a connect error message and collect hints for it
pub fn describe_connect_error(message: &str) -> ConnectErrorInfo {
    let msg = message.trim();
    let lower = msg.to_lowercase();

    let kind = if SSH_MARKERS.iter().any(|m| lower.contains(m)) {
        ConnectErrorKind::Ssh
    } else {
        ConnectErrorKind::Db
    };

    let title = match kind {
        ConnectErrorKind::Ssh => "SSH tunnel failed",
        ConnectErrorKind::Db => "Database connection failed",
    };

    let hints = HINT_RULES
        .iter()
        .filter(|(needles, _)| needles.iter().any(|n| lower.contains(n)))
        .map(|(_, hint)| hint.to_string());

    ConnectErrorInfo {
        kind,
        title: title.to_string(),
        detail: summarize(msg, MAX_DETAIL_LINES, MAX_DETAIL_CHARS),
        hints: unique_hints(hints),
    }
}

fn unique_hints(hints: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for hint in hints {
        let hint = hint.trim();
        if hint.is_empty() || out.iter().any(|h| h == hint) {
            continue;
        }
        out.push(hint.to_string());
    }
    out
}

fn summarize(msg: &str, max_lines: usize, max_chars: usize) -> String {
    let joined = msg.lines().take(max_lines).collect::<Vec<_>>().join("\n");
    let joined = joined.trim();
    if joined.chars().count() <= max_chars {
        return joined.to_string();
    }
    let mut cut: String = joined.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mismatch_is_ssh() {
        let info = describe_connect_error(
            "SSH handshake with bastion:22 failed: known_hosts key mismatch for 'bastion'",
        );
        assert_eq!(info.kind, ConnectErrorKind::Ssh);
        assert_eq!(info.title, "SSH tunnel failed");
        assert_eq!(info.hints.len(), 1);
        assert!(info.hints[0].contains("host key changed"));
    }

    #[test]
    fn test_database_errors() {
        let info = describe_connect_error("Error 1045: Access denied for user 'backup'");
        assert_eq!(info.kind, ConnectErrorKind::Db);
        assert!(info.hints[0].contains("database user/password"));
    }

    #[test]
    fn test_hints_are_unique() {
        // "timed out" and "timeout" both point at the same hint
        let info = describe_connect_error(
            "Connection to SSH server bastion:22 timed out after 10s (timeout)",
        );
        assert_eq!(info.kind, ConnectErrorKind::Ssh);
        assert_eq!(info.hints.len(), 1);
    }

    #[test]
    fn test_missing_auth_methods() {
        let info = describe_connect_error("No SSH authentication method available");
        assert!(info.hints[0].contains("ssh-agent"));
    }

    #[test]
    fn test_detail_is_truncated() {
        let long = "x".repeat(2000);
        let info = describe_connect_error(&long);
        assert_eq!(info.detail.chars().count(), MAX_DETAIL_CHARS + 3);
        assert!(info.detail.ends_with("..."));

        let many_lines = (0..20).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let info = describe_connect_error(&many_lines);
        assert_eq!(info.detail.lines().count(), MAX_DETAIL_LINES);
    }

    #[test]
    fn test_unknown_error_has_no_hints() {
        let info = describe_connect_error("something odd happened");
        assert!(info.hints.is_empty());
        assert_eq!(info.kind, ConnectErrorKind::Db);
    }
}
