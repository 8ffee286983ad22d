// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 dbtunnel Contributors

// dbtunnel - Network Helpers
// Host/port formatting shared by the tunnel and the CLI

use std::net::IpAddr;

/// True when `host` is a literal IPv4/IPv6 address (no DNS lookup needed)
pub fn is_ip_literal(host: &str) -> bool {
    strip_brackets(host).parse::<IpAddr>().is_ok()
}

/// Join host and port, bracketing IPv6 literals ("[::1]:22")
pub fn format_host_port(host: &str, port: u16) -> String {
    let host = strip_brackets(host);
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}
