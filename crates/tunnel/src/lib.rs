// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 dbtunnel Contributors

// dbtunnel - Tunnel Library
// SSH local port forwarding for reaching databases behind a bastion

pub mod auth;
pub mod connection;
pub mod forward;
pub mod known_hosts;
pub mod permissions;
pub mod port;
pub mod tunnel;

pub use auth::{build_auth_methods, AuthMethod};
pub use connection::{connect_endpoint, preflight, test_connection, EndpointGuard};
pub use forward::ForwardStats;
pub use known_hosts::{
    calculate_fingerprint, HostKeyPolicy, KnownHostEntry, KnownHosts, TrustDecision,
};
pub use port::{pick_local_port, LocalPort};
pub use tunnel::SshTunnel;

/// Errors returned while establishing or running a tunnel
pub use dbtunnel_common::Error as TunnelError;
pub use dbtunnel_common::{Result, TunnelConfig};
