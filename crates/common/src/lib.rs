// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 dbtunnel Contributors

// dbtunnel - Common Library
// Shared configuration, profile I/O, error types and helpers

pub mod config;
pub mod error;
pub mod hints;
pub mod network;
pub mod profile_manager;
pub mod types;

pub use config::{
    insecure_hostkey_bypass, AgentSource, AppConfig, DatabaseEndpoint, Profile, ProfileMetadata,
    SshTunnelSettings, TunnelConfig, INSECURE_HOSTKEY_ENV,
};
pub use error::{Error, Result};
pub use hints::{describe_connect_error, ConnectErrorInfo, ConnectErrorKind};
pub use network::{format_host_port, is_ip_literal};
pub use profile_manager::{
    delete_profile_by_name, load_all_profiles, load_profile, load_profile_by_name, profiles_dir,
    save_profile,
};
pub use types::{AuthMethodKind, ConnectionTestReport, StepResult, StepStatus};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;
pub use zeroize::Zeroizing;
