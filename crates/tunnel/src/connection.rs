// dbtunnel - Connection Manager
// Gives database callers a reachable endpoint for a profile, tunnelled or not

use std::fs;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::net::{lookup_host, TcpStream};
use tracing::{debug, info};

use dbtunnel_common::{
    format_host_port, is_ip_literal, AppConfig, ConnectionTestReport, Error, Profile, Result,
    StepResult, StepStatus,
};

use crate::auth::resolve_identity_path;
use crate::known_hosts::HostKeyPolicy;
use crate::tunnel::SshTunnel;

pub const STEP_DNS: &str = "DNS resolution";
pub const STEP_TCP: &str = "TCP connection";
pub const STEP_TUNNEL: &str = "SSH tunnel";
pub const STEP_ENDPOINT: &str = "Endpoint reachable";

/// How long a tunnelled endpoint check waits for the far side to speak or hang up
const ENDPOINT_SETTLE: Duration = Duration::from_secs(1);

/// Validate a profile before any network I/O.
///
/// Beyond the stored shape this checks that a configured identity file exists,
/// is a regular file and can be read.
pub fn preflight(profile: &Profile) -> Result<()> {
    profile.validate()?;

    let ssh = &profile.ssh_tunnel;
    if !ssh.enabled {
        return Ok(());
    }

    if let Some(path) = ssh.identity_file.as_deref() {
        if !path.as_os_str().is_empty() {
            let resolved = resolve_identity_path(path)?;
            let metadata = fs::metadata(&resolved).map_err(|e| Error::IdentityFileRead {
                path: resolved.clone(),
                reason: e.to_string(),
            })?;
            if metadata.is_dir() {
                return Err(Error::IdentityFileRead {
                    path: resolved,
                    reason: "path is a directory".to_string(),
                });
            }
            fs::File::open(&resolved).map_err(|e| Error::IdentityFileRead {
                path: resolved.clone(),
                reason: e.to_string(),
            })?;
        }
    }

    Ok(())
}

/// Endpoint a database client should connect to, plus the tunnel backing it
#[derive(Debug)]
pub struct EndpointGuard {
    host: String,
    port: u16,
    tunnel: Option<SshTunnel>,
}

impl EndpointGuard {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// host:port for display and client DSNs
    pub fn endpoint(&self) -> String {
        format_host_port(&self.host, self.port)
    }

    pub fn tunnel(&self) -> Option<&SshTunnel> {
        self.tunnel.as_ref()
    }

    pub fn is_tunnelled(&self) -> bool {
        self.tunnel.is_some()
    }

    /// Tear down the tunnel, if any
    pub async fn stop(&self) -> Result<()> {
        match &self.tunnel {
            Some(tunnel) => tunnel.stop().await,
            None => Ok(()),
        }
    }
}

/// Resolve the endpoint for a profile, starting its SSH tunnel when enabled
pub async fn connect_endpoint(
    profile: &Profile,
    app: &AppConfig,
    policy: &HostKeyPolicy,
) -> Result<EndpointGuard> {
    preflight(profile)?;

    if !profile.ssh_tunnel.enabled {
        debug!(
            "Profile '{}' connects directly to {}",
            profile.metadata.name,
            format_host_port(&profile.database.host, profile.database.port)
        );
        return Ok(EndpointGuard {
            host: profile.database.host.trim().to_string(),
            port: profile.database.port,
            tunnel: None,
        });
    }

    let tunnel = SshTunnel::start(profile.tunnel_config(app), policy).await?;
    info!(
        "Profile '{}' reachable at 127.0.0.1:{}",
        profile.metadata.name,
        tunnel.local_port()
    );

    Ok(EndpointGuard {
        host: "127.0.0.1".to_string(),
        port: tunnel.local_port(),
        tunnel: Some(tunnel),
    })
}

/// Step-by-step connectivity check for a profile.
///
/// DNS and TCP target the SSH host when tunnelled, the database otherwise.
/// Through a tunnel the last step needs the bastion to open a channel to the
/// database; database login is up to the caller.
pub async fn test_connection(
    profile: &Profile,
    app: &AppConfig,
    policy: &HostKeyPolicy,
) -> ConnectionTestReport {
    let started = Instant::now();
    let mut report = ConnectionTestReport::default();
    let timeout = app.connect_timeout();

    if let Err(e) = preflight(profile) {
        report.push(StepResult::new("Preflight", StepStatus::Failed, e.to_string()));
        report.disable_remaining(&[STEP_DNS, STEP_TCP, STEP_TUNNEL, STEP_ENDPOINT], "");
        report.error = Some(e.to_string());
        report.total = started.elapsed();
        return report;
    }

    let tunnelled = profile.ssh_tunnel.enabled;
    let (host, port) = if tunnelled {
        let port = match profile.ssh_tunnel.port {
            0 => 22,
            p => p,
        };
        (profile.ssh_tunnel.host.trim().to_string(), port)
    } else {
        (profile.database.host.trim().to_string(), profile.database.port)
    };

    // Step 1: DNS
    let step = test_dns(&host, port, timeout).await;
    if fail_fast(&mut report, step, &[STEP_TCP, STEP_TUNNEL, STEP_ENDPOINT]) {
        report.total = started.elapsed();
        return report;
    }

    // Step 2: TCP
    let step = test_tcp(STEP_TCP, &host, port, timeout).await;
    if fail_fast(&mut report, step, &[STEP_TUNNEL, STEP_ENDPOINT]) {
        report.total = started.elapsed();
        return report;
    }

    // Step 3: SSH tunnel
    let step_started = Instant::now();
    let guard = tokio::time::timeout(timeout, connect_endpoint(profile, app, policy)).await;
    let guard = match guard {
        Ok(Ok(guard)) => {
            let detail = match guard.tunnel() {
                Some(t) => format!("active (local port {})", t.local_port()),
                None => "not enabled".to_string(),
            };
            let status = if guard.is_tunnelled() {
                StepStatus::Success
            } else {
                StepStatus::Skipped
            };
            report.push(
                StepResult::new(STEP_TUNNEL, status, detail).with_duration(step_started.elapsed()),
            );
            guard
        }
        Ok(Err(e)) => {
            let step = StepResult::new(STEP_TUNNEL, StepStatus::Failed, e.to_string())
                .with_duration(step_started.elapsed());
            fail_fast(&mut report, step, &[STEP_ENDPOINT]);
            report.total = started.elapsed();
            return report;
        }
        Err(_) => {
            let step = StepResult::new(
                STEP_TUNNEL,
                StepStatus::Failed,
                format!("timed out after {:?}", timeout),
            )
            .with_duration(step_started.elapsed());
            fail_fast(&mut report, step, &[STEP_ENDPOINT]);
            report.total = started.elapsed();
            return report;
        }
    };

    // Step 4: endpoint
    report.endpoint = Some(guard.endpoint());
    let step = match guard.tunnel() {
        Some(tunnel) => test_tunnelled_endpoint(tunnel, timeout).await,
        None => test_tcp(STEP_ENDPOINT, guard.host(), guard.port(), timeout).await,
    };
    fail_fast(&mut report, step, &[]);

    if let Err(e) = guard.stop().await {
        debug!("Stopping test tunnel: {}", e);
    }

    report.total = started.elapsed();
    report
}

/// Record a step; on failure mark the remaining steps disabled. Returns true
/// when the step failed.
fn fail_fast(report: &mut ConnectionTestReport, step: StepResult, remaining: &[&str]) -> bool {
    let failed = step.status == StepStatus::Failed;
    if failed && report.error.is_none() {
        report.error = Some(format!("{}: {}", step.name, step.detail));
    }
    report.push(step);
    if failed {
        report.disable_remaining(remaining, "previous step failed");
    }
    failed
}

async fn test_dns(host: &str, port: u16, timeout: Duration) -> StepResult {
    if is_ip_literal(host) {
        return StepResult::new(STEP_DNS, StepStatus::Skipped, "IP address");
    }

    let started = Instant::now();
    let result = tokio::time::timeout(timeout, lookup_host((host, port))).await;
    let step = match result {
        Ok(Ok(addrs)) => {
            let addrs: Vec<String> = addrs.map(|a| a.ip().to_string()).collect();
            if addrs.is_empty() {
                StepResult::new(STEP_DNS, StepStatus::Failed, format!("no addresses for {}", host))
            } else {
                StepResult::new(STEP_DNS, StepStatus::Success, addrs.join(", "))
            }
        }
        Ok(Err(e)) => StepResult::new(
            STEP_DNS,
            StepStatus::Failed,
            format!("could not resolve {}: {}", host, e),
        ),
        Err(_) => StepResult::new(
            STEP_DNS,
            StepStatus::Failed,
            format!("lookup of {} timed out after {:?}", host, timeout),
        ),
    };
    step.with_duration(started.elapsed())
}

async fn test_tcp(name: &str, host: &str, port: u16, timeout: Duration) -> StepResult {
    let addr = format_host_port(host, port);
    let started = Instant::now();
    let step = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => StepResult::new(name, StepStatus::Success, addr),
        Ok(Err(e)) => StepResult::new(name, StepStatus::Failed, format!("{}: {}", addr, e)),
        Err(_) => StepResult::new(
            name,
            StepStatus::Failed,
            format!("{} timed out after {:?}", addr, timeout),
        ),
    };
    step.with_duration(started.elapsed())
}

/// The local listener accepts even when the bastion cannot reach the database,
/// so a tunnelled endpoint only counts as reachable once the channel opened:
/// the server greeted us, or the connection stayed up for the settle window.
async fn test_tunnelled_endpoint(tunnel: &SshTunnel, timeout: Duration) -> StepResult {
    let stats = tunnel.stats();
    let failed_before = stats.failed_channels();
    let total_before = stats.total_connections();
    let addr = format!("127.0.0.1:{}", tunnel.local_port());
    let remote = tunnel.remote().to_string();
    let started = Instant::now();

    let mut stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return StepResult::new(STEP_ENDPOINT, StepStatus::Failed, format!("{}: {}", addr, e))
                .with_duration(started.elapsed())
        }
        Err(_) => {
            return StepResult::new(
                STEP_ENDPOINT,
                StepStatus::Failed,
                format!("{} timed out after {:?}", addr, timeout),
            )
            .with_duration(started.elapsed())
        }
    };

    let unreachable = || {
        StepResult::new(
            STEP_ENDPOINT,
            StepStatus::Failed,
            format!("tunnel closed the connection; bastion could not reach {}", remote),
        )
    };

    let mut buf = [0u8; 1];
    let step = tokio::select! {
        read = stream.read(&mut buf) => match read {
            Ok(n) if n > 0 => StepResult::new(
                STEP_ENDPOINT,
                StepStatus::Success,
                format!("{} (server greeting received)", addr),
            ),
            Ok(_) => unreachable(),
            Err(e) => StepResult::new(
                STEP_ENDPOINT,
                StepStatus::Failed,
                format!("connection to {} through the tunnel failed: {}", remote, e),
            ),
        },
        _ = tokio::time::sleep(ENDPOINT_SETTLE.min(timeout)) => {
            if stats.failed_channels() > failed_before {
                unreachable()
            } else if stats.total_connections() > total_before {
                StepResult::new(
                    STEP_ENDPOINT,
                    StepStatus::Success,
                    format!("{} (connected, no greeting)", addr),
                )
            } else {
                StepResult::new(
                    STEP_ENDPOINT,
                    StepStatus::Failed,
                    format!("no channel to {} within {:?}", remote, ENDPOINT_SETTLE.min(timeout)),
                )
            }
        }
    };
    step.with_duration(started.elapsed())
}
