// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 dbtunnel Contributors

// dbtunnel - Tunnel Module
// Establishes the SSH session and owns the lifecycle of one local forward

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use russh::client::{self, Config, Handle};
use russh::keys::PublicKey;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use dbtunnel_common::{format_host_port, Error, Result, TunnelConfig, INSECURE_HOSTKEY_ENV};

use crate::auth::{agent_socket, authenticate, build_auth_methods, resolve_user};
use crate::forward::{run_accept_loop, ForwardStats, ForwardTarget};
use crate::known_hosts::{calculate_fingerprint, HostKeyPolicy, TrustDecision};
use crate::port::pick_local_port;

/// How long stop waits for the accept loop and connection tasks to wind down
const STOP_GRACE: Duration = Duration::from_millis(500);

const KEEPALIVE_MAX: usize = 3;

/// SSH client handler for russh: host key verification only
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    /// Why the host key was refused, read back after the handshake fails
    rejection: Arc<Mutex<Option<Error>>>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let known_hosts = match &self.policy {
            HostKeyPolicy::InsecureAcceptAny => {
                warn!(
                    "Accepting host key {} for {} without verification ({} is set)",
                    calculate_fingerprint(server_public_key),
                    format_host_port(&self.host, self.port),
                    INSECURE_HOSTKEY_ENV
                );
                return Ok(true);
            }
            HostKeyPolicy::Verify(known_hosts) => known_hosts,
        };

        // The store takes a lock and may fsync on first contact
        let store = Arc::clone(known_hosts);
        let (host, port, key) = (self.host.clone(), self.port, server_public_key.clone());
        let checked = tokio::task::spawn_blocking(move || store.verify_or_trust(&host, port, &key))
            .await
            .unwrap_or_else(|e| {
                Err(Error::TrustStore {
                    path: known_hosts.path().to_path_buf(),
                    reason: format!("host key check did not complete: {}", e),
                })
            });

        match checked {
            Ok(TrustDecision::Trusted) => {
                info!("Host key verified for {}", format_host_port(&self.host, self.port));
                Ok(true)
            }
            Ok(TrustDecision::Learned) => {
                warn!(
                    "Permanently added {} ({}) to {}",
                    format_host_port(&self.host, self.port),
                    calculate_fingerprint(server_public_key),
                    known_hosts.path().display()
                );
                Ok(true)
            }
            Err(err) => {
                if let Error::HostKeyMismatch { line, .. } = &err {
                    log_mismatch_banner(
                        &format_host_port(&self.host, self.port),
                        &calculate_fingerprint(server_public_key),
                        &known_hosts.path().display().to_string(),
                        *line,
                    );
                } else {
                    error!("Host key check failed: {}", err);
                }
                if let Ok(mut slot) = self.rejection.lock() {
                    *slot = Some(err);
                }
                // Hard reject - do not allow connection
                Ok(false)
            }
        }
    }
}

fn log_mismatch_banner(addr: &str, actual_fingerprint: &str, path: &str, line: usize) {
    error!("@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@");
    error!("@    WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!     @");
    error!("@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@");
    error!("IT IS POSSIBLE THAT SOMEONE IS DOING SOMETHING NASTY!");
    error!("It is also possible that the host key has just been changed.");
    error!("Host: {}", addr);
    error!("Presented fingerprint: {}", actual_fingerprint);
    error!("Offending entry: {} line {}", path, line);
    error!("Verify the host, then remove that line (dbtunnel known-hosts forget) to trust the new key.");
}

/// A running local port forward through an SSH bastion.
///
/// Dropping the handle cancels forwarding; call [`SshTunnel::stop`] to also
/// disconnect the SSH session and wait for in-flight connections.
pub struct SshTunnel {
    local_port: u16,
    remote: String,
    session: Arc<Handle<ClientHandler>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    stats: Arc<ForwardStats>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for SshTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTunnel")
            .field("local_port", &self.local_port)
            .field("remote", &self.remote)
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl SshTunnel {
    /// Connect to the bastion, authenticate, and start forwarding
    /// `127.0.0.1:<local port>` to `remote_host:remote_port`.
    ///
    /// To bound or cancel establishment, wrap the future in
    /// `tokio::time::timeout` or drop it.
    pub async fn start(config: TunnelConfig, policy: &HostKeyPolicy) -> Result<SshTunnel> {
        config.validate()?;

        // Credentials first so configuration mistakes fail before any network I/O
        let socket = agent_socket(&config.agent);
        let methods = build_auth_methods(&config, socket.as_deref()).await?;
        let user = resolve_user(&config);

        let local = pick_local_port(config.local_port)?;

        let ssh_port = config.effective_ssh_port();
        let addr = format_host_port(&config.ssh_host, ssh_port);
        info!("Connecting to SSH server: {}", addr);

        let tcp = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(Error::Dial { addr, source }),
            Err(_) => {
                return Err(Error::Timeout {
                    addr,
                    timeout: config.connect_timeout,
                })
            }
        };
        let _ = tcp.set_nodelay(true);

        // --- SSH client configuration ---
        let mut cfg = Config::default();
        cfg.nodelay = true;
        if !config.keepalive_interval.is_zero() {
            cfg.keepalive_interval = Some(config.keepalive_interval);
            cfg.keepalive_max = KEEPALIVE_MAX;
        }

        let rejection = Arc::new(Mutex::new(None));
        let handler = ClientHandler {
            host: config.ssh_host.trim().to_string(),
            port: ssh_port,
            policy: policy.clone(),
            rejection: rejection.clone(),
        };

        let mut session = match tokio::time::timeout(
            config.connect_timeout,
            client::connect_stream(Arc::new(cfg), tcp, handler),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                let refused = rejection.lock().ok().and_then(|mut slot| slot.take());
                return Err(refused.unwrap_or_else(|| Error::Handshake {
                    addr,
                    reason: e.to_string(),
                }));
            }
            Err(_) => {
                return Err(Error::Timeout {
                    addr,
                    timeout: config.connect_timeout,
                })
            }
        };

        debug!("SSH handshake with {} complete, authenticating as '{}'", addr, user);
        if let Err(e) = authenticate(&mut session, &user, methods).await {
            disconnect(&session, "authentication failed").await;
            return Err(e);
        }

        let local_port = local.port();
        let listener = match local.into_listener().await {
            Ok(listener) => listener,
            Err(e) => {
                // Do not leak the transport when the local port is unavailable
                disconnect(&session, "local bind failed").await;
                return Err(e);
            }
        };

        let session = Arc::new(session);
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let stats = Arc::new(ForwardStats::default());
        let target = ForwardTarget {
            host: config.remote_host.trim().to_string(),
            port: config.remote_port,
        };
        let remote = format_host_port(&target.host, target.port);

        tracker.spawn(run_accept_loop(
            listener,
            session.clone(),
            target,
            cancel.clone(),
            tracker.clone(),
            stats.clone(),
        ));

        info!(
            "SSH tunnel ready: 127.0.0.1:{} -> {} via {}",
            local_port, remote, addr
        );

        Ok(SshTunnel {
            local_port,
            remote,
            session,
            cancel,
            tracker,
            stats,
            stopped: AtomicBool::new(false),
        })
    }

    /// Port the tunnel listens on (127.0.0.1)
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Remote endpoint as seen from the bastion
    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        self.stats.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop forwarding and disconnect. Safe to call any number of times, from
    /// any number of tasks; only the first call does the work.
    ///
    /// Waits at most 500 ms for in-flight connections to wind down before the
    /// session is closed; use [`SshTunnel::stop_within`] to choose the bound.
    pub async fn stop(&self) -> Result<()> {
        self.stop_within(STOP_GRACE).await
    }

    /// Like [`SshTunnel::stop`], waiting at most `grace` for connection tasks.
    /// Later calls return immediately.
    pub async fn stop_within(&self, grace: Duration) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Stopping SSH tunnel on 127.0.0.1:{}", self.local_port);
        self.cancel.cancel();
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "Forwarding tasks for port {} did not finish within {:?}",
                self.local_port, grace
            );
        }

        disconnect(&self.session, "tunnel stopped").await;
        Ok(())
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        if !self.stopped.load(Ordering::SeqCst) {
            debug!("SSH tunnel on port {} dropped without stop", self.local_port);
        }
        self.cancel.cancel();
    }
}

async fn disconnect(session: &Handle<ClientHandler>, reason: &str) {
    if let Err(e) = session
        .disconnect(russh::Disconnect::ByApplication, reason, "en")
        .await
    {
        debug!("SSH disconnect: {}", e);
    }
}
