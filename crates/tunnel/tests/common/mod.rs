// In-process SSH bastion and echo service for tunnel integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use russh::keys::{load_secret_key, parse_public_key_base64, PublicKey};
use russh::server::{self, Auth, Msg, Session};
use russh::Channel;
use tokio::io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use dbtunnel_tunnel::{HostKeyPolicy, KnownHosts, TunnelConfig};

pub const DB_HOST: &str = "db.internal";
/// Routed to a service that greets and hangs up
pub const CLOSER_HOST: &str = "closer.internal";
pub const GREETING: &[u8] = b"bye";
pub const DB_PORT: u16 = 3306;
pub const PASSWORD: &str = "s3cret";
pub const USER: &str = "deploy";

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// Public key stored in a `.pub` fixture
pub fn fixture_public_key(name: &str) -> PublicKey {
    let text = std::fs::read_to_string(fixture(name)).unwrap();
    let data = text.split_whitespace().nth(1).unwrap();
    parse_public_key_base64(data).unwrap()
}

/// Base64 key field of a `.pub` fixture
pub fn fixture_key_data(name: &str) -> String {
    let text = std::fs::read_to_string(fixture(name)).unwrap();
    text.split_whitespace().nth(1).unwrap().to_string()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("dbtunnel_tunnel=debug")
        .with_test_writer()
        .try_init();
}

/// TCP service that echoes everything back and closes after EOF
pub struct EchoServer {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl EchoServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                    let _ = writer.shutdown().await;
                });
            }
        });
        EchoServer { addr, task }
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// TCP service that writes a short greeting and closes immediately
pub struct CloserServer {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl CloserServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let _ = stream.write_all(GREETING).await;
                drop(stream);
            }
        });
        CloserServer { addr, task }
    }
}

impl Drop for CloserServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Which credentials the test bastion accepts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Accept {
    Password,
    PublicKey,
    Both,
}

#[derive(Clone)]
struct ServerState {
    accept: Accept,
    authorized_key: PublicKey,
    routes: Arc<HashMap<String, SocketAddr>>,
    reject_channels: Arc<AtomicUsize>,
    auth_attempts: Arc<Mutex<Vec<String>>>,
}

struct BastionHandler {
    state: ServerState,
}

impl BastionHandler {
    fn record(&self, method: &str) {
        let mut attempts = self.state.auth_attempts.lock().unwrap();
        if !attempts.iter().any(|m| m == method) {
            attempts.push(method.to_string());
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    fn key_allowed(&self, user: &str, key: &PublicKey) -> bool {
        user == USER
            && matches!(self.state.accept, Accept::PublicKey | Accept::Both)
            && key.key_data() == self.state.authorized_key.key_data()
    }
}

impl server::Handler for BastionHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        self.record("password");
        let allowed = matches!(self.state.accept, Accept::Password | Accept::Both);
        if allowed && user == USER && password == PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(Self::reject())
        }
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.record("publickey");
        if self.key_allowed(user, public_key) {
            Ok(Auth::Accept)
        } else {
            Ok(Self::reject())
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.key_allowed(user, public_key) {
            Ok(Auth::Accept)
        } else {
            Ok(Self::reject())
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let reject = self
            .state
            .reject_channels
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if reject {
            return Ok(false);
        }

        let target = match self.state.routes.get(host_to_connect) {
            Some(addr) if port_to_connect == u32::from(DB_PORT) => *addr,
            _ => return Ok(false),
        };

        tokio::spawn(async move {
            if let Ok(mut upstream) = TcpStream::connect(target).await {
                let mut stream = channel.into_stream();
                let _ = copy_bidirectional(&mut stream, &mut upstream).await;
            }
        });
        Ok(true)
    }
}

/// SSH bastion listening on 127.0.0.1 with `db.internal:3306` routed to an echo service
pub struct TestBastion {
    pub addr: SocketAddr,
    pub echo: EchoServer,
    pub closer: CloserServer,
    reject_channels: Arc<AtomicUsize>,
    auth_attempts: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl TestBastion {
    pub async fn start(accept: Accept) -> Self {
        Self::start_with_key(accept, "host_ed25519").await
    }

    pub async fn start_with_key(accept: Accept, host_key: &str) -> Self {
        let echo = EchoServer::start().await;
        let closer = CloserServer::start().await;

        let key = load_secret_key(fixture(host_key), None).unwrap();
        let config = Arc::new(server::Config {
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::from_millis(0)),
            keys: vec![key],
            ..Default::default()
        });

        let mut routes = HashMap::new();
        routes.insert(DB_HOST.to_string(), echo.addr);
        routes.insert(CLOSER_HOST.to_string(), closer.addr);

        let reject_channels = Arc::new(AtomicUsize::new(0));
        let auth_attempts = Arc::new(Mutex::new(Vec::new()));
        let state = ServerState {
            accept,
            authorized_key: fixture_public_key("client_ed25519.pub"),
            routes: Arc::new(routes),
            reject_channels: reject_channels.clone(),
            auth_attempts: auth_attempts.clone(),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = BastionHandler {
                    state: state.clone(),
                };
                let config = config.clone();
                tokio::spawn(async move {
                    if let Ok(session) = server::run_stream(config, stream, handler).await {
                        let _ = session.await;
                    }
                });
            }
        });

        TestBastion {
            addr,
            echo,
            closer,
            reject_channels,
            auth_attempts,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Refuse the next `n` direct-tcpip channel requests
    pub fn reject_next_channels(&self, n: usize) {
        self.reject_channels.store(n, Ordering::SeqCst);
    }

    /// Auth methods clients have tried, in first-seen order
    pub fn auth_attempts(&self) -> Vec<String> {
        self.auth_attempts.lock().unwrap().clone()
    }

    /// Tunnel configuration pointing at this bastion and `db.internal:3306`
    pub fn tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            ssh_host: "127.0.0.1".to_string(),
            ssh_port: self.port(),
            ssh_user: Some(USER.to_string()),
            agent: dbtunnel_common::AgentSource::Disabled,
            local_port: 0,
            remote_host: DB_HOST.to_string(),
            remote_port: DB_PORT,
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::ZERO,
            ..Default::default()
        }
    }
}

impl Drop for TestBastion {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Trust store in a fresh temp dir
pub fn temp_policy() -> (tempfile::TempDir, PathBuf, HostKeyPolicy) {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("known_hosts");
    let store = KnownHosts::open(&path).unwrap();
    (dir, path, HostKeyPolicy::verify(store))
}

/// Send `payload` through the tunnel and read back as many bytes as were sent.
///
/// The connection is closed only after the echo has arrived, since the tunnel
/// ends a connection as soon as one side finishes.
pub async fn round_trip(port: u16, payload: &[u8]) -> Vec<u8> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();

    let outgoing = payload.to_vec();
    let writer_task = tokio::spawn(async move {
        writer.write_all(&outgoing).await.unwrap();
        writer
    });

    let mut received = vec![0u8; payload.len()];
    reader.read_exact(&mut received).await.unwrap();
    drop(writer_task.await.unwrap());
    received
}

/// Deterministic payload of `len` bytes that differs per `seed`
pub fn payload(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}
