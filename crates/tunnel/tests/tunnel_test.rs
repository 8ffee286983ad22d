// End-to-end tests: local forward through an in-process SSH bastion

mod common;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use zeroize::Zeroizing;

use common::{
    fixture, fixture_key_data, init_tracing, payload, round_trip, temp_policy, Accept,
    TestBastion, CLOSER_HOST, DB_HOST, GREETING, PASSWORD, USER,
};
use dbtunnel_common::{AppConfig, DatabaseEndpoint, Profile, StepStatus};
use dbtunnel_tunnel::{test_connection, HostKeyPolicy, SshTunnel, TunnelError};

fn with_identity(bastion: &TestBastion) -> dbtunnel_tunnel::TunnelConfig {
    let mut config = bastion.tunnel_config();
    config.identity_file = Some(fixture("client_ed25519"));
    config
}

fn tunnelled_profile(bastion: &TestBastion, db_host: &str) -> Profile {
    let mut profile = Profile::new(
        "tunnelled".to_string(),
        DatabaseEndpoint {
            host: db_host.to_string(),
            port: 3306,
            user: "backup".to_string(),
            password: None,
        },
    );
    profile.ssh_tunnel.enabled = true;
    profile.ssh_tunnel.host = "127.0.0.1".to_string();
    profile.ssh_tunnel.port = bastion.port();
    profile.ssh_tunnel.user = Some(USER.to_string());
    profile.ssh_tunnel.password = Some(PASSWORD.to_string());
    profile
}

fn with_password(bastion: &TestBastion, password: &str) -> dbtunnel_tunnel::TunnelConfig {
    let mut config = bastion.tunnel_config();
    config.password = Some(Zeroizing::new(password.to_string()));
    config
}

#[tokio::test]
async fn test_identity_file_end_to_end() {
    init_tracing();
    let bastion = TestBastion::start(Accept::PublicKey).await;
    let (_dir, _path, policy) = temp_policy();

    let tunnel = SshTunnel::start(with_identity(&bastion), &policy).await.unwrap();
    assert_eq!(tunnel.remote(), "db.internal:3306");

    let reply = round_trip(tunnel.local_port(), b"SELECT 1").await;
    assert_eq!(reply, b"SELECT 1");

    let stats = tunnel.stats();
    tunnel.stop().await.unwrap();
    assert_eq!(stats.total_connections(), 1);
    assert_eq!(stats.active_connections(), 0);
    assert_eq!(stats.bytes_to_remote(), 8);
    assert_eq!(stats.bytes_from_remote(), 8);
    assert_eq!(bastion.auth_attempts(), vec!["publickey"]);
}

#[tokio::test]
async fn test_ephemeral_ports_are_distinct() {
    let bastion = TestBastion::start(Accept::Password).await;
    let (_dir, _path, policy) = temp_policy();

    let a = SshTunnel::start(with_password(&bastion, PASSWORD), &policy)
        .await
        .unwrap();
    let b = SshTunnel::start(with_password(&bastion, PASSWORD), &policy)
        .await
        .unwrap();

    assert!(a.local_port() >= 1024);
    assert!(b.local_port() >= 1024);
    assert_ne!(a.local_port(), b.local_port());

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn test_fixed_local_port() {
    let bastion = TestBastion::start(Accept::Password).await;
    let (_dir, _path, policy) = temp_policy();

    let port = {
        let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        spare.local_addr().unwrap().port()
    };

    let mut config = with_password(&bastion, PASSWORD);
    config.local_port = port;
    let tunnel = SshTunnel::start(config, &policy).await.unwrap();
    assert_eq!(tunnel.local_port(), port);
    assert_eq!(round_trip(port, b"ping").await, b"ping");
    tunnel.stop().await.unwrap();
}

#[tokio::test]
async fn test_busy_local_port_is_a_bind_error() {
    let bastion = TestBastion::start(Accept::Password).await;
    let (_dir, _path, policy) = temp_policy();

    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let mut config = with_password(&bastion, PASSWORD);
    config.local_port = port;
    let err = SshTunnel::start(config, &policy).await.unwrap_err();
    match err {
        TunnelError::Bind { port: p, .. } => assert_eq!(p, port),
        other => panic!("expected bind error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_first_contact_is_recorded_once() {
    let bastion = TestBastion::start(Accept::Password).await;
    let (_dir, path, policy) = temp_policy();

    for _ in 0..2 {
        let tunnel = SshTunnel::start(with_password(&bastion, PASSWORD), &policy)
            .await
            .unwrap();
        tunnel.stop().await.unwrap();
    }

    let contents = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(
        lines[0],
        format!(
            "[127.0.0.1]:{} ssh-ed25519 {}",
            bastion.port(),
            fixture_key_data("host_ed25519.pub")
        )
    );

    // A fresh store reading the same file trusts the host too
    let reopened = HostKeyPolicy::verify(dbtunnel_tunnel::KnownHosts::open(&path).unwrap());
    let tunnel = SshTunnel::start(with_password(&bastion, PASSWORD), &reopened)
        .await
        .unwrap();
    tunnel.stop().await.unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), contents);
}

#[tokio::test]
async fn test_changed_host_key_is_rejected() {
    let bastion = TestBastion::start(Accept::Password).await;
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("known_hosts");
    let original = format!(
        "[127.0.0.1]:{} ssh-ed25519 {}\n",
        bastion.port(),
        fixture_key_data("other_host_ed25519.pub")
    );
    fs::write(&path, &original).unwrap();

    let policy = HostKeyPolicy::verify(dbtunnel_tunnel::KnownHosts::open(&path).unwrap());
    let err = SshTunnel::start(with_password(&bastion, PASSWORD), &policy)
        .await
        .unwrap_err();

    match &err {
        TunnelError::HostKeyMismatch { path: p, line, .. } => {
            assert_eq!(p, &path);
            assert_eq!(*line, 1);
        }
        other => panic!("expected host key mismatch, got {other:?}"),
    }
    assert!(err.to_string().contains("known_hosts key mismatch"));
    assert_eq!(fs::read_to_string(&path).unwrap(), original);
    // Never got as far as authentication
    assert!(bastion.auth_attempts().is_empty());
}

#[tokio::test]
async fn test_insecure_policy_records_nothing() {
    let bastion = TestBastion::start(Accept::Password).await;
    let (_dir, path, _policy) = temp_policy();

    let tunnel = SshTunnel::start(
        with_password(&bastion, PASSWORD),
        &HostKeyPolicy::InsecureAcceptAny,
    )
    .await
    .unwrap();
    assert_eq!(round_trip(tunnel.local_port(), b"x").await, b"x");
    tunnel.stop().await.unwrap();

    assert_eq!(fs::read_to_string(&path).unwrap(), "");
}

#[tokio::test]
async fn test_password_only() {
    let bastion = TestBastion::start(Accept::Password).await;
    let (_dir, _path, policy) = temp_policy();

    let tunnel = SshTunnel::start(with_password(&bastion, PASSWORD), &policy)
        .await
        .unwrap();
    tunnel.stop().await.unwrap();
    assert_eq!(bastion.auth_attempts(), vec!["password"]);
}

#[tokio::test]
async fn test_falls_back_to_password_after_key_rejected() {
    let bastion = TestBastion::start(Accept::Password).await;
    let (_dir, _path, policy) = temp_policy();

    let mut config = with_identity(&bastion);
    config.password = Some(Zeroizing::new(PASSWORD.to_string()));

    let tunnel = SshTunnel::start(config, &policy).await.unwrap();
    assert_eq!(round_trip(tunnel.local_port(), b"fallback").await, b"fallback");
    tunnel.stop().await.unwrap();
    assert_eq!(bastion.auth_attempts(), vec!["publickey", "password"]);
}

#[tokio::test]
async fn test_key_preferred_when_both_accepted() {
    let bastion = TestBastion::start(Accept::Both).await;
    let (_dir, _path, policy) = temp_policy();

    let mut config = with_identity(&bastion);
    config.password = Some(Zeroizing::new(PASSWORD.to_string()));

    let tunnel = SshTunnel::start(config, &policy).await.unwrap();
    tunnel.stop().await.unwrap();
    assert_eq!(bastion.auth_attempts(), vec!["publickey"]);
}

#[tokio::test]
async fn test_wrong_password_lists_attempts() {
    let bastion = TestBastion::start(Accept::Password).await;
    let (_dir, _path, policy) = temp_policy();

    let err = SshTunnel::start(with_password(&bastion, "wrong"), &policy)
        .await
        .unwrap_err();
    match err {
        TunnelError::Authentication { attempted, user, .. } => {
            assert_eq!(attempted, vec!["password"]);
            assert_eq!(user, common::USER);
        }
        other => panic!("expected authentication error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_no_credentials_fails_before_dialing() {
    let (_dir, path, policy) = temp_policy();

    let mut config = dbtunnel_tunnel::TunnelConfig {
        ssh_host: "127.0.0.1".to_string(),
        // Nothing listens here; dialing would fail with a different error
        ssh_port: 1,
        remote_host: "db.internal".to_string(),
        remote_port: 3306,
        ..Default::default()
    };
    config.agent = dbtunnel_common::AgentSource::Disabled;

    let err = SshTunnel::start(config, &policy).await.unwrap_err();
    assert!(matches!(err, TunnelError::NoAuthMethods));
    assert_eq!(fs::read_to_string(&path).unwrap(), "");
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let (_dir, _path, policy) = temp_policy();
    let config = dbtunnel_tunnel::TunnelConfig {
        ssh_host: "127.0.0.1".to_string(),
        remote_host: String::new(),
        remote_port: 3306,
        password: Some(Zeroizing::new(PASSWORD.to_string())),
        ..Default::default()
    };
    let err = SshTunnel::start(config, &policy).await.unwrap_err();
    assert!(matches!(err, TunnelError::Config(_)));
}

#[tokio::test]
async fn test_unreachable_bastion_is_a_dial_error() {
    let (_dir, _path, policy) = temp_policy();
    let port = {
        let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        spare.local_addr().unwrap().port()
    };

    let mut config = dbtunnel_tunnel::TunnelConfig {
        ssh_host: "127.0.0.1".to_string(),
        ssh_port: port,
        remote_host: "db.internal".to_string(),
        remote_port: 3306,
        password: Some(Zeroizing::new(PASSWORD.to_string())),
        ..Default::default()
    };
    config.agent = dbtunnel_common::AgentSource::Disabled;

    let err = SshTunnel::start(config, &policy).await.unwrap_err();
    match err {
        TunnelError::Dial { addr, .. } => assert_eq!(addr, format!("127.0.0.1:{}", port)),
        other => panic!("expected dial error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_forwarding_is_byte_exact() {
    let bastion = TestBastion::start(Accept::Password).await;
    let (_dir, _path, policy) = temp_policy();
    let tunnel = SshTunnel::start(with_password(&bastion, PASSWORD), &policy)
        .await
        .unwrap();

    for (seed, len) in [(1u64, 0usize), (2, 1), (3, 4096), (4, 1 << 20)] {
        let data = payload(seed, len);
        let reply = round_trip(tunnel.local_port(), &data).await;
        assert_eq!(reply.len(), len);
        assert!(reply == data, "payload of {} bytes corrupted", len);
    }

    tunnel.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_connections_are_isolated() {
    let bastion = TestBastion::start(Accept::Password).await;
    let (_dir, _path, policy) = temp_policy();
    let tunnel = SshTunnel::start(with_password(&bastion, PASSWORD), &policy)
        .await
        .unwrap();
    let port = tunnel.local_port();

    let tasks: Vec<_> = (0..16u64)
        .map(|i| {
            tokio::spawn(async move {
                let data = payload(100 + i, 32 * 1024 + i as usize);
                let reply = round_trip(port, &data).await;
                reply == data
            })
        })
        .collect();

    for task in tasks {
        assert!(task.await.unwrap());
    }

    assert_eq!(tunnel.stats().total_connections(), 16);
    tunnel.stop().await.unwrap();
}

#[tokio::test]
async fn test_rejected_channel_closes_only_that_connection() {
    let bastion = TestBastion::start(Accept::Password).await;
    let (_dir, _path, policy) = temp_policy();
    let tunnel = SshTunnel::start(with_password(&bastion, PASSWORD), &policy)
        .await
        .unwrap();

    bastion.reject_next_channels(1);

    let mut refused = TcpStream::connect(("127.0.0.1", tunnel.local_port()))
        .await
        .unwrap();
    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), refused.read_to_end(&mut buf))
        .await
        .expect("rejected connection should be closed");
    assert!(read.map(|n| n == 0).unwrap_or(true));

    assert_eq!(round_trip(tunnel.local_port(), b"still up").await, b"still up");
    assert_eq!(tunnel.stats().failed_channels(), 1);
    tunnel.stop().await.unwrap();
}

#[tokio::test]
async fn test_remote_close_releases_connection() {
    let bastion = TestBastion::start(Accept::Password).await;
    let (_dir, _path, policy) = temp_policy();
    let mut config = with_password(&bastion, PASSWORD);
    config.remote_host = CLOSER_HOST.to_string();
    let tunnel = SshTunnel::start(config, &policy).await.unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", tunnel.local_port()))
        .await
        .unwrap();
    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
        .await
        .expect("remote close should reach the local client")
        .unwrap();
    assert_eq!(buf, GREETING);

    // The client keeps its socket open; the tunnel must still let go
    let stats = tunnel.stats();
    let mut released = false;
    for _ in 0..100 {
        if stats.total_connections() == 1 && stats.active_connections() == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(released, "connection still active after the remote side closed");
    assert_eq!(stats.bytes_from_remote(), GREETING.len() as u64);

    drop(client);
    tunnel.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_within_bounds_the_wait() {
    let bastion = TestBastion::start(Accept::Password).await;
    let (_dir, _path, policy) = temp_policy();
    let tunnel = SshTunnel::start(with_password(&bastion, PASSWORD), &policy)
        .await
        .unwrap();

    let _idle = TcpStream::connect(("127.0.0.1", tunnel.local_port()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(
        Duration::from_secs(2),
        tunnel.stop_within(Duration::from_millis(10)),
    )
    .await
    .expect("stop_within should return promptly")
    .unwrap();
    assert!(tunnel.is_stopped());

    // Already stopped: a later call is a no-op
    tunnel.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let bastion = TestBastion::start(Accept::Password).await;
    let (_dir, _path, policy) = temp_policy();
    let tunnel = SshTunnel::start(with_password(&bastion, PASSWORD), &policy)
        .await
        .unwrap();
    let port = tunnel.local_port();

    tunnel.stop().await.unwrap();
    tunnel.stop().await.unwrap();
    assert!(tunnel.is_stopped());

    // Listener is closed
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn test_concurrent_stop() {
    let bastion = TestBastion::start(Accept::Password).await;
    let (_dir, _path, policy) = temp_policy();
    let tunnel = Arc::new(
        SshTunnel::start(with_password(&bastion, PASSWORD), &policy)
            .await
            .unwrap(),
    );

    let stops: Vec<_> = (0..8)
        .map(|_| {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.stop().await })
        })
        .collect();

    for stop in futures::future::join_all(stops).await {
        assert!(stop.unwrap().is_ok());
    }
    assert!(tunnel.is_stopped());
}

#[tokio::test]
async fn test_stop_ends_open_connections() {
    let bastion = TestBastion::start(Accept::Password).await;
    let (_dir, _path, policy) = temp_policy();
    let tunnel = SshTunnel::start(with_password(&bastion, PASSWORD), &policy)
        .await
        .unwrap();

    // Held open without EOF, so only stop can end it
    let mut idle = TcpStream::connect(("127.0.0.1", tunnel.local_port()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    tunnel.stop().await.unwrap();

    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), idle.read_to_end(&mut buf))
        .await
        .expect("connection should be closed by stop");
    assert!(read.map(|n| n == 0).unwrap_or(true));
    assert_eq!(tunnel.stats().active_connections(), 0);
}

#[tokio::test]
async fn test_drop_cancels_forwarding() {
    let bastion = TestBastion::start(Accept::Password).await;
    let (_dir, _path, policy) = temp_policy();
    let tunnel = SshTunnel::start(with_password(&bastion, PASSWORD), &policy)
        .await
        .unwrap();
    let port = tunnel.local_port();

    drop(tunnel);

    let mut closed = false;
    for _ in 0..50 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_err() {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(closed, "listener should close after the handle is dropped");
}

#[tokio::test]
async fn test_connection_report_fails_when_bastion_cannot_reach_database() {
    let bastion = TestBastion::start(Accept::Password).await;
    let (_dir, _path, policy) = temp_policy();

    let report = test_connection(
        &tunnelled_profile(&bastion, "unroutable.internal"),
        &AppConfig::default(),
        &policy,
    )
    .await;

    let tunnel_step = &report.steps[2];
    let endpoint_step = &report.steps[3];
    assert_eq!(tunnel_step.status, StepStatus::Success);
    assert_eq!(endpoint_step.status, StepStatus::Failed);
    assert!(endpoint_step.detail.contains("unroutable.internal:3306"));
    assert!(!report.healthy());
    assert!(report.error.unwrap().starts_with("Endpoint reachable"));
}

#[tokio::test]
async fn test_connection_report_through_tunnel() {
    let bastion = TestBastion::start(Accept::Password).await;
    let (_dir, _path, policy) = temp_policy();
    let app = AppConfig::default();

    // Silent server: the channel stays open through the settle window
    let report = test_connection(&tunnelled_profile(&bastion, DB_HOST), &app, &policy).await;
    assert_eq!(report.steps[3].status, StepStatus::Success);
    assert!(report.steps[3].detail.contains("no greeting"));
    assert!(report.healthy());

    // Server that speaks first
    let report = test_connection(&tunnelled_profile(&bastion, CLOSER_HOST), &app, &policy).await;
    assert_eq!(report.steps[3].status, StepStatus::Success);
    assert!(report.steps[3].detail.contains("greeting received"));
    assert!(report.healthy());
}
