//! Integration tests for client-server communication over loopback TCP:
//! version exchange, key exchange, authentication, channel traffic with
//! flow control, and rekeying under load.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

use skiff_platform::{SkiffError, SkiffResult};
use skiff_proto::ssh::auth::{AuthMethod, AuthOutcome, Authenticator, Prompt, StaticAuthenticator};
use skiff_proto::ssh::client::{SshClient, SshClientConfig};
use skiff_proto::ssh::config::SshConfig;
use skiff_proto::ssh::hostkey::{Ed25519HostKey, HostKeyProvider};
use skiff_proto::ssh::knownhosts::AcceptAllVerifier;
use skiff_proto::ssh::server::{ExecOutcome, SessionHandler, SshServer};

const TICK: Duration = Duration::from_millis(20);
const WAIT: Duration = Duration::from_secs(10);

fn test_client_config() -> SshClientConfig {
    SshClientConfig {
        ssh: SshConfig::default(),
        verifier: Arc::new(AcceptAllVerifier),
    }
}

/// Echoes commands back, with a marker exit status.
struct EchoHandler;

#[async_trait]
impl SessionHandler for EchoHandler {
    async fn handle_exec(&self, command: &str) -> SkiffResult<ExecOutcome> {
        if command == "fail" {
            return Ok(ExecOutcome {
                stdout: Vec::new(),
                stderr: b"command failed".to_vec(),
                exit_status: 1,
            });
        }
        Ok(ExecOutcome::success(
            format!("Executed: {}", command).into_bytes(),
        ))
    }
}

/// Collects inbound channel data for byte-exact comparison.
struct SinkHandler {
    received: Arc<Mutex<Vec<u8>>>,
}

#[async_trait]
impl SessionHandler for SinkHandler {
    async fn handle_exec(&self, _command: &str) -> SkiffResult<ExecOutcome> {
        Ok(ExecOutcome::success(Vec::new()))
    }

    async fn handle_data(&self, data: &[u8]) -> SkiffResult<()> {
        self.received.lock().await.extend_from_slice(data);
        Ok(())
    }
}

async fn spawn_server(
    config: SshConfig,
    authenticator: Arc<dyn Authenticator>,
    handler: Arc<dyn SessionHandler>,
) -> std::net::SocketAddr {
    let host_key = Arc::new(Ed25519HostKey::generate());
    let server = SshServer::bind_with_config("127.0.0.1:0", config, host_key, authenticator)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok(mut session) = server.accept().await {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let _ = session.run(handler).await;
            });
        }
    });

    addr
}

async fn default_server() -> std::net::SocketAddr {
    spawn_server(
        SshConfig::default(),
        Arc::new(StaticAuthenticator::new().with_password("alice", "hunter2")),
        Arc::new(EchoHandler),
    )
    .await
}

#[tokio::test]
async fn test_handshake_reaches_running() {
    let addr = default_server().await;

    let mut client = timeout(
        WAIT,
        SshClient::connect_with_config(&addr.to_string(), test_client_config()),
    )
    .await
    .unwrap()
    .unwrap();

    // Session id is the SHA-256 exchange hash
    assert_eq!(client.session_id().len(), 32);
    assert!(client
        .server_host_key_fingerprint()
        .starts_with("SHA256:"));

    timeout(WAIT, client.authenticate_password("alice", "hunter2"))
        .await
        .unwrap()
        .unwrap();
    assert!(client.is_authenticated());
    assert_eq!(client.username(), Some("alice"));
}

#[tokio::test]
async fn test_negotiation_failure_disjoint_ciphers() {
    let mut server_config = SshConfig::default();
    server_config.ciphers = vec!["aes256-ctr".to_string()];
    let addr = spawn_server(
        server_config,
        Arc::new(StaticAuthenticator::new()),
        Arc::new(EchoHandler),
    )
    .await;

    let mut client_config = test_client_config();
    client_config.ssh.ciphers = vec!["aes128-cbc".to_string()];

    let result = timeout(
        WAIT,
        SshClient::connect_with_config(&addr.to_string(), client_config),
    )
    .await
    .unwrap();

    match result {
        Err(SkiffError::Negotiation(_)) => {}
        Err(SkiffError::Disconnected { code, .. }) => assert_eq!(code, 3),
        other => panic!("expected negotiation failure, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_password_auth_wrong_password_fails() {
    let addr = default_server().await;

    let mut client = SshClient::connect_with_config(&addr.to_string(), test_client_config())
        .await
        .unwrap();
    let err = timeout(WAIT, client.authenticate_password("alice", "letmein"))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, SkiffError::Auth(_)));
    assert!(!client.is_authenticated());

    // Retry within the budget succeeds
    timeout(WAIT, client.authenticate_password("alice", "hunter2"))
        .await
        .unwrap()
        .unwrap();
    assert!(client.is_authenticated());
}

#[tokio::test]
async fn test_publickey_auth() {
    let user_key = Ed25519HostKey::generate();
    let addr = spawn_server(
        SshConfig::default(),
        Arc::new(StaticAuthenticator::new().with_authorized_key(user_key.public_blob())),
        Arc::new(EchoHandler),
    )
    .await;

    let mut client = SshClient::connect_with_config(&addr.to_string(), test_client_config())
        .await
        .unwrap();
    timeout(WAIT, client.authenticate_publickey("carol", &user_key))
        .await
        .unwrap()
        .unwrap();
    assert!(client.is_authenticated());
}

#[tokio::test]
async fn test_publickey_auth_unknown_key_rejected() {
    let addr = spawn_server(
        SshConfig::default(),
        Arc::new(StaticAuthenticator::new()),
        Arc::new(EchoHandler),
    )
    .await;

    let mut client = SshClient::connect_with_config(&addr.to_string(), test_client_config())
        .await
        .unwrap();
    let stranger = Ed25519HostKey::generate();
    let err = timeout(WAIT, client.authenticate_publickey("carol", &stranger))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, SkiffError::Auth(_)));
}

#[tokio::test]
async fn test_keyboard_interactive_auth() {
    /// Accepts any user whose single response is "4242".
    struct PinAuthenticator;

    #[async_trait]
    impl Authenticator for PinAuthenticator {
        async fn authenticate(
            &self,
            _user: &str,
            method: &AuthMethod,
            _session_id: &[u8],
        ) -> SkiffResult<AuthOutcome> {
            match method {
                AuthMethod::KeyboardInteractive { .. } => Ok(AuthOutcome::NeedsMore {
                    prompts: vec![Prompt {
                        prompt: "PIN: ".to_string(),
                        echo: false,
                    }],
                    name: "PIN".to_string(),
                    instruction: "Enter the PIN".to_string(),
                }),
                _ => Ok(AuthOutcome::Fail),
            }
        }

        async fn check_responses(
            &self,
            _user: &str,
            responses: &[String],
            _session_id: &[u8],
        ) -> SkiffResult<AuthOutcome> {
            if responses == ["4242".to_string()] {
                Ok(AuthOutcome::Ok)
            } else {
                Ok(AuthOutcome::Fail)
            }
        }
    }

    let addr = spawn_server(
        SshConfig::default(),
        Arc::new(PinAuthenticator),
        Arc::new(EchoHandler),
    )
    .await;

    let mut client = SshClient::connect_with_config(&addr.to_string(), test_client_config())
        .await
        .unwrap();
    timeout(
        WAIT,
        client.authenticate_keyboard_interactive("dave", |_name, _instruction, prompts| {
            assert_eq!(prompts.len(), 1);
            vec!["4242".to_string()]
        }),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(client.is_authenticated());
}

#[tokio::test]
async fn test_auth_budget_exhaustion_disconnects() {
    let mut config = SshConfig::default();
    config.max_auth_requests = 3;
    let addr = spawn_server(
        config,
        Arc::new(StaticAuthenticator::new()),
        Arc::new(EchoHandler),
    )
    .await;

    let mut client = SshClient::connect_with_config(&addr.to_string(), test_client_config())
        .await
        .unwrap();

    let mut last = None;
    for guess in ["a", "b", "c", "d"] {
        match timeout(WAIT, client.authenticate_password("mallory", guess)).await {
            Ok(Err(e)) => last = Some(e),
            Ok(Ok(())) => panic!("guess should not authenticate"),
            Err(_) => panic!("timed out"),
        }
        if matches!(
            last,
            Some(SkiffError::Disconnected { .. }) | Some(SkiffError::Io(_))
        ) {
            break;
        }
    }
    // The final attempt sees the NO_MORE_AUTH_METHODS disconnect (or the
    // already-closed socket)
    assert!(matches!(
        last,
        Some(SkiffError::Disconnected { .. }) | Some(SkiffError::Io(_))
    ));
}

#[tokio::test]
async fn test_exec_round_trip() {
    let addr = default_server().await;

    let mut client = SshClient::connect_with_config(&addr.to_string(), test_client_config())
        .await
        .unwrap();
    client
        .authenticate_password("alice", "hunter2")
        .await
        .unwrap();

    let output = timeout(WAIT, client.execute("uname -a"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(output.stdout, b"Executed: uname -a");
    assert_eq!(output.exit_status, Some(0));

    // A second command on the same transport reuses the freed channel slot
    let output = timeout(WAIT, client.execute("fail")).await.unwrap().unwrap();
    assert_eq!(output.stderr, b"command failed");
    assert_eq!(output.exit_status, Some(1));
}

#[tokio::test]
async fn test_channel_window_parking_and_resume() {
    // Server grants a tiny window (8 bytes) and packet cap (4 bytes): a
    // 12-byte write must park after two packets until an adjust arrives
    let received = Arc::new(Mutex::new(Vec::new()));
    let mut server_config = SshConfig::default();
    server_config.initial_window_size = 8;
    server_config.max_packet_size = 4;

    let addr = spawn_server(
        server_config,
        Arc::new(StaticAuthenticator::new().with_password("alice", "hunter2")),
        Arc::new(SinkHandler {
            received: Arc::clone(&received),
        }),
    )
    .await;

    let mut client = SshClient::connect_with_config(&addr.to_string(), test_client_config())
        .await
        .unwrap();
    client
        .authenticate_password("alice", "hunter2")
        .await
        .unwrap();

    let channel = timeout(WAIT, client.open_session()).await.unwrap().unwrap();
    timeout(WAIT, channel.send_data(b"twelve bytes"))
        .await
        .expect("send parked forever")
        .unwrap();

    // All 12 bytes arrive despite the 8-byte window
    timeout(WAIT, async {
        loop {
            if received.lock().await.len() == 12 {
                break;
            }
            tokio::time::sleep(TICK).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(received.lock().await.as_slice(), b"twelve bytes");

    channel.send_eof().await.unwrap();
    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_rekey_under_load_preserves_stream() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let addr = spawn_server(
        SshConfig::default(),
        Arc::new(StaticAuthenticator::new().with_password("alice", "hunter2")),
        Arc::new(SinkHandler {
            received: Arc::clone(&received),
        }),
    )
    .await;

    let mut client = SshClient::connect_with_config(&addr.to_string(), test_client_config())
        .await
        .unwrap();
    client
        .authenticate_password("alice", "hunter2")
        .await
        .unwrap();

    let channel = timeout(WAIT, client.open_session()).await.unwrap().unwrap();

    // Stream a 1 MiB patterned blob, rekeying at the halfway mark
    let blob: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    let half = blob.len() / 2;

    timeout(WAIT, channel.send_data(&blob[..half]))
        .await
        .unwrap()
        .unwrap();
    client.request_rekey().await.unwrap();
    timeout(WAIT, channel.send_data(&blob[half..]))
        .await
        .unwrap()
        .unwrap();

    // Open channels survive the rekey with no data loss or corruption
    timeout(WAIT, async {
        loop {
            if received.lock().await.len() == blob.len() {
                break;
            }
            tokio::time::sleep(TICK).await;
        }
    })
    .await
    .expect("stream did not finish after rekey");
    assert_eq!(received.lock().await.as_slice(), &blob[..]);

    // Transport still usable afterwards
    channel.send_eof().await.unwrap();
    channel.close().await.unwrap();
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_closes_session() {
    let addr = default_server().await;

    let mut client = SshClient::connect_with_config(&addr.to_string(), test_client_config())
        .await
        .unwrap();
    client
        .authenticate_password("alice", "hunter2")
        .await
        .unwrap();

    let session = Arc::clone(client.session().unwrap());
    client.disconnect().await.unwrap();
    assert!(session.is_closed());
}
