//! Minimal SSH server: Ed25519 host key, password auth, command echo.
//!
//! Usage:
//!   cargo run --example simple_server [bind_address]
//!
//! Then connect with:
//!   cargo run --example simple_client 127.0.0.1:2222 testuser testpass "whoami"

use std::env;
use std::sync::Arc;

use skiff_platform::SkiffResult;
use skiff_proto::ssh::auth::StaticAuthenticator;
use skiff_proto::ssh::hostkey::Ed25519HostKey;
use skiff_proto::ssh::server::{ExecOutcome, SessionHandler, SshServer};

struct SimpleHandler;

#[async_trait::async_trait]
impl SessionHandler for SimpleHandler {
    async fn handle_exec(&self, command: &str) -> SkiffResult<ExecOutcome> {
        println!("  executing: {}", command);

        let output = match command.trim() {
            "whoami" => "testuser\n".to_string(),
            "pwd" => "/home/testuser\n".to_string(),
            "hostname" => "skiff-example\n".to_string(),
            cmd if cmd.starts_with("echo ") => format!("{}\n", &cmd[5..]),
            other => format!("Command executed: {}\n", other),
        };

        Ok(ExecOutcome::success(output.into_bytes()))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skiff_proto=info".into()),
        )
        .init();

    let bind_addr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:2222".to_string());

    let host_key = Arc::new(Ed25519HostKey::generate());
    println!("host key: {}", host_key.fingerprint());

    let authenticator =
        Arc::new(StaticAuthenticator::new().with_password("testuser", "testpass"));

    let server = SshServer::bind(&bind_addr, host_key, authenticator).await?;
    println!("listening on {}", server.local_addr()?);

    loop {
        match server.accept().await {
            Ok(mut session) => {
                println!("session for {} from {}", session.username(), session.peer_address());
                tokio::spawn(async move {
                    if let Err(e) = session.run(Arc::new(SimpleHandler)).await {
                        eprintln!("session ended with error: {}", e);
                    }
                });
            }
            Err(e) => eprintln!("connection rejected: {}", e),
        }
    }
}
