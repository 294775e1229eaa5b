//! Minimal SSH client: connect, password auth, run one command.
//!
//! Usage:
//!   cargo run --example simple_client <host:port> <username> <password> <command>

use std::env;
use std::time::Duration;

use tokio::time::timeout;

use skiff_proto::ssh::client::SshClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skiff_proto=info".into()),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 5 {
        eprintln!("usage: simple_client <host:port> <username> <password> <command>");
        std::process::exit(2);
    }
    let (addr, username, password, command) = (&args[1], &args[2], &args[3], &args[4]);

    let mut client = timeout(Duration::from_secs(10), SshClient::connect(addr)).await??;
    println!("server key: {}", client.server_host_key_fingerprint());

    client.authenticate_password(username, password).await?;

    let output = timeout(Duration::from_secs(10), client.execute(command)).await??;
    print!("{}", String::from_utf8_lossy(&output.stdout));
    if !output.stderr.is_empty() {
        eprint!("{}", String::from_utf8_lossy(&output.stderr));
    }
    if let Some(status) = output.exit_status {
        if status != 0 {
            eprintln!("exit status: {}", status);
        }
    }

    client.disconnect().await?;
    Ok(())
}
