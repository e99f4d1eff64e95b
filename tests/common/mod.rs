//! Shared fixtures for the integration tests.
//!
//! Every test uses its own block of ports so the tests can run in parallel
//! within one process.

#![allow(dead_code)]

use anyhow::Result;
use portway::client::Client;
use portway::config::{ClientConfig, ForwardSpec, ServerConfig};
use portway::server::Server;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Shared key used by every test server.
pub const KEY: &str = "K";

/// Start a server on `control_port` and give it time to bind.
pub async fn spawn_server(
    control_port: u16,
    port_range: &str,
    max_ports: u32,
) -> Result<CancellationToken> {
    let config = ServerConfig {
        internal_data_port: control_port,
        allowed_port_range: port_range.to_string(),
        max_ports_per_client: max_ports,
        key: KEY.to_string(),
    };
    let shutdown = CancellationToken::new();
    let server = Server::new(config, shutdown.clone())?;
    tokio::spawn(async move {
        let _ = server.listen().await;
    });
    sleep(Duration::from_millis(100)).await;
    Ok(shutdown)
}

/// Connect a client requesting one forward per `(forward_port, target_port)`
/// pair, and give the forwards time to establish.
pub async fn spawn_client(
    control_port: u16,
    key: &str,
    forwards: Vec<(u16, u16)>,
) -> Result<CancellationToken> {
    let config = ClientConfig {
        server_domain: "127.0.0.1".to_string(),
        server_port: control_port,
        key: key.to_string(),
        forwards: forwards
            .into_iter()
            .map(|(forward_port, target_port)| ForwardSpec {
                forward_domain: "127.0.0.1".to_string(),
                forward_port,
                target_port,
                mode: "TCP".to_string(),
            })
            .collect(),
    };
    let shutdown = CancellationToken::new();
    let client = Client::connect(config, shutdown.clone()).await?;
    tokio::spawn(async move {
        let _ = client.listen().await;
    });
    sleep(Duration::from_millis(300)).await;
    Ok(shutdown)
}

/// Start a TCP echo server on `port`.
pub async fn spawn_echo_server(port: u16) -> Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    Ok(())
}
