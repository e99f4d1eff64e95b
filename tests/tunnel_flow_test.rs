//! End-to-end tunnel tests: a real server, a real client, and real sockets
//! on loopback.

mod common;

use anyhow::Result;
use portway::shared::{Delimited, Message};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;

#[tokio::test]
async fn tunnels_a_simple_echo() -> Result<()> {
    let _server = common::spawn_server(41000, "41001-41099", 5).await?;
    common::spawn_echo_server(41900).await?;
    let _client = common::spawn_client(41000, common::KEY, vec![(41900, 41010)]).await?;

    let mut public = TcpStream::connect(("127.0.0.1", 41010)).await?;
    public.write_all(b"hello").await?;
    let mut buf = [0u8; 5];
    public.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"hello");
    Ok(())
}

#[tokio::test]
async fn tunnels_every_byte_value_exactly() -> Result<()> {
    let _server = common::spawn_server(41100, "41101-41199", 5).await?;
    common::spawn_echo_server(41901).await?;
    let _client = common::spawn_client(41100, common::KEY, vec![(41901, 41110)]).await?;

    let payload: Vec<u8> = (0u8..=255).collect();
    let mut public = TcpStream::connect(("127.0.0.1", 41110)).await?;
    public.write_all(&payload).await?;
    let mut buf = vec![0u8; payload.len()];
    public.read_exact(&mut buf).await?;
    assert_eq!(buf, payload);
    Ok(())
}

#[tokio::test]
async fn keeps_concurrent_streams_ordered_and_isolated() -> Result<()> {
    const STREAMS: usize = 8;
    const CHUNKS: usize = 12;
    const CHUNK_LEN: usize = 512;

    let _server = common::spawn_server(41200, "41201-41299", 5).await?;
    common::spawn_echo_server(41902).await?;
    let _client = common::spawn_client(41200, common::KEY, vec![(41902, 41210)]).await?;

    let mut handles = Vec::new();
    for stream_no in 0..STREAMS {
        handles.push(tokio::spawn(async move {
            let mut public = TcpStream::connect(("127.0.0.1", 41210)).await?;
            for chunk_no in 0..CHUNKS {
                let chunk: Vec<u8> = (0..CHUNK_LEN)
                    .map(|i| (stream_no * 31 + chunk_no * 7 + i) as u8)
                    .collect();
                public.write_all(&chunk).await?;
                let mut echoed = vec![0u8; CHUNK_LEN];
                public.read_exact(&mut echoed).await?;
                assert_eq!(echoed, chunk, "stream {stream_no} chunk {chunk_no}");
            }
            Ok::<(), anyhow::Error>(())
        }));
    }
    for handle in handles {
        handle.await??;
    }
    Ok(())
}

#[tokio::test]
async fn propagates_half_close_to_both_ends() -> Result<()> {
    let _server = common::spawn_server(41300, "41301-41399", 5).await?;
    common::spawn_echo_server(41903).await?;
    let _client = common::spawn_client(41300, common::KEY, vec![(41903, 41310)]).await?;

    let mut public = TcpStream::connect(("127.0.0.1", 41310)).await?;
    public.write_all(b"ping").await?;
    let mut buf = [0u8; 4];
    public.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"ping");

    // Closing our write side must ripple through to the backend and come
    // back as EOF once the stream is reaped on both ends.
    public.shutdown().await?;
    let mut rest = [0u8; 16];
    let n = public.read(&mut rest).await.unwrap_or(0);
    assert_eq!(n, 0);
    Ok(())
}

#[tokio::test]
async fn control_link_loss_tears_down_forwards() -> Result<()> {
    let _server = common::spawn_server(41400, "41401-41499", 5).await?;

    let mut control = Delimited::new(TcpStream::connect(("127.0.0.1", 41400)).await?);
    control
        .send(&Message::Auth {
            key: common::KEY.to_string(),
        })
        .await?;
    assert!(matches!(
        control.recv_message_timeout().await?,
        Some(Message::AuthResponse { success: true, .. })
    ));

    control
        .send(&Message::ForwardRequest {
            forward_domain: "127.0.0.1".to_string(),
            forward_port: 1,
            target_port: 41410,
            mode: "TCP".to_string(),
        })
        .await?;
    assert!(matches!(
        control.recv_message_timeout().await?,
        Some(Message::ForwardResponse { success: true, .. })
    ));

    let mut public = TcpStream::connect(("127.0.0.1", 41410)).await?;
    assert!(matches!(
        control.recv_message_timeout().await?,
        Some(Message::NewConnection { .. })
    ));

    // Kill the control link with a stream open.
    drop(control);
    sleep(Duration::from_millis(500)).await;

    // The public connection is gone...
    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(Duration::from_secs(2), public.read(&mut buf))
        .await?
        .unwrap_or(0);
    assert_eq!(n, 0);

    // ...and so is the listener.
    assert!(TcpStream::connect(("127.0.0.1", 41410)).await.is_err());
    Ok(())
}

#[tokio::test]
async fn failed_backend_dial_reaps_the_public_peer() -> Result<()> {
    let _server = common::spawn_server(41500, "41501-41599", 5).await?;
    // No backend listening on 41904: every announced connection fails to
    // dial and the client must close it.
    let _client = common::spawn_client(41500, common::KEY, vec![(41904, 41510)]).await?;

    let mut public = TcpStream::connect(("127.0.0.1", 41510)).await?;
    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(Duration::from_secs(5), public.read(&mut buf))
        .await?
        .unwrap_or(0);
    assert_eq!(n, 0);
    Ok(())
}
