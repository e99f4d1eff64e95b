//! Server implementation for the `portway` service.
//!
//! The server accepts control connections from clients, binds one public
//! listener per granted forward, and relays every public connection over the
//! owning client's control link. Ownership is tree-shaped: server → session →
//! forward → public connection, mirrored by the cancellation tokens.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ServerConfig;
use crate::shared::{
    pump, write_frames, Delimited, FrameError, FrameStream, Message, OUTBOUND_BUFFER,
};

/// How long a shutting-down server waits for its sessions to finish closing
/// their sockets before abandoning them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// State structure for the server.
pub struct Server {
    /// Port the control listener binds on.
    control_port: u16,

    /// Range of public ports clients may request.
    port_range: RangeInclusive<u16>,

    /// Maximum live forwards per client session.
    max_ports_per_client: u32,

    /// Shared key clients must present.
    key: String,

    /// Root token; cancelling it shuts down every session.
    shutdown: CancellationToken,
}

/// One control connection and everything it owns.
///
/// All registry lookups and mutations go through the single lock; socket I/O
/// happens after the guard is dropped.
struct Session {
    client_id: String,
    outbound: mpsc::Sender<Message>,
    registry: Mutex<HashMap<String, Forward>>,
    token: CancellationToken,
}

/// A granted forward: one public listener plus its live connections.
struct Forward {
    target_port: u16,
    token: CancellationToken,
    conns: HashMap<String, PublicConn>,
}

/// Write half of an accepted public connection. The read half is owned by
/// the inbound pump.
struct PublicConn {
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    token: CancellationToken,
}

enum SessionFlow {
    Continue,
    Shutdown,
}

impl Server {
    /// Create a new server from a validated configuration.
    pub fn new(config: ServerConfig, shutdown: CancellationToken) -> Result<Self> {
        let port_range = config.port_range()?;
        Ok(Server {
            control_port: config.internal_data_port,
            port_range,
            max_ports_per_client: config.max_ports_per_client,
            key: config.key,
            shutdown,
        })
    }

    /// Start the server, listening for client connections until the shutdown
    /// token fires.
    pub async fn listen(self) -> Result<()> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.control_port))
            .await
            .with_context(|| format!("failed to bind control port {}", self.control_port))?;
        info!(port = self.control_port, "server listening");

        let this = Arc::new(self);
        let mut sessions = JoinSet::new();
        loop {
            let (stream, addr) = tokio::select! {
                _ = this.shutdown.cancelled() => break,
                // Reap finished sessions so the set does not grow with every
                // client that ever connected.
                Some(_) = sessions.join_next() => continue,
                result = listener.accept() => result?,
            };
            let this = Arc::clone(&this);
            sessions.spawn(
                async move {
                    info!("incoming connection");
                    if let Err(err) = this.handle_client(stream, addr).await {
                        warn!(%err, "session exited with error");
                    } else {
                        info!("session exited");
                    }
                }
                .instrument(info_span!("control", client_id = %addr)),
            );
        }

        // Cancellation has already reached every session through the token
        // tree; wait for them to finish closing their sockets so a clean
        // exit means a clean teardown.
        info!("server shutting down");
        drop(listener);
        let drained = timeout(SHUTDOWN_GRACE, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = sessions.len(),
                "sessions still open after shutdown grace period"
            );
            sessions.abort_all();
        }
        Ok(())
    }

    async fn handle_client(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let (sink, mut frames) = Delimited::new(stream).split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let token = self.shutdown.child_token();
        tokio::spawn(write_frames(sink, outbound_rx, token.clone()));

        let session = Arc::new(Session {
            client_id: addr.to_string(),
            outbound,
            registry: Mutex::new(HashMap::new()),
            token,
        });

        let result = self.run_session(&session, &mut frames).await;

        // CLOSED: everything this session owns goes with it. Cancelling the
        // session token stops the writer, every accept loop, and every pump;
        // draining the registry drops the remaining write halves.
        session.token.cancel();
        let forwards: Vec<Forward> = {
            let mut registry = session.registry.lock().unwrap();
            registry.drain().map(|(_, forward)| forward).collect()
        };
        if !forwards.is_empty() {
            info!(count = forwards.len(), "dropped forwards for departed client");
        }
        drop(forwards);

        result
    }

    async fn run_session(
        &self,
        session: &Arc<Session>,
        frames: &mut FrameStream<TcpStream>,
    ) -> Result<()> {
        let mut authenticated = false;
        loop {
            let frame = tokio::select! {
                _ = session.token.cancelled() => return Ok(()),
                frame = frames.next() => frame,
            };
            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => return Err(err).context("control link read failed"),
                None => {
                    info!("client disconnected");
                    return Ok(());
                }
            };
            match Message::parse(&frame) {
                Ok(msg) => {
                    if let SessionFlow::Shutdown =
                        self.dispatch(session, &mut authenticated, msg).await
                    {
                        return Ok(());
                    }
                }
                Err(FrameError::InvalidJson(err)) => {
                    warn!(%err, "invalid JSON on control link");
                    session
                        .send(Message::Error {
                            message: "Invalid JSON".to_string(),
                        })
                        .await;
                }
                Err(FrameError::UnknownType(_)) => {
                    session
                        .send(Message::Error {
                            message: "Unknown message type".to_string(),
                        })
                        .await;
                }
                Err(FrameError::MissingFields(ty)) => {
                    debug!(%ty, "dropped message with missing fields");
                }
            }
        }
    }

    async fn dispatch(
        &self,
        session: &Arc<Session>,
        authenticated: &mut bool,
        msg: Message,
    ) -> SessionFlow {
        match msg {
            Message::Auth { key } => {
                if key == self.key {
                    *authenticated = true;
                    info!("client authenticated");
                    session
                        .send(Message::AuthResponse {
                            success: true,
                            message: None,
                        })
                        .await;
                } else {
                    warn!("client failed authentication");
                    session
                        .send(Message::AuthResponse {
                            success: false,
                            message: Some("Invalid key".to_string()),
                        })
                        .await;
                    return SessionFlow::Shutdown;
                }
            }
            Message::ForwardRequest {
                target_port, mode, ..
            } => {
                self.handle_forward_request(session, *authenticated, target_port, &mode)
                    .await;
            }
            Message::Data {
                forward_id,
                conn_id,
                data,
            } => {
                session.relay_to_public(&forward_id, &conn_id, &data).await;
            }
            Message::CloseConnection {
                forward_id,
                conn_id,
            } => {
                // Unknown ids are a no-op; the client's close may cross our
                // own notice in flight.
                session.close_stream(&forward_id, &conn_id, false).await;
            }
            Message::CloseForward { forward_id } => {
                session.close_forward(&forward_id);
            }
            // Server-bound links never carry these; answered like any other
            // unknown type.
            Message::AuthResponse { .. }
            | Message::ForwardResponse { .. }
            | Message::NewConnection { .. }
            | Message::Error { .. } => {
                session
                    .send(Message::Error {
                        message: "Unknown message type".to_string(),
                    })
                    .await;
            }
        }
        SessionFlow::Continue
    }

    async fn handle_forward_request(
        &self,
        session: &Arc<Session>,
        authenticated: bool,
        target_port: u16,
        mode: &str,
    ) {
        if !authenticated {
            session.reject_forward("Not authenticated").await;
            return;
        }
        let at_limit = {
            let registry = session.registry.lock().unwrap();
            registry.len() >= self.max_ports_per_client as usize
        };
        if at_limit {
            session.reject_forward("Max ports per client reached").await;
            return;
        }
        if !self.port_range.contains(&target_port) {
            session.reject_forward("Target port not allowed").await;
            return;
        }
        let forward_id = format!("{}:{}", session.client_id, target_port);
        let duplicate = {
            let registry = session.registry.lock().unwrap();
            registry.contains_key(&forward_id)
        };
        if duplicate {
            session.reject_forward("Port already in use").await;
            return;
        }
        if !mode.eq_ignore_ascii_case("tcp") {
            session.reject_forward("Unsupported mode").await;
            return;
        }

        let listener = match TcpListener::bind((Ipv4Addr::UNSPECIFIED, target_port)).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!(%err, target_port, "failed to bind forward listener");
                session.reject_forward(&err.to_string()).await;
                return;
            }
        };

        // Forwards are only ever inserted on this task, so the quota check
        // above cannot race another insertion for the same session.
        let token = session.token.child_token();
        session.registry.lock().unwrap().insert(
            forward_id.clone(),
            Forward {
                target_port,
                token: token.clone(),
                conns: HashMap::new(),
            },
        );
        tokio::spawn(
            accept_public(Arc::clone(session), forward_id.clone(), listener, token)
                .instrument(info_span!("forward", port = target_port)),
        );

        info!(%forward_id, target_port, "forward created");
        session
            .send(Message::ForwardResponse {
                success: true,
                target_port: Some(target_port),
                forward_id: Some(forward_id),
                message: None,
            })
            .await;
    }
}

impl Session {
    /// Queue a message for the control link. Returns `false` once the link
    /// is gone.
    async fn send(&self, msg: Message) -> bool {
        self.outbound.send(msg).await.is_ok()
    }

    async fn reject_forward(&self, message: &str) {
        self.send(Message::ForwardResponse {
            success: false,
            target_port: None,
            forward_id: None,
            message: Some(message.to_string()),
        })
        .await;
    }

    /// Write one hex-encoded payload to a public connection. Unknown ids are
    /// dropped; an undecodable payload or a failed write closes the stream.
    async fn relay_to_public(&self, forward_id: &str, conn_id: &str, data: &str) {
        let writer = {
            let registry = self.registry.lock().unwrap();
            registry
                .get(forward_id)
                .and_then(|forward| forward.conns.get(conn_id))
                .map(|conn| Arc::clone(&conn.writer))
        };
        let Some(writer) = writer else { return };
        match hex::decode(data) {
            Ok(payload) => {
                if let Err(err) = writer.lock().await.write_all(&payload).await {
                    warn!(%err, %conn_id, "public connection write failed");
                    self.close_stream(forward_id, conn_id, true).await;
                }
            }
            Err(err) => {
                warn!(%err, %conn_id, "undecodable payload");
                self.close_stream(forward_id, conn_id, true).await;
            }
        }
    }

    /// Remove one tunneled stream, notifying the client when `notify`.
    /// Returns `false` (and stays silent) when the stream is already gone.
    async fn close_stream(&self, forward_id: &str, conn_id: &str, notify: bool) -> bool {
        let removed = {
            let mut registry = self.registry.lock().unwrap();
            registry
                .get_mut(forward_id)
                .and_then(|forward| forward.conns.remove(conn_id))
        };
        match removed {
            Some(conn) => {
                conn.token.cancel();
                if notify {
                    self.send(Message::CloseConnection {
                        forward_id: forward_id.to_string(),
                        conn_id: conn_id.to_string(),
                    })
                    .await;
                }
                info!(%conn_id, "public connection closed");
                true
            }
            None => false,
        }
    }

    /// Tear down a forward: its listener, its connections, its registry
    /// entry. Idempotent.
    fn close_forward(&self, forward_id: &str) {
        let removed = self.registry.lock().unwrap().remove(forward_id);
        if let Some(forward) = removed {
            forward.token.cancel();
            info!(%forward_id, target_port = forward.target_port, "forward closed");
        }
    }
}

/// Accept loop for one forward's public listener. The listener is dropped,
/// and the port released, when this task exits.
async fn accept_public(
    session: Arc<Session>,
    forward_id: String,
    listener: TcpListener,
    token: CancellationToken,
) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = token.cancelled() => break,
            result = listener.accept() => match result {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, "public accept failed");
                    continue;
                }
            },
        };
        let conn_id = addr.to_string();
        info!(%conn_id, "public connection accepted");

        let (read_half, write_half) = stream.into_split();
        let conn_token = token.child_token();
        {
            let mut registry = session.registry.lock().unwrap();
            let Some(forward) = registry.get_mut(&forward_id) else {
                break;
            };
            forward.conns.insert(
                conn_id.clone(),
                PublicConn {
                    writer: Arc::new(AsyncMutex::new(write_half)),
                    token: conn_token.clone(),
                },
            );
        }
        if !session
            .send(Message::NewConnection {
                forward_id: forward_id.clone(),
                conn_id: conn_id.clone(),
            })
            .await
        {
            break;
        }
        tokio::spawn(
            relay_public(
                Arc::clone(&session),
                forward_id.clone(),
                conn_id.clone(),
                read_half,
                conn_token,
            )
            .instrument(info_span!("stream", %conn_id)),
        );
    }
    debug!("public listener stopped");
}

/// Inbound pump wrapper: shuttle public-peer bytes to the client, then reap
/// the stream. The close notice is skipped when another path (client close,
/// forward teardown) already removed the entry.
async fn relay_public(
    session: Arc<Session>,
    forward_id: String,
    conn_id: String,
    read_half: OwnedReadHalf,
    token: CancellationToken,
) {
    pump(
        read_half,
        session.outbound.clone(),
        forward_id.clone(),
        conn_id.clone(),
        token,
    )
    .await;
    session.close_stream(&forward_id, &conn_id, true).await;
}
