//! Client implementation for the `portway` service.
//!
//! The client dials the server, authenticates, requests one forward per
//! configured entry, and then serves the control link: for every public
//! connection the server announces it dials the configured backend and
//! shuttles bytes between backend and control link.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{ClientConfig, ForwardSpec};
use crate::shared::{
    pump, write_frames, Delimited, FrameError, FrameStream, Message, NETWORK_TIMEOUT,
    OUTBOUND_BUFFER,
};

/// State structure for the client.
pub struct Client {
    /// Control connection to the server, present until `listen` splits it.
    control: Option<Delimited<TcpStream>>,

    /// Validated configuration.
    config: ClientConfig,

    /// Cancelling this token closes every forward and returns from `listen`.
    shutdown: CancellationToken,
}

/// Everything the dispatcher and the pumps share.
struct ClientState {
    outbound: mpsc::Sender<Message>,
    registry: Mutex<Registry>,
    token: CancellationToken,
}

struct Registry {
    /// Configured forwards not yet granted by the server.
    pending: Vec<ForwardSpec>,
    /// Live forwards keyed by the server-assigned id.
    forwards: HashMap<String, ClientForward>,
}

struct ClientForward {
    spec: ForwardSpec,
    conns: HashMap<String, BackendConn>,
}

/// Write half of a dialed backend connection. The read half is owned by the
/// outbound pump.
struct BackendConn {
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    token: CancellationToken,
}

impl Client {
    /// Connect to the server and authenticate.
    pub async fn connect(config: ClientConfig, shutdown: CancellationToken) -> Result<Self> {
        let stream = connect_with_timeout(&config.server_domain, config.server_port).await?;
        let mut control = Delimited::new(stream);

        control
            .send(&Message::Auth {
                key: config.key.clone(),
            })
            .await?;
        match control.recv_message_timeout().await? {
            Some(Message::AuthResponse { success: true, .. }) => {
                info!(
                    server = %config.server_domain,
                    port = config.server_port,
                    "authenticated with server"
                );
            }
            Some(Message::AuthResponse {
                success: false,
                message,
            }) => bail!(
                "server rejected authentication: {}",
                message.unwrap_or_default()
            ),
            Some(_) => bail!("unexpected message during authentication"),
            None => bail!("server closed the link during authentication"),
        }

        Ok(Client {
            control: Some(control),
            config,
            shutdown,
        })
    }

    /// Request every configured forward and serve the control link until it
    /// closes or the shutdown token fires.
    pub async fn listen(mut self) -> Result<()> {
        let control = self.control.take().unwrap();
        let (sink, mut frames) = control.split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let token = self.shutdown.child_token();
        tokio::spawn(write_frames(sink, outbound_rx, token.clone()));

        let state = Arc::new(ClientState {
            outbound,
            registry: Mutex::new(Registry {
                pending: self.config.forwards.clone(),
                forwards: HashMap::new(),
            }),
            token,
        });

        for spec in &self.config.forwards {
            state
                .send(Message::ForwardRequest {
                    forward_domain: spec.forward_domain.clone(),
                    forward_port: spec.forward_port,
                    target_port: spec.target_port,
                    mode: spec.mode.clone(),
                })
                .await;
        }

        let result = run_dispatcher(&state, &mut frames).await;

        state.token.cancel();
        let forwards: Vec<ClientForward> = {
            let mut registry = state.registry.lock().unwrap();
            registry.pending.clear();
            registry.forwards.drain().map(|(_, f)| f).collect()
        };
        drop(forwards);
        info!("client stopped");

        result
    }
}

async fn run_dispatcher(
    state: &Arc<ClientState>,
    frames: &mut FrameStream<TcpStream>,
) -> Result<()> {
    loop {
        let frame = tokio::select! {
            _ = state.token.cancelled() => {
                // Graceful exit: tell the server to drop our forwards while
                // the link is still up. Best effort.
                let ids: Vec<String> = {
                    let registry = state.registry.lock().unwrap();
                    registry.forwards.keys().cloned().collect()
                };
                for forward_id in ids {
                    state.send(Message::CloseForward { forward_id }).await;
                }
                return Ok(());
            }
            frame = frames.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => return Err(err).context("control link read failed"),
            None => {
                info!("server disconnected");
                return Ok(());
            }
        };
        match Message::parse(&frame) {
            Ok(msg) => dispatch(state, msg).await,
            Err(FrameError::InvalidJson(err)) => warn!(%err, "invalid JSON from server"),
            Err(err) => debug!(%err, "ignoring malformed message"),
        }
    }
}

async fn dispatch(state: &Arc<ClientState>, msg: Message) {
    match msg {
        Message::ForwardResponse {
            success: true,
            target_port: Some(target_port),
            forward_id: Some(forward_id),
            ..
        } => {
            state.bind_forward(forward_id, target_port);
        }
        Message::ForwardResponse {
            success: false,
            message,
            ..
        } => {
            warn!(
                "forward request failed: {}",
                message.unwrap_or_default()
            );
        }
        Message::ForwardResponse { .. } => {
            debug!("dropped forward response with missing fields");
        }
        Message::NewConnection {
            forward_id,
            conn_id,
        } => {
            handle_new_connection(state, forward_id, conn_id).await;
        }
        Message::Data {
            forward_id,
            conn_id,
            data,
        } => {
            state.relay_to_backend(&forward_id, &conn_id, &data).await;
        }
        Message::CloseConnection {
            forward_id,
            conn_id,
        } => {
            state.close_stream(&forward_id, &conn_id, false).await;
        }
        Message::Error { message } => error!(%message, "server error"),
        // Client-bound links never carry the rest; ignore quietly.
        other => debug!(?other, "ignoring unexpected message"),
    }
}

/// Dial the backend for an announced public connection. Dialing happens on
/// the dispatcher so no `data` frame for this stream can be processed before
/// the backend socket is registered.
async fn handle_new_connection(state: &Arc<ClientState>, forward_id: String, conn_id: String) {
    let spec = {
        let registry = state.registry.lock().unwrap();
        registry
            .forwards
            .get(&forward_id)
            .map(|forward| forward.spec.clone())
    };
    let Some(spec) = spec else {
        warn!(%forward_id, "connection announced for unknown forward");
        return;
    };

    let stream = match connect_with_timeout(&spec.forward_domain, spec.forward_port).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%err, %conn_id, "failed to dial backend");
            state
                .send(Message::CloseConnection {
                    forward_id,
                    conn_id,
                })
                .await;
            return;
        }
    };
    info!(
        %conn_id,
        backend = %format!("{}:{}", spec.forward_domain, spec.forward_port),
        "backend connection established"
    );

    let (read_half, write_half) = stream.into_split();
    let conn_token = state.token.child_token();
    {
        let mut registry = state.registry.lock().unwrap();
        let Some(forward) = registry.forwards.get_mut(&forward_id) else {
            return;
        };
        forward.conns.insert(
            conn_id.clone(),
            BackendConn {
                writer: Arc::new(AsyncMutex::new(write_half)),
                token: conn_token.clone(),
            },
        );
    }
    tokio::spawn(
        relay_backend(
            Arc::clone(state),
            forward_id,
            conn_id.clone(),
            read_half,
            conn_token,
        )
        .instrument(info_span!("stream", %conn_id)),
    );
}

impl ClientState {
    /// Queue a message for the control link. Returns `false` once the link
    /// is gone.
    async fn send(&self, msg: Message) -> bool {
        self.outbound.send(msg).await.is_ok()
    }

    /// Bind a granted forward to the first pending config with the matching
    /// target port.
    fn bind_forward(&self, forward_id: String, target_port: u16) {
        let mut registry = self.registry.lock().unwrap();
        let Some(index) = registry
            .pending
            .iter()
            .position(|spec| spec.target_port == target_port)
        else {
            warn!(target_port, "forward response for unknown target port");
            return;
        };
        let spec = registry.pending.remove(index);
        info!(%forward_id, target_port, "forward established");
        registry.forwards.insert(
            forward_id,
            ClientForward {
                spec,
                conns: HashMap::new(),
            },
        );
    }

    /// Write one hex-encoded payload to a backend connection. Unknown ids
    /// are dropped; an undecodable payload or a failed write closes the
    /// stream.
    async fn relay_to_backend(&self, forward_id: &str, conn_id: &str, data: &str) {
        let writer = {
            let registry = self.registry.lock().unwrap();
            registry
                .forwards
                .get(forward_id)
                .and_then(|forward| forward.conns.get(conn_id))
                .map(|conn| Arc::clone(&conn.writer))
        };
        let Some(writer) = writer else {
            debug!(%conn_id, "data for unknown connection");
            return;
        };
        match hex::decode(data) {
            Ok(payload) => {
                if let Err(err) = writer.lock().await.write_all(&payload).await {
                    warn!(%err, %conn_id, "backend write failed");
                    self.close_stream(forward_id, conn_id, true).await;
                }
            }
            Err(err) => {
                warn!(%err, %conn_id, "undecodable payload");
                self.close_stream(forward_id, conn_id, true).await;
            }
        }
    }

    /// Remove one tunneled stream, notifying the server when `notify`.
    /// Returns `false` (and stays silent) when the stream is already gone.
    async fn close_stream(&self, forward_id: &str, conn_id: &str, notify: bool) -> bool {
        let removed = {
            let mut registry = self.registry.lock().unwrap();
            registry
                .forwards
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
                info!(%conn_id, "backend connection closed");
                true
            }
            None => false,
        }
    }
}

/// Outbound pump wrapper: shuttle backend bytes to the server, then reap the
/// stream. The close notice is skipped when another path already removed the
/// entry.
async fn relay_backend(
    state: Arc<ClientState>,
    forward_id: String,
    conn_id: String,
    read_half: OwnedReadHalf,
    token: CancellationToken,
) {
    pump(
        read_half,
        state.outbound.clone(),
        forward_id.clone(),
        conn_id.clone(),
        token,
    )
    .await;
    state.close_stream(&forward_id, &conn_id, true).await;
}

async fn connect_with_timeout(to: &str, port: u16) -> Result<TcpStream> {
    match timeout(NETWORK_TIMEOUT, TcpStream::connect((to, port))).await {
        Ok(res) => res,
        Err(err) => Err(err.into()),
    }
    .with_context(|| format!("could not connect to {to}:{port}"))
}
