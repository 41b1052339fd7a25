use std::{
    fmt::Display,
    future::Future,
    net::SocketAddr,
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use axum::{
    Router,
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    net::TcpListener,
    select,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::timeout,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::{
    broadcast::Broadcaster,
    connection::{Connection, ConnectionId, Frame, UNKNOWN},
    event::{Payload, classify},
    registry::Registry,
};

/// Body served on `GET /` to plain HTTP clients.
pub const STATUS_TEXT: &str = "WebSocket server is running";

pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// How long a closing connection's writer may take to flush before it is
/// aborted.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// How long shutdown waits for open sessions to deregister and close.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Frames buffered per client. Deliveries to a client whose buffer is
    /// full are skipped.
    pub outbound_capacity: NonZeroUsize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: NonZeroUsize::new(DEFAULT_OUTBOUND_CAPACITY)
                .unwrap_or(NonZeroUsize::MIN),
        }
    }
}

pub struct Relay {
    listener: TcpListener,
    state: Arc<RelayState>,
}

impl Relay {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self {
            listener,
            state: Arc::new(RelayState::new(config)),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.state.registry)
    }

    pub fn router(&self) -> Router {
        router(Arc::clone(&self.state))
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Relay { listener, state } = self;
        let app = router(Arc::clone(&state));

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            handle_shutdown(&state).await;
        })
        .await?;

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

struct RelayState {
    registry: Arc<Registry>,
    broadcaster: Broadcaster,
    config: RelayConfig,
    shutdown: watch::Sender<bool>,
    /// Number of upgraded sockets whose session has not finished cleanup.
    sessions: watch::Sender<usize>,
}

impl RelayState {
    fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let (shutdown, _) = watch::channel(false);
        let (sessions, _) = watch::channel(0);
        Self {
            broadcaster: Broadcaster::new(Arc::clone(&registry)),
            registry,
            config,
            shutdown,
            sessions,
        }
    }
}

/// Counts one live session for as long as it is held.
struct SessionGuard<'a> {
    sessions: &'a watch::Sender<usize>,
}

impl<'a> SessionGuard<'a> {
    fn enter(sessions: &'a watch::Sender<usize>) -> Self {
        sessions.send_modify(|open| *open += 1);
        Self { sessions }
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.sessions.send_modify(|open| *open = open.saturating_sub(1));
    }
}

fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(root))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_shutdown(state: &RelayState) {
    let mut open = 0;
    state
        .registry
        .for_each(|connection| {
            open += 1;
            debug!(
                conn_id = connection.id(),
                user = connection.name_or_unknown(),
                "closing connection for shutdown"
            );
        })
        .await;

    info!(open, "relay shutting down");
    state.shutdown.send_replace(true);

    let mut sessions = state.sessions.subscribe();
    let drained = matches!(
        timeout(SHUTDOWN_GRACE, sessions.wait_for(|open| *open == 0)).await,
        Ok(Ok(_))
    );
    if !drained {
        warn!(
            remaining = *sessions.borrow(),
            "sessions still open after shutdown grace"
        );
    } else if !state.registry.is_empty().await {
        warn!("registry not empty after every session finished");
    }
}

async fn root(
    State(state): State<Arc<RelayState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    upgrade: Option<WebSocketUpgrade>,
) -> Response {
    let Some(upgrade) = upgrade else {
        return STATUS_TEXT.into_response();
    };

    let peer = connect_info.map_or_else(
        || UNKNOWN.to_string(),
        |ConnectInfo(addr)| addr.to_string(),
    );
    upgrade
        .on_failed_upgrade(|error| warn!(%error, "websocket upgrade failed"))
        .on_upgrade(move |socket| handle_connection(socket, peer, state))
}

async fn handle_connection(socket: WebSocket, peer: String, state: Arc<RelayState>) {
    let _session = SessionGuard::enter(&state.sessions);
    let (sink, mut stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(state.config.outbound_capacity.get());
    let mut shutdown = state.shutdown.subscribe();

    let connection = state.registry.add(peer, outbound_tx).await;
    info!(conn_id = connection.id(), peer = connection.peer(), "client connected");

    let writer = tokio::spawn(forward_outbound(sink, outbound_rx, connection.id()));

    run_client_session(&state.broadcaster, &connection, &mut stream, &mut shutdown).await;
    cleanup_client_disconnect(&state.registry, connection, writer).await;
}

/// Reads frames until the client goes away or the relay shuts down. Each
/// frame is fully routed before the next one is read.
async fn run_client_session<S>(
    broadcaster: &Broadcaster,
    connection: &Connection,
    stream: &mut S,
    shutdown: &mut watch::Receiver<bool>,
) where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    if *shutdown.borrow_and_update() {
        return;
    }

    loop {
        select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(conn_id = connection.id(), "closing for relay shutdown");
                    break;
                }
            }
            inbound = stream.next() => {
                if !handle_inbound(inbound, broadcaster, connection).await {
                    break;
                }
            }
        }
    }
}

async fn handle_inbound(
    inbound: Option<Result<Message, axum::Error>>,
    broadcaster: &Broadcaster,
    connection: &Connection,
) -> bool {
    let payload = match inbound {
        Some(Ok(Message::Text(text))) => Payload::Text(text),
        Some(Ok(Message::Binary(bytes))) => Payload::Binary(bytes),
        Some(Ok(Message::Ping(_) | Message::Pong(_))) => return true,
        Some(Ok(Message::Close(frame))) => {
            debug!(conn_id = connection.id(), ?frame, "client sent close frame");
            return false;
        }
        Some(Err(error)) => {
            warn!(conn_id = connection.id(), %error, "websocket error");
            return false;
        }
        None => return false,
    };

    let event = classify(payload, Utc::now());
    debug!(conn_id = connection.id(), kind = event.kind(), "inbound frame");
    broadcaster.route(connection, event).await;
    true
}

/// Owns the socket's write half. Ends once every sender of `outbound` is
/// gone, then sends a close frame.
async fn forward_outbound<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Frame>,
    conn_id: ConnectionId,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(frame) = outbound.recv().await {
        if let Err(error) = sink.send(into_message(frame)).await {
            debug!(conn_id, %error, "failed to deliver frame to client");
            return;
        }
    }

    if let Err(error) = sink.send(Message::Close(None)).await {
        debug!(conn_id, %error, "failed to send close frame");
    }
    if let Err(error) = sink.close().await {
        debug!(conn_id, %error, "failed to close websocket");
    }
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.to_string()),
        Frame::Binary(bytes) => Message::Binary(bytes.to_vec()),
    }
}

async fn cleanup_client_disconnect(
    registry: &Registry,
    connection: Arc<Connection>,
    mut writer: JoinHandle<()>,
) {
    let conn_id = connection.id();
    if registry.remove(conn_id).await.is_some() {
        info!(
            conn_id,
            user = connection.name_or_unknown(),
            lifetime = ?connection.age(),
            dropped = connection.dropped(),
            "client disconnected"
        );
    }

    // The writer drains its queue once the last handle to the connection is gone.
    drop(connection);
    match timeout(CLOSE_GRACE, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => warn!(conn_id, %error, "writer task failed"),
        Err(_) => {
            debug!(conn_id, "writer did not finish in time, aborting");
            writer.abort();
        }
    }
}
