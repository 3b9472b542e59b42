use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use parley_core::ids::SessionId;

use crate::protocol::{ClientEvent, ErrorDetails, ServerEnvelope, ServerEvent};
use crate::session::{Session, SessionDeps};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Clone, Copy, Debug)]
pub struct ConnectionConfig {
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_send_queue: 256,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

/// Liveness of one realtime socket.
pub struct Connection {
    pub session_id: SessionId,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl Connection {
    fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CLIENT_TIMEOUT.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Every open realtime connection, keyed by the session it drives.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<SessionId, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: SessionId) -> Arc<Connection> {
        let connection = Arc::new(Connection::new(session_id.clone()));
        self.connections.insert(session_id, Arc::clone(&connection));
        connection
    }

    pub fn unregister(&self, session_id: &SessionId) {
        if let Some((_, connection)) = self.connections.remove(session_id) {
            connection.connected.store(false, Ordering::Relaxed);
        }
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Arc<Connection>> {
        self.connections.get(session_id).map(|c| Arc::clone(c.value()))
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }
}

/// Drive one realtime socket: open a session, relay its events through a
/// writer task with periodic pings, and feed client events to it until the
/// socket closes or stops answering pings. The session is always closed.
pub async fn serve_socket(
    socket: WebSocket,
    deps: SessionDeps,
    registry: Arc<ConnectionRegistry>,
    config: ConnectionConfig,
) {
    let (mut ws_tx, ws_rx) = socket.split();
    let (events_tx, mut events_rx) = mpsc::channel::<ServerEvent>(config.max_send_queue);

    let mut session = match Session::open(deps, events_tx.clone()).await {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, "failed to open session");
            let envelope = ServerEnvelope::new(e.to_event());
            if let Ok(json) = serde_json::to_string(&envelope) {
                let _ = ws_tx.send(WsMessage::Text(json.into())).await;
            }
            let _ = ws_tx.send(WsMessage::Close(None)).await;
            return;
        }
    };
    let session_id = session.id().clone();
    let connection = registry.register(session_id.clone());
    info!(session_id = %session_id, "realtime client connected");

    let writer_connection = Arc::clone(&connection);
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(config.heartbeat_interval);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    let kind = event.kind();
                    let json = match serde_json::to_string(&ServerEnvelope::new(event)) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(kind, error = %e, "failed to serialize server event");
                            continue;
                        }
                    };
                    if ws_tx.send(WsMessage::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if !writer_connection.is_alive() {
                        warn!(session_id = %writer_connection.session_id, "client stopped answering pings");
                        break;
                    }
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    trace!(session_id = %writer_connection.session_id, "sent ping");
                }
            }
        }
        writer_connection.connected.store(false, Ordering::Relaxed);
    });

    tokio::select! {
        _ = &mut writer => {}
        _ = read_events(ws_rx, &mut session, &connection, &events_tx) => {}
    }

    session.close().await;
    writer.abort();
    registry.unregister(&session_id);
    info!(session_id = %session_id, "realtime client disconnected");
}

async fn read_events(
    mut ws_rx: SplitStream<WebSocket>,
    session: &mut Session,
    connection: &Connection,
    events: &mpsc::Sender<ServerEvent>,
) {
    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            WsMessage::Text(text) => match serde_json::from_str::<ClientEvent>(text.as_str()) {
                Ok(event) => session.handle(event).await,
                Err(e) => {
                    debug!(session_id = %connection.session_id, error = %e, "unparseable client event");
                    let error = ErrorDetails::invalid_request(format!("invalid client event: {e}"));
                    if events.send(ServerEvent::error(error)).await.is_err() {
                        break;
                    }
                }
            },
            WsMessage::Pong(_) => connection.record_pong(),
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
}
